use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use agent_core::AgentCore;
use anyhow::Result;
use lock_order::{LockLevel, LockOrderRegistry, OrderedMutex};
use macro_registry::MacroRunner;
use metrics_exporter_prometheus::PrometheusHandle;

#[derive(Clone)]
pub(crate) struct AppState {
    pub core: Arc<AgentCore>,
    pub outbox: Arc<CommandOutbox>,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

/// Commands emitted by macro runs, waiting for the game bridge to collect them.
///
/// Bounded: when full the oldest command is dropped.
pub(crate) struct CommandOutbox {
    queue: OrderedMutex<VecDeque<String>>,
    capacity: usize,
}

impl CommandOutbox {
    pub fn new(capacity: usize, locks: &LockOrderRegistry) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: OrderedMutex::new(
                LockLevel::Network,
                "runner.outbox",
                locks,
                VecDeque::with_capacity(capacity),
            ),
            capacity,
        }
    }

    pub fn push(&self, command: &str) {
        let mut queue = self.queue.lock();
        if queue.len() == self.capacity {
            queue.pop_front();
            metrics::counter!("runner.outbox_dropped").increment(1);
        }
        queue.push_back(command.to_string());
    }

    pub fn drain(&self) -> Vec<String> {
        self.queue.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

impl MacroRunner for CommandOutbox {
    fn run_command(&self, command: &str) -> Result<()> {
        self.push(command);
        Ok(())
    }
}
