use std::sync::Arc;
use std::time::Duration;

use agent_core::AgentCore;
use core_types::CoreEvent;
use infra_bus::EventBus;
use lock_order::{DeadlockWatchdog, LockOrderRegistry, WatchdogConfig};
use macro_registry::MacroDirWatcher;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::spawn_detached;

pub(crate) fn spawn_cycle_timer(core: Arc<AgentCore>, interval_sec: u64) -> JoinHandle<()> {
    spawn_detached("cycle_timer", false, async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_sec.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup is not a cycle.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if core.on_cycle_trigger("timer").is_err() {
                tracing::debug!("cycle timer fired while a cycle was running; coalesced");
            }
        }
    })
}

pub(crate) fn spawn_watchdog(
    locks: LockOrderRegistry,
    cfg: WatchdogConfig,
    events: EventBus<CoreEvent>,
) -> JoinHandle<()> {
    Arc::new(DeadlockWatchdog::new(locks, cfg)).spawn(move |stuck| {
        let _ = events.publish(CoreEvent::StuckLock {
            lock_name: stuck.hold.lock_name.clone(),
            held_ms: stuck.hold.held_ms,
        });
    })
}

pub(crate) fn spawn_macro_watcher(
    watcher: Arc<MacroDirWatcher>,
    poll_interval_ms: u64,
    events: EventBus<CoreEvent>,
) -> JoinHandle<()> {
    tracing::info!(dir = %watcher.dir().display(), poll_interval_ms, "watching macro directory");
    watcher.spawn(Duration::from_millis(poll_interval_ms), move |outcome| {
        let event = match &outcome.result {
            Ok(version) => CoreEvent::MacroReloaded {
                name: outcome.name.clone(),
                version: *version,
            },
            Err(err) => CoreEvent::MacroReloadFailed {
                name: outcome.name.clone(),
                reason: err.to_string(),
            },
        };
        let _ = events.publish(event);
    })
}

/// Logs every core event. Decisions go to debug; everything else is an operator-visible change.
pub(crate) fn spawn_event_audit(events: &EventBus<CoreEvent>) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    spawn_detached("event_audit", false, async move {
        loop {
            match rx.recv().await {
                Ok(event) => audit(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event audit lagged behind the bus");
                }
                Err(RecvError::Closed) => return,
            }
        }
    })
}

fn audit(event: &CoreEvent) {
    match event {
        CoreEvent::Decided(d) => tracing::debug!(
            cycle_id = d.cycle_id,
            tier = ?d.tier,
            action = %d.action.kind,
            confidence = d.confidence,
            latency_ms = d.latency_ms,
            "decided"
        ),
        CoreEvent::StateStale {
            incoming_tick,
            current_tick,
        } => tracing::debug!(incoming_tick, current_tick, "stale snapshot rejected"),
        CoreEvent::ModelStaged { model_name } => tracing::info!(%model_name, "model staged"),
        CoreEvent::ModelPromoted { version } => tracing::info!(version, "model promoted"),
        CoreEvent::ModelPromotionFailed { reason } => {
            tracing::warn!(%reason, "model promotion failed")
        }
        CoreEvent::MacroReloaded { name, version } => {
            tracing::info!(%name, version, "macro reloaded")
        }
        CoreEvent::MacroReloadFailed { name, reason } => {
            tracing::warn!(%name, %reason, "macro reload failed")
        }
        CoreEvent::CycleFinished { cycle_count, ok } => {
            tracing::info!(cycle_count, ok, "improvement cycle finished")
        }
        CoreEvent::StuckLock { lock_name, held_ms } => {
            tracing::error!(%lock_name, held_ms, "stuck lock reported")
        }
    }
}
