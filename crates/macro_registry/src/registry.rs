use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use core_types::{CoreError, MacroInfo, MacroVersion};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lock_order::{LockLevel, LockOrderRegistry, OrderedRwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::syntax::{parse, MacroProgram, MacroStep, MacroSyntaxError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MacroRegistryConfig {
    pub reload_timeout_ms: u64,
    /// Length of one exclusive-lock attempt during reload.
    pub reload_slice_ms: u64,
    /// Pause between attempts so queued executions can get in.
    pub reload_backoff_ms: u64,
}

impl Default for MacroRegistryConfig {
    fn default() -> Self {
        Self {
            reload_timeout_ms: 30_000,
            reload_slice_ms: 5,
            reload_backoff_ms: 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error(transparent)]
    Syntax(#[from] MacroSyntaxError),
    #[error("macro `{name}` reload timed out after {waited_ms}ms ({active} executions running)")]
    TimedOut {
        name: String,
        waited_ms: u64,
        active: usize,
    },
}

impl From<ReloadError> for CoreError {
    fn from(err: ReloadError) -> Self {
        match err {
            ReloadError::Syntax(e) => e.into(),
            ReloadError::TimedOut {
                name, waited_ms, ..
            } => CoreError::ReloadTimedOut { name, waited_ms },
        }
    }
}

/// Side effects of macro steps. Implemented by the game-client bridge.
pub trait MacroRunner: Send + Sync {
    fn run_command(&self, command: &str) -> anyhow::Result<()>;

    fn pause(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn log(&self, macro_name: &str, text: &str) {
        tracing::info!(macro_name, text, "macro log");
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MacroRun {
    pub name: String,
    pub version: MacroVersion,
    pub steps: usize,
    pub commands: usize,
    pub elapsed_ms: u64,
}

struct MacroBody {
    text: String,
    program: MacroProgram,
    version: MacroVersion,
}

struct MacroEntry {
    body: OrderedRwLock<MacroBody>,
    version: AtomicU64,
    active: AtomicUsize,
}

impl MacroEntry {
    fn new(registry: &LockOrderRegistry, text: String, program: MacroProgram) -> Self {
        Self {
            body: OrderedRwLock::new(
                LockLevel::Macro,
                "macro.entry",
                registry,
                MacroBody {
                    text,
                    program,
                    version: 1,
                },
            ),
            version: AtomicU64::new(1),
            active: AtomicUsize::new(0),
        }
    }
}

struct ExecutionGuard<'a>(&'a AtomicUsize);

impl<'a> ExecutionGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct MacroRegistry {
    cfg: MacroRegistryConfig,
    locks: LockOrderRegistry,
    entries: DashMap<String, Arc<MacroEntry>>,
}

impl MacroRegistry {
    pub fn new(cfg: MacroRegistryConfig, registry: &LockOrderRegistry) -> Self {
        Self {
            cfg,
            locks: registry.clone(),
            entries: DashMap::new(),
        }
    }

    pub fn cfg(&self) -> &MacroRegistryConfig {
        &self.cfg
    }

    fn entry(&self, name: &str) -> Option<Arc<MacroEntry>> {
        // Clone out of the map so no shard lock is held while the body lock is taken.
        self.entries.get(name).map(|e| e.value().clone())
    }

    /// Runs every step of `name` against `runner`. The body cannot change until the run ends.
    pub fn execute(&self, name: &str, runner: &dyn MacroRunner) -> Result<MacroRun, CoreError> {
        let entry = self
            .entry(name)
            .ok_or_else(|| CoreError::UnknownMacro(name.to_string()))?;
        let body = entry.body.read();
        let _running = ExecutionGuard::enter(&entry.active);
        metrics::counter!("macro.execute").increment(1);

        let started = Instant::now();
        let mut steps = 0usize;
        let mut commands = 0usize;
        for step in body.program.steps() {
            match step {
                MacroStep::Do(cmd) => {
                    runner.run_command(cmd).map_err(|err| CoreError::MacroFailed {
                        name: name.to_string(),
                        reason: format!("`{cmd}`: {err:#}"),
                    })?;
                    commands += 1;
                }
                MacroStep::Pause(d) => runner.pause(*d),
                MacroStep::Log(text) => runner.log(name, text),
            }
            steps += 1;
        }
        Ok(MacroRun {
            name: name.to_string(),
            version: body.version,
            steps,
            commands,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Replaces the body of `name`, waiting for running executions up to the configured timeout.
    pub fn reload(&self, name: &str, text: &str) -> Result<MacroVersion, ReloadError> {
        self.reload_within(name, text, Duration::from_millis(self.cfg.reload_timeout_ms))
    }

    pub fn reload_within(
        &self,
        name: &str,
        text: &str,
        timeout: Duration,
    ) -> Result<MacroVersion, ReloadError> {
        let program = parse(text).map_err(|err| {
            metrics::counter!("macro.reload_invalid").increment(1);
            tracing::warn!(macro_name = name, error = %err, "macro rejected");
            err
        })?;

        let entry = match self.entries.entry(name.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(MacroEntry::new(
                    &self.locks,
                    text.to_string(),
                    program,
                )));
                metrics::counter!("macro.reload_ok").increment(1);
                tracing::info!(macro_name = name, version = 1, "macro registered");
                return Ok(1);
            }
            Entry::Occupied(existing) => existing.get().clone(),
        };

        let started = Instant::now();
        let deadline = started + timeout;
        let slice = Duration::from_millis(self.cfg.reload_slice_ms.max(1));
        let backoff = Duration::from_millis(self.cfg.reload_backoff_ms);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let wait = slice.min(deadline.saturating_duration_since(Instant::now()));
            if let Some(mut body) = entry.body.try_write_for(wait) {
                let version = body.version + 1;
                *body = MacroBody {
                    text: text.to_string(),
                    program,
                    version,
                };
                entry.version.store(version, Ordering::Release);
                drop(body);
                metrics::counter!("macro.reload_ok").increment(1);
                tracing::info!(macro_name = name, version, attempts, "macro reloaded");
                return Ok(version);
            }
            if Instant::now() >= deadline {
                let active = entry.active.load(Ordering::Acquire);
                metrics::counter!("macro.reload_timeout").increment(1);
                tracing::warn!(macro_name = name, active, attempts, "macro reload timed out");
                return Err(ReloadError::TimedOut {
                    name: name.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                    active,
                });
            }
            if backoff.is_zero() {
                std::thread::yield_now();
            } else {
                std::thread::sleep(backoff);
            }
        }
    }

    /// Running executions keep their body until they finish.
    pub fn remove(&self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = self
            .entries
            .iter()
            .map(|e| e.key().clone())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lock-free view; never waits behind a reload.
    pub fn info(&self, name: &str) -> Option<MacroInfo> {
        let entry = self.entry(name)?;
        Some(MacroInfo {
            name: name.to_string(),
            version: entry.version.load(Ordering::Acquire),
            active_executions: entry.active.load(Ordering::Acquire),
        })
    }

    /// Current source text, waiting at most `timeout` behind a reload.
    pub fn source_within(&self, name: &str, timeout: Duration) -> Option<String> {
        let entry = self.entry(name)?;
        let body = entry.body.try_read_for(timeout)?;
        Some(body.text.clone())
    }
}
