use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::level::LockLevel;
use crate::strategy::{LockOrderStrategy, NoopLockOrder, ThreadLocalLockOrder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationPolicy {
    /// Surface the programmer error immediately.
    Panic,
    /// Log and count, then proceed with the acquisition.
    LogOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone)]
struct HoldRecord {
    lock_name: &'static str,
    level: LockLevel,
    mode: HoldMode,
    thread: String,
    acquired_at: Instant,
}

/// Plain snapshot of one live lock hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldInfo {
    pub hold_id: u64,
    pub lock_name: String,
    pub level: LockLevel,
    pub mode: HoldMode,
    pub thread: String,
    pub held_ms: u64,
}

struct RegistryInner {
    strategy: Box<dyn LockOrderStrategy>,
    policy: ViolationPolicy,
    holds: DashMap<u64, HoldRecord>,
    next_hold: AtomicU64,
    violations: AtomicU64,
}

/// Shared handle every ordered lock reports to. Cheap to clone.
#[derive(Clone)]
pub struct LockOrderRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for LockOrderRegistry {
    fn default() -> Self {
        Self::for_build()
    }
}

impl std::fmt::Debug for LockOrderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockOrderRegistry")
            .field("policy", &self.inner.policy)
            .field("holds", &self.inner.holds.len())
            .field("violations", &self.violations())
            .finish()
    }
}

impl LockOrderRegistry {
    pub fn new(strategy: Box<dyn LockOrderStrategy>, policy: ViolationPolicy) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                strategy,
                policy,
                holds: DashMap::new(),
                next_hold: AtomicU64::new(1),
                violations: AtomicU64::new(0),
            }),
        }
    }

    /// Thread-local validation that panics in debug builds; no-op validation in release.
    /// Hold tracking for the watchdog stays on in both.
    pub fn for_build() -> Self {
        if cfg!(debug_assertions) {
            Self::new(Box::new(ThreadLocalLockOrder), ViolationPolicy::Panic)
        } else {
            Self::new(Box::new(NoopLockOrder), ViolationPolicy::LogOnly)
        }
    }

    pub fn policy(&self) -> ViolationPolicy {
        self.inner.policy
    }

    pub fn violations(&self) -> u64 {
        self.inner.violations.load(Ordering::Relaxed)
    }

    pub(crate) fn before_acquire(&self, level: LockLevel, name: &'static str) {
        let Err(violation) = self.inner.strategy.validate(level, name) else {
            return;
        };
        self.inner.violations.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("lock.order_violation").increment(1);
        match self.inner.policy {
            ViolationPolicy::Panic => panic!("lock order violation: {violation}"),
            ViolationPolicy::LogOnly => {
                tracing::error!(
                    held = violation.held_name,
                    requested = violation.requested_name,
                    "lock order violation; continuing with deadlock risk"
                );
            }
        }
    }

    pub(crate) fn acquired(
        &self,
        level: LockLevel,
        name: &'static str,
        mode: HoldMode,
    ) -> HoldTicket {
        self.inner.strategy.push(level, name);
        let id = self.inner.next_hold.fetch_add(1, Ordering::Relaxed);
        let thread = std::thread::current();
        let thread = thread
            .name()
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("{:?}", thread.id()));
        self.inner.holds.insert(
            id,
            HoldRecord {
                lock_name: name,
                level,
                mode,
                thread,
                acquired_at: Instant::now(),
            },
        );
        metrics::gauge!("lock.held").set(self.inner.holds.len() as f64);
        HoldTicket {
            registry: self.clone(),
            id,
            level,
            name,
        }
    }

    fn released(&self, id: u64, level: LockLevel, name: &'static str) {
        self.inner.holds.remove(&id);
        self.inner.strategy.pop(level, name);
        metrics::gauge!("lock.held").set(self.inner.holds.len() as f64);
    }

    pub fn holds(&self) -> Vec<HoldInfo> {
        self.holds_older_than(Duration::ZERO)
    }

    pub fn holds_older_than(&self, threshold: Duration) -> Vec<HoldInfo> {
        let mut out = self
            .inner
            .holds
            .iter()
            .filter_map(|entry| {
                let held = entry.acquired_at.elapsed();
                (held >= threshold).then(|| HoldInfo {
                    hold_id: *entry.key(),
                    lock_name: entry.lock_name.to_string(),
                    level: entry.level,
                    mode: entry.mode,
                    thread: entry.thread.clone(),
                    held_ms: held.as_millis() as u64,
                })
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| b.held_ms.cmp(&a.held_ms));
        out
    }

    pub fn held_by_current_thread(&self) -> Vec<(LockLevel, &'static str)> {
        self.inner.strategy.held()
    }
}

/// Releases the hold record and order-stack entry when dropped alongside the lock guard.
pub(crate) struct HoldTicket {
    registry: LockOrderRegistry,
    id: u64,
    level: LockLevel,
    name: &'static str,
}

impl Drop for HoldTicket {
    fn drop(&mut self) {
        self.registry.released(self.id, self.level, self.name);
    }
}
