use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::registry::{HoldInfo, LockOrderRegistry};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchdogConfig {
    pub stuck_threshold_ms: u64,
    pub sample_interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            stuck_threshold_ms: 10_000,
            sample_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckLock {
    pub hold: HoldInfo,
    /// First time this hold crossed the threshold. Later samples of the same hold are not re-reported.
    pub first_report: bool,
}

/// Samples live lock holds and flags the ones held past the threshold.
///
/// Reporting only: the watchdog never releases or poisons a lock.
pub struct DeadlockWatchdog {
    registry: LockOrderRegistry,
    cfg: WatchdogConfig,
    reported: DashMap<u64, ()>,
}

impl DeadlockWatchdog {
    pub fn new(registry: LockOrderRegistry, cfg: WatchdogConfig) -> Self {
        Self {
            registry,
            cfg,
            reported: DashMap::new(),
        }
    }

    pub fn cfg(&self) -> &WatchdogConfig {
        &self.cfg
    }

    pub fn scan(&self) -> Vec<StuckLock> {
        let threshold = Duration::from_millis(self.cfg.stuck_threshold_ms);
        let stuck = self.registry.holds_older_than(threshold);
        // Forget holds that have since been released.
        self.reported
            .retain(|id, _| stuck.iter().any(|h| h.hold_id == *id));

        stuck
            .into_iter()
            .map(|hold| {
                let first_report = self.reported.insert(hold.hold_id, ()).is_none();
                if first_report {
                    metrics::counter!("lock.stuck_hold").increment(1);
                    tracing::warn!(
                        lock = %hold.lock_name,
                        level = %hold.level,
                        thread = %hold.thread,
                        held_ms = hold.held_ms,
                        "lock held past threshold; probable deadlock"
                    );
                }
                StuckLock { hold, first_report }
            })
            .collect()
    }

    /// Runs `scan` on a fixed interval. `on_stuck` sees each stuck hold once.
    pub fn spawn<F>(self: Arc<Self>, on_stuck: F) -> JoinHandle<()>
    where
        F: Fn(&StuckLock) + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let period = Duration::from_millis(self.cfg.sample_interval_ms.max(10));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                for stuck in self.scan().iter().filter(|s| s.first_report) {
                    on_stuck(stuck);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::LockLevel;
    use crate::ordered::OrderedMutex;
    use crate::registry::ViolationPolicy;
    use crate::strategy::NoopLockOrder;

    #[test]
    fn flags_long_hold_once() {
        let reg = LockOrderRegistry::new(Box::new(NoopLockOrder), ViolationPolicy::LogOnly);
        let lock = OrderedMutex::new(LockLevel::Database, "db.conn", &reg, ());
        let dog = DeadlockWatchdog::new(
            reg.clone(),
            WatchdogConfig {
                stuck_threshold_ms: 20,
                sample_interval_ms: 5,
            },
        );

        let guard = lock.lock();
        assert!(dog.scan().is_empty());
        std::thread::sleep(Duration::from_millis(40));

        let first = dog.scan();
        assert_eq!(first.len(), 1);
        assert!(first[0].first_report);
        assert_eq!(first[0].hold.lock_name, "db.conn");

        let second = dog.scan();
        assert_eq!(second.len(), 1);
        assert!(!second[0].first_report);

        drop(guard);
        assert!(dog.scan().is_empty());
        // The lock is untouched by reporting and can be taken again.
        assert!(lock.try_lock_for(Duration::from_millis(10)).is_some());
    }

    #[tokio::test]
    async fn spawned_watchdog_invokes_callback() {
        let reg = LockOrderRegistry::new(Box::new(NoopLockOrder), ViolationPolicy::LogOnly);
        let lock = Arc::new(OrderedMutex::new(LockLevel::Network, "net.sock", &reg, ()));
        let dog = Arc::new(DeadlockWatchdog::new(
            reg,
            WatchdogConfig {
                stuck_threshold_ms: 10,
                sample_interval_ms: 10,
            },
        ));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = dog.spawn(move |stuck| {
            let _ = tx.send(stuck.hold.lock_name.clone());
        });

        let held = lock.clone();
        let holder = std::thread::spawn(move || {
            let _g = held.lock();
            std::thread::sleep(Duration::from_millis(80));
        });

        let name = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("watchdog fired")
            .expect("name");
        assert_eq!(name, "net.sock");
        handle.abort();
        holder.join().expect("join");
    }
}
