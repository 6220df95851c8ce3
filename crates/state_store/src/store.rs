use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use core_types::{CoreError, GameStateSnapshot, StateVersion};
use lock_order::LockOrderRegistry;
use serde::Serialize;

use crate::versioned::VersionedState;

/// A snapshot together with the store version it was read at.
#[derive(Debug, Clone)]
pub struct StateView {
    pub snapshot: Arc<GameStateSnapshot>,
    pub version: StateVersion,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoreStats {
    pub version: StateVersion,
    pub tick: Option<u64>,
    pub published: u64,
    pub stale_rejected: u64,
    pub cas_retries: u64,
}

/// Latest game-state snapshot. Ticks only move forward whatever the delivery order.
pub struct GameStateStore {
    state: VersionedState<Option<Arc<GameStateSnapshot>>>,
    published: AtomicU64,
    stale_rejected: AtomicU64,
    cas_retries: AtomicU64,
}

impl GameStateStore {
    pub fn new(registry: &LockOrderRegistry) -> Self {
        Self {
            state: VersionedState::new("state.snapshot", registry, None),
            published: AtomicU64::new(0),
            stale_rejected: AtomicU64::new(0),
            cas_retries: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, snapshot: GameStateSnapshot) -> Result<StateVersion, CoreError> {
        let incoming = snapshot.tick;
        let next = Arc::new(snapshot);
        let res = self.state.update(|current| match current {
            Some(cur) if incoming <= cur.tick => Err(CoreError::StaleUpdate {
                incoming,
                current: cur.tick,
            }),
            _ => Ok(Some(next.clone())),
        });

        match res {
            Ok((version, retries)) => {
                if retries > 0 {
                    self.cas_retries
                        .fetch_add(u64::from(retries), Ordering::Relaxed);
                    metrics::counter!("state.cas_retry").increment(u64::from(retries));
                }
                self.published.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("state.publish_ok").increment(1);
                Ok(version)
            }
            Err(err) => {
                self.stale_rejected.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("state.publish_stale").increment(1);
                tracing::debug!(%err, "dropping stale snapshot");
                Err(err)
            }
        }
    }

    /// One atomic read of snapshot and version. `None` until the first publish.
    pub fn read_consistent(&self) -> Option<StateView> {
        let (snapshot, version) = self.state.read();
        snapshot.map(|snapshot| StateView { snapshot, version })
    }

    pub fn version(&self) -> StateVersion {
        self.state.version()
    }

    pub fn stats(&self) -> StoreStats {
        let (snapshot, version) = self.state.read();
        StoreStats {
            version,
            tick: snapshot.map(|s| s.tick),
            published: self.published.load(Ordering::Relaxed),
            stale_rejected: self.stale_rejected.load(Ordering::Relaxed),
            cas_retries: self.cas_retries.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use core_types::CharacterStats;
    use proptest::prelude::*;

    use super::*;

    fn snap(tick: u64) -> GameStateSnapshot {
        GameStateSnapshot {
            stats: CharacterStats {
                name: "acolyte".to_string(),
                level: 10,
                hp: 100,
                max_hp: 100,
                sp: 50,
                max_sp: 50,
                ..CharacterStats::default()
            },
            entities: Vec::new(),
            map_id: "prontera".to_string(),
            timestamp_ms: tick as i64 * 33,
            tick,
        }
    }

    fn store() -> GameStateStore {
        GameStateStore::new(&LockOrderRegistry::for_build())
    }

    #[test]
    fn empty_store_has_no_view() {
        let s = store();
        assert!(s.read_consistent().is_none());
        assert_eq!(s.version(), StateVersion::ZERO);
    }

    #[test]
    fn out_of_order_publish_never_regresses() {
        let s = store();
        let v5 = s.publish(snap(5)).expect("tick 5");
        let err = s.publish(snap(3)).expect_err("tick 3 is stale");
        assert_eq!(
            err,
            CoreError::StaleUpdate {
                incoming: 3,
                current: 5
            }
        );
        let view = s.read_consistent().expect("view");
        assert_eq!(view.snapshot.tick, 5);
        assert_eq!(view.version, v5);
        assert_eq!(s.stats().stale_rejected, 1);
    }

    #[test]
    fn duplicate_tick_is_stale() {
        let s = store();
        s.publish(snap(9)).expect("first");
        assert!(s.publish(snap(9)).is_err());
        assert_eq!(s.stats().published, 1);
    }

    #[test]
    fn readers_keep_their_snapshot_across_publishes() {
        let s = store();
        s.publish(snap(1)).expect("publish");
        let held = s.read_consistent().expect("view");
        s.publish(snap(2)).expect("publish");
        assert_eq!(held.snapshot.tick, 1);
        assert_eq!(s.read_consistent().expect("view").snapshot.tick, 2);
    }

    #[test]
    fn concurrent_producers_converge_on_highest_tick() {
        let s = Arc::new(store());
        let producers = (0..4u64)
            .map(|p| {
                let s = s.clone();
                std::thread::spawn(move || {
                    for i in 0..250u64 {
                        let _ = s.publish(snap(i * 4 + p));
                    }
                })
            })
            .collect::<Vec<_>>();
        for p in producers {
            p.join().expect("join");
        }
        let view = s.read_consistent().expect("view");
        assert_eq!(view.snapshot.tick, 999);
        let stats = s.stats();
        assert_eq!(stats.version.0, stats.published);
    }

    proptest! {
        #[test]
        fn increasing_ticks_track_latest_and_bump_version(
            steps in proptest::collection::vec(1u64..50, 1..40)
        ) {
            let s = store();
            let mut tick = 0u64;
            let mut last_version = StateVersion::ZERO;
            for step in steps {
                tick += step;
                let v = s.publish(snap(tick)).expect("increasing tick accepted");
                prop_assert!(v > last_version);
                last_version = v;
                let view = s.read_consistent().expect("view");
                prop_assert_eq!(view.snapshot.tick, tick);
                prop_assert_eq!(view.version, v);
            }
        }

        #[test]
        fn arbitrary_order_keeps_maximum(ticks in proptest::collection::vec(0u64..1_000, 1..60)) {
            let s = store();
            for t in &ticks {
                let _ = s.publish(snap(*t));
            }
            let max = ticks.iter().copied().max().unwrap_or_default();
            prop_assert_eq!(s.read_consistent().expect("view").snapshot.tick, max);
        }
    }
}
