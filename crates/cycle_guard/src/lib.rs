//! Single-flight improvement cycle.
//!
//! At most one Plan → Do → Check → Act pass runs at a time; triggers that
//! arrive while one is running are dropped, not queued.

mod flag;

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use core_types::{utc_now, CoreEvent, CycleId, CyclePhase, CycleStatus, DateTime, Utc};
use futures::FutureExt;
use infra_bus::EventBus;
use lock_order::{LockLevel, LockOrderRegistry, OrderedMutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use flag::{ArbitrationFlag, InMemoryFlag};

/// Scratch space handed from phase to phase within one cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleContext {
    pub cycle_id: CycleId,
    pub reason: String,
    pub notes: BTreeMap<String, String>,
}

impl CycleContext {
    pub fn note(&mut self, key: &str, value: impl Into<String>) {
        self.notes.insert(key.to_string(), value.into());
    }
}

#[async_trait]
pub trait ImprovementCycle: Send + Sync {
    async fn plan(&self, ctx: &mut CycleContext) -> Result<()>;
    /// The "Do" phase.
    async fn execute(&self, ctx: &mut CycleContext) -> Result<()>;
    async fn check(&self, ctx: &mut CycleContext) -> Result<()>;
    async fn act(&self, ctx: &mut CycleContext) -> Result<()>;
}

struct Shared {
    phase: AtomicU8,
    cycle_count: AtomicU64,
    failed_count: AtomicU64,
    coalesced_count: AtomicU64,
    last_reason: OrderedMutex<Option<String>>,
    last_finished: OrderedMutex<Option<DateTime<Utc>>>,
    events: Option<EventBus<CoreEvent>>,
}

impl Shared {
    fn set_phase(&self, phase: CyclePhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

/// Held for exactly one cycle. Dropping it returns the machine to idle and frees the flag,
/// whether the cycle finished, failed, or panicked.
struct CycleToken {
    flag: Arc<dyn ArbitrationFlag>,
    shared: Arc<Shared>,
}

impl Drop for CycleToken {
    fn drop(&mut self) {
        self.shared.set_phase(CyclePhase::Idle);
        self.flag.release();
    }
}

struct CycleJob {
    ctx: CycleContext,
    token: CycleToken,
}

pub struct CycleGuard {
    flag: Arc<dyn ArbitrationFlag>,
    shared: Arc<Shared>,
    tx: mpsc::Sender<CycleJob>,
}

impl CycleGuard {
    /// Starts the dedicated worker task that runs every cycle.
    pub fn spawn(
        cycle: Arc<dyn ImprovementCycle>,
        flag: Arc<dyn ArbitrationFlag>,
        registry: &LockOrderRegistry,
        events: Option<EventBus<CoreEvent>>,
    ) -> (Self, JoinHandle<()>) {
        let shared = Arc::new(Shared {
            phase: AtomicU8::new(CyclePhase::Idle as u8),
            cycle_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
            coalesced_count: AtomicU64::new(0),
            last_reason: OrderedMutex::new(LockLevel::Metrics, "cycle.last_reason", registry, None),
            last_finished: OrderedMutex::new(
                LockLevel::Metrics,
                "cycle.last_finished",
                registry,
                None,
            ),
            events,
        });
        // The flag admits one job at a time, so one slot is enough.
        let (tx, mut rx) = mpsc::channel::<CycleJob>(1);
        let worker_shared = shared.clone();
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                run_job(cycle.as_ref(), &worker_shared, job).await;
            }
            tracing::debug!("cycle worker stopped");
        });
        (Self { flag, shared, tx }, worker)
    }

    /// Non-blocking. Returns false when a cycle is already running; the trigger is dropped.
    pub fn try_start(&self, reason: &str) -> bool {
        if !self.flag.try_acquire() {
            self.shared.coalesced_count.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("cycle.coalesced").increment(1);
            tracing::debug!(reason, "cycle already running; trigger coalesced");
            return false;
        }
        let token = CycleToken {
            flag: self.flag.clone(),
            shared: self.shared.clone(),
        };
        let cycle_id = self.shared.cycle_count.fetch_add(1, Ordering::AcqRel) + 1;
        *self.shared.last_reason.lock() = Some(reason.to_string());
        self.shared.set_phase(CyclePhase::Plan);

        let job = CycleJob {
            ctx: CycleContext {
                cycle_id,
                reason: reason.to_string(),
                notes: BTreeMap::new(),
            },
            token,
        };
        if let Err(err) = self.tx.try_send(job) {
            // Dropping the returned job releases the token.
            tracing::error!(reason, error = %err, "cycle worker unavailable");
            self.shared.failed_count.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        metrics::counter!("cycle.started").increment(1);
        tracing::info!(cycle_id, reason, "improvement cycle started");
        true
    }

    pub fn current_phase(&self) -> CyclePhase {
        CyclePhase::from_u8(self.shared.phase.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.flag.is_held()
    }

    pub fn status(&self) -> CycleStatus {
        // Same lock level: take them one after the other, never together.
        let last_reason = self.shared.last_reason.lock().clone();
        let last_finished_at = *self.shared.last_finished.lock();
        CycleStatus {
            running: self.is_running(),
            phase: self.current_phase(),
            cycle_count: self.shared.cycle_count.load(Ordering::Acquire),
            failed_count: self.shared.failed_count.load(Ordering::Relaxed),
            coalesced_count: self.shared.coalesced_count.load(Ordering::Relaxed),
            last_reason,
            last_finished_at,
        }
    }

    /// Waits until no cycle is running. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_running() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }
}

async fn run_job(cycle: &dyn ImprovementCycle, shared: &Shared, job: CycleJob) {
    let CycleJob { mut ctx, token } = job;
    let started = Instant::now();
    let cycle_id = ctx.cycle_id;

    let outcome = AssertUnwindSafe(run_phases(cycle, shared, &mut ctx))
        .catch_unwind()
        .await;
    let ok = match outcome {
        Ok(Ok(())) => {
            tracing::info!(
                cycle_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "improvement cycle finished"
            );
            true
        }
        Ok(Err(err)) => {
            tracing::warn!(cycle_id, error = ?err, "improvement cycle failed");
            false
        }
        Err(_) => {
            tracing::error!(cycle_id, "improvement cycle panicked");
            false
        }
    };
    if !ok {
        shared.failed_count.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("cycle.failed").increment(1);
    }
    *shared.last_finished.lock() = Some(utc_now());
    drop(token);

    if let Some(events) = &shared.events {
        let _ = events.publish(CoreEvent::CycleFinished {
            cycle_count: shared.cycle_count.load(Ordering::Acquire),
            ok,
        });
    }
}

async fn run_phases(
    cycle: &dyn ImprovementCycle,
    shared: &Shared,
    ctx: &mut CycleContext,
) -> Result<()> {
    shared.set_phase(CyclePhase::Plan);
    cycle.plan(ctx).await?;
    shared.set_phase(CyclePhase::Do);
    cycle.execute(ctx).await?;
    shared.set_phase(CyclePhase::Check);
    cycle.check(ctx).await?;
    shared.set_phase(CyclePhase::Act);
    cycle.act(ctx).await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    use anyhow::bail;

    use super::*;

    #[derive(Default)]
    struct ScriptedCycle {
        plan_delay_ms: u64,
        fail_checks: AtomicUsize,
        panic_plans: AtomicUsize,
        acts: AtomicUsize,
    }

    #[async_trait]
    impl ImprovementCycle for ScriptedCycle {
        async fn plan(&self, ctx: &mut CycleContext) -> Result<()> {
            if self
                .panic_plans
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                panic!("planner blew up");
            }
            tokio::time::sleep(Duration::from_millis(self.plan_delay_ms)).await;
            ctx.note("plan", "noop");
            Ok(())
        }

        async fn execute(&self, _ctx: &mut CycleContext) -> Result<()> {
            Ok(())
        }

        async fn check(&self, _ctx: &mut CycleContext) -> Result<()> {
            if self
                .fail_checks
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                bail!("regression detected");
            }
            Ok(())
        }

        async fn act(&self, ctx: &mut CycleContext) -> Result<()> {
            assert_eq!(ctx.notes.get("plan").map(String::as_str), Some("noop"));
            self.acts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn guard(cycle: Arc<ScriptedCycle>) -> CycleGuard {
        let (guard, _worker) = CycleGuard::spawn(
            cycle,
            Arc::new(InMemoryFlag::default()),
            &LockOrderRegistry::for_build(),
            None,
        );
        guard
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_triggers_admit_exactly_one() {
        let cycle = Arc::new(ScriptedCycle {
            plan_delay_ms: 100,
            ..ScriptedCycle::default()
        });
        let g = Arc::new(guard(cycle.clone()));
        let barrier = Arc::new(Barrier::new(2));
        let starts = (0..2)
            .map(|i| {
                let g = g.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    g.try_start(&format!("trigger-{i}"))
                })
            })
            .collect::<Vec<_>>();
        let admitted = starts
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
        assert!(g.is_running());
        assert_ne!(g.current_phase(), CyclePhase::Idle);

        assert!(g.wait_idle(Duration::from_secs(2)).await);
        let status = g.status();
        assert_eq!(status.cycle_count, 1);
        assert_eq!(status.coalesced_count, 1);
        assert_eq!(status.phase, CyclePhase::Idle);
        assert!(status.last_finished_at.is_some());
        assert_eq!(cycle.acts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_cycle_releases_the_flag() {
        let cycle = Arc::new(ScriptedCycle {
            fail_checks: AtomicUsize::new(1),
            ..ScriptedCycle::default()
        });
        let g = guard(cycle.clone());
        assert!(g.try_start("first"));
        assert!(g.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(g.status().failed_count, 1);
        assert_eq!(cycle.acts.load(Ordering::SeqCst), 0);

        assert!(g.try_start("second"));
        assert!(g.wait_idle(Duration::from_secs(2)).await);
        let status = g.status();
        assert_eq!(status.failed_count, 1);
        assert_eq!(status.last_reason.as_deref(), Some("second"));
        assert_eq!(cycle.acts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_phase_releases_the_flag() {
        let cycle = Arc::new(ScriptedCycle {
            panic_plans: AtomicUsize::new(1),
            ..ScriptedCycle::default()
        });
        let g = guard(cycle.clone());
        assert!(g.try_start("boom"));
        assert!(g.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(g.status().failed_count, 1);
        assert_eq!(g.current_phase(), CyclePhase::Idle);

        assert!(g.try_start("again"));
        assert!(g.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(cycle.acts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finished_cycles_are_announced() {
        let bus = EventBus::new("core", 16);
        let mut rx = bus.subscribe();
        let (g, _worker) = CycleGuard::spawn(
            Arc::new(ScriptedCycle::default()),
            Arc::new(InMemoryFlag::default()),
            &LockOrderRegistry::for_build(),
            Some(bus),
        );
        assert!(g.try_start("timer"));
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("event");
        assert_eq!(
            event,
            CoreEvent::CycleFinished {
                cycle_count: 1,
                ok: true
            }
        );
    }
}
