use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_core::{AgentCore, CoreConfig, CoreParts, ReloadOutcome};
use anyhow::Result;
use async_trait::async_trait;
use core_types::{
    Action, ActionKind, CharacterStats, CoreError, CoreEvent, DecisionTier, GameStateSnapshot,
    ReloadKind,
};
use cycle_guard::{CycleContext, ImprovementCycle, InMemoryFlag};
use lock_order::LockOrderRegistry;
use macro_registry::MacroRunner;
use model_slot::features::FEATURE_DIM;
use model_slot::{JsonModelLoader, LinearPolicyModel, PolicyClass};

struct SlowCycle {
    runs: AtomicUsize,
}

#[async_trait]
impl ImprovementCycle for SlowCycle {
    async fn plan(&self, _ctx: &mut CycleContext) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }

    async fn execute(&self, _ctx: &mut CycleContext) -> Result<()> {
        Ok(())
    }

    async fn check(&self, _ctx: &mut CycleContext) -> Result<()> {
        Ok(())
    }

    async fn act(&self, _ctx: &mut CycleContext) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct NullRunner;

impl MacroRunner for NullRunner {
    fn run_command(&self, _command: &str) -> Result<()> {
        Ok(())
    }
}

fn policy(name: &str, action: ActionKind) -> LinearPolicyModel {
    LinearPolicyModel {
        name: name.to_string(),
        classes: vec![PolicyClass {
            action: Action::new(action),
            weights: vec![0.0; FEATURE_DIM],
            bias: 0.0,
        }],
    }
}

fn calm(tick: u64) -> GameStateSnapshot {
    GameStateSnapshot {
        stats: CharacterStats {
            name: "priest".to_string(),
            level: 40,
            hp: 500,
            max_hp: 500,
            sp: 200,
            max_sp: 200,
            weight: 100,
            max_weight: 1_000,
            ..CharacterStats::default()
        },
        map_id: "prt_fild08".to_string(),
        tick,
        ..GameStateSnapshot::default()
    }
}

fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("agent-core-{}", core_types::new_id()));
    fs::create_dir_all(&dir).expect("mkdir");
    dir
}

fn start() -> (AgentCore, Arc<SlowCycle>) {
    let cfg = CoreConfig::default();
    let parts = CoreParts::new(
        &cfg,
        LockOrderRegistry::for_build(),
        Arc::new(policy("seed", ActionKind::Attack)),
        Arc::new(JsonModelLoader),
        None,
    );
    let cycle = Arc::new(SlowCycle {
        runs: AtomicUsize::new(0),
    });
    let (core, _worker) = AgentCore::start(parts, cycle.clone(), Arc::new(InMemoryFlag::default()), 2);
    (core, cycle)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn state_flows_into_decisions() {
    let (core, _) = start();
    let mut events = core.events().subscribe();

    assert_eq!(core.on_state_received(calm(5)).expect("publish").0, 1);
    let err = core.on_state_received(calm(3)).expect_err("stale");
    assert!(matches!(err, CoreError::StaleUpdate { incoming: 3, current: 5 }));
    assert_eq!(
        events.recv().await.expect("event"),
        CoreEvent::StateStale {
            incoming_tick: 3,
            current_tick: 5
        }
    );

    let d = core.decide(Some(Duration::from_millis(100))).await;
    assert_eq!(d.tier, Some(DecisionTier::Ml));
    assert_eq!(d.model_version, Some(1));
    assert!(matches!(events.recv().await.expect("event"), CoreEvent::Decided(_)));
    assert_eq!(core.decision_stats().total, 1);
    assert_eq!(core.store_stats().tick, Some(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn model_and_macro_reloads_go_through_the_facade() {
    let (core, _) = start();
    core.on_state_received(calm(1)).expect("publish");
    let dir = temp_dir();

    let model_path = dir.join("policy.json");
    fs::write(
        &model_path,
        serde_json::to_string(&policy("retrained", ActionKind::Sit)).expect("encode"),
    )
    .expect("write");
    let outcome = core
        .on_reload_trigger(ReloadKind::Model, model_path)
        .await
        .expect("model reload");
    assert_eq!(outcome, ReloadOutcome::Model { version: 2 });
    let metrics = core.model_metrics();
    assert_eq!((metrics.version, metrics.model_name.as_str()), (2, "retrained"));
    assert_eq!(core.decide(None).await.action.kind, ActionKind::Sit);

    let missing = core
        .on_reload_trigger(ReloadKind::Model, dir.join("missing.json"))
        .await;
    assert!(matches!(missing, Err(CoreError::Staging(_))));
    assert_eq!(core.model_metrics().version, 2);

    let macro_path = dir.join("farm.macro");
    fs::write(&macro_path, "macro farm {\n  do sit\n  log resting\n}\n").expect("write");
    let outcome = core
        .on_reload_trigger(ReloadKind::Macro, macro_path)
        .await
        .expect("macro reload");
    assert_eq!(
        outcome,
        ReloadOutcome::Macro {
            name: "farm".to_string(),
            version: 1
        }
    );
    let run = core
        .execute_macro("farm", Arc::new(NullRunner))
        .await
        .expect("execute");
    assert_eq!(run.commands, 1);
    assert_eq!(core.macro_info("farm").expect("info").active_executions, 0);

    let _ = fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_cycle_triggers_are_coalesced() {
    let (core, cycle) = start();
    assert_eq!(core.on_cycle_trigger("timer"), Ok(()));
    assert_eq!(core.on_cycle_trigger("manual"), Err(CoreError::CycleAlreadyRunning));
    assert!(core.wait_cycle_idle(Duration::from_secs(2)).await);

    let status = core.cycle_status();
    assert_eq!(status.cycle_count, 1);
    assert_eq!(status.coalesced_count, 1);
    assert_eq!(cycle.runs.load(Ordering::SeqCst), 1);
    assert_eq!(core.on_cycle_trigger("manual"), Ok(()));
    assert!(core.wait_cycle_idle(Duration::from_secs(2)).await);
}
