//! The decision core behind a single facade.
//!
//! Transport layers feed snapshots and triggers in and read plain data back
//! out; no lock or guard ever crosses this boundary.

mod pool;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use core_types::{
    CoreError, CoreEvent, CycleStatus, Decision, GameStateSnapshot, MacroInfo, MacroVersion,
    ModelMetrics, ModelVersion, ReloadKind, StateVersion,
};
use cycle_guard::{ArbitrationFlag, CycleGuard, ImprovementCycle};
use decision_engine::{DecisionConfig, DecisionCoordinator, DecisionStatsSnapshot, LlmClient};
use infra_bus::EventBus;
use infra_clock::Deadline;
use lock_order::LockOrderRegistry;
use macro_registry::{MacroRegistry, MacroRegistryConfig, MacroRun, MacroRunner};
use model_slot::{InferenceModel, ModelLoader, ModelSlot, ModelSlotConfig, StagedModel};
use serde::{Deserialize, Serialize};
use state_store::{GameStateStore, StoreStats};
use tokio::task::JoinHandle;

pub use pool::WorkerPool;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoreConfig {
    pub decision: DecisionConfig,
    pub model: ModelSlotConfig,
    pub macros: MacroRegistryConfig,
    pub workers: usize,
    pub event_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            decision: DecisionConfig::default(),
            model: ModelSlotConfig::default(),
            macros: MacroRegistryConfig::default(),
            workers: 4,
            event_capacity: 1_024,
        }
    }
}

/// Shared components, built before the improvement cycle so the cycle can hold them too.
#[derive(Clone)]
pub struct CoreParts {
    pub locks: LockOrderRegistry,
    pub store: Arc<GameStateStore>,
    pub models: Arc<ModelSlot>,
    pub macros: Arc<MacroRegistry>,
    pub decisions: Arc<DecisionCoordinator>,
    pub events: EventBus<CoreEvent>,
}

impl CoreParts {
    pub fn new(
        cfg: &CoreConfig,
        locks: LockOrderRegistry,
        initial_model: Arc<dyn InferenceModel>,
        loader: Arc<dyn ModelLoader>,
        llm: Option<Arc<dyn LlmClient>>,
    ) -> Self {
        let store = Arc::new(GameStateStore::new(&locks));
        let models = Arc::new(ModelSlot::new(initial_model, loader, cfg.model.clone(), &locks));
        let macros = Arc::new(MacroRegistry::new(cfg.macros.clone(), &locks));
        let mut decisions =
            DecisionCoordinator::new(cfg.decision.clone(), store.clone(), Some(models.clone()));
        if let Some(client) = llm {
            decisions = decisions.with_llm(client);
        }
        Self {
            locks,
            store,
            models,
            macros,
            decisions: Arc::new(decisions),
            events: EventBus::new("core", cfg.event_capacity),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReloadOutcome {
    Model { version: ModelVersion },
    Macro { name: String, version: MacroVersion },
}

pub struct AgentCore {
    parts: CoreParts,
    cycles: CycleGuard,
    pool: WorkerPool,
}

impl AgentCore {
    /// Wires the facade and starts the improvement-cycle worker.
    pub fn start(
        parts: CoreParts,
        cycle: Arc<dyn ImprovementCycle>,
        flag: Arc<dyn ArbitrationFlag>,
        workers: usize,
    ) -> (Self, JoinHandle<()>) {
        let (cycles, worker) =
            CycleGuard::spawn(cycle, flag, &parts.locks, Some(parts.events.clone()));
        let core = Self {
            parts,
            cycles,
            pool: WorkerPool::new(workers),
        };
        (core, worker)
    }

    pub fn parts(&self) -> &CoreParts {
        &self.parts
    }

    pub fn events(&self) -> &EventBus<CoreEvent> {
        &self.parts.events
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn on_state_received(&self, snapshot: GameStateSnapshot) -> Result<StateVersion, CoreError> {
        let res = self.parts.store.publish(snapshot);
        if let Err(CoreError::StaleUpdate { incoming, current }) = &res {
            let _ = self.parts.events.publish(CoreEvent::StateStale {
                incoming_tick: *incoming,
                current_tick: *current,
            });
        }
        res
    }

    /// Model triggers stage then promote the file at `path`; macro triggers reload it under its file stem.
    pub async fn on_reload_trigger(
        &self,
        kind: ReloadKind,
        path: PathBuf,
    ) -> Result<ReloadOutcome, CoreError> {
        match kind {
            ReloadKind::Model => {
                self.stage_model(path).await?;
                let version = self.promote_model().await?;
                Ok(ReloadOutcome::Model { version })
            }
            ReloadKind::Macro => {
                let name = macro_name(&path)?;
                let text = self
                    .pool
                    .run_blocking(move || std::fs::read_to_string(&path))
                    .await?
                    .map_err(|err| CoreError::MacroSyntax(format!("read macro file: {err}")))?;
                let version = self.reload_macro(&name, text).await?;
                Ok(ReloadOutcome::Macro { name, version })
            }
        }
    }

    pub async fn stage_model(&self, path: PathBuf) -> Result<StagedModel, CoreError> {
        let models = self.parts.models.clone();
        let staged = self
            .pool
            .run_blocking(move || models.stage(&path))
            .await?
            .map_err(CoreError::from)?;
        let _ = self.parts.events.publish(CoreEvent::ModelStaged {
            model_name: staged.model_name.clone(),
        });
        Ok(staged)
    }

    pub async fn promote_model(&self) -> Result<ModelVersion, CoreError> {
        let models = self.parts.models.clone();
        let res = self
            .pool
            .run_blocking(move || models.promote())
            .await?
            .map_err(CoreError::from);
        let event = match &res {
            Ok(version) => CoreEvent::ModelPromoted { version: *version },
            Err(err) => {
                tracing::warn!(error = %err, "model promotion failed; active model unchanged");
                CoreEvent::ModelPromotionFailed {
                    reason: err.to_string(),
                }
            }
        };
        let _ = self.parts.events.publish(event);
        res
    }

    pub async fn reload_macro(&self, name: &str, text: String) -> Result<MacroVersion, CoreError> {
        let macros = self.parts.macros.clone();
        let owned = name.to_string();
        let res = self
            .pool
            .run_blocking(move || macros.reload(&owned, &text))
            .await?
            .map_err(CoreError::from);
        let event = match &res {
            Ok(version) => CoreEvent::MacroReloaded {
                name: name.to_string(),
                version: *version,
            },
            Err(err) => {
                tracing::warn!(name, error = %err, "macro reload failed; previous version kept");
                CoreEvent::MacroReloadFailed {
                    name: name.to_string(),
                    reason: err.to_string(),
                }
            }
        };
        let _ = self.parts.events.publish(event);
        res
    }

    pub async fn execute_macro(
        &self,
        name: &str,
        runner: Arc<dyn MacroRunner>,
    ) -> Result<MacroRun, CoreError> {
        let macros = self.parts.macros.clone();
        let owned = name.to_string();
        self.pool
            .run_blocking(move || macros.execute(&owned, runner.as_ref()))
            .await?
    }

    /// A trigger that arrives while a cycle runs is coalesced, never queued.
    pub fn on_cycle_trigger(&self, reason: &str) -> Result<(), CoreError> {
        if self.cycles.try_start(reason) {
            Ok(())
        } else {
            Err(CoreError::CycleAlreadyRunning)
        }
    }

    /// `None` picks the routine or emergency budget from the current snapshot.
    pub async fn decide(&self, budget: Option<Duration>) -> Decision {
        let decision = match budget {
            Some(budget) => self.parts.decisions.decide(Deadline::new(budget)).await,
            None => self.parts.decisions.decide_auto().await,
        };
        let _ = self.parts.events.publish(CoreEvent::Decided(decision.clone()));
        decision
    }

    pub fn model_metrics(&self) -> ModelMetrics {
        self.parts.models.metrics()
    }

    pub fn macro_info(&self, name: &str) -> Option<MacroInfo> {
        self.parts.macros.info(name)
    }

    pub fn macro_names(&self) -> Vec<String> {
        self.parts.macros.names()
    }

    pub fn cycle_status(&self) -> CycleStatus {
        self.cycles.status()
    }

    pub async fn wait_cycle_idle(&self, timeout: Duration) -> bool {
        self.cycles.wait_idle(timeout).await
    }

    pub fn decision_stats(&self) -> DecisionStatsSnapshot {
        self.parts.decisions.stats()
    }

    pub fn store_stats(&self) -> StoreStats {
        self.parts.store.stats()
    }
}

fn macro_name(path: &Path) -> Result<String, CoreError> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| CoreError::MacroSyntax(format!("no macro name in {}", path.display())))
}
