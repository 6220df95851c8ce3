use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use core_types::{CoreError, ModelMetrics, ModelVersion};
use lock_order::{LockLevel, LockOrderRegistry, OrderedMutex, OrderedRwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::handle::{HandleStage, ModelHandle, ModelLease, SlotCounters};
use crate::model::{InferenceModel, ModelLoader, Prediction};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSlotConfig {
    /// Upper bound on the whole promotion: exclusive lock plus drain.
    pub drain_timeout_ms: u64,
}

impl Default for ModelSlotConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("load {path}: {reason}")]
    Load { path: String, reason: String },
    #[error("model `{model}` failed validation: {reason}")]
    Validation { model: String, reason: String },
}

impl From<StagingError> for CoreError {
    fn from(err: StagingError) -> Self {
        CoreError::Staging(err.to_string())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SwapError {
    #[error("nothing staged")]
    NothingStaged,
    #[error("promotion timed out after {waited_ms}ms with {inflight} in flight")]
    TimedOut { waited_ms: u64, inflight: usize },
}

impl From<SwapError> for CoreError {
    fn from(err: SwapError) -> Self {
        match err {
            SwapError::NothingStaged => CoreError::NothingStaged,
            SwapError::TimedOut {
                waited_ms,
                inflight,
            } => CoreError::PromotionTimedOut {
                waited_ms,
                inflight,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StagedModel {
    pub model_name: String,
    pub source: String,
    pub stage: HandleStage,
}

struct ActiveSlot {
    active: Arc<ModelHandle>,
    version: ModelVersion,
}

#[derive(Default)]
struct ActiveInfo {
    model_name: String,
}

pub struct ModelSlot {
    cfg: ModelSlotConfig,
    loader: Arc<dyn ModelLoader>,
    slot: OrderedRwLock<ActiveSlot>,
    staging: OrderedMutex<Option<Arc<ModelHandle>>>,
    info: OrderedMutex<ActiveInfo>,
    counters: Arc<SlotCounters>,
    version: AtomicU64,
    promotions: AtomicU64,
}

impl ModelSlot {
    /// Starts with `initial` active at version 1; a slot is never without a usable model.
    pub fn new(
        initial: Arc<dyn InferenceModel>,
        loader: Arc<dyn ModelLoader>,
        cfg: ModelSlotConfig,
        registry: &LockOrderRegistry,
    ) -> Self {
        let handle = Arc::new(ModelHandle::new(initial, "initial".to_string()));
        handle.promote_to(1);
        let model_name = handle.name().to_string();
        Self {
            cfg,
            loader,
            slot: OrderedRwLock::new(
                LockLevel::Model,
                "model.slot",
                registry,
                ActiveSlot {
                    active: handle,
                    version: 1,
                },
            ),
            staging: OrderedMutex::new(LockLevel::Model, "model.staging", registry, None),
            info: OrderedMutex::new(
                LockLevel::Metrics,
                "model.info",
                registry,
                ActiveInfo { model_name },
            ),
            counters: Arc::new(SlotCounters::default()),
            version: AtomicU64::new(1),
            promotions: AtomicU64::new(0),
        }
    }

    pub fn cfg(&self) -> &ModelSlotConfig {
        &self.cfg
    }

    pub fn version(&self) -> ModelVersion {
        self.version.load(Ordering::Acquire)
    }

    /// Loads and validates a candidate from `path`. The active model is never touched.
    pub fn stage(&self, path: &Path) -> Result<StagedModel, StagingError> {
        let model = self.loader.load(path).map_err(|err| {
            metrics::counter!("model.stage_rejected").increment(1);
            StagingError::Load {
                path: path.display().to_string(),
                reason: format!("{err:#}"),
            }
        })?;
        self.stage_model(model, path.display().to_string())
    }

    /// Stages an already-constructed model, e.g. one handed over in memory by a training job.
    pub fn stage_model(
        &self,
        model: Arc<dyn InferenceModel>,
        source: String,
    ) -> Result<StagedModel, StagingError> {
        let handle = Arc::new(ModelHandle::new(model, source));
        if let Err(err) = handle.model().validate() {
            metrics::counter!("model.stage_rejected").increment(1);
            tracing::warn!(model = handle.name(), error = %err, "model candidate rejected");
            return Err(StagingError::Validation {
                model: handle.name().to_string(),
                reason: format!("{err:#}"),
            });
        }
        handle.set_stage(HandleStage::Validated);

        let staged = StagedModel {
            model_name: handle.name().to_string(),
            source: handle.source().to_string(),
            stage: handle.stage(),
        };
        let replaced = self.staging.lock().replace(handle);
        if let Some(prev) = replaced {
            tracing::info!(previous = prev.name(), "replacing previously staged model");
        }
        metrics::counter!("model.stage_ok").increment(1);
        tracing::info!(model = %staged.model_name, source = %staged.source, "model staged");
        Ok(staged)
    }

    /// Swaps the staged candidate in once the active model has drained.
    ///
    /// On timeout the old model stays active and the candidate stays staged
    /// (unless a newer candidate was staged meanwhile).
    pub fn promote(&self) -> Result<ModelVersion, SwapError> {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.cfg.drain_timeout_ms);
        let Some(candidate) = self.staging.lock().take() else {
            return Err(SwapError::NothingStaged);
        };

        match self.swap_in(&candidate, started, deadline) {
            Ok(version) => {
                self.promotions.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("model.promote_ok").increment(1);
                tracing::info!(
                    model = candidate.name(),
                    version,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "model promoted"
                );
                Ok(version)
            }
            Err(err) => {
                {
                    let mut staged = self.staging.lock();
                    if staged.is_none() {
                        *staged = Some(candidate);
                    }
                }
                metrics::counter!("model.promote_timeout").increment(1);
                tracing::warn!(error = %err, "model promotion aborted; previous model stays active");
                Err(err)
            }
        }
    }

    fn swap_in(
        &self,
        candidate: &Arc<ModelHandle>,
        started: Instant,
        deadline: Instant,
    ) -> Result<ModelVersion, SwapError> {
        let timed_out = |inflight: usize| SwapError::TimedOut {
            waited_ms: started.elapsed().as_millis() as u64,
            inflight,
        };

        let wait = deadline.saturating_duration_since(Instant::now());
        let Some(mut slot) = self.slot.try_write_for(wait) else {
            return Err(timed_out(self.counters.inflight.load(Ordering::Acquire)));
        };
        // New leases are blocked from here on; wait for the outstanding ones.
        let old = slot.active.clone();
        if !old.wait_drained(deadline) {
            return Err(timed_out(old.inflight()));
        }

        let version = slot.version + 1;
        candidate.promote_to(version);
        slot.active = candidate.clone();
        slot.version = version;
        old.set_stage(HandleStage::Retired);
        self.version.store(version, Ordering::Release);
        self.info.lock().model_name = candidate.name().to_string();
        Ok(version)
    }

    /// Pins the active model, waiting at most `timeout` if a promotion holds the slot.
    pub fn lease_within(&self, timeout: Duration) -> Option<ModelLease> {
        let Some(slot) = self.slot.try_read_for(timeout) else {
            metrics::counter!("model.lease_timeout").increment(1);
            return None;
        };
        Some(ModelLease::new(slot.active.clone(), self.counters.clone()))
    }

    /// One inference on the active model, under the shared slot lock.
    pub fn infer(&self, features: &[f32]) -> Result<Prediction, CoreError> {
        let slot = self.slot.read();
        let lease = ModelLease::new(slot.active.clone(), self.counters.clone());
        let res = lease.predict(features);
        drop(lease);
        drop(slot);
        res
    }

    pub fn staged(&self) -> Option<StagedModel> {
        self.staging.lock().as_ref().map(|h| StagedModel {
            model_name: h.name().to_string(),
            source: h.source().to_string(),
            stage: h.stage(),
        })
    }

    /// Non-blocking metrics; safe to call while a promotion is draining.
    pub fn metrics(&self) -> ModelMetrics {
        let staged = self.staging.lock().is_some();
        let model_name = self.info.lock().model_name.clone();
        ModelMetrics {
            version: self.version(),
            inflight: self.counters.inflight.load(Ordering::Acquire),
            inference_count: self.counters.inferences.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            staged,
            model_name,
        }
    }
}
