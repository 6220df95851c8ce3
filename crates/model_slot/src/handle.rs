use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use core_types::{CoreError, ModelVersion};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::model::{InferenceModel, Prediction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum HandleStage {
    Staged = 0,
    Validated = 1,
    Promoted = 2,
    Retired = 3,
}

impl HandleStage {
    fn from_u8(raw: u8) -> HandleStage {
        match raw {
            1 => Self::Validated,
            2 => Self::Promoted,
            3 => Self::Retired,
            _ => Self::Staged,
        }
    }
}

/// Counters shared by every handle of one slot.
#[derive(Debug, Default)]
pub(crate) struct SlotCounters {
    pub(crate) inflight: AtomicUsize,
    pub(crate) inferences: AtomicU64,
}

pub(crate) struct ModelHandle {
    model: Arc<dyn InferenceModel>,
    source: String,
    version: AtomicU64,
    stage: AtomicU8,
    inflight: AtomicUsize,
    // Signal-only pair used to wake a promoter waiting for the drain.
    drain_lock: Mutex<()>,
    drained: Condvar,
}

impl ModelHandle {
    pub(crate) fn new(model: Arc<dyn InferenceModel>, source: String) -> Self {
        Self {
            model,
            source,
            version: AtomicU64::new(0),
            stage: AtomicU8::new(HandleStage::Staged as u8),
            inflight: AtomicUsize::new(0),
            drain_lock: Mutex::new(()),
            drained: Condvar::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.model.name()
    }

    pub(crate) fn model(&self) -> &Arc<dyn InferenceModel> {
        &self.model
    }

    pub(crate) fn source(&self) -> &str {
        &self.source
    }

    pub(crate) fn version(&self) -> ModelVersion {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn stage(&self) -> HandleStage {
        HandleStage::from_u8(self.stage.load(Ordering::Acquire))
    }

    pub(crate) fn set_stage(&self, stage: HandleStage) {
        self.stage.store(stage as u8, Ordering::Release);
    }

    /// Stamps the version and marks the handle live. Only called under the exclusive slot lock.
    pub(crate) fn promote_to(&self, version: ModelVersion) {
        self.version.store(version, Ordering::Release);
        self.set_stage(HandleStage::Promoted);
    }

    pub(crate) fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Blocks until no lease is outstanding or the deadline passes. Returns whether it drained.
    pub(crate) fn wait_drained(&self, deadline: Instant) -> bool {
        let mut guard = self.drain_lock.lock();
        while self.inflight() > 0 {
            if self.drained.wait_until(&mut guard, deadline).timed_out() {
                return self.inflight() == 0;
            }
        }
        true
    }

    fn release(&self) {
        if self.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.drain_lock.lock();
            self.drained.notify_all();
        }
    }
}

/// Pins one model version for the lifetime of the lease and counts as in-flight.
///
/// Dropping the lease releases the in-flight slot on every exit path, including
/// early returns and unwinding out of a failed inference.
pub struct ModelLease {
    handle: Arc<ModelHandle>,
    counters: Arc<SlotCounters>,
}

impl ModelLease {
    pub(crate) fn new(handle: Arc<ModelHandle>, counters: Arc<SlotCounters>) -> Self {
        handle.inflight.fetch_add(1, Ordering::AcqRel);
        counters.inflight.fetch_add(1, Ordering::AcqRel);
        Self { handle, counters }
    }

    pub fn version(&self) -> ModelVersion {
        self.handle.version()
    }

    pub fn model_name(&self) -> &str {
        self.handle.name()
    }

    pub fn predict(&self, features: &[f32]) -> Result<Prediction, CoreError> {
        self.counters.inferences.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("model.inference").increment(1);
        let raw = self
            .handle
            .model()
            .predict(features)
            .map_err(|err| CoreError::Inference(format!("{err:#}")))?;
        Ok(Prediction {
            action: raw.action,
            confidence: raw.confidence.clamp(0.0, 1.0),
            model_version: self.handle.version(),
            model_name: self.handle.name().to_string(),
        })
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        self.counters.inflight.fetch_sub(1, Ordering::AcqRel);
        self.handle.release();
    }
}

impl std::fmt::Debug for ModelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLease")
            .field("model", &self.handle.name())
            .field("version", &self.handle.version())
            .finish()
    }
}
