//! Hot-swappable model holder.
//!
//! Candidates are loaded and validated off to the side ([`ModelSlot::stage`]),
//! then swapped in by [`ModelSlot::promote`] once every in-flight inference on
//! the active model has drained. Inference pins the active handle through a
//! [`ModelLease`], so a swap can never change the model under a running call.

pub mod features;
mod handle;
mod model;
mod slot;

pub use handle::{HandleStage, ModelLease};
pub use model::{
    InferenceModel, JsonModelLoader, LinearPolicyModel, ModelLoader, PolicyClass, Prediction,
    RawPrediction,
};
pub use slot::{ModelSlot, ModelSlotConfig, StagedModel, StagingError, SwapError};
