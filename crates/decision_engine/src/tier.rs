use std::time::Duration;

use core_types::{Action, CycleId, DecisionTier, GameStateSnapshot, StateVersion};
use model_slot::ModelLease;

/// Everything a tier may look at. The snapshot is the one read made for the whole cycle.
pub struct TierContext<'a> {
    pub cycle_id: CycleId,
    pub state: &'a GameStateSnapshot,
    pub state_version: StateVersion,
    /// Present once the cycle has pinned a model.
    pub model: Option<&'a ModelLease>,
    pub slice: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TierOutcome {
    Decided {
        action: Action,
        confidence: f64,
        reasoning: String,
    },
    Declined(String),
}

impl TierOutcome {
    pub fn decided(action: Action, confidence: f64, reasoning: impl Into<String>) -> Self {
        Self::Decided {
            action,
            confidence,
            reasoning: reasoning.into(),
        }
    }

    pub fn declined(reason: impl Into<String>) -> Self {
        Self::Declined(reason.into())
    }
}

/// A synchronous decision tier. Runs on the blocking pool; a call that overruns its slice is abandoned.
pub trait Tier: Send + Sync {
    fn kind(&self) -> DecisionTier;

    fn evaluate(&self, ctx: &TierContext<'_>) -> TierOutcome;
}
