use core_types::DecisionTier;
use model_slot::features;

use crate::tier::{Tier, TierContext, TierOutcome};

/// Runs the pinned policy model on the cycle's snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModelTier;

impl Tier for ModelTier {
    fn kind(&self) -> DecisionTier {
        DecisionTier::Ml
    }

    fn evaluate(&self, ctx: &TierContext<'_>) -> TierOutcome {
        let Some(lease) = ctx.model else {
            return TierOutcome::declined("no model available");
        };
        match lease.predict(&features::extract(ctx.state)) {
            Ok(p) => TierOutcome::decided(
                p.action,
                p.confidence,
                format!("model {} v{}", p.model_name, p.model_version),
            ),
            Err(err) => {
                tracing::warn!(cycle_id = ctx.cycle_id, error = %err, "model inference failed");
                TierOutcome::declined(err.to_string())
            }
        }
    }
}
