//! Tiered decision pipeline: Reflex, Rule, Ml and Llm tiers tried in order of
//! cost until one is confident enough or the deadline runs out.

mod config;
mod coordinator;
mod llm;
mod ml;
mod reflex;
mod rules;
mod stats;
mod tier;

pub use config::{DecisionConfig, LlmConfig, TierSlices, TierThresholds};
pub use coordinator::{DecisionCoordinator, DecisionPhase};
pub use llm::{HttpLlmClient, LlmAction, LlmClient, LlmMailbox, LlmReply, LlmRequest};
pub use ml::ModelTier;
pub use reflex::ReflexTier;
pub use rules::RuleTier;
pub use stats::{DecisionStats, DecisionStatsSnapshot, TierStatsSnapshot};
pub use tier::{Tier, TierContext, TierOutcome};
