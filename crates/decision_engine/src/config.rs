use std::time::Duration;

use core_types::{Action, DecisionTier, GameStateSnapshot};
use serde::{Deserialize, Serialize};

/// Minimum confidence for a tier to resolve the cycle. Equality resolves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TierThresholds {
    pub reflex: f64,
    pub rule: f64,
    pub ml: f64,
    pub llm: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            reflex: 0.9,
            rule: 0.7,
            ml: 0.6,
            llm: 0.5,
        }
    }
}

impl TierThresholds {
    pub fn for_tier(&self, tier: DecisionTier) -> f64 {
        match tier {
            DecisionTier::Reflex => self.reflex,
            DecisionTier::Rule => self.rule,
            DecisionTier::Ml => self.ml,
            DecisionTier::Llm => self.llm,
        }
    }
}

/// Upper bound per tier; the effective slice is also capped by what is left of the deadline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TierSlices {
    pub reflex_ms: u64,
    pub rule_ms: u64,
    pub ml_ms: u64,
    pub llm_ms: u64,
}

impl Default for TierSlices {
    fn default() -> Self {
        Self {
            reflex_ms: 5,
            rule_ms: 10,
            ml_ms: 30,
            llm_ms: 80,
        }
    }
}

impl TierSlices {
    pub fn for_tier(&self, tier: DecisionTier) -> Duration {
        let ms = match tier {
            DecisionTier::Reflex => self.reflex_ms,
            DecisionTier::Rule => self.rule_ms,
            DecisionTier::Ml => self.ml_ms,
            DecisionTier::Llm => self.llm_ms,
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DecisionConfig {
    pub thresholds: TierThresholds,
    pub slices: TierSlices,
    pub routine_deadline_ms: u64,
    pub emergency_deadline_ms: u64,
    /// Below this HP ratio the cycle runs on the emergency deadline.
    pub emergency_hp_ratio: f64,
    pub fallback_action: Action,
    pub min_llm_interval_ms: u64,
    /// How long a cycle may wait for a model lease while a promotion holds the slot.
    pub model_lease_wait_ms: u64,
    pub llm_prompt: String,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            thresholds: TierThresholds::default(),
            slices: TierSlices::default(),
            routine_deadline_ms: 100,
            emergency_deadline_ms: 50,
            emergency_hp_ratio: 0.25,
            fallback_action: Action::none(),
            min_llm_interval_ms: 60_000,
            model_lease_wait_ms: 2,
            llm_prompt: "What should I do next for optimal progression?".to_string(),
        }
    }
}

impl DecisionConfig {
    pub fn is_emergency(&self, state: &GameStateSnapshot) -> bool {
        state
            .hp_ratio()
            .map(|r| r < self.emergency_hp_ratio)
            .unwrap_or(false)
            || state.aggressive_within(5) >= 3
    }

    pub fn deadline_for(&self, state: &GameStateSnapshot) -> Duration {
        if self.is_emergency(state) {
            Duration::from_millis(self.emergency_deadline_ms)
        } else {
            Duration::from_millis(self.routine_deadline_ms)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    pub base_url: String,
    pub connect_timeout_ms: u64,
    /// Whole-request bound, so a hung service cannot pin a query task.
    pub request_timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://127.0.0.1:9902".to_string(),
            connect_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use core_types::CharacterStats;

    use super::*;

    #[test]
    fn low_hp_switches_to_emergency_deadline() {
        let cfg = DecisionConfig::default();
        let mut state = GameStateSnapshot {
            stats: CharacterStats {
                hp: 90,
                max_hp: 100,
                ..CharacterStats::default()
            },
            ..GameStateSnapshot::default()
        };
        assert_eq!(cfg.deadline_for(&state), Duration::from_millis(100));
        state.stats.hp = 10;
        assert_eq!(cfg.deadline_for(&state), Duration::from_millis(50));
    }
}
