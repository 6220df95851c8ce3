use core_types::{Action, ActionKind, DecisionTier, GameStateSnapshot};

use crate::tier::{Tier, TierContext, TierOutcome};

const DANGEROUS_STATUSES: [&str; 6] = ["Stunned", "Frozen", "Stone Curse", "Sleep", "Blind", "Silence"];

/// Emergency responses that must not wait for anything smarter.
#[derive(Debug, Clone)]
pub struct ReflexTier {
    pub hp_critical: f64,
    pub hp_low: f64,
    pub sp_low: f64,
    pub weight_critical: f64,
    pub attack_range: u32,
    pub confidence: f64,
}

impl Default for ReflexTier {
    fn default() -> Self {
        Self {
            hp_critical: 0.25,
            hp_low: 0.40,
            sp_low: 0.20,
            weight_critical: 0.90,
            attack_range: 5,
            confidence: 0.95,
        }
    }
}

fn use_item(item: &str) -> Action {
    Action::new(ActionKind::UseItem).with_param("item", item)
}

impl ReflexTier {
    fn below(ratio: Option<f64>, threshold: f64) -> bool {
        ratio.map(|r| r < threshold).unwrap_or(false)
    }

    fn respond(&self, state: &GameStateSnapshot) -> Option<(Action, &'static str)> {
        let hp = state.hp_ratio();
        if Self::below(hp, self.hp_critical) {
            return Some((use_item("White Potion"), "hp critical, emergency healing"));
        }
        if DANGEROUS_STATUSES.iter().any(|s| state.has_status(s)) {
            return Some((use_item("Green Potion"), "dangerous status effect"));
        }
        if Self::below(hp, self.hp_low) && state.aggressive_within(self.attack_range) > 0 {
            return Some((use_item("Red Potion"), "low hp while under attack"));
        }
        if state
            .weight_ratio()
            .map(|r| r >= self.weight_critical)
            .unwrap_or(false)
        {
            let storage = Action::new(ActionKind::Command).with_param("command", "storage");
            return Some((storage, "overweight, storing items"));
        }
        if Self::below(state.sp_ratio(), self.sp_low) {
            return Some((use_item("Blue Potion"), "sp critically low"));
        }
        None
    }
}

impl Tier for ReflexTier {
    fn kind(&self) -> DecisionTier {
        DecisionTier::Reflex
    }

    fn evaluate(&self, ctx: &TierContext<'_>) -> TierOutcome {
        match self.respond(ctx.state) {
            Some((action, why)) => TierOutcome::decided(action, self.confidence, format!("reflex: {why}")),
            None => TierOutcome::declined("no emergency"),
        }
    }
}
