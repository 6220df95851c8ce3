use core_types::{Action, ActionKind, DecisionTier, Entity, GameStateSnapshot};

use crate::tier::{Tier, TierContext, TierOutcome};

/// Tactical rules: top up HP, pick a target, back off when swarmed.
#[derive(Debug, Clone)]
pub struct RuleTier {
    pub heal_below: f64,
    /// Healing below this ratio belongs to the reflex tier.
    pub heal_floor: f64,
    pub min_attack_hp: f64,
    pub skill_sp_above: f64,
    pub max_attack_distance: u32,
    pub skill_distance: u32,
    pub safe_distance: u32,
    pub swarm_size: usize,
    pub skill: String,
}

impl Default for RuleTier {
    fn default() -> Self {
        Self {
            heal_below: 0.60,
            heal_floor: 0.25,
            min_attack_hp: 0.40,
            skill_sp_above: 0.30,
            max_attack_distance: 15,
            skill_distance: 10,
            safe_distance: 8,
            swarm_size: 3,
            skill: "Bash".to_string(),
        }
    }
}

impl RuleTier {
    fn should_heal(&self, state: &GameStateSnapshot) -> bool {
        state
            .hp_ratio()
            .map(|r| r < self.heal_below && r > self.heal_floor)
            .unwrap_or(false)
    }

    /// Nearest aggressive monster in range, otherwise the nearest monster in range.
    fn best_target<'a>(&self, state: &'a GameStateSnapshot) -> Option<&'a Entity> {
        let in_range = || {
            state
                .monsters()
                .filter(|m| m.distance <= self.max_attack_distance)
        };
        in_range()
            .filter(|m| m.aggressive)
            .min_by_key(|m| m.distance)
            .or_else(|| in_range().min_by_key(|m| m.distance))
    }

    fn combat(&self, state: &GameStateSnapshot) -> Option<TierOutcome> {
        if state.hp_ratio().map(|r| r < self.min_attack_hp).unwrap_or(true) {
            return None;
        }
        let target = self.best_target(state)?;
        let use_skill = state
            .sp_ratio()
            .map(|r| r > self.skill_sp_above)
            .unwrap_or(false)
            && target.distance <= self.skill_distance;
        let (action, verb) = if use_skill {
            let skill = Action::new(ActionKind::Skill)
                .with_param("skill", self.skill.as_str())
                .with_param("target", target.id.as_str());
            (skill, "skill")
        } else {
            let attack = Action::new(ActionKind::Attack).with_param("target", target.id.as_str());
            (attack, "basic attack")
        };
        Some(TierOutcome::decided(
            action,
            0.8,
            format!("rules: {verb} on {}", target.name),
        ))
    }
}

impl Tier for RuleTier {
    fn kind(&self) -> DecisionTier {
        DecisionTier::Rule
    }

    fn evaluate(&self, ctx: &TierContext<'_>) -> TierOutcome {
        let state = ctx.state;
        if self.should_heal(state) {
            return TierOutcome::decided(
                Action::new(ActionKind::UseItem).with_param("item", "Red Potion"),
                0.75,
                "rules: hp below heal threshold",
            );
        }
        if let Some(outcome) = self.combat(state) {
            return outcome;
        }
        if state.aggressive_within(self.safe_distance) >= self.swarm_size {
            return TierOutcome::decided(
                Action::new(ActionKind::Move).with_param("direction", "away"),
                0.7,
                "rules: too many aggressive monsters, retreating",
            );
        }
        TierOutcome::declined("no tactical action")
    }
}
