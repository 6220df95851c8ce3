use std::collections::BTreeMap;
use std::fmt;

pub use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type ModelVersion = u64;
pub type MacroVersion = u64;
pub type CycleId = u64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CharacterStats {
    pub name: String,
    pub level: u32,
    #[serde(default)]
    pub job_class: String,
    pub hp: u32,
    pub max_hp: u32,
    pub sp: u32,
    pub max_sp: u32,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub max_weight: u32,
    #[serde(default)]
    pub zeny: u64,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub status_effects: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Monster,
    Player,
    Npc,
    Item,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub kind: EntityKind,
    #[serde(default)]
    pub hp: u32,
    #[serde(default)]
    pub max_hp: u32,
    pub distance: u32,
    #[serde(default)]
    pub aggressive: bool,
    #[serde(default)]
    pub party_member: bool,
}

/// One tick of game state as delivered by the transport layer.
///
/// Snapshots are replaced wholesale and never mutated after publication;
/// the store hands them out as `Arc<GameStateSnapshot>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GameStateSnapshot {
    pub stats: CharacterStats,
    #[serde(default)]
    pub entities: Vec<Entity>,
    pub map_id: String,
    pub timestamp_ms: i64,
    /// Producer-assigned tick sequence. Strictly increasing per producer.
    pub tick: u64,
}

fn ratio(num: u32, den: u32) -> Option<f64> {
    (den > 0).then(|| num as f64 / den as f64)
}

impl GameStateSnapshot {
    pub fn hp_ratio(&self) -> Option<f64> {
        ratio(self.stats.hp, self.stats.max_hp)
    }

    pub fn sp_ratio(&self) -> Option<f64> {
        ratio(self.stats.sp, self.stats.max_sp)
    }

    pub fn weight_ratio(&self) -> Option<f64> {
        ratio(self.stats.weight, self.stats.max_weight)
    }

    pub fn monsters(&self) -> impl Iterator<Item = &Entity> {
        self.entities
            .iter()
            .filter(|e| e.kind == EntityKind::Monster)
    }

    pub fn aggressive_within(&self, distance: u32) -> usize {
        self.monsters()
            .filter(|m| m.aggressive && m.distance <= distance)
            .count()
    }

    pub fn has_status(&self, status: &str) -> bool {
        self.stats
            .status_effects
            .iter()
            .any(|s| s.eq_ignore_ascii_case(status))
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(transparent)]
pub struct StateVersion(pub u64);

impl StateVersion {
    pub const ZERO: StateVersion = StateVersion(0);

    pub fn next(self) -> StateVersion {
        StateVersion(self.0 + 1)
    }
}

impl fmt::Display for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Escalation levels, cheapest first. The derived ordering is the escalation order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecisionTier {
    Reflex,
    Rule,
    Ml,
    Llm,
}

impl DecisionTier {
    pub const ALL: [DecisionTier; 4] = [
        DecisionTier::Reflex,
        DecisionTier::Rule,
        DecisionTier::Ml,
        DecisionTier::Llm,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reflex => "reflex",
            Self::Rule => "rule",
            Self::Ml => "ml",
            Self::Llm => "llm",
        }
    }
}

impl fmt::Display for DecisionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    #[default]
    None,
    Attack,
    Skill,
    Move,
    UseItem,
    Command,
    RunMacro,
    Sit,
    Stand,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::None => "none",
            Self::Attack => "attack",
            Self::Skill => "skill",
            Self::Move => "move",
            Self::UseItem => "use_item",
            Self::Command => "command",
            Self::RunMacro => "run_macro",
            Self::Sit => "sit",
            Self::Stand => "stand",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Action {
    pub kind: ActionKind,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            params: BTreeMap::new(),
        }
    }

    pub fn none() -> Self {
        Self::new(ActionKind::None)
    }

    pub fn with_param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn is_none(&self) -> bool {
        self.kind == ActionKind::None
    }
}

/// The single result handed back to the transport layer per tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub cycle_id: CycleId,
    pub action: Action,
    /// Tier that resolved the cycle; `None` when the fallback action was returned.
    pub tier: Option<DecisionTier>,
    pub confidence: f64,
    pub latency_ms: f64,
    pub reasoning: String,
    pub state_version: StateVersion,
    #[serde(default)]
    pub model_version: Option<ModelVersion>,
}

impl Decision {
    pub fn is_fallback(&self) -> bool {
        self.tier.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CyclePhase {
    #[default]
    Idle = 0,
    Plan = 1,
    Do = 2,
    Check = 3,
    Act = 4,
}

impl CyclePhase {
    pub fn from_u8(raw: u8) -> CyclePhase {
        match raw {
            1 => Self::Plan,
            2 => Self::Do,
            3 => Self::Check,
            4 => Self::Act,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Idle => "idle",
            Self::Plan => "plan",
            Self::Do => "do",
            Self::Check => "check",
            Self::Act => "act",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReloadKind {
    Model,
    Macro,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ModelMetrics {
    pub version: ModelVersion,
    pub inflight: usize,
    pub inference_count: u64,
    pub promotions: u64,
    pub staged: bool,
    pub model_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MacroInfo {
    pub name: String,
    pub version: MacroVersion,
    pub active_executions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CycleStatus {
    pub running: bool,
    pub phase: CyclePhase,
    pub cycle_count: u64,
    pub failed_count: u64,
    pub coalesced_count: u64,
    pub last_reason: Option<String>,
    #[serde(default)]
    pub last_finished_at: Option<DateTime<Utc>>,
}

/// Notifications fanned out on the core event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum CoreEvent {
    StateStale {
        incoming_tick: u64,
        current_tick: u64,
    },
    ModelStaged {
        model_name: String,
    },
    ModelPromoted {
        version: ModelVersion,
    },
    ModelPromotionFailed {
        reason: String,
    },
    MacroReloaded {
        name: String,
        version: MacroVersion,
    },
    MacroReloadFailed {
        name: String,
        reason: String,
    },
    CycleFinished {
        cycle_count: u64,
        ok: bool,
    },
    StuckLock {
        lock_name: String,
        held_ms: u64,
    },
    Decided(Decision),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoreError {
    #[error("stale update: incoming tick {incoming} <= current tick {current}")]
    StaleUpdate { incoming: u64, current: u64 },
    #[error("model promotion timed out after {waited_ms}ms with {inflight} in-flight inferences")]
    PromotionTimedOut { waited_ms: u64, inflight: usize },
    #[error("macro `{name}` reload timed out after {waited_ms}ms")]
    ReloadTimedOut { name: String, waited_ms: u64 },
    #[error("tier {tier} exceeded its {slice_ms}ms slice")]
    TierTimeout { tier: DecisionTier, slice_ms: u64 },
    #[error("all decision tiers exhausted")]
    AllTiersExhausted,
    #[error("lock order violation: acquiring {requested} while holding {held}")]
    LockOrderViolation { held: String, requested: String },
    #[error("improvement cycle already running")]
    CycleAlreadyRunning,
    #[error("model staging failed: {0}")]
    Staging(String),
    #[error("nothing staged to promote")]
    NothingStaged,
    #[error("unknown macro `{0}`")]
    UnknownMacro(String),
    #[error("invalid macro syntax: {0}")]
    MacroSyntax(String),
    #[error("macro `{name}` failed: {reason}")]
    MacroFailed { name: String, reason: String },
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("worker pool unavailable: {0}")]
    WorkerUnavailable(String),
}

impl CoreError {
    /// Only true invariant breaches are fatal; everything else leaves the prior resource intact.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::LockOrderViolation { .. })
    }
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}
