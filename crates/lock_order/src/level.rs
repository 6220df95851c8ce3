use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a lock in the global acquisition order. Lower levels are taken first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LockLevel {
    Config = 0,
    Session = 1,
    State = 2,
    Auxiliary = 3,
    Decision = 4,
    Model = 5,
    Macro = 6,
    Metrics = 7,
    Database = 8,
    Network = 9,
}

impl LockLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Session => "session",
            Self::State => "state",
            Self::Auxiliary => "auxiliary",
            Self::Decision => "decision",
            Self::Model => "model",
            Self::Macro => "macro",
            Self::Metrics => "metrics",
            Self::Database => "database",
            Self::Network => "network",
        }
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
