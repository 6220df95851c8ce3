//! Time budgets for latency-bound work.

use std::time::{Duration, Instant};

/// A fixed time budget measured from a start instant.
///
/// Every stage of a decision cycle derives its own slice from the same
/// `Deadline`, so the sum of slices can never exceed the overall budget.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Self::starting_at(Instant::now(), budget)
    }

    pub fn starting_at(start: Instant, budget: Duration) -> Self {
        Self { start, budget }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.start.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Budget for the next stage: `max` capped by what is left.
    pub fn slice(&self, max: Duration) -> Duration {
        max.min(self.remaining())
    }
}
