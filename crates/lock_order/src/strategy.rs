use std::cell::RefCell;
use std::fmt;

use core_types::CoreError;

use crate::level::LockLevel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOrderViolation {
    pub held_level: LockLevel,
    pub held_name: &'static str,
    pub requested_level: LockLevel,
    pub requested_name: &'static str,
}

impl fmt::Display for LockOrderViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "acquiring {}({}) while holding {}({})",
            self.requested_name, self.requested_level, self.held_name, self.held_level
        )
    }
}

impl From<LockOrderViolation> for CoreError {
    fn from(v: LockOrderViolation) -> Self {
        CoreError::LockOrderViolation {
            held: format!("{}({})", v.held_name, v.held_level),
            requested: format!("{}({})", v.requested_name, v.requested_level),
        }
    }
}

/// Validation hook consulted around every ordered lock acquisition.
///
/// `validate` runs before the caller blocks on the lock, `push` after it was
/// granted and `pop` when the guard drops. A failed try-lock never pushes.
pub trait LockOrderStrategy: Send + Sync {
    fn validate(&self, level: LockLevel, name: &'static str) -> Result<(), LockOrderViolation>;
    fn push(&self, level: LockLevel, name: &'static str);
    fn pop(&self, level: LockLevel, name: &'static str);

    /// Locks the calling thread currently holds, oldest first.
    fn held(&self) -> Vec<(LockLevel, &'static str)> {
        Vec::new()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLockOrder;

impl LockOrderStrategy for NoopLockOrder {
    fn validate(&self, _level: LockLevel, _name: &'static str) -> Result<(), LockOrderViolation> {
        Ok(())
    }

    fn push(&self, _level: LockLevel, _name: &'static str) {}

    fn pop(&self, _level: LockLevel, _name: &'static str) {}
}

thread_local! {
    static HELD: RefCell<Vec<(LockLevel, &'static str)>> = const { RefCell::new(Vec::new()) };
}

/// Per-thread stack of held locks. A new lock must sit strictly above the highest one held.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadLocalLockOrder;

impl LockOrderStrategy for ThreadLocalLockOrder {
    fn validate(&self, level: LockLevel, name: &'static str) -> Result<(), LockOrderViolation> {
        HELD.with(|held| {
            let held = held.borrow();
            let top = held.iter().max_by_key(|(lvl, _)| *lvl);
            match top {
                Some(&(held_level, held_name)) if level <= held_level => Err(LockOrderViolation {
                    held_level,
                    held_name,
                    requested_level: level,
                    requested_name: name,
                }),
                _ => Ok(()),
            }
        })
    }

    fn push(&self, level: LockLevel, name: &'static str) {
        HELD.with(|held| held.borrow_mut().push((level, name)));
    }

    fn pop(&self, level: LockLevel, name: &'static str) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            // Guards may drop out of acquisition order; remove the newest matching entry.
            if let Some(pos) = held
                .iter()
                .rposition(|&(lvl, n)| lvl == level && n == name)
            {
                held.remove(pos);
            } else {
                debug_assert!(false, "release of {name}({level}) that was never acquired");
            }
        });
    }

    fn held(&self) -> Vec<(LockLevel, &'static str)> {
        HELD.with(|held| held.borrow().clone())
    }
}
