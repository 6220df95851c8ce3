//! Global lock acquisition order, debug-build validation, and stuck-lock reporting.
//!
//! Every shared resource lock in the workspace is an [`OrderedRwLock`] or
//! [`OrderedMutex`] tagged with a [`LockLevel`]. Locks must be taken in
//! strictly ascending level order on any one thread. The check itself is an
//! injectable [`LockOrderStrategy`]: release builds default to a no-op,
//! debug builds to a thread-local stack that panics on violation.

mod level;
mod ordered;
mod registry;
mod strategy;
mod watchdog;

pub use level::LockLevel;
pub use ordered::{
    OrderedMutex, OrderedMutexGuard, OrderedReadGuard, OrderedRwLock, OrderedWriteGuard,
};
pub use registry::{HoldInfo, HoldMode, LockOrderRegistry, ViolationPolicy};
pub use strategy::{LockOrderStrategy, LockOrderViolation, NoopLockOrder, ThreadLocalLockOrder};
pub use watchdog::{DeadlockWatchdog, StuckLock, WatchdogConfig};
