use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide "someone is improving" flag.
///
/// Multi-process deployments implement this over a shared primitive (a file
/// lock, a row in a shared database); the guard only needs these three calls.
pub trait ArbitrationFlag: Send + Sync {
    /// Non-blocking. True when the caller now owns the flag.
    fn try_acquire(&self) -> bool;
    fn release(&self);
    fn is_held(&self) -> bool;
}

#[derive(Debug, Default)]
pub struct InMemoryFlag {
    held: AtomicBool,
}

impl ArbitrationFlag for InMemoryFlag {
    fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.held.store(false, Ordering::Release);
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}
