use core_types::StateVersion;
use lock_order::{LockLevel, LockOrderRegistry, OrderedRwLock};

struct Slot<T> {
    value: T,
    version: StateVersion,
}

/// Optimistic-concurrency cell: every write bumps a version, and writers can
/// make their update conditional on the version they last observed.
pub struct VersionedState<T: Clone> {
    slot: OrderedRwLock<Slot<T>>,
}

impl<T: Clone> VersionedState<T> {
    pub fn new(name: &'static str, registry: &LockOrderRegistry, initial: T) -> Self {
        Self {
            slot: OrderedRwLock::new(
                LockLevel::State,
                name,
                registry,
                Slot {
                    value: initial,
                    version: StateVersion::ZERO,
                },
            ),
        }
    }

    /// Value and the version it was written at, observed together.
    pub fn read(&self) -> (T, StateVersion) {
        let slot = self.slot.read();
        (slot.value.clone(), slot.version)
    }

    pub fn version(&self) -> StateVersion {
        self.slot.read().version
    }

    pub fn write(&self, value: T) -> StateVersion {
        let mut slot = self.slot.write();
        slot.value = value;
        slot.version = slot.version.next();
        slot.version
    }

    /// Installs `value` only if nobody wrote since `expected` was read.
    /// A `false` return means re-read and retry; it is not an error.
    pub fn compare_and_swap(&self, value: T, expected: StateVersion) -> bool {
        let mut slot = self.slot.write();
        if slot.version != expected {
            return false;
        }
        slot.value = value;
        slot.version = slot.version.next();
        true
    }

    /// Read-compute-CAS loop. `f` sees the current value and returns the
    /// replacement, or `Err` to abandon the update without writing.
    ///
    /// The closure runs outside the lock and may run more than once.
    pub fn update<E, F>(&self, mut f: F) -> Result<(StateVersion, u32), E>
    where
        F: FnMut(&T) -> Result<T, E>,
    {
        let mut retries = 0u32;
        loop {
            let (current, version) = self.read();
            let next = f(&current)?;
            if self.compare_and_swap(next, version) {
                return Ok((version.next(), retries));
            }
            retries += 1;
        }
    }
}
