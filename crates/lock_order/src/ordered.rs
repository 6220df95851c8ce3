use std::ops::{Deref, DerefMut};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::level::LockLevel;
use crate::registry::{HoldMode, HoldTicket, LockOrderRegistry};

/// `parking_lot::RwLock` that participates in the global lock order.
///
/// parking_lot's RwLock is eventually fair: once a writer is queued, new
/// readers wait behind it, so a steady stream of readers cannot starve writers.
pub struct OrderedRwLock<T> {
    level: LockLevel,
    name: &'static str,
    registry: LockOrderRegistry,
    inner: RwLock<T>,
}

impl<T> OrderedRwLock<T> {
    pub fn new(level: LockLevel, name: &'static str, registry: &LockOrderRegistry, value: T) -> Self {
        Self {
            level,
            name,
            registry: registry.clone(),
            inner: RwLock::new(value),
        }
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn read(&self) -> OrderedReadGuard<'_, T> {
        self.registry.before_acquire(self.level, self.name);
        let guard = self.inner.read();
        OrderedReadGuard {
            guard,
            _ticket: self.registry.acquired(self.level, self.name, HoldMode::Shared),
        }
    }

    pub fn try_read_for(&self, timeout: Duration) -> Option<OrderedReadGuard<'_, T>> {
        self.registry.before_acquire(self.level, self.name);
        let guard = self.inner.try_read_for(timeout)?;
        Some(OrderedReadGuard {
            guard,
            _ticket: self.registry.acquired(self.level, self.name, HoldMode::Shared),
        })
    }

    pub fn write(&self) -> OrderedWriteGuard<'_, T> {
        self.registry.before_acquire(self.level, self.name);
        let guard = self.inner.write();
        OrderedWriteGuard {
            guard,
            _ticket: self
                .registry
                .acquired(self.level, self.name, HoldMode::Exclusive),
        }
    }

    pub fn try_write_for(&self, timeout: Duration) -> Option<OrderedWriteGuard<'_, T>> {
        self.registry.before_acquire(self.level, self.name);
        let guard = self.inner.try_write_for(timeout)?;
        Some(OrderedWriteGuard {
            guard,
            _ticket: self
                .registry
                .acquired(self.level, self.name, HoldMode::Exclusive),
        })
    }
}

pub struct OrderedReadGuard<'a, T> {
    guard: RwLockReadGuard<'a, T>,
    _ticket: HoldTicket,
}

impl<T> Deref for OrderedReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

pub struct OrderedWriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    _ticket: HoldTicket,
}

impl<T> Deref for OrderedWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

pub struct OrderedMutex<T> {
    level: LockLevel,
    name: &'static str,
    registry: LockOrderRegistry,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    pub fn new(level: LockLevel, name: &'static str, registry: &LockOrderRegistry, value: T) -> Self {
        Self {
            level,
            name,
            registry: registry.clone(),
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> OrderedMutexGuard<'_, T> {
        self.registry.before_acquire(self.level, self.name);
        let guard = self.inner.lock();
        OrderedMutexGuard {
            guard,
            _ticket: self
                .registry
                .acquired(self.level, self.name, HoldMode::Exclusive),
        }
    }

    pub fn try_lock_for(&self, timeout: Duration) -> Option<OrderedMutexGuard<'_, T>> {
        self.registry.before_acquire(self.level, self.name);
        let guard = self.inner.try_lock_for(timeout)?;
        Some(OrderedMutexGuard {
            guard,
            _ticket: self
                .registry
                .acquired(self.level, self.name, HoldMode::Exclusive),
        })
    }
}

pub struct OrderedMutexGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _ticket: HoldTicket,
}

impl<T> Deref for OrderedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
