//! Writer-preferring read/write lock for the connection registry
//!
//! Many readers or exactly one writer, never both. A writer that is waiting
//! blocks new readers, so a steady stream of lookups cannot starve an insert.
//! The fair policy of [`parking_lot::RwLock`] provides that ordering.
//!
//! Acquiring returns a guard that is also the mode token: dropping it, or
//! handing it to [`RwLock::release`], ends exactly the mode it was acquired in.
//! There is no read-to-write upgrade and no timeout; acquisition blocks.

use std::ops::{Deref, DerefMut};

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

/// A read/write lock owning the value it protects
#[derive(Debug, Default)]
pub struct RwLock<T> {
    inner: parking_lot::RwLock<T>,
}

impl<T> RwLock<T> {
    /// Create a new lock around `value`
    pub fn new(value: T) -> Self {
        Self {
            inner: parking_lot::RwLock::new(value),
        }
    }

    /// Acquire shared access, waiting behind any active or pending writer
    pub fn read(&self) -> ReadGuard<'_, T> {
        ReadGuard(self.inner.read())
    }

    /// Acquire exclusive access, waiting for current readers and any earlier writer
    pub fn write(&self) -> WriteGuard<'_, T> {
        WriteGuard(self.inner.write())
    }

    /// End the mode carried by `token`
    pub fn release<G: LockToken>(&self, token: G) {
        drop(token);
    }

    /// Consume the lock, returning the protected value
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    /// Whether a writer holds the lock or is queued for it
    #[cfg(test)]
    fn writer_pending(&self) -> bool {
        self.inner.is_locked_exclusive()
    }
}

/// Marker for the guards accepted by [`RwLock::release`]
pub trait LockToken: sealed::Sealed {}

mod sealed {
    pub trait Sealed {}
}

/// Shared access token
#[must_use = "dropping the guard releases the read lock immediately"]
pub struct ReadGuard<'a, T>(RwLockReadGuard<'a, T>);

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> sealed::Sealed for ReadGuard<'_, T> {}
impl<T> LockToken for ReadGuard<'_, T> {}

/// Exclusive access token
#[must_use = "dropping the guard releases the write lock immediately"]
pub struct WriteGuard<'a, T>(RwLockWriteGuard<'a, T>);

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T> sealed::Sealed for WriteGuard<'_, T> {}
impl<T> LockToken for WriteGuard<'_, T> {}
