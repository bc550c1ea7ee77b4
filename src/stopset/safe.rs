//! Mutex-guarded stop set shared by concurrent probe tasks.

use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{StopSet, StopSetError, StopSetParams, StopSetSnapshot};

/// Source of stable instance ids; cross-set operations lock in id order
static NEXT_SET_ID: AtomicU64 = AtomicU64::new(0);

/// A [`StopSet`] behind a single lock.
///
/// Every operation takes the lock. Operations touching two `SafeSet`s acquire
/// both locks in ascending instance-id order, so `a.union_with(&b)` racing
/// `b.union_with(&a)` cannot deadlock.
#[derive(Debug)]
pub struct SafeSet<S> {
    id: u64,
    inner: Mutex<S>,
}

impl<S: StopSet> SafeSet<S> {
    pub fn new(set: S) -> Self {
        Self {
            id: NEXT_SET_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(set),
        }
    }

    pub fn with_params(params: &StopSetParams) -> Self {
        Self::new(S::with_params(params))
    }

    pub fn from_snapshot(
        snapshot: &StopSetSnapshot,
        params: &StopSetParams,
    ) -> Result<Self, StopSetError> {
        Ok(Self::new(S::from_snapshot(snapshot, params)?))
    }

    /// Stable identifier used for lock ordering
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn add(&self, key: &str) {
        self.inner.lock().add(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().contains(key)
    }

    /// Add `key` unless present; returns true if it was newly added.
    ///
    /// Check and insert happen under one lock acquisition.
    pub fn insert_if_absent(&self, key: &str) -> bool {
        let mut set = self.inner.lock();
        if set.contains(key) {
            false
        } else {
            set.add(key);
            true
        }
    }

    /// Merge `other` into `self`, locking both in id order
    pub fn union_with(&self, other: &SafeSet<S>) -> Result<(), StopSetError> {
        if self.id == other.id {
            return Ok(());
        }
        let (mut mine, theirs) = if self.id < other.id {
            let mine = self.inner.lock();
            let theirs = other.inner.lock();
            (mine, theirs)
        } else {
            let theirs = other.inner.lock();
            let mine = self.inner.lock();
            (mine, theirs)
        };
        mine.union_with(&theirs)
    }

    pub fn union_set(&self, other: &S) -> Result<(), StopSetError> {
        self.inner.lock().union_with(other)
    }

    pub fn union_snapshot(&self, snapshot: &StopSetSnapshot) -> Result<(), StopSetError> {
        self.inner.lock().union_snapshot(snapshot)
    }

    /// Replace the contents with a snapshot. Unchanged on error.
    pub fn replace_with_snapshot(
        &self,
        snapshot: &StopSetSnapshot,
        params: &StopSetParams,
    ) -> Result<(), StopSetError> {
        let fresh = S::from_snapshot(snapshot, params)?;
        *self.inner.lock() = fresh;
        Ok(())
    }

    pub fn wipe(&self) {
        self.inner.lock().wipe();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn to_snapshot(&self) -> StopSetSnapshot {
        self.inner.lock().to_snapshot()
    }

    /// Direct access for multi-step work that must stay atomic
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.inner.lock()
    }
}
