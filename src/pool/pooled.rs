use super::PoolShared;
use crate::error::PoolError;
use log::error;
use std::ops::Deref;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Weak};

/// One payload plus its shared reference count
pub(crate) struct Slot<T> {
    refs: AtomicIsize,
    /// Back-reference used only to return the slot; never keeps the pool alive
    pool: Weak<PoolShared<T>>,
    data: T,
}

impl<T> Slot<T> {
    pub(crate) fn new(data: T, pool: Weak<PoolShared<T>>) -> Arc<Self> {
        Arc::new(Self {
            refs: AtomicIsize::new(1),
            pool,
            data,
        })
    }

    /// Ready the slot for the next `get`
    pub(crate) fn reset(&self) {
        self.refs.store(1, Ordering::Release);
    }
}

/// Counted handle to a pooled payload
///
/// Every handle owns one reference. [`Pooled::try_clone`] adds a reference for
/// a new owner; [`Pooled::release`] (or dropping the handle) gives it up. The
/// last release sends the payload back to its pool, or drops it if the pool
/// refuses it.
pub struct Pooled<T> {
    slot: Option<Arc<Slot<T>>>,
}

impl<T> Pooled<T> {
    pub(crate) fn from_slot(slot: Arc<Slot<T>>) -> Self {
        Self { slot: Some(slot) }
    }

    /// Share the payload with another owner.
    pub fn try_clone(&self) -> Result<Self, PoolError> {
        let slot = self.slot.as_ref().ok_or(PoolError::AlreadyReleased)?;

        let previous = slot.refs.fetch_add(1, Ordering::AcqRel);
        if previous <= 0 {
            slot.refs.fetch_sub(1, Ordering::AcqRel);
            return Err(PoolError::UseAfterFree);
        }

        Ok(Self {
            slot: Some(Arc::clone(slot)),
        })
    }

    /// Give up this handle's reference.
    ///
    /// Releasing the same handle twice is an error and leaves the shared
    /// count untouched.
    pub fn release(&mut self) -> Result<(), PoolError> {
        let slot = self.slot.take().ok_or(PoolError::AlreadyReleased)?;

        let remaining = slot.refs.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining < 0 {
            slot.refs.fetch_add(1, Ordering::AcqRel);
            return Err(PoolError::RefCountUnderflow);
        }

        if remaining == 0 {
            match slot.pool.upgrade() {
                Some(pool) => pool.give_back(slot),
                // detached: the payload drops with the slot
                None => drop(slot),
            }
        }
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.slot.is_none()
    }

    /// Current shared count, 0 once this handle is released
    pub fn ref_count(&self) -> isize {
        self.slot
            .as_ref()
            .map_or(0, |slot| slot.refs.load(Ordering::Acquire))
    }

    /// The payload, unless this handle was released
    pub fn get(&self) -> Option<&T> {
        self.slot.as_deref().map(|slot| &slot.data)
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    /// # Panics
    ///
    /// Panics if the handle was already released.
    fn deref(&self) -> &T {
        match self.get() {
            Some(data) => data,
            None => panic!("pooled item used after release"),
        }
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if self.slot.is_some()
            && let Err(e) = self.release()
        {
            error!("Pooled: release on drop failed: {}", e);
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.slot {
            Some(slot) => f
                .debug_struct("Pooled")
                .field("refs", &slot.refs.load(Ordering::Relaxed))
                .field("data", &slot.data)
                .finish(),
            None => f.write_str("Pooled(released)"),
        }
    }
}
