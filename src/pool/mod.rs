//! Bounded pool of reference-counted reusable payloads
//!
//! A pool hands out [`Pooled`] handles. The payload goes back to the free-list
//! when the last handle is released, unless the pool is disposed or already
//! holds `capacity` spare items, in which case the payload is dropped and the
//! pool shrinks back towards its steady-state size.
//!
//! `total` counts every payload the pool has created and not yet dropped,
//! whether free or in use, and never exceeds `maximum`.

mod pooled;

pub use pooled::Pooled;

use crate::error::PoolError;
use crossbeam_queue::SegQueue;
use log::debug;
use pooled::Slot;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

type Factory<T> = Box<dyn Fn() -> anyhow::Result<T> + Send + Sync>;

pub(crate) struct PoolShared<T> {
    items: SegQueue<Arc<Slot<T>>>,
    /// Free-list slots reserved or filled; bounds the free-list by `capacity`
    free: AtomicUsize,
    total: AtomicUsize,
    disposed: AtomicBool,
    capacity: usize,
    maximum: usize,
    factory: Factory<T>,
}

impl<T> PoolShared<T> {
    /// How many payloads the next batch may create when `total` exist
    fn batch_room(&self, total: usize) -> usize {
        if self.maximum == 0 {
            self.capacity
        } else {
            self.maximum.saturating_sub(total).min(self.capacity)
        }
    }

    /// Create up to one batch. The first new slot goes to the caller, the
    /// rest to the free-list. `Ok(None)` means the pool is at its maximum.
    fn allocate_batch(self: &Arc<Self>) -> Result<Option<Arc<Slot<T>>>, PoolError> {
        let reserved = self
            .total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                let room = self.batch_room(total);
                (room > 0).then_some(total + room)
            });
        let room = match reserved {
            Ok(previous) => self.batch_room(previous),
            Err(_) => return Ok(None),
        };

        let mut first = None;
        for created in 0..room {
            let data = match (self.factory)() {
                Ok(data) => data,
                Err(e) => {
                    self.total.fetch_sub(room - created, Ordering::AcqRel);
                    if let Some(slot) = first {
                        self.store(slot);
                    }
                    return Err(PoolError::Allocation(e));
                }
            };
            let slot = Slot::new(data, Arc::downgrade(self));
            if first.is_none() {
                first = Some(slot);
            } else {
                self.store(slot);
            }
        }
        Ok(first)
    }

    fn take(&self) -> Option<Arc<Slot<T>>> {
        let slot = self.items.pop()?;
        self.free.fetch_sub(1, Ordering::AcqRel);
        Some(slot)
    }

    /// Put a slot on the free-list, or drop it when the pool is disposed or
    /// already holds `capacity` spare items.
    fn store(&self, slot: Arc<Slot<T>>) {
        let reserved = !self.disposed.load(Ordering::Acquire)
            && self
                .free
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |free| {
                    (free < self.capacity).then_some(free + 1)
                })
                .is_ok();
        if !reserved {
            self.total.fetch_sub(1, Ordering::AcqRel);
            return;
        }

        slot.reset();
        self.items.push(slot);

        if self.disposed.load(Ordering::Acquire) {
            self.drain();
        }
    }

    /// Called by the last handle of a slot
    pub(crate) fn give_back(&self, slot: Arc<Slot<T>>) {
        self.store(slot);
    }

    fn drain(&self) {
        while let Some(slot) = self.take() {
            self.total.fetch_sub(1, Ordering::AcqRel);
            drop(slot);
        }
    }
}

/// Thread-safe pool of reusable payloads
///
/// Cloning a `Pool` yields another handle to the same pool. The pool is
/// disposed explicitly with [`Pool::dispose`] or when its last handle drops.
pub struct Pool<T> {
    shared: Arc<PoolShared<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Pool<T> {
    /// Create a pool and allocate its first batch.
    ///
    /// `capacity` is the steady-state number of spare payloads and the batch
    /// size, and must be at least 1; `maximum` caps the total (0 means
    /// unbounded).
    pub fn new<F>(capacity: usize, maximum: usize, factory: F) -> Result<Self, PoolError>
    where
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        if capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }
        let shared = Arc::new(PoolShared {
            items: SegQueue::new(),
            free: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            capacity,
            maximum,
            factory: Box::new(factory),
        });
        if let Some(first) = shared.allocate_batch()? {
            shared.store(first);
        }

        Ok(Self { shared })
    }

    /// Take a payload out of the pool.
    ///
    /// Returns `Ok(None)` when the pool is at its maximum with no free item,
    /// or when it has been disposed. Only a failing factory is an error.
    pub fn get(&self) -> Result<Option<Pooled<T>>, PoolError> {
        loop {
            if self.shared.disposed.load(Ordering::Acquire) {
                return Ok(None);
            }
            if let Some(slot) = self.shared.take() {
                return Ok(Some(Pooled::from_slot(slot)));
            }
            match self.shared.allocate_batch()? {
                Some(slot) => return Ok(Some(Pooled::from_slot(slot))),
                None if self.shared.items.is_empty() => return Ok(None),
                None => continue,
            }
        }
    }

    /// Drop every free payload and refuse further returns. Idempotent.
    ///
    /// Items still in use keep working; releasing them later drops the
    /// payload and decrements `total`.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.drain();
        debug!(
            "Pool: disposed, {} items still in use",
            self.shared.total.load(Ordering::Acquire)
        );
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Payloads alive, free or in use
    pub fn total(&self) -> usize {
        self.shared.total.load(Ordering::Acquire)
    }

    /// Payloads on the free-list
    pub fn available(&self) -> usize {
        self.shared.items.len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn maximum(&self) -> usize {
        self.shared.maximum
    }
}

impl<T> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("total", &self.total())
            .field("available", &self.available())
            .field("capacity", &self.capacity())
            .field("maximum", &self.maximum())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
