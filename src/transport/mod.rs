//! Fan-out transport between stages
//!
//! A [`Sender`] keeps the listeners connected to a stage output. Posting hands
//! the same event to every listener; each one accepts or rejects it according
//! to its own bounded queue, which is how backpressure reaches the producer.

mod event;
mod inbox;

pub use event::MediaEvent;
pub use inbox::Inbox;

use std::sync::{Arc, Mutex, PoisonError};

/// Destination of posted events
pub trait Listener<E>: Send + Sync {
    /// Take the event, or return `false` if it cannot be accepted now.
    ///
    /// Implementations that keep the event must copy or clone it.
    fn queue_event(&self, event: &E) -> bool;
}

/// Output endpoint of a stage
pub struct Sender<E> {
    listeners: Mutex<Vec<Arc<dyn Listener<E>>>>,
}

impl<E> Sender<E> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn Listener<E>>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect a listener. Connecting the same listener twice has no effect.
    pub fn connect_to(&self, listener: Arc<dyn Listener<E>>) {
        let mut listeners = self.listeners();
        if !listeners.iter().any(|l| same_listener(l, &listener)) {
            listeners.push(listener);
        }
    }

    /// Disconnect a listener by identity. Returns whether it was connected.
    pub fn disconnect<L: Listener<E> + ?Sized>(&self, listener: &Arc<L>) -> bool {
        let target = Arc::as_ptr(listener) as *const ();
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|l| Arc::as_ptr(l) as *const () != target);
        listeners.len() != before
    }

    /// Offer `event` to every listener in connection order.
    ///
    /// Returns true if at least one listener accepted it. The listener set is
    /// copied first so listeners may connect or disconnect from inside
    /// `queue_event`.
    pub fn post(&self, event: &E) -> bool {
        let snapshot = self.listeners().clone();

        let mut accepted = false;
        for listener in &snapshot {
            accepted |= listener.queue_event(event);
        }
        accepted
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    pub fn has_listeners(&self) -> bool {
        self.listener_count() > 0
    }

    pub fn clear(&self) {
        self.listeners().clear();
    }
}

impl<E> Default for Sender<E> {
    fn default() -> Self {
        Self::new()
    }
}

fn same_listener<E>(a: &Arc<dyn Listener<E>>, b: &Arc<dyn Listener<E>>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
