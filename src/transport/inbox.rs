use crossbeam_queue::ArrayQueue;

/// Bounded lock-free FIFO used by listeners to accept or reject events
pub struct Inbox<T> {
    queue: ArrayQueue<T>,
}

impl<T> Inbox<T> {
    /// Capacity is at least one
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Enqueue, handing the item back if the inbox is full
    pub fn try_push(&self, item: T) -> Result<(), T> {
        self.queue.push(item)
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Drop everything queued; returns how many items were removed
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        while self.queue.pop().is_some() {
            removed += 1;
        }
        removed
    }
}
