//! Fixed-capacity ring buffer holding the most recent log lines of a process.
//!
//! Slots are preallocated once; `head` points at the oldest entry and `tail`
//! at the next free slot, both modulo capacity. Enqueueing into a full buffer
//! evicts the oldest entry first, so `len()` never exceeds `capacity()`.

/// FIFO ring buffer with oldest-first eviction.
#[derive(Debug, Clone)]
pub struct CircularBuffer<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
    len: usize,
}

impl<T> CircularBuffer<T> {
    /// Create a buffer holding at most `capacity` entries.
    ///
    /// A capacity of zero cannot hold anything useful and is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            tracing::warn!("log buffer capacity of 0 requested, clamping to 1");
            1
        } else {
            capacity
        };
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Append an entry, evicting the oldest one first when full.
    pub fn enqueue(&mut self, item: T) {
        if self.is_full() {
            self.dequeue();
        }
        self.slots[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.capacity();
        self.len += 1;
    }

    /// Remove and return the oldest entry, or `None` when empty.
    pub fn dequeue(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        item
    }

    /// Iterate oldest-to-newest without mutating the buffer.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let capacity = self.capacity();
        (0..self.len).filter_map(move |offset| {
            self.slots[(self.head + offset) % capacity].as_ref()
        })
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.head = 0;
        self.tail = 0;
        self.len = 0;
    }
}

impl<T: Clone> CircularBuffer<T> {
    /// Snapshot of the stored entries, oldest first.
    pub fn items(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

impl<T: AsRef<str>> CircularBuffer<T> {
    /// Whether any stored entry contains `needle`.
    pub fn contains_substring(&self, needle: &str) -> bool {
        self.iter().any(|entry| entry.as_ref().contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_within_capacity_keeps_order() {
        let mut buf = CircularBuffer::new(3);
        buf.enqueue(1);
        buf.enqueue(2);
        assert_eq!(buf.items(), vec![1, 2]);
        assert_eq!(buf.len(), 2);
        assert!(!buf.is_full());
    }

    #[test]
    fn test_overflow_keeps_last_capacity_items() {
        let capacity = 4;
        let mut buf = CircularBuffer::new(capacity);
        for i in 0..(capacity + 3) {
            buf.enqueue(i);
        }
        assert_eq!(buf.len(), capacity);
        assert_eq!(buf.items(), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_dequeue_on_empty_returns_none() {
        let mut buf: CircularBuffer<String> = CircularBuffer::new(2);
        assert_eq!(buf.dequeue(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_dequeue_returns_oldest_first() {
        let mut buf = CircularBuffer::new(2);
        buf.enqueue("a");
        buf.enqueue("b");
        buf.enqueue("c");
        assert_eq!(buf.dequeue(), Some("b"));
        assert_eq!(buf.dequeue(), Some("c"));
        assert_eq!(buf.dequeue(), None);
    }

    #[test]
    fn test_wraparound_after_interleaved_ops() {
        let mut buf = CircularBuffer::new(3);
        buf.enqueue(1);
        buf.enqueue(2);
        assert_eq!(buf.dequeue(), Some(1));
        buf.enqueue(3);
        buf.enqueue(4);
        buf.enqueue(5);
        assert_eq!(buf.items(), vec![3, 4, 5]);
    }

    #[test]
    fn test_items_does_not_mutate() {
        let mut buf = CircularBuffer::new(2);
        buf.enqueue(7);
        let _ = buf.items();
        let _ = buf.items();
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.dequeue(), Some(7));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut buf = CircularBuffer::new(0);
        assert_eq!(buf.capacity(), 1);
        buf.enqueue("x");
        buf.enqueue("y");
        assert_eq!(buf.items(), vec!["y"]);
    }

    #[test]
    fn test_contains_substring() {
        let mut buf = CircularBuffer::new(2);
        buf.enqueue("watching for changes".to_string());
        buf.enqueue("Watch enabled".to_string());
        assert!(buf.contains_substring("Watch enabled"));
        buf.enqueue("noise".to_string());
        buf.enqueue("more noise".to_string());
        assert!(!buf.contains_substring("Watch enabled"));
    }

    #[test]
    fn test_clear_resets() {
        let mut buf = CircularBuffer::new(2);
        buf.enqueue(1);
        buf.enqueue(2);
        buf.clear();
        assert!(buf.is_empty());
        buf.enqueue(3);
        assert_eq!(buf.items(), vec![3]);
    }
}
