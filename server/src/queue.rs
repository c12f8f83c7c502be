/// fixed capacity ring queue.
///
/// the blocking worker factory keeps its idle workers in one of these: the
/// factory mutex serializes producers, each worker thread only ever touches
/// its own popped slot. rejecting pushes at capacity is the mechanism that
/// retires surplus workers.
pub(crate) struct RingQueue<T> {
    items: Vec<Option<T>>,
    head: usize,
    tail: usize,
    len: usize,
}

impl<T> RingQueue<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        let mut items = Vec::with_capacity(capacity);
        items.resize_with(capacity, || None);
        Self {
            items,
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len == self.items.len()
    }

    /// append at the tail. hands the value back when the queue is full.
    pub(crate) fn push(&mut self, value: T) -> Result<(), T> {
        if self.is_full() {
            return Err(value);
        }
        self.items[self.tail] = Some(value);
        self.tail = (self.tail + 1) % self.items.len();
        self.len += 1;
        Ok(())
    }

    /// pop from the head.
    pub(crate) fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let value = self.items[self.head].take();
        self.head = (self.head + 1) % self.items.len();
        self.len -= 1;
        value
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fifo_order_with_wraparound() {
        let mut queue = RingQueue::with_capacity(3);
        for round in 0..5 {
            queue.push(round * 10).unwrap();
            queue.push(round * 10 + 1).unwrap();
            assert_eq!(queue.pop(), Some(round * 10));
            assert_eq!(queue.pop(), Some(round * 10 + 1));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn push_at_capacity_is_rejected() {
        let mut queue = RingQueue::with_capacity(2);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert!(queue.is_full());
        assert_eq!(queue.push(3), Err(3));
        assert_eq!(queue.pop(), Some(1));
        queue.push(3).unwrap();
    }
}
