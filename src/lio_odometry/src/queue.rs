//! Multi-producer, single-consumer FIFO for one sensor stream.

use std::collections::VecDeque;
use std::mem;

use parking_lot::Mutex;

/// Lock-protected FIFO.
///
/// `push` may be called from any thread. `pop_all` and `try_pop` are meant
/// for the single consumer; items come out in arrival order.
#[derive(Debug)]
pub struct ConcurrentQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> Default for ConcurrentQueue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T> ConcurrentQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
    }

    /// Take every queued item, leaving the queue empty.
    pub fn pop_all(&self) -> VecDeque<T> {
        mem::take(&mut *self.items.lock())
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = ConcurrentQueue::new();
        for i in 0..5 {
            queue.push(i);
        }
        assert_eq!(queue.try_pop(), Some(0));
        assert_eq!(queue.pop_all(), VecDeque::from(vec![1, 2, 3, 4]));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_concurrent_producers_lose_nothing() {
        let queue = Arc::new(ConcurrentQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..1000 {
                        queue.push((p, i));
                    }
                })
            })
            .collect();

        let mut received = Vec::new();
        while received.len() < 4000 {
            received.extend(queue.pop_all());
            if producers.iter().all(|h| h.is_finished()) {
                received.extend(queue.pop_all());
                break;
            }
        }
        for handle in producers {
            handle.join().unwrap();
        }
        received.extend(queue.pop_all());

        assert_eq!(received.len(), 4000);
        // Per-producer order is preserved.
        for p in 0..4 {
            let seq: Vec<_> = received.iter().filter(|(q, _)| *q == p).map(|(_, i)| *i).collect();
            assert_eq!(seq, (0..1000).collect::<Vec<_>>());
        }
    }
}
