//! Ordered hand-off between producers and the delivery worker

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use crate::pool::PooledWrapper;

/// Why a wrapper was not enqueued; the wrapper itself went back to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    Full,
    Closed,
}

#[derive(Debug)]
struct QueueInner {
    items: VecDeque<PooledWrapper>,
    closed: bool,
}

/// Bounded FIFO of wrappers awaiting delivery
#[derive(Debug)]
pub struct CaptureQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
}

impl CaptureQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
        }
    }

    /// Append a wrapper; rejected wrappers are released on the spot
    pub fn push(&self, wrapper: PooledWrapper) -> Result<(), PushError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            return Err(PushError::Closed);
        }
        if inner.items.len() >= self.capacity {
            return Err(PushError::Full);
        }
        inner.items.push_back(wrapper);
        Ok(())
    }

    /// Move every queued wrapper, in order, to the back of `out`
    ///
    /// `out` is expected to be empty; swapping keeps both allocations alive
    /// so steady-state draining does not allocate.
    pub fn drain_into(&self, out: &mut VecDeque<PooledWrapper>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if out.is_empty() {
            std::mem::swap(&mut inner.items, out);
        } else {
            out.extend(inner.items.drain(..));
        }
    }

    /// Drop everything queued; returns how many wrappers were released
    pub fn flush(&self) -> usize {
        let drained: VecDeque<PooledWrapper> = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut inner.items)
        };
        // Released outside the queue lock
        drained.len()
    }

    /// Refuse further pushes
    pub fn close(&self) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::WrapperPool;

    fn tagged(pool: &WrapperPool, tag: u8) -> PooledWrapper {
        let mut wrapper = pool.acquire().unwrap();
        wrapper.tid = tag;
        wrapper
    }

    #[test]
    fn test_fifo_order() {
        let pool = WrapperPool::with_buffer_size(8, 16);
        let queue = CaptureQueue::new(8);
        for tag in 0..5 {
            queue.push(tagged(&pool, tag)).unwrap();
        }

        let mut out = VecDeque::new();
        queue.drain_into(&mut out);
        let tags: Vec<u8> = out.iter().map(|w| w.tid).collect();
        assert_eq!(tags, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue_releases_wrapper() {
        let pool = WrapperPool::with_buffer_size(4, 16);
        let queue = CaptureQueue::new(2);
        queue.push(tagged(&pool, 0)).unwrap();
        queue.push(tagged(&pool, 1)).unwrap();
        assert_eq!(queue.push(tagged(&pool, 2)), Err(PushError::Full));
        assert_eq!(pool.in_flight(), 2);
    }

    #[test]
    fn test_flush_and_close() {
        let pool = WrapperPool::with_buffer_size(4, 16);
        let queue = CaptureQueue::new(4);
        queue.push(tagged(&pool, 0)).unwrap();
        queue.push(tagged(&pool, 1)).unwrap();

        assert_eq!(queue.flush(), 2);
        assert_eq!(pool.available(), 4);

        queue.close();
        assert_eq!(queue.push(tagged(&pool, 3)), Err(PushError::Closed));
        assert_eq!(pool.available(), 4);
    }
}
