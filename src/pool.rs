//! Fixed-capacity wrapper pool
//!
//! Every wrapper and its frame buffer is allocated up front and recycled
//! through a free stack, so the capture path does not allocate in steady
//! state. A `PooledWrapper` hands its node back when dropped, so a wrapper
//! is returned exactly once whatever happens to it.

use bytes::BytesMut;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use radio802::frame::MacAddr;
use radio802::FrameFormat;

use crate::classify::Direction;

/// One captured frame plus the metadata the consumer receives with it
#[derive(Debug)]
pub struct Wrapper {
    pub vdev_id: u8,
    /// Traffic identifier
    pub tid: u8,
    /// Delivery status code (tx completion code, 0 on rx)
    pub status: u8,
    pub format: FrameFormat,
    pub direction: Direction,
    /// Transmitter / source address of the frame
    pub src_addr: MacAddr,
    pub retries: u8,
    /// Radiotap header length at the start of `buffer`
    pub header_len: usize,
    /// Sink registration the frame was captured for
    pub generation: u64,
    /// Radiotap header followed by the frame
    pub buffer: BytesMut,
}

impl Wrapper {
    fn new(buffer_size: usize) -> Self {
        Self {
            vdev_id: 0,
            tid: 0,
            status: 0,
            format: FrameFormat::Ieee80211,
            direction: Direction::Inbound,
            src_addr: [0; 6],
            retries: 0,
            header_len: 0,
            generation: 0,
            buffer: BytesMut::with_capacity(buffer_size),
        }
    }

    /// Clear metadata and contents; the buffer keeps its capacity
    fn reset(&mut self) {
        self.vdev_id = 0;
        self.tid = 0;
        self.status = 0;
        self.format = FrameFormat::Ieee80211;
        self.direction = Direction::Inbound;
        self.src_addr = [0; 6];
        self.retries = 0;
        self.header_len = 0;
        self.generation = 0;
        self.buffer.clear();
    }

    /// Frame bytes without the radiotap header
    pub fn frame(&self) -> &[u8] {
        &self.buffer[self.header_len.min(self.buffer.len())..]
    }
}

/// Pool counters
#[derive(Debug, Default)]
pub struct PoolStats {
    acquired: AtomicU64,
    released: AtomicU64,
    exhausted: AtomicU64,
}

impl PoolStats {
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Acquire attempts that found the pool empty
    pub fn exhausted(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct PoolInner {
    free: Mutex<Vec<Wrapper>>,
    capacity: usize,
    stats: PoolStats,
}

impl PoolInner {
    fn give_back(&self, mut wrapper: Wrapper) {
        wrapper.reset();
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(free.len() < self.capacity);
        free.push(wrapper);
        self.stats.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared handle to the wrapper pool
#[derive(Debug, Clone)]
pub struct WrapperPool {
    inner: Arc<PoolInner>,
}

impl WrapperPool {
    /// Preallocate `capacity` wrappers with `DEFAULT_BUFFER_SIZE` buffers
    pub fn new(capacity: usize) -> Self {
        Self::with_buffer_size(capacity, crate::DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(capacity: usize, buffer_size: usize) -> Self {
        let free = (0..capacity).map(|_| Wrapper::new(buffer_size)).collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                capacity,
                stats: PoolStats::default(),
            }),
        }
    }

    /// Take a wrapper off the free stack; `None` when all are in flight
    pub fn acquire(&self) -> Option<PooledWrapper> {
        let wrapper = self
            .inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        match wrapper {
            Some(wrapper) => {
                self.inner.stats.acquired.fetch_add(1, Ordering::Relaxed);
                Some(PooledWrapper {
                    wrapper,
                    pool: Arc::clone(&self.inner),
                })
            }
            None => {
                self.inner.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Return a wrapper explicitly; equivalent to dropping it
    pub fn release(&self, wrapper: PooledWrapper) {
        drop(wrapper);
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn available(&self) -> usize {
        self.inner.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity() - self.available()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.inner.stats
    }
}

/// Wrapper on loan from the pool; returned on drop
pub struct PooledWrapper {
    wrapper: Wrapper,
    pool: Arc<PoolInner>,
}

impl Deref for PooledWrapper {
    type Target = Wrapper;

    fn deref(&self) -> &Wrapper {
        &self.wrapper
    }
}

impl DerefMut for PooledWrapper {
    fn deref_mut(&mut self) -> &mut Wrapper {
        &mut self.wrapper
    }
}

impl Drop for PooledWrapper {
    fn drop(&mut self) {
        // An empty BytesMut does not allocate
        let wrapper = std::mem::replace(&mut self.wrapper, Wrapper::new(0));
        self.pool.give_back(wrapper);
    }
}

impl fmt::Debug for PooledWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledWrapper")
            .field("wrapper", &self.wrapper)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_acquire_until_exhausted() {
        let pool = WrapperPool::with_buffer_size(4, 64);
        let held: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.in_flight(), 4);
        assert!(pool.acquire().is_none());
        assert_eq!(pool.stats().exhausted(), 1);

        drop(held);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.stats().released(), 4);
    }

    #[test]
    fn test_release_resets_wrapper() {
        let pool = WrapperPool::with_buffer_size(1, 64);
        let mut wrapper = pool.acquire().unwrap();
        wrapper.vdev_id = 3;
        wrapper.header_len = 2;
        wrapper.buffer.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(wrapper.frame(), &[3, 4]);
        pool.release(wrapper);

        let wrapper = pool.acquire().unwrap();
        assert_eq!(wrapper.vdev_id, 0);
        assert!(wrapper.buffer.is_empty());
        assert!(wrapper.buffer.capacity() >= 64);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = WrapperPool::with_buffer_size(8, 32);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Some(mut wrapper) = pool.acquire() {
                            wrapper.buffer.extend_from_slice(&[0xaa; 16]);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.available(), 8);
        assert_eq!(pool.stats().acquired(), pool.stats().released());
    }
}
