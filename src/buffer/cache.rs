//! Process-local byte ring cache
//!
//! Sits between the caller and the shared ring buffer so that arbitrary
//! write/read chunk sizes can be turned into whole spans. Transfers are
//! all-or-nothing: a call either moves every requested byte or none.

use parking_lot::Mutex;

use crate::constants::MAX_CACHE_SIZE;
use crate::error::BufferError;

struct CacheInner {
    storage: Vec<u8>,
    /// Monotonic byte counters; `write - read` is the readable size
    write: u64,
    read: u64,
}

impl CacheInner {
    fn readable(&self) -> usize {
        (self.write - self.read) as usize
    }

    fn writable(&self) -> usize {
        self.storage.len() - self.readable()
    }
}

/// Circular byte buffer guarded by a single lock. Safe for one writer and
/// one reader; size snapshots may be stale by the time the next call runs.
pub struct RingCache {
    inner: Mutex<CacheInner>,
}

impl RingCache {
    pub fn create(size: usize) -> Result<Self, BufferError> {
        if size == 0 || size > MAX_CACHE_SIZE {
            return Err(BufferError::InvalidCacheSize(size));
        }
        Ok(Self {
            inner: Mutex::new(CacheInner {
                storage: vec![0; size],
                write: 0,
                read: 0,
            }),
        })
    }

    pub fn cache_size(&self) -> usize {
        self.inner.lock().storage.len()
    }

    pub fn writable_size(&self) -> usize {
        self.inner.lock().writable()
    }

    pub fn readable_size(&self) -> usize {
        self.inner.lock().readable()
    }

    /// Append all of `data`, or fail without writing anything.
    pub fn enqueue(&self, data: &[u8]) -> Result<(), BufferError> {
        let mut inner = self.inner.lock();
        let available = inner.writable();
        if data.len() > available {
            return Err(BufferError::InsufficientSpace {
                requested: data.len(),
                available,
            });
        }
        if data.is_empty() {
            return Ok(());
        }

        let size = inner.storage.len();
        let start = (inner.write % size as u64) as usize;
        let first = data.len().min(size - start);
        inner.storage[start..start + first].copy_from_slice(&data[..first]);
        inner.storage[..data.len() - first].copy_from_slice(&data[first..]);
        inner.write += data.len() as u64;
        Ok(())
    }

    /// Fill all of `out`, or fail without consuming anything.
    pub fn dequeue(&self, out: &mut [u8]) -> Result<(), BufferError> {
        let mut inner = self.inner.lock();
        let available = inner.readable();
        if out.len() > available {
            return Err(BufferError::InsufficientData {
                requested: out.len(),
                available,
            });
        }
        if out.is_empty() {
            return Ok(());
        }

        let size = inner.storage.len();
        let start = (inner.read % size as u64) as usize;
        let first = out.len().min(size - start);
        let rest = out.len() - first;
        out[..first].copy_from_slice(&inner.storage[start..start + first]);
        out[first..].copy_from_slice(&inner.storage[..rest]);
        inner.read += out.len() as u64;
        Ok(())
    }

    /// Resize the storage. With `preserve_data` the readable bytes are kept
    /// in order and must fit into `size`; without it the cache comes back
    /// empty.
    pub fn reconfig(&self, size: usize, preserve_data: bool) -> Result<(), BufferError> {
        if size == 0 || size > MAX_CACHE_SIZE {
            return Err(BufferError::InvalidCacheSize(size));
        }
        let mut inner = self.inner.lock();
        let readable = inner.readable();
        if preserve_data && readable > size {
            return Err(BufferError::InsufficientSpace {
                requested: readable,
                available: size,
            });
        }

        let mut storage = vec![0u8; size];
        let kept = if preserve_data {
            let old = inner.storage.len();
            let start = (inner.read % old as u64) as usize;
            let first = readable.min(old - start);
            storage[..first].copy_from_slice(&inner.storage[start..start + first]);
            storage[first..readable].copy_from_slice(&inner.storage[..readable - first]);
            readable
        } else {
            0
        };
        inner.storage = storage;
        inner.read = 0;
        inner.write = kept as u64;
        Ok(())
    }

    pub fn reset_buffer(&self) {
        let mut inner = self.inner.lock();
        inner.read = 0;
        inner.write = 0;
    }
}

impl std::fmt::Debug for RingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RingCache")
            .field("size", &inner.storage.len())
            .field("readable", &inner.readable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_create_bounds() {
        assert!(RingCache::create(0).is_err());
        assert!(RingCache::create(MAX_CACHE_SIZE + 1).is_err());
        let cache = RingCache::create(16).unwrap();
        assert_eq!(cache.cache_size(), 16);
        assert_eq!(cache.writable_size(), 16);
        assert_eq!(cache.readable_size(), 0);
    }

    #[test]
    fn test_all_or_nothing() {
        let cache = RingCache::create(8).unwrap();
        cache.enqueue(&[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(
            cache.enqueue(&[7, 8, 9]),
            Err(BufferError::InsufficientSpace { requested: 3, available: 2 })
        );
        assert_eq!(cache.readable_size(), 6);

        let mut out = [0u8; 7];
        assert!(cache.dequeue(&mut out).is_err());
        assert_eq!(cache.readable_size(), 6);
    }

    #[test]
    fn test_wraparound_dequeue() {
        let cache = RingCache::create(8).unwrap();
        cache.enqueue(&[0; 6]).unwrap();
        let mut skip = [0u8; 6];
        cache.dequeue(&mut skip).unwrap();

        cache.enqueue(&[1, 2, 3, 4, 5]).unwrap();
        let mut out = [0u8; 5];
        cache.dequeue(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_reconfig_preserve() {
        let cache = RingCache::create(8).unwrap();
        cache.enqueue(&[0; 6]).unwrap();
        let mut skip = [0u8; 4];
        cache.dequeue(&mut skip).unwrap();
        cache.enqueue(&[1, 2, 3, 4]).unwrap();
        // readable: [0, 0, 1, 2, 3, 4], wrapped in storage

        assert!(cache.reconfig(4, true).is_err());
        assert_eq!(cache.readable_size(), 6);

        cache.reconfig(12, true).unwrap();
        assert_eq!(cache.cache_size(), 12);
        let mut out = [0u8; 6];
        cache.dequeue(&mut out).unwrap();
        assert_eq!(out, [0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_reconfig_discard_and_reset() {
        let cache = RingCache::create(8).unwrap();
        cache.enqueue(&[9; 5]).unwrap();
        cache.reconfig(4, false).unwrap();
        assert_eq!(cache.readable_size(), 0);
        assert_eq!(cache.writable_size(), 4);

        cache.enqueue(&[1, 2]).unwrap();
        cache.reset_buffer();
        assert_eq!(cache.readable_size(), 0);
    }

    proptest! {
        #[test]
        fn prop_fifo_order(chunks in proptest::collection::vec(1usize..24, 1..40)) {
            let cache = RingCache::create(32).unwrap();
            let mut next_in = 0u8;
            let mut next_out = 0u8;
            for (i, len) in chunks.into_iter().enumerate() {
                if i % 2 == 0 {
                    let data: Vec<u8> = (0..len).map(|k| next_in.wrapping_add(k as u8)).collect();
                    if cache.enqueue(&data).is_ok() {
                        next_in = next_in.wrapping_add(len as u8);
                    }
                } else {
                    let mut out = vec![0u8; len];
                    if cache.dequeue(&mut out).is_ok() {
                        for b in out {
                            prop_assert_eq!(b, next_out);
                            next_out = next_out.wrapping_add(1);
                        }
                    }
                }
                prop_assert_eq!(cache.readable_size() + cache.writable_size(), 32);
            }
        }

        #[test]
        fn prop_enqueue_then_dequeue_returns_input(
            prefill in 0usize..32,
            data in proptest::collection::vec(any::<u8>(), 1..32),
        ) {
            let cache = RingCache::create(32).unwrap();
            let mut skip = vec![0u8; prefill];
            cache.enqueue(&skip).unwrap();
            cache.dequeue(&mut skip).unwrap();

            cache.enqueue(&data).unwrap();
            let mut out = vec![0u8; data.len()];
            cache.dequeue(&mut out).unwrap();
            prop_assert_eq!(out, data);
        }
    }
}
