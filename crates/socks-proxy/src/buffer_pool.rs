//! Reusable fixed-size buffers for handshake parsing

use bytes::BytesMut;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

/// Size of every pooled buffer; large enough for any single handshake field
pub const HANDSHAKE_BUFFER_SIZE: usize = 512;

const DEFAULT_MAX_POOLED: usize = 64;

/// A thread-safe pool of zeroed, fixed-size buffers
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Mutex<Vec<BytesMut>>>,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(max_pooled: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::with_capacity(max_pooled))),
            max_pooled,
        }
    }

    /// Lease a buffer; it goes back to the pool when the lease is dropped
    pub fn acquire(&self) -> PooledBuffer<'_> {
        let buf = self
            .buffers()
            .pop()
            .unwrap_or_else(|| BytesMut::zeroed(HANDSHAKE_BUFFER_SIZE));
        PooledBuffer {
            buf: Some(buf),
            pool: self,
        }
    }

    /// Number of idle buffers held by the pool
    pub fn count(&self) -> usize {
        self.buffers().len()
    }

    fn release(&self, buf: BytesMut) {
        if buf.len() != HANDSHAKE_BUFFER_SIZE {
            return;
        }
        let mut buffers = self.buffers();
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        }
    }

    fn buffers(&self) -> MutexGuard<'_, Vec<BytesMut>> {
        // A panic while holding the lock cannot leave a Vec of buffers invalid.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_POOLED)
    }
}

/// Scoped lease of one pooled buffer
pub struct PooledBuffer<'a> {
    buf: Option<BytesMut>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_reuse() {
        let pool = BufferPool::default();
        assert_eq!(pool.count(), 0);

        {
            let mut buf = pool.acquire();
            assert_eq!(buf.len(), HANDSHAKE_BUFFER_SIZE);
            buf[..4].copy_from_slice(b"test");
        }
        assert_eq!(pool.count(), 1);

        let buf = pool.acquire();
        assert_eq!(&buf[..4], b"test");
        assert_eq!(pool.count(), 0);
    }

    #[test]
    fn test_release_on_early_return() {
        fn fails(pool: &BufferPool) -> Result<(), ()> {
            let _buf = pool.acquire();
            Err(())
        }

        let pool = BufferPool::default();
        assert!(fails(&pool).is_err());
        assert_eq!(pool.count(), 1);
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = BufferPool::new(2);
        let leases: Vec<_> = (0..4).map(|_| pool.acquire()).collect();
        drop(leases);
        assert_eq!(pool.count(), 2);
    }
}
