//! Buffer leases: pooled byte regions with single-release ownership

use bytes::BytesMut;
use std::fmt;
use std::mem;
use std::sync::Arc;

/// Source of payload buffers.
///
/// `lease` may hand out recycled memory; callers only ever read bytes they
/// have written themselves.
pub trait BufferPool: Send + Sync + fmt::Debug {
    /// Get an empty buffer with at least `size` bytes of capacity.
    fn lease(&self, size: usize) -> BytesMut;

    /// Take a buffer back. Called exactly once per leased buffer.
    fn release(&self, buf: BytesMut);
}

/// Pool that allocates every lease and lets released buffers drop.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapBufferPool;

impl BufferPool for HeapBufferPool {
    fn lease(&self, size: usize) -> BytesMut {
        BytesMut::with_capacity(size)
    }

    fn release(&self, _buf: BytesMut) {}
}

/// An owned byte region borrowed from a [`BufferPool`].
///
/// The region is returned to its pool when the lease is released or dropped,
/// whichever comes first; ownership makes a second release impossible.
/// Reads advance an internal offset so a partially consumed lease keeps
/// the rest of its bytes without copying.
pub struct BufferLease {
    buf: BytesMut,
    offset: usize,
    pool: Arc<dyn BufferPool>,
}

impl BufferLease {
    /// Lease an empty region able to hold `capacity` bytes.
    pub fn new(pool: &Arc<dyn BufferPool>, capacity: usize) -> Self {
        let mut buf = pool.lease(capacity);
        buf.clear();
        buf.reserve(capacity);
        Self {
            buf,
            offset: 0,
            pool: Arc::clone(pool),
        }
    }

    /// Lease a region and copy `data` into it.
    pub fn copy_from_slice(pool: &Arc<dyn BufferPool>, data: &[u8]) -> Self {
        let mut lease = Self::new(pool, data.len());
        lease.buf.extend_from_slice(data);
        lease
    }

    /// Unread bytes
    pub fn data(&self) -> &[u8] {
        &self.buf[self.offset..]
    }

    /// Number of unread bytes
    pub fn len(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes written so far, including the already-read prefix
    pub fn written(&self) -> usize {
        self.buf.len()
    }

    /// Mark `n` bytes as read.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.len(), "advance past the end of a lease");
        self.offset += n;
    }

    /// Append bytes to the region.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Return the region to its pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        let buf = mem::take(&mut self.buf);
        self.pool.release(buf);
    }
}

impl fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferLease")
            .field("len", &self.len())
            .field("offset", &self.offset)
            .finish()
    }
}
