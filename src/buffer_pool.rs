//! Lock-free tiered buffer pool backing payload leases

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;
use kcp_core::BufferPool;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

/// One size class of recycled buffers
struct Tier {
    name: &'static str,
    pool: ArrayQueue<BytesMut>,
    buffer_size: usize,
    hits: AtomicUsize,
}

impl Tier {
    fn new(name: &'static str, max_size: usize, buffer_size: usize) -> Self {
        Self {
            name,
            pool: ArrayQueue::new(max_size),
            buffer_size,
            hits: AtomicUsize::new(0),
        }
    }

    /// Get a buffer from the tier (lock-free)
    fn get(&self) -> BytesMut {
        match self.pool.pop() {
            Some(buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => BytesMut::with_capacity(self.buffer_size),
        }
    }

    /// Return a buffer to the tier (lock-free); dropped when the tier is full
    fn put(&self, mut buf: BytesMut) {
        if buf.capacity() <= self.buffer_size * 2 {
            buf.clear();
            let _ = self.pool.push(buf);
        }
    }
}

/// Per-tier counters: `(name, hits, pooled)`
pub type TierStats = (&'static str, usize, usize);

/// [`BufferPool`] that recycles buffers in four size classes.
///
/// A released buffer goes to the largest tier it can serve, so every pooled
/// buffer holds at least its tier's size:
///   SMALL:  1024 bytes, accepts capacity 1024..=2048
///   MEDIUM: 1400 bytes, accepts capacity 1400..=2800
///   LARGE:  8192 bytes, accepts capacity 8192..=16384
///   JUMBO:  65536 bytes, accepts capacity 65536..=131072
pub struct TieredBufferPool {
    tiers: [Tier; 4],
}

impl TieredBufferPool {
    /// Create a pool holding at most `scale` x the default number of buffers
    /// per tier.
    pub fn new(scale: usize) -> Self {
        let scale = scale.max(1);
        Self {
            tiers: [
                Tier::new("small", 4000 * scale, 1024),
                Tier::new("medium", 2000 * scale, 1400),
                Tier::new("large", 1000 * scale, 8192),
                Tier::new("jumbo", 200 * scale, 65536),
            ],
        }
    }

    /// Shared process-wide pool used by [`KcpConfig::default`](crate::KcpConfig).
    pub fn global() -> Arc<dyn BufferPool> {
        static GLOBAL: LazyLock<Arc<TieredBufferPool>> =
            LazyLock::new(|| Arc::new(TieredBufferPool::new(1)));
        GLOBAL.clone()
    }

    fn tier_for_size(&self, size: usize) -> &Tier {
        match size {
            0..=1024 => &self.tiers[0],
            1025..=1400 => &self.tiers[1],
            1401..=8192 => &self.tiers[2],
            _ => &self.tiers[3],
        }
    }

    fn tier_for_capacity(&self, capacity: usize) -> Option<&Tier> {
        self.tiers
            .iter()
            .rev()
            .find(|tier| capacity >= tier.buffer_size)
    }

    /// Get buffer pool statistics for monitoring
    pub fn stats(&self) -> Vec<TierStats> {
        self.tiers
            .iter()
            .map(|tier| (tier.name, tier.hits.load(Ordering::Relaxed), tier.pool.len()))
            .collect()
    }
}

impl Default for TieredBufferPool {
    fn default() -> Self {
        Self::new(1)
    }
}

impl BufferPool for TieredBufferPool {
    fn lease(&self, size: usize) -> BytesMut {
        let mut buf = self.tier_for_size(size).get();
        if buf.capacity() < size {
            buf.reserve(size);
        }
        buf
    }

    fn release(&self, buf: BytesMut) {
        if let Some(tier) = self.tier_for_capacity(buf.capacity()) {
            tier.put(buf);
        }
    }
}

impl fmt::Debug for TieredBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TieredBufferPool")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kcp_core::BufferLease;

    #[test]
    fn test_released_buffers_are_reused() {
        let tiered = Arc::new(TieredBufferPool::new(1));
        let pool: Arc<dyn BufferPool> = tiered.clone();

        let lease = BufferLease::copy_from_slice(&pool, &[1u8; 1200]);
        drop(lease);
        assert_eq!(tiered.stats()[1], ("medium", 0, 1));

        let lease = BufferLease::new(&pool, 1300);
        assert!(lease.is_empty());
        assert_eq!(tiered.stats()[1], ("medium", 1, 0));
    }

    #[test]
    fn test_odd_sizes_are_not_pooled() {
        let tiered = TieredBufferPool::new(1);
        tiered.release(BytesMut::with_capacity(10));
        assert!(tiered.stats().iter().all(|(_, _, pooled)| *pooled == 0));
    }
}
