//! Reusable buffers for the datagram path, sized off the wire format.
//!
//! Two classes, both derived from the protocol constants rather than
//! guessed: a *datagram* buffer holds one MTU-bounded packet with one
//! header of slack (the same sizing rule the engine applies to its
//! scratch buffer), and a *message* buffer holds a short fragment chain
//! during delivery. Oversized messages fall back to exact allocation at
//! the call site; pooling only pays for the hot, fixed-size cases.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::LazyLock;

use arq_core::wire::consts;
use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;

/// One packet: default MTU plus one segment header of slack.
pub const DATAGRAM_CAPACITY: usize = (consts::MTU_DEF + consts::OVERHEAD) as usize;

/// A short fragment chain: eight full payloads at the default MSS.
/// Covers the common case of messages up to ~11 KB without reallocating.
pub const MESSAGE_CAPACITY: usize = 8 * (consts::MTU_DEF - consts::OVERHEAD) as usize;

/// Lock-free recycling pool for buffers of one wire-derived class.
pub struct BufferPool {
    slots: ArrayQueue<BytesMut>,
    capacity: usize,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl BufferPool {
    pub fn new(max_pooled: usize, capacity: usize) -> Self {
        Self {
            slots: ArrayQueue::new(max_pooled),
            capacity,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Pop a recycled buffer, or allocate a fresh one of the class
    /// capacity on a miss.
    pub fn get(&self) -> BytesMut {
        match self.slots.pop() {
            Some(buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.capacity)
            }
        }
    }

    /// Recycle a buffer. Only buffers still holding at least the class
    /// capacity come back; anything that shrank (split off or partially
    /// frozen) is left to the allocator, so a pooled `get` always
    /// returns a full-size buffer.
    pub fn put(&self, mut buf: BytesMut) {
        if buf.capacity() < self.capacity {
            return;
        }
        buf.clear();
        let _ = self.slots.push(buf);
    }

    /// (hits, misses, buffers currently pooled)
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.slots.len(),
        )
    }
}

static DATAGRAM: LazyLock<BufferPool> = LazyLock::new(|| BufferPool::new(1024, DATAGRAM_CAPACITY));
static MESSAGE: LazyLock<BufferPool> = LazyLock::new(|| BufferPool::new(256, MESSAGE_CAPACITY));

/// Buffer sized for one incoming or outgoing packet.
pub fn datagram() -> BytesMut {
    DATAGRAM.get()
}

/// Buffer sized for carrying one application message.
pub fn message() -> BytesMut {
    MESSAGE.get()
}

/// Return a buffer to the largest class it still satisfies; smaller
/// remnants go back to the allocator.
pub fn recycle(buf: BytesMut) {
    if buf.capacity() >= MESSAGE_CAPACITY {
        MESSAGE.put(buf);
    } else if buf.capacity() >= DATAGRAM_CAPACITY {
        DATAGRAM.put(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_follow_the_wire_constants() {
        assert_eq!(DATAGRAM_CAPACITY, 1400 + 24);
        assert_eq!(MESSAGE_CAPACITY, 8 * 1376);
    }

    #[test]
    fn buffers_are_recycled() {
        let pool = BufferPool::new(4, DATAGRAM_CAPACITY);
        let buf = pool.get();
        pool.put(buf);
        let _ = pool.get();
        let (hits, misses, _) = pool.stats();
        assert_eq!(hits, 1);
        assert_eq!(misses, 1);
    }

    #[test]
    fn shrunk_buffers_are_not_pooled() {
        let pool = BufferPool::new(4, DATAGRAM_CAPACITY);
        pool.put(BytesMut::with_capacity(DATAGRAM_CAPACITY / 2));
        assert_eq!(pool.stats().2, 0);
    }

    // Single test for the global pools so parallel test runs don't race
    // on their counters.
    #[test]
    fn recycle_dispatches_by_remaining_capacity() {
        let msg_before = MESSAGE.stats().2;
        recycle(BytesMut::with_capacity(MESSAGE_CAPACITY));
        // A buffer that grew past its class comes back to it too.
        let mut grown = BytesMut::with_capacity(MESSAGE_CAPACITY);
        grown.extend_from_slice(&vec![0u8; MESSAGE_CAPACITY + 1]);
        recycle(grown);
        assert_eq!(MESSAGE.stats().2, msg_before + 2);

        // Below the datagram class: dropped, not pooled.
        let dg_before = DATAGRAM.stats().2;
        recycle(BytesMut::with_capacity(16));
        assert_eq!(DATAGRAM.stats().2, dg_before);
    }
}
