//! Reusable buffer pool
//!
//! The tee reads the source through fixed-size scratch buffers that cycle
//! through a bounded pool instead of being reallocated per chunk. Invariant:
//! a buffer handed out by [`BufferPool::checkout`] is always empty; clearing
//! happens on return, before the buffer becomes visible to the next upload.

use lazy_static::lazy_static;
use parking_lot::Mutex;

/// Read-chunk size used by the tee.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on idle buffers retained by the global chunk pool.
const MAX_POOLED_CHUNKS: usize = 32;

/// Bounded pool of byte buffers of one kind (one capacity class).
pub struct BufferPool {
    capacity: usize,
    max_pooled: usize,
    bufs: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(capacity: usize, max_pooled: usize) -> Self {
        Self {
            capacity,
            max_pooled,
            bufs: Mutex::new(Vec::new()),
        }
    }

    /// Take an empty buffer with this pool's capacity.
    pub fn checkout(&self) -> Vec<u8> {
        if let Some(buf) = self.bufs.lock().pop() {
            debug_assert!(buf.is_empty());
            return buf;
        }
        Vec::with_capacity(self.capacity)
    }

    /// Return a buffer. It is cleared here; oversized pools drop instead.
    pub fn give_back(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut bufs = self.bufs.lock();
        if bufs.len() < self.max_pooled {
            bufs.push(buf);
        }
    }

    /// Number of idle buffers currently pooled.
    pub fn pooled(&self) -> usize {
        self.bufs.lock().len()
    }
}

lazy_static! {
    /// Global pool of tee read buffers.
    pub static ref CHUNK_BUFFERS: BufferPool = BufferPool::new(CHUNK_SIZE, MAX_POOLED_CHUNKS);
}
