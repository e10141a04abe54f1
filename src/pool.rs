//! Small bounded pool of reusable frame buffers.

/// Default number of idle buffers retained by a [`BufferPool`].
pub const DEFAULT_POOL_CAPACITY: usize = 2;

/// Bounded cache of owned frame buffers.
///
/// Buffers move out on [`acquire`](Self::acquire) and back on [`recycle`](Self::recycle), so a
/// buffer is either pooled or owned by exactly one holder.
#[derive(Debug)]
pub struct BufferPool {
    idle: Vec<Vec<u8>>,
    capacity: usize,
    allocations: u64,
}

impl BufferPool {
    /// Create an empty pool retaining at most `capacity` idle buffers.
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Vec::with_capacity(capacity),
            capacity,
            allocations: 0,
        }
    }

    /// Take an idle buffer of exactly `len` bytes, allocating when none is available.
    ///
    /// Idle buffers of a different length are discarded, never resized.
    pub fn acquire(&mut self, len: usize) -> Vec<u8> {
        while let Some(buffer) = self.idle.pop() {
            if buffer.len() == len {
                return buffer;
            }
        }
        self.allocations += 1;
        vec![0u8; len]
    }

    /// Return a buffer. Buffers beyond the capacity are dropped.
    pub fn recycle(&mut self, buffer: Vec<u8>) {
        if self.idle.len() < self.capacity {
            self.idle.push(buffer);
        }
    }

    /// Number of idle buffers currently held.
    pub fn len(&self) -> usize {
        self.idle.len()
    }

    /// Whether no idle buffers are held.
    pub fn is_empty(&self) -> bool {
        self.idle.is_empty()
    }

    /// Maximum number of idle buffers retained.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total buffers allocated because the pool was empty.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}
