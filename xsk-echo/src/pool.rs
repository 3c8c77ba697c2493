//! # UMEM frame pool
//!
//! Tracks which frames of the arena are free versus in flight. Every frame
//! address is, at any instant, in exactly one of: this free list, the Fill
//! ring, an RX descriptor, a TX descriptor, or the Completion ring. The pool
//! is the single source of truth for "this frame is currently owned by user
//! code"; violating that (a double free) is a logic bug and aborts.

use crate::INVALID_FRAME;

/// Stack-based free list of frame addresses.
pub struct FramePool {
    free: Vec<u64>,
    capacity: usize,
}

impl FramePool {
    /// Creates a pool with all `frame_count` frames free, addressed at
    /// multiples of `frame_size`.
    pub fn new(frame_count: usize, frame_size: usize) -> Self {
        let free = (0..frame_count)
            .map(|i| (i * frame_size) as u64)
            .collect::<Vec<_>>();
        FramePool {
            free,
            capacity: frame_count,
        }
    }

    /// Pops one free frame address, or `INVALID_FRAME` when the pool is
    /// exhausted. Never blocks; exhaustion is ordinary backpressure.
    pub fn alloc(&mut self) -> u64 {
        self.free.pop().unwrap_or(INVALID_FRAME)
    }

    /// Returns a frame to the pool.
    ///
    /// # Panics
    ///
    /// Panics when the pool would exceed its capacity or on the sentinel
    /// address; both indicate a frame-ownership violation.
    pub fn free(&mut self, addr: u64) {
        assert!(
            self.free.len() < self.capacity,
            "frame pool overflow: double free of frame {addr:#x}"
        );
        assert_ne!(addr, INVALID_FRAME, "cannot free the invalid-frame sentinel");
        self.free.push(addr);
    }

    /// Number of currently free frames.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total number of frames managed by the pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
