use std::sync::Arc;

use duallink_core::{I420Buffer, Resolution};
use tracing::debug;

/// Holds the I420 buffer the converter writes into.
///
/// The buffer is handed to consumers as an `Arc`. It is reused while its
/// geometry matches and nobody else holds it; otherwise a fresh one is
/// allocated.
#[derive(Debug)]
pub struct FrameBufferPool {
    buffer:      Arc<I420Buffer>,
    allocations: u64,
}

impl FrameBufferPool {
    pub fn new() -> Self {
        Self { buffer: Arc::new(I420Buffer::new(0, 0)), allocations: 0 }
    }

    /// Writable buffer of exactly `width × height`.
    pub fn acquire(&mut self, width: u32, height: u32) -> &mut I420Buffer {
        let geometry = Resolution::new(width, height);
        let mismatch = self.buffer.resolution() != geometry;
        if mismatch || Arc::get_mut(&mut self.buffer).is_none() {
            if mismatch {
                debug!("Frame buffer {} → {}", self.buffer.resolution(), geometry);
            }
            self.buffer = Arc::new(I420Buffer::new(width, height));
            self.allocations += 1;
        }
        Arc::make_mut(&mut self.buffer)
    }

    /// Shared handle to the current buffer.
    pub fn handle(&self) -> Arc<I420Buffer> {
        Arc::clone(&self.buffer)
    }

    pub fn current(&self) -> &I420Buffer {
        &self.buffer
    }

    /// Buffers allocated since creation.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }
}

impl Default for FrameBufferPool {
    fn default() -> Self {
        Self::new()
    }
}
