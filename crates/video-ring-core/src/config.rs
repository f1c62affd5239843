//! Configuration for a RingBufferShm.
//!
//! Geometry (`packet_size`, `num_buffers`) is the only part of this that
//! actually changes the shared-memory layout; it must be fixed once and
//! agreed on by every process that maps the region. The rest are tunables
//! with sane defaults matching the reference design.

use std::time::Duration;

/// Maximum number of concurrently registered readers.
pub const MAX_READERS: usize = 16;
/// How long a reader may go untouched before the writer purges it.
pub const READER_TIMEOUT: Duration = Duration::from_secs(2);

/// Geometry and tunables for a [`crate::RingBufferShm`].
#[derive(Debug, Clone)]
pub struct RingBufferConfig {
    /// Size, in bytes, of a single packet slot.
    pub packet_size: u32,
    /// Number of slots in the ring.
    pub num_buffers: u32,
    /// Maximum number of readers the control block's table can hold.
    pub max_readers: usize,
    /// Staleness threshold before a reader is evicted by the writer.
    pub reader_timeout: Duration,
}

impl RingBufferConfig {
    /// Constructs a config with default tunables for the given geometry.
    pub fn new(packet_size: u32, num_buffers: u32) -> Self {
        Self {
            packet_size,
            num_buffers,
            max_readers: MAX_READERS,
            reader_timeout: READER_TIMEOUT,
        }
    }

    /// Total bytes required for a shared region with this geometry,
    /// including the control block.
    pub fn required_region_size(&self) -> usize {
        crate::control::control_block_size()
            + (self.num_buffers as usize) * (self.packet_size as usize)
    }
}
