//! Configuration for the ring buffer writer/reader demo.

use std::time::Duration;

use video_ring_core::RingBufferConfig;

const DEFAULT_PACKET_SIZE: u32 = 1460;
const DEFAULT_NUM_BUFFERS: u32 = 256;
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_PACKET_COUNT: u64 = 10_000;

/// Configuration for the writer subcommand.
#[derive(Debug)]
pub struct WriterConfig {
    /// Path to the backing shared-memory file. Created if absent.
    pub file: String,
    /// Bytes per packet slot.
    pub packet_size: u32,
    /// Number of slots in the ring.
    pub num_buffers: u32,
    /// How many synthetic packets to write before exiting.
    pub packet_count: u64,
    /// How long to wait for free space before giving up.
    pub wait_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            file: "video-ring.shm".to_owned(),
            packet_size: DEFAULT_PACKET_SIZE,
            num_buffers: DEFAULT_NUM_BUFFERS,
            packet_count: DEFAULT_PACKET_COUNT,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

impl WriterConfig {
    pub fn ring_config(&self) -> RingBufferConfig {
        RingBufferConfig::new(self.packet_size, self.num_buffers)
    }
}

/// Configuration for the reader subcommand.
#[derive(Debug)]
pub struct ReaderConfig {
    /// Path to the backing shared-memory file. Must already exist,
    /// initialized by a writer.
    pub file: String,
    /// This reader's id. Any positive integer works; a real deployment
    /// would use the reader process's own pid.
    pub reader_id: i32,
    /// How long to wait for new data before giving up.
    pub wait_timeout: Duration,
    /// Stop after reading this many packets. `None` reads forever.
    pub packet_count: Option<u64>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            file: "video-ring.shm".to_owned(),
            reader_id: std::process::id() as i32,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            packet_count: None,
        }
    }
}
