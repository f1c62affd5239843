//! A small writer/reader CLI built on top of `video-ring-core`.
//!
//! This crate plays the "external mapper" role the core deliberately stays
//! out of: it owns the backing file, decides how big to make it, and maps
//! it, the way the reference design's collector crate owns the mmap file
//! handed to its own core library.

pub mod config;
pub mod error;

use std::fs::OpenOptions;
use std::path::Path;
use std::time::Duration;

use memmap2::MmapOptions;
use tracing::{debug, info, warn};

pub use config::{ReaderConfig, WriterConfig};
pub use error::Error;
use video_ring_core::RingBufferShm;

/// Creates (or truncates) the backing file, sizes it for `config`'s
/// geometry, maps it, and initializes a fresh ring buffer.
pub fn open_or_create_writer(config: &WriterConfig) -> Result<RingBufferShm, Error> {
    let ring_config = config.ring_config();
    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&config.file)?;
    f.set_len(ring_config.required_region_size() as u64)?;
    let mmap = unsafe { MmapOptions::new().map_mut(&f)? };
    let ring = unsafe { RingBufferShm::init(mmap, ring_config)? };
    info!(file = %config.file, "writer initialized ring buffer");
    Ok(ring)
}

/// Opens an existing backing file and attaches to its ring buffer as a
/// reader, registering `config.reader_id`.
pub fn open_reader(config: &ReaderConfig) -> Result<RingBufferShm, Error> {
    let f = OpenOptions::new().read(true).write(true).open(&config.file)?;
    let mmap = unsafe { MmapOptions::new().map_mut(&f)? };
    let ring = unsafe { RingBufferShm::attach(mmap)? };
    ring.add_reader(config.reader_id)?;
    info!(file = %config.file, reader_id = config.reader_id, "reader attached to ring buffer");
    Ok(ring)
}

/// Waits for the file at `path` to exist, polling once a second. Readers
/// are separate processes and may start before the writer has created the
/// region.
pub fn wait_for_file(path: &str) {
    let p = Path::new(path);
    while !p.exists() {
        debug!(file = path, "waiting for backing file to appear");
        std::thread::sleep(Duration::from_secs(1));
    }
}

/// Runs the writer loop: produces `config.packet_count` synthetic packets,
/// each slot byte-filled with a counter so a reader can sanity-check
/// ordering, then exits.
pub fn run_writer(config: &WriterConfig) -> Result<(), Error> {
    let ring = open_or_create_writer(config)?;
    let mut produced: u64 = 0;
    while produced < config.packet_count {
        match ring.begin_write(1) {
            Ok(mut borrow) if borrow.granted > 0 => {
                let fill = (produced % 256) as u8;
                let granted = borrow.granted;
                borrow.data_mut().fill(fill);
                ring.end_write(borrow, granted)?;
                produced += 1;
            }
            Ok(borrow) => {
                drop(borrow);
                ring.wait_write(1, config.wait_timeout)?;
            }
            Err(video_ring_core::Error::NotAllowed) => {
                ring.wait_write(1, config.wait_timeout)?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    info!(produced, "writer finished");
    Ok(())
}

/// Runs the reader loop: consumes packets as they become available,
/// stopping after `config.packet_count` if set, otherwise running forever.
pub fn run_reader(config: &ReaderConfig) -> Result<(), Error> {
    let ring = open_reader(config)?;
    let mut consumed: u64 = 0;
    loop {
        if let Some(limit) = config.packet_count {
            if consumed >= limit {
                break;
            }
        }
        match ring.wait_read(config.reader_id, 1, config.wait_timeout) {
            Ok(()) => {
                let available = ring.available_read(config.reader_id)?;
                let borrow = ring.begin_read(config.reader_id, available)?;
                let granted = borrow.granted;
                ring.end_read(config.reader_id, borrow, granted)?;
                consumed += granted as u64;
            }
            Err(video_ring_core::Error::Timeout) => {
                warn!(reader_id = config.reader_id, "timed out waiting for data");
            }
            Err(e) => return Err(e.into()),
        }
    }
    info!(reader_id = config.reader_id, consumed, "reader finished");
    ring.remove_reader(config.reader_id)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_then_reader_round_trip() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = dir.path().join("ring.shm").to_str().unwrap().to_owned();

        let writer_config = WriterConfig {
            file: path.clone(),
            packet_size: 8,
            num_buffers: 16,
            packet_count: 5,
            wait_timeout: Duration::from_secs(1),
        };
        run_writer(&writer_config).expect("writer run failed");

        let reader_config = ReaderConfig {
            file: path,
            reader_id: 1234,
            wait_timeout: Duration::from_millis(200),
            packet_count: Some(5),
        };
        run_reader(&reader_config).expect("reader run failed");
    }
}
