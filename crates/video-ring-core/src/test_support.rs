//! Shared test harness: a real mmap-backed shared region over a temp file,
//! the same way the reference design's own `TestRingBuffer` helper built one
//! for single-process testing.

use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;

use crate::{RingBufferConfig, RingBufferShm};

/// A `RingBufferShm` plus the backing tempfile, kept alive for the test.
pub(crate) struct TestRing {
    pub(crate) ring: RingBufferShm,
    _file: tempfile::NamedTempFile,
}

impl TestRing {
    pub(crate) fn new(packet_size: u32, num_buffers: u32) -> TestRing {
        let config = RingBufferConfig::new(packet_size, num_buffers);
        let file = tempfile::NamedTempFile::new().expect("failed to create temp file");
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(file.path())
            .expect("failed to reopen temp file");
        f.set_len(config.required_region_size() as u64)
            .expect("failed to size backing file");
        let mmap: MmapMut = unsafe {
            MmapOptions::new()
                .len(config.required_region_size())
                .map_mut(&f)
                .expect("failed to map region")
        };
        let ring = unsafe { RingBufferShm::init(mmap, config).expect("failed to init ring") };
        TestRing { ring, _file: file }
    }

    /// Maps a second, independent handle onto the same backing file, as a
    /// separate reader process would.
    pub(crate) fn attach(&self) -> RingBufferShm {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self._file.path())
            .expect("failed to reopen temp file for attach");
        let len = f.metadata().expect("failed to stat temp file").len();
        let mmap: MmapMut = unsafe {
            MmapOptions::new()
                .len(len as usize)
                .map_mut(&f)
                .expect("failed to map region for attach")
        };
        unsafe { RingBufferShm::attach(mmap).expect("failed to attach to ring") }
    }
}
