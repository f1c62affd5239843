//! The control block: the `#[repr(C)]` record placed at the start of the
//! shared region, plus the fixed-size reader table it embeds.
//!
//! This mirrors the reference design's `RingBufferHeader` convention
//! (a plain-data struct reached by pointer cast over the mmap base, with
//! atomics for anything read without a lock) generalized from one
//! lock-free availability array to a full reader table and borrow
//! protocol state.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};

use crate::clock::now_ns;
use crate::config::{RingBufferConfig, MAX_READERS};
use crate::sync::{RawCondvar, RawMutex};
use crate::Error;

/// A single entry in the fixed-size reader table. `id == 0` means free.
#[repr(C)]
pub(crate) struct ReaderSlot {
    pub(crate) id: AtomicI32,
    pub(crate) offset: AtomicI64,
    pub(crate) last_access_ns: AtomicU64,
    pub(crate) allowed_to_read: AtomicI64,
}

impl ReaderSlot {
    fn zero_in_place(&self) {
        self.id.store(0, Ordering::Release);
        self.offset.store(0, Ordering::Relaxed);
        self.last_access_ns.store(0, Ordering::Relaxed);
        self.allowed_to_read.store(0, Ordering::Relaxed);
    }

    fn is_live(&self) -> bool {
        self.id.load(Ordering::Acquire) != 0
    }
}

/// The control block. Lives at byte offset 0 of the shared region; slot
/// storage follows immediately after `size_of::<ControlBlock>()` bytes.
#[repr(C)]
pub(crate) struct ControlBlock {
    packet_size: AtomicU32,
    num_buffers: AtomicU32,
    initialized: AtomicU32,
    read_offset: AtomicI64,
    write_offset: AtomicI64,
    buffer_level: AtomicI64,
    write_in_progress: AtomicBool,
    allowed_to_write: AtomicI64,
    writer_last_access_ns: AtomicU64,
    read_wait_level: AtomicI64,
    write_wait_level: AtomicI64,
    pub(crate) mutex: RawMutex,
    pub(crate) mutex_readers: RawMutex,
    pub(crate) mutex_write_in_progress: RawMutex,
    pub(crate) cond_read: RawCondvar,
    pub(crate) cond_write: RawCondvar,
    readers: [ReaderSlot; MAX_READERS],
    reader_timeout_ns: AtomicU64,
}

/// Bytes occupied by the control block, i.e. the offset at which slot
/// storage begins.
pub(crate) fn control_block_size() -> usize {
    std::mem::size_of::<ControlBlock>()
}

impl ControlBlock {
    /// Interprets `base` as a control block without initializing it.
    ///
    /// # Safety
    /// `base` must point to at least `control_block_size()` bytes of valid,
    /// suitably aligned memory that outlives the returned reference.
    pub(crate) unsafe fn from_raw<'a>(base: *mut u8) -> &'a ControlBlock {
        &*(base as *const ControlBlock)
    }

    /// Initializes geometry, synchronization primitives, and the reader
    /// table in place. Must run exactly once, by the writer, before any
    /// other operation touches the region.
    ///
    /// # Safety
    /// See [`Self::from_raw`]; additionally no other process may be
    /// concurrently initializing or using this region.
    pub(crate) unsafe fn init_in_place(
        base: *mut u8,
        config: &RingBufferConfig,
    ) -> Result<(), Error> {
        if config.packet_size == 0 {
            return Err(Error::InvalidParam("packet_size must be nonzero"));
        }
        if config.num_buffers == 0 {
            return Err(Error::InvalidParam("num_buffers must be nonzero"));
        }
        if config.max_readers != MAX_READERS {
            return Err(Error::InvalidParam(
                "max_readers must equal the compiled-in reader table capacity",
            ));
        }
        if base.is_null() {
            return Err(Error::InvalidParam("dataBuf must be non-null"));
        }
        let cb = Self::from_raw(base);
        cb.mutex.init_in_place()?;
        cb.mutex_readers.init_in_place()?;
        cb.mutex_write_in_progress.init_in_place()?;
        cb.cond_read.init_in_place()?;
        cb.cond_write.init_in_place()?;
        for r in cb.readers.iter() {
            r.zero_in_place();
        }
        cb.packet_size.store(config.packet_size, Ordering::Relaxed);
        cb.num_buffers.store(config.num_buffers, Ordering::Relaxed);
        cb.read_offset.store(0, Ordering::Relaxed);
        cb.write_offset.store(0, Ordering::Relaxed);
        cb.buffer_level.store(0, Ordering::Relaxed);
        cb.write_in_progress.store(false, Ordering::Relaxed);
        cb.allowed_to_write.store(0, Ordering::Relaxed);
        cb.writer_last_access_ns.store(now_ns(), Ordering::Relaxed);
        cb.read_wait_level
            .store(config.num_buffers as i64, Ordering::Relaxed);
        cb.write_wait_level.store(0, Ordering::Relaxed);
        cb.reader_timeout_ns
            .store(config.reader_timeout.as_nanos() as u64, Ordering::Relaxed);
        // Publish last: anyone observing `initialized == 1` must see every
        // field above it.
        cb.initialized.store(1, Ordering::Release);
        Ok(())
    }

    pub(crate) fn check_initialized(&self) -> Result<(), Error> {
        if self.initialized.load(Ordering::Acquire) == 1 {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    pub(crate) fn packet_size(&self) -> u32 {
        self.packet_size.load(Ordering::Relaxed)
    }

    pub(crate) fn num_buffers(&self) -> i64 {
        self.num_buffers.load(Ordering::Relaxed) as i64
    }

    pub(crate) fn reader_timeout_ns(&self) -> u64 {
        self.reader_timeout_ns.load(Ordering::Relaxed)
    }

    pub(crate) fn read_offset(&self) -> i64 {
        self.read_offset.load(Ordering::Acquire)
    }

    pub(crate) fn write_offset(&self) -> i64 {
        self.write_offset.load(Ordering::Acquire)
    }

    pub(crate) fn buffer_level(&self) -> i64 {
        self.buffer_level.load(Ordering::Acquire)
    }

    pub(crate) fn write_wait_level(&self) -> i64 {
        self.write_wait_level.load(Ordering::Relaxed)
    }

    pub(crate) fn read_wait_level(&self) -> i64 {
        self.read_wait_level.load(Ordering::Relaxed)
    }

    pub(crate) fn set_write_wait_level(&self, v: i64) {
        self.write_wait_level.store(v, Ordering::Relaxed);
    }

    /// Sets `read_wait_level` to `min(current, candidate)`. Must be called
    /// with `mutex` held so concurrent waiters never clobber a stricter
    /// bound with a looser one.
    pub(crate) fn tighten_read_wait_level_locked(&self, candidate: i64) {
        let current = self.read_wait_level.load(Ordering::Relaxed);
        if candidate < current {
            self.read_wait_level.store(candidate, Ordering::Relaxed);
        }
    }

    pub(crate) fn stamp_writer_access(&self) {
        self.writer_last_access_ns
            .store(now_ns(), Ordering::Relaxed);
    }

    pub(crate) fn writer_last_access_ns(&self) -> u64 {
        self.writer_last_access_ns.load(Ordering::Relaxed)
    }

    /// Attempts to claim the single writer borrow. Returns `true` if this
    /// call claimed it (was previously false).
    pub(crate) fn try_claim_write_in_progress(&self) -> bool {
        self.write_in_progress
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn release_write_in_progress(&self) {
        self.write_in_progress.store(false, Ordering::Release);
    }

    pub(crate) fn set_allowed_to_write(&self, n: i64) {
        self.allowed_to_write.store(n, Ordering::Relaxed);
    }

    pub(crate) fn allowed_to_write(&self) -> i64 {
        self.allowed_to_write.load(Ordering::Relaxed)
    }

    /// Commits `n` written slots. Takes `mutex` internally.
    pub(crate) fn commit_write(&self, n: i64) -> Result<(), Error> {
        let _guard = self.mutex.lock();
        let write_offset = self.write_offset.load(Ordering::Relaxed);
        let num_buffers = self.num_buffers();
        let new_offset = if write_offset + n == num_buffers {
            0
        } else if write_offset + n > num_buffers {
            return Err(Error::InvalidParam(
                "endAccess(write): n overruns the physical end of the ring",
            ));
        } else {
            write_offset + n
        };
        self.write_offset.store(new_offset, Ordering::Release);
        self.buffer_level
            .fetch_add(n, Ordering::Release);
        Ok(())
    }

    /// Decreases `buffer_level` and advances `read_offset` to `new_read_offset`,
    /// both under `mutex`.
    pub(crate) fn advance_read_offset_locked(&self, new_read_offset: i64, delta: i64) {
        let _guard = self.mutex.lock();
        self.buffer_level.fetch_sub(delta, Ordering::Release);
        self.read_offset.store(new_read_offset, Ordering::Release);
    }

    // -- Reader table -----------------------------------------------------

    pub(crate) fn add_reader(&self, id: i32) -> Result<(), Error> {
        if id <= 0 {
            return Err(Error::InvalidParam("reader id must be a positive integer"));
        }
        let _guard = self.mutex_readers.lock();
        for slot in self.readers.iter() {
            if slot.id.load(Ordering::Relaxed) == 0 {
                slot.offset.store(self.read_offset(), Ordering::Relaxed);
                slot.last_access_ns.store(now_ns(), Ordering::Relaxed);
                slot.allowed_to_read.store(0, Ordering::Relaxed);
                slot.id.store(id, Ordering::Release);
                return Ok(());
            }
        }
        Err(Error::TooManyReaders(self.readers.len()))
    }

    pub(crate) fn remove_reader(&self, id: i32) -> Result<(), Error> {
        if id <= 0 {
            return Err(Error::InvalidParam("reader id must be a positive integer"));
        }
        let _guard = self.mutex_readers.lock();
        for slot in self.readers.iter() {
            if slot.id.load(Ordering::Relaxed) == id {
                slot.zero_in_place();
            }
        }
        Ok(())
    }

    pub(crate) fn find_reader(&self, id: i32) -> Option<&ReaderSlot> {
        self.readers
            .iter()
            .find(|s| s.id.load(Ordering::Acquire) == id)
    }

    pub(crate) fn reader_slot(&self, id: i32) -> Result<&ReaderSlot, Error> {
        self.find_reader(id).ok_or(Error::InvalidParam(
            "unknown reader id (never registered, removed, or purged)",
        ))
    }

    /// Backlog for a given reader.
    ///
    /// Deliberately does not compute `(write_offset - r.offset) mod
    /// num_buffers`: when the writer has wrapped exactly back around to a
    /// reader's own (unmoved) offset, that formula can't tell a completely
    /// full ring from a completely empty one. `buffer_level` is already
    /// maintained incrementally (never derived from a mod of offsets), the
    /// same way the writer side trusts it for free-space math, so anchoring
    /// on it plus this reader's distance from the aggregated `read_offset`
    /// sidesteps the ambiguity entirely.
    pub(crate) fn calc_reader_level(&self, r: &ReaderSlot) -> i64 {
        let buffer_level = self.buffer_level();
        let read_offset = self.read_offset();
        let offset = r.offset.load(Ordering::Acquire);
        buffer_level - (offset - read_offset)
    }

    /// Scans the reader table for the minimum live offset, resetting all
    /// live readers to 0 if that minimum has reached the physical end.
    /// Returns the real minimum (which may equal `num_buffers`, signaling a
    /// completed full lap) so the caller can account for it exactly; `None`
    /// if there are no live readers.
    pub(crate) fn update_smaller_reader_offset(&self) -> Option<i64> {
        let _guard = self.mutex_readers.lock();
        let num_buffers = self.num_buffers();
        let mut min: Option<i64> = None;
        for slot in self.readers.iter() {
            if slot.is_live() {
                let offset = slot.offset.load(Ordering::Acquire);
                min = Some(min.map_or(offset, |m: i64| m.min(offset)));
            }
        }
        if min == Some(num_buffers) {
            for slot in self.readers.iter() {
                if slot.is_live() {
                    slot.offset.store(0, Ordering::Release);
                }
            }
        }
        min
    }

    /// Recomputes and advances `read_offset` from the slowest live reader.
    /// The sole mechanism that advances `read_offset`.
    pub(crate) fn aggregate_reader_offset(&self) {
        let Some(min) = self.update_smaller_reader_offset() else {
            return;
        };
        let current = self.read_offset();
        let num_buffers = self.num_buffers();
        if min == num_buffers {
            // Every live reader just completed a full lap and was reset to
            // 0 above; account for the whole lap and wrap `read_offset`
            // with it rather than storing `num_buffers` itself.
            let delta = num_buffers - current;
            if delta != 0 {
                self.advance_read_offset_locked(0, delta);
            }
            return;
        }
        if min != current {
            let delta = min - current;
            self.advance_read_offset_locked(min, delta);
        }
    }

    /// Evicts readers idle for longer than `reader_timeout_ns`. Returns the
    /// ids of evicted readers (for logging).
    pub(crate) fn purge_unresponsive_readers(&self) -> Vec<i32> {
        let now = now_ns();
        let timeout = self.reader_timeout_ns();
        let mut evicted = Vec::new();
        let _guard = self.mutex_readers.lock();
        for slot in self.readers.iter() {
            if !slot.is_live() {
                continue;
            }
            let last_access = slot.last_access_ns.load(Ordering::Relaxed);
            if now > last_access && now - last_access > timeout {
                evicted.push(slot.id.load(Ordering::Relaxed));
                slot.zero_in_place();
            }
        }
        evicted
    }
}
