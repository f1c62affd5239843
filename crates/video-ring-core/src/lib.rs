//! A single-producer / multi-consumer video packet ring buffer designed to
//! live in shared memory.
//!
//! One writer process and up to [`config::MAX_READERS`] reader processes,
//! each identified by a nonzero integer id (an OS process id in the
//! reference design), exchange fixed-size packet slots without copying via
//! a two-phase begin/end access borrow protocol. See [`RingBufferShm`].

mod clock;
mod config;
mod control;
mod error;
mod ringbuffer;
mod sync;

pub use config::{RingBufferConfig, MAX_READERS, READER_TIMEOUT};
pub use error::Error;
pub use ringbuffer::{ReadBorrow, RingBufferShm, WriteBorrow};

#[cfg(test)]
pub(crate) mod test_support;
