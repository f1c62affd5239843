//! Errors for this crate.

use thiserror::Error;

/// An error from the ring buffer demo CLI.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    RingBuffer(#[from] video_ring_core::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Argument(#[from] clap::Error),
}
