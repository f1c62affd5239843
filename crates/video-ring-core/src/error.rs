use thiserror::Error;

/// An error from the ring buffer's control-block API.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    #[error("ring buffer has not been initialized")]
    NotInitialized,

    #[error("operation not allowed: a writer borrow is already in progress")]
    NotAllowed,

    #[error("reader table is full (max {0} readers)")]
    TooManyReaders(usize),

    #[error("wait timed out")]
    Timeout,

    #[error("condition variable wait failed: {0}")]
    CondWaitFailed(String),
}
