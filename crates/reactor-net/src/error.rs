use std::io;

use thiserror::Error;

/// Errors surfaced by the buffer, write queue, cumulator and reactor.
///
/// Per the propagation policy: connection-level errors never abort the
/// process. `Io`/`Decode`/`FrameTooLarge` are meant to be reported to the
/// pipeline and then close the affected connection; `RebuildSelector` is
/// internal to the reactor's busy-spin recovery path.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("operation on closed channel")]
    ClosedChannel,

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("decoder error: {0}")]
    Decode(String),

    #[error("decoder produced output without consuming any input")]
    DecodeNoProgress,

    #[error("frame exceeds configured maximum of {max} bytes")]
    FrameTooLarge { max: usize },

    #[error("requested {requested} bytes but only {available} readable")]
    InsufficientData { requested: usize, available: usize },

    #[error("index arithmetic would exceed max_capacity ({max_capacity})")]
    CapacityOverflow { max_capacity: usize },

    #[error("buffer is shared or frozen and cannot be mutated in place")]
    NotWritable,

    #[error("write was cancelled")]
    Cancelled,

    #[error("selector rebuild failed: {0}")]
    RebuildSelector(io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
