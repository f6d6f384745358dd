//! Non-blocking TCP transport built on `mio`: a single-threaded reactor
//! event loop, a backpressure-aware outbound write queue, a reference-
//! counted byte buffer, and a cumulating frame decoder that glues the
//! three together into a generic `FrameDecoder`-driven pipeline.

mod buf;
mod decode;
mod error;
mod queue;
mod reactor;
mod tcp;

pub use buf::ByteBuf;
pub use decode::{Cumulator, CumulatorStrategy, DecodeContext, FrameDecoder};
pub use error::CoreError;
pub use queue::{Promise, WritabilityHandle, WriteQueue, WriteQueueConfig};
pub use reactor::{Clock, PollEvent, Reactor, ReactorConfig, ReactorHandle, SystemClock};
pub use tcp::TcpStream;
