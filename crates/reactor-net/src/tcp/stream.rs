use std::io::{self, ErrorKind, Write};

use mio::net::TcpStream as MioTcpStream;
use mio::Interest;

use crate::buf::ByteBuf;
use crate::decode::{Cumulator, CumulatorStrategy, FrameDecoder};
use crate::error::CoreError;
use crate::queue::{Promise, WriteQueue, WriteQueueConfig};

const READ_CHUNK_SIZE: usize = 64 * 1024;
/// Matches the conservative end of the portable `IOV_MAX` range most
/// platforms guarantee for a single `writev`-style call.
const GATHER_MAX_VIEWS: usize = 1024;

/// A non-blocking TCP connection paired with its own write queue and
/// cumulating decoder. Owned and driven exclusively by the reactor's
/// loop thread.
pub struct TcpStream<D: FrameDecoder> {
    mio_stream: MioTcpStream,
    connecting: bool,
    write_queue: WriteQueue,
    cumulator: Cumulator<D>,
    interest: Interest,
    desired_interest: Option<Interest>,
}

impl<D: FrameDecoder> TcpStream<D> {
    pub(crate) fn connecting(
        mio_stream: MioTcpStream,
        decoder: D,
        strategy: CumulatorStrategy,
        discard_after_reads: u32,
        single_decode: bool,
        write_config: WriteQueueConfig,
    ) -> Self {
        TcpStream {
            mio_stream,
            connecting: true,
            write_queue: WriteQueue::new(write_config),
            cumulator: Cumulator::new(decoder, strategy, discard_after_reads, single_decode),
            interest: Interest::WRITABLE,
            desired_interest: None,
        }
    }

    pub(crate) fn connected(
        mio_stream: MioTcpStream,
        decoder: D,
        strategy: CumulatorStrategy,
        discard_after_reads: u32,
        single_decode: bool,
        write_config: WriteQueueConfig,
    ) -> Self {
        TcpStream {
            mio_stream,
            connecting: false,
            write_queue: WriteQueue::new(write_config),
            cumulator: Cumulator::new(decoder, strategy, discard_after_reads, single_decode),
            interest: Interest::READABLE,
            desired_interest: None,
        }
    }

    pub(crate) fn mio_stream_mut(&mut self) -> &mut MioTcpStream {
        &mut self.mio_stream
    }

    pub(crate) fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.mio_stream.local_addr()
    }

    pub(crate) fn current_interest(&self) -> Interest {
        self.interest
    }

    pub(crate) fn take_desired_interest(&mut self) -> Option<Interest> {
        self.desired_interest.take()
    }

    fn set_desired_interest(&mut self, interest: Interest) {
        if interest != self.interest {
            self.interest = interest;
            self.desired_interest = Some(interest);
        }
    }

    #[must_use]
    pub fn writability_handle(&self) -> crate::queue::WritabilityHandle {
        self.write_queue.handle()
    }

    /// Completes a non-blocking connect once the socket reports writable,
    /// flipping interest back to read-only.
    pub(crate) fn finish_connect_if_needed(&mut self) -> Result<(), CoreError> {
        if !self.connecting {
            return Ok(());
        }
        match self.mio_stream.take_error() {
            Ok(None) => {
                self.connecting = false;
                self.set_desired_interest(Interest::READABLE);
                Ok(())
            }
            Ok(Some(e)) | Err(e) => Err(CoreError::Io(e)),
        }
    }

    pub fn write_or_enqueue(&mut self, message: ByteBuf) -> Promise {
        let promise = self.write_queue.add_message(message);
        self.write_queue.mark_flush();
        promise
    }

    /// Drains as much of the flushed write queue as the socket will
    /// currently accept via a single vectored write per call.
    pub(crate) fn drain_writes(&mut self) -> Result<(), CoreError> {
        if self.connecting {
            return Ok(());
        }
        loop {
            if !self.write_queue.has_flushed() {
                break;
            }
            let (views, _count, total) = self.write_queue.gather_views(GATHER_MAX_VIEWS, usize::MAX);
            if total == 0 {
                drop(views);
                self.write_queue.remove_bytes(0);
                continue;
            }
            let result = self.mio_stream.write_vectored(&views);
            drop(views);
            match result {
                Ok(0) => return Err(CoreError::Io(io::Error::from(ErrorKind::WriteZero))),
                Ok(n) => {
                    self.write_queue.remove_bytes(n);
                    if n < total {
                        self.set_desired_interest(Interest::READABLE | Interest::WRITABLE);
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.set_desired_interest(Interest::READABLE | Interest::WRITABLE);
                    return Ok(());
                }
                Err(e) => return Err(CoreError::Io(e)),
            }
        }
        self.set_desired_interest(Interest::READABLE);
        Ok(())
    }

    pub(crate) fn fail_pending_writes(&mut self) {
        self.write_queue.fail_flushed("connection closed", true);
        self.write_queue.close("connection closed");
    }

    /// Reads everything currently available, feeding it through the
    /// cumulator. Returns `Ok(true)` on a clean EOF.
    pub(crate) fn read_ready(&mut self, frames: &mut Vec<D::Frame>) -> Result<bool, CoreError> {
        loop {
            let mut chunk = ByteBuf::with_capacity(READ_CHUNK_SIZE);
            match chunk.read_from(&mut self.mio_stream, READ_CHUNK_SIZE) {
                Ok(0) => {
                    self.cumulator.channel_inactive(frames)?;
                    return Ok(true);
                }
                Ok(_n) => {
                    let removal_pending = self.cumulator.channel_read(chunk, frames)?;
                    if removal_pending {
                        self.cumulator.finish_removal(frames)?;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(CoreError::Io(e)),
            }
        }
    }
}
