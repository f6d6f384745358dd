//! Cumulating decoder: accumulates inbound bytes across reads and repeatedly
//! invokes a [`FrameDecoder`] until it stops making progress.

use std::collections::VecDeque;

use crate::buf::ByteBuf;
use crate::error::CoreError;

/// Lets a decoder ask the cumulator to remove it once the current
/// `decode` call returns, draining any leftover bytes through
/// `decode_last` afterwards. Mirrors a handler requesting its own removal
/// from a pipeline while still inside a read callback.
pub struct DecodeContext<'a> {
    removal_requested: &'a mut bool,
}

impl DecodeContext<'_> {
    pub fn request_removal(&mut self) {
        *self.removal_requested = true;
    }
}

/// Application-supplied frame decoder. `decode` is invoked repeatedly
/// against the cumulated buffer until it neither consumes input nor
/// produces output.
///
/// `Send` because a reactor (and every decoder instance it owns) may be
/// moved onto a dedicated, possibly pinned, thread via
/// [`crate::Reactor::spawn_pinned`].
pub trait FrameDecoder: Send {
    type Frame;

    /// Attempts to decode zero or one frames from `buf`, pushing any
    /// decoded frame onto `out`. Must leave `buf`'s read index advanced
    /// past exactly the bytes consumed.
    fn decode(
        &mut self,
        buf: &mut ByteBuf,
        out: &mut Vec<Self::Frame>,
        ctx: &mut DecodeContext<'_>,
    ) -> Result<(), CoreError>;

    /// Invoked once when the channel is closing (or this decoder is being
    /// removed) with whatever bytes remain cumulated. Default behaviour
    /// forwards to `decode` one last time.
    fn decode_last(
        &mut self,
        buf: &mut ByteBuf,
        out: &mut Vec<Self::Frame>,
        ctx: &mut DecodeContext<'_>,
    ) -> Result<(), CoreError> {
        self.decode(buf, out, ctx)
    }

    /// If `true`, `decode` is called at most once per `channel_read`
    /// regardless of whether it left further readable bytes.
    fn is_single_decode(&self) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CumulatorStrategy {
    /// Append into (or copy into a bigger) flat buffer on every read.
    Merge,
    /// Defer combining fragments until a contiguous view is actually
    /// needed for decoding.
    Composite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DecodeState {
    Idle,
    InDecode,
    RemovalPending,
}

enum Cumulation {
    Flat(ByteBuf),
    Composite(VecDeque<ByteBuf>),
}

impl Cumulation {
    fn readable_bytes(&self) -> usize {
        match self {
            Cumulation::Flat(b) => b.readable_bytes(),
            Cumulation::Composite(q) => q.iter().map(ByteBuf::readable_bytes).sum(),
        }
    }

    /// Collapses into a single contiguous buffer. Zero-copy when there is
    /// exactly one component.
    fn into_flat(self) -> Result<ByteBuf, CoreError> {
        match self {
            Cumulation::Flat(b) => Ok(b),
            Cumulation::Composite(mut q) => {
                if q.len() == 1 {
                    return Ok(q.pop_front().unwrap());
                }
                let total: usize = q.iter().map(ByteBuf::readable_bytes).sum();
                let mut merged = ByteBuf::with_capacity(total);
                for b in &q {
                    merged.put_slice(b.chunk())?;
                }
                Ok(merged)
            }
        }
    }
}

fn merge_cumulate(mut cumulation: ByteBuf, input: ByteBuf) -> Result<ByteBuf, CoreError> {
    let needed = input.readable_bytes();
    if cumulation.is_shared() || cumulation.is_read_only() || cumulation.writable_bytes() < needed {
        let mut merged = ByteBuf::with_capacity(cumulation.readable_bytes() + needed);
        merged.put_slice(cumulation.chunk())?;
        merged.put_slice(input.chunk())?;
        Ok(merged)
    } else {
        cumulation.put_slice(input.chunk())?;
        Ok(cumulation)
    }
}

/// Drives a [`FrameDecoder`] across successive inbound reads, handling
/// buffer cumulation, periodic compaction, and decoder-initiated removal.
pub struct Cumulator<D: FrameDecoder> {
    decoder: D,
    cumulation: Option<Cumulation>,
    first_read: bool,
    num_reads_since_discard: u32,
    discard_after_reads: u32,
    strategy: CumulatorStrategy,
    state: DecodeState,
    /// Overrides `FrameDecoder::is_single_decode` when `true`; set from
    /// `ReactorConfig::single_decode`.
    force_single_decode: bool,
}

impl<D: FrameDecoder> Cumulator<D> {
    pub fn new(decoder: D, strategy: CumulatorStrategy, discard_after_reads: u32, force_single_decode: bool) -> Self {
        Cumulator {
            decoder,
            cumulation: None,
            first_read: false,
            num_reads_since_discard: 0,
            discard_after_reads,
            strategy,
            state: DecodeState::Idle,
            force_single_decode,
        }
    }

    #[must_use]
    pub fn decoder_mut(&mut self) -> &mut D {
        &mut self.decoder
    }

    #[must_use]
    pub fn actual_readable_bytes(&self) -> usize {
        self.cumulation.as_ref().map_or(0, Cumulation::readable_bytes)
    }

    /// Feeds one inbound read's worth of bytes through cumulation and
    /// decoding. Returns `true` if the decoder requested removal during
    /// this call, in which case the caller must follow up with
    /// [`Cumulator::finish_removal`].
    pub fn channel_read(&mut self, input: ByteBuf, out: &mut Vec<D::Frame>) -> Result<bool, CoreError> {
        let combined = match self.cumulation.take() {
            None => {
                self.first_read = true;
                match self.strategy {
                    CumulatorStrategy::Merge => Cumulation::Flat(input),
                    CumulatorStrategy::Composite => {
                        let mut q = VecDeque::with_capacity(2);
                        q.push_back(input);
                        Cumulation::Composite(q)
                    }
                }
            }
            Some(Cumulation::Flat(cum)) => {
                self.first_read = false;
                match self.strategy {
                    CumulatorStrategy::Merge => Cumulation::Flat(merge_cumulate(cum, input)?),
                    CumulatorStrategy::Composite => {
                        if cum.is_shared() || cum.is_read_only() {
                            Cumulation::Flat(merge_cumulate(cum, input)?)
                        } else {
                            let mut q = VecDeque::with_capacity(2);
                            q.push_back(cum);
                            q.push_back(input);
                            Cumulation::Composite(q)
                        }
                    }
                }
            }
            Some(Cumulation::Composite(mut q)) => {
                self.first_read = false;
                q.push_back(input);
                Cumulation::Composite(q)
            }
        };

        // Composite only ever pays a flattening copy right here, at the
        // point decode actually needs a contiguous view; appending a new
        // read onto an existing composite (the branches above) never
        // copies a byte.
        let mut flat = combined.into_flat()?;
        let result = self.call_decode(&mut flat, out);
        let removal_pending = matches!(self.state, DecodeState::RemovalPending);

        match result {
            Ok(()) => {
                if flat.readable_bytes() == 0 {
                    self.cumulation = None;
                    self.num_reads_since_discard = 0;
                } else {
                    self.num_reads_since_discard += 1;
                    if self.num_reads_since_discard >= self.discard_after_reads && !self.first_read {
                        self.num_reads_since_discard = 0;
                        tracing::warn!(
                            threshold = self.discard_after_reads,
                            "discarding already-read cumulation bytes after threshold reads"
                        );
                        let _ = flat.discard_some_read_bytes();
                    }
                    self.cumulation = Some(match self.strategy {
                        CumulatorStrategy::Merge => Cumulation::Flat(flat),
                        CumulatorStrategy::Composite => {
                            let mut q = VecDeque::with_capacity(2);
                            q.push_back(flat);
                            Cumulation::Composite(q)
                        }
                    });
                }
                Ok(removal_pending)
            }
            Err(e) => {
                tracing::error!(error = %e, "decode failed, discarding cumulation");
                self.cumulation = None;
                self.state = DecodeState::Idle;
                Err(e)
            }
        }
    }

    fn call_decode(&mut self, buf: &mut ByteBuf, out: &mut Vec<D::Frame>) -> Result<(), CoreError> {
        self.state = DecodeState::InDecode;
        loop {
            if buf.readable_bytes() == 0 {
                break;
            }
            let before_readable = buf.readable_bytes();
            let before_out = out.len();
            let mut removal_requested = false;
            {
                let mut ctx = DecodeContext { removal_requested: &mut removal_requested };
                self.decoder.decode(buf, out, &mut ctx)?;
            }
            if removal_requested {
                self.state = DecodeState::RemovalPending;
                break;
            }
            let consumed = before_readable - buf.readable_bytes();
            let produced = out.len() > before_out;
            if !produced && consumed == 0 {
                break;
            }
            if produced && consumed == 0 {
                return Err(CoreError::DecodeNoProgress);
            }
            if self.force_single_decode || self.decoder.is_single_decode() {
                break;
            }
        }
        if !matches!(self.state, DecodeState::RemovalPending) {
            self.state = DecodeState::Idle;
        }
        Ok(())
    }

    /// Drains whatever is left of the cumulation through `decode_last`,
    /// following up on a `channel_read` that returned `true`.
    pub fn finish_removal(&mut self, out: &mut Vec<D::Frame>) -> Result<(), CoreError> {
        self.drain_last(out)
    }

    /// Drains any leftover cumulation because the channel is closing.
    pub fn channel_inactive(&mut self, out: &mut Vec<D::Frame>) -> Result<(), CoreError> {
        self.drain_last(out)
    }

    fn drain_last(&mut self, out: &mut Vec<D::Frame>) -> Result<(), CoreError> {
        if let Some(cumulation) = self.cumulation.take() {
            let mut flat = cumulation.into_flat()?;
            let mut removal_requested = false;
            let mut ctx = DecodeContext { removal_requested: &mut removal_requested };
            self.decoder.decode_last(&mut flat, out, &mut ctx)?;
        }
        self.state = DecodeState::Idle;
        Ok(())
    }
}
