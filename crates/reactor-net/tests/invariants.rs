use proptest::prelude::*;
use reactor_net::{
    ByteBuf, CoreError, Cumulator, CumulatorStrategy, DecodeContext, FrameDecoder, WriteQueue,
    WriteQueueConfig,
};

struct LenPrefixed;

impl FrameDecoder for LenPrefixed {
    type Frame = Vec<u8>;

    fn decode(
        &mut self,
        buf: &mut ByteBuf,
        out: &mut Vec<Self::Frame>,
        _ctx: &mut DecodeContext<'_>,
    ) -> Result<(), CoreError> {
        if buf.readable_bytes() < 4 {
            return Ok(());
        }
        let len = buf.peek_u32()? as usize;
        if buf.readable_bytes() < 4 + len {
            return Ok(());
        }
        buf.get_u32()?;
        out.push(buf.read_vec(len)?);
        Ok(())
    }
}

fn frame(payload: &[u8]) -> ByteBuf {
    let mut b = ByteBuf::with_capacity(4 + payload.len());
    b.put_u32(payload.len() as u32).unwrap();
    b.put_slice(payload).unwrap();
    b
}

proptest! {
    /// `put_u32`/`get_u32` must round-trip exactly regardless of how many
    /// values are interleaved, and the buffer must end up fully drained.
    #[test]
    fn put_get_u32_roundtrip(values in proptest::collection::vec(any::<u32>(), 0..64)) {
        let mut buf = ByteBuf::with_capacity(4);
        for v in &values {
            buf.put_u32(*v).unwrap();
        }
        for v in &values {
            prop_assert_eq!(buf.get_u32().unwrap(), *v);
        }
        prop_assert_eq!(buf.readable_bytes(), 0);
    }

    /// Whatever points a length-prefixed frame's bytes are split at before
    /// being fed through `channel_read` one piece at a time, the cumulator
    /// must reassemble exactly the original frame, never early and never
    /// more than once.
    #[test]
    fn frame_split_invariance(
        payload in proptest::collection::vec(any::<u8>(), 0..2000),
        raw_splits in proptest::collection::vec(0usize..2100, 0..20),
    ) {
        let whole = frame(&payload);
        let bytes = whole.chunk().to_vec();

        let mut splits: Vec<usize> = raw_splits.into_iter().map(|p| p.min(bytes.len())).collect();
        splits.sort_unstable();
        splits.dedup();

        let mut cum = Cumulator::new(LenPrefixed, CumulatorStrategy::Merge, 16);
        let mut out = Vec::new();
        let mut prev = 0;
        for p in splits {
            if p > prev {
                cum.channel_read(ByteBuf::copy_from_slice(&bytes[prev..p]), &mut out).unwrap();
                prev = p;
            }
        }
        if prev < bytes.len() {
            cum.channel_read(ByteBuf::copy_from_slice(&bytes[prev..]), &mut out).unwrap();
        }
        prop_assert_eq!(out, vec![payload]);
    }

    /// Same invariant under the composite cumulation strategy, which takes
    /// a different internal path (deferred flattening) to the same result.
    #[test]
    fn frame_split_invariance_composite(
        payload in proptest::collection::vec(any::<u8>(), 0..2000),
        raw_splits in proptest::collection::vec(0usize..2100, 0..20),
    ) {
        let whole = frame(&payload);
        let bytes = whole.chunk().to_vec();

        let mut splits: Vec<usize> = raw_splits.into_iter().map(|p| p.min(bytes.len())).collect();
        splits.sort_unstable();
        splits.dedup();

        let mut cum = Cumulator::new(LenPrefixed, CumulatorStrategy::Composite, 16);
        let mut out = Vec::new();
        let mut prev = 0;
        for p in splits {
            if p > prev {
                cum.channel_read(ByteBuf::copy_from_slice(&bytes[prev..p]), &mut out).unwrap();
                prev = p;
            }
        }
        if prev < bytes.len() {
            cum.channel_read(ByteBuf::copy_from_slice(&bytes[prev..]), &mut out).unwrap();
        }
        prop_assert_eq!(out, vec![payload]);
    }

    /// Queuing N messages then removing exactly their combined byte count
    /// must leave the queue empty and writable, regardless of how the
    /// messages are sized or how many there are.
    #[test]
    fn write_queue_drains_to_zero(payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..200), 0..10)) {
        let mut q = WriteQueue::new(WriteQueueConfig { entry_overhead: 0, ..WriteQueueConfig::default() });
        let mut total = 0usize;
        for p in &payloads {
            q.add_message(ByteBuf::copy_from_slice(p));
            total += p.len();
        }
        q.mark_flush();
        q.remove_bytes(total);
        prop_assert_eq!(q.total_pending_bytes(), 0);
        prop_assert!(q.is_writable());
    }
}
