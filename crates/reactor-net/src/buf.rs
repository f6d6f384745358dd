//! Reference-counted byte buffer with independent reader/writer indices.
//!
//! A [`ByteBuf`] owns (or shares, via `Arc`) a growable byte region and
//! tracks `read_idx <= write_idx <= capacity <= max_capacity` against it.
//! Growth always allocates a fresh region rather than mutating a shared one
//! in place, so a retained slice taken before a grow keeps pointing at
//! live, unchanged bytes. In-place compaction is only permitted when this
//! handle is the sole owner of its region.

use std::cell::UnsafeCell;
use std::io::{self, IoSlice, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::CoreError;

struct Region {
    data: UnsafeCell<Vec<u8>>,
    /// Count of live `ByteBuf` handles sharing this region, tracked
    /// independently of `Arc::strong_count` as a debug-only leak check:
    /// every handle-creating path increments it, `ByteBuf::drop` and the
    /// region-replacement path in `grow` decrement it, and `Region::drop`
    /// asserts it reached zero before the backing allocation is freed.
    handle_count: AtomicUsize,
}

// SAFETY: region bytes are only ever mutated from the single thread that
// owns the enclosing reactor loop (see the crate's concurrency model).
// Other holders of a cloned `Arc<Region>` either hold it purely to keep
// the allocation alive (a retained slice) or are read-only views bounded
// to indices the owner guarantees are stable.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    fn new(capacity: usize) -> Self {
        Region { data: UnsafeCell::new(vec![0u8; capacity]), handle_count: AtomicUsize::new(1) }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn as_mut_vec(&self) -> &mut Vec<u8> {
        unsafe { &mut *self.data.get() }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            let remaining = self.handle_count.load(Ordering::Acquire);
            debug_assert_eq!(
                remaining, 0,
                "region dropped with {remaining} ByteBuf handle(s) still unaccounted for"
            );
        }
    }
}

/// A reference-counted, growable byte buffer.
///
/// Numeric accessors default to big-endian, matching network wire
/// convention; little-endian variants are suffixed `_le`.
pub struct ByteBuf {
    region: Arc<Region>,
    base: usize,
    read_idx: usize,
    write_idx: usize,
    capacity: usize,
    max_capacity: usize,
    read_only: bool,
}

impl std::fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBuf")
            .field("read_idx", &self.read_idx)
            .field("write_idx", &self.write_idx)
            .field("capacity", &self.capacity)
            .field("max_capacity", &self.max_capacity)
            .field("shared", &self.is_shared())
            .finish()
    }
}

const DEFAULT_MAX_CAPACITY: usize = usize::MAX >> 1;

impl ByteBuf {
    /// Allocates a new buffer of `capacity` bytes, growable up to
    /// `isize::MAX`-ish bounds.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_max(capacity, DEFAULT_MAX_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity_and_max(capacity: usize, max_capacity: usize) -> Self {
        assert!(capacity <= max_capacity, "capacity must not exceed max_capacity");
        ByteBuf {
            region: Arc::new(Region::new(capacity)),
            base: 0,
            read_idx: 0,
            write_idx: 0,
            capacity,
            max_capacity,
            read_only: false,
        }
    }

    /// Wraps `bytes` as a readable, read-only buffer (no in-place writes,
    /// no growth). Used for framing constants and test fixtures.
    #[must_use]
    pub fn from_static(bytes: &'static [u8]) -> Self {
        let len = bytes.len();
        let mut buf = ByteBuf {
            region: Arc::new(Region::new(len)),
            base: 0,
            read_idx: 0,
            write_idx: len,
            capacity: len,
            max_capacity: len,
            read_only: true,
        };
        // SAFETY: sole owner of a freshly allocated region, no aliasing possible yet.
        unsafe { buf.region.as_mut_vec()[..len].copy_from_slice(bytes) };
        buf
    }

    #[must_use]
    pub fn copy_from_slice(bytes: &[u8]) -> Self {
        let mut buf = ByteBuf::with_capacity(bytes.len());
        buf.put_slice(bytes).expect("freshly allocated buffer always has room");
        buf
    }

    #[must_use]
    pub fn readable_bytes(&self) -> usize {
        self.write_idx - self.read_idx
    }

    #[must_use]
    pub fn writable_bytes(&self) -> usize {
        self.capacity - self.write_idx
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.read_idx < self.write_idx
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.region) > 1
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[must_use]
    pub fn read_index(&self) -> usize {
        self.read_idx
    }

    #[must_use]
    pub fn write_index(&self) -> usize {
        self.write_idx
    }

    /// Moves the read index forward without copying, as a peek-then-skip.
    pub fn skip(&mut self, n: usize) -> Result<(), CoreError> {
        self.require_readable(n)?;
        self.read_idx += n;
        Ok(())
    }

    fn require_readable(&self, n: usize) -> Result<(), CoreError> {
        let available = self.readable_bytes();
        if available < n {
            return Err(CoreError::InsufficientData { requested: n, available });
        }
        Ok(())
    }

    fn vec(&self) -> &Vec<u8> {
        // SAFETY: single-writer-thread discipline; reads never race a
        // concurrent write to the same region under that discipline.
        unsafe { self.region.as_mut_vec() }
    }

    /// The current readable region as a contiguous slice.
    #[must_use]
    pub fn chunk(&self) -> &[u8] {
        let v = self.vec();
        &v[self.base + self.read_idx..self.base + self.write_idx]
    }

    /// Reads `n` bytes without advancing the read index.
    pub fn peek_slice(&self, n: usize) -> Result<&[u8], CoreError> {
        self.require_readable(n)?;
        let v = self.vec();
        Ok(&v[self.base + self.read_idx..self.base + self.read_idx + n])
    }

    /// Reads and consumes `n` bytes, copying them into a new `Vec`.
    pub fn read_vec(&mut self, n: usize) -> Result<Vec<u8>, CoreError> {
        let out = self.peek_slice(n)?.to_vec();
        self.read_idx += n;
        Ok(out)
    }

    /// Ensures at least `n` more bytes can be written without reallocating
    /// past `max_capacity`; grows the backing region if needed.
    pub fn ensure_writable(&mut self, n: usize) -> Result<(), CoreError> {
        if self.writable_bytes() >= n {
            return Ok(());
        }
        let needed = self.write_idx + n;
        if needed > self.max_capacity {
            return Err(CoreError::CapacityOverflow { max_capacity: self.max_capacity });
        }
        let new_capacity = needed.max(self.capacity.saturating_mul(2)).min(self.max_capacity);
        self.grow(new_capacity)
    }

    /// Appends bytes at the write index, growing if necessary.
    pub fn put_slice(&mut self, bytes: &[u8]) -> Result<(), CoreError> {
        if self.read_only {
            return Err(CoreError::NotWritable);
        }
        self.ensure_writable(bytes.len())?;
        // SAFETY: sole mutator under the single-writer-thread discipline.
        let v = unsafe { self.region.as_mut_vec() };
        let start = self.base + self.write_idx;
        v[start..start + bytes.len()].copy_from_slice(bytes);
        self.write_idx += bytes.len();
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> Result<(), CoreError> {
        self.put_slice(&[value])
    }

    pub fn put_u16(&mut self, value: u16) -> Result<(), CoreError> {
        self.put_slice(&value.to_be_bytes())
    }

    pub fn put_u32(&mut self, value: u32) -> Result<(), CoreError> {
        self.put_slice(&value.to_be_bytes())
    }

    pub fn put_u64(&mut self, value: u64) -> Result<(), CoreError> {
        self.put_slice(&value.to_be_bytes())
    }

    pub fn put_u16_le(&mut self, value: u16) -> Result<(), CoreError> {
        self.put_slice(&value.to_le_bytes())
    }

    pub fn put_u32_le(&mut self, value: u32) -> Result<(), CoreError> {
        self.put_slice(&value.to_le_bytes())
    }

    pub fn put_u64_le(&mut self, value: u64) -> Result<(), CoreError> {
        self.put_slice(&value.to_le_bytes())
    }

    pub fn get_u8(&mut self) -> Result<u8, CoreError> {
        Ok(self.read_vec(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, CoreError> {
        let b = self.read_vec(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, CoreError> {
        let b = self.read_vec(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, CoreError> {
        let b = self.read_vec(8)?;
        Ok(u64::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn get_u16_le(&mut self) -> Result<u16, CoreError> {
        let b = self.read_vec(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32_le(&mut self) -> Result<u32, CoreError> {
        let b = self.read_vec(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64_le(&mut self) -> Result<u64, CoreError> {
        let b = self.read_vec(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn peek_u32(&self) -> Result<u32, CoreError> {
        let b = self.peek_slice(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Returns a borrowed, read-only view of `len` bytes starting at
    /// `offset` within the readable region. Does not touch the region's
    /// reference count or this buffer's indices.
    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8], CoreError> {
        self.require_readable(offset + len)?;
        let v = self.vec();
        let start = self.base + self.read_idx + offset;
        Ok(&v[start..start + len])
    }

    /// Consumes `n` readable bytes into an independently owned [`ByteBuf`]
    /// that shares the same backing region (incrementing its reference
    /// count) rather than copying.
    pub fn read_retained_slice(&mut self, n: usize) -> Result<ByteBuf, CoreError> {
        self.require_readable(n)?;
        self.region.handle_count.fetch_add(1, Ordering::AcqRel);
        let slice = ByteBuf {
            region: Arc::clone(&self.region),
            base: self.base + self.read_idx,
            read_idx: 0,
            write_idx: n,
            capacity: n,
            max_capacity: n,
            read_only: true,
        };
        self.read_idx += n;
        Ok(slice)
    }

    /// A second handle onto the same region and the same current indices.
    /// Subsequent index movement on either handle is independent, but
    /// writes through either are visible to both (same backing bytes).
    #[must_use]
    pub fn duplicate(&self) -> ByteBuf {
        self.region.handle_count.fetch_add(1, Ordering::AcqRel);
        ByteBuf {
            region: Arc::clone(&self.region),
            base: self.base,
            read_idx: self.read_idx,
            write_idx: self.write_idx,
            capacity: self.capacity,
            max_capacity: self.max_capacity,
            read_only: self.read_only,
        }
    }

    /// Shifts unread bytes down to offset 0, reclaiming the discarded
    /// prefix. No-op if there is nothing read yet. Refuses to run while
    /// any other handle shares this region, since that handle's indices
    /// would silently point at the wrong bytes afterwards.
    pub fn discard_some_read_bytes(&mut self) -> Result<(), CoreError> {
        if self.read_idx == 0 {
            return Ok(());
        }
        if self.is_shared() {
            return Err(CoreError::NotWritable);
        }
        // SAFETY: strong_count == 1, no other handle observes this region.
        let v = unsafe { self.region.as_mut_vec() };
        let live_start = self.base + self.read_idx;
        let live_end = self.base + self.write_idx;
        v.copy_within(live_start..live_end, self.base);
        self.write_idx -= self.read_idx;
        self.read_idx = 0;
        Ok(())
    }

    /// Grows (or shrinks the logical capacity of) this buffer. Growing
    /// past the current allocation always allocates a brand new region
    /// and copies the live `[0, write_idx)` prefix, so buffers that
    /// retained a slice of the old region are unaffected.
    pub fn grow(&mut self, new_capacity: usize) -> Result<(), CoreError> {
        if new_capacity > self.max_capacity {
            return Err(CoreError::CapacityOverflow { max_capacity: self.max_capacity });
        }
        if new_capacity <= self.capacity {
            self.capacity = new_capacity;
            self.write_idx = self.write_idx.min(new_capacity);
            self.read_idx = self.read_idx.min(self.write_idx);
            return Ok(());
        }
        let mut new_region = Region::new(new_capacity);
        {
            let dst = new_region.as_mut_vec();
            let src = self.vec();
            dst[..self.write_idx].copy_from_slice(&src[self.base..self.base + self.write_idx]);
        }
        tracing::trace!(
            old_capacity = self.capacity,
            new_capacity,
            shared = self.is_shared(),
            "growing buffer region"
        );
        // This handle is moving onto `new_region`; release its claim on the
        // old one before dropping the `Arc` that referenced it.
        self.region.handle_count.fetch_sub(1, Ordering::AcqRel);
        self.region = Arc::new(new_region);
        self.base = 0;
        self.capacity = new_capacity;
        Ok(())
    }

    /// Borrows `length` readable bytes starting at `offset` as an
    /// [`IoSlice`] for vectored I/O. Caller must not grow or drop this
    /// buffer while the slice is outstanding.
    pub fn io_slice(&self, offset: usize, length: usize) -> Result<IoSlice<'_>, CoreError> {
        Ok(IoSlice::new(self.slice(offset, length)?))
    }

    /// Reads up to `max` bytes from `reader` directly into spare writable
    /// capacity, growing the buffer first if needed. Returns `Ok(0)` on
    /// EOF, same as `Read::read`.
    pub fn read_from<R: Read>(&mut self, reader: &mut R, max: usize) -> io::Result<usize> {
        self.ensure_writable(max).map_err(|e| io::Error::other(e.to_string()))?;
        // SAFETY: sole mutator under the single-writer-thread discipline.
        let v = unsafe { self.region.as_mut_vec() };
        let start = self.base + self.write_idx;
        let n = reader.read(&mut v[start..start + max])?;
        self.write_idx += n;
        Ok(n)
    }
}

impl Clone for ByteBuf {
    /// Equivalent to [`ByteBuf::duplicate`]: shares the region, copies
    /// the current indices.
    fn clone(&self) -> Self {
        self.duplicate()
    }
}

impl Drop for ByteBuf {
    fn drop(&mut self) {
        self.region.handle_count.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_get_roundtrip_be() {
        let mut buf = ByteBuf::with_capacity(16);
        buf.put_u32(0xdead_beef).unwrap();
        buf.put_u8(7).unwrap();
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.get_u32().unwrap(), 0xdead_beef);
        assert_eq!(buf.get_u8().unwrap(), 7);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn put_and_get_roundtrip_le() {
        let mut buf = ByteBuf::with_capacity(16);
        buf.put_u16_le(0xbeef).unwrap();
        buf.put_u64_le(0x0102_0304_0506_0708).unwrap();
        assert_eq!(buf.get_u16_le().unwrap(), 0xbeef);
        assert_eq!(buf.get_u64_le().unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn insufficient_data_is_reported() {
        let mut buf = ByteBuf::with_capacity(4);
        buf.put_u8(1).unwrap();
        let err = buf.get_u32().unwrap_err();
        assert!(matches!(err, CoreError::InsufficientData { requested: 4, available: 1 }));
    }

    #[test]
    fn grow_preserves_live_prefix_and_retained_slices() {
        let mut buf = ByteBuf::with_capacity(4);
        buf.put_slice(b"ab").unwrap();
        let retained = buf.read_retained_slice(1).unwrap();
        buf.put_slice(b"cdef").unwrap();
        assert_eq!(retained.chunk(), b"a");
        assert_eq!(buf.chunk(), b"bcdef");
    }

    #[test]
    fn discard_some_read_bytes_refuses_while_shared() {
        let mut buf = ByteBuf::with_capacity(8);
        buf.put_slice(b"hello").unwrap();
        buf.read_vec(2).unwrap();
        let _retained = buf.read_retained_slice(1).unwrap();
        assert!(buf.is_shared());
        let err = buf.discard_some_read_bytes().unwrap_err();
        assert!(matches!(err, CoreError::NotWritable));
    }

    #[test]
    fn discard_some_read_bytes_compacts_when_unshared() {
        let mut buf = ByteBuf::with_capacity(8);
        buf.put_slice(b"hello").unwrap();
        buf.read_vec(3).unwrap();
        buf.discard_some_read_bytes().unwrap();
        assert_eq!(buf.read_index(), 0);
        assert_eq!(buf.chunk(), b"lo");
    }

    #[test]
    fn capacity_overflow_is_reported() {
        let mut buf = ByteBuf::with_capacity_and_max(2, 4);
        assert!(matches!(
            buf.ensure_writable(8),
            Err(CoreError::CapacityOverflow { max_capacity: 4 })
        ));
    }

    #[test]
    fn read_only_buffer_rejects_writes() {
        let mut buf = ByteBuf::from_static(b"frozen");
        assert!(matches!(buf.put_u8(1), Err(CoreError::NotWritable)));
    }
}
