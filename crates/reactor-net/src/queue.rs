//! Outbound write queue: entries queued by application code accumulate on
//! an unflushed side; `mark_flush` promotes them to a flushed side the
//! reactor drains via vectored writes. Backpressure is tracked with an
//! atomic bit mask so other threads can observe writability without
//! touching the queue itself.

use std::cell::Cell;
use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::buf::ByteBuf;
use crate::error::CoreError;

const PENDING: u8 = 0;
const PROMOTED: u8 = 1;
const CANCELLED: u8 = 2;
const FIRED: u8 = 3;

const WATER_MARK_BIT: u32 = 1;

struct PromiseInner {
    state: AtomicU8,
    callbacks: std::sync::Mutex<Callbacks>,
}

#[derive(Default)]
struct Callbacks {
    on_complete: Option<Box<dyn FnOnce(Result<(), CoreError>) + Send>>,
    on_progress: Option<Box<dyn FnMut(u64, u64) + Send>>,
}

/// A cancellable, observable completion token for one queued write.
#[derive(Clone)]
pub struct Promise(Arc<PromiseInner>);

impl Promise {
    #[must_use]
    pub fn new() -> Self {
        Promise(Arc::new(PromiseInner {
            state: AtomicU8::new(PENDING),
            callbacks: std::sync::Mutex::new(Callbacks::default()),
        }))
    }

    /// Cancels the write, provided it has not yet been promoted by
    /// `mark_flush` or already completed. Safe to call from any thread.
    pub fn try_cancel(&self) -> bool {
        self.0.state.compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Returns `true` if this token was already cancelled, in which case
    /// cancellation remains final; otherwise disables future cancellation.
    fn promote(&self) -> bool {
        match self.0.state.compare_exchange(PENDING, PROMOTED, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => false,
            Err(CANCELLED) => true,
            Err(_) => false,
        }
    }

    pub fn on_complete(&self, f: impl FnOnce(Result<(), CoreError>) + Send + 'static) {
        self.0.callbacks.lock().unwrap().on_complete = Some(Box::new(f));
    }

    pub fn on_progress(&self, f: impl FnMut(u64, u64) + Send + 'static) {
        self.0.callbacks.lock().unwrap().on_progress = Some(Box::new(f));
    }

    fn fire_progress(&self, written: u64, total: u64) {
        if let Some(cb) = self.0.callbacks.lock().unwrap().on_progress.as_mut() {
            cb(written, total);
        }
    }

    fn fire_complete(&self, result: Result<(), CoreError>) {
        self.0.state.store(FIRED, Ordering::Release);
        if let Some(cb) = self.0.callbacks.lock().unwrap().on_complete.take() {
            cb(result);
        }
    }
}

impl Default for Promise {
    fn default() -> Self {
        Promise::new()
    }
}

struct WriteEntry {
    message: ByteBuf,
    progress: usize,
    total_bytes: usize,
    promise: Promise,
    cancelled: bool,
    /// `(progress, remaining)` as of the last `gather_views` call, so a
    /// retry after a partial write that didn't touch this entry can skip
    /// recomputing it.
    cached_view: Cell<Option<(usize, usize)>>,
}

impl WriteEntry {
    fn remaining(&self) -> usize {
        self.total_bytes - self.progress
    }
}

#[derive(Clone, Copy, Debug)]
pub struct WriteQueueConfig {
    pub entry_overhead: usize,
    pub high_water_mark: usize,
    pub low_water_mark: usize,
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        WriteQueueConfig { entry_overhead: 96, high_water_mark: 64 * 1024, low_water_mark: 32 * 1024 }
    }
}

/// A cross-thread-safe handle onto a queue's writability state.
#[derive(Clone)]
pub struct WritabilityHandle {
    unwritable_bits: Arc<AtomicU32>,
}

impl WritabilityHandle {
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.unwritable_bits.load(Ordering::Acquire) == 0
    }

    /// Sets or clears a user-defined backpressure bit (1..=31). Returns
    /// whether overall writability changed as a result. Intended for
    /// signalling flow-control from outside the loop thread; if the
    /// caller needs to react to the transition it should post a task back
    /// to the reactor rather than doing heavy work here.
    pub fn set_user_bit(&self, bit: u32, set: bool) -> bool {
        assert!((1..32).contains(&bit), "bit 0 is reserved for the water-mark state");
        let mask = 1u32 << bit;
        let mut prev = self.unwritable_bits.load(Ordering::Acquire);
        loop {
            let next = if set { prev | mask } else { prev & !mask };
            match self.unwritable_bits.compare_exchange_weak(
                prev,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return (prev == 0) != (next == 0),
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Outbound message queue for one connection. `add_message` is called on
/// the loop thread (or via a task submitted to it); flushing and
/// draining happen on the loop thread only.
pub struct WriteQueue {
    unflushed: VecDeque<WriteEntry>,
    flushed: VecDeque<WriteEntry>,
    total_pending_bytes: Arc<AtomicUsize>,
    unwritable_bits: Arc<AtomicU32>,
    config: WriteQueueConfig,
    closed: bool,
    in_fail: bool,
}

impl WriteQueue {
    #[must_use]
    pub fn new(config: WriteQueueConfig) -> Self {
        WriteQueue {
            unflushed: VecDeque::new(),
            flushed: VecDeque::new(),
            total_pending_bytes: Arc::new(AtomicUsize::new(0)),
            unwritable_bits: Arc::new(AtomicU32::new(0)),
            config,
            closed: false,
            in_fail: false,
        }
    }

    #[must_use]
    pub fn handle(&self) -> WritabilityHandle {
        WritabilityHandle { unwritable_bits: Arc::clone(&self.unwritable_bits) }
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.unwritable_bits.load(Ordering::Acquire) == 0
    }

    #[must_use]
    pub fn total_pending_bytes(&self) -> usize {
        self.total_pending_bytes.load(Ordering::Acquire)
    }

    /// Enqueues a message for later flushing. Returns its completion
    /// token. `message.readable_bytes() + entry_overhead` is added to the
    /// running pending-byte total; crossing `high_water_mark` clears bit 0
    /// (marks unwritable).
    pub fn add_message(&mut self, message: ByteBuf) -> Promise {
        let promise = Promise::new();
        let total_bytes = message.readable_bytes() + self.config.entry_overhead;
        self.unflushed.push_back(WriteEntry {
            message,
            progress: 0,
            total_bytes,
            promise: promise.clone(),
            cancelled: false,
            cached_view: Cell::new(None),
        });
        self.add_pending(total_bytes);
        promise
    }

    fn add_pending(&self, n: usize) {
        let prev = self.total_pending_bytes.fetch_add(n, Ordering::AcqRel);
        let now = prev + n;
        if prev <= self.config.high_water_mark && now > self.config.high_water_mark {
            self.set_bit(WATER_MARK_BIT, true);
        }
    }

    fn sub_pending(&self, n: usize) {
        let prev = self.total_pending_bytes.fetch_sub(n, Ordering::AcqRel);
        let now = prev.saturating_sub(n);
        if prev >= self.config.low_water_mark && now < self.config.low_water_mark {
            self.set_bit(WATER_MARK_BIT, false);
        }
    }

    fn set_bit(&self, bit: u32, set: bool) -> bool {
        let mask = 1u32 << bit;
        let mut prev = self.unwritable_bits.load(Ordering::Acquire);
        loop {
            let next = if set { prev | mask } else { prev & !mask };
            if next == prev {
                return false;
            }
            match self.unwritable_bits.compare_exchange_weak(
                prev,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return (prev == 0) != (next == 0),
                Err(actual) => prev = actual,
            }
        }
    }

    /// Promotes every unflushed entry to the flushed side. Entries
    /// cancelled before promotion have their pending-byte contribution
    /// removed and become zero-length no-op writes; entries cancelled
    /// after this call remain flushed (cancellation is ignored post
    /// promotion).
    pub fn mark_flush(&mut self) {
        while let Some(mut entry) = self.unflushed.pop_front() {
            if entry.promise.promote() {
                self.sub_pending(entry.remaining());
                entry.cancelled = true;
                entry.progress = entry.total_bytes;
            }
            self.flushed.push_back(entry);
        }
    }

    /// `true` whenever there is anything at all on the flushed side,
    /// cancelled or not: a run of leading cancelled entries still needs a
    /// `remove_bytes(0)` pass to pop them and fire their promises.
    #[must_use]
    pub fn has_flushed(&self) -> bool {
        !self.flushed.is_empty()
    }

    /// The first flushed entry's message and how many of its bytes have
    /// already been written, i.e. the write currently in flight.
    #[must_use]
    pub fn current(&self) -> Option<&ByteBuf> {
        self.flushed.front().map(|e| &e.message)
    }

    #[must_use]
    pub fn current_progress(&self) -> Option<usize> {
        self.flushed.front().map(|e| e.progress)
    }

    /// Borrowed gather views over the flushed, non-cancelled entries'
    /// remaining bytes, for a single `writev`-style call. Walks
    /// `flushed` front-to-back, stopping once either `max_count` views
    /// have been collected or the next entry would push the running
    /// total past `max_bytes` — except the very first entry is always
    /// included, so a single oversized message can never stall the queue
    /// forever. Returns `(views, count, total_bytes)`.
    pub fn gather_views(&self, max_count: usize, max_bytes: usize) -> (Vec<IoSlice<'_>>, usize, usize) {
        let mut views = Vec::with_capacity(self.flushed.len().min(max_count.max(1)));
        let mut total_bytes = 0usize;
        let mut count = 0usize;
        for entry in &self.flushed {
            if entry.cancelled {
                continue;
            }
            let remaining = entry.message.readable_bytes() - entry.progress;
            if remaining == 0 {
                continue;
            }
            if count > 0 && (count >= max_count || total_bytes + remaining > max_bytes) {
                break;
            }
            entry.cached_view.set(Some((entry.progress, remaining)));
            if let Ok(slice) = entry.message.io_slice(entry.progress, remaining) {
                views.push(slice);
                total_bytes += remaining;
                count += 1;
            }
        }
        (views, count, total_bytes)
    }

    /// Records that `n` bytes were written by the caller (typically the
    /// return value of a `write_vectored` call), advancing entries in
    /// order, firing progress/completion callbacks, and accounting for
    /// cancelled no-op entries along the way.
    pub fn remove_bytes(&mut self, mut n: usize) {
        while let Some(entry) = self.flushed.front_mut() {
            if entry.cancelled {
                let entry = self.flushed.pop_front().unwrap();
                entry.promise.fire_complete(Err(CoreError::Cancelled));
                continue;
            }
            let payload_remaining = entry.message.readable_bytes() - entry.progress;
            if n < payload_remaining {
                entry.progress += n;
                self.sub_pending(n);
                entry.promise.fire_progress(entry.progress as u64, entry.message.readable_bytes() as u64);
                return;
            }
            n -= payload_remaining;
            let consumed = entry.total_bytes - entry.progress;
            entry.progress = entry.total_bytes;
            self.sub_pending(consumed);
            let entry = self.flushed.pop_front().unwrap();
            entry.promise.fire_complete(Ok(()));
            if n == 0 {
                return;
            }
        }
    }

    /// Removes every flushed entry, firing failure on each completion
    /// token (only if `notify`). Reentrancy-guarded by `in_fail`, since a
    /// completion callback that itself touches this queue would otherwise
    /// re-enter the drain it's still running inside of.
    pub fn fail_flushed(&mut self, cause: &'static str, notify: bool) {
        if self.in_fail {
            return;
        }
        self.in_fail = true;
        let failed = self.flushed.len();
        while let Some(entry) = self.flushed.pop_front() {
            if !entry.cancelled {
                self.sub_pending(entry.remaining());
            }
            if notify {
                let result = if entry.cancelled {
                    Err(CoreError::Cancelled)
                } else {
                    Err(CoreError::Decode(cause.to_string()))
                };
                entry.promise.fire_complete(result);
            }
        }
        if failed > 0 {
            tracing::warn!(cause, failed, "failed flushed write queue entries");
        }
        self.in_fail = false;
    }

    /// Releases every remaining unflushed entry with a failure
    /// notification, decrementing `total_pending_bytes` directly rather
    /// than through `sub_pending` so this does not re-trigger a
    /// low-water-mark writability transition on an already-dead
    /// connection. Must only be called once `flushed` is empty.
    pub fn close(&mut self, cause: &'static str) {
        debug_assert!(self.flushed.is_empty(), "close called with flushed writes still pending");
        let failed = self.unflushed.len();
        while let Some(entry) = self.unflushed.pop_front() {
            if !entry.cancelled {
                self.total_pending_bytes.fetch_sub(entry.remaining(), Ordering::AcqRel);
            }
            let result =
                if entry.cancelled { Err(CoreError::Cancelled) } else { Err(CoreError::Decode(cause.to_string())) };
            entry.promise.fire_complete(result);
        }
        if failed > 0 {
            tracing::warn!(cause, failed, "closed write queue, failing unflushed entries");
        }
        self.closed = true;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crossing_high_water_mark_marks_unwritable() {
        let mut q = WriteQueue::new(WriteQueueConfig {
            entry_overhead: 0,
            high_water_mark: 10,
            low_water_mark: 4,
        });
        assert!(q.is_writable());
        q.add_message(ByteBuf::copy_from_slice(&[0u8; 20]));
        assert!(!q.is_writable());
    }

    #[test]
    fn draining_below_low_water_mark_restores_writability() {
        let mut q = WriteQueue::new(WriteQueueConfig {
            entry_overhead: 0,
            high_water_mark: 10,
            low_water_mark: 4,
        });
        q.add_message(ByteBuf::copy_from_slice(&[0u8; 20]));
        q.mark_flush();
        assert!(!q.is_writable());
        q.remove_bytes(18);
        assert!(!q.is_writable());
        q.remove_bytes(2);
        assert!(q.is_writable());
    }

    #[test]
    fn cancel_before_promotion_skips_write_and_fires_cancelled() {
        let mut q = WriteQueue::new(WriteQueueConfig::default());
        let done = std::sync::Arc::new(std::sync::Mutex::new(None));
        let promise = q.add_message(ByteBuf::copy_from_slice(b"hello"));
        let done2 = done.clone();
        promise.on_complete(move |r| *done2.lock().unwrap() = Some(r));
        assert!(promise.try_cancel());
        q.mark_flush();
        let (views, count, total) = q.gather_views(16, usize::MAX);
        assert!(views.is_empty());
        assert_eq!(count, 0);
        assert_eq!(total, 0);
        q.remove_bytes(0);
        assert!(matches!(*done.lock().unwrap(), Some(Err(CoreError::Cancelled))));
    }

    #[test]
    fn cancel_after_promotion_is_ignored() {
        let mut q = WriteQueue::new(WriteQueueConfig::default());
        let promise = q.add_message(ByteBuf::copy_from_slice(b"hi"));
        q.mark_flush();
        assert!(!promise.try_cancel());
        let (views, count, _total) = q.gather_views(16, usize::MAX);
        assert_eq!(views.len(), 1);
        assert_eq!(count, 1);
    }

    #[test]
    fn has_flushed_true_when_only_cancelled_entries_remain() {
        let mut q = WriteQueue::new(WriteQueueConfig::default());
        let promise = q.add_message(ByteBuf::copy_from_slice(b"x"));
        assert!(promise.try_cancel());
        q.mark_flush();
        assert!(q.has_flushed());
        q.remove_bytes(0);
        assert!(!q.has_flushed());
    }

    #[test]
    fn close_after_fail_flushed_does_not_retrigger_water_mark() {
        let mut q = WriteQueue::new(WriteQueueConfig { entry_overhead: 0, high_water_mark: 10, low_water_mark: 4 });
        q.add_message(ByteBuf::copy_from_slice(&[0u8; 20]));
        q.mark_flush();
        assert!(!q.is_writable());
        q.fail_flushed("closed", true);
        assert!(q.is_writable());
        q.add_message(ByteBuf::copy_from_slice(&[0u8; 20]));
        assert!(!q.is_writable());
        q.close("closed");
        assert!(q.is_closed());
    }

    #[test]
    fn remove_bytes_completes_entries_in_order() {
        let mut q = WriteQueue::new(WriteQueueConfig { entry_overhead: 0, ..WriteQueueConfig::default() });
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for (i, payload) in [&b"aa"[..], &b"bb"[..]].into_iter().enumerate() {
            let p = q.add_message(ByteBuf::copy_from_slice(payload));
            let order = order.clone();
            p.on_complete(move |_| order.lock().unwrap().push(i));
        }
        q.mark_flush();
        q.remove_bytes(4);
        assert_eq!(*order.lock().unwrap(), vec![0, 1]);
    }
}
