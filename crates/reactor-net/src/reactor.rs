//! Single-threaded reactor event loop built directly on `mio`.
//!
//! One `Reactor<D>` owns a `mio::Poll`, every registered connection, a
//! cross-thread task queue and a scheduled-task heap. Everything except
//! task submission, wakeup and writability bits is touched from the loop
//! thread alone.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream as MioTcpStream};
use mio::{Events, Interest, Poll, Token};

use crate::decode::{CumulatorStrategy, FrameDecoder};
use crate::error::CoreError;
use crate::queue::WriteQueueConfig;
use crate::tcp::TcpStream;
use reactor_util::{thread_boot, ThreadPriority};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Tunables for one reactor instance.
#[derive(Clone, Debug)]
pub struct ReactorConfig {
    /// Percentage (1..=100) of each iteration's time budget spent
    /// servicing I/O readiness versus draining the task queue.
    pub io_ratio: u8,
    /// Consecutive empty-but-early `poll` calls before the selector is
    /// rebuilt. `0` disables the busy-spin workaround entirely.
    pub selector_auto_rebuild_threshold: u32,
    /// Cancelled registrations accumulated before a forced re-select.
    pub cancelled_key_reselect_threshold: u32,
    /// Accepted for parity with the selector this crate's design was
    /// distilled from; `mio` has no equivalent "optimized selected-key
    /// set" to disable, so this field is a pure no-op here.
    pub disable_key_set_optimization: bool,
    pub discard_after_reads: u32,
    /// Forces at most one `decode` call per `channel_read` regardless of
    /// what the decoder's own `FrameDecoder::is_single_decode` reports.
    pub single_decode: bool,
    pub cumulator_strategy: CumulatorStrategy,
    pub write_queue: WriteQueueConfig,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig {
            io_ratio: 50,
            selector_auto_rebuild_threshold: 512,
            cancelled_key_reselect_threshold: 256,
            disable_key_set_optimization: false,
            discard_after_reads: 16,
            single_decode: false,
            cumulator_strategy: CumulatorStrategy::Merge,
            write_queue: WriteQueueConfig::default(),
        }
    }
}

/// A source of `Instant`s, injectable so tests can control the passage of
/// time instead of depending on the real wall clock.
pub trait Clock: Send {
    fn now(&self) -> Instant;
}

/// The default [`Clock`]: the real OS monotonic clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// One event the reactor surfaces to the caller-supplied handler during
/// `poll_once`/`run`.
pub enum PollEvent<F> {
    Accept { listener: Token, stream: Token, peer_addr: SocketAddr },
    Disconnect { token: Token, cause: Option<CoreError> },
    Message { token: Token, frame: F },
    ReadComplete { token: Token },
}

enum Connection<D: FrameDecoder> {
    Listener(TcpListener),
    Stream(TcpStream<D>),
}

type Task<D> = Box<dyn FnOnce(&mut Reactor<D>) + Send>;

struct TimerEntry<D: FrameDecoder> {
    deadline: Instant,
    seq: u64,
    task: Task<D>,
}

impl<D: FrameDecoder> PartialEq for TimerEntry<D> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl<D: FrameDecoder> Eq for TimerEntry<D> {}
impl<D: FrameDecoder> PartialOrd for TimerEntry<D> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<D: FrameDecoder> Ord for TimerEntry<D> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// A cloneable, `Send` handle for submitting tasks, scheduling timers and
/// waking the reactor from any thread. Clone it once per thread rather
/// than sharing a single instance.
pub struct ReactorHandle<D: FrameDecoder> {
    task_tx: Sender<Task<D>>,
    pending_tasks: Arc<AtomicUsize>,
    wakeup_pending: Arc<AtomicBool>,
    waker: Arc<mio::Waker>,
}

impl<D: FrameDecoder> Clone for ReactorHandle<D> {
    fn clone(&self) -> Self {
        ReactorHandle {
            task_tx: self.task_tx.clone(),
            pending_tasks: Arc::clone(&self.pending_tasks),
            wakeup_pending: Arc::clone(&self.wakeup_pending),
            waker: Arc::clone(&self.waker),
        }
    }
}

// `mpsc::Sender` is deliberately not `Sync`, so `ReactorHandle` isn't
// either: give every thread its own clone (it's cheap) rather than
// sharing one behind a reference.
impl<D: FrameDecoder + 'static> ReactorHandle<D> {
    /// Submits a task to run on the loop thread, waking the selector if
    /// it is currently blocked.
    pub fn submit(&self, task: impl FnOnce(&mut Reactor<D>) + Send + 'static) {
        self.pending_tasks.fetch_add(1, Ordering::AcqRel);
        let _ = self.task_tx.send(Box::new(task));
        self.wake();
    }

    /// Schedules a task to run no earlier than `delay` from now. Timer
    /// bookkeeping itself only ever happens on the loop thread; this is
    /// implemented as a regular task that inserts into the heap once it
    /// runs there.
    pub fn schedule_after(&self, delay: Duration, task: impl FnOnce(&mut Reactor<D>) + Send + 'static) {
        self.submit(move |reactor| reactor.schedule_after(delay, task));
    }

    fn wake(&self) {
        if self
            .wakeup_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.waker.wake();
        }
    }

    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.pending_tasks.load(Ordering::Acquire)
    }
}

/// Single-threaded event loop. Not `Send`: move the whole struct into the
/// thread that will call [`Reactor::run`], or build it with
/// [`Reactor::spawn_pinned`].
pub struct Reactor<D: FrameDecoder> {
    poll: Poll,
    events: Events,
    connections: HashMap<Token, Connection<D>>,
    next_token: usize,
    decoder_factory: Box<dyn FnMut() -> D + Send>,
    config: ReactorConfig,
    task_rx: Receiver<Task<D>>,
    task_tx: Sender<Task<D>>,
    pending_tasks: Arc<AtomicUsize>,
    wakeup_pending: Arc<AtomicBool>,
    waker: Arc<mio::Waker>,
    timers: BinaryHeap<Reverse<TimerEntry<D>>>,
    timer_seq: u64,
    select_count: u32,
    cancelled_keys: u32,
    needs_reselect: bool,
    shutting_down: bool,
    clock: Box<dyn Clock>,
}

impl<D: FrameDecoder + 'static> Reactor<D> {
    pub fn new(
        config: ReactorConfig,
        decoder_factory: impl FnMut() -> D + Send + 'static,
    ) -> std::io::Result<Self> {
        Self::with_clock(config, decoder_factory, SystemClock)
    }

    /// As [`Reactor::new`], but with an injectable [`Clock`] in place of
    /// the real OS clock, so timer and busy-spin tests can control time
    /// deterministically.
    pub fn with_clock(
        config: ReactorConfig,
        decoder_factory: impl FnMut() -> D + Send + 'static,
        clock: impl Clock + 'static,
    ) -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (task_tx, task_rx) = mpsc::channel();
        Ok(Reactor {
            poll,
            events: Events::with_capacity(1024),
            connections: HashMap::new(),
            next_token: 0,
            decoder_factory: Box::new(decoder_factory),
            config,
            task_rx,
            task_tx,
            pending_tasks: Arc::new(AtomicUsize::new(0)),
            wakeup_pending: Arc::new(AtomicBool::new(false)),
            waker,
            timers: BinaryHeap::new(),
            timer_seq: 0,
            select_count: 0,
            cancelled_keys: 0,
            needs_reselect: false,
            shutting_down: false,
            clock: Box::new(clock),
        })
    }

    /// Builds a reactor and runs it to completion on a newly spawned,
    /// optionally pinned and priority-boosted thread.
    pub fn spawn_pinned(
        config: ReactorConfig,
        decoder_factory: impl FnMut() -> D + Send + 'static,
        core: Option<usize>,
        priority: ThreadPriority,
        mut handler: impl FnMut(PollEvent<D::Frame>) + Send + 'static,
    ) -> std::io::Result<ReactorHandle<D>> {
        let mut reactor = Reactor::new(config, decoder_factory)?;
        let handle = reactor.handle();
        std::thread::Builder::new()
            .name("reactor-net".into())
            .spawn(move || {
                thread_boot(core, priority);
                reactor.run(&mut handler);
            })?;
        Ok(handle)
    }

    #[must_use]
    pub fn handle(&self) -> ReactorHandle<D> {
        ReactorHandle {
            task_tx: self.task_tx.clone(),
            pending_tasks: Arc::clone(&self.pending_tasks),
            wakeup_pending: Arc::clone(&self.wakeup_pending),
            waker: Arc::clone(&self.waker),
        }
    }

    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.pending_tasks.load(Ordering::Acquire)
    }

    pub fn initiate_shutdown(&mut self) {
        self.shutting_down = true;
    }

    fn alloc_token(&mut self) -> Token {
        reactor_util::safe_assert!(self.next_token != WAKER_TOKEN.0, "token space exhausted, collided with the waker's reserved token");
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn listen(&mut self, addr: SocketAddr) -> std::io::Result<Token> {
        let mut listener = TcpListener::bind(addr)?;
        let token = self.alloc_token();
        self.poll.registry().register(&mut listener, token, Interest::READABLE)?;
        self.connections.insert(token, Connection::Listener(listener));
        Ok(token)
    }

    /// The local address of a listener or stream, e.g. to recover an OS-
    /// assigned ephemeral port after `listen`ing on port 0.
    #[must_use]
    pub fn local_addr(&self, token: Token) -> Option<SocketAddr> {
        match self.connections.get(&token)? {
            Connection::Listener(l) => l.local_addr().ok(),
            Connection::Stream(s) => s.local_addr().ok(),
        }
    }

    /// A cross-thread-safe handle onto a stream's backpressure state, so
    /// other threads can watch writability without a task round-trip.
    #[must_use]
    pub fn writability_handle(&self, token: Token) -> Option<crate::queue::WritabilityHandle> {
        match self.connections.get(&token)? {
            Connection::Stream(s) => Some(s.writability_handle()),
            Connection::Listener(_) => None,
        }
    }

    pub fn connect(&mut self, addr: SocketAddr) -> std::io::Result<Token> {
        let mut mio_stream = MioTcpStream::connect(addr)?;
        let token = self.alloc_token();
        self.poll.registry().register(&mut mio_stream, token, Interest::WRITABLE)?;
        let decoder = (self.decoder_factory)();
        let stream = TcpStream::connecting(
            mio_stream,
            decoder,
            self.config.cumulator_strategy,
            self.config.discard_after_reads,
            self.config.single_decode,
            self.config.write_queue,
        );
        self.connections.insert(token, Connection::Stream(stream));
        Ok(token)
    }

    /// Schedules `task` to run on the loop thread no earlier than `delay`
    /// from now. Must be called from the loop thread; off-thread callers
    /// should use [`ReactorHandle::schedule_after`].
    pub fn schedule_after(&mut self, delay: Duration, task: impl FnOnce(&mut Reactor<D>) + Send + 'static) {
        let seq = self.timer_seq;
        self.timer_seq += 1;
        self.timers.push(Reverse(TimerEntry {
            deadline: self.clock.now() + delay,
            seq,
            task: Box::new(task),
        }));
    }

    /// Enqueues `message` for writing and immediately tries to drain the
    /// queue, so a socket that is already writable does not have to wait
    /// for a fresh readiness notification.
    pub fn write(&mut self, token: Token, message: crate::buf::ByteBuf) -> Result<crate::queue::Promise, CoreError> {
        let promise = match self.connections.get_mut(&token) {
            Some(Connection::Stream(stream)) => stream.write_or_enqueue(message),
            _ => return Err(CoreError::ClosedChannel),
        };
        let drain_result = match self.connections.get_mut(&token) {
            Some(Connection::Stream(stream)) => {
                let result = stream.drain_writes();
                if let Some(interest) = stream.take_desired_interest() {
                    let _ = self.poll.registry().reregister(stream.mio_stream_mut(), token, interest);
                }
                result
            }
            None => Ok(()),
        };
        if drain_result.is_err() {
            self.close(token);
        }
        Ok(promise)
    }

    pub fn close(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            match &mut conn {
                Connection::Listener(l) => {
                    let _ = self.poll.registry().deregister(l);
                }
                Connection::Stream(s) => {
                    let _ = self.poll.registry().deregister(s.mio_stream_mut());
                }
            }
        }
        self.cancelled_keys += 1;
        if self.cancelled_keys >= self.config.cancelled_key_reselect_threshold {
            self.needs_reselect = true;
        }
    }

    /// Runs one selection cycle (blocking up to `timeout`) and dispatches
    /// resulting readiness to `handler`. Exposed directly so tests can
    /// drive the reactor without going through the full busy-spin/task
    /// loop in [`Reactor::run`].
    pub fn poll_once(
        &mut self,
        timeout: Option<Duration>,
        handler: &mut dyn FnMut(PollEvent<D::Frame>),
    ) -> std::io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }
        self.dispatch_ready(handler);
        Ok(())
    }

    fn dispatch_ready(&mut self, handler: &mut dyn FnMut(PollEvent<D::Frame>)) {
        loop {
            let tokens: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .filter(|e| e.token() != WAKER_TOKEN)
                .map(|e| (e.token(), e.is_readable(), e.is_writable()))
                .collect();

            for (token, readable, writable) in tokens {
                self.service_token(token, readable, writable, handler);
            }

            if self.needs_reselect {
                self.needs_reselect = false;
                self.cancelled_keys = 0;
                if self.poll.poll(&mut self.events, Some(Duration::ZERO)).is_err() {
                    break;
                }
                continue;
            }
            break;
        }
    }

    fn service_token(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
        handler: &mut dyn FnMut(PollEvent<D::Frame>),
    ) {
        let Some(conn) = self.connections.get(&token) else { return };
        let is_listener = matches!(conn, Connection::Listener(_));
        if is_listener {
            if readable {
                self.accept_all(token, handler);
            }
            return;
        }
        // WRITE before READ so a connect-completion or a drained backlog
        // is visible before new bytes are handled, matching the ordering
        // readiness-based reactors conventionally apply.
        if writable {
            self.service_writable(token, handler);
        }
        if readable || !writable {
            self.service_readable(token, handler);
        }
    }

    fn accept_all(&mut self, listener_token: Token, handler: &mut dyn FnMut(PollEvent<D::Frame>)) {
        loop {
            let Some(Connection::Listener(listener)) = self.connections.get_mut(&listener_token) else {
                return;
            };
            match listener.accept() {
                Ok((mut mio_stream, peer_addr)) => {
                    let token = self.alloc_token();
                    if let Err(e) =
                        self.poll.registry().register(&mut mio_stream, token, Interest::READABLE)
                    {
                        tracing::warn!(?e, "failed to register accepted stream");
                        continue;
                    }
                    let decoder = (self.decoder_factory)();
                    let stream = TcpStream::connected(
                        mio_stream,
                        decoder,
                        self.config.cumulator_strategy,
                        self.config.discard_after_reads,
                        self.config.single_decode,
                        self.config.write_queue,
                    );
                    self.connections.insert(token, Connection::Stream(stream));
                    handler(PollEvent::Accept { listener: listener_token, stream: token, peer_addr });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::warn!(?e, "accept failed");
                    return;
                }
            }
        }
    }

    fn service_writable(&mut self, token: Token, handler: &mut dyn FnMut(PollEvent<D::Frame>)) {
        let Some(Connection::Stream(stream)) = self.connections.get_mut(&token) else { return };
        if stream.finish_connect_if_needed().is_err() {
            self.fail_and_remove(token, handler);
            return;
        }
        if let Err(e) = stream.drain_writes() {
            tracing::debug!(?e, ?token, "write failed");
            self.fail_and_remove(token, handler);
            return;
        }
        if let Some(interest) = stream.take_desired_interest() {
            if let Some(Connection::Stream(stream)) = self.connections.get_mut(&token) {
                let _ = self.poll.registry().reregister(stream.mio_stream_mut(), token, interest);
            }
        }
    }

    fn service_readable(&mut self, token: Token, handler: &mut dyn FnMut(PollEvent<D::Frame>)) {
        let Some(Connection::Stream(stream)) = self.connections.get_mut(&token) else { return };
        let mut frames = Vec::new();
        match stream.read_ready(&mut frames) {
            Ok(eof) => {
                for frame in frames {
                    handler(PollEvent::Message { token, frame });
                }
                handler(PollEvent::ReadComplete { token });
                if eof {
                    self.close(token);
                    handler(PollEvent::Disconnect { token, cause: None });
                }
            }
            Err(e) => {
                for frame in frames {
                    handler(PollEvent::Message { token, frame });
                }
                self.fail_and_remove(token, handler);
                let _ = e;
            }
        }
    }

    fn fail_and_remove(&mut self, token: Token, handler: &mut dyn FnMut(PollEvent<D::Frame>)) {
        if let Some(Connection::Stream(mut stream)) = self.connections.remove(&token) {
            let _ = self.poll.registry().deregister(stream.mio_stream_mut());
            stream.fail_pending_writes();
        }
        self.cancelled_keys += 1;
        if self.cancelled_keys >= self.config.cancelled_key_reselect_threshold {
            self.needs_reselect = true;
        }
        handler(PollEvent::Disconnect { token, cause: None });
    }

    fn next_timeout(&self) -> Option<Duration> {
        self.timers.peek().map(|Reverse(t)| t.deadline.saturating_duration_since(self.clock.now()))
    }

    fn promote_due_timers(&mut self) {
        let now = self.clock.now();
        let mut due = Vec::new();
        while let Some(Reverse(t)) = self.timers.peek() {
            if t.deadline > now {
                break;
            }
            let Reverse(t) = self.timers.pop().unwrap();
            due.push(t.task);
        }
        for task in due {
            task(self);
        }
    }

    fn run_tasks(&mut self, budget: Option<Duration>) {
        let start = self.clock.now();
        loop {
            self.promote_due_timers();
            match self.task_rx.try_recv() {
                Ok(task) => {
                    self.pending_tasks.fetch_sub(1, Ordering::AcqRel);
                    task(self);
                }
                Err(_) => break,
            }
            if let Some(budget) = budget {
                if start.elapsed() >= budget {
                    break;
                }
            }
        }
    }

    fn blocking_select(&mut self, timeout: Option<Duration>) {
        self.wakeup_pending.store(false, Ordering::Release);
        let start = self.clock.now();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                self.select_count = 0;
                return;
            }
            Err(e) => {
                tracing::error!(?e, "selector poll failed");
                return;
            }
        }
        if self.wakeup_pending.load(Ordering::Acquire) {
            let _ = self.waker.wake();
        }
        let got_events = self.events.iter().next().is_some();
        if got_events {
            self.select_count = 0;
            return;
        }
        let spurious_early_return = timeout.is_some_and(|t| start.elapsed() < t);
        if spurious_early_return {
            self.select_count += 1;
            if self.config.selector_auto_rebuild_threshold > 0
                && self.select_count >= self.config.selector_auto_rebuild_threshold
            {
                self.rebuild_selector();
            }
        } else {
            self.select_count = 0;
        }
    }

    fn rebuild_selector(&mut self) {
        tracing::warn!(select_count = self.select_count, "selector busy-spin detected, rebuilding");
        match Poll::new() {
            Ok(new_poll) => {
                for (token, conn) in &mut self.connections {
                    let result = match conn {
                        Connection::Listener(l) => {
                            new_poll.registry().register(l, *token, Interest::READABLE)
                        }
                        Connection::Stream(s) => new_poll.registry().register(
                            s.mio_stream_mut(),
                            *token,
                            s.current_interest(),
                        ),
                    };
                    if let Err(e) = result {
                        tracing::error!(?e, ?token, "failed to re-register during selector rebuild");
                    }
                }
                match mio::Waker::new(new_poll.registry(), WAKER_TOKEN) {
                    Ok(w) => self.waker = Arc::new(w),
                    Err(e) => tracing::error!(?e, "failed to recreate waker during selector rebuild"),
                }
                self.poll = new_poll;
                self.select_count = 0;
            }
            Err(e) => {
                tracing::error!(?e, "selector rebuild failed, backing off");
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }

    /// Runs the event loop until [`Reactor::initiate_shutdown`] has been
    /// called and every connection has closed.
    pub fn run(&mut self, handler: &mut dyn FnMut(PollEvent<D::Frame>)) {
        loop {
            let has_tasks = self.pending_tasks.load(Ordering::Acquire) > 0 || !self.timers.is_empty();
            let timeout = if self.pending_tasks.load(Ordering::Acquire) > 0 {
                Some(Duration::ZERO)
            } else if has_tasks {
                self.next_timeout()
            } else {
                None
            };

            let io_start = self.clock.now();
            self.blocking_select(timeout);
            self.dispatch_ready(handler);
            let io_elapsed = io_start.elapsed();

            // io_ratio is the percentage of each iteration's time spent servicing
            // readiness; the remainder is this iteration's task-draining budget.
            let task_budget = if self.config.io_ratio >= 100 {
                None
            } else {
                let ratio = f64::from(self.config.io_ratio.max(1)) / 100.0;
                Some(io_elapsed.mul_f64((1.0 - ratio) / ratio).max(Duration::from_micros(50)))
            };
            self.run_tasks(task_budget);

            if self.shutting_down && self.connections.is_empty() {
                return;
            }
        }
    }
}
