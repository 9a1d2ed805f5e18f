//! The completion port: attaches handles, turns readiness into finished
//! requests and dispatches each finished request to its operation's handler.
//!
//! # How a request moves through the port
//!
//! 1. A socket issues a [`Request`] with [`CompletionPort::submit`]. The
//!    port takes a reference to the operation and queues the request on the
//!    handle, FIFO per direction.
//! 2. The handle is armed (one-shot) for the directions that have work.
//! 3. A drain harvests readiness, performs queued requests until one would
//!    block, records the outcome on the operation and moves it to the ready
//!    queue. Handles with remaining work are re-armed.
//! 4. [`CompletionPort::drain_one`] pops one ready entry, releases the
//!    operation and runs its handler.
//!
//! Handlers never observe readiness, only completions.

mod epoll;
pub(crate) mod request;
mod throughput;

use std::{
  collections::{HashMap, VecDeque},
  fmt, io,
  os::fd::{AsRawFd, RawFd},
  sync::{Arc, OnceLock},
  time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::{
  PortConfig,
  overlapped::{Completion, Overlapped},
};
use epoll::{NOTIFY_KEY, OsPoller};
use request::{Direction, Outcome, Request};
use throughput::Throughput;

/// How long a drain that lost the race for the OS queue waits on the ready
/// queue before trying again.
const CONTENDED_SLICE: Duration = Duration::from_millis(5);

/// Result of one [`CompletionPort::drain_one`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drained {
  /// One completion was handed to its handler.
  Dispatched,
  /// The timeout elapsed or the port was woken without a completion.
  Empty,
}

/// The port a handle belongs to, set once by [`CompletionPort::attach`].
#[derive(Default)]
pub struct Attachment(OnceLock<CompletionPort>);

impl Attachment {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn port(&self) -> Option<&CompletionPort> {
    self.0.get()
  }
}

impl fmt::Debug for Attachment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("Attachment").field(&self.0.get().is_some()).finish()
  }
}

/// A descriptor that can be attached to a [`CompletionPort`].
pub trait IoHandle: AsRawFd {
  fn attachment(&self) -> &Attachment;
}

struct Pending {
  request: Request,
  op: Arc<Overlapped>,
}

#[derive(Default)]
struct HandleState {
  reads: VecDeque<Pending>,
  writes: VecDeque<Pending>,
}

impl HandleState {
  fn queue(&mut self, direction: Direction) -> &mut VecDeque<Pending> {
    match direction {
      Direction::Read => &mut self.reads,
      Direction::Write => &mut self.writes,
    }
  }
}

struct Ready {
  op: Arc<Overlapped>,
  completion: Completion,
}

struct Inner {
  poller: OsPoller,
  handles: Mutex<HashMap<RawFd, HandleState>>,
  ready_tx: Sender<Ready>,
  ready_rx: Receiver<Ready>,
  events: Mutex<Vec<libc::epoll_event>>,
  throughput: Throughput,
  config: PortConfig,
}

/// A queue of finished asynchronous requests.
///
/// Cloning is cheap and every clone refers to the same port. Any number of
/// threads may drain concurrently; each completion is dispatched exactly
/// once.
#[derive(Clone)]
pub struct CompletionPort {
  inner: Arc<Inner>,
}

impl CompletionPort {
  /// # Panics
  ///
  /// Panics if the OS cannot allocate the port.
  pub fn new() -> Self {
    Self::with_config(PortConfig::default())
  }

  /// # Panics
  ///
  /// Panics if the OS cannot allocate the port.
  pub fn with_config(config: PortConfig) -> Self {
    let poller = OsPoller::new().unwrap_or_else(|err| {
      panic!("murmur: failed to create completion port: {err}")
    });
    let (ready_tx, ready_rx) = crossbeam_channel::unbounded();
    let empty = libc::epoll_event { events: 0, u64: 0 };

    Self {
      inner: Arc::new(Inner {
        poller,
        handles: Mutex::new(HashMap::new()),
        ready_tx,
        ready_rx,
        events: Mutex::new(vec![empty; config.events_capacity]),
        throughput: Throughput::new(config.throughput_threshold),
        config,
      }),
    }
  }

  pub fn config(&self) -> &PortConfig {
    &self.inner.config
  }

  /// Associates `handle` with this port. Requests issued on it complete here.
  ///
  /// # Panics
  ///
  /// Panics if the handle already belongs to a port or the OS rejects it.
  pub fn attach<H>(&self, handle: &H)
  where
    H: IoHandle + ?Sized,
  {
    let fd = handle.as_raw_fd();
    assert!(
      handle.attachment().0.set(self.clone()).is_ok(),
      "murmur: fd {fd} is already attached to a completion port"
    );

    self.inner.poller.add(fd, fd as u64).unwrap_or_else(|err| {
      panic!("murmur: failed to attach fd {fd} to completion port: {err}")
    });
    self.inner.handles.lock().insert(fd, HandleState::default());

    tracing::debug!(fd, "handle attached");
  }

  /// Queues `request` on `fd` on behalf of `op`.
  ///
  /// `Err` means the request failed synchronously and no completion will be
  /// delivered.
  pub(crate) fn submit(
    &self,
    fd: RawFd,
    mut request: Request,
    op: &Arc<Overlapped>,
  ) -> io::Result<()> {
    let mut handles = self.inner.handles.lock();
    let Some(state) = handles.get_mut(&fd) else {
      return Err(io::Error::from_raw_os_error(libc::EBADF));
    };

    op.begin();
    if let Err(err) = request.start(fd) {
      op.abandon();
      return Err(err);
    }

    tracing::trace!(fd, request = request.name(), "request issued");
    let direction = request.direction();

    // Nothing to wait behind: finish it now instead of waiting for
    // readiness that may never come.
    if request.never_blocks() && state.queue(direction).is_empty() {
      if let Outcome::Done(status) = request.perform(fd) {
        self.complete(Pending { request, op: Arc::clone(op) }, status);
        drop(handles);
        self.wake();
        return Ok(());
      }
    }

    state.queue(direction).push_back(Pending { request, op: Arc::clone(op) });

    if let Err(err) = self.arm(fd, state) {
      // The handle can no longer be polled; fail what it holds.
      let code = err.raw_os_error().unwrap_or(libc::EIO);
      let failed = self.fail_all(state, code);
      drop(handles);
      self.wake_for(failed);
    }
    Ok(())
  }

  /// Queues a finished completion for `op` without any I/O.
  ///
  /// # Panics
  ///
  /// Panics if `op` is already in flight or was not reset.
  pub fn post(&self, op: &Arc<Overlapped>, completion: Completion) {
    op.begin();
    let status = match completion.error.as_ref() {
      None => Ok(()),
      Some(err) => Err(err.raw_os_error().unwrap_or(libc::EIO)),
    };
    op.finish(completion.bytes, status, Vec::new(), None);

    self.push_ready(Ready { op: Arc::clone(op), completion });
    self.wake();
  }

  /// Detaches `handle` and completes every request pending on it with
  /// `ECANCELED`. Returns how many were cancelled.
  ///
  /// The handle stays tied to this port and cannot issue further requests.
  pub fn cancel<H>(&self, handle: &H) -> usize
  where
    H: AsRawFd + ?Sized,
  {
    let fd = handle.as_raw_fd();
    let Some(mut state) = self.inner.handles.lock().remove(&fd) else {
      return 0;
    };
    if let Err(err) = self.inner.poller.delete(fd) {
      tracing::warn!(fd, error = %err, "failed to deregister handle");
    }

    let cancelled = self.fail_all(&mut state, libc::ECANCELED);
    tracing::debug!(fd, cancelled, "handle cancelled");
    self.wake_for(cancelled);
    cancelled
  }

  /// Completes every write-direction request pending on `handle` (connects,
  /// sends, transmits and disconnects) with `ECANCELED`. Receives and
  /// accepts stay queued and the handle stays attached. Returns how many
  /// were cancelled.
  ///
  /// A send cancelled part way leaves the stream with a truncated write.
  pub fn cancel_writes<H>(&self, handle: &H) -> usize
  where
    H: AsRawFd + ?Sized,
  {
    let fd = handle.as_raw_fd();
    let mut handles = self.inner.handles.lock();
    let Some(state) = handles.get_mut(&fd) else {
      return 0;
    };

    let pending: Vec<Pending> = state.writes.drain(..).collect();
    let mut cancelled = pending.len();
    for pending in pending {
      self.complete(pending, Err(libc::ECANCELED));
    }
    if let Err(err) = self.arm(fd, state) {
      let code = err.raw_os_error().unwrap_or(libc::EIO);
      cancelled += self.fail_all(state, code);
    }
    drop(handles);

    if cancelled > 0 {
      tracing::debug!(fd, cancelled, "writes cancelled");
    }
    self.wake_for(cancelled);
    cancelled
  }

  /// Interrupts a drain blocked in the OS.
  pub fn wake(&self) {
    if let Err(err) = self.inner.poller.notify() {
      tracing::warn!(error = %err, "failed to wake completion port");
    }
  }

  /// Completions per second at the last throughput report.
  pub fn last_throughput(&self) -> Option<f64> {
    self.inner.throughput.last()
  }

  /// Dispatches at most one completion, waiting up to `timeout` for one.
  /// `None` waits until a completion arrives or the port is woken.
  ///
  /// # Panics
  ///
  /// Panics if the OS queue fails, or if the dispatched operation has no
  /// live handler.
  pub fn drain_one(&self, timeout: Option<Duration>) -> Drained {
    let deadline = timeout.map(|timeout| Instant::now() + timeout);

    loop {
      if let Ok(ready) = self.inner.ready_rx.try_recv() {
        self.dispatch(ready);
        return Drained::Dispatched;
      }

      let remaining =
        deadline.map(|d| d.saturating_duration_since(Instant::now()));

      let Some(mut events) = self.inner.events.try_lock() else {
        // Another thread is harvesting and will queue what it finds.
        let slice = remaining.map_or(CONTENDED_SLICE, |r| r.min(CONTENDED_SLICE));
        match self.inner.ready_rx.recv_timeout(slice) {
          Ok(ready) => {
            self.dispatch(ready);
            return Drained::Dispatched;
          }
          Err(RecvTimeoutError::Timeout) if remaining.is_some_and(|r| r.is_zero()) => {
            return Drained::Empty;
          }
          Err(_) => continue,
        }
      };

      let woken = self.harvest(&mut events, remaining);
      drop(events);

      if !self.inner.ready_rx.is_empty() {
        continue;
      }
      if woken || remaining.is_some_and(|r| r.is_zero()) {
        return Drained::Empty;
      }
      if deadline.is_some_and(|d| Instant::now() >= d) {
        return Drained::Empty;
      }
    }
  }

  /// Dispatches everything that is already complete, without blocking.
  /// Returns how many completions were dispatched.
  ///
  /// Requests issued by handlers during the flush are included only if they
  /// finish immediately.
  pub fn flush(&self) -> usize {
    let mut dispatched = 0;
    while self.drain_one(Some(Duration::ZERO)) == Drained::Dispatched {
      dispatched += 1;
    }
    dispatched
  }

  /// Waits for readiness and moves every request that finishes to the ready
  /// queue. Returns whether the wake-up notification fired.
  fn harvest(
    &self,
    events: &mut [libc::epoll_event],
    timeout: Option<Duration>,
  ) -> bool {
    let n = self
      .inner
      .poller
      .wait(events, timeout)
      .unwrap_or_else(|err| panic!("murmur: completion port wait failed: {err}"));

    let mut woken = false;
    let mut finished = 0;
    for event in &events[..n] {
      let key = event.u64;
      let flags = event.events;
      if key == NOTIFY_KEY {
        self.inner.poller.clear_notification();
        woken = true;
        continue;
      }

      let fd = key as RawFd;
      tracing::trace!(fd, flags, "handle ready");
      finished += self.progress(fd);
    }

    if finished > 0 {
      tracing::trace!(finished, "requests completed");
    }
    woken
  }

  /// Runs queued requests on `fd` until each direction would block.
  fn progress(&self, fd: RawFd) -> usize {
    let mut handles = self.inner.handles.lock();
    // Cancelled since the event was reported.
    let Some(state) = handles.get_mut(&fd) else {
      return 0;
    };

    let mut finished = 0;
    for direction in [Direction::Read, Direction::Write] {
      let queue = state.queue(direction);
      while let Some(pending) = queue.front_mut() {
        let status = match pending.request.perform(fd) {
          Outcome::WouldBlock => break,
          Outcome::Done(status) => status,
        };

        if let Some(pending) = queue.pop_front() {
          self.complete(pending, status);
          finished += 1;
        }
      }
    }

    if let Err(err) = self.arm(fd, state) {
      let code = err.raw_os_error().unwrap_or(libc::EIO);
      finished += self.fail_all(state, code);
    }
    finished
  }

  fn arm(&self, fd: RawFd, state: &HandleState) -> io::Result<()> {
    let readable = !state.reads.is_empty();
    let writable = !state.writes.is_empty();
    if !readable && !writable {
      return Ok(());
    }
    self.inner.poller.modify(fd, fd as u64, readable, writable)
  }

  fn complete(&self, pending: Pending, status: Result<(), i32>) {
    let Pending { request, op } = pending;
    let finished = request.finish();
    let completion = Completion::from_status(finished.transferred, status);
    op.finish(finished.transferred, status, finished.buffers, finished.accepted);
    self.push_ready(Ready { op, completion });
  }

  fn fail_all(&self, state: &mut HandleState, code: i32) -> usize {
    let pending: Vec<Pending> =
      state.reads.drain(..).chain(state.writes.drain(..)).collect();
    let count = pending.len();
    for pending in pending {
      self.complete(pending, Err(code));
    }
    count
  }

  fn push_ready(&self, ready: Ready) {
    // The receiver lives in the same `Inner`, so the channel is never closed.
    let _ = self.inner.ready_tx.send(ready);
  }

  fn wake_for(&self, completed: usize) {
    if completed > 0 {
      self.wake();
    }
  }

  fn dispatch(&self, ready: Ready) {
    let Ready { op, completion } = ready;
    let handler = op.retire();

    match completion.error.as_ref() {
      None => tracing::trace!(bytes = completion.bytes, "dispatching completion"),
      Some(err) if err.raw_os_error() == Some(libc::ECANCELED) => {
        tracing::trace!("dispatching cancelled completion")
      }
      Some(err) => {
        tracing::warn!(bytes = completion.bytes, error = %err, "request failed")
      }
    }

    // Keep waiters on the port's descriptor awake while entries remain.
    if !self.inner.ready_rx.is_empty() {
      self.wake();
    }

    handler.completed(completion, &op);
    op.notify_waiter();
    self.inner.throughput.record();
  }
}

impl Default for CompletionPort {
  fn default() -> Self {
    Self::new()
  }
}

impl AsRawFd for CompletionPort {
  /// The port's descriptor is readable while completions may be waiting.
  fn as_raw_fd(&self) -> RawFd {
    self.inner.poller.as_raw_fd()
  }
}

impl fmt::Debug for CompletionPort {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompletionPort")
      .field("fd", &self.as_raw_fd())
      .field("handles", &self.inner.handles.lock().len())
      .field("ready", &self.inner.ready_rx.len())
      .field("config", &self.inner.config)
      .finish()
  }
}
