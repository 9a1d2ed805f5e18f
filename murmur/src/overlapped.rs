//! The context record of one in-flight asynchronous request.

use std::{
  fmt, io,
  net::SocketAddr,
  os::fd::OwnedFd,
  sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
  },
  time::Duration,
};

use parking_lot::Mutex;

use crate::Event;

/// Outcome of one asynchronous request as reported by the port.
///
/// A failed request still reports how many bytes moved before it failed.
#[derive(Debug)]
pub struct Completion {
  pub bytes: usize,
  pub error: Option<io::Error>,
}

impl Completion {
  pub fn success(bytes: usize) -> Self {
    Self { bytes, error: None }
  }

  pub fn failure(bytes: usize, error: io::Error) -> Self {
    Self { bytes, error: Some(error) }
  }

  pub fn is_success(&self) -> bool {
    self.error.is_none()
  }

  /// Converts into a plain result, dropping the byte count on failure.
  pub fn into_result(self) -> io::Result<usize> {
    match self.error {
      None => Ok(self.bytes),
      Some(err) => Err(err),
    }
  }

  pub(crate) fn from_status(bytes: usize, status: Result<(), i32>) -> Self {
    match status {
      Ok(()) => Self::success(bytes),
      Err(code) => Self::failure(bytes, io::Error::from_raw_os_error(code)),
    }
  }
}

/// Receives the completions of the operations it was bound to.
///
/// Handlers run on whichever thread drains the port and must not block.
/// A failure completion is a normal outcome: cancelled requests report
/// `ECANCELED` and still need to release whatever they hold.
pub trait CompletionHandler: Send + Sync {
  fn completed(&self, completion: Completion, op: &Arc<Overlapped>);
}

/// A connection produced by an accept request.
#[derive(Debug)]
pub struct Accepted {
  pub(crate) fd: OwnedFd,
  pub peer: SocketAddr,
}

/// The request fields the OS reads and writes while the operation is pending.
#[derive(Default)]
struct RequestState {
  offset: u64,
  /// `None` until the request finishes.
  status: Option<Result<(), i32>>,
  transferred: usize,
  buffers: Vec<Vec<u8>>,
  accepted: Option<Accepted>,
  /// Set once the handler for the finished request has returned.
  dispatched: bool,
}

/// Ties one pending asynchronous request to its handler.
///
/// The operation is shared through an `Arc`: the issuer keeps one reference
/// and the [`CompletionPort`](crate::CompletionPort) holds another from the
/// moment the request is issued until its completion has been dispatched, so
/// the record can never disappear under the OS.
///
/// The handler is held weakly. Dispatching an operation whose handler is
/// missing or already dropped is a defect in the owner and panics.
///
/// Reissuing requires [`reset`](Self::reset) first, and issuing an operation
/// that still has a completion outstanding panics.
pub struct Overlapped {
  state: Mutex<RequestState>,
  in_flight: AtomicBool,
  handler: Option<Weak<dyn CompletionHandler>>,
  event: Option<Arc<Event>>,
}

impl Overlapped {
  /// Binds a handler and an optional event signaled once each completion
  /// has been dispatched.
  pub fn new(
    handler: Weak<dyn CompletionHandler>,
    event: Option<Arc<Event>>,
  ) -> Arc<Self> {
    Arc::new(Self {
      state: Mutex::new(RequestState::default()),
      in_flight: AtomicBool::new(false),
      handler: Some(handler),
      event,
    })
  }

  /// Shorthand for [`new`](Self::new) with a concrete handler.
  pub fn with_handler<H>(handler: &Arc<H>, event: Option<Arc<Event>>) -> Arc<Self>
  where
    H: CompletionHandler + 'static,
  {
    let weak: Weak<H> = Arc::downgrade(handler);
    Self::new(weak, event)
  }

  /// An operation without a handler. It may only be waited on; dispatching
  /// it through a port panics.
  pub fn unarmed(event: Option<Arc<Event>>) -> Arc<Self> {
    Arc::new(Self {
      state: Mutex::new(RequestState::default()),
      in_flight: AtomicBool::new(false),
      handler: None,
      event,
    })
  }

  /// Zeroes every request field, keeping the handler and the event.
  ///
  /// # Panics
  ///
  /// Panics if a request is still outstanding.
  pub fn reset(&self) {
    assert!(
      !self.is_in_flight(),
      "murmur: Overlapped::reset called while a completion is outstanding"
    );
    *self.state.lock() = RequestState::default();
  }

  pub fn is_in_flight(&self) -> bool {
    self.in_flight.load(Ordering::Acquire)
  }

  /// Starting offset for file transmission.
  pub fn offset(&self) -> u64 {
    self.state.lock().offset
  }

  pub fn set_offset(&self, offset: u64) {
    assert!(!self.is_in_flight(), "murmur: offset changed while in flight");
    self.state.lock().offset = offset;
  }

  pub fn event(&self) -> Option<&Arc<Event>> {
    self.event.as_ref()
  }

  /// The last completion, or `None` while pending or after a reset.
  pub fn result(&self) -> Option<io::Result<usize>> {
    let state = self.state.lock();
    state.status.map(|status| {
      Completion::from_status(state.transferred, status).into_result()
    })
  }

  /// Takes the buffers the finished request handed back.
  ///
  /// For receives these hold the data; their lengths are unchanged, the
  /// completion's byte count says how much is valid.
  pub fn take_buffers(&self) -> Vec<Vec<u8>> {
    std::mem::take(&mut self.state.lock().buffers)
  }

  /// Takes the connection produced by a finished accept.
  pub fn take_accepted(&self) -> Option<Accepted> {
    self.state.lock().accepted.take()
  }

  /// Blocks on this operation's own event until its completion has been
  /// dispatched.
  ///
  /// Someone has to keep draining the port for the event to fire. The event
  /// fires after the handler returns, so the waiter may [`reset`](Self::reset)
  /// and reissue at once. Returns `Ok(None)` on timeout, and also when the
  /// handler already reissued the operation.
  pub fn wait(&self, timeout: Option<Duration>) -> io::Result<Option<io::Result<usize>>> {
    let Some(event) = self.event.as_ref() else {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "operation has no wait event",
      ));
    };

    if let Some(result) = self.dispatched_result() {
      return Ok(Some(result));
    }
    if event.wait_one(timeout)? { Ok(self.dispatched_result()) } else { Ok(None) }
  }

  fn dispatched_result(&self) -> Option<io::Result<usize>> {
    let state = self.state.lock();
    if !state.dispatched {
      return None;
    }
    state.status.map(|status| {
      Completion::from_status(state.transferred, status).into_result()
    })
  }

  /// Marks the operation as issued.
  pub(crate) fn begin(&self) {
    assert!(
      self.state.lock().status.is_none(),
      "murmur: operation reissued without reset"
    );
    let was = self.in_flight.swap(true, Ordering::AcqRel);
    assert!(!was, "murmur: operation issued while a completion is outstanding");
  }

  /// Rolls back [`begin`](Self::begin) after a synchronous failure.
  pub(crate) fn abandon(&self) {
    self.in_flight.store(false, Ordering::Release);
  }

  /// Records the finished request. Called once per issue, before dispatch.
  pub(crate) fn finish(
    &self,
    transferred: usize,
    status: Result<(), i32>,
    buffers: Vec<Vec<u8>>,
    accepted: Option<Accepted>,
  ) {
    let mut state = self.state.lock();
    state.status = Some(status);
    state.transferred = transferred;
    state.buffers = buffers;
    state.accepted = accepted;
  }

  /// Signals the operation's event, if any. Called once the handler has run
  /// so a woken waiter may reset and reissue.
  pub(crate) fn notify_waiter(&self) {
    self.state.lock().dispatched = true;
    if let Some(event) = self.event.as_ref() {
      if let Err(err) = event.signal() {
        tracing::warn!(error = %err, "failed to signal operation event");
      }
    }
  }

  /// Clears the in-flight mark and returns the handler to run.
  ///
  /// # Panics
  ///
  /// Panics if the operation was never armed or its handler is gone.
  pub(crate) fn retire(&self) -> Arc<dyn CompletionHandler> {
    let handler = self
      .handler
      .as_ref()
      .and_then(Weak::upgrade)
      .unwrap_or_else(|| {
        panic!("murmur: dispatched an operation with no live completion handler")
      });

    self.in_flight.store(false, Ordering::Release);
    handler
  }
}

impl fmt::Debug for Overlapped {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.lock();
    f.debug_struct("Overlapped")
      .field("in_flight", &self.is_in_flight())
      .field("offset", &state.offset)
      .field("status", &state.status)
      .field("transferred", &state.transferred)
      .field("armed", &self.handler.is_some())
      .field("event", &self.event.is_some())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Noop;

  impl CompletionHandler for Noop {
    fn completed(&self, _: Completion, _: &Arc<Overlapped>) {}
  }

  #[test]
  fn test_reset_keeps_event() {
    let event = Arc::new(Event::new());
    let op = Overlapped::unarmed(Some(event.clone()));
    op.set_offset(42);
    op.begin();
    op.finish(3, Ok(()), vec![vec![1, 2, 3]], None);
    op.abandon();

    op.reset();

    assert_eq!(op.offset(), 0);
    assert!(op.result().is_none());
    assert!(op.take_buffers().is_empty());
    assert!(Arc::ptr_eq(op.event().unwrap(), &event));
  }

  #[test]
  #[should_panic(expected = "completion is outstanding")]
  fn test_double_issue_panics() {
    let op = Overlapped::unarmed(None);
    op.begin();
    op.begin();
  }

  #[test]
  #[should_panic(expected = "reissued without reset")]
  fn test_reissue_requires_reset() {
    let handler = Arc::new(Noop);
    let op = Overlapped::with_handler(&handler, None);
    op.begin();
    op.finish(0, Ok(()), Vec::new(), None);
    let _ = op.retire();
    op.begin();
  }

  #[test]
  #[should_panic(expected = "while a completion is outstanding")]
  fn test_reset_in_flight_panics() {
    let op = Overlapped::unarmed(None);
    op.begin();
    op.reset();
  }

  #[test]
  #[should_panic(expected = "no live completion handler")]
  fn test_retire_dropped_handler_panics() {
    let handler = Arc::new(Noop);
    let op = Overlapped::with_handler(&handler, None);
    drop(handler);
    op.begin();
    let _ = op.retire();
  }

  #[test]
  fn test_result_reports_failure_bytes() {
    let op = Overlapped::unarmed(None);
    op.begin();
    op.finish(7, Err(libc::ECONNRESET), Vec::new(), None);

    let err = op.result().unwrap().unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ECONNRESET));
  }

  #[test]
  fn test_wait_sees_dispatched_result() {
    let handler = Arc::new(Noop);
    let op = Overlapped::with_handler(&handler, Some(Arc::new(Event::new())));
    op.begin();
    op.finish(5, Ok(()), Vec::new(), None);

    // Finished but not yet handed to the handler.
    assert!(op.wait(Some(Duration::ZERO)).unwrap().is_none());

    let _ = op.retire();
    op.notify_waiter();
    let result = op.wait(Some(Duration::ZERO)).unwrap();
    assert_eq!(result.unwrap().unwrap(), 5);

    op.reset();
    assert!(op.wait(Some(Duration::ZERO)).unwrap().is_none());
  }

  #[test]
  fn test_wait_without_event_is_error() {
    let op = Overlapped::unarmed(None);
    assert!(op.wait(Some(Duration::ZERO)).is_err());
  }
}
