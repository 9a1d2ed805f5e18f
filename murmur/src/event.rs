//! Auto-reset wait primitive backed by `eventfd`.

use std::{
  io,
  os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
  sync::OnceLock,
  time::Duration,
};

use crate::CompletionPort;

/// A wait-able signal that resets itself when a waiter observes it.
///
/// An event can additionally be linked to a [`CompletionPort`]; it then also
/// reports ready whenever the port has entries to drain. The port itself
/// decides readiness, the event only exposes it.
pub struct Event {
  fd: OwnedFd,
  linked: OnceLock<CompletionPort>,
}

impl Event {
  /// Creates an unsignaled event.
  ///
  /// # Panics
  ///
  /// Panics if the OS cannot allocate the eventfd.
  pub fn new() -> Self {
    let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))
      .unwrap_or_else(|err| panic!("murmur: failed to allocate event: {err}"));

    // SAFETY: eventfd just returned a fresh descriptor we own.
    Self { fd: unsafe { OwnedFd::from_raw_fd(fd) }, linked: OnceLock::new() }
  }

  /// Sets the event; one waiter will observe it.
  pub fn signal(&self) -> io::Result<()> {
    let one: u64 = 1;
    let result = syscall!(write(
      self.fd.as_raw_fd(),
      &one as *const u64 as *const libc::c_void,
      std::mem::size_of::<u64>(),
    ));

    match result {
      // Counter saturated: already signaled.
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
      other => other.map(|_| ()),
    }
  }

  /// Clears the event without waiting. Returns whether it was set.
  pub fn try_reset(&self) -> bool {
    let mut value: u64 = 0;
    syscall!(read(
      self.fd.as_raw_fd(),
      &mut value as *mut u64 as *mut libc::c_void,
      std::mem::size_of::<u64>(),
    ))
    .is_ok()
  }

  /// Waits until the event is signaled, the linked port has entries, or the
  /// timeout elapses. `None` waits forever.
  ///
  /// Returns `Ok(false)` on timeout. Observing the event's own signal resets
  /// it.
  pub fn wait_one(&self, timeout: Option<Duration>) -> io::Result<bool> {
    let mut fds = [
      libc::pollfd { fd: self.fd.as_raw_fd(), events: libc::POLLIN, revents: 0 },
      libc::pollfd { fd: -1, events: libc::POLLIN, revents: 0 },
    ];
    if let Some(port) = self.linked.get() {
      fds[1].fd = port.as_raw_fd();
    }

    let timeout_ms = timeout_millis(timeout);

    let n = loop {
      match syscall!(poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms))
      {
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        other => break other?,
      }
    };

    if n == 0 {
      return Ok(false);
    }

    if fds[0].revents & libc::POLLIN != 0 {
      self.try_reset();
    }
    Ok(true)
  }

  /// Makes this event report ready while `port` has entries.
  ///
  /// # Panics
  ///
  /// Panics if the event is already linked to a port.
  pub(crate) fn link(&self, port: CompletionPort) {
    assert!(
      self.linked.set(port).is_ok(),
      "murmur: event is already linked to a completion port"
    );
  }
}

/// Converts a timeout for `poll`-style calls: `-1` waits forever, and a
/// partial millisecond rounds up so short timeouts still sleep.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> i32 {
  match timeout {
    Some(d) => d.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32,
    None => -1,
  }
}

impl Default for Event {
  fn default() -> Self {
    Self::new()
  }
}

impl AsRawFd for Event {
  fn as_raw_fd(&self) -> RawFd {
    self.fd.as_raw_fd()
  }
}

impl std::fmt::Debug for Event {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Event")
      .field("fd", &self.fd.as_raw_fd())
      .field("linked", &self.linked.get().is_some())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{sync::Arc, thread, time::Instant};

  #[test]
  fn test_wait_times_out() {
    let event = Event::new();
    let start = Instant::now();
    assert!(!event.wait_one(Some(Duration::from_millis(20))).unwrap());
    assert!(start.elapsed() >= Duration::from_millis(15));
  }

  #[test]
  fn test_sub_millisecond_timeout_still_sleeps() {
    assert_eq!(timeout_millis(None), -1);
    assert_eq!(timeout_millis(Some(Duration::ZERO)), 0);
    assert_eq!(timeout_millis(Some(Duration::from_micros(1))), 1);
    assert_eq!(timeout_millis(Some(Duration::from_micros(1500))), 2);
    assert_eq!(timeout_millis(Some(Duration::from_secs(u64::MAX))), i32::MAX);

    let event = Event::new();
    let start = Instant::now();
    assert!(!event.wait_one(Some(Duration::from_micros(500))).unwrap());
    assert!(start.elapsed() >= Duration::from_micros(500));
  }

  #[test]
  fn test_signal_is_auto_reset() {
    let event = Event::new();
    event.signal().unwrap();
    event.signal().unwrap();

    assert!(event.wait_one(Some(Duration::ZERO)).unwrap());
    assert!(!event.wait_one(Some(Duration::ZERO)).unwrap());
  }

  #[test]
  fn test_signal_from_other_thread() {
    let event = Arc::new(Event::new());
    let signaler = Arc::clone(&event);

    let handle = thread::spawn(move || {
      thread::sleep(Duration::from_millis(10));
      signaler.signal().unwrap();
    });

    assert!(event.wait_one(Some(Duration::from_secs(5))).unwrap());
    handle.join().unwrap();
  }

  #[test]
  fn test_try_reset() {
    let event = Event::new();
    assert!(!event.try_reset());
    event.signal().unwrap();
    assert!(event.try_reset());
    assert!(!event.try_reset());
  }
}
