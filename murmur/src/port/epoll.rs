use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{io, ptr};

use crate::{Event, event::timeout_millis};

/// Key reserved for the wake-up event.
pub const NOTIFY_KEY: u64 = u64::MAX;

/// Wrapper around an epoll file descriptor.
///
/// Every attached handle is registered once with `EPOLLONESHOT`; the port
/// re-arms it with the interest its pending requests need.
pub struct OsPoller {
  epoll_fd: OwnedFd,
  /// Level-triggered, so the epoll fd stays readable until it is reset.
  notifier: Event,
}

impl OsPoller {
  pub fn new() -> io::Result<Self> {
    let epoll_fd = unsafe {
      let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
      OwnedFd::from_raw_fd(fd)
    };

    let poller = Self { epoll_fd, notifier: Event::new() };

    let mut event =
      libc::epoll_event { events: libc::EPOLLIN as u32, u64: NOTIFY_KEY };
    syscall!(epoll_ctl(
      poller.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_ADD,
      poller.notifier.as_raw_fd(),
      &mut event as *mut libc::epoll_event,
    ))?;

    Ok(poller)
  }

  /// Registers `fd` without any interest yet.
  pub fn add(&self, fd: RawFd, key: u64) -> io::Result<()> {
    let mut event =
      libc::epoll_event { events: libc::EPOLLONESHOT as u32, u64: key };

    syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_ADD,
      fd,
      &mut event as *mut libc::epoll_event,
    ))?;
    Ok(())
  }

  /// Re-arms `fd` for one notification.
  pub fn modify(
    &self,
    fd: RawFd,
    key: u64,
    readable: bool,
    writable: bool,
  ) -> io::Result<()> {
    let mut events = libc::EPOLLONESHOT as u32;
    if readable {
      events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }
    if writable {
      events |= libc::EPOLLOUT as u32;
    }

    let mut event = libc::epoll_event { events, u64: key };

    syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_MOD,
      fd,
      &mut event as *mut libc::epoll_event,
    ))?;
    Ok(())
  }

  pub fn delete(&self, fd: RawFd) -> io::Result<()> {
    // For EPOLL_CTL_DEL, event pointer can be NULL in Linux 2.6.9+
    match syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_DEL,
      fd,
      ptr::null_mut(),
    )) {
      Ok(_) => Ok(()),
      Err(err) => Err(match err.raw_os_error() {
        Some(libc::EBADF) => io::Error::from_raw_os_error(libc::ENOENT),
        _ => err,
      }),
    }
  }

  /// Waits for events, filling the provided buffer.
  /// Returns the number of events received; `EINTR` counts as zero.
  pub fn wait(
    &self,
    events: &mut [libc::epoll_event],
    timeout: Option<Duration>,
  ) -> io::Result<usize> {
    let timeout_ms = timeout_millis(timeout);

    match syscall!(epoll_wait(
      self.epoll_fd.as_raw_fd(),
      events.as_mut_ptr(),
      events.len() as i32,
      timeout_ms,
    )) {
      Ok(n) => {
        let n = n as usize;
        assert!(
          n <= events.len(),
          "epoll_wait returned more events ({}) than buffer size ({})",
          n,
          events.len()
        );
        Ok(n)
      }
      Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(0),
      Err(err) => Err(err),
    }
  }

  pub fn notify(&self) -> io::Result<()> {
    self.notifier.signal()
  }

  pub fn clear_notification(&self) {
    self.notifier.try_reset();
  }
}

impl AsRawFd for OsPoller {
  fn as_raw_fd(&self) -> RawFd {
    self.epoll_fd.as_raw_fd()
  }
}
