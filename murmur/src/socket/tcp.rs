use std::{
  fmt, io,
  net::SocketAddr,
  os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
  sync::Arc,
};

use parking_lot::Mutex;

use super::{AsyncSocket, DisconnectFlags, TransmitPacket, addr};
use crate::{
  Accepted, Overlapped,
  port::{Attachment, IoHandle, request::Request},
};

/// A non-blocking TCP socket driven by a [`CompletionPort`].
///
/// The socket must be [attached](crate::CompletionPort::attach) before any
/// asynchronous request is issued. Dropping it cancels everything still
/// pending (the handlers see `ECANCELED`) before the descriptor is closed.
///
/// # Examples
///
/// ```rust,no_run
/// use murmur::{CompletionPort, TcpSocket};
///
/// let port = CompletionPort::new();
/// let listener = TcpSocket::bind_listener("127.0.0.1:0".parse().unwrap(), 64)?;
/// port.attach(&listener);
/// println!("listening on {}", listener.local_addr()?);
/// # Ok::<(), std::io::Error>(())
/// ```
///
/// [`CompletionPort`]: crate::CompletionPort
pub struct TcpSocket {
  fd: OwnedFd,
  attachment: Attachment,
  peer: Mutex<Option<SocketAddr>>,
}

impl TcpSocket {
  /// Creates an unconnected socket of the address family of `addr`.
  pub fn new(addr: &SocketAddr) -> io::Result<Self> {
    let domain = match addr {
      SocketAddr::V4(_) => libc::AF_INET,
      SocketAddr::V6(_) => libc::AF_INET6,
    };
    Self::with_domain(domain)
  }

  pub fn new_v4() -> io::Result<Self> {
    Self::with_domain(libc::AF_INET)
  }

  pub fn new_v6() -> io::Result<Self> {
    Self::with_domain(libc::AF_INET6)
  }

  fn with_domain(domain: libc::c_int) -> io::Result<Self> {
    let fd = syscall!(socket(
      domain,
      libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
      0
    ))?;
    // SAFETY: socket returned a fresh descriptor we own.
    Ok(Self::from_fd(unsafe { OwnedFd::from_raw_fd(fd) }))
  }

  fn from_fd(fd: OwnedFd) -> Self {
    Self { fd, attachment: Attachment::new(), peer: Mutex::new(None) }
  }

  /// Wraps a connection produced by an accept. The new socket is not
  /// attached to any port yet.
  pub fn from_accepted(accepted: Accepted) -> Self {
    let socket = Self::from_fd(accepted.fd);
    *socket.peer.lock() = Some(accepted.peer);
    socket
  }

  /// Binds to `addr` with `SO_REUSEADDR` set.
  pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
    let one: libc::c_int = 1;
    syscall!(setsockopt(
      self.fd.as_raw_fd(),
      libc::SOL_SOCKET,
      libc::SO_REUSEADDR,
      &one as *const libc::c_int as *const libc::c_void,
      std::mem::size_of::<libc::c_int>() as libc::socklen_t
    ))?;

    let (storage, len) = addr::std_into_sockaddr_storage(addr);
    syscall!(bind(
      self.fd.as_raw_fd(),
      &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
      len
    ))?;
    Ok(())
  }

  pub fn listen(&self, backlog: i32) -> io::Result<()> {
    syscall!(listen(self.fd.as_raw_fd(), backlog))?;
    Ok(())
  }

  /// Creates, binds and listens in one go.
  pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<Self> {
    let socket = Self::new(&addr)?;
    socket.bind(addr)?;
    socket.listen(backlog)?;
    Ok(socket)
  }

  pub fn local_addr(&self) -> io::Result<SocketAddr> {
    addr::local_addr(self.fd.as_raw_fd())
  }

  pub fn peer_addr(&self) -> io::Result<SocketAddr> {
    match *self.peer.lock() {
      Some(peer) => Ok(peer),
      None => addr::peer_addr(self.fd.as_raw_fd()),
    }
  }

  /// Cancels every pending request and detaches the socket from its port.
  /// Further requests fail. Returns how many requests were cancelled.
  pub fn cancel(&self) -> usize {
    match self.attachment.port() {
      Some(port) => port.cancel(self),
      None => 0,
    }
  }

  /// Cancels pending requests and closes the descriptor.
  pub fn close(self) {
    drop(self);
  }

  fn submit(&self, request: Request, op: &Arc<Overlapped>) -> io::Result<()> {
    let Some(port) = self.attachment.port() else {
      return Err(io::Error::new(
        io::ErrorKind::NotConnected,
        "socket is not attached to a completion port",
      ));
    };
    port.submit(self.fd.as_raw_fd(), request, op)
  }
}

impl AsyncSocket for TcpSocket {
  fn accept(&self, op: &Arc<Overlapped>) -> io::Result<()> {
    self.submit(Request::Accept { accepted: None }, op)
  }

  fn connect(
    &self,
    addr: SocketAddr,
    first_send: Option<Vec<u8>>,
    op: &Arc<Overlapped>,
  ) -> io::Result<()> {
    let request =
      Request::Connect { addr, first: first_send, sent: 0, connected: false };
    self.submit(request, op)
  }

  fn disconnect(
    &self,
    flags: DisconnectFlags,
    op: &Arc<Overlapped>,
  ) -> io::Result<()> {
    if flags.reuse {
      // The descriptor may be connected elsewhere next.
      self.peer.lock().take();
    }
    self.submit(Request::Disconnect { flags }, op)
  }

  fn send(&self, bufs: Vec<Vec<u8>>, op: &Arc<Overlapped>) -> io::Result<()> {
    self.submit(Request::Send { bufs, sent: 0 }, op)
  }

  fn recv(&self, bufs: Vec<Vec<u8>>, op: &Arc<Overlapped>) -> io::Result<()> {
    // A zero-length receive would be indistinguishable from end of stream.
    if bufs.iter().all(Vec::is_empty) {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "receive needs a non-empty buffer",
      ));
    }
    self.submit(Request::Recv { bufs, received: 0 }, op)
  }

  fn transmit_packets(
    &self,
    packets: Vec<TransmitPacket>,
    send_size: usize,
    op: &Arc<Overlapped>,
  ) -> io::Result<()> {
    self.submit(Request::transmit(packets, send_size), op)
  }

  fn cancel_writes(&self) -> usize {
    match self.attachment.port() {
      Some(port) => port.cancel_writes(self),
      None => 0,
    }
  }

  fn local_address(&self) -> io::Result<String> {
    self.local_addr().map(|addr| addr.to_string())
  }

  fn peer_address(&self) -> io::Result<String> {
    self.peer_addr().map(|addr| addr.to_string())
  }

  fn connection_established(&self) -> io::Result<()> {
    let peer = addr::peer_addr(self.fd.as_raw_fd())?;
    *self.peer.lock() = Some(peer);
    Ok(())
  }
}

impl IoHandle for TcpSocket {
  fn attachment(&self) -> &Attachment {
    &self.attachment
  }
}

impl AsRawFd for TcpSocket {
  fn as_raw_fd(&self) -> RawFd {
    self.fd.as_raw_fd()
  }
}

impl Drop for TcpSocket {
  fn drop(&mut self) {
    self.cancel();
  }
}

impl fmt::Debug for TcpSocket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TcpSocket")
      .field("fd", &self.fd.as_raw_fd())
      .field("attached", &self.attachment.port().is_some())
      .field("peer", &*self.peer.lock())
      .finish()
  }
}
