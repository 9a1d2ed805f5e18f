//! Non-blocking bodies of the asynchronous socket requests.
//!
//! A request is attempted whenever its handle reports readiness. It either
//! finishes (successfully or not) or reports that it would block, in which
//! case the port re-arms the handle and tries again later.

use std::{
  fs::File,
  io,
  mem,
  net::{Shutdown, SocketAddr},
  os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
  sync::Arc,
};

use crate::{
  overlapped::Accepted,
  socket::{
    DisconnectFlags, TransmitPacket,
    addr::{sockaddr_storage_into_std, std_into_sockaddr_storage},
  },
};

/// Largest single `sendfile` chunk Linux accepts.
const MAX_SENDFILE: usize = 0x7fff_f000;

/// Linux's limit on buffers per `sendmsg`/`recvmsg`.
const IOV_MAX: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
  Read,
  Write,
}

pub(crate) enum Outcome {
  WouldBlock,
  Done(Result<(), i32>),
}

/// Everything that leaves a finished request and ends up in the operation.
pub(crate) struct Finished {
  pub transferred: usize,
  pub buffers: Vec<Vec<u8>>,
  pub accepted: Option<Accepted>,
}

pub(crate) enum Request {
  Accept { accepted: Option<Accepted> },
  Connect { addr: SocketAddr, first: Option<Vec<u8>>, sent: usize, connected: bool },
  Disconnect { flags: DisconnectFlags },
  Send { bufs: Vec<Vec<u8>>, sent: usize },
  Recv { bufs: Vec<Vec<u8>>, received: usize },
  Transmit { packets: Vec<TransmitPacket>, send_size: usize, cursor: PacketCursor },
}

#[derive(Default)]
pub(crate) struct PacketCursor {
  index: usize,
  /// Bytes of `packets[index]` already sent.
  progress: u64,
  total: usize,
}

impl Request {
  pub fn transmit(packets: Vec<TransmitPacket>, send_size: usize) -> Self {
    let send_size = if send_size == 0 { MAX_SENDFILE } else { send_size.min(MAX_SENDFILE) };
    Request::Transmit { packets, send_size, cursor: PacketCursor::default() }
  }

  pub fn name(&self) -> &'static str {
    match self {
      Request::Accept { .. } => "accept",
      Request::Connect { .. } => "connect",
      Request::Disconnect { .. } => "disconnect",
      Request::Send { .. } => "send",
      Request::Recv { .. } => "recv",
      Request::Transmit { .. } => "transmit",
    }
  }

  pub fn direction(&self) -> Direction {
    match self {
      Request::Accept { .. } | Request::Recv { .. } => Direction::Read,
      _ => Direction::Write,
    }
  }

  /// Whether the request can run without waiting for readiness.
  pub fn never_blocks(&self) -> bool {
    matches!(self, Request::Disconnect { .. })
  }

  /// The synchronous part of issuing, run before the request is queued.
  pub fn start(&mut self, fd: RawFd) -> io::Result<()> {
    let Request::Connect { addr, .. } = self else {
      return Ok(());
    };

    let (storage, len) = std_into_sockaddr_storage(*addr);
    match syscall!(connect(
      fd,
      &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
      len
    )) {
      Ok(_) => Ok(()),
      Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(()),
      Err(err) => Err(err),
    }
  }

  pub fn perform(&mut self, fd: RawFd) -> Outcome {
    match self {
      Request::Accept { accepted } => accept(fd, accepted),
      Request::Connect { first, sent, connected, .. } => {
        if !*connected {
          match connect_status(fd) {
            Outcome::Done(Ok(())) => *connected = true,
            other => return other,
          }
        }
        match first {
          Some(buf) => send_all(fd, std::slice::from_ref(buf), sent),
          None => Outcome::Done(Ok(())),
        }
      }
      Request::Disconnect { flags } => disconnect(fd, *flags),
      Request::Send { bufs, sent } => send_all(fd, bufs, sent),
      Request::Recv { bufs, received } => recv(fd, bufs, received),
      Request::Transmit { packets, send_size, cursor } => {
        transmit(fd, packets, *send_size, cursor)
      }
    }
  }

  pub fn finish(self) -> Finished {
    let (transferred, buffers, accepted) = match self {
      Request::Accept { accepted } => (0, Vec::new(), accepted),
      Request::Connect { first, sent, .. } => {
        (sent, first.into_iter().collect(), None)
      }
      Request::Disconnect { .. } => (0, Vec::new(), None),
      Request::Send { bufs, sent } => (sent, bufs, None),
      Request::Recv { bufs, received } => (received, bufs, None),
      Request::Transmit { packets, cursor, .. } => {
        let buffers = packets
          .into_iter()
          .filter_map(|packet| match packet {
            TransmitPacket::Memory(buf) => Some(buf),
            TransmitPacket::File { .. } => None,
          })
          .collect();
        (cursor.total, buffers, None)
      }
    };

    Finished { transferred, buffers, accepted }
  }
}

fn would_block(err: &io::Error) -> bool {
  err.kind() == io::ErrorKind::WouldBlock
}

fn os_code(err: io::Error) -> i32 {
  err.raw_os_error().unwrap_or(libc::EIO)
}

fn accept(fd: RawFd, slot: &mut Option<Accepted>) -> Outcome {
  let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
  let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

  let result = syscall!(accept4(
    fd,
    &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
    &mut len,
    libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK
  ));

  match result {
    Ok(new_fd) => {
      // SAFETY: accept4 returned a fresh descriptor we now own.
      let owned = unsafe { OwnedFd::from_raw_fd(new_fd) };
      // SAFETY: the kernel filled `storage` with `len` valid bytes.
      match unsafe { sockaddr_storage_into_std(&storage) } {
        Ok(peer) => {
          *slot = Some(Accepted { fd: owned, peer });
          Outcome::Done(Ok(()))
        }
        Err(err) => Outcome::Done(Err(os_code(err))),
      }
    }
    Err(err) if would_block(&err) => Outcome::WouldBlock,
    // The aborted connection is gone, wait for the next one.
    Err(err) if err.raw_os_error() == Some(libc::ECONNABORTED) => {
      Outcome::WouldBlock
    }
    Err(err) => Outcome::Done(Err(os_code(err))),
  }
}

fn connect_status(fd: RawFd) -> Outcome {
  let mut code: libc::c_int = 0;
  let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
  if let Err(err) = syscall!(getsockopt(
    fd,
    libc::SOL_SOCKET,
    libc::SO_ERROR,
    &mut code as *mut libc::c_int as *mut libc::c_void,
    &mut len
  )) {
    return Outcome::Done(Err(os_code(err)));
  }
  if code != 0 {
    return Outcome::Done(Err(code));
  }

  // No error yet, but the handshake may still be running.
  let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
  let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
  match syscall!(getpeername(
    fd,
    &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
    &mut len
  )) {
    Ok(_) => Outcome::Done(Ok(())),
    Err(err) if err.raw_os_error() == Some(libc::ENOTCONN) => {
      Outcome::WouldBlock
    }
    Err(err) => Outcome::Done(Err(os_code(err))),
  }
}

fn disconnect(fd: RawFd, flags: DisconnectFlags) -> Outcome {
  let how = match flags.how {
    Shutdown::Read => libc::SHUT_RD,
    Shutdown::Write => libc::SHUT_WR,
    Shutdown::Both => libc::SHUT_RDWR,
  };

  match syscall!(shutdown(fd, how)) {
    Ok(_) => {}
    // Already torn down by the peer; the socket is disconnected either way.
    Err(err) if err.raw_os_error() == Some(libc::ENOTCONN) => {}
    Err(err) => return Outcome::Done(Err(os_code(err))),
  }

  if flags.reuse {
    // Connecting to AF_UNSPEC dissolves the association so the descriptor
    // can be connected again.
    let mut unspec: libc::sockaddr = unsafe { mem::zeroed() };
    unspec.sa_family = libc::AF_UNSPEC as libc::sa_family_t;
    if let Err(err) = syscall!(connect(
      fd,
      &unspec,
      mem::size_of::<libc::sockaddr>() as libc::socklen_t
    )) {
      return Outcome::Done(Err(os_code(err)));
    }
  }

  Outcome::Done(Ok(()))
}

/// Builds iovecs for the part of `bufs` past `skip` bytes, at most
/// `IOV_MAX` of them.
fn iovecs(bufs: &[Vec<u8>], mut skip: usize) -> Vec<libc::iovec> {
  let mut out = Vec::with_capacity(bufs.len().min(IOV_MAX));
  for buf in bufs {
    if out.len() == IOV_MAX {
      break;
    }
    if skip >= buf.len() {
      skip -= buf.len();
      continue;
    }
    let rest = &buf[skip..];
    skip = 0;
    out.push(libc::iovec {
      iov_base: rest.as_ptr() as *mut libc::c_void,
      iov_len: rest.len(),
    });
  }
  out
}

fn send_all(fd: RawFd, bufs: &[Vec<u8>], sent: &mut usize) -> Outcome {
  let total: usize = bufs.iter().map(Vec::len).sum();

  while *sent < total {
    let mut iov = iovecs(bufs, *sent);
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = iov.len() as _;

    match syscall!(sendmsg(fd, &msg, libc::MSG_NOSIGNAL)) {
      Ok(n) => *sent += n as usize,
      Err(err) if would_block(&err) => return Outcome::WouldBlock,
      Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
      Err(err) => return Outcome::Done(Err(os_code(err))),
    }
  }

  Outcome::Done(Ok(()))
}

fn recv(fd: RawFd, bufs: &mut [Vec<u8>], received: &mut usize) -> Outcome {
  let mut iov: Vec<libc::iovec> = bufs
    .iter_mut()
    .take(IOV_MAX)
    .map(|buf| libc::iovec {
      iov_base: buf.as_mut_ptr() as *mut libc::c_void,
      iov_len: buf.len(),
    })
    .collect();

  let mut msg: libc::msghdr = unsafe { mem::zeroed() };
  msg.msg_iov = iov.as_mut_ptr();
  msg.msg_iovlen = iov.len() as _;

  loop {
    match syscall!(recvmsg(fd, &mut msg, 0)) {
      // Zero bytes is a graceful close and still a successful completion.
      Ok(n) => {
        *received = n as usize;
        return Outcome::Done(Ok(()));
      }
      Err(err) if would_block(&err) => return Outcome::WouldBlock,
      Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
      Err(err) => return Outcome::Done(Err(os_code(err))),
    }
  }
}

fn transmit(
  fd: RawFd,
  packets: &[TransmitPacket],
  send_size: usize,
  cursor: &mut PacketCursor,
) -> Outcome {
  while let Some(packet) = packets.get(cursor.index) {
    let step = match packet {
      TransmitPacket::Memory(buf) => {
        let mut sent = cursor.progress as usize;
        let outcome = send_all(fd, std::slice::from_ref(buf), &mut sent);
        cursor.total += sent - cursor.progress as usize;
        cursor.progress = sent as u64;
        outcome
      }
      TransmitPacket::File { file, offset, len } => {
        send_file(fd, file, *offset, *len, send_size, cursor)
      }
    };

    match step {
      Outcome::Done(Ok(())) => {
        cursor.index += 1;
        cursor.progress = 0;
      }
      other => return other,
    }
  }

  Outcome::Done(Ok(()))
}

fn send_file(
  fd: RawFd,
  file: &Arc<File>,
  offset: u64,
  len: Option<u64>,
  send_size: usize,
  cursor: &mut PacketCursor,
) -> Outcome {
  loop {
    let remaining = match len {
      Some(len) if cursor.progress >= len => return Outcome::Done(Ok(())),
      Some(len) => (len - cursor.progress).min(send_size as u64) as usize,
      None => send_size,
    };

    let mut file_offset = (offset + cursor.progress) as libc::off_t;
    match syscall!(sendfile(fd, file.as_raw_fd(), &mut file_offset, remaining)) {
      // End of file.
      Ok(0) => {
        return match len {
          None => Outcome::Done(Ok(())),
          Some(_) => Outcome::Done(Err(libc::EIO)),
        };
      }
      Ok(n) => {
        cursor.progress += n as u64;
        cursor.total += n as usize;
      }
      Err(err) if would_block(&err) => return Outcome::WouldBlock,
      Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
      Err(err) => return Outcome::Done(Err(os_code(err))),
    }
  }
}
