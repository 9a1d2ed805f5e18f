//! The asynchronous socket contract and its TCP implementation.
//!
//! Every asynchronous call takes the [`Overlapped`] that will carry its
//! completion. `Ok(())` means the request was initiated and its completion
//! will later be dispatched by the socket's [`CompletionPort`]; `Err` means
//! it failed synchronously and nothing will be dispatched.
//!
//! Buffers are moved into the request and handed back through
//! [`Overlapped::take_buffers`] once it completes.
//!
//! [`CompletionPort`]: crate::CompletionPort

pub(crate) mod addr;
mod tcp;

use std::{
  fs::File,
  io,
  net::{Shutdown, SocketAddr},
  sync::Arc,
};

use crate::Overlapped;

pub use tcp::TcpSocket;

/// How a [`disconnect`](AsyncSocket::disconnect) tears the connection down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectFlags {
  pub how: Shutdown,
  /// Dissolve the association afterwards so the socket can connect again.
  pub reuse: bool,
}

impl DisconnectFlags {
  pub fn new(how: Shutdown) -> Self {
    Self { how, reuse: false }
  }

  pub fn reuse(mut self, reuse: bool) -> Self {
    self.reuse = reuse;
    self
  }
}

impl Default for DisconnectFlags {
  fn default() -> Self {
    Self::new(Shutdown::Both)
  }
}

/// A file transmission: optional head, a file region, optional tail.
///
/// The region starts at the operation's [`offset`](Overlapped::offset).
#[derive(Debug, Clone)]
pub struct TransmitFile {
  pub file: Arc<File>,
  /// `None` sends until end of file.
  pub bytes_to_write: Option<u64>,
  /// Size of each chunk handed to the OS; zero picks the largest allowed.
  pub bytes_per_send: usize,
  pub head: Option<Vec<u8>>,
  pub tail: Option<Vec<u8>>,
}

impl TransmitFile {
  pub fn new(file: Arc<File>) -> Self {
    Self { file, bytes_to_write: None, bytes_per_send: 0, head: None, tail: None }
  }
}

/// One element of a [`transmit_packets`](AsyncSocket::transmit_packets) call.
#[derive(Debug, Clone)]
pub enum TransmitPacket {
  Memory(Vec<u8>),
  File {
    file: Arc<File>,
    offset: u64,
    /// `None` sends until end of file.
    len: Option<u64>,
  },
}

/// Asynchronous socket operations completed through a completion port.
///
/// Requests of the same direction complete in issue order. Receives and
/// accepts form one direction, everything else the other. A disconnect
/// waits behind earlier writes; one issued with no write pending finishes
/// at once.
pub trait AsyncSocket: Send + Sync {
  /// Accepts one connection; collect it with
  /// [`Overlapped::take_accepted`].
  fn accept(&self, op: &Arc<Overlapped>) -> io::Result<()>;

  /// Connects to `addr`, then sends `first_send` if given. The completion's
  /// byte count is what was sent.
  fn connect(
    &self,
    addr: SocketAddr,
    first_send: Option<Vec<u8>>,
    op: &Arc<Overlapped>,
  ) -> io::Result<()>;

  fn disconnect(
    &self,
    flags: DisconnectFlags,
    op: &Arc<Overlapped>,
  ) -> io::Result<()>;

  /// Sends every buffer, in order, as one request.
  fn send(&self, bufs: Vec<Vec<u8>>, op: &Arc<Overlapped>) -> io::Result<()>;

  /// Receives once into `bufs`, filling them in order. A completion of zero
  /// bytes means the peer closed the connection.
  fn recv(&self, bufs: Vec<Vec<u8>>, op: &Arc<Overlapped>) -> io::Result<()>;

  fn transmit_packets(
    &self,
    packets: Vec<TransmitPacket>,
    send_size: usize,
    op: &Arc<Overlapped>,
  ) -> io::Result<()>;

  fn transmit_file(
    &self,
    transmit: TransmitFile,
    op: &Arc<Overlapped>,
  ) -> io::Result<()> {
    let TransmitFile { file, bytes_to_write, bytes_per_send, head, tail } =
      transmit;

    let mut packets = Vec::with_capacity(3);
    packets.extend(head.map(TransmitPacket::Memory));
    packets.push(TransmitPacket::File {
      file,
      offset: op.offset(),
      len: bytes_to_write,
    });
    packets.extend(tail.map(TransmitPacket::Memory));

    self.transmit_packets(packets, bytes_per_send, op)
  }

  /// Completes every pending request except receives and accepts with
  /// `ECANCELED`. The socket stays usable. Returns how many were cancelled.
  fn cancel_writes(&self) -> usize;

  fn local_address(&self) -> io::Result<String>;

  fn peer_address(&self) -> io::Result<String>;

  /// Called by the owner once an accept or connect has completed
  /// successfully on this socket.
  fn connection_established(&self) -> io::Result<()>;
}
