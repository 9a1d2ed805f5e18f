#![cfg_attr(docsrs, feature(doc_cfg))]

//! # Murmur - completion-port networking core
//!
//! Murmur is the transport substrate of a publish/subscribe message bus. It
//! drives non-blocking sockets through a completion port and frames messages
//! with a compact length-prefixed format.
//!
//! ## Components
//! - [`lips`]: the LiPS (Length-Prefixed Strings) wire codec for [`Message`].
//! - [`Overlapped`]: one in-flight request, its handler and wait event.
//! - [`CompletionPort`]: attaches handles, drains completions and dispatches
//!   them to the owning operation's handler.
//! - [`AsyncSocket`]: the asynchronous socket contract, implemented by
//!   [`TcpSocket`].
//! - [`EventedDispatcher`]: pairs an [`Event`] with a port for an external
//!   run loop.
//!
//! ## Platform support
//!
//! | Platform | Completion source          | Status |
//! |----------|----------------------------|--------|
//! | Linux    | epoll readiness, completed | Yes    |
//!
//! Readiness reported by epoll is turned into finished operations before any
//! handler runs, so handlers only ever observe completions.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use murmur::{Completion, CompletionHandler, CompletionPort, Overlapped};
//! use murmur::{AsyncSocket, TcpSocket};
//!
//! struct Printer;
//!
//! impl CompletionHandler for Printer {
//!   fn completed(&self, completion: Completion, _op: &Arc<Overlapped>) {
//!     println!("accepted: {:?}", completion.is_success());
//!   }
//! }
//!
//! let port = CompletionPort::new();
//! let listener = TcpSocket::bind_listener("127.0.0.1:0".parse().unwrap(), 128)?;
//! port.attach(&listener);
//!
//! let printer = Arc::new(Printer);
//! let op = Overlapped::with_handler(&printer, None);
//! listener.accept(&op)?;
//!
//! loop {
//!   port.flush();
//! # break;
//! }
//! # Ok::<(), std::io::Error>(())
//! ```
//!
//! ## Error Handling
//!
//! Two classes of failure never mix:
//! - Internal defects (dispatching an unarmed operation, an oversized length
//!   prefix, an OS refusing to create a port) panic.
//! - Untrusted input and I/O failures are values: [`lips::DecodeError`] and
//!   [`std::io::Error`], the latter delivered inside [`Completion`].

#[cfg(not(linux))]
compile_error!("murmur currently supports Linux (epoll) only");

macro_rules! syscall {
  ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
      #[allow(unused_unsafe)]
      let res = unsafe { libc::$fn($($arg, )*) };
      if res == -1 {
          Err(std::io::Error::last_os_error())
      } else {
          Ok(res)
      }
  }};
}

pub mod config;
pub mod dispatcher;
pub mod event;
pub mod lips;
pub mod message;
pub mod overlapped;
pub mod port;
pub mod socket;

pub use config::PortConfig;
pub use dispatcher::EventedDispatcher;
pub use event::Event;
pub use message::Message;
pub use overlapped::{Accepted, Completion, CompletionHandler, Overlapped};
pub use port::{Attachment, CompletionPort, Drained, IoHandle};
pub use socket::{
  AsyncSocket, DisconnectFlags, TcpSocket, TransmitFile, TransmitPacket,
};
