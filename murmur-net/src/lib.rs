//! Connection management on top of the [`murmur`] completion port.
//!
//! A [`Session`] frames [`Message`](murmur::Message)s over one connected
//! socket. Sessions are opened by an [`Acceptor`] (server side) or a
//! [`Connector`] (client side) and report what happens to them through
//! [`SessionEvents`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use murmur::{CompletionPort, Message};
//! use murmur_net::{Acceptor, Session, SessionConfig, SessionEvents};
//!
//! struct Echo;
//!
//! impl SessionEvents for Echo {
//!   fn on_message(&self, session: &Arc<Session>, message: Message) {
//!     let _ = session.send(&message);
//!   }
//! }
//!
//! let port = CompletionPort::new();
//! let acceptor = Acceptor::bind(
//!   &port,
//!   "127.0.0.1:7000".parse().unwrap(),
//!   SessionConfig::default(),
//!   Arc::new(Echo),
//! )?;
//!
//! loop {
//!   port.drain_one(None);
//! # break;
//! }
//! # acceptor.stop();
//! # Ok::<(), std::io::Error>(())
//! ```

mod acceptor;
mod config;
mod connector;
mod error;
mod session;

pub use acceptor::Acceptor;
pub use config::SessionConfig;
pub use connector::Connector;
pub use error::SessionError;
pub use session::{Role, Session, SessionEvents, SessionId};
