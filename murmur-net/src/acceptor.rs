use std::{
  fmt, io,
  net::SocketAddr,
  sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
  },
};

use murmur::{
  AsyncSocket, Completion, CompletionHandler, CompletionPort, Overlapped,
  TcpSocket,
};
use parking_lot::Mutex;

use crate::{Role, Session, SessionConfig, SessionEvents};

/// Accepts connections on a listening socket and opens a server-side
/// [`Session`] for each.
///
/// One accept is outstanding at all times; it is reissued after every
/// completion until [`stop`](Self::stop).
pub struct Acceptor {
  listener: TcpSocket,
  port: CompletionPort,
  accept_op: Arc<Overlapped>,
  config: SessionConfig,
  events: Arc<dyn SessionEvents>,
  stopped: AtomicBool,
  keep_alive: Mutex<Option<Arc<Acceptor>>>,
}

impl Acceptor {
  pub const BACKLOG: i32 = 128;

  /// Listens on `addr` and starts accepting through `port`.
  pub fn bind(
    port: &CompletionPort,
    addr: SocketAddr,
    config: SessionConfig,
    events: Arc<dyn SessionEvents>,
  ) -> io::Result<Arc<Acceptor>> {
    let listener = TcpSocket::bind_listener(addr, Self::BACKLOG)?;
    port.attach(&listener);

    let acceptor = Arc::new_cyclic(|this: &Weak<Acceptor>| {
      let handler: Weak<dyn CompletionHandler> = this.clone();
      Acceptor {
        listener,
        port: port.clone(),
        accept_op: Overlapped::new(handler, None),
        config,
        events,
        stopped: AtomicBool::new(false),
        keep_alive: Mutex::new(None),
      }
    });

    *acceptor.keep_alive.lock() = Some(Arc::clone(&acceptor));
    if let Err(err) = acceptor.listener.accept(&acceptor.accept_op) {
      acceptor.keep_alive.lock().take();
      return Err(err);
    }

    tracing::debug!(addr = ?acceptor.local_addr().ok(), "accepting connections");
    Ok(acceptor)
  }

  pub fn local_addr(&self) -> io::Result<SocketAddr> {
    self.listener.local_addr()
  }

  /// Cancels the outstanding accept. Connections already accepted live on.
  pub fn stop(&self) {
    if self.stopped.swap(true, Ordering::AcqRel) {
      return;
    }
    self.listener.cancel();
  }

  fn open_session(&self) {
    let Some(accepted) = self.accept_op.take_accepted() else {
      return;
    };
    let peer = accepted.peer;
    let socket = TcpSocket::from_accepted(accepted);
    self.port.attach(&socket);

    if let Err(err) = Session::open(
      Box::new(socket),
      Role::Server,
      self.config,
      Arc::clone(&self.events),
    ) {
      tracing::warn!(%peer, error = %err, "failed to open accepted session");
    }
  }
}

impl CompletionHandler for Acceptor {
  fn completed(&self, completion: Completion, _op: &Arc<Overlapped>) {
    match completion.into_result() {
      Ok(_) => self.open_session(),
      Err(err) if err.raw_os_error() == Some(libc::ECANCELED) => {}
      Err(err) => tracing::warn!(error = %err, "accept failed"),
    }

    if self.stopped.load(Ordering::Acquire) {
      self.keep_alive.lock().take();
      return;
    }

    self.accept_op.reset();
    if let Err(err) = self.listener.accept(&self.accept_op) {
      tracing::warn!(error = %err, "failed to reissue accept");
      self.stopped.store(true, Ordering::Release);
      self.keep_alive.lock().take();
    }
  }
}

impl fmt::Debug for Acceptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Acceptor")
      .field("listener", &self.listener)
      .field("stopped", &self.stopped.load(Ordering::Acquire))
      .finish()
  }
}
