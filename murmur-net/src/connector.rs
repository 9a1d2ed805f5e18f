use std::{
  io,
  net::SocketAddr,
  sync::{Arc, Weak},
};

use murmur::{
  AsyncSocket, Completion, CompletionHandler, CompletionPort, Overlapped,
  TcpSocket,
};
use parking_lot::Mutex;

use crate::{Role, Session, SessionConfig, SessionEvents};

/// Opens client-side sessions.
#[derive(Clone)]
pub struct Connector {
  port: CompletionPort,
  config: SessionConfig,
  events: Arc<dyn SessionEvents>,
}

impl Connector {
  pub fn new(
    port: CompletionPort,
    config: SessionConfig,
    events: Arc<dyn SessionEvents>,
  ) -> Self {
    Self { port, config, events }
  }

  /// Starts connecting to `addr`.
  ///
  /// The session is opened once the connect completes; a failure is
  /// reported through [`SessionEvents::on_connect_failed`].
  pub fn connect(&self, addr: SocketAddr) -> io::Result<()> {
    let socket = TcpSocket::new(&addr)?;
    self.port.attach(&socket);

    let pending = Arc::new_cyclic(|this: &Weak<PendingConnect>| {
      let handler: Weak<dyn CompletionHandler> = this.clone();
      PendingConnect {
        addr,
        socket: Mutex::new(None),
        op: Overlapped::new(handler, None),
        config: self.config,
        events: Arc::clone(&self.events),
        keep_alive: Mutex::new(None),
      }
    });

    *pending.keep_alive.lock() = Some(Arc::clone(&pending));
    let mut slot = pending.socket.lock();
    if let Err(err) = slot.insert(socket).connect(addr, None, &pending.op) {
      slot.take();
      drop(slot);
      pending.keep_alive.lock().take();
      return Err(err);
    }
    drop(slot);

    tracing::debug!(%addr, "connecting");
    Ok(())
  }
}

/// Owns a connecting socket until its connect completes.
struct PendingConnect {
  addr: SocketAddr,
  socket: Mutex<Option<TcpSocket>>,
  op: Arc<Overlapped>,
  config: SessionConfig,
  events: Arc<dyn SessionEvents>,
  keep_alive: Mutex<Option<Arc<PendingConnect>>>,
}

impl CompletionHandler for PendingConnect {
  fn completed(&self, completion: Completion, _op: &Arc<Overlapped>) {
    let _this = self.keep_alive.lock().take();
    let Some(socket) = self.socket.lock().take() else {
      return;
    };

    if let Err(err) = completion.into_result() {
      tracing::debug!(addr = %self.addr, error = %err, "connect failed");
      self.events.on_connect_failed(self.addr, &err);
      return;
    }

    if let Err(err) = Session::open(
      Box::new(socket),
      Role::Client,
      self.config,
      Arc::clone(&self.events),
    ) {
      tracing::warn!(addr = %self.addr, error = %err, "failed to open session");
    }
  }
}
