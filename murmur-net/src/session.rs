use std::{
  collections::VecDeque,
  fmt, io,
  net::{Shutdown, SocketAddr},
  sync::{
    Arc, Weak,
    atomic::{AtomicU64, Ordering},
  },
};

use murmur::{
  AsyncSocket, Completion, CompletionHandler, DisconnectFlags, Message,
  Overlapped,
  lips::{self, MessageBuffer},
};
use parking_lot::Mutex;

use crate::{SessionConfig, SessionError};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
  fn next() -> Self {
    Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
  }

  pub fn get(self) -> u64 {
    self.0
  }
}

impl fmt::Display for SessionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// Which side initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
  /// Accepted by a listener.
  Server,
  /// Initiated by a connect.
  Client,
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Role::Server => "server",
      Role::Client => "client",
    })
  }
}

/// Observer of session lifecycles. Called from the thread draining the port,
/// never with session locks held.
pub trait SessionEvents: Send + Sync {
  fn on_opened(&self, _session: &Arc<Session>) {}

  fn on_message(&self, session: &Arc<Session>, message: Message);

  /// Called once, after every outstanding request of the session finished.
  /// `error` is what caused the close, `None` for an orderly one.
  fn on_closed(&self, _session: &Arc<Session>, _error: Option<&SessionError>) {}

  fn on_connect_failed(&self, _addr: SocketAddr, _error: &io::Error) {}
}

#[derive(Default)]
struct SessionState {
  outbound: VecDeque<Vec<u8>>,
  writing: bool,
  reading: bool,
  disconnecting: bool,
  closing: bool,
  closed: bool,
  error: Option<SessionError>,
}

impl SessionState {
  fn idle(&self) -> bool {
    !self.reading && !self.writing && !self.disconnecting
  }
}

/// One connected peer.
///
/// A session keeps itself alive while it has requests outstanding, so the
/// caller may drop its handle right after opening it. It is released after
/// [`SessionEvents::on_closed`] ran.
pub struct Session {
  this: Weak<Session>,
  id: SessionId,
  role: Role,
  description: String,
  socket: Box<dyn AsyncSocket>,
  events: Arc<dyn SessionEvents>,
  read_op: Arc<Overlapped>,
  write_op: Arc<Overlapped>,
  close_op: Arc<Overlapped>,
  state: Mutex<SessionState>,
  inbound: Mutex<MessageBuffer>,
  recv_buffer_size: usize,
  keep_alive: Mutex<Option<Arc<Session>>>,
}

impl Session {
  /// Starts a session on a connected socket that is already attached to a
  /// completion port.
  pub fn open(
    socket: Box<dyn AsyncSocket>,
    role: Role,
    config: SessionConfig,
    events: Arc<dyn SessionEvents>,
  ) -> Result<Arc<Session>, SessionError> {
    socket.connection_established()?;

    let id = SessionId::next();
    let description = format!(
      "{role} session {id} {} -> {}",
      socket.local_address()?,
      socket.peer_address()?
    );

    let session = Arc::new_cyclic(|this: &Weak<Session>| {
      let handler: Weak<dyn CompletionHandler> = this.clone();
      Session {
        this: this.clone(),
        id,
        role,
        description,
        socket,
        events,
        read_op: Overlapped::new(handler.clone(), None),
        write_op: Overlapped::new(handler.clone(), None),
        close_op: Overlapped::new(handler, None),
        state: Mutex::new(SessionState::default()),
        inbound: Mutex::new(MessageBuffer::new(config.max_buffered)),
        recv_buffer_size: config.recv_buffer_size,
        keep_alive: Mutex::new(None),
      }
    });

    *session.keep_alive.lock() = Some(Arc::clone(&session));
    tracing::debug!(session = %session.id, "{}", session.description);

    session.events.on_opened(&session);
    session.read_next(vec![0; session.recv_buffer_size]);
    session.release_if_done();

    Ok(session)
  }

  pub fn id(&self) -> SessionId {
    self.id
  }

  pub fn is_server_side(&self) -> bool {
    self.role == Role::Server
  }

  pub fn role(&self) -> Role {
    self.role
  }

  /// Human readable summary: role, id and both endpoints.
  pub fn description(&self) -> &str {
    &self.description
  }

  pub fn is_closed(&self) -> bool {
    self.state.lock().closing
  }

  /// Encodes `message` and queues it for writing.
  ///
  /// Returning `Ok` only means the frame was queued; a later write failure
  /// closes the session and is reported through
  /// [`SessionEvents::on_closed`].
  pub fn send(&self, message: &Message) -> Result<(), SessionError> {
    let mut frame = Vec::with_capacity(lips::encoded_len(message));
    lips::encode_message(&mut frame, message);

    let mut state = self.state.lock();
    if state.closing {
      return Err(SessionError::Closed);
    }

    state.outbound.push_back(frame);
    if state.writing {
      return Ok(());
    }

    if let Err(err) = self.write_queued(&mut state) {
      drop(state);
      self.shutdown(Some(SessionError::Io(duplicate(&err))));
      self.release_if_done();
      return Err(err.into());
    }
    Ok(())
  }

  /// Starts an orderly close. Frames not yet handed to the socket are
  /// dropped.
  pub fn close(&self) {
    self.shutdown(None);
    self.release_if_done();
  }

  /// Sends every queued frame as one scatter write.
  fn write_queued(&self, state: &mut SessionState) -> io::Result<()> {
    let frames: Vec<Vec<u8>> = state.outbound.drain(..).collect();
    self.write_op.reset();
    self.socket.send(frames, &self.write_op)?;
    state.writing = true;
    Ok(())
  }

  fn read_next(&self, buf: Vec<u8>) {
    let mut state = self.state.lock();
    if state.closing {
      return;
    }

    self.read_op.reset();
    match self.socket.recv(vec![buf], &self.read_op) {
      Ok(()) => state.reading = true,
      Err(err) => {
        drop(state);
        self.shutdown(Some(err.into()));
      }
    }
  }

  fn on_read(&self, this: &Arc<Session>, completion: Completion) {
    let bytes = match completion.into_result() {
      Ok(bytes) => bytes,
      Err(err) => {
        self.state.lock().reading = false;
        let cancelled = err.raw_os_error() == Some(libc::ECANCELED);
        self.shutdown((!cancelled).then(|| err.into()));
        return;
      }
    };

    let buf = self.read_op.take_buffers().pop().unwrap_or_default();
    self.state.lock().reading = false;

    if bytes == 0 {
      tracing::debug!(session = %self.id, "peer closed the connection");
      self.shutdown(None);
      return;
    }

    let mut messages = Vec::new();
    let failure = {
      let mut inbound = self.inbound.lock();
      inbound.extend(&buf[..bytes]);
      loop {
        match inbound.next_message() {
          Ok(Some(message)) => messages.push(message),
          Ok(None) => break None,
          Err(err) => break Some(err),
        }
      }
    };

    for message in messages {
      self.events.on_message(this, message);
    }

    match failure {
      Some(err) => {
        tracing::warn!(session = %self.id, error = %err, "dropping malformed peer");
        self.shutdown(Some(err.into()));
      }
      None => self.read_next(buf),
    }
  }

  fn on_write(&self, completion: Completion) {
    let sent = self.write_op.take_buffers();
    let mut state = self.state.lock();
    state.writing = false;

    match completion.into_result() {
      Ok(bytes) => {
        tracing::trace!(session = %self.id, bytes, frames = sent.len(), "write completed");
        if state.closing || state.outbound.is_empty() {
          return;
        }
        if let Err(err) = self.write_queued(&mut state) {
          drop(state);
          self.shutdown(Some(err.into()));
        }
      }
      Err(err) => {
        let closing = state.closing;
        drop(state);
        if !closing {
          self.shutdown(Some(err.into()));
        }
      }
    }
  }

  fn on_disconnect(&self, completion: Completion) {
    if let Err(err) = completion.into_result() {
      tracing::debug!(session = %self.id, error = %err, "disconnect failed");
    }
    self.state.lock().disconnecting = false;
  }

  /// Marks the session closing and tears the connection down. A write the
  /// peer is not draining is cancelled so the disconnect runs at once; the
  /// receive then finishes with end of stream.
  fn shutdown(&self, error: Option<SessionError>) {
    let mut state = self.state.lock();
    if state.error.is_none() {
      state.error = error;
    }
    if state.closing {
      return;
    }

    state.closing = true;
    let dropped = state.outbound.len();
    state.outbound.clear();
    tracing::debug!(session = %self.id, dropped, "session closing");

    self.socket.cancel_writes();
    self.close_op.reset();
    let flags = DisconnectFlags::new(Shutdown::Both);
    match self.socket.disconnect(flags, &self.close_op) {
      Ok(()) => state.disconnecting = true,
      Err(err) => {
        tracing::debug!(session = %self.id, error = %err, "disconnect not issued");
      }
    }
  }

  fn release_if_done(&self) {
    let error = {
      let mut state = self.state.lock();
      if !state.closing || state.closed || !state.idle() {
        return;
      }
      state.closed = true;
      state.error.take()
    };

    let Some(this) = self.keep_alive.lock().take() else {
      return;
    };
    tracing::debug!(session = %self.id, "session closed");
    self.events.on_closed(&this, error.as_ref());
  }
}

impl CompletionHandler for Session {
  fn completed(&self, completion: Completion, op: &Arc<Overlapped>) {
    let Some(this) = self.this.upgrade() else {
      return;
    };

    if Arc::ptr_eq(op, &self.read_op) {
      self.on_read(&this, completion);
    } else if Arc::ptr_eq(op, &self.write_op) {
      self.on_write(completion);
    } else {
      self.on_disconnect(completion);
    }

    self.release_if_done();
  }
}

impl fmt::Debug for Session {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Session")
      .field("id", &self.id)
      .field("role", &self.role)
      .field("description", &self.description)
      .field("closed", &self.is_closed())
      .finish()
  }
}

fn duplicate(err: &io::Error) -> io::Error {
  match err.raw_os_error() {
    Some(code) => io::Error::from_raw_os_error(code),
    None => io::Error::new(err.kind(), err.to_string()),
  }
}
