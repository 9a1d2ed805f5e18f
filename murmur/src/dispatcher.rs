//! Couples a wait event with a completion port for an external run loop.

use std::{io, sync::Arc, time::Duration};

use crate::{CompletionPort, Event, PortConfig};

/// An [`Event`] that becomes ready whenever its [`CompletionPort`] has
/// entries to drain.
///
/// A run loop that already multiplexes on events waits on [`event`] and
/// flushes the port when it fires; [`run_once`] does both.
///
/// [`event`]: Self::event
/// [`run_once`]: Self::run_once
#[derive(Debug)]
pub struct EventedDispatcher {
  event: Arc<Event>,
  port: CompletionPort,
}

impl EventedDispatcher {
  /// Creates a port and links `event` to it.
  ///
  /// # Panics
  ///
  /// Panics if the port cannot be created or `event` is already linked.
  pub fn new(event: Arc<Event>) -> Self {
    Self::with_config(event, PortConfig::default())
  }

  pub fn with_config(event: Arc<Event>, config: PortConfig) -> Self {
    let port = CompletionPort::with_config(config);
    event.link(port.clone());
    Self { event, port }
  }

  pub fn event(&self) -> &Arc<Event> {
    &self.event
  }

  pub fn completion_port(&self) -> &CompletionPort {
    &self.port
  }

  /// Waits for the event, then flushes the port. Returns the number of
  /// completions dispatched; zero on timeout.
  pub fn run_once(&self, timeout: Option<Duration>) -> io::Result<usize> {
    if !self.event.wait_one(timeout)? {
      return Ok(0);
    }
    Ok(self.port.flush())
  }
}
