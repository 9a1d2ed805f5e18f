/// Per-session buffer sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
  /// Size of the buffer each receive fills.
  pub recv_buffer_size: usize,
  /// Largest incomplete frame a peer may leave buffered before the session
  /// is closed.
  pub max_buffered: usize,
}

impl SessionConfig {
  pub const DEFAULT_RECV_BUFFER_SIZE: usize = 64 * 1024;
  pub const DEFAULT_MAX_BUFFERED: usize = 16 * 1024 * 1024;

  pub fn new() -> Self {
    Self {
      recv_buffer_size: Self::DEFAULT_RECV_BUFFER_SIZE,
      max_buffered: Self::DEFAULT_MAX_BUFFERED,
    }
  }

  /// # Panics
  ///
  /// Panics if `size` is zero.
  pub fn recv_buffer_size(mut self, size: usize) -> Self {
    assert!(size > 0, "murmur-net: receive buffer size must be non-zero");
    self.recv_buffer_size = size;
    self
  }

  pub fn max_buffered(mut self, limit: usize) -> Self {
    self.max_buffered = limit;
    self
  }
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self::new()
  }
}
