use std::io;

use murmur::lips::DecodeError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
  #[error("session i/o failed: {0}")]
  Io(#[from] io::Error),
  #[error("peer sent a malformed frame: {0}")]
  Decode(#[from] DecodeError),
  #[error("session is closed")]
  Closed,
}

impl SessionError {
  /// The OS error code behind an I/O failure, if any.
  pub fn raw_os_error(&self) -> Option<i32> {
    match self {
      SessionError::Io(err) => err.raw_os_error(),
      _ => None,
    }
  }
}
