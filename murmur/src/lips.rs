//! LiPS: Length-Prefixed Strings.
//!
//! Every integer on the wire is written as one ASCII digit `'1'..='9'`
//! giving the number of decimal digits that follow, then the digits
//! themselves. A message is a count followed by that many
//! `key-len key-bytes value-len value-bytes` groups:
//!
//! ```text
//! <length-digit><decimal-magnitude>
//! message := count:lp { key-len:lp key-bytes val-len:lp val-bytes }
//! ```
//!
//! Encoding is infallible for valid input; a length that needs more than
//! nine digits is a caller bug and panics. Decoding happens at the network
//! boundary, so it never panics: partial or garbage input comes back as a
//! [`DecodeError`].
//!
//! ```rust
//! use murmur::{Message, lips};
//!
//! let mut msg = Message::new();
//! msg.insert("arg1", "val1");
//!
//! let mut buf = Vec::new();
//! lips::encode_message(&mut buf, &msg);
//! assert_eq!(buf, b"1114arg114val1");
//!
//! let (decoded, next) = lips::decode_message(&buf, 0).unwrap();
//! assert_eq!(decoded, msg);
//! assert_eq!(next, buf.len());
//! ```

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::Message;

/// Largest value a length prefix can carry (nine decimal digits).
pub const MAX_LENGTH: u64 = 999_999_999;

/// Why a buffer could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
  /// The buffer ends before the value is complete; more bytes may fix it.
  #[error("buffer truncated: need more data")]
  Truncated,
  /// The bytes can never form a valid value.
  #[error("malformed length prefix at offset {offset}")]
  Malformed { offset: usize },
  /// A streaming buffer grew past its configured limit.
  #[error("buffered {buffered} bytes without a complete message (limit {limit})")]
  Oversized { buffered: usize, limit: usize },
}

/// Appends the length prefix for `value` to `buf`.
///
/// # Panics
///
/// Panics if `value` exceeds [`MAX_LENGTH`].
pub fn encode_length<B: BufMut>(buf: &mut B, value: u64) {
  assert!(
    value <= MAX_LENGTH,
    "lips: length {value} does not fit in a nine digit prefix"
  );

  let digits = value.to_string();
  debug_assert!((1..=9).contains(&digits.len()));

  buf.put_u8(b'0' + digits.len() as u8);
  buf.put_slice(digits.as_bytes());
}

/// Reads one length prefix starting at `offset`.
///
/// Returns the value and the offset of the first byte after it.
pub fn decode_length(
  buf: &[u8],
  offset: usize,
) -> Result<(u64, usize), DecodeError> {
  let &digit = buf.get(offset).ok_or(DecodeError::Truncated)?;
  if !(b'1'..=b'9').contains(&digit) {
    return Err(DecodeError::Malformed { offset });
  }

  let width = (digit - b'0') as usize;
  let start = offset + 1;
  let magnitude =
    buf.get(start..start + width).ok_or(DecodeError::Truncated)?;

  let mut value = 0u64;
  for (i, &byte) in magnitude.iter().enumerate() {
    if !byte.is_ascii_digit() {
      return Err(DecodeError::Malformed { offset: start + i });
    }
    value = value * 10 + u64::from(byte - b'0');
  }

  Ok((value, start + width))
}

/// Appends the encoding of `message` to `buf`.
pub fn encode_message<B: BufMut>(buf: &mut B, message: &Message) {
  encode_length(buf, message.len() as u64);
  for (key, value) in message {
    encode_bytes(buf, key);
    encode_bytes(buf, value);
  }
}

/// Returns the exact number of bytes [`encode_message`] will append.
pub fn encoded_len(message: &Message) -> usize {
  let prefix = |n: usize| 1 + n.to_string().len();
  message.iter().fold(prefix(message.len()), |acc, (key, value)| {
    acc + prefix(key.len()) + key.len() + prefix(value.len()) + value.len()
  })
}

/// Decodes one message starting at `offset`.
///
/// Returns the message and the offset right after its last value byte.
/// Duplicate keys on the wire collapse, the last one wins.
pub fn decode_message(
  buf: &[u8],
  offset: usize,
) -> Result<(Message, usize), DecodeError> {
  let (count, mut offset) = decode_length(buf, offset)?;

  // Every entry takes at least four bytes ("10" twice), which bounds the
  // allocation a hostile count can request.
  let plausible = buf.len().saturating_sub(offset) / 4;
  let mut message = Message::with_capacity((count as usize).min(plausible));

  for _ in 0..count {
    let (key, next) = decode_bytes(buf, offset)?;
    let (value, next) = decode_bytes(buf, next)?;
    offset = next;
    message.insert(key, value);
  }

  Ok((message, offset))
}

fn encode_bytes<B: BufMut>(buf: &mut B, bytes: &[u8]) {
  encode_length(buf, bytes.len() as u64);
  buf.put_slice(bytes);
}

fn decode_bytes(buf: &[u8], offset: usize) -> Result<(&[u8], usize), DecodeError> {
  let (len, start) = decode_length(buf, offset)?;
  let end = usize::try_from(len)
    .ok()
    .and_then(|len| start.checked_add(len))
    .ok_or(DecodeError::Truncated)?;
  let bytes = buf.get(start..end).ok_or(DecodeError::Truncated)?;
  Ok((bytes, end))
}

/// Accumulates bytes from a stream and yields whole messages.
///
/// ```rust
/// use murmur::{Message, lips::{self, MessageBuffer}};
///
/// let mut msg = Message::new();
/// msg.insert("topic", "news");
/// let mut wire = Vec::new();
/// lips::encode_message(&mut wire, &msg);
///
/// let mut stream = MessageBuffer::new(1024);
/// stream.extend(&wire[..3]);
/// assert_eq!(stream.next_message(), Ok(None));
/// stream.extend(&wire[3..]);
/// assert_eq!(stream.next_message(), Ok(Some(msg)));
/// ```
#[derive(Debug)]
pub struct MessageBuffer {
  /// Unconsumed bytes; popped frames are advanced past, never shifted.
  buf: BytesMut,
  limit: usize,
}

impl MessageBuffer {
  /// Creates an empty buffer that refuses to hold more than `limit` bytes of
  /// an incomplete message.
  pub fn new(limit: usize) -> Self {
    Self { buf: BytesMut::new(), limit }
  }

  pub fn extend(&mut self, bytes: &[u8]) {
    self.buf.extend_from_slice(bytes);
  }

  /// Bytes currently held, complete or not.
  pub fn buffered(&self) -> usize {
    self.buf.len()
  }

  /// Pops the next complete message, if one is buffered.
  pub fn next_message(&mut self) -> Result<Option<Message>, DecodeError> {
    match decode_message(&self.buf, 0) {
      Ok((message, consumed)) => {
        self.buf.advance(consumed);
        Ok(Some(message))
      }
      Err(DecodeError::Truncated) if self.buf.len() > self.limit => {
        Err(DecodeError::Oversized { buffered: self.buf.len(), limit: self.limit })
      }
      Err(DecodeError::Truncated) => Ok(None),
      Err(err) => Err(err),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn encoded(message: &Message) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_message(&mut buf, message);
    buf
  }

  #[test]
  fn test_stream_drains_many_frames_linearly() {
    use std::time::{Duration, Instant};

    // Two megabytes of empty messages arriving in one read.
    let frames = 1 << 20;
    let mut stream = MessageBuffer::new(64);
    stream.extend(&b"10".repeat(frames));

    let start = Instant::now();
    let mut count = 0;
    while let Some(message) = stream.next_message().unwrap() {
      assert!(message.is_empty());
      count += 1;
    }

    assert_eq!(count, frames);
    assert_eq!(stream.buffered(), 0);
    assert!(start.elapsed() < Duration::from_secs(10));
  }

  #[test]
  fn test_encode_length_boundaries() {
    let mut buf = Vec::new();
    encode_length(&mut buf, 0);
    assert_eq!(buf, b"10");

    buf.clear();
    encode_length(&mut buf, MAX_LENGTH);
    assert_eq!(buf, b"9999999999");

    buf.clear();
    encode_length(&mut buf, 12345);
    assert_eq!(buf, b"512345");
  }

  #[test]
  #[should_panic(expected = "nine digit prefix")]
  fn test_encode_length_too_large() {
    encode_length(&mut Vec::<u8>::new(), MAX_LENGTH + 1);
  }

  #[test]
  fn test_decode_length() {
    assert_eq!(decode_length(b"10", 0), Ok((0, 2)));
    assert_eq!(decode_length(b"xx3123", 2), Ok((123, 6)));
    assert_eq!(decode_length(b"9999999999", 0), Ok((MAX_LENGTH, 10)));
  }

  #[test]
  fn test_decode_length_truncated() {
    assert_eq!(decode_length(b"", 0), Err(DecodeError::Truncated));
    assert_eq!(decode_length(b"10", 2), Err(DecodeError::Truncated));
    assert_eq!(decode_length(b"312", 0), Err(DecodeError::Truncated));
    assert_eq!(decode_length(b"1", usize::MAX), Err(DecodeError::Truncated));
  }

  #[test]
  fn test_decode_length_malformed() {
    assert_eq!(decode_length(b"05", 0), Err(DecodeError::Malformed { offset: 0 }));
    assert_eq!(decode_length(b"a5", 0), Err(DecodeError::Malformed { offset: 0 }));
    assert_eq!(decode_length(b"21x", 0), Err(DecodeError::Malformed { offset: 2 }));
  }

  #[test]
  fn test_empty_message() {
    let buf = encoded(&Message::new());
    assert_eq!(buf, b"10");
    assert_eq!(decode_message(&buf, 0), Ok((Message::new(), 2)));
  }

  #[test]
  fn test_two_entry_scenario() {
    let mut msg = Message::new();
    msg.insert("arg1", "val1");
    msg.insert("arg2", "val2");

    let buf = encoded(&msg);
    let first: &[u8] = b"14arg114val1";
    let second: &[u8] = b"14arg214val2";
    let option_a = [&b"12"[..], first, second].concat();
    let option_b = [&b"12"[..], second, first].concat();
    assert!(buf == option_a || buf == option_b, "unexpected bytes: {buf:?}");

    for candidate in [option_a, option_b] {
      let (decoded, next) = decode_message(&candidate, 0).unwrap();
      assert_eq!(decoded, msg);
      assert_eq!(next, candidate.len());
    }
  }

  #[test]
  fn test_decode_at_offset_stops_after_last_value() {
    let mut msg = Message::new();
    msg.insert("k", "v");
    let mut buf = b"junk".to_vec();
    encode_message(&mut buf, &msg);
    let end = buf.len();
    buf.extend_from_slice(b"trailing");

    assert_eq!(decode_message(&buf, 4), Ok((msg, end)));
  }

  #[test]
  fn test_duplicate_keys_last_wins() {
    let buf = b"1211k11a11k11b";
    let (msg, next) = decode_message(buf, 0).unwrap();
    assert_eq!(msg.len(), 1);
    assert_eq!(msg.get_str("k"), Some("b"));
    assert_eq!(next, buf.len());
  }

  #[test]
  fn test_hostile_count_is_truncated() {
    assert_eq!(decode_message(b"9999999999", 0), Err(DecodeError::Truncated));
  }

  #[test]
  fn test_encoded_len_matches() {
    let msg: Message =
      [("a", "x".repeat(10)), ("bb", String::new())].into_iter().collect();
    assert_eq!(encoded_len(&msg), encoded(&msg).len());
  }

  #[test]
  fn test_every_prefix_is_truncated() {
    let msg: Message = [("arg1", "val1"), ("arg2", "val2")].into_iter().collect();
    let buf = encoded(&msg);
    for cut in 0..buf.len() {
      assert_eq!(
        decode_message(&buf[..cut], 0),
        Err(DecodeError::Truncated),
        "cut at {cut}"
      );
    }
  }

  #[test]
  fn test_garbage_never_panics() {
    let mut rng = fastrand::Rng::with_seed(7);
    for _ in 0..2_000 {
      let len = rng.usize(0..64);
      let bytes: Vec<u8> = (0..len)
        .map(|_| if rng.bool() { rng.u8(b'0'..=b'9') } else { rng.u8(..) })
        .collect();
      let _ = decode_message(&bytes, 0);
    }
  }

  #[test]
  fn test_message_buffer_streams_frames() {
    let a: Message = [("n", "1")].into_iter().collect();
    let b: Message = [("n", "2")].into_iter().collect();
    let mut wire = encoded(&a);
    wire.extend(encoded(&b));

    let mut stream = MessageBuffer::new(64);
    for byte in &wire[..wire.len() - 1] {
      stream.extend(std::slice::from_ref(byte));
    }
    assert_eq!(stream.next_message(), Ok(Some(a)));
    assert_eq!(stream.next_message(), Ok(None));

    stream.extend(&wire[wire.len() - 1..]);
    assert_eq!(stream.next_message(), Ok(Some(b)));
    assert_eq!(stream.buffered(), 0);
  }

  #[test]
  fn test_message_buffer_limit() {
    let mut stream = MessageBuffer::new(4);
    stream.extend(b"11199");
    assert_eq!(
      stream.next_message(),
      Err(DecodeError::Oversized { buffered: 5, limit: 4 })
    );
  }

  #[test]
  fn test_message_buffer_malformed() {
    let mut stream = MessageBuffer::new(64);
    stream.extend(b"x");
    assert_eq!(stream.next_message(), Err(DecodeError::Malformed { offset: 0 }));
  }
}
