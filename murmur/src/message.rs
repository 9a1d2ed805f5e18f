use std::{
  collections::{HashMap, hash_map},
  fmt,
};

/// An unordered set of key/value pairs exchanged between bus peers.
///
/// Keys and values are raw byte strings; the wire format never escapes or
/// terminates them. Iteration order carries no meaning.
///
/// ```rust
/// use murmur::Message;
///
/// let mut msg = Message::new();
/// msg.insert("arg1", "val1");
/// msg.insert("arg2", "val2");
///
/// assert_eq!(msg.get_str("arg1"), Some("val1"));
/// assert_eq!(msg.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
  entries: HashMap<Vec<u8>, Vec<u8>>,
}

impl Message {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_capacity(capacity: usize) -> Self {
    Self { entries: HashMap::with_capacity(capacity) }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Assigns `value` to `key`, returning the previous value if there was one.
  pub fn insert(
    &mut self,
    key: impl Into<Vec<u8>>,
    value: impl Into<Vec<u8>>,
  ) -> Option<Vec<u8>> {
    self.entries.insert(key.into(), value.into())
  }

  pub fn remove(&mut self, key: impl AsRef<[u8]>) -> Option<Vec<u8>> {
    self.entries.remove(key.as_ref())
  }

  pub fn contains_key(&self, key: impl AsRef<[u8]>) -> bool {
    self.entries.contains_key(key.as_ref())
  }

  /// Returns the value stored under `key`, if any.
  pub fn try_get(&self, key: impl AsRef<[u8]>) -> Option<&[u8]> {
    self.entries.get(key.as_ref()).map(Vec::as_slice)
  }

  /// Like [`try_get`](Self::try_get), but only succeeds for UTF-8 values.
  pub fn get_str(&self, key: impl AsRef<[u8]>) -> Option<&str> {
    self.try_get(key).and_then(|value| std::str::from_utf8(value).ok())
  }

  /// Copies every entry of `other` into `self`.
  ///
  /// Entries of `other` overwrite entries with the same key; keys only present
  /// on one side are kept.
  pub fn merge(&mut self, other: &Message) {
    for (key, value) in &other.entries {
      self.entries.insert(key.clone(), value.clone());
    }
  }

  /// Empties every value while keeping the key set.
  ///
  /// Lets a caller reuse a message "schema" without carrying the old payload.
  pub fn soft_clear(&mut self) {
    for value in self.entries.values_mut() {
      value.clear();
    }
  }

  pub fn clear(&mut self) {
    self.entries.clear();
  }

  pub fn iter(&self) -> Iter<'_> {
    Iter { inner: self.entries.iter() }
  }

  pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
    self.entries.keys().map(Vec::as_slice)
  }
}

pub struct Iter<'a> {
  inner: hash_map::Iter<'a, Vec<u8>, Vec<u8>>,
}

impl<'a> Iterator for Iter<'a> {
  type Item = (&'a [u8], &'a [u8]);

  fn next(&mut self) -> Option<Self::Item> {
    self.inner.next().map(|(k, v)| (k.as_slice(), v.as_slice()))
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    self.inner.size_hint()
  }
}

impl ExactSizeIterator for Iter<'_> {}

impl<'a> IntoIterator for &'a Message {
  type Item = (&'a [u8], &'a [u8]);
  type IntoIter = Iter<'a>;

  fn into_iter(self) -> Self::IntoIter {
    self.iter()
  }
}

impl<K, V> FromIterator<(K, V)> for Message
where
  K: Into<Vec<u8>>,
  V: Into<Vec<u8>>,
{
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    let mut msg = Message::new();
    msg.extend(iter);
    msg
  }
}

impl<K, V> Extend<(K, V)> for Message
where
  K: Into<Vec<u8>>,
  V: Into<Vec<u8>>,
{
  fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
    for (key, value) in iter {
      self.insert(key, value);
    }
  }
}

/// Dumps one `key: value` line per entry followed by a blank line.
impl fmt::Display for Message {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (key, value) in self.iter() {
      writeln!(
        f,
        "{}: {}",
        String::from_utf8_lossy(key),
        String::from_utf8_lossy(value)
      )?;
    }
    writeln!(f)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_insert_overwrites() {
    let mut msg = Message::new();
    assert_eq!(msg.insert("k", "a"), None);
    assert_eq!(msg.insert("k", "b"), Some(b"a".to_vec()));
    assert_eq!(msg.try_get("k"), Some(&b"b"[..]));
    assert_eq!(msg.len(), 1);
  }

  #[test]
  fn test_merge_right_wins() {
    let mut left: Message = [("a", "1"), ("b", "2")].into_iter().collect();
    let right: Message = [("b", "3"), ("c", "4")].into_iter().collect();

    left.merge(&right);

    assert_eq!(left.len(), 3);
    assert_eq!(left.get_str("a"), Some("1"));
    assert_eq!(left.get_str("b"), Some("3"));
    assert_eq!(left.get_str("c"), Some("4"));
  }

  #[test]
  fn test_soft_clear_keeps_keys() {
    let mut msg: Message = [("a", "1"), ("b", "")].into_iter().collect();
    msg.soft_clear();

    assert_eq!(msg.len(), 2);
    assert_eq!(msg.try_get("a"), Some(&b""[..]));
    assert_eq!(msg.try_get("b"), Some(&b""[..]));

    let once = msg.clone();
    msg.soft_clear();
    assert_eq!(msg, once);
  }

  #[test]
  fn test_get_str_rejects_invalid_utf8() {
    let mut msg = Message::new();
    msg.insert("bin", vec![0xff, 0xfe]);
    assert!(msg.try_get("bin").is_some());
    assert_eq!(msg.get_str("bin"), None);
  }

  #[test]
  fn test_display_dump() {
    let mut msg = Message::new();
    msg.insert("arg1", "val1");
    assert_eq!(msg.to_string(), "arg1: val1\n\n");
  }
}
