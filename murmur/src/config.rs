/// Tuning knobs for a [`CompletionPort`](crate::CompletionPort).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortConfig {
  /// How many readiness events one harvest reads from the OS.
  pub events_capacity: usize,
  /// Dispatches between throughput reports; `None` turns reporting off.
  pub throughput_threshold: Option<u64>,
}

impl PortConfig {
  pub const DEFAULT_EVENTS_CAPACITY: usize = 512;
  pub const DEFAULT_THROUGHPUT_THRESHOLD: u64 = 10_000;

  pub fn new() -> Self {
    Self {
      events_capacity: Self::DEFAULT_EVENTS_CAPACITY,
      throughput_threshold: Some(Self::DEFAULT_THROUGHPUT_THRESHOLD),
    }
  }

  /// # Panics
  ///
  /// Panics if `capacity` is zero.
  pub fn events_capacity(mut self, capacity: usize) -> Self {
    assert!(capacity > 0, "murmur: events capacity must be non-zero");
    self.events_capacity = capacity;
    self
  }

  pub fn throughput_threshold(mut self, threshold: Option<u64>) -> Self {
    self.throughput_threshold = threshold;
    self
  }
}

impl Default for PortConfig {
  fn default() -> Self {
    Self::new()
  }
}
