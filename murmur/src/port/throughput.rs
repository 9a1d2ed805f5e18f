use std::{
  sync::atomic::{AtomicU64, Ordering},
  time::Instant,
};

use parking_lot::Mutex;

/// Counts dispatches and periodically reports completions per second.
pub(crate) struct Throughput {
  threshold: Option<u64>,
  count: AtomicU64,
  baseline: Mutex<Instant>,
  /// `f64` bits of the last reported rate.
  last: AtomicU64,
}

impl Throughput {
  pub fn new(threshold: Option<u64>) -> Self {
    Self {
      threshold,
      count: AtomicU64::new(0),
      baseline: Mutex::new(Instant::now()),
      last: AtomicU64::new(0),
    }
  }

  /// Records one dispatch. Returns the rate when this dispatch crossed the
  /// threshold.
  pub fn record(&self) -> Option<f64> {
    let threshold = self.threshold?;
    let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
    if count <= threshold {
      return None;
    }

    let mut baseline = self.baseline.lock();
    // Another thread may have reported while we waited for the lock.
    let count = self.count.swap(0, Ordering::Relaxed);
    if count <= threshold {
      self.count.fetch_add(count, Ordering::Relaxed);
      return None;
    }

    let now = Instant::now();
    let elapsed = now.duration_since(*baseline).as_secs_f64();
    *baseline = now;

    let rate = if elapsed > 0.0 { count as f64 / elapsed } else { f64::INFINITY };
    self.last.store(rate.to_bits(), Ordering::Relaxed);

    tracing::info!(
      completions = count,
      elapsed_secs = elapsed,
      per_sec = rate,
      "completion port throughput"
    );
    Some(rate)
  }

  pub fn last(&self) -> Option<f64> {
    self.threshold?;
    let bits = self.last.load(Ordering::Relaxed);
    (bits != 0).then(|| f64::from_bits(bits))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_reports_after_threshold() {
    let throughput = Throughput::new(Some(3));
    assert!(throughput.last().is_none());

    for _ in 0..3 {
      assert!(throughput.record().is_none());
    }
    let rate = throughput.record().unwrap();
    assert!(rate > 0.0);
    assert_eq!(throughput.last(), Some(rate));

    // Counter restarted.
    assert!(throughput.record().is_none());
  }

  #[test]
  fn test_disabled() {
    let throughput = Throughput::new(None);
    for _ in 0..100 {
      assert!(throughput.record().is_none());
    }
    assert!(throughput.last().is_none());
  }
}
