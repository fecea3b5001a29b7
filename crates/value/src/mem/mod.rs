use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::spill::TrackMemory;

/// A cooperative memory accounting sink.
///
/// Containers never keep an authoritative total of the memory they hold.
/// Instead every allocation or release which crosses a container boundary is
/// reported as a signed delta to a caller-supplied callback. This tracker is
/// the standard implementation of that callback, keeping the running total
/// and the high-water mark so that an enclosing operation can enforce a
/// quota, or a test can check that every delta was balanced.
#[derive(Clone, Debug, Default)]
pub struct MemoryTracker {
	inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
	current: AtomicI64,
	peak: AtomicI64,
}

impl MemoryTracker {
	pub fn new() -> Self {
		Self::default()
	}
	/// Applies a signed delta to the running total
	pub fn track(&self, delta: i64) {
		let current = self.inner.current.fetch_add(delta, Ordering::Relaxed) + delta;
		self.inner.peak.fetch_max(current, Ordering::Relaxed);
	}
	/// Returns the number of bytes currently accounted for
	pub fn current(&self) -> i64 {
		self.inner.current.load(Ordering::Relaxed)
	}
	/// Returns the largest total observed so far
	pub fn peak(&self) -> i64 {
		self.inner.peak.load(Ordering::Relaxed)
	}
	/// Returns a callback which feeds this tracker, for handing to a container
	pub fn tracker(&self) -> TrackMemory {
		let inner = self.clone();
		Arc::new(move |delta| inner.track(delta))
	}
}

#[cfg(test)]
mod tests {
	use std::thread;

	use super::*;

	#[test]
	fn balanced_deltas_net_to_zero() {
		let tracker = MemoryTracker::new();
		let callback = tracker.tracker();
		callback(100);
		callback(50);
		callback(-120);
		assert_eq!(tracker.current(), 30);
		callback(-30);
		assert_eq!(tracker.current(), 0);
		assert_eq!(tracker.peak(), 150);
	}

	#[test]
	fn concurrent_tracking() {
		let tracker = MemoryTracker::new();
		let handles: Vec<_> = (0..4)
			.map(|_| {
				let callback = tracker.tracker();
				thread::spawn(move || {
					for _ in 0..1000 {
						callback(8);
						callback(-8);
					}
				})
			})
			.collect();
		for handle in handles {
			handle.join().unwrap();
		}
		assert_eq!(tracker.current(), 0);
		assert!(tracker.peak() >= 8);
	}
}
