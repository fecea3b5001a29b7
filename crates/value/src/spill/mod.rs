//! Memory-bounded containers which overflow to temporary files.
//!
//! Both containers take their memory policy from the caller. A spill
//! predicate is asked, before each insertion, whether the bytes currently
//! held plus the bytes about to be added warrant moving the in-memory
//! contents to disk. A memory tracking callback is told about every byte
//! the container releases on the caller's behalf, or brings back into
//! memory from disk. Callers account for the values they insert and for the
//! values they receive back, so that a complete cycle nets to zero.

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use crate::cnf::SPILL_MEMORY_THRESHOLD;
use crate::val::AnnotatedValue;

pub mod array;
pub mod codec;
pub(crate) mod file;
pub(crate) mod heap;
pub mod map;
pub mod temp;

pub use self::array::SpillArray;
pub use self::codec::{Decoder, Encoder, Spill, Tag};
pub use self::map::SpillMap;
pub use self::temp::TempSpace;

/// Decides whether to spill, given the bytes held and the bytes incoming
pub type ShouldSpill = Arc<dyn Fn(u64, u64) -> bool + Send + Sync>;

/// Receives signed memory deltas
pub type TrackMemory = Arc<dyn Fn(i64) + Send + Sync>;

/// Orders annotated values, returning whether the first sorts before the second
pub type Less = Arc<dyn Fn(&AnnotatedValue, &AnnotatedValue) -> bool + Send + Sync>;

/// Folds two values for the same key into one. The older value is passed
/// first. Whichever value is not returned is released.
pub type Merge = Arc<dyn Fn(AnnotatedValue, AnnotatedValue) -> AnnotatedValue + Send + Sync>;

/// Builds a spill predicate which spills once the bytes held, plus the
/// bytes incoming, exceed the limit
pub fn threshold(limit: u64) -> ShouldSpill {
	Arc::new(move |current, incoming| current.saturating_add(incoming) > limit)
}

/// Builds a spill predicate using the configured memory threshold
pub fn default_threshold() -> ShouldSpill {
	threshold(*SPILL_MEMORY_THRESHOLD)
}

/// Counters describing the spilling activity of a container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpillStats {
	/// The number of values inserted
	pub values: u64,
	/// The number of spill files currently held
	pub files: usize,
	/// The bytes currently held on disk
	pub bytes: u64,
	/// The time spent reading spill files
	pub read: Duration,
	/// The time spent writing spill files
	pub write: Duration,
	/// The number of scope parents retained in memory
	pub parents: usize,
}

impl Display for SpillStats {
	fn fmt(&self, f: &mut Formatter) -> fmt::Result {
		write!(
			f,
			"[vals:{},files:{},bytes:{},R:{:?},W:{:?},#parents:{}]",
			self.values, self.files, self.bytes, self.read, self.write, self.parents
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn threshold_counts_incoming_bytes() {
		let should = threshold(100);
		assert!(!should(0, 100));
		assert!(should(1, 100));
		assert!(should(u64::MAX, u64::MAX));
	}
}
