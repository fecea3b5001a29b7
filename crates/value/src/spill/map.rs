use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cnf::SPILL_MAP_INITIAL_CAPACITY;
use crate::err::Error;
use crate::spill::file::SpillFile;
use crate::spill::{Merge, ShouldSpill, SpillStats, TempSpace, TrackMemory, heap};
use crate::val::{AnnotatedValue, ValuePool};

type MapFile = SpillFile<(String, AnnotatedValue)>;

/// A keyed accumulator of annotated values which spills sorted snapshots
/// to disk under memory pressure.
///
/// Setting a key which is already held in memory replaces its value. Once
/// the map has spilled, the same key may be held in memory and in any
/// number of spill files, and the values are folded with the merge function
/// when the map is drained. The merge function may be applied to the values
/// of a key in any grouping, and always receives the older value first.
///
/// The map may be fed concurrently, but must only be drained once every
/// producer has stopped.
///
/// Memory is reported with the current size of each value the map lets go
/// of. A caller which changes a value in place, through [`SpillMap::get`]
/// or the merge function's inputs, reports the change itself.
pub struct SpillMap {
	pool: Arc<ValuePool>,
	temp: Arc<TempSpace>,
	should_spill: Option<ShouldSpill>,
	track_memory: Option<TrackMemory>,
	merge: Merge,
	inner: Mutex<MapInner>,
	/// Set while the map is locked by `foreach`
	draining: AtomicBool,
}

struct Entry {
	value: AnnotatedValue,
	/// The size of the value when it was set, as counted in `mem_size`
	size: u64,
}

#[derive(Default)]
struct MapInner {
	mem: HashMap<String, Entry>,
	/// The bytes held in memory, keys included
	mem_size: u64,
	spill: Vec<MapFile>,
	/// Time spent on spill files which have since been released
	read: Duration,
	write: Duration,
	sets: u64,
}

impl MapInner {
	fn release(&mut self, track: Option<&TrackMemory>) {
		for mut file in self.spill.drain(..) {
			if let (Some((_, value)), Some(track)) = (file.head.take(), track) {
				track(-(value.size() as i64));
			}
			self.read += file.read_time();
			self.write += file.write_time();
		}
		for (_, entry) in self.mem.drain() {
			if let Some(track) = track {
				track(-(entry.value.size() as i64));
			}
		}
		self.mem_size = 0;
	}
}

impl SpillMap {
	pub fn new(
		pool: Arc<ValuePool>,
		temp: Arc<TempSpace>,
		should_spill: Option<ShouldSpill>,
		track_memory: Option<TrackMemory>,
		merge: Merge,
	) -> Self {
		Self {
			pool,
			temp,
			should_spill,
			track_memory,
			merge,
			inner: Mutex::new(MapInner::default()),
			draining: AtomicBool::new(false),
		}
	}

	/// Creates an empty map with the same configuration
	pub fn copy(&self) -> Self {
		Self::new(
			self.pool.clone(),
			self.temp.clone(),
			self.should_spill.clone(),
			self.track_memory.clone(),
			self.merge.clone(),
		)
	}

	/// Returns the value held in memory for a key. Nothing is returned
	/// while the map is being drained.
	pub fn get(&self, key: &str) -> Option<AnnotatedValue> {
		if self.draining("read") {
			return None;
		}
		self.inner.lock().mem.get(key).map(|entry| entry.value.track())
	}

	/// Sets the value for a key, spilling the whole in-memory map first if
	/// the spill predicate asks for it. A value which is refused is released
	/// along with its reported memory.
	pub fn set(&self, key: impl Into<String>, value: AnnotatedValue) -> Result<(), Error> {
		let key = key.into();
		let size = value.size();
		if self.draining("written") {
			self.track(-(size as i64));
			return Err(Error::Frozen);
		}
		let key_size = key.len() as u64;
		let mut inner = self.inner.lock();
		inner.sets += 1;
		if inner.mem.capacity() == 0 {
			inner.mem.reserve(*SPILL_MAP_INITIAL_CAPACITY);
		}
		if let Some(old) = inner.mem.remove(&key) {
			inner.mem_size = inner.mem_size.saturating_sub(key_size + old.size);
			self.track(-(old.value.size() as i64));
		}
		if !inner.mem.is_empty()
			&& self.should_spill.as_ref().is_some_and(|f| f(inner.mem_size, key_size + size))
		{
			debug!("Spill map needs to spill: {}+{} bytes", inner.mem_size, key_size + size);
			if let Err(e) = self.spill_to_disk(&mut inner) {
				self.track(-(size as i64));
				return Err(e);
			}
		}
		inner.mem.insert(
			key,
			Entry {
				value,
				size,
			},
		);
		inner.mem_size += key_size + size;
		Ok(())
	}

	/// Writes every in-memory entry, in key order, to a new spill file. The
	/// map is released if the file can not be completed.
	fn spill_to_disk(&self, inner: &mut MapInner) -> Result<(), Error> {
		let start = Instant::now();
		let (count, bytes) = (inner.mem.len(), inner.mem_size);
		let file = match self.write_spill(inner) {
			Ok(file) => file,
			Err(e) => {
				inner.release(self.track_memory.as_ref());
				return Err(e);
			}
		};
		for (_, entry) in inner.mem.drain() {
			self.track(-(entry.value.size() as i64));
		}
		inner.mem_size = 0;
		debug!(
			"Spilled {count} entries to {} ({bytes} bytes in memory, {} bytes on disk) in {:?}",
			file.path().display(),
			file.size(),
			start.elapsed()
		);
		inner.spill.push(file);
		Ok(())
	}

	fn write_spill(&self, inner: &MapInner) -> Result<MapFile, Error> {
		let mut file = SpillFile::create(&self.temp, &self.pool)?;
		let mut entries: Vec<(&String, &Entry)> = inner.mem.iter().collect();
		entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
		for (key, entry) in entries {
			file.write(key)?;
			file.write(&entry.value)?;
		}
		file.finish()?;
		Ok(file)
	}

	/// Passes every entry to the callback in ascending key order, folding
	/// the values of each key into one, until the callback returns false.
	/// The map is released afterwards, whether or not it was fully drained.
	///
	/// The map is locked throughout. Within the callback, reads of the map
	/// return nothing and writes are refused with [`Error::Frozen`].
	pub fn foreach<F>(&self, mut f: F) -> Result<(), Error>
	where
		F: FnMut(String, AnnotatedValue) -> bool,
	{
		if self.draining("drained") {
			return Err(Error::Frozen);
		}
		let start = Instant::now();
		let mut inner = self.inner.lock();
		self.draining.store(true, Ordering::Release);
		let files = inner.spill.len();
		let res = self.drain(&mut inner, &mut f);
		inner.release(self.track_memory.as_ref());
		self.draining.store(false, Ordering::Release);
		debug!("Spill map drained {files} spill files in {:?}", start.elapsed());
		res
	}

	fn drain<F>(&self, inner: &mut MapInner, f: &mut F) -> Result<(), Error>
	where
		F: FnMut(String, AnnotatedValue) -> bool,
	{
		for i in 0..inner.spill.len() {
			inner.spill[i].rewind()?;
			let head = self.read_entry(&mut inner.spill[i])?;
			inner.spill[i].head = head;
		}
		// The indexes of the spill files which still have a head
		let mut files: Vec<usize> = (0..inner.spill.len()).filter(|&i| inner.spill[i].head.is_some()).collect();
		heap::init(&mut files, key_order(&inner.spill));
		self.merge_keys(inner, &mut files)?;
		let mut keys: Vec<String> = inner.mem.keys().cloned().collect();
		keys.sort_unstable();
		let mut keys = keys.into_iter().peekable();
		loop {
			let spilled = files.first().and_then(|&i| inner.spill[i].head.as_ref()).map(|(k, _)| k);
			let (from_memory, from_spill) = match (keys.peek(), spilled) {
				(None, None) => return Ok(()),
				(Some(_), None) => (true, false),
				(None, Some(_)) => (false, true),
				(Some(key), Some(spilled)) => (key <= spilled, key >= spilled),
			};
			let memory = if from_memory {
				let Some(key) = keys.next() else {
					fail!("Spill map ran out of keys");
				};
				let Some(entry) = inner.mem.remove(&key) else {
					fail!("Spill map lost the entry for {key:?}");
				};
				inner.mem_size = inner.mem_size.saturating_sub(key.len() as u64 + entry.size);
				Some((key, entry))
			} else {
				None
			};
			let spilled = if from_spill {
				let entry = self.advance(inner, &mut files)?;
				self.merge_keys(inner, &mut files)?;
				Some(entry)
			} else {
				None
			};
			let (key, value) = match (memory, spilled) {
				(Some((key, entry)), None) => (key, entry.value),
				(None, Some(spilled)) => spilled,
				(Some((key, entry)), Some((_, older))) => (key, self.fold(older, entry.value)),
				(None, None) => fail!("Spill map selected no entry"),
			};
			if !f(key, value) {
				return Ok(());
			}
		}
	}

	/// Folds the heads of the spill files while the two smallest share a key
	fn merge_keys(&self, inner: &mut MapInner, files: &mut Vec<usize>) -> Result<(), Error> {
		while files.len() > 1 {
			let (Some(a), Some(b)) =
				(heap::pop(files, key_order(&inner.spill)), heap::pop(files, key_order(&inner.spill)))
			else {
				fail!("Spill map heap lost a file");
			};
			let same = match (&inner.spill[a].head, &inner.spill[b].head) {
				(Some((x, _)), Some((y, _))) => x == y,
				_ => false,
			};
			if !same {
				heap::push(files, b, key_order(&inner.spill));
				heap::push(files, a, key_order(&inner.spill));
				return Ok(());
			}
			let next = self.read_entry(&mut inner.spill[b])?;
			let (Some((key, x)), Some((_, y))) =
				(inner.spill[a].head.take(), std::mem::replace(&mut inner.spill[b].head, next))
			else {
				fail!("Spill map merged a file without a head");
			};
			// Earlier spill files hold older values
			let merged = if a < b {
				self.fold(x, y)
			} else {
				self.fold(y, x)
			};
			inner.spill[a].head = Some((key, merged));
			heap::push(files, a, key_order(&inner.spill));
			if inner.spill[b].head.is_some() {
				heap::push(files, b, key_order(&inner.spill));
			}
		}
		Ok(())
	}

	/// Takes the head of the smallest spill file, reading its next entry
	fn advance(&self, inner: &mut MapInner, files: &mut Vec<usize>) -> Result<(String, AnnotatedValue), Error> {
		let Some(&i) = files.first() else {
			fail!("Spill map advanced without a spill file");
		};
		let next = self.read_entry(&mut inner.spill[i])?;
		let exhausted = next.is_none();
		let Some(entry) = std::mem::replace(&mut inner.spill[i].head, next) else {
			fail!("Spill file {i} was merged without a head");
		};
		if exhausted {
			heap::pop(files, key_order(&inner.spill));
		} else {
			heap::fix(files, 0, key_order(&inner.spill));
		}
		Ok(entry)
	}

	/// Merges two values of the same key, reporting the change in memory
	fn fold(&self, older: AnnotatedValue, newer: AnnotatedValue) -> AnnotatedValue {
		self.track(-(older.size() as i64));
		self.track(-(newer.size() as i64));
		let merged = (self.merge)(older, newer);
		self.track(merged.size() as i64);
		merged
	}

	fn read_entry(&self, file: &mut MapFile) -> Result<Option<(String, AnnotatedValue)>, Error> {
		let Some(key) = file.read::<String>()? else {
			return Ok(None);
		};
		let value = file.read_exact::<AnnotatedValue>()?;
		self.track(value.size() as i64);
		Ok(Some((key, value)))
	}

	/// Removes every entry and releases the spill files
	pub fn release(&self) {
		if self.draining("released") {
			return;
		}
		self.inner.lock().release(self.track_memory.as_ref());
	}

	pub fn stats(&self) -> SpillStats {
		if self.draining("inspected") {
			return SpillStats::default();
		}
		let inner = self.inner.lock();
		SpillStats {
			values: inner.sets,
			files: inner.spill.len(),
			bytes: inner.spill.iter().map(SpillFile::size).sum(),
			read: inner.read + inner.spill.iter().map(SpillFile::read_time).sum::<Duration>(),
			write: inner.write + inner.spill.iter().map(SpillFile::write_time).sum::<Duration>(),
			parents: 0,
		}
	}

	fn track(&self, delta: i64) {
		if let Some(track) = &self.track_memory {
			track(delta);
		}
	}

	/// Whether the map is being drained, which it can not be used during
	fn draining(&self, op: &str) -> bool {
		let draining = self.draining.load(Ordering::Acquire);
		if draining {
			warn!("Spill map {op} from within its own foreach callback");
		}
		draining
	}
}

impl Drop for SpillMap {
	fn drop(&mut self) {
		let track = self.track_memory.clone();
		self.inner.get_mut().release(track.as_ref());
	}
}

/// Orders spill files by the keys of their heads, with ties going to the
/// earlier file
fn key_order(files: &[MapFile]) -> impl Fn(&usize, &usize) -> bool + '_ {
	move |&a: &usize, &b: &usize| match (&files[a].head, &files[b].head) {
		(Some((x, _)), Some((y, _))) => x < y || (x == y && a < b),
		(Some(_), None) => true,
		_ => false,
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use rstest::rstest;

	use super::SpillMap;
	use crate::err::Error;
	use crate::mem::MemoryTracker;
	use crate::spill::{self, Merge, TempSpace};
	use crate::val::{AnnotatedValue, Value, ValuePool};

	fn sum() -> Merge {
		Arc::new(|a: AnnotatedValue, b: AnnotatedValue| {
			let total = a.value().as_number().map_or(0, |n| n.to_int().unwrap_or(0))
				+ b.value().as_number().map_or(0, |n| n.to_int().unwrap_or(0));
			a.set_value(Value::from(total));
			a
		})
	}

	fn map(dir: &tempfile::TempDir, limit: Option<u64>) -> (SpillMap, Arc<ValuePool>, MemoryTracker) {
		let pool = ValuePool::with_capacity(64, 8);
		let temp = Arc::new(TempSpace::new(dir.path(), 0));
		let tracker = MemoryTracker::new();
		let map = SpillMap::new(pool.clone(), temp, limit.map(spill::threshold), Some(tracker.tracker()), sum());
		(map, pool, tracker)
	}

	fn set(map: &SpillMap, pool: &Arc<ValuePool>, tracker: &MemoryTracker, key: &str, v: i64) {
		let value = pool.annotate(Value::from(v));
		tracker.track(value.size() as i64);
		map.set(key, value).unwrap();
	}

	fn drain(map: &SpillMap, tracker: &MemoryTracker) -> Vec<(String, Value)> {
		let mut out = Vec::new();
		map.foreach(|k, v| {
			tracker.track(-(v.size() as i64));
			out.push((k, v.value().clone()));
			true
		})
		.unwrap();
		out
	}

	#[test_log::test]
	fn duplicates_fold_across_spills() {
		let dir = tempfile::tempdir().unwrap();
		let (map, pool, tracker) = map(&dir, Some(20));
		for (key, v) in [("b", 1), ("a", 1), ("c", 5), ("b", 2), ("a", 3), ("d", 4), ("b", 10)] {
			set(&map, &pool, &tracker, key, v);
		}
		assert!(map.stats().files > 1);
		let out = drain(&map, &tracker);
		assert_eq!(
			out,
			vec![
				("a".to_string(), Value::from(4)),
				("b".to_string(), Value::from(13)),
				("c".to_string(), Value::from(5)),
				("d".to_string(), Value::from(4)),
			]
		);
		assert_eq!(tracker.current(), 0);
		assert_eq!(map.stats().files, 0);
	}

	#[test]
	fn setting_in_memory_replaces() {
		let dir = tempfile::tempdir().unwrap();
		let (map, pool, tracker) = map(&dir, None);
		set(&map, &pool, &tracker, "marty", 1);
		set(&map, &pool, &tracker, "marty", 2);
		assert_eq!(*map.get("marty").unwrap().value(), Value::from(2));
		assert!(map.get("emmett").is_none());
		assert_eq!(drain(&map, &tracker), vec![("marty".to_string(), Value::from(2))]);
		assert_eq!(tracker.current(), 0);
	}

	#[test]
	fn in_memory_entries_are_sorted() {
		let dir = tempfile::tempdir().unwrap();
		let (map, pool, tracker) = map(&dir, None);
		for key in ["george", "loraine", "biff", "emmett"] {
			set(&map, &pool, &tracker, key, 1);
		}
		let keys: Vec<String> = drain(&map, &tracker).into_iter().map(|(k, _)| k).collect();
		assert_eq!(keys, ["biff", "emmett", "george", "loraine"]);
	}

	#[test]
	fn early_stop_releases_the_rest() {
		let dir = tempfile::tempdir().unwrap();
		let (map, pool, tracker) = map(&dir, Some(10));
		for (i, key) in ["a", "b", "c", "d", "e", "f"].into_iter().enumerate() {
			set(&map, &pool, &tracker, key, i as i64);
		}
		map.foreach(|_, v| {
			tracker.track(-(v.size() as i64));
			false
		})
		.unwrap();
		assert_eq!(tracker.current(), 0);
		assert_eq!(map.stats().files, 0);
		assert!(map.get("f").is_none());
	}

	fn concat() -> Merge {
		Arc::new(|older: AnnotatedValue, newer: AnnotatedValue| {
			let joined = format!("{}{}", older.value().as_str().unwrap_or(""), newer.value().as_str().unwrap_or(""));
			older.set_value(Value::from(joined));
			older
		})
	}

	fn set_str(map: &SpillMap, pool: &Arc<ValuePool>, tracker: &MemoryTracker, key: &str, v: &str) -> Result<(), Error> {
		let value = pool.annotate(Value::from(v));
		tracker.track(value.size() as i64);
		map.set(key, value)
	}

	#[test]
	fn older_values_fold_first() {
		let dir = tempfile::tempdir().unwrap();
		let pool = ValuePool::with_capacity(64, 8);
		let temp = Arc::new(TempSpace::new(dir.path(), 0));
		let tracker = MemoryTracker::new();
		let map = SpillMap::new(pool.clone(), temp, Some(spill::threshold(0)), Some(tracker.tracker()), concat());
		for (key, v) in [("k", "1"), ("j", "a"), ("k", "2"), ("j", "b"), ("k", "3")] {
			set_str(&map, &pool, &tracker, key, v).unwrap();
		}
		assert_eq!(map.stats().files, 4);
		assert_eq!(drain(&map, &tracker), vec![
			("j".to_string(), Value::from("ab")),
			("k".to_string(), Value::from("123")),
		]);
		assert_eq!(tracker.current(), 0);
	}

	#[rstest]
	#[case::spilled(true)]
	#[case::in_memory(false)]
	fn values_changed_in_place_are_released_at_their_size(#[case] spill: bool) {
		let dir = tempfile::tempdir().unwrap();
		let (map, pool, tracker) = map(&dir, spill.then_some(0));
		set_str(&map, &pool, &tracker, "a", "x").unwrap();
		let held = map.get("a").unwrap();
		let before = held.size();
		held.set_value(Value::from("a much longer replacement"));
		tracker.track(held.size() as i64 - before as i64);
		drop(held);
		set_str(&map, &pool, &tracker, "b", "y").unwrap();
		assert_eq!(map.stats().files, usize::from(spill));
		map.release();
		assert_eq!(tracker.current(), 0);
	}

	#[test]
	fn replaced_values_are_released_at_their_size() {
		let dir = tempfile::tempdir().unwrap();
		let (map, pool, tracker) = map(&dir, None);
		set_str(&map, &pool, &tracker, "a", "x").unwrap();
		let held = map.get("a").unwrap();
		let before = held.size();
		held.set_value(Value::from("grown"));
		tracker.track(held.size() as i64 - before as i64);
		drop(held);
		set_str(&map, &pool, &tracker, "a", "z").unwrap();
		assert_eq!(drain(&map, &tracker), vec![("a".to_string(), Value::from("z"))]);
		assert_eq!(tracker.current(), 0);
	}

	#[test]
	fn quota_exhaustion_releases_everything() {
		let dir = tempfile::tempdir().unwrap();
		let pool = ValuePool::with_capacity(8, 8);
		let temp = Arc::new(TempSpace::new(dir.path(), 8));
		let tracker = MemoryTracker::new();
		let map = SpillMap::new(pool.clone(), temp.clone(), Some(spill::threshold(0)), Some(tracker.tracker()), concat());
		set_str(&map, &pool, &tracker, "a", "a long enough string").unwrap();
		let res = set_str(&map, &pool, &tracker, "b", "another");
		assert!(matches!(res, Err(Error::TempQuotaExceeded)));
		assert_eq!(temp.used(), 0);
		assert_eq!(tracker.current(), 0);
		assert!(map.get("a").is_none());
	}

	#[test_log::test]
	fn callbacks_can_not_use_the_map() {
		let dir = tempfile::tempdir().unwrap();
		let (map, pool, tracker) = map(&dir, Some(10));
		for (i, key) in ["a", "b", "c"].into_iter().enumerate() {
			set(&map, &pool, &tracker, key, i as i64);
		}
		let mut seen = Vec::new();
		map.foreach(|k, v| {
			tracker.track(-(v.size() as i64));
			assert!(map.get(&k).is_none());
			let refused = set_str(&map, &pool, &tracker, "z", "late");
			assert!(matches!(refused, Err(Error::Frozen)));
			assert!(matches!(map.foreach(|_, _| true), Err(Error::Frozen)));
			seen.push(k);
			true
		})
		.unwrap();
		assert_eq!(seen, ["a", "b", "c"]);
		assert_eq!(tracker.current(), 0);
		set(&map, &pool, &tracker, "a", 1);
		assert_eq!(*map.get("a").unwrap().value(), Value::from(1));
	}

	#[test]
	fn concurrent_producers() {
		let dir = tempfile::tempdir().unwrap();
		let (map, pool, tracker) = map(&dir, Some(256));
		std::thread::scope(|s| {
			for t in 0..4 {
				let (map, pool, tracker) = (&map, &pool, &tracker);
				s.spawn(move || {
					for i in 0..100 {
						set(map, pool, tracker, &format!("t{t}-{i:03}"), i);
					}
				});
			}
		});
		assert!(map.stats().files > 0);
		let out = drain(&map, &tracker);
		assert_eq!(out.len(), 400);
		assert!(out.windows(2).all(|w| w[0].0 < w[1].0));
		assert_eq!(tracker.current(), 0);
	}
}
