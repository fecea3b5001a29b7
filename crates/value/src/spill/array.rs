use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::cnf::{PARENT_ATTACHMENT, SPILL_MAX_PARENTS};
use crate::err::Error;
use crate::spill::codec::Tag;
use crate::spill::file::SpillFile;
use crate::spill::{Less, ShouldSpill, SpillStats, TempSpace, TrackMemory, heap};
use crate::val::{AnnotatedValue, Value, ValuePool};

/// The capacity of the first buffer taken from the pool
const INITIAL_CAPACITY: usize = 16;

/// An append-only collection of annotated values, optionally ordered and
/// optionally bounded, which spills to disk under memory pressure.
///
/// With a comparator the values are returned in ascending order, merging
/// every spill file with the in-memory buffer. With a heap size as well only
/// the smallest values are retained, using a bounded max-heap whose root is
/// the worst value held. Bounding stops for good once the array spills.
/// Without a comparator values are returned in spill file order, followed by
/// the in-memory buffer.
///
/// The array is single-threaded. Once iteration has started no further
/// values may be appended until the array is truncated.
pub struct SpillArray {
	pool: Arc<ValuePool>,
	temp: Arc<TempSpace>,
	should_spill: Option<ShouldSpill>,
	track_memory: Option<TrackMemory>,
	less: Option<Less>,
	mem: Option<Vec<AnnotatedValue>>,
	heap_size: usize,
	/// The bytes held by the in-memory buffer
	mem_size: u64,
	/// The values held, in memory and on disk
	length: usize,
	spill: Vec<SpillFile<AnnotatedValue>>,
	frozen: bool,
	/// Scope parents kept in memory while their children are on disk
	parents: HashMap<String, Arc<Value>>,
	values_in: u64,
}

impl SpillArray {
	pub fn new(
		pool: Arc<ValuePool>,
		temp: Arc<TempSpace>,
		should_spill: Option<ShouldSpill>,
		track_memory: Option<TrackMemory>,
		less: Option<Less>,
	) -> Self {
		Self {
			pool,
			temp,
			should_spill,
			track_memory,
			less,
			mem: None,
			heap_size: 0,
			mem_size: 0,
			length: 0,
			spill: Vec::new(),
			frozen: false,
			parents: HashMap::new(),
			values_in: 0,
		}
	}

	/// Creates an empty array with the same configuration
	pub fn copy(&self) -> Self {
		Self::new(
			self.pool.clone(),
			self.temp.clone(),
			self.should_spill.clone(),
			self.track_memory.clone(),
			self.less.clone(),
		)
	}

	/// The number of values held, in memory and on disk
	pub fn len(&self) -> usize {
		self.length
	}

	pub fn is_empty(&self) -> bool {
		self.length == 0
	}

	pub fn heap_size(&self) -> usize {
		self.heap_size
	}

	/// Bounds the array to the `size` smallest values. A size of zero, or
	/// an array without a comparator, removes the bound. Any values held
	/// are released.
	pub fn set_heap_size(&mut self, size: usize) {
		let size = if self.less.is_none() {
			0
		} else {
			size
		};
		let capacity = self.mem.as_ref().map_or(0, Vec::capacity);
		if self.length > 0 || capacity < size {
			self.release();
		}
		if self.heap_size != size {
			debug!("Heap size of spill array set to {size}");
		}
		self.heap_size = size;
	}

	/// Lowers the bound of the array, leaving a larger bound untouched
	pub fn shrink_heap_size(&mut self, size: usize) {
		if size < self.heap_size {
			self.set_heap_size(size);
		}
	}

	/// Adds a value to the array, spilling the in-memory buffer first if the
	/// spill predicate asks for it. A value which is refused is released
	/// along with its reported memory.
	pub fn append(&mut self, value: AnnotatedValue) -> Result<(), Error> {
		let size = value.size();
		if self.frozen {
			self.track(-(size as i64));
			return Err(Error::Frozen);
		}
		if self.mem_size > 0 && self.should_spill.as_ref().is_some_and(|f| f(self.mem_size, size)) {
			debug!(
				"Spill array needs to spill: {}+{size} bytes, heap size {}",
				self.mem_size, self.heap_size
			);
			if let Err(e) = self.spill_to_disk() {
				self.track(-(size as i64));
				return Err(e);
			}
		}
		self.values_in += 1;
		let mut mem = self.buffer();
		match self.less.clone() {
			Some(less) if self.heap_size > 0 => {
				// Values no better than the worst held never enter the heap
				if mem.len() >= self.heap_size && !less(&value, &mem[0]) {
					self.mem = Some(mem);
					self.track(-(size as i64));
					return Ok(());
				}
				heap::push(&mut mem, value, |a, b| less(b, a));
				self.length += 1;
				self.mem_size += size;
				if mem.len() > self.heap_size {
					if let Some(worst) = heap::pop(&mut mem, |a, b| less(b, a)) {
						let size = worst.size();
						self.length -= 1;
						self.mem_size = self.mem_size.saturating_sub(size);
						self.track(-(size as i64));
					}
				}
			}
			_ => {
				mem.push(value);
				self.length += 1;
				self.mem_size += size;
			}
		}
		self.mem = Some(mem);
		Ok(())
	}

	/// Takes the in-memory buffer, ensuring it has room for another value
	fn buffer(&mut self) -> Vec<AnnotatedValue> {
		let mut mem = match self.mem.take() {
			Some(mem) => mem,
			None => self.pool.acquire_buffer(self.heap_size.max(INITIAL_CAPACITY)),
		};
		if mem.len() == mem.capacity() {
			let mut grown = self.pool.acquire_buffer((mem.len() * 2).max(INITIAL_CAPACITY));
			grown.append(&mut mem);
			self.pool.release_buffer(mem);
			mem = grown;
		}
		mem
	}

	/// Writes the whole in-memory buffer to a new spill file. The array is
	/// truncated if the file can not be completed.
	fn spill_to_disk(&mut self) -> Result<(), Error> {
		let Some(mut mem) = self.mem.take() else {
			return Ok(());
		};
		if mem.is_empty() {
			self.mem = Some(mem);
			return Ok(());
		}
		if self.heap_size > 0 {
			debug!("Spill array switching from a heap of {} to an unbounded buffer", self.heap_size);
			self.heap_size = 0;
		}
		if let Some(less) = &self.less {
			mem.sort_by(|a, b| ordering(less, a, b));
		}
		let start = Instant::now();
		let (count, bytes) = (mem.len(), self.mem_size);
		let res = self.write_spill(&mem);
		match res {
			Ok(file) => {
				for value in mem.drain(..) {
					self.track(-(value.size() as i64));
				}
				self.mem_size = 0;
				debug!(
					"Spilled {count} values to {} ({bytes} bytes in memory, {} bytes on disk) in {:?}",
					file.path().display(),
					file.size(),
					start.elapsed()
				);
				self.spill.push(file);
				self.mem = Some(mem);
				Ok(())
			}
			Err(e) => {
				self.mem = Some(mem);
				self.truncate();
				Err(e)
			}
		}
	}

	fn write_spill(&mut self, mem: &[AnnotatedValue]) -> Result<SpillFile<AnnotatedValue>, Error> {
		let mut file = SpillFile::create(&self.temp, &self.pool)?;
		for value in mem {
			let parent = self.detach_parent(value);
			let res = file.write(value);
			if let Some(parent) = parent {
				value.remove_attachment(PARENT_ATTACHMENT);
				if let Value::Scope(scope) = &mut *value.value_mut() {
					scope.set_parent(Some(parent));
				}
			}
			res?;
		}
		file.finish()?;
		Ok(file)
	}

	/// Replaces the parent of a scope value with a key into the parents map,
	/// returning the detached parent
	fn detach_parent(&mut self, value: &AnnotatedValue) -> Option<Arc<Value>> {
		let key = {
			let mut inner = value.value_mut();
			let Value::Scope(scope) = &mut *inner else {
				return None;
			};
			let parent = scope.parent()?;
			let key = format!("{:p}", Arc::as_ptr(parent));
			if !self.parents.contains_key(&key) {
				if self.parents.len() >= *SPILL_MAX_PARENTS {
					return None;
				}
				self.parents.insert(key.clone(), parent.clone());
			}
			(key, scope.take_parent())
		};
		value.set_attachment(PARENT_ATTACHMENT, key.0);
		key.1
	}

	/// Passes every value to the callback, in order when the array has a
	/// comparator, until the callback returns false. Each value is moved
	/// out of the array.
	pub fn foreach<F>(&mut self, mut f: F) -> Result<(), Error>
	where
		F: FnMut(AnnotatedValue) -> bool,
	{
		if self.frozen {
			return Err(Error::Frozen);
		}
		self.frozen = true;
		self.heap_size = 0;
		let start = Instant::now();
		for file in self.spill.iter_mut() {
			file.rewind()?;
		}
		let mut mem = self.mem.take().unwrap_or_default();
		let res = match self.less.clone() {
			Some(less) => self.foreach_sorted(&mut mem, &less, &mut f),
			None => self.foreach_unsorted(&mut mem, &mut f),
		};
		self.mem = Some(mem);
		debug!(
			"Spill array iteration over {} spill files finished in {:?}, {} values remaining",
			self.spill.len(),
			start.elapsed(),
			self.length
		);
		res
	}

	fn foreach_unsorted<F>(&mut self, mem: &mut Vec<AnnotatedValue>, f: &mut F) -> Result<(), Error>
	where
		F: FnMut(AnnotatedValue) -> bool,
	{
		for i in 0..self.spill.len() {
			while let Some(value) = read_value(&mut self.spill[i], &self.parents)? {
				self.track(value.size() as i64);
				self.length = self.length.saturating_sub(1);
				if !f(value) {
					return Ok(());
				}
			}
		}
		mem.reverse();
		while let Some(value) = mem.pop() {
			self.mem_size = self.mem_size.saturating_sub(value.size());
			self.length = self.length.saturating_sub(1);
			if !f(value) {
				return Ok(());
			}
		}
		Ok(())
	}

	fn foreach_sorted<F>(
		&mut self,
		mem: &mut Vec<AnnotatedValue>,
		less: &Less,
		f: &mut F,
	) -> Result<(), Error>
	where
		F: FnMut(AnnotatedValue) -> bool,
	{
		for i in 0..self.spill.len() {
			let head = read_value(&mut self.spill[i], &self.parents)?;
			if let Some(value) = &head {
				self.track(value.size() as i64);
			}
			self.spill[i].head = head;
		}
		mem.sort_by(|a, b| ordering(less, a, b));
		mem.reverse();
		// The indexes of the spill files which still have a head
		let mut files: Vec<usize> = (0..self.spill.len()).filter(|&i| self.spill[i].head.is_some()).collect();
		heap::init(&mut files, file_order(&self.spill, less));
		loop {
			let best = files.first().copied();
			// Memory values only go first when strictly smaller
			let from_memory = match (mem.last(), best) {
				(Some(value), Some(i)) => self.spill[i].head.as_ref().is_none_or(|head| less(value, head)),
				(Some(_), None) => true,
				(None, Some(_)) => false,
				(None, None) => return Ok(()),
			};
			let value = match best {
				Some(i) if !from_memory => {
					let next = read_value(&mut self.spill[i], &self.parents)?;
					if let Some(value) = &next {
						self.track(value.size() as i64);
					}
					let exhausted = next.is_none();
					let Some(value) = std::mem::replace(&mut self.spill[i].head, next) else {
						fail!("Spill file {i} was merged without a head");
					};
					if exhausted {
						heap::pop(&mut files, file_order(&self.spill, less));
					} else {
						heap::fix(&mut files, 0, file_order(&self.spill, less));
					}
					value
				}
				_ => {
					let Some(value) = mem.pop() else {
						return Ok(());
					};
					self.mem_size = self.mem_size.saturating_sub(value.size());
					value
				}
			};
			self.length = self.length.saturating_sub(1);
			if !f(value) {
				return Ok(());
			}
		}
	}

	/// Removes every value, releasing the spill files and reporting the
	/// released memory
	pub fn truncate(&mut self) {
		let track = self.track_memory.clone();
		self.truncate_with(|value| {
			if let Some(track) = &track {
				track(-(value.size() as i64));
			}
		});
	}

	/// Removes every value, handing each in-memory value to the callback
	/// and releasing the spill files
	pub fn truncate_with<F>(&mut self, mut on_discard: F)
	where
		F: FnMut(AnnotatedValue),
	{
		self.parents.clear();
		for mut file in self.spill.drain(..) {
			if let Some(head) = file.head.take() {
				if let Some(track) = &self.track_memory {
					track(-(head.size() as i64));
				}
			}
		}
		if let Some(mem) = self.mem.as_mut() {
			for value in mem.drain(..) {
				on_discard(value);
			}
		}
		self.length = 0;
		self.mem_size = 0;
		self.frozen = false;
	}

	/// Truncates the array and returns its buffer to the pool
	pub fn release(&mut self) {
		self.truncate();
		if let Some(mem) = self.mem.take() {
			self.pool.release_buffer(mem);
		}
	}

	pub fn stats(&self) -> SpillStats {
		SpillStats {
			values: self.values_in,
			files: self.spill.len(),
			bytes: self.spill.iter().map(SpillFile::size).sum(),
			read: self.spill.iter().map(SpillFile::read_time).sum(),
			write: self.spill.iter().map(SpillFile::write_time).sum(),
			parents: self.parents.len(),
		}
	}

	fn track(&self, delta: i64) {
		if let Some(track) = &self.track_memory {
			track(delta);
		}
	}
}

impl Drop for SpillArray {
	fn drop(&mut self) {
		self.release();
	}
}

fn ordering(less: &Less, a: &AnnotatedValue, b: &AnnotatedValue) -> Ordering {
	if less(a, b) {
		Ordering::Less
	} else if less(b, a) {
		Ordering::Greater
	} else {
		Ordering::Equal
	}
}

/// Orders spill files by their heads, with ties going to the earlier file
fn file_order<'a>(
	files: &'a [SpillFile<AnnotatedValue>],
	less: &'a Less,
) -> impl Fn(&usize, &usize) -> bool + 'a {
	move |&a: &usize, &b: &usize| match (&files[a].head, &files[b].head) {
		(Some(x), Some(y)) => less(x, y) || (!less(y, x) && a < b),
		(Some(_), None) => true,
		_ => false,
	}
}

/// Reads the next value from a spill file, rebinding its scope parent
fn read_value(
	file: &mut SpillFile<AnnotatedValue>,
	parents: &HashMap<String, Arc<Value>>,
) -> Result<Option<AnnotatedValue>, Error> {
	let Some(value) = file.read::<AnnotatedValue>()? else {
		return Ok(None);
	};
	if let Some(key) = value.remove_attachment(PARENT_ATTACHMENT) {
		let Some(parent) = key.as_str().and_then(|k| parents.get(k)) else {
			warn!("Unknown scope parent {key:?} in spill file {}", file.path().display());
			return Err(Error::ValueInvalid {
				found: Tag::String as u8,
				expected: "a known scope parent",
			});
		};
		if let Value::Scope(scope) = &mut *value.value_mut() {
			scope.set_parent(Some(parent.clone()));
		}
	}
	Ok(Some(value))
}
