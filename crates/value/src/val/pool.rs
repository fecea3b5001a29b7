use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::cnf::{BUFFER_POOL_CAPACITY, VALUE_POOL_CAPACITY};
use crate::val::annotated::Shared;
use crate::val::{AnnotatedValue, Value};

/// A pool of annotated value bodies and of value buffers.
///
/// Pools are owned by the surrounding engine or session and handed to every
/// container which needs one, so there is no process-wide pool state. A
/// released annotated value returns to the pool it was drawn from, as long
/// as that pool is still alive and has room.
pub struct ValuePool {
	values: Mutex<Vec<Arc<Shared>>>,
	buffers: Mutex<Vec<Vec<AnnotatedValue>>>,
	value_capacity: usize,
	buffer_capacity: usize,
	hits: AtomicU64,
	misses: AtomicU64,
}

impl ValuePool {
	/// Creates a pool sized from the environment configuration
	pub fn new() -> Arc<Self> {
		Self::with_capacity(*VALUE_POOL_CAPACITY, *BUFFER_POOL_CAPACITY)
	}

	/// Creates a pool which retains at most the given number of annotated
	/// value bodies and value buffers
	pub fn with_capacity(values: usize, buffers: usize) -> Arc<Self> {
		Arc::new(Self {
			values: Mutex::new(Vec::with_capacity(values.min(64))),
			buffers: Mutex::new(Vec::with_capacity(buffers.min(64))),
			value_capacity: values,
			buffer_capacity: buffers,
			hits: AtomicU64::new(0),
			misses: AtomicU64::new(0),
		})
	}

	/// Wraps a value in an annotated value drawn from this pool
	pub fn annotate(self: &Arc<Self>, value: Value) -> AnnotatedValue {
		let pooled = self.values.lock().pop();
		if let Some(mut shared) = pooled {
			// Pooled bodies are only ever held by the pool
			if let Some(body) = Arc::get_mut(&mut shared) {
				self.hits.fetch_add(1, Ordering::Relaxed);
				body.reset(value);
				return AnnotatedValue::from_shared(shared);
			}
		}
		self.misses.fetch_add(1, Ordering::Relaxed);
		AnnotatedValue::from_shared(Arc::new(Shared::new(value, Arc::downgrade(self), false)))
	}

	/// Returns a released body to the pool, if there is room for it
	pub(crate) fn recycle(&self, shared: Arc<Shared>) {
		let mut values = self.values.lock();
		if values.len() < self.value_capacity {
			values.push(shared);
		}
	}

	/// Takes a buffer with room for at least `capacity` values
	pub fn acquire_buffer(&self, capacity: usize) -> Vec<AnnotatedValue> {
		let mut buffers = self.buffers.lock();
		match buffers.iter().position(|b| b.capacity() >= capacity) {
			Some(i) => buffers.swap_remove(i),
			None => Vec::with_capacity(capacity),
		}
	}

	/// Returns a buffer to the pool, releasing any values it still holds
	pub fn release_buffer(&self, mut buffer: Vec<AnnotatedValue>) {
		buffer.clear();
		if buffer.capacity() == 0 {
			return;
		}
		let mut buffers = self.buffers.lock();
		if buffers.len() < self.buffer_capacity {
			buffers.push(buffer);
		}
	}

	/// The number of annotated value bodies waiting for reuse
	pub fn pooled_values(&self) -> usize {
		self.values.lock().len()
	}

	/// The number of buffers waiting for reuse
	pub fn pooled_buffers(&self) -> usize {
		self.buffers.lock().len()
	}

	/// The number of annotated values served from and beyond the pool
	pub fn hits_and_misses(&self) -> (u64, u64) {
		(self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
	}
}

#[cfg(test)]
mod tests {
	use super::ValuePool;
	use crate::val::Value;

	#[test]
	fn bodies_are_reused() {
		let pool = ValuePool::with_capacity(2, 2);
		let values: Vec<_> = (0..3).map(|i| pool.annotate(Value::from(i))).collect();
		drop(values);
		// Only two bodies are retained
		assert_eq!(pool.pooled_values(), 2);
		let a = pool.annotate(Value::from("a"));
		let b = pool.annotate(Value::from("b"));
		let c = pool.annotate(Value::from("c"));
		assert_eq!(pool.hits_and_misses(), (2, 4));
		assert_eq!(*c.value(), Value::from("c"));
		drop((a, b, c));
	}

	#[test]
	fn values_outliving_their_pool_are_freed() {
		let pool = ValuePool::with_capacity(2, 2);
		let av = pool.annotate(Value::from(1));
		drop(pool);
		assert_eq!(*av.value(), Value::from(1));
		av.recycle();
	}

	#[test]
	fn buffers_are_reused_by_capacity() {
		let pool = ValuePool::with_capacity(2, 2);
		let mut small = pool.acquire_buffer(4);
		small.push(pool.annotate(Value::Null));
		let large = pool.acquire_buffer(64);
		pool.release_buffer(small);
		pool.release_buffer(large);
		assert_eq!(pool.pooled_buffers(), 2);
		// The released values went back to the pool
		assert_eq!(pool.pooled_values(), 1);
		let reused = pool.acquire_buffer(32);
		assert!(reused.capacity() >= 32);
		assert!(reused.is_empty());
		assert_eq!(pool.pooled_buffers(), 1);
	}
}
