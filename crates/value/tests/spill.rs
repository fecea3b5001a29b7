use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use n1ql_value::err::Error;
use n1ql_value::mem::MemoryTracker;
use n1ql_value::spill::{self, Less, Merge, SpillArray, SpillMap, TempSpace};
use n1ql_value::val::{AnnotatedValue, Object, Value, ValuePool};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

struct Fixture {
	_dir: TempDir,
	pool: Arc<ValuePool>,
	temp: Arc<TempSpace>,
	tracker: MemoryTracker,
}

impl Fixture {
	fn new(quota: u64) -> Result<Self> {
		let dir = tempfile::tempdir()?;
		let temp = Arc::new(TempSpace::new(dir.path(), quota));
		Ok(Self {
			_dir: dir,
			pool: ValuePool::with_capacity(256, 16),
			temp,
			tracker: MemoryTracker::new(),
		})
	}

	fn array(&self, limit: Option<u64>, less: Option<Less>) -> SpillArray {
		SpillArray::new(
			self.pool.clone(),
			self.temp.clone(),
			limit.map(spill::threshold),
			Some(self.tracker.tracker()),
			less,
		)
	}

	fn map(&self, limit: Option<u64>, merge: Merge) -> SpillMap {
		SpillMap::new(
			self.pool.clone(),
			self.temp.clone(),
			limit.map(spill::threshold),
			Some(self.tracker.tracker()),
			merge,
		)
	}

	/// Annotates a value, accounting for it as the caller
	fn annotate(&self, value: Value) -> AnnotatedValue {
		let value = self.pool.annotate(value);
		self.tracker.track(value.size() as i64);
		value
	}

	/// Accounts for a value handed back by a container
	fn receive(&self, value: &AnnotatedValue) {
		self.tracker.track(-(value.size() as i64));
	}
}

fn ascending() -> Less {
	Arc::new(|a: &AnnotatedValue, b: &AnnotatedValue| *a.value() < *b.value())
}

fn sum() -> Merge {
	Arc::new(|a: AnnotatedValue, b: AnnotatedValue| {
		let total = [&a, &b]
			.iter()
			.filter_map(|v| v.value().as_number().and_then(|n| n.to_int()))
			.sum::<i64>();
		a.set_value(Value::from(total));
		a
	})
}

fn person(name: &str, surname: &str) -> Value {
	Value::from(Object::from([
		("name".to_string(), Value::from(name)),
		("surname".to_string(), Value::from(surname)),
	]))
}

fn full_name(v: &AnnotatedValue) -> String {
	let value = v.value();
	let part = |field| value.field(field).and_then(Value::as_str).unwrap_or_default().to_string();
	part("name") + &part("surname")
}

#[test_log::test]
fn sorted_people_survive_a_spill() -> Result<()> {
	let fixture = Fixture::new(0)?;
	let less: Less = Arc::new(|a: &AnnotatedValue, b: &AnnotatedValue| full_name(a) < full_name(b));
	let first_two = {
		let a = fixture.pool.annotate(person("Marty", "McFly")).size();
		let b = fixture.pool.annotate(person("Emmett", "Brown")).size();
		a + b
	};
	let mut array = fixture.array(Some(first_two), Some(less));
	for (name, surname) in [("Marty", "McFly"), ("Emmett", "Brown"), ("Loraine", "Baines"), ("George", "McFly")]
	{
		array.append(fixture.annotate(person(name, surname)))?;
	}
	assert!(array.stats().files >= 1);
	let mut names = Vec::new();
	array.foreach(|v| {
		fixture.receive(&v);
		names.push(full_name(&v));
		true
	})?;
	assert_eq!(names, ["EmmettBrown", "GeorgeMcFly", "LoraineBaines", "MartyMcFly"]);
	array.release();
	assert_eq!(fixture.tracker.current(), 0);
	Ok(())
}

#[test]
fn unsorted_arrays_lose_nothing() -> Result<()> {
	let mut rng = StdRng::seed_from_u64(1955);
	for _ in 0..8 {
		let fixture = Fixture::new(0)?;
		let limit = rng.gen_range(16..200);
		let mut array = fixture.array(Some(limit), None);
		let count = rng.gen_range(1..300);
		for i in 0..count {
			array.append(fixture.annotate(Value::from(i)))?;
		}
		let mut seen = Vec::new();
		array.foreach(|v| {
			fixture.receive(&v);
			seen.push(v.value().as_number().and_then(|n| n.to_int()).unwrap_or(-1));
			true
		})?;
		seen.sort();
		assert_eq!(seen, (0..count).collect::<Vec<i64>>());
		array.release();
		assert_eq!(fixture.tracker.current(), 0);
	}
	Ok(())
}

#[test]
fn sorted_arrays_match_a_single_sort() -> Result<()> {
	let mut rng = StdRng::seed_from_u64(1985);
	let fixture = Fixture::new(0)?;
	let input: Vec<Value> = (0..500)
		.map(|_| match rng.gen_range(0..3) {
			0 => Value::from(rng.gen_range(-50..50)),
			1 => Value::from(rng.gen_range(-50.0..50.0)),
			_ => Value::from(format!("{:04}", rng.gen_range(0..1000))),
		})
		.collect();
	let mut array = fixture.array(Some(256), Some(ascending()));
	for v in &input {
		array.append(fixture.annotate(v.clone()))?;
	}
	assert!(array.stats().files > 1);
	let mut out = Vec::new();
	array.foreach(|v| {
		fixture.receive(&v);
		out.push(v.value().clone());
		true
	})?;
	let mut expected = input;
	expected.sort();
	assert_eq!(out, expected);
	array.release();
	assert_eq!(fixture.tracker.current(), 0);
	Ok(())
}

#[test]
fn bounded_arrays_keep_the_k_smallest() -> Result<()> {
	let mut rng = StdRng::seed_from_u64(2015);
	let fixture = Fixture::new(0)?;
	let mut array = fixture.array(None, Some(ascending()));
	array.set_heap_size(10);
	let input: Vec<i64> = (0..200).map(|_| rng.gen_range(0..1000)).collect();
	for v in &input {
		array.append(fixture.annotate(Value::from(*v)))?;
	}
	assert_eq!(array.len(), 10);
	let mut out = Vec::new();
	array.foreach(|v| {
		fixture.receive(&v);
		out.push(v.value().clone());
		true
	})?;
	let mut expected = input;
	expected.sort();
	let expected: Vec<Value> = expected.into_iter().take(10).map(Value::from).collect();
	assert_eq!(out, expected);
	array.release();
	assert_eq!(fixture.tracker.current(), 0);
	Ok(())
}

#[test]
fn maps_fold_every_value_of_a_key() -> Result<()> {
	let mut rng = StdRng::seed_from_u64(1885);
	for _ in 0..8 {
		let fixture = Fixture::new(0)?;
		let map = fixture.map(Some(rng.gen_range(0..400)), sum());
		let mut expected: BTreeMap<String, i64> = BTreeMap::new();
		for _ in 0..rng.gen_range(1..400) {
			let key = format!("k{}", rng.gen_range(0..40));
			let v = rng.gen_range(1..10);
			// Accumulate into the in-memory entry the way a grouping operator does
			let value = match map.get(&key) {
				Some(existing) => {
					let total = existing.value().as_number().and_then(|n| n.to_int()).unwrap_or(0) + v;
					let before = existing.size();
					existing.set_value(Value::from(total));
					// Changes made in place are reported by whoever makes them
					fixture.tracker.track(existing.size() as i64 - before as i64);
					existing
				}
				None => fixture.pool.annotate(Value::from(v)),
			};
			// Every set is accounted in full, the map releases what it replaces
			fixture.tracker.track(value.size() as i64);
			map.set(key.clone(), value)?;
			*expected.entry(key).or_default() += v;
		}
		let mut out = BTreeMap::new();
		let mut keys = Vec::new();
		map.foreach(|k, v| {
			fixture.receive(&v);
			keys.push(k.clone());
			out.insert(k, v.value().as_number().and_then(|n| n.to_int()).unwrap_or(0));
			true
		})?;
		assert_eq!(out, expected);
		assert!(keys.windows(2).all(|w| w[0] < w[1]));
		assert_eq!(fixture.tracker.current(), 0);
	}
	Ok(())
}

#[test]
fn quota_exhaustion_is_a_resource_limit() -> Result<()> {
	let fixture = Fixture::new(64)?;
	let map = fixture.map(Some(0), sum());
	let mut result = Ok(());
	for i in 0..100 {
		result = map.set(format!("key{i}"), fixture.annotate(Value::from("Hill Valley courthouse clock")));
		if result.is_err() {
			break;
		}
	}
	let Err(err) = result else {
		panic!("the quota was never exceeded");
	};
	assert!(matches!(err, Error::TempQuotaExceeded));
	assert!(err.is_resource_limit());
	assert_eq!(map.stats().files, 0);
	assert_eq!(fixture.temp.used(), 0);
	assert_eq!(fixture.tracker.current(), 0);
	Ok(())
}
