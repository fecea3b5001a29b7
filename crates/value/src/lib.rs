//! # N1QL Value
//!
//! The value layer of the N1QL query engine: the JSON value domain consumed by
//! query operators, the reference-counted [`AnnotatedValue`] that carries
//! document metadata through a query pipeline, and the memory-bounded
//! containers which hold intermediate results.
//!
//! Sort buffers, GROUP BY accumulators and bounded top-K buffers all need to
//! work whether or not their contents fit in memory. The [`SpillArray`] and
//! [`SpillMap`] containers consult a caller-supplied spill predicate and
//! overflow to temporary files when asked to, merging the on-disk and in-memory
//! data back together when they are drained. Values are persisted with the
//! self-describing binary format in [`spill::codec`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use n1ql_value::spill::{self, SpillArray, TempSpace};
//! use n1ql_value::val::{AnnotatedValue, Value, ValuePool};
//!
//! # fn main() -> Result<(), n1ql_value::err::Error> {
//! let pool = ValuePool::new();
//! let temp = Arc::new(TempSpace::from_env());
//! let less: spill::Less = Arc::new(|a: &AnnotatedValue, b: &AnnotatedValue| *a.value() < *b.value());
//! let mut array = SpillArray::new(
//! 	pool.clone(),
//! 	temp,
//! 	Some(spill::threshold(1024 * 1024)),
//! 	None,
//! 	Some(less),
//! );
//! array.append(pool.annotate(Value::from(3)))?;
//! array.append(pool.annotate(Value::from(1)))?;
//! array.foreach(|v| {
//! 	println!("{}", v.value());
//! 	true
//! })?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate tracing;

#[macro_use]
mod mac;

pub mod cnf;
pub mod err;
pub mod mem;
pub mod spill;
pub mod str;
pub mod val;

pub use self::spill::{SpillArray, SpillMap};
pub use self::val::{AnnotatedValue, Value};
