//! The binary format used to persist values to spill files.
//!
//! A spill file is a flat sequence of records with no header or footer.
//! Every record starts with a single [`Tag`] byte which identifies how the
//! rest of the record is laid out:
//!
//! - fixed width integers are written big-endian;
//! - strings, byte arrays and floats are written as a 4-byte big-endian
//!   length followed by the bytes, where floats use their shortest
//!   round-trip decimal text;
//! - containers are written as a 4-byte big-endian element count followed
//!   by their elements, where a count of `-1` denotes a typed nil which is
//!   distinct from an empty container;
//! - object and map keys are written as untagged strings.
//!
//! Spill files are process-local scratch space, so the format carries no
//! version and makes no compatibility guarantees.

use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;

use crate::err::Error;
use crate::val::{AnnotatedValue, Number, Object, Parsed, Scope, Type, Value, ValuePool};

/// The length written in place of an element count for a typed nil
const NIL_LENGTH: i32 = -1;

/// The largest number of elements preallocated when reading a container
const MAX_PREALLOCATION: usize = 1024;

/// Identifies the layout of a spill record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
#[non_exhaustive]
pub enum Tag {
	// Value kinds
	Missing = 0x80,
	Null = 0x81,
	List = 0x82,
	Annotated = 0x83,
	SelfRef = 0x84,
	Scope = 0x85,
	Parsed = 0x86,
	Value = 0x87,
	Array = 0x88,
	Object = 0x89,
	// Value containers
	SliceAnnotated = 0x8a,
	SliceValue = 0x8b,
	SliceValues = 0x8c,
	SliceString = 0x8d,
	MapValue = 0x8e,
	MapValueInt = 0x8f,
	// Fundamental kinds
	Map = 0x90,
	Slice = 0x91,
	Nil = 0x92,
	Bool = 0x93,
	Bytes = 0x94,
	Int = 0x95,
	Int32 = 0x96,
	Uint32 = 0x97,
	Int64 = 0x98,
	Uint64 = 0x99,
	Float32 = 0x9a,
	Float64 = 0x9b,
	String = 0x9c,
	Json = 0x9d,
	// Narrow kinds
	Int16Map = 0x9e,
	Int16 = 0x9f,
	Uint16 = 0xa0,
	Byte = 0xa1,
}

impl Tag {
	const ALL: [Tag; 34] = [
		Tag::Missing,
		Tag::Null,
		Tag::List,
		Tag::Annotated,
		Tag::SelfRef,
		Tag::Scope,
		Tag::Parsed,
		Tag::Value,
		Tag::Array,
		Tag::Object,
		Tag::SliceAnnotated,
		Tag::SliceValue,
		Tag::SliceValues,
		Tag::SliceString,
		Tag::MapValue,
		Tag::MapValueInt,
		Tag::Map,
		Tag::Slice,
		Tag::Nil,
		Tag::Bool,
		Tag::Bytes,
		Tag::Int,
		Tag::Int32,
		Tag::Uint32,
		Tag::Int64,
		Tag::Uint64,
		Tag::Float32,
		Tag::Float64,
		Tag::String,
		Tag::Json,
		Tag::Int16Map,
		Tag::Int16,
		Tag::Uint16,
		Tag::Byte,
	];

	/// Returns an error describing this tag appearing where it does not belong
	pub(crate) fn unexpected(self, expected: &'static str) -> Error {
		Error::ValueInvalid {
			found: self as u8,
			expected,
		}
	}
}

impl TryFrom<u8> for Tag {
	type Error = Error;
	fn try_from(v: u8) -> Result<Self, Self::Error> {
		match v.checked_sub(Tag::Missing as u8) {
			Some(i) if (i as usize) < Tag::ALL.len() => Ok(Tag::ALL[i as usize]),
			_ => Err(Error::ValueInvalid {
				found: v,
				expected: "a spill record tag",
			}),
		}
	}
}

/// A type which can be written to and read back from a spill file.
pub trait Spill: Sized {
	/// Writes this value as one complete record, including its tag
	fn write_spill<W: Write>(&self, enc: &mut Encoder<W>) -> Result<(), Error>;
	/// Reads the remainder of a record whose tag has already been consumed
	fn read_spill<R: Read>(tag: Tag, dec: &mut Decoder<R>) -> Result<Self, Error>;
}

/// Writes spill records to an underlying writer.
pub struct Encoder<W: Write> {
	writer: W,
	written: u64,
}

impl<W: Write> Encoder<W> {
	pub fn new(writer: W) -> Self {
		Self {
			writer,
			written: 0,
		}
	}
	/// Writes a complete record
	pub fn encode<T: Spill>(&mut self, value: &T) -> Result<(), Error> {
		value.write_spill(self)
	}
	/// The number of bytes written so far
	pub fn written(&self) -> u64 {
		self.written
	}
	pub fn flush(&mut self) -> Result<(), Error> {
		self.writer.flush().map_err(Error::SpillWrite)
	}
	pub fn into_inner(self) -> W {
		self.writer
	}

	pub fn tag(&mut self, tag: Tag) -> Result<(), Error> {
		self.raw(&[tag as u8])
	}
	pub fn u8(&mut self, v: u8) -> Result<(), Error> {
		self.raw(&[v])
	}
	pub fn i16(&mut self, v: i16) -> Result<(), Error> {
		self.raw(&v.to_be_bytes())
	}
	pub fn u16(&mut self, v: u16) -> Result<(), Error> {
		self.raw(&v.to_be_bytes())
	}
	pub fn i32(&mut self, v: i32) -> Result<(), Error> {
		self.raw(&v.to_be_bytes())
	}
	pub fn u32(&mut self, v: u32) -> Result<(), Error> {
		self.raw(&v.to_be_bytes())
	}
	pub fn i64(&mut self, v: i64) -> Result<(), Error> {
		self.raw(&v.to_be_bytes())
	}
	pub fn u64(&mut self, v: u64) -> Result<(), Error> {
		self.raw(&v.to_be_bytes())
	}
	/// Writes an element count
	pub fn length(&mut self, len: usize) -> Result<(), Error> {
		let len = i32::try_from(len).map_err(|_| {
			Error::SpillWrite(io::Error::new(
				ErrorKind::InvalidInput,
				format!("{len} elements can not be spilled in a single record"),
			))
		})?;
		self.i32(len)
	}
	/// Writes the element count of a typed nil
	pub fn nil_length(&mut self) -> Result<(), Error> {
		self.i32(NIL_LENGTH)
	}
	/// Writes length-prefixed bytes
	pub fn bytes(&mut self, v: &[u8]) -> Result<(), Error> {
		self.length(v.len())?;
		self.raw(v)
	}
	/// Writes a length-prefixed UTF-8 string
	pub fn str(&mut self, v: &str) -> Result<(), Error> {
		self.bytes(v.as_bytes())
	}
	/// Writes a float as its shortest round-trip decimal text
	pub fn f64(&mut self, v: f64) -> Result<(), Error> {
		self.str(&format!("{v:e}"))
	}
	/// Writes a float as its shortest round-trip decimal text
	pub fn f32(&mut self, v: f32) -> Result<(), Error> {
		self.str(&format!("{v:e}"))
	}

	fn raw(&mut self, v: &[u8]) -> Result<(), Error> {
		self.writer.write_all(v).map_err(Error::SpillWrite)?;
		self.written += v.len() as u64;
		Ok(())
	}
}

/// Reads spill records from an underlying reader.
pub struct Decoder<R: Read> {
	reader: R,
	pool: Option<Arc<ValuePool>>,
}

impl<R: Read> Decoder<R> {
	/// Creates a decoder. Decoded annotated values are drawn from the pool
	/// when one is given.
	pub fn new(reader: R, pool: Option<Arc<ValuePool>>) -> Self {
		Self {
			reader,
			pool,
		}
	}
	/// Reads the next record, or `None` if the reader is exhausted at a
	/// record boundary
	pub fn next<T: Spill>(&mut self) -> Result<Option<T>, Error> {
		match self.tag_or_eof()? {
			Some(tag) => T::read_spill(tag, self).map(Some),
			None => Ok(None),
		}
	}
	/// Reads the next record, which must be present
	pub fn decode<T: Spill>(&mut self) -> Result<T, Error> {
		let tag = self.tag()?;
		T::read_spill(tag, self)
	}
	pub fn into_inner(self) -> R {
		self.reader
	}

	pub fn tag(&mut self) -> Result<Tag, Error> {
		Tag::try_from(self.u8()?)
	}
	pub fn u8(&mut self) -> Result<u8, Error> {
		Ok(self.array::<1>()?[0])
	}
	pub fn i16(&mut self) -> Result<i16, Error> {
		Ok(i16::from_be_bytes(self.array()?))
	}
	pub fn u16(&mut self) -> Result<u16, Error> {
		Ok(u16::from_be_bytes(self.array()?))
	}
	pub fn i32(&mut self) -> Result<i32, Error> {
		Ok(i32::from_be_bytes(self.array()?))
	}
	pub fn u32(&mut self) -> Result<u32, Error> {
		Ok(u32::from_be_bytes(self.array()?))
	}
	pub fn i64(&mut self) -> Result<i64, Error> {
		Ok(i64::from_be_bytes(self.array()?))
	}
	pub fn u64(&mut self) -> Result<u64, Error> {
		Ok(u64::from_be_bytes(self.array()?))
	}
	/// Reads an element count, or `None` for a typed nil
	pub fn length(&mut self) -> Result<Option<usize>, Error> {
		match self.i32()? {
			NIL_LENGTH => Ok(None),
			v if v < 0 => Err(Error::reconstruct(format!("invalid element count {v}"))),
			v => Ok(Some(v as usize)),
		}
	}
	/// Reads length-prefixed bytes, or `None` for a typed nil
	pub fn bytes(&mut self) -> Result<Option<Vec<u8>>, Error> {
		match self.length()? {
			Some(len) => {
				let mut buf = Vec::with_capacity(len.min(MAX_PREALLOCATION * 64));
				let read = (&mut self.reader)
					.take(len as u64)
					.read_to_end(&mut buf)
					.map_err(Error::SpillRead)?;
				if read != len {
					return Err(Error::SpillRead(ErrorKind::UnexpectedEof.into()));
				}
				Ok(Some(buf))
			}
			None => Ok(None),
		}
	}
	/// Reads a length-prefixed UTF-8 string
	pub fn string(&mut self) -> Result<String, Error> {
		match self.bytes()? {
			Some(v) => String::from_utf8(v).map_err(Error::reconstruct),
			None => Err(Error::reconstruct("unexpected nil string")),
		}
	}
	pub fn f64(&mut self) -> Result<f64, Error> {
		let text = self.string()?;
		text.parse().map_err(|_| Error::reconstruct(format!("invalid float text {text:?}")))
	}
	pub fn f32(&mut self) -> Result<f32, Error> {
		let text = self.string()?;
		text.parse().map_err(|_| Error::reconstruct(format!("invalid float text {text:?}")))
	}
	/// Wraps a decoded value, drawing from the pool when there is one
	pub(crate) fn annotate(&self, value: Value) -> AnnotatedValue {
		match &self.pool {
			Some(pool) => pool.annotate(value),
			None => AnnotatedValue::new(value),
		}
	}

	fn tag_or_eof(&mut self) -> Result<Option<Tag>, Error> {
		let mut buf = [0u8; 1];
		loop {
			match self.reader.read(&mut buf) {
				Ok(0) => return Ok(None),
				Ok(_) => return Tag::try_from(buf[0]).map(Some),
				Err(e) if e.kind() == ErrorKind::Interrupted => continue,
				Err(e) => return Err(Error::SpillRead(e)),
			}
		}
	}

	fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
		let mut buf = [0u8; N];
		self.reader.read_exact(&mut buf).map_err(Error::SpillRead)?;
		Ok(buf)
	}
}

/// The capacity to reserve for a decoded container of the given length
pub(crate) fn capacity(len: usize) -> usize {
	len.min(MAX_PREALLOCATION)
}

/// Encodes a single record into a new buffer
pub fn encode_to_vec<T: Spill>(value: &T) -> Result<Vec<u8>, Error> {
	let mut enc = Encoder::new(Vec::new());
	enc.encode(value)?;
	Ok(enc.into_inner())
}

/// Decodes a single record from a buffer
pub fn decode_from_slice<T: Spill>(bytes: &[u8], pool: Option<Arc<ValuePool>>) -> Result<T, Error> {
	Decoder::new(bytes, pool).decode()
}

// -----------------------------------
// Strings
// -----------------------------------

impl Spill for String {
	fn write_spill<W: Write>(&self, enc: &mut Encoder<W>) -> Result<(), Error> {
		enc.tag(Tag::String)?;
		enc.str(self)
	}
	fn read_spill<R: Read>(tag: Tag, dec: &mut Decoder<R>) -> Result<Self, Error> {
		match tag {
			Tag::String => dec.string(),
			tag => Err(tag.unexpected("a string")),
		}
	}
}

// -----------------------------------
// Values
// -----------------------------------

impl Spill for Value {
	fn write_spill<W: Write>(&self, enc: &mut Encoder<W>) -> Result<(), Error> {
		match self {
			Value::Missing => enc.tag(Tag::Missing),
			Value::Null => enc.tag(Tag::Null),
			Value::Bool(v) => {
				enc.tag(Tag::Value)?;
				enc.tag(Tag::Bool)?;
				enc.u8(*v as u8)
			}
			Value::Number(Number::Int(v)) => {
				enc.tag(Tag::Value)?;
				enc.tag(Tag::Int64)?;
				enc.i64(*v)
			}
			Value::Number(Number::Float(v)) => {
				enc.tag(Tag::Value)?;
				enc.tag(Tag::Float64)?;
				enc.f64(*v)
			}
			Value::String(v) => {
				enc.tag(Tag::Value)?;
				enc.tag(Tag::String)?;
				enc.str(v)
			}
			Value::Binary(v) => {
				enc.tag(Tag::Value)?;
				enc.tag(Tag::Bytes)?;
				enc.bytes(v)
			}
			Value::Array(v) => {
				enc.tag(Tag::Array)?;
				write_elements(enc, v)
			}
			Value::List(v) => {
				enc.tag(Tag::List)?;
				write_elements(enc, v)
			}
			Value::Object(v) => {
				enc.tag(Tag::Object)?;
				write_fields(enc, v)
			}
			Value::Parsed(v) => {
				enc.tag(Tag::Parsed)?;
				enc.u8(v.kind() as u8)?;
				enc.bytes(v.raw())
			}
			Value::Scope(v) => {
				enc.tag(Tag::Scope)?;
				write_fields(enc, v.fields())?;
				match v.parent() {
					Some(parent) => parent.write_spill(enc),
					None => enc.tag(Tag::Nil),
				}
			}
		}
	}

	fn read_spill<R: Read>(tag: Tag, dec: &mut Decoder<R>) -> Result<Self, Error> {
		match tag {
			Tag::Missing => Ok(Value::Missing),
			Tag::Null => Ok(Value::Null),
			Tag::Value => match dec.tag()? {
				Tag::Bool => Ok(Value::Bool(dec.u8()? != 0)),
				Tag::Int64 => Ok(Value::Number(Number::Int(dec.i64()?))),
				Tag::Float64 => Ok(Value::Number(Number::Float(dec.f64()?))),
				Tag::String => Ok(Value::String(dec.string()?)),
				Tag::Bytes => match dec.bytes()? {
					Some(v) => Ok(Value::Binary(v)),
					None => Err(Error::reconstruct("unexpected nil binary value")),
				},
				tag => Err(tag.unexpected("a scalar value")),
			},
			Tag::Array => Ok(Value::Array(read_elements(dec)?)),
			Tag::List => Ok(Value::List(read_elements(dec)?)),
			Tag::Object => Ok(Value::Object(read_fields(dec)?)),
			Tag::Parsed => {
				let code = dec.u8()?;
				let kind = Type::from_u8(code)
					.ok_or_else(|| Error::reconstruct(format!("invalid type code {code}")))?;
				match dec.bytes()? {
					Some(raw) => Ok(Value::Parsed(Parsed::new(raw, kind))),
					None => Err(Error::reconstruct("unexpected nil document")),
				}
			}
			Tag::Scope => {
				let fields = read_fields(dec)?;
				let parent = match dec.tag()? {
					Tag::Nil => None,
					tag => Some(Arc::new(Value::read_spill(tag, dec)?)),
				};
				Ok(Value::Scope(Box::new(Scope::new(fields, parent))))
			}
			tag => Err(tag.unexpected("a value")),
		}
	}
}

pub(crate) fn write_elements<W: Write>(enc: &mut Encoder<W>, v: &[Value]) -> Result<(), Error> {
	enc.length(v.len())?;
	for v in v {
		v.write_spill(enc)?;
	}
	Ok(())
}

pub(crate) fn write_fields<W: Write>(enc: &mut Encoder<W>, v: &Object) -> Result<(), Error> {
	enc.length(v.len())?;
	for (k, v) in v {
		enc.str(k)?;
		v.write_spill(enc)?;
	}
	Ok(())
}

fn read_elements<R: Read>(dec: &mut Decoder<R>) -> Result<Vec<Value>, Error> {
	match dec.length()? {
		Some(len) => {
			let mut out = Vec::with_capacity(capacity(len));
			for _ in 0..len {
				out.push(dec.decode()?);
			}
			Ok(out)
		}
		None => Err(Error::reconstruct("unexpected nil array")),
	}
}

pub(crate) fn read_fields<R: Read>(dec: &mut Decoder<R>) -> Result<Object, Error> {
	match dec.length()? {
		Some(len) => {
			let mut out = Object::new();
			for _ in 0..len {
				let key = dec.string()?;
				out.insert(key, dec.decode()?);
			}
			Ok(out)
		}
		None => Err(Error::reconstruct("unexpected nil object")),
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use rstest::rstest;
	use serde_json::json;

	use super::*;

	fn round_trip(v: &Value) -> Value {
		let bytes = encode_to_vec(v).unwrap();
		decode_from_slice(&bytes, None).unwrap()
	}

	#[test]
	fn every_tag_is_recognised() {
		for tag in Tag::ALL {
			assert_eq!(Tag::try_from(tag as u8).unwrap(), tag);
		}
		assert!(matches!(
			Tag::try_from(0x7f),
			Err(Error::ValueInvalid {
				found: 0x7f,
				..
			})
		));
		assert!(Tag::try_from(0xa2).is_err());
	}

	#[rstest]
	#[case::missing(Value::Missing)]
	#[case::null(Value::Null)]
	#[case::boolean(Value::from(true))]
	#[case::int(Value::from(i64::MIN))]
	#[case::float(Value::from(0.1 + 0.2))]
	#[case::infinity(Value::from(f64::NEG_INFINITY))]
	#[case::string(Value::from("Hill Valley 🕰"))]
	#[case::binary(Value::Binary(vec![0, 0x80, 0xff]))]
	#[case::document(Value::from(json!({"a": [1, {"b": null}], "c": 1.5e300})))]
	#[case::list(Value::List(vec![Value::Missing, Value::Null]))]
	#[case::parsed(Value::Parsed(Parsed::from_json(r#"{"x":[1,2]}"#)))]
	fn values_survive_spilling(#[case] value: Value) {
		let decoded = round_trip(&value);
		assert_eq!(decoded, value);
		assert_eq!(decoded.size(), value.size());
		assert_eq!(decoded.kind(), value.kind());
	}

	#[test]
	fn representations_are_preserved() {
		assert!(matches!(round_trip(&Value::from(3)), Value::Number(Number::Int(3))));
		assert!(matches!(round_trip(&Value::from(3.0)), Value::Number(Number::Float(_))));
		assert!(matches!(round_trip(&Value::List(vec![])), Value::List(_)));
		assert!(matches!(round_trip(&Value::Missing), Value::Missing));
		assert!(matches!(round_trip(&Value::Null), Value::Null));
		match round_trip(&Value::from(f64::NAN)) {
			Value::Number(Number::Float(v)) => assert!(v.is_nan()),
			v => panic!("unexpected {v:?}"),
		}
	}

	#[test]
	fn parsed_documents_stay_unparsed() {
		let value = Value::Parsed(Parsed::from_json("[true]"));
		match round_trip(&value) {
			Value::Parsed(p) => {
				assert!(!p.is_parsed());
				assert_eq!(p.kind(), Type::Array);
				assert_eq!(p.raw(), b"[true]");
			}
			v => panic!("unexpected {v:?}"),
		}
	}

	#[test]
	fn scopes_keep_their_parent() {
		let parent = Arc::new(Value::from(json!({"outer": 1})));
		let scope = Scope::with_parent(Object::from([("inner".into(), Value::from(2))]), &parent);
		let decoded = round_trip(&scope);
		assert_eq!(decoded.field("inner"), Some(&Value::from(2)));
		assert_eq!(decoded.field("outer"), Some(&Value::from(1)));
		assert_eq!(decoded.size(), scope.size());
	}

	#[test]
	fn floats_are_written_as_text() {
		let bytes = encode_to_vec(&Value::from(1.5)).unwrap();
		assert_eq!(bytes[..2], [Tag::Value as u8, Tag::Float64 as u8]);
		assert_eq!(bytes[2..6], 5i32.to_be_bytes());
		assert_eq!(&bytes[6..], b"1.5e0");
	}

	#[test]
	fn end_of_file_only_at_record_boundaries() {
		let mut bytes = encode_to_vec(&Value::from("Doc")).unwrap();
		bytes.extend(encode_to_vec(&Value::from(88)).unwrap());
		let mut dec = Decoder::new(&bytes[..], None);
		assert_eq!(dec.next::<Value>().unwrap(), Some(Value::from("Doc")));
		assert_eq!(dec.next::<Value>().unwrap(), Some(Value::from(88)));
		assert_eq!(dec.next::<Value>().unwrap(), None);
		// A truncated record is a read failure
		let truncated = &bytes[..bytes.len() - 3];
		let mut dec = Decoder::new(truncated, None);
		dec.next::<Value>().unwrap();
		assert!(matches!(dec.next::<Value>(), Err(Error::SpillRead(_))));
	}

	#[test]
	fn mismatched_tags_are_invalid() {
		let bytes = encode_to_vec(&Value::from(1)).unwrap();
		assert!(matches!(
			decode_from_slice::<String>(&bytes, None),
			Err(Error::ValueInvalid {
				expected: "a string",
				..
			})
		));
		assert!(matches!(
			decode_from_slice::<Value>(&[Tag::Nil as u8], None),
			Err(Error::ValueInvalid {
				expected: "a value",
				..
			})
		));
	}

	#[test]
	fn malformed_payloads_fail_reconstruction() {
		let mut bytes = vec![Tag::Value as u8, Tag::Float64 as u8];
		bytes.extend(3i32.to_be_bytes());
		bytes.extend(b"one");
		assert!(matches!(
			decode_from_slice::<Value>(&bytes, None),
			Err(Error::ValueReconstruct(_))
		));
	}
}
