use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::err::Error;
use crate::spill::codec::{self, Decoder, Encoder, Spill, Tag};
use crate::val::{AnnotatedValue, Value};

/// A map of named side-channel data, as used for attachments and metadata.
pub type Attachments = BTreeMap<String, Spillable>;

/// Anything which may be persisted to a spill file.
///
/// This is a closed set: every kind has its own record tag, and anything
/// else is carried as JSON. Containers wrap an `Option` so that a nil
/// container survives spilling distinctly from an empty one.
#[derive(Clone, Debug)]
pub enum Spillable {
	Nil,
	Bool(bool),
	Byte(u8),
	Bytes(Option<Vec<u8>>),
	/// A platform integer
	Int(i64),
	Int16(i16),
	Uint16(u16),
	Int32(i32),
	Uint32(u32),
	Int64(i64),
	Uint64(u64),
	Float32(f32),
	Float64(f64),
	String(String),
	Value(Value),
	Annotated(AnnotatedValue),
	/// A reference from an annotated value to itself
	SelfRef,
	Slice(Option<Vec<Spillable>>),
	Map(Option<Attachments>),
	Strings(Option<Vec<String>>),
	/// A slice of values, as produced by an operator
	ValueSlice(Option<Vec<Value>>),
	/// A slice of values, as held by a document
	Values(Option<Vec<Value>>),
	AnnotatedValues(Option<Vec<AnnotatedValue>>),
	ValueMap(Option<BTreeMap<String, Value>>),
	IntValueMap(Option<BTreeMap<i64, Value>>),
	Int16Map(Option<BTreeMap<i16, Spillable>>),
	/// Anything else, carried as JSON
	Json(serde_json::Value),
}

impl Spillable {
	/// Carries any serializable type through a spill file as JSON
	pub fn json<T: Serialize>(v: &T) -> Result<Self, Error> {
		serde_json::to_value(v).map(Spillable::Json).map_err(Error::reconstruct)
	}
	/// Recovers a type which was carried as JSON
	pub fn to_type<T: DeserializeOwned>(&self) -> Result<T, Error> {
		match self {
			Spillable::Json(v) => serde_json::from_value(v.clone()).map_err(Error::reconstruct),
			_ => Err(Error::reconstruct("the spilled data was not carried as JSON")),
		}
	}
	pub fn as_str(&self) -> Option<&str> {
		match self {
			Spillable::String(v) => Some(v),
			_ => None,
		}
	}
	pub fn as_value(&self) -> Option<&Value> {
		match self {
			Spillable::Value(v) => Some(v),
			_ => None,
		}
	}
	pub fn as_annotated(&self) -> Option<&AnnotatedValue> {
		match self {
			Spillable::Annotated(v) => Some(v),
			_ => None,
		}
	}
	pub fn is_nil(&self) -> bool {
		matches!(self, Spillable::Nil)
	}
}

impl PartialEq for Spillable {
	fn eq(&self, other: &Self) -> bool {
		use Spillable::*;
		match (self, other) {
			(Nil, Nil) | (SelfRef, SelfRef) => true,
			(Bool(a), Bool(b)) => a == b,
			(Byte(a), Byte(b)) => a == b,
			(Int16(a), Int16(b)) => a == b,
			(Uint16(a), Uint16(b)) => a == b,
			(Bytes(a), Bytes(b)) => a == b,
			(Int(a), Int(b)) | (Int64(a), Int64(b)) => a == b,
			(Int32(a), Int32(b)) => a == b,
			(Uint32(a), Uint32(b)) => a == b,
			(Uint64(a), Uint64(b)) => a == b,
			(Float32(a), Float32(b)) => a.to_bits() == b.to_bits(),
			(Float64(a), Float64(b)) => a.to_bits() == b.to_bits(),
			(String(a), String(b)) => a == b,
			(Value(a), Value(b)) => a == b,
			(Annotated(a), Annotated(b)) => a.ptr_eq(b) || *a.value() == *b.value(),
			(Slice(a), Slice(b)) => a == b,
			(Map(a), Map(b)) => a == b,
			(Strings(a), Strings(b)) => a == b,
			(ValueSlice(a), ValueSlice(b)) | (Values(a), Values(b)) => a == b,
			(AnnotatedValues(Some(a)), AnnotatedValues(Some(b))) => {
				a.len() == b.len()
					&& a.iter().zip(b.iter()).all(|(a, b)| a.ptr_eq(b) || *a.value() == *b.value())
			}
			(AnnotatedValues(None), AnnotatedValues(None)) => true,
			(ValueMap(a), ValueMap(b)) => a == b,
			(IntValueMap(a), IntValueMap(b)) => a == b,
			(Int16Map(a), Int16Map(b)) => a == b,
			(Json(a), Json(b)) => a == b,
			_ => false,
		}
	}
}

macro_rules! impl_from {
	($($t:ty => $variant:ident),* $(,)?) => {
		$(
			impl From<$t> for Spillable {
				fn from(v: $t) -> Self {
					Spillable::$variant(v)
				}
			}
		)*
	};
}

impl_from! {
	bool => Bool,
	u8 => Byte,
	i16 => Int16,
	u16 => Uint16,
	i32 => Int32,
	u32 => Uint32,
	i64 => Int64,
	u64 => Uint64,
	f32 => Float32,
	f64 => Float64,
	String => String,
	Value => Value,
	AnnotatedValue => Annotated,
	serde_json::Value => Json,
}

impl From<&str> for Spillable {
	fn from(v: &str) -> Self {
		Spillable::String(v.to_owned())
	}
}

impl From<Vec<u8>> for Spillable {
	fn from(v: Vec<u8>) -> Self {
		Spillable::Bytes(Some(v))
	}
}

impl From<Vec<String>> for Spillable {
	fn from(v: Vec<String>) -> Self {
		Spillable::Strings(Some(v))
	}
}

impl From<Vec<AnnotatedValue>> for Spillable {
	fn from(v: Vec<AnnotatedValue>) -> Self {
		Spillable::AnnotatedValues(Some(v))
	}
}

impl From<Attachments> for Spillable {
	fn from(v: Attachments) -> Self {
		Spillable::Map(Some(v))
	}
}

// -----------------------------------
// Spilling
// -----------------------------------

/// Writes an element count, or the typed nil marker
fn length<W: Write, T>(enc: &mut Encoder<W>, v: &Option<T>, len: impl Fn(&T) -> usize) -> Result<(), Error> {
	match v {
		Some(v) => enc.length(len(v)),
		None => enc.nil_length(),
	}
}

/// Reads `len` elements with `f`, keeping a typed nil as `None`
fn elements<R: Read, T>(
	dec: &mut Decoder<R>,
	mut f: impl FnMut(&mut Decoder<R>) -> Result<T, Error>,
) -> Result<Option<Vec<T>>, Error> {
	match dec.length()? {
		Some(len) => {
			let mut out = Vec::with_capacity(codec::capacity(len));
			for _ in 0..len {
				out.push(f(dec)?);
			}
			Ok(Some(out))
		}
		None => Ok(None),
	}
}

/// Writes a map of attachments as a generic map record
pub(crate) fn write_map<W: Write>(enc: &mut Encoder<W>, v: &Attachments) -> Result<(), Error> {
	enc.tag(Tag::Map)?;
	enc.length(v.len())?;
	for (k, v) in v {
		enc.str(k)?;
		v.write_spill(enc)?;
	}
	Ok(())
}

fn read_map<R: Read>(dec: &mut Decoder<R>) -> Result<Option<Attachments>, Error> {
	match dec.length()? {
		Some(len) => {
			let mut out = Attachments::new();
			for _ in 0..len {
				let key = dec.string()?;
				out.insert(key, dec.decode()?);
			}
			Ok(Some(out))
		}
		None => Ok(None),
	}
}

/// Reads a record which must be a generic map or a nil
pub(crate) fn read_optional_map<R: Read>(dec: &mut Decoder<R>) -> Result<Option<Attachments>, Error> {
	match dec.tag()? {
		Tag::Nil => Ok(None),
		Tag::Map => read_map(dec),
		tag => Err(tag.unexpected("a map or nil")),
	}
}

impl Spill for Spillable {
	fn write_spill<W: Write>(&self, enc: &mut Encoder<W>) -> Result<(), Error> {
		match self {
			Spillable::Nil => enc.tag(Tag::Nil),
			Spillable::Bool(v) => {
				enc.tag(Tag::Bool)?;
				enc.u8(*v as u8)
			}
			Spillable::Byte(v) => {
				enc.tag(Tag::Byte)?;
				enc.u8(*v)
			}
			Spillable::Int16(v) => {
				enc.tag(Tag::Int16)?;
				enc.i16(*v)
			}
			Spillable::Uint16(v) => {
				enc.tag(Tag::Uint16)?;
				enc.u16(*v)
			}
			Spillable::Bytes(v) => {
				enc.tag(Tag::Bytes)?;
				match v {
					Some(v) => enc.bytes(v),
					None => enc.nil_length(),
				}
			}
			Spillable::Int(v) => {
				enc.tag(Tag::Int)?;
				enc.i64(*v)
			}
			Spillable::Int32(v) => {
				enc.tag(Tag::Int32)?;
				enc.i32(*v)
			}
			Spillable::Uint32(v) => {
				enc.tag(Tag::Uint32)?;
				enc.u32(*v)
			}
			Spillable::Int64(v) => {
				enc.tag(Tag::Int64)?;
				enc.i64(*v)
			}
			Spillable::Uint64(v) => {
				enc.tag(Tag::Uint64)?;
				enc.u64(*v)
			}
			Spillable::Float32(v) => {
				enc.tag(Tag::Float32)?;
				enc.f32(*v)
			}
			Spillable::Float64(v) => {
				enc.tag(Tag::Float64)?;
				enc.f64(*v)
			}
			Spillable::String(v) => v.write_spill(enc),
			Spillable::Value(v) => v.write_spill(enc),
			Spillable::Annotated(v) => v.write_spill(enc),
			Spillable::SelfRef => enc.tag(Tag::SelfRef),
			Spillable::Slice(v) => {
				enc.tag(Tag::Slice)?;
				length(enc, v, Vec::len)?;
				for v in v.iter().flatten() {
					v.write_spill(enc)?;
				}
				Ok(())
			}
			Spillable::Map(Some(v)) => write_map(enc, v),
			Spillable::Map(None) => {
				enc.tag(Tag::Map)?;
				enc.nil_length()
			}
			Spillable::Strings(v) => {
				enc.tag(Tag::SliceString)?;
				length(enc, v, Vec::len)?;
				for v in v.iter().flatten() {
					enc.str(v)?;
				}
				Ok(())
			}
			Spillable::ValueSlice(v) | Spillable::Values(v) => {
				enc.tag(match self {
					Spillable::ValueSlice(_) => Tag::SliceValue,
					_ => Tag::SliceValues,
				})?;
				length(enc, v, Vec::len)?;
				for v in v.iter().flatten() {
					v.write_spill(enc)?;
				}
				Ok(())
			}
			Spillable::AnnotatedValues(v) => {
				enc.tag(Tag::SliceAnnotated)?;
				length(enc, v, Vec::len)?;
				for v in v.iter().flatten() {
					v.write_spill(enc)?;
				}
				Ok(())
			}
			Spillable::ValueMap(v) => {
				enc.tag(Tag::MapValue)?;
				length(enc, v, BTreeMap::len)?;
				for (k, v) in v.iter().flatten() {
					enc.str(k)?;
					v.write_spill(enc)?;
				}
				Ok(())
			}
			Spillable::IntValueMap(v) => {
				enc.tag(Tag::MapValueInt)?;
				length(enc, v, BTreeMap::len)?;
				for (k, v) in v.iter().flatten() {
					enc.i64(*k)?;
					v.write_spill(enc)?;
				}
				Ok(())
			}
			Spillable::Int16Map(v) => {
				enc.tag(Tag::Int16Map)?;
				length(enc, v, BTreeMap::len)?;
				for (k, v) in v.iter().flatten() {
					enc.i16(*k)?;
					v.write_spill(enc)?;
				}
				Ok(())
			}
			Spillable::Json(v) => {
				let bytes = serde_json::to_vec(v).map_err(Error::reconstruct)?;
				enc.tag(Tag::Json)?;
				enc.bytes(&bytes)
			}
		}
	}

	fn read_spill<R: Read>(tag: Tag, dec: &mut Decoder<R>) -> Result<Self, Error> {
		match tag {
			Tag::Nil => Ok(Spillable::Nil),
			Tag::Bool => Ok(Spillable::Bool(dec.u8()? != 0)),
			Tag::Byte => Ok(Spillable::Byte(dec.u8()?)),
			Tag::Int16 => Ok(Spillable::Int16(dec.i16()?)),
			Tag::Uint16 => Ok(Spillable::Uint16(dec.u16()?)),
			Tag::Bytes => Ok(Spillable::Bytes(dec.bytes()?)),
			Tag::Int => Ok(Spillable::Int(dec.i64()?)),
			Tag::Int32 => Ok(Spillable::Int32(dec.i32()?)),
			Tag::Uint32 => Ok(Spillable::Uint32(dec.u32()?)),
			Tag::Int64 => Ok(Spillable::Int64(dec.i64()?)),
			Tag::Uint64 => Ok(Spillable::Uint64(dec.u64()?)),
			Tag::Float32 => Ok(Spillable::Float32(dec.f32()?)),
			Tag::Float64 => Ok(Spillable::Float64(dec.f64()?)),
			Tag::String => Ok(Spillable::String(dec.string()?)),
			Tag::Annotated => Ok(Spillable::Annotated(AnnotatedValue::read_spill(tag, dec)?)),
			Tag::SelfRef => Ok(Spillable::SelfRef),
			Tag::Missing
			| Tag::Null
			| Tag::List
			| Tag::Scope
			| Tag::Parsed
			| Tag::Value
			| Tag::Array
			| Tag::Object => Ok(Spillable::Value(Value::read_spill(tag, dec)?)),
			Tag::Slice => Ok(Spillable::Slice(elements(dec, |d| d.decode())?)),
			Tag::Map => Ok(Spillable::Map(read_map(dec)?)),
			Tag::SliceString => Ok(Spillable::Strings(elements(dec, |d| d.string())?)),
			Tag::SliceValue => Ok(Spillable::ValueSlice(elements(dec, |d| d.decode())?)),
			Tag::SliceValues => Ok(Spillable::Values(elements(dec, |d| d.decode())?)),
			Tag::SliceAnnotated => Ok(Spillable::AnnotatedValues(elements(dec, |d| d.decode())?)),
			Tag::MapValue => match dec.length()? {
				Some(len) => {
					let mut out = BTreeMap::new();
					for _ in 0..len {
						let key = dec.string()?;
						out.insert(key, dec.decode()?);
					}
					Ok(Spillable::ValueMap(Some(out)))
				}
				None => Ok(Spillable::ValueMap(None)),
			},
			Tag::MapValueInt => match dec.length()? {
				Some(len) => {
					let mut out = BTreeMap::new();
					for _ in 0..len {
						let key = dec.i64()?;
						out.insert(key, dec.decode()?);
					}
					Ok(Spillable::IntValueMap(Some(out)))
				}
				None => Ok(Spillable::IntValueMap(None)),
			},
			Tag::Int16Map => match dec.length()? {
				Some(len) => {
					let mut out = BTreeMap::new();
					for _ in 0..len {
						let key = dec.i16()?;
						out.insert(key, dec.decode()?);
					}
					Ok(Spillable::Int16Map(Some(out)))
				}
				None => Ok(Spillable::Int16Map(None)),
			},
			Tag::Json => match dec.bytes()? {
				Some(v) => serde_json::from_slice(&v).map(Spillable::Json).map_err(Error::reconstruct),
				None => Err(Error::reconstruct("unexpected nil JSON document")),
			},
		}
	}
}
