use std::fmt;
use std::sync::OnceLock;

use crate::val::{Type, Value};

/// A placeholder for a JSON document which has not been parsed yet.
///
/// The raw bytes and the type of the top-level value are known up front,
/// so that type checks and size estimates never require a parse. The full
/// value is parsed on first access and cached from then on.
#[derive(Clone)]
pub struct Parsed {
	raw: Vec<u8>,
	kind: Type,
	parsed: OnceLock<Box<Value>>,
}

impl Parsed {
	/// Wraps raw JSON bytes whose top-level type has already been identified
	pub fn new(raw: Vec<u8>, kind: Type) -> Self {
		Self {
			raw,
			kind,
			parsed: OnceLock::new(),
		}
	}
	/// Wraps raw JSON bytes, identifying the top-level type from the first
	/// significant byte
	pub fn from_json(raw: impl Into<Vec<u8>>) -> Self {
		let raw = raw.into();
		let kind = Self::identify(&raw);
		Self::new(raw, kind)
	}
	/// The type of the top-level value, without parsing it
	pub fn kind(&self) -> Type {
		self.kind
	}
	/// The unparsed document
	pub fn raw(&self) -> &[u8] {
		&self.raw
	}
	/// Whether the document has been parsed already
	pub fn is_parsed(&self) -> bool {
		self.parsed.get().is_some()
	}
	/// The parsed document. Bytes which are not valid JSON are exposed as
	/// a binary value.
	pub fn value(&self) -> &Value {
		self.parsed.get_or_init(|| {
			let value = match serde_json::from_slice::<serde_json::Value>(&self.raw) {
				Ok(v) => Value::from(v),
				Err(e) => {
					trace!("Unable to parse document of {} bytes: {e}", self.raw.len());
					Value::Binary(self.raw.clone())
				}
			};
			Box::new(value)
		})
	}
	/// Consumes the placeholder, returning the parsed document
	pub fn into_value(self) -> Value {
		self.value();
		match self.parsed.into_inner() {
			Some(v) => *v,
			None => Value::Binary(self.raw),
		}
	}
	pub(crate) fn size(&self) -> u64 {
		self.raw.len() as u64
	}
	fn identify(raw: &[u8]) -> Type {
		match raw.iter().find(|b| !b.is_ascii_whitespace()) {
			Some(b'{') => Type::Object,
			Some(b'[') => Type::Array,
			Some(b'"') => Type::String,
			Some(b't' | b'f') => Type::Boolean,
			Some(b'n') => Type::Null,
			Some(b'-' | b'0'..=b'9') => Type::Number,
			Some(_) => Type::Binary,
			None => Type::Missing,
		}
	}
}

impl fmt::Debug for Parsed {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Parsed")
			.field("kind", &self.kind)
			.field("len", &self.raw.len())
			.field("parsed", &self.is_parsed())
			.finish()
	}
}
