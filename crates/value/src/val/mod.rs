use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

pub mod annotated;
pub mod number;
pub mod parsed;
pub mod pool;
pub mod scope;
pub mod spillable;

pub use self::annotated::{AnnotatedValue, Stash};
pub use self::number::Number;
pub use self::parsed::Parsed;
pub use self::pool::ValuePool;
pub use self::scope::Scope;
pub use self::spillable::Spillable;

/// The fields of an object, kept in key order.
pub type Object = BTreeMap<String, Value>;

/// The type of a JSON value, in collation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Type {
	Missing = 0,
	Null = 1,
	Boolean = 2,
	Number = 3,
	String = 4,
	Array = 5,
	Object = 6,
	Binary = 7,
}

impl Type {
	pub(crate) fn from_u8(v: u8) -> Option<Self> {
		match v {
			0 => Some(Type::Missing),
			1 => Some(Type::Null),
			2 => Some(Type::Boolean),
			3 => Some(Type::Number),
			4 => Some(Type::String),
			5 => Some(Type::Array),
			6 => Some(Type::Object),
			7 => Some(Type::Binary),
			_ => None,
		}
	}
}

impl Display for Type {
	fn fmt(&self, f: &mut Formatter) -> fmt::Result {
		f.write_str(match self {
			Type::Missing => "missing",
			Type::Null => "null",
			Type::Boolean => "boolean",
			Type::Number => "number",
			Type::String => "string",
			Type::Array => "array",
			Type::Object => "object",
			Type::Binary => "binary",
		})
	}
}

/// A JSON value as seen by the query engine.
///
/// `Missing` and `Null` are distinct: a field which is absent from a document
/// evaluates to `Missing`, while an explicit JSON `null` is `Null`.
#[derive(Clone, Debug, Default)]
pub enum Value {
	#[default]
	Missing,
	Null,
	Bool(bool),
	Number(Number),
	String(String),
	Binary(Vec<u8>),
	Array(Vec<Value>),
	Object(Object),
	/// An array produced by an operator rather than read from a document
	List(Vec<Value>),
	/// A document whose parse has been deferred
	Parsed(Parsed),
	/// An object with a fallback parent
	Scope(Box<Scope>),
}

impl Value {
	// -----------------------------------
	// Simple value detection
	// -----------------------------------

	/// Returns the type of this value, without parsing deferred documents
	pub fn kind(&self) -> Type {
		match self {
			Value::Missing => Type::Missing,
			Value::Null => Type::Null,
			Value::Bool(_) => Type::Boolean,
			Value::Number(_) => Type::Number,
			Value::String(_) => Type::String,
			Value::Binary(_) => Type::Binary,
			Value::Array(_) | Value::List(_) => Type::Array,
			Value::Object(_) | Value::Scope(_) => Type::Object,
			Value::Parsed(v) => v.kind(),
		}
	}

	pub fn is_missing(&self) -> bool {
		matches!(self, Value::Missing)
	}

	pub fn is_null(&self) -> bool {
		matches!(self, Value::Null)
	}

	// -----------------------------------
	// Field access
	// -----------------------------------

	/// Looks up a field of an object, scope or deferred document
	pub fn field(&self, name: &str) -> Option<&Value> {
		match self {
			Value::Object(v) => v.get(name),
			Value::Scope(v) => v.field(name),
			Value::Parsed(v) => v.value().field(name),
			_ => None,
		}
	}

	/// Looks up an element of an array, list or deferred document
	pub fn index(&self, index: usize) -> Option<&Value> {
		match self {
			Value::Array(v) | Value::List(v) => v.get(index),
			Value::Parsed(v) => v.value().index(index),
			_ => None,
		}
	}

	/// Returns the field value as a string, when it is one
	pub fn as_str(&self) -> Option<&str> {
		match self {
			Value::String(v) => Some(v),
			Value::Parsed(v) => v.value().as_str(),
			_ => None,
		}
	}

	/// Returns the value as a number, when it is one
	pub fn as_number(&self) -> Option<Number> {
		match self {
			Value::Number(v) => Some(*v),
			Value::Parsed(v) => v.value().as_number(),
			_ => None,
		}
	}

	// -----------------------------------
	// Sizing
	// -----------------------------------

	/// Returns a deterministic estimate of the memory held by this value.
	///
	/// Deferred documents report the size of their raw bytes, and scopes
	/// report only their own fields.
	pub fn size(&self) -> u64 {
		match self {
			Value::Missing | Value::Null => 0,
			Value::Bool(_) => 1,
			Value::Number(_) => 8,
			Value::String(v) => v.len() as u64,
			Value::Binary(v) => v.len() as u64,
			Value::Array(v) | Value::List(v) => v.iter().map(Value::size).sum(),
			Value::Object(v) => object_size(v),
			Value::Parsed(v) => v.size(),
			Value::Scope(v) => v.size(),
		}
	}

	// -----------------------------------
	// Collation
	// -----------------------------------

	/// Compares two values using N1QL collation.
	///
	/// Values of different types order by type. Numbers compare
	/// numerically across representations, arrays compare element-wise and
	/// then by length, and objects compare by length, then by their sorted
	/// keys, then by the values of those keys.
	pub fn collate(&self, other: &Value) -> Ordering {
		let (a, b) = (self.resolved(), other.resolved());
		match a.kind().cmp(&b.kind()) {
			Ordering::Equal => (),
			o => return o,
		}
		match (a, b) {
			(Value::Bool(a), Value::Bool(b)) => a.cmp(b),
			(Value::Number(a), Value::Number(b)) => a.collate(b),
			(Value::String(a), Value::String(b)) => a.cmp(b),
			(Value::Binary(a), Value::Binary(b)) => a.cmp(b),
			(Value::Array(a) | Value::List(a), Value::Array(b) | Value::List(b)) => {
				collate_elements(a, b)
			}
			(Value::Object(_) | Value::Scope(_), Value::Object(_) | Value::Scope(_)) => {
				match (a.fields(), b.fields()) {
					(Some(x), Some(y)) => collate_fields(x, y).then_with(|| {
						match (a.scope_parent(), b.scope_parent()) {
							(None, None) => Ordering::Equal,
							(None, Some(_)) => Ordering::Less,
							(Some(_), None) => Ordering::Greater,
							(Some(x), Some(y)) => x.collate(y),
						}
					}),
					_ => Ordering::Equal,
				}
			}
			_ => Ordering::Equal,
		}
	}

	fn resolved(&self) -> &Value {
		match self {
			Value::Parsed(v) => v.value(),
			v => v,
		}
	}

	fn fields(&self) -> Option<&Object> {
		match self {
			Value::Object(v) => Some(v),
			Value::Scope(v) => Some(v.fields()),
			_ => None,
		}
	}

	fn scope_parent(&self) -> Option<&Value> {
		match self {
			Value::Scope(v) => v.parent().map(|p| p.as_ref()),
			_ => None,
		}
	}

	// -----------------------------------
	// JSON interop
	// -----------------------------------

	/// Converts this value into plain JSON.
	///
	/// Missing fields are left out of objects and become `null` elsewhere.
	/// Binary values are rendered the way the query engine prints them.
	pub fn to_json(&self) -> serde_json::Value {
		use serde_json::Value as Json;
		match self {
			Value::Missing | Value::Null => Json::Null,
			Value::Bool(v) => Json::Bool(*v),
			Value::Number(Number::Int(v)) => Json::from(*v),
			Value::Number(Number::Float(v)) => {
				serde_json::Number::from_f64(*v).map(Json::Number).unwrap_or(Json::Null)
			}
			Value::String(v) => Json::String(v.clone()),
			Value::Binary(v) => Json::String(format!("<binary ({} b)>", v.len())),
			Value::Array(v) | Value::List(v) => Json::Array(v.iter().map(Value::to_json).collect()),
			Value::Object(v) => Json::Object(
				v.iter()
					.filter(|(_, v)| !v.is_missing())
					.map(|(k, v)| (k.clone(), v.to_json()))
					.collect(),
			),
			Value::Parsed(v) => v.value().to_json(),
			Value::Scope(v) => {
				let mut out = match v.parent().map(|p| p.to_json()) {
					Some(Json::Object(parent)) => parent,
					_ => serde_json::Map::new(),
				};
				for (k, v) in v.fields() {
					if !v.is_missing() {
						out.insert(k.clone(), v.to_json());
					}
				}
				Json::Object(out)
			}
		}
	}

	pub fn into_json(self) -> serde_json::Value {
		self.to_json()
	}
}

pub(crate) fn object_size(v: &Object) -> u64 {
	v.iter().map(|(k, v)| k.len() as u64 + v.size()).sum()
}

fn collate_elements(a: &[Value], b: &[Value]) -> Ordering {
	for (x, y) in a.iter().zip(b.iter()) {
		match x.collate(y) {
			Ordering::Equal => continue,
			o => return o,
		}
	}
	a.len().cmp(&b.len())
}

fn collate_fields(a: &Object, b: &Object) -> Ordering {
	match a.len().cmp(&b.len()) {
		Ordering::Equal => (),
		o => return o,
	}
	for (x, y) in a.keys().zip(b.keys()) {
		match x.cmp(y) {
			Ordering::Equal => continue,
			o => return o,
		}
	}
	for (x, y) in a.values().zip(b.values()) {
		match x.collate(y) {
			Ordering::Equal => continue,
			o => return o,
		}
	}
	Ordering::Equal
}

impl PartialEq for Value {
	fn eq(&self, other: &Self) -> bool {
		self.collate(other) == Ordering::Equal
	}
}

impl Eq for Value {}

impl PartialOrd for Value {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Value {
	fn cmp(&self, other: &Self) -> Ordering {
		self.collate(other)
	}
}

impl Display for Value {
	fn fmt(&self, f: &mut Formatter) -> fmt::Result {
		match self {
			Value::Missing => f.write_str("MISSING"),
			v => Display::fmt(&v.to_json(), f),
		}
	}
}

impl From<serde_json::Value> for Value {
	fn from(v: serde_json::Value) -> Self {
		use serde_json::Value as Json;
		match v {
			Json::Null => Value::Null,
			Json::Bool(v) => Value::Bool(v),
			Json::Number(v) => match v.as_i64() {
				Some(i) => Value::Number(Number::Int(i)),
				None => Value::Number(Number::Float(v.as_f64().unwrap_or(f64::NAN))),
			},
			Json::String(v) => Value::String(v),
			Json::Array(v) => Value::Array(v.into_iter().map(Value::from).collect()),
			Json::Object(v) => Value::Object(v.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
		}
	}
}

impl From<Value> for serde_json::Value {
	fn from(v: Value) -> Self {
		v.into_json()
	}
}

impl From<bool> for Value {
	fn from(v: bool) -> Self {
		Value::Bool(v)
	}
}

impl From<i64> for Value {
	fn from(v: i64) -> Self {
		Value::Number(Number::Int(v))
	}
}

impl From<i32> for Value {
	fn from(v: i32) -> Self {
		Value::Number(Number::from(v))
	}
}

impl From<f64> for Value {
	fn from(v: f64) -> Self {
		Value::Number(Number::Float(v))
	}
}

impl From<Number> for Value {
	fn from(v: Number) -> Self {
		Value::Number(v)
	}
}

impl From<&str> for Value {
	fn from(v: &str) -> Self {
		Value::String(v.to_owned())
	}
}

impl From<String> for Value {
	fn from(v: String) -> Self {
		Value::String(v)
	}
}

impl From<Vec<Value>> for Value {
	fn from(v: Vec<Value>) -> Self {
		Value::Array(v)
	}
}

impl From<Object> for Value {
	fn from(v: Object) -> Self {
		Value::Object(v)
	}
}

impl From<Parsed> for Value {
	fn from(v: Parsed) -> Self {
		Value::Parsed(v)
	}
}

impl From<Scope> for Value {
	fn from(v: Scope) -> Self {
		Value::Scope(Box::new(v))
	}
}

impl<T: Into<Value>> From<Option<T>> for Value {
	fn from(v: Option<T>) -> Self {
		match v {
			Some(v) => v.into(),
			None => Value::Null,
		}
	}
}

#[cfg(test)]
mod tests {
	use std::cmp::Ordering;
	use std::sync::Arc;

	use rstest::rstest;
	use serde_json::json;

	use super::*;

	fn obj(v: serde_json::Value) -> Value {
		Value::from(v)
	}

	#[rstest]
	#[case::missing_before_null(Value::Missing, Value::Null, Ordering::Less)]
	#[case::null_before_false(Value::Null, Value::from(false), Ordering::Less)]
	#[case::bool_before_number(Value::from(true), Value::from(0), Ordering::Less)]
	#[case::number_before_string(Value::from(100), Value::from(""), Ordering::Less)]
	#[case::string_before_array(Value::from("z"), obj(json!([])), Ordering::Less)]
	#[case::array_before_object(obj(json!([9])), obj(json!({})), Ordering::Less)]
	#[case::object_before_binary(obj(json!({})), Value::Binary(vec![]), Ordering::Less)]
	#[case::numbers_cross_representation(Value::from(2), Value::from(1.5), Ordering::Greater)]
	#[case::arrays_element_wise(obj(json!([1, 3])), obj(json!([1, 2, 9])), Ordering::Greater)]
	#[case::arrays_by_length(obj(json!([1, 2])), obj(json!([1, 2, 0])), Ordering::Less)]
	#[case::list_equals_array(Value::List(vec![Value::from(1)]), obj(json!([1])), Ordering::Equal)]
	#[case::objects_by_length(obj(json!({"z": 1})), obj(json!({"a": 1, "b": 1})), Ordering::Less)]
	#[case::objects_by_keys(obj(json!({"a": 9})), obj(json!({"b": 1})), Ordering::Less)]
	#[case::objects_by_values(obj(json!({"a": 1, "b": 2})), obj(json!({"a": 1, "b": 3})), Ordering::Less)]
	fn collation(#[case] a: Value, #[case] b: Value, #[case] expected: Ordering) {
		assert_eq!(a.collate(&b), expected);
		assert_eq!(b.collate(&a), expected.reverse());
	}

	#[test]
	fn parsed_collates_as_its_document() {
		let parsed = Value::Parsed(Parsed::from_json(r#"{"name":"George"}"#));
		assert_eq!(parsed, obj(json!({"name": "George"})));
		assert_eq!(parsed.kind(), Type::Object);
	}

	#[test]
	fn scope_collates_by_fields_then_parent() {
		let parent = Arc::new(obj(json!({"x": 1})));
		let fields = Object::from([("a".to_string(), Value::from(1))]);
		let bare = Value::Object(fields.clone());
		let scoped = Scope::with_parent(fields, &parent);
		assert_eq!(bare.collate(&scoped), Ordering::Less);
		assert_eq!(scoped.field("x"), Some(&Value::from(1)));
	}

	#[test]
	fn sizes_are_deterministic() {
		let v = obj(json!({"name": "Marty", "age": 17, "tags": [true, null]}));
		// name(4)+Marty(5) + age(3)+8 + tags(4)+1+0
		assert_eq!(v.size(), 25);
		assert_eq!(Value::Missing.size(), 0);
		assert_eq!(Value::Parsed(Parsed::from_json("[1,2,3]")).size(), 7);
	}

	#[test]
	fn json_interop() {
		let v = obj(json!({"a": [1, 2.5, "x"], "b": null}));
		assert_eq!(v.to_json(), json!({"a": [1, 2.5, "x"], "b": null}));
		let mut fields = Object::new();
		fields.insert("gone".to_string(), Value::Missing);
		fields.insert("kept".to_string(), Value::from(1));
		assert_eq!(Value::Object(fields).to_string(), r#"{"kept":1}"#);
		assert_eq!(Value::Missing.to_string(), "MISSING");
	}

	#[test]
	fn missing_and_null_are_distinct() {
		assert_ne!(Value::Missing, Value::Null);
		assert!(Value::Missing.is_missing());
		assert!(Value::from(None::<i64>).is_null());
	}
}
