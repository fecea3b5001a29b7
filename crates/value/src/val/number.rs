use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};

/// A JSON number, kept as an integer whenever the source text allowed it.
#[derive(Clone, Copy, Debug)]
pub enum Number {
	Int(i64),
	Float(f64),
}

impl Default for Number {
	fn default() -> Self {
		Self::Int(0)
	}
}

impl From<i64> for Number {
	fn from(v: i64) -> Self {
		Self::Int(v)
	}
}

impl From<i32> for Number {
	fn from(v: i32) -> Self {
		Self::Int(v as i64)
	}
}

impl From<u32> for Number {
	fn from(v: u32) -> Self {
		Self::Int(v as i64)
	}
}

impl From<f64> for Number {
	fn from(v: f64) -> Self {
		Self::Float(v)
	}
}

impl From<f32> for Number {
	fn from(v: f32) -> Self {
		Self::Float(v as f64)
	}
}

impl Number {
	/// Returns this number as a floating point value
	pub fn to_float(self) -> f64 {
		match self {
			Number::Int(v) => v as f64,
			Number::Float(v) => v,
		}
	}
	/// Returns this number as an integer, if it is integral and in range
	pub fn to_int(self) -> Option<i64> {
		match self {
			Number::Int(v) => Some(v),
			Number::Float(v) if v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64 => {
				Some(v as i64)
			}
			Number::Float(_) => None,
		}
	}
	pub fn is_int(&self) -> bool {
		matches!(self, Number::Int(_))
	}
	pub fn is_nan(&self) -> bool {
		matches!(self, Number::Float(v) if v.is_nan())
	}
	/// Compares two numbers numerically, regardless of representation.
	///
	/// NaN sorts after every other number and equal to itself, so that this
	/// is a total order suitable for sorting.
	pub fn collate(&self, other: &Self) -> Ordering {
		match (self, other) {
			(Number::Int(a), Number::Int(b)) => a.cmp(b),
			(a, b) => {
				let (a, b) = (a.to_float(), b.to_float());
				match a.partial_cmp(&b) {
					Some(o) => o,
					None => a.is_nan().cmp(&b.is_nan()),
				}
			}
		}
	}
}

impl PartialEq for Number {
	fn eq(&self, other: &Self) -> bool {
		self.collate(other) == Ordering::Equal
	}
}

impl Eq for Number {}

impl PartialOrd for Number {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Number {
	fn cmp(&self, other: &Self) -> Ordering {
		self.collate(other)
	}
}

impl Display for Number {
	fn fmt(&self, f: &mut Formatter) -> fmt::Result {
		match self {
			Number::Int(v) => Display::fmt(v, f),
			Number::Float(v) => Display::fmt(v, f),
		}
	}
}
