use std::sync::Arc;

use crate::val::{Object, Value};

/// An object with a fallback parent.
///
/// Field lookups consult the scope's own fields first and the parent
/// second. Parents are typically shared between many scopes, such as the
/// outer document of a correlated subquery, so they are held behind an
/// `Arc` and never counted in a scope's size.
#[derive(Clone, Debug, Default)]
pub struct Scope {
	fields: Object,
	parent: Option<Arc<Value>>,
}

impl Scope {
	pub fn new(fields: Object, parent: Option<Arc<Value>>) -> Self {
		Self {
			fields,
			parent,
		}
	}

	/// Creates a scope value whose parent is the given shared value
	pub fn with_parent(fields: Object, parent: &Arc<Value>) -> Value {
		Value::Scope(Box::new(Scope::new(fields, Some(parent.clone()))))
	}

	pub fn fields(&self) -> &Object {
		&self.fields
	}

	pub fn fields_mut(&mut self) -> &mut Object {
		&mut self.fields
	}

	pub fn parent(&self) -> Option<&Arc<Value>> {
		self.parent.as_ref()
	}

	pub fn set_parent(&mut self, parent: Option<Arc<Value>>) -> Option<Arc<Value>> {
		std::mem::replace(&mut self.parent, parent)
	}

	pub fn take_parent(&mut self) -> Option<Arc<Value>> {
		self.parent.take()
	}

	/// Looks up a field, falling back to the parent
	pub fn field(&self, name: &str) -> Option<&Value> {
		match self.fields.get(name) {
			Some(v) => Some(v),
			None => self.parent.as_deref().and_then(|p| p.field(name)),
		}
	}

	pub(crate) fn size(&self) -> u64 {
		super::object_size(&self.fields)
	}
}
