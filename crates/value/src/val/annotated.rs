use std::fmt;
use std::io::{Read, Write};
use std::mem;
use std::sync::{Arc, Weak};

use parking_lot::{
	MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use crate::err::Error;
use crate::spill::codec::{self, Decoder, Encoder, Spill, Tag};
use crate::val::spillable::{self, Attachments};
use crate::val::{Object, Spillable, Value, ValuePool};

/// The flag bit persisting whether an annotated value is its own projection
const FLAG_SELF: u8 = 0x01;

/// A JSON value decorated with query metadata.
///
/// An annotated value is a counted handle: cloning it (or calling
/// [`AnnotatedValue::track`]) adds a holder, and dropping it (or calling
/// [`AnnotatedValue::recycle`]) removes one. When the last holder goes away
/// the wrapped value is released and the body returns to the
/// [`ValuePool`] it was drawn from. Releasing a holder consumes the handle,
/// so a value can never be recycled twice.
///
/// Attachments, metadata and covers may be shared between values with
/// [`AnnotatedValue::share_annotations`], in which case they are copied
/// lazily on the first write, or copied up front with
/// [`AnnotatedValue::copy_annotations`].
pub struct AnnotatedValue {
	inner: Arc<Shared>,
}

pub(crate) struct Shared {
	body: RwLock<Annotated>,
	pool: Weak<ValuePool>,
	no_recycle: bool,
}

#[derive(Default)]
pub(crate) struct Annotated {
	value: Value,
	attachments: Option<Arc<Attachments>>,
	meta: Option<Arc<Attachments>>,
	covers: Option<Arc<Object>>,
	bit: u8,
	is_self: bool,
	/// Set when the annotations were taken by reference from another value
	sharing: bool,
	/// The value as it was before a projection was applied
	original: Option<Value>,
	/// The wrapper handed out for the original value, once built
	original_wrapper: Option<AnnotatedValue>,
}

impl Shared {
	pub(crate) fn new(value: Value, pool: Weak<ValuePool>, no_recycle: bool) -> Self {
		Self {
			body: RwLock::new(Annotated {
				value,
				..Default::default()
			}),
			pool,
			no_recycle,
		}
	}
	/// Prepares a pooled body for reuse with a new value
	pub(crate) fn reset(&mut self, value: Value) {
		self.body.get_mut().value = value;
	}
}

impl AnnotatedValue {
	/// Wraps a value which is not drawn from any pool
	pub fn new(value: Value) -> Self {
		Self::from_shared(Arc::new(Shared::new(value, Weak::new(), false)))
	}

	/// Wraps a value which must never be returned to a pool, because other
	/// holders may still read the data it was built from
	pub fn no_recycle(value: Value) -> Self {
		Self::from_shared(Arc::new(Shared::new(value, Weak::new(), true)))
	}

	pub(crate) fn from_shared(inner: Arc<Shared>) -> Self {
		Self {
			inner,
		}
	}

	// -----------------------------------
	// Lifecycle
	// -----------------------------------

	/// Adds a holder, returning the new handle
	pub fn track(&self) -> AnnotatedValue {
		trace!("Tracking annotated value {:p}", Arc::as_ptr(&self.inner));
		Self::from_shared(Arc::clone(&self.inner))
	}

	/// Removes this holder. The value is released once no holders remain.
	pub fn recycle(self) {
		trace!("Recycling annotated value {:p}", Arc::as_ptr(&self.inner));
		drop(self)
	}

	/// The number of holders of this value
	pub fn ref_count(&self) -> usize {
		Arc::strong_count(&self.inner)
	}

	/// Whether two handles refer to the same value
	pub fn ptr_eq(&self, other: &AnnotatedValue) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}

	/// Whether this value bypasses the pool when released
	pub fn is_no_recycle(&self) -> bool {
		self.inner.no_recycle
	}

	/// Pins this value so that it outlives the current holder, recording the
	/// number of holders at the time
	pub fn stash(&self) -> Stash {
		Stash {
			level: self.ref_count(),
			pin: self.track(),
		}
	}

	// -----------------------------------
	// Value access
	// -----------------------------------

	pub fn value(&self) -> MappedRwLockReadGuard<'_, Value> {
		RwLockReadGuard::map(self.inner.body.read(), |b| &b.value)
	}

	pub fn value_mut(&self) -> MappedRwLockWriteGuard<'_, Value> {
		RwLockWriteGuard::map(self.inner.body.write(), |b| &mut b.value)
	}

	/// Replaces the wrapped value, returning the previous one
	pub fn set_value(&self, value: Value) -> Value {
		mem::replace(&mut self.inner.body.write().value, value)
	}

	/// The estimated size of the wrapped value and its covers
	pub fn size(&self) -> u64 {
		let body = self.inner.body.read();
		body.value.size() + body.covers.as_deref().map(super::object_size).unwrap_or(0)
	}

	/// Applies a projection, keeping the value it replaces as the original.
	/// Only the first projection is recorded, so the original is always the
	/// value as it entered the pipeline.
	pub fn set_projection(&self, value: Value) {
		let mut body = self.inner.body.write();
		let previous = mem::replace(&mut body.value, value);
		if body.original.is_none() && body.original_wrapper.is_none() {
			body.original = Some(previous);
		}
	}

	/// Returns the value as it was before any projection, sharing this
	/// value's annotations. The wrapper is built once, on first use, and is
	/// never returned to a pool.
	pub fn original(&self) -> AnnotatedValue {
		let mut body = self.inner.body.write();
		if let Some(wrapper) = &body.original_wrapper {
			return wrapper.track();
		}
		let Some(original) = body.original.take() else {
			drop(body);
			return self.track();
		};
		let wrapper = AnnotatedValue::no_recycle(original);
		{
			let mut w = wrapper.inner.body.write();
			w.attachments = body.attachments.clone();
			w.meta = body.meta.clone();
			w.covers = body.covers.clone();
			w.bit = body.bit;
			w.sharing = true;
		}
		body.original_wrapper = Some(wrapper.track());
		wrapper
	}

	/// Whether a projection has been applied to this value
	pub fn has_original(&self) -> bool {
		let body = self.inner.body.read();
		body.original.is_some() || body.original_wrapper.is_some()
	}

	// -----------------------------------
	// Annotations
	// -----------------------------------

	/// Attaches side-channel data. Attaching a handle to this very value
	/// records a self-reference rather than holding the value open.
	pub fn set_attachment(&self, key: impl Into<String>, value: impl Into<Spillable>) {
		let value = match value.into() {
			Spillable::Annotated(v) if v.ptr_eq(self) => Spillable::SelfRef,
			v => v,
		};
		let mut body = self.inner.body.write();
		Arc::make_mut(body.attachments.get_or_insert_with(Default::default)).insert(key.into(), value);
	}

	/// Returns an attachment, resolving self-references to this value
	pub fn attachment(&self, key: &str) -> Option<Spillable> {
		let found = self.inner.body.read().attachments.as_ref()?.get(key).cloned();
		match found {
			Some(Spillable::SelfRef) => Some(Spillable::Annotated(self.track())),
			v => v,
		}
	}

	pub fn remove_attachment(&self, key: &str) -> Option<Spillable> {
		let mut body = self.inner.body.write();
		let attachments = body.attachments.as_mut()?;
		if !attachments.contains_key(key) {
			return None;
		}
		let removed = Arc::make_mut(attachments).remove(key);
		if attachments.is_empty() {
			body.attachments = None;
		}
		match removed {
			Some(Spillable::SelfRef) => Some(Spillable::Annotated(self.track())),
			v => v,
		}
	}

	pub fn meta_field(&self, key: &str) -> Option<Spillable> {
		self.inner.body.read().meta.as_ref()?.get(key).cloned()
	}

	pub fn set_meta_field(&self, key: impl Into<String>, value: impl Into<Spillable>) {
		let mut body = self.inner.body.write();
		Arc::make_mut(body.meta.get_or_insert_with(Default::default)).insert(key.into(), value.into());
	}

	/// The document key, as recorded in the metadata
	pub fn id(&self) -> Option<String> {
		self.meta_field("id").and_then(|v| v.as_str().map(str::to_owned))
	}

	pub fn set_id(&self, id: impl Into<String>) {
		self.set_meta_field("id", Spillable::String(id.into()))
	}

	/// Returns a covered field, as projected from an index
	pub fn cover(&self, key: &str) -> Option<Value> {
		self.inner.body.read().covers.as_ref()?.get(key).cloned()
	}

	pub fn set_cover(&self, key: impl Into<String>, value: Value) {
		let mut body = self.inner.body.write();
		Arc::make_mut(body.covers.get_or_insert_with(Default::default)).insert(key.into(), value);
	}

	/// Takes the annotations of another value by reference. Neither value
	/// owns them outright: they are released with their last holder, and
	/// copied on the first write made through either value.
	pub fn share_annotations(&self, other: &AnnotatedValue) {
		if self.ptr_eq(other) {
			return;
		}
		let (attachments, meta, covers) = {
			let other = other.inner.body.read();
			(other.attachments.clone(), other.meta.clone(), other.covers.clone())
		};
		let mut body = self.inner.body.write();
		body.attachments = attachments;
		body.meta = meta;
		body.covers = covers;
		body.sharing = true;
	}

	/// Takes an independent copy of the annotations of another value
	pub fn copy_annotations(&self, other: &AnnotatedValue) {
		if self.ptr_eq(other) {
			return;
		}
		let (attachments, meta, covers) = {
			let other = other.inner.body.read();
			(
				other.attachments.as_deref().cloned().map(Arc::new),
				other.meta.as_deref().cloned().map(Arc::new),
				other.covers.as_deref().cloned().map(Arc::new),
			)
		};
		let mut body = self.inner.body.write();
		body.attachments = attachments;
		body.meta = meta;
		body.covers = covers;
		body.sharing = false;
	}

	/// Whether the annotations were taken by reference from another value
	pub fn is_sharing(&self) -> bool {
		self.inner.body.read().sharing
	}

	pub fn bit(&self) -> u8 {
		self.inner.body.read().bit
	}

	pub fn set_bit(&self, bit: u8) {
		self.inner.body.write().bit = bit;
	}

	/// Whether this value is its own projection
	pub fn is_self(&self) -> bool {
		self.inner.body.read().is_self
	}

	pub fn set_self(&self, is_self: bool) {
		self.inner.body.write().is_self = is_self;
	}
}

impl Clone for AnnotatedValue {
	fn clone(&self) -> Self {
		self.track()
	}
}

impl Drop for AnnotatedValue {
	fn drop(&mut self) {
		// Only the last holder may return the body to its pool
		let pool = match Arc::get_mut(&mut self.inner) {
			Some(shared) if !shared.no_recycle => {
				*shared.body.get_mut() = Annotated::default();
				shared.pool.upgrade()
			}
			_ => None,
		};
		// The pool holds the body once this handle is gone
		if let Some(pool) = pool {
			pool.recycle(Arc::clone(&self.inner));
		}
	}
}

impl fmt::Debug for AnnotatedValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let body = self.inner.body.read();
		f.debug_struct("AnnotatedValue")
			.field("value", &body.value)
			.field("attachments", &body.attachments.as_ref().map(|a| a.len()))
			.field("meta", &body.meta)
			.field("covers", &body.covers)
			.field("bit", &body.bit)
			.field("self", &body.is_self)
			.field("refs", &Arc::strong_count(&self.inner))
			.finish()
	}
}

/// A value pinned across a scope boundary by [`AnnotatedValue::stash`].
#[must_use]
pub struct Stash {
	pin: AnnotatedValue,
	level: usize,
}

impl Stash {
	/// The number of holders when the value was stashed
	pub fn level(&self) -> usize {
		self.level
	}

	/// The pinned value
	pub fn value(&self) -> &AnnotatedValue {
		&self.pin
	}

	/// Releases the pin, returning whether the number of holders is back at
	/// the level recorded when the value was stashed
	pub fn restore(self) -> bool {
		let Stash {
			pin,
			level,
		} = self;
		let current = pin.ref_count() - 1;
		drop(pin);
		if current != level {
			warn!("Annotated value restored with {current} holders, but was stashed with {level}");
		}
		current == level
	}
}

// -----------------------------------
// Spilling
// -----------------------------------

impl Spill for AnnotatedValue {
	fn write_spill<W: Write>(&self, enc: &mut Encoder<W>) -> Result<(), Error> {
		let body = self.inner.body.read();
		enc.tag(Tag::Annotated)?;
		body.value.write_spill(enc)?;
		match &body.attachments {
			Some(v) => spillable::write_map(enc, v)?,
			None => enc.tag(Tag::Nil)?,
		}
		match &body.meta {
			Some(v) => spillable::write_map(enc, v)?,
			None => enc.tag(Tag::Nil)?,
		}
		match &body.covers {
			Some(v) => {
				enc.tag(Tag::Object)?;
				codec::write_fields(enc, v)?;
			}
			None => enc.tag(Tag::Nil)?,
		}
		enc.u8(body.bit)?;
		enc.u8(if body.is_self {
			FLAG_SELF
		} else {
			0
		})?;
		match (&body.original, &body.original_wrapper) {
			(Some(v), _) => v.write_spill(enc),
			(None, Some(w)) => w.value().write_spill(enc),
			(None, None) => enc.tag(Tag::Nil),
		}
	}

	fn read_spill<R: Read>(tag: Tag, dec: &mut Decoder<R>) -> Result<Self, Error> {
		if tag != Tag::Annotated {
			return Err(tag.unexpected("an annotated value"));
		}
		let value = dec.decode::<Value>()?;
		let attachments = spillable::read_optional_map(dec)?;
		let meta = spillable::read_optional_map(dec)?;
		let covers = match dec.tag()? {
			Tag::Nil => None,
			Tag::Object => Some(codec::read_fields(dec)?),
			tag => return Err(tag.unexpected("covers or nil")),
		};
		let bit = dec.u8()?;
		let flags = dec.u8()?;
		let original = match dec.tag()? {
			Tag::Nil => None,
			tag => Some(Value::read_spill(tag, dec)?),
		};
		// Self-references are kept as markers and resolve to this value
		// by identity whenever they are read back
		let av = dec.annotate(value);
		{
			let mut body = av.inner.body.write();
			body.attachments = attachments.map(Arc::new);
			body.meta = meta.map(Arc::new);
			body.covers = covers.map(Arc::new);
			body.bit = bit;
			body.is_self = flags & FLAG_SELF != 0;
			body.original = original;
		}
		Ok(av)
	}
}
