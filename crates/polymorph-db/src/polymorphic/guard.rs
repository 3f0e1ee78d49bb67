//! On-delete guard for relations into polymorphic hierarchies

use crate::migrations::{MigrationError, serializer};
use crate::orm::{Collector, HandlerRef, ModelIterable, OnDelete, OnDeleteHandler, QuerySet, RelatedField};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use proc_macro2::TokenStream;
use polymorph_core::{Error, Result};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

static NAMED_HANDLERS: Lazy<RwLock<HashMap<String, Arc<dyn OnDeleteHandler>>>> =
	Lazy::new(|| RwLock::new(HashMap::new()));

/// Make a custom handler resolvable by [`PolymorphicGuard::from_reference`].
///
/// The handler's [`reference`](OnDeleteHandler::reference) should be
/// `HandlerRef::Custom(name)` so migrations can name it.
pub fn register_handler(name: impl Into<String>, handler: Arc<dyn OnDeleteHandler>) {
	NAMED_HANDLERS.write().insert(name.into(), handler);
}

/// Remove a handler added with [`register_handler`].
pub fn unregister_handler(name: &str) -> bool {
	NAMED_HANDLERS.write().remove(name).is_some()
}

/// Wraps an on-delete action so that the rows it receives are fetched at the
/// relation's own level instead of being upgraded to their concrete classes.
///
/// The collector then reaches the subclass tables through their parent
/// links. A guard compares equal to the action it wraps, in both
/// directions, and has the same [`HandlerRef`].
///
/// # Examples
///
/// ```
/// use polymorph_db::orm::{OnDelete, OnDeleteHandler};
/// use polymorph_db::polymorphic::PolymorphicGuard;
///
/// let guard = PolymorphicGuard::new(OnDelete::Cascade);
/// assert_eq!(guard, OnDelete::Cascade);
/// assert_eq!(OnDelete::Cascade, guard);
/// assert_eq!(guard.reference().to_string(), "CASCADE");
/// ```
#[derive(Debug, Clone)]
pub struct PolymorphicGuard {
	action: Arc<dyn OnDeleteHandler>,
}

impl PolymorphicGuard {
	pub fn new(action: impl OnDeleteHandler) -> Self {
		Self::wrap(Arc::new(action))
	}

	/// Guard a shared handler. An existing guard is not wrapped twice.
	pub fn wrap(action: Arc<dyn OnDeleteHandler>) -> Self {
		match action.as_any().downcast_ref::<PolymorphicGuard>() {
			Some(guard) => guard.clone(),
			None => Self { action },
		}
	}

	/// Guard the handler named `name`: one of the constant actions, or a
	/// handler added with [`register_handler`].
	pub fn from_reference(name: &str) -> Result<Self> {
		if let Some(action) = OnDelete::from_name(name) {
			return Ok(Self::new(action));
		}
		NAMED_HANDLERS
			.read()
			.get(name)
			.cloned()
			.map(Self::wrap)
			.ok_or_else(|| Error::NotCallable(name.to_string()))
	}

	/// The wrapped action
	pub fn action(&self) -> &Arc<dyn OnDeleteHandler> {
		&self.action
	}

	pub fn is_guard(handler: &dyn OnDeleteHandler) -> bool {
		handler.as_any().is::<PolymorphicGuard>()
	}
}

impl OnDeleteHandler for PolymorphicGuard {
	fn apply(&self, collector: &mut Collector, related: &RelatedField, sub_objs: QuerySet) -> Result<()> {
		let sub_objs = if sub_objs.is_polymorphic() {
			sub_objs.with_iterable(Arc::new(ModelIterable))
		} else {
			sub_objs
		};
		self.action.apply(collector, related, sub_objs)
	}

	fn reference(&self) -> HandlerRef {
		self.action.reference()
	}

	fn as_any(&self) -> &dyn Any {
		self
	}
}

impl PartialEq for PolymorphicGuard {
	fn eq(&self, other: &Self) -> bool {
		self.reference() == other.reference()
	}
}

impl PartialEq<OnDelete> for PolymorphicGuard {
	fn eq(&self, other: &OnDelete) -> bool {
		self.reference() == HandlerRef::Action(other.clone())
	}
}

impl PartialEq<PolymorphicGuard> for OnDelete {
	fn eq(&self, other: &PolymorphicGuard) -> bool {
		other == self
	}
}

/// Migration serializer for guards: the wrapped action is written instead.
pub(crate) fn serialize_guard(handler: &dyn OnDeleteHandler) -> std::result::Result<TokenStream, MigrationError> {
	match handler.as_any().downcast_ref::<PolymorphicGuard>() {
		Some(guard) => serializer::serialize_handler(guard.action().as_ref()),
		None => Err(MigrationError::Unserializable(format!("{:?}", handler))),
	}
}
