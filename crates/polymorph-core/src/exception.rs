//! Error taxonomy shared by every polymorph crate.
//!
//! Equivalent to Django's `django.core.exceptions` plus the polymorphic
//! specific errors (`PolymorphicTypeUndefined`, `PolymorphicTypeInvalid`).

use crate::checks::CheckMessage;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Reference to a persisted object, used when reporting errors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
	/// Model label (`app_label.ModelName`)
	pub model: String,
	/// Primary key value
	pub pk: i64,
}

impl ObjectRef {
	pub fn new(model: impl Into<String>, pk: i64) -> Self {
		Self {
			model: model.into(),
			pk,
		}
	}
}

impl fmt::Display for ObjectRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}#{}", self.model, self.pk)
	}
}

/// Objects blocking a deletion, grouped by the relation that blocks them.
///
/// Keys are relation descriptions in the form `app.Model.field`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionBlocked {
	pub relations: Vec<(String, Vec<ObjectRef>)>,
}

impl DeletionBlocked {
	/// All blocking objects, in discovery order.
	pub fn objects(&self) -> impl Iterator<Item = &ObjectRef> {
		self.relations.iter().flat_map(|(_, objs)| objs.iter())
	}

	/// Relation descriptions, in discovery order.
	pub fn relation_names(&self) -> Vec<&str> {
		self.relations.iter().map(|(name, _)| name.as_str()).collect()
	}

	pub fn is_empty(&self) -> bool {
		self.relations.iter().all(|(_, objs)| objs.is_empty())
	}
}

impl fmt::Display for DeletionBlocked {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let parts: Vec<String> = self
			.relations
			.iter()
			.map(|(relation, objs)| {
				let objs: Vec<String> = objs.iter().map(ToString::to_string).collect();
				format!("'{}' ({})", relation, objs.join(", "))
			})
			.collect();
		f.write_str(&parts.join("; "))
	}
}

/// Field resolution errors raised by the query layer.
///
/// The polymorphic rewriter returns these unwrapped so that the message
/// names the real missing field or model.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
	#[error(
		"Cannot resolve keyword '{field}' into field on model '{model}'. Choices are: {choices}{}",
		.suggestion.as_ref().map(|s| format!(" (did you mean '{}'?)", s)).unwrap_or_default()
	)]
	DoesNotExist {
		model: String,
		field: String,
		choices: String,
		suggestion: Option<String>,
	},

	#[error("PolymorphicModel: queryset filter error: model {name} not found (not a subclass of {base})")]
	UnknownModel { name: String, base: String },

	#[error("PolymorphicModel: queryset filter error: {model} is not derived from {base}")]
	NotASubclass { model: String, base: String },

	#[error(
		"PolymorphicModel: model name alone is ambiguous: {name} (matches {candidates}); use 'applabel__ModelName___field' instead"
	)]
	Ambiguous { name: String, candidates: String },

	#[error("Unsupported lookup '{lookup}' for field '{field}'")]
	UnsupportedLookup { field: String, lookup: String },

	#[error("Cannot traverse non-relational field '{field}' on model '{model}'")]
	NotRelational { model: String, field: String },
}

/// Framework error type.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	Field(#[from] FieldError),

	#[error("Cannot delete some instances because they are referenced through protected foreign keys: {0}")]
	Protected(DeletionBlocked),

	#[error("Cannot delete some instances because they are referenced through restricted foreign keys: {0}")]
	Restricted(DeletionBlocked),

	#[error("{model} #{pk}: the polymorphic discriminator is NULL; the real class is undefined")]
	PolymorphicTypeUndefined { model: String, pk: i64 },

	#[error("{model} #{pk}: {reason}")]
	PolymorphicTypeInvalid {
		model: String,
		pk: i64,
		reason: String,
	},

	#[error("Content type {0} does not exist (class not found)")]
	ContentTypeNotFound(i64),

	#[error("on_delete handler must be callable, got '{0}'")]
	NotCallable(String),

	#[error("{model} matching query does not exist")]
	DoesNotExist { model: String },

	#[error("get() returned more than one {model} -- it returned {count}!")]
	MultipleObjectsReturned { model: String, count: usize },

	#[error("Integrity error: {0}")]
	Integrity(String),

	#[error("Database error: {0}")]
	Database(String),

	#[error("Improperly configured: {0}")]
	ImproperlyConfigured(String),

	#[error("System check identified {} issue(s): {}", .0.len(), .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
	SystemCheck(Vec<CheckMessage>),

	#[error("Serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("Validation error: {0}")]
	Validation(String),

	#[error("Transaction error: {0}")]
	Transaction(String),
}

impl Error {
	/// Whether this error aborted a deletion because of a protect/restrict relation.
	pub fn is_deletion_blocked(&self) -> bool {
		matches!(self, Error::Protected(_) | Error::Restricted(_))
	}

	/// Objects that blocked a deletion, if any.
	pub fn blocking_objects(&self) -> Vec<ObjectRef> {
		match self {
			Error::Protected(blocked) | Error::Restricted(blocked) => {
				blocked.objects().cloned().collect()
			}
			_ => Vec::new(),
		}
	}
}

pub type Result<T> = std::result::Result<T, Error>;
