//! Model managers

use super::connection::DatabaseConnection;
use super::model::ModelMeta;
use super::queryset::{FilterTranslator, IdentityTranslator, ModelIterable, QuerySet, ResultIterable};
use polymorph_core::Result;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Entry point for querysets of a model (Django's `Manager`)
pub trait Manager: Send + Sync + fmt::Debug {
	/// Attribute name (`objects`)
	fn name(&self) -> &str;

	/// Whether migrations may use this manager.
	fn use_in_migrations(&self) -> bool {
		false
	}

	fn iterable(&self) -> Arc<dyn ResultIterable> {
		Arc::new(ModelIterable)
	}

	fn translator(&self) -> Arc<dyn FilterTranslator> {
		Arc::new(IdentityTranslator)
	}

	fn get_queryset(&self, conn: &DatabaseConnection, model: Arc<ModelMeta>) -> Result<QuerySet> {
		Ok(QuerySet::new(conn.clone(), model)
			.with_iterable(self.iterable())
			.with_translator(self.translator()))
	}

	fn as_any(&self) -> &dyn Any;
}

/// Plain manager returning rows of the queried model
#[derive(Debug, Clone)]
pub struct BaseManager {
	name: String,
	use_in_migrations: bool,
}

impl BaseManager {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			use_in_migrations: false,
		}
	}

	pub fn with_use_in_migrations(mut self, enabled: bool) -> Self {
		self.use_in_migrations = enabled;
		self
	}
}

impl Default for BaseManager {
	fn default() -> Self {
		Self::new("objects")
	}
}

impl Manager for BaseManager {
	fn name(&self) -> &str {
		&self.name
	}

	fn use_in_migrations(&self) -> bool {
		self.use_in_migrations
	}

	fn as_any(&self) -> &dyn Any {
		self
	}
}
