//! # Migrations
//!
//! Schema state derived from the model registry, change detection between
//! two states, and rendering of the detected operations as Rust source.
//!
//! ## Flow
//!
//! ```no_run
//! use polymorph_db::migrations::{Autodetector, MigrationWriter, ProjectState};
//! use polymorph_db::orm::ModelRegistry;
//!
//! # fn example(registry: &ModelRegistry) -> Result<(), polymorph_db::migrations::MigrationError> {
//! let before = ProjectState::new();
//! let after = ProjectState::from_registry(registry);
//! let operations = Autodetector::new(&before, &after).detect_changes();
//! let source = MigrationWriter::new("tests", "0001_initial")
//!     .operations(operations)
//!     .as_string()?;
//! # Ok(())
//! # }
//! ```
//!
//! On-delete handlers are compared and written through their canonical
//! [`HandlerRef`](crate::orm::HandlerRef): wrapping a handler in a guard
//! neither produces an `AlterField` nor changes the written source.

pub mod autodetector;
pub mod migration;
pub mod operations;
pub mod serializer;
pub mod state;
pub mod writer;

pub use autodetector::Autodetector;
pub use migration::Migration;
pub use operations::Operation;
pub use serializer::{HandlerSerializer, register_serializer, serialize_handler, unregister_serializer};
pub use state::{FieldState, ModelState, ProjectState, RelationState};
pub use writer::MigrationWriter;

use thiserror::Error;

/// Items referenced by written migration files
pub mod prelude {
	pub use super::migration::Migration;
	pub use super::operations::Operation;
	pub use super::state::{FieldState, RelationState};
	pub use crate::orm::{FieldType, OnDelete, Value};
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum MigrationError {
	#[error("Cannot serialize on_delete handler {0}; register a serializer for its type")]
	Unserializable(String),

	#[error("Invalid migration: {0}")]
	InvalidMigration(String),

	#[error("Model not found in project state: {app_label}.{name}")]
	ModelNotFound { app_label: String, name: String },

	#[error("Field not found in project state: {model}.{field}")]
	FieldNotFound { model: String, field: String },

	#[error("Generated code does not parse: {0}")]
	Parse(#[from] syn::Error),
}

pub type Result<T> = std::result::Result<T, MigrationError>;
