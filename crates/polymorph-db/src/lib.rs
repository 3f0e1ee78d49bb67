//! # polymorph-db
//!
//! Django-style ORM layer with polymorphic multi-table inheritance.
//!
//! ## Modules
//!
//! - [`orm`]: model declarations, registry, querysets, instances and the
//!   deletion collector
//! - [`contenttypes`]: the content-type table used as class discriminator
//! - [`polymorphic`]: the discriminator hook, polymorphic managers and
//!   querysets, upgrading of rows to their concrete classes and the
//!   polymorphic-aware deletion
//! - [`migrations`]: schema state, change detection and migration writing
//! - [`backends`]: in-memory and SQLite storage
//!
//! ## Features
//!
//! - `sqlite` (default): [`backends::SqliteBackend`] on `sqlx` and
//!   `sea-query`

pub mod backends;
pub mod contenttypes;
pub mod migrations;
pub mod orm;
pub mod polymorphic;

pub use polymorph_core::{Error, FieldError, Result};

/// Common imports
pub mod prelude {
	pub use crate::contenttypes::{ContentType, ContentTypeManager};
	pub use crate::orm::{
		DatabaseConnection, Field, Instance, Manager, ModelDef, ModelRegistry, OnDelete, Q, QuerySet, Value,
	};
	pub use crate::polymorphic::{
		PolymorphicGuard, PolymorphicHook, PolymorphicInstanceExt, PolymorphicManager, PolymorphicQuerySetExt,
		ShowFieldContent, ShowFieldType, ShowFieldTypeAndContent,
	};
	pub use polymorph_core::{Error, Result};
}
