//! # polymorph
//!
//! Polymorphic multi-table inheritance for a Django-style Rust ORM.
//!
//! Querying the base model of a polymorphic hierarchy returns each row as an
//! instance of its most derived class. The crates are re-exported here:
//!
//! - [`core`]: errors, signals and system-check messages
//! - [`conf`]: layered settings
//! - [`db`]: the ORM, content types, polymorphic models and migrations
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use polymorph::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> polymorph::Result<()> {
//! let registry = ModelRegistry::builder()
//!     .hook(PolymorphicHook::new())
//!     .model(ModelDef::new("zoo", "Animal").polymorphic().field(Field::char("name", 50)))
//!     .model(ModelDef::new("zoo", "Dog").parent("Animal").field(Field::boolean("good")))
//!     .build()?;
//! let conn = DatabaseConnection::memory(Arc::new(registry));
//! conn.migrate().await?;
//!
//! conn.create("zoo.Dog", vec![("name", "Rex".into()), ("good", true.into())]).await?;
//! for animal in conn.objects("zoo.Animal")?.fetch().await? {
//!     println!("{}", animal);
//! }
//! # Ok(())
//! # }
//! ```

pub mod conf;
pub mod core;
pub mod db;

pub use polymorph_core::{Error, FieldError, Result};

/// Common imports for applications
pub mod prelude {
	pub use polymorph_conf::PolymorphicSettings;
	pub use polymorph_db::prelude::*;
}
