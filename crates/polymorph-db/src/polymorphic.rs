//! # Polymorphic models
//!
//! Multi-table inheritance where querying a base model yields instances of
//! their most derived classes.
//!
//! Register [`PolymorphicHook`] with the model registry and mark the root of
//! a hierarchy with `ModelDef::polymorphic()`. The hook then:
//!
//! - adds the `polymorphic_ctype` discriminator to the root,
//! - installs a [`PolymorphicManager`] as `objects` where no manager was
//!   declared,
//! - wraps the on-delete action of every relation touching the hierarchy in
//!   a [`PolymorphicGuard`],
//! - fills the discriminator on save,
//! - runs the model checks of [`checks`].
//!
//! ## Example
//!
//! ```no_run
//! use polymorph_db::orm::{DatabaseConnection, Field, ModelDef, ModelRegistry};
//! use polymorph_db::polymorphic::{PolymorphicHook, PolymorphicQuerySetExt};
//! use std::sync::Arc;
//!
//! # async fn example() -> polymorph_core::Result<()> {
//! let registry = ModelRegistry::builder()
//!     .hook(PolymorphicHook::new())
//!     .model(ModelDef::new("tests", "Model2A").polymorphic().field(Field::char("field1", 30)))
//!     .model(ModelDef::new("tests", "Model2B").parent("Model2A").field(Field::char("field2", 30)))
//!     .build()?;
//! let conn = DatabaseConnection::memory(Arc::new(registry));
//! conn.migrate().await?;
//!
//! conn.create("tests.Model2B", vec![("field1", "B1".into()), ("field2", "B2".into())]).await?;
//! let objects = conn.objects("tests.Model2A")?.fetch().await?;
//! assert_eq!(objects[0].label(), "tests.Model2B");
//!
//! let only_b = conn.objects("tests.Model2A")?.instance_of(&["Model2B"])?.count().await?;
//! assert_eq!(only_b, 1);
//! # Ok(())
//! # }
//! ```

pub mod checks;
pub mod collector;
pub mod guard;
pub mod hook;
pub mod manager;
pub mod materialize;
pub mod showfields;
pub mod translate;

pub use collector::{CollectorState, CtypeRewrite, DeleteBatch, DeletionOutcome, DeletionPlan, PolymorphicCollector};
pub use guard::{PolymorphicGuard, register_handler, unregister_handler};
pub use hook::{CTYPE_FIELD, PolymorphicHook};
pub use manager::{PolymorphicInstanceExt, PolymorphicManager, PolymorphicQuerySetExt, create_from_super};
pub use materialize::{PolymorphicIterable, get_real_instances, real_class};
pub use showfields::{ShowFieldContent, ShowFieldType, ShowFieldTypeAndContent};
pub use translate::PolymorphicTranslator;
