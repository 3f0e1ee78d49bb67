//! Django-style ORM
//!
//! Models are declared at runtime with [`ModelDef`], resolved by the
//! [`ModelRegistry`] and queried through [`QuerySet`]s obtained from a
//! [`DatabaseConnection`].
//!
//! ## Example
//!
//! ```no_run
//! use polymorph_db::orm::{DatabaseConnection, Field, ModelDef, ModelRegistry, Q};
//! use std::sync::Arc;
//!
//! # async fn example() -> polymorph_core::Result<()> {
//! let registry = ModelRegistry::builder()
//!     .model(ModelDef::new("blog", "Post").field(Field::char("title", 100)))
//!     .build()?;
//! let conn = DatabaseConnection::memory(Arc::new(registry));
//! conn.migrate().await?;
//!
//! conn.create("blog.Post", vec![("title", "hello".into())]).await?;
//! let posts = conn
//!     .objects("blog.Post")?
//!     .filter(Q::new("title__startswith", "he"))?
//!     .fetch()
//!     .await?;
//! assert_eq!(posts.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod compiler;
pub mod connection;
pub mod deletion;
pub mod fields;
pub mod instance;
pub mod manager;
pub mod model;
pub mod query;
pub mod queryset;
pub mod registry;
pub mod related;
pub mod value;

pub use compiler::QueryCompiler;
pub use connection::DatabaseConnection;
pub use deletion::{Collector, FieldUpdate, HandlerRef, OnDelete, OnDeleteHandler, SetValue};
pub use fields::{ColumnKind, Field, FieldMeta, FieldType, ManyToManyMeta, RelatedField, RelationMeta};
pub use instance::Instance;
pub use manager::{BaseManager, Manager};
pub use model::{Capability, InstanceRepr, ModelDef, ModelMeta};
pub use query::{Filter, FilterCondition, FilterOperator, FilterValue, Q};
pub use queryset::{FilterTranslator, IdentityTranslator, ModelIterable, QuerySet, ResultIterable};
pub use registry::{ModelHook, ModelRegistry, ModelRegistryBuilder, PrepareContext, apps, install};
pub use related::ManyRelated;
pub use value::{Row, Value};
