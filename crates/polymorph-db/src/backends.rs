//! Database backends
//!
//! The ORM compiles querysets into the statements of [`statements`] and hands
//! them to a [`Backend`]. Two implementations are provided:
//!
//! - [`MemoryBackend`]: in-process tables, used by unit tests
//! - `SqliteBackend`: `sqlx` + `sea-query` (feature `sqlite`)

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod statements;

pub use memory::{ConstraintMode, MemoryBackend};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;
pub use statements::{
	ColumnRef, ColumnSchema, Condition, InsertStatement, Join, JoinKind, OrderTerm, SelectColumn,
	SelectQuery, TableSchema, WriteStatement,
};

use crate::orm::value::Row;
use async_trait::async_trait;
use polymorph_core::Result;
use std::fmt;

/// Storage used by a [`DatabaseConnection`](crate::orm::DatabaseConnection)
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
	fn vendor(&self) -> &'static str;

	async fn create_table(&self, schema: &TableSchema) -> Result<()>;

	async fn select(&self, query: &SelectQuery) -> Result<Vec<Row>>;

	/// Insert one row per table of an inheritance chain, root first, in one
	/// transaction. All rows share a primary key: `pk` when given, otherwise
	/// the key generated for the first table. Returns the key.
	async fn insert(&self, chain: &[InsertStatement], pk: Option<i64>) -> Result<i64>;

	/// Run updates and deletes atomically. Returns affected rows per statement.
	async fn execute(&self, statements: &[WriteStatement]) -> Result<Vec<u64>>;
}
