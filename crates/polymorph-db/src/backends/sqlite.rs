//! SQLite backend
//!
//! Statements are rendered with `sea-query`'s `SqliteQueryBuilder` and run on
//! an `sqlx` pool. Every write batch runs in one transaction with foreign key
//! checks deferred to commit.

use super::Backend;
use super::statements::{
	ColumnRef, Condition, InsertStatement, JoinKind, SelectQuery, TableSchema, WriteStatement,
};
use crate::orm::fields::ColumnKind;
use crate::orm::query::FilterOperator;
use crate::orm::value::{Row, Value};
use async_trait::async_trait;
use polymorph_conf::DatabaseSettings;
use polymorph_core::{Error, Result};
use sea_query::{
	Alias, ColumnDef, Condition as SeaCondition, Expr, ExprTrait, ForeignKey, Func, JoinType, LikeExpr,
	Order, Query, SqliteQueryBuilder, Table,
};
use sqlx::error::ErrorKind;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row as _, Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;

fn db_error(err: sqlx::Error) -> Error {
	match err.as_database_error() {
		Some(db) if !matches!(db.kind(), ErrorKind::Other) => Error::Integrity(db.message().to_string()),
		_ => Error::Database(err.to_string()),
	}
}

fn sea_error(err: sea_query::error::Error) -> Error {
	Error::Database(err.to_string())
}

fn to_sea(value: &Value) -> sea_query::Value {
	match value {
		Value::Null => sea_query::Value::BigInt(None),
		Value::Bool(b) => sea_query::Value::Bool(Some(*b)),
		Value::Int(i) => sea_query::Value::BigInt(Some(*i)),
		Value::Float(f) => sea_query::Value::Double(Some(*f)),
		Value::Text(s) => sea_query::Value::String(Some(s.clone())),
	}
}

fn col(column: &ColumnRef) -> Expr {
	Expr::col((Alias::new(&column.alias), Alias::new(&column.column)))
}

fn like_pattern(value: Option<&Value>, prefix: &str, suffix: &str) -> LikeExpr {
	let text = value.map(ToString::to_string).unwrap_or_default();
	let escaped = text.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
	LikeExpr::new(format!("{}{}{}", prefix, escaped, suffix)).escape('\\')
}

fn compile_condition(condition: &Condition) -> SeaCondition {
	match condition {
		Condition::Compare {
			column,
			operator,
			values,
		} => {
			let first = values.first();
			let value = || to_sea(first.unwrap_or(&Value::Null));
			let list = || values.iter().map(to_sea).collect::<Vec<_>>();
			let expr = match operator {
				FilterOperator::Eq => col(column).eq(value()),
				FilterOperator::Ne => col(column).ne(value()),
				FilterOperator::Gt => col(column).gt(value()),
				FilterOperator::Gte => col(column).gte(value()),
				FilterOperator::Lt => col(column).lt(value()),
				FilterOperator::Lte => col(column).lte(value()),
				FilterOperator::In => col(column).is_in(list()),
				FilterOperator::NotIn => col(column).is_not_in(list()),
				FilterOperator::Contains => col(column).like(like_pattern(first, "%", "%")),
				FilterOperator::IContains => Expr::expr(Func::lower(col(column)))
					.like(like_pattern(first.map(|v| Value::Text(v.to_string().to_lowercase())).as_ref(), "%", "%")),
				FilterOperator::StartsWith => col(column).like(like_pattern(first, "", "%")),
				FilterOperator::EndsWith => col(column).like(like_pattern(first, "%", "")),
				FilterOperator::IsNull => col(column).is_null(),
				FilterOperator::IsNotNull => col(column).is_not_null(),
			};
			SeaCondition::all().add(expr)
		}
		Condition::And(items) => items
			.iter()
			.fold(SeaCondition::all(), |acc, c| acc.add(compile_condition(c))),
		Condition::Or(items) => items
			.iter()
			.fold(SeaCondition::any(), |acc, c| acc.add(compile_condition(c))),
		Condition::Not(inner) => compile_condition(inner).not(),
	}
}

fn render_select(query: &SelectQuery) -> String {
	let mut select = Query::select();
	select.from_as(Alias::new(&query.table), Alias::new(&query.alias));
	for column in &query.columns {
		select.expr_as(col(&column.source), Alias::new(&column.name));
	}
	for join in &query.joins {
		let kind = match join.kind {
			JoinKind::Inner => JoinType::InnerJoin,
			JoinKind::Left => JoinType::LeftJoin,
		};
		select.join_as(
			kind,
			Alias::new(&join.table),
			Alias::new(&join.alias),
			col(&join.left).equals((Alias::new(&join.alias), Alias::new(&join.column))),
		);
	}
	if let Some(condition) = &query.condition {
		select.cond_where(compile_condition(condition));
	}
	for term in &query.order_by {
		let order = if term.descending { Order::Desc } else { Order::Asc };
		select.order_by((Alias::new(&term.column.alias), Alias::new(&term.column.column)), order);
	}
	match (query.limit, query.offset) {
		(Some(limit), _) => {
			select.limit(limit as u64);
		}
		// SQLite only accepts OFFSET after a LIMIT.
		(None, offset) if offset > 0 => {
			select.limit(i64::MAX as u64);
		}
		_ => {}
	}
	if query.offset > 0 {
		select.offset(query.offset as u64);
	}
	select.to_string(SqliteQueryBuilder)
}

fn render_write(statement: &WriteStatement) -> String {
	match statement {
		WriteStatement::Update {
			table,
			assignments,
			key_column,
			keys,
		} => {
			let mut update = Query::update();
			update.table(Alias::new(table));
			if assignments.is_empty() {
				// Existence probe: touches the key only.
				update.value(Alias::new(key_column), Expr::col(Alias::new(key_column)));
			}
			for (column, value) in assignments {
				update.value(Alias::new(column), to_sea(value));
			}
			update.and_where(Expr::col(Alias::new(key_column)).is_in(keys.iter().copied()));
			update.to_string(SqliteQueryBuilder)
		}
		WriteStatement::Delete {
			table,
			key_column,
			keys,
		} => Query::delete()
			.from_table(Alias::new(table))
			.and_where(Expr::col(Alias::new(key_column)).is_in(keys.iter().copied()))
			.to_string(SqliteQueryBuilder),
	}
}

fn render_insert(statement: &InsertStatement, pk: Option<i64>) -> Result<String> {
	let mut columns = Vec::new();
	let mut values: Vec<Expr> = Vec::new();
	if let Some(pk) = pk {
		columns.push(Alias::new(&statement.pk_column));
		values.push(Expr::val(pk));
	}
	for (column, value) in &statement.values {
		columns.push(Alias::new(column));
		values.push(Expr::val(to_sea(value)));
	}
	let mut insert = Query::insert();
	insert.into_table(Alias::new(&statement.table));
	if columns.is_empty() {
		insert.or_default_values();
	} else {
		insert.columns(columns).values(values).map_err(sea_error)?;
	}
	Ok(insert.to_string(SqliteQueryBuilder))
}

fn render_create_table(schema: &TableSchema) -> String {
	let mut table = Table::create();
	table.table(Alias::new(&schema.name)).if_not_exists();
	for column in &schema.columns {
		let mut def = ColumnDef::new(Alias::new(&column.name));
		if column.primary_key {
			// SQLite only auto-increments an INTEGER PRIMARY KEY.
			def.integer().not_null().primary_key();
			if column.auto_increment {
				def.auto_increment();
			}
		} else {
			match column.kind {
				ColumnKind::Integer => def.big_integer(),
				ColumnKind::Float => def.double(),
				ColumnKind::Boolean => def.boolean(),
				ColumnKind::Text => def.text(),
			};
			if column.nullable {
				def.null();
			} else {
				def.not_null();
			}
		}
		if column.unique {
			def.unique_key();
		}
		table.col(&mut def);
		if let Some((target, target_column)) = &column.references {
			table.foreign_key(
				ForeignKey::create()
					.from(Alias::new(&schema.name), Alias::new(&column.name))
					.to(Alias::new(target), Alias::new(target_column)),
			);
		}
	}
	table.to_string(SqliteQueryBuilder)
}

fn decode(row: &SqliteRow, query: &SelectQuery) -> Result<Row> {
	let mut out = Row::with_capacity(query.columns.len());
	for (index, column) in query.columns.iter().enumerate() {
		let value = match column.kind {
			ColumnKind::Integer => row.try_get::<Option<i64>, _>(index).map(Value::from),
			ColumnKind::Float => row.try_get::<Option<f64>, _>(index).map(Value::from),
			ColumnKind::Boolean => row.try_get::<Option<bool>, _>(index).map(Value::from),
			ColumnKind::Text => row.try_get::<Option<String>, _>(index).map(Value::from),
		}
		.map_err(db_error)?;
		out.insert(column.name.clone(), value);
	}
	Ok(out)
}

/// Backend over an `sqlx` SQLite pool
#[derive(Debug, Clone)]
pub struct SqliteBackend {
	pool: SqlitePool,
}

impl SqliteBackend {
	/// Open a pool for `settings.url`. In-memory databases get a single,
	/// never recycled connection so every statement sees the same database.
	pub async fn connect(settings: &DatabaseSettings) -> Result<Self> {
		let options = SqliteConnectOptions::from_str(&settings.url)
			.map_err(db_error)?
			.create_if_missing(true)
			.foreign_keys(true)
			.pragma("case_sensitive_like", "ON");
		let in_memory = settings.url.contains(":memory:") || settings.url.contains("mode=memory");
		let mut pool = SqlitePoolOptions::new();
		pool = if in_memory {
			pool.max_connections(1)
				.idle_timeout(None::<Duration>)
				.max_lifetime(None::<Duration>)
		} else {
			pool.max_connections(Ord::max(settings.max_connections, 1))
		};
		let pool = pool.connect_with(options).await.map_err(db_error)?;
		tracing::debug!(url = %settings.url, "sqlite pool opened");
		Ok(Self { pool })
	}

	pub fn from_pool(pool: SqlitePool) -> Self {
		Self { pool }
	}

	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}

	async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
		let mut tx = self.pool.begin().await.map_err(db_error)?;
		sqlx::query("PRAGMA defer_foreign_keys = ON")
			.execute(&mut *tx)
			.await
			.map_err(db_error)?;
		Ok(tx)
	}
}

#[async_trait]
impl Backend for SqliteBackend {
	fn vendor(&self) -> &'static str {
		"sqlite"
	}

	async fn create_table(&self, schema: &TableSchema) -> Result<()> {
		let sql = render_create_table(schema);
		sqlx::query(&sql).execute(&self.pool).await.map_err(db_error)?;
		Ok(())
	}

	async fn select(&self, query: &SelectQuery) -> Result<Vec<Row>> {
		let sql = render_select(query);
		tracing::trace!(%sql, "select");
		let rows = sqlx::query(&sql).fetch_all(&self.pool).await.map_err(db_error)?;
		rows.iter().map(|row| decode(row, query)).collect()
	}

	async fn insert(&self, chain: &[InsertStatement], pk: Option<i64>) -> Result<i64> {
		let mut tx = self.begin().await?;
		let mut key = pk;
		for statement in chain {
			let sql = render_insert(statement, key)?;
			let result = sqlx::query(&sql).execute(&mut *tx).await.map_err(db_error)?;
			key = Some(key.unwrap_or_else(|| result.last_insert_rowid()));
		}
		tx.commit().await.map_err(db_error)?;
		key.ok_or_else(|| Error::Database("empty insert chain".to_string()))
	}

	async fn execute(&self, statements: &[WriteStatement]) -> Result<Vec<u64>> {
		let mut tx = self.begin().await?;
		let mut affected = Vec::with_capacity(statements.len());
		for statement in statements {
			let sql = render_write(statement);
			let result = sqlx::query(&sql).execute(&mut *tx).await.map_err(db_error)?;
			affected.push(result.rows_affected());
		}
		tx.commit().await.map_err(db_error)?;
		Ok(affected)
	}
}
