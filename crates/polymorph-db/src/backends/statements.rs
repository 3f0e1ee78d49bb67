//! Backend-neutral statements produced by the query compiler

use crate::orm::fields::ColumnKind;
use crate::orm::query::FilterOperator;
use crate::orm::value::{Row, Value};
use std::fmt;

/// `alias.column`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
	pub alias: String,
	pub column: String,
}

impl ColumnRef {
	pub fn new(alias: impl Into<String>, column: impl Into<String>) -> Self {
		Self {
			alias: alias.into(),
			column: column.into(),
		}
	}
}

impl fmt::Display for ColumnRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}", self.alias, self.column)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
	Inner,
	Left,
}

/// `JOIN table AS alias ON alias.column = left`
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
	pub kind: JoinKind,
	pub table: String,
	pub alias: String,
	pub column: String,
	pub left: ColumnRef,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
	Compare {
		column: ColumnRef,
		operator: FilterOperator,
		/// Single value, or the list for `IN`
		values: Vec<Value>,
	},
	And(Vec<Condition>),
	Or(Vec<Condition>),
	Not(Box<Condition>),
}

/// Output column of a select
#[derive(Debug, Clone, PartialEq)]
pub struct SelectColumn {
	pub source: ColumnRef,
	/// Key in the returned rows
	pub name: String,
	pub kind: ColumnKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderTerm {
	pub column: ColumnRef,
	pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
	pub table: String,
	pub alias: String,
	pub joins: Vec<Join>,
	pub columns: Vec<SelectColumn>,
	pub condition: Option<Condition>,
	pub order_by: Vec<OrderTerm>,
	pub limit: Option<usize>,
	pub offset: usize,
}

/// Insert of one table row of an inheritance chain
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
	pub table: String,
	pub pk_column: String,
	/// Non-key columns
	pub values: Row,
}

/// Update or delete keyed by `key_column IN (keys)`
#[derive(Debug, Clone, PartialEq)]
pub enum WriteStatement {
	Update {
		table: String,
		assignments: Vec<(String, Value)>,
		key_column: String,
		keys: Vec<i64>,
	},
	Delete {
		table: String,
		key_column: String,
		keys: Vec<i64>,
	},
}

impl WriteStatement {
	pub fn table(&self) -> &str {
		match self {
			WriteStatement::Update { table, .. } | WriteStatement::Delete { table, .. } => table,
		}
	}
}

impl fmt::Display for WriteStatement {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			WriteStatement::Update {
				table,
				assignments,
				key_column,
				keys,
			} => {
				let sets: Vec<String> = assignments.iter().map(|(c, v)| format!("{} = {}", c, v)).collect();
				write!(f, "UPDATE {} SET {} WHERE {} IN {:?}", table, sets.join(", "), key_column, keys)
			}
			WriteStatement::Delete {
				table,
				key_column,
				keys,
			} => write!(f, "DELETE FROM {} WHERE {} IN {:?}", table, key_column, keys),
		}
	}
}

/// Column of a table schema
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
	pub name: String,
	pub kind: ColumnKind,
	pub nullable: bool,
	pub primary_key: bool,
	pub auto_increment: bool,
	pub unique: bool,
	/// `(table, column)` for enforced foreign keys
	pub references: Option<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
	pub name: String,
	pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
	pub fn pk_column(&self) -> Option<&ColumnSchema> {
		self.columns.iter().find(|c| c.primary_key)
	}
}
