//! In-memory backend
//!
//! Tables live behind a `parking_lot` lock. Every write batch runs against a
//! copy of the tables that replaces the original only when the whole batch
//! succeeded, which gives all-or-nothing semantics without a journal.

use super::statements::{
	ColumnRef, Condition, InsertStatement, JoinKind, SelectQuery, TableSchema, WriteStatement,
};
use super::Backend;
use crate::orm::query::FilterOperator;
use crate::orm::value::{Row, Value};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use polymorph_core::{Error, Result};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

/// When foreign keys are checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConstraintMode {
	/// At the end of each batch (`DEFERRABLE INITIALLY DEFERRED`)
	#[default]
	Deferred,
	/// After every statement
	Immediate,
}

#[derive(Debug, Clone)]
struct Table {
	schema: TableSchema,
	pk_column: String,
	rows: BTreeMap<i64, Row>,
	last_id: i64,
}

#[derive(Debug, Clone, Default)]
struct State {
	tables: IndexMap<String, Table>,
}

impl State {
	fn table(&self, name: &str) -> Result<&Table> {
		self.tables
			.get(name)
			.ok_or_else(|| Error::Database(format!("no such table: {}", name)))
	}

	fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
		self.tables
			.get_mut(name)
			.ok_or_else(|| Error::Database(format!("no such table: {}", name)))
	}

	fn check_foreign_keys(&self) -> Result<()> {
		for table in self.tables.values() {
			for column in &table.schema.columns {
				let Some((target, target_column)) = &column.references else {
					continue;
				};
				let target = self.table(target)?;
				for row in table.rows.values() {
					let value = row.get(&column.name).cloned().unwrap_or_default();
					if value.is_null() {
						continue;
					}
					let found = if *target_column == target.pk_column {
						value.as_i64().is_some_and(|k| target.rows.contains_key(&k))
					} else {
						target
							.rows
							.values()
							.any(|r| r.get(target_column).is_some_and(|v| v.sql_eq(&value) == Some(true)))
					};
					if !found {
						return Err(Error::Integrity(format!(
							"FOREIGN KEY constraint failed: {}.{} = {}",
							table.schema.name, column.name, value
						)));
					}
				}
			}
		}
		Ok(())
	}
}

/// Backend keeping every table in process memory
///
/// # Examples
///
/// ```
/// use polymorph_db::backends::{ConstraintMode, MemoryBackend};
///
/// let backend = MemoryBackend::new().with_constraint_mode(ConstraintMode::Immediate);
/// assert_eq!(backend.select_count(), 0);
/// ```
#[derive(Debug, Default)]
pub struct MemoryBackend {
	state: RwLock<State>,
	mode: ConstraintMode,
	log: Mutex<Vec<String>>,
	selects: AtomicUsize,
}

impl MemoryBackend {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_constraint_mode(mut self, mode: ConstraintMode) -> Self {
		self.mode = mode;
		self
	}

	/// Write statements executed so far, in order.
	pub fn statements(&self) -> Vec<String> {
		self.log.lock().clone()
	}

	pub fn clear_log(&self) {
		self.log.lock().clear();
		self.selects.store(0, AtomicOrdering::SeqCst);
	}

	/// Number of selects executed since the last [`clear_log`](Self::clear_log).
	pub fn select_count(&self) -> usize {
		self.selects.load(AtomicOrdering::SeqCst)
	}

	/// Rows currently stored in `table`.
	pub fn table_len(&self, table: &str) -> usize {
		self.state.read().tables.get(table).map(|t| t.rows.len()).unwrap_or(0)
	}

	fn apply_write(state: &mut State, statement: &WriteStatement) -> Result<u64> {
		match statement {
			WriteStatement::Update {
				table,
				assignments,
				key_column,
				keys,
			} => {
				let table = state.table_mut(table)?;
				let pk_column = table.pk_column.clone();
				let mut affected = 0;
				for row in table.rows.values_mut() {
					let key = row.get(key_column).and_then(Value::as_i64);
					if key.is_some_and(|k| keys.contains(&k)) {
						for (column, value) in assignments {
							if *column == pk_column {
								return Err(Error::Database("updating a primary key is not supported".to_string()));
							}
							row.insert(column.clone(), value.clone());
						}
						affected += 1;
					}
				}
				Ok(affected)
			}
			WriteStatement::Delete {
				table,
				key_column,
				keys,
			} => {
				let table = state.table_mut(table)?;
				let before = table.rows.len();
				let key_column = key_column.clone();
				table
					.rows
					.retain(|_, row| !row.get(&key_column).and_then(Value::as_i64).is_some_and(|k| keys.contains(&k)));
				Ok((before - table.rows.len()) as u64)
			}
		}
	}

	fn check_not_null(table: &Table, row: &Row) -> Result<()> {
		for column in &table.schema.columns {
			if !column.nullable && row.get(&column.name).is_none_or(Value::is_null) {
				return Err(Error::Integrity(format!(
					"NOT NULL constraint failed: {}.{}",
					table.schema.name, column.name
				)));
			}
		}
		Ok(())
	}
}

#[async_trait]
impl Backend for MemoryBackend {
	fn vendor(&self) -> &'static str {
		"memory"
	}

	async fn create_table(&self, schema: &TableSchema) -> Result<()> {
		let mut state = self.state.write();
		if state.tables.contains_key(&schema.name) {
			return Ok(());
		}
		let pk_column = schema
			.pk_column()
			.map(|c| c.name.clone())
			.ok_or_else(|| Error::Database(format!("table {} has no primary key", schema.name)))?;
		state.tables.insert(
			schema.name.clone(),
			Table {
				schema: schema.clone(),
				pk_column,
				rows: BTreeMap::new(),
				last_id: 0,
			},
		);
		Ok(())
	}

	async fn select(&self, query: &SelectQuery) -> Result<Vec<Row>> {
		self.selects.fetch_add(1, AtomicOrdering::SeqCst);
		let state = self.state.read();
		evaluate(&state, query)
	}

	async fn insert(&self, chain: &[InsertStatement], pk: Option<i64>) -> Result<i64> {
		let mut guard = self.state.write();
		let mut state = guard.clone();
		let mut key = pk;
		let mut entries = Vec::with_capacity(chain.len());

		for statement in chain {
			let table = state.table_mut(&statement.table)?;
			let id = match key {
				Some(id) => id,
				None => table.last_id.max(table.rows.keys().next_back().copied().unwrap_or(0)) + 1,
			};
			if table.rows.contains_key(&id) {
				return Err(Error::Integrity(format!(
					"UNIQUE constraint failed: {}.{}",
					table.schema.name, table.pk_column
				)));
			}
			table.last_id = table.last_id.max(id);
			let mut row = Row::new();
			for column in &table.schema.columns {
				let value = if column.name == table.pk_column {
					Value::Int(id)
				} else {
					statement.values.get(&column.name).cloned().unwrap_or_default()
				};
				row.insert(column.name.clone(), value);
			}
			Self::check_not_null(table, &row)?;
			table.rows.insert(id, row);
			key = Some(id);
			entries.push(format!("INSERT INTO {} ({})", statement.table, id));
			if self.mode == ConstraintMode::Immediate {
				state.check_foreign_keys()?;
			}
		}

		state.check_foreign_keys()?;
		self.log.lock().extend(entries);
		*guard = state;
		key.ok_or_else(|| Error::Database("empty insert chain".to_string()))
	}

	async fn execute(&self, statements: &[WriteStatement]) -> Result<Vec<u64>> {
		let mut guard = self.state.write();
		let mut state = guard.clone();
		let mut affected = Vec::with_capacity(statements.len());

		for statement in statements {
			affected.push(Self::apply_write(&mut state, statement)?);
			if self.mode == ConstraintMode::Immediate {
				state.check_foreign_keys()?;
			}
		}

		state.check_foreign_keys()?;
		self.log.lock().extend(statements.iter().map(ToString::to_string));
		*guard = state;
		Ok(affected)
	}
}

fn evaluate(state: &State, query: &SelectQuery) -> Result<Vec<Row>> {
	let base = state.table(&query.table)?;
	let mut aliases: Vec<&str> = vec![query.alias.as_str()];
	let mut bindings: Vec<Vec<Option<&Row>>> = base.rows.values().map(|row| vec![Some(row)]).collect();

	for join in &query.joins {
		let table = state.table(&join.table)?;
		let left = alias_index(&aliases, &join.left)?;
		let mut next = Vec::with_capacity(bindings.len());
		for binding in bindings {
			let value = binding[left]
				.and_then(|row| row.get(&join.left.column))
				.cloned()
				.unwrap_or_default();
			let matches: Vec<&Row> = if value.is_null() {
				Vec::new()
			} else if join.column == table.pk_column {
				value.as_i64().and_then(|k| table.rows.get(&k)).into_iter().collect()
			} else {
				table
					.rows
					.values()
					.filter(|row| row.get(&join.column).is_some_and(|v| v.sql_eq(&value) == Some(true)))
					.collect()
			};
			if matches.is_empty() {
				if join.kind == JoinKind::Left {
					let mut extended = binding.clone();
					extended.push(None);
					next.push(extended);
				}
			} else {
				for row in matches {
					let mut extended = binding.clone();
					extended.push(Some(row));
					next.push(extended);
				}
			}
		}
		bindings = next;
		aliases.push(join.alias.as_str());
	}

	if let Some(condition) = &query.condition {
		let mut kept = Vec::with_capacity(bindings.len());
		for binding in bindings {
			if eval(condition, &aliases, &binding)? == Some(true) {
				kept.push(binding);
			}
		}
		bindings = kept;
	}

	if !query.order_by.is_empty() {
		let mut keyed = Vec::with_capacity(bindings.len());
		for binding in bindings {
			let keys = query
				.order_by
				.iter()
				.map(|term| lookup(&aliases, &binding, &term.column))
				.collect::<Result<Vec<_>>>()?;
			keyed.push((keys, binding));
		}
		keyed.sort_by(|(a, _), (b, _)| {
			for (term, (x, y)) in query.order_by.iter().zip(a.iter().zip(b.iter())) {
				let ordering = x.order_cmp(y);
				let ordering = if term.descending { ordering.reverse() } else { ordering };
				if ordering != Ordering::Equal {
					return ordering;
				}
			}
			Ordering::Equal
		});
		bindings = keyed.into_iter().map(|(_, b)| b).collect();
	}

	let mut out = Vec::new();
	for binding in bindings.into_iter().skip(query.offset).take(query.limit.unwrap_or(usize::MAX)) {
		let mut row = Row::new();
		for column in &query.columns {
			row.insert(column.name.clone(), lookup(&aliases, &binding, &column.source)?);
		}
		out.push(row);
	}
	Ok(out)
}

fn alias_index(aliases: &[&str], column: &ColumnRef) -> Result<usize> {
	aliases
		.iter()
		.position(|a| *a == column.alias)
		.ok_or_else(|| Error::Database(format!("unknown table alias: {}", column.alias)))
}

fn lookup(aliases: &[&str], binding: &[Option<&Row>], column: &ColumnRef) -> Result<Value> {
	let index = alias_index(aliases, column)?;
	Ok(binding[index]
		.and_then(|row| row.get(&column.column))
		.cloned()
		.unwrap_or_default())
}

/// SQL three-valued evaluation
fn eval(condition: &Condition, aliases: &[&str], binding: &[Option<&Row>]) -> Result<Option<bool>> {
	Ok(match condition {
		Condition::Compare {
			column,
			operator,
			values,
		} => {
			let value = lookup(aliases, binding, column)?;
			compare(&value, *operator, values)
		}
		Condition::And(items) => {
			let mut result = Some(true);
			for item in items {
				match eval(item, aliases, binding)? {
					Some(false) => return Ok(Some(false)),
					None => result = None,
					Some(true) => {}
				}
			}
			result
		}
		Condition::Or(items) => {
			let mut result = Some(false);
			for item in items {
				match eval(item, aliases, binding)? {
					Some(true) => return Ok(Some(true)),
					None => result = None,
					Some(false) => {}
				}
			}
			result
		}
		Condition::Not(inner) => eval(inner, aliases, binding)?.map(|b| !b),
	})
}

fn compare(value: &Value, operator: FilterOperator, values: &[Value]) -> Option<bool> {
	let rhs = values.first().cloned().unwrap_or_default();
	let text = |v: &Value| match v {
		Value::Null => None,
		other => Some(other.to_string()),
	};
	match operator {
		FilterOperator::Eq => value.sql_eq(&rhs),
		FilterOperator::Ne => value.sql_eq(&rhs).map(|b| !b),
		FilterOperator::Gt => value.sql_cmp(&rhs).map(|o| o == Ordering::Greater),
		FilterOperator::Gte => value.sql_cmp(&rhs).map(|o| o != Ordering::Less),
		FilterOperator::Lt => value.sql_cmp(&rhs).map(|o| o == Ordering::Less),
		FilterOperator::Lte => value.sql_cmp(&rhs).map(|o| o != Ordering::Greater),
		FilterOperator::In => in_list(value, values),
		FilterOperator::NotIn => in_list(value, values).map(|b| !b),
		FilterOperator::Contains => Some(text(value)?.contains(&text(&rhs)?)),
		FilterOperator::IContains => Some(text(value)?.to_lowercase().contains(&text(&rhs)?.to_lowercase())),
		FilterOperator::StartsWith => Some(text(value)?.starts_with(&text(&rhs)?)),
		FilterOperator::EndsWith => Some(text(value)?.ends_with(&text(&rhs)?)),
		FilterOperator::IsNull => Some(value.is_null()),
		FilterOperator::IsNotNull => Some(!value.is_null()),
	}
}

fn in_list(value: &Value, values: &[Value]) -> Option<bool> {
	if value.is_null() {
		return None;
	}
	let mut unknown = false;
	for candidate in values {
		match value.sql_eq(candidate) {
			Some(true) => return Some(true),
			None => unknown = true,
			Some(false) => {}
		}
	}
	if unknown { None } else { Some(false) }
}
