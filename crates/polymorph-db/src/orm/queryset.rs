//! Lazy querysets
//!
//! A [`QuerySet`] collects filters and ordering and only talks to the
//! backend in its async terminal methods. Two seams let other layers change
//! its behavior without subclassing:
//!
//! - [`FilterTranslator`] rewrites filters and ordering before they are
//!   validated
//! - [`ResultIterable`] turns fetched rows into the instances returned to
//!   the caller

use super::compiler::QueryCompiler;
use super::connection::DatabaseConnection;
use super::instance::Instance;
use super::model::ModelMeta;
use super::query::Q;
use super::value::Value;
use crate::backends::statements::{SelectColumn, SelectQuery, WriteStatement};
use crate::polymorphic::collector::{DeletionOutcome, PolymorphicCollector};
use async_trait::async_trait;
use indexmap::IndexMap;
use polymorph_core::{Error, FieldError, Result};
use std::fmt;
use std::sync::Arc;

/// Upper bound on rows fetched by `get()`
const MAX_GET_RESULTS: usize = 21;

/// Turns the rows of the queried model into returned instances
#[async_trait]
pub trait ResultIterable: Send + Sync + fmt::Debug {
	fn is_polymorphic(&self) -> bool {
		false
	}

	async fn materialize(&self, queryset: &QuerySet, rows: Vec<Instance>) -> Result<Vec<Instance>>;
}

/// Returns rows as instances of the queried model
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelIterable;

#[async_trait]
impl ResultIterable for ModelIterable {
	async fn materialize(&self, _queryset: &QuerySet, rows: Vec<Instance>) -> Result<Vec<Instance>> {
		Ok(rows)
	}
}

/// Rewrites filter trees and ordering before compilation
pub trait FilterTranslator: Send + Sync + fmt::Debug {
	fn translate_filter(&self, conn: &DatabaseConnection, model: &ModelMeta, condition: Q) -> Result<Q>;

	fn translate_ordering(
		&self,
		conn: &DatabaseConnection,
		model: &ModelMeta,
		ordering: Vec<String>,
	) -> Result<Vec<String>>;
}

/// Leaves filters untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTranslator;

impl FilterTranslator for IdentityTranslator {
	fn translate_filter(&self, _conn: &DatabaseConnection, _model: &ModelMeta, condition: Q) -> Result<Q> {
		Ok(condition)
	}

	fn translate_ordering(
		&self,
		_conn: &DatabaseConnection,
		_model: &ModelMeta,
		ordering: Vec<String>,
	) -> Result<Vec<String>> {
		Ok(ordering)
	}
}

#[derive(Clone)]
pub struct QuerySet {
	conn: DatabaseConnection,
	model: Arc<ModelMeta>,
	conditions: Vec<Q>,
	ordering: Option<Vec<String>>,
	limit: Option<usize>,
	offset: usize,
	iterable: Arc<dyn ResultIterable>,
	translator: Arc<dyn FilterTranslator>,
}

impl fmt::Debug for QuerySet {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("QuerySet")
			.field("model", &self.model.label())
			.field("conditions", &self.conditions)
			.field("ordering", &self.ordering)
			.field("iterable", &self.iterable)
			.finish()
	}
}

impl QuerySet {
	pub fn new(conn: DatabaseConnection, model: Arc<ModelMeta>) -> Self {
		Self {
			conn,
			model,
			conditions: Vec::new(),
			ordering: None,
			limit: None,
			offset: 0,
			iterable: Arc::new(ModelIterable),
			translator: Arc::new(IdentityTranslator),
		}
	}

	pub fn model(&self) -> &Arc<ModelMeta> {
		&self.model
	}

	pub fn label(&self) -> String {
		self.model.label()
	}

	pub fn connection(&self) -> &DatabaseConnection {
		&self.conn
	}

	pub fn with_iterable(mut self, iterable: Arc<dyn ResultIterable>) -> Self {
		self.iterable = iterable;
		self
	}

	pub fn with_translator(mut self, translator: Arc<dyn FilterTranslator>) -> Self {
		self.translator = translator;
		self
	}

	pub fn iterable(&self) -> &Arc<dyn ResultIterable> {
		&self.iterable
	}

	pub fn translator(&self) -> &Arc<dyn FilterTranslator> {
		&self.translator
	}

	/// Whether fetched rows are upgraded to their concrete classes.
	pub fn is_polymorphic(&self) -> bool {
		self.iterable.is_polymorphic()
	}

	fn validate(&self, condition: &Q) -> Result<()> {
		QueryCompiler::new(self.conn.registry(), Arc::clone(&self.model)).compile_condition(condition)?;
		Ok(())
	}

	/// Narrow the queryset. Paths are resolved immediately, so unknown
	/// fields fail here rather than at fetch time.
	///
	/// # Examples
	///
	/// ```no_run
	/// # use polymorph_db::orm::{DatabaseConnection, Q};
	/// # async fn example(conn: DatabaseConnection) -> polymorph_core::Result<()> {
	/// let rows = conn
	///     .objects("tests.Model2A")?
	///     .filter(Q::new("field1__startswith", "B"))?
	///     .fetch()
	///     .await?;
	/// # Ok(())
	/// # }
	/// ```
	pub fn filter(mut self, condition: Q) -> Result<Self> {
		let condition = self.translator.translate_filter(&self.conn, &self.model, condition)?;
		self.validate(&condition)?;
		self.conditions.push(condition);
		Ok(self)
	}

	pub fn exclude(mut self, condition: Q) -> Result<Self> {
		let condition = self.translator.translate_filter(&self.conn, &self.model, condition)?;
		self.validate(&condition)?;
		self.conditions.push(Q::not(condition));
		Ok(self)
	}

	pub fn order_by<S: AsRef<str>>(mut self, ordering: &[S]) -> Result<Self> {
		let ordering: Vec<String> = ordering.iter().map(|s| s.as_ref().to_string()).collect();
		let ordering = self.translator.translate_ordering(&self.conn, &self.model, ordering)?;
		QueryCompiler::new(self.conn.registry(), Arc::clone(&self.model)).compile_ordering(&ordering)?;
		self.ordering = Some(ordering);
		Ok(self)
	}

	pub fn limit(mut self, limit: usize) -> Self {
		self.limit = Some(limit);
		self
	}

	pub fn offset(mut self, offset: usize) -> Self {
		self.offset = offset;
		self
	}

	/// Filters applied so far, as one tree.
	pub fn condition(&self) -> Option<Q> {
		match self.conditions.as_slice() {
			[] => None,
			[only] => Some(only.clone()),
			many => Some(Q::and(many.to_vec())),
		}
	}

	fn ordering_terms(&self) -> Vec<String> {
		match &self.ordering {
			Some(ordering) => ordering.clone(),
			None if !self.model.ordering.is_empty() => self.model.ordering.clone(),
			None => vec!["pk".to_string()],
		}
	}

	fn compile(&self, columns: impl FnOnce(&mut QueryCompiler<'_>) -> Result<Vec<SelectColumn>>) -> Result<SelectQuery> {
		let mut compiler = QueryCompiler::new(self.conn.registry(), Arc::clone(&self.model));
		let columns = columns(&mut compiler)?;
		let condition = self
			.condition()
			.map(|c| compiler.compile_condition(&c))
			.transpose()?;
		let order_by = compiler.compile_ordering(&self.ordering_terms())?;
		Ok(compiler.finish(columns, condition, order_by, self.limit, self.offset))
	}

	/// Rows of the queried model, without materialization.
	pub async fn fetch_base(&self) -> Result<Vec<Instance>> {
		let query = self.compile(|c| c.model_columns())?;
		let rows = self.conn.backend().select(&query).await?;
		Ok(rows
			.into_iter()
			.map(|row| Instance::from_row(Arc::clone(&self.model), row))
			.collect())
	}

	pub async fn fetch(&self) -> Result<Vec<Instance>> {
		let rows = self.fetch_base().await?;
		self.iterable.materialize(self, rows).await
	}

	pub async fn first(&self) -> Result<Option<Instance>> {
		Ok(self.clone().limit(1).fetch().await?.into_iter().next())
	}

	/// The single matching object.
	pub async fn get(&self) -> Result<Instance> {
		let mut found = self.clone().limit(MAX_GET_RESULTS).fetch().await?;
		match found.len() {
			0 => Err(Error::DoesNotExist {
				model: self.model.name.clone(),
			}),
			1 => Ok(found.remove(0)),
			count => Err(Error::MultipleObjectsReturned {
				model: self.model.name.clone(),
				count,
			}),
		}
	}

	pub async fn get_pk(&self, pk: i64) -> Result<Instance> {
		self.clone().filter(Q::pk_in([pk]))?.get().await
	}

	pub async fn pks(&self) -> Result<Vec<i64>> {
		Ok(self
			.values_list(&["pk"])
			.await?
			.into_iter()
			.filter_map(|row| row.first().and_then(Value::as_i64))
			.collect())
	}

	pub async fn count(&self) -> Result<usize> {
		Ok(self.pks().await?.len())
	}

	pub async fn exists(&self) -> Result<bool> {
		Ok(!self.clone().limit(1).pks().await?.is_empty())
	}

	/// Values of `paths` for each row, in queryset order.
	pub async fn values_list(&self, paths: &[&str]) -> Result<Vec<Vec<Value>>> {
		let query = self.compile(|c| c.path_columns(paths))?;
		let rows = self.conn.backend().select(&query).await?;
		Ok(rows
			.into_iter()
			.map(|row| paths.iter().map(|p| row.get(*p).cloned().unwrap_or_default()).collect())
			.collect())
	}

	/// Assign fields on every matching row. Returns the number of rows.
	pub async fn update(&self, assignments: Vec<(&str, Value)>) -> Result<u64> {
		let registry = self.conn.registry();
		let label = self.model.label();
		let mut per_table: IndexMap<String, (String, Vec<(String, Value)>)> = IndexMap::new();
		for (name, value) in assignments {
			let Some((owner, field)) = registry.find_field(&label, name)? else {
				return Err(FieldError::DoesNotExist {
					model: self.model.name.clone(),
					field: name.to_string(),
					choices: String::new(),
					suggestion: None,
				}
				.into());
			};
			if field.primary_key {
				return Err(Error::Validation(format!("cannot update primary key '{}'", field.name)));
			}
			per_table
				.entry(owner.db_table.clone())
				.or_insert_with(|| (owner.pk_column().to_string(), Vec::new()))
				.1
				.push((field.column.clone(), value));
		}

		let pks = self.pks().await?;
		if pks.is_empty() || per_table.is_empty() {
			return Ok(0);
		}
		let statements: Vec<WriteStatement> = per_table
			.into_iter()
			.map(|(table, (key_column, assignments))| WriteStatement::Update {
				table,
				assignments,
				key_column,
				keys: pks.clone(),
			})
			.collect();
		self.conn.backend().execute(&statements).await?;
		Ok(pks.len() as u64)
	}

	/// Delete every matching object and what depends on it.
	pub async fn delete(&self) -> Result<DeletionOutcome> {
		PolymorphicCollector::new(self.conn.clone())
			.add_queryset(self.clone())
			.await?
			.execute()
			.await
	}
}
