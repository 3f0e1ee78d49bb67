//! Polymorphic deletion collector
//!
//! [`PolymorphicCollector`] drives the relation walk of
//! [`Collector`](crate::orm::Collector) and turns its result into an ordered
//! [`DeletionPlan`] that runs as one backend batch.
//!
//! ```text
//! Collecting ──> Ordering ──> Executing ──> Done
//!     │                           │
//!     └──────────> Aborted <──────┘
//! ```
//!
//! A protected or restricted object aborts the walk before anything is
//! written. A backend failure during execution rolls the batch back.

use crate::backends::statements::WriteStatement;
use crate::orm::{Collector, DatabaseConnection, FieldUpdate, Instance, ModelIterable, QuerySet, Value};
use indexmap::{IndexMap, IndexSet};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use polymorph_core::{Error, Result, signals};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Lifecycle of a [`PolymorphicCollector`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectorState {
	Collecting,
	Ordering,
	Executing,
	Done,
	Aborted,
}

impl fmt::Display for CollectorState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			CollectorState::Collecting => "collecting",
			CollectorState::Ordering => "ordering",
			CollectorState::Executing => "executing",
			CollectorState::Done => "done",
			CollectorState::Aborted => "aborted",
		};
		f.write_str(name)
	}
}

/// Rows of one model deleted by one statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteBatch {
	pub model: String,
	pub table: String,
	pub key_column: String,
	pub pks: Vec<i64>,
}

/// Discriminator reassignment for a row whose subclass rows are removed
/// while its ancestors are kept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtypeRewrite {
	/// Model the remaining row now belongs to
	pub model: String,
	pub table: String,
	pub key_column: String,
	pub column: String,
	pub pk: i64,
	pub content_type: i64,
}

/// Ordered work of one delete call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeletionPlan {
	pub field_updates: Vec<FieldUpdate>,
	/// In execution order: rows are removed before the rows they reference
	pub batches: Vec<DeleteBatch>,
	pub ctype_rewrites: Vec<CtypeRewrite>,
}

impl DeletionPlan {
	pub fn is_empty(&self) -> bool {
		self.field_updates.is_empty() && self.batches.is_empty() && self.ctype_rewrites.is_empty()
	}

	/// Models with rows to delete, in deletion order.
	pub fn models(&self) -> Vec<&str> {
		let mut out: Vec<&str> = Vec::new();
		for batch in &self.batches {
			if !out.contains(&batch.model.as_str()) {
				out.push(&batch.model);
			}
		}
		out
	}

	/// Total number of rows scheduled for deletion
	pub fn row_count(&self) -> usize {
		self.batches.iter().map(|b| b.pks.len()).sum()
	}
}

/// Result of an executed delete
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionOutcome {
	/// Rows deleted across every table
	pub total: u64,
	/// Rows deleted per model label, in deletion order
	pub per_model: IndexMap<String, u64>,
	/// Rows changed by on-delete field updates
	pub updated: u64,
}

/// Deletion entry point for instances and querysets.
///
/// # Examples
///
/// ```no_run
/// use polymorph_db::polymorphic::{CollectorState, PolymorphicCollector};
/// # use polymorph_db::orm::DatabaseConnection;
///
/// # async fn example(conn: DatabaseConnection) -> polymorph_core::Result<()> {
/// let collector = PolymorphicCollector::new(conn.clone())
///     .add_queryset(conn.objects("tests.Model2A")?)
///     .await?;
/// let plan = collector.plan()?;
/// println!("{} rows", plan.row_count());
/// let outcome = collector.execute().await?;
/// # Ok(())
/// # }
/// ```
pub struct PolymorphicCollector {
	conn: DatabaseConnection,
	keep_parents: bool,
	state: CollectorState,
	inner: Collector,
	roots: Vec<Instance>,
}

impl fmt::Debug for PolymorphicCollector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PolymorphicCollector")
			.field("state", &self.state)
			.field("keep_parents", &self.keep_parents)
			.field("inner", &self.inner)
			.finish()
	}
}

impl PolymorphicCollector {
	pub fn new(conn: DatabaseConnection) -> Self {
		Self {
			inner: Collector::new(conn.clone()),
			conn,
			keep_parents: false,
			state: CollectorState::Collecting,
			roots: Vec::new(),
		}
	}

	/// Keep the ancestor rows of the roots and point their discriminator
	/// at the direct parent class.
	pub fn keep_parents(mut self, keep_parents: bool) -> Self {
		self.keep_parents = keep_parents;
		self
	}

	pub fn state(&self) -> CollectorState {
		self.state
	}

	/// The underlying walk state.
	pub fn collector(&self) -> &Collector {
		&self.inner
	}

	fn transition(&mut self, to: CollectorState) {
		tracing::debug!(from = %self.state, to = %to, "deletion collector state");
		self.state = to;
	}

	fn ensure_state(&self, expected: CollectorState) -> Result<()> {
		if self.state == expected {
			Ok(())
		} else {
			Err(Error::Transaction(format!(
				"deletion collector is {}, expected {}",
				self.state, expected
			)))
		}
	}

	/// Add root objects. Every root must be saved.
	pub async fn add_instances(mut self, instances: Vec<Instance>) -> Result<Self> {
		self.ensure_state(CollectorState::Collecting)?;
		if let Some(unsaved) = instances.iter().find(|instance| instance.pk().is_none()) {
			let error = Error::Validation(format!(
				"{} object can't be deleted because its {} attribute is not set",
				unsaved.model_name(),
				unsaved.meta().pk_attname()
			));
			self.transition(CollectorState::Aborted);
			return Err(error);
		}
		self.roots.extend(instances.iter().cloned());
		self.inner.add_roots(instances, self.keep_parents);
		self.collect().await?;
		Ok(self)
	}

	/// Collect every row of `queryset`, seen at the queryset's own level.
	pub async fn add_queryset(self, queryset: QuerySet) -> Result<Self> {
		self.ensure_state(CollectorState::Collecting)?;
		let instances = queryset.with_iterable(Arc::new(ModelIterable)).fetch().await?;
		self.add_instances(instances).await
	}

	async fn collect(&mut self) -> Result<()> {
		let walked = match self.inner.run().await {
			Ok(()) => self.inner.check_blocked(),
			Err(e) => Err(e),
		};
		if let Err(e) = walked {
			self.transition(CollectorState::Aborted);
			return Err(e);
		}
		Ok(())
	}

	/// Models in deletion order: a model comes after every model whose rows
	/// must go first. Models on a dependency cycle keep collection order.
	fn sorted_models(&self) -> Vec<String> {
		let data = self.inner.data();
		let mut graph: DiGraph<String, ()> = DiGraph::new();
		let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
		for label in data.keys() {
			nodes.insert(label.as_str(), graph.add_node(label.clone()));
		}
		for (model, dependencies) in self.inner.dependencies() {
			let Some(&to) = nodes.get(model.as_str()) else { continue };
			for dependency in dependencies {
				if let Some(&from) = nodes.get(dependency.as_str()) {
					graph.add_edge(from, to, ());
				}
			}
		}

		let position = |label: &str| data.get_index_of(label).unwrap_or(usize::MAX);
		let mut units: Vec<Vec<String>> = tarjan_scc(&graph)
			.into_iter()
			.map(|scc| {
				let mut labels: Vec<String> = scc.into_iter().map(|n| graph[n].clone()).collect();
				labels.sort_by_key(|l| position(l));
				labels
			})
			.collect();
		units.sort_by_key(|unit| unit.first().map(|l| position(l)).unwrap_or(usize::MAX));

		let empty = IndexSet::new();
		let mut sorted: Vec<String> = Vec::with_capacity(data.len());
		let mut done = vec![false; units.len()];
		while sorted.len() < data.len() {
			let mut progressed = false;
			for (i, unit) in units.iter().enumerate() {
				if done[i] {
					continue;
				}
				let ready = unit.iter().all(|model| {
					self.inner
						.dependencies()
						.get(model)
						.unwrap_or(&empty)
						.iter()
						.all(|dep| unit.contains(dep) || sorted.contains(dep) || !data.contains_key(dep))
				});
				if ready {
					sorted.extend(unit.iter().cloned());
					done[i] = true;
					progressed = true;
				}
			}
			if !progressed {
				// Cannot happen once cycles are condensed.
				for (i, unit) in units.iter().enumerate() {
					if !done[i] {
						sorted.extend(unit.iter().cloned());
						done[i] = true;
					}
				}
			}
		}
		sorted
	}

	/// The ordered plan for what has been collected so far.
	pub fn plan(&self) -> Result<DeletionPlan> {
		let registry = self.conn.registry();
		let batch_size = self.conn.settings().delete_batch_size.max(1);

		let mut batches = Vec::new();
		for label in self.sorted_models() {
			let Some(instances) = self.inner.data().get(&label) else { continue };
			let meta = registry.get(&label)?;
			let mut pks: Vec<i64> = instances.keys().copied().collect();
			pks.sort_unstable();
			for chunk in pks.chunks(batch_size) {
				batches.push(DeleteBatch {
					model: label.clone(),
					table: meta.db_table.clone(),
					key_column: meta.pk_column().to_string(),
					pks: chunk.to_vec(),
				});
			}
		}

		Ok(DeletionPlan {
			field_updates: self.inner.field_updates().to_vec(),
			batches,
			ctype_rewrites: self.ctype_rewrites()?,
		})
	}

	fn ctype_rewrites(&self) -> Result<Vec<CtypeRewrite>> {
		if !self.keep_parents {
			return Ok(Vec::new());
		}
		let registry = self.conn.registry();
		let mut out: Vec<CtypeRewrite> = Vec::new();
		for root in &self.roots {
			let Some(pk) = root.pk() else { continue };
			let Some(parent) = registry.parent(&root.label())? else {
				continue;
			};
			if !parent.polymorphic {
				continue;
			}
			let Some(base) = registry.polymorphic_base(&parent.label())? else {
				continue;
			};
			let Some(field) = base.local_field(super::hook::CTYPE_FIELD) else {
				continue;
			};
			let content_type = self.conn.content_types().get_for_model(&parent.label())?;
			let rewrite = CtypeRewrite {
				model: parent.label(),
				table: base.db_table.clone(),
				key_column: base.pk_column().to_string(),
				column: field.column.clone(),
				pk,
				content_type: content_type.id,
			};
			if !out.contains(&rewrite) {
				out.push(rewrite);
			}
		}
		Ok(out)
	}

	fn statements(&self, plan: &DeletionPlan) -> Result<Vec<WriteStatement>> {
		let registry = self.conn.registry();
		let batch_size = self.conn.settings().delete_batch_size.max(1);
		let mut statements = Vec::new();
		for update in &plan.field_updates {
			let meta = registry.get(&update.model)?;
			let pks: Vec<i64> = update.pks.iter().copied().collect();
			for chunk in pks.chunks(batch_size) {
				statements.push(WriteStatement::Update {
					table: meta.db_table.clone(),
					assignments: vec![(update.column.clone(), update.value.clone())],
					key_column: meta.pk_column().to_string(),
					keys: chunk.to_vec(),
				});
			}
		}
		for batch in &plan.batches {
			statements.push(WriteStatement::Delete {
				table: batch.table.clone(),
				key_column: batch.key_column.clone(),
				keys: batch.pks.clone(),
			});
		}
		for rewrite in &plan.ctype_rewrites {
			statements.push(WriteStatement::Update {
				table: rewrite.table.clone(),
				assignments: vec![(rewrite.column.clone(), Value::Int(rewrite.content_type))],
				key_column: rewrite.key_column.clone(),
				keys: vec![rewrite.pk],
			});
		}
		Ok(statements)
	}

	fn planned_instances<'a>(&'a self, plan: &'a DeletionPlan) -> impl Iterator<Item = &'a Instance> + 'a {
		plan.models().into_iter().flat_map(move |label| {
			self.inner
				.data()
				.get(label)
				.into_iter()
				.flat_map(|instances| instances.values())
				.filter(|instance| !instance.meta().auto_created)
		})
	}

	/// Apply the plan in one atomic backend batch.
	pub async fn execute(mut self) -> Result<DeletionOutcome> {
		self.ensure_state(CollectorState::Collecting)?;
		self.transition(CollectorState::Ordering);
		let plan = match self.plan() {
			Ok(plan) => plan,
			Err(e) => {
				self.transition(CollectorState::Aborted);
				return Err(e);
			}
		};
		let statements = match self.statements(&plan) {
			Ok(statements) => statements,
			Err(e) => {
				self.transition(CollectorState::Aborted);
				return Err(e);
			}
		};

		for instance in self.planned_instances(&plan) {
			signals::pre_delete::<Instance>().send(&instance.label(), instance);
		}

		self.transition(CollectorState::Executing);
		let affected = if statements.is_empty() {
			Vec::new()
		} else {
			match self.conn.backend().execute(&statements).await {
				Ok(affected) => affected,
				Err(e) => {
					self.transition(CollectorState::Aborted);
					return Err(e);
				}
			}
		};

		let mut outcome = DeletionOutcome::default();
		let update_count: usize = statements
			.iter()
			.take_while(|s| matches!(s, WriteStatement::Update { .. }))
			.count();
		outcome.updated = affected.iter().take(update_count).sum();
		for (batch, rows) in plan.batches.iter().zip(affected.iter().skip(update_count)) {
			tracing::debug!(model = %batch.model, table = %batch.table, rows, "deleted batch");
			*outcome.per_model.entry(batch.model.clone()).or_default() += rows;
			outcome.total += rows;
		}

		for instance in self.planned_instances(&plan) {
			signals::post_delete::<Instance>().send(&instance.label(), instance);
		}
		self.transition(CollectorState::Done);
		Ok(outcome)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backends::MemoryBackend;
	use crate::orm::{Field, ModelDef, ModelRegistry, OnDelete, Q};
	use crate::polymorphic::PolymorphicHook;
	use polymorph_conf::PolymorphicSettings;
	use rstest::{fixture, rstest};

	struct Fixture {
		conn: DatabaseConnection,
		backend: Arc<MemoryBackend>,
	}

	#[fixture]
	async fn fixture() -> Fixture {
		let registry = ModelRegistry::builder()
			.hook(PolymorphicHook::new())
			.model(ModelDef::new("tests", "Model2A").polymorphic().field(Field::char("field1", 30)))
			.model(ModelDef::new("tests", "Model2B").parent("Model2A").field(Field::char("field2", 30)))
			.model(ModelDef::new("tests", "Model2C").parent("Model2B").field(Field::char("field3", 30)))
			.model(ModelDef::new("tests", "Guard").field(Field::foreign_key("target", "Model2A", OnDelete::Protect).null()))
			.build()
			.unwrap();
		let backend = Arc::new(MemoryBackend::new());
		let conn = DatabaseConnection::new(backend.clone(), Arc::new(registry), PolymorphicSettings::default());
		conn.migrate().await.unwrap();
		Fixture { conn, backend }
	}

	#[rstest]
	#[tokio::test]
	async fn test_children_are_deleted_before_parents(#[future] fixture: Fixture) {
		// Arrange
		let Fixture { conn, .. } = fixture.await;
		let c = conn
			.create("tests.Model2C", vec![("field1", "C1".into()), ("field2", "C2".into()), ("field3", "C3".into())])
			.await
			.unwrap();

		// Act
		let collector = PolymorphicCollector::new(conn.clone()).add_instances(vec![c]).await.unwrap();
		let plan = collector.plan().unwrap();

		// Assert
		assert_eq!(collector.state(), CollectorState::Collecting);
		assert_eq!(plan.models(), vec!["tests.Model2C", "tests.Model2B", "tests.Model2A"]);
		assert_eq!(plan.row_count(), 3);
	}

	#[rstest]
	#[tokio::test]
	async fn test_execute_reports_per_model_counts(#[future] fixture: Fixture) {
		// Arrange
		let Fixture { conn, backend } = fixture.await;
		let b = conn
			.create("tests.Model2B", vec![("field1", "B1".into()), ("field2", "B2".into())])
			.await
			.unwrap();

		// Act
		let outcome = b.delete(&conn, false).await.unwrap();

		// Assert
		assert_eq!(outcome.total, 2);
		assert_eq!(outcome.per_model.get("tests.Model2B"), Some(&1));
		assert_eq!(outcome.per_model.get("tests.Model2A"), Some(&1));
		assert_eq!(backend.table_len("tests_model2a"), 0);
		assert_eq!(backend.table_len("tests_model2b"), 0);
	}

	#[rstest]
	#[tokio::test]
	async fn test_protected_reference_aborts_before_any_write(#[future] fixture: Fixture) {
		// Arrange
		let Fixture { conn, backend } = fixture.await;
		let a = conn.create("tests.Model2A", vec![("field1", "A1".into())]).await.unwrap();
		conn.create("tests.Guard", vec![("target", Value::Int(a.pk().unwrap()))])
			.await
			.unwrap();
		backend.clear_log();

		// Act
		let result = PolymorphicCollector::new(conn.clone()).add_instances(vec![a]).await;

		// Assert
		let err = result.unwrap_err();
		assert!(matches!(err, Error::Protected(_)));
		assert_eq!(err.blocking_objects().len(), 1);
		assert!(backend.statements().iter().all(|s| !s.starts_with("DELETE")));
		assert_eq!(backend.table_len("tests_model2a"), 1);
	}

	#[rstest]
	#[tokio::test]
	async fn test_unsaved_root_is_rejected(#[future] fixture: Fixture) {
		// Arrange
		let Fixture { conn, backend } = fixture.await;
		conn.create("tests.Model2B", vec![("field1", "B1".into()), ("field2", "B2".into())])
			.await
			.unwrap();
		let unsaved = Instance::new(conn.registry(), "tests.Model2B").unwrap();
		backend.clear_log();

		// Act
		let result = unsaved.delete(&conn, false).await;

		// Assert
		let Err(Error::Validation(message)) = result else {
			panic!("expected a validation error, got {:?}", result);
		};
		assert!(message.contains("can't be deleted"));
		assert!(backend.statements().is_empty());
		assert_eq!(backend.table_len("tests_model2b"), 1);
	}

	#[rstest]
	#[tokio::test]
	async fn test_batches_respect_delete_batch_size(#[future] fixture: Fixture) {
		// Arrange
		let Fixture { conn, .. } = fixture.await;
		let conn = DatabaseConnection::new(
			conn.backend().clone(),
			conn.registry().clone(),
			PolymorphicSettings::default().with_delete_batch_size(2),
		);
		conn.migrate().await.unwrap();
		for i in 0..5 {
			conn.create("tests.Model2A", vec![("field1", format!("A{}", i).into())]).await.unwrap();
		}

		// Act
		let collector = PolymorphicCollector::new(conn.clone())
			.add_queryset(conn.objects("tests.Model2A").unwrap())
			.await
			.unwrap();
		let plan = collector.plan().unwrap();

		// Assert
		let sizes: Vec<usize> = plan.batches.iter().map(|b| b.pks.len()).collect();
		assert_eq!(sizes, vec![2, 2, 1]);
	}

	#[rstest]
	#[tokio::test]
	async fn test_keep_parents_rewrites_discriminator(#[future] fixture: Fixture) {
		// Arrange
		let Fixture { conn, .. } = fixture.await;
		let c = conn
			.create("tests.Model2C", vec![("field1", "C1".into()), ("field2", "C2".into()), ("field3", "C3".into())])
			.await
			.unwrap();
		let pk = c.pk().unwrap();

		// Act
		let collector = PolymorphicCollector::new(conn.clone())
			.keep_parents(true)
			.add_instances(vec![c])
			.await
			.unwrap();
		let plan = collector.plan().unwrap();

		// Assert
		assert_eq!(plan.models(), vec!["tests.Model2C"]);
		let middle = conn.content_types().get_for_model("tests.Model2B").unwrap();
		assert_eq!(plan.ctype_rewrites.len(), 1);
		assert_eq!(plan.ctype_rewrites[0].pk, pk);
		assert_eq!(plan.ctype_rewrites[0].content_type, middle.id);
		assert_eq!(plan.ctype_rewrites[0].table, "tests_model2a");
	}

	#[rstest]
	#[tokio::test]
	async fn test_executed_collector_cannot_be_reused(#[future] fixture: Fixture) {
		// Arrange
		let Fixture { conn, .. } = fixture.await;
		let a = conn.create("tests.Model2A", vec![("field1", "A1".into())]).await.unwrap();
		let mut collector = PolymorphicCollector::new(conn.clone());
		collector.transition(CollectorState::Done);

		// Act
		let result = collector.add_instances(vec![a]).await;

		// Assert
		assert!(matches!(result, Err(Error::Transaction(_))));
	}

	#[rstest]
	#[tokio::test]
	async fn test_empty_queryset_deletes_nothing(#[future] fixture: Fixture) {
		// Arrange
		let Fixture { conn, backend } = fixture.await;
		backend.clear_log();

		// Act
		let outcome = conn
			.objects("tests.Model2A")
			.unwrap()
			.filter(Q::new("field1", "missing"))
			.unwrap()
			.delete()
			.await
			.unwrap();

		// Assert
		assert_eq!(outcome, DeletionOutcome::default());
		assert!(backend.statements().is_empty());
	}
}
