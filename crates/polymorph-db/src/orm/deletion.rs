//! On-delete behaviors and the relation walk they drive
//!
//! [`OnDelete`] carries the seven standard actions. Each relation field holds
//! an [`OnDeleteHandler`]; when a referenced object is about to be deleted the
//! [`Collector`] asks the handler what to do with the referencing rows.

use super::connection::DatabaseConnection;
use super::fields::{FieldMeta, RelatedField};
use super::instance::Instance;
use super::query::Q;
use super::queryset::QuerySet;
use super::value::Value;
use indexmap::{IndexMap, IndexSet};
use polymorph_core::{DeletionBlocked, Error, ObjectRef, Result};
use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::fmt;

/// Value produced by `OnDelete::Set`
#[derive(Clone)]
pub enum SetValue {
	/// A constant
	Value(Value),
	/// A named function evaluated each time the action runs
	Callable { path: String, func: fn() -> Value },
}

impl SetValue {
	pub fn resolve(&self) -> Value {
		match self {
			SetValue::Value(v) => v.clone(),
			SetValue::Callable { func, .. } => func(),
		}
	}
}

impl PartialEq for SetValue {
	fn eq(&self, other: &Self) -> bool {
		match (self, other) {
			(SetValue::Value(a), SetValue::Value(b)) => a == b,
			(SetValue::Callable { path: a, .. }, SetValue::Callable { path: b, .. }) => a == b,
			_ => false,
		}
	}
}

impl fmt::Debug for SetValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SetValue::Value(v) => write!(f, "Value({:?})", v),
			SetValue::Callable { path, .. } => write!(f, "Callable({})", path),
		}
	}
}

impl fmt::Display for SetValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SetValue::Value(Value::Text(s)) => write!(f, "{:?}", s),
			SetValue::Value(v) => write!(f, "{}", v),
			SetValue::Callable { path, .. } => f.write_str(path),
		}
	}
}

/// Standard on-delete actions
///
/// # Examples
///
/// ```
/// use polymorph_db::orm::{OnDelete, OnDeleteHandler};
///
/// assert_eq!(OnDelete::Cascade.reference().to_string(), "CASCADE");
/// assert_eq!(OnDelete::set(7).reference().to_string(), "SET(7)");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum OnDelete {
	Cascade,
	Protect,
	SetNull,
	SetDefault,
	Restrict,
	DoNothing,
	Set(SetValue),
}

impl OnDelete {
	/// `SET(value)`
	pub fn set(value: impl Into<Value>) -> Self {
		OnDelete::Set(SetValue::Value(value.into()))
	}

	/// `SET(callable)`; `path` names the function in migrations.
	pub fn set_with(path: impl Into<String>, func: fn() -> Value) -> Self {
		OnDelete::Set(SetValue::Callable {
			path: path.into(),
			func,
		})
	}

	/// Resolve one of the constant action names.
	pub fn from_name(name: &str) -> Option<Self> {
		Some(match name {
			"CASCADE" => OnDelete::Cascade,
			"PROTECT" => OnDelete::Protect,
			"SET_NULL" => OnDelete::SetNull,
			"SET_DEFAULT" => OnDelete::SetDefault,
			"RESTRICT" => OnDelete::Restrict,
			"DO_NOTHING" => OnDelete::DoNothing,
			_ => return None,
		})
	}

	pub fn name(&self) -> &'static str {
		match self {
			OnDelete::Cascade => "CASCADE",
			OnDelete::Protect => "PROTECT",
			OnDelete::SetNull => "SET_NULL",
			OnDelete::SetDefault => "SET_DEFAULT",
			OnDelete::Restrict => "RESTRICT",
			OnDelete::DoNothing => "DO_NOTHING",
			OnDelete::Set(_) => "SET",
		}
	}
}

/// Canonical identity of a handler.
///
/// Two handlers with the same reference are interchangeable for change
/// detection and serialize to the same migration source.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerRef {
	Action(OnDelete),
	/// A handler registered by name
	Custom(String),
}

impl fmt::Display for HandlerRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			HandlerRef::Action(OnDelete::Set(value)) => write!(f, "SET({})", value),
			HandlerRef::Action(action) => f.write_str(action.name()),
			HandlerRef::Custom(name) => f.write_str(name),
		}
	}
}

/// Behavior run for the rows referencing an object that is being deleted.
pub trait OnDeleteHandler: Send + Sync + fmt::Debug + 'static {
	/// Schedule work on `collector` for `sub_objs`, the rows whose `related`
	/// field points at the objects being deleted.
	fn apply(&self, collector: &mut Collector, related: &RelatedField, sub_objs: QuerySet) -> Result<()>;

	fn reference(&self) -> HandlerRef;

	fn as_any(&self) -> &dyn Any;
}

impl PartialEq for dyn OnDeleteHandler {
	fn eq(&self, other: &Self) -> bool {
		self.reference() == other.reference()
	}
}

impl PartialEq<OnDelete> for dyn OnDeleteHandler {
	fn eq(&self, other: &OnDelete) -> bool {
		self.reference() == HandlerRef::Action(other.clone())
	}
}

impl OnDeleteHandler for OnDelete {
	fn apply(&self, collector: &mut Collector, related: &RelatedField, sub_objs: QuerySet) -> Result<()> {
		match self {
			OnDelete::Cascade => {
				collector.collect(sub_objs, &related.target, related.field.null);
			}
			OnDelete::Protect => collector.protect(related, sub_objs),
			OnDelete::Restrict => collector.restrict(related, sub_objs),
			OnDelete::SetNull => collector.set_field(related, Value::Null, sub_objs),
			OnDelete::SetDefault => collector.set_field(related, related.field.get_default(), sub_objs),
			OnDelete::Set(value) => collector.set_field(related, value.resolve(), sub_objs),
			OnDelete::DoNothing => {}
		}
		Ok(())
	}

	fn reference(&self) -> HandlerRef {
		HandlerRef::Action(self.clone())
	}

	fn as_any(&self) -> &dyn Any {
		self
	}
}

/// Scheduled column assignment for referencing rows
#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
	/// Declaring model label
	pub model: String,
	pub field: String,
	pub column: String,
	pub value: Value,
	pub pks: IndexSet<i64>,
}

enum Objects {
	Instances(Vec<Instance>),
	Query(QuerySet),
}

enum Task {
	Collect {
		objects: Objects,
		source: Option<String>,
		nullable: bool,
		collect_related: bool,
		reverse_dependency: bool,
		keep_parents: bool,
	},
	Protect {
		relation: String,
		objects: QuerySet,
	},
	Restrict {
		relation: String,
		target: String,
		model: String,
		objects: QuerySet,
	},
	Update {
		model: String,
		field: FieldMeta,
		value: Value,
		objects: QuerySet,
	},
}

/// Relation walk state shared with on-delete handlers.
///
/// Handlers only schedule work; the collector fetches the referencing rows
/// when it drains its worklist in [`Collector::run`]. Every `(model, pk)`
/// pair is added at most once, so self references and diamonds terminate.
pub struct Collector {
	conn: DatabaseConnection,
	data: IndexMap<String, IndexMap<i64, Instance>>,
	/// `model -> models whose rows must be deleted first`
	dependencies: IndexMap<String, IndexSet<String>>,
	field_updates: Vec<FieldUpdate>,
	protected: IndexMap<String, Vec<Instance>>,
	restricted: IndexMap<String, Vec<Instance>>,
	queue: VecDeque<Task>,
}

impl fmt::Debug for Collector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Collector")
			.field("models", &self.data.keys().collect::<Vec<_>>())
			.field("dependencies", &self.dependencies)
			.field("field_updates", &self.field_updates.len())
			.field("pending", &self.queue.len())
			.finish()
	}
}

impl Collector {
	pub fn new(conn: DatabaseConnection) -> Self {
		Self {
			conn,
			data: IndexMap::new(),
			dependencies: IndexMap::new(),
			field_updates: Vec::new(),
			protected: IndexMap::new(),
			restricted: IndexMap::new(),
			queue: VecDeque::new(),
		}
	}

	pub fn connection(&self) -> &DatabaseConnection {
		&self.conn
	}

	/// Queue deletion roots.
	pub fn add_roots(&mut self, instances: Vec<Instance>, keep_parents: bool) {
		self.queue.push_back(Task::Collect {
			objects: Objects::Instances(instances),
			source: None,
			nullable: false,
			collect_related: true,
			reverse_dependency: false,
			keep_parents,
		});
	}

	/// Queue the rows of `objects` for deletion because they reference
	/// `source`. Nullable references add no ordering constraint.
	pub fn collect(&mut self, objects: QuerySet, source: &str, nullable: bool) {
		self.queue.push_back(Task::Collect {
			objects: Objects::Query(objects),
			source: Some(source.to_string()),
			nullable,
			collect_related: true,
			reverse_dependency: false,
			keep_parents: false,
		});
	}

	pub fn protect(&mut self, related: &RelatedField, objects: QuerySet) {
		self.queue.push_back(Task::Protect {
			relation: related.describe(),
			objects,
		});
	}

	pub fn restrict(&mut self, related: &RelatedField, objects: QuerySet) {
		self.queue.push_back(Task::Restrict {
			relation: related.describe(),
			target: related.target.clone(),
			model: related.model.clone(),
			objects,
		});
	}

	pub fn set_field(&mut self, related: &RelatedField, value: Value, objects: QuerySet) {
		self.queue.push_back(Task::Update {
			model: related.model.clone(),
			field: related.field.clone(),
			value,
			objects,
		});
	}

	/// Drain the worklist.
	pub async fn run(&mut self) -> Result<()> {
		while let Some(task) = self.queue.pop_front() {
			match task {
				Task::Collect {
					objects,
					source,
					nullable,
					collect_related,
					reverse_dependency,
					keep_parents,
				} => {
					let instances = match objects {
						Objects::Instances(instances) => instances,
						Objects::Query(qs) => qs.fetch().await?,
					};
					let mut groups: IndexMap<String, Vec<Instance>> = IndexMap::new();
					for instance in instances {
						groups.entry(instance.label()).or_default().push(instance);
					}
					for (label, group) in groups {
						let new = self.add(&label, group, source.as_deref(), nullable, reverse_dependency);
						if !new.is_empty() {
							self.expand(&label, new, collect_related, keep_parents)?;
						}
					}
				}
				Task::Protect { relation, objects } => {
					let found = objects.fetch().await?;
					if !found.is_empty() {
						self.protected.entry(relation).or_default().extend(found);
					}
				}
				Task::Restrict {
					relation,
					target,
					model,
					objects,
				} => {
					let found = objects.fetch().await?;
					if !found.is_empty() {
						self.add_dependency(&target, &model, false);
						self.restricted.entry(relation).or_default().extend(found);
					}
				}
				Task::Update {
					model,
					field,
					value,
					objects,
				} => {
					let pks = objects.pks().await?;
					if !pks.is_empty() {
						self.add_field_update(&model, &field, value, pks);
					}
				}
			}
		}
		Ok(())
	}

	fn add(
		&mut self,
		label: &str,
		instances: Vec<Instance>,
		source: Option<&str>,
		nullable: bool,
		reverse_dependency: bool,
	) -> Vec<Instance> {
		if instances.is_empty() {
			return instances;
		}
		let known = self.data.entry(label.to_string()).or_default();
		let mut new = Vec::new();
		for instance in instances {
			let Some(pk) = instance.pk() else { continue };
			if !known.contains_key(&pk) {
				known.insert(pk, instance.clone());
				new.push(instance);
			}
		}
		if let Some(source) = source
			&& !nullable
		{
			self.add_dependency(source, label, reverse_dependency);
		}
		new
	}

	/// Record that rows of `dependency` go before rows of `model`
	/// (reversed when `reverse` is set).
	fn add_dependency(&mut self, model: &str, dependency: &str, reverse: bool) {
		let (model, dependency) = if reverse { (dependency, model) } else { (model, dependency) };
		if model == dependency {
			return;
		}
		self.dependencies
			.entry(model.to_string())
			.or_default()
			.insert(dependency.to_string());
	}

	fn add_field_update(&mut self, model: &str, field: &FieldMeta, value: Value, pks: Vec<i64>) {
		if let Some(existing) = self
			.field_updates
			.iter_mut()
			.find(|u| u.model == model && u.field == field.name && u.value == value)
		{
			existing.pks.extend(pks);
			return;
		}
		self.field_updates.push(FieldUpdate {
			model: model.to_string(),
			field: field.name.clone(),
			column: field.column.clone(),
			value,
			pks: pks.into_iter().collect(),
		});
	}

	fn expand(&mut self, label: &str, new: Vec<Instance>, collect_related: bool, keep_parents: bool) -> Result<()> {
		let registry = self.conn.registry().clone();
		let meta = registry.get(label)?;

		if !keep_parents && let Some(parent) = &meta.parent {
			let parents = new
				.iter()
				.map(|instance| instance.project(&registry, parent))
				.collect::<Result<Vec<_>>>()?;
			self.queue.push_back(Task::Collect {
				objects: Objects::Instances(parents),
				source: Some(label.to_string()),
				nullable: false,
				collect_related: false,
				reverse_dependency: true,
				keep_parents: false,
			});
		}
		if !collect_related {
			return Ok(());
		}

		let ancestors: HashSet<String> = if keep_parents {
			registry.ancestors(label)?.iter().map(|m| m.label()).collect()
		} else {
			HashSet::new()
		};
		let pks: Vec<i64> = new.iter().filter_map(Instance::pk).collect();
		let batch_size = self.conn.settings().delete_batch_size.max(1);

		for related in registry.delete_candidates(label)? {
			if ancestors.contains(&related.target) {
				continue;
			}
			let Some(handler) = related.on_delete().cloned() else {
				continue;
			};
			if *handler == OnDelete::DoNothing {
				continue;
			}
			for batch in pks.chunks(batch_size) {
				let sub_objs = self
					.conn
					.base_manager_queryset(&related.model)?
					.filter(Q::new(&format!("{}__in", related.field.name), batch.to_vec()))?;
				handler.apply(self, &related, sub_objs)?;
			}
		}
		Ok(())
	}

	/// Fail if any protected object was found, or any restricted object
	/// is not itself being deleted.
	pub fn check_blocked(&self) -> Result<()> {
		if !self.protected.is_empty() {
			return Err(Error::Protected(Self::blocked(&self.protected, |_| true)));
		}
		let blocked = Self::blocked(&self.restricted, |instance| !self.contains(instance));
		if !blocked.is_empty() {
			return Err(Error::Restricted(blocked));
		}
		Ok(())
	}

	fn blocked(source: &IndexMap<String, Vec<Instance>>, keep: impl Fn(&Instance) -> bool) -> DeletionBlocked {
		let relations = source
			.iter()
			.map(|(relation, instances)| {
				let mut seen = HashSet::new();
				let objs = instances
					.iter()
					.filter(|i| keep(i))
					.filter_map(|i| i.pk().map(|pk| ObjectRef::new(i.label(), pk)))
					.filter(|r| seen.insert(r.clone()))
					.collect::<Vec<_>>();
				(relation.clone(), objs)
			})
			.filter(|(_, objs)| !objs.is_empty())
			.collect();
		DeletionBlocked { relations }
	}

	/// Whether `instance` is scheduled for deletion.
	pub fn contains(&self, instance: &Instance) -> bool {
		instance
			.pk()
			.is_some_and(|pk| self.data.get(&instance.label()).is_some_and(|m| m.contains_key(&pk)))
	}

	pub fn data(&self) -> &IndexMap<String, IndexMap<i64, Instance>> {
		&self.data
	}

	pub fn dependencies(&self) -> &IndexMap<String, IndexSet<String>> {
		&self.dependencies
	}

	pub fn field_updates(&self) -> &[FieldUpdate] {
		&self.field_updates
	}

	/// Number of instances scheduled for deletion
	pub fn len(&self) -> usize {
		self.data.values().map(IndexMap::len).sum()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	fn default_one() -> Value {
		Value::Int(1)
	}

	#[rstest]
	#[case(OnDelete::Cascade, "CASCADE")]
	#[case(OnDelete::Protect, "PROTECT")]
	#[case(OnDelete::SetNull, "SET_NULL")]
	#[case(OnDelete::SetDefault, "SET_DEFAULT")]
	#[case(OnDelete::Restrict, "RESTRICT")]
	#[case(OnDelete::DoNothing, "DO_NOTHING")]
	#[case(OnDelete::set("x"), "SET(\"x\")")]
	#[case(OnDelete::set_with("tests::default_one", default_one), "SET(tests::default_one)")]
	fn test_reference_display(#[case] action: OnDelete, #[case] expected: &str) {
		assert_eq!(action.reference().to_string(), expected);
	}

	#[rstest]
	fn test_from_name_round_trips_constant_actions() {
		for name in ["CASCADE", "PROTECT", "SET_NULL", "SET_DEFAULT", "RESTRICT", "DO_NOTHING"] {
			assert_eq!(OnDelete::from_name(name).map(|a| a.name()), Some(name));
		}
		assert_eq!(OnDelete::from_name("SET"), None);
	}

	#[rstest]
	fn test_callable_equality_uses_path() {
		let a = OnDelete::set_with("tests::default_one", default_one);
		let b = OnDelete::set_with("tests::default_one", || Value::Int(2));

		assert_eq!(a, b);
		assert_ne!(a, OnDelete::set(1));
	}

	#[rstest]
	fn test_dyn_handler_equality() {
		let handler: Box<dyn OnDeleteHandler> = Box::new(OnDelete::Protect);

		assert!(*handler == OnDelete::Protect);
		assert!(*handler != OnDelete::Cascade);
	}
}
