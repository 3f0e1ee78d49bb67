//! Polymorphic manager and queryset/instance extensions

use super::collector::{DeletionOutcome, PolymorphicCollector};
use super::hook::{CTYPE_FIELD, DEFAULT_MANAGER};
use super::materialize::{PolymorphicIterable, get_real_instances, real_class};
use super::translate::PolymorphicTranslator;
use crate::orm::{
	DatabaseConnection, FilterTranslator, Instance, Manager, ModelIterable, ModelMeta, Q, QuerySet, ResultIterable,
	Value,
};
use async_trait::async_trait;
use polymorph_core::{Error, FieldError, Result};
use std::any::Any;
use std::sync::Arc;

/// Manager whose querysets return instances of their concrete classes
#[derive(Debug, Clone)]
pub struct PolymorphicManager {
	name: String,
	use_in_migrations: bool,
}

impl PolymorphicManager {
	pub fn new() -> Self {
		Self::named(DEFAULT_MANAGER)
	}

	pub fn named(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			use_in_migrations: false,
		}
	}

	/// Polymorphic managers must stay out of migrations; enabling this is
	/// reported as `polymorphic.E002`.
	pub fn with_use_in_migrations(mut self, enabled: bool) -> Self {
		self.use_in_migrations = enabled;
		self
	}
}

impl Default for PolymorphicManager {
	fn default() -> Self {
		Self::new()
	}
}

impl Manager for PolymorphicManager {
	fn name(&self) -> &str {
		&self.name
	}

	fn use_in_migrations(&self) -> bool {
		self.use_in_migrations
	}

	fn iterable(&self) -> Arc<dyn ResultIterable> {
		Arc::new(PolymorphicIterable)
	}

	fn translator(&self) -> Arc<dyn FilterTranslator> {
		Arc::new(PolymorphicTranslator)
	}

	fn as_any(&self) -> &dyn Any {
		self
	}
}

/// Polymorphic operations on querysets
///
/// `QuerySet::is_polymorphic` tells whether rows will be upgraded.
///
/// # Examples
///
/// ```no_run
/// use polymorph_db::orm::DatabaseConnection;
/// use polymorph_db::polymorphic::PolymorphicQuerySetExt;
///
/// # async fn example(conn: DatabaseConnection) -> polymorph_core::Result<()> {
/// let bs = conn.objects("tests.Model2A")?.instance_of(&["Model2B"])?.fetch().await?;
/// let plain = conn.objects("tests.Model2A")?.non_polymorphic().fetch().await?;
/// let upgraded = conn.objects("tests.Model2A")?.get_real_instances(plain).await?;
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait PolymorphicQuerySetExt: Sized {
	/// Keep objects of the given classes and their subclasses. Classes are
	/// `Name` or `app.Name`.
	fn instance_of<S: AsRef<str> + Sync>(self, classes: &[S]) -> Result<Self>;

	/// Keep objects of no given class, including objects without a
	/// discriminator.
	fn not_instance_of<S: AsRef<str> + Sync>(self, classes: &[S]) -> Result<Self>;

	/// Return rows as instances of the queried model.
	fn non_polymorphic(self) -> Self;

	/// Upgrade rows to their concrete classes.
	fn polymorphic(self) -> Self;

	async fn get_real_instances(&self, rows: Vec<Instance>) -> Result<Vec<Instance>>;
}

fn class_filter(queryset: QuerySet, condition: Q) -> Result<QuerySet> {
	let condition = PolymorphicTranslator.translate_filter(queryset.connection(), queryset.model(), condition)?;
	queryset.filter(condition)
}

#[async_trait]
impl PolymorphicQuerySetExt for QuerySet {
	fn instance_of<S: AsRef<str> + Sync>(self, classes: &[S]) -> Result<Self> {
		class_filter(self, Q::instance_of(classes))
	}

	fn not_instance_of<S: AsRef<str> + Sync>(self, classes: &[S]) -> Result<Self> {
		class_filter(self, Q::not_instance_of(classes))
	}

	fn non_polymorphic(self) -> Self {
		self.with_iterable(Arc::new(ModelIterable))
	}

	fn polymorphic(self) -> Self {
		self.with_iterable(Arc::new(PolymorphicIterable))
	}

	async fn get_real_instances(&self, rows: Vec<Instance>) -> Result<Vec<Instance>> {
		get_real_instances(self.connection(), rows).await
	}
}

/// Polymorphic operations on single instances
#[async_trait]
pub trait PolymorphicInstanceExt {
	/// Model named by the discriminator.
	async fn get_real_instance_class(&self, conn: &DatabaseConnection) -> Result<Arc<ModelMeta>>;

	/// This object as an instance of its concrete class.
	async fn get_real_instance(&self, conn: &DatabaseConnection) -> Result<Instance>;

	/// Same as [`Instance::delete`].
	async fn delete_polymorphic(&self, conn: &DatabaseConnection, keep_parents: bool) -> Result<DeletionOutcome>;
}

#[async_trait]
impl PolymorphicInstanceExt for Instance {
	async fn get_real_instance_class(&self, conn: &DatabaseConnection) -> Result<Arc<ModelMeta>> {
		real_class(conn, self).await
	}

	async fn get_real_instance(&self, conn: &DatabaseConnection) -> Result<Instance> {
		let class = real_class(conn, self).await?;
		if class.label() == self.label() {
			return Ok(self.clone());
		}
		get_real_instances(conn, vec![self.clone()])
			.await?
			.into_iter()
			.next()
			.ok_or_else(|| Error::DoesNotExist {
				model: class.name.clone(),
			})
	}

	async fn delete_polymorphic(&self, conn: &DatabaseConnection, keep_parents: bool) -> Result<DeletionOutcome> {
		PolymorphicCollector::new(conn.clone())
			.keep_parents(keep_parents)
			.add_instances(vec![self.clone()])
			.await?
			.execute()
			.await
	}
}

/// Promote `parent`, an instance of the direct parent of `label`, to
/// `label`.
///
/// Only the child table gets a new row; `values` fill the child's own
/// fields. The discriminator is pointed at `label`.
pub async fn create_from_super(
	conn: &DatabaseConnection,
	label: &str,
	parent: &Instance,
	values: Vec<(&str, Value)>,
) -> Result<Instance> {
	let registry = conn.registry();
	let meta = registry.get(label)?;
	if meta.parent.as_deref() != Some(parent.label().as_str()) {
		return Err(Error::Validation(format!(
			"create_from_super can only be used if the object is one level of inheritance up from {}: expected {}, got {}",
			meta.label(),
			meta.parent.as_deref().unwrap_or("no parent"),
			parent.label()
		)));
	}
	let pk = parent.pk().ok_or_else(|| {
		Error::Validation(format!("{} must be saved before it can be promoted", parent.model_name()))
	})?;

	let mut child = Instance::new(registry, label)?;
	for (name, value) in parent.values() {
		child.set(name, value.clone());
	}
	for level in registry.chain(label)? {
		child.set(level.pk_attname(), pk);
	}
	for (name, value) in values {
		match registry.find_field(label, name)? {
			Some((owner, _)) if owner.label() == meta.label() => child.set(name, value),
			_ => {
				return Err(FieldError::DoesNotExist {
					model: meta.name.clone(),
					field: name.to_string(),
					choices: meta.local_concrete_fields().map(|f| f.name.clone()).collect::<Vec<_>>().join(", "),
					suggestion: None,
				}
				.into());
			}
		}
	}
	if meta.polymorphic {
		let ct = conn.content_types().get_for_model(label)?;
		child.set(CTYPE_FIELD, ct.id);
	}

	conn.save(&mut child).await?;
	tracing::debug!(model = %label, pk, "promoted from parent");
	conn.base_objects(label)?.get_pk(pk).await
}
