//! Database connection
//!
//! [`DatabaseConnection`] ties a [`Backend`] to the model registry, the
//! content-type cache and the settings. It is cheap to clone; every clone
//! shares the same state.

use super::fields::FieldType;
use super::instance::Instance;
use super::model::ModelMeta;
use super::queryset::QuerySet;
use super::registry::ModelRegistry;
use super::related::ManyRelated;
use super::value::{Row, Value};
use crate::backends::statements::{ColumnSchema, InsertStatement, TableSchema, WriteStatement};
use crate::backends::{Backend, MemoryBackend};
use crate::contenttypes::ContentTypeManager;
use polymorph_conf::PolymorphicSettings;
use polymorph_core::{Error, FieldError, Result, signals};
use std::fmt;
use std::sync::Arc;

struct ConnectionInner {
	backend: Arc<dyn Backend>,
	registry: Arc<ModelRegistry>,
	content_types: ContentTypeManager,
	settings: PolymorphicSettings,
}

#[derive(Clone)]
pub struct DatabaseConnection {
	inner: Arc<ConnectionInner>,
}

impl fmt::Debug for DatabaseConnection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("DatabaseConnection")
			.field("vendor", &self.inner.backend.vendor())
			.field("settings", &self.inner.settings)
			.finish()
	}
}

impl DatabaseConnection {
	pub fn new(backend: Arc<dyn Backend>, registry: Arc<ModelRegistry>, settings: PolymorphicSettings) -> Self {
		Self {
			inner: Arc::new(ConnectionInner {
				backend,
				registry,
				content_types: ContentTypeManager::new(),
				settings,
			}),
		}
	}

	/// Connection over a fresh [`MemoryBackend`] with default settings.
	pub fn memory(registry: Arc<ModelRegistry>) -> Self {
		Self::new(Arc::new(MemoryBackend::new()), registry, PolymorphicSettings::default())
	}

	/// Connect to the SQLite database named by `settings.database`.
	///
	/// # Examples
	///
	/// ```no_run
	/// use polymorph_conf::PolymorphicSettings;
	/// use polymorph_db::orm::{DatabaseConnection, ModelRegistry};
	/// use std::sync::Arc;
	///
	/// # async fn example() -> polymorph_core::Result<()> {
	/// let registry = Arc::new(ModelRegistry::builder().build()?);
	/// let conn = DatabaseConnection::connect(registry, PolymorphicSettings::default()).await?;
	/// conn.migrate().await?;
	/// # Ok(())
	/// # }
	/// ```
	#[cfg(feature = "sqlite")]
	pub async fn connect(registry: Arc<ModelRegistry>, settings: PolymorphicSettings) -> Result<Self> {
		let backend = crate::backends::SqliteBackend::connect(&settings.database).await?;
		Ok(Self::new(Arc::new(backend), registry, settings))
	}

	pub fn registry(&self) -> &Arc<ModelRegistry> {
		&self.inner.registry
	}

	pub fn backend(&self) -> &Arc<dyn Backend> {
		&self.inner.backend
	}

	pub fn settings(&self) -> &PolymorphicSettings {
		&self.inner.settings
	}

	pub fn content_types(&self) -> &ContentTypeManager {
		&self.inner.content_types
	}

	pub fn model(&self, label: &str) -> Result<Arc<ModelMeta>> {
		self.inner.registry.get(label)
	}

	/// Create every table and synchronize content types.
	pub async fn migrate(&self) -> Result<()> {
		for meta in self.inner.registry.models() {
			let schema = self.table_schema(meta)?;
			self.inner.backend.create_table(&schema).await?;
		}
		self.inner.content_types.sync(self).await?;
		Ok(())
	}

	fn table_schema(&self, meta: &ModelMeta) -> Result<TableSchema> {
		let mut columns = Vec::new();
		for field in meta.local_concrete_fields() {
			let references = match &field.relation {
				Some(relation) if relation.db_constraint => {
					let target = self.inner.registry.get(&relation.to)?;
					Some((target.db_table.clone(), target.pk_column().to_string()))
				}
				_ => None,
			};
			columns.push(ColumnSchema {
				name: field.column.clone(),
				kind: field.column_kind(),
				nullable: field.null,
				primary_key: field.primary_key,
				auto_increment: field.primary_key && field.field_type == FieldType::AutoField,
				unique: field.unique && !field.primary_key,
				references,
			});
		}
		Ok(TableSchema {
			name: meta.db_table.clone(),
			columns,
		})
	}

	/// Queryset of the model's default manager.
	pub fn objects(&self, label: &str) -> Result<QuerySet> {
		let meta = self.model(label)?;
		match meta.default_manager() {
			Some(manager) => manager.get_queryset(self, Arc::clone(&meta)),
			None => Ok(QuerySet::new(self.clone(), meta)),
		}
	}

	/// Queryset of a named manager.
	pub fn manager_queryset(&self, label: &str, manager: &str) -> Result<QuerySet> {
		let meta = self.model(label)?;
		let found = meta.manager(manager).cloned().ok_or_else(|| {
			Error::ImproperlyConfigured(format!("{} has no manager named '{}'", meta.label(), manager))
		})?;
		found.get_queryset(self, meta)
	}

	/// Plain queryset, bypassing the model's managers.
	pub fn base_objects(&self, label: &str) -> Result<QuerySet> {
		Ok(QuerySet::new(self.clone(), self.model(label)?))
	}

	/// Queryset used for related-object access and the deletion walk.
	pub fn base_manager_queryset(&self, label: &str) -> Result<QuerySet> {
		let meta = self.model(label)?;
		match &meta.base_manager_name {
			Some(name) => self.manager_queryset(label, name),
			None => Ok(QuerySet::new(self.clone(), meta)),
		}
	}

	/// Build, save and return a new instance.
	pub async fn create(&self, label: &str, values: Vec<(&str, Value)>) -> Result<Instance> {
		let mut instance = Instance::new(&self.inner.registry, label)?;
		for (name, value) in values {
			if self.inner.registry.find_field(label, name)?.is_none() && name != "pk" {
				let meta = self.model(label)?;
				return Err(FieldError::DoesNotExist {
					model: meta.name.clone(),
					field: name.to_string(),
					choices: String::new(),
					suggestion: None,
				}
				.into());
			}
			instance.set(name, value);
		}
		self.save(&mut instance).await?;
		Ok(instance)
	}

	fn insert_statement(meta: &ModelMeta, instance: &Instance) -> InsertStatement {
		let mut values = Row::new();
		for field in meta.local_concrete_fields().filter(|f| !f.primary_key) {
			let value = instance.values().get(&field.attname).cloned().unwrap_or_default();
			values.insert(field.column.clone(), value);
		}
		InsertStatement {
			table: meta.db_table.clone(),
			pk_column: meta.pk_column().to_string(),
			values,
		}
	}

	/// Insert or update every table of the instance's chain.
	///
	/// An instance without a primary key is inserted root first. Otherwise
	/// each table is updated, and tables without a row for that key get one.
	pub async fn save(&self, instance: &mut Instance) -> Result<()> {
		for hook in self.inner.registry.hooks() {
			hook.pre_save(self, instance).await?;
		}
		let label = instance.label();
		signals::pre_save::<Instance>().send(&label, instance);

		let chain = self.inner.registry.chain(&label)?;
		let pk = match instance.pk() {
			None => {
				let statements: Vec<InsertStatement> =
					chain.iter().map(|meta| Self::insert_statement(meta, instance)).collect();
				self.inner.backend.insert(&statements, None).await?
			}
			Some(pk) => {
				let updates: Vec<WriteStatement> = chain
					.iter()
					.map(|meta| WriteStatement::Update {
						table: meta.db_table.clone(),
						assignments: Self::insert_statement(meta, instance).values.into_iter().collect(),
						key_column: meta.pk_column().to_string(),
						keys: vec![pk],
					})
					.collect();
				let affected = self.inner.backend.execute(&updates).await?;
				let missing: Vec<InsertStatement> = chain
					.iter()
					.zip(affected)
					.filter(|(_, count)| *count == 0)
					.map(|(meta, _)| Self::insert_statement(meta, instance))
					.collect();
				if !missing.is_empty() {
					self.inner.backend.insert(&missing, Some(pk)).await?;
				}
				pk
			}
		};

		for meta in &chain {
			instance.values_mut().insert(meta.pk_attname().to_string(), Value::Int(pk));
		}
		signals::post_save::<Instance>().send(&label, instance);
		Ok(())
	}

	/// Reload an instance of the same model from the database.
	pub async fn refresh(&self, instance: &Instance) -> Result<Instance> {
		let pk = instance.pk().ok_or_else(|| Error::DoesNotExist {
			model: instance.model_name().to_string(),
		})?;
		self.base_objects(&instance.label())?.get_pk(pk).await
	}

	/// Delete one table's row directly, without the deletion collector,
	/// signals or discriminator maintenance.
	pub async fn raw_delete(&self, label: &str, pk: i64) -> Result<u64> {
		let meta = self.model(label)?;
		let affected = self
			.inner
			.backend
			.execute(&[WriteStatement::Delete {
				table: meta.db_table.clone(),
				key_column: meta.pk_column().to_string(),
				keys: vec![pk],
			}])
			.await?;
		Ok(affected.into_iter().sum())
	}

	/// Accessor for a many-to-many field of `instance`.
	pub fn many_to_many(&self, instance: &Instance, field: &str) -> Result<ManyRelated> {
		let label = instance.label();
		let found = self
			.inner
			.registry
			.find_field(&label, field)?
			.and_then(|(_, f)| f.many_to_many);
		let Some(m2m) = found else {
			return Err(FieldError::NotRelational {
				model: instance.model_name().to_string(),
				field: field.to_string(),
			}
			.into());
		};
		let pk = instance.pk().ok_or_else(|| {
			Error::Validation(format!(
				"{} must be saved before using the '{}' relation",
				instance.model_name(),
				field
			))
		})?;
		Ok(ManyRelated::new(self.clone(), m2m, pk))
	}
}
