//! Model declarations and resolved model options

use super::fields::{Field, FieldMeta, FieldType};
use super::instance::Instance;
use super::manager::Manager;
use std::fmt;
use std::sync::Arc;

/// Custom `Display` for instances of a model
pub trait InstanceRepr: Send + Sync + fmt::Debug {
	fn fmt_instance(&self, instance: &Instance, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

/// A named behavior attached to a model at declaration time.
///
/// Capabilities replace multiple inheritance of mixins: a model carries a
/// flat list, and children inherit the list of their single parent.
#[derive(Debug, Clone)]
pub enum Capability {
	/// Overrides how instances are displayed
	Repr(Arc<dyn InstanceRepr>),
	/// Adds a manager; the first manager is the default one
	Manager(Arc<dyn Manager>),
}

/// Model declaration
///
/// # Examples
///
/// ```
/// use polymorph_db::orm::{Field, ModelDef};
///
/// let base = ModelDef::new("tests", "Model2A")
///     .polymorphic()
///     .field(Field::char("field1", 30));
/// let child = ModelDef::new("tests", "Model2B")
///     .parent("Model2A")
///     .field(Field::char("field2", 30));
/// assert_eq!(child.label(), "tests.Model2B");
/// ```
#[derive(Debug, Clone)]
pub struct ModelDef {
	pub(crate) app_label: String,
	pub(crate) name: String,
	pub(crate) db_table: Option<String>,
	pub(crate) parent: Option<String>,
	pub(crate) polymorphic: bool,
	pub(crate) fields: Vec<Field>,
	pub(crate) capabilities: Vec<Capability>,
	pub(crate) ordering: Vec<String>,
	pub(crate) base_manager_name: Option<String>,
	pub(crate) auto_created: bool,
}

impl ModelDef {
	pub fn new(app_label: impl Into<String>, name: impl Into<String>) -> Self {
		Self {
			app_label: app_label.into(),
			name: name.into(),
			db_table: None,
			parent: None,
			polymorphic: false,
			fields: Vec::new(),
			capabilities: Vec::new(),
			ordering: Vec::new(),
			base_manager_name: None,
			auto_created: false,
		}
	}

	/// Multi-table inheritance parent (`Name` or `app.Name`).
	pub fn parent(mut self, parent: impl Into<String>) -> Self {
		self.parent = Some(parent.into());
		self
	}

	/// Opt into polymorphic behavior. Children inherit it.
	pub fn polymorphic(mut self) -> Self {
		self.polymorphic = true;
		self
	}

	pub fn field(mut self, field: Field) -> Self {
		self.fields.push(field);
		self
	}

	pub fn db_table(mut self, table: impl Into<String>) -> Self {
		self.db_table = Some(table.into());
		self
	}

	pub fn ordering<S: AsRef<str>>(mut self, ordering: &[S]) -> Self {
		self.ordering = ordering.iter().map(|s| s.as_ref().to_string()).collect();
		self
	}

	pub fn capability(mut self, capability: Capability) -> Self {
		self.capabilities.push(capability);
		self
	}

	pub fn manager(self, manager: impl Manager + 'static) -> Self {
		self.capability(Capability::Manager(Arc::new(manager)))
	}

	pub fn repr(self, repr: impl InstanceRepr + 'static) -> Self {
		self.capability(Capability::Repr(Arc::new(repr)))
	}

	pub fn base_manager_name(mut self, name: impl Into<String>) -> Self {
		self.base_manager_name = Some(name.into());
		self
	}

	pub fn label(&self) -> String {
		format!("{}.{}", self.app_label, self.name)
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn app_label(&self) -> &str {
		&self.app_label
	}

	pub fn is_polymorphic(&self) -> bool {
		self.polymorphic
	}

	pub fn fields(&self) -> &[Field] {
		&self.fields
	}
}

/// Resolved model options (Django's `Model._meta`)
#[derive(Debug, Clone)]
pub struct ModelMeta {
	pub app_label: String,
	pub name: String,
	/// Lower-case model name
	pub model_name: String,
	pub db_table: String,
	/// Parent label for multi-table inheritance
	pub parent: Option<String>,
	/// Local field linking to the parent
	pub parent_link: Option<String>,
	pub polymorphic: bool,
	/// Local fields, in declaration order (many-to-many included)
	pub fields: Vec<FieldMeta>,
	/// Concrete fields of the ancestors, root first
	pub inherited_fields: Vec<FieldMeta>,
	/// Name of the local primary key field
	pub pk: String,
	pub ordering: Vec<String>,
	pub managers: Vec<Arc<dyn Manager>>,
	pub repr: Option<Arc<dyn InstanceRepr>>,
	pub base_manager_name: Option<String>,
	/// Created by the framework (many-to-many through tables)
	pub auto_created: bool,
}

impl ModelMeta {
	pub fn label(&self) -> String {
		format!("{}.{}", self.app_label, self.name)
	}

	/// Local field by name or attname.
	pub fn local_field(&self, name: &str) -> Option<&FieldMeta> {
		self.fields
			.iter()
			.find(|f| f.name == name)
			.or_else(|| self.fields.iter().find(|f| f.attname == name))
	}

	pub fn pk_field(&self) -> Option<&FieldMeta> {
		self.local_field(&self.pk)
	}

	/// Attribute under which instances store the primary key.
	pub fn pk_attname(&self) -> &str {
		self.pk_field().map(|f| f.attname.as_str()).unwrap_or("id")
	}

	pub fn pk_column(&self) -> &str {
		self.pk_field().map(|f| f.column.as_str()).unwrap_or("id")
	}

	/// Local fields that own a column
	pub fn local_concrete_fields(&self) -> impl Iterator<Item = &FieldMeta> {
		self.fields.iter().filter(|f| f.is_concrete())
	}

	/// Inherited concrete fields followed by the local fields.
	pub fn all_fields(&self) -> impl Iterator<Item = &FieldMeta> {
		self.inherited_fields.iter().chain(self.fields.iter())
	}

	pub fn local_many_to_many(&self) -> impl Iterator<Item = &FieldMeta> {
		self.fields
			.iter()
			.filter(|f| f.field_type == FieldType::ManyToManyField)
	}

	/// First declared manager
	pub fn default_manager(&self) -> Option<&Arc<dyn Manager>> {
		self.managers.first()
	}

	pub fn manager(&self, name: &str) -> Option<&Arc<dyn Manager>> {
		self.managers.iter().find(|m| m.name() == name)
	}

	/// Manager used by migrations: the first one with `use_in_migrations`.
	pub fn migration_manager(&self) -> Option<&Arc<dyn Manager>> {
		self.managers.iter().find(|m| m.use_in_migrations())
	}
}
