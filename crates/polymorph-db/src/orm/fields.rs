//! Field declarations and resolved field metadata

use super::deletion::{OnDelete, OnDeleteHandler};
use super::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Storage kind of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
	AutoField,
	IntegerField,
	FloatField,
	BooleanField,
	CharField,
	TextField,
	ForeignKey,
	OneToOneField,
	ManyToManyField,
}

impl FieldType {
	/// Name used in representations (`ShowFieldType`) and migrations.
	pub fn name(&self) -> &'static str {
		match self {
			FieldType::AutoField => "AutoField",
			FieldType::IntegerField => "IntegerField",
			FieldType::FloatField => "FloatField",
			FieldType::BooleanField => "BooleanField",
			FieldType::CharField => "CharField",
			FieldType::TextField => "TextField",
			FieldType::ForeignKey => "ForeignKey",
			FieldType::OneToOneField => "OneToOneField",
			FieldType::ManyToManyField => "ManyToManyField",
		}
	}

	pub fn is_relation(&self) -> bool {
		matches!(
			self,
			FieldType::ForeignKey | FieldType::OneToOneField | FieldType::ManyToManyField
		)
	}

	/// Whether the field owns a column (many-to-many lives in a through table).
	pub fn is_concrete(&self) -> bool {
		!matches!(self, FieldType::ManyToManyField)
	}

	pub fn column_kind(&self) -> ColumnKind {
		match self {
			FieldType::AutoField
			| FieldType::IntegerField
			| FieldType::ForeignKey
			| FieldType::OneToOneField
			| FieldType::ManyToManyField => ColumnKind::Integer,
			FieldType::FloatField => ColumnKind::Float,
			FieldType::BooleanField => ColumnKind::Boolean,
			FieldType::CharField | FieldType::TextField => ColumnKind::Text,
		}
	}
}

impl fmt::Display for FieldType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

/// Column storage class used by backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnKind {
	Integer,
	Float,
	Boolean,
	Text,
}

/// Field declaration, consumed by `ModelDef`
///
/// # Examples
///
/// ```
/// use polymorph_db::orm::{Field, OnDelete};
///
/// let name = Field::char("field1", 30);
/// let owner = Field::foreign_key("owner", "tests.Owner", OnDelete::Cascade)
///     .null()
///     .related_name("pets");
/// assert_eq!(owner.name(), "owner");
/// ```
#[derive(Debug, Clone)]
pub struct Field {
	pub(crate) name: String,
	pub(crate) field_type: FieldType,
	pub(crate) max_length: Option<usize>,
	pub(crate) null: bool,
	pub(crate) default: Option<Value>,
	pub(crate) unique: bool,
	pub(crate) primary_key: bool,
	pub(crate) db_column: Option<String>,
	pub(crate) to: Option<String>,
	pub(crate) on_delete: Option<Arc<dyn OnDeleteHandler>>,
	pub(crate) related_name: Option<String>,
	pub(crate) parent_link: bool,
	pub(crate) db_constraint: bool,
	pub(crate) through: Option<String>,
}

impl Field {
	fn new(name: impl Into<String>, field_type: FieldType) -> Self {
		Self {
			name: name.into(),
			field_type,
			max_length: None,
			null: false,
			default: None,
			unique: false,
			primary_key: false,
			db_column: None,
			to: None,
			on_delete: None,
			related_name: None,
			parent_link: false,
			db_constraint: true,
			through: None,
		}
	}

	pub fn auto(name: impl Into<String>) -> Self {
		let mut field = Self::new(name, FieldType::AutoField);
		field.primary_key = true;
		field
	}

	pub fn integer(name: impl Into<String>) -> Self {
		Self::new(name, FieldType::IntegerField)
	}

	pub fn float(name: impl Into<String>) -> Self {
		Self::new(name, FieldType::FloatField)
	}

	pub fn boolean(name: impl Into<String>) -> Self {
		Self::new(name, FieldType::BooleanField)
	}

	pub fn char(name: impl Into<String>, max_length: usize) -> Self {
		let mut field = Self::new(name, FieldType::CharField);
		field.max_length = Some(max_length);
		field
	}

	pub fn text(name: impl Into<String>) -> Self {
		Self::new(name, FieldType::TextField)
	}

	pub fn foreign_key(
		name: impl Into<String>,
		to: impl Into<String>,
		on_delete: impl OnDeleteHandler,
	) -> Self {
		let mut field = Self::new(name, FieldType::ForeignKey);
		field.to = Some(to.into());
		field.on_delete = Some(Arc::new(on_delete));
		field
	}

	pub fn one_to_one(
		name: impl Into<String>,
		to: impl Into<String>,
		on_delete: impl OnDeleteHandler,
	) -> Self {
		let mut field = Self::new(name, FieldType::OneToOneField);
		field.to = Some(to.into());
		field.on_delete = Some(Arc::new(on_delete));
		field.unique = true;
		field
	}

	pub fn many_to_many(name: impl Into<String>, to: impl Into<String>) -> Self {
		let mut field = Self::new(name, FieldType::ManyToManyField);
		field.to = Some(to.into());
		field
	}

	/// Relation field with an already shared handler.
	pub fn relation_with_handler(
		name: impl Into<String>,
		field_type: FieldType,
		to: impl Into<String>,
		on_delete: Arc<dyn OnDeleteHandler>,
	) -> Self {
		let mut field = Self::new(name, field_type);
		field.to = Some(to.into());
		field.on_delete = Some(on_delete);
		field.unique = field_type == FieldType::OneToOneField;
		field
	}

	pub fn null(mut self) -> Self {
		self.null = true;
		self
	}

	pub fn default(mut self, value: impl Into<Value>) -> Self {
		self.default = Some(value.into());
		self
	}

	pub fn unique(mut self) -> Self {
		self.unique = true;
		self
	}

	pub fn primary_key(mut self) -> Self {
		self.primary_key = true;
		self
	}

	pub fn db_column(mut self, column: impl Into<String>) -> Self {
		self.db_column = Some(column.into());
		self
	}

	pub fn related_name(mut self, name: impl Into<String>) -> Self {
		self.related_name = Some(name.into());
		self
	}

	/// Marks a one-to-one field as the link to the parent model.
	pub fn parent_link(mut self) -> Self {
		self.parent_link = true;
		self
	}

	pub fn db_constraint(mut self, enabled: bool) -> Self {
		self.db_constraint = enabled;
		self
	}

	pub fn through(mut self, label: impl Into<String>) -> Self {
		self.through = Some(label.into());
		self
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn field_type(&self) -> FieldType {
		self.field_type
	}
}

/// Resolved relation of a foreign key / one-to-one field
#[derive(Debug, Clone)]
pub struct RelationMeta {
	/// Target model label
	pub to: String,
	pub on_delete: Arc<dyn OnDeleteHandler>,
	pub related_name: Option<String>,
	/// Name used to traverse the relation backwards in lookups
	pub related_query_name: String,
	pub parent_link: bool,
	pub db_constraint: bool,
}

impl RelationMeta {
	/// Whether reverse accessors are disabled (`related_name = "+"`).
	pub fn is_hidden(&self) -> bool {
		self.related_name.as_deref().is_some_and(|n| n.ends_with('+'))
	}
}

/// Resolved many-to-many relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManyToManyMeta {
	pub to: String,
	/// Label of the (possibly auto-created) through model
	pub through: String,
	/// Through field pointing at the declaring model
	pub source_field: String,
	/// Through field pointing at the target model
	pub target_field: String,
	pub related_name: Option<String>,
}

/// Resolved field metadata
#[derive(Debug, Clone)]
pub struct FieldMeta {
	pub name: String,
	/// Attribute name (`<name>_id` for foreign keys)
	pub attname: String,
	pub column: String,
	pub field_type: FieldType,
	pub max_length: Option<usize>,
	pub null: bool,
	pub default: Option<Value>,
	pub unique: bool,
	pub primary_key: bool,
	/// Label of the model that declares this field
	pub model: String,
	pub relation: Option<RelationMeta>,
	pub many_to_many: Option<ManyToManyMeta>,
	/// Added by the framework rather than declared (parent links, discriminator)
	pub auto_created: bool,
}

impl FieldMeta {
	pub fn is_concrete(&self) -> bool {
		self.field_type.is_concrete()
	}

	pub fn is_parent_link(&self) -> bool {
		self.relation.as_ref().is_some_and(|r| r.parent_link)
	}

	pub fn column_kind(&self) -> ColumnKind {
		self.field_type.column_kind()
	}

	/// Default value for new instances.
	pub fn get_default(&self) -> Value {
		self.default.clone().unwrap_or(Value::Null)
	}
}

/// Reverse view of a relation field, as seen from its target model
#[derive(Debug, Clone)]
pub struct RelatedField {
	/// Declaring model label
	pub model: String,
	/// Target model label
	pub target: String,
	pub field: FieldMeta,
}

impl RelatedField {
	pub fn on_delete(&self) -> Option<&Arc<dyn OnDeleteHandler>> {
		self.field.relation.as_ref().map(|r| &r.on_delete)
	}

	pub fn is_parent_link(&self) -> bool {
		self.field.is_parent_link()
	}

	pub fn is_one_to_one(&self) -> bool {
		self.field.field_type == FieldType::OneToOneField
	}

	/// Human readable `app.Model.field`
	pub fn describe(&self) -> String {
		format!("{}.{}", self.model, self.field.name)
	}
}

/// Handler used for framework-generated parent links.
pub(crate) fn parent_link_handler() -> Arc<dyn OnDeleteHandler> {
	Arc::new(OnDelete::Cascade)
}
