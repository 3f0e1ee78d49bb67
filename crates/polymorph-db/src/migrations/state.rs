//! Project state: the schema-relevant part of the model registry

use super::operations::Operation;
use super::{MigrationError, Result};
use crate::orm::{FieldMeta, FieldType, ModelMeta, ModelRegistry, OnDeleteHandler};
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Relation part of a field state
#[derive(Clone)]
pub struct RelationState {
	pub to: String,
	pub on_delete: Arc<dyn OnDeleteHandler>,
	pub related_name: Option<String>,
	pub parent_link: bool,
	pub db_constraint: bool,
}

impl RelationState {
	pub fn new(to: impl Into<String>, on_delete: impl OnDeleteHandler) -> Self {
		Self::with_handler(to, Arc::new(on_delete))
	}

	pub fn with_handler(to: impl Into<String>, on_delete: Arc<dyn OnDeleteHandler>) -> Self {
		Self {
			to: to.into(),
			on_delete,
			related_name: None,
			parent_link: false,
			db_constraint: true,
		}
	}

	pub fn related_name(mut self, name: impl Into<String>) -> Self {
		self.related_name = Some(name.into());
		self
	}

	pub fn parent_link(mut self) -> Self {
		self.parent_link = true;
		self
	}

	pub fn db_constraint(mut self, enabled: bool) -> Self {
		self.db_constraint = enabled;
		self
	}
}

impl PartialEq for RelationState {
	fn eq(&self, other: &Self) -> bool {
		self.to == other.to
			&& self.on_delete.reference() == other.on_delete.reference()
			&& self.related_name == other.related_name
			&& self.parent_link == other.parent_link
			&& self.db_constraint == other.db_constraint
	}
}

impl fmt::Debug for RelationState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RelationState")
			.field("to", &self.to)
			.field("on_delete", &self.on_delete.reference().to_string())
			.field("related_name", &self.related_name)
			.field("parent_link", &self.parent_link)
			.field("db_constraint", &self.db_constraint)
			.finish()
	}
}

/// Schema-relevant description of a field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldState {
	pub name: String,
	pub field_type: FieldType,
	pub nullable: bool,
	/// Remaining options as text (`max_length`, `primary_key`, `unique`, ...)
	pub params: BTreeMap<String, String>,
	pub relation: Option<RelationState>,
}

impl FieldState {
	pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
		Self {
			name: name.into(),
			field_type,
			nullable: false,
			params: BTreeMap::new(),
			relation: None,
		}
	}

	pub fn null(mut self) -> Self {
		self.nullable = true;
		self
	}

	pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.params.insert(key.into(), value.into());
		self
	}

	pub fn relation(mut self, relation: RelationState) -> Self {
		self.relation = Some(relation);
		self
	}

	pub fn from_meta(field: &FieldMeta) -> Self {
		let mut state = Self::new(&field.name, field.field_type);
		state.nullable = field.null;
		if let Some(max_length) = field.max_length {
			state = state.param("max_length", max_length.to_string());
		}
		if field.primary_key {
			state = state.param("primary_key", "true");
		}
		if field.unique && !field.primary_key {
			state = state.param("unique", "true");
		}
		if let Some(default) = &field.default {
			state = state.param("default", default.to_string());
		}
		if field.is_concrete() && field.column != field.attname {
			state = state.param("db_column", &field.column);
		}
		if let Some(m2m) = &field.many_to_many {
			state = state.param("to", &m2m.to).param("through", &m2m.through);
		}
		if let Some(relation) = &field.relation {
			state.relation = Some(RelationState {
				to: relation.to.clone(),
				on_delete: Arc::clone(&relation.on_delete),
				related_name: relation.related_name.clone(),
				parent_link: relation.parent_link,
				db_constraint: relation.db_constraint,
			});
		}
		state
	}
}

/// Schema-relevant description of a model
#[derive(Debug, Clone, PartialEq)]
pub struct ModelState {
	pub app_label: String,
	pub name: String,
	pub db_table: String,
	/// Parent label for multi-table inheritance
	pub bases: Option<String>,
	/// Fields in declaration order
	pub fields: IndexMap<String, FieldState>,
	/// Managers available to migrations
	pub managers: Vec<String>,
}

impl ModelState {
	pub fn new(app_label: impl Into<String>, name: impl Into<String>) -> Self {
		let app_label = app_label.into();
		let name = name.into();
		Self {
			db_table: format!("{}_{}", app_label.to_lowercase(), name.to_lowercase()),
			app_label,
			name,
			bases: None,
			fields: IndexMap::new(),
			managers: Vec::new(),
		}
	}

	pub fn from_meta(meta: &ModelMeta) -> Self {
		Self {
			app_label: meta.app_label.clone(),
			name: meta.name.clone(),
			db_table: meta.db_table.clone(),
			bases: meta.parent.clone(),
			fields: meta
				.fields
				.iter()
				.map(|f| (f.name.clone(), FieldState::from_meta(f)))
				.collect(),
			managers: meta
				.managers
				.iter()
				.filter(|m| m.use_in_migrations())
				.map(|m| m.name().to_string())
				.collect(),
		}
	}

	pub fn key(&self) -> (String, String) {
		(self.app_label.clone(), self.name.to_lowercase())
	}

	pub fn label(&self) -> String {
		format!("{}.{}", self.app_label, self.name)
	}
}

/// All model states of a project, keyed by `(app_label, lower-case name)`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectState {
	pub models: BTreeMap<(String, String), ModelState>,
}

impl ProjectState {
	pub fn new() -> Self {
		Self::default()
	}

	/// State of every registered model except auto-created through models.
	pub fn from_registry(registry: &ModelRegistry) -> Self {
		let mut state = Self::new();
		for meta in registry.models().filter(|m| !m.auto_created) {
			state.add_model(ModelState::from_meta(meta));
		}
		state
	}

	pub fn add_model(&mut self, model: ModelState) {
		self.models.insert(model.key(), model);
	}

	pub fn get_model(&self, app_label: &str, name: &str) -> Option<&ModelState> {
		self.models.get(&(app_label.to_string(), name.to_lowercase()))
	}

	fn model_mut(&mut self, app_label: &str, name: &str) -> Result<&mut ModelState> {
		self.models
			.get_mut(&(app_label.to_string(), name.to_lowercase()))
			.ok_or_else(|| MigrationError::ModelNotFound {
				app_label: app_label.to_string(),
				name: name.to_string(),
			})
	}

	/// Replay one operation.
	pub fn apply(&mut self, operation: &Operation) -> Result<()> {
		match operation {
			Operation::CreateModel {
				app_label,
				name,
				fields,
				bases,
				managers,
			} => {
				let mut model = ModelState::new(app_label.clone(), name.clone());
				model.bases = bases.clone();
				model.managers = managers.clone();
				model.fields = fields.iter().map(|f| (f.name.clone(), f.clone())).collect();
				self.add_model(model);
			}
			Operation::DeleteModel { app_label, name } => {
				self.model_mut(app_label, name)?;
				self.models.remove(&(app_label.clone(), name.to_lowercase()));
			}
			Operation::AddField {
				app_label,
				model_name,
				field,
			} => {
				let model = self.model_mut(app_label, model_name)?;
				if model.fields.contains_key(&field.name) {
					return Err(MigrationError::InvalidMigration(format!(
						"{}.{} already has a field '{}'",
						app_label, model_name, field.name
					)));
				}
				model.fields.insert(field.name.clone(), field.clone());
			}
			Operation::RemoveField {
				app_label,
				model_name,
				name,
			} => {
				let model = self.model_mut(app_label, model_name)?;
				if model.fields.shift_remove(name).is_none() {
					return Err(MigrationError::FieldNotFound {
						model: format!("{}.{}", app_label, model_name),
						field: name.clone(),
					});
				}
			}
			Operation::AlterField {
				app_label,
				model_name,
				field,
			} => {
				let model = self.model_mut(app_label, model_name)?;
				let Some(slot) = model.fields.get_mut(&field.name) else {
					return Err(MigrationError::FieldNotFound {
						model: format!("{}.{}", app_label, model_name),
						field: field.name.clone(),
					});
				};
				*slot = field.clone();
			}
		}
		Ok(())
	}

	pub fn apply_all<'a>(&mut self, operations: impl IntoIterator<Item = &'a Operation>) -> Result<()> {
		for operation in operations {
			self.apply(operation)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::orm::{Field, ModelDef, OnDelete};
	use crate::polymorphic::{PolymorphicGuard, PolymorphicHook};
	use rstest::rstest;

	#[rstest]
	fn test_relation_states_compare_through_references() {
		let plain = RelationState::new("tests.Model2A", OnDelete::Protect);
		let guarded = RelationState::new("tests.Model2A", PolymorphicGuard::new(OnDelete::Protect));

		assert_eq!(plain, guarded);
		assert_ne!(plain, RelationState::new("tests.Model2A", OnDelete::Cascade));
	}

	#[rstest]
	fn test_from_registry_includes_discriminator_and_skips_through_models() {
		// Arrange
		let registry = ModelRegistry::builder()
			.hook(PolymorphicHook::new())
			.model(
				ModelDef::new("tests", "Model2A")
					.polymorphic()
					.field(Field::char("field1", 30))
					.field(Field::many_to_many("peers", "Model2A")),
			)
			.build()
			.unwrap();

		// Act
		let state = ProjectState::from_registry(&registry);

		// Assert
		let model = state.get_model("tests", "Model2A").unwrap();
		let names: Vec<&str> = model.fields.keys().map(String::as_str).collect();
		assert_eq!(names, vec!["id", "polymorphic_ctype", "field1", "peers"]);
		assert!(model.managers.is_empty());
		assert!(state.get_model("tests", "Model2A_peers").is_none());
		assert_eq!(model.fields["field1"].params.get("max_length").map(String::as_str), Some("30"));
	}

	#[rstest]
	fn test_apply_replays_operations() {
		let mut state = ProjectState::new();
		let operations = vec![
			Operation::CreateModel {
				app_label: "tests".into(),
				name: "Model2A".into(),
				fields: vec![FieldState::new("id", FieldType::AutoField).param("primary_key", "true")],
				bases: None,
				managers: Vec::new(),
			},
			Operation::AddField {
				app_label: "tests".into(),
				model_name: "Model2A".into(),
				field: FieldState::new("field1", FieldType::CharField),
			},
			Operation::RemoveField {
				app_label: "tests".into(),
				model_name: "Model2A".into(),
				name: "id".into(),
			},
		];

		state.apply_all(&operations).unwrap();

		let model = state.get_model("tests", "model2a").unwrap();
		assert_eq!(model.fields.keys().collect::<Vec<_>>(), vec!["field1"]);
	}

	#[rstest]
	fn test_apply_rejects_unknown_models() {
		let mut state = ProjectState::new();

		let result = state.apply(&Operation::DeleteModel {
			app_label: "tests".into(),
			name: "Missing".into(),
		});

		assert!(matches!(result, Err(MigrationError::ModelNotFound { .. })));
	}
}
