//! Dynamic model instances

use super::connection::DatabaseConnection;
use super::model::ModelMeta;
use super::registry::ModelRegistry;
use super::value::{Row, Value};
use crate::polymorphic::collector::{DeletionOutcome, PolymorphicCollector};
use polymorph_core::Result;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;

/// A row of a model, with the values of every table in its chain
///
/// Values are keyed by attribute name (`owner_id` for a foreign key `owner`).
#[derive(Clone)]
pub struct Instance {
	meta: Arc<ModelMeta>,
	values: Row,
}

impl Instance {
	/// Unsaved instance with field defaults.
	pub fn new(registry: &ModelRegistry, label: &str) -> Result<Self> {
		let meta = registry.get(label)?;
		let mut values = Row::new();
		for (_, field) in registry.concrete_fields(label)? {
			values.insert(field.attname.clone(), field.get_default());
		}
		Ok(Self { meta, values })
	}

	pub(crate) fn from_row(meta: Arc<ModelMeta>, values: Row) -> Self {
		Self { meta, values }
	}

	pub fn meta(&self) -> &Arc<ModelMeta> {
		&self.meta
	}

	/// `app.Model`
	pub fn label(&self) -> String {
		self.meta.label()
	}

	pub fn model_name(&self) -> &str {
		&self.meta.name
	}

	pub fn pk(&self) -> Option<i64> {
		self.values.get(self.meta.pk_attname()).and_then(Value::as_i64)
	}

	/// Value by field name, attname, or `pk`.
	pub fn get(&self, name: &str) -> Option<&Value> {
		if name == "pk" {
			return self.values.get(self.meta.pk_attname());
		}
		self.values
			.get(name)
			.or_else(|| self.values.get(&format!("{}_id", name)))
	}

	/// Text value of a field, if it holds one.
	pub fn get_str(&self, name: &str) -> Option<&str> {
		self.get(name).and_then(Value::as_str)
	}

	/// Assign by field name or attname. Foreign keys take the target pk.
	pub fn set(&mut self, name: &str, value: impl Into<Value>) {
		let key = if name == "pk" {
			self.meta.pk_attname().to_string()
		} else if self.values.contains_key(name) {
			name.to_string()
		} else {
			let attname = format!("{}_id", name);
			if self.values.contains_key(&attname) {
				attname
			} else {
				name.to_string()
			}
		};
		self.values.insert(key, value.into());
	}

	pub fn values(&self) -> &Row {
		&self.values
	}

	pub(crate) fn values_mut(&mut self) -> &mut Row {
		&mut self.values
	}

	/// The same identity seen as `label`, an ancestor of this instance's
	/// model. Values of the ancestor chain are copied over.
	pub fn project(&self, registry: &ModelRegistry, label: &str) -> Result<Instance> {
		let meta = registry.get(label)?;
		let pk = self.pk().map(Value::Int).unwrap_or_default();
		let mut values = Row::new();
		for (_, field) in registry.concrete_fields(label)? {
			let value = if field.primary_key && field.model == meta.label() {
				pk.clone()
			} else {
				self.values.get(&field.attname).cloned().unwrap_or_default()
			};
			values.insert(field.attname.clone(), value);
		}
		Ok(Self { meta, values })
	}

	pub fn to_json(&self) -> serde_json::Value {
		let map: serde_json::Map<String, serde_json::Value> = self
			.values
			.iter()
			.map(|(k, v)| (k.clone(), v.to_json()))
			.collect();
		serde_json::Value::Object(map)
	}

	/// Deserialize the values into a typed struct.
	pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
		Ok(serde_json::from_value(self.to_json())?)
	}

	/// Delete this object with everything depending on it.
	///
	/// With `keep_parents`, ancestor rows are kept and the discriminator is
	/// pointed at the direct parent class.
	pub async fn delete(&self, conn: &DatabaseConnection, keep_parents: bool) -> Result<DeletionOutcome> {
		PolymorphicCollector::new(conn.clone())
			.keep_parents(keep_parents)
			.add_instances(vec![self.clone()])
			.await?
			.execute()
			.await
	}
}

impl PartialEq for Instance {
	fn eq(&self, other: &Self) -> bool {
		self.meta.label() == other.meta.label() && self.pk().is_some() && self.pk() == other.pk()
	}
}

impl fmt::Debug for Instance {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Instance")
			.field("model", &self.meta.label())
			.field("values", &self.values)
			.finish()
	}
}

impl fmt::Display for Instance {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if let Some(repr) = &self.meta.repr {
			return repr.fmt_instance(self, f);
		}
		match self.pk() {
			Some(pk) => write!(f, "{} object ({})", self.meta.name, pk),
			None => write!(f, "{} object (None)", self.meta.name),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::orm::{Field, ModelDef, OnDelete};
	use rstest::{fixture, rstest};
	use serde::Deserialize;

	#[fixture]
	fn registry() -> ModelRegistry {
		ModelRegistry::builder()
			.model(ModelDef::new("tests", "Owner"))
			.model(
				ModelDef::new("tests", "Pet")
					.field(Field::char("name", 20).default("rex"))
					.field(Field::foreign_key("owner", "Owner", OnDelete::Cascade).null()),
			)
			.model(ModelDef::new("tests", "Dog").parent("Pet").field(Field::boolean("good")))
			.build()
			.unwrap()
	}

	#[rstest]
	fn test_new_uses_defaults(registry: ModelRegistry) {
		let pet = Instance::new(&registry, "tests.Pet").unwrap();

		assert_eq!(pet.get_str("name"), Some("rex"));
		assert_eq!(pet.pk(), None);
		assert_eq!(pet.to_string(), "Pet object (None)");
	}

	#[rstest]
	fn test_foreign_key_set_by_field_name(registry: ModelRegistry) {
		let mut pet = Instance::new(&registry, "tests.Pet").unwrap();

		pet.set("owner", 3);

		assert_eq!(pet.values().get("owner_id"), Some(&Value::Int(3)));
		assert_eq!(pet.get("owner"), Some(&Value::Int(3)));
	}

	#[rstest]
	fn test_project_to_parent(registry: ModelRegistry) {
		let mut dog = Instance::new(&registry, "tests.Dog").unwrap();
		dog.set("pk", 5);
		dog.set("id", 5);
		dog.set("good", true);

		let pet = dog.project(&registry, "tests.Pet").unwrap();

		assert_eq!(pet.label(), "tests.Pet");
		assert_eq!(pet.pk(), Some(5));
		assert_eq!(pet.get("good"), None);
		assert_eq!(pet.get_str("name"), Some("rex"));
	}

	#[rstest]
	fn test_deserialize(registry: ModelRegistry) {
		#[derive(Deserialize)]
		struct Pet {
			name: String,
			owner_id: Option<i64>,
		}
		let mut pet = Instance::new(&registry, "tests.Pet").unwrap();
		pet.set("owner", 9);

		let typed: Pet = pet.deserialize().unwrap();

		assert_eq!(typed.name, "rex");
		assert_eq!(typed.owner_id, Some(9));
	}
}
