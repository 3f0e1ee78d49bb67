//! Content types
//!
//! One `contenttypes.ContentType` row per registered model, identified by
//! `(app_label, model)`. Polymorphic models store the id of their concrete
//! class's row as their discriminator.
//!
//! Rows are synchronized once by `DatabaseConnection::migrate`. After that the
//! cache is only read, except when an id unknown to the cache is looked up.

use crate::orm::{DatabaseConnection, Field, Instance, ModelDef, ModelMeta, ModelRegistry, Q, Value};
use parking_lot::RwLock;
use polymorph_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const CONTENT_TYPE_LABEL: &str = "contenttypes.ContentType";

/// Declaration of the content type model, registered with every registry.
pub fn content_type_model() -> ModelDef {
	ModelDef::new("contenttypes", "ContentType")
		.field(Field::char("app_label", 100))
		.field(Field::char("model", 100))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentType {
	pub id: i64,
	pub app_label: String,
	/// Lower-case model name
	pub model: String,
}

impl ContentType {
	fn from_instance(instance: &Instance) -> Result<Self> {
		let malformed = || Error::Database(format!("malformed content type row: {:?}", instance.values()));
		Ok(Self {
			id: instance.pk().ok_or_else(malformed)?,
			app_label: instance.get_str("app_label").ok_or_else(malformed)?.to_string(),
			model: instance.get_str("model").ok_or_else(malformed)?.to_string(),
		})
	}

	pub fn natural_key(&self) -> (&str, &str) {
		(&self.app_label, &self.model)
	}
}

impl fmt::Display for ContentType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} | {}", self.app_label, self.model)
	}
}

#[derive(Debug, Default)]
struct Cache {
	by_id: HashMap<i64, ContentType>,
	by_key: HashMap<(String, String), i64>,
}

impl Cache {
	fn insert(&mut self, ct: ContentType) {
		self.by_key.insert((ct.app_label.clone(), ct.model.clone()), ct.id);
		self.by_id.insert(ct.id, ct);
	}
}

/// Cache of content type rows
#[derive(Debug, Default)]
pub struct ContentTypeManager {
	cache: RwLock<Cache>,
}

fn split_label(label: &str) -> Result<(String, String)> {
	label
		.split_once('.')
		.map(|(app, name)| (app.to_string(), name.to_lowercase()))
		.ok_or_else(|| Error::ImproperlyConfigured(format!("'{}' is not an app-qualified model label", label)))
}

impl ContentTypeManager {
	pub fn new() -> Self {
		Self::default()
	}

	/// Load existing rows and create the missing ones. Returns the number
	/// of rows created.
	pub async fn sync(&self, conn: &DatabaseConnection) -> Result<usize> {
		let mut cache = Cache::default();
		for row in conn.base_objects(CONTENT_TYPE_LABEL)?.fetch().await? {
			cache.insert(ContentType::from_instance(&row)?);
		}

		let mut created = 0;
		for meta in conn.registry().models() {
			let key = (meta.app_label.clone(), meta.model_name.clone());
			if cache.by_key.contains_key(&key) {
				continue;
			}
			let row = conn
				.create(
					CONTENT_TYPE_LABEL,
					vec![
						("app_label", Value::from(key.0.as_str())),
						("model", Value::from(key.1.as_str())),
					],
				)
				.await?;
			cache.insert(ContentType::from_instance(&row)?);
			created += 1;
		}

		let total = cache.by_id.len();
		*self.cache.write() = cache;
		tracing::info!(created, total, "content types synchronized");
		Ok(created)
	}

	/// Content type of a model label (`app.Name`).
	pub fn get_for_model(&self, label: &str) -> Result<ContentType> {
		let key = split_label(label)?;
		let cache = self.cache.read();
		cache
			.by_key
			.get(&key)
			.and_then(|id| cache.by_id.get(id))
			.cloned()
			.ok_or_else(|| {
				Error::ImproperlyConfigured(format!(
					"no content type for '{}'; run migrate() first",
					label
				))
			})
	}

	/// Content type by id, loading it from the database on a cache miss.
	pub async fn get_for_id(&self, conn: &DatabaseConnection, id: i64) -> Result<ContentType> {
		if let Some(ct) = self.get_for_id_cached(id) {
			return Ok(ct);
		}
		let rows = conn
			.base_objects(CONTENT_TYPE_LABEL)?
			.filter(Q::pk_in([id]))?
			.fetch()
			.await?;
		let row = rows.first().ok_or(Error::ContentTypeNotFound(id))?;
		let ct = ContentType::from_instance(row)?;
		self.cache.write().insert(ct.clone());
		Ok(ct)
	}

	pub fn get_for_id_cached(&self, id: i64) -> Option<ContentType> {
		self.cache.read().by_id.get(&id).cloned()
	}

	/// The model a content type stands for, if it is still registered.
	pub fn model_class(&self, registry: &ModelRegistry, ct: &ContentType) -> Option<Arc<ModelMeta>> {
		registry.get_by_app_and_name(&ct.app_label, &ct.model)
	}

	/// Ids of the content types of `labels`.
	pub fn ids_for_models<S: AsRef<str>>(&self, labels: &[S]) -> Result<Vec<i64>> {
		labels
			.iter()
			.map(|label| self.get_for_model(label.as_ref()).map(|ct| ct.id))
			.collect()
	}

	pub fn clear_cache(&self) {
		*self.cache.write() = Cache::default();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::{fixture, rstest};

	#[fixture]
	async fn conn() -> DatabaseConnection {
		let registry = ModelRegistry::builder()
			.model(ModelDef::new("tests", "Model2A"))
			.model(ModelDef::new("tests", "Model2B").parent("Model2A"))
			.build()
			.unwrap();
		let conn = DatabaseConnection::memory(Arc::new(registry));
		conn.migrate().await.unwrap();
		conn
	}

	#[rstest]
	#[tokio::test]
	async fn test_sync_creates_one_row_per_model(#[future] conn: DatabaseConnection) {
		// Arrange
		let conn = conn.await;

		// Act
		let created_again = conn.content_types().sync(&conn).await.unwrap();
		let ct = conn.content_types().get_for_model("tests.Model2B").unwrap();

		// Assert
		assert_eq!(created_again, 0);
		assert_eq!(ct.natural_key(), ("tests", "model2b"));
		assert_eq!(
			conn.content_types().model_class(conn.registry(), &ct).map(|m| m.label()),
			Some("tests.Model2B".to_string())
		);
	}

	#[rstest]
	#[tokio::test]
	async fn test_get_for_id_loads_on_cache_miss(#[future] conn: DatabaseConnection) {
		// Arrange
		let conn = conn.await;
		let ct = conn.content_types().get_for_model("tests.Model2A").unwrap();
		conn.content_types().clear_cache();

		// Act
		let loaded = conn.content_types().get_for_id(&conn, ct.id).await.unwrap();

		// Assert
		assert_eq!(loaded, ct);
	}

	#[rstest]
	#[tokio::test]
	async fn test_unknown_id_is_not_found(#[future] conn: DatabaseConnection) {
		// Arrange
		let conn = conn.await;

		// Act
		let result = conn.content_types().get_for_id(&conn, 9999).await;

		// Assert
		assert!(matches!(result, Err(Error::ContentTypeNotFound(9999))));
	}

	#[rstest]
	#[tokio::test]
	async fn test_row_of_removed_model_has_no_class(#[future] conn: DatabaseConnection) {
		// Arrange
		let conn = conn.await;
		let row = conn
			.create(CONTENT_TYPE_LABEL, vec![("app_label", "gone".into()), ("model", "oldmodel".into())])
			.await
			.unwrap();

		// Act
		let ct = conn.content_types().get_for_id(&conn, row.pk().unwrap()).await.unwrap();

		// Assert
		assert!(conn.content_types().model_class(conn.registry(), &ct).is_none());
	}
}
