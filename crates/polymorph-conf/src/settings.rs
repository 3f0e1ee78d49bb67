//! Polymorphic ORM settings

use crate::sources::{ConfigSource, DefaultSource, EnvSource, SourceError, TomlFileSource};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Rows materialized per subclass query.
pub const DEFAULT_CHUNK_SIZE: usize = 2000;

/// Primary keys per generated DELETE/UPDATE statement.
pub const DEFAULT_DELETE_BATCH_SIZE: usize = 500;

/// Database connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
	pub url: String,
	pub max_connections: u32,
}

impl Default for DatabaseSettings {
	fn default() -> Self {
		Self {
			url: "sqlite::memory:".to_string(),
			max_connections: 1,
		}
	}
}

/// Settings consumed by the ORM and the polymorphic layer
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolymorphicSettings {
	pub chunk_size: usize,
	/// Fall back to the nearest ancestor when a concrete row is missing.
	/// When disabled such rows are skipped.
	pub best_effort: bool,
	pub delete_batch_size: usize,
	/// Treat system-check warnings as startup errors.
	pub strict_checks: bool,
	pub database: DatabaseSettings,
}

impl Default for PolymorphicSettings {
	fn default() -> Self {
		Self {
			chunk_size: DEFAULT_CHUNK_SIZE,
			best_effort: true,
			delete_batch_size: DEFAULT_DELETE_BATCH_SIZE,
			strict_checks: false,
			database: DatabaseSettings::default(),
		}
	}
}

impl PolymorphicSettings {
	pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
		self.chunk_size = chunk_size.max(1);
		self
	}

	pub fn with_best_effort(mut self, enabled: bool) -> Self {
		self.best_effort = enabled;
		self
	}

	pub fn with_delete_batch_size(mut self, size: usize) -> Self {
		self.delete_batch_size = size.max(1);
		self
	}

	pub fn with_strict_checks(mut self, strict: bool) -> Self {
		self.strict_checks = strict;
		self
	}

	pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
		self.database.url = url.into();
		self
	}

	/// Defaults, then `polymorph.toml` in the working directory, then
	/// `POLYMORPH_*` environment variables.
	pub fn load() -> Result<Self, SourceError> {
		SettingsBuilder::new()
			.add_source(DefaultSource::new())
			.add_source(TomlFileSource::new(PathBuf::from("polymorph.toml")))
			.add_source(EnvSource::new())
			.build()
	}
}

/// Merges configuration sources into [`PolymorphicSettings`]
#[derive(Default)]
pub struct SettingsBuilder {
	sources: Vec<Box<dyn ConfigSource>>,
}

impl SettingsBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_source<S: ConfigSource + 'static>(mut self, source: S) -> Self {
		self.sources.push(Box::new(source));
		self
	}

	/// Merge all sources by ascending priority and deserialize.
	///
	/// # Examples
	///
	/// ```
	/// use polymorph_conf::settings::SettingsBuilder;
	/// use polymorph_conf::sources::DefaultSource;
	/// use serde_json::Value;
	///
	/// let settings = SettingsBuilder::new()
	///     .add_source(DefaultSource::new().with_value("chunk_size", Value::from(100)))
	///     .build()
	///     .unwrap();
	/// assert_eq!(settings.chunk_size, 100);
	/// assert!(settings.best_effort);
	/// ```
	pub fn build(mut self) -> Result<PolymorphicSettings, SourceError> {
		self.sources.sort_by_key(|s| s.priority());

		let mut merged: IndexMap<String, Value> = IndexMap::new();
		for source in &self.sources {
			let values = source.load()?;
			tracing::debug!(source = %source.description(), keys = values.len(), "loaded settings source");
			for (key, value) in values {
				match (merged.get_mut(&key), value) {
					(Some(Value::Object(existing)), Value::Object(incoming)) => {
						existing.extend(incoming);
					}
					(_, value) => {
						merged.insert(key, value);
					}
				}
			}
		}

		let object: serde_json::Map<String, Value> = merged.into_iter().collect();
		let settings: PolymorphicSettings = serde_json::from_value(Value::Object(object))?;
		if settings.chunk_size == 0 || settings.delete_batch_size == 0 {
			return Err(SourceError::InvalidSource(
				"chunk_size and delete_batch_size must be positive".to_string(),
			));
		}
		Ok(settings)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	fn test_defaults() {
		let settings = PolymorphicSettings::default();

		assert_eq!(settings.chunk_size, 2000);
		assert!(settings.best_effort);
		assert_eq!(settings.database.url, "sqlite::memory:");
	}

	#[rstest]
	fn test_higher_priority_wins_and_nested_merges() {
		struct High;
		impl ConfigSource for High {
			fn load(&self) -> Result<IndexMap<String, Value>, SourceError> {
				let mut map = IndexMap::new();
				map.insert("best_effort".to_string(), Value::Bool(false));
				map.insert(
					"database".to_string(),
					serde_json::json!({ "max_connections": 4 }),
				);
				Ok(map)
			}
			fn priority(&self) -> u8 {
				100
			}
			fn description(&self) -> String {
				"high".to_string()
			}
		}

		let settings = SettingsBuilder::new()
			.add_source(High)
			.add_source(
				DefaultSource::new()
					.with_value("best_effort", Value::Bool(true))
					.with_value("database", serde_json::json!({ "url": "sqlite://x.db" })),
			)
			.build()
			.unwrap();

		assert!(!settings.best_effort);
		assert_eq!(settings.database.url, "sqlite://x.db");
		assert_eq!(settings.database.max_connections, 4);
	}

	#[rstest]
	fn test_zero_chunk_size_rejected() {
		let result = SettingsBuilder::new()
			.add_source(DefaultSource::new().with_value("chunk_size", Value::from(0)))
			.build();

		assert!(matches!(result, Err(SourceError::InvalidSource(_))));
	}
}
