//! Configuration sources for layered settings
//!
//! Sources are merged in priority order
//! (environment variables > config files > defaults).

use indexmap::IndexMap;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;

/// Trait for configuration sources
pub trait ConfigSource: Send + Sync {
	/// Load configuration from this source
	fn load(&self) -> Result<IndexMap<String, Value>, SourceError>;

	/// Get the priority of this source (higher = more important)
	fn priority(&self) -> u8;

	/// Get a description of this source
	fn description(&self) -> String;
}

/// Error type for configuration sources
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("Parse error: {0}")]
	Parse(String),

	#[error("TOML error: {0}")]
	Toml(#[from] toml::de::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("Invalid source: {0}")]
	InvalidSource(String),
}

/// Environment variable configuration source
///
/// `POLYMORPH_CHUNK_SIZE=10` becomes `chunk_size = 10`;
/// `POLYMORPH_DATABASE__URL=...` becomes `database.url`.
pub struct EnvSource {
	prefix: String,
}

impl EnvSource {
	/// Create a source reading variables that start with `POLYMORPH_`
	///
	/// # Examples
	///
	/// ```
	/// use polymorph_conf::sources::EnvSource;
	///
	/// let source = EnvSource::new().with_prefix("MYAPP_");
	/// ```
	pub fn new() -> Self {
		Self {
			prefix: "POLYMORPH_".to_string(),
		}
	}

	/// Set the prefix filter for environment variables
	pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.prefix = prefix.into();
		self
	}

	fn parse_value(raw: &str) -> Value {
		match raw.trim().to_lowercase().as_str() {
			"true" | "yes" | "on" => return Value::Bool(true),
			"false" | "no" | "off" => return Value::Bool(false),
			_ => {}
		}
		if let Ok(num) = raw.parse::<i64>() {
			Value::Number(num.into())
		} else {
			Value::String(raw.to_string())
		}
	}

	/// Build a config map from `(key, value)` pairs. Split out of `load` so it
	/// can be exercised without touching the process environment.
	pub fn collect<I>(&self, vars: I) -> IndexMap<String, Value>
	where
		I: IntoIterator<Item = (String, String)>,
	{
		let mut config: IndexMap<String, Value> = IndexMap::new();
		for (key, value) in vars {
			let Some(clean_key) = key.strip_prefix(&self.prefix) else {
				continue;
			};
			let lower_key = clean_key.to_lowercase();
			let parsed = Self::parse_value(&value);
			match lower_key.split_once("__") {
				Some((section, field)) => {
					let entry = config
						.entry(section.to_string())
						.or_insert_with(|| Value::Object(serde_json::Map::new()));
					if let Value::Object(map) = entry {
						map.insert(field.to_string(), parsed);
					}
				}
				None => {
					config.insert(lower_key, parsed);
				}
			}
		}
		config
	}
}

impl Default for EnvSource {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigSource for EnvSource {
	fn load(&self) -> Result<IndexMap<String, Value>, SourceError> {
		Ok(self.collect(std::env::vars()))
	}

	fn priority(&self) -> u8 {
		100 // Highest priority
	}

	fn description(&self) -> String {
		format!("Environment variables (prefix: {})", self.prefix)
	}
}

/// TOML file configuration source
pub struct TomlFileSource {
	path: PathBuf,
}

impl TomlFileSource {
	/// Create a new TOML file configuration source
	///
	/// # Examples
	///
	/// ```
	/// use polymorph_conf::sources::TomlFileSource;
	///
	/// let source = TomlFileSource::new("polymorph.toml");
	/// ```
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

impl ConfigSource for TomlFileSource {
	fn load(&self) -> Result<IndexMap<String, Value>, SourceError> {
		if !self.path.exists() {
			return Ok(IndexMap::new());
		}

		let content = fs::read_to_string(&self.path)?;
		let toml_value: toml::Value = toml::from_str(&content)?;

		// TOML -> JSON
		let json_value = serde_json::to_value(&toml_value)?;

		let map = json_value
			.as_object()
			.ok_or_else(|| SourceError::Parse("Expected table at root".to_string()))?;

		Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
	}

	fn priority(&self) -> u8 {
		50 // Medium priority
	}

	fn description(&self) -> String {
		format!("TOML file: {}", self.path.display())
	}
}

/// Default values configuration source
pub struct DefaultSource {
	values: IndexMap<String, Value>,
}

impl DefaultSource {
	pub fn new() -> Self {
		Self {
			values: IndexMap::new(),
		}
	}

	/// Add a default value
	///
	/// # Examples
	///
	/// ```
	/// use polymorph_conf::sources::DefaultSource;
	/// use serde_json::Value;
	///
	/// let source = DefaultSource::new().with_value("chunk_size", Value::from(100));
	/// ```
	pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
		self.values.insert(key.into(), value);
		self
	}
}

impl Default for DefaultSource {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigSource for DefaultSource {
	fn load(&self) -> Result<IndexMap<String, Value>, SourceError> {
		Ok(self.values.clone())
	}

	fn priority(&self) -> u8 {
		0 // Lowest priority
	}

	fn description(&self) -> String {
		"Default values".to_string()
	}
}
