//! # polymorph-conf
//!
//! Layered settings for the polymorphic ORM. Values come from defaults,
//! TOML files and `POLYMORPH_*` environment variables, merged by priority.

pub mod settings;
pub mod sources;

pub use settings::{DatabaseSettings, PolymorphicSettings, SettingsBuilder};
pub use sources::{ConfigSource, DefaultSource, EnvSource, SourceError, TomlFileSource};
