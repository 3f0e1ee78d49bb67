//! Dynamic column values

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A single column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
	#[default]
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	Text(String),
}

/// A database row keyed by column (or attribute) name
pub type Row = IndexMap<String, Value>;

impl Value {
	pub fn is_null(&self) -> bool {
		matches!(self, Value::Null)
	}

	pub fn as_i64(&self) -> Option<i64> {
		match self {
			Value::Int(i) => Some(*i),
			Value::Bool(b) => Some(i64::from(*b)),
			_ => None,
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Value::Text(s) => Some(s),
			_ => None,
		}
	}

	pub fn as_bool(&self) -> Option<bool> {
		match self {
			Value::Bool(b) => Some(*b),
			Value::Int(i) => Some(*i != 0),
			_ => None,
		}
	}

	/// SQL comparison: `None` when either side is NULL or the types are
	/// not comparable.
	pub fn sql_cmp(&self, other: &Value) -> Option<Ordering> {
		match (self, other) {
			(Value::Null, _) | (_, Value::Null) => None,
			(Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
			(Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
			(Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
			(Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
			(Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
			(Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
			(Value::Bool(a), Value::Int(b)) => Some(i64::from(*a).cmp(b)),
			(Value::Int(a), Value::Bool(b)) => Some(a.cmp(&i64::from(*b))),
			_ => None,
		}
	}

	/// SQL equality (three-valued)
	pub fn sql_eq(&self, other: &Value) -> Option<bool> {
		self.sql_cmp(other).map(|o| o == Ordering::Equal)
	}

	/// Ordering used by ORDER BY: NULLs first, then by value.
	pub fn order_cmp(&self, other: &Value) -> Ordering {
		match (self.is_null(), other.is_null()) {
			(true, true) => Ordering::Equal,
			(true, false) => Ordering::Less,
			(false, true) => Ordering::Greater,
			(false, false) => self.sql_cmp(other).unwrap_or(Ordering::Equal),
		}
	}

	/// Converts to JSON for instance serialization.
	pub fn to_json(&self) -> serde_json::Value {
		match self {
			Value::Null => serde_json::Value::Null,
			Value::Bool(b) => serde_json::Value::Bool(*b),
			Value::Int(i) => serde_json::Value::from(*i),
			Value::Float(f) => serde_json::Value::from(*f),
			Value::Text(s) => serde_json::Value::String(s.clone()),
		}
	}
}

impl fmt::Display for Value {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Value::Null => f.write_str("None"),
			Value::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
			Value::Int(i) => write!(f, "{}", i),
			Value::Float(v) => write!(f, "{}", v),
			Value::Text(s) => write!(f, "{}", s),
		}
	}
}

impl From<i64> for Value {
	fn from(v: i64) -> Self {
		Value::Int(v)
	}
}

impl From<i32> for Value {
	fn from(v: i32) -> Self {
		Value::Int(i64::from(v))
	}
}

impl From<f64> for Value {
	fn from(v: f64) -> Self {
		Value::Float(v)
	}
}

impl From<bool> for Value {
	fn from(v: bool) -> Self {
		Value::Bool(v)
	}
}

impl From<&str> for Value {
	fn from(v: &str) -> Self {
		Value::Text(v.to_string())
	}
}

impl From<String> for Value {
	fn from(v: String) -> Self {
		Value::Text(v)
	}
}

impl<T: Into<Value>> From<Option<T>> for Value {
	fn from(v: Option<T>) -> Self {
		v.map(Into::into).unwrap_or(Value::Null)
	}
}
