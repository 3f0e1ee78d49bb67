//! Filter expressions
//!
//! Django-style lookups (`field__path__lookup`) parsed into [`Filter`]s and
//! combined with [`FilterCondition`] (aliased as [`Q`]).

use super::value::Value;
use polymorph_core::{FieldError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOperator {
	Eq,
	Ne,
	Gt,
	Gte,
	Lt,
	Lte,
	In,
	NotIn,
	Contains,
	/// Case-insensitive contains
	IContains,
	StartsWith,
	EndsWith,
	/// Is null check
	IsNull,
	/// Is not null check
	IsNotNull,
}

impl FilterOperator {
	/// Parse a Django lookup suffix (`exact`, `in`, `startswith`, ...).
	pub fn from_lookup(lookup: &str) -> Option<Self> {
		Some(match lookup {
			"exact" => FilterOperator::Eq,
			"ne" => FilterOperator::Ne,
			"gt" => FilterOperator::Gt,
			"gte" => FilterOperator::Gte,
			"lt" => FilterOperator::Lt,
			"lte" => FilterOperator::Lte,
			"in" => FilterOperator::In,
			"contains" => FilterOperator::Contains,
			"icontains" => FilterOperator::IContains,
			"startswith" => FilterOperator::StartsWith,
			"endswith" => FilterOperator::EndsWith,
			"isnull" => FilterOperator::IsNull,
			_ => return None,
		})
	}
}

/// Right-hand side of a filter
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
	Single(Value),
	List(Vec<Value>),
	/// Model references (`Name` or `app.Name`), used by `instance_of`
	Models(Vec<String>),
}

impl FilterValue {
	pub fn as_single(&self) -> Option<&Value> {
		match self {
			FilterValue::Single(v) => Some(v),
			_ => None,
		}
	}
}

impl<T: Into<Value>> From<T> for FilterValue {
	fn from(v: T) -> Self {
		FilterValue::Single(v.into())
	}
}

impl From<Vec<Value>> for FilterValue {
	fn from(v: Vec<Value>) -> Self {
		FilterValue::List(v)
	}
}

impl From<Vec<i64>> for FilterValue {
	fn from(v: Vec<i64>) -> Self {
		FilterValue::List(v.into_iter().map(Value::Int).collect())
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
	/// Field path, without the lookup suffix
	pub field: String,
	pub operator: FilterOperator,
	pub value: FilterValue,
}

impl Filter {
	pub fn new(field: impl Into<String>, operator: FilterOperator, value: FilterValue) -> Self {
		Self {
			field: field.into(),
			operator,
			value,
		}
	}

	/// Parse `path__lookup` into a filter.
	///
	/// A trailing segment that is not a known lookup is part of the path,
	/// so `Model2B___field2` keeps its triple underscore intact.
	pub fn parse(lookup: &str, value: FilterValue) -> Result<Self> {
		let (path, operator) = match lookup.rsplit_once("__") {
			Some((path, suffix)) if !path.is_empty() => match FilterOperator::from_lookup(suffix) {
				Some(op) => (path, op),
				None => (lookup, FilterOperator::Eq),
			},
			_ => (lookup, FilterOperator::Eq),
		};

		let (operator, value) = match (operator, value) {
			(FilterOperator::IsNull, FilterValue::Single(v)) => match v.as_bool() {
				Some(true) => (FilterOperator::IsNull, FilterValue::Single(Value::Null)),
				Some(false) => (FilterOperator::IsNotNull, FilterValue::Single(Value::Null)),
				None => {
					return Err(FieldError::UnsupportedLookup {
						field: path.to_string(),
						lookup: "isnull".to_string(),
					}
					.into());
				}
			},
			(FilterOperator::In, FilterValue::Single(v)) => (FilterOperator::In, FilterValue::List(vec![v])),
			(FilterOperator::Eq, FilterValue::List(list)) => (FilterOperator::In, FilterValue::List(list)),
			(op, value) => (op, value),
		};

		Ok(Self::new(path, operator, value))
	}
}

/// Filter tree
///
/// # Examples
///
/// ```
/// use polymorph_db::orm::Q;
///
/// let q = Q::or(vec![
///     Q::new("field1", "A1"),
///     Q::new("Model2B___field2", "B2"),
/// ]);
/// assert!(!q.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum FilterCondition {
	/// A single filter expression
	Single(Filter),
	/// All conditions must match (AND logic)
	And(Vec<FilterCondition>),
	/// Any condition must match (OR logic)
	Or(Vec<FilterCondition>),
	/// Negates the inner condition (NOT logic)
	Not(Box<FilterCondition>),
}

/// Django-style alias
pub type Q = FilterCondition;

/// Lookups reserved by the polymorphic query layer.
pub const INSTANCE_OF: &str = "instance_of";
pub const NOT_INSTANCE_OF: &str = "not_instance_of";

impl FilterCondition {
	/// Build a condition from a Django lookup such as `field1__startswith`.
	///
	/// Unknown lookups fall back to `exact` on the full path; lookups that
	/// need a boolean (`isnull`) but get something else produce an
	/// always-false `In []` filter, and the error surfaces when the path is
	/// validated.
	pub fn new(lookup: &str, value: impl Into<FilterValue>) -> Self {
		let value = value.into();
		match Filter::parse(lookup, value.clone()) {
			Ok(filter) => Self::Single(filter),
			Err(_) => Self::Single(Filter::new(lookup, FilterOperator::Eq, value)),
		}
	}

	/// Fallible variant of [`FilterCondition::new`].
	pub fn try_new(lookup: &str, value: impl Into<FilterValue>) -> Result<Self> {
		Ok(Self::Single(Filter::parse(lookup, value.into())?))
	}

	/// `pk IN (...)`
	pub fn pk_in(pks: impl IntoIterator<Item = i64>) -> Self {
		Self::Single(Filter::new(
			"pk",
			FilterOperator::In,
			FilterValue::List(pks.into_iter().map(Value::Int).collect()),
		))
	}

	/// Rows whose concrete class is one of `models` or a subclass of them.
	pub fn instance_of<S: AsRef<str>>(models: &[S]) -> Self {
		Self::Single(Filter::new(
			INSTANCE_OF,
			FilterOperator::Eq,
			FilterValue::Models(models.iter().map(|m| m.as_ref().to_string()).collect()),
		))
	}

	/// Rows whose concrete class is none of `models` (nor their subclasses).
	pub fn not_instance_of<S: AsRef<str>>(models: &[S]) -> Self {
		Self::Single(Filter::new(
			NOT_INSTANCE_OF,
			FilterOperator::Eq,
			FilterValue::Models(models.iter().map(|m| m.as_ref().to_string()).collect()),
		))
	}

	/// Create a single filter condition
	pub fn single(filter: Filter) -> Self {
		Self::Single(filter)
	}

	/// Create an AND condition from multiple conditions
	pub fn and(conditions: Vec<FilterCondition>) -> Self {
		Self::And(conditions)
	}

	/// Create an OR condition from multiple conditions
	pub fn or(conditions: Vec<FilterCondition>) -> Self {
		Self::Or(conditions)
	}

	/// Create a NOT condition that negates the given condition
	// Named `not` for parity with Django's `~Q`; it builds a tree node
	// rather than a boolean negation.
	#[allow(clippy::should_implement_trait)]
	pub fn not(condition: FilterCondition) -> Self {
		Self::Not(Box::new(condition))
	}

	/// Check if this condition is empty (no actual filters)
	pub fn is_empty(&self) -> bool {
		match self {
			FilterCondition::Single(_) => false,
			FilterCondition::And(conditions) | FilterCondition::Or(conditions) => {
				conditions.is_empty() || conditions.iter().all(|c| c.is_empty())
			}
			FilterCondition::Not(condition) => condition.is_empty(),
		}
	}

	/// Rebuild the tree, replacing every leaf with `f(leaf)`.
	pub fn try_map<F>(self, f: &mut F) -> Result<FilterCondition>
	where
		F: FnMut(Filter) -> Result<FilterCondition>,
	{
		Ok(match self {
			FilterCondition::Single(filter) => f(filter)?,
			FilterCondition::And(conditions) => FilterCondition::And(
				conditions
					.into_iter()
					.map(|c| c.try_map(f))
					.collect::<Result<Vec<_>>>()?,
			),
			FilterCondition::Or(conditions) => FilterCondition::Or(
				conditions
					.into_iter()
					.map(|c| c.try_map(f))
					.collect::<Result<Vec<_>>>()?,
			),
			FilterCondition::Not(condition) => FilterCondition::Not(Box::new(condition.try_map(f)?)),
		})
	}

	/// Visit every leaf filter.
	pub fn filters(&self) -> Vec<&Filter> {
		match self {
			FilterCondition::Single(filter) => vec![filter],
			FilterCondition::And(conditions) | FilterCondition::Or(conditions) => {
				conditions.iter().flat_map(|c| c.filters()).collect()
			}
			FilterCondition::Not(condition) => condition.filters(),
		}
	}
}
