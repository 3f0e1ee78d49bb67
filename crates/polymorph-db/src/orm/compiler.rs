//! Query compiler
//!
//! Resolves `__`-separated lookup paths against the registry and produces a
//! backend [`SelectQuery`]. Fields of ancestors are reached through inner
//! joins on the parent links; forward relations and reverse one-to-one
//! relations through left joins.

use super::fields::{FieldMeta, FieldType};
use super::model::ModelMeta;
use super::query::{Filter, FilterCondition, FilterOperator, FilterValue};
use super::registry::ModelRegistry;
use crate::backends::statements::{
	ColumnRef, Condition, Join, JoinKind, OrderTerm, SelectColumn, SelectQuery,
};
use polymorph_core::{FieldError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// A resolved lookup path
#[derive(Debug, Clone)]
pub struct ResolvedPath {
	pub column: ColumnRef,
	/// Final field, `None` when the path ends on a reverse relation
	pub field: Option<FieldMeta>,
	/// The column may read NULL: a nullable field, or one reached through
	/// a left join
	pub nullable: bool,
}

pub struct QueryCompiler<'a> {
	registry: &'a ModelRegistry,
	model: Arc<ModelMeta>,
	joins: Vec<Join>,
	/// `(left alias, step) -> alias`
	aliases: HashMap<(String, String), String>,
}

const BASE_ALIAS: &str = "t0";

impl<'a> QueryCompiler<'a> {
	pub fn new(registry: &'a ModelRegistry, model: Arc<ModelMeta>) -> Self {
		Self {
			registry,
			model,
			joins: Vec::new(),
			aliases: HashMap::new(),
		}
	}

	fn join(&mut self, left: ColumnRef, step: String, kind: JoinKind, table: &str, column: &str) -> String {
		let key = (left.alias.clone(), step);
		if let Some(alias) = self.aliases.get(&key) {
			return alias.clone();
		}
		let alias = format!("t{}", self.joins.len() + 1);
		self.joins.push(Join {
			kind,
			table: table.to_string(),
			alias: alias.clone(),
			column: column.to_string(),
			left,
		});
		self.aliases.insert(key, alias.clone());
		alias
	}

	/// Alias holding the columns of `owner`, an ancestor of `model` (or
	/// `model` itself) whose table is bound to `alias`.
	fn owner_alias(&mut self, alias: &str, model: &ModelMeta, owner: &str) -> Result<String> {
		let mut alias = alias.to_string();
		let mut current = self.registry.get(&model.label())?;
		while current.label() != owner {
			let Some(parent_label) = current.parent.clone() else {
				break;
			};
			let parent = self.registry.get(&parent_label)?;
			alias = self.join(
				ColumnRef::new(alias, current.pk_column()),
				format!("^{}", parent_label),
				JoinKind::Inner,
				&parent.db_table,
				parent.pk_column(),
			);
			current = parent;
		}
		Ok(alias)
	}

	fn unknown_field(&self, model: &ModelMeta, name: &str) -> Result<FieldError> {
		let mut choices: Vec<String> = self
			.registry
			.chain(&model.label())?
			.iter()
			.flat_map(|m| m.fields.iter().map(|f| f.name.clone()).collect::<Vec<_>>())
			.collect();
		choices.extend(self.registry.reverse_names(&model.label())?);
		choices.push("pk".to_string());
		choices.sort();
		choices.dedup();

		let suggestion = choices
			.iter()
			.map(|c| (strsim::jaro_winkler(name, c), c))
			.filter(|(score, _)| *score > 0.8)
			.max_by(|a, b| a.0.total_cmp(&b.0))
			.map(|(_, c)| c.clone());

		Ok(FieldError::DoesNotExist {
			model: model.name.clone(),
			field: name.to_string(),
			choices: choices.join(", "),
			suggestion,
		})
	}

	/// Resolve `path` starting at the queried model.
	pub fn resolve(&mut self, path: &str) -> Result<ResolvedPath> {
		let parts: Vec<&str> = path.split("__").collect();
		let mut model = Arc::clone(&self.model);
		let mut alias = BASE_ALIAS.to_string();
		let mut outer = false;

		for (index, part) in parts.iter().enumerate() {
			let last = index + 1 == parts.len();

			if *part == "pk" {
				if !last {
					return Err(FieldError::NotRelational {
						model: model.name.clone(),
						field: "pk".to_string(),
					}
					.into());
				}
				let pk = model
					.pk_field()
					.cloned()
					.ok_or_else(|| self.unknown_field_or_default(&model, part))?;
				return Ok(ResolvedPath {
					column: ColumnRef::new(alias, model.pk_column()),
					field: Some(pk),
					nullable: outer,
				});
			}

			if let Some((owner, field)) = self.registry.find_field(&model.label(), part)? {
				if field.field_type == FieldType::ManyToManyField {
					return Err(FieldError::UnsupportedLookup {
						field: field.name.clone(),
						lookup: "many-to-many".to_string(),
					}
					.into());
				}
				let owner_alias = self.owner_alias(&alias, &model, &owner.label())?;
				if last {
					return Ok(ResolvedPath {
						column: ColumnRef::new(owner_alias, field.column.clone()),
						nullable: outer || field.null,
						field: Some(field),
					});
				}
				let Some(relation) = field.relation.clone() else {
					return Err(FieldError::NotRelational {
						model: model.name.clone(),
						field: field.name.clone(),
					}
					.into());
				};
				let target = self.registry.get(&relation.to)?;
				alias = self.join(
					ColumnRef::new(owner_alias, field.column.clone()),
					field.name.clone(),
					JoinKind::Left,
					&target.db_table,
					target.pk_column(),
				);
				outer = true;
				model = target;
				continue;
			}

			if let Some(related) = self.registry.find_reverse_one_to_one(&model.label(), part)? {
				let target_alias = self.owner_alias(&alias, &model, &related.target)?;
				let target = self.registry.get(&related.target)?;
				let declaring = self.registry.get(&related.model)?;
				alias = self.join(
					ColumnRef::new(target_alias, target.pk_column()),
					format!("<{}", related.describe()),
					JoinKind::Left,
					&declaring.db_table,
					&related.field.column,
				);
				outer = true;
				model = declaring;
				if last {
					return Ok(ResolvedPath {
						column: ColumnRef::new(alias, model.pk_column()),
						field: model.pk_field().cloned(),
						nullable: true,
					});
				}
				continue;
			}

			return Err(self.unknown_field(&model, part)?.into());
		}

		Err(self.unknown_field(&model, path)?.into())
	}

	fn unknown_field_or_default(&self, model: &ModelMeta, name: &str) -> FieldError {
		FieldError::DoesNotExist {
			model: model.name.clone(),
			field: name.to_string(),
			choices: String::new(),
			suggestion: None,
		}
	}

	pub fn compile_filter(&mut self, filter: &Filter) -> Result<Condition> {
		self.compile_leaf(filter, false)
	}

	/// Under an odd number of negations a comparison on a column that may
	/// read NULL also requires the column to be set, so `exclude` keeps the
	/// rows where it is NULL.
	fn compile_leaf(&mut self, filter: &Filter, negated: bool) -> Result<Condition> {
		let resolved = self.resolve(&filter.field)?;
		let values = match &filter.value {
			FilterValue::Single(v) => vec![v.clone()],
			FilterValue::List(list) => list.clone(),
			FilterValue::Models(_) => {
				return Err(FieldError::UnsupportedLookup {
					field: filter.field.clone(),
					lookup: "model list".to_string(),
				}
				.into());
			}
		};
		let operator = match (filter.operator, values.first()) {
			(FilterOperator::Eq, Some(v)) if v.is_null() => FilterOperator::IsNull,
			(FilterOperator::Ne, Some(v)) if v.is_null() => FilterOperator::IsNotNull,
			(op, _) => op,
		};
		let compare = Condition::Compare {
			column: resolved.column.clone(),
			operator,
			values,
		};
		if !negated || !resolved.nullable || matches!(operator, FilterOperator::IsNull | FilterOperator::IsNotNull) {
			return Ok(compare);
		}
		Ok(Condition::And(vec![
			compare,
			Condition::Compare {
				column: resolved.column,
				operator: FilterOperator::IsNotNull,
				values: Vec::new(),
			},
		]))
	}

	pub fn compile_condition(&mut self, condition: &FilterCondition) -> Result<Condition> {
		self.compile_under(condition, false)
	}

	fn compile_under(&mut self, condition: &FilterCondition, negated: bool) -> Result<Condition> {
		Ok(match condition {
			FilterCondition::Single(filter) => self.compile_leaf(filter, negated)?,
			FilterCondition::And(items) => Condition::And(
				items
					.iter()
					.map(|c| self.compile_under(c, negated))
					.collect::<Result<Vec<_>>>()?,
			),
			FilterCondition::Or(items) => Condition::Or(
				items
					.iter()
					.map(|c| self.compile_under(c, negated))
					.collect::<Result<Vec<_>>>()?,
			),
			FilterCondition::Not(inner) => Condition::Not(Box::new(self.compile_under(inner, !negated)?)),
		})
	}

	pub fn compile_ordering(&mut self, ordering: &[String]) -> Result<Vec<OrderTerm>> {
		ordering
			.iter()
			.map(|term| {
				let (descending, path) = match term.strip_prefix('-') {
					Some(path) => (true, path),
					None => (false, term.as_str()),
				};
				Ok(OrderTerm {
					column: self.resolve(path)?.column,
					descending,
				})
			})
			.collect()
	}

	/// Every concrete column of the model's chain, keyed by attname.
	pub fn model_columns(&mut self) -> Result<Vec<SelectColumn>> {
		let model = Arc::clone(&self.model);
		let mut columns = Vec::new();
		for (owner, field) in self.registry.concrete_fields(&model.label())? {
			let alias = self.owner_alias(BASE_ALIAS, &model, &owner.label())?;
			columns.push(SelectColumn {
				source: ColumnRef::new(alias, field.column.clone()),
				name: field.attname.clone(),
				kind: field.column_kind(),
			});
		}
		Ok(columns)
	}

	/// Columns for explicit paths, keyed by the path.
	pub fn path_columns(&mut self, paths: &[&str]) -> Result<Vec<SelectColumn>> {
		paths
			.iter()
			.map(|path| {
				let resolved = self.resolve(path)?;
				let kind = resolved
					.field
					.as_ref()
					.map(FieldMeta::column_kind)
					.unwrap_or(super::fields::ColumnKind::Integer);
				Ok(SelectColumn {
					source: resolved.column,
					name: path.to_string(),
					kind,
				})
			})
			.collect()
	}

	pub fn finish(
		self,
		columns: Vec<SelectColumn>,
		condition: Option<Condition>,
		order_by: Vec<OrderTerm>,
		limit: Option<usize>,
		offset: usize,
	) -> SelectQuery {
		SelectQuery {
			table: self.model.db_table.clone(),
			alias: BASE_ALIAS.to_string(),
			joins: self.joins,
			columns,
			condition,
			order_by,
			limit,
			offset,
		}
	}
}
