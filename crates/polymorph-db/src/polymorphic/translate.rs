//! Polymorphic filter rewriting
//!
//! Filters on a polymorphic queryset may name subclass fields as
//! `ClassName___field` (or `app__ClassName___field`). They are rewritten
//! into ordinary paths through the reverse parent links, so
//! `Model2C___field3` queried from `Model2A` becomes
//! `model2b__model2c__field3`.
//!
//! `instance_of` / `not_instance_of` become membership tests on the
//! discriminator.

use super::hook::CTYPE_FIELD;
use crate::orm::query::{INSTANCE_OF, NOT_INSTANCE_OF};
use crate::orm::{
	DatabaseConnection, Filter, FilterOperator, FilterTranslator, FilterValue, ModelMeta, ModelRegistry, Q, Value,
};
use indexmap::IndexSet;
use polymorph_core::{Error, FieldError, Result};
use std::sync::Arc;

/// Separator between a class name and a field path
pub const CLASS_SEPARATOR: &str = "___";

/// [`FilterTranslator`] installed by the polymorphic manager
#[derive(Debug, Clone, Copy, Default)]
pub struct PolymorphicTranslator;

impl FilterTranslator for PolymorphicTranslator {
	fn translate_filter(&self, conn: &DatabaseConnection, model: &ModelMeta, condition: Q) -> Result<Q> {
		condition.try_map(&mut |filter| translate_leaf(conn, model, filter))
	}

	fn translate_ordering(
		&self,
		conn: &DatabaseConnection,
		model: &ModelMeta,
		ordering: Vec<String>,
	) -> Result<Vec<String>> {
		ordering
			.into_iter()
			.map(|term| translate_field_path(conn.registry(), model, &term))
			.collect()
	}
}

fn translate_leaf(conn: &DatabaseConnection, model: &ModelMeta, filter: Filter) -> Result<Q> {
	match filter.field.as_str() {
		INSTANCE_OF => instance_of_condition(conn, model, &filter.value, false),
		NOT_INSTANCE_OF => instance_of_condition(conn, model, &filter.value, true),
		_ => Ok(Q::single(Filter {
			field: translate_field_path(conn.registry(), model, &filter.field)?,
			..filter
		})),
	}
}

/// Rewrite one `ClassName___field` path (a leading `-` is kept). Paths
/// without a class selector are returned unchanged.
pub fn translate_field_path(registry: &ModelRegistry, model: &ModelMeta, path: &str) -> Result<String> {
	let (negated, path) = match path.strip_prefix('-') {
		Some(rest) => (true, rest),
		None => (false, path),
	};
	let Some((classname, field_path)) = path.split_once(CLASS_SEPARATOR) else {
		return Ok(with_sign(negated, path.to_string()));
	};
	if classname.is_empty() {
		return Err(FieldError::DoesNotExist {
			model: model.name.clone(),
			field: path.to_string(),
			choices: String::new(),
			suggestion: None,
		}
		.into());
	}

	let label = model.label();
	let target = match classname.split_once("__") {
		Some((app, name)) => {
			let qualified = format!("{}.{}", app, name);
			let target = registry.get_model(&qualified).ok_or_else(|| FieldError::UnknownModel {
				name: qualified.clone(),
				base: model.name.clone(),
			})?;
			if !registry.is_subclass(&target.label(), &label) {
				return Err(FieldError::NotASubclass {
					model: target.name.clone(),
					base: model.name.clone(),
				}
				.into());
			}
			target
		}
		None => {
			if is_relation(registry, &label, classname)? {
				return Ok(with_sign(negated, path.to_string()));
			}
			find_submodel(registry, model, classname)?
		}
	};

	let mut segments: Vec<String> = registry
		.path_to_descendant(&label, &target.label())?
		.iter()
		.map(|meta| query_related_name(meta))
		.collect();
	segments.push(field_path.to_string());
	Ok(with_sign(negated, segments.join("__")))
}

fn with_sign(negated: bool, path: String) -> String {
	if negated { format!("-{}", path) } else { path }
}

/// Whether `name` is a relation reachable from `label` (forward or reverse).
fn is_relation(registry: &ModelRegistry, label: &str, name: &str) -> Result<bool> {
	if let Some((_, field)) = registry.find_field(label, name)? {
		return Ok(field.relation.is_some() || field.many_to_many.is_some());
	}
	Ok(registry.find_reverse_one_to_one(label, name)?.is_some())
}

/// `name` among the model and its subclasses.
fn find_submodel(registry: &ModelRegistry, model: &ModelMeta, name: &str) -> Result<Arc<ModelMeta>> {
	let label = model.label();
	let mut matches: Vec<Arc<ModelMeta>> = registry
		.descendants(&label)
		.into_iter()
		.filter(|m| m.name == name)
		.collect();
	if model.name == name {
		matches.insert(0, registry.get(&label)?);
	}
	match matches.len() {
		0 => Err(FieldError::UnknownModel {
			name: name.to_string(),
			base: model.name.clone(),
		}
		.into()),
		1 => Ok(matches.remove(0)),
		_ => Err(FieldError::Ambiguous {
			name: name.to_string(),
			candidates: matches.iter().map(|m| m.label()).collect::<Vec<_>>().join(", "),
		}
		.into()),
	}
}

/// Name of the reverse parent link leading from the parent to `meta`.
fn query_related_name(meta: &ModelMeta) -> String {
	meta.parent_link
		.as_deref()
		.and_then(|name| meta.local_field(name))
		.and_then(|field| field.relation.as_ref())
		.map(|relation| relation.related_query_name.clone())
		.unwrap_or_else(|| meta.model_name.clone())
}

/// Resolve class references (`Name` or `app.Name`) for `instance_of`.
///
/// A bare name is looked up in the queried model's hierarchy first, then
/// among all models.
pub fn resolve_classes(registry: &ModelRegistry, model: &ModelMeta, names: &[String]) -> Result<Vec<Arc<ModelMeta>>> {
	let base = registry
		.polymorphic_base(&model.label())?
		.map(|m| m.label())
		.unwrap_or_else(|| model.label());
	names
		.iter()
		.map(|name| {
			if name.contains('.') {
				return registry.get_model(name).ok_or_else(|| {
					FieldError::UnknownModel {
						name: name.clone(),
						base: model.name.clone(),
					}
					.into()
				});
			}
			let all: Vec<Arc<ModelMeta>> = registry.models().filter(|m| &m.name == name).cloned().collect();
			let in_tree: Vec<Arc<ModelMeta>> = all
				.iter()
				.filter(|m| registry.is_subclass(&m.label(), &base))
				.cloned()
				.collect();
			let candidates = if in_tree.is_empty() { all } else { in_tree };
			match candidates.as_slice() {
				[] => Err(FieldError::UnknownModel {
					name: name.clone(),
					base: model.name.clone(),
				}
				.into()),
				[only] => Ok(Arc::clone(only)),
				many => Err(FieldError::Ambiguous {
					name: name.clone(),
					candidates: many.iter().map(|m| m.label()).collect::<Vec<_>>().join(", "),
				}
				.into()),
			}
		})
		.collect()
}

/// Content type ids of `classes` and all of their subclasses, ascending.
pub fn content_type_ids(conn: &DatabaseConnection, classes: &[Arc<ModelMeta>]) -> Result<Vec<i64>> {
	let registry = conn.registry();
	let mut labels: IndexSet<String> = IndexSet::new();
	for class in classes {
		labels.insert(class.label());
		labels.extend(registry.descendants(&class.label()).iter().map(|m| m.label()));
	}
	let mut ids = conn
		.content_types()
		.ids_for_models(&labels.into_iter().collect::<Vec<_>>())?;
	ids.sort_unstable();
	ids.dedup();
	Ok(ids)
}

fn instance_of_condition(conn: &DatabaseConnection, model: &ModelMeta, value: &FilterValue, negated: bool) -> Result<Q> {
	let names = match value {
		FilterValue::Models(names) => names.clone(),
		FilterValue::Single(Value::Text(name)) => vec![name.clone()],
		_ => {
			return Err(FieldError::UnsupportedLookup {
				field: if negated { NOT_INSTANCE_OF } else { INSTANCE_OF }.to_string(),
				lookup: "exact".to_string(),
			}
			.into());
		}
	};
	let registry = conn.registry();
	if registry.polymorphic_base(&model.label())?.is_none() {
		return Err(Error::ImproperlyConfigured(format!(
			"{} is not polymorphic; instance_of needs a discriminator",
			model.label()
		)));
	}
	let classes = resolve_classes(registry, model, &names)?;
	for class in &classes {
		if !class.polymorphic {
			return Err(FieldError::NotASubclass {
				model: class.name.clone(),
				base: model.name.clone(),
			}
			.into());
		}
	}
	let ids = content_type_ids(conn, &classes)?;
	let membership = Q::single(Filter::new(
		CTYPE_FIELD,
		FilterOperator::In,
		FilterValue::List(ids.into_iter().map(Value::Int).collect()),
	));
	if !negated {
		return Ok(membership);
	}
	Ok(Q::or(vec![
		Q::not(membership),
		Q::single(Filter::new(CTYPE_FIELD, FilterOperator::IsNull, FilterValue::Single(Value::Null))),
	]))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::orm::{Field, ModelDef, OnDelete};
	use crate::polymorphic::PolymorphicHook;
	use rstest::{fixture, rstest};

	#[fixture]
	async fn conn() -> DatabaseConnection {
		let registry = ModelRegistry::builder()
			.hook(PolymorphicHook::new())
			.model(ModelDef::new("tests", "Model2A").polymorphic().field(Field::char("field1", 30)))
			.model(ModelDef::new("tests", "Model2B").parent("Model2A").field(Field::char("field2", 30)))
			.model(ModelDef::new("tests", "Model2C").parent("Model2B").field(Field::char("field3", 30)))
			.model(ModelDef::new("tests", "Model2D").parent("Model2C").field(Field::char("field4", 30)))
			.model(ModelDef::new("other", "Model2D").parent("tests.Model2A").field(Field::char("fieldx", 30)))
			.model(
				ModelDef::new("tests", "RelatingModel")
					.polymorphic()
					.field(Field::foreign_key("Model2A", "Model2A", OnDelete::Cascade).null()),
			)
			.build()
			.unwrap();
		let conn = DatabaseConnection::memory(Arc::new(registry));
		conn.migrate().await.unwrap();
		conn
	}

	fn path(conn: &DatabaseConnection, base: &str, field: &str) -> Result<String> {
		let model = conn.model(base)?;
		translate_field_path(conn.registry(), &model, field)
	}

	#[rstest]
	#[case("Model2C___field3", "model2b__model2c__field3")]
	#[case("Model2B___field2", "model2b__field2")]
	#[case("Model2A___field1", "field1")]
	#[case("-Model2C___field3", "-model2b__model2c__field3")]
	#[case("tests__Model2D___field4", "model2b__model2c__model2d__field4")]
	#[case("other__Model2D___fieldx", "model2d__fieldx")]
	#[case("field1", "field1")]
	#[tokio::test]
	async fn test_translate_field_path(#[future] conn: DatabaseConnection, #[case] input: &str, #[case] expected: &str) {
		// Arrange
		let conn = conn.await;

		// Act
		let translated = path(&conn, "tests.Model2A", input).unwrap();

		// Assert
		assert_eq!(translated, expected);
	}

	#[rstest]
	#[tokio::test]
	async fn test_bare_name_in_two_apps_is_ambiguous(#[future] conn: DatabaseConnection) {
		// Arrange
		let conn = conn.await;

		// Act
		let err = path(&conn, "tests.Model2A", "Model2D___field4").unwrap_err();

		// Assert
		assert!(matches!(err, Error::Field(FieldError::Ambiguous { .. })));
		assert!(err.to_string().contains("applabel__ModelName___field"));
	}

	#[rstest]
	#[tokio::test]
	async fn test_class_outside_the_hierarchy_is_unknown(#[future] conn: DatabaseConnection) {
		// Arrange
		let conn = conn.await;

		// Act
		let unknown = path(&conn, "tests.Model2B", "Model2A___field1").unwrap_err();
		let not_derived = path(&conn, "tests.Model2B", "other__Model2D___fieldx").unwrap_err();

		// Assert
		assert!(matches!(unknown, Error::Field(FieldError::UnknownModel { .. })));
		assert!(matches!(not_derived, Error::Field(FieldError::NotASubclass { .. })));
	}

	#[rstest]
	#[tokio::test]
	async fn test_relation_named_like_a_class_is_untouched(#[future] conn: DatabaseConnection) {
		// Arrange
		let conn = conn.await;

		// Act
		let translated = path(&conn, "tests.RelatingModel", "Model2A___field1").unwrap();

		// Assert
		assert_eq!(translated, "Model2A___field1");
	}

	#[rstest]
	#[tokio::test]
	async fn test_instance_of_includes_subclasses(#[future] conn: DatabaseConnection) {
		// Arrange
		let conn = conn.await;
		let model = conn.model("tests.Model2A").unwrap();
		let expected: Vec<Value> = ["tests.Model2B", "tests.Model2C", "tests.Model2D"]
			.iter()
			.map(|l| Value::Int(conn.content_types().get_for_model(l).unwrap().id))
			.collect();

		// Act
		let q = PolymorphicTranslator
			.translate_filter(&conn, &model, Q::instance_of(&["Model2B"]))
			.unwrap();

		// Assert
		let Q::Single(filter) = q else { panic!("expected a single filter, got {:?}", q) };
		assert_eq!(filter.field, CTYPE_FIELD);
		assert_eq!(filter.operator, FilterOperator::In);
		let FilterValue::List(mut ids) = filter.value else { panic!("expected a list") };
		ids.sort_by(|a, b| a.order_cmp(b));
		let mut expected = expected;
		expected.sort_by(|a, b| a.order_cmp(b));
		assert_eq!(ids, expected);
	}

	#[rstest]
	#[tokio::test]
	async fn test_not_instance_of_keeps_null_discriminators(#[future] conn: DatabaseConnection) {
		// Arrange
		let conn = conn.await;
		let model = conn.model("tests.Model2A").unwrap();

		// Act
		let q = PolymorphicTranslator
			.translate_filter(&conn, &model, Q::not_instance_of(&["tests.Model2B"]))
			.unwrap();

		// Assert
		let Q::Or(branches) = q else { panic!("expected an OR, got {:?}", q) };
		assert!(matches!(&branches[0], Q::Not(_)));
		assert!(matches!(&branches[1], Q::Single(f) if f.operator == FilterOperator::IsNull));
	}
}
