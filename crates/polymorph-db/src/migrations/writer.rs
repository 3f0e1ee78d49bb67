//! Migration file rendering
//!
//! Operations are turned into a `syn::File` that rebuilds them through the
//! migration prelude, and printed with `prettyplease`.

use super::Result;
use super::operations::Operation;
use super::serializer::serialize_handler;
use super::state::{FieldState, RelationState};
use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::parse_quote;

/// Renders one migration as Rust source
///
/// # Examples
///
/// ```
/// use polymorph_db::migrations::{FieldState, MigrationWriter, Operation};
/// use polymorph_db::orm::FieldType;
///
/// let source = MigrationWriter::new("tests", "0002_model2a_field2")
///     .dependency("tests", "0001_initial")
///     .operations(vec![Operation::AddField {
///         app_label: "tests".into(),
///         model_name: "Model2A".into(),
///         field: FieldState::new("field2", FieldType::TextField).null(),
///     }])
///     .as_string()
///     .unwrap();
/// assert!(source.contains("pub fn migration() -> Migration"));
/// ```
#[derive(Debug, Clone)]
pub struct MigrationWriter {
	app_label: String,
	name: String,
	dependencies: Vec<(String, String)>,
	operations: Vec<Operation>,
}

impl MigrationWriter {
	pub fn new(app_label: impl Into<String>, name: impl Into<String>) -> Self {
		Self {
			app_label: app_label.into(),
			name: name.into(),
			dependencies: Vec::new(),
			operations: Vec::new(),
		}
	}

	pub fn dependency(mut self, app_label: impl Into<String>, name: impl Into<String>) -> Self {
		self.dependencies.push((app_label.into(), name.into()));
		self
	}

	pub fn operations(mut self, operations: Vec<Operation>) -> Self {
		self.operations = operations;
		self
	}

	/// Source of the migration file.
	pub fn as_string(&self) -> Result<String> {
		let app_label = &self.app_label;
		let name = &self.name;
		let deps = self.dependencies.iter().map(|(app, name)| quote! { (#app, #name) });
		let operations = self
			.operations
			.iter()
			.map(operation_tokens)
			.collect::<Result<Vec<_>>>()?;

		let file: syn::File = parse_quote! {
			use polymorph_db::migrations::prelude::*;

			pub fn migration() -> Migration {
				Migration {
					app_label: #app_label,
					name: #name,
					dependencies: vec![#(#deps),*],
					operations: vec![#(#operations),*],
				}
			}
		};
		Ok(prettyplease::unparse(&file))
	}
}

fn operation_tokens(operation: &Operation) -> Result<TokenStream> {
	Ok(match operation {
		Operation::CreateModel {
			app_label,
			name,
			fields,
			bases,
			managers,
		} => {
			let fields = fields.iter().map(field_tokens).collect::<Result<Vec<_>>>()?;
			let bases = match bases {
				Some(parent) => quote!(Some(#parent.to_string())),
				None => quote!(None),
			};
			quote! {
				Operation::CreateModel {
					app_label: #app_label.to_string(),
					name: #name.to_string(),
					fields: vec![#(#fields),*],
					bases: #bases,
					managers: vec![#(#managers.to_string()),*],
				}
			}
		}
		Operation::DeleteModel { app_label, name } => quote! {
			Operation::DeleteModel {
				app_label: #app_label.to_string(),
				name: #name.to_string(),
			}
		},
		Operation::AddField {
			app_label,
			model_name,
			field,
		} => {
			let field = field_tokens(field)?;
			quote! {
				Operation::AddField {
					app_label: #app_label.to_string(),
					model_name: #model_name.to_string(),
					field: #field,
				}
			}
		}
		Operation::RemoveField {
			app_label,
			model_name,
			name,
		} => quote! {
			Operation::RemoveField {
				app_label: #app_label.to_string(),
				model_name: #model_name.to_string(),
				name: #name.to_string(),
			}
		},
		Operation::AlterField {
			app_label,
			model_name,
			field,
		} => {
			let field = field_tokens(field)?;
			quote! {
				Operation::AlterField {
					app_label: #app_label.to_string(),
					model_name: #model_name.to_string(),
					field: #field,
				}
			}
		}
	})
}

fn field_tokens(field: &FieldState) -> Result<TokenStream> {
	let name = &field.name;
	let field_type = format_ident!("{}", field.field_type.name());
	let mut tokens = quote!(FieldState::new(#name, FieldType::#field_type));
	if field.nullable {
		tokens = quote!(#tokens.null());
	}
	for (key, value) in &field.params {
		tokens = quote!(#tokens.param(#key, #value));
	}
	if let Some(relation) = &field.relation {
		let relation = relation_tokens(relation)?;
		tokens = quote!(#tokens.relation(#relation));
	}
	Ok(tokens)
}

fn relation_tokens(relation: &RelationState) -> Result<TokenStream> {
	let to = &relation.to;
	let on_delete = serialize_handler(relation.on_delete.as_ref())?;
	let mut tokens = quote!(RelationState::new(#to, #on_delete));
	if let Some(related_name) = &relation.related_name {
		tokens = quote!(#tokens.related_name(#related_name));
	}
	if relation.parent_link {
		tokens = quote!(#tokens.parent_link());
	}
	if !relation.db_constraint {
		tokens = quote!(#tokens.db_constraint(false));
	}
	Ok(tokens)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::migrations::{Autodetector, MigrationError, ProjectState};
	use crate::orm::{
		Collector, Field, FieldType, HandlerRef, ModelDef, ModelRegistry, OnDelete, OnDeleteHandler, QuerySet,
		RelatedField,
	};
	use crate::polymorphic::{PolymorphicGuard, PolymorphicHook};
	use rstest::rstest;
	use std::any::Any;

	fn owner_field(handler: impl OnDeleteHandler) -> Operation {
		Operation::AddField {
			app_label: "tests".into(),
			model_name: "Owner".into(),
			field: FieldState::new("pet", FieldType::ForeignKey)
				.null()
				.relation(RelationState::new("tests.Model2A", handler).related_name("owners")),
		}
	}

	fn render(operations: Vec<Operation>) -> String {
		MigrationWriter::new("tests", "0002_owner_pet")
			.dependency("tests", "0001_initial")
			.operations(operations)
			.as_string()
			.unwrap()
	}

	#[rstest]
	#[case(OnDelete::Cascade)]
	#[case(OnDelete::Protect)]
	#[case(OnDelete::set("orphan"))]
	fn test_guarded_relation_writes_the_same_source(#[case] action: OnDelete) {
		let _hook = PolymorphicHook::new();

		let plain = render(vec![owner_field(action.clone())]);
		let guarded = render(vec![owner_field(PolymorphicGuard::new(action))]);

		assert_eq!(plain, guarded);
		assert!(!guarded.contains("PolymorphicGuard"));
	}

	#[rstest]
	fn test_written_source_parses_and_names_the_action() {
		// Act
		let source = render(vec![owner_field(OnDelete::Protect)]);

		// Assert
		assert!(syn::parse_file(&source).is_ok());
		let compact: String = source.split_whitespace().collect();
		assert!(compact.contains("usepolymorph_db::migrations::prelude::*;"));
		assert!(compact.contains("OnDelete::Protect"));
		assert!(compact.contains(r#"dependencies:vec![("tests","0001_initial")"#));
		assert!(compact.contains(r#".related_name("owners")"#));
	}

	#[rstest]
	fn test_initial_migration_for_a_polymorphic_hierarchy() {
		// Arrange
		let registry = ModelRegistry::builder()
			.hook(PolymorphicHook::new())
			.model(ModelDef::new("tests", "Model2A").polymorphic().field(Field::char("field1", 30)))
			.model(ModelDef::new("tests", "Model2B").parent("Model2A").field(Field::char("field2", 30)))
			.build()
			.unwrap();
		let operations =
			Autodetector::new(&ProjectState::new(), &ProjectState::from_registry(&registry)).detect_changes();

		// Act
		let source = MigrationWriter::new("tests", "0001_initial")
			.operations(operations)
			.as_string()
			.unwrap();

		// Assert
		let compact: String = source.split_whitespace().collect();
		let model2a = compact.find(r#"name:"Model2A""#).unwrap();
		let model2b = compact.find(r#"name:"Model2B""#).unwrap();
		assert!(model2a < model2b);
		assert!(compact.contains(r#"RelationState::new("contenttypes.ContentType",OnDelete::Cascade"#));
		assert!(compact.contains(r#"bases:Some("tests.Model2A".to_string())"#));
		assert!(compact.contains(".parent_link()"));
	}

	#[derive(Debug)]
	struct Archive;

	impl OnDeleteHandler for Archive {
		fn apply(
			&self,
			_collector: &mut Collector,
			_related: &RelatedField,
			_sub_objs: QuerySet,
		) -> polymorph_core::Result<()> {
			Ok(())
		}

		fn reference(&self) -> HandlerRef {
			HandlerRef::Custom("archive later".to_string())
		}

		fn as_any(&self) -> &dyn Any {
			self
		}
	}

	#[rstest]
	fn test_unserializable_handler_fails_the_write() {
		let result = MigrationWriter::new("tests", "0003_archive")
			.operations(vec![owner_field(PolymorphicGuard::new(Archive))])
			.as_string();

		assert!(matches!(result, Err(MigrationError::Unserializable(_))));
	}
}
