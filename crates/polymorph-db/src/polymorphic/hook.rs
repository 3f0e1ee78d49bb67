//! Registry hook installing polymorphic behavior
//!
//! While a polymorphic model is prepared the hook:
//!
//! - adds the `polymorphic_ctype` discriminator to the first polymorphic
//!   model of each chain, right after its primary key
//! - guards the on-delete action of every relation declared on, or pointing
//!   at, a polymorphic model
//! - installs a [`PolymorphicManager`] when no manager was declared and makes
//!   `objects` the base manager
//!
//! It also fills the discriminator before an insert and contributes the
//! `polymorphic.*` system checks.

use super::checks;
use super::guard::{PolymorphicGuard, serialize_guard};
use super::manager::PolymorphicManager;
use crate::contenttypes::CONTENT_TYPE_LABEL;
use crate::migrations::serializer;
use crate::orm::{
	DatabaseConnection, FieldMeta, FieldType, Instance, ModelHook, ModelMeta, ModelRegistry, OnDelete, PrepareContext,
	RelationMeta, Value,
};
use async_trait::async_trait;
use polymorph_core::{CheckMessage, Result};
use std::sync::Arc;

/// Name of the discriminator field
pub const CTYPE_FIELD: &str = "polymorphic_ctype";

/// Manager name the hook installs and uses as base manager
pub const DEFAULT_MANAGER: &str = "objects";

#[derive(Debug, Clone)]
pub struct PolymorphicHook {
	_private: (),
}

impl PolymorphicHook {
	pub fn new() -> Self {
		serializer::register_serializer::<PolymorphicGuard>(serialize_guard);
		Self { _private: () }
	}
}

impl Default for PolymorphicHook {
	fn default() -> Self {
		Self::new()
	}
}

fn ctype_field(meta: &ModelMeta) -> FieldMeta {
	let attname = format!("{}_id", CTYPE_FIELD);
	FieldMeta {
		name: CTYPE_FIELD.to_string(),
		attname: attname.clone(),
		column: attname,
		field_type: FieldType::ForeignKey,
		max_length: None,
		null: true,
		default: None,
		unique: false,
		primary_key: false,
		model: meta.label(),
		relation: Some(RelationMeta {
			to: CONTENT_TYPE_LABEL.to_string(),
			on_delete: Arc::new(PolymorphicGuard::new(OnDelete::Cascade)),
			related_name: Some(format!("polymorphic_{}.{}_set+", meta.app_label, meta.model_name)),
			related_query_name: meta.model_name.clone(),
			parent_link: false,
			db_constraint: true,
		}),
		many_to_many: None,
		auto_created: true,
	}
}

/// Whether `meta` is the first polymorphic model of its chain.
fn stores_discriminator(meta: &ModelMeta, ctx: &PrepareContext) -> bool {
	meta.parent.as_deref().is_none_or(|parent| !ctx.is_polymorphic(parent))
}

#[async_trait]
impl ModelHook for PolymorphicHook {
	fn name(&self) -> &str {
		"polymorphic"
	}

	fn class_prepared(&self, meta: &mut ModelMeta, ctx: &PrepareContext) -> Result<()> {
		let polymorphic = ctx.is_polymorphic(&meta.label());

		if polymorphic {
			// A declared field of the same name is reported by the checks.
			if stores_discriminator(meta, ctx) && meta.local_field(CTYPE_FIELD).is_none() {
				let position = meta.fields.iter().position(|f| f.primary_key).map_or(0, |i| i + 1);
				let field = ctype_field(meta);
				meta.fields.insert(position, field);
			}
			if meta.managers.is_empty() {
				meta.managers.push(Arc::new(PolymorphicManager::new()));
			}
			if meta.base_manager_name.is_none() && meta.manager(DEFAULT_MANAGER).is_some() {
				meta.base_manager_name = Some(DEFAULT_MANAGER.to_string());
			}
		}

		let label = meta.label();
		for field in meta.fields.iter_mut() {
			let Some(relation) = field.relation.as_mut() else {
				continue;
			};
			if !polymorphic && !ctx.is_polymorphic(&relation.to) {
				continue;
			}
			if !PolymorphicGuard::is_guard(relation.on_delete.as_ref()) {
				relation.on_delete = Arc::new(PolymorphicGuard::wrap(Arc::clone(&relation.on_delete)));
				tracing::trace!(model = %label, field = %field.name, "on_delete guarded");
			}
		}
		Ok(())
	}

	fn check(&self, registry: &ModelRegistry) -> Vec<CheckMessage> {
		registry
			.models()
			.filter(|meta| meta.polymorphic)
			.flat_map(|meta| checks::check_model(meta))
			.collect()
	}

	async fn pre_save(&self, conn: &DatabaseConnection, instance: &mut Instance) -> Result<()> {
		if !instance.meta().polymorphic {
			return Ok(());
		}
		if instance.get(CTYPE_FIELD).is_some_and(|v| !v.is_null()) {
			return Ok(());
		}
		let ct = conn.content_types().get_for_model(&instance.label())?;
		instance.set(CTYPE_FIELD, Value::Int(ct.id));
		Ok(())
	}
}
