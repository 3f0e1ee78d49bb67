//! `polymorphic.*` system checks

use super::hook::CTYPE_FIELD;
use super::manager::PolymorphicManager;
use crate::orm::query::{INSTANCE_OF, NOT_INSTANCE_OF};
use crate::orm::{Manager, ModelMeta};
use polymorph_core::CheckMessage;

pub const RESERVED_FIELD: &str = "polymorphic.E001";
pub const POLYMORPHIC_MIGRATION_MANAGER: &str = "polymorphic.E002";
pub const MANAGER_NOT_POLYMORPHIC: &str = "polymorphic.W001";
pub const QUERYSET_NOT_POLYMORPHIC: &str = "polymorphic.W002";

/// Name Django gives the implicit base manager.
const IMPLICIT_BASE_MANAGER: &str = "_base_manager";

/// Every check for one polymorphic model.
pub fn check_model(meta: &ModelMeta) -> Vec<CheckMessage> {
	let mut messages = reserved_field_names(meta);
	messages.extend(managers(meta));
	messages
}

fn is_reserved(name: &str, auto_created: bool) -> bool {
	name == INSTANCE_OF || name == NOT_INSTANCE_OF || (name == CTYPE_FIELD && !auto_created)
}

fn reserved_field_names(meta: &ModelMeta) -> Vec<CheckMessage> {
	meta.all_fields()
		.filter(|field| is_reserved(&field.name, field.auto_created))
		.map(|field| {
			CheckMessage::error(
				RESERVED_FIELD,
				format!("Field '{}' on model '{}' is a reserved name.", field.name, meta.name),
				format!("{}.{}", meta.label(), field.name),
			)
		})
		.collect()
}

fn is_polymorphic_manager(manager: &dyn Manager) -> bool {
	manager.as_any().is::<PolymorphicManager>()
}

fn managers(meta: &ModelMeta) -> Vec<CheckMessage> {
	let label = meta.label();
	let mut messages = Vec::new();

	if let Some(manager) = meta.migration_manager()
		&& is_polymorphic_manager(manager.as_ref())
	{
		messages.push(
			CheckMessage::error(
				POLYMORPHIC_MIGRATION_MANAGER,
				format!("The migration manager '{}.{}' is polymorphic.", label, manager.name()),
				format!("{}.{}", label, manager.name()),
			)
			.with_hint("Set use_in_migrations = false on the manager."),
		);
	}

	let base = meta
		.base_manager_name
		.as_deref()
		.and_then(|name| meta.manager(name))
		.map(|m| m.as_ref());
	let default = meta.default_manager().map(|m| m.as_ref());

	for (role, manager) in [("base", base), ("default", default)] {
		let (name, polymorphic, polymorphic_queryset) = match manager {
			Some(m) => (m.name(), is_polymorphic_manager(m), m.iterable().is_polymorphic()),
			None => (IMPLICIT_BASE_MANAGER, false, false),
		};
		let obj = format!("{}.{}", label, name);
		if !polymorphic {
			messages.push(CheckMessage::warning(
				MANAGER_NOT_POLYMORPHIC,
				format!("The {} manager '{}' is not polymorphic.", role, obj),
				obj.clone(),
			));
		}
		if !polymorphic_queryset {
			messages.push(CheckMessage::warning(
				QUERYSET_NOT_POLYMORPHIC,
				format!("The {} manager '{}' is not using a polymorphic queryset.", role, obj),
				obj,
			));
		}
	}
	messages
}
