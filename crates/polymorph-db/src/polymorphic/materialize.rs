//! Upgrading base rows to their concrete classes
//!
//! A polymorphic queryset first fetches rows of the queried model. Each row
//! names its concrete class through the discriminator; rows are grouped by
//! class and refetched with one query per class, through the subclass's
//! table joined to all its ancestors. Results keep the queryset order.
//!
//! When a subclass row is missing the materializer either falls back to the
//! nearest ancestor that has one (`best_effort`) or drops the object. Both
//! cases are logged.

use super::hook::CTYPE_FIELD;
use crate::orm::{DatabaseConnection, Instance, ModelMeta, Q, QuerySet, ResultIterable, Value};
use async_trait::async_trait;
use indexmap::IndexMap;
use polymorph_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// [`ResultIterable`] of polymorphic querysets
#[derive(Debug, Clone, Copy, Default)]
pub struct PolymorphicIterable;

#[async_trait]
impl ResultIterable for PolymorphicIterable {
	fn is_polymorphic(&self) -> bool {
		true
	}

	async fn materialize(&self, queryset: &QuerySet, rows: Vec<Instance>) -> Result<Vec<Instance>> {
		let conn = queryset.connection();
		let chunk_size = conn.settings().chunk_size.max(1);
		let mut out = Vec::with_capacity(rows.len());
		for chunk in rows.chunks(chunk_size) {
			out.extend(get_real_instances(conn, chunk.to_vec()).await?);
		}
		Ok(out)
	}
}

/// The concrete class recorded in a row's discriminator.
///
/// Fails with `PolymorphicTypeUndefined` when the discriminator is NULL,
/// `ContentTypeNotFound` for an unknown content type, and
/// `PolymorphicTypeInvalid` when the content type names a model that is gone
/// or is not a subclass of the row's model.
pub async fn real_class(conn: &DatabaseConnection, instance: &Instance) -> Result<Arc<ModelMeta>> {
	let meta = Arc::clone(instance.meta());
	if !meta.polymorphic {
		return Ok(meta);
	}
	let pk = instance.pk().unwrap_or_default();
	let Some(id) = instance.get(CTYPE_FIELD).and_then(Value::as_i64) else {
		return Err(Error::PolymorphicTypeUndefined {
			model: meta.name.clone(),
			pk,
		});
	};

	let ct = conn.content_types().get_for_id(conn, id).await?;
	let Some(class) = conn.content_types().model_class(conn.registry(), &ct) else {
		return Err(Error::PolymorphicTypeInvalid {
			model: meta.name.clone(),
			pk,
			reason: format!("content type {} ({}) has no registered class (class not found)", id, ct),
		});
	};
	if !conn.registry().is_subclass(&class.label(), &meta.label()) {
		return Err(Error::PolymorphicTypeInvalid {
			model: meta.name.clone(),
			pk,
			reason: format!(
				"content type {} refers to {}, which is not a subclass of {}",
				id,
				class.label(),
				meta.label()
			),
		});
	}
	Ok(class)
}

#[derive(Debug, Clone)]
struct Pending {
	slot: usize,
	pk: i64,
	/// Label of the row as fetched; fallbacks never go above it
	floor: String,
}

/// Upgrade `rows` to their concrete classes, keeping their order.
///
/// Rows of non-polymorphic models and rows already of their concrete class
/// are returned as they are.
pub async fn get_real_instances(conn: &DatabaseConnection, rows: Vec<Instance>) -> Result<Vec<Instance>> {
	let registry = conn.registry();
	let best_effort = conn.settings().best_effort;

	let mut slots: Vec<Option<Instance>> = Vec::with_capacity(rows.len());
	let mut originals: HashMap<usize, Instance> = HashMap::new();
	let mut pending: IndexMap<String, Vec<Pending>> = IndexMap::new();

	for row in rows {
		let slot = slots.len();
		let class = real_class(conn, &row).await?;
		let label = row.label();
		match row.pk() {
			Some(pk) if class.label() != label => {
				pending.entry(class.label()).or_default().push(Pending {
					slot,
					pk,
					floor: label,
				});
				originals.insert(slot, row);
				slots.push(None);
			}
			_ => slots.push(Some(row)),
		}
	}

	while let Some((class, entries)) = pending.shift_remove_index(0) {
		let pks: Vec<i64> = entries.iter().map(|e| e.pk).collect();
		let found: HashMap<i64, Instance> = conn
			.base_objects(&class)?
			.filter(Q::pk_in(pks.iter().copied()))?
			.fetch()
			.await?
			.into_iter()
			.filter_map(|instance| instance.pk().map(|pk| (pk, instance)))
			.collect();
		tracing::debug!(model = %class, requested = pks.len(), found = found.len(), "concrete rows fetched");

		let mut missing = Vec::new();
		for entry in entries {
			match found.get(&entry.pk) {
				Some(instance) => slots[entry.slot] = Some(instance.clone()),
				None => missing.push(entry),
			}
		}
		if missing.is_empty() {
			continue;
		}

		let missing_pks: Vec<i64> = missing.iter().map(|e| e.pk).collect();
		if !best_effort {
			tracing::warn!(model = %class, pks = ?missing_pks, "concrete rows missing, objects skipped");
			continue;
		}

		let parent = registry.parent(&class)?.map(|p| p.label());
		let mut to_floor = Vec::new();
		for entry in missing {
			match &parent {
				Some(parent) if *parent != entry.floor && registry.is_subclass(parent, &entry.floor) => {
					pending.entry(parent.clone()).or_default().push(entry);
				}
				_ => to_floor.push(entry),
			}
		}
		tracing::warn!(
			model = %class,
			pks = ?missing_pks,
			ancestor = parent.as_deref().unwrap_or_default(),
			"concrete rows missing, falling back to an ancestor"
		);
		for entry in to_floor {
			slots[entry.slot] = originals.remove(&entry.slot);
		}
	}

	Ok(slots.into_iter().flatten().collect())
}
