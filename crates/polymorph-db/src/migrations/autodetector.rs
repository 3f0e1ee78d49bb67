//! Change detection between two project states

use super::operations::Operation;
use super::state::{FieldState, ModelState, ProjectState};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

type ModelKey = (String, String);

/// Compares two project states and lists the operations that turn the first
/// into the second.
///
/// Operations come out as: created models (parents and relation targets
/// first), added fields, altered fields, removed fields, deleted models
/// (children first).
#[derive(Debug, Clone, Copy)]
pub struct Autodetector<'a> {
	from_state: &'a ProjectState,
	to_state: &'a ProjectState,
}

impl<'a> Autodetector<'a> {
	pub fn new(from_state: &'a ProjectState, to_state: &'a ProjectState) -> Self {
		Self { from_state, to_state }
	}

	pub fn detect_changes(&self) -> Vec<Operation> {
		let mut operations = Vec::new();

		let created: Vec<&ModelState> = self
			.to_state
			.models
			.iter()
			.filter(|(key, _)| !self.from_state.models.contains_key(*key))
			.map(|(_, model)| model)
			.collect();
		for model in order_by_dependency(&created) {
			operations.push(Operation::CreateModel {
				app_label: model.app_label.clone(),
				name: model.name.clone(),
				fields: model.fields.values().cloned().collect(),
				bases: model.bases.clone(),
				managers: model.managers.clone(),
			});
		}

		let kept: Vec<(&ModelState, &ModelState)> = self
			.from_state
			.models
			.iter()
			.filter_map(|(key, old)| self.to_state.models.get(key).map(|new| (old, new)))
			.collect();

		for (old, new) in &kept {
			for field in new.fields.values().filter(|f| !old.fields.contains_key(&f.name)) {
				operations.push(Operation::AddField {
					app_label: new.app_label.clone(),
					model_name: new.name.clone(),
					field: field.clone(),
				});
			}
		}
		for (old, new) in &kept {
			for field in new.fields.values() {
				if let Some(previous) = old.fields.get(&field.name)
					&& has_field_changed(previous, field)
				{
					tracing::debug!(model = %new.label(), field = %field.name, "field changed");
					operations.push(Operation::AlterField {
						app_label: new.app_label.clone(),
						model_name: new.name.clone(),
						field: field.clone(),
					});
				}
			}
		}
		for (old, new) in &kept {
			for name in old.fields.keys().filter(|name| !new.fields.contains_key(*name)) {
				operations.push(Operation::RemoveField {
					app_label: old.app_label.clone(),
					model_name: old.name.clone(),
					name: name.clone(),
				});
			}
		}

		let deleted: Vec<&ModelState> = self
			.from_state
			.models
			.iter()
			.filter(|(key, _)| !self.to_state.models.contains_key(*key))
			.map(|(_, model)| model)
			.collect();
		for model in order_by_dependency(&deleted).into_iter().rev() {
			operations.push(Operation::DeleteModel {
				app_label: model.app_label.clone(),
				name: model.name.clone(),
			});
		}

		operations
	}
}

/// Whether two states of the same field differ in a way that needs an
/// `AlterField`. On-delete handlers are compared by their reference, so a
/// guard and the action it wraps are the same.
pub fn has_field_changed(old: &FieldState, new: &FieldState) -> bool {
	old.field_type != new.field_type
		|| old.nullable != new.nullable
		|| old.params != new.params
		|| old.relation != new.relation
}

fn key_of_label(label: &str, app_label: &str) -> ModelKey {
	match label.split_once('.') {
		Some((app, name)) => (app.to_string(), name.to_lowercase()),
		None => (app_label.to_string(), label.to_lowercase()),
	}
}

/// Models that must exist before `model`: its parent and relation targets.
fn dependencies(model: &ModelState) -> Vec<ModelKey> {
	let mut deps = Vec::new();
	if let Some(parent) = &model.bases {
		deps.push(key_of_label(parent, &model.app_label));
	}
	for field in model.fields.values() {
		if let Some(relation) = &field.relation {
			deps.push(key_of_label(&relation.to, &model.app_label));
		}
	}
	deps
}

/// Order `models` so that dependencies come first. Relation dependencies
/// are dropped when they form a cycle; parents always come first.
fn order_by_dependency<'m>(models: &[&'m ModelState]) -> Vec<&'m ModelState> {
	let ordered = topological(models, |model| dependencies(model));
	if let Some(ordered) = ordered {
		return ordered;
	}
	tracing::warn!(
		models = models.len(),
		"circular relation dependencies between new models; ordering by inheritance only"
	);
	let bases_only = topological(models, |model| {
		model
			.bases
			.iter()
			.map(|parent| key_of_label(parent, &model.app_label))
			.collect()
	});
	bases_only.unwrap_or_else(|| models.to_vec())
}

fn topological<'m>(
	models: &[&'m ModelState],
	deps: impl Fn(&ModelState) -> Vec<ModelKey>,
) -> Option<Vec<&'m ModelState>> {
	let mut graph: DiGraph<&'m ModelState, ()> = DiGraph::new();
	let nodes: HashMap<ModelKey, NodeIndex> = models
		.iter()
		.map(|model| (model.key(), graph.add_node(*model)))
		.collect();
	for model in models {
		let Some(&to) = nodes.get(&model.key()) else {
			continue;
		};
		for dep in deps(model) {
			if let Some(&from) = nodes.get(&dep)
				&& from != to
			{
				graph.add_edge(from, to, ());
			}
		}
	}
	toposort(&graph, None)
		.ok()
		.map(|order| order.into_iter().map(|index| graph[index]).collect())
}
