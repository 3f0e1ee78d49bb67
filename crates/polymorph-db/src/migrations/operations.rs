//! Schema operations

use super::Result;
use super::state::{FieldState, ProjectState};

/// One schema change
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
	CreateModel {
		app_label: String,
		name: String,
		fields: Vec<FieldState>,
		/// Parent label for multi-table inheritance
		bases: Option<String>,
		managers: Vec<String>,
	},
	DeleteModel {
		app_label: String,
		name: String,
	},
	AddField {
		app_label: String,
		model_name: String,
		field: FieldState,
	},
	RemoveField {
		app_label: String,
		model_name: String,
		name: String,
	},
	AlterField {
		app_label: String,
		model_name: String,
		field: FieldState,
	},
}

impl Operation {
	pub fn app_label(&self) -> &str {
		match self {
			Operation::CreateModel { app_label, .. }
			| Operation::DeleteModel { app_label, .. }
			| Operation::AddField { app_label, .. }
			| Operation::RemoveField { app_label, .. }
			| Operation::AlterField { app_label, .. } => app_label,
		}
	}

	/// Short human readable summary, as printed by `makemigrations`
	pub fn describe(&self) -> String {
		match self {
			Operation::CreateModel { name, .. } => format!("Create model {}", name),
			Operation::DeleteModel { name, .. } => format!("Delete model {}", name),
			Operation::AddField { model_name, field, .. } => {
				format!("Add field {} to {}", field.name, model_name.to_lowercase())
			}
			Operation::RemoveField { model_name, name, .. } => {
				format!("Remove field {} from {}", name, model_name.to_lowercase())
			}
			Operation::AlterField { model_name, field, .. } => {
				format!("Alter field {} on {}", field.name, model_name.to_lowercase())
			}
		}
	}

	pub fn state_forwards(&self, state: &mut ProjectState) -> Result<()> {
		state.apply(self)
	}
}
