//! Migration definition as loaded from a written migration file

use super::Result;
use super::operations::Operation;
use super::state::ProjectState;

/// A named list of operations with its dependencies
#[derive(Debug, Clone, PartialEq)]
pub struct Migration {
	pub app_label: &'static str,
	pub name: &'static str,
	/// `(app_label, migration name)` pairs applied before this one
	pub dependencies: Vec<(&'static str, &'static str)>,
	pub operations: Vec<Operation>,
}

impl Migration {
	pub fn new(app_label: &'static str, name: &'static str) -> Self {
		Self {
			app_label,
			name,
			dependencies: Vec::new(),
			operations: Vec::new(),
		}
	}

	/// Project state after this migration, starting from `state`.
	pub fn apply_to(&self, state: &ProjectState) -> Result<ProjectState> {
		let mut next = state.clone();
		next.apply_all(&self.operations)?;
		Ok(next)
	}
}
