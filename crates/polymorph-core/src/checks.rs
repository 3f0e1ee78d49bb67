//! System check messages
//!
//! Checks run once at startup (when the model registry is built) and report
//! configuration problems before any query is served.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a check message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CheckLevel {
	Warning,
	Error,
}

/// A single system check result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckMessage {
	pub level: CheckLevel,
	/// Stable identifier such as `polymorphic.E001`
	pub id: String,
	pub msg: String,
	pub hint: Option<String>,
	/// Object the message is about (model label, or `label.field`)
	pub obj: String,
}

impl CheckMessage {
	pub fn error(id: impl Into<String>, msg: impl Into<String>, obj: impl Into<String>) -> Self {
		Self {
			level: CheckLevel::Error,
			id: id.into(),
			msg: msg.into(),
			hint: None,
			obj: obj.into(),
		}
	}

	pub fn warning(id: impl Into<String>, msg: impl Into<String>, obj: impl Into<String>) -> Self {
		Self {
			level: CheckLevel::Warning,
			id: id.into(),
			msg: msg.into(),
			hint: None,
			obj: obj.into(),
		}
	}

	pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
		self.hint = Some(hint.into());
		self
	}

	pub fn is_error(&self) -> bool {
		self.level == CheckLevel::Error
	}
}

impl fmt::Display for CheckMessage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}: ({}) {}", self.obj, self.id, self.msg)?;
		if let Some(hint) = &self.hint {
			write!(f, "\n\tHINT: {}", hint)?;
		}
		Ok(())
	}
}

/// Splits messages into (errors, warnings), preserving order.
pub fn partition(messages: Vec<CheckMessage>) -> (Vec<CheckMessage>, Vec<CheckMessage>) {
	messages.into_iter().partition(CheckMessage::is_error)
}
