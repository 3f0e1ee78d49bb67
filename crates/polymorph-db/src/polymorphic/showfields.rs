//! Instance representations listing field types and values
//!
//! ```text
//! <Model2B: id 1, field1 (CharField) "B1", field2 (CharField) "B2">
//! ```

use super::hook::CTYPE_FIELD;
use crate::orm::{FieldMeta, FieldType, Instance, InstanceRepr, Value};
use std::collections::HashSet;
use std::fmt;

pub const DEFAULT_MAX_FIELD_WIDTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ShowOptions {
	show_type: bool,
	show_content: bool,
	max_field_width: usize,
	max_line_width: Option<usize>,
}

impl ShowOptions {
	fn new(show_type: bool, show_content: bool) -> Self {
		Self {
			show_type,
			show_content,
			max_field_width: DEFAULT_MAX_FIELD_WIDTH,
			max_line_width: None,
		}
	}
}

struct Part {
	new_section: bool,
	text: String,
	separator: &'static str,
}

fn is_internal(field: &FieldMeta) -> bool {
	field.name == CTYPE_FIELD || field.is_parent_link() || field.name.contains("_ptr")
}

fn content(options: &ShowOptions, field: &FieldMeta, value: Option<&Value>) -> String {
	let value = value.unwrap_or(&Value::Null);
	if field.field_type == FieldType::ForeignKey {
		return match (value, &field.relation) {
			(Value::Null, _) => " None".to_string(),
			(_, Some(relation)) => format!(" {}", relation.to.rsplit('.').next().unwrap_or(&relation.to)),
			(other, None) => format!(" {}", other),
		};
	}
	match value {
		Value::Null | Value::Int(_) | Value::Bool(_) => format!(" {}", value),
		other => {
			let text = other.to_string();
			let max = options.max_field_width;
			let text = if text.chars().count() > max {
				let kept: String = text.chars().take(max.saturating_sub(2)).collect();
				format!("{}..", kept)
			} else {
				text
			};
			format!(" \"{}\"", text)
		}
	}
}

fn field_parts(options: &ShowOptions, instance: &Instance) -> Vec<Part> {
	let mut parts = vec![Part {
		new_section: true,
		text: instance.model_name().to_string(),
		separator: ":",
	}];
	let mut done = HashSet::new();
	for field in instance.meta().all_fields() {
		if field.field_type == FieldType::ManyToManyField || is_internal(field) || !done.insert(&field.name) {
			continue;
		}
		let mut text = field.name.clone();
		if field.primary_key && field.name == "id" && field.field_type == FieldType::AutoField {
			match instance.get(&field.attname) {
				Some(Value::Null) | None => text.push_str(" None"),
				Some(value) => text.push_str(&format!(" {}", value)),
			}
		} else {
			if options.show_type {
				text.push_str(&format!(" ({}", field.field_type));
				if field.primary_key {
					text.push_str("/pk");
				}
				text.push(')');
			}
			if options.show_content {
				text.push_str(&content(options, field, instance.get(&field.attname)));
			}
		}
		parts.push(Part {
			new_section: false,
			text,
			separator: ",",
		});
	}
	parts
}

/// Join parts, wrapping lines at `max_line_width` after a separator.
fn layout(options: &ShowOptions, model_name: &str, parts: &[Part]) -> String {
	let indent = model_name.chars().count() + 5;
	let mut out = String::new();
	let mut xpos = 0;
	let mut line_break: Option<usize> = None;

	for (i, part) in parts.iter().enumerate() {
		let next = parts.get(i + 1);
		let width = part.text.chars().count();

		if let (Some(max), Some(position)) = (options.max_line_width, line_break)
			&& xpos + width > max
		{
			let rest = out.split_off(position);
			xpos = indent + rest.chars().count();
			out.push('\n');
			out.push_str(&" ".repeat(indent));
			out.push_str(&rest);
		}

		out.push_str(&part.text);
		xpos += width;

		if let Some(next) = next {
			if !next.new_section {
				out.push_str(part.separator);
				xpos += part.separator.len();
			}
			out.push(' ');
			xpos += 1;
		}
		if !part.new_section {
			line_break = Some(out.len());
		}
	}
	out
}

fn render(options: &ShowOptions, instance: &Instance, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	let parts = field_parts(options, instance);
	write!(f, "<{}>", layout(options, instance.model_name(), &parts))
}

macro_rules! show_field_repr {
	($(#[$doc:meta])* $name:ident, $show_type:expr, $show_content:expr) => {
		$(#[$doc])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq)]
		pub struct $name {
			options: ShowOptions,
		}

		impl $name {
			pub fn new() -> Self {
				Self {
					options: ShowOptions::new($show_type, $show_content),
				}
			}

			/// Longest value shown before it is cut with `..`.
			pub fn max_field_width(mut self, width: usize) -> Self {
				self.options.max_field_width = width;
				self
			}

			/// Wrap the output at roughly `width` columns.
			pub fn max_line_width(mut self, width: usize) -> Self {
				self.options.max_line_width = Some(width);
				self
			}
		}

		impl Default for $name {
			fn default() -> Self {
				Self::new()
			}
		}

		impl InstanceRepr for $name {
			fn fmt_instance(&self, instance: &Instance, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				render(&self.options, instance, f)
			}
		}
	};
}

show_field_repr!(
	/// Shows each field with its type.
	ShowFieldType,
	true,
	false
);
show_field_repr!(
	/// Shows each field with its value.
	ShowFieldContent,
	false,
	true
);
show_field_repr!(
	/// Shows each field with its type and value.
	ShowFieldTypeAndContent,
	true,
	true
);
