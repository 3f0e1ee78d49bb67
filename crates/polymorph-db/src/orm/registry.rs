//! Model registry
//!
//! Turns [`ModelDef`] declarations into immutable [`ModelMeta`]s and indexes
//! them for the query compiler and the deletion collector. The registry is
//! built once at startup; after that it is only read.

use super::connection::DatabaseConnection;
use super::deletion::{HandlerRef, OnDelete};
use super::fields::{
	Field, FieldMeta, FieldType, ManyToManyMeta, RelatedField, RelationMeta, parent_link_handler,
};
use super::instance::Instance;
use super::manager::{BaseManager, Manager};
use super::model::{Capability, ModelDef, ModelMeta};
use crate::contenttypes;
use async_trait::async_trait;
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use polymorph_core::{CheckMessage, Error, Result, checks};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Extension point called while models are prepared and after the registry
/// is complete.
#[async_trait]
pub trait ModelHook: Send + Sync + fmt::Debug {
	fn name(&self) -> &str;

	/// Adjust a model's resolved options before it is frozen.
	fn class_prepared(&self, _meta: &mut ModelMeta, _ctx: &PrepareContext) -> Result<()> {
		Ok(())
	}

	/// System checks over the finished registry.
	fn check(&self, _registry: &ModelRegistry) -> Vec<CheckMessage> {
		Vec::new()
	}

	/// Called before an instance is inserted.
	async fn pre_save(&self, _conn: &DatabaseConnection, _instance: &mut Instance) -> Result<()> {
		Ok(())
	}
}

/// Facts about the whole model set, available to hooks during preparation
#[derive(Debug, Default)]
pub struct PrepareContext {
	polymorphic: HashSet<String>,
	parents: HashMap<String, String>,
}

impl PrepareContext {
	pub fn is_polymorphic(&self, label: &str) -> bool {
		self.polymorphic.contains(label)
	}

	pub fn parent(&self, label: &str) -> Option<&str> {
		self.parents.get(label).map(String::as_str)
	}
}

/// Builder for [`ModelRegistry`]
#[derive(Debug, Default)]
pub struct ModelRegistryBuilder {
	defs: Vec<ModelDef>,
	hooks: Vec<Arc<dyn ModelHook>>,
	strict_checks: bool,
}

impl ModelRegistryBuilder {
	pub fn model(mut self, def: ModelDef) -> Self {
		self.defs.push(def);
		self
	}

	pub fn models(mut self, defs: impl IntoIterator<Item = ModelDef>) -> Self {
		self.defs.extend(defs);
		self
	}

	pub fn hook(mut self, hook: impl ModelHook + 'static) -> Self {
		self.hooks.push(Arc::new(hook));
		self
	}

	/// Treat check warnings as errors.
	pub fn strict_checks(mut self, strict: bool) -> Self {
		self.strict_checks = strict;
		self
	}

	pub fn build(self) -> Result<ModelRegistry> {
		let mut defs = vec![contenttypes::content_type_model()];
		defs.extend(self.defs);

		let labels = LabelIndex::new(&defs)?;
		let through = through_models(&defs, &labels)?;
		defs.extend(through);
		let labels = LabelIndex::new(&defs)?;
		let ordered = inheritance_order(&defs, &labels)?;

		let mut ctx = PrepareContext::default();
		for def in &ordered {
			let label = def.label();
			if let Some(parent) = &def.parent {
				let parent = labels.resolve(parent, &def.app_label)?;
				let inherited = ctx.polymorphic.contains(&parent);
				ctx.parents.insert(label.clone(), parent);
				if def.polymorphic || inherited {
					ctx.polymorphic.insert(label);
				}
			} else if def.polymorphic {
				ctx.polymorphic.insert(label);
			}
		}

		let mut models: IndexMap<String, Arc<ModelMeta>> = IndexMap::new();
		let mut declared_managers: HashMap<String, Vec<Arc<dyn Manager>>> = HashMap::new();
		for def in ordered {
			let label = def.label();
			let mut meta = resolve_model(&def, &labels, &ctx, &models, &declared_managers)?;
			declared_managers.insert(label.clone(), meta.managers.clone());
			for hook in &self.hooks {
				hook.class_prepared(&mut meta, &ctx)?;
			}
			if meta.managers.is_empty() {
				meta.managers.push(Arc::new(BaseManager::new("objects")));
			}
			validate_fields(&meta, &models)?;
			models.insert(label, Arc::new(meta));
		}

		let registry = ModelRegistry::index(models, self.hooks)?;
		registry.run_checks(self.strict_checks)?;
		Ok(registry)
	}
}

/// Resolved, immutable model set
pub struct ModelRegistry {
	models: IndexMap<String, Arc<ModelMeta>>,
	by_name: HashMap<(String, String), String>,
	children: HashMap<String, Vec<String>>,
	reverse: HashMap<String, Vec<RelatedField>>,
	hooks: Vec<Arc<dyn ModelHook>>,
}

impl fmt::Debug for ModelRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ModelRegistry")
			.field("models", &self.models.keys().collect::<Vec<_>>())
			.field("hooks", &self.hooks)
			.finish()
	}
}

static APPS: OnceCell<Arc<ModelRegistry>> = OnceCell::new();

/// Install the process-wide registry. Only the first call succeeds.
pub fn install(registry: Arc<ModelRegistry>) -> Result<Arc<ModelRegistry>> {
	APPS.set(Arc::clone(&registry))
		.map_err(|_| Error::ImproperlyConfigured("the model registry is already installed".to_string()))?;
	Ok(registry)
}

/// The process-wide registry, if installed.
pub fn apps() -> Option<Arc<ModelRegistry>> {
	APPS.get().cloned()
}

impl ModelRegistry {
	pub fn builder() -> ModelRegistryBuilder {
		ModelRegistryBuilder::default()
	}

	fn index(models: IndexMap<String, Arc<ModelMeta>>, hooks: Vec<Arc<dyn ModelHook>>) -> Result<Self> {
		let mut by_name = HashMap::new();
		let mut children: HashMap<String, Vec<String>> = HashMap::new();
		let mut reverse: HashMap<String, Vec<RelatedField>> = HashMap::new();

		for (label, meta) in &models {
			by_name.insert((meta.app_label.clone(), meta.model_name.clone()), label.clone());
			if let Some(parent) = &meta.parent {
				children.entry(parent.clone()).or_default().push(label.clone());
			}
			for field in meta.local_concrete_fields() {
				if let Some(relation) = &field.relation {
					reverse.entry(relation.to.clone()).or_default().push(RelatedField {
						model: label.clone(),
						target: relation.to.clone(),
						field: field.clone(),
					});
				}
			}
		}

		Ok(Self {
			models,
			by_name,
			children,
			reverse,
			hooks,
		})
	}

	fn run_checks(&self, strict: bool) -> Result<()> {
		let messages: Vec<CheckMessage> = self.hooks.iter().flat_map(|h| h.check(self)).collect();
		let (errors, warnings) = checks::partition(messages);
		for warning in &warnings {
			tracing::warn!(id = %warning.id, obj = %warning.obj, "{}", warning.msg);
		}
		let mut failing = errors;
		if strict {
			failing.extend(warnings);
		}
		if failing.is_empty() {
			Ok(())
		} else {
			Err(Error::SystemCheck(failing))
		}
	}

	/// Model by label (`app.Name`) or unambiguous bare name.
	pub fn get(&self, label: &str) -> Result<Arc<ModelMeta>> {
		self.get_model(label)
			.ok_or_else(|| Error::ImproperlyConfigured(format!("model '{}' is not registered", label)))
	}

	pub fn get_model(&self, label: &str) -> Option<Arc<ModelMeta>> {
		if let Some(meta) = self.models.get(label) {
			return Some(Arc::clone(meta));
		}
		if label.contains('.') {
			return None;
		}
		let mut matches = self.models.values().filter(|m| m.name == label);
		match (matches.next(), matches.next()) {
			(Some(meta), None) => Some(Arc::clone(meta)),
			_ => None,
		}
	}

	/// Lookup by app label and lower-case model name, as stored in content types.
	pub fn get_by_app_and_name(&self, app_label: &str, model_name: &str) -> Option<Arc<ModelMeta>> {
		self.by_name
			.get(&(app_label.to_string(), model_name.to_lowercase()))
			.and_then(|label| self.models.get(label))
			.cloned()
	}

	/// All models, parents before children.
	pub fn models(&self) -> impl Iterator<Item = &Arc<ModelMeta>> {
		self.models.values()
	}

	pub fn hooks(&self) -> &[Arc<dyn ModelHook>] {
		&self.hooks
	}

	pub fn parent(&self, label: &str) -> Result<Option<Arc<ModelMeta>>> {
		let meta = self.get(label)?;
		meta.parent.as_deref().map(|p| self.get(p)).transpose()
	}

	/// Ancestors, nearest first.
	pub fn ancestors(&self, label: &str) -> Result<Vec<Arc<ModelMeta>>> {
		let mut out = Vec::new();
		let mut current = self.get(label)?;
		while let Some(parent) = current.parent.clone() {
			current = self.get(&parent)?;
			out.push(Arc::clone(&current));
		}
		Ok(out)
	}

	/// The model and its ancestors, root first.
	pub fn chain(&self, label: &str) -> Result<Vec<Arc<ModelMeta>>> {
		let mut chain = self.ancestors(label)?;
		chain.reverse();
		chain.push(self.get(label)?);
		Ok(chain)
	}

	/// Direct subclasses
	pub fn children(&self, label: &str) -> Vec<Arc<ModelMeta>> {
		self.children
			.get(label)
			.map(|labels| labels.iter().filter_map(|l| self.models.get(l)).cloned().collect())
			.unwrap_or_default()
	}

	/// All subclasses, depth first.
	pub fn descendants(&self, label: &str) -> Vec<Arc<ModelMeta>> {
		let mut out = Vec::new();
		for child in self.children(label) {
			let label = child.label();
			out.push(child);
			out.extend(self.descendants(&label));
		}
		out
	}

	/// Whether `label` is `base` or inherits from it.
	pub fn is_subclass(&self, label: &str, base: &str) -> bool {
		let mut current = Some(label.to_string());
		while let Some(l) = current {
			if l == base {
				return true;
			}
			current = self.models.get(&l).and_then(|m| m.parent.clone());
		}
		false
	}

	/// Concrete fields of the whole chain, root first, with their owner.
	pub fn concrete_fields(&self, label: &str) -> Result<Vec<(Arc<ModelMeta>, FieldMeta)>> {
		Ok(self
			.chain(label)?
			.into_iter()
			.flat_map(|meta| {
				let fields: Vec<FieldMeta> = meta.local_concrete_fields().cloned().collect();
				fields.into_iter().map(move |f| (Arc::clone(&meta), f))
			})
			.collect())
	}

	/// Field by name or attname anywhere in the chain, with its owner.
	pub fn find_field(&self, label: &str, name: &str) -> Result<Option<(Arc<ModelMeta>, FieldMeta)>> {
		for meta in self.chain(label)?.into_iter().rev() {
			if let Some(field) = meta.local_field(name) {
				let field = field.clone();
				return Ok(Some((meta, field)));
			}
		}
		Ok(None)
	}

	/// Relation fields pointing at exactly `label`.
	pub fn reverse_relations(&self, label: &str) -> Vec<RelatedField> {
		self.reverse.get(label).cloned().unwrap_or_default()
	}

	/// Relations consulted when rows of `label` are deleted: those pointing
	/// at the model itself, plus those pointing at its ancestors except the
	/// parent links of sibling classes.
	pub fn delete_candidates(&self, label: &str) -> Result<Vec<RelatedField>> {
		let mut out = self.reverse_relations(label);
		for ancestor in self.ancestors(label)? {
			out.extend(
				self.reverse_relations(&ancestor.label())
					.into_iter()
					.filter(|r| !r.is_parent_link()),
			);
		}
		Ok(out)
	}

	/// Reverse one-to-one (or parent link) reachable from `label` by its
	/// related query name.
	pub fn find_reverse_one_to_one(&self, label: &str, name: &str) -> Result<Option<RelatedField>> {
		for meta in self.chain(label)?.into_iter().rev() {
			let found = self.reverse_relations(&meta.label()).into_iter().find(|r| {
				r.is_one_to_one()
					&& r.field
						.relation
						.as_ref()
						.is_some_and(|rel| !rel.is_hidden() && rel.related_query_name == name)
			});
			if found.is_some() {
				return Ok(found);
			}
		}
		Ok(None)
	}

	/// Reverse accessor names usable from `label`, for error messages.
	pub fn reverse_names(&self, label: &str) -> Result<Vec<String>> {
		let mut names = Vec::new();
		for meta in self.chain(label)? {
			for related in self.reverse_relations(&meta.label()) {
				if let Some(rel) = &related.field.relation
					&& related.is_one_to_one()
					&& !rel.is_hidden()
				{
					names.push(rel.related_query_name.clone());
				}
			}
		}
		Ok(names)
	}

	/// First polymorphic model of the chain (the one storing the discriminator).
	pub fn polymorphic_base(&self, label: &str) -> Result<Option<Arc<ModelMeta>>> {
		Ok(self.chain(label)?.into_iter().find(|m| m.polymorphic))
	}

	/// Models strictly below `ancestor` down to `descendant`, top first.
	pub fn path_to_descendant(&self, ancestor: &str, descendant: &str) -> Result<Vec<Arc<ModelMeta>>> {
		let chain = self.chain(descendant)?;
		let position = chain.iter().position(|m| m.label() == ancestor).ok_or_else(|| {
			Error::ImproperlyConfigured(format!("'{}' does not inherit from '{}'", descendant, ancestor))
		})?;
		Ok(chain[position + 1..].to_vec())
	}
}

struct LabelIndex {
	labels: HashSet<String>,
	by_name: HashMap<String, Vec<String>>,
}

impl LabelIndex {
	fn new(defs: &[ModelDef]) -> Result<Self> {
		let mut labels = HashSet::new();
		let mut by_name: HashMap<String, Vec<String>> = HashMap::new();
		for def in defs {
			let label = def.label();
			if !labels.insert(label.clone()) {
				return Err(Error::ImproperlyConfigured(format!("model '{}' is declared twice", label)));
			}
			by_name.entry(def.name.clone()).or_default().push(label);
		}
		Ok(Self { labels, by_name })
	}

	/// `app.Name` as is; a bare name prefers the same app, then a unique match.
	fn resolve(&self, reference: &str, from_app: &str) -> Result<String> {
		if reference.contains('.') {
			return if self.labels.contains(reference) {
				Ok(reference.to_string())
			} else {
				Err(Error::ImproperlyConfigured(format!("unknown model '{}'", reference)))
			};
		}
		let same_app = format!("{}.{}", from_app, reference);
		if self.labels.contains(&same_app) {
			return Ok(same_app);
		}
		match self.by_name.get(reference).map(Vec::as_slice) {
			Some([only]) => Ok(only.clone()),
			Some(many) if many.len() > 1 => Err(Error::ImproperlyConfigured(format!(
				"model name '{}' is ambiguous: {}",
				reference,
				many.join(", ")
			))),
			_ => Err(Error::ImproperlyConfigured(format!("unknown model '{}'", reference))),
		}
	}
}

/// Auto-created through models for many-to-many fields without `through`.
fn through_models(defs: &[ModelDef], labels: &LabelIndex) -> Result<Vec<ModelDef>> {
	let mut out = Vec::new();
	for def in defs {
		for field in def.fields.iter().filter(|f| f.field_type == FieldType::ManyToManyField) {
			if field.through.is_some() {
				continue;
			}
			let target = labels.resolve(field.to.as_deref().unwrap_or_default(), &def.app_label)?;
			let (source_field, target_field) = m2m_field_names(&def.label(), &target);
			let hidden = format!("{}_{}+", def.name, field.name);
			out.push(ModelDef {
				auto_created: true,
				..ModelDef::new(def.app_label.clone(), format!("{}_{}", def.name, field.name))
					.field(
						Field::foreign_key(source_field, def.label(), OnDelete::Cascade)
							.related_name(hidden.clone()),
					)
					.field(Field::foreign_key(target_field, target, OnDelete::Cascade).related_name(hidden))
			});
		}
	}
	Ok(out)
}

fn m2m_field_names(source: &str, target: &str) -> (String, String) {
	let short = |label: &str| label.rsplit('.').next().unwrap_or(label).to_lowercase();
	if source == target {
		(format!("from_{}", short(source)), format!("to_{}", short(target)))
	} else {
		(short(source), short(target))
	}
}

/// Definitions sorted so that every parent precedes its children.
fn inheritance_order(defs: &[ModelDef], labels: &LabelIndex) -> Result<Vec<ModelDef>> {
	let by_label: IndexMap<String, &ModelDef> = defs.iter().map(|d| (d.label(), d)).collect();
	let mut done: HashSet<String> = HashSet::new();
	let mut out = Vec::new();

	for def in defs {
		let mut stack = Vec::new();
		let mut current = Some(def);
		while let Some(d) = current {
			let label = d.label();
			if done.contains(&label) {
				break;
			}
			if stack.contains(&label) {
				return Err(Error::ImproperlyConfigured(format!(
					"inheritance cycle through '{}'",
					label
				)));
			}
			stack.push(label);
			current = match &d.parent {
				Some(parent) => {
					let parent = labels.resolve(parent, &d.app_label)?;
					by_label.get(&parent).copied()
				}
				None => None,
			};
		}
		for label in stack.into_iter().rev() {
			if done.insert(label.clone())
				&& let Some(d) = by_label.get(&label)
			{
				out.push((*d).clone());
			}
		}
	}
	Ok(out)
}

fn resolve_model(
	def: &ModelDef,
	labels: &LabelIndex,
	ctx: &PrepareContext,
	models: &IndexMap<String, Arc<ModelMeta>>,
	declared_managers: &HashMap<String, Vec<Arc<dyn Manager>>>,
) -> Result<ModelMeta> {
	let label = def.label();
	let model_name = def.name.to_lowercase();
	let parent = ctx.parent(&label).map(str::to_string);
	let parent_meta = parent.as_ref().and_then(|p| models.get(p));

	let mut fields: Vec<Field> = def.fields.clone();
	let mut generated: HashSet<String> = HashSet::new();
	let mut parent_link = None;
	if let Some(parent) = &parent {
		let declared = fields.iter_mut().find(|f| {
			f.parent_link
				&& f.to
					.as_deref()
					.is_some_and(|to| labels.resolve(to, &def.app_label).ok().as_deref() == Some(parent))
		});
		match declared {
			Some(field) => {
				field.primary_key = true;
				parent_link = Some(field.name.clone());
			}
			None => {
				let parent_name = parent.rsplit('.').next().unwrap_or(parent).to_lowercase();
				let name = format!("{}_ptr", parent_name);
				let link = Field::relation_with_handler(
					name.clone(),
					FieldType::OneToOneField,
					parent.clone(),
					parent_link_handler(),
				)
				.parent_link()
				.primary_key();
				fields.insert(0, link);
				generated.insert(name.clone());
				parent_link = Some(name);
			}
		}
	} else if !fields.iter().any(|f| f.primary_key) {
		fields.insert(0, Field::auto("id"));
		generated.insert("id".to_string());
	}

	let mut resolved = Vec::with_capacity(fields.len());
	for field in &fields {
		let auto_created = generated.contains(&field.name);
		resolved.push(resolve_field(
			field,
			def,
			labels,
			&model_name,
			parent_link.as_deref(),
			auto_created,
		)?);
	}
	let pk = resolved
		.iter()
		.find(|f| f.primary_key)
		.map(|f| f.name.clone())
		.unwrap_or_else(|| "id".to_string());

	let mut managers = Vec::new();
	let mut repr = None;
	for capability in &def.capabilities {
		match capability {
			Capability::Manager(m) => managers.push(Arc::clone(m)),
			Capability::Repr(r) => repr = Some(Arc::clone(r)),
		}
	}
	if managers.is_empty()
		&& let Some(parent) = &parent
	{
		managers = declared_managers.get(parent).cloned().unwrap_or_default();
	}
	if repr.is_none() {
		repr = parent_meta.and_then(|p| p.repr.clone());
	}

	let ordering = if def.ordering.is_empty() {
		parent_meta.map(|p| p.ordering.clone()).unwrap_or_default()
	} else {
		def.ordering.clone()
	};

	Ok(ModelMeta {
		app_label: def.app_label.clone(),
		name: def.name.clone(),
		model_name: model_name.clone(),
		db_table: def
			.db_table
			.clone()
			.unwrap_or_else(|| format!("{}_{}", def.app_label.to_lowercase(), model_name)),
		parent,
		parent_link,
		polymorphic: ctx.is_polymorphic(&label),
		fields: resolved,
		inherited_fields: parent_meta
			.map(|p| p.inherited_fields.iter().chain(p.local_concrete_fields()).cloned().collect())
			.unwrap_or_default(),
		pk,
		ordering,
		managers,
		repr,
		base_manager_name: def
			.base_manager_name
			.clone()
			.or_else(|| parent_meta.and_then(|p| p.base_manager_name.clone())),
		auto_created: def.auto_created,
	})
}

fn resolve_field(
	field: &Field,
	def: &ModelDef,
	labels: &LabelIndex,
	model_name: &str,
	parent_link: Option<&str>,
	auto_created: bool,
) -> Result<FieldMeta> {
	let label = def.label();
	let is_fk = matches!(field.field_type, FieldType::ForeignKey | FieldType::OneToOneField);
	let attname = if is_fk {
		format!("{}_id", field.name)
	} else {
		field.name.clone()
	};
	let is_parent_link = parent_link == Some(field.name.as_str());

	let relation = if is_fk {
		let to = labels.resolve(field.to.as_deref().unwrap_or_default(), &def.app_label)?;
		let on_delete = field.on_delete.clone().unwrap_or_else(parent_link_handler);
		if on_delete.reference() == HandlerRef::Action(OnDelete::SetNull) && !field.null {
			return Err(Error::ImproperlyConfigured(format!(
				"{}.{}: on_delete SET_NULL requires a nullable field",
				label, field.name
			)));
		}
		if on_delete.reference() == HandlerRef::Action(OnDelete::SetDefault) && field.default.is_none() {
			return Err(Error::ImproperlyConfigured(format!(
				"{}.{}: on_delete SET_DEFAULT requires a default",
				label, field.name
			)));
		}
		let related_query_name = field
			.related_name
			.clone()
			.filter(|n| !n.ends_with('+'))
			.unwrap_or_else(|| model_name.to_string());
		Some(RelationMeta {
			to,
			on_delete,
			related_name: field.related_name.clone(),
			related_query_name,
			parent_link: is_parent_link,
			db_constraint: field.db_constraint,
		})
	} else {
		None
	};

	let many_to_many = if field.field_type == FieldType::ManyToManyField {
		let to = labels.resolve(field.to.as_deref().unwrap_or_default(), &def.app_label)?;
		let (source_field, target_field) = m2m_field_names(&label, &to);
		let through = match &field.through {
			Some(through) => labels.resolve(through, &def.app_label)?,
			None => format!("{}.{}_{}", def.app_label, def.name, field.name),
		};
		Some(ManyToManyMeta {
			to,
			through,
			source_field,
			target_field,
			related_name: field.related_name.clone(),
		})
	} else {
		None
	};

	Ok(FieldMeta {
		name: field.name.clone(),
		column: field.db_column.clone().unwrap_or_else(|| attname.clone()),
		attname,
		field_type: field.field_type,
		max_length: field.max_length,
		null: field.null,
		default: field.default.clone(),
		unique: field.unique || field.primary_key,
		primary_key: field.primary_key,
		model: label,
		relation,
		many_to_many,
		auto_created,
	})
}

/// Field names must be unique along an inheritance chain.
fn validate_fields(meta: &ModelMeta, models: &IndexMap<String, Arc<ModelMeta>>) -> Result<()> {
	let mut seen: HashSet<&str> = HashSet::new();
	for field in &meta.fields {
		if !seen.insert(field.name.as_str()) {
			return Err(Error::ImproperlyConfigured(format!(
				"{}: field '{}' is declared twice",
				meta.label(),
				field.name
			)));
		}
	}

	let mut parent = meta.parent.as_ref().and_then(|p| models.get(p));
	while let Some(ancestor) = parent {
		for field in &meta.fields {
			if ancestor.fields.iter().any(|f| f.name == field.name || f.attname == field.attname) {
				return Err(Error::ImproperlyConfigured(format!(
					"{}: field '{}' clashes with the field of the same name from base class '{}'",
					meta.label(),
					field.name,
					ancestor.label()
				)));
			}
		}
		parent = ancestor.parent.as_ref().and_then(|p| models.get(p));
	}
	Ok(())
}
