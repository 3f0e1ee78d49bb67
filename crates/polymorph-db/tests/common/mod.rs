//! Shared models, connections and log capture for the integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use polymorph_conf::PolymorphicSettings;
use polymorph_db::backends::MemoryBackend;
use polymorph_db::orm::{DatabaseConnection, Field, Instance, ModelDef, ModelRegistry, OnDelete, Value};
use polymorph_db::polymorphic::PolymorphicHook;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::field::{Field as TracingField, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Models of the polymorphic test suite:
///
/// - `Model2A <- Model2B <- Model2C`, polymorphic, three levels
/// - `PolyBase <- PolyA | PolyB | PolyC`, polymorphic, with a many-to-many
///   to `Group` and a protected foreign key to `Related`
/// - `Normal`, a plain model with a cascading foreign key to `PolyBase`
/// - `Watcher`, a plain model with a nullable set-null foreign key to
///   `PolyBase`
/// - `Keeper`, a plain model with a protected foreign key to `PolyBase`
pub fn registry() -> ModelRegistry {
	ModelRegistry::builder()
		.hook(PolymorphicHook::new())
		.model(ModelDef::new("tests", "Model2A").polymorphic().field(Field::char("field1", 30)))
		.model(ModelDef::new("tests", "Model2B").parent("Model2A").field(Field::char("field2", 30)))
		.model(ModelDef::new("tests", "Model2C").parent("Model2B").field(Field::char("field3", 30)))
		.model(ModelDef::new("tests", "Group").field(Field::char("name", 30)))
		.model(ModelDef::new("tests", "Related").field(Field::char("name", 30)))
		.model(
			ModelDef::new("tests", "PolyBase")
				.polymorphic()
				.field(Field::char("name", 30))
				.field(Field::foreign_key("related", "Related", OnDelete::Protect).null())
				.field(Field::many_to_many("groups", "Group")),
		)
		.model(ModelDef::new("tests", "PolyA").parent("PolyBase").field(Field::integer("a")))
		.model(ModelDef::new("tests", "PolyB").parent("PolyBase").field(Field::integer("b")))
		.model(ModelDef::new("tests", "PolyC").parent("PolyBase").field(Field::integer("c")))
		.model(
			ModelDef::new("tests", "Normal")
				.field(Field::char("tag", 30))
				.field(Field::foreign_key("target", "PolyBase", OnDelete::Cascade)),
		)
		.model(
			ModelDef::new("tests", "Watcher")
				.field(Field::foreign_key("target", "PolyBase", OnDelete::SetNull).null()),
		)
		.model(
			ModelDef::new("tests", "Keeper")
				.field(Field::foreign_key("target", "PolyBase", OnDelete::Protect)),
		)
		.build()
		.expect("test models are valid")
}

pub struct TestDb {
	pub conn: DatabaseConnection,
	pub backend: Arc<MemoryBackend>,
}

impl TestDb {
	pub async fn new() -> Self {
		Self::with_settings(PolymorphicSettings::default()).await
	}

	pub async fn with_settings(settings: PolymorphicSettings) -> Self {
		let backend = Arc::new(MemoryBackend::new());
		let conn = DatabaseConnection::new(backend.clone(), Arc::new(registry()), settings);
		conn.migrate().await.expect("migrate");
		Self { conn, backend }
	}

	pub fn table(&self, label: &str) -> String {
		self.conn.model(label).expect("registered model").db_table.clone()
	}

	/// Rows stored in the table of `label`.
	pub fn rows(&self, label: &str) -> usize {
		self.backend.table_len(&self.table(label))
	}

	pub async fn create(&self, label: &str, values: Vec<(&str, Value)>) -> Instance {
		self.conn.create(label, values).await.expect("create")
	}

	/// `A1`, `B1`/`B2` and `C1`/`C2`/`C3`, in that order.
	pub async fn abc(&self) -> (Instance, Instance, Instance) {
		let a = self.create("tests.Model2A", vec![("field1", "A1".into())]).await;
		let b = self
			.create("tests.Model2B", vec![("field1", "B1".into()), ("field2", "B2".into())])
			.await;
		let c = self
			.create(
				"tests.Model2C",
				vec![("field1", "C1".into()), ("field2", "C2".into()), ("field3", "C3".into())],
			)
			.await;
		(a, b, c)
	}
}

/// Event recorded by [`LogCapture`]
#[derive(Debug, Clone)]
pub struct CapturedEvent {
	pub level: Level,
	pub message: String,
	pub fields: BTreeMap<String, String>,
}

/// Layer keeping every event it sees
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
	events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl LogCapture {
	pub fn events(&self) -> Vec<CapturedEvent> {
		self.events.lock().clone()
	}

	pub fn with_message(&self, message: &str) -> Vec<CapturedEvent> {
		self.events().into_iter().filter(|e| e.message == message).collect()
	}
}

#[derive(Default)]
struct EventVisitor {
	message: String,
	fields: BTreeMap<String, String>,
}

impl Visit for EventVisitor {
	fn record_str(&mut self, field: &TracingField, value: &str) {
		if field.name() == "message" {
			self.message = value.to_string();
		} else {
			self.fields.insert(field.name().to_string(), value.to_string());
		}
	}

	fn record_debug(&mut self, field: &TracingField, value: &dyn fmt::Debug) {
		let value = format!("{:?}", value);
		if field.name() == "message" {
			self.message = value;
		} else {
			self.fields.insert(field.name().to_string(), value);
		}
	}
}

impl<S: Subscriber> Layer<S> for LogCapture {
	fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
		let mut visitor = EventVisitor::default();
		event.record(&mut visitor);
		self.events.lock().push(CapturedEvent {
			level: *event.metadata().level(),
			message: visitor.message,
			fields: visitor.fields,
		});
	}
}
