//! End-to-end scenarios of the polymorphic layer on the memory backend

mod common;

use common::TestDb;
use polymorph_db::backends::MemoryBackend;
use polymorph_db::orm::{DatabaseConnection, Field, ModelDef, ModelRegistry, OnDelete, Q, Value};
use polymorph_db::polymorphic::{PolymorphicHook, PolymorphicInstanceExt, PolymorphicQuerySetExt};
use polymorph_db::{Error, Result};
use polymorph_conf::PolymorphicSettings;
use rstest::*;
use std::collections::BTreeSet;
use std::sync::Arc;

#[fixture]
async fn db() -> TestDb {
	TestDb::new().await
}

fn labels(objects: &[polymorph_db::orm::Instance]) -> Vec<String> {
	objects.iter().map(|o| o.label()).collect()
}

#[rstest]
#[tokio::test]
async fn test_base_query_returns_concrete_classes_in_creation_order(#[future] db: TestDb) -> Result<()> {
	// Arrange
	let db = db.await;
	db.abc().await;

	// Act
	let objects = db.conn.objects("tests.Model2A")?.fetch().await?;

	// Assert
	assert_eq!(labels(&objects), vec!["tests.Model2A", "tests.Model2B", "tests.Model2C"]);
	assert_eq!(objects[0].get_str("field1"), Some("A1"));
	assert_eq!(objects[1].get_str("field2"), Some("B2"));
	assert_eq!(objects[2].get_str("field1"), Some("C1"));
	assert_eq!(objects[2].get_str("field3"), Some("C3"));
	Ok(())
}

#[rstest]
#[tokio::test]
async fn test_instance_of_and_not_instance_of(#[future] db: TestDb) -> Result<()> {
	// Arrange
	let db = db.await;
	db.abc().await;

	// Act
	let bs = db.conn.objects("tests.Model2A")?.instance_of(&["Model2B"])?.fetch().await?;
	let others = db
		.conn
		.objects("tests.Model2A")?
		.not_instance_of(&["tests.Model2B"])?
		.fetch()
		.await?;

	// Assert
	assert_eq!(labels(&bs), vec!["tests.Model2B", "tests.Model2C"]);
	assert_eq!(labels(&others), vec!["tests.Model2A"]);
	Ok(())
}

#[rstest]
#[tokio::test]
async fn test_subclass_field_filter(#[future] db: TestDb) -> Result<()> {
	// Arrange
	let db = db.await;
	db.abc().await;

	// Act
	let found = db
		.conn
		.objects("tests.Model2A")?
		.filter(Q::or(vec![
			Q::new("Model2B___field2", "B2"),
			Q::new("Model2C___field3", "C3"),
		]))?
		.order_by(&["-Model2B___field2"])?
		.fetch()
		.await?;

	// Assert
	assert_eq!(labels(&found), vec!["tests.Model2C", "tests.Model2B"]);
	Ok(())
}

#[rstest]
#[tokio::test]
async fn test_exclude_on_subclass_field_keeps_objects_without_that_subclass(#[future] db: TestDb) -> Result<()> {
	// Arrange
	let db = db.await;
	db.abc().await;

	// Act
	let excluded = db
		.conn
		.objects("tests.Model2A")?
		.exclude(Q::new("Model2B___field2", "B2"))?
		.fetch()
		.await?;
	let matched = db
		.conn
		.objects("tests.Model2A")?
		.filter(Q::new("Model2B___field2", "B2"))?
		.pks()
		.await?;

	// Assert
	assert_eq!(labels(&excluded), vec!["tests.Model2A", "tests.Model2C"]);
	let all: BTreeSet<i64> = db.conn.objects("tests.Model2A")?.pks().await?.into_iter().collect();
	let union: BTreeSet<i64> = excluded.iter().filter_map(|o| o.pk()).chain(matched).collect();
	assert_eq!(union, all);
	Ok(())
}

#[rstest]
#[tokio::test]
async fn test_unknown_subclass_field_is_a_field_error(#[future] db: TestDb) -> Result<()> {
	let db = db.await;

	let result = db.conn.objects("tests.Model2A")?.filter(Q::new("Model2B___field3", "x"));

	assert!(matches!(result, Err(Error::Field(_))));
	Ok(())
}

#[rstest]
#[tokio::test]
async fn test_cascade_into_polymorphic_base_deletes_only_matching_rows(#[future] db: TestDb) -> Result<()> {
	// Arrange
	let db = db.await;
	let p = db.create("tests.PolyBase", vec![("name", "P".into())]).await;
	let a = db.create("tests.PolyA", vec![("name", "A".into()), ("a", 1.into())]).await;
	let b = db.create("tests.PolyB", vec![("name", "B".into()), ("b", 2.into())]).await;
	let c = db.create("tests.PolyC", vec![("name", "C".into()), ("c", 3.into())]).await;
	for (tag, target) in [("to_p", &p), ("to_a", &a), ("to_b", &b), ("to_c", &c)] {
		db.create("tests.Normal", vec![("tag", tag.into()), ("target", Value::from(target.pk().unwrap()))])
			.await;
	}

	// Act
	p.delete(&db.conn, false).await?;
	let after_p = db.conn.objects("tests.Normal")?.values_list(&["tag"]).await?;
	a.delete(&db.conn, false).await?;
	let after_a = db.conn.objects("tests.Normal")?.values_list(&["tag"]).await?;

	// Assert
	let tags = |rows: Vec<Vec<Value>>| -> Vec<String> { rows.into_iter().map(|r| r[0].to_string()).collect() };
	assert_eq!(tags(after_p), vec!["to_a", "to_b", "to_c"]);
	assert_eq!(tags(after_a), vec!["to_b", "to_c"]);
	assert_eq!(db.rows("tests.PolyBase"), 2);
	assert_eq!(db.rows("tests.PolyA"), 0);
	Ok(())
}

#[rstest]
#[tokio::test]
async fn test_deleting_a_member_removes_only_its_memberships(#[future] db: TestDb) -> Result<()> {
	// Arrange
	let db = db.await;
	let group = db.create("tests.Group", vec![("name", "readers".into())]).await;
	let group_pk = group.pk().unwrap();
	let a = db.create("tests.PolyA", vec![("name", "A".into()), ("a", 1.into())]).await;
	let b = db.create("tests.PolyB", vec![("name", "B".into()), ("b", 2.into())]).await;
	let c = db.create("tests.PolyC", vec![("name", "C".into()), ("c", 3.into())]).await;
	for member in [&a, &b, &c] {
		db.conn.many_to_many(member, "groups")?.add(&[group_pk]).await?;
	}
	let through = db
		.conn
		.model("tests.PolyBase")?
		.local_field("groups")
		.and_then(|f| f.many_to_many.clone())
		.map(|m| m.through)
		.unwrap();

	// Act
	b.delete(&db.conn, false).await?;

	// Assert
	assert_eq!(db.rows("tests.Group"), 1);
	assert_eq!(db.rows(&through), 2);
	assert_eq!(db.conn.many_to_many(&a, "groups")?.pks().await?, vec![group_pk]);
	assert_eq!(db.conn.many_to_many(&c, "groups")?.pks().await?, vec![group_pk]);
	assert_eq!(
		labels(&db.conn.objects("tests.PolyBase")?.fetch().await?),
		vec!["tests.PolyA", "tests.PolyC"]
	);
	Ok(())
}

#[rstest]
#[tokio::test]
async fn test_protected_reference_blocks_the_delete(#[future] db: TestDb) -> Result<()> {
	// Arrange
	let db = db.await;
	let r = db.create("tests.Related", vec![("name", "R".into())]).await;
	let x = db
		.create(
			"tests.PolyA",
			vec![("name", "X".into()), ("a", 1.into()), ("related", Value::from(r.pk().unwrap()))],
		)
		.await;

	// Act
	let result = r.delete(&db.conn, false).await;

	// Assert
	let Err(Error::Protected(blocked)) = result else {
		panic!("expected a protection error, got {:?}", result);
	};
	assert_eq!(blocked.relation_names(), vec!["tests.PolyBase.related"]);
	assert_eq!(blocked.objects().count(), 1);
	assert_eq!(db.rows("tests.Related"), 1);
	let still_there = db.conn.objects("tests.PolyBase")?.get_pk(x.pk().unwrap()).await?;
	assert_eq!(still_there.label(), "tests.PolyA");
	assert_eq!(still_there.get("related"), Some(&Value::from(r.pk().unwrap())));
	Ok(())
}

#[rstest]
#[tokio::test]
async fn test_leaf_delete_keeping_parents_points_discriminator_at_parent(#[future] db: TestDb) -> Result<()> {
	// Arrange
	let db = db.await;
	let (_, _, c) = db.abc().await;
	let pk = c.pk().unwrap();

	// Act
	c.delete(&db.conn, true).await?;

	// Assert
	assert_eq!(db.rows("tests.Model2C"), 0);
	assert_eq!(db.rows("tests.Model2B"), 2);
	assert_eq!(db.rows("tests.Model2A"), 3);
	let kept = db.conn.objects("tests.Model2A")?.get_pk(pk).await?;
	assert_eq!(kept.label(), "tests.Model2B");
	assert_eq!(kept.get_str("field2"), Some("C2"));
	Ok(())
}

#[rstest]
#[tokio::test]
async fn test_middle_level_delete_keeping_parents_leaves_base_row(#[future] db: TestDb) -> Result<()> {
	// Arrange
	let db = db.await;
	let (_, _, c) = db.abc().await;
	let pk = c.pk().unwrap();
	let middle = db.conn.base_objects("tests.Model2B")?.get_pk(pk).await?;

	// Act
	middle.delete(&db.conn, true).await?;

	// Assert
	assert_eq!(db.rows("tests.Model2C"), 0);
	assert_eq!(db.rows("tests.Model2B"), 1);
	assert_eq!(db.rows("tests.Model2A"), 3);
	let kept = db.conn.objects("tests.Model2A")?.get_pk(pk).await?;
	assert_eq!(kept.label(), "tests.Model2A");
	assert_eq!(kept.get_real_instance_class(&db.conn).await?.label(), "tests.Model2A");
	assert_eq!(kept.get_str("field1"), Some("C1"));
	Ok(())
}

#[rstest]
#[tokio::test]
async fn test_base_level_delete_removes_whole_identity(#[future] db: TestDb) -> Result<()> {
	// Arrange
	let db = db.await;
	let (a, _, c) = db.abc().await;
	let base_handle = db.conn.base_objects("tests.Model2A")?.get_pk(c.pk().unwrap()).await?;

	// Act
	let outcome = base_handle.delete(&db.conn, false).await?;

	// Assert
	assert_eq!(outcome.total, 3);
	assert_eq!(db.rows("tests.Model2C"), 0);
	assert_eq!(db.rows("tests.Model2B"), 1);
	assert_eq!(db.rows("tests.Model2A"), 2);
	assert!(db.conn.objects("tests.Model2A")?.filter(Q::pk_in([a.pk().unwrap()]))?.exists().await?);
	Ok(())
}

#[rstest]
#[tokio::test]
async fn test_set_null_on_polymorphic_target(#[future] db: TestDb) -> Result<()> {
	// Arrange
	let db = db.await;
	let b = db.create("tests.PolyB", vec![("name", "B".into()), ("b", 2.into())]).await;
	let watcher = db
		.create("tests.Watcher", vec![("target", Value::from(b.pk().unwrap()))])
		.await;

	// Act
	let outcome = b.delete(&db.conn, false).await?;

	// Assert
	assert_eq!(outcome.updated, 1);
	let refreshed = db.conn.refresh(&watcher).await?;
	assert_eq!(refreshed.get("target"), Some(&Value::Null));
	Ok(())
}

#[rstest]
#[tokio::test]
async fn test_queryset_delete_spans_every_subclass(#[future] db: TestDb) -> Result<()> {
	// Arrange
	let db = db.await;
	db.abc().await;

	// Act
	let outcome = db.conn.objects("tests.Model2A")?.instance_of(&["Model2B"])?.delete().await?;

	// Assert
	assert_eq!(outcome.per_model.get("tests.Model2C"), Some(&1));
	assert_eq!(outcome.per_model.get("tests.Model2B"), Some(&2));
	assert_eq!(outcome.per_model.get("tests.Model2A"), Some(&2));
	assert_eq!(labels(&db.conn.objects("tests.Model2A")?.fetch().await?), vec!["tests.Model2A"]);
	Ok(())
}

fn fallback_item() -> Value {
	Value::Int(1)
}

/// Polymorphic `Item <- Book`, owned by `Owner`, referenced through every
/// non-cascading on-delete action, plus a self-referencing `Node`.
fn actions_registry() -> ModelRegistry {
	ModelRegistry::builder()
		.hook(PolymorphicHook::new())
		.model(ModelDef::new("acts", "Owner").field(Field::char("name", 30)))
		.model(
			ModelDef::new("acts", "Item")
				.polymorphic()
				.field(Field::char("name", 30))
				.field(Field::foreign_key("owner", "Owner", OnDelete::Cascade).null()),
		)
		.model(ModelDef::new("acts", "Book").parent("Item").field(Field::integer("pages")))
		.model(
			ModelDef::new("acts", "Loan")
				.field(Field::foreign_key("owner", "Owner", OnDelete::Cascade))
				.field(Field::foreign_key("item", "Item", OnDelete::Restrict)),
		)
		.model(ModelDef::new("acts", "Tag").field(Field::foreign_key("item", "Item", OnDelete::SetDefault).default(1)))
		.model(
			ModelDef::new("acts", "Note")
				.field(Field::foreign_key("item", "Item", OnDelete::set_with("tests.fallback_item", fallback_item))),
		)
		.model(
			ModelDef::new("acts", "Mark").field(Field::foreign_key("item", "Item", OnDelete::DoNothing).db_constraint(false)),
		)
		.model(ModelDef::new("acts", "Pin").field(Field::foreign_key("item", "Item", OnDelete::DoNothing)))
		.model(
			ModelDef::new("acts", "Node")
				.polymorphic()
				.field(Field::char("name", 30))
				.field(Field::foreign_key("peer", "Node", OnDelete::Cascade).null()),
		)
		.model(ModelDef::new("acts", "Branch").parent("Node").field(Field::integer("depth")))
		.build()
		.expect("action models are valid")
}

struct ActionsDb {
	conn: DatabaseConnection,
	backend: Arc<MemoryBackend>,
	/// `Item` kept as the default and `SET` target, pk 1
	fallback: i64,
	/// `Book` owned by `owner`
	book: i64,
	owner: i64,
}

impl ActionsDb {
	fn rows(&self, label: &str) -> usize {
		let table = self.conn.model(label).expect("registered model").db_table.clone();
		self.backend.table_len(&table)
	}

	async fn target(&self, label: &str) -> Result<Value> {
		let rows = self.conn.objects(label)?.values_list(&["item"]).await?;
		Ok(rows.into_iter().next().map(|mut row| row.remove(0)).unwrap_or_default())
	}
}

#[fixture]
async fn actions() -> ActionsDb {
	let backend = Arc::new(MemoryBackend::new());
	let conn = DatabaseConnection::new(backend.clone(), Arc::new(actions_registry()), PolymorphicSettings::default());
	conn.migrate().await.expect("migrate");
	let fallback = conn.create("acts.Item", vec![("name", "fallback".into())]).await.expect("fallback");
	let owner = conn.create("acts.Owner", vec![("name", "O".into())]).await.expect("owner");
	let owner_pk = owner.pk().expect("saved owner");
	let book = conn
		.create(
			"acts.Book",
			vec![("name", "B".into()), ("pages", 100.into()), ("owner", Value::from(owner_pk))],
		)
		.await
		.expect("book");
	ActionsDb {
		conn,
		backend,
		fallback: fallback.pk().expect("saved fallback"),
		book: book.pk().expect("saved book"),
		owner: owner_pk,
	}
}

#[rstest]
#[tokio::test]
async fn test_restrict_blocks_a_direct_delete(#[future] actions: ActionsDb) -> Result<()> {
	// Arrange
	let db = actions.await;
	db.conn
		.create("acts.Loan", vec![("owner", Value::from(db.owner)), ("item", Value::from(db.book))])
		.await?;
	let book = db.conn.objects("acts.Item")?.get_pk(db.book).await?;

	// Act
	let result = book.delete(&db.conn, false).await;

	// Assert
	let Err(Error::Restricted(blocked)) = result else {
		panic!("expected a restriction error, got {:?}", result);
	};
	assert_eq!(blocked.objects().count(), 1);
	assert_eq!(db.rows("acts.Loan"), 1);
	assert_eq!(db.rows("acts.Book"), 1);
	assert_eq!(db.rows("acts.Item"), 2);
	Ok(())
}

#[rstest]
#[tokio::test]
async fn test_restricted_rows_reached_by_a_cascade_are_deleted(#[future] actions: ActionsDb) -> Result<()> {
	// Arrange
	let db = actions.await;
	db.conn
		.create("acts.Loan", vec![("owner", Value::from(db.owner)), ("item", Value::from(db.book))])
		.await?;
	let owner = db.conn.objects("acts.Owner")?.get_pk(db.owner).await?;

	// Act
	let outcome = owner.delete(&db.conn, false).await?;

	// Assert
	assert_eq!(outcome.per_model.get("acts.Loan"), Some(&1));
	assert_eq!(outcome.per_model.get("acts.Book"), Some(&1));
	assert_eq!(db.rows("acts.Loan"), 0);
	assert_eq!(db.rows("acts.Book"), 0);
	assert_eq!(db.rows("acts.Item"), 1);
	Ok(())
}

#[rstest]
#[tokio::test]
async fn test_set_default_points_references_at_the_default(#[future] actions: ActionsDb) -> Result<()> {
	// Arrange
	let db = actions.await;
	db.conn.create("acts.Tag", vec![("item", Value::from(db.book))]).await?;
	let book = db.conn.objects("acts.Item")?.get_pk(db.book).await?;

	// Act
	let outcome = book.delete(&db.conn, false).await?;

	// Assert
	assert_eq!(outcome.updated, 1);
	assert_eq!(db.rows("acts.Tag"), 1);
	assert_eq!(db.target("acts.Tag").await?, Value::from(db.fallback));
	Ok(())
}

#[rstest]
#[tokio::test]
async fn test_set_with_callable_points_references_at_its_result(#[future] actions: ActionsDb) -> Result<()> {
	// Arrange
	let db = actions.await;
	db.conn.create("acts.Note", vec![("item", Value::from(db.book))]).await?;
	let book = db.conn.objects("acts.Item")?.get_pk(db.book).await?;

	// Act
	let outcome = book.delete(&db.conn, false).await?;

	// Assert
	assert_eq!(outcome.updated, 1);
	assert_eq!(db.target("acts.Note").await?, fallback_item());
	Ok(())
}

#[rstest]
#[tokio::test]
async fn test_do_nothing_leaves_references_untouched(#[future] actions: ActionsDb) -> Result<()> {
	// Arrange
	let db = actions.await;
	db.conn.create("acts.Mark", vec![("item", Value::from(db.book))]).await?;
	let book = db.conn.objects("acts.Item")?.get_pk(db.book).await?;

	// Act
	let outcome = book.delete(&db.conn, false).await?;

	// Assert
	assert_eq!(outcome.updated, 0);
	assert_eq!(outcome.per_model.get("acts.Mark"), None);
	assert_eq!(db.rows("acts.Mark"), 1);
	assert_eq!(db.target("acts.Mark").await?, Value::from(db.book));
	Ok(())
}

#[rstest]
#[tokio::test]
async fn test_do_nothing_with_a_constraint_fails_without_changes(#[future] actions: ActionsDb) -> Result<()> {
	// Arrange
	let db = actions.await;
	db.conn.create("acts.Pin", vec![("item", Value::from(db.book))]).await?;
	let book = db.conn.objects("acts.Item")?.get_pk(db.book).await?;

	// Act
	let result = book.delete(&db.conn, false).await;

	// Assert
	assert!(matches!(result, Err(Error::Integrity(_))));
	assert_eq!(db.rows("acts.Book"), 1);
	assert_eq!(db.rows("acts.Item"), 2);
	assert_eq!(db.rows("acts.Pin"), 1);
	Ok(())
}

#[rstest]
#[tokio::test]
async fn test_self_referencing_cascade_cycle_terminates(#[future] actions: ActionsDb) -> Result<()> {
	// Arrange
	let db = actions.await;
	let first = db
		.conn
		.create("acts.Branch", vec![("name", "first".into()), ("depth", 1.into())])
		.await?;
	let first_pk = first.pk().unwrap_or_default();
	let second = db
		.conn
		.create(
			"acts.Branch",
			vec![("name", "second".into()), ("depth", 2.into()), ("peer", Value::from(first_pk))],
		)
		.await?;
	db.conn
		.base_objects("acts.Node")?
		.filter(Q::pk_in([first_pk]))?
		.update(vec![("peer", Value::from(second.pk().unwrap_or_default()))])
		.await?;

	// Act
	let outcome = first.delete(&db.conn, false).await?;

	// Assert
	assert_eq!(outcome.total, 4);
	assert_eq!(outcome.per_model.get("acts.Branch"), Some(&2));
	assert_eq!(outcome.per_model.get("acts.Node"), Some(&2));
	assert_eq!(db.rows("acts.Node"), 0);
	assert_eq!(db.rows("acts.Branch"), 0);
	Ok(())
}
