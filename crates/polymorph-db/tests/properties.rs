//! Property tests of the polymorphic layer
//!
//! Materialization, partitioning, deletion completeness, cascades through
//! polymorphic targets, all-or-nothing protection, guard equality,
//! migration stability and best-effort materialization.

mod common;

use common::{TestDb, registry};
use polymorph_db::migrations::{Autodetector, Migration, MigrationWriter, ProjectState};
use polymorph_db::orm::{Instance, OnDelete, Q, Value};
use polymorph_db::polymorphic::{PolymorphicGuard, PolymorphicInstanceExt, PolymorphicQuerySetExt};
use polymorph_db::{Error, Result};
use proptest::prelude::*;
use rstest::*;
use std::collections::BTreeSet;

const LEVELS: [&str; 3] = ["tests.Model2A", "tests.Model2B", "tests.Model2C"];

fn runtime() -> tokio::runtime::Runtime {
	tokio::runtime::Builder::new_current_thread()
		.enable_all()
		.build()
		.unwrap()
}

/// One object per entry of `levels`, 0 being `Model2A` and 2 `Model2C`.
async fn populate(db: &TestDb, levels: &[usize]) -> Vec<Instance> {
	let mut created = Vec::with_capacity(levels.len());
	for (i, &level) in levels.iter().enumerate() {
		let mut values: Vec<(&str, Value)> = vec![("field1", format!("a{}", i).into())];
		if level >= 1 {
			values.push(("field2", format!("b{}", i).into()));
		}
		if level >= 2 {
			values.push(("field3", format!("c{}", i).into()));
		}
		created.push(db.create(LEVELS[level], values).await);
	}
	created
}

fn table_counts(db: &TestDb) -> [usize; 3] {
	LEVELS.map(|label| db.rows(label))
}

/// Values for a `PolyBase` object created as `label`.
fn poly_values(label: &str, name: &str) -> Vec<(&'static str, Value)> {
	let mut values = vec![("name", Value::from(name))];
	match label {
		"tests.PolyA" => values.push(("a", 1.into())),
		"tests.PolyB" => values.push(("b", 2.into())),
		"tests.PolyC" => values.push(("c", 3.into())),
		_ => {}
	}
	values
}

fn standard_action(index: usize) -> OnDelete {
	match index {
		0 => OnDelete::Cascade,
		1 => OnDelete::Protect,
		2 => OnDelete::SetNull,
		3 => OnDelete::SetDefault,
		4 => OnDelete::Restrict,
		5 => OnDelete::DoNothing,
		_ => OnDelete::set(7),
	}
}

#[rstest]
#[case(vec![0, 1, 2])]
#[case(vec![2, 2, 1, 0, 2])]
#[case(vec![1])]
#[tokio::test]
async fn test_base_query_materializes_every_depth(#[case] levels: Vec<usize>) -> Result<()> {
	// Arrange
	let db = TestDb::new().await;
	let created = populate(&db, &levels).await;

	// Act
	let objects = db.conn.objects("tests.Model2A")?.fetch().await?;

	// Assert
	assert_eq!(objects.len(), created.len());
	for (object, original) in objects.iter().zip(&created) {
		assert_eq!(object.pk(), original.pk());
		assert_eq!(object.label(), original.label());
		assert_eq!(object.get_real_instance_class(&db.conn).await?.label(), original.label());
	}
	Ok(())
}

proptest! {
	#![proptest_config(ProptestConfig::with_cases(24))]

	#[test]
	fn prop_instance_of_partitions_the_base_queryset(
		levels in prop::collection::vec(0usize..3, 0..8),
		class in 0usize..3,
	) {
		let (all, matching, others) = runtime().block_on(async {
			let db = TestDb::new().await;
			populate(&db, &levels).await;
			let base = db.conn.objects("tests.Model2A").unwrap();
			let all: BTreeSet<i64> = base.pks().await.unwrap().into_iter().collect();
			let matching: BTreeSet<i64> = base
				.clone()
				.instance_of(&[LEVELS[class]])
				.unwrap()
				.pks()
				.await
				.unwrap()
				.into_iter()
				.collect();
			let others: BTreeSet<i64> = base
				.not_instance_of(&[LEVELS[class]])
				.unwrap()
				.pks()
				.await
				.unwrap()
				.into_iter()
				.collect();
			(all, matching, others)
		});

		prop_assert!(matching.is_disjoint(&others));
		let union: BTreeSet<i64> = matching.union(&others).copied().collect();
		prop_assert_eq!(union, all);
		let expected = levels.iter().filter(|&&level| level >= class).count();
		prop_assert_eq!(matching.len(), expected);
	}

	#[test]
	fn prop_deleting_any_level_removes_the_whole_identity(
		levels in prop::collection::vec(0usize..3, 1..6),
		pick in any::<prop::sample::Index>(),
		handle_level in 0usize..3,
	) {
		let victim = pick.index(levels.len());
		let created_level = levels[victim];
		let handle_level = handle_level.min(created_level);

		let (before, after, leftovers) = runtime().block_on(async {
			let db = TestDb::new().await;
			let created = populate(&db, &levels).await;
			let pk = created[victim].pk().unwrap();
			let handle = db.conn.base_objects(LEVELS[handle_level]).unwrap().get_pk(pk).await.unwrap();
			let before = table_counts(&db);
			handle.delete(&db.conn, false).await.unwrap();
			let after = table_counts(&db);
			let mut leftovers = 0;
			for label in LEVELS {
				let exists = db
					.conn
					.base_objects(label)
					.unwrap()
					.filter(Q::pk_in([pk]))
					.unwrap()
					.exists()
					.await
					.unwrap();
				leftovers += usize::from(exists);
			}
			(before, after, leftovers)
		});

		prop_assert_eq!(leftovers, 0);
		for level in 0..3 {
			let removed = before[level] - after[level];
			prop_assert_eq!(removed, usize::from(level <= created_level));
		}
	}

	#[test]
	fn prop_guard_equals_exactly_its_action(x in 0usize..7, y in 0usize..7) {
		let guarded = PolymorphicGuard::new(standard_action(x));

		prop_assert!(guarded == standard_action(x));
		prop_assert!(standard_action(x) == guarded);
		prop_assert_eq!(guarded == standard_action(y), x == y);
		prop_assert_eq!(standard_action(y) == guarded, x == y);
	}
}

#[rstest]
#[case("tests.PolyBase")]
#[case("tests.PolyA")]
#[case("tests.PolyB")]
#[case("tests.PolyC")]
#[tokio::test]
async fn test_cascade_follows_every_concrete_target(#[case] label: &str) -> Result<()> {
	// Arrange
	let db = TestDb::new().await;
	let target = db.create(label, poly_values(label, "target")).await;
	let bystander = db.create("tests.PolyA", poly_values("tests.PolyA", "bystander")).await;
	for (tag, pk) in [("first", target.pk()), ("second", target.pk()), ("other", bystander.pk())] {
		db.create("tests.Normal", vec![("tag", tag.into()), ("target", Value::from(pk.unwrap()))])
			.await;
	}

	// Act
	let outcome = target.delete(&db.conn, false).await?;

	// Assert
	assert_eq!(outcome.per_model.get("tests.Normal"), Some(&2));
	let remaining = db.conn.objects("tests.Normal")?.values_list(&["tag"]).await?;
	assert_eq!(remaining, vec![vec![Value::from("other")]]);
	Ok(())
}

#[rstest]
#[tokio::test]
async fn test_one_protected_row_blocks_everything() -> Result<()> {
	// Arrange
	let db = TestDb::new().await;
	let mut targets = Vec::new();
	for i in 0..300 {
		let label = if i % 2 == 0 { "tests.PolyA" } else { "tests.PolyB" };
		let target = db.create(label, poly_values(label, &format!("t{}", i))).await;
		let pk = Value::from(target.pk().unwrap());
		db.create("tests.Normal", vec![("tag", "cascade".into()), ("target", pk.clone())])
			.await;
		db.create("tests.Watcher", vec![("target", pk)]).await;
		targets.push(target);
	}
	db.create("tests.Keeper", vec![("target", Value::from(targets[150].pk().unwrap()))])
		.await;
	let tables = ["tests.PolyBase", "tests.PolyA", "tests.PolyB", "tests.Normal", "tests.Watcher"];
	let before: Vec<usize> = tables.iter().map(|label| db.rows(label)).collect();

	// Act
	let result = db.conn.objects("tests.PolyBase")?.delete().await;

	// Assert
	assert!(matches!(result, Err(Error::Protected(_))));
	let after: Vec<usize> = tables.iter().map(|label| db.rows(label)).collect();
	assert_eq!(before, after);
	let watched = db.conn.objects("tests.Watcher")?.values_list(&["target"]).await?;
	assert_eq!(watched.len(), 300);
	assert!(watched.iter().all(|row| !row[0].is_null()));
	Ok(())
}

#[rstest]
#[tokio::test]
async fn test_migrations_are_stable_for_unchanged_models() -> Result<()> {
	// Arrange
	let first = registry();
	let second = registry();
	let initial = Autodetector::new(&ProjectState::new(), &ProjectState::from_registry(&first)).detect_changes();
	let migrated = Migration {
		operations: initial.clone(),
		..Migration::new("tests", "0001_initial")
	}
	.apply_to(&ProjectState::new())
	.unwrap();

	// Act
	let after_initial = Autodetector::new(&migrated, &ProjectState::from_registry(&second)).detect_changes();
	let rebuilt = Autodetector::new(&ProjectState::from_registry(&first), &ProjectState::from_registry(&second))
		.detect_changes();

	// Assert
	assert!(after_initial.is_empty(), "unexpected operations: {:?}", after_initial);
	assert!(rebuilt.is_empty(), "unexpected operations: {:?}", rebuilt);
	let again = Autodetector::new(&ProjectState::new(), &ProjectState::from_registry(&second)).detect_changes();
	let write = |operations| {
		MigrationWriter::new("tests", "0001_initial")
			.operations(operations)
			.as_string()
			.unwrap()
	};
	assert_eq!(write(initial), write(again));
	Ok(())
}

#[rstest]
#[tokio::test]
async fn test_missing_leaf_row_falls_back_to_the_parent() -> Result<()> {
	// Arrange
	let db = TestDb::new().await;
	let (_, _, c) = db.abc().await;
	let pk = c.pk().unwrap();

	// Act
	db.conn.raw_delete("tests.Model2C", pk).await?;
	let objects = db.conn.objects("tests.Model2A")?.fetch().await?;

	// Assert
	assert_eq!(objects.len(), 3);
	let fallback = objects.iter().find(|o| o.pk() == Some(pk)).unwrap();
	assert_eq!(fallback.label(), "tests.Model2B");
	assert_eq!(fallback.get_str("field2"), Some("C2"));
	assert_eq!(fallback.get("field3"), None);
	Ok(())
}
