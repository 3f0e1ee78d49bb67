//! Many-to-many accessors

use super::connection::DatabaseConnection;
use super::fields::ManyToManyMeta;
use super::instance::Instance;
use super::query::Q;
use super::queryset::QuerySet;
use super::value::Value;
use crate::backends::statements::WriteStatement;
use indexmap::IndexSet;
use polymorph_core::Result;

/// Membership rows of one source object, managed through the through model
#[derive(Debug, Clone)]
pub struct ManyRelated {
	conn: DatabaseConnection,
	meta: ManyToManyMeta,
	source_pk: i64,
}

impl ManyRelated {
	pub(crate) fn new(conn: DatabaseConnection, meta: ManyToManyMeta, source_pk: i64) -> Self {
		Self { conn, meta, source_pk }
	}

	fn memberships(&self) -> Result<QuerySet> {
		self.conn
			.base_objects(&self.meta.through)?
			.filter(Q::new(&self.meta.source_field, self.source_pk))
	}

	/// Target primary keys, in insertion order.
	pub async fn pks(&self) -> Result<Vec<i64>> {
		let rows = self
			.memberships()?
			.values_list(&[self.meta.target_field.as_str()])
			.await?;
		Ok(rows
			.into_iter()
			.filter_map(|row| row.first().and_then(Value::as_i64))
			.collect())
	}

	/// Related objects through the target's default manager.
	pub async fn all(&self) -> Result<Vec<Instance>> {
		let pks = self.pks().await?;
		self.conn.objects(&self.meta.to)?.filter(Q::pk_in(pks))?.fetch().await
	}

	/// Add memberships; already present targets are skipped.
	pub async fn add(&self, targets: &[i64]) -> Result<usize> {
		let existing: IndexSet<i64> = self.pks().await?.into_iter().collect();
		let mut added = 0;
		for target in targets.iter().copied().collect::<IndexSet<i64>>() {
			if existing.contains(&target) {
				continue;
			}
			self.conn
				.create(
					&self.meta.through,
					vec![
						(self.meta.source_field.as_str(), Value::Int(self.source_pk)),
						(self.meta.target_field.as_str(), Value::Int(target)),
					],
				)
				.await?;
			added += 1;
		}
		Ok(added)
	}

	pub async fn remove(&self, targets: &[i64]) -> Result<u64> {
		let rows = self
			.memberships()?
			.filter(Q::new(&format!("{}__in", self.meta.target_field), targets.to_vec()))?;
		self.delete_memberships(rows).await
	}

	pub async fn clear(&self) -> Result<u64> {
		self.delete_memberships(self.memberships()?).await
	}

	async fn delete_memberships(&self, rows: QuerySet) -> Result<u64> {
		let keys = rows.pks().await?;
		if keys.is_empty() {
			return Ok(0);
		}
		let through = self.conn.model(&self.meta.through)?;
		let affected = self
			.conn
			.backend()
			.execute(&[WriteStatement::Delete {
				table: through.db_table.clone(),
				key_column: through.pk_column().to_string(),
				keys,
			}])
			.await?;
		Ok(affected.into_iter().sum())
	}
}
