use super::{Dialect, ReconcileStore, StoreTransaction};
use crate::error::{ReconcileError, ReconcileResult};
use crate::model::{DuplicateGroup, EntityDefinition, NaturalKeyValue, RelationDescriptor, RowId};
use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool, Row, Transaction};

/// Upper bound on ids bound into a single `IN (...)` list.
const MAX_BIND_IDS: usize = 500;

/// [`ReconcileStore`] over SQLite, PostgreSQL or MySQL, chosen by DSN scheme.
#[derive(Debug, Clone)]
pub struct SqlStore {
    pool: AnyPool,
    dialect: Dialect,
}

impl SqlStore {
    /// Connect to the database behind `dsn`.
    pub async fn connect(dsn: &str, max_connections: u32) -> ReconcileResult<Self> {
        sqlx::any::install_default_drivers();
        let dialect = Dialect::from_dsn(dsn)?;

        log::info!(
            "Connecting to {} catalog store with DSN: {dsn}",
            dialect.name()
        );

        let dsn = if dialect == Dialect::Sqlite && !dsn.contains(":memory:") {
            create_sqlite_parent_dir(dsn).await?;
            // Create the database file if it doesn't exist
            if dsn.contains('?') {
                if dsn.contains("mode=") {
                    dsn.to_string()
                } else {
                    format!("{dsn}&mode=rwc")
                }
            } else {
                format!("{dsn}?mode=rwc")
            }
        } else {
            dsn.to_string()
        };

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(&dsn)
            .await
            .map_err(|e| {
                log::error!("Failed to connect to catalog store with DSN '{dsn}': {e}");
                e
            })?;

        log::info!("Catalog store connection established");
        Ok(Self { pool, dialect })
    }

    /// Private in-memory SQLite database held on a single connection.
    pub async fn new_in_memory() -> ReconcileResult<Self> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self {
            pool,
            dialect: Dialect::Sqlite,
        })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

#[async_trait]
impl ReconcileStore for SqlStore {
    fn backend(&self) -> &'static str {
        self.dialect.name()
    }

    async fn find_duplicate_groups(
        &self,
        entity: &EntityDefinition,
    ) -> ReconcileResult<Vec<DuplicateGroup>> {
        let sql = self.dialect.duplicate_groups_sql(entity);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        collect_groups(&rows, entity.natural_key.len())
    }

    async fn declared_relations(
        &self,
        entity: &EntityDefinition,
    ) -> ReconcileResult<Vec<RelationDescriptor>> {
        let rows = sqlx::query(self.dialect.declared_relations_sql())
            .bind(entity.table.clone())
            .fetch_all(&self.pool)
            .await?;

        let mut relations = Vec::with_capacity(rows.len());
        for row in rows {
            let table: String = row.try_get("table_name")?;
            let column: String = row.try_get("column_name")?;
            let relation = RelationDescriptor::new(table, column, entity.name.clone());
            if !relations
                .iter()
                .any(|r: &RelationDescriptor| r.same_column(&relation))
            {
                relations.push(relation);
            }
        }
        Ok(relations)
    }

    async fn begin(&self) -> ReconcileResult<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqlTransaction {
            tx,
            dialect: self.dialect,
        }))
    }
}

async fn create_sqlite_parent_dir(dsn: &str) -> ReconcileResult<()> {
    let path = dsn
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    let path = path.split('?').next().unwrap_or(path);

    if let Some(parent) = std::path::Path::new(path).parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            ReconcileError::ConnectionError(format!(
                "cannot create directory {}: {e}",
                parent.display()
            ))
        })?;
    }
    Ok(())
}

/// Fold the ordered member rows of the duplicate query into groups.
fn collect_groups(rows: &[AnyRow], key_len: usize) -> ReconcileResult<Vec<DuplicateGroup>> {
    let mut groups: Vec<DuplicateGroup> = Vec::new();
    let mut current: Option<(RowId, NaturalKeyValue, Vec<RowId>)> = None;

    for row in rows {
        let anchor: i64 = row.try_get("anchor_id")?;
        let member: i64 = row.try_get("member_id")?;

        if let Some((current_anchor, _, members)) = current.as_mut()
            && *current_anchor == anchor
        {
            members.push(member);
            continue;
        }

        let mut components = Vec::with_capacity(key_len);
        for i in 0..key_len {
            let value: Option<String> = row.try_get(format!("key_{i}").as_str())?;
            components.push(value);
        }
        if let Some((_, key, members)) = current.take() {
            groups.push(DuplicateGroup::new(key, members));
        }
        current = Some((anchor, NaturalKeyValue::new(components), vec![member]));
    }

    if let Some((_, key, members)) = current {
        groups.push(DuplicateGroup::new(key, members));
    }

    Ok(groups)
}

/// One database transaction; dropping it without commit rolls back.
struct SqlTransaction {
    tx: Transaction<'static, Any>,
    dialect: Dialect,
}

#[async_trait]
impl StoreTransaction for SqlTransaction {
    async fn existing_ids(
        &mut self,
        table: &str,
        id_column: &str,
        ids: &[RowId],
    ) -> ReconcileResult<Vec<RowId>> {
        let mut existing = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_BIND_IDS) {
            let sql = self.dialect.existing_ids_sql(table, id_column, chunk.len());
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(*id);
            }
            for row in query.fetch_all(&mut *self.tx).await? {
                existing.push(row.try_get::<i64, _>("id")?);
            }
        }
        existing.sort_unstable();
        Ok(existing)
    }

    async fn repoint_references(
        &mut self,
        relation: &RelationDescriptor,
        survivor: RowId,
        losers: &[RowId],
    ) -> ReconcileResult<u64> {
        let mut rewritten = 0;
        for chunk in losers.chunks(MAX_BIND_IDS) {
            let sql = self.dialect.repoint_sql(relation, chunk.len());
            let mut query = sqlx::query(&sql).bind(survivor);
            for id in chunk {
                query = query.bind(*id);
            }
            rewritten += query.execute(&mut *self.tx).await?.rows_affected();
        }
        Ok(rewritten)
    }

    async fn count_references(
        &mut self,
        relation: &RelationDescriptor,
        ids: &[RowId],
    ) -> ReconcileResult<u64> {
        let mut total = 0;
        for chunk in ids.chunks(MAX_BIND_IDS) {
            let sql = self.dialect.count_references_sql(relation, chunk.len());
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(*id);
            }
            let row = query.fetch_one(&mut *self.tx).await?;
            let count: i64 = row.try_get("n")?;
            total += u64::try_from(count).unwrap_or_default();
        }
        Ok(total)
    }

    async fn delete_rows(
        &mut self,
        table: &str,
        id_column: &str,
        ids: &[RowId],
    ) -> ReconcileResult<u64> {
        let mut deleted = 0;
        for chunk in ids.chunks(MAX_BIND_IDS) {
            let sql = self.dialect.delete_sql(table, id_column, chunk.len());
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(*id);
            }
            deleted += query.execute(&mut *self.tx).await?.rows_affected();
        }
        Ok(deleted)
    }

    async fn commit(self: Box<Self>) -> ReconcileResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> ReconcileResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
