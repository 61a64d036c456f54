use super::{ReconcileStore, StoreTransaction};
use crate::error::{ReconcileError, ReconcileResult};
use crate::model::{DuplicateGroup, EntityDefinition, NaturalKeyValue, RelationDescriptor, RowId};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A single column value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Cell {
    Null,
    Int(i64),
    Text(String),
}

impl Cell {
    /// Text rendering used for natural key reporting; `None` for NULL.
    pub fn render(&self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Int(value) => Some(value.to_string()),
            Cell::Text(value) => Some(value.clone()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::Int(value)
    }
}

impl From<Option<i64>> for Cell {
    fn from(value: Option<i64>) -> Self {
        value.map_or(Cell::Null, Cell::Int)
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

/// Store operation a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    Begin,
    Repoint,
    CountReferences,
    Delete,
    Commit,
}

/// What an injected fault does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Fail with a retryable lock wait timeout.
    Transient,
    /// Fail as if the database rejected the write on a constraint.
    ConstraintViolation,
    NotFound,
    /// Report success but leave the data untouched.
    IgnoreWrite,
    /// Apply the commit, then fail as if the connection dropped before the
    /// acknowledgement arrived. Acts like `Transient` on other operations.
    LostAcknowledgement,
}

#[derive(Debug, Clone)]
struct Fault {
    op: FaultOp,
    /// Only fire when this id takes part in the operation.
    row: Option<RowId>,
    kind: FaultKind,
    remaining: u32,
}

#[derive(Debug, Clone)]
struct Table {
    id_column: String,
    columns: Vec<String>,
    rows: BTreeMap<RowId, Vec<Cell>>,
}

impl Table {
    fn column_index(&self, table: &str, column: &str) -> ReconcileResult<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .ok_or_else(|| {
                ReconcileError::ConfigurationError(format!(
                    "column '{column}' does not exist in table '{table}'"
                ))
            })
    }

    fn check_id_column(&self, table: &str, id_column: &str) -> ReconcileResult<()> {
        if self.id_column.eq_ignore_ascii_case(id_column) {
            Ok(())
        } else {
            Err(ReconcileError::ConfigurationError(format!(
                "'{id_column}' is not the id column of table '{table}'"
            )))
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Tables {
    tables: BTreeMap<String, Table>,
    /// (table, column, referenced table)
    foreign_keys: Vec<(String, String, String)>,
}

impl Tables {
    fn table(&self, name: &str) -> ReconcileResult<&Table> {
        self.tables.get(name).ok_or_else(|| {
            ReconcileError::ConfigurationError(format!("table '{name}' does not exist"))
        })
    }

    fn table_mut(&mut self, name: &str) -> ReconcileResult<&mut Table> {
        self.tables.get_mut(name).ok_or_else(|| {
            ReconcileError::ConfigurationError(format!("table '{name}' does not exist"))
        })
    }
}

/// In-memory [`ReconcileStore`] for tests.
///
/// A transaction holds the store lock for its whole lifetime and works on a
/// copy of the tables, so transactions are serialized and a dropped
/// transaction leaves no trace. Declared foreign keys are enforced on delete.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<Tables>>,
    faults: Arc<Mutex<Vec<Fault>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_table(&self, name: &str, id_column: &str, columns: &[&str]) {
        let mut data = self.data.lock().await;
        data.tables.insert(
            name.to_string(),
            Table {
                id_column: id_column.to_string(),
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: BTreeMap::new(),
            },
        );
    }

    /// Insert or replace a row. `values` follow the table's column order.
    pub async fn insert(&self, table: &str, id: RowId, values: Vec<Cell>) -> ReconcileResult<()> {
        let mut data = self.data.lock().await;
        let table_ref = data.table_mut(table)?;
        if values.len() != table_ref.columns.len() {
            return Err(ReconcileError::ConfigurationError(format!(
                "table '{table}' has {} columns, got {} values",
                table_ref.columns.len(),
                values.len()
            )));
        }
        table_ref.rows.insert(id, values);
        Ok(())
    }

    /// Declare a schema foreign key `table.column -> referenced_table`.
    pub async fn declare_foreign_key(&self, table: &str, column: &str, referenced_table: &str) {
        let mut data = self.data.lock().await;
        data.foreign_keys.push((
            table.to_string(),
            column.to_string(),
            referenced_table.to_string(),
        ));
    }

    /// Make the next `times` matching operations misbehave.
    pub async fn inject_fault(&self, op: FaultOp, row: Option<RowId>, kind: FaultKind, times: u32) {
        self.faults.lock().await.push(Fault {
            op,
            row,
            kind,
            remaining: times,
        });
    }

    /// Ids present in a table, ascending.
    pub async fn ids(&self, table: &str) -> Vec<RowId> {
        let data = self.data.lock().await;
        data.tables
            .get(table)
            .map(|t| t.rows.keys().copied().collect())
            .unwrap_or_default()
    }

    pub async fn value(&self, table: &str, id: RowId, column: &str) -> Option<Cell> {
        let data = self.data.lock().await;
        let table_ref = data.tables.get(table)?;
        let index = table_ref.column_index(table, column).ok()?;
        table_ref.rows.get(&id).map(|row| row[index].clone())
    }

    pub async fn rows(&self, table: &str) -> Vec<(RowId, Vec<Cell>)> {
        let data = self.data.lock().await;
        data.tables
            .get(table)
            .map(|t| t.rows.iter().map(|(id, row)| (*id, row.clone())).collect())
            .unwrap_or_default()
    }
}

/// Consume one firing of the first fault matching `op` and `ids`.
async fn take_fault(faults: &Mutex<Vec<Fault>>, op: FaultOp, ids: &[RowId]) -> Option<FaultKind> {
    let mut faults = faults.lock().await;
    let fault = faults.iter_mut().find(|f| {
        f.op == op && f.remaining > 0 && f.row.is_none_or(|row| ids.contains(&row))
    })?;
    fault.remaining -= 1;
    Some(fault.kind)
}

fn fault_error(kind: FaultKind, op: FaultOp) -> Option<ReconcileError> {
    match kind {
        FaultKind::Transient => Some(ReconcileError::ConnectionError(format!(
            "lock wait timeout exceeded during {op:?}"
        ))),
        FaultKind::LostAcknowledgement => Some(ReconcileError::ConnectionError(format!(
            "connection reset during {op:?}"
        ))),
        FaultKind::ConstraintViolation => Some(ReconcileError::ConstraintViolation(format!(
            "write rejected during {op:?}"
        ))),
        FaultKind::NotFound => Some(ReconcileError::NotFoundError(format!(
            "row vanished during {op:?}"
        ))),
        FaultKind::IgnoreWrite => None,
    }
}

#[async_trait]
impl ReconcileStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn find_duplicate_groups(
        &self,
        entity: &EntityDefinition,
    ) -> ReconcileResult<Vec<DuplicateGroup>> {
        let data = self.data.lock().await;
        let table = data.table(&entity.table)?;
        table.check_id_column(&entity.table, &entity.id_column)?;

        let indexes = entity
            .natural_key
            .iter()
            .map(|column| table.column_index(&entity.table, &column.name))
            .collect::<ReconcileResult<Vec<_>>>()?;

        let mut by_key: BTreeMap<Vec<Cell>, Vec<RowId>> = BTreeMap::new();
        'rows: for (id, row) in &table.rows {
            let mut key = Vec::with_capacity(indexes.len());
            for (column, index) in entity.natural_key.iter().zip(&indexes) {
                let cell = &row[*index];
                if cell.is_null() && !column.null_safe {
                    continue 'rows;
                }
                key.push(cell.clone());
            }
            by_key.entry(key).or_default().push(*id);
        }

        let mut groups: Vec<DuplicateGroup> = by_key
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(key, ids)| {
                let key = NaturalKeyValue::new(key.iter().map(Cell::render).collect());
                DuplicateGroup::new(key, ids)
            })
            .collect();
        groups.sort_by_key(|g| g.member_ids.first().copied());

        Ok(groups)
    }

    async fn declared_relations(
        &self,
        entity: &EntityDefinition,
    ) -> ReconcileResult<Vec<RelationDescriptor>> {
        let data = self.data.lock().await;
        Ok(data
            .foreign_keys
            .iter()
            .filter(|(_, _, referenced)| referenced.eq_ignore_ascii_case(&entity.table))
            .map(|(table, column, _)| RelationDescriptor::new(table, column, entity.name.clone()))
            .collect())
    }

    async fn begin(&self) -> ReconcileResult<Box<dyn StoreTransaction>> {
        if let Some(kind) = take_fault(&self.faults, FaultOp::Begin, &[]).await
            && let Some(err) = fault_error(kind, FaultOp::Begin)
        {
            return Err(err);
        }

        let guard = self.data.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            faults: self.faults.clone(),
        }))
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
    faults: Arc<Mutex<Vec<Fault>>>,
}

impl MemoryTransaction {
    /// `Ok(true)` when the operation should go ahead, `Ok(false)` to skip it silently.
    async fn check_fault(&self, op: FaultOp, ids: &[RowId]) -> ReconcileResult<bool> {
        match take_fault(&self.faults, op, ids).await {
            Some(kind) => match fault_error(kind, op) {
                Some(err) => Err(err),
                None => Ok(false),
            },
            None => Ok(true),
        }
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn existing_ids(
        &mut self,
        table: &str,
        id_column: &str,
        ids: &[RowId],
    ) -> ReconcileResult<Vec<RowId>> {
        let table_ref = self.working.table(table)?;
        table_ref.check_id_column(table, id_column)?;
        let mut existing: Vec<RowId> = ids
            .iter()
            .copied()
            .filter(|id| table_ref.rows.contains_key(id))
            .collect();
        existing.sort_unstable();
        existing.dedup();
        Ok(existing)
    }

    async fn repoint_references(
        &mut self,
        relation: &RelationDescriptor,
        survivor: RowId,
        losers: &[RowId],
    ) -> ReconcileResult<u64> {
        let mut involved = losers.to_vec();
        involved.push(survivor);
        if !self.check_fault(FaultOp::Repoint, &involved).await? {
            return Ok(0);
        }

        let table = self.working.table_mut(&relation.table)?;
        let index = table.column_index(&relation.table, &relation.foreign_key_column)?;
        let mut rewritten = 0;
        for row in table.rows.values_mut() {
            if let Cell::Int(value) = row[index]
                && losers.contains(&value)
            {
                row[index] = Cell::Int(survivor);
                rewritten += 1;
            }
        }
        Ok(rewritten)
    }

    async fn count_references(
        &mut self,
        relation: &RelationDescriptor,
        ids: &[RowId],
    ) -> ReconcileResult<u64> {
        // Skipping a read makes no sense, so IgnoreWrite is treated as no fault.
        self.check_fault(FaultOp::CountReferences, ids).await?;

        let table = self.working.table(&relation.table)?;
        let index = table.column_index(&relation.table, &relation.foreign_key_column)?;
        let count = table
            .rows
            .values()
            .filter(|row| matches!(row[index], Cell::Int(value) if ids.contains(&value)))
            .count();
        Ok(count as u64)
    }

    async fn delete_rows(
        &mut self,
        table: &str,
        id_column: &str,
        ids: &[RowId],
    ) -> ReconcileResult<u64> {
        if !self.check_fault(FaultOp::Delete, ids).await? {
            return Ok(0);
        }

        self.working.table(table)?.check_id_column(table, id_column)?;

        for (fk_table, fk_column, referenced) in &self.working.foreign_keys {
            if !referenced.eq_ignore_ascii_case(table) {
                continue;
            }
            let referencing = self.working.table(fk_table)?;
            let index = referencing.column_index(fk_table, fk_column)?;
            let blocked = referencing
                .rows
                .values()
                .any(|row| matches!(row[index], Cell::Int(value) if ids.contains(&value)));
            if blocked {
                return Err(ReconcileError::ConstraintViolation(format!(
                    "FOREIGN KEY constraint failed: {fk_table}.{fk_column} references {table}"
                )));
            }
        }

        let table_ref = self.working.table_mut(table)?;
        let deleted = ids
            .iter()
            .filter(|id| table_ref.rows.remove(id).is_some())
            .count();
        Ok(deleted as u64)
    }

    async fn commit(self: Box<Self>) -> ReconcileResult<()> {
        let fault = take_fault(&self.faults, FaultOp::Commit, &[]).await;
        let MemoryTransaction {
            mut guard, working, ..
        } = *self;

        if matches!(fault, None | Some(FaultKind::LostAcknowledgement)) {
            *guard = working;
        }
        match fault.and_then(|kind| fault_error(kind, FaultOp::Commit)) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn rollback(self: Box<Self>) -> ReconcileResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_products() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .create_table("products", "id", &["name", "category_id"])
            .await;
        let rows: [(RowId, &str, Option<i64>); 5] = [
            (1, "Rice", None),
            (2, "Milk", Some(1)),
            (3, "Rice", None),
            (4, "Milk", Some(1)),
            (5, "Milk", Some(2)),
        ];
        for (id, name, category) in rows {
            store
                .insert("products", id, vec![name.into(), category.into()])
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_null_safe_grouping() {
        let store = store_with_products().await;
        let groups = store
            .find_duplicate_groups(&EntityDefinition::products())
            .await
            .unwrap();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].member_ids, vec![1, 3]);
        assert_eq!(groups[0].key.to_string(), "('Rice', NULL)");
        assert_eq!(groups[1].member_ids, vec![2, 4]);
    }

    #[tokio::test]
    async fn test_null_never_matches_on_plain_column() {
        let store = store_with_products().await;
        let entity = crate::model::EntityDefinition::new("products", "products")
            .with_key("name")
            .with_key("category_id");
        let groups = store.find_duplicate_groups(&entity).await.unwrap();

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].member_ids, vec![2, 4]);
    }

    #[tokio::test]
    async fn test_uncommitted_transaction_is_discarded() {
        let store = store_with_products().await;
        {
            let mut tx = store.begin().await.unwrap();
            tx.delete_rows("products", "id", &[3]).await.unwrap();
        }
        assert_eq!(store.ids("products").await, vec![1, 2, 3, 4, 5]);

        let mut tx = store.begin().await.unwrap();
        tx.delete_rows("products", "id", &[3]).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.ids("products").await, vec![1, 2, 4, 5]);
    }

    #[tokio::test]
    async fn test_faults_fire_the_requested_number_of_times() {
        let store = store_with_products().await;
        store
            .inject_fault(FaultOp::Begin, None, FaultKind::Transient, 1)
            .await;

        let err = store.begin().await.err().unwrap();
        assert!(err.is_transient());
        assert!(store.begin().await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_enforces_declared_foreign_keys() {
        let store = store_with_products().await;
        store.create_table("cart", "id", &["product_id"]).await;
        store.insert("cart", 1, vec![Cell::Int(3)]).await.unwrap();
        store.declare_foreign_key("cart", "product_id", "products").await;

        let mut tx = store.begin().await.unwrap();
        let err = tx.delete_rows("products", "id", &[3]).await.unwrap_err();
        assert!(matches!(err, ReconcileError::ConstraintViolation(_)));
    }
}
