//! Store capability consumed by the reconciliation engine.
//!
//! The engine never talks to a database directly. It is handed an
//! implementation of [`ReconcileStore`]: [`SqlStore`] for SQLite, PostgreSQL
//! and MySQL, or [`MemoryStore`] for tests. All writes for one duplicate
//! group go through a single [`StoreTransaction`], which is rolled back when
//! dropped without an explicit commit.

use crate::error::ReconcileResult;
use crate::model::{DuplicateGroup, EntityDefinition, RelationDescriptor, RowId};
use async_trait::async_trait;

pub mod dialect;
pub mod memory;
pub mod sql;

pub use dialect::Dialect;
pub use memory::{Cell, FaultKind, FaultOp, MemoryStore};
pub use sql::SqlStore;

/// Read access for scanning plus a factory for per-group transactions.
#[async_trait]
pub trait ReconcileStore: std::fmt::Debug + Send + Sync {
    /// Short backend name for logs and reports.
    fn backend(&self) -> &'static str;

    /// Groups of rows sharing the entity's natural key, two or more rows each.
    async fn find_duplicate_groups(
        &self,
        entity: &EntityDefinition,
    ) -> ReconcileResult<Vec<DuplicateGroup>>;

    /// Foreign keys the store's schema declares against the entity table.
    ///
    /// Stores without schema metadata return an empty list.
    async fn declared_relations(
        &self,
        entity: &EntityDefinition,
    ) -> ReconcileResult<Vec<RelationDescriptor>>;

    /// Open a transaction scoped to one group.
    async fn begin(&self) -> ReconcileResult<Box<dyn StoreTransaction>>;
}

/// Writes and checks applied atomically for one group.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Subset of `ids` that still exist in `table`.
    async fn existing_ids(
        &mut self,
        table: &str,
        id_column: &str,
        ids: &[RowId],
    ) -> ReconcileResult<Vec<RowId>>;

    /// `UPDATE relation.table SET fk = survivor WHERE fk IN (losers)`; returns rows changed.
    async fn repoint_references(
        &mut self,
        relation: &RelationDescriptor,
        survivor: RowId,
        losers: &[RowId],
    ) -> ReconcileResult<u64>;

    /// Rows of `relation.table` whose foreign key is one of `ids`.
    async fn count_references(
        &mut self,
        relation: &RelationDescriptor,
        ids: &[RowId],
    ) -> ReconcileResult<u64>;

    /// Delete rows by id; returns rows deleted.
    async fn delete_rows(
        &mut self,
        table: &str,
        id_column: &str,
        ids: &[RowId],
    ) -> ReconcileResult<u64>;

    async fn commit(self: Box<Self>) -> ReconcileResult<()>;

    async fn rollback(self: Box<Self>) -> ReconcileResult<()>;
}
