//! Loser deletion with dangling reference checks.

use crate::error::{ReconcileError, ReconcileResult};
use crate::model::{EntityDefinition, MergePlan, RelationDescriptor};
use crate::store::StoreTransaction;

/// Deletes losers once nothing references them anymore.
#[derive(Debug, Clone)]
pub struct LoserRemover {
    table: String,
    id_column: String,
    registered: Vec<RelationDescriptor>,
    /// Schema foreign keys against the entity that the registry does not list.
    unregistered: Vec<RelationDescriptor>,
}

impl LoserRemover {
    pub fn new(entity: &EntityDefinition) -> Self {
        Self {
            table: entity.table.clone(),
            id_column: entity.id_column.clone(),
            registered: entity.relations.clone(),
            unregistered: Vec::new(),
        }
    }

    pub fn with_unregistered(mut self, relations: Vec<RelationDescriptor>) -> Self {
        self.unregistered = relations;
        self
    }

    /// Verify no relation still points at a loser, then delete the losers.
    ///
    /// # Errors
    ///
    /// * `ConstraintViolation` if a registered relation still references a loser
    /// * `ConfigurationError` if an unregistered schema relation references one
    /// * `NotFoundError` if fewer rows were deleted than planned
    pub async fn remove(
        &self,
        tx: &mut dyn StoreTransaction,
        plan: &MergePlan,
    ) -> ReconcileResult<u64> {
        let losers = plan.losers();
        if losers.is_empty() {
            return Ok(0);
        }

        for relation in &self.registered {
            let remaining = tx.count_references(relation, &losers).await?;
            if remaining > 0 {
                return Err(ReconcileError::ConstraintViolation(format!(
                    "{remaining} row(s) in {}.{} still reference losers {losers:?} after repointing",
                    relation.table, relation.foreign_key_column
                )));
            }
        }

        for relation in &self.unregistered {
            let remaining = tx.count_references(relation, &losers).await?;
            if remaining > 0 {
                return Err(ReconcileError::ConfigurationError(format!(
                    "relation {relation} is declared in the schema but missing from the registry; \
                     {remaining} row(s) reference losers {losers:?}"
                )));
            }
        }

        let deleted = tx.delete_rows(&self.table, &self.id_column, &losers).await?;
        if deleted < losers.len() as u64 {
            return Err(ReconcileError::NotFoundError(format!(
                "deleted {deleted} of {} losers {losers:?} from {}",
                losers.len(),
                self.table
            )));
        }

        tracing::debug!(
            table = %self.table,
            survivor = plan.survivor_id,
            deleted = deleted,
            "Removed losers"
        );

        Ok(deleted)
    }
}
