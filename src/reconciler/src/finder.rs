//! Duplicate group discovery.

use crate::error::ReconcileResult;
use crate::model::{DuplicateGroup, EntityDefinition};
use crate::store::ReconcileStore;
use std::sync::Arc;

/// Scans an entity table for rows sharing a natural key.
pub struct DuplicateGroupFinder {
    store: Arc<dyn ReconcileStore>,
}

impl DuplicateGroupFinder {
    pub fn new(store: Arc<dyn ReconcileStore>) -> Self {
        Self { store }
    }

    /// Find all groups of two or more rows sharing `entity`'s natural key.
    ///
    /// Groups come back ordered by their lowest member id, members ascending.
    /// Nothing is written.
    pub async fn find(&self, entity: &EntityDefinition) -> ReconcileResult<Vec<DuplicateGroup>> {
        entity.validate()?;

        tracing::debug!(
            entity = %entity.name,
            table = %entity.table,
            key_columns = entity.natural_key.len(),
            backend = self.store.backend(),
            "Scanning for duplicate groups"
        );

        let mut groups: Vec<DuplicateGroup> = self
            .store
            .find_duplicate_groups(entity)
            .await?
            .into_iter()
            .filter(|group| group.len() > 1)
            .collect();
        groups.sort_by_key(|group| group.member_ids.first().copied());

        let duplicate_rows: usize = groups.iter().map(|g| g.len() - 1).sum();
        tracing::info!(
            entity = %entity.name,
            groups = groups.len(),
            duplicate_rows = duplicate_rows,
            "Duplicate scan complete"
        );

        Ok(groups)
    }
}
