//! Rewrites foreign keys from losers to the survivor.

use crate::error::ReconcileResult;
use crate::model::{MergePlan, RelationDescriptor};
use crate::store::StoreTransaction;

/// Rows rewritten per relation for one merge plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepointSummary {
    pub per_relation: Vec<(RelationDescriptor, u64)>,
}

impl RepointSummary {
    pub fn total(&self) -> u64 {
        self.per_relation.iter().map(|(_, rows)| rows).sum()
    }
}

/// Applies one bulk update per registered relation inside the group's transaction.
#[derive(Debug, Clone, Default)]
pub struct ReferenceRepointer {
    relations: Vec<RelationDescriptor>,
}

impl ReferenceRepointer {
    pub fn new(relations: Vec<RelationDescriptor>) -> Self {
        Self { relations }
    }

    /// Point every reference to a loser at the survivor.
    ///
    /// A relation with no rows pointing at losers is not an error; it simply
    /// contributes zero. Whether anything was missed is checked by the remover.
    pub async fn repoint(
        &self,
        tx: &mut dyn StoreTransaction,
        plan: &MergePlan,
    ) -> ReconcileResult<RepointSummary> {
        let losers = plan.losers();
        let mut summary = RepointSummary::default();
        if losers.is_empty() {
            return Ok(summary);
        }

        for relation in &self.relations {
            let rows = tx
                .repoint_references(relation, plan.survivor_id, &losers)
                .await?;

            tracing::debug!(
                relation = %relation,
                survivor = plan.survivor_id,
                losers = ?losers,
                rows = rows,
                "Repointed references"
            );

            summary.per_relation.push((relation.clone(), rows));
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NaturalKeyValue;
    use crate::store::{Cell, MemoryStore, ReconcileStore};
    use std::collections::BTreeSet;

    fn dairy_plan() -> MergePlan {
        MergePlan {
            key: NaturalKeyValue::new(vec![Some("Dairy".to_string())]),
            survivor_id: 1,
            loser_ids: BTreeSet::from([4, 7]),
        }
    }

    #[tokio::test]
    async fn test_repoint_rewrites_every_registered_relation() {
        let store = MemoryStore::new();
        store.create_table("products", "id", &["category_id"]).await;
        store.create_table("promotions", "id", &["category_id"]).await;
        for (id, category) in [(10, 4), (11, 7), (12, 1), (13, 2)] {
            store.insert("products", id, vec![Cell::Int(category)]).await.unwrap();
        }
        store.insert("promotions", 1, vec![Cell::Int(7)]).await.unwrap();

        let repointer = ReferenceRepointer::new(vec![
            RelationDescriptor::new("products", "category_id", "categories"),
            RelationDescriptor::new("promotions", "category_id", "categories"),
        ]);

        let mut tx = store.begin().await.unwrap();
        let summary = repointer.repoint(tx.as_mut(), &dairy_plan()).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(summary.total(), 3);
        assert_eq!(summary.per_relation[0].1, 2);
        assert_eq!(summary.per_relation[1].1, 1);
        assert_eq!(store.value("products", 10, "category_id").await, Some(Cell::Int(1)));
        assert_eq!(store.value("products", 11, "category_id").await, Some(Cell::Int(1)));
        assert_eq!(store.value("products", 13, "category_id").await, Some(Cell::Int(2)));
        assert_eq!(store.value("promotions", 1, "category_id").await, Some(Cell::Int(1)));
    }

    #[tokio::test]
    async fn test_empty_registry_rewrites_nothing() {
        let store = MemoryStore::new();
        let repointer = ReferenceRepointer::default();

        let mut tx = store.begin().await.unwrap();
        let summary = repointer.repoint(tx.as_mut(), &dairy_plan()).await.unwrap();
        assert_eq!(summary.total(), 0);
        assert!(summary.per_relation.is_empty());
    }
}
