//! Canonical survivor selection.

use crate::model::{DuplicateGroup, MergePlan};

/// Picks the row that survives a merge: the lowest id, i.e. the oldest row.
#[derive(Debug, Clone, Copy, Default)]
pub struct CanonicalSelector;

impl CanonicalSelector {
    pub fn new() -> Self {
        Self
    }

    /// Build the merge plan for a group.
    ///
    /// Returns `None` for groups with fewer than two members, which the finder
    /// never produces.
    pub fn select(&self, group: &DuplicateGroup) -> Option<MergePlan> {
        let survivor_id = group.member_ids.iter().copied().min()?;
        let loser_ids = group
            .member_ids
            .iter()
            .copied()
            .filter(|id| *id != survivor_id)
            .collect::<std::collections::BTreeSet<_>>();

        if loser_ids.is_empty() {
            return None;
        }

        Some(MergePlan {
            key: group.key.clone(),
            survivor_id,
            loser_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NaturalKeyValue;

    fn group(ids: Vec<i64>) -> DuplicateGroup {
        // Bypass DuplicateGroup::new so the selector sees unsorted input.
        DuplicateGroup {
            key: NaturalKeyValue::new(vec![Some("Dairy".to_string())]),
            member_ids: ids,
        }
    }

    #[test]
    fn test_lowest_id_survives() {
        let plan = CanonicalSelector::new().select(&group(vec![5, 2, 9])).unwrap();
        assert_eq!(plan.survivor_id, 2);
        assert_eq!(plan.losers(), vec![5, 9]);
        assert_eq!(plan.all_ids(), vec![2, 5, 9]);
    }

    #[test]
    fn test_selection_is_order_independent() {
        let selector = CanonicalSelector::new();
        let a = selector.select(&group(vec![7, 4, 1])).unwrap();
        let b = selector.select(&group(vec![1, 7, 4])).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_singleton_and_empty_groups_yield_no_plan() {
        let selector = CanonicalSelector::new();
        assert!(selector.select(&group(vec![3])).is_none());
        assert!(selector.select(&group(vec![])).is_none());
        assert!(selector.select(&group(vec![3, 3])).is_none());
    }
}
