//! Comparison of the relation registry with the relations the schema declares.

use crate::model::{EntityDefinition, RelationDescriptor};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationAudit {
    pub entity: String,
    pub registered: Vec<RelationDescriptor>,
    pub schema_declared: Vec<RelationDescriptor>,
    /// Declared in the schema, absent from the registry.
    pub unregistered: Vec<RelationDescriptor>,
    /// Registered but without a schema foreign key. Harmless, reported for completeness.
    pub undeclared: Vec<RelationDescriptor>,
}

impl RelationAudit {
    pub fn new(entity: &EntityDefinition, schema_declared: Vec<RelationDescriptor>) -> Self {
        let unregistered = schema_declared
            .iter()
            .filter(|relation| !entity.is_registered(relation))
            .cloned()
            .collect();
        let undeclared = entity
            .relations
            .iter()
            .filter(|relation| !schema_declared.iter().any(|d| d.same_column(relation)))
            .cloned()
            .collect();

        Self {
            entity: entity.name.clone(),
            registered: entity.relations.clone(),
            schema_declared,
            unregistered,
            undeclared,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.unregistered.is_empty()
    }

    /// One warning per schema relation missing from the registry.
    pub fn warnings(&self) -> Vec<String> {
        self.unregistered
            .iter()
            .map(|relation| {
                format!(
                    "configuration: {}.{} references {} but is not in the relation registry",
                    relation.table, relation.foreign_key_column, self.entity
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_splits_registry_and_schema() {
        let categories = EntityDefinition::categories().with_relation("promotions", "category_id");
        let declared = vec![
            RelationDescriptor::new("products", "category_id", "categories"),
            RelationDescriptor::new("cart", "category_id", "categories"),
        ];

        let audit = RelationAudit::new(&categories, declared);

        assert!(!audit.is_complete());
        assert_eq!(audit.unregistered.len(), 1);
        assert_eq!(audit.unregistered[0].table, "cart");
        assert_eq!(audit.undeclared.len(), 1);
        assert_eq!(audit.undeclared[0].table, "promotions");
        assert_eq!(audit.warnings().len(), 1);
        assert!(audit.warnings()[0].contains("cart.category_id"));
    }

    #[test]
    fn test_audit_without_schema_metadata_is_complete() {
        let audit = RelationAudit::new(&EntityDefinition::categories(), Vec::new());
        assert!(audit.is_complete());
        assert!(audit.warnings().is_empty());
    }
}
