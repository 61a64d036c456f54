//! Entity definitions and the transient structures a reconciliation run works with.

use crate::error::{ReconcileError, ReconcileResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Row identifier. Stores assign these monotonically, so lower means older.
pub type RowId = i64;

/// Value of a natural key, one component per key column.
///
/// Components are rendered as text; `None` stands for SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKeyValue(pub Vec<Option<String>>);

impl NaturalKeyValue {
    pub fn new(components: Vec<Option<String>>) -> Self {
        Self(components)
    }

    pub fn components(&self) -> &[Option<String>] {
        &self.0
    }
}

impl fmt::Display for NaturalKeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, component) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match component {
                Some(value) => write!(f, "'{value}'")?,
                None => write!(f, "NULL")?,
            }
        }
        write!(f, ")")
    }
}

/// One column of a natural key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyColumn {
    pub name: String,
    /// Treat NULL = NULL as a match on this column.
    pub null_safe: bool,
}

/// Declares that `table.foreign_key_column` may hold an id of `owner_entity`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationDescriptor {
    pub table: String,
    pub foreign_key_column: String,
    pub owner_entity: String,
}

impl RelationDescriptor {
    pub fn new(
        table: impl Into<String>,
        foreign_key_column: impl Into<String>,
        owner_entity: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            foreign_key_column: foreign_key_column.into(),
            owner_entity: owner_entity.into(),
        }
    }

    /// Same table and column, ignoring ASCII case (SQL identifiers are case-insensitive).
    pub fn same_column(&self, other: &RelationDescriptor) -> bool {
        self.table.eq_ignore_ascii_case(&other.table)
            && self
                .foreign_key_column
                .eq_ignore_ascii_case(&other.foreign_key_column)
    }
}

impl fmt::Display for RelationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}",
            self.table, self.foreign_key_column, self.owner_entity
        )
    }
}

/// Everything the engine needs to know about one deduplicated entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDefinition {
    /// Logical name used in reports and configuration (e.g. `categories`).
    pub name: String,
    pub table: String,
    pub id_column: String,
    pub natural_key: Vec<KeyColumn>,
    /// Relation registry: every table/column that may reference this entity.
    pub relations: Vec<RelationDescriptor>,
}

impl EntityDefinition {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            id_column: "id".to_string(),
            natural_key: Vec::new(),
            relations: Vec::new(),
        }
    }

    pub fn with_id_column(mut self, column: impl Into<String>) -> Self {
        self.id_column = column.into();
        self
    }

    pub fn with_key(mut self, column: impl Into<String>) -> Self {
        self.natural_key.push(KeyColumn {
            name: column.into(),
            null_safe: false,
        });
        self
    }

    pub fn with_null_safe_key(mut self, column: impl Into<String>) -> Self {
        self.natural_key.push(KeyColumn {
            name: column.into(),
            null_safe: true,
        });
        self
    }

    pub fn with_relation(
        mut self,
        table: impl Into<String>,
        foreign_key_column: impl Into<String>,
    ) -> Self {
        let relation = RelationDescriptor::new(table, foreign_key_column, self.name.clone());
        self.relations.push(relation);
        self
    }

    /// Categories are duplicates when their names match; products point at them.
    pub fn categories() -> Self {
        Self::new("categories", "categories")
            .with_key("name")
            .with_relation("products", "category_id")
    }

    /// Products are duplicates when name and category match, a missing category included.
    pub fn products() -> Self {
        Self::new("products", "products")
            .with_key("name")
            .with_null_safe_key("category_id")
    }

    pub fn is_registered(&self, relation: &RelationDescriptor) -> bool {
        self.relations.iter().any(|r| r.same_column(relation))
    }

    /// Check names and shape before any query is built from them.
    pub fn validate(&self) -> ReconcileResult<()> {
        validate_identifier(&self.table)?;
        validate_identifier(&self.id_column)?;

        if self.natural_key.is_empty() {
            return Err(ReconcileError::ConfigurationError(format!(
                "entity '{}' declares no natural key columns",
                self.name
            )));
        }

        for column in &self.natural_key {
            validate_identifier(&column.name)?;
            if column.name.eq_ignore_ascii_case(&self.id_column) {
                return Err(ReconcileError::ConfigurationError(format!(
                    "entity '{}' uses its id column '{}' as a natural key",
                    self.name, column.name
                )));
            }
        }

        for relation in &self.relations {
            validate_identifier(&relation.table)?;
            validate_identifier(&relation.foreign_key_column)?;
            if relation.owner_entity != self.name {
                return Err(ReconcileError::ConfigurationError(format!(
                    "relation {relation} is registered under entity '{}'",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

/// Accept plain SQL identifiers only: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_identifier(identifier: &str) -> ReconcileResult<()> {
    let mut chars = identifier.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(ReconcileError::ConfigurationError(format!(
            "'{identifier}' is not a valid table or column name"
        )))
    }
}

/// Rows of one entity table sharing a natural key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub key: NaturalKeyValue,
    /// Ascending.
    pub member_ids: Vec<RowId>,
}

impl DuplicateGroup {
    pub fn new(key: NaturalKeyValue, mut member_ids: Vec<RowId>) -> Self {
        member_ids.sort_unstable();
        member_ids.dedup();
        Self { key, member_ids }
    }

    pub fn len(&self) -> usize {
        self.member_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.member_ids.is_empty()
    }
}

/// Survivor and losers of one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub key: NaturalKeyValue,
    pub survivor_id: RowId,
    pub loser_ids: BTreeSet<RowId>,
}

impl MergePlan {
    pub fn losers(&self) -> Vec<RowId> {
        self.loser_ids.iter().copied().collect()
    }

    /// Survivor first, then losers ascending.
    pub fn all_ids(&self) -> Vec<RowId> {
        std::iter::once(self.survivor_id)
            .chain(self.loser_ids.iter().copied())
            .collect()
    }
}
