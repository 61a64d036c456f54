//! SQL text generation for the supported database backends.
//!
//! Every statement the SQL store runs is built here from validated
//! identifiers. Values are always bound, never interpolated.

use crate::error::{ReconcileError, ReconcileResult};
use crate::model::{EntityDefinition, RelationDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
    MySql,
}

impl Dialect {
    /// Pick the dialect from a connection string scheme.
    pub fn from_dsn(dsn: &str) -> ReconcileResult<Self> {
        let scheme = dsn
            .split_once(':')
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .unwrap_or_default();

        match scheme.as_str() {
            "sqlite" => Ok(Dialect::Sqlite),
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            _ => Err(ReconcileError::ConfigurationError(format!(
                "unsupported database DSN scheme in '{dsn}' (expected sqlite:, postgres:// or mysql://)"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
        }
    }

    pub fn quote(&self, identifier: &str) -> String {
        match self {
            Dialect::MySql => format!("`{identifier}`"),
            Dialect::Sqlite | Dialect::Postgres => format!("\"{identifier}\""),
        }
    }

    /// Bind parameter for 1-based position `n`.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${n}"),
            Dialect::Sqlite | Dialect::MySql => "?".to_string(),
        }
    }

    /// `count` comma separated placeholders starting at position `first`.
    pub fn placeholders(&self, first: usize, count: usize) -> String {
        (first..first + count)
            .map(|n| self.placeholder(n))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn null_safe_eq(&self, left: &str, right: &str) -> String {
        match self {
            Dialect::Sqlite => format!("{left} IS {right}"),
            Dialect::Postgres => format!("{left} IS NOT DISTINCT FROM {right}"),
            Dialect::MySql => format!("{left} <=> {right}"),
        }
    }

    pub fn text_cast(&self, expr: &str) -> String {
        match self {
            Dialect::MySql => format!("CAST({expr} AS CHAR)"),
            Dialect::Sqlite | Dialect::Postgres => format!("CAST({expr} AS TEXT)"),
        }
    }

    pub fn int_cast(&self, expr: &str) -> String {
        match self {
            Dialect::Sqlite => format!("CAST({expr} AS INTEGER)"),
            Dialect::Postgres => format!("CAST({expr} AS BIGINT)"),
            Dialect::MySql => format!("CAST({expr} AS SIGNED)"),
        }
    }

    /// One row per member of every duplicate group.
    ///
    /// Columns: `anchor_id` (lowest id of the group), `member_id`, then
    /// `key_0..key_n` as text. Ordered by anchor, then member.
    pub fn duplicate_groups_sql(&self, entity: &EntityDefinition) -> String {
        let table = self.quote(&entity.table);
        let id = self.quote(&entity.id_column);

        let key_columns: Vec<String> = entity
            .natural_key
            .iter()
            .map(|column| self.quote(&column.name))
            .collect();

        let grouped_keys = key_columns
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{column} AS k{i}"))
            .collect::<Vec<_>>()
            .join(", ");

        let not_null = entity
            .natural_key
            .iter()
            .zip(&key_columns)
            .filter(|(column, _)| !column.null_safe)
            .map(|(_, quoted)| format!("{quoted} IS NOT NULL"))
            .collect::<Vec<_>>();
        let where_clause = if not_null.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", not_null.join(" AND "))
        };

        let join_on = entity
            .natural_key
            .iter()
            .zip(&key_columns)
            .enumerate()
            .map(|(i, (column, quoted))| {
                let left = format!("t.{quoted}");
                let right = format!("g.k{i}");
                if column.null_safe {
                    self.null_safe_eq(&left, &right)
                } else {
                    format!("{left} = {right}")
                }
            })
            .collect::<Vec<_>>()
            .join(" AND ");

        let selected_keys = key_columns
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{} AS key_{i}", self.text_cast(&format!("t.{column}"))))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "SELECT {anchor} AS anchor_id, {member} AS member_id, {selected_keys} \
             FROM {table} t \
             JOIN (SELECT MIN({id}) AS anchor, {grouped_keys} FROM {table}{where_clause} \
             GROUP BY {group_by} HAVING COUNT(*) > 1) g \
             ON {join_on} \
             ORDER BY anchor_id, member_id",
            anchor = self.int_cast("g.anchor"),
            member = self.int_cast(&format!("t.{id}")),
            group_by = key_columns.join(", "),
        )
    }

    /// `UPDATE` of one relation: first bind is the survivor, then `loser_count` losers.
    pub fn repoint_sql(&self, relation: &RelationDescriptor, loser_count: usize) -> String {
        let column = self.quote(&relation.foreign_key_column);
        format!(
            "UPDATE {} SET {column} = {} WHERE {column} IN ({})",
            self.quote(&relation.table),
            self.placeholder(1),
            self.placeholders(2, loser_count)
        )
    }

    pub fn count_references_sql(&self, relation: &RelationDescriptor, id_count: usize) -> String {
        format!(
            "SELECT {} AS n FROM {} WHERE {} IN ({})",
            self.int_cast("COUNT(*)"),
            self.quote(&relation.table),
            self.quote(&relation.foreign_key_column),
            self.placeholders(1, id_count)
        )
    }

    pub fn existing_ids_sql(&self, table: &str, id_column: &str, id_count: usize) -> String {
        let id = self.quote(id_column);
        format!(
            "SELECT {} AS id FROM {} WHERE {id} IN ({}) ORDER BY id",
            self.int_cast(&id),
            self.quote(table),
            self.placeholders(1, id_count)
        )
    }

    pub fn delete_sql(&self, table: &str, id_column: &str, id_count: usize) -> String {
        format!(
            "DELETE FROM {} WHERE {} IN ({})",
            self.quote(table),
            self.quote(id_column),
            self.placeholders(1, id_count)
        )
    }

    /// Foreign keys declared against a table, bound with the table name.
    ///
    /// Columns: `table_name`, `column_name`.
    pub fn declared_relations_sql(&self) -> &'static str {
        match self {
            Dialect::Sqlite => {
                r#"SELECT m.name AS table_name, p."from" AS column_name
                FROM sqlite_master m
                JOIN pragma_foreign_key_list(m.name) p
                WHERE m.type = 'table' AND p."table" = ? COLLATE NOCASE
                ORDER BY m.name, p."from""#
            }
            Dialect::Postgres => {
                r#"SELECT CAST(src.relname AS TEXT) AS table_name,
                       CAST(att.attname AS TEXT) AS column_name
                FROM pg_constraint con
                JOIN pg_class src ON src.oid = con.conrelid
                JOIN pg_class tgt ON tgt.oid = con.confrelid
                JOIN pg_namespace ns ON ns.oid = tgt.relnamespace
                JOIN pg_attribute att ON att.attrelid = con.conrelid AND att.attnum = ANY(con.conkey)
                WHERE con.contype = 'f'
                  AND CAST(tgt.relname AS TEXT) = $1
                  AND ns.nspname = current_schema()
                ORDER BY 1, 2"#
            }
            Dialect::MySql => {
                r#"SELECT CAST(TABLE_NAME AS CHAR) AS table_name,
                       CAST(COLUMN_NAME AS CHAR) AS column_name
                FROM information_schema.KEY_COLUMN_USAGE
                WHERE REFERENCED_TABLE_SCHEMA = DATABASE()
                  AND REFERENCED_TABLE_NAME = ?
                ORDER BY TABLE_NAME, COLUMN_NAME"#
            }
        }
    }
}
