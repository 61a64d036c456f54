//! Engine settings and conversion from the file configuration.

use crate::error::{ReconcileError, ReconcileResult};
use crate::model::{EntityDefinition, KeyColumn, RelationDescriptor};
use common::config::{EntityConfig, ReconcileConfig};
use std::time::Duration;

/// Settings for one reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Retries per group after a transient error; 0 disables retrying.
    pub max_retries: u32,

    /// Backoff before retry `n` is `base_delay_ms * 2^(n-1)`.
    pub base_delay_ms: u64,

    /// Groups merged in parallel.
    pub max_concurrent_groups: usize,

    /// Stop starting new groups once this much time has passed.
    pub run_timeout: Option<Duration>,

    /// Run every group to the end, then roll it back.
    pub dry_run: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_concurrent_groups: 1,
            run_timeout: None,
            dry_run: false,
        }
    }
}

impl From<&ReconcileConfig> for ReconcilerConfig {
    fn from(config: &ReconcileConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.base_delay_ms,
            max_concurrent_groups: config.max_concurrent_groups,
            run_timeout: config.run_timeout,
            dry_run: config.dry_run,
        }
    }
}

impl ReconcilerConfig {
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn validate(&self) -> ReconcileResult<()> {
        if self.max_concurrent_groups == 0 {
            return Err(ReconcileError::ConfigurationError(
                "max_concurrent_groups must be greater than 0".to_string(),
            ));
        }

        if self.run_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ReconcileError::ConfigurationError(
                "run_timeout must be greater than 0 when set".to_string(),
            ));
        }

        Ok(())
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

impl EntityDefinition {
    /// Build an entity definition from its `[entities.<name>]` block.
    pub fn from_config(name: &str, config: &EntityConfig) -> Self {
        Self {
            name: name.to_string(),
            table: config.table.clone(),
            id_column: config.id_column.clone(),
            natural_key: config
                .natural_key
                .iter()
                .map(|key| KeyColumn {
                    name: key.column.clone(),
                    null_safe: key.null_safe,
                })
                .collect(),
            relations: config
                .relations
                .iter()
                .map(|relation| RelationDescriptor::new(&relation.table, &relation.column, name))
                .collect(),
        }
    }
}
