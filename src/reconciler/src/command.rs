//! Entry points behind the CLI commands.

use crate::audit::RelationAudit;
use crate::config::ReconcilerConfig;
use crate::model::EntityDefinition;
use crate::orchestrator::Reconciler;
use crate::report::RunReport;
use crate::store::{ReconcileStore, SqlStore};
use anyhow::{Context, Result};
use common::config::Configuration;
use std::sync::Arc;
use tokio::sync::watch;

/// Per-invocation overrides of the `[reconcile]` section.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOptions {
    /// Force a dry run regardless of configuration.
    pub dry_run: bool,
}

/// Look up `[entities.<name>]` and check it can be queried safely.
pub fn entity_definition(config: &Configuration, name: &str) -> Result<EntityDefinition> {
    let entity_config = config.entity(name).with_context(|| {
        let known = config.entities.keys().cloned().collect::<Vec<_>>().join(", ");
        format!("Unknown entity '{name}' (configured: {known})")
    })?;

    let entity = EntityDefinition::from_config(name, entity_config);
    entity
        .validate()
        .with_context(|| format!("Invalid definition for entity '{name}'"))?;
    Ok(entity)
}

pub async fn connect_store(config: &Configuration) -> Result<Arc<dyn ReconcileStore>> {
    let store = SqlStore::connect(&config.database.dsn, config.database.max_connections)
        .await
        .context("Failed to connect to catalog store")?;
    Ok(Arc::new(store))
}

/// Merge all duplicates of one configured entity.
///
/// Errors are systemic (configuration, connection, scan); group failures are
/// part of the returned report.
pub async fn merge_entity(
    config: &Configuration,
    entity_name: &str,
    options: MergeOptions,
    shutdown: watch::Receiver<bool>,
) -> Result<RunReport> {
    config.validate().context("Invalid configuration")?;
    let entity = entity_definition(config, entity_name)?;
    let store = connect_store(config).await?;

    run_merge(store, entity, config, options, shutdown).await
}

/// Merge using an already connected store.
pub async fn run_merge(
    store: Arc<dyn ReconcileStore>,
    entity: EntityDefinition,
    config: &Configuration,
    options: MergeOptions,
    shutdown: watch::Receiver<bool>,
) -> Result<RunReport> {
    let reconciler_config = ReconcilerConfig::from(&config.reconcile)
        .with_dry_run(config.reconcile.dry_run || options.dry_run);

    let entity_name = entity.name.clone();
    let reconciler = Reconciler::new(store, entity, reconciler_config).with_shutdown(shutdown);
    let report = reconciler
        .run()
        .await
        .with_context(|| format!("Reconciliation of '{entity_name}' failed"))?;

    log::info!("Run metrics: {}", reconciler.metrics().summary());
    Ok(report)
}

/// Compare the relation registry of an entity with the schema's foreign keys.
pub async fn audit_relations(config: &Configuration, entity_name: &str) -> Result<RelationAudit> {
    let entity = entity_definition(config, entity_name)?;
    let store = connect_store(config).await?;
    let reconciler = Reconciler::new(store, entity, ReconcilerConfig::from(&config.reconcile));

    reconciler
        .audit_relations()
        .await
        .with_context(|| format!("Failed to read schema relations for '{entity_name}'"))
}
