//! Duplicate-entity reconciliation for the catalog database.
//!
//! [`Reconciler`] finds rows sharing a natural key, keeps the oldest one,
//! points every registered foreign key at it and deletes the rest. Each group
//! is merged in its own transaction through a [`ReconcileStore`].

pub mod audit;
pub mod command;
pub mod config;
pub mod error;
pub mod finder;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod remover;
pub mod repointer;
pub mod report;
pub mod selector;
pub mod store;

pub use audit::RelationAudit;
pub use config::ReconcilerConfig;
pub use error::{FailureKind, ReconcileError, ReconcileResult};
pub use metrics::{MetricsSummary, ReconcileMetrics};
pub use model::{
    DuplicateGroup, EntityDefinition, KeyColumn, MergePlan, NaturalKeyValue, RelationDescriptor,
    RowId,
};
pub use orchestrator::{Reconciler, RunPhase};
pub use report::{FailedGroup, GroupState, RunReport};
pub use store::{MemoryStore, ReconcileStore, SqlStore, StoreTransaction};
