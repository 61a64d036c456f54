//! Reconciliation run driver.
//!
//! A run scans the entity table once, then merges each duplicate group in its
//! own transaction: re-read the group, repoint references, remove losers,
//! commit. Transient store errors are retried with exponential backoff; any
//! other failure rolls back that group only and the run moves on.

use crate::audit::RelationAudit;
use crate::config::ReconcilerConfig;
use crate::error::{ReconcileError, ReconcileResult};
use crate::finder::DuplicateGroupFinder;
use crate::metrics::ReconcileMetrics;
use crate::model::{EntityDefinition, MergePlan, RowId};
use crate::remover::LoserRemover;
use crate::repointer::ReferenceRepointer;
use crate::report::{FailedGroup, GroupState, RunReport};
use crate::selector::CanonicalSelector;
use crate::store::{ReconcileStore, StoreTransaction};
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

/// Run-level state: `Idle -> Scanning -> Merging -> Reporting -> Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunPhase {
    Idle = 0,
    Scanning = 1,
    Merging = 2,
    Reporting = 3,
    Done = 4,
}

impl RunPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RunPhase::Scanning,
            2 => RunPhase::Merging,
            3 => RunPhase::Reporting,
            4 => RunPhase::Done,
            _ => RunPhase::Idle,
        }
    }
}

/// Outcome of one group's unit of work.
#[derive(Debug)]
enum GroupOutcome {
    Merged {
        rows_repointed: u64,
        rows_deleted: u64,
        retries: usize,
    },
    Failed {
        failure: FailedGroup,
        retries: usize,
    },
    /// Not started: the run timed out or was cancelled first.
    Skipped,
}

/// Error of a single attempt plus the step it happened in.
struct AttemptError {
    error: ReconcileError,
    during: GroupState,
    /// Counts of a unit whose commit failed; the commit may still have landed.
    uncertain_commit: Option<(u64, u64)>,
}

impl AttemptError {
    fn new(error: ReconcileError, during: GroupState) -> Self {
        Self {
            error,
            during,
            uncertain_commit: None,
        }
    }
}

/// Merges the duplicate groups of one entity type.
pub struct Reconciler {
    store: Arc<dyn ReconcileStore>,
    entity: EntityDefinition,
    config: ReconcilerConfig,
    metrics: ReconcileMetrics,
    shutdown: Option<watch::Receiver<bool>>,
    phase: AtomicU8,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ReconcileStore>,
        entity: EntityDefinition,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            entity,
            config,
            metrics: ReconcileMetrics::new(),
            shutdown: None,
            phase: AtomicU8::new(RunPhase::Idle as u8),
        }
    }

    /// Stop starting new groups once `true` is sent on this channel.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn metrics(&self) -> &ReconcileMetrics {
        &self.metrics
    }

    pub fn phase(&self) -> RunPhase {
        RunPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: RunPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Compare the relation registry with the schema's foreign keys.
    pub async fn audit_relations(&self) -> ReconcileResult<RelationAudit> {
        let declared = self.store.declared_relations(&self.entity).await?;
        Ok(RelationAudit::new(&self.entity, declared))
    }

    /// Run a full reconciliation of the entity.
    ///
    /// # Errors
    ///
    /// Only systemic failures are returned: invalid configuration, or a scan
    /// that could not be completed. Per-group failures end up in
    /// [`RunReport::failed_groups`].
    pub async fn run(&self) -> ReconcileResult<RunReport> {
        let started = Instant::now();
        let deadline = self.config.run_timeout.map(|timeout| started + timeout);
        let mut report = RunReport::new(Uuid::new_v4(), &self.entity.name, self.config.dry_run);

        self.config.validate()?;
        self.entity.validate()?;

        tracing::info!(
            run_id = %report.run_id,
            entity = %self.entity.name,
            backend = self.store.backend(),
            dry_run = self.config.dry_run,
            max_concurrent_groups = self.config.max_concurrent_groups,
            "Starting reconciliation run"
        );

        self.set_phase(RunPhase::Scanning);
        let audit = self.audit_relations().await?;
        for warning in audit.warnings() {
            tracing::warn!(entity = %self.entity.name, "{warning}");
            report.warnings.push(warning);
        }

        let groups = DuplicateGroupFinder::new(self.store.clone())
            .find(&self.entity)
            .await?;
        report.groups_found = groups.len();
        self.metrics.record_groups_found(groups.len());

        let selector = CanonicalSelector::new();
        let plans: Vec<MergePlan> = groups.iter().filter_map(|g| selector.select(g)).collect();

        self.set_phase(RunPhase::Merging);
        let repointer = ReferenceRepointer::new(self.entity.relations.clone());
        let remover = LoserRemover::new(&self.entity).with_unregistered(audit.unregistered);

        let mut outcomes = futures::stream::iter(plans.iter().enumerate())
            .map(|(index, plan)| {
                let repointer = &repointer;
                let remover = &remover;
                async move {
                    let outcome = self.process_group(plan, repointer, remover, deadline).await;
                    (index, outcome)
                }
            })
            .buffer_unordered(self.config.max_concurrent_groups)
            .collect::<Vec<_>>()
            .await;
        outcomes.sort_by_key(|(index, _)| *index);

        self.set_phase(RunPhase::Reporting);
        for (_, outcome) in outcomes {
            match outcome {
                GroupOutcome::Merged {
                    rows_repointed,
                    rows_deleted,
                    retries,
                } => {
                    report.groups_merged += 1;
                    report.rows_repointed += rows_repointed;
                    report.rows_deleted += rows_deleted;
                    report.retries += retries;
                }
                GroupOutcome::Failed { failure, retries } => {
                    report.retries += retries;
                    report.failed_groups.push(failure);
                }
                GroupOutcome::Skipped => {
                    report.groups_skipped += 1;
                    report.interrupted = true;
                }
            }
        }
        report.duration = started.elapsed();

        if report.interrupted {
            tracing::warn!(
                entity = %self.entity.name,
                skipped = report.groups_skipped,
                "Run stopped before all groups were processed"
            );
        }

        tracing::info!(
            run_id = %report.run_id,
            entity = %self.entity.name,
            groups_found = report.groups_found,
            groups_merged = report.groups_merged,
            groups_failed = report.failed_groups.len(),
            groups_skipped = report.groups_skipped,
            rows_repointed = report.rows_repointed,
            rows_deleted = report.rows_deleted,
            retries = report.retries,
            duration = ?report.duration,
            "Reconciliation run complete"
        );

        self.set_phase(RunPhase::Done);
        Ok(report)
    }

    fn should_stop(&self, deadline: Option<Instant>) -> bool {
        let cancelled = self
            .shutdown
            .as_ref()
            .is_some_and(|shutdown| *shutdown.borrow());
        let timed_out = deadline.is_some_and(|deadline| Instant::now() >= deadline);
        cancelled || timed_out
    }

    /// Merge one group, retrying transient failures.
    async fn process_group(
        &self,
        plan: &MergePlan,
        repointer: &ReferenceRepointer,
        remover: &LoserRemover,
        deadline: Option<Instant>,
    ) -> GroupOutcome {
        if self.should_stop(deadline) {
            self.metrics.record_group_skipped();
            return GroupOutcome::Skipped;
        }

        let group_started = Instant::now();
        let mut retries = 0;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match self.merge_group(plan, repointer, remover).await {
                Err(failed) => self.resolve_commit_failure(plan, failed).await,
                merged => merged,
            };
            match result {
                Ok((rows_repointed, rows_deleted)) => {
                    if attempt > 1 {
                        tracing::info!(
                            key = %plan.key,
                            attempts = attempt,
                            "Group merged after retrying"
                        );
                    }
                    tracing::info!(
                        entity = %self.entity.name,
                        key = %plan.key,
                        survivor = plan.survivor_id,
                        losers = ?plan.losers(),
                        rows_repointed = rows_repointed,
                        rows_deleted = rows_deleted,
                        dry_run = self.config.dry_run,
                        "Group merged"
                    );
                    self.metrics.record_group_merged(
                        rows_repointed,
                        rows_deleted,
                        group_started.elapsed(),
                    );
                    return GroupOutcome::Merged {
                        rows_repointed,
                        rows_deleted,
                        retries,
                    };
                }
                Err(failed)
                    if failed.error.is_transient() && attempt <= self.config.max_retries =>
                {
                    let delay = self.config.backoff_delay(attempt);
                    tracing::warn!(
                        key = %plan.key,
                        attempt = attempt,
                        max_retries = self.config.max_retries,
                        error = %failed.error,
                        "Transient error, retrying after {delay:?}"
                    );
                    self.metrics.record_retry();
                    retries += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(failed) => {
                    tracing::error!(
                        entity = %self.entity.name,
                        key = %plan.key,
                        during = %failed.during,
                        attempts = attempt,
                        error = %failed.error,
                        "Group failed and was rolled back"
                    );
                    self.metrics.record_group_failed();
                    return GroupOutcome::Failed {
                        failure: FailedGroup {
                            key: plan.key.clone(),
                            member_ids: plan.all_ids(),
                            kind: failed.error.kind(),
                            failed_during: failed.during,
                            reason: failed.error.to_string(),
                        },
                        retries,
                    };
                }
            }
        }
    }

    /// One attempt: a single transaction, committed or rolled back as a whole.
    async fn merge_group(
        &self,
        plan: &MergePlan,
        repointer: &ReferenceRepointer,
        remover: &LoserRemover,
    ) -> Result<(u64, u64), AttemptError> {
        let mut state = GroupState::Pending;
        let mut tx = self
            .store
            .begin()
            .await
            .map_err(|error| AttemptError::new(error, state))?;

        let result = self
            .apply_plan(tx.as_mut(), plan, repointer, remover, &mut state)
            .await;

        match result {
            Ok(counts) if self.config.dry_run => {
                tx.rollback()
                    .await
                    .map_err(|error| AttemptError::new(error, state))?;
                self.metrics.record_rollback();
                tracing::debug!(key = %plan.key, state = %GroupState::RolledBack, "[DRY-RUN] Rolled back group");
                Ok(counts)
            }
            Ok(counts) => {
                tx.commit().await.map_err(|error| AttemptError {
                    error,
                    during: GroupState::Committing,
                    uncertain_commit: Some(counts),
                })?;
                tracing::debug!(key = %plan.key, state = %GroupState::Committed, "Committed group");
                Ok(counts)
            }
            Err(error) => {
                if let Err(rollback_error) = tx.rollback().await {
                    tracing::warn!(
                        key = %plan.key,
                        error = %rollback_error,
                        "Failed to roll back group transaction"
                    );
                }
                self.metrics.record_rollback();
                Err(AttemptError::new(error, state))
            }
        }
    }

    /// A failed COMMIT may still have been applied. If only the survivor is
    /// left, the attempt succeeded and must not be retried.
    async fn resolve_commit_failure(
        &self,
        plan: &MergePlan,
        failed: AttemptError,
    ) -> Result<(u64, u64), AttemptError> {
        let Some(counts) = failed.uncertain_commit else {
            return Err(failed);
        };

        match self.surviving_ids(plan).await {
            Ok(remaining) if remaining == [plan.survivor_id] => {
                tracing::warn!(
                    key = %plan.key,
                    error = %failed.error,
                    "Commit reported an error but was applied"
                );
                Ok(counts)
            }
            Ok(_) => Err(failed),
            Err(error) => {
                tracing::warn!(
                    key = %plan.key,
                    error = %error,
                    "Could not verify the outcome of a failed commit"
                );
                Err(failed)
            }
        }
    }

    /// Ids of the group that still exist, read in a throwaway transaction.
    async fn surviving_ids(&self, plan: &MergePlan) -> ReconcileResult<Vec<RowId>> {
        let mut tx = self.store.begin().await?;
        let existing = tx
            .existing_ids(&self.entity.table, &self.entity.id_column, &plan.all_ids())
            .await;
        tx.rollback().await?;
        existing
    }

    async fn apply_plan(
        &self,
        tx: &mut dyn StoreTransaction,
        plan: &MergePlan,
        repointer: &ReferenceRepointer,
        remover: &LoserRemover,
        state: &mut GroupState,
    ) -> ReconcileResult<(u64, u64)> {
        let ids = plan.all_ids();
        let existing = tx
            .existing_ids(&self.entity.table, &self.entity.id_column, &ids)
            .await?;
        if existing.len() != ids.len() {
            let missing: Vec<_> = ids.iter().filter(|id| !existing.contains(id)).collect();
            return Err(ReconcileError::NotFoundError(format!(
                "{} row(s) {missing:?} of group {} no longer exist in {}",
                missing.len(),
                plan.key,
                self.entity.table
            )));
        }

        *state = GroupState::Repointing;
        let summary = repointer.repoint(tx, plan).await?;

        *state = GroupState::Removing;
        let deleted = remover.remove(tx, plan).await?;

        Ok((summary.total(), deleted))
    }
}
