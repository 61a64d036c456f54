//! Run report returned by [`crate::Reconciler::run`].

use crate::error::FailureKind;
use crate::model::{NaturalKeyValue, RowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Step of a group's unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    Pending,
    Repointing,
    Removing,
    Committing,
    Committed,
    RolledBack,
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GroupState::Pending => "pending",
            GroupState::Repointing => "repointing",
            GroupState::Removing => "removing",
            GroupState::Committing => "committing",
            GroupState::Committed => "committed",
            GroupState::RolledBack => "rolled_back",
        };
        f.write_str(name)
    }
}

/// A group whose merge was rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedGroup {
    pub key: NaturalKeyValue,
    pub member_ids: Vec<RowId>,
    pub kind: FailureKind,
    /// Step that was running when the group failed.
    pub failed_during: GroupState,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub entity: String,
    pub started_at: DateTime<Utc>,
    pub dry_run: bool,
    pub groups_found: usize,
    pub groups_merged: usize,
    /// Groups never started because the run timed out or was cancelled.
    pub groups_skipped: usize,
    pub rows_repointed: u64,
    pub rows_deleted: u64,
    pub retries: usize,
    pub failed_groups: Vec<FailedGroup>,
    pub warnings: Vec<String>,
    pub interrupted: bool,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl RunReport {
    pub fn new(run_id: Uuid, entity: impl Into<String>, dry_run: bool) -> Self {
        Self {
            run_id,
            entity: entity.into(),
            started_at: Utc::now(),
            dry_run,
            groups_found: 0,
            groups_merged: 0,
            groups_skipped: 0,
            rows_repointed: 0,
            rows_deleted: 0,
            retries: 0,
            failed_groups: Vec::new(),
            warnings: Vec::new(),
            interrupted: false,
            duration: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed_groups.is_empty()
    }

    /// 0 when every group merged, 1 when any group failed.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }

    /// Human readable multi-line summary.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let mode = if self.dry_run { " (dry run)" } else { "" };
        out.push_str(&format!(
            "Reconciled {}{mode} in {:?}: {} group(s) found, {} merged, {} failed, {} skipped\n",
            self.entity,
            self.duration,
            self.groups_found,
            self.groups_merged,
            self.failed_groups.len(),
            self.groups_skipped
        ));
        out.push_str(&format!(
            "Rows repointed: {}, rows deleted: {}, retries: {}\n",
            self.rows_repointed, self.rows_deleted, self.retries
        ));
        if self.interrupted {
            out.push_str("Run interrupted before all groups were processed\n");
        }
        for warning in &self.warnings {
            out.push_str(&format!("warning: {warning}\n"));
        }
        for failed in &self.failed_groups {
            out.push_str(&format!(
                "failed: key {} ids {:?} during {} [{:?}]: {}\n",
                failed.key, failed.member_ids, failed.failed_during, failed.kind, failed.reason
            ));
        }
        out
    }
}
