//! Directional reconciliation between the submission store and the audit ledger.
//!
//! Under write-then-log ordering the ledger can only lag. A lagging ledger is caught up with a
//! synthesized entry; anything else is reported and left for an operator.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::coordinator::SubmissionCoordinator;
use super::domain::{
    LogEntry, LogEntryKind, NewLogEntry, Submission, SubmissionId, SubmissionStatus, UserId,
};
use super::error::WorkflowError;
use super::ledger::{replay, ReplayError};
use super::retry::PendingLedgerWrite;
use super::store::{StoreError, SubmissionFilter};

/// Actor recorded on catch-up entries.
pub const RECONCILER_ACTOR: &str = "system:reconciler";

/// How a submission's ledger history relates to its stored state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drift {
    Consistent,
    Behind {
        ledger_status: SubmissionStatus,
        ledger_version: u64,
    },
    Ahead {
        ledger_status: SubmissionStatus,
        ledger_version: u64,
    },
    Diverged {
        ledger_status: SubmissionStatus,
        ledger_version: u64,
    },
    Unreplayable(ReplayError),
}

/// Compares one submission against its ledger history. Pure.
pub fn classify(submission: &Submission, entries: &[LogEntry]) -> Drift {
    let state = match replay(entries) {
        Ok(state) => state,
        Err(err) => return Drift::Unreplayable(err),
    };

    if state.version > submission.version {
        Drift::Ahead {
            ledger_status: state.status,
            ledger_version: state.version,
        }
    } else if state.status == submission.status {
        Drift::Consistent
    } else if state.version == submission.version {
        Drift::Diverged {
            ledger_status: state.status,
            ledger_version: state.version,
        }
    } else {
        Drift::Behind {
            ledger_status: state.status,
            ledger_version: state.version,
        }
    }
}

/// Ledger state that reconciliation refuses to fix automatically.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerAnomaly {
    pub submission_id: SubmissionId,
    pub submission_status: SubmissionStatus,
    pub submission_version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_status: Option<SubmissionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_version: Option<u64>,
    pub detail: String,
}

/// A lagging submission the pass could not catch up this time.
#[derive(Debug, Clone, Serialize)]
pub struct UnresolvedDrift {
    pub submission_id: SubmissionId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub started_at: DateTime<Utc>,
    pub checked: usize,
    pub consistent: usize,
    /// Submissions that received a catch-up entry during this pass.
    pub repaired: Vec<SubmissionId>,
    /// Lagging submissions whose queued writes are still being retried.
    pub pending_retry: Vec<SubmissionId>,
    pub unresolved: Vec<UnresolvedDrift>,
    pub anomalies: Vec<LedgerAnomaly>,
    /// Lagging submissions whose ledger advanced during this pass; the next pass re-checks them.
    pub moved: Vec<SubmissionId>,
    /// Exhausted retry-queue writes whose gap this pass closed.
    pub recovered: Vec<PendingLedgerWrite>,
}

impl ReconciliationReport {
    /// True when every checked submission is already consistent.
    pub fn is_clean(&self) -> bool {
        self.checked == self.consistent
    }
}

impl SubmissionCoordinator {
    /// Runs a single reconciliation pass over every submission.
    pub fn reconcile(&self) -> Result<ReconciliationReport, WorkflowError> {
        let ids: Vec<SubmissionId> = self
            .submissions()
            .list(&SubmissionFilter::default())?
            .into_iter()
            .map(|submission| submission.id)
            .collect();

        let mut report = ReconciliationReport {
            started_at: Utc::now(),
            checked: 0,
            consistent: 0,
            repaired: Vec::new(),
            pending_retry: Vec::new(),
            unresolved: Vec::new(),
            anomalies: Vec::new(),
            moved: Vec::new(),
            recovered: Vec::new(),
        };

        for id in ids {
            report.checked += 1;
            self.reconcile_one(&id, &mut report);
        }

        if report.anomalies.is_empty() {
            info!(
                checked = report.checked,
                consistent = report.consistent,
                repaired = report.repaired.len(),
                pending = report.pending_retry.len(),
                "reconciliation pass finished"
            );
        } else {
            error!(
                checked = report.checked,
                anomalies = report.anomalies.len(),
                "reconciliation pass found ledger anomalies"
            );
        }

        Ok(report)
    }

    fn reconcile_one(&self, id: &SubmissionId, report: &mut ReconciliationReport) {
        // Ledger before submission: a concurrent commit can then only make the ledger look
        // behind, never ahead.
        let entries = match self.ledger().list_by_submission(id) {
            Ok(entries) => entries,
            Err(err) => {
                report.unresolved.push(UnresolvedDrift {
                    submission_id: id.clone(),
                    reason: format!("ledger unreadable: {err}"),
                });
                return;
            }
        };
        let submission = match self.load(id) {
            Ok(submission) => submission,
            Err(err) => {
                report.unresolved.push(UnresolvedDrift {
                    submission_id: id.clone(),
                    reason: err.to_string(),
                });
                return;
            }
        };

        match classify(&submission, &entries) {
            Drift::Consistent => {
                report.consistent += 1;
                // A write reported lost may still have landed.
                let resolved = self.retry_queue().resolve_lost(id);
                report.recovered.extend(resolved);
            }
            Drift::Behind {
                ledger_status,
                ledger_version,
            } => {
                if self.retry_queue().has_pending(id) {
                    report.pending_retry.push(id.clone());
                    return;
                }
                self.catch_up(&submission, ledger_status, ledger_version, report);
            }
            Drift::Ahead {
                ledger_status,
                ledger_version,
            } => report.anomalies.push(anomaly(
                &submission,
                Some((ledger_status, ledger_version)),
                format!("ledger records version {ledger_version}, beyond the stored submission"),
            )),
            Drift::Diverged {
                ledger_status,
                ledger_version,
            } => report.anomalies.push(anomaly(
                &submission,
                Some((ledger_status, ledger_version)),
                format!("ledger records {ledger_status} at the same version as the stored submission"),
            )),
            Drift::Unreplayable(err) => {
                report
                    .anomalies
                    .push(anomaly(&submission, None, err.to_string()))
            }
        }
    }

    fn catch_up(
        &self,
        submission: &Submission,
        ledger_status: SubmissionStatus,
        ledger_version: u64,
        report: &mut ReconciliationReport,
    ) {
        let entry = NewLogEntry {
            submission_id: submission.id.clone(),
            from_status: ledger_status,
            to_status: submission.status,
            actor: UserId(RECONCILER_ACTOR.to_string()),
            recorded_at: Utc::now(),
            note: Some(format!(
                "reconciliation: ledger caught up from version {ledger_version} to {}",
                submission.version
            )),
            submission_version: submission.version,
            kind: LogEntryKind::Reconciliation,
        };

        // Conditional on the tail this pass read, so a concurrent append wins instead of
        // being duplicated.
        match self.ledger().append_after(ledger_version, entry) {
            Ok(stored) => {
                info!(
                    submission_id = %submission.id,
                    entry_id = stored.id,
                    from = %ledger_status,
                    to = %submission.status,
                    "ledger caught up by reconciliation"
                );
                report.repaired.push(submission.id.clone());
                let resolved = self.retry_queue().resolve_lost(&submission.id);
                report.recovered.extend(resolved);
            }
            Err(StoreError::VersionConflict { found, .. }) => {
                info!(
                    submission_id = %submission.id,
                    read_version = ledger_version,
                    ledger_version = found,
                    "ledger moved during reconciliation; skipping catch-up"
                );
                report.moved.push(submission.id.clone());
            }
            Err(err) => {
                warn!(submission_id = %submission.id, error = %err, "catch-up append failed");
                report.unresolved.push(UnresolvedDrift {
                    submission_id: submission.id.clone(),
                    reason: format!("catch-up append failed: {err}"),
                });
            }
        }
    }
}

fn anomaly(
    submission: &Submission,
    ledger: Option<(SubmissionStatus, u64)>,
    detail: String,
) -> LedgerAnomaly {
    error!(
        submission_id = %submission.id,
        status = %submission.status,
        version = submission.version,
        detail = %detail,
        "ledger anomaly requires manual inspection"
    );
    LedgerAnomaly {
        submission_id: submission.id.clone(),
        submission_status: submission.status,
        submission_version: submission.version,
        ledger_status: ledger.map(|(status, _)| status),
        ledger_version: ledger.map(|(_, version)| version),
        detail,
    }
}

/// Spawns the periodic reconciliation pass.
pub fn spawn_reconciliation_worker(
    coordinator: Arc<SubmissionCoordinator>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // first tick is immediate
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(err) = coordinator.reconcile() {
                warn!(error = %err, "reconciliation pass aborted");
            }
        }
    })
}
