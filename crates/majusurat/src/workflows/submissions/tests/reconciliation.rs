use super::common::*;

use chrono::Utc;

use crate::workflows::submissions::coordinator::LedgerWrite;
use crate::workflows::submissions::domain::{LogEntryKind, NewLogEntry, SubmissionStatus};
use crate::workflows::submissions::ledger::{replay, AuditLedger};
use crate::workflows::submissions::reconciliation::RECONCILER_ACTOR;

#[test]
fn clean_stores_reconcile_without_changes() {
    let harness = Harness::new();
    harness.submission_in(SubmissionStatus::Completed);
    harness.submission_in(SubmissionStatus::Draft);
    let before = harness.ledger.entries();

    let report = harness.coordinator.reconcile().expect("reconcile");
    assert_eq!(report.checked, 2);
    assert!(report.is_clean());
    assert_eq!(harness.ledger.entries(), before);
}

#[test]
fn ledger_past_the_store_is_flagged_and_left_alone() {
    let harness = Harness::new();
    let submitted = harness.submission_in(SubmissionStatus::Submitted);
    harness
        .ledger
        .append(NewLogEntry {
            submission_id: submitted.id.clone(),
            from_status: SubmissionStatus::Submitted,
            to_status: SubmissionStatus::UnderReview,
            actor: uid(STAFF),
            recorded_at: Utc::now(),
            note: None,
            submission_version: submitted.version + 1,
            kind: LogEntryKind::Transition,
        })
        .expect("forged entry");

    let report = harness.coordinator.reconcile().expect("reconcile");
    assert_eq!(report.anomalies.len(), 1);
    let anomaly = &report.anomalies[0];
    assert_eq!(anomaly.submission_id, submitted.id);
    assert_eq!(anomaly.ledger_status, Some(SubmissionStatus::UnderReview));
    assert!(report.repaired.is_empty());
    assert_eq!(harness.stored(&submitted.id), submitted);
}

#[test]
fn broken_history_is_an_anomaly() {
    let harness = Harness::new();
    let draft = harness.create_draft(APPLICANT);
    harness
        .ledger
        .append(NewLogEntry {
            submission_id: draft.id.clone(),
            from_status: SubmissionStatus::Approved,
            to_status: SubmissionStatus::Completed,
            actor: uid(STAFF),
            recorded_at: Utc::now(),
            note: None,
            submission_version: 1,
            kind: LogEntryKind::Transition,
        })
        .expect("forged entry");

    let report = harness.coordinator.reconcile().expect("reconcile");
    assert_eq!(report.anomalies.len(), 1);
    assert_eq!(report.anomalies[0].ledger_status, None);
    assert_eq!(harness.stored(&draft.id), draft);
}

#[test]
fn exhausted_writes_are_handed_to_reconciliation() {
    let harness = Harness::new();
    let under_review = harness.submission_in(SubmissionStatus::UnderReview);

    harness.ledger.fail_appends(true);
    harness
        .transition(&under_review.id, STAFF, SubmissionStatus::Approved)
        .expect("approval commits");

    let max_attempts = harness.queue.policy().max_attempts;
    let mut exhausted = 0;
    for _ in 0..max_attempts {
        exhausted += harness.queue.flush(harness.ledger.as_ref()).exhausted;
    }
    assert_eq!(exhausted, 1);
    assert!(!harness.queue.has_pending(&under_review.id));
    assert!(harness.queue.has_lost_write(&under_review.id));

    // Catch-up fails while the ledger is still down; the lost write stays visible.
    let report = harness.coordinator.reconcile().expect("reconcile");
    assert_eq!(report.unresolved.len(), 1);
    assert!(report.recovered.is_empty());
    assert!(report.anomalies.is_empty());
    assert_eq!(harness.queue.snapshot().exhausted.len(), 1);

    harness.ledger.fail_appends(false);
    let report = harness.coordinator.reconcile().expect("reconcile");
    assert_eq!(report.repaired, vec![under_review.id.clone()]);
    assert_eq!(report.recovered.len(), 1);
    assert_eq!(
        report.recovered[0].entry.to_status,
        SubmissionStatus::Approved
    );
    let snapshot = harness.queue.snapshot();
    assert!(snapshot.exhausted.is_empty());
    assert!(snapshot.lost.is_empty());

    let entries = harness.ledger.entries_for(&under_review.id);
    let last = entries.last().expect("catch-up entry");
    assert_eq!(last.kind, LogEntryKind::Reconciliation);
    assert_eq!(last.actor, uid(RECONCILER_ACTOR));
    assert_eq!(
        replay(&entries).expect("replays").status,
        SubmissionStatus::Approved
    );

    let report = harness.coordinator.reconcile().expect("reconcile");
    assert!(report.is_clean());
}

#[test]
fn transitions_after_a_lost_write_wait_for_catch_up() {
    let harness = Harness::new();
    let submitted = harness.submission_in(SubmissionStatus::Submitted);

    harness.ledger.fail_appends(true);
    harness
        .transition(&submitted.id, STAFF, SubmissionStatus::UnderReview)
        .expect("review starts");
    for _ in 0..harness.queue.policy().max_attempts {
        harness.queue.flush(harness.ledger.as_ref());
    }
    assert!(harness.queue.has_lost_write(&submitted.id));

    // The ledger is back, but appending the approval now would skip the lost review entry.
    harness.ledger.fail_appends(false);
    let outcome = harness
        .transition(&submitted.id, STAFF, SubmissionStatus::Approved)
        .expect("approval commits");
    assert_eq!(outcome.ledger, LedgerWrite::Deferred);
    assert_eq!(harness.ledger.entries_for(&submitted.id).len(), 1);

    let report = harness.coordinator.reconcile().expect("reconcile");
    assert!(report.anomalies.is_empty());
    assert_eq!(report.repaired, vec![submitted.id.clone()]);

    let entries = harness.ledger.entries_for(&submitted.id);
    let replayed = replay(&entries).expect("history stays continuous");
    let stored = harness.stored(&submitted.id);
    assert_eq!(replayed.status, SubmissionStatus::Approved);
    assert_eq!(replayed.version, stored.version);

    // Once caught up, transitions are logged directly again.
    let outcome = harness
        .transition(&submitted.id, STAFF, SubmissionStatus::Completed)
        .expect("completion commits");
    assert!(matches!(outcome.ledger, LedgerWrite::Recorded { .. }));
    assert!(harness.coordinator.reconcile().expect("reconcile").is_clean());
}

#[test]
fn catch_up_yields_to_a_transition_logged_mid_pass() {
    let harness = Harness::new();
    let submitted = harness.submission_in(SubmissionStatus::Submitted);

    // Commit and log the review right after reconciliation has read the ledger, before it
    // loads the submission.
    let coordinator = harness.coordinator.clone();
    let id = submitted.id.clone();
    harness.ledger.after_next_read(move || {
        let outcome = coordinator
            .apply_transition(
                &id,
                &uid(STAFF),
                command(
                    SubmissionStatus::UnderReview,
                    payload_for(SubmissionStatus::UnderReview),
                ),
            )
            .expect("review starts mid-pass");
        assert!(matches!(outcome.ledger, LedgerWrite::Recorded { .. }));
    });

    let report = harness.coordinator.reconcile().expect("reconcile");
    assert!(report.anomalies.is_empty());
    assert!(report.repaired.is_empty());
    assert_eq!(report.moved, vec![submitted.id.clone()]);

    let entries = harness.ledger.entries_for(&submitted.id);
    assert_eq!(entries.len(), 2);
    assert!(entries
        .iter()
        .all(|entry| entry.kind == LogEntryKind::Transition));
    assert_eq!(
        replay(&entries).expect("no duplicate entry").status,
        SubmissionStatus::UnderReview
    );
    assert!(harness.coordinator.reconcile().expect("reconcile").is_clean());
}

#[test]
fn unreadable_ledger_leaves_submissions_unresolved() {
    let harness = Harness::new();
    harness.submission_in(SubmissionStatus::Submitted);
    harness.ledger.fail_reads(true);

    let report = harness.coordinator.reconcile().expect("reconcile");
    assert_eq!(report.unresolved.len(), 1);
    assert!(report.unresolved[0].reason.contains("ledger unreadable"));
    assert!(report.anomalies.is_empty());
}

#[test]
fn queued_writes_drop_when_the_ledger_already_holds_them() {
    let harness = Harness::new();
    let submitted = harness.submission_in(SubmissionStatus::Submitted);

    harness.ledger.fail_appends(true);
    harness
        .transition(&submitted.id, STAFF, SubmissionStatus::UnderReview)
        .expect("review starts");
    harness.ledger.fail_appends(false);

    // An operator appends the missing entry by hand while the write is still queued.
    harness
        .ledger
        .append(NewLogEntry {
            submission_id: submitted.id.clone(),
            from_status: SubmissionStatus::Submitted,
            to_status: SubmissionStatus::UnderReview,
            actor: uid(ADMIN),
            recorded_at: Utc::now(),
            note: Some("manual repair".to_string()),
            submission_version: submitted.version + 1,
            kind: LogEntryKind::Reconciliation,
        })
        .expect("manual entry");

    let drained = harness.queue.flush(harness.ledger.as_ref());
    assert_eq!(drained.already_recorded, 1);
    assert_eq!(drained.appended, 0);
    assert_eq!(harness.ledger.entries_for(&submitted.id).len(), 2);
}
