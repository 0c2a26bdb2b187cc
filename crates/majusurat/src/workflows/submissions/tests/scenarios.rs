use super::common::*;
use std::sync::{Arc, Barrier};
use std::thread;

use crate::workflows::submissions::attachments::FileUpload;
use crate::workflows::submissions::coordinator::LedgerWrite;
use crate::workflows::submissions::domain::{SubmissionStatus, TransitionPayload};
use crate::workflows::submissions::error::WorkflowError;
use crate::workflows::submissions::ledger::replay;

#[test]
fn applicant_submits_a_draft_and_one_entry_is_logged() {
    let harness = Harness::new();
    let draft = harness.create_draft(APPLICANT);
    assert_eq!(draft.status, SubmissionStatus::Draft);
    assert!(harness.ledger.entries().is_empty());

    let outcome = harness
        .transition(&draft.id, APPLICANT, SubmissionStatus::Submitted)
        .expect("submit succeeds");

    assert_eq!(outcome.submission.status, SubmissionStatus::Submitted);
    assert!(matches!(outcome.ledger, LedgerWrite::Recorded { .. }));
    let entries = harness.ledger.entries_for(&draft.id);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].from_status, SubmissionStatus::Draft);
    assert_eq!(entries[0].to_status, SubmissionStatus::Submitted);
    assert_eq!(entries[0].actor, uid(APPLICANT));
    assert_eq!(entries[0].submission_version, outcome.submission.version);
}

#[test]
fn approving_without_a_review_note_changes_nothing() {
    let harness = Harness::new();
    let under_review = harness.submission_in(SubmissionStatus::UnderReview);
    let ledger_before = harness.ledger.entries();

    let err = harness
        .coordinator
        .apply_transition(
            &under_review.id,
            &uid(STAFF),
            command(SubmissionStatus::Approved, TransitionPayload::default()),
        )
        .expect_err("approval without note rejected");

    assert!(matches!(err, WorkflowError::Validation(_)), "got {err:?}");
    assert_eq!(harness.stored(&under_review.id), under_review);
    assert_eq!(harness.ledger.entries(), ledger_before);
}

#[test]
fn stale_caller_loses_the_race_for_review() {
    let store = Arc::new(StaleReadStore::default());
    let harness = Harness::with_parts(store.clone(), fast_policy());
    let submitted = harness.submission_in(SubmissionStatus::Submitted);

    // Both callers loaded the submission at the same version.
    store.freeze(&submitted.id);

    let first = harness.transition(&submitted.id, STAFF, SubmissionStatus::UnderReview);
    let second = harness.transition(&submitted.id, ADMIN, SubmissionStatus::UnderReview);

    assert!(first.is_ok(), "first caller wins: {first:?}");
    match second {
        Err(WorkflowError::ConcurrentModification(id)) => assert_eq!(id, submitted.id),
        other => panic!("expected concurrent modification, got {other:?}"),
    }

    let under_review = harness
        .ledger
        .entries_for(&submitted.id)
        .into_iter()
        .filter(|entry| entry.to_status == SubmissionStatus::UnderReview)
        .count();
    assert_eq!(under_review, 1);
}

#[test]
fn concurrent_reviewers_with_the_same_version_get_one_winner() {
    let harness = Harness::new();
    let submitted = harness.submission_in(SubmissionStatus::Submitted);
    let coordinator = harness.coordinator.clone();
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = [STAFF, ADMIN]
        .into_iter()
        .map(|actor| {
            let coordinator = coordinator.clone();
            let barrier = barrier.clone();
            let id = submitted.id.clone();
            let version = submitted.version;
            thread::spawn(move || {
                let mut request = command(
                    SubmissionStatus::UnderReview,
                    payload_for(SubmissionStatus::UnderReview),
                );
                request.expected_version = Some(version);
                barrier.wait();
                coordinator.apply_transition(&id, &uid(actor), request)
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().expect("thread completes"))
        .collect();

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|result| matches!(result, Err(WorkflowError::ConcurrentModification(_))))
            .count(),
        1
    );
    assert_eq!(harness.ledger.entries_for(&submitted.id).len(), 2);
}

#[test]
fn completion_survives_a_ledger_outage_and_is_logged_after_recovery() {
    let harness = Harness::new();
    let approved = harness.submission_in(SubmissionStatus::Approved);
    let logged_before = harness.ledger.entries_for(&approved.id).len();

    harness.ledger.fail_appends(true);
    let outcome = harness
        .transition(&approved.id, STAFF, SubmissionStatus::Completed)
        .expect("completion commits despite ledger outage");

    assert_eq!(outcome.ledger, LedgerWrite::Queued);
    assert_eq!(outcome.submission.status, SubmissionStatus::Completed);
    assert_eq!(
        harness.stored(&approved.id).status,
        SubmissionStatus::Completed
    );
    assert_eq!(harness.ledger.entries_for(&approved.id).len(), logged_before);

    let report = harness.coordinator.reconcile().expect("reconcile runs");
    assert!(report.anomalies.is_empty());
    assert_eq!(report.pending_retry, vec![approved.id.clone()]);
    assert!(report.repaired.is_empty());

    // Still down: the retry fails and the entry stays queued.
    let drained = harness.queue.flush(harness.ledger.as_ref());
    assert_eq!(drained.failed, 1);
    assert!(harness.queue.has_pending(&approved.id));

    harness.ledger.fail_appends(false);
    let drained = harness.queue.flush(harness.ledger.as_ref());
    assert_eq!(drained.appended, 1);
    assert!(harness.queue.is_empty());

    let entries = harness.ledger.entries_for(&approved.id);
    assert_eq!(entries.len(), logged_before + 1);
    let last = entries.last().expect("completion entry");
    assert_eq!(last.from_status, SubmissionStatus::Approved);
    assert_eq!(last.to_status, SubmissionStatus::Completed);
    assert_eq!(
        replay(&entries).expect("history replays").status,
        SubmissionStatus::Completed
    );

    let report = harness.coordinator.reconcile().expect("reconcile runs");
    assert!(report.is_clean());
}

#[test]
fn uploads_to_completed_submissions_are_refused() {
    let harness = Harness::new();
    let completed = harness.submission_in(SubmissionStatus::Completed);

    let err = harness
        .attachments
        .attach(
            &completed.id,
            FileUpload {
                file_name: "ktp.pdf".to_string(),
                content: b"%PDF-1.4".to_vec(),
            },
            &uid(APPLICANT),
        )
        .expect_err("closed submission refuses uploads");

    assert!(matches!(
        err,
        WorkflowError::SubmissionClosed {
            status: SubmissionStatus::Completed,
            ..
        }
    ));
    assert!(harness
        .attachments
        .list(&completed.id, &uid(STAFF))
        .expect("listing works")
        .is_empty());
}
