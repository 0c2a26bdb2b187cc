use crate::infra::{build_workflow, WorkflowStack};
use clap::{Args, ValueEnum};
use majusurat::error::AppError;
use majusurat::workflows::submissions::{
    AuditLedger, CreateSubmission, FileUpload, InMemoryAuditLedger, InMemoryUploadStore,
    LetterType, LogEntry, NewLogEntry, ReconciliationReport, RetryPolicy, StoreError, Submission,
    SubmissionId, SubmissionStatus, TransitionCommand, TransitionPayload, User, UserId, UserRole,
    WorkflowError,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const APPLICANT: &str = "warga-1";
const STAFF: &str = "petugas-1";
const ADMIN: &str = "admin";

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Run a single scenario instead of all five
    #[arg(long, value_enum)]
    pub(crate) scenario: Option<Scenario>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum Scenario {
    /// Applicant submits a draft
    A,
    /// Approval without a review note
    B,
    /// Two reviewers race on the same version
    C,
    /// Ledger outage during completion
    D,
    /// Upload to a completed submission
    E,
}

impl Scenario {
    const ALL: [Scenario; 5] = [Scenario::A, Scenario::B, Scenario::C, Scenario::D, Scenario::E];
}

/// In-memory ledger that can be taken offline to show the retry path.
#[derive(Default)]
struct SwitchableLedger {
    inner: InMemoryAuditLedger,
    offline: AtomicBool,
}

impl SwitchableLedger {
    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

impl AuditLedger for SwitchableLedger {
    fn append(&self, entry: NewLogEntry) -> Result<LogEntry, StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("audit database unreachable".to_string()));
        }
        self.inner.append(entry)
    }

    fn append_after(&self, expected_tail: u64, entry: NewLogEntry) -> Result<LogEntry, StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("audit database unreachable".to_string()));
        }
        self.inner.append_after(expected_tail, entry)
    }

    fn list_by_submission(&self, id: &SubmissionId) -> Result<Vec<LogEntry>, StoreError> {
        self.inner.list_by_submission(id)
    }
}

struct Demo {
    stack: WorkflowStack,
    ledger: Arc<SwitchableLedger>,
}

pub(crate) fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let scenarios = match args.scenario {
        Some(scenario) => vec![scenario],
        None => Scenario::ALL.to_vec(),
    };

    println!("Letter request workflow demo");
    for scenario in scenarios {
        // Fresh stores per scenario keep the printed ledgers short.
        let demo = Demo::new();
        match scenario {
            Scenario::A => demo.submit_draft()?,
            Scenario::B => demo.approve_without_note()?,
            Scenario::C => demo.racing_reviewers()?,
            Scenario::D => demo.ledger_outage()?,
            Scenario::E => demo.upload_after_completion()?,
        }
    }
    Ok(())
}

impl Demo {
    fn new() -> Self {
        let ledger = Arc::new(SwitchableLedger::default());
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            ..RetryPolicy::default()
        };
        let stack = build_workflow(
            policy,
            ADMIN,
            demo_users(),
            ledger.clone(),
            Arc::new(InMemoryUploadStore::default()),
        );
        Self { stack, ledger }
    }

    fn submit_draft(&self) -> Result<(), AppError> {
        println!("\nScenario A: applicant submits a draft");
        let draft = self.create_draft()?;
        println!("- created {} as {}", draft.id, draft.status);
        let submitted = self.transition(&draft.id, APPLICANT, SubmissionStatus::Submitted)?;
        println!("- {} is now {}", submitted.id, submitted.status);
        self.print_ledger(&draft.id)
    }

    fn approve_without_note(&self) -> Result<(), AppError> {
        println!("\nScenario B: approval without a review note");
        let submission = self.advance(&[
            (SubmissionStatus::Submitted, APPLICANT),
            (SubmissionStatus::UnderReview, STAFF),
        ])?;
        let result = self.stack.services.coordinator.apply_transition(
            &submission.id,
            &UserId(STAFF.to_string()),
            command(SubmissionStatus::Approved, TransitionPayload::default()),
        );
        match result {
            Err(err) => println!("- refused with {} ({err})", err.status_code()),
            Ok(outcome) => println!("- unexpectedly moved to {}", outcome.submission.status),
        }
        let stored = self.get(&submission.id)?;
        println!("- still {} at version {}", stored.status, stored.version);
        self.print_ledger(&submission.id)
    }

    fn racing_reviewers(&self) -> Result<(), AppError> {
        println!("\nScenario C: two reviewers race on the same version");
        let submission = self.advance(&[(SubmissionStatus::Submitted, APPLICANT)])?;
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = [STAFF, ADMIN]
            .into_iter()
            .map(|actor| {
                let coordinator = self.stack.services.coordinator.clone();
                let barrier = barrier.clone();
                let id = submission.id.clone();
                let mut request = command(
                    SubmissionStatus::UnderReview,
                    TransitionPayload {
                        reviewer: Some(UserId(actor.to_string())),
                        ..TransitionPayload::default()
                    },
                );
                request.expected_version = Some(submission.version);
                thread::spawn(move || {
                    barrier.wait();
                    (actor, coordinator.apply_transition(&id, &UserId(actor.to_string()), request))
                })
            })
            .collect();

        for handle in handles {
            match handle.join() {
                Ok((actor, Ok(outcome))) => {
                    println!("- {actor} won: now {}", outcome.submission.status)
                }
                Ok((actor, Err(err))) => println!("- {actor} lost: {err}"),
                Err(_) => println!("- reviewer thread panicked"),
            }
        }
        self.print_ledger(&submission.id)
    }

    fn ledger_outage(&self) -> Result<(), AppError> {
        println!("\nScenario D: ledger outage during completion");
        let submission = self.advance(&[
            (SubmissionStatus::Submitted, APPLICANT),
            (SubmissionStatus::UnderReview, STAFF),
            (SubmissionStatus::Approved, STAFF),
        ])?;

        self.ledger.set_offline(true);
        let outcome = self.stack.services.coordinator.apply_transition(
            &submission.id,
            &UserId(STAFF.to_string()),
            command(
                SubmissionStatus::Completed,
                TransitionPayload {
                    issuance_reference: Some("470/031/DS/2025".to_string()),
                    ..TransitionPayload::default()
                },
            ),
        )?;
        println!(
            "- committed {} with ledger write {:?}",
            outcome.submission.status, outcome.ledger
        );
        print_report(&self.stack.services.coordinator.reconcile()?);

        self.ledger.set_offline(false);
        let drained = self.stack.queue.flush(self.stack.ledger.as_ref());
        println!(
            "- ledger back online: {} appended, {} still queued",
            drained.appended,
            self.stack.queue.len()
        );
        self.print_ledger(&submission.id)?;
        print_report(&self.stack.services.coordinator.reconcile()?);
        Ok(())
    }

    fn upload_after_completion(&self) -> Result<(), AppError> {
        println!("\nScenario E: upload to a completed submission");
        let submission = self.advance(&[
            (SubmissionStatus::Submitted, APPLICANT),
            (SubmissionStatus::UnderReview, STAFF),
            (SubmissionStatus::Approved, STAFF),
            (SubmissionStatus::Completed, STAFF),
        ])?;
        let result = self.stack.services.attachments.attach(
            &submission.id,
            FileUpload {
                file_name: "surat-pengantar-rt.pdf".to_string(),
                content: b"%PDF-1.7 demo".to_vec(),
            },
            &UserId(APPLICANT.to_string()),
        );
        match result {
            Err(err @ WorkflowError::SubmissionClosed { .. }) => println!("- refused: {err}"),
            Err(err) => return Err(err.into()),
            Ok(attachment) => println!("- unexpectedly stored {}", attachment.storage_path),
        }
        let stored = self
            .stack
            .services
            .attachments
            .list(&submission.id, &UserId(STAFF.to_string()))?;
        println!("- attachments on file: {}", stored.len());
        Ok(())
    }

    fn create_draft(&self) -> Result<Submission, AppError> {
        let outcome = self.stack.services.coordinator.create(
            &UserId(APPLICANT.to_string()),
            CreateSubmission {
                letter_type: LetterType::Business,
                fields: demo_fields(),
                submit: false,
            },
        )?;
        Ok(outcome.submission)
    }

    fn advance(&self, path: &[(SubmissionStatus, &str)]) -> Result<Submission, AppError> {
        let mut current = self.create_draft()?;
        for (to, actor) in path {
            current = self.transition(&current.id, actor, *to)?;
        }
        Ok(current)
    }

    fn transition(
        &self,
        id: &SubmissionId,
        actor: &str,
        to: SubmissionStatus,
    ) -> Result<Submission, AppError> {
        let mut payload = TransitionPayload::default();
        match to {
            SubmissionStatus::UnderReview => payload.reviewer = Some(UserId(STAFF.to_string())),
            SubmissionStatus::Approved => payload.note = Some("dokumen sesuai".to_string()),
            SubmissionStatus::Rejected => payload.reason = Some("data tidak valid".to_string()),
            SubmissionStatus::Completed => {
                payload.issuance_reference = Some("470/030/DS/2025".to_string())
            }
            SubmissionStatus::Draft | SubmissionStatus::Submitted => {}
        }
        let outcome = self.stack.services.coordinator.apply_transition(
            id,
            &UserId(actor.to_string()),
            command(to, payload),
        )?;
        Ok(outcome.submission)
    }

    fn get(&self, id: &SubmissionId) -> Result<Submission, AppError> {
        Ok(self
            .stack
            .services
            .coordinator
            .get(id, &UserId(ADMIN.to_string()))?)
    }

    fn print_ledger(&self, id: &SubmissionId) -> Result<(), AppError> {
        let entries = self
            .stack
            .services
            .coordinator
            .audit_log(id, &UserId(ADMIN.to_string()))?;
        println!("  Ledger for {id}:");
        for entry in entries {
            println!(
                "    #{} v{} {} -> {} by {}{}",
                entry.id,
                entry.submission_version,
                entry.from_status,
                entry.to_status,
                entry.actor,
                entry
                    .note
                    .map(|note| format!(" ({note})"))
                    .unwrap_or_default()
            );
        }
        Ok(())
    }
}

fn print_report(report: &ReconciliationReport) {
    println!(
        "  Reconciliation: {} checked | {} consistent | {} repaired | {} pending retry | {} anomalies",
        report.checked,
        report.consistent,
        report.repaired.len(),
        report.pending_retry.len(),
        report.anomalies.len()
    );
}

fn command(status: SubmissionStatus, payload: TransitionPayload) -> TransitionCommand {
    TransitionCommand {
        status,
        expected_version: None,
        payload,
    }
}

fn demo_users() -> Vec<User> {
    vec![
        User {
            id: UserId(APPLICANT.to_string()),
            display_name: "Siti Aminah".to_string(),
            role: UserRole::Applicant,
        },
        User {
            id: UserId(STAFF.to_string()),
            display_name: "Petugas Pelayanan".to_string(),
            role: UserRole::Staff,
        },
    ]
}

fn demo_fields() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("nik".to_string(), "3201010101900001".to_string()),
        ("purpose".to_string(), "Pengajuan KUR".to_string()),
        ("business_name".to_string(), "Warung Sembako Amanah".to_string()),
        ("business_address".to_string(), "Jl. Melati No. 4".to_string()),
    ])
}
