//! Bounded retry queue for ledger appends that failed after the submission write committed.
//!
//! Entries for one submission are retried strictly in the order they were queued so the
//! ledger never records a later transition before an earlier one.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::domain::{NewLogEntry, SubmissionId};
use super::ledger::{tail_version, AuditLedger};
use super::store::StoreError;

/// Backoff and sizing knobs for the retry queue.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub capacity: usize,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            capacity: 1024,
            max_attempts: 8,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryQueueError {
    #[error("ledger retry queue is full ({capacity} pending writes)")]
    Full { capacity: usize },
    #[error("an earlier ledger write for submission {0} was lost; reconciliation must catch it up first")]
    EarlierWriteLost(SubmissionId),
}

/// A ledger append waiting for the audit store to come back.
#[derive(Debug, Clone, Serialize)]
pub struct PendingLedgerWrite {
    pub entry: NewLogEntry,
    pub attempts: u32,
    pub last_error: Option<String>,
    #[serde(skip)]
    ticket: u64,
    #[serde(skip)]
    next_attempt_at: Instant,
    #[serde(skip)]
    in_flight: bool,
}

/// Outcome counters for one drain round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub appended: usize,
    /// Entries dropped because the ledger already held an entry at or past their version.
    pub already_recorded: usize,
    pub failed: usize,
    pub exhausted: usize,
}

/// Point-in-time view for operators.
#[derive(Debug, Clone, Serialize)]
pub struct RetryQueueSnapshot {
    pub capacity: usize,
    pub depth: usize,
    pub in_flight: usize,
    pub overflowed: u64,
    pub pending: Vec<PendingLedgerWrite>,
    /// Writes that ran out of attempts and still wait for a reconciliation catch-up.
    pub exhausted: Vec<PendingLedgerWrite>,
    /// Submissions with a dropped or exhausted write.
    pub lost: Vec<SubmissionId>,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<PendingLedgerWrite>,
    exhausted: Vec<PendingLedgerWrite>,
    lost: BTreeSet<SubmissionId>,
    next_ticket: u64,
    overflowed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backoff {
    Respect,
    Ignore,
}

enum Outcome {
    Appended,
    AlreadyRecorded,
    Failed(String),
    Skipped,
}

#[derive(Debug)]
pub struct LedgerRetryQueue {
    policy: RetryPolicy,
    state: Mutex<QueueState>,
}

impl LedgerRetryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Every mutation completes under one guard; a poisoned lock still holds a valid queue.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues a failed append. The first retry waits one base delay.
    ///
    /// A submission whose earlier write was lost takes no further entries: appending them
    /// would leave a hole in its history. Overflow marks the submission as lost.
    pub fn enqueue(&self, entry: NewLogEntry, cause: &str) -> Result<(), RetryQueueError> {
        let mut state = self.lock();
        if state.lost.contains(&entry.submission_id) {
            return Err(RetryQueueError::EarlierWriteLost(entry.submission_id));
        }
        if state.entries.len() >= self.policy.capacity {
            state.overflowed += 1;
            state.lost.insert(entry.submission_id);
            return Err(RetryQueueError::Full {
                capacity: self.policy.capacity,
            });
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.entries.push_back(PendingLedgerWrite {
            entry,
            attempts: 0,
            last_error: Some(cause.to_string()),
            ticket,
            next_attempt_at: Instant::now() + self.policy.delay_for(0),
            in_flight: false,
        });
        Ok(())
    }

    /// True while any write for `id` is queued or being retried.
    pub fn has_pending(&self, id: &SubmissionId) -> bool {
        self.lock()
            .entries
            .iter()
            .any(|pending| &pending.entry.submission_id == id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once a write for `id` was dropped or exhausted and no catch-up has closed the gap.
    pub fn has_lost_write(&self, id: &SubmissionId) -> bool {
        self.lock().lost.contains(id)
    }

    /// Clears the lost mark for `id` after its ledger caught up and returns the exhausted
    /// writes that were waiting on it.
    pub fn resolve_lost(&self, id: &SubmissionId) -> Vec<PendingLedgerWrite> {
        let mut state = self.lock();
        if !state.lost.remove(id) {
            return Vec::new();
        }
        let (resolved, kept): (Vec<_>, Vec<_>) = state
            .exhausted
            .drain(..)
            .partition(|pending| &pending.entry.submission_id == id);
        state.exhausted = kept;
        resolved
    }

    pub fn snapshot(&self) -> RetryQueueSnapshot {
        let state = self.lock();
        RetryQueueSnapshot {
            capacity: self.policy.capacity,
            depth: state.entries.len(),
            in_flight: state.entries.iter().filter(|pending| pending.in_flight).count(),
            overflowed: state.overflowed,
            pending: state.entries.iter().cloned().collect(),
            exhausted: state.exhausted.clone(),
            lost: state.lost.iter().cloned().collect(),
        }
    }

    /// Retries every write whose backoff has elapsed.
    pub fn drain_due(&self, ledger: &dyn AuditLedger) -> DrainReport {
        self.drain(ledger, Backoff::Respect)
    }

    /// Retries every queued write regardless of its backoff schedule.
    pub fn flush(&self, ledger: &dyn AuditLedger) -> DrainReport {
        self.drain(ledger, Backoff::Ignore)
    }

    fn drain(&self, ledger: &dyn AuditLedger, backoff: Backoff) -> DrainReport {
        let batches = self.claim(Instant::now(), backoff);
        if batches.is_empty() {
            return DrainReport::default();
        }

        let mut outcomes = Vec::new();
        for (submission_id, batch) in batches {
            attempt_batch(ledger, &submission_id, batch, &mut outcomes);
        }

        // Backoff is scheduled from when the attempts finished.
        self.settle(outcomes, Instant::now())
    }

    /// Marks the head of every submission's queue (plus its queued successors) in flight.
    fn claim(
        &self,
        now: Instant,
        backoff: Backoff,
    ) -> BTreeMap<SubmissionId, Vec<PendingLedgerWrite>> {
        let mut state = self.lock();
        let mut blocked: HashSet<SubmissionId> = HashSet::new();
        let mut batches: BTreeMap<SubmissionId, Vec<PendingLedgerWrite>> = BTreeMap::new();

        for pending in state.entries.iter_mut() {
            let id = &pending.entry.submission_id;
            if blocked.contains(id) {
                continue;
            }
            let is_head = !batches.contains_key(id);
            let waiting = backoff == Backoff::Respect && pending.next_attempt_at > now;
            if pending.in_flight || (is_head && waiting) {
                blocked.insert(id.clone());
                continue;
            }
            pending.in_flight = true;
            batches.entry(id.clone()).or_default().push(pending.clone());
        }

        batches
    }

    fn settle(&self, outcomes: Vec<(u64, Outcome)>, now: Instant) -> DrainReport {
        let mut report = DrainReport::default();
        let mut state = self.lock();
        let mut exhausted_submissions: HashSet<SubmissionId> = HashSet::new();

        for (ticket, outcome) in outcomes {
            let Some(position) = state.entries.iter().position(|p| p.ticket == ticket) else {
                continue;
            };
            match outcome {
                Outcome::Appended => {
                    report.appended += 1;
                    state.entries.remove(position);
                }
                Outcome::AlreadyRecorded => {
                    report.already_recorded += 1;
                    state.entries.remove(position);
                }
                Outcome::Skipped => {
                    state.entries[position].in_flight = false;
                }
                Outcome::Failed(cause) => {
                    report.failed += 1;
                    let pending = &mut state.entries[position];
                    pending.in_flight = false;
                    pending.attempts += 1;
                    pending.last_error = Some(cause);
                    if pending.attempts >= self.policy.max_attempts {
                        exhausted_submissions.insert(pending.entry.submission_id.clone());
                    } else {
                        pending.next_attempt_at = now + self.policy.delay_for(pending.attempts);
                    }
                }
            }
        }

        if !exhausted_submissions.is_empty() {
            let (exhausted, kept): (Vec<_>, Vec<_>) = state
                .entries
                .drain(..)
                .partition(|p| exhausted_submissions.contains(&p.entry.submission_id));
            state.entries = kept.into();
            for mut pending in exhausted {
                pending.in_flight = false;
                warn!(
                    submission_id = %pending.entry.submission_id,
                    version = pending.entry.submission_version,
                    attempts = pending.attempts,
                    "ledger write exhausted its retry budget; leaving it to reconciliation"
                );
                report.exhausted += 1;
                state.lost.insert(pending.entry.submission_id.clone());
                state.exhausted.push(pending);
            }
        }

        report
    }
}

fn attempt_batch(
    ledger: &dyn AuditLedger,
    submission_id: &SubmissionId,
    batch: Vec<PendingLedgerWrite>,
    outcomes: &mut Vec<(u64, Outcome)>,
) {
    let mut remaining = batch.into_iter();

    // A write may have landed even though the original call reported failure.
    let recorded_version = match ledger.list_by_submission(submission_id) {
        Ok(entries) => tail_version(&entries),
        Err(err) => {
            if let Some(head) = remaining.next() {
                outcomes.push((head.ticket, Outcome::Failed(err.to_string())));
            }
            outcomes.extend(remaining.map(|p| (p.ticket, Outcome::Skipped)));
            return;
        }
    };

    while let Some(pending) = remaining.next() {
        if pending.entry.submission_version <= recorded_version {
            debug!(
                submission_id = %submission_id,
                version = pending.entry.submission_version,
                "ledger already holds this transition; dropping queued write"
            );
            outcomes.push((pending.ticket, Outcome::AlreadyRecorded));
            continue;
        }

        match ledger.append(pending.entry.clone()) {
            Ok(entry) => {
                info!(
                    submission_id = %submission_id,
                    entry_id = entry.id,
                    version = entry.submission_version,
                    attempt = pending.attempts + 1,
                    "queued ledger write appended"
                );
                outcomes.push((pending.ticket, Outcome::Appended));
            }
            Err(StoreError::VersionConflict { found, .. }) => {
                debug!(
                    submission_id = %submission_id,
                    version = pending.entry.submission_version,
                    ledger_version = found,
                    "ledger moved past this transition; dropping queued write"
                );
                outcomes.push((pending.ticket, Outcome::AlreadyRecorded));
            }
            Err(err) => {
                debug!(
                    submission_id = %submission_id,
                    attempt = pending.attempts + 1,
                    error = %err,
                    "ledger retry failed"
                );
                outcomes.push((pending.ticket, Outcome::Failed(err.to_string())));
                outcomes.extend(remaining.map(|p| (p.ticket, Outcome::Skipped)));
                return;
            }
        }
    }
}

/// Spawns the background task that drains the queue every `tick`.
pub fn spawn_retry_worker(
    queue: Arc<LedgerRetryQueue>,
    ledger: Arc<dyn AuditLedger>,
    tick: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if queue.is_empty() {
                continue;
            }
            let report = queue.drain_due(ledger.as_ref());
            if report.exhausted > 0 {
                error!(?report, "ledger retry round exhausted pending writes");
            } else if report != DrainReport::default() {
                debug!(?report, "ledger retry round finished");
            }
        }
    })
}
