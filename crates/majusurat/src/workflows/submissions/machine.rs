//! Pure transition rules for letter submissions.
//!
//! Nothing in this module touches a store. The coordinator loads the current submission and
//! resolves users, then asks [`plan_transition`] whether the requested move is legal.

use std::collections::BTreeMap;

use super::domain::{
    LetterType, Submission, SubmissionStatus, TransitionPayload, User, UserId, UserRole,
};

/// Rejections produced by the state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("cannot move a submission from {from} to {to}")]
    InvalidTransition {
        from: SubmissionStatus,
        to: SubmissionStatus,
    },
    #[error("role {role} may not move a submission from {from} to {to}")]
    Forbidden {
        role: UserRole,
        from: SubmissionStatus,
        to: SubmissionStatus,
    },
    #[error("{0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FromState {
    Exactly(SubmissionStatus),
    AnyNonTerminal,
}

impl FromState {
    fn matches(self, status: SubmissionStatus) -> bool {
        match self {
            FromState::Exactly(expected) => expected == status,
            FromState::AnyNonTerminal => !status.is_terminal(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precondition {
    RequiredFields,
    ReviewerAssigned,
    ReviewNote,
    RejectionReason,
    IssuanceArtifact,
    None,
}

#[derive(Debug, Clone, Copy)]
struct Rule {
    from: FromState,
    to: SubmissionStatus,
    roles: &'static [UserRole],
    owner_only: bool,
    precondition: Precondition,
}

const REVIEWERS: &[UserRole] = &[UserRole::Staff, UserRole::Admin];

/// Authorization table. Specific rows precede the admin override; an admin whose request fails
/// a specific row's precondition still falls through to the override.
const RULES: [Rule; 6] = [
    Rule {
        from: FromState::Exactly(SubmissionStatus::Draft),
        to: SubmissionStatus::Submitted,
        roles: &[UserRole::Applicant],
        owner_only: true,
        precondition: Precondition::RequiredFields,
    },
    Rule {
        from: FromState::Exactly(SubmissionStatus::Submitted),
        to: SubmissionStatus::UnderReview,
        roles: REVIEWERS,
        owner_only: false,
        precondition: Precondition::ReviewerAssigned,
    },
    Rule {
        from: FromState::Exactly(SubmissionStatus::UnderReview),
        to: SubmissionStatus::Approved,
        roles: REVIEWERS,
        owner_only: false,
        precondition: Precondition::ReviewNote,
    },
    Rule {
        from: FromState::Exactly(SubmissionStatus::UnderReview),
        to: SubmissionStatus::Rejected,
        roles: REVIEWERS,
        owner_only: false,
        precondition: Precondition::RejectionReason,
    },
    Rule {
        from: FromState::Exactly(SubmissionStatus::Approved),
        to: SubmissionStatus::Completed,
        roles: REVIEWERS,
        owner_only: false,
        precondition: Precondition::IssuanceArtifact,
    },
    Rule {
        from: FromState::AnyNonTerminal,
        to: SubmissionStatus::Rejected,
        roles: &[UserRole::Admin],
        owner_only: false,
        precondition: Precondition::None,
    },
];

/// Inputs for a single transition decision.
#[derive(Debug, Clone, Copy)]
pub struct TransitionRequest<'a> {
    pub submission: &'a Submission,
    pub to: SubmissionStatus,
    pub actor: &'a User,
    /// Directory record for `payload.reviewer`, when one was named.
    pub reviewer: Option<&'a User>,
    pub payload: &'a TransitionPayload,
}

/// Field changes that accompany an approved status move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionPlan {
    pub from: SubmissionStatus,
    pub to: SubmissionStatus,
    pub assigned_reviewer: Option<UserId>,
    pub review_note: Option<String>,
    pub rejection_reason: Option<String>,
    pub issuance_reference: Option<String>,
    /// Text recorded on the ledger entry.
    pub ledger_note: Option<String>,
    pub admin_override: bool,
}

/// Returns `true` when the `(from, to)` pair appears anywhere in the table.
pub fn is_listed(from: SubmissionStatus, to: SubmissionStatus) -> bool {
    RULES
        .iter()
        .any(|rule| rule.to == to && rule.from.matches(from))
}

/// Decide whether `request` is a legal move and describe the resulting changes.
pub fn plan_transition(request: TransitionRequest<'_>) -> Result<TransitionPlan, TransitionError> {
    let submission = request.submission;
    let from = submission.status;
    let to = request.to;
    let actor = request.actor;

    let mut candidates = RULES
        .iter()
        .filter(|rule| rule.to == to && rule.from.matches(from))
        .peekable();

    if candidates.peek().is_none() {
        return Err(TransitionError::InvalidTransition { from, to });
    }

    let mut permitted = candidates
        .filter(|rule| {
            rule.roles.contains(&actor.role) && (!rule.owner_only || actor.id == submission.applicant)
        })
        .peekable();
    if permitted.peek().is_none() {
        return Err(TransitionError::Forbidden {
            role: actor.role,
            from,
            to,
        });
    }

    // The first row whose precondition holds wins; its error is kept when none does.
    let mut first_error = None;
    for rule in permitted {
        match plan_with(rule, &request) {
            Ok(plan) => return Ok(plan),
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }
    Err(first_error.unwrap_or(TransitionError::Forbidden {
        role: actor.role,
        from,
        to,
    }))
}

fn plan_with(rule: &Rule, request: &TransitionRequest<'_>) -> Result<TransitionPlan, TransitionError> {
    let submission = request.submission;
    let from = submission.status;
    let to = request.to;

    let mut plan = TransitionPlan {
        from,
        to,
        assigned_reviewer: submission.assigned_reviewer.clone(),
        review_note: submission.review_note.clone(),
        rejection_reason: submission.rejection_reason.clone(),
        issuance_reference: submission.issuance_reference.clone(),
        ledger_note: None,
        admin_override: rule.precondition == Precondition::None,
    };

    let payload = request.payload;
    match rule.precondition {
        Precondition::RequiredFields => {
            ensure_required_fields(submission.letter_type, &submission.fields)?;
            plan.ledger_note = present(&payload.note);
        }
        Precondition::ReviewerAssigned => {
            let reviewer = match (&payload.reviewer, request.reviewer) {
                (Some(requested), Some(user)) if &user.id == requested => {
                    if !user.role.can_review() {
                        return Err(TransitionError::Validation(format!(
                            "reviewer {} has role {} and cannot review submissions",
                            user.id, user.role
                        )));
                    }
                    Some(user.id.clone())
                }
                (Some(requested), _) => {
                    return Err(TransitionError::Validation(format!(
                        "reviewer {requested} could not be resolved"
                    )));
                }
                (None, _) => submission.assigned_reviewer.clone(),
            };
            let reviewer = reviewer.ok_or_else(|| {
                TransitionError::Validation("a reviewer must be assigned before review".into())
            })?;
            plan.ledger_note = Some(present(&payload.note).unwrap_or_else(|| {
                format!("assigned to {reviewer}")
            }));
            plan.assigned_reviewer = Some(reviewer);
        }
        Precondition::ReviewNote => {
            let note = present(&payload.note).ok_or_else(|| {
                TransitionError::Validation("a review note is required to approve".into())
            })?;
            plan.review_note = Some(note.clone());
            plan.ledger_note = Some(note);
        }
        Precondition::RejectionReason => {
            let reason = present(&payload.reason).ok_or_else(|| {
                TransitionError::Validation("a rejection reason is required to reject".into())
            })?;
            plan.rejection_reason = Some(reason.clone());
            plan.ledger_note = Some(reason);
        }
        Precondition::IssuanceArtifact => {
            let reference = present(&payload.issuance_reference).ok_or_else(|| {
                TransitionError::Validation(
                    "an issuance reference is required to complete".into(),
                )
            })?;
            plan.ledger_note = Some(
                present(&payload.note).unwrap_or_else(|| format!("issued as {reference}")),
            );
            plan.issuance_reference = Some(reference);
        }
        Precondition::None => {
            let reason = present(&payload.reason).or_else(|| present(&payload.note));
            if let Some(reason) = &reason {
                plan.rejection_reason = Some(reason.clone());
            }
            plan.ledger_note = Some(match reason {
                Some(reason) => format!("admin override: {reason}"),
                None => "admin override".to_string(),
            });
        }
    }

    Ok(plan)
}

/// Checks a new request. Only applicants may open submissions; the direct-submit path also
/// needs every required field.
pub fn plan_creation(
    actor: &User,
    letter_type: LetterType,
    fields: &BTreeMap<String, String>,
    direct_submit: bool,
) -> Result<SubmissionStatus, TransitionError> {
    if actor.role != UserRole::Applicant {
        return Err(TransitionError::Forbidden {
            role: actor.role,
            from: SubmissionStatus::Draft,
            to: if direct_submit {
                SubmissionStatus::Submitted
            } else {
                SubmissionStatus::Draft
            },
        });
    }

    if direct_submit {
        ensure_required_fields(letter_type, fields)?;
        Ok(SubmissionStatus::Submitted)
    } else {
        Ok(SubmissionStatus::Draft)
    }
}

/// Owner edits are only accepted while the request is still a draft.
pub fn authorize_draft_edit(submission: &Submission, actor: &User) -> Result<(), TransitionError> {
    if actor.role != UserRole::Applicant || actor.id != submission.applicant {
        return Err(TransitionError::Forbidden {
            role: actor.role,
            from: submission.status,
            to: submission.status,
        });
    }
    if submission.status != SubmissionStatus::Draft {
        return Err(TransitionError::Validation(format!(
            "fields can only be edited while the submission is a draft (currently {})",
            submission.status
        )));
    }
    Ok(())
}

fn ensure_required_fields(
    letter_type: LetterType,
    fields: &BTreeMap<String, String>,
) -> Result<(), TransitionError> {
    let missing = letter_type.missing_fields(fields);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(TransitionError::Validation(format!(
            "missing required fields for {} letter: {}",
            letter_type.label(),
            missing.join(", ")
        )))
    }
}

fn present(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
