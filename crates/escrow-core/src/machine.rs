use crate::error::EscrowError;
use crate::types::{ActionKind, ActorRole, Milestone, MilestoneAction, MilestoneStatus};
use chrono::{DateTime, Utc};

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;
pub const MAX_FEEDBACK_CHARS: usize = 2_000;

/// One row of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRule {
    pub action: ActionKind,
    pub role: ActorRole,
    pub from: MilestoneStatus,
    pub to: MilestoneStatus,
}

impl TransitionRule {
    pub const fn for_action(action: ActionKind) -> Self {
        use MilestoneStatus::*;
        let (role, from, to) = match action {
            ActionKind::Fund => (ActorRole::System, Pending, Funded),
            ActionKind::StartWork => (ActorRole::Payee, Funded, WorkStarted),
            ActionKind::SubmitWork => (ActorRole::Payee, WorkStarted, WorkSubmitted),
            ActionKind::Approve => (ActorRole::Payer, WorkSubmitted, Approved),
            ActionKind::AutoApprove => (ActorRole::System, WorkSubmitted, Approved),
            ActionKind::ReleaseFunds => (ActorRole::System, Approved, Released),
        };
        Self {
            action,
            role,
            from,
            to,
        }
    }

    /// The full table, in lifecycle order.
    pub fn table() -> [TransitionRule; 6] {
        ActionKind::ALL.map(Self::for_action)
    }

    /// Whether a milestone in `status` already reflects this rule's outcome.
    ///
    /// Approval counts as applied once funds are released too, so late duplicate
    /// approvals never re-issue a release.
    pub fn is_already_applied(&self, status: MilestoneStatus) -> bool {
        status == self.to
            || (self.to == MilestoneStatus::Approved && status == MilestoneStatus::Released)
    }
}

/// Outcome of evaluating an action against a milestone snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Applied {
        from: MilestoneStatus,
        milestone: Milestone,
    },
    /// The milestone already reflects the action; nothing to write.
    AlreadyApplied(Milestone),
}

impl Transition {
    pub fn milestone(&self) -> &Milestone {
        match self {
            Self::Applied { milestone, .. } | Self::AlreadyApplied(milestone) => milestone,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Stateless milestone state machine.
///
/// Never mutates its input: it validates first and returns the next snapshot, leaving
/// persistence to the ledger. Any action whose `from` state does not match is rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct MilestoneStateMachine;

impl MilestoneStateMachine {
    pub fn new() -> Self {
        Self
    }

    pub fn permitted_role(action: ActionKind) -> ActorRole {
        TransitionRule::for_action(action).role
    }

    pub fn apply(
        &self,
        milestone: &Milestone,
        action: &MilestoneAction,
        now: DateTime<Utc>,
    ) -> Result<Transition, EscrowError> {
        match action {
            MilestoneAction::StartWork => self.advance(milestone, ActionKind::StartWork, now, |m| {
                m.started_at = Some(now);
            }),
            MilestoneAction::SubmitWork => {
                self.advance(milestone, ActionKind::SubmitWork, now, |m| {
                    m.submitted_at = Some(now);
                })
            }
            MilestoneAction::Approve { rating, feedback } => {
                let rule = TransitionRule::for_action(ActionKind::Approve);
                if let Some(done) = self.check(milestone, &rule)? {
                    return Ok(done);
                }
                let rating = validate_rating(*rating)?;
                let feedback = normalize_feedback(feedback.as_deref())?;
                self.advance(milestone, ActionKind::Approve, now, |m| {
                    m.rating = Some(rating);
                    m.feedback = feedback;
                    m.auto_approved = false;
                    m.approved_at = Some(now);
                })
            }
            MilestoneAction::AutoApprove => {
                self.advance(milestone, ActionKind::AutoApprove, now, |m| {
                    m.rating = None;
                    m.feedback = None;
                    m.auto_approved = true;
                    m.approved_at = Some(now);
                })
            }
        }
    }

    /// `pending -> funded`, driven by the external funding event.
    pub fn fund(&self, milestone: &Milestone, now: DateTime<Utc>) -> Result<Transition, EscrowError> {
        self.advance(milestone, ActionKind::Fund, now, |m| {
            m.funded_at = Some(now);
        })
    }

    /// `approved -> released`, only after the processor confirmed the transfer.
    pub fn release(
        &self,
        milestone: &Milestone,
        transfer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition, EscrowError> {
        self.advance(milestone, ActionKind::ReleaseFunds, now, |m| {
            m.released_at = Some(now);
            m.release_reference = Some(transfer_id.to_string());
        })
    }

    fn check(
        &self,
        milestone: &Milestone,
        rule: &TransitionRule,
    ) -> Result<Option<Transition>, EscrowError> {
        if rule.is_already_applied(milestone.status) {
            return Ok(Some(Transition::AlreadyApplied(milestone.clone())));
        }
        if milestone.status != rule.from {
            return Err(EscrowError::invalid_transition(milestone.status, rule.action));
        }
        Ok(None)
    }

    fn advance(
        &self,
        milestone: &Milestone,
        action: ActionKind,
        now: DateTime<Utc>,
        mutate: impl FnOnce(&mut Milestone),
    ) -> Result<Transition, EscrowError> {
        let rule = TransitionRule::for_action(action);
        if let Some(done) = self.check(milestone, &rule)? {
            return Ok(done);
        }

        let mut next = milestone.clone();
        mutate(&mut next);
        next.status = rule.to;
        next.updated_at = now;
        Ok(Transition::Applied {
            from: rule.from,
            milestone: next,
        })
    }
}

fn validate_rating(rating: Option<i64>) -> Result<u8, EscrowError> {
    match rating {
        Some(value) => u8::try_from(value)
            .ok()
            .filter(|rating| (MIN_RATING..=MAX_RATING).contains(rating))
            .ok_or_else(|| {
                EscrowError::Validation(format!(
                    "rating must be between {} and {}, got {}",
                    MIN_RATING, MAX_RATING, value
                ))
            }),
        None => Err(EscrowError::Validation(
            "a rating is required to approve a milestone".to_string(),
        )),
    }
}

fn normalize_feedback(feedback: Option<&str>) -> Result<Option<String>, EscrowError> {
    let Some(text) = feedback.map(str::trim).filter(|text| !text.is_empty()) else {
        return Ok(None);
    };
    if text.chars().count() > MAX_FEEDBACK_CHARS {
        return Err(EscrowError::Validation(format!(
            "feedback is limited to {} characters",
            MAX_FEEDBACK_CHARS
        )));
    }
    Ok(Some(text.to_string()))
}
