use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Milestone lifecycle, in the only order it may advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    Funded,
    WorkStarted,
    WorkSubmitted,
    Approved,
    Released,
}

impl MilestoneStatus {
    pub const ALL: [MilestoneStatus; 6] = [
        Self::Pending,
        Self::Funded,
        Self::WorkStarted,
        Self::WorkSubmitted,
        Self::Approved,
        Self::Released,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Funded => "funded",
            Self::WorkStarted => "work_started",
            Self::WorkSubmitted => "work_submitted",
            Self::Approved => "approved",
            Self::Released => "released",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.name() == value)
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Released
    }
}

impl fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Contract role of whoever triggers a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    /// Client funding the escrow.
    Payer,
    /// Professional delivering the work.
    Payee,
    /// Scheduler and payment-processor callbacks.
    System,
}

impl ActorRole {
    pub fn name(self) -> &'static str {
        match self {
            Self::Payer => "payer",
            Self::Payee => "payee",
            Self::System => "system",
        }
    }
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity facts resolved by the external auth system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub actor_id: String,
    pub role: ActorRole,
}

impl Actor {
    pub const SYSTEM_ID: &'static str = "system";

    pub fn payer(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            role: ActorRole::Payer,
        }
    }

    pub fn payee(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            role: ActorRole::Payee,
        }
    }

    pub fn system() -> Self {
        Self {
            actor_id: Self::SYSTEM_ID.to_string(),
            role: ActorRole::System,
        }
    }
}

/// Funds held on behalf of a payer for one contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escrow {
    pub escrow_id: String,
    pub payer_id: String,
    pub payee_id: String,
    /// Destination handed to the payment processor on release.
    pub payee_account: String,
    /// Selects a release-window override, e.g. "hourly" or "fixed_price".
    pub contract_type: Option<String>,
    pub currency: String,
    pub total_minor: u64,
    pub funded_minor: u64,
    pub has_milestones: bool,
    /// Bumped on every committed write to the escrow or any of its milestones.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for opening a new escrow once a contract is agreed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowDraft {
    pub payer_id: String,
    pub payee_id: String,
    pub payee_account: String,
    #[serde(default)]
    pub contract_type: Option<String>,
    pub currency: String,
    pub total_minor: u64,
}

impl EscrowDraft {
    pub fn new(
        payer_id: impl Into<String>,
        payee_id: impl Into<String>,
        payee_account: impl Into<String>,
        currency: impl Into<String>,
        total_minor: u64,
    ) -> Self {
        Self {
            payer_id: payer_id.into(),
            payee_id: payee_id.into(),
            payee_account: payee_account.into(),
            contract_type: None,
            currency: currency.into(),
            total_minor,
        }
    }

    pub fn with_contract_type(mut self, contract_type: impl Into<String>) -> Self {
        self.contract_type = Some(contract_type.into());
        self
    }

    pub fn into_escrow(self, now: DateTime<Utc>) -> Escrow {
        Escrow {
            escrow_id: Uuid::new_v4().to_string(),
            payer_id: self.payer_id,
            payee_id: self.payee_id,
            payee_account: self.payee_account,
            contract_type: self.contract_type,
            currency: self.currency,
            total_minor: self.total_minor,
            funded_minor: 0,
            has_milestones: false,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A funded sub-phase of a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub milestone_id: String,
    pub escrow_id: String,
    /// 1-based, dense within the escrow.
    pub number: u32,
    pub title: String,
    pub description: String,
    pub amount_minor: u64,
    pub due_date: Option<DateTime<Utc>>,
    pub status: MilestoneStatus,
    pub rating: Option<u8>,
    pub feedback: Option<String>,
    pub auto_approved: bool,
    pub funded_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    /// Processor transfer id recorded on release.
    pub release_reference: Option<String>,
    /// Bumped on every committed write; used for conditional updates.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payer-authored milestone before it is added to an escrow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MilestoneDraft {
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// `None` leaves the milestone unallocated until amounts are distributed.
    #[serde(default)]
    pub amount_minor: Option<u64>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
}

impl MilestoneDraft {
    pub fn new(title: impl Into<String>, amount_minor: u64) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            amount_minor: Some(amount_minor),
            due_date: None,
        }
    }

    pub fn unallocated(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_due_date(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }
}

/// Partial edit of a pending milestone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MilestonePatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub amount_minor: Option<u64>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clear_due_date: bool,
}

impl MilestonePatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.amount_minor.is_none()
            && self.due_date.is_none()
            && !self.clear_due_date
    }
}

/// Read model: how much of the contract budget the milestones cover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationSummary {
    pub escrow_id: String,
    pub currency: String,
    pub total_minor: u64,
    pub allocated_minor: u64,
    pub remaining_minor: u64,
    pub over_allocated_minor: u64,
    pub funded_minor: u64,
    pub released_minor: u64,
    pub milestone_count: usize,
}

/// Actions a caller can request against a milestone.
///
/// Each variant carries exactly the payload its transition needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MilestoneAction {
    StartWork,
    SubmitWork,
    Approve {
        /// Checked against the 1..=5 scale when the approval is applied.
        #[serde(default)]
        rating: Option<i64>,
        #[serde(default)]
        feedback: Option<String>,
    },
    AutoApprove,
}

impl MilestoneAction {
    pub fn approve(rating: u8, feedback: Option<&str>) -> Self {
        Self::Approve {
            rating: Some(i64::from(rating)),
            feedback: feedback.map(str::to_string),
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Self::StartWork => ActionKind::StartWork,
            Self::SubmitWork => ActionKind::SubmitWork,
            Self::Approve { .. } => ActionKind::Approve,
            Self::AutoApprove => ActionKind::AutoApprove,
        }
    }
}

/// Every transition name, including the system-only ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Fund,
    StartWork,
    SubmitWork,
    Approve,
    AutoApprove,
    ReleaseFunds,
}

impl ActionKind {
    pub const ALL: [ActionKind; 6] = [
        Self::Fund,
        Self::StartWork,
        Self::SubmitWork,
        Self::Approve,
        Self::AutoApprove,
        Self::ReleaseFunds,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Fund => "fund",
            Self::StartWork => "start_work",
            Self::SubmitWork => "submit_work",
            Self::Approve => "approve",
            Self::AutoApprove => "auto_approve",
            Self::ReleaseFunds => "release_funds",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fire-and-forget event kinds consumed by the notification service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    #[serde(rename = "milestone.funded")]
    MilestoneFunded,
    #[serde(rename = "milestone.submitted")]
    MilestoneSubmitted,
    #[serde(rename = "milestone.approved")]
    MilestoneApproved,
    #[serde(rename = "milestone.released")]
    MilestoneReleased,
}

impl NotificationKind {
    pub fn topic(self) -> &'static str {
        match self {
            Self::MilestoneFunded => "milestone.funded",
            Self::MilestoneSubmitted => "milestone.submitted",
            Self::MilestoneApproved => "milestone.approved",
            Self::MilestoneReleased => "milestone.released",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: String,
    pub kind: NotificationKind,
    pub escrow_id: String,
    pub milestone_id: String,
    pub recipient_id: String,
    pub occurred_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        milestone: &Milestone,
        recipient_id: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            notification_id: Uuid::new_v4().to_string(),
            kind,
            escrow_id: milestone.escrow_id.clone(),
            milestone_id: milestone.milestone_id.clone(),
            recipient_id: recipient_id.into(),
            occurred_at,
        }
    }
}

/// Side-effect instruction handed to the payment processor.
///
/// `idempotency_key` is stable per milestone so repeated calls settle at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInstruction {
    pub idempotency_key: String,
    pub escrow_id: String,
    pub milestone_id: String,
    pub amount_minor: u64,
    pub currency: String,
    pub payee_account: String,
    pub attempt: u32,
}

impl ReleaseInstruction {
    pub fn for_milestone(escrow: &Escrow, milestone: &Milestone, attempt: u32) -> Self {
        Self {
            idempotency_key: format!("release:{}", milestone.milestone_id),
            escrow_id: escrow.escrow_id.clone(),
            milestone_id: milestone.milestone_id.clone(),
            amount_minor: milestone.amount_minor,
            currency: escrow.currency.clone(),
            payee_account: escrow.payee_account.clone(),
            attempt,
        }
    }
}

/// Processor confirmation of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub transfer_id: String,
    pub processor: String,
    pub milestone_id: String,
    pub amount_minor: u64,
    pub settled_at: DateTime<Utc>,
}

/// What happened to the release instruction emitted by an approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReleaseDisposition {
    Released {
        receipt: TransferReceipt,
    },
    RetryScheduled {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        escalated: bool,
        reason: String,
    },
}

/// Result of `WorkflowOrchestrator::execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub milestone: Milestone,
    /// False when the action had already been applied and nothing changed.
    pub applied: bool,
    pub notifications: Vec<Notification>,
    pub release: Option<ReleaseDisposition>,
}

impl ActionOutcome {
    pub fn unchanged(milestone: Milestone) -> Self {
        Self {
            milestone,
            applied: false,
            notifications: Vec::new(),
            release: None,
        }
    }
}

/// Result of an external funding event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingOutcome {
    pub escrow: Escrow,
    pub funded_milestones: Vec<Milestone>,
    pub notifications: Vec<Notification>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approve_action_parses_from_tagged_json() {
        let action: MilestoneAction =
            serde_json::from_str(r#"{"action":"approve","rating":5,"feedback":"Great work"}"#)
                .unwrap();
        assert_eq!(action, MilestoneAction::approve(5, Some("Great work")));

        let missing_rating: MilestoneAction =
            serde_json::from_str(r#"{"action":"approve"}"#).unwrap();
        assert_eq!(
            missing_rating,
            MilestoneAction::Approve {
                rating: None,
                feedback: None
            }
        );
    }

    #[test]
    fn status_names_parse_back() {
        for status in MilestoneStatus::ALL {
            assert_eq!(MilestoneStatus::parse(status.name()), Some(status));
        }
        assert_eq!(MilestoneStatus::parse("cancelled"), None);
    }
}
