//! Workflow orchestrator: the single entry point for milestone actions.
//!
//! Every action follows the same path: load a snapshot, authorize the actor against
//! the transition table, let the state machine compute the next snapshot, then write
//! it conditioned on the version that was read. Side effects (release instructions,
//! notifications) only run after that write committed.

use crate::connectors::{NotificationSink, PaymentProcessor};
use crate::error::EscrowError;
use crate::journal::{
    AllocationRecord, FundingRecord, JournalEntry, JournalEntryKind, TransferRecord,
    TransitionRecord,
};
use crate::ledger::MilestoneLedger;
use crate::machine::{MilestoneStateMachine, Transition};
use crate::retry::{PendingRelease, ReleaseRetryQueue, RetryPolicy};
use crate::scheduler::{ReleaseScheduler, ReleaseWindowConfig, ScheduledRelease};
use crate::storage::{EscrowStore, StorageConfig};
use crate::types::{
    ActionKind, ActionOutcome, Actor, ActorRole, AllocationSummary, Escrow, EscrowDraft,
    FundingOutcome, Milestone, MilestoneAction, MilestoneDraft, MilestonePatch, MilestoneStatus,
    Notification, NotificationKind, ReleaseDisposition, ReleaseInstruction, TransferReceipt,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub release_windows: ReleaseWindowConfig,
    pub retry_policy: RetryPolicy,
    pub storage: StorageConfig,
    /// How often a lost conditional write is re-read and re-evaluated.
    pub max_conflict_retries: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            release_windows: ReleaseWindowConfig::default(),
            retry_policy: RetryPolicy::default(),
            storage: StorageConfig::Memory,
            max_conflict_retries: 3,
        }
    }
}

/// A scheduler entry that could not be turned into an auto-approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickFailure {
    pub milestone_id: String,
    pub code: String,
    pub message: String,
}

/// Result of one scheduler pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickReport {
    pub auto_approved: Vec<ActionOutcome>,
    /// Due entries whose milestone had already left `work_submitted`.
    pub skipped: Vec<String>,
    pub failed: Vec<TickFailure>,
}

/// Result of one release retry pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryReport {
    pub released: Vec<Milestone>,
    pub rescheduled: Vec<PendingRelease>,
    /// Entries dropped because the milestone is no longer waiting for funds.
    pub resolved: Vec<String>,
}

pub struct WorkflowOrchestrator {
    store: Arc<AsyncMutex<EscrowStore>>,
    scheduler: AsyncMutex<ReleaseScheduler>,
    retries: AsyncMutex<ReleaseRetryQueue>,
    machine: MilestoneStateMachine,
    processor: Arc<dyn PaymentProcessor>,
    notifier: Arc<dyn NotificationSink>,
    config: WorkflowConfig,
}

impl WorkflowOrchestrator {
    /// Open the store and rebuild in-flight work from persisted milestones:
    /// `work_submitted` milestones get their deadline back and `approved` ones are
    /// queued for immediate release.
    pub async fn bootstrap(
        config: WorkflowConfig,
        processor: Arc<dyn PaymentProcessor>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self, EscrowError> {
        let store = EscrowStore::bootstrap(config.storage.clone()).await?;
        let now = Utc::now();
        let mut scheduler = ReleaseScheduler::new();
        let mut retries = ReleaseRetryQueue::new(config.retry_policy.clone());

        for ledger in store.ledgers() {
            let escrow = ledger.escrow();
            let window = config
                .release_windows
                .window_for(escrow.contract_type.as_deref());
            for milestone in ledger.milestones() {
                match milestone.status {
                    MilestoneStatus::WorkSubmitted => {
                        let submitted_at = milestone.submitted_at.unwrap_or(milestone.updated_at);
                        scheduler.schedule(
                            &milestone.milestone_id,
                            &escrow.escrow_id,
                            submitted_at,
                            window,
                        );
                    }
                    MilestoneStatus::Approved => {
                        retries.enqueue(
                            &milestone.milestone_id,
                            &escrow.escrow_id,
                            milestone.amount_minor,
                            now,
                        );
                    }
                    _ => {}
                }
            }
        }

        info!(
            storage = store.backend_label(),
            scheduled = scheduler.len(),
            pending_releases = retries.len(),
            "escrow workflow bootstrapped"
        );

        Ok(Self {
            store: Arc::new(AsyncMutex::new(store)),
            scheduler: AsyncMutex::new(scheduler),
            retries: AsyncMutex::new(retries),
            machine: MilestoneStateMachine::new(),
            processor,
            notifier,
            config,
        })
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub async fn storage_backend(&self) -> &'static str {
        self.store.lock().await.backend_label()
    }

    pub async fn create_escrow(&self, draft: EscrowDraft) -> Result<Escrow, EscrowError> {
        let draft = validate_escrow_draft(draft)?;
        let now = Utc::now();
        let mut store = self.store.lock().await;
        let ledger = store.insert_escrow(draft.into_escrow(now)).await?;
        let escrow = ledger.escrow().clone();

        let record = AllocationRecord {
            operation: "create_escrow".to_string(),
            actor_id: escrow.payer_id.clone(),
            milestone_ids: Vec::new(),
            allocated_minor: 0,
            total_minor: escrow.total_minor,
        };
        append_journal(
            &mut store,
            &escrow.escrow_id,
            None,
            JournalEntryKind::Allocation,
            &record,
            now,
        )
        .await;

        info!(
            escrow_id = %escrow.escrow_id,
            total_minor = escrow.total_minor,
            currency = %escrow.currency,
            "escrow created"
        );
        Ok(escrow)
    }

    pub async fn add_milestone(
        &self,
        actor: &Actor,
        escrow_id: &str,
        draft: MilestoneDraft,
    ) -> Result<Milestone, EscrowError> {
        self.edit_draft(actor, escrow_id, "add_milestone", |ledger, now| {
            let milestone = ledger.add_milestone(draft, now)?;
            let ids = vec![milestone.milestone_id.clone()];
            Ok((milestone, ids))
        })
        .await
    }

    pub async fn update_milestone(
        &self,
        actor: &Actor,
        escrow_id: &str,
        milestone_id: &str,
        patch: MilestonePatch,
    ) -> Result<Milestone, EscrowError> {
        self.edit_draft(actor, escrow_id, "update_milestone", |ledger, now| {
            let milestone = ledger.update_milestone(milestone_id, patch, now)?;
            let ids = vec![milestone.milestone_id.clone()];
            Ok((milestone, ids))
        })
        .await
    }

    pub async fn remove_milestone(
        &self,
        actor: &Actor,
        escrow_id: &str,
        milestone_id: &str,
    ) -> Result<Milestone, EscrowError> {
        self.edit_draft(actor, escrow_id, "remove_milestone", |ledger, now| {
            let milestone = ledger.remove_milestone(milestone_id, now)?;
            let ids = vec![milestone.milestone_id.clone()];
            Ok((milestone, ids))
        })
        .await
    }

    pub async fn distribute_evenly(
        &self,
        actor: &Actor,
        escrow_id: &str,
    ) -> Result<Vec<Milestone>, EscrowError> {
        self.edit_draft(actor, escrow_id, "distribute_evenly", |ledger, now| {
            let milestones = ledger.distribute_evenly(now)?;
            let ids = milestones
                .iter()
                .map(|milestone| milestone.milestone_id.clone())
                .collect();
            Ok((milestones, ids))
        })
        .await
    }

    /// Entry point for the processor's funding event.
    pub async fn record_funding(
        &self,
        escrow_id: &str,
        amount_minor: u64,
    ) -> Result<FundingOutcome, EscrowError> {
        self.record_funding_at(escrow_id, amount_minor, Utc::now())
            .await
    }

    pub async fn record_funding_at(
        &self,
        escrow_id: &str,
        amount_minor: u64,
        now: DateTime<Utc>,
    ) -> Result<FundingOutcome, EscrowError> {
        let (escrow, funded) = {
            let mut store = self.store.lock().await;
            let mut ledger = store.ledger(escrow_id)?.clone();
            let expected_revision = ledger.escrow().revision;
            let funded = ledger.record_funding(amount_minor, &self.machine, now)?;
            let saved = store.save_ledger(ledger, expected_revision).await?;

            let record = FundingRecord {
                amount_minor,
                funded_minor: saved.escrow().funded_minor,
                funded_milestones: funded.iter().map(|m| m.milestone_id.clone()).collect(),
            };
            append_journal(
                &mut store,
                escrow_id,
                None,
                JournalEntryKind::Funding,
                &record,
                now,
            )
            .await;
            for milestone in &funded {
                let record = TransitionRecord::new(
                    ActionKind::Fund,
                    MilestoneStatus::Pending,
                    milestone,
                    Actor::SYSTEM_ID,
                    ActorRole::System,
                );
                append_journal(
                    &mut store,
                    escrow_id,
                    Some(&milestone.milestone_id),
                    JournalEntryKind::Transition,
                    &record,
                    now,
                )
                .await;
            }
            (saved.escrow().clone(), funded)
        };

        info!(
            escrow_id = %escrow_id,
            amount_minor,
            funded_minor = escrow.funded_minor,
            milestones_funded = funded.len(),
            "funding recorded"
        );

        let mut notifications = Vec::new();
        for milestone in &funded {
            self.notify(
                NotificationKind::MilestoneFunded,
                milestone,
                &escrow.payee_id,
                now,
                &mut notifications,
            );
        }

        Ok(FundingOutcome {
            escrow,
            funded_milestones: funded,
            notifications,
        })
    }

    /// Apply `action` to a milestone on behalf of `actor`.
    pub async fn execute(
        &self,
        actor: &Actor,
        milestone_id: &str,
        action: &MilestoneAction,
    ) -> Result<ActionOutcome, EscrowError> {
        self.execute_at(actor, milestone_id, action, Utc::now())
            .await
    }

    pub async fn execute_at(
        &self,
        actor: &Actor,
        milestone_id: &str,
        action: &MilestoneAction,
        now: DateTime<Utc>,
    ) -> Result<ActionOutcome, EscrowError> {
        let kind = action.kind();
        let required = MilestoneStateMachine::permitted_role(kind);
        let mut conflicts = 0u32;

        loop {
            let (escrow, current) = self.store.lock().await.milestone(milestone_id)?;
            authorize(actor, &escrow, required, kind.name())?;

            let (from, next) = match self.machine.apply(&current, action, now)? {
                Transition::AlreadyApplied(milestone) => {
                    debug!(
                        milestone_id = %milestone_id,
                        action = %kind,
                        status = %milestone.status,
                        "action already applied"
                    );
                    return Ok(ActionOutcome::unchanged(milestone));
                }
                Transition::Applied { from, milestone } => (from, milestone),
            };

            let committed = {
                let mut store = self.store.lock().await;
                match store.commit_milestone(next, current.version).await {
                    Ok(committed) => {
                        let record =
                            TransitionRecord::new(kind, from, &committed, &actor.actor_id, actor.role);
                        append_journal(
                            &mut store,
                            &escrow.escrow_id,
                            Some(milestone_id),
                            JournalEntryKind::Transition,
                            &record,
                            now,
                        )
                        .await;
                        committed
                    }
                    Err(EscrowError::Conflict(_)) if conflicts < self.config.max_conflict_retries => {
                        conflicts += 1;
                        debug!(
                            milestone_id = %milestone_id,
                            action = %kind,
                            attempt = conflicts,
                            "conditional write lost, re-reading milestone"
                        );
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            };

            info!(
                milestone_id = %milestone_id,
                escrow_id = %escrow.escrow_id,
                action = %kind,
                from = %from,
                to = %committed.status,
                actor_id = %actor.actor_id,
                "milestone transition committed"
            );

            return Ok(self.after_transition(&escrow, committed, kind, now).await);
        }
    }

    /// Auto-approve every milestone whose payer window closed at or before `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let due = self.scheduler.lock().await.tick(now);
        let mut report = TickReport::default();
        let system = Actor::system();

        for entry in due {
            let result = self
                .execute_at(&system, &entry.milestone_id, &MilestoneAction::AutoApprove, now)
                .await;
            match result {
                Ok(outcome) if outcome.applied => report.auto_approved.push(outcome),
                Ok(_)
                | Err(EscrowError::InvalidTransition { .. })
                | Err(EscrowError::NotFound(_)) => {
                    debug!(milestone_id = %entry.milestone_id, "auto-approval no longer needed");
                    report.skipped.push(entry.milestone_id);
                }
                Err(err) => {
                    warn!(
                        milestone_id = %entry.milestone_id,
                        error = %err,
                        "auto-approval failed; keeping deadline"
                    );
                    self.scheduler.lock().await.schedule(
                        &entry.milestone_id,
                        &entry.escrow_id,
                        entry.submitted_at,
                        entry.deadline - entry.submitted_at,
                    );
                    report.failed.push(TickFailure {
                        milestone_id: entry.milestone_id,
                        code: err.code().to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }

        if !report.auto_approved.is_empty() {
            info!(
                auto_approved = report.auto_approved.len(),
                skipped = report.skipped.len(),
                "release scheduler tick"
            );
        }
        report
    }

    /// Re-issue every release whose backoff elapsed.
    pub async fn retry_releases(&self, now: DateTime<Utc>) -> RetryReport {
        let due = self.retries.lock().await.due(now);
        let mut report = RetryReport::default();

        for entry in due {
            let snapshot = self.store.lock().await.milestone(&entry.milestone_id);
            let (escrow, milestone) = match snapshot {
                Ok(found) if found.1.status == MilestoneStatus::Approved => found,
                _ => {
                    self.retries.lock().await.resolve(&entry.milestone_id);
                    report.resolved.push(entry.milestone_id);
                    continue;
                }
            };

            let (milestone, disposition, _) = self.release(&escrow, milestone, now).await;
            match disposition {
                ReleaseDisposition::Released { .. } => report.released.push(milestone),
                ReleaseDisposition::RetryScheduled { .. } => {
                    if let Some(pending) = self.retries.lock().await.get(&milestone.milestone_id) {
                        report.rescheduled.push(pending.clone());
                    }
                }
            }
        }
        report
    }

    pub async fn escrow(&self, actor: &Actor, escrow_id: &str) -> Result<Escrow, EscrowError> {
        let store = self.store.lock().await;
        let escrow = store.ledger(escrow_id)?.escrow().clone();
        ensure_member(actor, &escrow, "view escrow")?;
        Ok(escrow)
    }

    /// Milestones of an escrow in sequence order.
    pub async fn list_milestones(
        &self,
        actor: &Actor,
        escrow_id: &str,
    ) -> Result<Vec<Milestone>, EscrowError> {
        let store = self.store.lock().await;
        let ledger = store.ledger(escrow_id)?;
        ensure_member(actor, ledger.escrow(), "list milestones")?;
        Ok(ledger.milestones().to_vec())
    }

    pub async fn allocation_summary(
        &self,
        actor: &Actor,
        escrow_id: &str,
    ) -> Result<AllocationSummary, EscrowError> {
        let store = self.store.lock().await;
        let ledger = store.ledger(escrow_id)?;
        ensure_member(actor, ledger.escrow(), "view allocation")?;
        Ok(ledger.summary())
    }

    pub async fn milestone(
        &self,
        actor: &Actor,
        milestone_id: &str,
    ) -> Result<Milestone, EscrowError> {
        let (escrow, milestone) = self.store.lock().await.milestone(milestone_id)?;
        ensure_member(actor, &escrow, "view milestone")?;
        Ok(milestone)
    }

    pub async fn journal_entries(
        &self,
        actor: &Actor,
        milestone_id: &str,
    ) -> Result<Vec<JournalEntry>, EscrowError> {
        let store = self.store.lock().await;
        let (escrow, _) = store.milestone(milestone_id)?;
        ensure_member(actor, &escrow, "view journal")?;
        Ok(store.journal().entries_for_milestone(milestone_id))
    }

    pub async fn pending_releases(&self) -> Vec<PendingRelease> {
        self.retries.lock().await.entries()
    }

    pub async fn scheduled_releases(&self) -> Vec<ScheduledRelease> {
        self.scheduler.lock().await.pending()
    }

    /// Merge a persisted retry queue snapshot, keeping attempt counts across restarts.
    pub async fn restore_pending_releases(&self, entries: Vec<PendingRelease>) {
        if entries.is_empty() {
            return;
        }
        let mut retries = self.retries.lock().await;
        retries.restore(entries);
        info!(pending_releases = retries.len(), "release queue restored");
    }

    async fn edit_draft<T>(
        &self,
        actor: &Actor,
        escrow_id: &str,
        operation: &'static str,
        edit: impl FnOnce(&mut MilestoneLedger, DateTime<Utc>) -> Result<(T, Vec<String>), EscrowError>,
    ) -> Result<T, EscrowError> {
        let now = Utc::now();
        let mut store = self.store.lock().await;
        let mut ledger = store.ledger(escrow_id)?.clone();
        authorize(actor, ledger.escrow(), ActorRole::Payer, operation)?;

        let expected_revision = ledger.escrow().revision;
        let (result, milestone_ids) = edit(&mut ledger, now)?;
        let saved = store.save_ledger(ledger, expected_revision).await?;

        let target = match milestone_ids.as_slice() {
            [single] => Some(single.clone()),
            _ => None,
        };
        let record = AllocationRecord {
            operation: operation.to_string(),
            actor_id: actor.actor_id.clone(),
            milestone_ids,
            allocated_minor: saved.total_allocated(),
            total_minor: saved.escrow().total_minor,
        };
        append_journal(
            &mut store,
            escrow_id,
            target.as_deref(),
            JournalEntryKind::Allocation,
            &record,
            now,
        )
        .await;

        info!(
            escrow_id = %escrow_id,
            operation,
            allocated_minor = record.allocated_minor,
            total_minor = record.total_minor,
            "milestone plan updated"
        );
        Ok(result)
    }

    async fn after_transition(
        &self,
        escrow: &Escrow,
        milestone: Milestone,
        kind: ActionKind,
        now: DateTime<Utc>,
    ) -> ActionOutcome {
        let mut notifications = Vec::new();
        match kind {
            ActionKind::SubmitWork => {
                let window = self
                    .config
                    .release_windows
                    .window_for(escrow.contract_type.as_deref());
                let submitted_at = milestone.submitted_at.unwrap_or(now);
                let entry = self.scheduler.lock().await.schedule(
                    &milestone.milestone_id,
                    &escrow.escrow_id,
                    submitted_at,
                    window,
                );
                debug!(
                    milestone_id = %milestone.milestone_id,
                    deadline = %entry.deadline,
                    "auto-approval scheduled"
                );
                self.notify(
                    NotificationKind::MilestoneSubmitted,
                    &milestone,
                    &escrow.payer_id,
                    now,
                    &mut notifications,
                );
                ActionOutcome {
                    milestone,
                    applied: true,
                    notifications,
                    release: None,
                }
            }
            ActionKind::Approve | ActionKind::AutoApprove => {
                self.scheduler.lock().await.cancel(&milestone.milestone_id);
                self.notify(
                    NotificationKind::MilestoneApproved,
                    &milestone,
                    &escrow.payee_id,
                    now,
                    &mut notifications,
                );
                self.retries.lock().await.enqueue(
                    &milestone.milestone_id,
                    &escrow.escrow_id,
                    milestone.amount_minor,
                    now,
                );
                let (milestone, disposition, released) = self.release(escrow, milestone, now).await;
                notifications.extend(released);
                ActionOutcome {
                    milestone,
                    applied: true,
                    notifications,
                    release: Some(disposition),
                }
            }
            _ => ActionOutcome {
                milestone,
                applied: true,
                notifications,
                release: None,
            },
        }
    }

    /// Hand the release instruction to the processor; no store lock is held while
    /// the call is in flight. Failures stay `approved` and go to the retry queue.
    async fn release(
        &self,
        escrow: &Escrow,
        milestone: Milestone,
        now: DateTime<Utc>,
    ) -> (Milestone, ReleaseDisposition, Vec<Notification>) {
        let attempt = self.retries.lock().await.attempts(&milestone.milestone_id);
        let instruction = ReleaseInstruction::for_milestone(escrow, &milestone, attempt);
        let processor = self.processor.processor_id();

        let result = match self.processor.release_funds(&instruction).await {
            Ok(receipt) => {
                self.record_transfer(escrow, &instruction, Some(&receipt), None, now)
                    .await;
                self.finish_release(&milestone.milestone_id, &receipt, now)
                    .await
                    .map(|(released, applied)| (released, applied, receipt))
            }
            Err(err) => {
                self.record_transfer(escrow, &instruction, None, Some(&err), now)
                    .await;
                Err(err)
            }
        };

        match result {
            Ok((released, applied, receipt)) => {
                self.retries.lock().await.resolve(&released.milestone_id);
                let mut notifications = Vec::new();
                if applied {
                    info!(
                        milestone_id = %released.milestone_id,
                        transfer_id = %receipt.transfer_id,
                        amount_minor = receipt.amount_minor,
                        processor,
                        "funds released"
                    );
                    self.notify(
                        NotificationKind::MilestoneReleased,
                        &released,
                        &escrow.payee_id,
                        now,
                        &mut notifications,
                    );
                }
                (
                    released,
                    ReleaseDisposition::Released { receipt },
                    notifications,
                )
            }
            Err(err) => {
                let pending = self.retries.lock().await.record_failure(
                    &milestone.milestone_id,
                    &escrow.escrow_id,
                    milestone.amount_minor,
                    err.to_string(),
                    now,
                );
                warn!(
                    milestone_id = %milestone.milestone_id,
                    processor,
                    attempts = pending.attempts,
                    next_attempt_at = %pending.next_attempt_at,
                    error = %err,
                    "fund release failed; milestone stays approved"
                );
                if pending.escalated {
                    error!(
                        milestone_id = %milestone.milestone_id,
                        escrow_id = %escrow.escrow_id,
                        attempts = pending.attempts,
                        "fund release escalated for manual handling"
                    );
                }
                (
                    milestone,
                    ReleaseDisposition::RetryScheduled {
                        attempts: pending.attempts,
                        next_attempt_at: pending.next_attempt_at,
                        escalated: pending.escalated,
                        reason: err.to_string(),
                    },
                    Vec::new(),
                )
            }
        }
    }

    /// `approved -> released` after a confirmed transfer. Returns whether this call
    /// performed the transition.
    async fn finish_release(
        &self,
        milestone_id: &str,
        receipt: &TransferReceipt,
        now: DateTime<Utc>,
    ) -> Result<(Milestone, bool), EscrowError> {
        let mut conflicts = 0u32;
        loop {
            let mut store = self.store.lock().await;
            let (escrow, current) = store.milestone(milestone_id)?;
            let next = match self.machine.release(&current, &receipt.transfer_id, now)? {
                Transition::AlreadyApplied(milestone) => return Ok((milestone, false)),
                Transition::Applied { milestone, .. } => milestone,
            };

            match store.commit_milestone(next, current.version).await {
                Ok(committed) => {
                    let record = TransitionRecord::new(
                        ActionKind::ReleaseFunds,
                        MilestoneStatus::Approved,
                        &committed,
                        Actor::SYSTEM_ID,
                        ActorRole::System,
                    );
                    append_journal(
                        &mut store,
                        &escrow.escrow_id,
                        Some(milestone_id),
                        JournalEntryKind::Transition,
                        &record,
                        now,
                    )
                    .await;
                    return Ok((committed, true));
                }
                Err(EscrowError::Conflict(_)) if conflicts < self.config.max_conflict_retries => {
                    conflicts += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn record_transfer(
        &self,
        escrow: &Escrow,
        instruction: &ReleaseInstruction,
        receipt: Option<&TransferReceipt>,
        failure: Option<&EscrowError>,
        now: DateTime<Utc>,
    ) {
        let record = TransferRecord {
            processor: self.processor.processor_id().to_string(),
            amount_minor: instruction.amount_minor,
            attempt: instruction.attempt,
            transfer_id: receipt.map(|receipt| receipt.transfer_id.clone()),
            error: failure.map(|err| err.to_string()),
        };
        let mut store = self.store.lock().await;
        append_journal(
            &mut store,
            &escrow.escrow_id,
            Some(&instruction.milestone_id),
            JournalEntryKind::Transfer,
            &record,
            now,
        )
        .await;
    }

    fn notify(
        &self,
        kind: NotificationKind,
        milestone: &Milestone,
        recipient_id: &str,
        now: DateTime<Utc>,
        sent: &mut Vec<Notification>,
    ) {
        let notification = Notification::new(kind, milestone, recipient_id, now);
        if let Err(err) = self.notifier.publish(&notification) {
            warn!(
                topic = kind.topic(),
                milestone_id = %milestone.milestone_id,
                recipient_id = %recipient_id,
                error = %err,
                "notification delivery failed"
            );
        }
        sent.push(notification);
    }
}

/// Journal appends follow committed writes, so a failed append is logged rather
/// than surfaced as a failure of the write itself.
async fn append_journal<T: Serialize>(
    store: &mut EscrowStore,
    escrow_id: &str,
    milestone_id: Option<&str>,
    kind: JournalEntryKind,
    payload: &T,
    now: DateTime<Utc>,
) {
    if let Err(err) = store
        .append_journal(escrow_id, milestone_id, kind, payload, now)
        .await
    {
        error!(
            escrow_id = %escrow_id,
            kind = kind.name(),
            error = %err,
            "journal append failed"
        );
    }
}

fn authorize(
    actor: &Actor,
    escrow: &Escrow,
    required: ActorRole,
    operation: &str,
) -> Result<(), EscrowError> {
    if actor.role != required {
        warn!(
            actor_id = %actor.actor_id,
            role = %actor.role,
            escrow_id = %escrow.escrow_id,
            operation,
            "role not permitted for operation"
        );
        return Err(EscrowError::Forbidden(format!(
            "only the {} can {}",
            required, operation
        )));
    }
    ensure_member(actor, escrow, operation)
}

/// Fail closed unless the actor holds the claimed role on this escrow.
fn ensure_member(actor: &Actor, escrow: &Escrow, operation: &str) -> Result<(), EscrowError> {
    let member = match actor.role {
        ActorRole::Payer => actor.actor_id == escrow.payer_id,
        ActorRole::Payee => actor.actor_id == escrow.payee_id,
        ActorRole::System => actor.actor_id == Actor::SYSTEM_ID,
    };
    if member {
        return Ok(());
    }
    warn!(
        actor_id = %actor.actor_id,
        role = %actor.role,
        escrow_id = %escrow.escrow_id,
        operation,
        "actor is not a member of the escrow"
    );
    Err(EscrowError::Forbidden(format!(
        "actor '{}' is not the {} on escrow '{}'",
        actor.actor_id, actor.role, escrow.escrow_id
    )))
}

fn validate_escrow_draft(draft: EscrowDraft) -> Result<EscrowDraft, EscrowError> {
    let payer_id = draft.payer_id.trim().to_string();
    let payee_id = draft.payee_id.trim().to_string();
    let payee_account = draft.payee_account.trim().to_string();
    let currency = draft.currency.trim().to_ascii_uppercase();

    if payer_id.is_empty() || payee_id.is_empty() {
        return Err(EscrowError::Validation(
            "payer_id and payee_id are required".to_string(),
        ));
    }
    if payer_id == payee_id || payer_id == Actor::SYSTEM_ID || payee_id == Actor::SYSTEM_ID {
        return Err(EscrowError::Validation(
            "payer and payee must be two distinct parties".to_string(),
        ));
    }
    if payee_account.is_empty() {
        return Err(EscrowError::Validation(
            "payee_account is required".to_string(),
        ));
    }
    if currency.is_empty() {
        return Err(EscrowError::Validation("currency is required".to_string()));
    }
    if draft.total_minor == 0 {
        return Err(EscrowError::Validation(
            "escrow total must be greater than zero".to_string(),
        ));
    }

    Ok(EscrowDraft {
        payer_id,
        payee_id,
        payee_account,
        contract_type: draft
            .contract_type
            .map(|kind| kind.trim().to_string())
            .filter(|kind| !kind.is_empty()),
        currency,
        total_minor: draft.total_minor,
    })
}
