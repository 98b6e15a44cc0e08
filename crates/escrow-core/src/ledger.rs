use crate::allocation;
use crate::error::EscrowError;
use crate::machine::{MilestoneStateMachine, Transition};
use crate::types::{
    AllocationSummary, Escrow, Milestone, MilestoneDraft, MilestonePatch, MilestoneStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MAX_TITLE_CHARS: usize = 200;

/// Authoritative milestone set for one escrow.
///
/// Invariants:
/// - milestones are ordered by `number`, which is dense and starts at 1;
/// - amounts, membership and order only change while every milestone is `pending`;
/// - status changes only land through [`MilestoneLedger::commit`] or funding, both of
///   which are conditioned on the version the caller read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneLedger {
    escrow: Escrow,
    milestones: Vec<Milestone>,
}

impl MilestoneLedger {
    pub fn new(escrow: Escrow) -> Self {
        Self {
            escrow,
            milestones: Vec::new(),
        }
    }

    /// Rebuild a ledger from persisted rows, rejecting foreign or gapped milestones.
    pub fn from_parts(escrow: Escrow, mut milestones: Vec<Milestone>) -> Result<Self, EscrowError> {
        milestones.sort_by_key(|milestone| milestone.number);

        for (position, milestone) in milestones.iter().enumerate() {
            if milestone.escrow_id != escrow.escrow_id {
                return Err(EscrowError::Storage(format!(
                    "milestone '{}' belongs to escrow '{}', not '{}'",
                    milestone.milestone_id, milestone.escrow_id, escrow.escrow_id
                )));
            }
            if milestone.number as usize != position + 1 {
                return Err(EscrowError::Storage(format!(
                    "milestone numbering gap in escrow '{}' at position {} (found {})",
                    escrow.escrow_id,
                    position + 1,
                    milestone.number
                )));
            }
        }

        if escrow.funded_minor > escrow.total_minor {
            return Err(EscrowError::Storage(format!(
                "escrow '{}' funded {} above its total {}",
                escrow.escrow_id, escrow.funded_minor, escrow.total_minor
            )));
        }

        Ok(Self { escrow, milestones })
    }

    pub fn escrow(&self) -> &Escrow {
        &self.escrow
    }

    pub(crate) fn escrow_mut(&mut self) -> &mut Escrow {
        &mut self.escrow
    }

    pub fn milestones(&self) -> &[Milestone] {
        &self.milestones
    }

    pub fn milestone(&self, milestone_id: &str) -> Option<&Milestone> {
        self.milestones
            .iter()
            .find(|milestone| milestone.milestone_id == milestone_id)
    }

    /// True while no milestone has left `pending`.
    pub fn is_drafting(&self) -> bool {
        self.milestones
            .iter()
            .all(|milestone| milestone.status == MilestoneStatus::Pending)
    }

    pub fn total_allocated(&self) -> u64 {
        let amounts: Vec<u64> = self.milestones.iter().map(|m| m.amount_minor).collect();
        allocation::checked_sum(&amounts).unwrap_or(u64::MAX)
    }

    pub fn total_released(&self) -> u64 {
        self.milestones
            .iter()
            .filter(|milestone| milestone.status == MilestoneStatus::Released)
            .fold(0u64, |acc, milestone| acc.saturating_add(milestone.amount_minor))
    }

    pub fn summary(&self) -> AllocationSummary {
        let allocated = self.total_allocated();
        AllocationSummary {
            escrow_id: self.escrow.escrow_id.clone(),
            currency: self.escrow.currency.clone(),
            total_minor: self.escrow.total_minor,
            allocated_minor: allocated,
            remaining_minor: self.escrow.total_minor.saturating_sub(allocated),
            over_allocated_minor: allocated.saturating_sub(self.escrow.total_minor),
            funded_minor: self.escrow.funded_minor,
            released_minor: self.total_released(),
            milestone_count: self.milestones.len(),
        }
    }

    /// Check the milestone amounts against the contract total.
    pub fn validate_allocation(&self) -> Result<(), EscrowError> {
        if self.milestones.is_empty() {
            return Ok(());
        }
        let amounts: Vec<u64> = self.milestones.iter().map(|m| m.amount_minor).collect();
        allocation::validate(self.escrow.total_minor, &amounts)
    }

    pub fn add_milestone(
        &mut self,
        draft: MilestoneDraft,
        now: DateTime<Utc>,
    ) -> Result<Milestone, EscrowError> {
        self.ensure_drafting()?;
        let title = validate_title(&draft.title)?;
        let amount_minor = match draft.amount_minor {
            Some(amount) => positive_amount(amount)?,
            None => 0,
        };

        let milestone = Milestone {
            milestone_id: Uuid::new_v4().to_string(),
            escrow_id: self.escrow.escrow_id.clone(),
            number: self.milestones.len() as u32 + 1,
            title,
            description: draft.description.trim().to_string(),
            amount_minor,
            due_date: draft.due_date,
            status: MilestoneStatus::Pending,
            rating: None,
            feedback: None,
            auto_approved: false,
            funded_at: None,
            started_at: None,
            submitted_at: None,
            approved_at: None,
            released_at: None,
            release_reference: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        self.milestones.push(milestone.clone());
        self.touch(now);
        Ok(milestone)
    }

    /// Edit a pending milestone. Amount edits additionally require the whole escrow
    /// to still be drafting.
    pub fn update_milestone(
        &mut self,
        milestone_id: &str,
        patch: MilestonePatch,
        now: DateTime<Utc>,
    ) -> Result<Milestone, EscrowError> {
        let index = self.position(milestone_id)?;
        ensure_pending(&self.milestones[index])?;
        if patch.amount_minor.is_some() {
            self.ensure_drafting()?;
        }
        if patch.is_empty() {
            return Ok(self.milestones[index].clone());
        }

        let mut next = self.milestones[index].clone();
        if let Some(title) = patch.title {
            next.title = validate_title(&title)?;
        }
        if let Some(description) = patch.description {
            next.description = description.trim().to_string();
        }
        if let Some(amount) = patch.amount_minor {
            next.amount_minor = positive_amount(amount)?;
        }
        if patch.clear_due_date {
            next.due_date = None;
        } else if let Some(due_date) = patch.due_date {
            next.due_date = Some(due_date);
        }
        next.version += 1;
        next.updated_at = now;

        self.milestones[index] = next.clone();
        self.touch(now);
        Ok(next)
    }

    /// Remove a pending milestone and renumber the ones after it.
    pub fn remove_milestone(
        &mut self,
        milestone_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Milestone, EscrowError> {
        let index = self.position(milestone_id)?;
        ensure_pending(&self.milestones[index])?;
        self.ensure_drafting()?;

        let removed = self.milestones.remove(index);
        for (position, milestone) in self.milestones.iter_mut().enumerate().skip(index) {
            milestone.number = position as u32 + 1;
            milestone.version += 1;
            milestone.updated_at = now;
        }
        self.touch(now);
        Ok(removed)
    }

    /// Replace every amount with an even split of the contract total.
    pub fn distribute_evenly(&mut self, now: DateTime<Utc>) -> Result<Vec<Milestone>, EscrowError> {
        self.ensure_drafting()?;
        let amounts = allocation::distribute_evenly(self.escrow.total_minor, self.milestones.len())?;

        for (milestone, amount) in self.milestones.iter_mut().zip(amounts) {
            if milestone.amount_minor != amount {
                milestone.amount_minor = amount;
                milestone.version += 1;
                milestone.updated_at = now;
            }
        }
        self.touch(now);
        Ok(self.milestones.clone())
    }

    /// Apply a cleared funding event and fund every pending milestone it now covers.
    ///
    /// Milestones are covered in sequence order: milestone `n` is funded once the funded
    /// total reaches the sum of milestones `1..=n`. A fully funded escrow covers all of
    /// them, which absorbs the one-unit allocation tolerance.
    pub fn record_funding(
        &mut self,
        amount_minor: u64,
        machine: &MilestoneStateMachine,
        now: DateTime<Utc>,
    ) -> Result<Vec<Milestone>, EscrowError> {
        if amount_minor == 0 {
            return Err(EscrowError::Validation(
                "funding amount must be greater than zero".to_string(),
            ));
        }
        // Funds received before any milestone exists could never be released.
        if self.milestones.is_empty() {
            return Err(EscrowError::Validation(format!(
                "escrow '{}' has no milestones to fund",
                self.escrow.escrow_id
            )));
        }

        let total = self.escrow.total_minor;
        let funded = self
            .escrow
            .funded_minor
            .checked_add(amount_minor)
            .filter(|funded| *funded <= total)
            .ok_or_else(|| {
                EscrowError::Validation(format!(
                    "funding of {} would exceed contract total {} (already funded {})",
                    amount_minor, total, self.escrow.funded_minor
                ))
            })?;

        if self.is_drafting() {
            self.validate_allocation()?;
        }

        let mut newly_funded = Vec::new();
        let mut cumulative = 0u64;
        for milestone in self.milestones.iter_mut() {
            cumulative = cumulative.saturating_add(milestone.amount_minor);
            if cumulative > funded && funded < total {
                break;
            }
            if milestone.status != MilestoneStatus::Pending {
                continue;
            }
            if let Transition::Applied { milestone: next, .. } = machine.fund(milestone, now)? {
                let version = milestone.version + 1;
                *milestone = Milestone { version, ..next };
                newly_funded.push(milestone.clone());
            }
        }

        self.escrow.funded_minor = funded;
        self.touch(now);
        Ok(newly_funded)
    }

    /// Commit a transitioned milestone if nobody else wrote it since `expected_version`.
    pub fn commit(
        &mut self,
        updated: Milestone,
        expected_version: u64,
    ) -> Result<Milestone, EscrowError> {
        let index = self.position(&updated.milestone_id)?;
        let current = &self.milestones[index];

        if current.version != expected_version {
            return Err(EscrowError::milestone_conflict(&updated.milestone_id));
        }
        if updated.escrow_id != current.escrow_id || updated.number != current.number {
            return Err(EscrowError::Validation(format!(
                "milestone '{}' cannot change escrow or sequence number",
                updated.milestone_id
            )));
        }

        let next = Milestone {
            version: expected_version + 1,
            ..updated
        };
        self.milestones[index] = next.clone();
        Ok(next)
    }

    fn position(&self, milestone_id: &str) -> Result<usize, EscrowError> {
        self.milestones
            .iter()
            .position(|milestone| milestone.milestone_id == milestone_id)
            .ok_or_else(|| EscrowError::milestone_not_found(milestone_id))
    }

    fn ensure_drafting(&self) -> Result<(), EscrowError> {
        match self
            .milestones
            .iter()
            .find(|milestone| milestone.status != MilestoneStatus::Pending)
        {
            Some(locked) => Err(EscrowError::InvalidState {
                milestone_id: locked.milestone_id.clone(),
                status: locked.status,
            }),
            None => Ok(()),
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.escrow.has_milestones = !self.milestones.is_empty();
        self.escrow.updated_at = now;
    }
}

fn ensure_pending(milestone: &Milestone) -> Result<(), EscrowError> {
    if milestone.status != MilestoneStatus::Pending {
        return Err(EscrowError::InvalidState {
            milestone_id: milestone.milestone_id.clone(),
            status: milestone.status,
        });
    }
    Ok(())
}

fn validate_title(title: &str) -> Result<String, EscrowError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(EscrowError::Validation(
            "milestone title is required".to_string(),
        ));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(EscrowError::Validation(format!(
            "milestone title is limited to {} characters",
            MAX_TITLE_CHARS
        )));
    }
    Ok(title.to_string())
}

fn positive_amount(amount_minor: u64) -> Result<u64, EscrowError> {
    if amount_minor == 0 {
        return Err(EscrowError::Validation(
            "milestone amount must be greater than zero".to_string(),
        ));
    }
    Ok(amount_minor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::escrow;

    fn ledger_with(amounts: &[u64], total: u64) -> MilestoneLedger {
        let mut ledger = MilestoneLedger::new(escrow(total));
        for (i, amount) in amounts.iter().enumerate() {
            ledger
                .add_milestone(MilestoneDraft::new(format!("phase {}", i + 1), *amount), Utc::now())
                .unwrap();
        }
        ledger
    }

    fn numbers(ledger: &MilestoneLedger) -> Vec<u32> {
        ledger.milestones().iter().map(|m| m.number).collect()
    }

    #[test]
    fn assigns_dense_sequence_numbers() {
        let ledger = ledger_with(&[100, 200, 300], 600);
        assert_eq!(numbers(&ledger), vec![1, 2, 3]);
        assert!(ledger.escrow().has_milestones);
        assert_eq!(ledger.total_allocated(), 600);
    }

    #[test]
    fn removal_renumbers_remaining_milestones() {
        let mut ledger = ledger_with(&[100, 200, 300], 600);
        let second = ledger.milestones()[1].milestone_id.clone();
        let third = ledger.milestones()[2].milestone_id.clone();

        let removed = ledger.remove_milestone(&second, Utc::now()).unwrap();
        assert_eq!(removed.amount_minor, 200);
        assert_eq!(numbers(&ledger), vec![1, 2]);
        assert_eq!(ledger.milestone(&third).unwrap().number, 2);

        let summary = ledger.summary();
        assert_eq!(summary.allocated_minor, 400);
        assert_eq!(summary.remaining_minor, 200);
    }

    #[test]
    fn explicit_zero_amounts_are_rejected() {
        let mut ledger = MilestoneLedger::new(escrow(1_000));
        let err = ledger
            .add_milestone(MilestoneDraft::new("design", 0), Utc::now())
            .unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)));
    }

    #[test]
    fn unallocated_milestones_are_split_evenly() {
        let mut ledger = MilestoneLedger::new(escrow(25_000));
        for title in ["design", "build", "launch"] {
            ledger
                .add_milestone(MilestoneDraft::unallocated(title), Utc::now())
                .unwrap();
        }
        assert!(ledger.validate_allocation().is_err());

        let milestones = ledger.distribute_evenly(Utc::now()).unwrap();
        let amounts: Vec<u64> = milestones.iter().map(|m| m.amount_minor).collect();
        assert_eq!(amounts, vec![8_333, 8_333, 8_334]);
        assert!(ledger.validate_allocation().is_ok());
    }

    #[test]
    fn funding_requires_a_consistent_allocation() {
        let mut ledger = ledger_with(&[100, 200], 600);
        let err = ledger
            .record_funding(600, &MilestoneStateMachine::new(), Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            EscrowError::Allocation {
                expected: 600,
                actual: 300
            }
        ));
        assert_eq!(ledger.escrow().funded_minor, 0);
    }

    #[test]
    fn funding_without_milestones_is_rejected() {
        let mut ledger = MilestoneLedger::new(escrow(1_000));
        let machine = MilestoneStateMachine::new();

        let err = ledger.record_funding(1_000, &machine, Utc::now()).unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)));
        assert_eq!(ledger.escrow().funded_minor, 0);

        ledger
            .add_milestone(MilestoneDraft::new("late", 1_000), Utc::now())
            .unwrap();
        let funded = ledger.record_funding(1_000, &machine, Utc::now()).unwrap();
        assert_eq!(funded.len(), 1);
        assert_eq!(funded[0].status, MilestoneStatus::Funded);
    }

    #[test]
    fn funding_covers_milestones_in_order() {
        let mut ledger = ledger_with(&[100, 200, 300], 600);
        let machine = MilestoneStateMachine::new();

        let funded = ledger.record_funding(150, &machine, Utc::now()).unwrap();
        assert_eq!(funded.len(), 1);
        assert_eq!(funded[0].number, 1);
        assert_eq!(funded[0].version, 1);

        let funded = ledger.record_funding(450, &machine, Utc::now()).unwrap();
        assert_eq!(
            funded.iter().map(|m| m.number).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert_eq!(ledger.escrow().funded_minor, 600);

        let err = ledger.record_funding(1, &machine, Utc::now()).unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)));
    }

    #[test]
    fn full_funding_covers_tolerance_overshoot() {
        let mut ledger = ledger_with(&[300, 301], 600);
        let funded = ledger
            .record_funding(600, &MilestoneStateMachine::new(), Utc::now())
            .unwrap();
        assert_eq!(funded.len(), 2);
    }

    #[test]
    fn edits_are_locked_after_funding() {
        let mut ledger = ledger_with(&[100, 200], 300);
        ledger
            .record_funding(100, &MilestoneStateMachine::new(), Utc::now())
            .unwrap();
        let first = ledger.milestones()[0].milestone_id.clone();
        let second = ledger.milestones()[1].milestone_id.clone();

        let err = ledger
            .update_milestone(
                &first,
                MilestonePatch {
                    title: Some("renamed".to_string()),
                    ..MilestonePatch::default()
                },
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            EscrowError::InvalidState {
                status: MilestoneStatus::Funded,
                ..
            }
        ));

        // Pending milestones keep their descriptive fields editable, not their amount.
        let renamed = ledger
            .update_milestone(
                &second,
                MilestonePatch {
                    title: Some("launch".to_string()),
                    ..MilestonePatch::default()
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(renamed.title, "launch");
        let err = ledger
            .update_milestone(
                &second,
                MilestonePatch {
                    amount_minor: Some(50),
                    ..MilestonePatch::default()
                },
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidState { .. }));

        assert!(ledger
            .add_milestone(MilestoneDraft::new("extra", 10), Utc::now())
            .is_err());
        assert!(ledger.remove_milestone(&second, Utc::now()).is_err());
    }

    #[test]
    fn commit_rejects_stale_versions() {
        let mut ledger = ledger_with(&[100], 100);
        let machine = MilestoneStateMachine::new();
        let current = ledger.milestones()[0].clone();

        let next = match machine.fund(&current, Utc::now()).unwrap() {
            Transition::Applied { milestone, .. } => milestone,
            Transition::AlreadyApplied(_) => unreachable!(),
        };
        let committed = ledger.commit(next.clone(), current.version).unwrap();
        assert_eq!(committed.version, current.version + 1);

        let err = ledger.commit(next, current.version).unwrap_err();
        assert!(matches!(err, EscrowError::Conflict(_)));
    }

    #[test]
    fn from_parts_rejects_numbering_gaps() {
        let ledger = ledger_with(&[100, 200, 300], 600);
        let escrow = ledger.escrow().clone();
        let mut milestones = ledger.milestones().to_vec();
        milestones.remove(1);

        let err = MilestoneLedger::from_parts(escrow, milestones).unwrap_err();
        assert!(matches!(err, EscrowError::Storage(_)));
    }
}
