//! Shared fixtures for unit tests.

use crate::types::{Escrow, EscrowDraft, Milestone, MilestoneStatus};
use chrono::Utc;

pub(crate) fn escrow(total_minor: u64) -> Escrow {
    EscrowDraft::new("payer-1", "payee-1", "acct-payee-1", "INR", total_minor).into_escrow(Utc::now())
}

pub(crate) fn milestone_in(status: MilestoneStatus) -> Milestone {
    let now = Utc::now();
    Milestone {
        milestone_id: "ms-1".to_string(),
        escrow_id: "escrow-1".to_string(),
        number: 1,
        title: "Wireframes".to_string(),
        description: String::new(),
        amount_minor: 10_000,
        due_date: None,
        status,
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
    }
}
