//! Milestone escrow core.
//!
//! This crate holds the payer/payee milestone workflow: allocation checks over the
//! contract budget, the per-escrow milestone ledger, a closed transition table,
//! auto-approval deadlines, at-least-once fund releases and a hash-chained journal.

#![deny(unsafe_code)]

pub mod allocation;
pub mod connectors;
pub mod error;
pub mod journal;
pub mod ledger;
pub mod machine;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod types;

#[cfg(test)]
mod testing;

pub use allocation::ALLOCATION_TOLERANCE_MINOR;
pub use connectors::{NotificationSink, PaymentProcessor};
pub use error::EscrowError;
pub use journal::{JournalEntry, JournalEntryKind, TransitionJournal};
pub use ledger::MilestoneLedger;
pub use machine::{MilestoneStateMachine, Transition, TransitionRule};
pub use orchestrator::{RetryReport, TickFailure, TickReport, WorkflowConfig, WorkflowOrchestrator};
pub use retry::{PendingRelease, ReleaseRetryQueue, RetryPolicy};
pub use scheduler::{ReleaseScheduler, ReleaseWindowConfig, ScheduledRelease};
pub use storage::{EscrowStore, StorageConfig};
pub use types::{
    ActionKind, ActionOutcome, Actor, ActorRole, AllocationSummary, Escrow, EscrowDraft,
    FundingOutcome, Milestone, MilestoneAction, MilestoneDraft, MilestonePatch, MilestoneStatus,
    Notification, NotificationKind, ReleaseDisposition, ReleaseInstruction, TransferReceipt,
};
