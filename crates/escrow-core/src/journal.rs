use crate::error::EscrowError;
use crate::types::{ActionKind, ActorRole, Milestone, MilestoneStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Journal entry types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JournalEntryKind {
    /// Drafting edits: add, update, remove, distribute.
    Allocation,
    Funding,
    Transition,
    /// Outcome of a payment processor call, successful or not.
    Transfer,
}

impl JournalEntryKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Allocation => "allocation",
            Self::Funding => "funding",
            Self::Transition => "transition",
            Self::Transfer => "transfer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            Self::Allocation,
            Self::Funding,
            Self::Transition,
            Self::Transfer,
        ]
        .into_iter()
        .find(|kind| kind.name() == value)
    }
}

/// Hash-chained journal entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalEntry {
    pub entry_id: String,
    pub index: u64,
    pub escrow_id: String,
    pub milestone_id: Option<String>,
    pub kind: JournalEntryKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

/// Payload of a committed status transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransitionRecord {
    pub action: ActionKind,
    pub from: MilestoneStatus,
    pub to: MilestoneStatus,
    pub actor_id: String,
    pub role: ActorRole,
    pub version: u64,
}

impl TransitionRecord {
    pub fn new(
        action: ActionKind,
        from: MilestoneStatus,
        milestone: &Milestone,
        actor_id: impl Into<String>,
        role: ActorRole,
    ) -> Self {
        Self {
            action,
            from,
            to: milestone.status,
            actor_id: actor_id.into(),
            role,
            version: milestone.version,
        }
    }
}

/// Payload of a processor call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferRecord {
    pub processor: String,
    pub amount_minor: u64,
    pub attempt: u32,
    pub transfer_id: Option<String>,
    pub error: Option<String>,
}

/// Payload of a drafting edit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllocationRecord {
    pub operation: String,
    pub actor_id: String,
    pub milestone_ids: Vec<String>,
    pub allocated_minor: u64,
    pub total_minor: u64,
}

/// Payload of an external funding event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FundingRecord {
    pub amount_minor: u64,
    pub funded_minor: u64,
    pub funded_milestones: Vec<String>,
}

/// Ways an entry can fail to extend a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainBreak {
    Index,
    PreviousHash,
    EntryHash,
}

impl ChainBreak {
    fn describe(self) -> &'static str {
        match self {
            Self::Index => "index out of sequence",
            Self::PreviousHash => "previous hash does not match the chain tip",
            Self::EntryHash => "entry hash does not match its content",
        }
    }
}

impl JournalEntry {
    /// blake3 over the entry's content and its link to the previous entry.
    fn content_hash(&self) -> String {
        let material = serde_json::json!({
            "index": self.index,
            "escrow_id": self.escrow_id,
            "milestone_id": self.milestone_id,
            "kind": self.kind,
            "timestamp": self.timestamp,
            "payload": self.payload,
            "previous_hash": self.previous_hash,
        });
        let bytes = serde_json::to_vec(&material).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }

    /// Whether this entry can sit directly after `tip` (`None` for the first entry).
    fn extends(&self, tip: Option<&JournalEntry>) -> Result<(), ChainBreak> {
        if self.index != tip.map_or(0, |tip| tip.index + 1) {
            return Err(ChainBreak::Index);
        }
        if self.previous_hash.as_deref() != tip.map(|tip| tip.entry_hash.as_str()) {
            return Err(ChainBreak::PreviousHash);
        }
        if self.entry_hash != self.content_hash() {
            return Err(ChainBreak::EntryHash);
        }
        Ok(())
    }
}

/// Append-only transition journal.
///
/// Entries are never edited; corrections are new entries. `build_entry` and
/// `commit_entry` are split so callers can persist an entry before it becomes
/// visible in memory.
#[derive(Debug, Default, Clone)]
pub struct TransitionJournal {
    entries: Vec<JournalEntry>,
}

impl TransitionJournal {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Rehydrate persisted entries, rejecting the set unless it forms one unbroken chain.
    pub fn from_entries(entries: Vec<JournalEntry>) -> Result<Self, EscrowError> {
        let journal = Self { entries };
        if let Some((position, reason)) = journal.first_break() {
            return Err(EscrowError::Storage(format!(
                "persisted journal broken at position {}: {}",
                position,
                reason.describe()
            )));
        }
        Ok(journal)
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries_for_escrow(&self, escrow_id: &str) -> Vec<JournalEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.escrow_id == escrow_id)
            .cloned()
            .collect()
    }

    pub fn entries_for_milestone(&self, milestone_id: &str) -> Vec<JournalEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.milestone_id.as_deref() == Some(milestone_id))
            .cloned()
            .collect()
    }

    pub fn verify_chain(&self) -> bool {
        self.first_break().is_none()
    }

    fn first_break(&self) -> Option<(usize, ChainBreak)> {
        let mut tip = None;
        for (position, entry) in self.entries.iter().enumerate() {
            if let Err(reason) = entry.extends(tip) {
                return Some((position, reason));
            }
            tip = Some(entry);
        }
        None
    }

    /// Build and commit in one step. Only used where no external store is involved.
    pub fn append<T: Serialize>(
        &mut self,
        escrow_id: &str,
        milestone_id: Option<&str>,
        kind: JournalEntryKind,
        payload: &T,
        timestamp: DateTime<Utc>,
    ) -> Result<JournalEntry, EscrowError> {
        let entry = self.build_entry(escrow_id, milestone_id, kind, payload, timestamp)?;
        self.commit_entry(entry.clone())?;
        Ok(entry)
    }

    /// Build the next entry without mutating the in-memory chain.
    pub fn build_entry<T: Serialize>(
        &self,
        escrow_id: &str,
        milestone_id: Option<&str>,
        kind: JournalEntryKind,
        payload: &T,
        timestamp: DateTime<Utc>,
    ) -> Result<JournalEntry, EscrowError> {
        let payload =
            serde_json::to_value(payload).map_err(|e| EscrowError::Serialization(e.to_string()))?;
        let tip = self.entries.last();

        let mut entry = JournalEntry {
            entry_id: Uuid::new_v4().to_string(),
            index: tip.map_or(0, |tip| tip.index + 1),
            escrow_id: escrow_id.to_string(),
            milestone_id: milestone_id.map(str::to_string),
            kind,
            timestamp,
            payload,
            previous_hash: tip.map(|tip| tip.entry_hash.clone()),
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.content_hash();
        Ok(entry)
    }

    /// Commit a pre-built entry after external durability succeeds.
    pub fn commit_entry(&mut self, entry: JournalEntry) -> Result<(), EscrowError> {
        entry.extends(self.entries.last()).map_err(|reason| {
            EscrowError::Storage(format!(
                "journal entry {} rejected: {}",
                entry.index,
                reason.describe()
            ))
        })?;
        self.entries.push(entry);
        Ok(())
    }
}
