//! Release scheduler: deadlines for payer action after work is submitted.
//!
//! The scheduler only tracks and reports deadlines. Turning a due entry into an
//! `auto_approve` transition is the orchestrator's job, which also skips milestones
//! that were approved in the meantime.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const DEFAULT_RELEASE_WINDOW_DAYS: i64 = 7;

/// How long a payer has to act on submitted work, per contract type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseWindowConfig {
    pub default_window: Duration,
    pub per_contract_type: BTreeMap<String, Duration>,
}

impl ReleaseWindowConfig {
    pub fn new(default_window: Duration) -> Self {
        Self {
            default_window,
            per_contract_type: BTreeMap::new(),
        }
    }

    pub fn with_override(mut self, contract_type: impl Into<String>, window: Duration) -> Self {
        self.per_contract_type.insert(contract_type.into(), window);
        self
    }

    pub fn window_for(&self, contract_type: Option<&str>) -> Duration {
        contract_type
            .and_then(|kind| self.per_contract_type.get(kind))
            .copied()
            .unwrap_or(self.default_window)
    }
}

impl Default for ReleaseWindowConfig {
    fn default() -> Self {
        Self::new(Duration::days(DEFAULT_RELEASE_WINDOW_DAYS))
    }
}

/// A pending auto-approval deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledRelease {
    pub milestone_id: String,
    pub escrow_id: String,
    pub submitted_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ReleaseScheduler {
    entries: HashMap<String, ScheduledRelease>,
}

impl ReleaseScheduler {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Record `submitted_at + window` as the milestone's deadline, replacing any
    /// earlier entry for it.
    pub fn schedule(
        &mut self,
        milestone_id: &str,
        escrow_id: &str,
        submitted_at: DateTime<Utc>,
        window: Duration,
    ) -> ScheduledRelease {
        let entry = ScheduledRelease {
            milestone_id: milestone_id.to_string(),
            escrow_id: escrow_id.to_string(),
            submitted_at,
            deadline: submitted_at + window,
        };
        self.entries.insert(milestone_id.to_string(), entry.clone());
        entry
    }

    pub fn cancel(&mut self, milestone_id: &str) -> Option<ScheduledRelease> {
        self.entries.remove(milestone_id)
    }

    pub fn deadline(&self, milestone_id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(milestone_id).map(|entry| entry.deadline)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, earliest deadline first.
    pub fn pending(&self) -> Vec<ScheduledRelease> {
        let mut entries: Vec<ScheduledRelease> = self.entries.values().cloned().collect();
        sort_by_deadline(&mut entries);
        entries
    }

    /// Remove and return every entry whose deadline is at or before `now`.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<ScheduledRelease> {
        let due_ids: Vec<String> = self
            .entries
            .values()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.milestone_id.clone())
            .collect();

        let mut due: Vec<ScheduledRelease> = due_ids
            .iter()
            .filter_map(|milestone_id| self.entries.remove(milestone_id))
            .collect();
        sort_by_deadline(&mut due);
        due
    }
}

fn sort_by_deadline(entries: &mut [ScheduledRelease]) {
    entries.sort_by(|a, b| {
        a.deadline
            .cmp(&b.deadline)
            .then_with(|| a.milestone_id.cmp(&b.milestone_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_overrides_apply_per_contract_type() {
        let config = ReleaseWindowConfig::default().with_override("hourly", Duration::days(3));
        assert_eq!(config.window_for(None), Duration::days(7));
        assert_eq!(config.window_for(Some("fixed_price")), Duration::days(7));
        assert_eq!(config.window_for(Some("hourly")), Duration::days(3));
    }

    #[test]
    fn tick_emits_due_entries_once() {
        let mut scheduler = ReleaseScheduler::new();
        let submitted = Utc::now();
        scheduler.schedule("ms-a", "escrow-1", submitted, Duration::days(7));
        scheduler.schedule("ms-b", "escrow-1", submitted, Duration::days(10));

        assert!(scheduler.tick(submitted + Duration::days(6)).is_empty());

        let due = scheduler.tick(submitted + Duration::days(8));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].milestone_id, "ms-a");
        assert_eq!(due[0].deadline, submitted + Duration::days(7));

        assert!(scheduler.tick(submitted + Duration::days(8)).is_empty());
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn deadline_is_inclusive() {
        let mut scheduler = ReleaseScheduler::new();
        let submitted = Utc::now();
        let entry = scheduler.schedule("ms-a", "escrow-1", submitted, Duration::days(7));
        assert_eq!(scheduler.tick(entry.deadline).len(), 1);
    }

    #[test]
    fn cancelled_entries_never_fire() {
        let mut scheduler = ReleaseScheduler::new();
        let submitted = Utc::now();
        scheduler.schedule("ms-a", "escrow-1", submitted, Duration::days(7));
        assert!(scheduler.cancel("ms-a").is_some());
        assert!(scheduler.tick(submitted + Duration::days(30)).is_empty());
        assert!(scheduler.is_empty());
    }

    #[test]
    fn rescheduling_replaces_the_deadline() {
        let mut scheduler = ReleaseScheduler::new();
        let submitted = Utc::now();
        scheduler.schedule("ms-a", "escrow-1", submitted, Duration::days(7));
        scheduler.schedule("ms-a", "escrow-1", submitted, Duration::days(1));
        assert_eq!(scheduler.deadline("ms-a"), Some(submitted + Duration::days(1)));
        assert_eq!(scheduler.pending().len(), 1);
    }
}
