use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Backoff applied to failed fund releases.
///
/// Releases are retried indefinitely; after `escalate_after` attempts the entry is
/// flagged for manual handling but keeps retrying at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub escalate_after: u32,
}

impl RetryPolicy {
    /// Delay before the attempt following `attempts` failures.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        let factor = 1i32 << exponent;
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::seconds(30),
            max_delay: Duration::hours(1),
            escalate_after: 10,
        }
    }
}

/// An approved milestone whose funds still have to reach the payee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRelease {
    pub milestone_id: String,
    pub escrow_id: String,
    pub amount_minor: u64,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    pub escalated: bool,
}

/// At-least-once release queue keyed by milestone.
#[derive(Debug, Clone, Default)]
pub struct ReleaseRetryQueue {
    policy: RetryPolicy,
    entries: BTreeMap<String, PendingRelease>,
}

impl ReleaseRetryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            entries: BTreeMap::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn get(&self, milestone_id: &str) -> Option<&PendingRelease> {
        self.entries.get(milestone_id)
    }

    pub fn attempts(&self, milestone_id: &str) -> u32 {
        self.entries
            .get(milestone_id)
            .map(|entry| entry.attempts)
            .unwrap_or(0)
    }

    /// Queue a release for immediate processing unless it is already tracked.
    pub fn enqueue(
        &mut self,
        milestone_id: &str,
        escrow_id: &str,
        amount_minor: u64,
        now: DateTime<Utc>,
    ) -> PendingRelease {
        self.entries
            .entry(milestone_id.to_string())
            .or_insert_with(|| fresh_entry(milestone_id, escrow_id, amount_minor, now))
            .clone()
    }

    /// Record a failed transfer attempt and schedule the next one.
    pub fn record_failure(
        &mut self,
        milestone_id: &str,
        escrow_id: &str,
        amount_minor: u64,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> PendingRelease {
        let entry = self
            .entries
            .entry(milestone_id.to_string())
            .or_insert_with(|| fresh_entry(milestone_id, escrow_id, amount_minor, now));
        entry.attempts = entry.attempts.saturating_add(1);
        entry.last_error = Some(error.into());
        entry.next_attempt_at = now + self.policy.delay_for(entry.attempts);
        entry.escalated = entry.attempts >= self.policy.escalate_after;
        entry.clone()
    }

    /// Drop the entry once funds are released (or the milestone left `approved`).
    pub fn resolve(&mut self, milestone_id: &str) -> Option<PendingRelease> {
        self.entries.remove(milestone_id)
    }

    /// Entries whose next attempt is due, oldest first.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<PendingRelease> {
        let mut due: Vec<PendingRelease> = self
            .entries
            .values()
            .filter(|entry| entry.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|entry| entry.next_attempt_at);
        due
    }

    pub fn entries(&self) -> Vec<PendingRelease> {
        let mut values: Vec<PendingRelease> = self.entries.values().cloned().collect();
        values.sort_by_key(|entry| entry.queued_at);
        values
    }

    pub fn escalated(&self) -> Vec<PendingRelease> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.escalated)
            .collect()
    }

    /// Merge previously persisted entries, keeping the one with more attempts.
    pub fn restore(&mut self, entries: Vec<PendingRelease>) {
        for entry in entries {
            let keep = self
                .entries
                .get(&entry.milestone_id)
                .map(|existing| existing.attempts < entry.attempts)
                .unwrap_or(true);
            if keep {
                self.entries.insert(entry.milestone_id.clone(), entry);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn fresh_entry(
    milestone_id: &str,
    escrow_id: &str,
    amount_minor: u64,
    now: DateTime<Utc>,
) -> PendingRelease {
    PendingRelease {
        milestone_id: milestone_id.to_string(),
        escrow_id: escrow_id.to_string(),
        amount_minor,
        attempts: 0,
        last_error: None,
        queued_at: now,
        next_attempt_at: now,
        escalated: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::seconds(30));
        assert_eq!(policy.delay_for(2), Duration::seconds(60));
        assert_eq!(policy.delay_for(3), Duration::seconds(120));
        assert_eq!(policy.delay_for(12), Duration::hours(1));
        assert_eq!(policy.delay_for(u32::MAX), Duration::hours(1));
    }

    #[test]
    fn failures_schedule_retries_and_escalate() {
        let policy = RetryPolicy {
            escalate_after: 2,
            ..RetryPolicy::default()
        };
        let mut queue = ReleaseRetryQueue::new(policy);
        let now = Utc::now();

        let first = queue.record_failure("ms-1", "escrow-1", 500, "bank offline", now);
        assert_eq!(first.attempts, 1);
        assert!(!first.escalated);
        assert!(queue.due(now).is_empty());
        assert_eq!(queue.due(now + Duration::seconds(30)).len(), 1);

        let second = queue.record_failure("ms-1", "escrow-1", 500, "invalid account", now);
        assert_eq!(second.attempts, 2);
        assert!(second.escalated);
        assert_eq!(second.last_error.as_deref(), Some("invalid account"));
        assert_eq!(queue.escalated().len(), 1);

        assert!(queue.resolve("ms-1").is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn enqueue_is_idempotent() {
        let mut queue = ReleaseRetryQueue::new(RetryPolicy::default());
        let now = Utc::now();
        queue.record_failure("ms-1", "escrow-1", 500, "timeout", now);
        let entry = queue.enqueue("ms-1", "escrow-1", 500, now);
        assert_eq!(entry.attempts, 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn restore_keeps_the_most_advanced_entry() {
        let now = Utc::now();
        let mut persisted = ReleaseRetryQueue::new(RetryPolicy::default());
        persisted.record_failure("ms-1", "escrow-1", 500, "timeout", now);
        persisted.record_failure("ms-1", "escrow-1", 500, "timeout", now);

        let mut queue = ReleaseRetryQueue::new(RetryPolicy::default());
        queue.enqueue("ms-1", "escrow-1", 500, now);
        queue.restore(persisted.entries());
        assert_eq!(queue.attempts("ms-1"), 2);
    }
}
