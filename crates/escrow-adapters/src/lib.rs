//! Payment processor and notification adapters for milestone escrow.

#![deny(unsafe_code)]

use async_trait::async_trait;
use chrono::Utc;
use escrow_core::connectors::{NotificationSink, PaymentProcessor};
use escrow_core::error::EscrowError;
use escrow_core::types::{Notification, ReleaseInstruction, TransferReceipt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

/// Mock payment processor for deterministic local settlement.
///
/// Settles each idempotency key once; repeating an instruction returns the receipt
/// of the first settlement.
#[derive(Debug, Clone, Default)]
pub struct MockPaymentProcessor {
    settled: Arc<Mutex<HashMap<String, TransferReceipt>>>,
}

impl MockPaymentProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settled_count(&self) -> usize {
        self.settled.lock().map(|settled| settled.len()).unwrap_or(0)
    }
}

#[async_trait]
impl PaymentProcessor for MockPaymentProcessor {
    fn processor_id(&self) -> &'static str {
        "mock"
    }

    async fn release_funds(
        &self,
        instruction: &ReleaseInstruction,
    ) -> Result<TransferReceipt, EscrowError> {
        let mut settled = self.settled.lock().map_err(|_| EscrowError::ExternalTransfer {
            processor: self.processor_id().to_string(),
            message: "settlement book lock poisoned".to_string(),
        })?;

        if let Some(receipt) = settled.get(&instruction.idempotency_key) {
            debug!(
                milestone_id = %instruction.milestone_id,
                transfer_id = %receipt.transfer_id,
                "duplicate release instruction; returning original receipt"
            );
            return Ok(receipt.clone());
        }

        let short_id: String = Uuid::new_v4().simple().to_string().chars().take(12).collect();
        let receipt = TransferReceipt {
            transfer_id: format!("mock-{short_id}"),
            processor: self.processor_id().to_string(),
            milestone_id: instruction.milestone_id.clone(),
            amount_minor: instruction.amount_minor,
            settled_at: Utc::now(),
        };
        settled.insert(instruction.idempotency_key.clone(), receipt.clone());
        Ok(receipt)
    }
}

/// Deterministic failing processor useful for retry and escalation drills.
#[derive(Debug, Clone)]
pub struct AlwaysFailProcessor {
    reason: String,
}

impl AlwaysFailProcessor {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl PaymentProcessor for AlwaysFailProcessor {
    fn processor_id(&self) -> &'static str {
        "always-fail"
    }

    async fn release_funds(
        &self,
        _instruction: &ReleaseInstruction,
    ) -> Result<TransferReceipt, EscrowError> {
        Err(EscrowError::ExternalTransfer {
            processor: self.processor_id().to_string(),
            message: self.reason.clone(),
        })
    }
}

/// Fails the first `failures` calls, then settles like [`MockPaymentProcessor`].
#[derive(Debug, Clone)]
pub struct FlakyPaymentProcessor {
    remaining_failures: Arc<AtomicU32>,
    inner: MockPaymentProcessor,
}

impl FlakyPaymentProcessor {
    pub fn new(failures: u32) -> Self {
        Self {
            remaining_failures: Arc::new(AtomicU32::new(failures)),
            inner: MockPaymentProcessor::new(),
        }
    }
}

#[async_trait]
impl PaymentProcessor for FlakyPaymentProcessor {
    fn processor_id(&self) -> &'static str {
        "flaky"
    }

    async fn release_funds(
        &self,
        instruction: &ReleaseInstruction,
    ) -> Result<TransferReceipt, EscrowError> {
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EscrowError::ExternalTransfer {
                processor: self.processor_id().to_string(),
                message: format!("transient failure on attempt {}", instruction.attempt),
            });
        }
        self.inner.release_funds(instruction).await
    }
}

/// Emits every notification as a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn publish(&self, notification: &Notification) -> Result<(), EscrowError> {
        info!(
            topic = notification.kind.topic(),
            notification_id = %notification.notification_id,
            escrow_id = %notification.escrow_id,
            milestone_id = %notification.milestone_id,
            recipient_id = %notification.recipient_id,
            "notification published"
        );
        Ok(())
    }
}

/// Keeps published notifications in memory for inspection.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotificationSink {
    published: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<Notification> {
        self.published
            .lock()
            .map(|published| published.clone())
            .unwrap_or_default()
    }
}

impl NotificationSink for RecordingNotificationSink {
    fn publish(&self, notification: &Notification) -> Result<(), EscrowError> {
        self.published
            .lock()
            .map_err(|_| EscrowError::Storage("notification buffer lock poisoned".to_string()))?
            .push(notification.clone());
        Ok(())
    }
}

/// Rejects every notification; used to check that delivery never blocks the workflow.
#[derive(Debug, Clone)]
pub struct FailingNotificationSink {
    reason: String,
}

impl FailingNotificationSink {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl NotificationSink for FailingNotificationSink {
    fn publish(&self, _notification: &Notification) -> Result<(), EscrowError> {
        Err(EscrowError::Storage(format!(
            "notification delivery failed: {}",
            self.reason
        )))
    }
}
