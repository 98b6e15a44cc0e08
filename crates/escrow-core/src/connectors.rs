use crate::error::EscrowError;
use crate::types::{Notification, ReleaseInstruction, TransferReceipt};
use async_trait::async_trait;

/// Pluggable payment processor that moves escrowed funds to the payee.
///
/// Implementations must treat `ReleaseInstruction::idempotency_key` as the dedup key:
/// a retried instruction for an already settled milestone returns the original receipt.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    fn processor_id(&self) -> &'static str;

    async fn release_funds(
        &self,
        instruction: &ReleaseInstruction,
    ) -> Result<TransferReceipt, EscrowError>;
}

/// Fire-and-forget delivery of milestone events.
///
/// Failures are logged by the caller and never roll back a committed transition.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, notification: &Notification) -> Result<(), EscrowError>;
}
