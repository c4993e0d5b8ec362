//! The event bus: a fire-and-forget publish sink, out of scope beyond this trait. Follows the
//! node's usual tagged-enum event style.

use crate::model::ChannelId;
use async_trait::async_trait;
use lightning::ln::PaymentHash;

/// One upstream or outgoing part's contribution to a relayed payment, summarized for the event
/// published once the relay completes successfully.
#[derive(Debug, Clone, Copy)]
pub struct PartAmount {
    pub channel_id: ChannelId,
    pub amount_msat: u64,
}

/// Published exactly once per successfully relayed payment, summarizing
/// `{ payment_hash, incoming_parts, outgoing_parts }`.
#[derive(Debug, Clone)]
pub struct TrampolinePaymentRelayed {
    pub payment_hash: PaymentHash,
    pub incoming_parts: Vec<PartAmount>,
    pub outgoing_parts: Vec<PartAmount>,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: TrampolinePaymentRelayed);
}
