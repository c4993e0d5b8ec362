//! Aggregator interface: the multi-part receiver FSM is an external collaborator. The
//! coordinator only needs to feed it incoming HTLCs and listen for three events on its own
//! `RelayEvent` queue (see `coordinator::RelayEvent`).
//!
//! External subsystems are injected as trait objects here, never as concrete types baked into
//! the coordinator, matching the storage/wallet trait seams used elsewhere in the node.

use crate::model::Htlc;
use async_trait::async_trait;
use lightning::ln::PaymentHash;

/// A single part reported by the aggregator, scoped to the HTLC it corresponds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatedPart {
    pub channel_id: crate::model::ChannelId,
    pub htlc_id: u64,
}

/// Why the aggregator gave up on the set (e.g. a global receive timeout it owns internally).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorFailure(pub crate::model::FailureMessage);

/// The multi-part receiver FSM bound to one payment hash.
///
/// The aggregator owns the inbound timeout and total-amount completion check; the coordinator
/// only ever calls `add_htlc` and reacts to whatever it later sends back as a
/// `RelayEvent::Aggregator(..)`.
#[async_trait]
pub trait Aggregator: Send + Sync {
    /// Feed one more incoming HTLC part to the aggregator for the payment hash it was spawned
    /// for. The aggregator reports completion/failure/extra-part asynchronously.
    async fn add_htlc(&self, htlc: Htlc);

    /// Stop the aggregator; it must not emit further events on its output channel after this
    /// returns, though stray in-flight messages may still arrive.
    async fn stop(&self);

    fn payment_hash(&self) -> PaymentHash;
}
