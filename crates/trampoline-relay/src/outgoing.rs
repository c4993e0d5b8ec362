//! The outgoing payment engine: an external collaborator, the single- or multi-part sender FSM.
//! This module defines the request the Dispatcher builds and the three terminal/non-terminal
//! events it reports back.

use crate::model::NodeFeePolicy;
use crate::model::Preimage;
use crate::model::RouteParams;
use crate::model::{ChannelId, PaymentFailure};
use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use lightning::ln::PaymentHash;
use lightning::ln::PaymentSecret;
use lightning::routing::router::RouteHint;
use uuid::Uuid;

/// Opaque identifier the outgoing payment engine assigns to a dispatched attempt; the coordinator
/// never inspects it beyond correlating events with the `RelayRegistry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutgoingPaymentId(pub Uuid);

/// One outgoing part the sender FSM settled, used to build the `TrampolinePaymentRelayed` event.
#[derive(Debug, Clone, Copy)]
pub struct OutgoingPart {
    pub channel_id: ChannelId,
    pub amount_with_fees_msat: u64,
}

/// The outgoing payment request built by the Dispatcher. Exactly one of these is ever
/// constructed per relay instance.
#[derive(Debug, Clone)]
pub enum OutgoingPaymentRequest {
    /// Next hop is another trampoline node: a fresh, anti-probing payment secret and the
    /// re-encrypted trampoline onion carried as an additional TLV.
    ToTrampoline {
        target_node_id: PublicKey,
        amount_msat: u64,
        expiry: u32,
        payment_hash: PaymentHash,
        fresh_payment_secret: PaymentSecret,
        trampoline_onion: Vec<u8>,
        route_params: RouteParams,
        max_payment_attempts: u32,
    },
    /// Final, non-trampoline recipient, reached via multi-part payment using the invoice's own
    /// payment secret and routing hints.
    ToNonTrampolineMpp {
        target_node_id: PublicKey,
        amount_msat: u64,
        expiry: u32,
        payment_hash: PaymentHash,
        payment_secret: PaymentSecret,
        routing_hints: Vec<RouteHint>,
        route_params: RouteParams,
        max_payment_attempts: u32,
    },
    /// Single-part payment, to either a trampoline hop or a final recipient that did not request
    /// MPP.
    SinglePart {
        target_node_id: PublicKey,
        amount_msat: u64,
        expiry: u32,
        payment_hash: PaymentHash,
        payment_secret: Option<PaymentSecret>,
        route_params: RouteParams,
        max_payment_attempts: u32,
    },
}

impl OutgoingPaymentRequest {
    pub fn amount_msat(&self) -> u64 {
        match self {
            OutgoingPaymentRequest::ToTrampoline { amount_msat, .. }
            | OutgoingPaymentRequest::ToNonTrampolineMpp { amount_msat, .. }
            | OutgoingPaymentRequest::SinglePart { amount_msat, .. } => *amount_msat,
        }
    }
}

/// The outgoing payment engine: single- or multi-part sender FSM, out of scope for this crate
/// beyond this trait boundary. `store_in_db` and `publish_event` are always `false`: storage and
/// event-bus emission are the Correlator's responsibility, not the engine's.
#[async_trait]
pub trait OutgoingPaymentEngine: Send + Sync {
    async fn dispatch(
        &self,
        request: OutgoingPaymentRequest,
        fee_policy: &NodeFeePolicy,
    ) -> OutgoingPaymentId;
}

/// Terminal/non-terminal events reported back by the outgoing payment engine, funneled by the
/// node's `RelayRegistry` into the owning instance's `RelayEvent` queue.
#[derive(Debug, Clone)]
pub enum OutgoingPaymentEvent {
    PreimageReceived { id: OutgoingPaymentId, preimage: Preimage },
    PaymentSent { id: OutgoingPaymentId, preimage: Preimage, parts: Vec<OutgoingPart> },
    PaymentFailed { id: OutgoingPaymentId, failures: Vec<PaymentFailure> },
}

impl OutgoingPaymentEvent {
    pub fn id(&self) -> OutgoingPaymentId {
        match self {
            OutgoingPaymentEvent::PreimageReceived { id, .. }
            | OutgoingPaymentEvent::PaymentSent { id, .. }
            | OutgoingPaymentEvent::PaymentFailed { id, .. } => *id,
        }
    }
}
