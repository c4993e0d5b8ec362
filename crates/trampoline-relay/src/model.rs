//! Core data types shared by every component of the relay.
//!
//! Field naming and the use of `lightning`/`bitcoin` primitive types instead of hand-rolled byte
//! arrays follow the rest of the node's internal conventions wherever the crate already has a
//! type for something.

use bitcoin::secp256k1::PublicKey;
use lightning::ln::features::InvoiceFeatures;
use lightning::ln::PaymentHash;
use lightning::ln::PaymentPreimage;
use lightning::ln::PaymentSecret;
use lightning::routing::router::RouteHint;
use serde::Deserialize;
use serde::Serialize;

/// A channel's short identifier as used by the channel register, not a BOLT-7 SCID.
pub type ChannelId = [u8; 32];

/// Uniquely identifies an incoming HTLC within this node: `(channel_id, htlc_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HtlcKey {
    pub channel_id: ChannelId,
    pub htlc_id: u64,
}

/// An incoming HTLC add, as handed to the relay by the channel layer after onion peeling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Htlc {
    pub htlc_id: u64,
    pub channel_id: ChannelId,
    pub amount_msat: u64,
    /// Absolute block height at which this HTLC times out on-chain.
    pub expiry: u32,
    pub payment_hash: PaymentHash,
    pub outer_payment_secret: Option<PaymentSecret>,
    pub outer_total_amount_msat: u64,
}

impl Htlc {
    pub fn key(&self) -> HtlcKey {
        HtlcKey { channel_id: self.channel_id, htlc_id: self.htlc_id }
    }
}

/// The decrypted inner trampoline onion payload.
///
/// The presence of `invoice_features` signals that `outgoing_node_id` is the final,
/// non-trampoline recipient rather than the next trampoline hop.
#[derive(Debug, Clone)]
pub struct NodeRelayPayload {
    pub amount_to_forward_msat: u64,
    pub outgoing_cltv: u32,
    pub outgoing_node_id: PublicKey,
    pub payment_secret: Option<PaymentSecret>,
    pub invoice_features: Option<InvoiceFeatures>,
    pub invoice_routing_info: Option<Vec<RouteHint>>,
    /// The onion to hand to the next trampoline hop, opaque to this crate.
    pub packet_out: Option<Vec<u8>>,
}

impl NodeRelayPayload {
    /// `true` when this payload targets a non-trampoline recipient directly.
    pub fn is_final_recipient(&self) -> bool {
        self.invoice_features.is_some()
    }
}

/// The aggregated set of upstream HTLCs making up one incoming payment.
#[derive(Debug, Clone)]
pub struct UpstreamSet {
    pub adds: Vec<Htlc>,
    pub secret: PaymentSecret,
}

impl UpstreamSet {
    /// Every element of `adds` shares the same `outer_payment_secret == secret`.
    pub fn new(adds: Vec<Htlc>, secret: PaymentSecret) -> Self {
        debug_assert!(adds
            .iter()
            .all(|htlc| htlc.outer_payment_secret == Some(secret)));
        Self { adds, secret }
    }

    pub fn amount_in_msat(&self) -> u64 {
        self.adds.iter().map(|htlc| htlc.amount_msat).sum()
    }

    /// `expiry_in = min(adds[i].expiry)`. Panics on an empty set, which never reaches the
    /// coordinator: `Succeeded` is only raised by the aggregator once at least one part exists.
    pub fn expiry_in(&self) -> u32 {
        self.adds
            .iter()
            .map(|htlc| htlc.expiry)
            .min()
            .expect("upstream set is never empty when aggregated")
    }
}

/// The node's fee policy, as consumed from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFeePolicy {
    pub fee_base_msat: u64,
    pub fee_proportional_millionth: u64,
    pub expiry_delta: u32,
}

impl NodeFeePolicy {
    /// `fee_base_msat + (a * fee_proportional_millionth) / 1_000_000`, integer arithmetic, no
    /// rounding after the division.
    pub fn node_fee_msat(&self, amount_msat: u64) -> u64 {
        self.fee_base_msat + (amount_msat * self.fee_proportional_millionth) / 1_000_000
    }
}

/// Route constraints handed to the outgoing payment engine. `max_fee_pct` is always zero: the
/// relay forbids percentage-based fee bounds and advertises only what the sender explicitly paid
/// for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteParams {
    pub max_fee_base_msat: u64,
    pub route_max_cltv: u32,
    pub max_fee_pct: u8,
}

/// The reason an outgoing attempt failed locally, before or instead of a remote failure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalFailureReason {
    RouteNotFound,
    BalanceTooLow,
    Other,
}

/// A single downstream failure record, as reported by the outgoing payment engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentFailure {
    Local(LocalFailureReason),
    Remote { origin_node_id: PublicKey, failure_message: FailureMessage },
}

/// BOLT-4 failure messages. Names are retained verbatim because they are wire constants; no
/// on-wire encoding is implemented here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureMessage {
    IncorrectOrUnknownPaymentDetails { amount_msat: u64, current_block_height: u32 },
    TrampolineFeeInsufficient,
    TrampolineExpiryTooSoon,
    TemporaryNodeFailure,
    /// A failure message received verbatim from a downstream node and forwarded unmodified.
    Remote(Vec<u8>),
}

impl FailureMessage {
    /// Stable label for `metrics.record_payment_relay_failed(failure_class_name, ...)`.
    pub fn class_name(&self) -> &'static str {
        match self {
            FailureMessage::IncorrectOrUnknownPaymentDetails { .. } => {
                "incorrect_or_unknown_payment_details"
            }
            FailureMessage::TrampolineFeeInsufficient => "trampoline_fee_insufficient",
            FailureMessage::TrampolineExpiryTooSoon => "trampoline_expiry_too_soon",
            FailureMessage::TemporaryNodeFailure => "temporary_node_failure",
            FailureMessage::Remote(_) => "remote",
        }
    }
}

/// A settled payment preimage, re-exported from the `lightning` crate's type for clarity at call
/// sites.
pub type Preimage = PaymentPreimage;
