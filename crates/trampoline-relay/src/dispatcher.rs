//! Dispatcher: builds exactly one outgoing payment request from the aggregated upstream set and
//! the decrypted inner payload, then hands it to the outgoing payment engine.

use crate::model::NodeRelayPayload;
use crate::model::RouteParams;
use crate::outgoing::OutgoingPaymentId;
use crate::outgoing::OutgoingPaymentEngine;
use crate::outgoing::OutgoingPaymentRequest;
use lightning::ln::PaymentHash;
use lightning::ln::PaymentSecret;
use rand::RngCore;

/// Generates a fresh, anti-probing 32-byte payment secret for the outgoing trampoline-to-
/// trampoline leg. Kept as an injectable function (rather than calling `rand` inline in
/// `build_request`) so tests can assert on a deterministic secret.
pub fn fresh_payment_secret() -> PaymentSecret {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    PaymentSecret(bytes)
}

/// Chooses the outgoing payment variant. Pure given an explicit fresh secret, so it is fully
/// unit-testable without touching global randomness.
pub fn build_request(
    payload_out: &NodeRelayPayload,
    payment_hash: PaymentHash,
    route_params: RouteParams,
    max_payment_attempts: u32,
    fresh_secret: PaymentSecret,
) -> OutgoingPaymentRequest {
    let supports_basic_mpp = payload_out
        .invoice_features
        .as_ref()
        .map(|features| features.supports_basic_mpp())
        .unwrap_or(false);

    if payload_out.invoice_features.is_none() {
        OutgoingPaymentRequest::ToTrampoline {
            target_node_id: payload_out.outgoing_node_id,
            amount_msat: payload_out.amount_to_forward_msat,
            expiry: payload_out.outgoing_cltv,
            payment_hash,
            fresh_payment_secret: fresh_secret,
            trampoline_onion: payload_out.packet_out.clone().unwrap_or_default(),
            route_params,
            max_payment_attempts,
        }
    } else if supports_basic_mpp && payload_out.payment_secret.is_some() {
        OutgoingPaymentRequest::ToNonTrampolineMpp {
            target_node_id: payload_out.outgoing_node_id,
            amount_msat: payload_out.amount_to_forward_msat,
            expiry: payload_out.outgoing_cltv,
            payment_hash,
            payment_secret: payload_out.payment_secret.expect("checked above"),
            routing_hints: payload_out.invoice_routing_info.clone().unwrap_or_default(),
            route_params,
            max_payment_attempts,
        }
    } else {
        OutgoingPaymentRequest::SinglePart {
            target_node_id: payload_out.outgoing_node_id,
            amount_msat: payload_out.amount_to_forward_msat,
            expiry: payload_out.outgoing_cltv,
            payment_hash,
            payment_secret: payload_out.payment_secret,
            route_params,
            max_payment_attempts,
        }
    }
}

/// Hands the built request to the outgoing payment engine. `store_in_db = false` and
/// `publish_event = false` are implicit in this crate's design: the engine trait has no such
/// flags because persistence/event emission are always the Correlator's job, never the engine's.
pub async fn dispatch(
    engine: &dyn OutgoingPaymentEngine,
    request: OutgoingPaymentRequest,
    fee_policy: &crate::model::NodeFeePolicy,
) -> OutgoingPaymentId {
    engine.dispatch(request, fee_policy).await
}
