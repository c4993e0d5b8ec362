//! Budget Calculator: a pure function pair deciding whether a relay is profitable and
//! timelock-safe, and deriving the route constraints handed to the outgoing payment engine.

use crate::model::FailureMessage;
use crate::model::NodeFeePolicy;
use crate::model::RouteParams;

/// `validate_relay`: `None` means the relay may proceed to dispatch.
///
/// Both comparisons are strict inequalities: an exact-fee or exact-expiry payment passes.
pub fn validate_relay(
    fee_policy: &NodeFeePolicy,
    amount_in_msat: u64,
    expiry_in: u32,
    amount_out_msat: u64,
    expiry_out: u32,
) -> Option<FailureMessage> {
    let node_fee = fee_policy.node_fee_msat(amount_out_msat);

    if amount_in_msat.saturating_sub(amount_out_msat) < node_fee {
        return Some(FailureMessage::TrampolineFeeInsufficient);
    }

    if expiry_in.saturating_sub(expiry_out) < fee_policy.expiry_delta {
        return Some(FailureMessage::TrampolineExpiryTooSoon);
    }

    None
}

/// `compute_route_params`: only called once `validate_relay` has returned `None`, so the
/// subtractions below never underflow.
pub fn compute_route_params(
    fee_policy: &NodeFeePolicy,
    amount_in_msat: u64,
    expiry_in: u32,
    amount_out_msat: u64,
    expiry_out: u32,
) -> RouteParams {
    let node_fee = fee_policy.node_fee_msat(amount_out_msat);

    RouteParams {
        max_fee_base_msat: amount_in_msat - amount_out_msat - node_fee,
        route_max_cltv: expiry_in - expiry_out - fee_policy.expiry_delta,
        max_fee_pct: 0,
    }
}
