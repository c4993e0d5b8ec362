//! Failure Translator: a pure function from a list of downstream failure records to at most one
//! upstream failure message, with a fixed, protocol-defined tie-break order.

use crate::model::FailureMessage;
use crate::model::LocalFailureReason;
use crate::model::NodeFeePolicy;
use crate::model::PaymentFailure;
use bitcoin::secp256k1::PublicKey;

/// Evaluates the decision table top to bottom; the first matching rule wins.
///
/// `TrampolineFeeInsufficient` invites the sender to retry with a higher fee budget, which may
/// unlock indirect routes. `TemporaryNodeFailure` is reserved for the case where the sender
/// already paid enough and the bottleneck is local liquidity, so as not to prompt a useless retry.
pub fn translate_failures(
    failures: &[PaymentFailure],
    fee_policy: &NodeFeePolicy,
    amount_in_msat: u64,
    amount_to_forward_msat: u64,
    outgoing_node_id: PublicKey,
) -> Option<FailureMessage> {
    if failures.is_empty() {
        return None;
    }

    if let [PaymentFailure::Local(LocalFailureReason::BalanceTooLow)] = failures {
        let node_fee = fee_policy.node_fee_msat(amount_to_forward_msat);
        let surplus = amount_in_msat.saturating_sub(amount_to_forward_msat);
        return Some(if surplus >= 5 * node_fee {
            FailureMessage::TemporaryNodeFailure
        } else {
            FailureMessage::TrampolineFeeInsufficient
        });
    }

    let route_not_found = failures
        .iter()
        .any(|f| matches!(f, PaymentFailure::Local(LocalFailureReason::RouteNotFound)));
    if route_not_found {
        return Some(FailureMessage::TrampolineFeeInsufficient);
    }

    let remotes: Vec<_> = failures
        .iter()
        .filter_map(|f| match f {
            PaymentFailure::Remote { origin_node_id, failure_message } => {
                Some((*origin_node_id, failure_message))
            }
            PaymentFailure::Local(_) => None,
        })
        .collect();

    if let Some((_, message)) = remotes.iter().find(|(origin, _)| *origin == outgoing_node_id) {
        return Some((*message).clone());
    }

    if let Some((_, message)) = remotes.first() {
        return Some((*message).clone());
    }

    Some(FailureMessage::TemporaryNodeFailure)
}
