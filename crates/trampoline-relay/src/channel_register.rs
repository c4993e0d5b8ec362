//! The channel register and the pending-relay durable store: both out-of-scope external
//! collaborators, reached only through the idempotent "pending-relay durable send" contract.
//!
//! Follows the persist-then-dispatch pattern used for the node's other storage seams,
//! generalized to the two concrete commands this crate needs to issue.

use crate::model::ChannelId;
use crate::model::FailureMessage;
use crate::model::Preimage;
use async_trait::async_trait;

/// Commits an HTLC fail or fulfill to the actual channel commitment protocol. Out of scope
/// beyond this trait: the HTLC commitment-level protocol is not designed here.
#[async_trait]
pub trait ChannelRegister: Send + Sync {
    async fn fail_htlc(&self, channel_id: ChannelId, htlc_id: u64, reason: FailureMessage);
    async fn fulfill_htlc(&self, channel_id: ChannelId, htlc_id: u64, preimage: Preimage);
}

/// Write-ahead log of fail/fulfill commands keyed by `(channel_id, htlc_id)`, replayed on restart
/// by the persistence layer itself. The core depends only on its idempotent-send semantics.
#[async_trait]
pub trait PendingRelayStore: Send + Sync {
    async fn persist_fail(&self, channel_id: ChannelId, htlc_id: u64, reason: &FailureMessage);
    async fn persist_fulfill(&self, channel_id: ChannelId, htlc_id: u64, preimage: &Preimage);
}

/// The "pending-relay durable send" contract: persist the command, then dispatch it to the
/// register. Both operations are idempotent keyed by `(channel_id, htlc_id)`, and the call is
/// fire-and-forget from the caller's point of view — failures are retried by the persistence
/// layer's replay-on-restart, not by this instance.
pub async fn safe_send_fail(
    store: &dyn PendingRelayStore,
    register: &dyn ChannelRegister,
    channel_id: ChannelId,
    htlc_id: u64,
    reason: FailureMessage,
) {
    store.persist_fail(channel_id, htlc_id, &reason).await;
    register.fail_htlc(channel_id, htlc_id, reason).await;
}

/// See [`safe_send_fail`]; the fulfill counterpart of the same persist-then-dispatch contract.
pub async fn safe_send_fulfill(
    store: &dyn PendingRelayStore,
    register: &dyn ChannelRegister,
    channel_id: ChannelId,
    htlc_id: u64,
    preimage: Preimage,
) {
    store.persist_fulfill(channel_id, htlc_id, &preimage).await;
    register.fulfill_htlc(channel_id, htlc_id, preimage).await;
}
