//! The Relay Coordinator: the state machine itself, sequencing Start → Receiving → Sending →
//! Terminal and holding the invariants across all three.
//!
//! The actor shape is a `tokio::spawn`ed task reading one `mpsc::Receiver` in a loop, returned to
//! the caller as a `(Sender, RemoteHandle<()>)` pair so the owning node can hand off events and
//! later await the instance's disposal.

use crate::aggregator::Aggregator;
use crate::budget::compute_route_params;
use crate::budget::validate_relay;
use crate::channel_register::safe_send_fail;
use crate::channel_register::safe_send_fulfill;
use crate::channel_register::ChannelRegister;
use crate::channel_register::PendingRelayStore;
use crate::config::BlockHeightSource;
use crate::config::SharedRelaySettings;
use crate::dispatcher;
use crate::dispatcher::fresh_payment_secret;
use crate::event_bus::EventBus;
use crate::event_bus::PartAmount;
use crate::event_bus::TrampolinePaymentRelayed;
use crate::metrics::RelayMetrics;
use crate::metrics::RelayType;
use crate::model::FailureMessage;
use crate::model::Htlc;
use crate::model::HtlcKey;
use crate::model::NodeRelayPayload;
use crate::model::UpstreamSet;
use crate::outgoing::OutgoingPart;
use crate::outgoing::OutgoingPaymentEngine;
use crate::outgoing::OutgoingPaymentEvent;
use crate::outgoing::OutgoingPaymentId;
use async_trait::async_trait;
use autometrics::autometrics;
use futures::future::RemoteHandle;
use futures::FutureExt;
use lightning::ln::PaymentHash;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// The inbound message type carried on the wire; the outer payload's secret/total-amount live on
/// `add` itself rather than as separate fields, mirroring `Htlc`'s own layout.
#[derive(Debug, Clone)]
pub struct IncomingPacket {
    pub add: Htlc,
    pub inner: NodeRelayPayload,
}

/// Events the aggregator reports back on the instance's own queue.
#[derive(Debug, Clone)]
pub enum AggregatorEvent {
    ExtraPartReceived(Htlc),
    Failed { reason: FailureMessage, parts: Vec<HtlcKey> },
    Succeeded { parts: Vec<HtlcKey> },
}

/// The tagged-union input event every relay instance reads from its single queue: the five
/// heterogeneous upstream event types funneled into one channel.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Incoming(IncomingPacket),
    Aggregator(AggregatorEvent),
    Outgoing(OutgoingPaymentEvent),
}

/// Spawns and tracks an `Aggregator`, injected so tests can substitute a fake one.
#[async_trait]
pub trait AggregatorFactory: Send + Sync {
    async fn spawn(
        &self,
        payment_hash: PaymentHash,
        outer_total_amount_msat: u64,
        relay_sender: mpsc::Sender<RelayEvent>,
    ) -> Arc<dyn Aggregator>;
}

/// The three states of the relay instance's lifecycle, plus the pre-first-HTLC `Start` state
/// used for the entry transition.
enum RelayState {
    Start,
    Receiving {
        htlcs: Vec<Htlc>,
        secret: lightning::ln::PaymentSecret,
        payload_out: NodeRelayPayload,
        aggregator: Arc<dyn Aggregator>,
    },
    Sending {
        htlcs: Vec<Htlc>,
        payload_out: NodeRelayPayload,
        fulfilled_upstream: bool,
    },
    Terminal,
}

/// The node-level external collaborators a relay instance needs, bundled the way the node's
/// own constructor bundles its many dependencies.
pub struct RelayDependencies {
    pub channel_register: Arc<dyn ChannelRegister>,
    pub pending_relay_store: Arc<dyn PendingRelayStore>,
    pub event_bus: Arc<dyn EventBus>,
    pub metrics: Arc<dyn RelayMetrics>,
    pub outgoing_payment_engine: Arc<dyn OutgoingPaymentEngine>,
    pub block_height_source: Arc<dyn BlockHeightSource>,
    pub aggregator_factory: Arc<dyn AggregatorFactory>,
    pub registry: Arc<RelayRegistry>,
    pub settings: SharedRelaySettings,
}

/// `(input sender, RemoteHandle)` pair returned by [`spawn`] so the owning node can hand off
/// events and later await the instance's disposal.
pub struct RelayHandle {
    pub sender: mpsc::Sender<RelayEvent>,
    pub remote_handle: RemoteHandle<()>,
}

const RELAY_EVENT_BUFFER_SIZE: usize = 64;

/// Spawns one relay instance bound to `payment_hash`, with a fresh relay identifier for
/// diagnostics.
#[autometrics]
pub fn spawn(payment_hash: PaymentHash, deps: RelayDependencies) -> RelayHandle {
    let relay_id = Uuid::new_v4();
    let (sender, receiver) = mpsc::channel(RELAY_EVENT_BUFFER_SIZE);

    let coordinator = RelayCoordinator {
        relay_id,
        payment_hash,
        state: RelayState::Start,
        self_sender: sender.clone(),
        deps,
    };

    let (future, remote_handle) = coordinator.run(receiver).remote_handle();
    tokio::spawn(future);

    RelayHandle { sender, remote_handle }
}

struct RelayCoordinator {
    relay_id: Uuid,
    payment_hash: PaymentHash,
    state: RelayState,
    self_sender: mpsc::Sender<RelayEvent>,
    deps: RelayDependencies,
}

impl RelayCoordinator {
    async fn run(mut self, mut receiver: mpsc::Receiver<RelayEvent>) {
        while let Some(event) = receiver.recv().await {
            self.handle_event(event).await;

            if matches!(self.state, RelayState::Terminal) {
                tracing::debug!(
                    relay_id = %self.relay_id,
                    payment_hash = %hex::encode(self.payment_hash.0),
                    "Relay instance reached terminal state, disposing"
                );
                break;
            }
        }
    }

    async fn current_block_height(&self) -> u32 {
        self.deps.block_height_source.current_block_height().await
    }

    async fn handle_event(&mut self, event: RelayEvent) {
        match (std::mem::replace(&mut self.state, RelayState::Terminal), event) {
            (RelayState::Start, RelayEvent::Incoming(packet)) => {
                self.state = self.handle_first_packet(packet).await;
            }
            (
                RelayState::Receiving { htlcs, secret, payload_out, aggregator },
                RelayEvent::Incoming(packet),
            ) => {
                self.state = self
                    .handle_receiving_packet(htlcs, secret, payload_out, aggregator, packet)
                    .await;
            }
            (
                RelayState::Receiving { htlcs, secret, payload_out, aggregator },
                RelayEvent::Aggregator(event),
            ) => {
                self.state = self
                    .handle_aggregator_event(htlcs, secret, payload_out, aggregator, event)
                    .await;
            }
            (RelayState::Sending { htlcs, payload_out, fulfilled_upstream }, RelayEvent::Incoming(packet)) => {
                self.reject_extra_htlc(packet.add).await;
                self.state = RelayState::Sending { htlcs, payload_out, fulfilled_upstream };
            }
            (
                RelayState::Sending { htlcs, payload_out, fulfilled_upstream },
                RelayEvent::Aggregator(AggregatorEvent::ExtraPartReceived(htlc)),
            ) => {
                self.reject_extra_htlc(htlc).await;
                self.state = RelayState::Sending { htlcs, payload_out, fulfilled_upstream };
            }
            (
                RelayState::Sending { htlcs, payload_out, fulfilled_upstream },
                RelayEvent::Aggregator(_),
            ) => {
                // A completion/failure event arriving after the aggregator was already stopped;
                // the set is already committed downstream, so it is simply dropped.
                self.state = RelayState::Sending { htlcs, payload_out, fulfilled_upstream };
            }
            (
                RelayState::Sending { htlcs, payload_out, fulfilled_upstream },
                RelayEvent::Outgoing(event),
            ) => {
                self.state = self
                    .handle_outgoing_event(htlcs, payload_out, fulfilled_upstream, event)
                    .await;
            }
            (RelayState::Terminal, RelayEvent::Incoming(packet)) => {
                self.reject_extra_htlc(packet.add).await;
                self.state = RelayState::Terminal;
            }
            (RelayState::Terminal, RelayEvent::Aggregator(AggregatorEvent::ExtraPartReceived(htlc))) => {
                self.reject_extra_htlc(htlc).await;
                self.state = RelayState::Terminal;
            }
            (RelayState::Terminal, _) => {
                // A stray event other than a late/extra HTLC reached an already-disposed
                // instance: a duplicate aggregator completion or a second outgoing-payment
                // event past the registry's `remove`. Both are a bug upstream of this state
                // machine rather than ordinary protocol noise, so they are logged loudly
                // rather than swallowed silently.
                tracing::error!(
                    relay_id = %self.relay_id,
                    error = %crate::error::RelayError::Terminal,
                    "Dropping event delivered to a terminal relay instance"
                );
                self.state = RelayState::Terminal;
            }
            (RelayState::Start, _) => {
                tracing::warn!(
                    relay_id = %self.relay_id,
                    "Dropping event that arrived before the first incoming HTLC"
                );
                self.state = RelayState::Start;
            }
            (RelayState::Receiving { htlcs, secret, payload_out, aggregator }, RelayEvent::Outgoing(_)) => {
                tracing::warn!(
                    relay_id = %self.relay_id,
                    "Dropping outgoing-payment event that arrived before dispatch"
                );
                self.state = RelayState::Receiving { htlcs, secret, payload_out, aggregator };
            }
        }
    }

    /// Start → Receiving.
    async fn handle_first_packet(&mut self, packet: IncomingPacket) -> RelayState {
        let IncomingPacket { add, inner } = packet;

        let Some(secret) = add.outer_payment_secret else {
            tracing::warn!(
                relay_id = %self.relay_id,
                channel_id = %hex::encode(add.channel_id),
                htlc_id = add.htlc_id,
                "First incoming HTLC is missing a payment secret, failing without spawning an aggregator"
            );
            self.fail_one(&add, self.incorrect_details(add.amount_msat).await).await;
            return RelayState::Terminal;
        };

        let aggregator = self
            .deps
            .aggregator_factory
            .spawn(self.payment_hash, add.outer_total_amount_msat, self.self_sender.clone())
            .await;
        aggregator.add_htlc(add.clone()).await;

        RelayState::Receiving { htlcs: vec![add], secret, payload_out: inner, aggregator }
    }

    /// Receiving, on each additional `IncomingPacket`.
    async fn handle_receiving_packet(
        &mut self,
        mut htlcs: Vec<Htlc>,
        secret: lightning::ln::PaymentSecret,
        payload_out: NodeRelayPayload,
        aggregator: Arc<dyn Aggregator>,
        packet: IncomingPacket,
    ) -> RelayState {
        let add = packet.add;

        match add.outer_payment_secret {
            None => {
                tracing::warn!(relay_id = %self.relay_id, "Additional HTLC missing payment secret");
                self.fail_one(&add, self.incorrect_details(add.amount_msat).await).await;
            }
            Some(other) if other != secret => {
                tracing::warn!(relay_id = %self.relay_id, "Additional HTLC has a mismatched payment secret, possible probing");
                self.fail_one(&add, self.incorrect_details(add.amount_msat).await).await;
            }
            Some(_) => {
                aggregator.add_htlc(add.clone()).await;
                htlcs.push(add);
            }
        }

        RelayState::Receiving { htlcs, secret, payload_out, aggregator }
    }

    async fn handle_aggregator_event(
        &mut self,
        htlcs: Vec<Htlc>,
        secret: lightning::ln::PaymentSecret,
        payload_out: NodeRelayPayload,
        aggregator: Arc<dyn Aggregator>,
        event: AggregatorEvent,
    ) -> RelayState {
        match event {
            AggregatorEvent::ExtraPartReceived(htlc) => {
                // Already aggregating; an extra part beyond the declared total is itself a benign
                // protocol violation by the sender and is failed exactly like a duplicate.
                self.reject_extra_htlc(htlc).await;
                RelayState::Receiving { htlcs, secret, payload_out, aggregator }
            }
            AggregatorEvent::Failed { reason, parts } => {
                aggregator.stop().await;
                self.fail_matching(&htlcs, &parts, reason).await;
                RelayState::Terminal
            }
            AggregatorEvent::Succeeded { .. } => {
                aggregator.stop().await;
                self.on_aggregation_succeeded(htlcs, payload_out).await
            }
        }
    }

    /// `Aggregator.Succeeded`: run `validate_relay`, then either fail the whole set or dispatch
    /// and transition to `Sending`.
    async fn on_aggregation_succeeded(
        &mut self,
        htlcs: Vec<Htlc>,
        payload_out: NodeRelayPayload,
    ) -> RelayState {
        let upstream = UpstreamSet::new(htlcs.clone(), {
            // Every HTLC that reached the aggregated set passed through the secret check in
            // `handle_receiving_packet`, so `outer_payment_secret` is guaranteed `Some` and
            // uniform across the set.
            htlcs[0].outer_payment_secret.expect("checked when the HTLC was admitted to the set")
        });

        let settings = self.deps.settings.current().await;
        let failure = validate_relay(
            &settings.fee_policy,
            upstream.amount_in_msat(),
            upstream.expiry_in(),
            payload_out.amount_to_forward_msat,
            payload_out.outgoing_cltv,
        );

        if let Some(failure) = failure {
            tracing::info!(
                relay_id = %self.relay_id,
                failure = failure.class_name(),
                "Relay budget validation failed before dispatch"
            );
            self.deps.metrics.record_payment_relay_failed(failure.class_name(), RelayType::Trampoline);
            self.fail_all(&htlcs, failure).await;
            return RelayState::Terminal;
        }

        let route_params = compute_route_params(
            &settings.fee_policy,
            upstream.amount_in_msat(),
            upstream.expiry_in(),
            payload_out.amount_to_forward_msat,
            payload_out.outgoing_cltv,
        );

        let request = dispatcher::build_request(
            &payload_out,
            self.payment_hash,
            route_params,
            settings.max_payment_attempts,
            fresh_payment_secret(),
        );

        tracing::info!(
            relay_id = %self.relay_id,
            amount_in_msat = upstream.amount_in_msat(),
            amount_out_msat = request.amount_msat(),
            "Dispatching outgoing trampoline relay payment"
        );

        let outgoing_id =
            dispatcher::dispatch(self.deps.outgoing_payment_engine.as_ref(), request, &settings.fee_policy)
                .await;
        self.deps.registry.register(outgoing_id, self.self_sender.clone());

        RelayState::Sending { htlcs, payload_out, fulfilled_upstream: false }
    }

    /// Sending, on downstream events.
    async fn handle_outgoing_event(
        &mut self,
        htlcs: Vec<Htlc>,
        payload_out: NodeRelayPayload,
        fulfilled_upstream: bool,
        event: OutgoingPaymentEvent,
    ) -> RelayState {
        match event {
            OutgoingPaymentEvent::PreimageReceived { preimage, .. } => {
                if fulfilled_upstream {
                    return RelayState::Sending { htlcs, payload_out, fulfilled_upstream };
                }
                self.fulfill_all(&htlcs, preimage).await;
                RelayState::Sending { htlcs, payload_out, fulfilled_upstream: true }
            }
            OutgoingPaymentEvent::PaymentSent { id, preimage, parts } => {
                if !fulfilled_upstream {
                    self.fulfill_all(&htlcs, preimage).await;
                }
                self.deps.registry.remove(&id);
                self.publish_relayed_event(&htlcs, &parts).await;
                RelayState::Terminal
            }
            OutgoingPaymentEvent::PaymentFailed { id, failures } => {
                self.deps.registry.remove(&id);
                if fulfilled_upstream {
                    // Preimage-then-failure race: warn and do nothing, do not reconcile.
                    tracing::warn!(
                        relay_id = %self.relay_id,
                        "PaymentFailed arrived after upstream was already fulfilled, ignoring"
                    );
                    return RelayState::Sending { htlcs, payload_out, fulfilled_upstream };
                }

                let settings = self.deps.settings.current().await;
                let failure = crate::failure_translator::translate_failures(
                    &failures,
                    &settings.fee_policy,
                    htlcs.iter().map(|h| h.amount_msat).sum(),
                    payload_out.amount_to_forward_msat,
                    payload_out.outgoing_node_id,
                )
                .unwrap_or(FailureMessage::TemporaryNodeFailure);

                self.deps.metrics.record_payment_relay_failed(failure.class_name(), RelayType::Trampoline);
                self.fail_all(&htlcs, failure).await;
                RelayState::Terminal
            }
        }
    }

    async fn incorrect_details(&self, amount_msat: u64) -> FailureMessage {
        FailureMessage::IncorrectOrUnknownPaymentDetails {
            amount_msat,
            current_block_height: self.current_block_height().await,
        }
    }

    /// Extra/late HTLCs are always failed fast with `IncorrectOrUnknownPaymentDetails`, run
    /// identically from `Sending` and `Terminal`.
    async fn reject_extra_htlc(&self, htlc: Htlc) {
        let failure = self.incorrect_details(htlc.amount_msat).await;
        self.fail_one(&htlc, failure).await;
    }

    async fn fail_one(&self, htlc: &Htlc, failure: FailureMessage) {
        safe_send_fail(
            self.deps.pending_relay_store.as_ref(),
            self.deps.channel_register.as_ref(),
            htlc.channel_id,
            htlc.htlc_id,
            failure,
        )
        .await;
    }

    async fn fail_all(&self, htlcs: &[Htlc], failure: FailureMessage) {
        for htlc in htlcs {
            self.fail_one(htlc, failure.clone()).await;
        }
    }

    /// Fails only the HTLCs the aggregator identified as belonging to its failed parts.
    async fn fail_matching(&self, htlcs: &[Htlc], parts: &[HtlcKey], failure: FailureMessage) {
        for htlc in htlcs {
            if parts.contains(&htlc.key()) {
                self.fail_one(htlc, failure.clone()).await;
            }
        }
    }

    async fn fulfill_all(&self, htlcs: &[Htlc], preimage: crate::model::Preimage) {
        for htlc in htlcs {
            safe_send_fulfill(
                self.deps.pending_relay_store.as_ref(),
                self.deps.channel_register.as_ref(),
                htlc.channel_id,
                htlc.htlc_id,
                preimage,
            )
            .await;
        }
    }

    async fn publish_relayed_event(&self, htlcs: &[Htlc], outgoing_parts: &[OutgoingPart]) {
        let incoming_parts = htlcs
            .iter()
            .map(|htlc| PartAmount { channel_id: htlc.channel_id, amount_msat: htlc.amount_msat })
            .collect();
        let outgoing_parts = outgoing_parts
            .iter()
            .map(|part| PartAmount { channel_id: part.channel_id, amount_msat: part.amount_with_fees_msat })
            .collect();

        self.deps
            .event_bus
            .publish(TrampolinePaymentRelayed {
                payment_hash: self.payment_hash,
                incoming_parts,
                outgoing_parts,
            })
            .await;
    }
}

/// Routes outgoing-payment-engine events back to the relay instance that dispatched them: an
/// in-memory registry mapping an outgoing-payment id to the `mpsc::Sender` of its owning
/// instance.
pub struct RelayRegistry {
    senders: Mutex<HashMap<OutgoingPaymentId, mpsc::Sender<RelayEvent>>>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self { senders: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self, id: OutgoingPaymentId, sender: mpsc::Sender<RelayEvent>) {
        self.senders.lock().insert(id, sender);
    }

    pub fn remove(&self, id: &OutgoingPaymentId) {
        self.senders.lock().remove(id);
    }

    /// Routes one outgoing-payment event to its owning instance. Returns `false` if the instance
    /// already disposed itself, in which case the event is simply dropped.
    pub async fn route(&self, event: OutgoingPaymentEvent) -> bool {
        let sender = self.senders.lock().get(&event.id()).cloned();
        match sender {
            Some(sender) => sender.send(RelayEvent::Outgoing(event)).await.is_ok(),
            None => false,
        }
    }
}

impl Default for RelayRegistry {
    fn default() -> Self {
        Self::new()
    }
}
