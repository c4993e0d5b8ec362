//! Integration tests driving a spawned [`crate::coordinator`] instance end to end against
//! in-memory fakes for every collaborator, exercising the whole state machine rather than
//! mocking individual calls.

use crate::aggregator::Aggregator;
use crate::config::BlockHeightSource;
use crate::config::SharedRelaySettings;
use crate::coordinator::spawn;
use crate::coordinator::AggregatorEvent;
use crate::coordinator::AggregatorFactory;
use crate::coordinator::IncomingPacket;
use crate::coordinator::RelayDependencies;
use crate::coordinator::RelayEvent;
use crate::coordinator::RelayRegistry;
use crate::channel_register::ChannelRegister;
use crate::channel_register::PendingRelayStore;
use crate::event_bus::EventBus;
use crate::event_bus::TrampolinePaymentRelayed;
use crate::metrics::RelayMetrics;
use crate::metrics::RelayType;
use crate::model::ChannelId;
use crate::model::FailureMessage;
use crate::model::Htlc;
use crate::model::LocalFailureReason;
use crate::model::NodeRelayPayload;
use crate::model::PaymentFailure;
use crate::model::Preimage;
use crate::outgoing::OutgoingPart;
use crate::outgoing::OutgoingPaymentEngine;
use crate::outgoing::OutgoingPaymentEvent;
use crate::outgoing::OutgoingPaymentId;
use crate::outgoing::OutgoingPaymentRequest;
use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::secp256k1::SecretKey;
use lightning::ln::PaymentHash;
use lightning::ln::PaymentSecret;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const CURRENT_BLOCK_HEIGHT: u32 = 600_000;

fn target_node_id() -> PublicKey {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[0x42; 32]).unwrap();
    PublicKey::from_secret_key(&secp, &secret)
}

fn channel(byte: u8) -> ChannelId {
    [byte; 32]
}

fn htlc(htlc_id: u64, channel_id: ChannelId, amount_msat: u64, expiry: u32, secret: Option<PaymentSecret>) -> Htlc {
    Htlc {
        htlc_id,
        channel_id,
        amount_msat,
        expiry,
        payment_hash: PaymentHash([0x11; 32]),
        outer_payment_secret: secret,
        outer_total_amount_msat: 1_000_000,
    }
}

fn payload_out(amount_to_forward_msat: u64, outgoing_cltv: u32) -> NodeRelayPayload {
    NodeRelayPayload {
        amount_to_forward_msat,
        outgoing_cltv,
        outgoing_node_id: target_node_id(),
        payment_secret: None,
        invoice_features: None,
        invoice_routing_info: None,
        packet_out: Some(vec![0xAB; 16]),
    }
}

/// Polls until `f` returns `Some`, or panics after one second. Avoids the lost-wakeup hazards of
/// a bare `Notify` given the multiple independent fakes a single test drives concurrently.
async fn wait_until<T>(mut f: impl FnMut() -> Option<T>) -> T {
    for _ in 0..200 {
        if let Some(value) = f() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within timeout");
}

struct FakeChannelRegister {
    fails: Mutex<Vec<(ChannelId, u64, FailureMessage)>>,
    fulfills: Mutex<Vec<(ChannelId, u64, Preimage)>>,
}

impl FakeChannelRegister {
    fn new() -> Self {
        Self { fails: Mutex::new(Vec::new()), fulfills: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl ChannelRegister for FakeChannelRegister {
    async fn fail_htlc(&self, channel_id: ChannelId, htlc_id: u64, reason: FailureMessage) {
        self.fails.lock().push((channel_id, htlc_id, reason));
    }

    async fn fulfill_htlc(&self, channel_id: ChannelId, htlc_id: u64, preimage: Preimage) {
        self.fulfills.lock().push((channel_id, htlc_id, preimage));
    }
}

struct FakePendingRelayStore;

#[async_trait]
impl PendingRelayStore for FakePendingRelayStore {
    async fn persist_fail(&self, _channel_id: ChannelId, _htlc_id: u64, _reason: &FailureMessage) {}

    async fn persist_fulfill(&self, _channel_id: ChannelId, _htlc_id: u64, _preimage: &Preimage) {}
}

struct FakeEventBus {
    published: Mutex<Vec<TrampolinePaymentRelayed>>,
}

impl FakeEventBus {
    fn new() -> Self {
        Self { published: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl EventBus for FakeEventBus {
    async fn publish(&self, event: TrampolinePaymentRelayed) {
        self.published.lock().push(event);
    }
}

struct FakeMetrics {
    failures: Mutex<Vec<(String, RelayType)>>,
}

impl FakeMetrics {
    fn new() -> Self {
        Self { failures: Mutex::new(Vec::new()) }
    }
}

impl RelayMetrics for FakeMetrics {
    fn record_payment_relay_failed(&self, failure_class_name: &str, relay_type: RelayType) {
        self.failures.lock().push((failure_class_name.to_string(), relay_type));
    }
}

struct FakeBlockHeightSource;

#[async_trait]
impl BlockHeightSource for FakeBlockHeightSource {
    async fn current_block_height(&self) -> u32 {
        CURRENT_BLOCK_HEIGHT
    }
}

/// Hands back a fixed, test-controlled outcome rather than actually sending a payment: either a
/// canned failure list or nothing (success is then driven manually via the returned id).
struct FakeOutgoingEngine {
    dispatched: Mutex<Vec<(OutgoingPaymentId, OutgoingPaymentRequest)>>,
}

impl FakeOutgoingEngine {
    fn new() -> Self {
        Self { dispatched: Mutex::new(Vec::new()) }
    }

    fn last_id(&self) -> Option<OutgoingPaymentId> {
        self.dispatched.lock().last().map(|(id, _)| *id)
    }
}

#[async_trait]
impl OutgoingPaymentEngine for FakeOutgoingEngine {
    async fn dispatch(
        &self,
        request: OutgoingPaymentRequest,
        _fee_policy: &crate::model::NodeFeePolicy,
    ) -> OutgoingPaymentId {
        let id = OutgoingPaymentId(Uuid::new_v4());
        self.dispatched.lock().push((id, request));
        id
    }
}

/// A no-op aggregator: this crate's aggregator behaviour is entirely external, so the test drives
/// `Succeeded`/`Failed`/`ExtraPartReceived` directly on the instance's own queue, the way the real
/// aggregator would report back.
struct FakeAggregator {
    added: Mutex<Vec<Htlc>>,
    stopped: Mutex<bool>,
}

#[async_trait]
impl Aggregator for FakeAggregator {
    async fn add_htlc(&self, htlc: Htlc) {
        self.added.lock().push(htlc);
    }

    async fn stop(&self) {
        *self.stopped.lock() = true;
    }

    fn payment_hash(&self) -> PaymentHash {
        PaymentHash([0x11; 32])
    }
}

struct FakeAggregatorFactory {
    aggregator: Arc<FakeAggregator>,
}

impl FakeAggregatorFactory {
    fn new() -> Self {
        Self { aggregator: Arc::new(FakeAggregator { added: Mutex::new(Vec::new()), stopped: Mutex::new(false) }) }
    }
}

#[async_trait]
impl AggregatorFactory for FakeAggregatorFactory {
    async fn spawn(
        &self,
        _payment_hash: PaymentHash,
        _outer_total_amount_msat: u64,
        _relay_sender: tokio::sync::mpsc::Sender<RelayEvent>,
    ) -> Arc<dyn Aggregator> {
        self.aggregator.clone()
    }
}

struct Harness {
    channel_register: Arc<FakeChannelRegister>,
    event_bus: Arc<FakeEventBus>,
    metrics: Arc<FakeMetrics>,
    outgoing_engine: Arc<FakeOutgoingEngine>,
    registry: Arc<RelayRegistry>,
}

impl Harness {
    fn spawn(&self, payment_hash: PaymentHash) -> crate::coordinator::RelayHandle {
        let deps = RelayDependencies {
            channel_register: self.channel_register.clone(),
            pending_relay_store: Arc::new(FakePendingRelayStore),
            event_bus: self.event_bus.clone(),
            metrics: self.metrics.clone(),
            outgoing_payment_engine: self.outgoing_engine.clone(),
            block_height_source: Arc::new(FakeBlockHeightSource),
            aggregator_factory: Arc::new(FakeAggregatorFactory::new()),
            registry: self.registry.clone(),
            settings: SharedRelaySettings::default(),
        };
        spawn(payment_hash, deps)
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self {
            channel_register: Arc::new(FakeChannelRegister::new()),
            event_bus: Arc::new(FakeEventBus::new()),
            metrics: Arc::new(FakeMetrics::new()),
            outgoing_engine: Arc::new(FakeOutgoingEngine::new()),
            registry: Arc::new(RelayRegistry::new()),
        }
    }
}

#[tokio::test]
async fn happy_mpp_trampoline_to_trampoline_fulfills_and_publishes() {
    // Seed scenario 1.
    let harness = Harness::default();
    let payment_hash = PaymentHash([0x11; 32]);
    let handle = harness.spawn(payment_hash);
    let secret = PaymentSecret([0xAA; 32]);

    let htlc_a = htlc(1, channel(1), 600_000, 600_200, Some(secret));
    let htlc_b = htlc(2, channel(2), 400_000, 600_200, Some(secret));

    handle
        .sender
        .send(RelayEvent::Incoming(IncomingPacket { add: htlc_a.clone(), inner: payload_out(950_000, 600_150) }))
        .await
        .unwrap();
    handle
        .sender
        .send(RelayEvent::Incoming(IncomingPacket { add: htlc_b.clone(), inner: payload_out(950_000, 600_150) }))
        .await
        .unwrap();
    handle
        .sender
        .send(RelayEvent::Aggregator(AggregatorEvent::Succeeded { parts: vec![htlc_a.key(), htlc_b.key()] }))
        .await
        .unwrap();

    let outgoing_id = wait_until(|| harness.outgoing_engine.last_id()).await;
    match &harness.outgoing_engine.dispatched.lock().last().unwrap().1 {
        OutgoingPaymentRequest::ToTrampoline { amount_msat, .. } => assert_eq!(*amount_msat, 950_000),
        other => panic!("expected ToTrampoline, got {other:?}"),
    }

    let preimage = Preimage([0x99; 32]);
    handle
        .sender
        .send(RelayEvent::Outgoing(OutgoingPaymentEvent::PreimageReceived { id: outgoing_id, preimage }))
        .await
        .unwrap();

    wait_until(|| (harness.channel_register.fulfills.lock().len() == 2).then_some(())).await;

    handle
        .sender
        .send(RelayEvent::Outgoing(OutgoingPaymentEvent::PaymentSent {
            id: outgoing_id,
            preimage,
            parts: vec![OutgoingPart { channel_id: channel(9), amount_with_fees_msat: 950_000 }],
        }))
        .await
        .unwrap();

    wait_until(|| (!harness.event_bus.published.lock().is_empty()).then_some(())).await;
    handle.remote_handle.await;

    let fulfills = harness.channel_register.fulfills.lock();
    assert!(fulfills.iter().all(|(_, _, p)| *p == preimage));
    assert_eq!(fulfills.len(), 2);
    assert!(harness.channel_register.fails.lock().is_empty());

    let published = harness.event_bus.published.lock();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].incoming_parts.len(), 2);
}

#[tokio::test]
async fn insufficient_fee_fails_both_htlcs_without_dispatch() {
    // Seed scenario 2.
    let harness = Harness::default();
    let payment_hash = PaymentHash([0x22; 32]);
    let handle = harness.spawn(payment_hash);
    let secret = PaymentSecret([0xAA; 32]);

    let htlc_a = htlc(1, channel(1), 600_000, 600_200, Some(secret));
    let htlc_b = htlc(2, channel(2), 400_000, 600_200, Some(secret));

    handle
        .sender
        .send(RelayEvent::Incoming(IncomingPacket { add: htlc_a.clone(), inner: payload_out(999_500, 600_150) }))
        .await
        .unwrap();
    handle
        .sender
        .send(RelayEvent::Incoming(IncomingPacket { add: htlc_b.clone(), inner: payload_out(999_500, 600_150) }))
        .await
        .unwrap();
    handle
        .sender
        .send(RelayEvent::Aggregator(AggregatorEvent::Succeeded { parts: vec![htlc_a.key(), htlc_b.key()] }))
        .await
        .unwrap();

    wait_until(|| (harness.channel_register.fails.lock().len() == 2).then_some(())).await;
    handle.remote_handle.await;

    let fails = harness.channel_register.fails.lock();
    assert!(fails.iter().all(|(_, _, reason)| *reason == FailureMessage::TrampolineFeeInsufficient));
    assert!(harness.outgoing_engine.dispatched.lock().is_empty());
}

#[tokio::test]
async fn secret_mismatch_fails_only_the_offending_htlc() {
    // Seed scenario 3.
    let harness = Harness::default();
    let payment_hash = PaymentHash([0x33; 32]);
    let handle = harness.spawn(payment_hash);

    let htlc_a = htlc(1, channel(1), 600_000, 600_200, Some(PaymentSecret([0xAA; 32])));
    let htlc_b = htlc(2, channel(2), 400_000, 600_200, Some(PaymentSecret([0xBB; 32])));

    handle
        .sender
        .send(RelayEvent::Incoming(IncomingPacket { add: htlc_a, inner: payload_out(950_000, 600_150) }))
        .await
        .unwrap();
    handle
        .sender
        .send(RelayEvent::Incoming(IncomingPacket { add: htlc_b.clone(), inner: payload_out(950_000, 600_150) }))
        .await
        .unwrap();

    wait_until(|| (!harness.channel_register.fails.lock().is_empty()).then_some(())).await;

    let fails = harness.channel_register.fails.lock();
    assert_eq!(fails.len(), 1);
    assert_eq!(fails[0].0, channel(2));
    assert_eq!(fails[0].1, 2);
    assert!(matches!(fails[0].2, FailureMessage::IncorrectOrUnknownPaymentDetails { .. }));
    assert!(harness.channel_register.fulfills.lock().is_empty());
}

#[tokio::test]
async fn downstream_balance_too_low_with_large_surplus_is_temporary_node_failure() {
    // Seed scenario 5.
    let harness = Harness::default();
    let payment_hash = PaymentHash([0x55; 32]);
    let handle = harness.spawn(payment_hash);
    let secret = PaymentSecret([0xAA; 32]);

    let htlc_a = htlc(1, channel(1), 956_000, 600_200, Some(secret));

    handle
        .sender
        .send(RelayEvent::Incoming(IncomingPacket { add: htlc_a.clone(), inner: payload_out(950_000, 600_150) }))
        .await
        .unwrap();
    handle
        .sender
        .send(RelayEvent::Aggregator(AggregatorEvent::Succeeded { parts: vec![htlc_a.key()] }))
        .await
        .unwrap();

    let outgoing_id = wait_until(|| harness.outgoing_engine.last_id()).await;

    handle
        .sender
        .send(RelayEvent::Outgoing(OutgoingPaymentEvent::PaymentFailed {
            id: outgoing_id,
            failures: vec![PaymentFailure::Local(LocalFailureReason::BalanceTooLow)],
        }))
        .await
        .unwrap();

    wait_until(|| (!harness.channel_register.fails.lock().is_empty()).then_some(())).await;
    handle.remote_handle.await;

    let fails = harness.channel_register.fails.lock();
    assert_eq!(fails.len(), 1);
    assert_eq!(fails[0].2, FailureMessage::TemporaryNodeFailure);
    assert_eq!(harness.metrics.failures.lock()[0].0, "temporary_node_failure");
}

#[tokio::test]
async fn preimage_then_failure_race_fulfills_once_and_swallows_the_failure() {
    // Seed scenario 6.
    let harness = Harness::default();
    let payment_hash = PaymentHash([0x66; 32]);
    let handle = harness.spawn(payment_hash);
    let secret = PaymentSecret([0xAA; 32]);

    let htlc_a = htlc(1, channel(1), 1_000_000, 600_200, Some(secret));

    handle
        .sender
        .send(RelayEvent::Incoming(IncomingPacket { add: htlc_a.clone(), inner: payload_out(950_000, 600_150) }))
        .await
        .unwrap();
    handle
        .sender
        .send(RelayEvent::Aggregator(AggregatorEvent::Succeeded { parts: vec![htlc_a.key()] }))
        .await
        .unwrap();

    let outgoing_id = wait_until(|| harness.outgoing_engine.last_id()).await;
    let preimage = Preimage([0x42; 32]);

    handle
        .sender
        .send(RelayEvent::Outgoing(OutgoingPaymentEvent::PreimageReceived { id: outgoing_id, preimage }))
        .await
        .unwrap();
    wait_until(|| (!harness.channel_register.fulfills.lock().is_empty()).then_some(())).await;

    handle
        .sender
        .send(RelayEvent::Outgoing(OutgoingPaymentEvent::PaymentFailed { id: outgoing_id, failures: vec![] }))
        .await
        .unwrap();

    // The instance stays in `Sending` after a post-fulfillment failure; it is only the later
    // `PaymentSent` that would move it to `Terminal`. Give the queue a moment to drain.
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(harness.channel_register.fulfills.lock().len(), 1);
    assert!(harness.channel_register.fails.lock().is_empty());
}

#[tokio::test]
async fn extra_htlc_after_dispatch_is_rejected_without_disturbing_the_set() {
    let harness = Harness::default();
    let payment_hash = PaymentHash([0x77; 32]);
    let handle = harness.spawn(payment_hash);
    let secret = PaymentSecret([0xAA; 32]);

    let htlc_a = htlc(1, channel(1), 1_000_000, 600_200, Some(secret));
    handle
        .sender
        .send(RelayEvent::Incoming(IncomingPacket { add: htlc_a.clone(), inner: payload_out(950_000, 600_150) }))
        .await
        .unwrap();
    handle
        .sender
        .send(RelayEvent::Aggregator(AggregatorEvent::Succeeded { parts: vec![htlc_a.key()] }))
        .await
        .unwrap();

    wait_until(|| harness.outgoing_engine.last_id()).await;

    let late = htlc(2, channel(2), 100_000, 600_200, Some(secret));
    handle
        .sender
        .send(RelayEvent::Incoming(IncomingPacket { add: late, inner: payload_out(950_000, 600_150) }))
        .await
        .unwrap();

    wait_until(|| (!harness.channel_register.fails.lock().is_empty()).then_some(())).await;

    let fails = harness.channel_register.fails.lock();
    assert_eq!(fails.len(), 1);
    assert_eq!(fails[0].0, channel(2));
    assert!(matches!(fails[0].2, FailureMessage::IncorrectOrUnknownPaymentDetails { .. }));
}

#[tokio::test]
async fn relay_registry_routes_and_forgets() {
    let registry = RelayRegistry::new();
    let (sender, mut receiver) = tokio::sync::mpsc::channel(8);
    let id = OutgoingPaymentId(Uuid::new_v4());
    registry.register(id, sender);

    let preimage = Preimage([0x01; 32]);
    let routed = registry
        .route(OutgoingPaymentEvent::PreimageReceived { id, preimage })
        .await;
    assert!(routed);
    assert!(matches!(
        receiver.recv().await,
        Some(RelayEvent::Outgoing(OutgoingPaymentEvent::PreimageReceived { .. }))
    ));

    registry.remove(&id);
    let routed_after_remove = registry
        .route(OutgoingPaymentEvent::PreimageReceived { id, preimage })
        .await;
    assert!(!routed_after_remove);
}
