use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use print_dispatch::clock::{Clock, ManualClock};
use print_dispatch::courier::{
    CourierProvider, ProviderError, ProviderStatusWebhook, Shipment, ShipmentRequest,
    UnconfiguredCourier,
};
use print_dispatch::engine::EngineSettings;
use print_dispatch::engine::directory::NewAgent;
use print_dispatch::engine::lifecycle::{
    EngineDeps, NewOrder, OrderEngine, TransitionRequest, WebhookOutcome,
};
use print_dispatch::engine::scheduler::{AssignOutcome, RandomSelector, ReleaseOutcome};
use print_dispatch::error::EngineError;
use print_dispatch::models::agent::{AccountStatus, Agent, Availability};
use print_dispatch::models::otp::DeliveryOtp;
use print_dispatch::models::order::{
    Actor, DeliveryChannel, DeliveryProof, Order, OrderStatus, Payment, PaymentMethod,
    PaymentStatus, PrintItem,
};
use print_dispatch::notify::{Notification, Notifier, NotifyError, RefundGateway};
use print_dispatch::observability::metrics::Metrics;
use print_dispatch::store::memory::MemoryStore;
use print_dispatch::store::{
    AgentQuery, FulfillmentStore, OrderQuery, OtpError, StoreError, StoreStats, WriteBatch,
};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    fn sent_to(&self, recipient: &str) -> Vec<Notification> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.recipient == recipient)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: Notification) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Channel(format!("push to {} bounced", notification.recipient)));
        }
        self.sent.lock().unwrap().push(notification);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingRefunds {
    orders: Mutex<Vec<Uuid>>,
    failing: AtomicBool,
}

#[async_trait]
impl RefundGateway for RecordingRefunds {
    async fn schedule_refund(&self, order_id: Uuid, _customer_id: &str) -> Result<(), NotifyError> {
        self.orders.lock().unwrap().push(order_id);
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Refund("gateway declined".to_string()));
        }
        Ok(())
    }
}

/// Memory store whose next commit can be made to fail and whose stats can stall.
struct GatedStore {
    inner: Arc<MemoryStore>,
    fail_next_commit: AtomicBool,
    stall_stats: AtomicBool,
}

impl GatedStore {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_next_commit: AtomicBool::new(false),
            stall_stats: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl FulfillmentStore for GatedStore {
    async fn insert_order(&self, order: Order) -> Result<Order, StoreError> {
        self.inner.insert_order(order).await
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        self.inner.get_order(id).await
    }

    async fn find_orders(&self, query: &OrderQuery) -> Result<Vec<Order>, StoreError> {
        self.inner.find_orders(query).await
    }

    async fn find_order_by_shipment_ref(&self, shipment_ref: &str) -> Result<Option<Order>, StoreError> {
        self.inner.find_order_by_shipment_ref(shipment_ref).await
    }

    async fn insert_agent(&self, agent: Agent) -> Result<Agent, StoreError> {
        self.inner.insert_agent(agent).await
    }

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>, StoreError> {
        self.inner.get_agent(id).await
    }

    async fn find_agents(&self, query: &AgentQuery) -> Result<Vec<Agent>, StoreError> {
        self.inner.find_agents(query).await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("replica lost".to_string()));
        }
        self.inner.commit(batch).await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        if self.stall_stats.load(Ordering::SeqCst) {
            tokio::time::sleep(StdDuration::from_secs(5)).await;
        }
        self.inner.stats().await
    }

    async fn insert_otp(&self, otp: DeliveryOtp) -> Result<(), StoreError> {
        self.inner.insert_otp(otp).await
    }

    async fn consume_otp(
        &self,
        order_id: Uuid,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<Result<DeliveryOtp, OtpError>, StoreError> {
        self.inner.consume_otp(order_id, code, now).await
    }

    async fn active_otp(&self, order_id: Uuid, now: DateTime<Utc>) -> Result<Option<DeliveryOtp>, StoreError> {
        self.inner.active_otp(order_id, now).await
    }
}

struct StaticCourier;

#[async_trait]
impl CourierProvider for StaticCourier {
    async fn create_shipment(&self, request: &ShipmentRequest) -> Result<Shipment, ProviderError> {
        Ok(Shipment {
            shipment_ref: format!("SHP-{}", request.order_id),
            tracking_url: format!("https://track.example/{}", request.order_id),
        })
    }
}

struct SlowCourier;

#[async_trait]
impl CourierProvider for SlowCourier {
    async fn create_shipment(&self, _request: &ShipmentRequest) -> Result<Shipment, ProviderError> {
        tokio::time::sleep(StdDuration::from_secs(5)).await;
        Err(ProviderError::Request("too late".to_string()))
    }
}

struct Harness {
    engine: Arc<OrderEngine>,
    store: Arc<MemoryStore>,
    gate: Arc<GatedStore>,
    clock: Arc<ManualClock>,
    notifier: Arc<RecordingNotifier>,
    refunds: Arc<RecordingRefunds>,
    metrics: Metrics,
}

fn harness_with(courier: Arc<dyn CourierProvider>) -> Harness {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let gate = Arc::new(GatedStore::new(store.clone()));
    let metrics = Metrics::new();
    let notifier = Arc::new(RecordingNotifier::default());
    let refunds = Arc::new(RecordingRefunds::default());
    let (events_tx, _rx) = broadcast::channel(64);

    let settings = EngineSettings {
        courier_timeout: StdDuration::from_millis(100),
        notify_timeout: StdDuration::from_millis(200),
        store_timeout: StdDuration::from_millis(500),
        assign_max_attempts: 10,
        ..EngineSettings::default()
    };

    let engine = OrderEngine::new(
        EngineDeps {
            store: gate.clone(),
            courier,
            notifier: notifier.clone(),
            refunds: refunds.clone(),
            selector: Arc::new(RandomSelector),
            clock: clock.clone(),
        },
        settings,
        metrics.clone(),
        events_tx,
    );

    Harness {
        engine: Arc::new(engine),
        store,
        gate,
        clock,
        notifier,
        refunds,
        metrics,
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(UnconfiguredCourier))
}

fn item(pages: u32, color: bool) -> PrintItem {
    PrintItem {
        name: "thesis.pdf".to_string(),
        pages,
        color,
        binding: false,
    }
}

async fn order(h: &Harness, channel: DeliveryChannel, payment_status: PaymentStatus) -> Order {
    h.engine
        .create_order(NewOrder {
            customer_id: "cust-1".to_string(),
            customer_phone: "+15550100".to_string(),
            delivery_address: "1 Press Lane".to_string(),
            items: vec![item(10, true), item(10, false)],
            channel,
            payment: Payment {
                method: PaymentMethod::Card,
                status: payment_status,
            },
            urgent: false,
        })
        .await
        .unwrap()
}

async fn agent(h: &Harness, name: &str) -> Agent {
    h.engine
        .directory()
        .register(NewAgent {
            name: name.to_string(),
            phone: "+15550199".to_string(),
            account_status: AccountStatus::Active,
            location: None,
        })
        .await
        .unwrap()
}

async fn move_to(h: &Harness, order_id: Uuid, target: OrderStatus) -> Result<Order, EngineError> {
    h.engine
        .transition(TransitionRequest::new(order_id, target, Actor::Admin))
        .await
}

async fn print(h: &Harness, order_id: Uuid) -> Order {
    move_to(h, order_id, OrderStatus::Processing).await.unwrap();
    move_to(h, order_id, OrderStatus::Printed).await.unwrap()
}

async fn deliver_with(h: &Harness, order_id: Uuid, code: &str, rating: Option<f64>) -> Result<Order, EngineError> {
    let mut request = TransitionRequest::new(order_id, OrderStatus::Delivered, Actor::Agent);
    request.proof = Some(DeliveryProof {
        otp: Some(code.to_string()),
        photo_url: Some("https://cdn.example/proof.jpg".to_string()),
        notes: Some("left with reception".to_string()),
        rating,
    });
    h.engine.transition(request).await
}

async fn assert_agent_invariant(h: &Harness) {
    for agent in h.store.find_agents(&AgentQuery::default()).await.unwrap() {
        assert_eq!(
            agent.availability == Availability::Busy,
            agent.current_order_id.is_some(),
            "agent {} breaks busy/current order pairing",
            agent.id
        );
    }
}

async fn settle() {
    tokio::time::sleep(StdDuration::from_millis(50)).await;
}

#[tokio::test]
async fn assign_single_binds_exactly_one_of_three_agents() {
    let h = harness();
    let o1 = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;
    for name in ["ana", "bo", "cy"] {
        agent(&h, name).await;
    }

    let outcome = h.engine.assign_single(o1.id, Actor::Admin).await.unwrap();
    let AssignOutcome::Assigned { agent_id } = outcome else {
        panic!("expected an assignment, got {outcome:?}");
    };

    let agents = h.store.find_agents(&AgentQuery::default()).await.unwrap();
    let busy: Vec<&Agent> = agents
        .iter()
        .filter(|a| a.availability == Availability::Busy)
        .collect();
    assert_eq!(busy.len(), 1);
    assert_eq!(busy[0].id, agent_id);
    assert_eq!(busy[0].current_order_id, Some(o1.id));
    assert_eq!(busy[0].performance.orders_assigned, 1);

    let stored = h.engine.get_order(o1.id).await.unwrap();
    assert_eq!(stored.assigned_agent_id, Some(agent_id));
    assert!(!stored.delivery.pending_agent);
    assert_agent_invariant(&h).await;
}

#[tokio::test]
async fn assign_without_agents_parks_order() {
    let h = harness();
    let o = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;

    let outcome = h.engine.assign_single(o.id, Actor::Admin).await.unwrap();
    assert_eq!(outcome, AssignOutcome::PendingAgent);

    let stored = h.engine.get_order(o.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Pending);
    assert!(stored.delivery.pending_agent);
    assert!(stored.assigned_agent_id.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_assignments_against_one_agent_have_one_winner() {
    let h = harness();
    let only = agent(&h, "solo").await;
    let mut order_ids = Vec::new();
    for _ in 0..8 {
        order_ids.push(order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await.id);
    }

    let handles = order_ids.iter().map(|&order_id| {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.assign_single(order_id, Actor::System).await })
    });
    let outcomes: Vec<AssignOutcome> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let winners = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, AssignOutcome::Assigned { .. }))
        .count();
    assert_eq!(winners, 1);

    let agent = h.store.get_agent(only.id).await.unwrap().unwrap();
    let holder = agent.current_order_id.expect("agent holds an order");
    let mut bound = 0;
    for order_id in order_ids {
        let stored = h.engine.get_order(order_id).await.unwrap();
        if stored.assigned_agent_id.is_some() {
            bound += 1;
            assert_eq!(stored.id, holder);
            assert_eq!(stored.assigned_agent_id, Some(only.id));
        }
    }
    assert_eq!(bound, 1);
    assert_eq!(agent.performance.orders_assigned, 1);
    assert_agent_invariant(&h).await;
}

#[tokio::test]
async fn processing_persists_completion_estimate() {
    let h = harness();
    let o = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;

    let processing = move_to(&h, o.id, OrderStatus::Processing).await.unwrap();
    let expected = h.clock.now() + Duration::minutes(85);
    assert_eq!(processing.estimated_completion_at, Some(expected));
}

#[tokio::test]
async fn illegal_transition_leaves_order_untouched() {
    let h = harness();
    let o = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;

    let result = move_to(&h, o.id, OrderStatus::Delivered).await;
    assert!(matches!(
        result,
        Err(EngineError::InvalidTransition {
            from: OrderStatus::Pending,
            to: OrderStatus::Delivered
        })
    ));

    let stored = h.engine.get_order(o.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Pending);
    assert_eq!(stored.version, o.version);
    assert_eq!(stored.timeline.len(), o.timeline.len());
}

#[tokio::test]
async fn self_fleet_delivery_is_proven_by_single_use_code() {
    let h = harness();
    let courier = agent(&h, "dee").await;
    let o = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;

    let printed = print(&h, o.id).await;
    assert_eq!(printed.assigned_agent_id, Some(courier.id));

    move_to(&h, o.id, OrderStatus::OutForDelivery).await.unwrap();
    let otp = h
        .store
        .active_otp(o.id, h.clock.now())
        .await
        .unwrap()
        .expect("code issued on out-for-delivery");
    assert_eq!(otp.agent_id, courier.id);
    assert_eq!(otp.code.len(), 6);
    assert_eq!(otp.expires_at, otp.issued_at + Duration::minutes(30));

    let before = h.engine.get_order(o.id).await.unwrap();
    let wrong = if otp.code == "000000" { "111111" } else { "000000" };
    let rejected = deliver_with(&h, o.id, wrong, Some(4.0)).await;
    assert!(matches!(rejected, Err(EngineError::InvalidOtp(OtpError::Mismatch))));
    let unchanged = h.engine.get_order(o.id).await.unwrap();
    assert_eq!(unchanged.status, OrderStatus::OutForDelivery);
    assert_eq!(unchanged.timeline.len(), before.timeline.len());

    let delivered = deliver_with(&h, o.id, &otp.code, Some(4.0)).await.unwrap();
    assert_eq!(delivered.status, OrderStatus::Delivered);
    let proof = delivered.proof.expect("proof recorded");
    assert!(proof.otp.is_none());
    assert_eq!(proof.notes.as_deref(), Some("left with reception"));

    let agent = h.store.get_agent(courier.id).await.unwrap().unwrap();
    assert_eq!(agent.availability, Availability::Available);
    assert!(agent.current_order_id.is_none());
    assert_eq!(agent.performance.deliveries_completed, 1);
    assert!((agent.performance.average_rating - 4.0).abs() < 1e-9);

    let replay = h.engine.otp().validate(o.id, &otp.code).await;
    assert!(matches!(replay, Err(EngineError::InvalidOtp(OtpError::NotFound))));
    assert_agent_invariant(&h).await;
}

#[tokio::test]
async fn delivery_without_code_is_rejected() {
    let h = harness();
    agent(&h, "eve").await;
    let o = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;
    print(&h, o.id).await;
    move_to(&h, o.id, OrderStatus::OutForDelivery).await.unwrap();

    let result = move_to(&h, o.id, OrderStatus::Delivered).await;
    assert!(matches!(result, Err(EngineError::InvalidOtp(OtpError::Missing))));
}

#[tokio::test]
async fn expired_code_does_not_deliver() {
    let h = harness();
    agent(&h, "fay").await;
    let o = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;
    print(&h, o.id).await;
    move_to(&h, o.id, OrderStatus::OutForDelivery).await.unwrap();
    let otp = h.store.active_otp(o.id, h.clock.now()).await.unwrap().unwrap();

    h.clock.advance(Duration::minutes(31));

    let result = deliver_with(&h, o.id, &otp.code, None).await;
    assert!(matches!(result, Err(EngineError::InvalidOtp(OtpError::Expired))));
    let stored = h.engine.get_order(o.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::OutForDelivery);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_validations_of_one_code_succeed_once() {
    let h = harness();
    let order_id = Uuid::new_v4();
    let otp = h
        .engine
        .otp()
        .issue(order_id, Uuid::new_v4(), "+15550100")
        .await
        .unwrap();

    let handles = (0..6).map(|_| {
        let engine = h.engine.clone();
        let code = otp.code.clone();
        tokio::spawn(async move { engine.otp().validate(order_id, &code).await.is_ok() })
    });
    let successes = join_all(handles)
        .await
        .into_iter()
        .filter(|joined| *joined.as_ref().unwrap())
        .count();

    assert_eq!(successes, 1);
}

#[tokio::test]
async fn failed_attempt_can_go_back_out_with_fresh_code() {
    let h = harness();
    let courier = agent(&h, "gus").await;
    let o = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;
    print(&h, o.id).await;
    move_to(&h, o.id, OrderStatus::OutForDelivery).await.unwrap();
    let first = h.store.active_otp(o.id, h.clock.now()).await.unwrap().unwrap();

    move_to(&h, o.id, OrderStatus::NotDelivered).await.unwrap();
    let agent_after_miss = h.store.get_agent(courier.id).await.unwrap().unwrap();
    assert_eq!(agent_after_miss.current_order_id, Some(o.id));

    h.clock.advance(Duration::minutes(1));
    move_to(&h, o.id, OrderStatus::OutForDelivery).await.unwrap();
    let second = h.store.active_otp(o.id, h.clock.now()).await.unwrap().unwrap();
    assert!(second.issued_at > first.issued_at);

    let delivered = deliver_with(&h, o.id, &second.code, None).await.unwrap();
    assert_eq!(delivered.status, OrderStatus::Delivered);
}

#[tokio::test]
async fn courier_failure_falls_back_to_own_fleet() {
    let h = harness();
    let fleet_agent = agent(&h, "hal").await;
    let o2 = order(&h, DeliveryChannel::Courier, PaymentStatus::Paid).await;

    let printed = print(&h, o2.id).await;

    assert_eq!(printed.delivery.channel, DeliveryChannel::SelfFleet);
    assert!(printed.delivery.provider_error.is_some());
    assert_eq!(printed.status, OrderStatus::Printed);
    assert_eq!(printed.assigned_agent_id, Some(fleet_agent.id));
}

#[tokio::test]
async fn courier_fallback_without_agents_waits_for_agent() {
    let h = harness();
    let o2 = order(&h, DeliveryChannel::Courier, PaymentStatus::Paid).await;

    let printed = print(&h, o2.id).await;

    assert_eq!(printed.delivery.channel, DeliveryChannel::SelfFleet);
    assert!(printed.delivery.provider_error.is_some());
    assert!(printed.delivery.pending_agent);
    assert!(printed.assigned_agent_id.is_none());
}

#[tokio::test]
async fn courier_timeout_routes_into_fallback() {
    let h = harness_with(Arc::new(SlowCourier));
    let o = order(&h, DeliveryChannel::Courier, PaymentStatus::Paid).await;

    let printed = print(&h, o.id).await;

    assert_eq!(printed.delivery.channel, DeliveryChannel::SelfFleet);
    let error = printed.delivery.provider_error.unwrap();
    assert!(error.contains("timed out"), "unexpected provider error {error}");
}

#[tokio::test]
async fn courier_shipment_and_status_webhooks() {
    let h = harness_with(Arc::new(StaticCourier));
    let o = order(&h, DeliveryChannel::Courier, PaymentStatus::Paid).await;

    let shipped = print(&h, o.id).await;
    assert_eq!(shipped.status, OrderStatus::Shipped);
    assert_eq!(shipped.delivery.channel, DeliveryChannel::Courier);
    let shipment_ref = shipped.delivery.provider_shipment_ref.clone().unwrap();
    assert!(shipped.delivery.tracking_url.is_some());

    let duplicate = h
        .engine
        .handle_provider_webhook(ProviderStatusWebhook {
            shipment_ref: shipment_ref.clone(),
            provider_status: "in_transit".to_string(),
            tracking_code: None,
        })
        .await
        .unwrap();
    assert!(matches!(duplicate, WebhookOutcome::Ignored { .. }));

    let delivered = h
        .engine
        .handle_provider_webhook(ProviderStatusWebhook {
            shipment_ref: shipment_ref.clone(),
            provider_status: "delivered".to_string(),
            tracking_code: Some("TRK-9".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(
        delivered,
        WebhookOutcome::Applied {
            order_id: o.id,
            status: OrderStatus::Delivered
        }
    );

    let stored = h.engine.get_order(o.id).await.unwrap();
    let last = stored.timeline.iter().rev().find(|e| e.actor == Actor::Courier).unwrap();
    assert_eq!(last.note.as_deref(), Some("courier tracking code TRK-9"));
}

#[tokio::test]
async fn webhook_for_unknown_shipment_is_ignored() {
    let h = harness();
    let outcome = h
        .engine
        .handle_provider_webhook(ProviderStatusWebhook {
            shipment_ref: "SHP-missing".to_string(),
            provider_status: "delivered".to_string(),
            tracking_code: None,
        })
        .await
        .unwrap();

    assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));
}

#[tokio::test]
async fn cancelling_paid_order_schedules_refund_and_frees_agent() {
    let h = harness();
    let courier = agent(&h, "ivy").await;
    let o = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;
    print(&h, o.id).await;

    let mut request = TransitionRequest::new(o.id, OrderStatus::Cancelled, Actor::Customer);
    request.reason = Some("changed my mind".to_string());
    let cancelled = h.engine.transition(request).await.unwrap();

    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.payment.status, PaymentStatus::RefundPending);
    assert_eq!(cancelled.cancel_reason.as_deref(), Some("changed my mind"));

    let agent = h.store.get_agent(courier.id).await.unwrap().unwrap();
    assert_eq!(agent.availability, Availability::Available);
    assert!(agent.current_order_id.is_none());

    settle().await;
    assert_eq!(h.refunds.orders.lock().unwrap().as_slice(), &[o.id]);

    let after = move_to(&h, o.id, OrderStatus::Processing).await;
    assert!(matches!(after, Err(EngineError::InvalidTransition { .. })));
}

#[tokio::test]
async fn release_is_idempotent() {
    let h = harness();
    let courier = agent(&h, "jo").await;
    let o = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;
    h.engine.assign_single(o.id, Actor::Admin).await.unwrap();

    assert_eq!(h.engine.release(courier.id).await.unwrap(), ReleaseOutcome::Released);
    let once = h.store.get_agent(courier.id).await.unwrap().unwrap();

    assert_eq!(h.engine.release(courier.id).await.unwrap(), ReleaseOutcome::AlreadyFree);
    let twice = h.store.get_agent(courier.id).await.unwrap().unwrap();

    assert_eq!(once.availability, twice.availability);
    assert_eq!(once.current_order_id, twice.current_order_id);
    assert_eq!(once.version, twice.version);
    assert_eq!(
        h.engine.release(Uuid::new_v4()).await.unwrap(),
        ReleaseOutcome::Missing
    );
}

#[tokio::test]
async fn sweep_hands_out_agents_round_robin() {
    let h = harness();
    let mut agent_ids = Vec::new();
    for name in ["ka", "lu", "mo"] {
        agent_ids.push(agent(&h, name).await.id);
    }
    for _ in 0..5 {
        order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;
    }
    h.clock.advance(Duration::minutes(11));
    let young = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;

    let report = h.engine.auto_assign_sweep().await.unwrap();

    assert_eq!(report.considered, 5);
    assert_eq!(report.assigned, 3);
    assert_eq!(report.unassigned, 2);
    let mut used: Vec<Uuid> = report.assignments.iter().map(|(_, agent_id)| *agent_id).collect();
    used.sort();
    agent_ids.sort();
    assert_eq!(used, agent_ids);

    let young = h.engine.get_order(young.id).await.unwrap();
    assert!(young.assigned_agent_id.is_none());
    assert_agent_invariant(&h).await;
}

#[tokio::test]
async fn sweep_skips_fresh_and_courier_orders() {
    let h = harness();
    agent(&h, "ned").await;
    order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;
    let courier_order = order(&h, DeliveryChannel::Courier, PaymentStatus::Paid).await;

    let report = h.engine.auto_assign_sweep().await.unwrap();
    assert_eq!(report.considered, 0);

    h.clock.advance(Duration::minutes(11));
    let report = h.engine.auto_assign_sweep().await.unwrap();
    assert_eq!(report.considered, 1);
    assert_eq!(report.assigned, 1);

    let untouched = h.engine.get_order(courier_order.id).await.unwrap();
    assert!(untouched.assigned_agent_id.is_none());
}

#[tokio::test]
async fn sweep_picks_up_parked_printed_orders() {
    let h = harness();
    let o = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;
    let parked = print(&h, o.id).await;
    assert!(parked.delivery.pending_agent);

    let late = agent(&h, "ola").await;
    h.clock.advance(Duration::minutes(11));
    let report = h.engine.auto_assign_sweep().await.unwrap();

    assert_eq!(report.assigned, 1);
    let stored = h.engine.get_order(o.id).await.unwrap();
    assert_eq!(stored.assigned_agent_id, Some(late.id));
    assert!(!stored.delivery.pending_agent);
}

#[tokio::test]
async fn reassign_moves_order_between_agents() {
    let h = harness();
    let first = agent(&h, "pam").await;
    let o = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;
    h.engine.assign_single(o.id, Actor::Admin).await.unwrap();
    let second = agent(&h, "quin").await;

    let updated = h
        .engine
        .reassign(o.id, second.id, "vehicle breakdown".to_string(), Actor::Admin)
        .await
        .unwrap();

    assert_eq!(updated.assigned_agent_id, Some(second.id));
    assert!(updated.delivery.reassigned);
    assert_eq!(updated.delivery.reassign_reason.as_deref(), Some("vehicle breakdown"));

    let old = h.store.get_agent(first.id).await.unwrap().unwrap();
    let new = h.store.get_agent(second.id).await.unwrap().unwrap();
    assert_eq!(old.availability, Availability::Available);
    assert!(old.current_order_id.is_none());
    assert_eq!(new.availability, Availability::Busy);
    assert_eq!(new.current_order_id, Some(o.id));

    settle().await;
    let to_agent = h.notifier.sent_to(&second.id.to_string());
    assert!(to_agent.iter().any(|n| n.data["reassignment"] == true));
    let to_customer = h.notifier.sent_to("cust-1");
    assert!(to_customer.iter().any(|n| n.title == "Delivery agent changed"));
    assert_agent_invariant(&h).await;
}

#[tokio::test]
async fn reassign_to_busy_agent_is_refused() {
    let h = harness();
    agent(&h, "ray").await;
    let a = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;
    let b = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;
    let AssignOutcome::Assigned { agent_id } = h.engine.assign_single(a.id, Actor::Admin).await.unwrap() else {
        panic!("first order should get the agent");
    };

    let result = h
        .engine
        .reassign(b.id, agent_id, "swap".to_string(), Actor::Admin)
        .await;
    assert!(matches!(result, Err(EngineError::AgentUnavailable(id)) if id == agent_id));

    let missing = h
        .engine
        .reassign(b.id, Uuid::new_v4(), "swap".to_string(), Actor::Admin)
        .await;
    assert!(matches!(missing, Err(EngineError::AgentNotFound(_))));
}

#[tokio::test]
async fn bulk_transition_reports_skipped_items() {
    let h = harness();
    let a = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Pending).await;
    let b = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Pending).await;
    let ghost = Uuid::new_v4();

    let summary = h
        .engine
        .bulk_transition(&[a.id, ghost, b.id], OrderStatus::Processing, Actor::Admin, None)
        .await;

    assert_eq!(summary.updated, vec![a.id, b.id]);
    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(summary.skipped[0].id, ghost);
}

#[tokio::test]
async fn bulk_availability_skips_busy_and_unknown_agents() {
    let h = harness();
    let busy = agent(&h, "sal").await;
    let idle = agent(&h, "tam").await;
    let o = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;
    let AssignOutcome::Assigned { agent_id } = h.engine.assign_single(o.id, Actor::Admin).await.unwrap() else {
        panic!("expected assignment");
    };
    let (busy_id, idle_id) = if agent_id == busy.id {
        (busy.id, idle.id)
    } else {
        (idle.id, busy.id)
    };

    let summary = h
        .engine
        .directory()
        .bulk_set_availability(&[busy_id, idle_id, Uuid::new_v4()], Availability::Offline)
        .await;

    assert_eq!(summary.updated, vec![idle_id]);
    assert_eq!(summary.skipped.len(), 2);
    assert_agent_invariant(&h).await;
}

#[tokio::test]
async fn status_changes_notify_customer_once() {
    let h = harness();
    let o = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;
    move_to(&h, o.id, OrderStatus::Processing).await.unwrap();

    settle().await;
    let updates: Vec<Notification> = h
        .notifier
        .sent_to("cust-1")
        .into_iter()
        .filter(|n| n.title == "Order update")
        .collect();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].data["status"], "Processing");
}

#[tokio::test]
async fn failed_delivery_write_keeps_code_usable() {
    let h = harness();
    let courier = agent(&h, "kit").await;
    let o = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;
    print(&h, o.id).await;
    move_to(&h, o.id, OrderStatus::OutForDelivery).await.unwrap();
    let otp = h.store.active_otp(o.id, h.clock.now()).await.unwrap().unwrap();

    h.gate.fail_next_commit.store(true, Ordering::SeqCst);
    let failed = deliver_with(&h, o.id, &otp.code, Some(5.0)).await;
    assert!(matches!(failed, Err(EngineError::Store(StoreError::Unavailable(_)))));

    let stored = h.engine.get_order(o.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::OutForDelivery);
    let still_live = h.store.active_otp(o.id, h.clock.now()).await.unwrap();
    assert_eq!(still_live.map(|live| live.code), Some(otp.code.clone()));
    let bound = h.store.get_agent(courier.id).await.unwrap().unwrap();
    assert_eq!(bound.current_order_id, Some(o.id));

    let delivered = deliver_with(&h, o.id, &otp.code, Some(5.0)).await.unwrap();
    assert_eq!(delivered.status, OrderStatus::Delivered);
    assert!(h.store.active_otp(o.id, h.clock.now()).await.unwrap().is_none());
    let valid = h.metrics.otp_validations_total.with_label_values(&["valid"]).get();
    assert_eq!(valid, 1);
    assert_agent_invariant(&h).await;
}

#[tokio::test]
async fn wrong_code_in_delivery_write_changes_nothing() {
    let h = harness();
    let courier = agent(&h, "lou").await;
    let o = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;
    print(&h, o.id).await;
    move_to(&h, o.id, OrderStatus::OutForDelivery).await.unwrap();
    let otp = h.store.active_otp(o.id, h.clock.now()).await.unwrap().unwrap();
    let wrong = if otp.code == "999999" { "888888" } else { "999999" };

    let rejected = deliver_with(&h, o.id, wrong, Some(1.0)).await;
    assert!(matches!(rejected, Err(EngineError::InvalidOtp(OtpError::Mismatch))));

    let agent = h.store.get_agent(courier.id).await.unwrap().unwrap();
    assert_eq!(agent.performance.deliveries_completed, 0);
    assert_eq!(agent.availability, Availability::Busy);
    assert!(h.store.active_otp(o.id, h.clock.now()).await.unwrap().is_some());
}

#[tokio::test]
async fn courier_orders_cannot_record_failed_attempt() {
    let h = harness_with(Arc::new(StaticCourier));
    let o = order(&h, DeliveryChannel::Courier, PaymentStatus::Paid).await;
    let shipped = print(&h, o.id).await;
    let shipment_ref = shipped.delivery.provider_shipment_ref.unwrap();

    h.engine
        .handle_provider_webhook(ProviderStatusWebhook {
            shipment_ref,
            provider_status: "out_for_delivery".to_string(),
            tracking_code: None,
        })
        .await
        .unwrap();
    let before = h.engine.get_order(o.id).await.unwrap();
    assert_eq!(before.status, OrderStatus::OutForDelivery);

    let result = move_to(&h, o.id, OrderStatus::NotDelivered).await;
    assert!(matches!(
        result,
        Err(EngineError::InvalidTransition {
            from: OrderStatus::OutForDelivery,
            to: OrderStatus::NotDelivered
        })
    ));

    let after = h.engine.get_order(o.id).await.unwrap();
    assert_eq!(after.status, OrderStatus::OutForDelivery);
    assert_eq!(after.timeline.len(), before.timeline.len());
}

#[tokio::test]
async fn failing_notifier_and_refunds_do_not_block_cancellation() {
    let h = harness();
    h.notifier.failing.store(true, Ordering::SeqCst);
    h.refunds.failing.store(true, Ordering::SeqCst);
    let o = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;

    let cancelled = move_to(&h, o.id, OrderStatus::Cancelled).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.payment.status, PaymentStatus::RefundPending);

    settle().await;
    assert_eq!(h.refunds.orders.lock().unwrap().as_slice(), &[o.id]);
    assert!(h.notifier.sent_to("cust-1").is_empty());
    let failed = h.metrics.notifications_total.with_label_values(&["failed"]).get();
    assert!(failed >= 1, "expected failed notifications, got {failed}");

    let stored = h.engine.get_order(o.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn stats_count_documents_and_respect_store_timeout() {
    let h = harness();
    let first = order(&h, DeliveryChannel::SelfFleet, PaymentStatus::Paid).await;
    order(&h, DeliveryChannel::Courier, PaymentStatus::Pending).await;
    agent(&h, "max").await;
    agent(&h, "ned").await;
    h.engine.assign_single(first.id, Actor::Admin).await.unwrap();

    let stats = h.engine.stats().await.unwrap();
    assert_eq!(
        stats,
        StoreStats {
            orders: 2,
            agents: 2,
            available_agents: 1
        }
    );

    h.gate.stall_stats.store(true, Ordering::SeqCst);
    let stalled = h.engine.stats().await;
    assert!(matches!(stalled, Err(EngineError::Timeout(_))));
}
