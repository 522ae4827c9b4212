//! Order lifecycle engine.
//!
//! Owns the status graph and every write that changes an order's status. A transition
//! is validated first (graph edge, agent presence, delivery code) and only then
//! committed as one batch together with any agent-side change it implies. Post-commit
//! work (dispatch kickoff, OTP issuance, notifications, refunds) never rolls a
//! committed transition back.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::courier::{
    CourierProvider, ProviderError, ProviderStatusWebhook, Shipment, ShipmentRequest,
    map_provider_status,
};
use crate::engine::directory::{AgentDirectory, BulkSummary};
use crate::engine::estimate::estimate_minutes;
use crate::engine::otp::OtpService;
use crate::engine::scheduler::{
    AgentSelector, AssignOutcome, AssignmentScheduler, ReleaseOutcome, SweepReport,
};
use crate::engine::side_effects::SideEffects;
use crate::engine::{EngineSettings, bounded, is_conflict};
use crate::error::EngineError;
use crate::models::agent::Agent;
use crate::models::event::{FulfillmentEvent, FulfillmentEventKind};
use crate::models::order::{
    Actor, Delivery, DeliveryChannel, DeliveryProof, Order, OrderStatus, Payment, PaymentStatus,
    PrintItem, TimelineAction,
};
use crate::notify::{Notification, Notifier, RefundGateway};
use crate::observability::metrics::Metrics;
use crate::store::{FulfillmentStore, OtpError, StoreError, StoreStats, WriteBatch};

/// Collaborators handed to the engine at construction. Nothing is reached globally.
pub struct EngineDeps {
    pub store: Arc<dyn FulfillmentStore>,
    pub courier: Arc<dyn CourierProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub refunds: Arc<dyn RefundGateway>,
    pub selector: Arc<dyn AgentSelector>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub customer_id: String,
    pub customer_phone: String,
    pub delivery_address: String,
    pub items: Vec<PrintItem>,
    pub channel: DeliveryChannel,
    pub payment: Payment,
    pub urgent: bool,
}

#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub order_id: Uuid,
    pub target: OrderStatus,
    pub actor: Actor,
    pub note: Option<String>,
    pub proof: Option<DeliveryProof>,
    /// Return or cancellation reason.
    pub reason: Option<String>,
}

impl TransitionRequest {
    pub fn new(order_id: Uuid, target: OrderStatus, actor: Actor) -> Self {
        Self {
            order_id,
            target,
            actor,
            note: None,
            proof: None,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Assigned { agent_id: Uuid },
    PendingAgent,
    Shipped { shipment_ref: String, tracking_url: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied { order_id: Uuid, status: OrderStatus },
    Ignored { reason: String },
}

/// What a committed transition left behind for the post-commit hooks.
struct Committed {
    order: Order,
    from: OrderStatus,
    seq: u32,
    refund_due: bool,
}

pub struct OrderEngine {
    store: Arc<dyn FulfillmentStore>,
    courier: Arc<dyn CourierProvider>,
    clock: Arc<dyn Clock>,
    effects: Arc<SideEffects>,
    scheduler: AssignmentScheduler,
    directory: AgentDirectory,
    otp: OtpService,
    settings: EngineSettings,
    metrics: Metrics,
}

impl OrderEngine {
    pub fn new(
        deps: EngineDeps,
        settings: EngineSettings,
        metrics: Metrics,
        events_tx: broadcast::Sender<FulfillmentEvent>,
    ) -> Self {
        let effects = Arc::new(SideEffects::new(
            deps.notifier,
            deps.refunds,
            events_tx,
            metrics.clone(),
            settings.notify_timeout,
        ));
        let scheduler = AssignmentScheduler::new(
            deps.store.clone(),
            deps.selector,
            deps.clock.clone(),
            effects.clone(),
            settings.clone(),
            metrics.clone(),
        );
        let directory = AgentDirectory::new(deps.store.clone(), deps.clock.clone(), settings.clone());
        let otp = OtpService::new(
            deps.store.clone(),
            deps.clock.clone(),
            settings.clone(),
            metrics.clone(),
        );

        Self {
            store: deps.store,
            courier: deps.courier,
            clock: deps.clock,
            effects,
            scheduler,
            directory,
            otp,
            settings,
            metrics,
        }
    }

    pub fn scheduler(&self) -> &AssignmentScheduler {
        &self.scheduler
    }

    pub fn directory(&self) -> &AgentDirectory {
        &self.directory
    }

    pub fn otp(&self) -> &OtpService {
        &self.otp
    }

    pub async fn create_order(&self, new_order: NewOrder) -> Result<Order, EngineError> {
        let now = self.clock.now();
        let order = Order {
            id: Uuid::new_v4(),
            version: 0,
            status: OrderStatus::Pending,
            customer_id: new_order.customer_id,
            customer_phone: new_order.customer_phone,
            delivery_address: new_order.delivery_address,
            items: new_order.items,
            delivery: Delivery::new(new_order.channel),
            payment: new_order.payment,
            assigned_agent_id: None,
            urgent: new_order.urgent,
            estimated_completion_at: None,
            proof: None,
            return_reason: None,
            cancel_reason: None,
            timeline: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        let order = bounded(self.settings.store_timeout, self.store.insert_order(order)).await?;
        info!(order_id = %order.id, channel = ?order.delivery.channel, "order created");
        Ok(order)
    }

    pub async fn stats(&self) -> Result<StoreStats, EngineError> {
        bounded(self.settings.store_timeout, self.store.stats()).await
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<Order, EngineError> {
        bounded(self.settings.store_timeout, self.store.get_order(order_id))
            .await?
            .ok_or(EngineError::OrderNotFound(order_id))
    }

    fn reject(&self, order_id: Uuid, from: OrderStatus, target: OrderStatus, err: EngineError) -> EngineError {
        self.metrics
            .transition_rejections_total
            .with_label_values(&[err.reason()])
            .inc();
        warn!(
            order_id = %order_id,
            from = ?from,
            to = ?target,
            error = %err,
            "transition rejected"
        );
        err
    }

    pub async fn transition(&self, request: TransitionRequest) -> Result<Order, EngineError> {
        let order = self.get_order(request.order_id).await?;
        let target = request.target;

        if let Err(err) = order.status.ensure_transition_on(target, order.delivery.channel) {
            return Err(self.reject(order.id, order.status, target, err));
        }

        if order.is_self_fleet() {
            if target == OrderStatus::OutForDelivery && order.assigned_agent_id.is_none() {
                return Err(self.reject(order.id, order.status, target, EngineError::AgentRequired(order.id)));
            }

            // The code itself is consumed inside the delivery batch.
            if target == OrderStatus::Delivered && Self::delivery_code(&request).is_none() {
                self.otp.observe(order.id, Err(&OtpError::Missing));
                let err = EngineError::InvalidOtp(OtpError::Missing);
                return Err(self.reject(order.id, order.status, target, err));
            }
        }

        let committed = self.commit_transition(order, &request, |_| {}).await?;
        self.after_transition(&committed).await;

        self.get_order(request.order_id).await
    }

    fn delivery_code(request: &TransitionRequest) -> Option<&str> {
        request
            .proof
            .as_ref()
            .and_then(|proof| proof.otp.as_deref())
            .map(str::trim)
            .filter(|code| !code.is_empty())
    }

    /// Writes the status change plus everything that must move with it in one batch.
    /// `extra` applies caller-specific fields (e.g. shipment data) before the write.
    async fn commit_transition<F>(
        &self,
        mut order: Order,
        request: &TransitionRequest,
        extra: F,
    ) -> Result<Committed, EngineError>
    where
        F: Fn(&mut Order),
    {
        let target = request.target;

        for attempt in 1..=self.settings.assign_max_attempts {
            if attempt > 1 {
                order = self.get_order(order.id).await?;
                if let Err(err) = order.status.ensure_transition_on(target, order.delivery.channel) {
                    return Err(self.reject(order.id, order.status, target, err));
                }
            }

            let now = self.clock.now();
            let from = order.status;
            order.status = target;
            let seq = order.record(
                now,
                request.actor,
                TimelineAction::StatusChanged { from, to: target },
                request.note.clone(),
            );
            extra(&mut order);

            let mut refund_due = false;
            let mut agent_update: Option<Agent> = None;

            match target {
                OrderStatus::Processing => {
                    let minutes = i64::from(estimate_minutes(&order.items));
                    order.estimated_completion_at = Some(now + chrono::Duration::minutes(minutes));
                }
                OrderStatus::Delivered => {
                    if let Some(proof) = &request.proof {
                        order.proof = Some(DeliveryProof {
                            otp: None,
                            ..proof.clone()
                        });
                    }
                    let rating = request.proof.as_ref().and_then(|proof| proof.rating);
                    if let Some(mut agent) = self.assigned_agent(&order).await? {
                        if Self::release_if_bound(&mut agent, &mut order, now, request.actor) {
                            info!(order_id = %order.id, agent_id = %agent.id, "agent released after delivery");
                        }
                        agent.performance.record_delivery(rating);
                        agent_update = Some(agent);
                    }
                }
                OrderStatus::Cancelled | OrderStatus::Returned => {
                    if target == OrderStatus::Cancelled {
                        order.cancel_reason = request.reason.clone();
                        if order.payment.status == PaymentStatus::Paid {
                            order.payment.status = PaymentStatus::RefundPending;
                            order.record(now, request.actor, TimelineAction::RefundScheduled, None);
                            refund_due = true;
                        }
                    } else {
                        order.return_reason = request.reason.clone();
                    }
                    if let Some(mut agent) = self.assigned_agent(&order).await? {
                        if Self::release_if_bound(&mut agent, &mut order, now, request.actor) {
                            agent_update = Some(agent);
                        }
                    }
                }
                _ => {}
            }

            let mut batch = WriteBatch::new().put_order(order.clone());
            if let Some(agent) = agent_update {
                batch = batch.put_agent(agent);
            }
            let code = (target == OrderStatus::Delivered && order.is_self_fleet())
                .then(|| Self::delivery_code(request))
                .flatten();
            if let Some(code) = code {
                batch = batch.consume_otp(order.id, code);
            }

            match bounded(self.settings.store_timeout, self.store.commit(batch)).await {
                Ok(()) => {
                    if code.is_some() {
                        self.otp.observe(order.id, Ok(()));
                    }
                    return Ok(Committed {
                        order,
                        from,
                        seq,
                        refund_due,
                    });
                }
                Err(err) if is_conflict(&err) => {
                    warn!(order_id = %order.id, attempt, "transition commit conflicted; retrying");
                }
                Err(EngineError::Store(StoreError::Otp(err))) => {
                    self.otp.observe(order.id, Err(&err));
                    return Err(self.reject(order.id, from, target, EngineError::InvalidOtp(err)));
                }
                Err(err) => return Err(err),
            }
        }

        Err(EngineError::Contention(format!("transition of order {}", order.id)))
    }

    /// Loads the agent bound to the order. A missing agent is logged and skipped so
    /// the order itself can still move.
    async fn assigned_agent(&self, order: &Order) -> Result<Option<Agent>, EngineError> {
        let Some(agent_id) = order.assigned_agent_id else {
            return Ok(None);
        };

        let agent = bounded(self.settings.store_timeout, self.store.get_agent(agent_id)).await?;
        if agent.is_none() {
            warn!(order_id = %order.id, agent_id = %agent_id, "assigned agent missing; skipping agent update");
        }
        Ok(agent)
    }

    fn release_if_bound(
        agent: &mut Agent,
        order: &mut Order,
        at: chrono::DateTime<chrono::Utc>,
        actor: Actor,
    ) -> bool {
        if agent.current_order_id != Some(order.id) {
            return false;
        }
        agent.release();
        order.record(
            at,
            actor,
            TimelineAction::AgentReleased { agent_id: agent.id },
            None,
        );
        true
    }

    /// Metrics, log line, customer notification and broadcast for a committed change.
    fn announce(&self, committed: &Committed) {
        let order = &committed.order;
        self.metrics
            .transitions_total
            .with_label_values(&[order.status.as_label()])
            .inc();
        info!(order_id = %order.id, from = ?committed.from, to = ?order.status, "order status changed");

        self.effects.notify(
            SideEffects::dispatch_key(order.id, committed.seq, "customer"),
            Notification {
                recipient: order.customer_id.clone(),
                title: "Order update".to_string(),
                body: format!("Your order is now {}.", order.status.as_label().replace('_', " ")),
                data: json!({ "order_id": order.id, "status": order.status }),
            },
        );
        self.effects.publish(FulfillmentEvent {
            order_id: order.id,
            kind: FulfillmentEventKind::StatusChanged,
            status: order.status,
            agent_id: order.assigned_agent_id,
            at: self.clock.now(),
        });
    }

    async fn after_transition(&self, committed: &Committed) {
        self.announce(committed);
        let order = &committed.order;

        match order.status {
            OrderStatus::Printed => {
                if let Err(err) = self.dispatch(order.id).await {
                    error!(order_id = %order.id, error = %err, "dispatch after printing failed");
                }
            }
            OrderStatus::OutForDelivery if order.is_self_fleet() => {
                let Some(agent_id) = order.assigned_agent_id else {
                    return;
                };
                match self.otp.issue(order.id, agent_id, &order.customer_phone).await {
                    Ok(otp) => self.effects.notify(
                        SideEffects::dispatch_key(order.id, committed.seq, "otp"),
                        Notification {
                            recipient: order.customer_id.clone(),
                            title: "Your delivery code".to_string(),
                            body: format!(
                                "Share code {} with the delivery agent to receive your order.",
                                otp.code
                            ),
                            data: json!({ "order_id": order.id, "otp": otp.code, "expires_at": otp.expires_at }),
                        },
                    ),
                    Err(err) => {
                        error!(order_id = %order.id, error = %err, "failed to issue delivery code")
                    }
                }
            }
            OrderStatus::Cancelled if committed.refund_due => {
                self.effects.schedule_refund(
                    SideEffects::dispatch_key(order.id, committed.seq, "refund"),
                    order.id,
                    order.customer_id.clone(),
                );
            }
            _ => {}
        }
    }

    /// Starts delivery for a printed order on its channel. A failing courier converts the
    /// order to self-fleet once and the fleet path runs immediately.
    pub async fn dispatch(&self, order_id: Uuid) -> Result<DispatchOutcome, EngineError> {
        let mut order = self.get_order(order_id).await?;

        loop {
            match order.delivery.channel {
                DeliveryChannel::SelfFleet => {
                    if let Some(agent_id) = order.assigned_agent_id {
                        return Ok(DispatchOutcome::Assigned { agent_id });
                    }
                    return match self.scheduler.assign_single(order_id, Actor::System).await? {
                        AssignOutcome::Assigned { agent_id } => Ok(DispatchOutcome::Assigned { agent_id }),
                        AssignOutcome::PendingAgent => Ok(DispatchOutcome::PendingAgent),
                    };
                }
                DeliveryChannel::Courier => {
                    if order.status != OrderStatus::Printed {
                        return Err(EngineError::InvalidTransition {
                            from: order.status,
                            to: OrderStatus::Shipped,
                        });
                    }

                    match self.create_shipment(&order).await {
                        Ok(shipment) => return self.mark_shipped(order, shipment).await,
                        Err(err) => order = self.fall_back(order, err).await?,
                    }
                }
            }
        }
    }

    async fn create_shipment(&self, order: &Order) -> Result<Shipment, ProviderError> {
        let request = ShipmentRequest::from(order);
        match tokio::time::timeout(
            self.settings.courier_timeout,
            self.courier.create_shipment(&request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        }
    }

    async fn mark_shipped(&self, order: Order, shipment: Shipment) -> Result<DispatchOutcome, EngineError> {
        let request = TransitionRequest::new(order.id, OrderStatus::Shipped, Actor::Courier);
        let now = self.clock.now();
        let committed = self
            .commit_transition(order, &request, |order| {
                order.delivery.provider_shipment_ref = Some(shipment.shipment_ref.clone());
                order.delivery.tracking_url = Some(shipment.tracking_url.clone());
                order.record(
                    now,
                    Actor::Courier,
                    TimelineAction::ShipmentCreated {
                        shipment_ref: shipment.shipment_ref.clone(),
                    },
                    None,
                );
            })
            .await
            .inspect_err(|err| {
                error!(shipment_ref = %shipment.shipment_ref, error = %err, "shipment created but order not updated");
            })?;

        self.metrics
            .courier_shipments_total
            .with_label_values(&["created"])
            .inc();
        self.announce(&committed);
        self.effects.publish(FulfillmentEvent {
            order_id: committed.order.id,
            kind: FulfillmentEventKind::ShipmentCreated,
            status: committed.order.status,
            agent_id: None,
            at: now,
        });

        Ok(DispatchOutcome::Shipped {
            shipment_ref: shipment.shipment_ref,
            tracking_url: shipment.tracking_url,
        })
    }

    /// One-shot downgrade from courier to self-fleet. Never reverted automatically.
    async fn fall_back(&self, mut order: Order, cause: ProviderError) -> Result<Order, EngineError> {
        self.metrics
            .courier_shipments_total
            .with_label_values(&["fallback"])
            .inc();
        warn!(order_id = %order.id, error = %cause, "courier unavailable; falling back to own fleet");

        for _ in 0..self.settings.assign_max_attempts {
            if order.delivery.channel == DeliveryChannel::SelfFleet {
                return Ok(order);
            }

            let now = self.clock.now();
            order.delivery.channel = DeliveryChannel::SelfFleet;
            order.delivery.provider_error = Some(cause.to_string());
            order.record(
                now,
                Actor::System,
                TimelineAction::CourierFallback {
                    error: cause.to_string(),
                },
                None,
            );

            match bounded(
                self.settings.store_timeout,
                self.store.commit(WriteBatch::new().put_order(order.clone())),
            )
            .await
            {
                Ok(()) => {
                    self.effects.publish(FulfillmentEvent {
                        order_id: order.id,
                        kind: FulfillmentEventKind::CourierFallback,
                        status: order.status,
                        agent_id: None,
                        at: now,
                    });
                    return self.get_order(order.id).await;
                }
                Err(err) if is_conflict(&err) => order = self.get_order(order.id).await?,
                Err(err) => return Err(err),
            }
        }

        Err(EngineError::Contention(format!("courier fallback of order {}", order.id)))
    }

    pub async fn handle_provider_webhook(
        &self,
        payload: ProviderStatusWebhook,
    ) -> Result<WebhookOutcome, EngineError> {
        let order = bounded(
            self.settings.store_timeout,
            self.store.find_order_by_shipment_ref(&payload.shipment_ref),
        )
        .await?;
        let Some(order) = order else {
            warn!(shipment_ref = %payload.shipment_ref, "webhook for unknown shipment");
            return Ok(WebhookOutcome::Ignored {
                reason: "unknown shipment".to_string(),
            });
        };

        let Some(target) = map_provider_status(&payload.provider_status) else {
            warn!(order_id = %order.id, provider_status = %payload.provider_status, "unmapped courier status");
            return Ok(WebhookOutcome::Ignored {
                reason: format!("unmapped provider status {}", payload.provider_status),
            });
        };

        if order.status == target {
            return Ok(WebhookOutcome::Ignored {
                reason: "status already applied".to_string(),
            });
        }
        if !order.status.can_transition_on(target, order.delivery.channel) {
            warn!(order_id = %order.id, from = ?order.status, to = ?target, "courier status does not fit order state");
            return Ok(WebhookOutcome::Ignored {
                reason: format!("cannot move from {:?} to {:?}", order.status, target),
            });
        }

        let mut request = TransitionRequest::new(order.id, target, Actor::Courier);
        request.note = payload
            .tracking_code
            .map(|code| format!("courier tracking code {code}"));

        let updated = self.transition(request).await?;
        Ok(WebhookOutcome::Applied {
            order_id: updated.id,
            status: updated.status,
        })
    }

    pub async fn bulk_transition(
        &self,
        order_ids: &[Uuid],
        target: OrderStatus,
        actor: Actor,
        note: Option<String>,
    ) -> BulkSummary {
        let mut summary = BulkSummary::default();
        for &order_id in order_ids {
            let mut request = TransitionRequest::new(order_id, target, actor);
            request.note = note.clone();
            let result = self.transition(request).await;
            summary.record(order_id, result);
        }
        info!(
            target = ?target,
            updated = summary.updated.len(),
            skipped = summary.skipped.len(),
            "bulk status update finished"
        );
        summary
    }

    pub async fn assign_single(&self, order_id: Uuid, actor: Actor) -> Result<AssignOutcome, EngineError> {
        self.scheduler.assign_single(order_id, actor).await
    }

    pub async fn auto_assign_sweep(&self) -> Result<SweepReport, EngineError> {
        self.scheduler.auto_assign_sweep().await
    }

    pub async fn release(&self, agent_id: Uuid) -> Result<ReleaseOutcome, EngineError> {
        self.scheduler.release(agent_id).await
    }

    pub async fn reassign(
        &self,
        order_id: Uuid,
        new_agent_id: Uuid,
        reason: String,
        actor: Actor,
    ) -> Result<Order, EngineError> {
        self.scheduler.reassign(order_id, new_agent_id, reason, actor).await
    }
}
