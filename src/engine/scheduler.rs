use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use rand::seq::SliceRandom;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::engine::side_effects::SideEffects;
use crate::engine::{EngineSettings, bounded, is_conflict};
use crate::error::EngineError;
use crate::models::agent::Agent;
use crate::models::event::{FulfillmentEvent, FulfillmentEventKind};
use crate::models::order::{Actor, DeliveryChannel, Order, OrderStatus, TimelineAction};
use crate::notify::Notification;
use crate::observability::metrics::Metrics;
use crate::store::{AgentQuery, FulfillmentStore, Guard, OrderQuery, WriteBatch};

/// Matching policy. Location is tracked on agents but deliberately unused here.
pub trait AgentSelector: Send + Sync {
    fn select<'a>(&self, candidates: &'a [Agent]) -> Option<&'a Agent>;

    /// Order in which a sweep hands out agents, one each.
    fn sweep_order(&self, candidates: Vec<Agent>) -> Vec<Agent> {
        candidates
    }
}

/// Uniform random pick among eligible agents.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSelector;

impl AgentSelector for RandomSelector {
    fn select<'a>(&self, candidates: &'a [Agent]) -> Option<&'a Agent> {
        candidates.choose(&mut rand::thread_rng())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AssignOutcome {
    Assigned { agent_id: Uuid },
    PendingAgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Released,
    AlreadyFree,
    Missing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub considered: usize,
    pub assigned: usize,
    pub unassigned: usize,
    pub skipped: usize,
    pub assignments: Vec<(Uuid, Uuid)>,
}

pub struct AssignmentScheduler {
    store: Arc<dyn FulfillmentStore>,
    selector: Arc<dyn AgentSelector>,
    clock: Arc<dyn Clock>,
    effects: Arc<SideEffects>,
    settings: EngineSettings,
    metrics: Metrics,
}

impl AssignmentScheduler {
    pub fn new(
        store: Arc<dyn FulfillmentStore>,
        selector: Arc<dyn AgentSelector>,
        clock: Arc<dyn Clock>,
        effects: Arc<SideEffects>,
        settings: EngineSettings,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            selector,
            clock,
            effects,
            settings,
            metrics,
        }
    }

    async fn load_order(&self, order_id: Uuid) -> Result<Order, EngineError> {
        bounded(self.settings.store_timeout, self.store.get_order(order_id))
            .await?
            .ok_or(EngineError::OrderNotFound(order_id))
    }

    async fn load_agent(&self, agent_id: Uuid) -> Result<Option<Agent>, EngineError> {
        bounded(self.settings.store_timeout, self.store.get_agent(agent_id)).await
    }

    async fn eligible_agents(&self) -> Result<Vec<Agent>, EngineError> {
        bounded(
            self.settings.store_timeout,
            self.store.find_agents(&AgentQuery::eligible()),
        )
        .await
    }

    fn ensure_assignable(order: &Order) -> Result<(), EngineError> {
        if order.delivery.channel != DeliveryChannel::SelfFleet {
            return Err(EngineError::NotApplicable(format!(
                "order {} is not on the self-fleet channel",
                order.id
            )));
        }
        if order.assigned_agent_id.is_some() {
            return Err(EngineError::NotApplicable(format!(
                "order {} already has an agent",
                order.id
            )));
        }
        if order.status.is_terminal() {
            return Err(EngineError::NotApplicable(format!(
                "order {} is already {:?}",
                order.id, order.status
            )));
        }
        Ok(())
    }

    pub async fn assign_single(&self, order_id: Uuid, actor: Actor) -> Result<AssignOutcome, EngineError> {
        for attempt in 1..=self.settings.assign_max_attempts {
            let order = self.load_order(order_id).await?;
            Self::ensure_assignable(&order)?;

            let candidates = self.eligible_agents().await?;
            let Some(agent) = self.selector.select(&candidates).cloned() else {
                match self.park(order).await {
                    Ok(()) => return Ok(AssignOutcome::PendingAgent),
                    Err(err) if is_conflict(&err) => continue,
                    Err(err) => return Err(err),
                }
            };

            let agent_id = agent.id;
            match self.bind(order, agent, actor).await {
                Ok(()) => return Ok(AssignOutcome::Assigned { agent_id }),
                Err(err) if is_conflict(&err) => {
                    self.metrics
                        .assignments_total
                        .with_label_values(&["conflict"])
                        .inc();
                    debug!(order_id = %order_id, agent_id = %agent_id, attempt, "assignment lost a race; retrying");
                }
                Err(err) => return Err(err),
            }
        }

        Err(EngineError::Contention(format!("assignment of order {order_id}")))
    }

    /// Parks an order in the `pending_agent` sub-state until an agent frees up.
    async fn park(&self, mut order: Order) -> Result<(), EngineError> {
        self.metrics
            .assignments_total
            .with_label_values(&["pending_agent"])
            .inc();

        if order.delivery.pending_agent {
            return Ok(());
        }

        let now = self.clock.now();
        order.delivery.pending_agent = true;
        order.record(now, Actor::System, TimelineAction::AwaitingAgent, None);
        let (order_id, status) = (order.id, order.status);

        bounded(
            self.settings.store_timeout,
            self.store.commit(WriteBatch::new().put_order(order)),
        )
        .await?;

        warn!(order_id = %order_id, "no eligible agents; order waiting for agent");
        self.effects.publish(FulfillmentEvent {
            order_id,
            kind: FulfillmentEventKind::AwaitingAgent,
            status,
            agent_id: None,
            at: now,
        });
        Ok(())
    }

    /// Binds order and agent in one batch; the agent's availability is re-checked at commit.
    async fn bind(&self, mut order: Order, mut agent: Agent, actor: Actor) -> Result<(), EngineError> {
        let now = self.clock.now();
        order.bind_agent(agent.id);
        let seq = order.record(
            now,
            actor,
            TimelineAction::AgentAssigned { agent_id: agent.id },
            None,
        );
        agent.occupy(order.id);

        let batch = WriteBatch::new()
            .guard(Guard::AgentAvailable(agent.id))
            .put_order(order.clone())
            .put_agent(agent.clone());
        bounded(self.settings.store_timeout, self.store.commit(batch)).await?;

        self.metrics
            .assignments_total
            .with_label_values(&["assigned"])
            .inc();
        info!(order_id = %order.id, agent_id = %agent.id, "agent assigned");

        self.effects.notify(
            SideEffects::dispatch_key(order.id, seq, "agent"),
            Notification {
                recipient: agent.id.to_string(),
                title: "New delivery assigned".to_string(),
                body: format!("Order {} is assigned to you.", order.id),
                data: json!({ "order_id": order.id, "reassignment": false }),
            },
        );
        self.effects.notify(
            SideEffects::dispatch_key(order.id, seq, "customer"),
            Notification {
                recipient: order.customer_id.clone(),
                title: "Delivery agent assigned".to_string(),
                body: format!("{} will deliver your order.", agent.name),
                data: json!({ "order_id": order.id, "agent_id": agent.id }),
            },
        );
        self.effects.publish(FulfillmentEvent {
            order_id: order.id,
            kind: FulfillmentEventKind::AgentAssigned,
            status: order.status,
            agent_id: Some(agent.id),
            at: now,
        });
        Ok(())
    }

    pub async fn auto_assign_sweep(&self) -> Result<SweepReport, EngineError> {
        let start = Instant::now();
        let result = self.run_sweep().await;

        let outcome = if result.is_ok() { "ok" } else { "error" };
        self.metrics
            .sweep_latency_seconds
            .with_label_values(&[outcome])
            .observe(start.elapsed().as_secs_f64());

        if let Ok(report) = &result {
            info!(
                considered = report.considered,
                assigned = report.assigned,
                unassigned = report.unassigned,
                skipped = report.skipped,
                "auto-assign sweep finished"
            );
        }
        result
    }

    async fn run_sweep(&self) -> Result<SweepReport, EngineError> {
        let cutoff = self.clock.now() - self.settings.sweep_min_age;
        let batch_size = self.settings.sweep_batch_size;

        let fresh = OrderQuery {
            channel: Some(DeliveryChannel::SelfFleet),
            statuses: vec![OrderStatus::Pending, OrderStatus::Processing],
            unassigned_only: true,
            pending_agent: None,
            created_before: Some(cutoff),
            limit: Some(batch_size),
        };
        let parked = OrderQuery {
            statuses: vec![OrderStatus::Printed],
            pending_agent: Some(true),
            ..fresh.clone()
        };

        let mut orders = bounded(self.settings.store_timeout, self.store.find_orders(&fresh)).await?;
        orders.extend(bounded(self.settings.store_timeout, self.store.find_orders(&parked)).await?);
        orders.sort_by_key(|order| order.created_at);
        orders.truncate(batch_size);

        let agents = self.selector.sweep_order(self.eligible_agents().await?);
        let mut queue: VecDeque<Agent> = agents.into();
        let mut report = SweepReport {
            considered: orders.len(),
            ..SweepReport::default()
        };

        for order in orders {
            let mut current = order;
            let mut attempts = 0;

            loop {
                let Some(agent) = queue.pop_front() else {
                    report.unassigned += 1;
                    break;
                };

                let (order_id, agent_id) = (current.id, agent.id);
                match self.bind(current.clone(), agent, Actor::System).await {
                    Ok(()) => {
                        report.assigned += 1;
                        report.assignments.push((order_id, agent_id));
                        break;
                    }
                    Err(err) if is_conflict(&err) => {
                        attempts += 1;
                        // Put the agent back if it is still free; the order side moved instead.
                        match self.load_agent(agent_id).await {
                            Ok(Some(fresh_agent)) if fresh_agent.is_eligible() => {
                                queue.push_front(fresh_agent)
                            }
                            _ => debug!(agent_id = %agent_id, "agent taken elsewhere during sweep"),
                        }

                        let refreshed = match self.load_order(order_id).await {
                            Ok(refreshed) => refreshed,
                            Err(err) => {
                                warn!(order_id = %order_id, error = %err, "skipping order in sweep");
                                report.skipped += 1;
                                break;
                            }
                        };
                        if Self::ensure_assignable(&refreshed).is_err()
                            || attempts >= self.settings.assign_max_attempts
                        {
                            report.skipped += 1;
                            break;
                        }
                        current = refreshed;
                    }
                    Err(err) => {
                        warn!(order_id = %order_id, agent_id = %agent_id, error = %err, "sweep assignment failed");
                        report.skipped += 1;
                        break;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Frees an agent. Safe to call repeatedly; a missing agent is a logged no-op.
    pub async fn release(&self, agent_id: Uuid) -> Result<ReleaseOutcome, EngineError> {
        for _ in 0..self.settings.assign_max_attempts {
            let Some(mut agent) = self.load_agent(agent_id).await? else {
                warn!(agent_id = %agent_id, "release requested for unknown agent");
                return Ok(ReleaseOutcome::Missing);
            };
            if agent.is_released() {
                return Ok(ReleaseOutcome::AlreadyFree);
            }

            let previous = agent.current_order_id;
            agent.release();
            match bounded(
                self.settings.store_timeout,
                self.store.commit(WriteBatch::new().put_agent(agent)),
            )
            .await
            {
                Ok(()) => {
                    info!(agent_id = %agent_id, order_id = ?previous, "agent released");
                    return Ok(ReleaseOutcome::Released);
                }
                Err(err) if is_conflict(&err) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(EngineError::Contention(format!("release of agent {agent_id}")))
    }

    pub async fn reassign(
        &self,
        order_id: Uuid,
        new_agent_id: Uuid,
        reason: String,
        actor: Actor,
    ) -> Result<Order, EngineError> {
        for _ in 0..self.settings.assign_max_attempts {
            let mut order = self.load_order(order_id).await?;
            if !order.is_self_fleet() || order.status.is_terminal() {
                return Err(EngineError::NotApplicable(format!(
                    "order {order_id} cannot be reassigned"
                )));
            }
            if order.assigned_agent_id == Some(new_agent_id) {
                return Err(EngineError::NotApplicable(format!(
                    "order {order_id} is already assigned to agent {new_agent_id}"
                )));
            }

            let mut new_agent = self
                .load_agent(new_agent_id)
                .await?
                .ok_or(EngineError::AgentNotFound(new_agent_id))?;
            if !new_agent.is_eligible() {
                return Err(EngineError::AgentUnavailable(new_agent_id));
            }

            let previous = order.assigned_agent_id;
            let mut batch = WriteBatch::new().guard(Guard::AgentAvailable(new_agent_id));
            if let Some(previous_id) = previous {
                match self.load_agent(previous_id).await? {
                    Some(mut previous_agent) if previous_agent.current_order_id == Some(order_id) => {
                        previous_agent.release();
                        batch = batch.put_agent(previous_agent);
                    }
                    Some(_) => {
                        debug!(agent_id = %previous_id, "previous agent no longer holds the order")
                    }
                    None => warn!(agent_id = %previous_id, "previous agent missing; skipping release"),
                }
            }

            let now = self.clock.now();
            order.bind_agent(new_agent_id);
            order.delivery.reassigned = true;
            order.delivery.reassign_reason = Some(reason.clone());
            let seq = order.record(
                now,
                actor,
                TimelineAction::AgentReassigned {
                    from: previous,
                    to: new_agent_id,
                },
                Some(reason.clone()),
            );
            new_agent.occupy(order_id);

            let batch = batch.put_order(order.clone()).put_agent(new_agent.clone());
            match bounded(self.settings.store_timeout, self.store.commit(batch)).await {
                Ok(()) => {}
                Err(err) if is_conflict(&err) => continue,
                Err(err) => return Err(err),
            }

            info!(order_id = %order_id, from = ?previous, to = %new_agent_id, reason = %reason, "order reassigned");
            self.effects.notify(
                SideEffects::dispatch_key(order_id, seq, "customer"),
                Notification {
                    recipient: order.customer_id.clone(),
                    title: "Delivery agent changed".to_string(),
                    body: format!("{} will now deliver your order.", new_agent.name),
                    data: json!({ "order_id": order_id, "agent_id": new_agent_id }),
                },
            );
            self.effects.notify(
                SideEffects::dispatch_key(order_id, seq, "agent"),
                Notification {
                    recipient: new_agent_id.to_string(),
                    title: "Delivery reassigned to you".to_string(),
                    body: format!("Order {order_id} has been reassigned to you."),
                    data: json!({ "order_id": order_id, "reassignment": true, "reason": reason }),
                },
            );
            self.effects.publish(FulfillmentEvent {
                order_id,
                kind: FulfillmentEventKind::AgentReassigned,
                status: order.status,
                agent_id: Some(new_agent_id),
                at: now,
            });

            return self.load_order(order_id).await;
        }

        Err(EngineError::Contention(format!("reassignment of order {order_id}")))
    }
}
