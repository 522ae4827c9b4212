use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::agent::Agent;
use crate::models::order::Order;
use crate::models::otp::DeliveryOtp;
use crate::store::{
    AgentQuery, FulfillmentStore, Guard, Mutation, OrderQuery, OtpError, StoreError, StoreStats,
    WriteBatch,
};

/// In-process store. Batches and every OTP write are serialised through
/// `commit_lock`; point reads go straight to the maps.
pub struct MemoryStore {
    orders: DashMap<Uuid, Order>,
    agents: DashMap<Uuid, Agent>,
    otps: DashMap<Uuid, Vec<DeliveryOtp>>,
    commit_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            orders: DashMap::new(),
            agents: DashMap::new(),
            otps: DashMap::new(),
            commit_lock: Mutex::new(()),
            clock,
        }
    }

    /// Index of the order's newest unused code, provided `code` may consume it.
    fn live_otp(&self, order_id: Uuid, code: &str, now: DateTime<Utc>) -> Result<usize, OtpError> {
        let codes = self.otps.get(&order_id).ok_or(OtpError::NotFound)?;
        let (index, latest) = codes
            .iter()
            .enumerate()
            .filter(|(_, otp)| !otp.used)
            .max_by_key(|(_, otp)| otp.issued_at)
            .ok_or(OtpError::NotFound)?;

        if latest.is_expired(now) {
            return Err(OtpError::Expired);
        }
        if latest.code != code {
            return Err(OtpError::Mismatch);
        }
        Ok(index)
    }

    fn mark_used(&self, order_id: Uuid, index: usize) -> Option<DeliveryOtp> {
        let mut codes = self.otps.get_mut(&order_id)?;
        let otp = codes.value_mut().get_mut(index)?;
        otp.used = true;
        Some(otp.clone())
    }

    /// Validates the whole batch and returns the codes it will consume.
    fn check_batch(
        &self,
        batch: &WriteBatch,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Uuid, usize)>, StoreError> {
        for mutation in &batch.mutations {
            match mutation {
                Mutation::PutOrder(order) => {
                    let current = self
                        .orders
                        .get(&order.id)
                        .ok_or_else(|| StoreError::Conflict(format!("order {} vanished", order.id)))?;
                    if current.version != order.version {
                        return Err(StoreError::Conflict(format!(
                            "order {} at version {}, expected {}",
                            order.id, current.version, order.version
                        )));
                    }
                }
                Mutation::PutAgent(agent) => {
                    let current = self
                        .agents
                        .get(&agent.id)
                        .ok_or_else(|| StoreError::Conflict(format!("agent {} vanished", agent.id)))?;
                    if current.version != agent.version {
                        return Err(StoreError::Conflict(format!(
                            "agent {} at version {}, expected {}",
                            agent.id, current.version, agent.version
                        )));
                    }
                }
                Mutation::ConsumeOtp { .. } => {}
            }
        }

        for guard in &batch.guards {
            match guard {
                Guard::AgentAvailable(agent_id) => {
                    let eligible = self
                        .agents
                        .get(agent_id)
                        .is_some_and(|agent| agent.is_eligible());
                    if !eligible {
                        return Err(StoreError::Conflict(format!(
                            "agent {agent_id} is no longer available"
                        )));
                    }
                }
            }
        }

        // Codes are checked last so a stale version is reported as a retryable conflict.
        let mut consumed = Vec::new();
        for mutation in &batch.mutations {
            if let Mutation::ConsumeOtp { order_id, code } = mutation {
                consumed.push((*order_id, self.live_otp(*order_id, code, now)?));
            }
        }

        Ok(consumed)
    }
}

#[async_trait]
impl FulfillmentStore for MemoryStore {
    async fn insert_order(&self, mut order: Order) -> Result<Order, StoreError> {
        let _guard = self.commit_lock.lock().await;
        if self.orders.contains_key(&order.id) {
            return Err(StoreError::Duplicate(format!("order {}", order.id)));
        }

        order.version = 1;
        order.updated_at = self.clock.now();
        self.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_orders(&self, query: &OrderQuery) -> Result<Vec<Order>, StoreError> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();

        orders.sort_by_key(|order| order.created_at);
        if let Some(limit) = query.limit {
            orders.truncate(limit);
        }
        Ok(orders)
    }

    async fn find_order_by_shipment_ref(
        &self,
        shipment_ref: &str,
    ) -> Result<Option<Order>, StoreError> {
        Ok(self
            .orders
            .iter()
            .find(|entry| entry.delivery.provider_shipment_ref.as_deref() == Some(shipment_ref))
            .map(|entry| entry.value().clone()))
    }

    async fn insert_agent(&self, mut agent: Agent) -> Result<Agent, StoreError> {
        let _guard = self.commit_lock.lock().await;
        if self.agents.contains_key(&agent.id) {
            return Err(StoreError::Duplicate(format!("agent {}", agent.id)));
        }

        agent.version = 1;
        agent.updated_at = self.clock.now();
        self.agents.insert(agent.id, agent.clone());
        Ok(agent)
    }

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>, StoreError> {
        Ok(self.agents.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_agents(&self, query: &AgentQuery) -> Result<Vec<Agent>, StoreError> {
        let mut agents: Vec<Agent> = self
            .agents
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();

        agents.sort_by_key(|agent| (agent.created_at, agent.id));
        if let Some(limit) = query.limit {
            agents.truncate(limit);
        }
        Ok(agents)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let _guard = self.commit_lock.lock().await;
        let now = self.clock.now();
        let consumed = self.check_batch(&batch, now)?;

        for mutation in batch.mutations {
            match mutation {
                Mutation::PutOrder(mut order) => {
                    order.version += 1;
                    order.updated_at = now;
                    self.orders.insert(order.id, order);
                }
                Mutation::PutAgent(mut agent) => {
                    agent.version += 1;
                    agent.updated_at = now;
                    self.agents.insert(agent.id, agent);
                }
                Mutation::ConsumeOtp { .. } => {}
            }
        }
        for (order_id, index) in consumed {
            self.mark_used(order_id, index);
        }

        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(StoreStats {
            orders: self.orders.len(),
            agents: self.agents.len(),
            available_agents: self
                .agents
                .iter()
                .filter(|entry| entry.value().is_eligible())
                .count(),
        })
    }

    async fn insert_otp(&self, otp: DeliveryOtp) -> Result<(), StoreError> {
        let _guard = self.commit_lock.lock().await;
        self.otps.entry(otp.order_id).or_default().push(otp);
        Ok(())
    }

    async fn consume_otp(
        &self,
        order_id: Uuid,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<Result<DeliveryOtp, OtpError>, StoreError> {
        let _guard = self.commit_lock.lock().await;
        let index = match self.live_otp(order_id, code, now) {
            Ok(index) => index,
            Err(err) => return Ok(Err(err)),
        };

        Ok(self.mark_used(order_id, index).ok_or(OtpError::NotFound))
    }

    async fn active_otp(
        &self,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryOtp>, StoreError> {
        Ok(self.otps.get(&order_id).and_then(|codes| {
            codes
                .iter()
                .filter(|otp| !otp.used)
                .max_by_key(|otp| otp.issued_at)
                .filter(|otp| !otp.is_expired(now))
                .cloned()
        }))
    }
}
