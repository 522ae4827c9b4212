//! Persistence seam. The engine only talks to storage through [`FulfillmentStore`].
//!
//! Every document carries a `version`. A [`WriteBatch`] is applied all-or-nothing:
//! each put is a compare-and-swap on the version the caller read, and every
//! [`Guard`] is re-evaluated against the committed state before anything is written.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::models::agent::{AccountStatus, Agent, Availability};
use crate::models::order::{DeliveryChannel, Order, OrderStatus};
use crate::models::otp::DeliveryOtp;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("duplicate document: {0}")]
    Duplicate(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Otp(#[from] OtpError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OtpError {
    #[error("delivery code is required")]
    Missing,

    #[error("no active delivery code for order")]
    NotFound,

    #[error("delivery code expired")]
    Expired,

    #[error("delivery code does not match")]
    Mismatch,
}

#[derive(Debug, Clone)]
pub enum Guard {
    /// Agent must still be active and available when the batch commits.
    AgentAvailable(Uuid),
}

#[derive(Debug, Clone)]
pub enum Mutation {
    PutOrder(Order),
    PutAgent(Agent),
    /// Marks the order's newest live code used. Fails the whole batch with
    /// [`StoreError::Otp`] when the code is missing, expired or different.
    ConsumeOtp { order_id: Uuid, code: String },
}

#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub guards: Vec<Guard>,
    pub mutations: Vec<Mutation>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn put_order(mut self, order: Order) -> Self {
        self.mutations.push(Mutation::PutOrder(order));
        self
    }

    pub fn put_agent(mut self, agent: Agent) -> Self {
        self.mutations.push(Mutation::PutAgent(agent));
        self
    }

    pub fn consume_otp(mut self, order_id: Uuid, code: impl Into<String>) -> Self {
        self.mutations.push(Mutation::ConsumeOtp {
            order_id,
            code: code.into(),
        });
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub orders: usize,
    pub agents: usize,
    pub available_agents: usize,
}

#[derive(Debug, Clone, Default)]
pub struct OrderQuery {
    pub channel: Option<DeliveryChannel>,
    pub statuses: Vec<OrderStatus>,
    pub unassigned_only: bool,
    pub pending_agent: Option<bool>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl OrderQuery {
    pub fn matches(&self, order: &Order) -> bool {
        if let Some(channel) = self.channel {
            if order.delivery.channel != channel {
                return false;
            }
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&order.status) {
            return false;
        }
        if self.unassigned_only && order.assigned_agent_id.is_some() {
            return false;
        }
        if let Some(pending) = self.pending_agent {
            if order.delivery.pending_agent != pending {
                return false;
            }
        }
        if let Some(cutoff) = self.created_before {
            if order.created_at >= cutoff {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentQuery {
    pub account_status: Option<AccountStatus>,
    pub availability: Option<Availability>,
    pub limit: Option<usize>,
}

impl AgentQuery {
    pub fn eligible() -> Self {
        Self {
            account_status: Some(AccountStatus::Active),
            availability: Some(Availability::Available),
            limit: None,
        }
    }

    pub fn matches(&self, agent: &Agent) -> bool {
        self.account_status.is_none_or(|status| agent.account_status == status)
            && self.availability.is_none_or(|availability| agent.availability == availability)
    }
}

#[async_trait]
pub trait FulfillmentStore: Send + Sync {
    async fn insert_order(&self, order: Order) -> Result<Order, StoreError>;
    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, StoreError>;
    /// Matching orders, oldest first.
    async fn find_orders(&self, query: &OrderQuery) -> Result<Vec<Order>, StoreError>;
    async fn find_order_by_shipment_ref(&self, shipment_ref: &str)
        -> Result<Option<Order>, StoreError>;

    async fn insert_agent(&self, agent: Agent) -> Result<Agent, StoreError>;
    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>, StoreError>;
    /// Matching agents, oldest first.
    async fn find_agents(&self, query: &AgentQuery) -> Result<Vec<Agent>, StoreError>;

    /// Applies the whole batch or nothing. Fails with [`StoreError::Conflict`] when a
    /// version or guard no longer holds.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Document counts for liveness reporting.
    async fn stats(&self) -> Result<StoreStats, StoreError>;

    async fn insert_otp(&self, otp: DeliveryOtp) -> Result<(), StoreError>;
    /// Single check-and-set over the newest unused code for the order.
    async fn consume_otp(
        &self,
        order_id: Uuid,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<Result<DeliveryOtp, OtpError>, StoreError>;
    async fn active_otp(
        &self,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryOtp>, StoreError>;
}
