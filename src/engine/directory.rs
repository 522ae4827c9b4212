use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::engine::{EngineSettings, bounded, is_conflict};
use crate::error::EngineError;
use crate::models::agent::{AccountStatus, Agent, AgentLocation, Availability, GeoPoint, Performance};
use crate::store::{AgentQuery, FulfillmentStore, WriteBatch};

#[derive(Debug, Clone)]
pub struct NewAgent {
    pub name: String,
    pub phone: String,
    pub account_status: AccountStatus,
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkSkip {
    pub id: Uuid,
    pub reason: String,
}

/// Result of a bulk operation: one stale reference never blocks the rest.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkSummary {
    pub updated: Vec<Uuid>,
    pub skipped: Vec<BulkSkip>,
}

impl BulkSummary {
    pub fn record<T>(&mut self, id: Uuid, result: Result<T, EngineError>) {
        match result {
            Ok(_) => self.updated.push(id),
            Err(err) => {
                warn!(id = %id, error = %err, "bulk item skipped");
                self.skipped.push(BulkSkip {
                    id,
                    reason: err.to_string(),
                });
            }
        }
    }
}

/// Agent records: onboarding shim, operational availability and location.
/// Busy/free bookkeeping for assignments lives in the scheduler.
pub struct AgentDirectory {
    store: Arc<dyn FulfillmentStore>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
}

impl AgentDirectory {
    pub fn new(store: Arc<dyn FulfillmentStore>, clock: Arc<dyn Clock>, settings: EngineSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    pub async fn register(&self, new_agent: NewAgent) -> Result<Agent, EngineError> {
        let now = self.clock.now();
        // Approved agents start on shift; anyone else waits offline until approved.
        let availability = if new_agent.account_status == AccountStatus::Active {
            Availability::Available
        } else {
            Availability::Offline
        };
        let agent = Agent {
            id: Uuid::new_v4(),
            version: 0,
            name: new_agent.name,
            phone: new_agent.phone,
            account_status: new_agent.account_status,
            availability,
            current_order_id: None,
            performance: Performance::default(),
            location: new_agent.location.map(|point| AgentLocation {
                lat: point.lat,
                lng: point.lng,
                last_updated: now,
            }),
            created_at: now,
            updated_at: now,
        };

        let agent = bounded(self.settings.store_timeout, self.store.insert_agent(agent)).await?;
        info!(agent_id = %agent.id, "agent registered");
        Ok(agent)
    }

    pub async fn get(&self, agent_id: Uuid) -> Result<Agent, EngineError> {
        bounded(self.settings.store_timeout, self.store.get_agent(agent_id))
            .await?
            .ok_or(EngineError::AgentNotFound(agent_id))
    }

    pub async fn list(&self, query: &AgentQuery) -> Result<Vec<Agent>, EngineError> {
        bounded(self.settings.store_timeout, self.store.find_agents(query)).await
    }

    /// Applies `change` to the stored agent, retrying on version conflicts.
    async fn update<F>(&self, agent_id: Uuid, change: F) -> Result<Agent, EngineError>
    where
        F: Fn(&mut Agent) -> Result<(), EngineError>,
    {
        for _ in 0..self.settings.assign_max_attempts {
            let mut agent = self.get(agent_id).await?;
            change(&mut agent)?;

            match bounded(
                self.settings.store_timeout,
                self.store.commit(WriteBatch::new().put_agent(agent)),
            )
            .await
            {
                Ok(()) => return self.get(agent_id).await,
                Err(err) if is_conflict(&err) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(EngineError::Contention(format!("update of agent {agent_id}")))
    }

    /// Agents go on and off shift here. Busy is only ever set by an assignment.
    pub async fn set_availability(
        &self,
        agent_id: Uuid,
        availability: Availability,
    ) -> Result<Agent, EngineError> {
        let agent = self
            .update(agent_id, |agent| {
                if availability == Availability::Busy {
                    return Err(EngineError::NotApplicable(
                        "agents become busy only through assignment".to_string(),
                    ));
                }
                if let Some(order_id) = agent.current_order_id {
                    return Err(EngineError::NotApplicable(format!(
                        "agent {} is delivering order {order_id}",
                        agent.id
                    )));
                }
                agent.availability = availability;
                Ok(())
            })
            .await?;

        info!(agent_id = %agent_id, availability = ?availability, "agent availability changed");
        Ok(agent)
    }

    pub async fn set_account_status(
        &self,
        agent_id: Uuid,
        account_status: AccountStatus,
    ) -> Result<Agent, EngineError> {
        let agent = self
            .update(agent_id, |agent| {
                if account_status != AccountStatus::Active && agent.current_order_id.is_some() {
                    return Err(EngineError::NotApplicable(format!(
                        "agent {} has an active delivery",
                        agent.id
                    )));
                }
                agent.account_status = account_status;
                Ok(())
            })
            .await?;

        info!(agent_id = %agent_id, account_status = ?account_status, "agent account status changed");
        Ok(agent)
    }

    pub async fn update_location(&self, agent_id: Uuid, point: GeoPoint) -> Result<Agent, EngineError> {
        let now = self.clock.now();
        self.update(agent_id, |agent| {
            agent.location = Some(AgentLocation {
                lat: point.lat,
                lng: point.lng,
                last_updated: now,
            });
            Ok(())
        })
        .await
    }

    pub async fn bulk_set_availability(
        &self,
        agent_ids: &[Uuid],
        availability: Availability,
    ) -> BulkSummary {
        let mut summary = BulkSummary::default();
        for &agent_id in agent_ids {
            let result = self.set_availability(agent_id, availability).await;
            summary.record(agent_id, result);
        }
        summary
    }
}
