//! Deployment event log: durable, append-only, strictly ordered.
//!
//! `append` persists first and publishes the wake-up second. A wake-up is
//! never the data: readers resolve it with [`EventLog::get_by_id`].

use std::time::Duration;

use tracing::debug;

use cutover_core::*;

use crate::error::StateResult;
use crate::notify::Notifier;
use crate::store::StateStore;
use crate::tail::{LiveTail, TailResult};

#[derive(Clone)]
pub struct EventLog {
    store: StateStore,
    notifier: Notifier,
}

impl EventLog {
    pub fn new(store: StateStore, notifier: Notifier) -> Self {
        Self { store, notifier }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Persist an event under the next global id, then wake subscribers.
    pub fn append(&self, event: NewDeploymentEvent) -> StateResult<DeploymentEvent> {
        let stored = self.store.insert_deployment_event(&event)?;
        self.notifier.publish(EventNotification {
            deployment_id: stored.deployment_id,
            event_id: stored.id,
        });
        debug!(
            deployment = %stored.deployment_id,
            event_id = stored.id,
            job_type = %stored.job_type,
            job_state = %stored.job_state,
            status = ?stored.status,
            "deployment event appended"
        );
        Ok(stored)
    }

    /// Events of one deployment with id greater than `since_id`, ascending.
    pub fn list_since(
        &self,
        deployment_id: &DeploymentId,
        since_id: EventId,
    ) -> StateResult<Vec<DeploymentEvent>> {
        self.store.list_deployment_events(deployment_id, since_id)
    }

    pub fn get_by_id(&self, id: EventId) -> StateResult<DeploymentEvent> {
        self.store.get_deployment_event(id)
    }

    /// Open a live tail starting after `since_id`.
    pub fn tail(
        &self,
        deployment_id: DeploymentId,
        since_id: EventId,
        keepalive: Duration,
    ) -> TailResult<LiveTail> {
        LiveTail::open(self.clone(), deployment_id, since_id, keepalive)
    }
}
