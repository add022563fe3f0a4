//! Deployment repository: admission of new deployments.
//!
//! `add` writes the deployment row and then enqueues one work item for it.
//! These are two separate commits: if the enqueue fails the row stays, and
//! the deployment only runs once something re-enqueues it.

use tracing::{info, warn};

use cutover_core::*;

use crate::error::StateResult;
use crate::queue::WorkQueue;
use crate::store::StateStore;

/// Work-queue job type for deployments.
pub const DEPLOYMENT_JOB: &str = "Deployment";

#[derive(Clone)]
pub struct DeploymentRepo {
    store: StateStore,
    queue: WorkQueue,
}

impl DeploymentRepo {
    pub fn new(store: StateStore, queue: WorkQueue) -> Self {
        Self { store, queue }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Persist a deployment and hand it to the work queue.
    ///
    /// Rejected with `ActiveDeployment` while the app has an unfinished one.
    pub fn add(&self, req: &NewDeployment) -> StateResult<Deployment> {
        let deployment = self.store.insert_deployment(req)?;
        if let Err(e) = self
            .queue
            .enqueue(DEPLOYMENT_JOB, &DeployId { id: deployment.id })
        {
            warn!(
                deployment = %deployment.id,
                error = %e,
                "deployment stored but not enqueued"
            );
            return Err(e);
        }
        info!(
            deployment = %deployment.id,
            app = %deployment.app_id,
            old_release = %deployment.old_release_id,
            new_release = %deployment.new_release_id,
            strategy = %deployment.strategy,
            "deployment admitted"
        );
        Ok(deployment)
    }

    pub fn get(&self, id: &DeploymentId) -> StateResult<Deployment> {
        self.store.get_deployment(id)
    }

    /// Mark a deployment finished. Errors if it already was.
    pub fn finish(&self, id: &DeploymentId) -> StateResult<Deployment> {
        self.store.finish_deployment(id)
    }

    /// The unfinished deployment for an app, if any.
    pub fn active_for_app(&self, app_id: &str) -> StateResult<Option<Deployment>> {
        Ok(self
            .store
            .list_deployments_for_app(app_id)?
            .into_iter()
            .find(|d| !d.is_finished()))
    }
}
