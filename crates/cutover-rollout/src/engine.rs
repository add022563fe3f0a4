//! Strategy engine: executes one deployment's plan.
//!
//! Every step is strictly sequential: overwrite a formation, block on the
//! matcher until the scheduler confirms it, then append one deployment
//! event per confirmed job. No rollback is attempted on failure; the old
//! release is always written last in a unit, so an aborted deployment
//! leaves the app at the last confirmed mixed state.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use cutover_core::*;
use cutover_state::{DeploymentRepo, EventLog};

use crate::controller::Controller;
use crate::error::{ControllerError, RolloutError, RolloutResult};
use crate::matcher::{JobEventMatcher, MatchError};
use crate::strategy::StrategyPlan;

#[derive(Clone)]
pub struct StrategyEngine {
    controller: Arc<dyn Controller>,
    log: EventLog,
    repo: DeploymentRepo,
    cancel: Option<watch::Receiver<bool>>,
}

impl StrategyEngine {
    pub fn new(controller: Arc<dyn Controller>, log: EventLog, repo: DeploymentRepo) -> Self {
        Self {
            controller,
            log,
            repo,
            cancel: None,
        }
    }

    /// Abort in-flight waits once `true` is sent on this channel.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Run a deployment to a terminal outcome or an error.
    ///
    /// Success and crashes set `finished_at`. Every other failure leaves the
    /// deployment unfinished and is returned to the caller.
    pub async fn run(&self, deployment: &Deployment) -> RolloutResult<()> {
        info!(
            deployment = %deployment.id,
            app = %deployment.app_id,
            old_release = %deployment.old_release_id,
            new_release = %deployment.new_release_id,
            strategy = %deployment.strategy,
            "deployment started"
        );

        match self.execute(deployment).await {
            Ok(()) => {
                self.repo.finish(&deployment.id)?;
                info!(deployment = %deployment.id, "deployment complete");
                Ok(())
            }
            Err(RolloutError::Match(MatchError::Crashed { job, unmet })) => {
                warn!(
                    deployment = %deployment.id,
                    process_type = %job.process_type,
                    job = %job.job_id,
                    unmet = %unmet,
                    "deployment failed: job crashed"
                );
                self.log.append(NewDeploymentEvent::from_job(
                    deployment.id,
                    &job,
                    DeploymentEventStatus::Failed,
                ))?;
                self.repo.finish(&deployment.id)?;
                Err(RolloutError::Match(MatchError::Crashed { job, unmet }))
            }
            Err(e) => {
                warn!(deployment = %deployment.id, error = %e, "deployment aborted");
                Err(e)
            }
        }
    }

    async fn execute(&self, deployment: &Deployment) -> RolloutResult<()> {
        // Subscribe before the first write so no confirmation is missed.
        let mut stream = self
            .controller
            .stream_job_events(&deployment.app_id, 0)
            .await?;

        let old = self
            .controller
            .get_formation(&deployment.app_id, &deployment.old_release_id)
            .await?;
        let new = match self
            .controller
            .get_formation(&deployment.app_id, &deployment.new_release_id)
            .await
        {
            Ok(formation) => formation,
            Err(ControllerError::NotFound(_)) => {
                Formation::empty(&deployment.app_id, &deployment.new_release_id)
            }
            Err(e) => return Err(e.into()),
        };

        let plan = deployment.strategy.plan(&old, &new);
        debug!(deployment = %deployment.id, steps = plan.len(), "plan built");

        let mut matcher = JobEventMatcher::new(self.cancel.clone());
        let last_step = plan.len().saturating_sub(1);

        for (i, step) in plan.steps.into_iter().enumerate() {
            debug!(
                deployment = %deployment.id,
                release = %step.formation.release_id,
                processes = ?step.formation.processes,
                expect = %step.expect,
                "writing formation"
            );
            self.controller.put_formation(&step.formation).await?;

            let matched = matcher.wait(&mut stream, step.expect).await?;

            let last_job = matched.len().saturating_sub(1);
            for (j, job) in matched.iter().enumerate() {
                let status = if i == last_step && j == last_job {
                    DeploymentEventStatus::Complete
                } else {
                    DeploymentEventStatus::Running
                };
                let event = self
                    .log
                    .append(NewDeploymentEvent::from_job(deployment.id, job, status))?;
                info!(
                    deployment = %deployment.id,
                    event_id = event.id,
                    job_type = %event.job_type,
                    job_state = %event.job_state,
                    "step confirmed"
                );
            }
        }

        Ok(())
    }
}
