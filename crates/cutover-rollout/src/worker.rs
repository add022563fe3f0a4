//! Deployment worker: drains the work queue into the strategy engine.
//!
//! Each claimed deployment runs in its own task, so one app waiting on its
//! scheduler never holds up another. Delivery is at-least-once. A job whose
//! deployment is already finished is acknowledged without running. A job
//! interrupted by shutdown stays claimed and is handed out again after
//! `release_locks` on next start.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use cutover_core::DeployId;
use cutover_state::{DEPLOYMENT_JOB, DeploymentRepo, QueuedJob, WorkQueue};

use crate::engine::StrategyEngine;
use crate::error::RolloutResult;

const DEFAULT_MAX_CONCURRENT: usize = 16;

#[derive(Clone)]
pub struct DeploymentWorker {
    repo: DeploymentRepo,
    engine: StrategyEngine,
    poll_interval: Duration,
    max_concurrent: usize,
}

impl DeploymentWorker {
    pub fn new(repo: DeploymentRepo, engine: StrategyEngine, poll_interval: Duration) -> Self {
        Self {
            repo,
            engine,
            poll_interval,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }

    /// Cap on deployments running at once. Values below one are raised to one.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    fn queue(&self) -> &WorkQueue {
        self.repo.queue()
    }

    /// Poll the queue until the shutdown signal fires.
    ///
    /// On shutdown no new jobs are claimed and in-flight deployments are
    /// awaited. Give the engine the same signal through
    /// [`StrategyEngine::with_cancel`] so their waits end promptly.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        match self.queue().release_locks() {
            Ok(0) => {}
            Ok(released) => info!(released, "redelivering unacknowledged deployment jobs"),
            Err(e) => warn!(error = %e, "failed to release queue locks"),
        }
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            max_concurrent = self.max_concurrent,
            "deployment worker started"
        );

        let mut running = JoinSet::new();
        loop {
            if *shutdown.borrow() {
                break;
            }
            while let Some(done) = running.try_join_next() {
                log_task_exit(done);
            }

            if running.len() < self.max_concurrent {
                match self.queue().dequeue(DEPLOYMENT_JOB) {
                    Ok(Some(job)) => {
                        let worker = self.clone();
                        running.spawn(async move {
                            let job_id = job.id;
                            if let Err(e) = worker.process(job).await {
                                error!(job_id, error = %e, "deployment job bookkeeping failed");
                            }
                        });
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "failed to claim deployment job"),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                Some(done) = running.join_next(), if !running.is_empty() => log_task_exit(done),
                _ = shutdown.changed() => break,
            }
        }

        info!(in_flight = running.len(), "deployment worker shutting down");
        while let Some(done) = running.join_next().await {
            log_task_exit(done);
        }
        info!("deployment worker stopped");
    }

    /// Claim and process at most one job inline. Returns whether a job was
    /// found.
    pub async fn work_once(&self) -> RolloutResult<bool> {
        let Some(job) = self.queue().dequeue(DEPLOYMENT_JOB)? else {
            return Ok(false);
        };
        self.process(job).await?;
        Ok(true)
    }

    async fn process(&self, job: QueuedJob) -> RolloutResult<()> {
        let args: DeployId = match job.decode_args() {
            Ok(args) => args,
            Err(e) => {
                self.queue().fail(job.id, &e.to_string())?;
                return Ok(());
            }
        };

        let deployment = match self.repo.get(&args.id) {
            Ok(d) => d,
            Err(e) => {
                self.queue().fail(job.id, &e.to_string())?;
                return Ok(());
            }
        };

        if deployment.is_finished() {
            debug!(deployment = %deployment.id, job_id = job.id, "deployment already finished, skipping");
            self.queue().complete(job.id)?;
            return Ok(());
        }

        match self.engine.run(&deployment).await {
            Ok(()) => self.queue().complete(job.id)?,
            Err(e) if e.is_terminal() => self.queue().complete(job.id)?,
            Err(e) if e.is_cancelled() => {
                debug!(deployment = %deployment.id, job_id = job.id, "deployment interrupted, job left claimed");
            }
            Err(e) => self.queue().fail(job.id, &e.to_string())?,
        }
        Ok(())
    }
}

fn log_task_exit(result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "deployment task panicked");
    }
}
