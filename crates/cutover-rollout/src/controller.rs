//! Controller contract consumed by the strategy engine.
//!
//! The engine only needs three operations: read a formation, overwrite a
//! formation, and stream job events for an app. [`LocalController`] serves
//! them from the state store plus an in-process [`JobEventBus`] that the
//! scheduler reports into.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use cutover_core::{Formation, JobEvent};
use cutover_state::StateStore;

use crate::error::{ControllerError, ControllerResult};

/// Job events for one app. Dropping the stream closes it.
pub type JobEventStream = BoxStream<'static, ControllerResult<JobEvent>>;

#[async_trait]
pub trait Controller: Send + Sync {
    async fn get_formation(&self, app_id: &str, release_id: &str) -> ControllerResult<Formation>;

    /// Overwrite the whole formation.
    async fn put_formation(&self, formation: &Formation) -> ControllerResult<()>;

    /// Subscribe to job events for an app. Events published after this
    /// returns are delivered; `since_id` 0 means live events only.
    async fn stream_job_events(
        &self,
        app_id: &str,
        since_id: u64,
    ) -> ControllerResult<JobEventStream>;
}

/// In-process fan-out of scheduler job events.
#[derive(Clone)]
pub struct JobEventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl JobEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a job event. Returns the number of live subscribers.
    pub fn publish(&self, event: JobEvent) -> usize {
        trace!(
            app = %event.app_id,
            release = %event.release_id,
            job = %event.job_id,
            process_type = %event.process_type,
            state = %event.state,
            "job event published"
        );
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to one app's events.
    ///
    /// The subscription is taken before returning. A subscriber that falls
    /// behind gets one `Lagged` error and the stream ends.
    pub fn subscribe(&self, app_id: &str) -> JobEventStream {
        let app_id = app_id.to_string();
        let rx = self.tx.subscribe();
        stream::unfold(Some(rx), move |rx| {
            let app_id = app_id.clone();
            async move {
                let mut rx = rx?;
                loop {
                    match rx.recv().await {
                        Ok(event) if event.app_id == app_id => return Some((Ok(event), Some(rx))),
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(lost)) => {
                            warn!(app = %app_id, lost, "job event subscriber lagged");
                            return Some((Err(ControllerError::Lagged(lost)), None));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed()
    }
}

/// Controller backed by the local state store and job event bus.
#[derive(Clone)]
pub struct LocalController {
    store: StateStore,
    bus: JobEventBus,
}

impl LocalController {
    pub fn new(store: StateStore, bus: JobEventBus) -> Self {
        Self { store, bus }
    }

    pub fn bus(&self) -> &JobEventBus {
        &self.bus
    }
}

#[async_trait]
impl Controller for LocalController {
    async fn get_formation(&self, app_id: &str, release_id: &str) -> ControllerResult<Formation> {
        Ok(self.store.get_formation(app_id, release_id)?)
    }

    async fn put_formation(&self, formation: &Formation) -> ControllerResult<()> {
        self.store.put_formation(formation)?;
        Ok(())
    }

    async fn stream_job_events(
        &self,
        app_id: &str,
        since_id: u64,
    ) -> ControllerResult<JobEventStream> {
        debug!(app = %app_id, since_id, "job event stream opened");
        Ok(self.bus.subscribe(app_id))
    }
}
