//! Work queue: at-least-once delivery of background jobs.
//!
//! Jobs are claimed by `dequeue` and only removed by `complete`. A claim that
//! is never acknowledged (worker crash) is handed out again after
//! `release_locks`, typically called on startup. `fail` parks the job with
//! its error for an operator or reconciler; it is not retried here.

use chrono::{DateTime, Utc};
use redb::{ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, next_sequence};
use crate::tables::{JOB_SEQUENCE, QUEUE_JOBS};

/// A persisted queue entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedJob {
    pub id: u64,
    pub job_type: String,
    pub args: serde_json::Value,
    pub error_count: u32,
    pub last_error: Option<String>,
    /// Claimed by a worker and not yet acknowledged.
    pub locked: bool,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedJob {
    /// Decode the job arguments.
    pub fn decode_args<T: serde::de::DeserializeOwned>(&self) -> StateResult<T> {
        serde_json::from_value(self.args.clone()).map_err(map_err!(Deserialize))
    }

    fn is_available(&self, job_type: &str) -> bool {
        self.job_type == job_type && !self.locked && self.last_error.is_none()
    }
}

#[derive(Clone)]
pub struct WorkQueue {
    store: StateStore,
}

impl WorkQueue {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Persist a new job and return its id.
    pub fn enqueue<T: Serialize>(&self, job_type: &str, args: &T) -> StateResult<u64> {
        let args = serde_json::to_value(args).map_err(map_err!(Serialize))?;
        let txn = self.store.db().begin_write().map_err(map_err!(Transaction))?;
        let id = {
            let id = next_sequence(&txn, JOB_SEQUENCE)?;
            let job = QueuedJob {
                id,
                job_type: job_type.to_string(),
                args,
                error_count: 0,
                last_error: None,
                locked: false,
                enqueued_at: Utc::now(),
            };
            let value = serde_json::to_vec(&job).map_err(map_err!(Serialize))?;
            let mut table = txn.open_table(QUEUE_JOBS).map_err(map_err!(Table))?;
            table.insert(id, value.as_slice()).map_err(map_err!(Write))?;
            id
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(job_id = id, %job_type, "job enqueued");
        Ok(id)
    }

    /// Claim the oldest available job of a type.
    pub fn dequeue(&self, job_type: &str) -> StateResult<Option<QueuedJob>> {
        let txn = self.store.db().begin_write().map_err(map_err!(Transaction))?;
        let claimed = {
            let mut table = txn.open_table(QUEUE_JOBS).map_err(map_err!(Table))?;
            let mut found = None;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let job: QueuedJob =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if job.is_available(job_type) {
                    found = Some(job);
                    break;
                }
            }
            match found {
                Some(mut job) => {
                    job.locked = true;
                    let value = serde_json::to_vec(&job).map_err(map_err!(Serialize))?;
                    table
                        .insert(job.id, value.as_slice())
                        .map_err(map_err!(Write))?;
                    Some(job)
                }
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        if let Some(job) = &claimed {
            debug!(job_id = job.id, %job_type, "job claimed");
        }
        Ok(claimed)
    }

    /// Acknowledge a job; it will not be delivered again.
    pub fn complete(&self, id: u64) -> StateResult<()> {
        let txn = self.store.db().begin_write().map_err(map_err!(Transaction))?;
        let existed = {
            let mut table = txn.open_table(QUEUE_JOBS).map_err(map_err!(Table))?;
            table.remove(id).map_err(map_err!(Write))?.is_some()
        };
        txn.commit().map_err(map_err!(Transaction))?;
        if !existed {
            return Err(StateError::NotFound(format!("queue job {id}")));
        }
        debug!(job_id = id, "job completed");
        Ok(())
    }

    /// Record a failure and park the job.
    pub fn fail(&self, id: u64, error: &str) -> StateResult<()> {
        let txn = self.store.db().begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(QUEUE_JOBS).map_err(map_err!(Table))?;
            let mut job: QueuedJob = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(format!("queue job {id}"))),
            };
            job.error_count += 1;
            job.last_error = Some(error.to_string());
            job.locked = false;
            let value = serde_json::to_vec(&job).map_err(map_err!(Serialize))?;
            table.insert(id, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        warn!(job_id = id, %error, "job failed");
        Ok(())
    }

    /// Unlock every claimed job so it is delivered again. Returns the count.
    pub fn release_locks(&self) -> StateResult<u32> {
        let txn = self.store.db().begin_write().map_err(map_err!(Transaction))?;
        let released = {
            let mut table = txn.open_table(QUEUE_JOBS).map_err(map_err!(Table))?;
            let locked: Vec<QueuedJob> = {
                let mut locked = Vec::new();
                for entry in table.iter().map_err(map_err!(Read))? {
                    let (_, value) = entry.map_err(map_err!(Read))?;
                    let job: QueuedJob =
                        serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                    if job.locked {
                        locked.push(job);
                    }
                }
                locked
            };
            for mut job in locked.iter().cloned() {
                job.locked = false;
                let value = serde_json::to_vec(&job).map_err(map_err!(Serialize))?;
                table
                    .insert(job.id, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            locked.len() as u32
        };
        txn.commit().map_err(map_err!(Transaction))?;
        if released > 0 {
            debug!(released, "queue locks released");
        }
        Ok(released)
    }

    /// All queued jobs, oldest first.
    pub fn list(&self) -> StateResult<Vec<QueuedJob>> {
        let txn = self.store.db().begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(QUEUE_JOBS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let job: QueuedJob =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(job);
        }
        Ok(results)
    }
}
