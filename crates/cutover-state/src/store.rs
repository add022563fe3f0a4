//! StateStore: redb-backed state persistence for cutover.
//!
//! Provides typed operations over deployments, formations and deployment
//! events. All document values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::debug;
use uuid::Uuid;

use cutover_core::*;

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(FORMATIONS).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENT_EVENTS).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENT_EVENT_INDEX).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.open_table(QUEUE_JOBS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert a new deployment row, assigning an id when absent and a
    /// server-side creation timestamp.
    ///
    /// Fails with `ActiveDeployment` when the app already has an unfinished
    /// deployment. The check and the insert share one write transaction.
    pub fn insert_deployment(&self, req: &NewDeployment) -> StateResult<Deployment> {
        let deployment = Deployment {
            id: req.id.unwrap_or_else(Uuid::new_v4),
            app_id: req.app_id.clone(),
            old_release_id: req.old_release_id.clone(),
            new_release_id: req.new_release_id.clone(),
            strategy: req.strategy,
            created_at: Utc::now(),
            finished_at: None,
        };
        let key = deployment.id.to_string();
        let value = serde_json::to_vec(&deployment).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(format!("deployment {key}")));
            }
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, existing) = entry.map_err(map_err!(Read))?;
                let existing: Deployment =
                    serde_json::from_slice(existing.value()).map_err(map_err!(Deserialize))?;
                if existing.app_id == deployment.app_id && !existing.is_finished() {
                    return Err(StateError::ActiveDeployment {
                        app_id: existing.app_id,
                        id: existing.id,
                    });
                }
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, app = %deployment.app_id, "deployment stored");
        Ok(deployment)
    }

    /// Get a deployment by id.
    pub fn get_deployment(&self, id: &DeploymentId) -> StateResult<Deployment> {
        let key = id.to_string();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize)),
            None => Err(StateError::NotFound(format!("deployment {key}"))),
        }
    }

    /// List all deployments for an app, oldest first.
    pub fn list_deployments_for_app(&self, app_id: &str) -> StateResult<Vec<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let deployment: Deployment =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if deployment.app_id == app_id {
                results.push(deployment);
            }
        }
        results.sort_by_key(|d| d.created_at);
        Ok(results)
    }

    /// Set `finished_at`. Fails if the deployment already finished.
    pub fn finish_deployment(&self, id: &DeploymentId) -> StateResult<Deployment> {
        let key = id.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let deployment = {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let mut deployment: Deployment = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(format!("deployment {key}"))),
            };
            if deployment.is_finished() {
                return Err(StateError::AlreadyFinished(*id));
            }
            deployment.finished_at = Some(Utc::now());
            let value = serde_json::to_vec(&deployment).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            deployment
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "deployment finished");
        Ok(deployment)
    }

    // ── Formations ─────────────────────────────────────────────────

    /// Get the formation for an app release.
    pub fn get_formation(&self, app_id: &str, release_id: &str) -> StateResult<Formation> {
        let key = formation_key(app_id, release_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(FORMATIONS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize)),
            None => Err(StateError::NotFound(format!("formation {key}"))),
        }
    }

    /// Overwrite the whole formation for an app release.
    pub fn put_formation(&self, formation: &Formation) -> StateResult<Formation> {
        self.write_formation(formation, false)
    }

    /// Overwrite a formation unless an unfinished deployment of the app
    /// moves that release. Those formations belong to the rollout.
    pub fn put_formation_unless_deploying(&self, formation: &Formation) -> StateResult<Formation> {
        self.write_formation(formation, true)
    }

    fn write_formation(&self, formation: &Formation, guarded: bool) -> StateResult<Formation> {
        let mut stored = formation.clone();
        stored.updated_at = Some(Utc::now());
        let key = stored.table_key();
        let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        if guarded {
            let deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            for entry in deployments.iter().map_err(map_err!(Read))? {
                let (_, row) = entry.map_err(map_err!(Read))?;
                let d: Deployment =
                    serde_json::from_slice(row.value()).map_err(map_err!(Deserialize))?;
                let moves_release = d.old_release_id == stored.release_id
                    || d.new_release_id == stored.release_id;
                if d.app_id == stored.app_id && !d.is_finished() && moves_release {
                    return Err(StateError::ActiveDeployment {
                        app_id: d.app_id,
                        id: d.id,
                    });
                }
            }
        }
        {
            let mut table = txn.open_table(FORMATIONS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, processes = ?stored.processes, "formation stored");
        Ok(stored)
    }

    // ── Deployment events ──────────────────────────────────────────

    /// Persist a deployment event, assigning the next global sequence id.
    ///
    /// Id assignment and insert share one write transaction.
    pub fn insert_deployment_event(
        &self,
        event: &NewDeploymentEvent,
    ) -> StateResult<DeploymentEvent> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored = {
            let id = next_sequence(&txn, EVENT_SEQUENCE)?;
            let stored = DeploymentEvent {
                id,
                deployment_id: event.deployment_id,
                release_id: event.release_id.clone(),
                job_type: event.job_type.clone(),
                job_state: event.job_state,
                status: event.status,
                created_at: Utc::now(),
            };
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;

            let mut events = txn.open_table(DEPLOYMENT_EVENTS).map_err(map_err!(Table))?;
            events.insert(id, value.as_slice()).map_err(map_err!(Write))?;

            let index_key = event_index_key(&stored.deployment_id.to_string(), id);
            let mut index = txn
                .open_table(DEPLOYMENT_EVENT_INDEX)
                .map_err(map_err!(Table))?;
            index
                .insert(index_key.as_str(), id)
                .map_err(map_err!(Write))?;
            stored
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(stored)
    }

    /// All events of a deployment with id greater than `since_id`, ascending.
    pub fn list_deployment_events(
        &self,
        deployment_id: &DeploymentId,
        since_id: EventId,
    ) -> StateResult<Vec<DeploymentEvent>> {
        let Some(first) = since_id.checked_add(1) else {
            return Ok(Vec::new());
        };
        let prefix = deployment_id.to_string();
        let start = event_index_key(&prefix, first);
        // ';' sorts directly after ':'.
        let end = format!("{prefix};");

        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let index = txn
            .open_table(DEPLOYMENT_EVENT_INDEX)
            .map_err(map_err!(Table))?;
        let events = txn.open_table(DEPLOYMENT_EVENTS).map_err(map_err!(Table))?;

        let mut results = Vec::new();
        for entry in index
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, id) = entry.map_err(map_err!(Read))?;
            let id = id.value();
            let guard = events
                .get(id)
                .map_err(map_err!(Read))?
                .ok_or_else(|| StateError::NotFound(format!("deployment event {id}")))?;
            let event: DeploymentEvent =
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            results.push(event);
        }
        Ok(results)
    }

    /// Fetch one deployment event by its global id.
    pub fn get_deployment_event(&self, id: EventId) -> StateResult<DeploymentEvent> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENT_EVENTS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize)),
            None => Err(StateError::NotFound(format!("deployment event {id}"))),
        }
    }
}

/// Bump a named counter inside an open write transaction.
pub(crate) fn next_sequence(txn: &WriteTransaction, name: &str) -> StateResult<u64> {
    let mut table = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
    let current = table
        .get(name)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    table.insert(name, next).map_err(map_err!(Write))?;
    Ok(next)
}
