//! redb table definitions for the cutover state store.
//!
//! Document tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Composite keys follow the pattern `{parent_id}:{child_id}`.

use redb::TableDefinition;

/// Deployments keyed by deployment id.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Formations keyed by `{app_id}:{release_id}`.
pub const FORMATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("formations");

/// Deployment events keyed by global event id.
pub const DEPLOYMENT_EVENTS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("deployment_events");

/// Per-deployment ordering index keyed by `{deployment_id}:{event_id:020}`.
pub const DEPLOYMENT_EVENT_INDEX: TableDefinition<&str, u64> =
    TableDefinition::new("deployment_event_index");

/// Named monotonic counters.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Work-queue jobs keyed by job id.
pub const QUEUE_JOBS: TableDefinition<u64, &[u8]> = TableDefinition::new("queue_jobs");

/// Sequence backing deployment event ids.
pub const EVENT_SEQUENCE: &str = "deployment_event_id";

/// Sequence backing work-queue job ids.
pub const JOB_SEQUENCE: &str = "queue_job_id";

/// Index key for one event; zero-padded so lexicographic order matches id order.
pub fn event_index_key(deployment_id: &str, event_id: u64) -> String {
    format!("{deployment_id}:{event_id:020}")
}
