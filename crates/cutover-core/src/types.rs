//! Shared types used across cutover crates.
//!
//! These describe formations, scheduler job events, deployments and the
//! persisted deployment event log. All of them serialize to JSON for storage
//! and for the HTTP surface.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of an application.
pub type AppId = String;

/// Identifier of an immutable release of an application.
pub type ReleaseId = String;

/// Identifier of a deployment.
pub type DeploymentId = Uuid;

/// Global sequence number of a deployment event.
pub type EventId = u64;

// ── Formation ──────────────────────────────────────────────────────

/// Desired instance count per process type for one app release.
///
/// Writes always replace the whole `processes` map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Formation {
    pub app_id: AppId,
    pub release_id: ReleaseId,
    #[serde(default)]
    pub processes: BTreeMap<String, u32>,
    /// Set by the store on every overwrite.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Formation {
    pub fn new(app_id: &str, release_id: &str, processes: BTreeMap<String, u32>) -> Self {
        Self {
            app_id: app_id.to_string(),
            release_id: release_id.to_string(),
            processes,
            updated_at: None,
        }
    }

    /// A formation with no processes.
    pub fn empty(app_id: &str, release_id: &str) -> Self {
        Self::new(app_id, release_id, BTreeMap::new())
    }

    /// Desired count for a process type (0 when absent).
    pub fn count(&self, process_type: &str) -> u32 {
        self.processes.get(process_type).copied().unwrap_or(0)
    }

    /// Total desired instances across all process types.
    pub fn total(&self) -> u32 {
        self.processes.values().sum()
    }

    /// Build the composite key for the formations table.
    pub fn table_key(&self) -> String {
        formation_key(&self.app_id, &self.release_id)
    }
}

/// Composite `{app_id}:{release_id}` key for a formation.
pub fn formation_key(app_id: &str, release_id: &str) -> String {
    format!("{app_id}:{release_id}")
}

// ── Job events ─────────────────────────────────────────────────────

/// Lifecycle state of one scheduled process, as reported by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Starting,
    Up,
    Down,
    /// Terminal failure; aborts any wait in progress.
    Crashed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Starting => "starting",
            JobState::Up => "up",
            JobState::Down => "down",
            JobState::Crashed => "crashed",
        }
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, JobState::Crashed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduler lifecycle notification for one process instance.
///
/// Consumed transiently; never persisted verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobEvent {
    pub app_id: AppId,
    pub release_id: ReleaseId,
    pub job_id: String,
    pub process_type: String,
    pub state: JobState,
}

// ── Deployment ─────────────────────────────────────────────────────

/// Algorithm governing ordering and batching of formation mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStrategy {
    /// Replace one instance at a time, per process type.
    #[default]
    OneByOne,
    /// Start the full new formation, then stop the full old one.
    AllAtOnce,
}

impl DeploymentStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStrategy::OneByOne => "one-by-one",
            DeploymentStrategy::AllAtOnce => "all-at-once",
        }
    }
}

impl fmt::Display for DeploymentStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A managed transition of an app from one release to another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub app_id: AppId,
    pub old_release_id: ReleaseId,
    pub new_release_id: ReleaseId,
    pub strategy: DeploymentStrategy,
    pub created_at: DateTime<Utc>,
    /// Set exactly once when the deployment reaches a terminal outcome.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Admission request for a deployment. The id is assigned when absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewDeployment {
    #[serde(default)]
    pub id: Option<DeploymentId>,
    pub app_id: AppId,
    pub old_release_id: ReleaseId,
    pub new_release_id: ReleaseId,
    #[serde(default)]
    pub strategy: DeploymentStrategy,
}

/// Work-queue payload referencing a deployment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployId {
    pub id: DeploymentId,
}

// ── Deployment events ──────────────────────────────────────────────

/// Progress status carried by a deployment event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentEventStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

/// A persisted, ordered record of one confirmed deployment step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentEvent {
    /// Global sequence number assigned at append time.
    pub id: EventId,
    pub deployment_id: DeploymentId,
    pub release_id: ReleaseId,
    pub job_type: String,
    pub job_state: JobState,
    pub status: DeploymentEventStatus,
    pub created_at: DateTime<Utc>,
}

/// A deployment event before the log has assigned its id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDeploymentEvent {
    pub deployment_id: DeploymentId,
    pub release_id: ReleaseId,
    pub job_type: String,
    pub job_state: JobState,
    pub status: DeploymentEventStatus,
}

impl NewDeploymentEvent {
    /// Record a confirmed job event for a deployment.
    pub fn from_job(
        deployment_id: DeploymentId,
        job: &JobEvent,
        status: DeploymentEventStatus,
    ) -> Self {
        Self {
            deployment_id,
            release_id: job.release_id.clone(),
            job_type: job.process_type.clone(),
            job_state: job.state,
            status,
        }
    }
}

/// Wake-up hint published after an append.
///
/// Carries only ids; subscribers re-read the log for content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventNotification {
    pub deployment_id: DeploymentId,
    pub event_id: EventId,
}

impl EventNotification {
    /// Wire payload: the decimal event id.
    pub fn payload(&self) -> String {
        self.event_id.to_string()
    }
}

/// Wake-up channel name for a deployment.
pub fn event_channel(deployment_id: &DeploymentId) -> String {
    format!("deployment_events:{deployment_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formation_counts_default_to_zero() {
        let mut processes = BTreeMap::new();
        processes.insert("web".to_string(), 3);
        processes.insert("worker".to_string(), 2);
        let f = Formation::new("app", "r1", processes);

        assert_eq!(f.count("web"), 3);
        assert_eq!(f.count("clock"), 0);
        assert_eq!(f.total(), 5);
        assert_eq!(f.table_key(), "app:r1");
    }

    #[test]
    fn strategy_wire_names() {
        let json = serde_json::to_string(&DeploymentStrategy::AllAtOnce).unwrap();
        assert_eq!(json, "\"all-at-once\"");

        let back: DeploymentStrategy = serde_json::from_str("\"one-by-one\"").unwrap();
        assert_eq!(back, DeploymentStrategy::OneByOne);
        assert_eq!(DeploymentStrategy::default(), DeploymentStrategy::OneByOne);
    }

    #[test]
    fn new_deployment_defaults() {
        let req: NewDeployment = serde_json::from_str(
            r#"{"app_id":"app","old_release_id":"r1","new_release_id":"r2"}"#,
        )
        .unwrap();
        assert!(req.id.is_none());
        assert_eq!(req.strategy, DeploymentStrategy::OneByOne);
    }

    #[test]
    fn only_crashed_is_terminal() {
        assert!(JobState::Crashed.is_terminal_failure());
        assert!(!JobState::Down.is_terminal_failure());
        assert_eq!(JobState::Up.to_string(), "up");
    }

    #[test]
    fn notification_payload_is_event_id() {
        let n = EventNotification {
            deployment_id: Uuid::nil(),
            event_id: 42,
        };
        assert_eq!(n.payload(), "42");
        assert_eq!(
            event_channel(&n.deployment_id),
            "deployment_events:00000000-0000-0000-0000-000000000000"
        );
    }
}
