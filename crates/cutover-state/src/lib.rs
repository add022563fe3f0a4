//! cutover-state: durable state for the cutover deployer.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for deployments, formations, the deployment event log and the
//! deployment work queue.
//!
//! # Architecture
//!
//! ```text
//! DeploymentRepo ── add ──► StateStore (deployments) ──► WorkQueue (queue_jobs)
//! StrategyEngine ── append ──► EventLog ──► StateStore (deployment_events)
//!                                      └──► Notifier ── wake-up ──► LiveTail
//! ```
//!
//! The event log is the only authority for event content. Wake-ups carry an
//! event id and nothing else; every live tail re-reads the log by id.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod error;
pub mod event_log;
pub mod notify;
pub mod queue;
pub mod repo;
pub mod store;
pub mod tables;
pub mod tail;

pub use error::{StateError, StateResult};
pub use event_log::EventLog;
pub use notify::{Listener, ListenerEvent, Notifier};
pub use queue::{QueuedJob, WorkQueue};
pub use repo::{DEPLOYMENT_JOB, DeploymentRepo};
pub use store::StateStore;
pub use tail::{LiveTail, TailError, TailItem, TailResult, TailState};
