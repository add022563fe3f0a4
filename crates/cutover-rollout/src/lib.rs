//! cutover rollouts: formation swaps confirmed by scheduler job events.
//!
//! A deployment is executed as a plan of steps. Every step overwrites one
//! formation, blocks until the scheduler confirms the expected job events,
//! and records one deployment event per confirmation.
//!
//! # Components
//!
//! - **`controller`**: Controller contract (formations + job event stream)
//!   and the in-process implementation
//! - **`matcher`**: Turns the unordered job event stream into blocking waits
//! - **`strategy`**: Plans for each deployment strategy (one-by-one, all-at-once)
//! - **`engine`**: Executes a plan: mutate, wait, emit
//! - **`worker`**: Drains the deployment work queue into the engine

pub mod controller;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod strategy;
pub mod worker;

pub use controller::{Controller, JobEventBus, JobEventStream, LocalController};
pub use engine::StrategyEngine;
pub use error::{ControllerError, ControllerResult, RolloutError, RolloutResult};
pub use matcher::{ExpectedEvents, JobEventMatcher, MatchError};
pub use strategy::{Plan, Step, StrategyPlan};
pub use worker::DeploymentWorker;
