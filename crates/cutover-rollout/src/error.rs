//! Rollout error types.

use thiserror::Error;

use cutover_state::StateError;

use crate::matcher::MatchError;

/// Errors surfaced by a [`Controller`](crate::Controller).
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("state store error: {0}")]
    State(StateError),

    #[error("job event stream lagged, {0} events lost")]
    Lagged(u64),

    #[error("job event stream error: {0}")]
    Stream(String),
}

impl From<StateError> for ControllerError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(what) => ControllerError::NotFound(what),
            other => ControllerError::State(other),
        }
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;

/// Errors that abort a deployment.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("controller error: {0}")]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Match(#[from] MatchError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl RolloutError {
    /// Terminal failures end the deployment (`finished_at` is set); anything
    /// else leaves it unfinished for an operator or a redelivery.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RolloutError::Match(MatchError::Crashed { .. }))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RolloutError::Match(MatchError::Cancelled { .. }))
    }
}

pub type RolloutResult<T> = Result<T, RolloutError>;
