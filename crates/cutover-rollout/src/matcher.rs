//! Job event matcher: blocks until a set of expected job events is seen.
//!
//! Events are consumed one at a time. An event whose `(process type, state)`
//! still has a positive remaining count decrements it, provided it comes
//! from the release the expectations are scoped to. Anything else is
//! ignored: duplicates, unrelated types, other states and other releases.
//! A `crashed` event for any process type or release aborts the wait. So
//! does the stream ending or failing, and so does cancellation. There is no
//! built-in timeout.

use std::collections::BTreeMap;
use std::fmt;

use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, trace};

use cutover_core::{JobEvent, JobState, ReleaseId};

use crate::error::ControllerError;

/// Remaining required events per process type and state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedEvents {
    release_id: Option<ReleaseId>,
    remaining: BTreeMap<String, BTreeMap<JobState, u32>>,
}

impl ExpectedEvents {
    /// Expectations satisfied by events from any release.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expectations only satisfied by events from `release_id`.
    pub fn for_release(release_id: &str) -> Self {
        Self {
            release_id: Some(release_id.to_string()),
            remaining: BTreeMap::new(),
        }
    }

    pub fn release_id(&self) -> Option<&str> {
        self.release_id.as_deref()
    }

    /// Require `count` more events of `(process_type, state)`.
    pub fn expect(mut self, process_type: &str, state: JobState, count: u32) -> Self {
        self.add(process_type, state, count);
        self
    }

    pub fn add(&mut self, process_type: &str, state: JobState, count: u32) {
        if count == 0 {
            return;
        }
        *self
            .remaining
            .entry(process_type.to_string())
            .or_default()
            .entry(state)
            .or_insert(0) += count;
    }

    /// Count an event against the set. Returns false when it was not needed.
    pub fn record(&mut self, event: &JobEvent) -> bool {
        if self
            .release_id
            .as_ref()
            .is_some_and(|release| *release != event.release_id)
        {
            return false;
        }
        match self
            .remaining
            .get_mut(&event.process_type)
            .and_then(|states| states.get_mut(&event.state))
        {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn remaining(&self, process_type: &str, state: JobState) -> u32 {
        self.remaining
            .get(process_type)
            .and_then(|states| states.get(&state))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_remaining(&self) -> u32 {
        self.remaining.values().flat_map(|s| s.values()).sum()
    }

    pub fn is_satisfied(&self) -> bool {
        self.total_remaining() == 0
    }
}

impl fmt::Display for ExpectedEvents {
    /// Lists unmet entries as `type:state=count`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (process_type, states) in &self.remaining {
            for (state, n) in states.iter().filter(|(_, n)| **n > 0) {
                if !first {
                    f.write_str(", ")?;
                }
                write!(f, "{process_type}:{state}={n}")?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// Why a wait ended without satisfying its expectations.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("job event stream closed, unmet: {unmet}")]
    StreamClosed { unmet: ExpectedEvents },

    #[error("job event stream failed ({source}), unmet: {unmet}")]
    Stream {
        source: ControllerError,
        unmet: ExpectedEvents,
    },

    #[error("{} job {} crashed on release {}, unmet: {unmet}", .job.process_type, .job.job_id, .job.release_id)]
    Crashed { job: JobEvent, unmet: ExpectedEvents },

    #[error("wait cancelled, unmet: {unmet}")]
    Cancelled { unmet: ExpectedEvents },
}

impl MatchError {
    /// The expectations still outstanding when the wait ended.
    pub fn unmet(&self) -> &ExpectedEvents {
        match self {
            MatchError::StreamClosed { unmet }
            | MatchError::Stream { unmet, .. }
            | MatchError::Crashed { unmet, .. }
            | MatchError::Cancelled { unmet } => unmet,
        }
    }
}

enum Next {
    Item(Option<Result<JobEvent, ControllerError>>),
    Cancelled,
    CancelDropped,
}

/// Waits for expected job events on a stream.
///
/// Cancellation is external: pass a `watch` receiver and send `true`.
#[derive(Default)]
pub struct JobEventMatcher {
    cancel: Option<watch::Receiver<bool>>,
}

impl JobEventMatcher {
    pub fn new(cancel: Option<watch::Receiver<bool>>) -> Self {
        Self { cancel }
    }

    /// Consume events until `expected` is satisfied.
    ///
    /// Returns the events that were counted, in arrival order.
    pub async fn wait<S>(
        &mut self,
        stream: &mut S,
        mut expected: ExpectedEvents,
    ) -> Result<Vec<JobEvent>, MatchError>
    where
        S: Stream<Item = Result<JobEvent, ControllerError>> + Unpin,
    {
        let mut matched = Vec::new();
        debug!(expected = %expected, "waiting for job events");

        while !expected.is_satisfied() {
            let next = match self.cancel.as_mut() {
                Some(cancel) => {
                    if *cancel.borrow_and_update() {
                        Next::Cancelled
                    } else {
                        tokio::select! {
                            biased;
                            changed = cancel.changed() => match changed {
                                Ok(()) if *cancel.borrow_and_update() => Next::Cancelled,
                                Ok(()) => continue,
                                Err(_) => Next::CancelDropped,
                            },
                            item = stream.next() => Next::Item(item),
                        }
                    }
                }
                None => Next::Item(stream.next().await),
            };

            let event = match next {
                Next::Item(Some(Ok(event))) => event,
                Next::Item(Some(Err(source))) => {
                    return Err(MatchError::Stream {
                        source,
                        unmet: expected,
                    });
                }
                Next::Item(None) => return Err(MatchError::StreamClosed { unmet: expected }),
                Next::Cancelled => return Err(MatchError::Cancelled { unmet: expected }),
                Next::CancelDropped => {
                    self.cancel = None;
                    continue;
                }
            };

            if event.state.is_terminal_failure() {
                return Err(MatchError::Crashed {
                    job: event,
                    unmet: expected,
                });
            }

            if expected.record(&event) {
                trace!(
                    process_type = %event.process_type,
                    state = %event.state,
                    job = %event.job_id,
                    "job event matched"
                );
                matched.push(event);
            } else {
                trace!(
                    release = %event.release_id,
                    process_type = %event.process_type,
                    state = %event.state,
                    job = %event.job_id,
                    "job event ignored"
                );
            }
        }

        Ok(matched)
    }
}
