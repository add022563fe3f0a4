//! LiveTail: catch-up replay followed by a real-time tail of one
//! deployment's events.
//!
//! The tail moves through `Connecting → Ready → Tailing → Closed`:
//!
//! - **Connecting**: the wake-up listener is opened, then the catch-up batch
//!   (`list_since(since_id)`) is emitted while waiting for the listener to
//!   report `Connected`.
//! - **Ready**: the listener is live; one keep-alive is emitted.
//! - **Tailing**: each wake-up id above the cursor is re-read from the log
//!   and emitted; ids at or below the cursor are dropped. A keep-alive is
//!   emitted once a full interval passes without an event.
//! - **Closed**: after a listener disconnect or a failed read. There is no
//!   internal reconnect; callers resume with the last id they saw.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use thiserror::Error;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

use cutover_core::{DeploymentEvent, DeploymentId, EventId};

use crate::error::StateError;
use crate::event_log::EventLog;
use crate::notify::{Listener, ListenerEvent};

pub type TailResult<T> = Result<T, TailError>;

#[derive(Debug, Error)]
pub enum TailError {
    #[error("failed to establish wake-up listener: {0}")]
    ListenFailed(String),

    #[error("wake-up listener disconnected: {0}")]
    Disconnected(String),

    #[error("event log error: {0}")]
    State(#[from] StateError),
}

/// One item delivered to a tail subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailItem {
    Event(DeploymentEvent),
    KeepAlive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailState {
    Connecting,
    Ready,
    Tailing,
    Closed,
}

pub struct LiveTail {
    log: EventLog,
    deployment_id: DeploymentId,
    cursor: EventId,
    state: TailState,
    listener: Listener,
    backlog: VecDeque<DeploymentEvent>,
    keepalive: Duration,
    ticker: Option<Interval>,
}

impl LiveTail {
    /// Subscribe to wake-ups, then load the catch-up batch.
    pub fn open(
        log: EventLog,
        deployment_id: DeploymentId,
        since_id: EventId,
        keepalive: Duration,
    ) -> TailResult<Self> {
        let listener = log.notifier().listen(deployment_id);
        let backlog: VecDeque<_> = log.list_since(&deployment_id, since_id)?.into();
        debug!(
            deployment = %deployment_id,
            since_id,
            catch_up = backlog.len(),
            "live tail opened"
        );
        Ok(Self {
            log,
            deployment_id,
            cursor: since_id,
            state: TailState::Connecting,
            listener,
            backlog,
            keepalive,
            ticker: None,
        })
    }

    pub fn state(&self) -> TailState {
        self.state
    }

    /// Id of the last event emitted, or the starting cursor.
    pub fn cursor(&self) -> EventId {
        self.cursor
    }

    /// Next item, or `None` once the tail is closed.
    ///
    /// An error is yielded once; the tail is closed afterwards.
    pub async fn next(&mut self) -> Option<TailResult<TailItem>> {
        loop {
            match self.state {
                TailState::Closed => return None,

                TailState::Connecting => {
                    if let Some(event) = self.backlog.pop_front() {
                        self.cursor = event.id;
                        return Some(Ok(TailItem::Event(event)));
                    }
                    match self.listener.recv().await {
                        Some(ListenerEvent::Connected) => {
                            self.state = TailState::Ready;
                        }
                        Some(ListenerEvent::Notify(id)) => {
                            trace!(deployment = %self.deployment_id, id, "wake-up before connect ignored");
                        }
                        Some(ListenerEvent::ConnectFailed(reason)) => {
                            return self.fail(TailError::ListenFailed(reason));
                        }
                        Some(ListenerEvent::Disconnected(reason)) => {
                            return self.fail(TailError::ListenFailed(reason));
                        }
                        None => {
                            return self.fail(TailError::ListenFailed(
                                "listener closed before connecting".to_string(),
                            ));
                        }
                    }
                }

                TailState::Ready => {
                    let mut ticker =
                        tokio::time::interval_at(Instant::now() + self.keepalive, self.keepalive);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.ticker = Some(ticker);
                    self.state = TailState::Tailing;
                    return Some(Ok(TailItem::KeepAlive));
                }

                TailState::Tailing => {
                    let Some(ticker) = self.ticker.as_mut() else {
                        self.state = TailState::Ready;
                        continue;
                    };
                    tokio::select! {
                        _ = ticker.tick() => return Some(Ok(TailItem::KeepAlive)),
                        received = self.listener.recv() => match received {
                            Some(ListenerEvent::Notify(id)) => {
                                if id <= self.cursor {
                                    trace!(deployment = %self.deployment_id, id, cursor = self.cursor, "stale wake-up dropped");
                                    continue;
                                }
                                match self.log.get_by_id(id) {
                                    Ok(event) if event.deployment_id == self.deployment_id => {
                                        self.cursor = event.id;
                                        ticker.reset();
                                        return Some(Ok(TailItem::Event(event)));
                                    }
                                    Ok(event) => {
                                        warn!(
                                            deployment = %self.deployment_id,
                                            id,
                                            owner = %event.deployment_id,
                                            "wake-up for foreign event ignored"
                                        );
                                    }
                                    Err(e) => return self.fail(TailError::State(e)),
                                }
                            }
                            Some(ListenerEvent::Connected) => {}
                            Some(ListenerEvent::ConnectFailed(reason))
                            | Some(ListenerEvent::Disconnected(reason)) => {
                                return self.fail(TailError::Disconnected(reason));
                            }
                            None => {
                                return self.fail(TailError::Disconnected(
                                    "listener closed".to_string(),
                                ));
                            }
                        }
                    }
                }
            }
        }
    }

    fn fail(&mut self, error: TailError) -> Option<TailResult<TailItem>> {
        debug!(deployment = %self.deployment_id, cursor = self.cursor, %error, "live tail closed");
        self.state = TailState::Closed;
        self.ticker = None;
        Some(Err(error))
    }

    /// Adapt the tail into a `Stream` for transport layers.
    pub fn into_stream(self) -> impl Stream<Item = TailResult<TailItem>> + Send {
        stream::unfold(self, |mut tail| async move {
            let item = tail.next().await?;
            Some((item, tail))
        })
    }
}
