//! Wake-up notifications for deployment event subscribers.
//!
//! Appends publish an [`EventNotification`] on a broadcast channel. A
//! [`Listener`] scopes that channel to one deployment and reports its
//! lifecycle as plain messages: `Connected`, any number of `Notify`, then
//! `Disconnected`. Delivery is a hint only; a listener that falls behind is
//! disconnected rather than silently skipping wake-ups.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use cutover_core::{DeploymentId, EventId, EventNotification, event_channel};

/// Lifecycle messages delivered to a [`Listener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// The subscription is established; wake-ups from here on are delivered.
    Connected,
    /// An event was appended for the listened deployment.
    Notify(EventId),
    /// The subscription could not be established.
    ConnectFailed(String),
    /// The subscription ended; no further wake-ups will arrive.
    Disconnected(String),
}

/// Publishes wake-ups to any number of listeners.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<EventNotification>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Notifier {
    /// Create a notifier buffering up to `capacity` wake-ups per listener.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            tx,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Publish a wake-up. Never blocks and succeeds without listeners.
    pub fn publish(&self, notification: EventNotification) {
        if self.is_closed() {
            return;
        }
        let receivers = self.tx.send(notification).unwrap_or(0);
        trace!(
            channel = %event_channel(&notification.deployment_id),
            payload = %notification.payload(),
            receivers,
            "wake-up published"
        );
    }

    /// Subscribe to wake-ups for one deployment.
    ///
    /// The broadcast subscription is taken before this returns, so every
    /// append that completes afterwards produces a `Notify`.
    pub fn listen(&self, deployment_id: DeploymentId) -> Listener {
        let (events_tx, events_rx) = mpsc::channel(16);

        if self.is_closed() {
            let _ = events_tx.try_send(ListenerEvent::ConnectFailed(
                "notifier is shut down".to_string(),
            ));
            return Listener {
                rx: events_rx,
                task: None,
            };
        }

        let rx = self.tx.subscribe();
        let shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(forward(deployment_id, rx, shutdown, events_tx));
        debug!(channel = %event_channel(&deployment_id), "listener subscribed");

        Listener {
            rx: events_rx,
            task: Some(task),
        }
    }

    /// Disconnect every listener and drop further publishes.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Number of live broadcast subscriptions.
    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

async fn forward(
    deployment_id: DeploymentId,
    mut rx: broadcast::Receiver<EventNotification>,
    mut shutdown: watch::Receiver<bool>,
    tx: mpsc::Sender<ListenerEvent>,
) {
    if tx.send(ListenerEvent::Connected).await.is_err() {
        return;
    }

    let reason = loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(n) if n.deployment_id == deployment_id => {
                    if tx.send(ListenerEvent::Notify(n.event_id)).await.is_err() {
                        // Listener dropped.
                        return;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%deployment_id, skipped, "listener lagged, disconnecting");
                    break format!("listener lagged by {skipped} wake-ups");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break "notifier dropped".to_string();
                }
            },
            _ = shutdown.changed() => {
                break "notifier shut down".to_string();
            }
        }
    };

    debug!(%deployment_id, %reason, "listener disconnected");
    let _ = tx.send(ListenerEvent::Disconnected(reason)).await;
}

/// A deployment-scoped wake-up subscription.
///
/// Dropping the listener ends the subscription.
pub struct Listener {
    rx: mpsc::Receiver<ListenerEvent>,
    task: Option<JoinHandle<()>>,
}

impl Listener {
    /// Next lifecycle message, or `None` once the subscription is gone.
    pub async fn recv(&mut self) -> Option<ListenerEvent> {
        self.rx.recv().await
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
