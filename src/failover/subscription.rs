use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::FailoverController;
use crate::error::SyncError;
use crate::protocol::Connection;

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// First establishment, with the subscribe call's result
    Subscribed(Value),
    /// Re-established after a server switch. Consumers must reconcile rather
    /// than assume they saw every notification in between.
    Resubscribed(Value),
    Notification(Vec<Value>),
}

/// A subscription that survives server switches. Dropping it cancels the
/// forwarding task and releases the underlying connection-level subscription.
pub struct FailoverSubscription {
    events: mpsc::Receiver<SubscriptionEvent>,
    task: JoinHandle<()>,
}

impl FailoverSubscription {
    pub(super) fn spawn(controller: Arc<FailoverController>, method: String, params: Vec<Value>) -> Self {
        let (sender, events) = mpsc::channel(64);
        let task = tokio::spawn(forward(controller, method, params, sender));
        Self { events, task }
    }

    pub async fn next_event(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }
}

impl Stream for FailoverSubscription {
    type Item = SubscriptionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for FailoverSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn forward(
    controller: Arc<FailoverController>,
    method: String,
    params: Vec<Value>,
    events: mpsc::Sender<SubscriptionEvent>,
) {
    let timeout = controller.request_timeout();
    let mut established = false;
    let mut idle_failures = 0u32;

    loop {
        let subscribed = controller
            .with_active_connection(|connection| {
                let method = method.clone();
                let params = params.clone();
                async move {
                    let (initial, subscription) = connection.subscribe(&method, params, timeout).await?;
                    Ok::<_, SyncError>((initial, subscription, Arc::downgrade(&connection)))
                }
            })
            .await;

        match subscribed {
            Ok((initial, mut subscription, connection)) => {
                idle_failures = 0;
                let event = if established {
                    log::info!("Re-subscribed {} on {}", method, subscription.server());
                    SubscriptionEvent::Resubscribed(initial)
                } else {
                    SubscriptionEvent::Subscribed(initial)
                };
                established = true;
                if events.send(event).await.is_err() {
                    return;
                }

                while let Some(params) = subscription.next_notification().await {
                    if events
                        .send(SubscriptionEvent::Notification(params))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }

                // A connection replaced on purpose closes as `Cancelled`.
                if let Some(reason) = subscription.close_reason().filter(SyncError::is_transient) {
                    lost(&controller, &connection, &reason).await;
                }
            }
            Err(err) => {
                idle_failures += 1;
                let wait = controller.config.backoff(idle_failures);
                log::warn!("Subscription {} unavailable ({}); retrying in {:?}", method, err, wait);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = events.closed() => return,
                }
            }
        }
    }
}

async fn lost(controller: &FailoverController, connection: &Weak<Connection>, reason: &SyncError) {
    // Already gone means someone else has retired it.
    if let Some(connection) = connection.upgrade() {
        controller.connection_lost(&connection, reason).await;
    }
}
