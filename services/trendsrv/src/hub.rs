//! Live fan-out of reading batches
//!
//! Subscribers run concurrently on every publish. A subscriber that errors
//! or panics is logged and stays subscribed; it never affects the others.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use crate::model::{LiveValue, Reading};

/// Receiver of reading batches
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Label used in logs
    fn name(&self) -> &str {
        "subscriber"
    }

    async fn on_batch(&self, batch: &[Reading]) -> anyhow::Result<()>;
}

/// Handle returned by [`BroadcastHub::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    subscribers: Vec<(SubscriptionId, Arc<dyn Subscriber>)>,
}

/// Ordered set of subscribers behind one lock
#[derive(Default)]
pub struct BroadcastHub {
    state: Mutex<HubState>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> SubscriptionId {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        debug!("Subscriber {} ({}) added", id, subscriber.name());
        state.subscribers.push((id, subscriber));
        id
    }

    /// Returns `false` when the id was not subscribed
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.lock().await;
        let before = state.subscribers.len();
        state.subscribers.retain(|(sid, _)| *sid != id);
        let removed = state.subscribers.len() != before;
        if removed {
            debug!("Subscriber {} removed", id);
        }
        removed
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.subscribers.len()
    }

    /// Deliver `batch` to every subscriber concurrently
    ///
    /// Returns once all subscribers have finished.
    pub async fn publish(&self, batch: &[Reading]) {
        let state = self.state.lock().await;
        if state.subscribers.is_empty() {
            return;
        }

        let deliveries = state.subscribers.iter().map(|(id, subscriber)| async move {
            let outcome = AssertUnwindSafe(subscriber.on_batch(batch))
                .catch_unwind()
                .await;
            (*id, subscriber.name(), outcome)
        });

        for (id, name, outcome) in join_all(deliveries).await {
            match outcome {
                Ok(Ok(())) => {},
                Ok(Err(e)) => warn!("Subscriber {} ({}) failed: {:#}", id, name, e),
                Err(payload) => error!(
                    "Subscriber {} ({}) panicked: {}",
                    id,
                    name,
                    panic_message(payload.as_ref())
                ),
            }
        }
    }
}

/// Forwards each batch as [`LiveValue`]s into a bounded channel
///
/// A full channel drops the batch rather than stalling the publisher.
pub struct ChannelSubscriber {
    name: String,
    tx: mpsc::Sender<Vec<LiveValue>>,
}

impl ChannelSubscriber {
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Vec<LiveValue>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                name: name.into(),
                tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_batch(&self, batch: &[Reading]) -> anyhow::Result<()> {
        let values: Vec<LiveValue> = batch.iter().map(Reading::to_live_value).collect();
        match self.tx.try_send(values) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(
                    "Live channel {} full, dropped {} values",
                    self.name,
                    dropped.len()
                );
                Ok(())
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                anyhow::bail!("live channel {} closed", self.name)
            },
        }
    }
}
