use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::{QueueChange, QueueSnapshot};
use crate::observability;

const CHANNEL_CAPACITY: usize = 256;

/// Fan-out of queue changes: per-provider and per-customer broadcast channels for in-process
/// listeners, a per-provider topic carrying the whole queue after each change, plus an
/// optional ordered outbox drained by [`run_dispatcher`].
///
/// A channel is dropped from its map the first time a send finds no receivers left.
pub struct NotifyHub {
    providers: DashMap<Ulid, broadcast::Sender<QueueChange>>,
    customers: DashMap<Ulid, broadcast::Sender<QueueChange>>,
    snapshots: DashMap<Ulid, broadcast::Sender<QueueSnapshot>>,
    outbox: Option<mpsc::UnboundedSender<QueueChange>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
            customers: DashMap::new(),
            snapshots: DashMap::new(),
            outbox: None,
        }
    }

    /// A hub that also forwards every change, in emission order, to the returned receiver.
    pub fn with_outbox() -> (Self, mpsc::UnboundedReceiver<QueueChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Self {
            outbox: Some(tx),
            ..Self::new()
        };
        (hub, rx)
    }

    /// Every change to the provider's queue. Creates the channel if needed.
    pub fn subscribe_provider(&self, provider_id: Ulid) -> broadcast::Receiver<QueueChange> {
        subscribe(&self.providers, provider_id)
    }

    /// Changes that name `customer_id`.
    pub fn subscribe_customer(&self, customer_id: Ulid) -> broadcast::Receiver<QueueChange> {
        subscribe(&self.customers, customer_id)
    }

    /// The provider's full active queue, republished after every change to it.
    pub fn subscribe_queue(&self, provider_id: Ulid) -> broadcast::Receiver<QueueSnapshot> {
        subscribe(&self.snapshots, provider_id)
    }

    /// Whether anyone is listening for the provider's queue snapshots.
    pub fn wants_snapshot(&self, provider_id: Ulid) -> bool {
        self.snapshots
            .get(&provider_id)
            .is_some_and(|sender| sender.receiver_count() > 0)
    }

    /// Never blocks and never fails the caller: channels without listeners are skipped
    /// and a closed outbox is ignored.
    pub fn send(&self, change: &QueueChange) {
        publish(&self.providers, change.provider_id, change);
        if let Some(customer_id) = change.customer_id {
            publish(&self.customers, customer_id, change);
        }
        if let Some(outbox) = &self.outbox {
            let _ = outbox.send(change.clone());
        }
    }

    pub fn send_snapshot(&self, snapshot: &QueueSnapshot) {
        publish(&self.snapshots, snapshot.provider_id, snapshot);
    }
}

fn subscribe<T: Clone>(channels: &DashMap<Ulid, broadcast::Sender<T>>, key: Ulid) -> broadcast::Receiver<T> {
    channels
        .entry(key)
        .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
        .subscribe()
}

fn publish<T: Clone>(channels: &DashMap<Ulid, broadcast::Sender<T>>, key: Ulid, message: &T) {
    let orphaned = match channels.get(&key) {
        Some(sender) => sender.send(message.clone()).is_err(),
        None => return,
    };
    // Re-checked under the shard lock: a subscriber may have arrived since the send.
    if orphaned {
        channels.remove_if(&key, |_, sender| sender.receiver_count() == 0);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkError(pub String);

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sink error: {}", self.0)
    }
}

impl std::error::Error for SinkError {}

/// Outbound delivery of queue changes (push, SMS, webhooks...).
#[async_trait]
pub trait ChangeSink: Send + Sync {
    async fn publish(&self, change: &QueueChange) -> Result<(), SinkError>;
}

/// Writes each change as a JSON line through tracing.
pub struct LogSink;

#[async_trait]
impl ChangeSink for LogSink {
    async fn publish(&self, change: &QueueChange) -> Result<(), SinkError> {
        let payload = serde_json::to_string(change).map_err(|e| SinkError(e.to_string()))?;
        info!(target: "slotq::changes", action = change.action.label(), "{payload}");
        Ok(())
    }
}

/// Drain the outbox into `sink` one change at a time, so the sink sees changes in the
/// order they were committed. Delivery failures are logged and counted, never retried.
pub async fn run_dispatcher(mut rx: mpsc::UnboundedReceiver<QueueChange>, sink: Arc<dyn ChangeSink>) {
    while let Some(change) = rx.recv().await {
        match sink.publish(&change).await {
            Ok(()) => {
                metrics::counter!(observability::NOTIFICATIONS_DELIVERED_TOTAL).increment(1);
            }
            Err(e) => {
                metrics::counter!(observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
                warn!(
                    provider_id = %change.provider_id,
                    action = change.action.label(),
                    "dropping queue change: {e}"
                );
            }
        }
    }
}
