#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Event bus abstractions for service-to-service communication.
//!
//! Two flavours live here. [`EventRecord`] publishers carry JSON telemetry
//! events to memory or to disk. [`FanoutBus`] delivers typed domain events to an
//! explicit list of subscribers, each drained by its own worker task.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{
    fs::OpenOptions,
    io::AsyncWriteExt,
    sync::{broadcast, mpsc},
    task::JoinHandle,
};

/// Generic event record encoded as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique identifier (uuid).
    pub id: String,
    /// Service producing the event.
    pub source: String,
    /// Event type (e.g., `dispatch.command.dropped`).
    pub event_type: String,
    /// ISO timestamp.
    pub timestamp: String,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Event publisher interface.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes an event to the bus.
    async fn publish(&self, event: EventRecord) -> Result<()>;
}

/// Event subscriber interface.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Returns a receiver yielding every event published after the call.
    async fn subscribe(&self) -> Result<broadcast::Receiver<EventRecord>>;
}

/// In-memory broadcast bus retaining a bounded backlog.
#[derive(Debug, Clone)]
pub struct MemoryEventBus {
    sender: broadcast::Sender<EventRecord>,
    capacity: usize,
    backlog: Arc<Mutex<VecDeque<EventRecord>>>,
}

impl MemoryEventBus {
    /// Creates a new bus with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            backlog: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
        }
    }

    /// Snapshot of recent events retained in memory.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.backlog.lock().iter().cloned().collect()
    }
}

/// File-backed publisher useful for durable event logs.
#[derive(Debug, Clone)]
pub struct FileEventPublisher {
    path: PathBuf,
}

impl FileEventPublisher {
    /// Creates a publisher that appends JSON lines to the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }
}

#[async_trait]
impl EventPublisher for MemoryEventBus {
    async fn publish(&self, event: EventRecord) -> Result<()> {
        {
            let mut backlog = self.backlog.lock();
            if backlog.len() == self.capacity {
                backlog.pop_front();
            }
            backlog.push_back(event.clone());
        }
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[async_trait]
impl EventSubscriber for MemoryEventBus {
    async fn subscribe(&self) -> Result<broadcast::Receiver<EventRecord>> {
        Ok(self.sender.subscribe())
    }
}

#[async_trait]
impl EventPublisher for FileEventPublisher {
    async fn publish(&self, event: EventRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let data = serde_json::to_vec(&event)?;
        file.write_all(&data).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

/// Typed subscriber registered on a [`FanoutBus`].
#[async_trait]
pub trait EventHandler<E>: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;
    /// Handles one event.
    async fn handle(&self, event: E);
}

/// Outcome of a single [`FanoutBus::publish`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers that received the event through their worker queue.
    pub queued: usize,
    /// Subscribers whose queue was saturated or closed and ran inline instead.
    pub inline: usize,
}

struct Subscription<E> {
    handler: Arc<dyn EventHandler<E>>,
    sender: mpsc::Sender<E>,
    worker: JoinHandle<()>,
}

/// Explicit observer list delivering each event to every subscriber.
///
/// Every subscriber owns a bounded queue drained by a dedicated worker task.
/// When that queue is full the publisher delivers the event inline instead of
/// dropping it, so saturation slows the publisher down rather than losing work.
pub struct FanoutBus<E> {
    queue_depth: usize,
    subscriptions: RwLock<Vec<Subscription<E>>>,
}

impl<E> std::fmt::Debug for FanoutBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutBus")
            .field("queue_depth", &self.queue_depth)
            .field("subscribers", &self.subscriptions.read().len())
            .finish()
    }
}

impl<E> FanoutBus<E>
where
    E: Clone + Send + 'static,
{
    /// Creates a bus whose subscriber queues hold `queue_depth` events each.
    #[must_use]
    pub fn new(queue_depth: usize) -> Self {
        Self {
            queue_depth: queue_depth.max(1),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    /// Registers a subscriber and spawns its worker on the current runtime.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler<E>>) {
        let (sender, mut receiver) = mpsc::channel::<E>(self.queue_depth);
        let worker_handler = Arc::clone(&handler);
        let worker = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                worker_handler.handle(event).await;
            }
        });
        self.subscriptions.write().push(Subscription {
            handler,
            sender,
            worker,
        });
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Delivers `event` to every subscriber.
    pub async fn publish(&self, event: E) -> PublishReport {
        let targets: Vec<(Arc<dyn EventHandler<E>>, mpsc::Sender<E>)> = self
            .subscriptions
            .read()
            .iter()
            .map(|sub| (Arc::clone(&sub.handler), sub.sender.clone()))
            .collect();

        let mut report = PublishReport::default();
        for (handler, sender) in targets {
            match sender.try_send(event.clone()) {
                Ok(()) => report.queued += 1,
                Err(
                    mpsc::error::TrySendError::Full(event)
                    | mpsc::error::TrySendError::Closed(event),
                ) => {
                    tracing::debug!(subscriber = handler.name(), "fanout.inline_delivery");
                    handler.handle(event).await;
                    report.inline += 1;
                }
            }
        }
        report
    }
}

impl<E> Drop for FanoutBus<E> {
    fn drop(&mut self) {
        for sub in self.subscriptions.get_mut().drain(..) {
            sub.worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use tokio::runtime::Runtime;
    use tokio::sync::Notify;

    fn sample_event() -> EventRecord {
        EventRecord {
            id: "event-1".into(),
            source: "tester".into(),
            event_type: "unit.test".into(),
            timestamp: "2026-10-16T00:00:00Z".into(),
            payload: serde_json::json!({"value": 1}),
        }
    }

    #[test]
    fn publishes_and_receives() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let bus = MemoryEventBus::new(16);
            let mut rx = bus.subscribe().await.unwrap();
            bus.publish(sample_event()).await.unwrap();
            let event = rx.recv().await.unwrap();
            assert_eq!(event.event_type, "unit.test");
        });
    }

    #[tokio::test]
    async fn memory_backlog_is_bounded() {
        let bus = MemoryEventBus::new(2);
        for _ in 0..5 {
            bus.publish(sample_event()).await.unwrap();
        }
        assert_eq!(bus.snapshot().len(), 2);
    }

    #[test]
    fn file_publisher_writes_events() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempdir().unwrap();
            let path = dir.path().join("events.log");
            let publisher = FileEventPublisher::new(&path).unwrap();
            publisher.publish(sample_event()).await.unwrap();
            let content = std::fs::read_to_string(path).unwrap();
            assert!(content.contains("unit.test"));
        });
    }

    struct Counter {
        seen: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl EventHandler<u32> for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        async fn handle(&self, _event: u32) {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn fanout_delivers_to_every_subscriber() {
        let bus = FanoutBus::new(8);
        let first = Arc::new(Counter {
            seen: AtomicUsize::new(0),
            gate: None,
        });
        let second = Arc::new(Counter {
            seen: AtomicUsize::new(0),
            gate: None,
        });
        bus.subscribe(first.clone());
        bus.subscribe(second.clone());

        let report = bus.publish(7).await;
        assert_eq!(report.queued, 2);
        for _ in 0..100 {
            if first.seen.load(Ordering::SeqCst) == 1 && second.seen.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(first.seen.load(Ordering::SeqCst), 1);
        assert_eq!(second.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn saturated_queue_falls_back_to_inline_delivery() {
        let gate = Arc::new(Notify::new());
        let slow = Arc::new(Counter {
            seen: AtomicUsize::new(0),
            gate: Some(gate.clone()),
        });
        let bus = FanoutBus::new(1);
        bus.subscribe(slow.clone());

        // The worker parks on the first event, the second fills the queue.
        assert_eq!(bus.publish(1).await.queued, 1);
        tokio::task::yield_now().await;
        assert_eq!(bus.publish(2).await.queued, 1);

        let publish = bus.publish(3);
        tokio::pin!(publish);
        let report = loop {
            tokio::select! {
                report = &mut publish => break report,
                () = tokio::task::yield_now() => gate.notify_waiters(),
            }
        };
        assert_eq!(report.inline, 1);
    }
}
