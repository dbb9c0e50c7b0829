//! Change-event fan-out.
//!
//! `record` delivers an event to the local subscribers of its user and hands
//! it to a pool of database writers. Delivery across instances depends on the
//! mode:
//! - polling: a poller reads rows newer than its last poll from the events
//!   table. It starts with the first subscriber and stops after the last.
//! - pubsub: events are published on the event bus and a subscription task
//!   (reconnecting with a fixed back-off) feeds them to local subscribers.
//!
//! Every path goes through one dedup map keyed by event id, so a subscriber
//! sees each event at most once.

use crate::metrics::{EVENT_SUBSCRIBERS, EVENTS_BROADCAST, EVENTS_DROPPED};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use teldrive_core::config::{EventsConfig, EventsMode};
use teldrive_core::{Event, EventSource, EventType};
use teldrive_metadata::models::EventRow;
use teldrive_metadata::{EventBus, MetadataStore};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Queue depth of one subscriber.
pub const SUBSCRIBER_CAPACITY: usize = 100;

/// Rows read per poll.
const POLL_BATCH: i64 = 1000;

/// How long `close` waits for in-flight events.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

struct Inner {
    config: EventsConfig,
    metadata: Arc<dyn MetadataStore>,
    bus: Arc<dyn EventBus>,
    subscribers: Mutex<HashMap<i64, HashMap<u64, mpsc::Sender<Event>>>>,
    next_subscriber: AtomicU64,
    seen: DashMap<Uuid, Instant>,
    db_tx: Mutex<Option<mpsc::Sender<Event>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    poller: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

/// Records change events and fans them out to subscribers.
pub struct EventBroadcaster {
    inner: Arc<Inner>,
}

impl EventBroadcaster {
    /// Start the writer pool (and, in pubsub mode, the bus subscription).
    pub fn new(
        config: EventsConfig,
        metadata: Arc<dyn MetadataStore>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        let (db_tx, db_rx) = mpsc::channel(config.db_buffer_size.max(1));
        let inner = Arc::new(Inner {
            config,
            metadata,
            bus,
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            seen: DashMap::new(),
            db_tx: Mutex::new(Some(db_tx)),
            workers: Mutex::new(Vec::new()),
            poller: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        let db_rx = Arc::new(tokio::sync::Mutex::new(db_rx));
        let mut workers = Vec::with_capacity(inner.config.db_workers);
        for worker in 0..inner.config.db_workers.max(1) {
            let rx = Arc::clone(&db_rx);
            let metadata = Arc::clone(&inner.metadata);
            workers.push(tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(event) = next else { break };
                    if let Err(e) = metadata.insert_event(&EventRow::from(&event)).await {
                        tracing::error!(worker, event_id = %event.id, error = %e, "failed to store event");
                    }
                }
            }));
        }
        *lock(&inner.workers) = workers;

        if inner.config.mode == EventsMode::Pubsub {
            tokio::spawn(run_bus_subscription(Arc::clone(&inner)));
        }

        Self { inner }
    }

    /// Record a change: deliver locally, persist, and publish in pubsub mode.
    pub async fn record(&self, event_type: EventType, user_id: i64, source: EventSource) -> Event {
        let event = Event::new(event_type, user_id, source);
        self.inner.deliver(&event);

        let tx = lock(&self.inner.db_tx).clone();
        match tx {
            Some(tx) => {
                if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event.clone()) {
                    tracing::warn!(event_id = %event.id, "event queue full, storing inline");
                    if let Err(e) = self.inner.metadata.insert_event(&EventRow::from(&event)).await {
                        tracing::error!(event_id = %event.id, error = %e, "failed to store event");
                    }
                }
            }
            None => tracing::debug!(event_id = %event.id, "broadcaster stopped, event not stored"),
        }

        if self.inner.config.mode == EventsMode::Pubsub {
            match serde_json::to_string(&event) {
                Ok(payload) => {
                    if let Err(e) = self.inner.bus.publish(&payload).await {
                        tracing::warn!(event_id = %event.id, error = %e, "failed to publish event");
                    }
                }
                Err(e) => tracing::error!(error = %e, "failed to serialize event"),
            }
        }
        event
    }

    /// Subscribe to a user's events.
    pub fn subscribe(&self, user_id: i64) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut subs = lock(&self.inner.subscribers);
            let first = subs.is_empty();
            subs.entry(user_id).or_default().insert(id, tx);
            first
        };
        EVENT_SUBSCRIBERS.inc();
        if first && self.inner.config.mode == EventsMode::Polling {
            self.inner.start_poller();
        }
        tracing::debug!(user_id, subscriber = id, "event subscriber added");
        Subscription {
            id,
            user_id,
            rx,
            inner: Arc::clone(&self.inner),
            closed: false,
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).values().map(HashMap::len).sum()
    }

    /// Whether the lazy poller is running.
    pub fn is_polling(&self) -> bool {
        lock(&self.inner.poller).is_some()
    }

    /// Forget dedup entries older than the TTL. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Stop background tasks and wait for queued writes.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Some(token) = lock(&self.inner.poller).take() {
            token.cancel();
        }
        lock(&self.inner.db_tx).take();
        let workers = std::mem::take(&mut *lock(&self.inner.workers));
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "event writer ended abnormally");
            }
        }
    }
}

impl Inner {
    fn deliver(&self, event: &Event) {
        if self.seen.insert(event.id, Instant::now()).is_some() {
            return;
        }
        let subs = lock(&self.subscribers);
        let Some(targets) = subs.get(&event.user_id) else {
            return;
        };
        for (subscriber, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => EVENTS_BROADCAST.inc(),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    EVENTS_DROPPED.inc();
                    tracing::warn!(
                        user_id = event.user_id,
                        subscriber,
                        event_id = %event.id,
                        "subscriber queue full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    fn sweep(&self) -> usize {
        let ttl = self.config.deduplication_ttl();
        let before = self.seen.len();
        self.seen.retain(|_, at| at.elapsed() < ttl);
        before - self.seen.len()
    }

    fn start_poller(self: &Arc<Self>) {
        let mut poller = lock(&self.poller);
        if poller.is_some() {
            return;
        }
        let token = self.shutdown.child_token();
        *poller = Some(token.clone());
        tokio::spawn(run_poller(Arc::clone(self), token));
        tracing::debug!("event poller started");
    }

    fn remove_subscriber(&self, user_id: i64, id: u64) {
        let now_empty = {
            let mut subs = lock(&self.subscribers);
            if let Some(user_subs) = subs.get_mut(&user_id) {
                if user_subs.remove(&id).is_some() {
                    EVENT_SUBSCRIBERS.dec();
                }
                if user_subs.is_empty() {
                    subs.remove(&user_id);
                }
            }
            subs.is_empty()
        };
        if now_empty && let Some(token) = lock(&self.poller).take() {
            token.cancel();
            tracing::debug!("event poller stopped");
        }
    }
}

async fn run_poller(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut last_poll = OffsetDateTime::now_utc();
    let mut ticker = tokio::time::interval(inner.config.poll_interval());
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let rows = match inner.metadata.events_since(last_poll, POLL_BATCH).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "event poll failed");
                continue;
            }
        };
        for row in rows {
            last_poll = last_poll.max(row.created_at);
            match Event::try_from(row) {
                Ok(event) => inner.deliver(&event),
                Err(e) => tracing::warn!(error = %e, "skipping undecodable event row"),
            }
        }
        inner.sweep();
    }
}

async fn run_bus_subscription(inner: Arc<Inner>) {
    let backoff = inner.config.reconnect_backoff();
    loop {
        match inner.bus.subscribe().await {
            Ok(mut stream) => {
                tracing::info!("subscribed to event bus");
                loop {
                    let next = tokio::select! {
                        _ = inner.shutdown.cancelled() => return,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(payload)) => match serde_json::from_str::<Event>(&payload) {
                            Ok(event) => inner.deliver(&event),
                            Err(e) => tracing::warn!(error = %e, "ignoring malformed event payload"),
                        },
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "event bus error");
                            break;
                        }
                        None => break,
                    }
                }
                tracing::warn!("event bus subscription ended, reconnecting");
            }
            Err(e) => tracing::warn!(error = %e, "event bus subscribe failed"),
        }
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    user_id: i64,
    rx: mpsc::Receiver<Event>,
    inner: Arc<Inner>,
    closed: bool,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Unsubscribe and drain whatever arrives within a short grace period.
    pub async fn close(mut self) -> Vec<Event> {
        self.inner.remove_subscriber(self.user_id, self.id);
        self.closed = true;
        self.rx.close();
        let mut drained = Vec::new();
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while let Some(event) = self.rx.recv().await {
                drained.push(event);
            }
        })
        .await;
        drained
    }

    /// Consume the subscription as a stream of events.
    pub fn into_stream(self) -> impl Stream<Item = Event> + Send {
        async_stream::stream! {
            let mut sub = self;
            while let Some(event) = sub.recv().await {
                yield event;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.closed {
            self.inner.remove_subscriber(self.user_id, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teldrive_core::{FileId, FileType};
    use teldrive_metadata::{LocalEventBus, SqliteStore};

    fn source(name: &str) -> EventSource {
        EventSource {
            id: FileId::new(),
            file_type: FileType::File,
            name: name.to_string(),
            parent_id: None,
            dest_parent_id: None,
        }
    }

    async fn store() -> (tempfile::TempDir, Arc<dyn MetadataStore>) {
        let temp = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(&temp.path().join("m.db"), None)
            .await
            .unwrap();
        (temp, Arc::new(store))
    }

    fn config(mode: EventsMode) -> EventsConfig {
        EventsConfig {
            mode,
            poll_interval_secs: 1,
            reconnect_backoff_secs: 1,
            ..EventsConfig::default()
        }
    }

    #[tokio::test]
    async fn test_record_reaches_only_that_users_subscribers() {
        let (_temp, metadata) = store().await;
        let events = EventBroadcaster::new(
            config(EventsMode::Polling),
            Arc::clone(&metadata),
            Arc::new(LocalEventBus::default()),
        );
        let mut mine = events.subscribe(1);
        let mut other = events.subscribe(2);

        let recorded = events.record(EventType::FileCreate, 1, source("a")).await;
        assert_eq!(mine.recv().await.unwrap().id, recorded.id);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), other.recv())
                .await
                .is_err()
        );

        events.shutdown().await;
        let stored = metadata.recent_events(1, 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, recorded.id);
    }

    #[tokio::test]
    async fn test_poller_is_lazy() {
        let (_temp, metadata) = store().await;
        let events = EventBroadcaster::new(
            config(EventsMode::Polling),
            metadata,
            Arc::new(LocalEventBus::default()),
        );
        assert!(!events.is_polling());
        let a = events.subscribe(1);
        let b = events.subscribe(1);
        assert!(events.is_polling());
        drop(a);
        assert!(events.is_polling());
        drop(b);
        assert!(!events.is_polling());
        assert_eq!(events.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_poller_delivers_foreign_events_once() {
        let (_temp, metadata) = store().await;
        let events = EventBroadcaster::new(
            config(EventsMode::Polling),
            Arc::clone(&metadata),
            Arc::new(LocalEventBus::default()),
        );
        let mut sub = events.subscribe(5);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let foreign = Event::new(EventType::FileDelete, 5, source("b"));
        metadata.insert_event(&EventRow::from(&foreign)).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id, foreign.id);
        assert!(
            tokio::time::timeout(Duration::from_millis(1500), sub.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_pubsub_dedups_own_publish() {
        let (_temp, metadata) = store().await;
        let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::default());
        let events = EventBroadcaster::new(config(EventsMode::Pubsub), metadata, Arc::clone(&bus));
        let mut sub = events.subscribe(3);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let recorded = events.record(EventType::FileUpdate, 3, source("c")).await;
        assert_eq!(sub.recv().await.unwrap().id, recorded.id);

        let remote = Event::new(EventType::FileCopy, 3, source("d"));
        bus.publish(&serde_json::to_string(&remote).unwrap()).await.unwrap();
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(2), sub.recv())
                .await
                .unwrap()
                .unwrap()
                .id,
            remote.id
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(100), sub.recv())
                .await
                .is_err()
        );
        events.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_subscriber_drops_events() {
        let (_temp, metadata) = store().await;
        let events = EventBroadcaster::new(
            config(EventsMode::Polling),
            metadata,
            Arc::new(LocalEventBus::default()),
        );
        let sub = events.subscribe(1);
        for i in 0..SUBSCRIBER_CAPACITY + 5 {
            events
                .record(EventType::FileCreate, 1, source(&format!("f{i}")))
                .await;
        }
        let drained = sub.close().await;
        assert_eq!(drained.len(), SUBSCRIBER_CAPACITY);
        assert_eq!(events.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_forgets_old_ids() {
        let (_temp, metadata) = store().await;
        let events = EventBroadcaster::new(
            EventsConfig {
                deduplication_ttl_secs: 0,
                ..config(EventsMode::Polling)
            },
            metadata,
            Arc::new(LocalEventBus::default()),
        );
        events.record(EventType::FileCreate, 1, source("x")).await;
        assert_eq!(events.sweep(), 1);
    }
}
