//! Event bus
//!
//! In-process publish/subscribe router connecting the pipeline stages.
//! One dispatch task drains a bounded FIFO queue. Each dequeued event is
//! fanned out to all of its subscribers concurrently, and that fan-out is
//! joined before the next event is dequeued.
//!
//! Queue policy is reject-new: `publish` never waits on consumers and fails
//! with [`PipelineError::QueueFull`] once the queue is at capacity.
//! Nothing is durable; `stop` discards whatever is still queued.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::models::{ErrorPayload, Event, EventType};
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// A pipeline stage (or outbound observer) subscribed to one or more event types
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name, used as `source` on published events and as `error_type` on faults
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &Event, publisher: &Publisher) -> Result<()>;
}

#[derive(Debug, Default)]
struct BusCounters {
    published: AtomicU64,
    dispatched: AtomicU64,
    rejected: AtomicU64,
    handler_failures: AtomicU64,
    discarded_on_stop: AtomicU64,
}

/// Point-in-time counters for the health endpoint
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub dispatched: u64,
    pub rejected: u64,
    pub handler_failures: u64,
    pub discarded_on_stop: u64,
}

/// Cheap, cloneable publishing handle onto the bus queue
#[derive(Clone)]
pub struct Publisher {
    sender: mpsc::Sender<Event>,
    capacity: usize,
    counters: Arc<BusCounters>,
}

impl Publisher {
    /// Wrap `payload` in an [`Event`] and enqueue it without waiting
    pub fn publish<P: Serialize>(
        &self,
        event_type: EventType,
        payload: &P,
        source: &str,
        correlation_id: Option<&str>,
    ) -> Result<()> {
        let event = Event::new(event_type, payload, source, correlation_id)?;
        self.publish_event(event)
    }

    pub fn publish_event(&self, event: Event) -> Result<()> {
        let event_type = event.event_type;

        match self.sender.try_send(event) {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                debug!(event_type = %event_type, "Published event");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_type = %event_type,
                    capacity = self.capacity,
                    "Event queue full, rejecting event"
                );
                Err(PipelineError::QueueFull(self.capacity))
            }
            Err(TrySendError::Closed(_)) => Err(PipelineError::BusStopped),
        }
    }
}

type SubscriberTable = HashMap<EventType, Vec<Arc<dyn EventHandler>>>;

pub struct EventBus {
    publisher: Publisher,
    subscribers: Arc<RwLock<SubscriberTable>>,
    receiver: Mutex<Option<mpsc::Receiver<Event>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    poll_interval: Duration,
    counters: Arc<BusCounters>,
}

impl EventBus {
    pub fn new(capacity: usize, poll_interval: Duration) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let (shutdown, _) = watch::channel(false);
        let counters = Arc::new(BusCounters::default());

        Self {
            publisher: Publisher {
                sender,
                capacity,
                counters: Arc::clone(&counters),
            },
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            receiver: Mutex::new(Some(receiver)),
            shutdown,
            task: Mutex::new(None),
            poll_interval,
            counters,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.queue_capacity, config.poll_interval)
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Enqueue an event; returns before any handler runs
    pub fn publish<P: Serialize>(
        &self,
        event_type: EventType,
        payload: &P,
        source: &str,
        correlation_id: Option<&str>,
    ) -> Result<()> {
        self.publisher
            .publish(event_type, payload, source, correlation_id)
    }

    pub async fn subscribe(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        let name = handler.name();
        let mut table = self.subscribers.write().await;
        table.entry(event_type).or_default().push(handler);
        info!(event_type = %event_type, handler = name, "Subscribed handler");
    }

    /// Remove a previously subscribed handler (matched by identity)
    pub async fn unsubscribe(&self, event_type: EventType, handler: &Arc<dyn EventHandler>) -> bool {
        let mut table = self.subscribers.write().await;
        let Some(handlers) = table.get_mut(&event_type) else {
            return false;
        };

        let before = handlers.len();
        handlers.retain(|h| !same_handler(h, handler));
        let removed = handlers.len() < before;

        if removed {
            info!(event_type = %event_type, handler = handler.name(), "Unsubscribed handler");
        }
        removed
    }

    pub async fn subscriber_count(&self, event_type: EventType) -> usize {
        self.subscribers
            .read()
            .await
            .get(&event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Spawn the dispatch loop
    pub async fn start(&self) -> Result<()> {
        if *self.shutdown.borrow() {
            return Err(PipelineError::BusStopped);
        }

        let receiver = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or(PipelineError::BusAlreadyStarted)?;

        let handle = tokio::spawn(run_dispatch_loop(
            receiver,
            Arc::clone(&self.subscribers),
            self.publisher.clone(),
            Arc::clone(&self.counters),
            self.shutdown.subscribe(),
            self.poll_interval,
        ));

        *self.task.lock().await = Some(handle);
        info!("Event bus started");
        Ok(())
    }

    /// Stop the dispatch loop.
    ///
    /// The event currently being dispatched finishes its fan-out; anything
    /// still queued is dropped.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);

        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Event bus dispatch task terminated abnormally");
            }
        }

        // Never started: close the queue ourselves so publishers see BusStopped.
        if let Some(receiver) = self.receiver.lock().await.take() {
            discard_queued(receiver, &self.counters);
        }

        info!("Event bus stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
            discarded_on_stop: self.counters.discarded_on_stop.load(Ordering::Relaxed),
        }
    }
}

fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

async fn run_dispatch_loop(
    mut receiver: mpsc::Receiver<Event>,
    subscribers: Arc<RwLock<SubscriberTable>>,
    publisher: Publisher,
    counters: Arc<BusCounters>,
    mut shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
) {
    debug!(?poll_interval, "Dispatch loop running");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = tokio::time::timeout(poll_interval, receiver.recv()) => next,
        };

        match next {
            Ok(Some(event)) => dispatch(event, &subscribers, &publisher, &counters).await,
            Ok(None) => break,
            // Poll interval elapsed on an empty queue
            Err(_) => continue,
        }
    }

    discard_queued(receiver, &counters);
    debug!("Dispatch loop exited");
}

fn discard_queued(mut receiver: mpsc::Receiver<Event>, counters: &BusCounters) {
    receiver.close();

    let mut discarded = 0u64;
    while receiver.try_recv().is_ok() {
        discarded += 1;
    }

    if discarded > 0 {
        counters
            .discarded_on_stop
            .fetch_add(discarded, Ordering::Relaxed);
        warn!(discarded, "Discarded queued events on shutdown");
    }
}

async fn dispatch(
    event: Event,
    subscribers: &RwLock<SubscriberTable>,
    publisher: &Publisher,
    counters: &BusCounters,
) {
    counters.dispatched.fetch_add(1, Ordering::Relaxed);

    let handlers = subscribers
        .read()
        .await
        .get(&event.event_type)
        .cloned()
        .unwrap_or_default();

    if handlers.is_empty() {
        debug!(event_type = %event.event_type, "No subscribers for event");
        return;
    }

    let event = Arc::new(event);
    let mut tasks = JoinSet::new();

    for handler in handlers {
        let event = Arc::clone(&event);
        let publisher = publisher.clone();
        tasks.spawn(async move {
            let outcome = handler.handle(&event, &publisher).await;
            (handler.name(), outcome)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (handler_name, message) = match joined {
            Ok((_, Ok(()))) => continue,
            Ok((name, Err(e))) => (name, e.to_string()),
            Err(join_error) => ("unknown_handler", format!("handler task failed: {}", join_error)),
        };

        counters.handler_failures.fetch_add(1, Ordering::Relaxed);
        error!(
            handler = handler_name,
            event_type = %event.event_type,
            session_id = ?event.session_id(),
            error = %message,
            "Event handler failed"
        );

        report_fault(&event, handler_name, message, publisher);
    }

    debug!(event_type = %event.event_type, source = %event.source, "Processed event");
}

/// Convert a handler fault into an `error` event for observers.
/// Faults raised while handling `error` events are only logged.
fn report_fault(event: &Event, handler_name: &str, message: String, publisher: &Publisher) {
    if event.event_type == EventType::Error {
        return;
    }

    let payload = ErrorPayload {
        error_type: handler_name.to_string(),
        error_message: message,
        session_id: event.session_id().map(str::to_string),
    };

    if let Err(e) = publisher.publish(
        EventType::Error,
        &payload,
        "EventBus",
        event.correlation_id.as_deref(),
    ) {
        warn!(error = %e, "Could not publish error event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{next_event, Collector};
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    struct SleepyHandler {
        done: Arc<AtomicBool>,
        delay: Duration,
    }

    #[async_trait]
    impl EventHandler for SleepyHandler {
        fn name(&self) -> &'static str {
            "sleepy"
        }

        async fn handle(&self, _event: &Event, _publisher: &Publisher) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.done.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl EventHandler for FailingHandler {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn handle(&self, _event: &Event, _publisher: &Publisher) -> Result<()> {
            Err(PipelineError::RetrievalError("boom".to_string()))
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl EventHandler for PanickingHandler {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn handle(&self, _event: &Event, _publisher: &Publisher) -> Result<()> {
            panic!("handler panic");
        }
    }

    fn test_bus(capacity: usize) -> EventBus {
        EventBus::new(capacity, Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_publish_returns_before_processing() {
        let bus = test_bus(16);
        let done = Arc::new(AtomicBool::new(false));
        bus.subscribe(
            EventType::ChatMessage,
            Arc::new(SleepyHandler {
                done: Arc::clone(&done),
                delay: Duration::from_millis(400),
            }),
        )
        .await;
        bus.start().await.unwrap();

        let started = Instant::now();
        bus.publish(EventType::ChatMessage, &json!({"session_id": "s1"}), "test", None)
            .unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_millis(50), "publish blocked for {:?}", elapsed);
        assert!(!done.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(done.load(Ordering::SeqCst));
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_events_dispatched_in_fifo_order() {
        let bus = test_bus(16);
        let (collector, mut rx) = Collector::new();
        bus.subscribe(EventType::IntentAnalysis, collector).await;
        bus.start().await.unwrap();

        for i in 0..5 {
            bus.publish(EventType::IntentAnalysis, &json!({"seq": i}), "test", None)
                .unwrap();
        }

        for i in 0..5 {
            let event = next_event(&mut rx, Duration::from_secs(2)).await.unwrap();
            assert_eq!(event.payload["seq"], json!(i));
        }
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_handlers_for_one_event_run_concurrently() {
        let bus = test_bus(16);
        let first = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicBool::new(false));
        for done in [&first, &second] {
            bus.subscribe(
                EventType::DataRetrieval,
                Arc::new(SleepyHandler {
                    done: Arc::clone(done),
                    delay: Duration::from_millis(300),
                }),
            )
            .await;
        }
        bus.start().await.unwrap();

        bus.publish(EventType::DataRetrieval, &json!({}), "test", None).unwrap();
        tokio::time::sleep(Duration::from_millis(480)).await;

        assert!(first.load(Ordering::SeqCst));
        assert!(second.load(Ordering::SeqCst));
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_handler_fault_is_isolated_and_reported() {
        let bus = test_bus(16);
        let (collector, mut rx) = Collector::new();
        let (errors, mut error_rx) = Collector::new();

        bus.subscribe(EventType::ToolSelection, Arc::new(FailingHandler)).await;
        bus.subscribe(EventType::ToolSelection, Arc::new(PanickingHandler)).await;
        bus.subscribe(EventType::ToolSelection, collector).await;
        bus.subscribe(EventType::Error, errors).await;
        bus.start().await.unwrap();

        bus.publish(
            EventType::ToolSelection,
            &json!({"session_id": "api_u1_deadbeef"}),
            "test",
            Some("api_u1_deadbeef"),
        )
        .unwrap();

        // Sibling handler still ran
        let seen = next_event(&mut rx, Duration::from_secs(2)).await.unwrap();
        assert_eq!(seen.session_id(), Some("api_u1_deadbeef"));

        let mut error_types = Vec::new();
        for _ in 0..2 {
            let error_event = next_event(&mut error_rx, Duration::from_secs(2)).await.unwrap();
            let payload: ErrorPayload = error_event.decode_payload().unwrap();
            assert_eq!(payload.session_id.as_deref(), Some("api_u1_deadbeef"));
            error_types.push(payload.error_type);
        }
        assert!(error_types.contains(&"failing".to_string()));

        // Loop keeps going
        bus.publish(EventType::ToolSelection, &json!({"session_id": "next"}), "test", None)
            .unwrap();
        let seen = next_event(&mut rx, Duration::from_secs(2)).await.unwrap();
        assert_eq!(seen.session_id(), Some("next"));

        assert!(bus.stats().handler_failures >= 2);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_queue_full_rejects_without_blocking() {
        let bus = test_bus(2);

        bus.publish(EventType::ChatMessage, &json!({}), "test", None).unwrap();
        bus.publish(EventType::ChatMessage, &json!({}), "test", None).unwrap();
        let err = bus
            .publish(EventType::ChatMessage, &json!({}), "test", None)
            .unwrap_err();

        assert!(matches!(err, PipelineError::QueueFull(2)));
        let stats = bus.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.rejected, 1);
    }

    #[tokio::test]
    async fn test_stop_discards_queue_and_rejects_publish() {
        let bus = test_bus(8);
        bus.publish(EventType::ChatMessage, &json!({}), "test", None).unwrap();
        bus.publish(EventType::ChatMessage, &json!({}), "test", None).unwrap();

        bus.stop().await;

        assert_eq!(bus.stats().discarded_on_stop, 2);
        let err = bus
            .publish(EventType::ChatMessage, &json!({}), "test", None)
            .unwrap_err();
        assert!(matches!(err, PipelineError::BusStopped));
        assert!(matches!(bus.start().await, Err(PipelineError::BusStopped)));
    }

    #[tokio::test]
    async fn test_stop_waits_for_running_fan_out() {
        let bus = test_bus(8);
        let done = Arc::new(AtomicBool::new(false));
        bus.subscribe(
            EventType::ResponseGeneration,
            Arc::new(SleepyHandler {
                done: Arc::clone(&done),
                delay: Duration::from_millis(200),
            }),
        )
        .await;
        bus.start().await.unwrap();

        bus.publish(EventType::ResponseGeneration, &json!({}), "test", None)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        bus.stop().await;

        assert!(done.load(Ordering::SeqCst));
        assert!(!bus.is_running().await);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let bus = test_bus(4);
        tokio_test::assert_ok!(bus.start().await);
        assert!(matches!(bus.start().await, Err(PipelineError::BusAlreadyStarted)));
        assert!(bus.is_running().await);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_by_identity() {
        let bus = test_bus(4);
        let (first, _rx1) = Collector::new();
        let (second, _rx2) = Collector::new();
        let first: Arc<dyn EventHandler> = first;

        bus.subscribe(EventType::ChatResponse, Arc::clone(&first)).await;
        bus.subscribe(EventType::ChatResponse, second).await;
        assert_eq!(bus.subscriber_count(EventType::ChatResponse).await, 2);

        assert!(bus.unsubscribe(EventType::ChatResponse, &first).await);
        assert!(!bus.unsubscribe(EventType::ChatResponse, &first).await);
        assert!(!bus.unsubscribe(EventType::Error, &first).await);
        assert_eq!(bus.subscriber_count(EventType::ChatResponse).await, 1);
    }
}
