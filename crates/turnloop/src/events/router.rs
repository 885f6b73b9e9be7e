// Event Router
//
// In-process publish/subscribe over tokio channels. Publishing blocks until
// every subscriber of the topic has acknowledged the message, which gives
// sinks natural back-pressure. The router owns a handler table: each handler
// gets its own subscription and task once the router runs.
//
// Design decisions:
// - Subscriptions are created before the running signal fires, so callers
//   that wait on `running()` never publish into the void
// - Handler errors are logged and the message is still acknowledged
// - Closing the router drops all subscriptions; later publishes fail
// - Senders whose subscription was dropped are pruned on publish

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::EventError;

const SUBSCRIPTION_BUFFER: usize = 16;

// ============================================================================
// Messages and publishers
// ============================================================================

/// A routed message: opaque payload plus string metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub uuid: String,
    pub payload: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
}

impl Message {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            payload,
            metadata: BTreeMap::new(),
        }
    }
}

/// Anything that accepts messages for a topic
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), EventError>;
}

/// A message handed to a subscriber; the publisher waits until it is acked
/// or dropped.
#[derive(Debug)]
pub struct Delivery {
    pub message: Message,
    ack: oneshot::Sender<()>,
}

impl Delivery {
    pub fn ack(self) {
        let _ = self.ack.send(());
    }
}

/// Receiving side of a topic subscription
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<Delivery>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<Delivery> {
        ReceiverStream::new(self.rx)
    }
}

/// Topic fan-out over channels, blocking publishers until subscriber ack
#[derive(Default)]
pub struct ChannelPubSub {
    subscribers: RwLock<HashMap<String, Vec<mpsc::Sender<Delivery>>>>,
    closed: AtomicBool,
}

impl ChannelPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscribers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Subscription { rx }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .read()
            .get(topic)
            .map(|subs| subs.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscribers.write().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Publisher for ChannelPubSub {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), EventError> {
        if self.is_closed() {
            return Err(EventError::Closed);
        }
        let targets: Vec<mpsc::Sender<Delivery>> = self
            .subscribers
            .read()
            .get(topic)
            .cloned()
            .unwrap_or_default();

        let mut gone = false;
        for target in targets {
            let (ack_tx, ack_rx) = oneshot::channel();
            let delivery = Delivery {
                message: message.clone(),
                ack: ack_tx,
            };
            if target.send(delivery).await.is_err() {
                gone = true;
                continue;
            }
            let _ = ack_rx.await;
        }
        if gone {
            self.prune(topic);
        }
        Ok(())
    }
}

impl ChannelPubSub {
    fn prune(&self, topic: &str) {
        let mut subscribers = self.subscribers.write();
        if let Some(subs) = subscribers.get_mut(topic) {
            subs.retain(|s| !s.is_closed());
            if subs.is_empty() {
                subscribers.remove(topic);
            }
        }
        debug!(topic = %topic, "pubsub: pruned closed subscribers");
    }
}

impl std::fmt::Debug for ChannelPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscribers = self.subscribers.read();
        let mut topics: Vec<&String> = subscribers.keys().collect();
        topics.sort();
        f.debug_struct("ChannelPubSub")
            .field("topics", &topics)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// EventRouter
// ============================================================================

/// Consumes one message; errors are logged by the router
pub type MessageHandler =
    Arc<dyn Fn(Message) -> BoxFuture<'static, Result<(), EventError>> + Send + Sync>;

struct HandlerEntry {
    name: String,
    topic: String,
    handler: MessageHandler,
    started: bool,
}

pub struct EventRouter {
    pubsub: Arc<ChannelPubSub>,
    handlers: Mutex<Vec<HandlerEntry>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: watch::Sender<bool>,
    shutdown: CancellationToken,
    verbose: bool,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        let (running, _) = watch::channel(false);
        Self {
            pubsub: Arc::new(ChannelPubSub::new()),
            handlers: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            running,
            shutdown: CancellationToken::new(),
            verbose: false,
        }
    }

    /// Verbose mode keeps `meta`/`step` in dumped events
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn publisher(&self) -> Arc<dyn Publisher> {
        self.pubsub.clone()
    }

    pub fn pubsub(&self) -> Arc<ChannelPubSub> {
        self.pubsub.clone()
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Register a handler for a topic. Handlers added while the router runs
    /// start immediately.
    pub fn add_handler(
        &self,
        name: impl Into<String>,
        topic: impl Into<String>,
        handler: MessageHandler,
    ) -> Result<(), EventError> {
        let name = name.into();
        let mut handlers = self.handlers.lock();
        if handlers.iter().any(|h| h.name == name) {
            return Err(EventError::DuplicateHandler(name));
        }
        let mut entry = HandlerEntry {
            name,
            topic: topic.into(),
            handler,
            started: false,
        };
        if self.is_running() {
            self.start_handler(&mut entry);
        }
        handlers.push(entry);
        Ok(())
    }

    fn start_handler(&self, entry: &mut HandlerEntry) {
        let mut subscription = self.pubsub.subscribe(&entry.topic);
        let handler = entry.handler.clone();
        let name = entry.name.clone();
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    delivery = subscription.recv() => delivery,
                };
                let Some(delivery) = delivery else { break };
                let message_id = delivery.message.uuid.clone();
                if let Err(e) = handler(delivery.message.clone()).await {
                    warn!(handler = %name, message_id = %message_id, error = %e, "Event handler failed");
                }
                delivery.ack();
            }
            debug!(handler = %name, "Event handler stopped");
        });

        entry.started = true;
        self.tasks.lock().push(task);
    }

    /// Start every registered handler and block until the router is closed
    pub async fn run(&self) -> Result<(), EventError> {
        if self.pubsub.is_closed() {
            return Err(EventError::Closed);
        }
        {
            let mut handlers = self.handlers.lock();
            for entry in handlers.iter_mut().filter(|h| !h.started) {
                self.start_handler(entry);
            }
            info!(handlers = handlers.len(), "Event router running");
        }
        self.running.send_replace(true);

        self.shutdown.cancelled().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    /// Resolves once `run` has bound every handler
    pub async fn running(&self) {
        let mut rx = self.running.subscribe();
        let _ = rx.wait_for(|running| *running).await;
    }

    pub fn close(&self) {
        self.shutdown.cancel();
        self.pubsub.close();
        self.running.send_replace(false);
    }

    /// Handler that prints each raw event as pretty JSON
    pub fn dump_raw_events_handler(&self) -> MessageHandler {
        let verbose = self.verbose;
        Arc::new(
            move |message: Message| -> BoxFuture<'static, Result<(), EventError>> {
                Box::pin(async move {
                    format_raw_event(&message.payload, verbose)
                        .map(|rendered| println!("{rendered}"))
                })
            },
        )
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.handlers.lock().iter().map(|h| h.name.clone()).collect();
        f.debug_struct("EventRouter")
            .field("handlers", &names)
            .field("running", &self.is_running())
            .field("verbose", &self.verbose)
            .finish()
    }
}

/// Pretty-print an event payload. The compact form replaces `meta` and
/// `step` with `id` and `step_type`.
pub fn format_raw_event(payload: &[u8], verbose: bool) -> Result<String, EventError> {
    let mut value: Value =
        serde_json::from_slice(payload).map_err(|e| EventError::Decode(e.to_string()))?;
    if !verbose {
        if let Value::Object(object) = &mut value {
            let id = object
                .get("meta")
                .and_then(|m| m.get("message_id"))
                .cloned()
                .unwrap_or(Value::Null);
            let step_type = object
                .get("step")
                .and_then(|s| s.get("type"))
                .cloned()
                .unwrap_or(Value::Null);
            object.remove("meta");
            object.remove("step");
            object.insert("id".to_string(), id);
            object.insert("step_type".to_string(), step_type);
        }
    }
    serde_json::to_string_pretty(&value).map_err(|e| EventError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_waits_for_ack() {
        let pubsub = Arc::new(ChannelPubSub::new());
        let mut sub = pubsub.subscribe("chat");

        let publisher = pubsub.clone();
        let publish = tokio::spawn(async move {
            publisher
                .publish("chat", Message::new(b"{}".to_vec()))
                .await
        });

        let delivery = sub.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!publish.is_finished());

        delivery.ack();
        publish.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let pubsub = ChannelPubSub::new();
        let mut kept = pubsub.subscribe("chat");
        for _ in 0..3 {
            drop(pubsub.subscribe("chat"));
        }
        drop(pubsub.subscribe("other"));
        assert_eq!(pubsub.subscribers.read()["chat"].len(), 4);

        let acker = tokio::spawn(async move {
            let delivery = kept.recv().await.unwrap();
            delivery.ack();
            kept
        });
        pubsub
            .publish("chat", Message::new(b"{}".to_vec()))
            .await
            .unwrap();
        let _kept = acker.await.unwrap();

        assert_eq!(pubsub.subscribers.read()["chat"].len(), 1);
        assert_eq!(pubsub.subscriber_count("chat"), 1);

        pubsub
            .publish("other", Message::new(b"{}".to_vec()))
            .await
            .unwrap();
        assert!(!pubsub.subscribers.read().contains_key("other"));
    }

    #[tokio::test]
    async fn test_router_dispatches_to_handler() {
        let router = Arc::new(EventRouter::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        router
            .add_handler(
                "collect",
                "chat",
                Arc::new(move |msg: Message| -> BoxFuture<'static, Result<(), EventError>> {
                    let tx = tx.clone();
                    Box::pin(async move {
                        let _ = tx.send(msg.payload);
                        Ok(())
                    })
                }),
            )
            .unwrap();

        let runner = router.clone();
        let run = tokio::spawn(async move { runner.run().await });
        router.running().await;

        router
            .publisher()
            .publish("chat", Message::new(b"hello".to_vec()))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"hello".to_vec());

        router.close();
        run.await.unwrap().unwrap();
        assert!(router
            .publisher()
            .publish("chat", Message::new(vec![]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_duplicate_handler_name() {
        let router = EventRouter::new();
        let handler = router.dump_raw_events_handler();
        router.add_handler("dump", "a", handler.clone()).unwrap();
        assert_eq!(
            router.add_handler("dump", "b", handler),
            Err(EventError::DuplicateHandler("dump".into()))
        );
    }

    #[test]
    fn test_format_raw_event_compact() {
        let payload = json!({
            "type": "final",
            "text": "hi",
            "meta": {"message_id": "abc"},
            "step": {"type": "chat"}
        })
        .to_string();

        let compact: Value =
            serde_json::from_str(&format_raw_event(payload.as_bytes(), false).unwrap()).unwrap();
        assert_eq!(compact["id"], "abc");
        assert_eq!(compact["step_type"], "chat");
        assert!(compact.get("meta").is_none());

        let verbose: Value =
            serde_json::from_str(&format_raw_event(payload.as_bytes(), true).unwrap()).unwrap();
        assert_eq!(verbose["meta"]["message_id"], "abc");
    }
}
