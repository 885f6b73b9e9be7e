// Publisher manager
//
// Fans one payload out to every publisher subscribed under a topic and
// stamps a monotonically increasing sequence number into the message
// metadata. The lock is held across the whole fan-out so sequence order and
// delivery order agree.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

use super::router::{Message, Publisher};
use crate::error::EventError;

/// Metadata key carrying the per-manager sequence number
pub const SEQUENCE_NUMBER: &str = "sequence_number";

#[derive(Default)]
struct ManagerState {
    publishers: BTreeMap<String, Vec<Arc<dyn Publisher>>>,
    sequence: u64,
}

#[derive(Default)]
pub struct PublisherManager {
    state: Mutex<ManagerState>,
}

impl PublisherManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe_publisher(&self, topic: impl Into<String>, publisher: Arc<dyn Publisher>) {
        self.state
            .lock()
            .await
            .publishers
            .entry(topic.into())
            .or_default()
            .push(publisher);
    }

    /// Serialize `payload` and deliver it to every subscribed publisher.
    /// Delivery failures are logged; only encoding fails the call.
    pub async fn publish<T: Serialize + ?Sized>(&self, payload: &T) -> Result<u64, EventError> {
        let mut state = self.state.lock().await;

        let bytes = serde_json::to_vec(payload).map_err(|e| EventError::Encode(e.to_string()))?;
        let sequence = state.sequence;
        state.sequence += 1;

        let mut message = Message::new(bytes);
        message
            .metadata
            .insert(SEQUENCE_NUMBER.to_string(), sequence.to_string());

        for (topic, publishers) in &state.publishers {
            for publisher in publishers {
                if let Err(e) = publisher.publish(topic, message.clone()).await {
                    warn!(topic = %topic, sequence, error = %e, "Failed to publish");
                }
            }
        }
        Ok(sequence)
    }

    /// Publish and log instead of returning errors
    pub async fn publish_blind<T: Serialize + ?Sized>(&self, payload: &T) {
        if let Err(e) = self.publish(payload).await {
            warn!(error = %e, "Failed to publish");
        }
    }
}

impl std::fmt::Debug for PublisherManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        seen: SyncMutex<Vec<(String, Message)>>,
    }

    #[async_trait]
    impl Publisher for Recorder {
        async fn publish(&self, topic: &str, message: Message) -> Result<(), EventError> {
            self.seen.lock().push((topic.to_string(), message));
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Publisher for Broken {
        async fn publish(&self, _topic: &str, _message: Message) -> Result<(), EventError> {
            Err(EventError::Publish("down".into()))
        }
    }

    #[tokio::test]
    async fn test_sequence_numbers_increase() {
        let manager = PublisherManager::new();
        let recorder = Arc::new(Recorder::default());
        manager.subscribe_publisher("ui", recorder.clone()).await;
        manager.subscribe_publisher("log", recorder.clone()).await;

        assert_eq!(manager.publish(&json!({"n": 1})).await.unwrap(), 0);
        assert_eq!(manager.publish(&json!({"n": 2})).await.unwrap(), 1);

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 4);
        let sequences: Vec<&str> = seen
            .iter()
            .map(|(_, m)| m.metadata[SEQUENCE_NUMBER].as_str())
            .collect();
        assert_eq!(sequences, vec!["0", "0", "1", "1"]);
        assert_eq!(seen[0].0, "log");
    }

    #[tokio::test]
    async fn test_failing_publisher_does_not_fail_publish() {
        let manager = PublisherManager::new();
        let recorder = Arc::new(Recorder::default());
        manager.subscribe_publisher("a", Arc::new(Broken)).await;
        manager.subscribe_publisher("b", recorder.clone()).await;

        manager.publish(&json!("x")).await.unwrap();
        assert_eq!(recorder.seen.lock().len(), 1);
    }
}
