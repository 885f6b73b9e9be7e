// Sink that encodes events and hands them to a Publisher under one topic

use std::sync::Arc;

use async_trait::async_trait;

use super::event::Event;
use super::router::{Message, Publisher};
use super::sink::EventSink;
use crate::error::EventError;

#[derive(Clone)]
pub struct TopicSink {
    publisher: Arc<dyn Publisher>,
    topic: String,
}

impl TopicSink {
    pub fn new(publisher: Arc<dyn Publisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl EventSink for TopicSink {
    async fn publish_event(&self, event: &Event) -> Result<(), EventError> {
        let payload = event.to_json()?;
        let mut message = Message::new(payload);
        message.uuid = event.metadata.id.to_string();
        self.publisher.publish(&self.topic, message).await
    }
}

impl std::fmt::Debug for TopicSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicSink").field("topic", &self.topic).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventMetadata, EventRegistry};
    use crate::events::router::ChannelPubSub;

    #[tokio::test]
    async fn test_topic_sink_publishes_encoded_event() {
        let pubsub = Arc::new(ChannelPubSub::new());
        let mut sub = pubsub.subscribe("chat");
        let sink = TopicSink::new(pubsub.clone(), "chat");

        let event = Event::final_text(EventMetadata::new(), "done");
        let expected_id = event.metadata.id.to_string();
        let publish = tokio::spawn(async move { sink.publish_event(&event).await });

        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.message.uuid, expected_id);
        let decoded = EventRegistry::new().decode(&delivery.message.payload).unwrap();
        assert_eq!(decoded.event_type(), "final");
        delivery.ack();

        publish.await.unwrap().unwrap();
    }
}
