// Event sinks
//
// A sink is publish-only from the runtime's point of view. Sinks are attached
// to a RunContext; engines, middleware, the executor and the tool loop
// publish without knowing who is listening.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::event::Event;
use crate::error::EventError;

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish_event(&self, event: &Event) -> Result<(), EventError>;
}

#[async_trait]
impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    async fn publish_event(&self, event: &Event) -> Result<(), EventError> {
        (**self).publish_event(event).await
    }
}

/// Keeps every published event in memory
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events seen so far
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|e| e.event_type().to_string())
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn publish_event(&self, event: &Event) -> Result<(), EventError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Forwards events into a bounded channel; publishing waits for capacity
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Event>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn publish_event(&self, event: &Event) -> Result<(), EventError> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| EventError::Closed)
    }
}
