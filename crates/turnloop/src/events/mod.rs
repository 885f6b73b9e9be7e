// Event model, codec, sinks and routing

pub mod aggregator;
pub mod event;
pub mod publisher;
pub mod registry;
pub mod router;
pub mod sink;
pub mod topic_sink;

pub use aggregator::{ToolEventAggregator, ToolEventEntry};
pub use event::{
    event_type, CustomEvent, Event, EventBody, EventMetadata, EventPayload, StepMetadata,
    ToolCallInfo, ToolResultInfo, Usage,
};
pub use publisher::{PublisherManager, SEQUENCE_NUMBER};
pub use registry::{EventDecoder, EventRegistry};
pub use router::{
    format_raw_event, ChannelPubSub, Delivery, EventRouter, Message, MessageHandler, Publisher,
    Subscription,
};
pub use sink::{ChannelSink, CollectingSink, EventSink};
pub use topic_sink::TopicSink;
