// Extractor contract
//
// An extractor claims one `<$name:dtype>` tag pair. For every block the
// filtering sink opens a fresh session; callbacks are synchronous and return
// the events to publish, the sink takes care of delivery.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::events::{Event, EventMetadata};

pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    fn data_type(&self) -> &str;

    /// Start a session for one block. `token` is cancelled when the block or
    /// its stream ends; `item_id` is `"<stream-uuid>:<n>"`.
    fn new_session(
        &self,
        token: CancellationToken,
        meta: &EventMetadata,
        item_id: &str,
    ) -> Box<dyn ExtractorSession>;
}

pub trait ExtractorSession: Send {
    fn on_start(&mut self) -> Vec<Event>;

    /// Payload text received since the previous call
    fn on_delta(&mut self, _fragment: &str) -> Vec<Event> {
        Vec::new()
    }

    /// Best-effort parse of the payload so far
    fn on_update(&mut self, _snapshot: Option<&Value>, _error: Option<&str>) -> Vec<Event> {
        Vec::new()
    }

    /// Called exactly once per block
    fn on_completed(
        &mut self,
        snapshot: Option<&Value>,
        success: bool,
        error: Option<&str>,
    ) -> Vec<Event>;
}
