// Integration tests for structured-output extraction during a run
//
// An engine streams text containing a tagged YAML block; a FilteringSink
// attached through the engine builder hides the block from downstream sinks
// and hands the payload to a registered extractor.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use turnloop::events::{CollectingSink, Event, EventMetadata, EventPayload, EventSink};
use turnloop::structured::{Extractor, ExtractorSession, FilteringOptions, FilteringSink};
use turnloop::{Block, Engine, FnEngine, RunContext, Session, ToolLoopEngineBuilder, Turn};

const STREAM: &str = "Here: <$citations:v1>\n```yaml\ncitations:\n  - title: A\n    authors: [X]\n```\n</$citations:v1> done";

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Start(String),
    Delta(String),
    Update(Value),
    Completed(bool, Option<Value>),
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Call>>>);

impl Recorder {
    fn calls(&self) -> Vec<Call> {
        self.0.lock().clone()
    }
}

struct CitationsExtractor(Recorder);

struct CitationsSession {
    recorder: Recorder,
    meta: EventMetadata,
}

impl Extractor for CitationsExtractor {
    fn name(&self) -> &str {
        "citations"
    }

    fn data_type(&self) -> &str {
        "v1"
    }

    fn new_session(
        &self,
        _token: CancellationToken,
        meta: &EventMetadata,
        item_id: &str,
    ) -> Box<dyn ExtractorSession> {
        self.0 .0.lock().push(Call::Start(item_id.to_string()));
        Box::new(CitationsSession {
            recorder: self.0.clone(),
            meta: meta.clone(),
        })
    }
}

impl ExtractorSession for CitationsSession {
    fn on_start(&mut self) -> Vec<Event> {
        Vec::new()
    }

    fn on_delta(&mut self, fragment: &str) -> Vec<Event> {
        self.recorder.0.lock().push(Call::Delta(fragment.to_string()));
        Vec::new()
    }

    fn on_update(&mut self, snapshot: Option<&Value>, _error: Option<&str>) -> Vec<Event> {
        if let Some(value) = snapshot {
            self.recorder.0.lock().push(Call::Update(value.clone()));
        }
        Vec::new()
    }

    fn on_completed(
        &mut self,
        snapshot: Option<&Value>,
        success: bool,
        _error: Option<&str>,
    ) -> Vec<Event> {
        self.recorder
            .0
            .lock()
            .push(Call::Completed(success, snapshot.cloned()));
        let mut data = Map::new();
        if let Some(value) = snapshot {
            data.insert("citations".to_string(), value["citations"].clone());
        }
        vec![Event::info(self.meta.clone(), "citations-extracted", data)]
    }
}

/// Streams `STREAM` in `chunk`-sized pieces under one stream id
fn streaming_engine(chunk: usize) -> Arc<dyn Engine> {
    Arc::new(FnEngine::new(move |ctx: RunContext, mut turn: Turn| async move {
        let meta = ctx.event_metadata();
        ctx.publish(&Event::start(meta.clone())).await;

        let chars: Vec<char> = STREAM.chars().collect();
        let mut completion = String::new();
        for piece in chars.chunks(chunk) {
            let delta: String = piece.iter().collect();
            completion.push_str(&delta);
            ctx.publish(&Event::partial(meta.clone(), delta, completion.clone()))
                .await;
        }
        ctx.publish(&Event::final_text(meta, completion.clone())).await;

        turn.append_block(Block::llm_text(completion));
        Ok(turn)
    }))
}

fn filtered_session(chunk: usize) -> (Session, CollectingSink, Recorder) {
    let downstream = CollectingSink::new();
    let recorder = Recorder::default();
    let filter = FilteringSink::new(Arc::new(downstream.clone()), FilteringOptions::default())
        .with_extractor(Arc::new(CitationsExtractor(recorder.clone())));
    let session = Session::with_id("structured").with_builder(Arc::new(
        ToolLoopEngineBuilder::new(streaming_engine(chunk))
            .with_event_sink(Arc::new(filter) as Arc<dyn EventSink>),
    ));
    session.append_new_turn_from_user_prompt("cite something").unwrap();
    (session, downstream, recorder)
}

fn final_text(events: &[Event]) -> Option<String> {
    events.iter().find_map(|e| match &e.payload {
        EventPayload::Final { text } => Some(text.clone()),
        _ => None,
    })
}

#[tokio::test]
async fn test_block_hidden_from_downstream_and_extracted() {
    let (session, downstream, recorder) = filtered_session(7);

    let turn = session
        .start_inference(&RunContext::new())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    // The Turn keeps the raw model text; only the event stream is filtered
    assert_eq!(turn.last_llm_text(), Some(STREAM));

    let events = downstream.events();
    assert_eq!(final_text(&events).as_deref(), Some("Here:  done"));

    let expected = json!({"citations": [{"title": "A", "authors": ["X"]}]});
    let calls = recorder.calls();
    assert!(matches!(calls.first(), Some(Call::Start(_))));
    assert!(calls.iter().any(|c| matches!(c, Call::Delta(_))));
    assert!(calls.contains(&Call::Update(expected.clone())));
    assert_eq!(calls.last(), Some(&Call::Completed(true, Some(expected))));

    let info = events
        .iter()
        .find(|e| matches!(&e.payload, EventPayload::Info { message, .. } if message == "citations-extracted"))
        .unwrap();
    assert_eq!(info.metadata.session_id, "structured");
}

#[tokio::test]
async fn test_filtered_partials_stay_monotonic() {
    let (session, downstream, _) = filtered_session(3);

    session
        .start_inference(&RunContext::new())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let mut joined = String::new();
    let mut previous = String::new();
    for event in downstream.events() {
        if let EventPayload::Partial { delta, completion } = &event.payload {
            joined.push_str(delta);
            assert!(completion.starts_with(&previous));
            assert_eq!(&joined, completion);
            previous = completion.clone();
        }
    }
    assert_eq!(joined, "Here:  done");
}
