// Filtering Sink
//
// Wraps a downstream sink and strips structured blocks out of streamed model
// text:
//
//   <$name:dtype>
//   ```yaml
//   ...payload...
//   ```
//   </$name:dtype>
//
// Text outside blocks is forwarded as filtered `partial`/`final` events;
// block payloads are streamed to the extractor registered for (name, dtype)
// and the events it returns are published to the same downstream sink.
//
// Design decisions:
// - One state machine per stream (keyed by EventMetadata::id); state lives
//   behind a single mutex and is never held across an await
// - Input is scanned per char, so multi-byte text is never split
// - Every inbound partial produces exactly one outbound partial, even when
//   the filtered delta is empty
// - A malformed block is swallowed up to its close tag (or the final) and
//   the malformed policy is applied once to the whole block
// - A final removes the stream state and cancels its tokens

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::extractor::{Extractor, ExtractorSession};
use super::parse::parse_yaml_value;
use crate::error::EventError;
use crate::events::{Event, EventMetadata, EventPayload, EventSink};

/// Longest open tag accepted before the buffer is treated as prose
const MAX_OPEN_TAG_BYTES: usize = 128;

// ============================================================================
// Options
// ============================================================================

/// What happens to a block that cannot be completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedPolicy {
    /// Drop the captured bytes
    Ignore,
    /// Put the captured bytes back into the filtered text
    ForwardRaw,
    /// Publish the events of the failed `on_completed`
    #[default]
    ErrorEvents,
}

#[derive(Debug, Clone)]
pub struct FilteringOptions {
    /// Payload size limit per block; 0 disables the limit
    pub max_capture_bytes: usize,
    pub malformed: MalformedPolicy,
    /// Accepted fence languages, compared case-insensitively
    pub allowed_langs: Vec<String>,
    /// Budget for the text between the open tag and the end of the fence line
    pub max_header_bytes: usize,
    /// Emit debug traces
    pub debug: bool,
}

impl Default for FilteringOptions {
    fn default() -> Self {
        Self {
            max_capture_bytes: 256 * 1024,
            malformed: MalformedPolicy::default(),
            allowed_langs: vec!["yaml".to_string(), "yml".to_string()],
            max_header_bytes: 64,
            debug: false,
        }
    }
}

impl FilteringOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_capture_bytes(mut self, max: usize) -> Self {
        self.max_capture_bytes = max;
        self
    }

    pub fn with_malformed(mut self, policy: MalformedPolicy) -> Self {
        self.malformed = policy;
        self
    }

    pub fn with_allowed_langs(mut self, langs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allowed_langs = langs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_header_bytes(mut self, max: usize) -> Self {
        self.max_header_bytes = max;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    fn lang_allowed(&self, lang: &str) -> bool {
        self.allowed_langs
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(lang))
    }
}

// ============================================================================
// Per-stream state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Between the open tag and the end of the fence header line
    Fence,
    /// Inside the fenced payload
    Body,
    /// After the closing fence, matching the close tag
    Close,
    /// Malformed; consuming input until the close tag
    Skip,
}

enum Step {
    Continue,
    Completed,
    Malformed(String),
}

/// One block being captured
struct Capture {
    name: String,
    dtype: String,
    session: Box<dyn ExtractorSession>,
    token: CancellationToken,
    stage: Stage,
    /// Everything consumed since the open tag, for ForwardRaw
    raw: String,
    header: String,
    payload: String,
    /// Payload not yet handed to `on_delta`
    pending: String,
    /// Backticks seen at the start of a payload line
    ticks: usize,
    at_line_start: bool,
    close: String,
}

impl Capture {
    fn expected_close(&self) -> String {
        format!("</${}:{}>", self.name, self.dtype)
    }

    fn push_payload(&mut self, text: &str) {
        self.payload.push_str(text);
        self.pending.push_str(text);
    }

    fn snapshot(&self) -> (Option<Value>, Option<String>) {
        match parse_yaml_value(&self.payload) {
            Ok(value) => (Some(value), None),
            Err(e) => (None, Some(e.to_string())),
        }
    }

    /// Hand buffered payload to the session and re-parse
    fn flush_pending(&mut self, typed: &mut Vec<Event>) {
        if self.pending.is_empty() {
            return;
        }
        let fragment = std::mem::take(&mut self.pending);
        typed.extend(self.session.on_delta(&fragment));
        let (snapshot, error) = self.snapshot();
        typed.extend(self.session.on_update(snapshot.as_ref(), error.as_deref()));
    }

    fn body_char(&mut self, ch: char, max_capture_bytes: usize, typed: &mut Vec<Event>) -> Step {
        if self.ticks > 0 || (self.at_line_start && ch == '`') {
            if ch == '`' {
                self.ticks += 1;
                if self.ticks == 3 {
                    self.ticks = 0;
                    self.stage = Stage::Close;
                    self.flush_pending(typed);
                }
                return Step::Continue;
            }
            let held = "`".repeat(self.ticks);
            self.ticks = 0;
            self.push_payload(&held);
        }

        let mut buf = [0u8; 4];
        self.push_payload(ch.encode_utf8(&mut buf));
        self.at_line_start = ch == '\n';

        if max_capture_bytes > 0 && self.payload.len() > max_capture_bytes {
            return Step::Malformed("structured payload exceeds capture limit".to_string());
        }
        Step::Continue
    }

    fn close_char(&mut self, ch: char) -> Step {
        if self.close.is_empty() && ch.is_whitespace() {
            return Step::Continue;
        }
        self.close.push(ch);
        let expected = self.expected_close();
        if self.close == expected {
            Step::Completed
        } else if expected.starts_with(&self.close) {
            Step::Continue
        } else {
            Step::Malformed(format!("expected {expected} after code fence"))
        }
    }
}

struct StreamState {
    token: CancellationToken,
    /// Raw text seen through partials, subtracted from the final
    raw_seen: String,
    filtered: String,
    /// Pending `<...` that may still become an open tag
    open_tag: String,
    seq: usize,
    capture: Option<Capture>,
}

impl StreamState {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            raw_seen: String::new(),
            filtered: String::new(),
            open_tag: String::new(),
            seq: 0,
            capture: None,
        }
    }

    /// Give up on the pending open tag. A trailing `<` may start a new tag.
    fn flush_open_tag(&mut self, out: &mut String) {
        if self.open_tag.len() > 1 && self.open_tag.ends_with('<') {
            let keep = self.open_tag.split_off(self.open_tag.len() - 1);
            out.push_str(&self.open_tag);
            self.open_tag = keep;
        } else {
            out.push_str(&self.open_tag);
            self.open_tag.clear();
        }
    }
}

// ============================================================================
// FilteringSink
// ============================================================================

pub struct FilteringSink {
    next: Arc<dyn EventSink>,
    options: FilteringOptions,
    extractors: HashMap<(String, String), Arc<dyn Extractor>>,
    streams: Mutex<HashMap<Uuid, StreamState>>,
    base: CancellationToken,
}

impl FilteringSink {
    pub fn new(next: Arc<dyn EventSink>, options: FilteringOptions) -> Self {
        Self {
            next,
            options,
            extractors: HashMap::new(),
            streams: Mutex::new(HashMap::new()),
            base: CancellationToken::new(),
        }
    }

    /// Register an extractor; a later one for the same tag replaces it
    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        let key = (
            extractor.name().to_string(),
            extractor.data_type().to_string(),
        );
        self.extractors.insert(key, extractor);
        self
    }

    /// Derive stream and item tokens from `token` instead of a private root
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.base = token;
        self
    }

    pub fn options(&self) -> &FilteringOptions {
        &self.options
    }

    /// Streams with state still held
    pub fn active_streams(&self) -> usize {
        self.streams.lock().len()
    }

    async fn handle_partial(&self, event: &Event, delta: &str) -> Result<(), EventError> {
        let meta = &event.metadata;
        let (forward, typed) = {
            let mut streams = self.streams.lock();
            let state = streams
                .entry(meta.id)
                .or_insert_with(|| StreamState::new(self.base.child_token()));
            if self.options.debug {
                debug!(stream = %meta.id, delta = %delta, "filtering-sink: partial");
            }
            state.raw_seen.push_str(delta);
            let (filtered, typed) = self.scan(meta, state, delta);
            state.filtered.push_str(&filtered);

            let mut forward = Event::partial(meta.clone(), filtered, state.filtered.clone());
            forward.step = event.step.clone();
            (forward, typed)
        };

        self.next.publish_event(&forward).await?;
        self.publish_all(meta, typed).await
    }

    async fn handle_final(&self, event: &Event, text: &str) -> Result<(), EventError> {
        let meta = &event.metadata;
        let removed = self.streams.lock().remove(&meta.id);
        let mut state = removed.unwrap_or_else(|| StreamState::new(self.base.child_token()));

        let tail = match text.strip_prefix(state.raw_seen.as_str()) {
            Some(tail) => tail,
            None => {
                warn!(
                    stream = %meta.id,
                    raw_seen_len = state.raw_seen.len(),
                    full_len = text.len(),
                    "filtering-sink: final text does not extend streamed partials; ignoring tail"
                );
                ""
            }
        };
        if self.options.debug {
            debug!(
                stream = %meta.id,
                raw_seen_len = state.raw_seen.len(),
                full_len = text.len(),
                tail_len = tail.len(),
                "filtering-sink: final"
            );
        }

        let (filtered, mut typed) = self.scan(meta, &mut state, tail);
        state.filtered.push_str(&filtered);

        if let Some(mut capture) = state.capture.take() {
            if capture.stage != Stage::Skip {
                self.fail_capture(
                    meta,
                    &mut capture,
                    "unterminated structured block".to_string(),
                    &mut typed,
                );
            }
            let mut out = String::new();
            self.finish_skipped(capture, &mut out);
            state.filtered.push_str(&out);
        }
        if !state.open_tag.is_empty() {
            let pending = std::mem::take(&mut state.open_tag);
            state.filtered.push_str(&pending);
        }
        state.token.cancel();

        // Extractor errors must not keep the final from going out
        if let Err(e) = self.publish_all(meta, typed).await {
            warn!(stream = %meta.id, error = %e, "filtering-sink: failed to publish extractor events");
        }

        let mut forward = Event::final_text(meta.clone(), state.filtered);
        forward.step = event.step.clone();
        self.next.publish_event(&forward).await
    }

    async fn publish_all(&self, meta: &EventMetadata, events: Vec<Event>) -> Result<(), EventError> {
        for mut event in events {
            event.metadata.fill_missing_ids(meta);
            self.next.publish_event(&event).await?;
        }
        Ok(())
    }

    /// Run `delta` through the state machine, returning the filtered text
    /// and the extractor events it produced
    fn scan(&self, meta: &EventMetadata, state: &mut StreamState, delta: &str) -> (String, Vec<Event>) {
        let mut out = String::with_capacity(delta.len());
        let mut typed = Vec::new();

        for ch in delta.chars() {
            if state.capture.is_some() {
                self.capture_char(meta, state, ch, &mut out, &mut typed);
            } else {
                self.idle_char(meta, state, ch, &mut out, &mut typed);
            }
        }

        if let Some(capture) = state.capture.as_mut() {
            capture.flush_pending(&mut typed);
        }

        // `<$...` and a lone `<` may continue in the next delta
        if !state.open_tag.is_empty() && !state.open_tag.starts_with("<$") && state.open_tag != "<" {
            state.flush_open_tag(&mut out);
        }

        (out, typed)
    }

    fn idle_char(
        &self,
        meta: &EventMetadata,
        state: &mut StreamState,
        ch: char,
        out: &mut String,
        typed: &mut Vec<Event>,
    ) {
        if state.open_tag.is_empty() {
            if ch == '<' {
                state.open_tag.push(ch);
            } else {
                out.push(ch);
            }
            return;
        }

        state.open_tag.push(ch);

        if ch == '>' {
            let Some((name, dtype)) = parse_open_tag(&state.open_tag) else {
                state.flush_open_tag(out);
                return;
            };
            let tag = std::mem::take(&mut state.open_tag);
            match self.extractors.get(&(name.clone(), dtype.clone())) {
                Some(extractor) => {
                    state.seq += 1;
                    let token = state.token.child_token();
                    let item_id = format!("{}:{}", meta.id, state.seq);
                    if self.options.debug {
                        debug!(stream = %meta.id, name = %name, dtype = %dtype, item_id = %item_id, "filtering-sink: open tag");
                    }
                    let mut session = extractor.new_session(token.clone(), meta, &item_id);
                    typed.extend(session.on_start());
                    state.capture = Some(Capture {
                        name,
                        dtype,
                        session,
                        token,
                        stage: Stage::Fence,
                        raw: tag,
                        header: String::new(),
                        payload: String::new(),
                        pending: String::new(),
                        ticks: 0,
                        at_line_start: false,
                        close: String::new(),
                    });
                }
                None => {
                    if self.options.debug {
                        debug!(stream = %meta.id, name = %name, dtype = %dtype, "filtering-sink: no extractor for tag");
                    }
                    out.push_str(&tag);
                }
            }
            return;
        }

        let not_structured = state.open_tag.len() >= 2 && !state.open_tag.starts_with("<$");
        let bad_char = state.open_tag.len() > 2 && !is_tag_char(ch);
        if not_structured || bad_char || state.open_tag.len() > MAX_OPEN_TAG_BYTES {
            state.flush_open_tag(out);
        }
    }

    fn capture_char(
        &self,
        meta: &EventMetadata,
        state: &mut StreamState,
        ch: char,
        out: &mut String,
        typed: &mut Vec<Event>,
    ) {
        let Some(capture) = state.capture.as_mut() else {
            return;
        };
        capture.raw.push(ch);

        let step = match capture.stage {
            Stage::Fence => self.fence_char(capture, ch),
            Stage::Body => capture.body_char(ch, self.options.max_capture_bytes, typed),
            Stage::Close => capture.close_char(ch),
            Stage::Skip => {
                if capture.raw.ends_with(&capture.expected_close()) {
                    Step::Completed
                } else {
                    Step::Continue
                }
            }
        };

        match step {
            Step::Continue => {}
            Step::Completed => {
                if let Some(capture) = state.capture.take() {
                    if capture.stage == Stage::Skip {
                        self.finish_skipped(capture, out);
                    } else {
                        self.complete_capture(meta, capture, typed);
                    }
                }
            }
            Step::Malformed(reason) => self.fail_capture(meta, capture, reason, typed),
        }
    }

    fn fence_char(&self, capture: &mut Capture, ch: char) -> Step {
        if capture.header.is_empty() && ch.is_whitespace() {
            return Step::Continue;
        }
        capture.header.push(ch);

        if ch == '\n' {
            let lang = match capture.header.trim_end().strip_prefix("```") {
                Some(lang) => lang.trim().to_string(),
                None => return Step::Malformed("missing code fence".to_string()),
            };
            if !self.options.lang_allowed(&lang) {
                return Step::Malformed(format!("fence language {lang:?} not allowed"));
            }
            capture.stage = Stage::Body;
            capture.at_line_start = true;
            return Step::Continue;
        }

        if capture.header.len() > self.options.max_header_bytes {
            return Step::Malformed("code fence header too long".to_string());
        }
        if capture.header.len() <= 3 && !"```".starts_with(capture.header.as_str()) {
            return Step::Malformed("missing code fence".to_string());
        }
        Step::Continue
    }

    fn complete_capture(&self, meta: &EventMetadata, mut capture: Capture, typed: &mut Vec<Event>) {
        capture.flush_pending(typed);
        let (snapshot, error) = capture.snapshot();
        if self.options.debug {
            debug!(
                stream = %meta.id,
                name = %capture.name,
                dtype = %capture.dtype,
                payload_len = capture.payload.len(),
                "filtering-sink: close tag"
            );
        }
        typed.extend(capture.session.on_completed(
            snapshot.as_ref(),
            error.is_none(),
            error.as_deref(),
        ));
        capture.token.cancel();
    }

    /// Report the failed block and start swallowing the rest of it
    fn fail_capture(
        &self,
        meta: &EventMetadata,
        capture: &mut Capture,
        reason: String,
        typed: &mut Vec<Event>,
    ) {
        if self.options.debug {
            debug!(
                stream = %meta.id,
                name = %capture.name,
                dtype = %capture.dtype,
                reason = %reason,
                policy = ?self.options.malformed,
                "filtering-sink: malformed block"
            );
        }
        let (snapshot, _) = capture.snapshot();
        let events = capture
            .session
            .on_completed(snapshot.as_ref(), false, Some(&reason));

        if self.options.malformed == MalformedPolicy::ErrorEvents {
            typed.extend(events);
        }
        capture.pending.clear();
        capture.ticks = 0;
        capture.stage = Stage::Skip;
        capture.token.cancel();
    }

    /// End of a swallowed block; only ForwardRaw puts it back into the text
    fn finish_skipped(&self, capture: Capture, out: &mut String) {
        if self.options.malformed == MalformedPolicy::ForwardRaw {
            out.push_str(&capture.raw);
        }
    }
}

#[async_trait]
impl EventSink for FilteringSink {
    async fn publish_event(&self, event: &Event) -> Result<(), EventError> {
        match &event.payload {
            EventPayload::Partial { delta, .. } => self.handle_partial(event, delta).await,
            EventPayload::Final { text } => self.handle_final(event, text).await,
            _ => self.next.publish_event(event).await,
        }
    }
}

impl std::fmt::Debug for FilteringSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<String> = self
            .extractors
            .keys()
            .map(|(name, dtype)| format!("{name}:{dtype}"))
            .collect();
        tags.sort();
        f.debug_struct("FilteringSink")
            .field("extractors", &tags)
            .field("options", &self.options)
            .field("active_streams", &self.active_streams())
            .finish()
    }
}

/// `<$name:dtype>` into `(name, dtype)`
fn parse_open_tag(tag: &str) -> Option<(String, String)> {
    let body = tag.strip_prefix("<$")?.strip_suffix('>')?;
    let (name, dtype) = body.split_once(':')?;
    let name_ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    let dtype_ok = !dtype.is_empty()
        && dtype
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if name_ok && dtype_ok {
        Some((name.to_string(), dtype.to_string()))
    } else {
        None
    }
}

fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')
}
