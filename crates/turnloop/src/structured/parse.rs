// Parse helpers for extractor sessions
//
// Extractors usually re-parse their accumulated payload as YAML. Parsing on
// every fragment is wasteful for large payloads, so DebouncedYaml only
// attempts a parse on a cadence (newline seen, or every N bytes).

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("payload too large")]
    TooLarge,

    #[error("empty payload")]
    Empty,

    #[error("yaml: {0}")]
    Yaml(String),
}

/// Split a fenced block into `(lang, body)`. The lang is lowercased; without
/// a fence the input comes back unchanged with an empty lang.
pub fn strip_code_fence(text: &str) -> (String, &str) {
    let Some(start) = text.find("```") else {
        return (String::new(), text);
    };
    let rest = &text[start + 3..];
    let Some(newline) = rest.find('\n') else {
        return (String::new(), text);
    };
    let header = rest[..newline].trim().to_lowercase();
    let mut body = &rest[newline + 1..];
    if let Some(end) = body.rfind("```") {
        body = &body[..end];
    }
    (header, body)
}

/// Parse YAML text into a JSON value
pub fn parse_yaml_value(text: &str) -> Result<Value, ParseError> {
    let yaml: serde_yaml::Value =
        serde_yaml::from_str(text).map_err(|e| ParseError::Yaml(e.to_string()))?;
    serde_json::to_value(yaml).map_err(|e| ParseError::Yaml(e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    /// Attempt a parse after this many new bytes; 0 disables
    pub snapshot_every_bytes: usize,
    pub snapshot_on_newline: bool,
    /// Refuse bodies larger than this; 0 disables
    pub max_bytes: usize,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            snapshot_every_bytes: 256,
            snapshot_on_newline: true,
            max_bytes: 0,
        }
    }
}

/// Incremental typed YAML parser with a parse cadence
#[derive(Debug)]
pub struct DebouncedYaml<T> {
    config: DebounceConfig,
    buf: String,
    since_last_attempt: usize,
    _target: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> DebouncedYaml<T> {
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            config,
            buf: String::new(),
            since_last_attempt: 0,
            _target: PhantomData,
        }
    }

    /// Append a chunk. Returns `None` when the cadence did not trigger a
    /// parse, otherwise the parse outcome. Errors are expected while the
    /// document is still incomplete.
    pub fn feed(&mut self, chunk: &str) -> Option<Result<T, ParseError>> {
        if chunk.is_empty() {
            return None;
        }
        self.buf.push_str(chunk);
        self.since_last_attempt += chunk.len();

        let on_newline = self.config.snapshot_on_newline && chunk.contains('\n');
        let on_bytes = self.config.snapshot_every_bytes > 0
            && self.since_last_attempt >= self.config.snapshot_every_bytes;
        if !on_newline && !on_bytes {
            return None;
        }
        self.since_last_attempt = 0;
        Some(self.try_parse(&self.buf))
    }

    /// Final parse over `raw` when given, else over the accumulated buffer
    pub fn finish(&self, raw: Option<&str>) -> Result<T, ParseError> {
        self.try_parse(raw.unwrap_or(&self.buf))
    }

    pub fn buffer(&self) -> &str {
        &self.buf
    }

    fn try_parse(&self, text: &str) -> Result<T, ParseError> {
        let (_, body) = strip_code_fence(text);
        if self.config.max_bytes > 0 && body.len() > self.config.max_bytes {
            return Err(ParseError::TooLarge);
        }
        if body.trim().is_empty() {
            return Err(ParseError::Empty);
        }
        serde_yaml::from_str(body).map_err(|e| ParseError::Yaml(e.to_string()))
    }
}
