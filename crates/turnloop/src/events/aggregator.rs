// Tool event aggregation
//
// Folds provider tool calls, local executions and results into one entry per
// tool call id, in first-seen order. Used by UIs that render a compact tool
// timeline.

use std::collections::HashMap;

use super::event::{Event, EventPayload};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolEventEntry {
    pub id: String,
    pub name: String,
    pub input: String,
    pub provider_called: bool,
    pub exec_started: bool,
    pub result: String,
}

impl ToolEventEntry {
    /// Compact plain-text rendering
    pub fn line(&self) -> String {
        let name = if self.name.is_empty() { &self.id } else { &self.name };
        let mut parts = Vec::with_capacity(4);
        if self.provider_called {
            parts.push(format!("→ {name}"));
        }
        if self.exec_started {
            parts.push("↳ exec".to_string());
        }
        if !self.result.is_empty() {
            parts.push(format!("← {}", self.result));
        }
        if !self.input.is_empty() {
            parts.push(self.input.clone());
        }
        parts.join("  ")
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolEventAggregator {
    index: HashMap<String, usize>,
    entries: Vec<ToolEventEntry>,
}

impl ToolEventAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.index.clear();
        self.entries.clear();
    }

    pub fn entries(&self) -> &[ToolEventEntry] {
        &self.entries
    }

    /// Update entries from a tool-related event; other events are ignored
    pub fn handle(&mut self, event: &Event) {
        match &event.payload {
            EventPayload::ToolCall { tool_call } if !tool_call.id.is_empty() => {
                let entry = self.ensure(&tool_call.id);
                entry.provider_called = true;
                entry.name = tool_call.name.clone();
                if !tool_call.input.is_empty() {
                    entry.input = tool_call.input.clone();
                }
            }
            EventPayload::ToolCallExecute { tool_call } if !tool_call.id.is_empty() => {
                let entry = self.ensure(&tool_call.id);
                entry.exec_started = true;
                if !tool_call.name.is_empty() {
                    entry.name = tool_call.name.clone();
                }
                if !tool_call.input.is_empty() && entry.input.is_empty() {
                    entry.input = tool_call.input.clone();
                }
            }
            EventPayload::ToolResult { tool_result }
            | EventPayload::ToolCallExecutionResult { tool_result }
                if !tool_result.id.is_empty() =>
            {
                self.ensure(&tool_result.id).result = tool_result.result.clone();
            }
            _ => {}
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.entries.iter().map(ToolEventEntry::line).collect()
    }

    fn ensure(&mut self, id: &str) -> &mut ToolEventEntry {
        let idx = match self.index.get(id) {
            Some(idx) => *idx,
            None => {
                let idx = self.entries.len();
                self.index.insert(id.to_string(), idx);
                self.entries.push(ToolEventEntry {
                    id: id.to_string(),
                    ..ToolEventEntry::default()
                });
                idx
            }
        };
        &mut self.entries[idx]
    }
}
