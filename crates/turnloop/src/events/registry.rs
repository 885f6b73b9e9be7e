// Event decoding
//
// Built-in kinds always decode. Custom kinds decode through decoders
// registered on an EventRegistry value; there is no process-wide registry,
// callers own one and pass it where decoding happens (router handlers,
// replay tools).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use super::event::{event_type, CustomEvent, Event, EventBody, EventMetadata, EventPayload, StepMetadata};
use crate::error::EventError;

/// Decodes the kind-specific fields of a custom event
pub type EventDecoder =
    Arc<dyn Fn(&Map<String, Value>) -> Result<Arc<dyn CustomEvent>, EventError> + Send + Sync>;

#[derive(Default)]
pub struct EventRegistry {
    decoders: RwLock<HashMap<String, EventDecoder>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decoder for a custom type name. Fails if the name is taken
    /// by a built-in kind or an earlier registration.
    pub fn register_codec(
        &self,
        type_name: impl Into<String>,
        decoder: EventDecoder,
    ) -> Result<(), EventError> {
        let type_name = type_name.into();
        if event_type::BUILTIN.contains(&type_name.as_str()) {
            return Err(EventError::DuplicateType(type_name));
        }
        let mut decoders = self.decoders.write();
        if decoders.contains_key(&type_name) {
            return Err(EventError::DuplicateType(type_name));
        }
        decoders.insert(type_name, decoder);
        Ok(())
    }

    /// Register a serde-backed custom type
    pub fn register_factory<T: EventBody>(&self) -> Result<(), EventError> {
        self.register_codec(
            T::TYPE,
            Arc::new(|fields: &Map<String, Value>| {
                let body: T = serde_json::from_value(Value::Object(fields.clone()))
                    .map_err(|e| EventError::Decode(e.to_string()))?;
                Ok(Arc::new(body) as Arc<dyn CustomEvent>)
            }),
        )
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        event_type::BUILTIN.contains(&type_name) || self.decoders.read().contains_key(type_name)
    }

    /// Decode a JSON event
    pub fn decode(&self, bytes: &[u8]) -> Result<Event, EventError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| EventError::Decode(e.to_string()))?;
        self.decode_value(value)
    }

    pub fn decode_value(&self, value: Value) -> Result<Event, EventError> {
        let Value::Object(mut object) = value else {
            return Err(EventError::Decode("event is not a JSON object".into()));
        };

        let type_name = object
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EventError::Decode("missing type discriminator".into()))?;

        let metadata: EventMetadata = match object.remove("meta") {
            Some(meta) => serde_json::from_value(meta).map_err(|e| EventError::Decode(e.to_string()))?,
            None => EventMetadata::default(),
        };
        let step: Option<StepMetadata> = match object.remove("step") {
            Some(Value::Null) | None => None,
            Some(step) => Some(serde_json::from_value(step).map_err(|e| EventError::Decode(e.to_string()))?),
        };

        let payload = if event_type::BUILTIN.contains(&type_name.as_str()) {
            serde_json::from_value::<EventPayload>(Value::Object(object))
                .map_err(|e| EventError::Decode(e.to_string()))?
        } else {
            let decoder = self
                .decoders
                .read()
                .get(&type_name)
                .cloned()
                .ok_or_else(|| EventError::UnknownType(type_name.clone()))?;
            object.remove("type");
            EventPayload::Custom(decoder(&object)?)
        };

        Ok(Event {
            metadata,
            step,
            payload,
        })
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let decoders = self.decoders.read();
        let mut names: Vec<&String> = decoders.keys().collect();
        names.sort();
        f.debug_struct("EventRegistry")
            .field("custom_types", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event::{ToolCallInfo, Usage};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Citation {
        title: String,
    }

    impl EventBody for Citation {
        const TYPE: &'static str = "citation";
    }

    #[test]
    fn test_builtin_round_trip() {
        let registry = EventRegistry::new();
        let mut meta = EventMetadata::new().with_session("s1");
        meta.usage = Some(Usage {
            input_tokens: 4,
            output_tokens: 2,
            ..Usage::default()
        });
        let events = vec![
            Event::start(meta.clone()),
            Event::partial(meta.clone(), "a", "a"),
            Event::final_text(meta.clone(), "ab"),
            Event::tool_call(
                meta.clone(),
                ToolCallInfo {
                    id: "c1".into(),
                    name: "echo".into(),
                    input: "{\"text\":\"x\"}".into(),
                },
            ),
            Event::error(meta.clone(), "boom"),
            Event::log(meta.clone(), "info", "hello", Map::new()),
        ];

        for event in events {
            let bytes = event.to_json().unwrap();
            let decoded = registry.decode(&bytes).unwrap();
            assert_eq!(decoded.event_type(), event.event_type());
            assert_eq!(decoded.metadata, event.metadata);
            assert_eq!(decoded.to_value().unwrap(), event.to_value().unwrap());
        }
    }

    #[test]
    fn test_custom_round_trip() {
        let registry = EventRegistry::new();
        registry.register_factory::<Citation>().unwrap();

        let event = Event::custom(EventMetadata::new(), Citation { title: "A".into() });
        let decoded = registry.decode(&event.to_json().unwrap()).unwrap();

        assert_eq!(decoded.event_type(), "citation");
        assert_eq!(decoded.custom_as::<Citation>().unwrap().title, "A");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = EventRegistry::new();
        registry.register_factory::<Citation>().unwrap();
        assert_eq!(
            registry.register_factory::<Citation>(),
            Err(EventError::DuplicateType("citation".into()))
        );
        assert!(registry
            .register_codec("partial", Arc::new(|_| Err(EventError::Decode("x".into()))))
            .is_err());
    }

    #[test]
    fn test_unknown_type_fails() {
        let registry = EventRegistry::new();
        let err = registry
            .decode(json!({"type": "mystery", "meta": {}}).to_string().as_bytes())
            .unwrap_err();
        assert_eq!(err, EventError::UnknownType("mystery".into()));
    }

    #[test]
    fn test_step_metadata_decodes() {
        let registry = EventRegistry::new();
        let raw = json!({
            "type": "final",
            "text": "done",
            "meta": {"message_id": "00000000-0000-0000-0000-000000000000"},
            "step": {"type": "chat", "step_id": "00000000-0000-0000-0000-000000000000"}
        });
        let event = registry.decode_value(raw).unwrap();
        assert_eq!(event.step.unwrap().step_type, "chat");
        assert!(matches!(event.payload, EventPayload::Final { ref text } if text == "done"));
    }
}
