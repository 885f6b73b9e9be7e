// Typed key registry
//
// Turn metadata, Turn data and Block metadata are open-ended maps keyed by
// versioned identifiers of the form `namespace/name@vN`. A `Key` carries the
// value type in its signature, so callers go through `get`/`set` instead of
// touching raw string keys. Each map family has its own marker type; a data
// key cannot be used against block metadata.
//
// Unknown keys (written by newer versions or third parties) stay in the map
// as opaque JSON and survive serialization round trips.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::KeyError;
use crate::events::Usage;

/// Namespace used by the keys this crate defines
pub const NAMESPACE: &str = "turnloop";

// ============================================================================
// Map families
// ============================================================================

/// Marker for request-scoped Turn data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataFamily;

/// Marker for Turn metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TurnMetaFamily;

/// Marker for Block metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockMetaFamily;

/// Heterogeneous map of versioned keys to JSON values
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyMap<F> {
    entries: BTreeMap<String, Value>,
    #[serde(skip)]
    _family: PhantomData<F>,
}

/// Turn.Data
pub type Data = KeyMap<DataFamily>;
/// Turn.Metadata
pub type TurnMetadata = KeyMap<TurnMetaFamily>;
/// Block.Metadata
pub type BlockMetadata = KeyMap<BlockMetaFamily>;

impl<F> KeyMap<F> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            _family: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw access by key id, for keys this crate does not know about
    pub fn get_raw(&self, id: &str) -> Option<&Value> {
        self.entries.get(id)
    }

    pub fn insert_raw(&mut self, id: impl Into<String>, value: Value) -> Option<Value> {
        self.entries.insert(id.into(), value)
    }

    pub fn remove_raw(&mut self, id: &str) -> Option<Value> {
        self.entries.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }
}

// ============================================================================
// Key
// ============================================================================

/// A typed, versioned key for one map family
pub struct Key<F, T> {
    namespace: &'static str,
    name: &'static str,
    version: u32,
    _marker: PhantomData<fn() -> (F, T)>,
}

pub type DataKey<T> = Key<DataFamily, T>;
pub type TurnMetaKey<T> = Key<TurnMetaFamily, T>;
pub type BlockMetaKey<T> = Key<BlockMetaFamily, T>;

impl<F, T> Clone for Key<F, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<F, T> Copy for Key<F, T> {}

impl<F, T> fmt::Debug for Key<F, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.id())
    }
}

impl<F, T> Key<F, T> {
    pub const fn new(namespace: &'static str, name: &'static str, version: u32) -> Self {
        Self {
            namespace,
            name,
            version,
            _marker: PhantomData,
        }
    }

    /// The versioned identifier, e.g. `turnloop/session_id@v1`
    pub fn id(&self) -> String {
        format!("{}/{}@v{}", self.namespace, self.name, self.version)
    }

    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn delete(&self, map: &mut KeyMap<F>) -> Option<Value> {
        map.remove_raw(&self.id())
    }

    pub fn is_set(&self, map: &KeyMap<F>) -> bool {
        map.contains(&self.id())
    }
}

impl<F, T: DeserializeOwned> Key<F, T> {
    /// Read the value. `Ok(None)` when absent, `Err` when the stored value
    /// does not decode as `T`.
    pub fn get(&self, map: &KeyMap<F>) -> Result<Option<T>, KeyError> {
        let Some(raw) = map.get_raw(&self.id()) else {
            return Ok(None);
        };
        serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|e| KeyError::TypeMismatch {
                key: self.id(),
                reason: e.to_string(),
            })
    }
}

impl<F, T: Serialize> Key<F, T> {
    /// Store the value, rejecting values that do not encode as JSON
    pub fn set(&self, map: &mut KeyMap<F>, value: &T) -> Result<(), KeyError> {
        let raw = serde_json::to_value(value).map_err(|e| KeyError::NotSerializable {
            key: self.id(),
            reason: e.to_string(),
        })?;
        map.insert_raw(self.id(), raw);
        Ok(())
    }
}

/// Split a key id into `(namespace, name, version)`
pub fn parse_key_id(id: &str) -> Option<(&str, &str, u32)> {
    let (path, version) = id.rsplit_once("@v")?;
    let (namespace, name) = path.split_once('/')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some((namespace, name, version.parse().ok()?))
}

// ============================================================================
// Known keys
// ============================================================================

pub const SESSION_ID: TurnMetaKey<String> = Key::new(NAMESPACE, "session_id", 1);
pub const INFERENCE_ID: TurnMetaKey<String> = Key::new(NAMESPACE, "inference_id", 1);
pub const TRACE_ID: TurnMetaKey<String> = Key::new(NAMESPACE, "trace_id", 1);
pub const USAGE: TurnMetaKey<Usage> = Key::new(NAMESPACE, "usage", 1);
pub const STOP_REASON: TurnMetaKey<String> = Key::new(NAMESPACE, "stop_reason", 1);
pub const MODEL: TurnMetaKey<String> = Key::new(NAMESPACE, "model", 1);
pub const PROVIDER: TurnMetaKey<String> = Key::new(NAMESPACE, "provider", 1);
pub const RUNTIME: TurnMetaKey<Value> = Key::new(NAMESPACE, "runtime", 1);

/// Which middleware produced or last rewrote a block
pub const MIDDLEWARE: BlockMetaKey<String> = Key::new(NAMESPACE, "middleware", 1);
/// Provider-native payload kept alongside the normalized block
pub const ORIGINAL_CONTENT: BlockMetaKey<Value> = Key::new(NAMESPACE, "original_content", 1);

pub const AGENT_MODE: DataKey<String> = Key::new(NAMESPACE, "agent_mode", 1);
pub const ALLOWED_TOOLS: DataKey<Vec<String>> = Key::new(NAMESPACE, "allowed_tools", 1);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_id_format() {
        assert_eq!(SESSION_ID.id(), "turnloop/session_id@v1");
        assert_eq!(
            parse_key_id("turnloop/session_id@v1"),
            Some(("turnloop", "session_id", 1))
        );
        assert_eq!(parse_key_id("no-version"), None);
        assert_eq!(parse_key_id("/x@v1"), None);
    }

    #[test]
    fn test_get_missing_is_none() {
        let meta = TurnMetadata::new();
        assert_eq!(SESSION_ID.get(&meta).unwrap(), None);
    }

    #[test]
    fn test_set_then_get() {
        let mut data = Data::new();
        ALLOWED_TOOLS
            .set(&mut data, &vec!["echo".to_string()])
            .unwrap();
        assert_eq!(
            ALLOWED_TOOLS.get(&data).unwrap(),
            Some(vec!["echo".to_string()])
        );
    }

    #[test]
    fn test_type_mismatch_is_error() {
        let mut meta = TurnMetadata::new();
        meta.insert_raw(SESSION_ID.id(), json!({"not": "a string"}));
        let err = SESSION_ID.get(&meta).unwrap_err();
        assert!(matches!(err, KeyError::TypeMismatch { .. }));
    }

    #[test]
    fn test_unknown_keys_survive_round_trip() {
        let mut meta = BlockMetadata::new();
        meta.insert_raw("vendor/extra@v2", json!([1, 2, 3]));
        MIDDLEWARE.set(&mut meta, &"systemprompt".to_string()).unwrap();

        let encoded = serde_json::to_string(&meta).unwrap();
        let decoded: BlockMetadata = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(decoded.get_raw("vendor/extra@v2"), Some(&json!([1, 2, 3])));
    }

    #[test]
    fn test_delete() {
        let mut meta = TurnMetadata::new();
        MODEL.set(&mut meta, &"gpt".to_string()).unwrap();
        assert!(MODEL.is_set(&meta));
        MODEL.delete(&mut meta);
        assert!(!MODEL.is_set(&meta));
    }
}
