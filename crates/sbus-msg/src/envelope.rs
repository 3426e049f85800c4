//! ---
//! sbus_section: "02-messaging-ipc-data-model"
//! sbus_subsection: "module"
//! sbus_type: "source"
//! sbus_scope: "code"
//! sbus_description: "Envelope model, action dispatch, and wire transports."
//! sbus_version: "v0.0.0-prealpha"
//! sbus_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::{BusError, Result};

/// Well-known metadata keys. Values are integer milliseconds since the epoch.
pub mod metadata_keys {
    /// Stamped when an envelope leaves the node.
    pub const SENT: &str = "timestamp_servidor_msg_enviada";
    /// Stamped when an envelope is decoded on arrival.
    pub const RECEIVED: &str = "timestamp_servidor_msg_recebida";
    /// Stamped by query handlers before calling out to a gateway.
    pub const PROCESSING_STARTED: &str = "timestamp_servidor_processamento_inicio";
}

/// Prefix of the action carried by reply envelopes.
pub const REPLY_ACTION_PREFIX: &str = "RESULTADO_";

/// Failure reading a typed field out of [`Content`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentError {
    /// Field absent from the content map.
    #[error("missing content field `{0}`")]
    MissingField(String),
    /// Field present with an unexpected JSON type.
    #[error("content field `{field}` is not {expected}")]
    TypeMismatch {
        /// Field name.
        field: String,
        /// Expected JSON type.
        expected: &'static str,
    },
}

/// Open key/value payload of an envelope. Keys serialize in sorted order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Content(Map<String, JsonValue>);

impl Content {
    /// Empty content map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Raw value lookup.
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Borrow the underlying map.
    pub fn as_map(&self) -> &Map<String, JsonValue> {
        &self.0
    }

    /// Number of top-level keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// String field.
    pub fn str_field(&self, key: &str) -> std::result::Result<&str, ContentError> {
        match self.0.get(key) {
            None => Err(ContentError::MissingField(key.to_owned())),
            Some(JsonValue::String(value)) => Ok(value),
            Some(_) => Err(ContentError::TypeMismatch {
                field: key.to_owned(),
                expected: "a string",
            }),
        }
    }

    /// First string field present among `keys`; the error names the first key.
    pub fn first_str_field(&self, keys: &[&str]) -> std::result::Result<&str, ContentError> {
        for key in keys {
            if self.contains(key) {
                return self.str_field(key);
            }
        }
        Err(ContentError::MissingField(
            keys.first().copied().unwrap_or_default().to_owned(),
        ))
    }

    /// Numeric field. Numeric strings such as `"10.5"` are accepted.
    pub fn f64_field(&self, key: &str) -> std::result::Result<f64, ContentError> {
        let mismatch = || ContentError::TypeMismatch {
            field: key.to_owned(),
            expected: "a number",
        };
        match self.0.get(key) {
            None => Err(ContentError::MissingField(key.to_owned())),
            Some(JsonValue::Number(number)) => number.as_f64().ok_or_else(mismatch),
            Some(JsonValue::String(text)) => text.trim().parse::<f64>().map_err(|_| mismatch()),
            Some(_) => Err(mismatch()),
        }
    }

    /// Nested object field.
    pub fn object_field(
        &self,
        key: &str,
    ) -> std::result::Result<&Map<String, JsonValue>, ContentError> {
        match self.0.get(key) {
            None => Err(ContentError::MissingField(key.to_owned())),
            Some(JsonValue::Object(map)) => Ok(map),
            Some(_) => Err(ContentError::TypeMismatch {
                field: key.to_owned(),
                expected: "an object",
            }),
        }
    }

    /// Pretty-printed JSON rendering.
    pub fn to_pretty_string(&self) -> String {
        serde_json::to_string_pretty(&self.0).unwrap_or_else(|_| "{}".to_owned())
    }
}

impl From<Map<String, JsonValue>> for Content {
    fn from(map: Map<String, JsonValue>) -> Self {
        Self(map)
    }
}

/// Observability-only map of timestamps. Keys are only ever added.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, JsonValue>);

impl Metadata {
    /// Raw value lookup.
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    /// Timestamp lookup in epoch milliseconds.
    pub fn timestamp(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(JsonValue::as_i64)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no entries exist.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn insert_if_absent(&mut self, key: &str, value: JsonValue) {
        self.0.entry(key.to_owned()).or_insert(value);
    }
}

/// Structured message exchanged between bus participants.
///
/// Fields are fixed at construction; only metadata grows afterwards, and only
/// through the consuming `with_*` methods so a shared instance is never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(alias = "acao")]
    action: String,
    #[serde(alias = "origem", default)]
    origin: String,
    #[serde(alias = "destino", default)]
    destination: String,
    #[serde(alias = "conteudo", default, deserialize_with = "null_as_default")]
    content: Content,
    #[serde(default, deserialize_with = "null_as_default")]
    metadata: Metadata,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Envelope {
    /// Build an envelope. Fails when `action` is blank.
    pub fn new(
        action: impl Into<String>,
        origin: impl Into<String>,
        destination: impl Into<String>,
        content: Content,
    ) -> Result<Self> {
        let envelope = Self {
            action: action.into(),
            origin: origin.into(),
            destination: destination.into(),
            content,
            metadata: Metadata::default(),
        };
        envelope.check_action()?;
        Ok(envelope)
    }

    /// Decode wire text.
    pub fn from_json(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|err| BusError::MalformedEnvelope(err.to_string()))?;
        envelope.check_action()?;
        Ok(envelope)
    }

    /// Decode wire bytes, which must be UTF-8.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|err| BusError::MalformedEnvelope(format!("payload is not utf-8: {err}")))?;
        Self::from_json(text)
    }

    /// Encode to wire text. Output is stable for equal envelopes.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|err| BusError::MalformedEnvelope(err.to_string()))
    }

    fn check_action(&self) -> Result<()> {
        if self.action.trim().is_empty() {
            return Err(BusError::MalformedEnvelope(
                "missing field `action`".to_owned(),
            ));
        }
        Ok(())
    }

    /// Action tag.
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Sender address.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Recipient address.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Payload map.
    pub fn content(&self) -> &Content {
        &self.content
    }

    /// Observability map.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Add a metadata entry unless the key already exists.
    pub fn with_metadata(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.metadata.insert_if_absent(key, value.into());
        self
    }

    /// Stamp the current wall-clock time under `key` unless already stamped.
    pub fn with_timestamp(self, key: &str) -> Self {
        self.with_metadata(key, sbus_common::epoch_millis())
    }

    /// Reply addressed back to the sender, carrying `RESULTADO_<action>` and this
    /// envelope's metadata.
    pub fn reply(&self, content: Content) -> Envelope {
        Envelope {
            action: format!("{REPLY_ACTION_PREFIX}{}", self.action),
            origin: self.destination.clone(),
            destination: self.origin.clone(),
            content,
            metadata: self.metadata.clone(),
        }
    }
}
