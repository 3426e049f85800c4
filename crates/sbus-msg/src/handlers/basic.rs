//! ---
//! sbus_section: "02-messaging-ipc-data-model"
//! sbus_subsection: "module"
//! sbus_type: "source"
//! sbus_scope: "code"
//! sbus_description: "Envelope model, action dispatch, and wire transports."
//! sbus_version: "v0.0.0-prealpha"
//! sbus_owner: "tbd"
//! ---
use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::{Handler, HandlerError, HandlerOutcome};
use crate::envelope::Envelope;

const RESULT_KEYS: [&str; 2] = ["resultado", "result"];

/// Renders the content as pretty JSON prefixed with the sender.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn process(&self, envelope: &Envelope) -> Result<HandlerOutcome, HandlerError> {
        Ok(HandlerOutcome::text(format!(
            "Message received from '{}'. Content:\n{}",
            envelope.origin(),
            envelope.content().to_pretty_string()
        )))
    }
}

/// Catch-all for actions without a dedicated handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

#[async_trait]
impl Handler for DefaultHandler {
    async fn process(&self, envelope: &Envelope) -> Result<HandlerOutcome, HandlerError> {
        let content = envelope.content();
        let result = RESULT_KEYS
            .iter()
            .find_map(|key| content.get(key))
            .map(render_value)
            .unwrap_or_else(|| format!("Action {} has no handler defined.", envelope.action()));
        Ok(HandlerOutcome::text(result))
    }
}

/// Strings verbatim, everything else as compact JSON.
pub(crate) fn render_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    }
}
