//! Inbound frame parsing.
//!
//! A frame is a JSON object with a string `type`. An optional `topic` must
//! match the socket it arrived on. The payload is `data` when present,
//! otherwise the remaining fields.

use serde_json::{Map, Value};
use tracing::debug;

use vesper_core::events::RealtimeEvent;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejected {
    NotJson,
    NotAnObject,
    MissingType,
    WrongTopic(String),
}

pub fn parse_envelope(topic: &str, text: &str) -> Result<RealtimeEvent, Rejected> {
    let value: Value = serde_json::from_str(text).map_err(|_| Rejected::NotJson)?;
    let Value::Object(mut fields) = value else {
        return Err(Rejected::NotAnObject);
    };

    let kind = match fields.remove("type") {
        Some(Value::String(kind)) if !kind.is_empty() => kind,
        _ => return Err(Rejected::MissingType),
    };

    if let Some(Value::String(other)) = fields.remove("topic") {
        if other != topic {
            return Err(Rejected::WrongTopic(other));
        }
    }

    let data = fields
        .remove("data")
        .unwrap_or_else(|| rest_or_null(fields));

    Ok(RealtimeEvent::Message {
        topic: topic.to_string(),
        kind,
        data,
    })
}

/// Parse, logging and discarding anything malformed.
pub fn parse_or_drop(topic: &str, text: &str) -> Option<RealtimeEvent> {
    match parse_envelope(topic, text) {
        Ok(event) => Some(event),
        Err(reason) => {
            debug!(topic, ?reason, len = text.len(), "dropping malformed frame");
            None
        }
    }
}

fn rest_or_null(fields: Map<String, Value>) -> Value {
    if fields.is_empty() {
        Value::Null
    } else {
        Value::Object(fields)
    }
}
