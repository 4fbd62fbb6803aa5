//! Envelope classification

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::events::{tags, RawEnvelope, RawEvent};

/// Turn a raw envelope into a `RawEvent`. Never fails: unknown tags become
/// `Unclassified`, bad payloads become `Malformed`.
pub fn classify(envelope: RawEnvelope) -> RawEvent {
    let RawEnvelope { kind, data } = envelope;

    // Marker events are allowed to carry no payload at all
    let data = if data.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        data
    };

    match kind.as_str() {
        tags::MESSAGE_DELTA => parse(kind, data, RawEvent::MessageDelta),
        tags::MESSAGE => parse(kind, data, RawEvent::Message),
        tags::REASONING_DELTA => parse(kind, data, RawEvent::ReasoningDelta),
        tags::REASONING => parse(kind, data, RawEvent::Reasoning),
        tags::TURN_START => parse(kind, data, RawEvent::TurnStart),
        tags::TURN_END => parse(kind, data, RawEvent::TurnEnd),
        tags::USAGE => parse(kind, data, RawEvent::Usage),
        tags::USAGE_INFO => parse(kind, data, RawEvent::UsageInfo),
        tags::SESSION_IDLE => RawEvent::SessionIdle,
        tags::SESSION_ERROR => parse(kind, data, RawEvent::SessionError),
        tags::TOOL_START => parse(kind, data, RawEvent::ToolStart),
        tags::TOOL_PROGRESS => parse(kind, data, RawEvent::ToolProgress),
        tags::TOOL_COMPLETE => parse(kind, data, RawEvent::ToolComplete),
        tags::FILE_CHANGED => parse(kind, data, RawEvent::FileChanged),
        _ => RawEvent::Unclassified { kind },
    }
}

fn parse<T: DeserializeOwned>(kind: String, data: Value, wrap: fn(T) -> RawEvent) -> RawEvent {
    match serde_json::from_value::<T>(data) {
        Ok(payload) => wrap(payload),
        Err(e) => RawEvent::Malformed {
            kind,
            reason: e.to_string(),
        },
    }
}
