use serde::Deserialize;
use serde_json::{Map, Value};

use super::event::Event;
use crate::broker::{Delivery, META_EVENT, META_PROVIDER};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid envelope: {0}")]
    Envelope(String),
}

/// Decodes broker messages into worker [`Event`]s.
pub trait Codec: Send + Sync {
    fn decode(&self, topic: &str, delivery: &Delivery) -> Result<Event, CodecError>;
}

/// Envelope fields on the wire: `{provider, name, data}`.
#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    data: Option<Map<String, Value>>,
}

/// The default codec: JSON envelope, with the `provider` / `event`
/// metadata headers as fallback when the envelope omits those fields.
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn decode(&self, topic: &str, delivery: &Delivery) -> Result<Event, CodecError> {
        let envelope: Envelope = serde_json::from_slice(&delivery.message.payload)
            .map_err(|e| CodecError::Envelope(e.to_string()))?;

        let metadata = delivery.message.metadata.clone();
        let provider = envelope
            .provider
            .filter(|p| !p.is_empty())
            .or_else(|| metadata.get(META_PROVIDER).cloned())
            .unwrap_or_default();
        let event_type = envelope
            .name
            .filter(|n| !n.is_empty())
            .or_else(|| metadata.get(META_EVENT).cloned())
            .unwrap_or_default();

        Ok(Event {
            provider,
            event_type,
            topic: topic.to_string(),
            metadata,
            payload: delivery.message.payload.clone(),
            normalized: envelope.data.unwrap_or_default(),
            client: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Message;
    use bytes::Bytes;

    fn delivery(payload: &str) -> Delivery {
        Delivery::unsettled(Message::new(Bytes::from(payload.to_string())))
    }

    #[test]
    fn decodes_the_envelope() {
        let codec = JsonCodec;
        let delivery =
            delivery(r#"{"provider":"github","name":"push","data":{"ref":"refs/heads/main"}}"#);
        let event = codec.decode("branch.push", &delivery).unwrap();
        assert_eq!(event.provider, "github");
        assert_eq!(event.event_type, "push");
        assert_eq!(event.topic, "branch.push");
        assert_eq!(event.normalized["ref"], "refs/heads/main");
    }

    #[test]
    fn missing_fields_fall_back_to_metadata() {
        let codec = JsonCodec;
        let message = Message::new(Bytes::from_static(b"{}"))
            .with_metadata(META_PROVIDER, "gitlab")
            .with_metadata(META_EVENT, "Push Hook");
        let event = codec
            .decode("t", &Delivery::unsettled(message))
            .unwrap();
        assert_eq!(event.provider, "gitlab");
        assert_eq!(event.event_type, "Push Hook");
        assert!(event.normalized.is_empty());
    }

    #[test]
    fn garbage_payload_is_an_error() {
        let codec = JsonCodec;
        assert!(codec.decode("t", &delivery("not json")).is_err());
    }
}
