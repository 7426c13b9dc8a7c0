use std::any::Any;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::broker::Metadata;

/// A message as seen by worker handlers: the decoded envelope plus broker
/// metadata and, when a client provider is configured, a provider API
/// client. Handlers borrow the event read-only.
pub struct Event {
    /// Source-control provider the webhook came from.
    pub provider: String,
    /// Provider-native event name (`pull_request`, `Push Hook`, ...).
    pub event_type: String,
    /// Topic this message was received on.
    pub topic: String,
    /// Broker metadata headers, including the `driver` stamp.
    pub metadata: Metadata,
    /// The raw message payload.
    pub payload: Bytes,
    /// The flattened payload view from the envelope.
    pub normalized: Map<String, Value>,
    /// Provider API client, when a client provider is configured.
    pub client: Option<Arc<dyn Any + Send + Sync>>,
}

impl Event {
    /// Downcast the attached client to a concrete type.
    pub fn client_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.client.clone().and_then(|c| c.downcast::<T>().ok())
    }
}
