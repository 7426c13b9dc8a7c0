use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::flatten::flatten;

/// Canonical record for a single verified webhook delivery.
///
/// `raw_payload` is the signature-verified original body and is never
/// mutated after construction; `raw_object` and `data` are derived from it.
/// Only `provider`, `name` and `data` go on the wire; the request and
/// state ids travel as broker metadata headers.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub provider: String,
    pub name: String,
    #[serde(skip)]
    pub request_id: String,
    #[serde(skip)]
    pub state_id: Option<String>,
    #[serde(skip)]
    pub raw_payload: Bytes,
    #[serde(skip)]
    pub raw_object: Option<Value>,
    pub data: Map<String, Value>,
}

impl Event {
    /// Build the canonical event from a verified payload.
    ///
    /// A non-object JSON root keeps its decoded form in `raw_object` but
    /// flattens to an empty map; a body that is not JSON at all leaves
    /// `raw_object` unset.
    pub fn from_payload(
        provider: impl Into<String>,
        name: impl Into<String>,
        request_id: impl Into<String>,
        raw_payload: Bytes,
    ) -> Self {
        let (raw_object, data) = decode_and_flatten(&raw_payload);
        Self {
            provider: provider.into(),
            name: name.into(),
            request_id: request_id.into(),
            state_id: None,
            raw_payload,
            raw_object,
            data,
        }
    }
}

fn decode_and_flatten(raw: &[u8]) -> (Option<Value>, Map<String, Value>) {
    let Ok(decoded) = serde_json::from_slice::<Value>(raw) else {
        return (None, Map::new());
    };
    let data = match &decoded {
        Value::Object(map) => flatten(map),
        _ => Map::new(),
    };
    (Some(decoded), data)
}

/// Resolves the opaque tenant/account identifier for an event from a
/// persistent store. The gateway core only carries the result; lookups are
/// an embedder concern.
#[async_trait]
pub trait StateResolver: Send + Sync {
    async fn resolve(&self, provider: &str, raw_payload: &[u8]) -> Option<String>;
}

/// Default resolver: no tenant store, every event gets an empty state id.
pub struct NoStateResolver;

#[async_trait]
impl StateResolver for NoStateResolver {
    async fn resolve(&self, _provider: &str, _raw_payload: &[u8]) -> Option<String> {
        None
    }
}
