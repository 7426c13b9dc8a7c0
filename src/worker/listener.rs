use std::sync::Arc;

use super::event::Event;

/// Lifecycle hooks for observability: logging, metrics, tracing spans.
/// Every field is optional; listeners run synchronously in worker tasks.
#[derive(Clone, Default)]
pub struct Listener {
    /// Fired once when the worker starts.
    pub on_start: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Fired once after in-flight processing has drained.
    pub on_exit: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Fired for each message after decode and client injection.
    pub on_message_start: Option<Arc<dyn Fn(&Event) + Send + Sync>>,
    /// Fired after handler completion; the error is the handler's failure,
    /// if any.
    pub on_message_finish: Option<Arc<dyn Fn(&Event, Option<&anyhow::Error>) + Send + Sync>>,
    /// Fired for every error: decode, client init, handler.
    pub on_error: Option<Arc<dyn Fn(Option<&Event>, &anyhow::Error) + Send + Sync>>,
}
