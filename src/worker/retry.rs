use super::event::Event;

/// What to do with a message whose processing failed. `nack` returns the
/// message to the broker; `retry` asks for redelivery. Either flag set
/// means the message is nacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub nack: bool,
}

/// Strategy consulted on every processing failure. `event` is `None` when
/// the message never decoded.
pub trait RetryPolicy: Send + Sync {
    fn on_error(&self, event: Option<&Event>, error: &anyhow::Error) -> RetryDecision;
}

/// The default policy: nack without asking for redelivery.
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn on_error(&self, _event: Option<&Event>, _error: &anyhow::Error) -> RetryDecision {
        RetryDecision {
            retry: false,
            nack: true,
        }
    }
}
