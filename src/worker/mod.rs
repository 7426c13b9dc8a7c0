//! Worker runtime: subscribes to topics, decodes messages, dispatches to
//! handlers under a concurrency bound and an ack/nack/retry contract.

pub mod client;
pub mod codec;
pub mod event;
pub mod listener;
pub mod retry;

pub use client::{ClientProvider, GithubAppClientProvider, GithubClient};
pub use codec::{Codec, CodecError, JsonCodec};
pub use event::Event;
pub use listener::Listener;
pub use retry::{NoRetry, RetryDecision, RetryPolicy};

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::broker::{BrokerError, Delivery, Source, META_REQUEST_ID};

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A message handler. The token is cancelled on worker shutdown; long
/// handlers are expected to observe it.
pub type Handler = Arc<dyn Fn(CancellationToken, Arc<Event>) -> HandlerFuture + Send + Sync>;

/// Wraps a handler; the first-registered middleware is outermost.
pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Lift an async closure into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(CancellationToken, Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |token, event| Box::pin(f(token, event)))
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("at least one topic is required")]
    NoTopics,
    #[error(transparent)]
    Subscribe(#[from] BrokerError),
}

/// A message-processing worker. Configure with the builder-style methods,
/// register handlers, then [`Worker::run`].
pub struct Worker {
    subscriber: Arc<dyn Source>,
    concurrency: usize,
    topics: Vec<String>,
    allowed_topics: HashSet<String>,
    inner: Inner,
}

/// Per-message state shared by every processing task.
struct Inner {
    codec: Arc<dyn Codec>,
    retry: Arc<dyn RetryPolicy>,
    topic_handlers: HashMap<String, Handler>,
    type_handlers: HashMap<String, Handler>,
    middleware: Vec<Middleware>,
    client_provider: Option<Arc<dyn ClientProvider>>,
    listeners: Vec<Listener>,
}

impl Worker {
    pub fn new(subscriber: Arc<dyn Source>) -> Self {
        Self {
            subscriber,
            concurrency: 1,
            topics: Vec::new(),
            allowed_topics: HashSet::new(),
            inner: Inner {
                codec: Arc::new(JsonCodec),
                retry: Arc::new(NoRetry),
                topic_handlers: HashMap::new(),
                type_handlers: HashMap::new(),
                middleware: Vec::new(),
                client_provider: None,
                listeners: Vec::new(),
            },
        }
    }

    /// Topics to subscribe to. Handler registration is checked against
    /// this set when it is non-empty.
    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for topic in topics {
            let topic = topic.into();
            if topic.is_empty() {
                continue;
            }
            self.allowed_topics.insert(topic.clone());
            self.topics.push(topic);
        }
        self
    }

    /// Maximum concurrent handler invocations across all topics.
    pub fn with_concurrency(mut self, n: usize) -> Self {
        if n > 0 {
            self.concurrency = n;
        }
        self
    }

    pub fn with_codec(mut self, codec: impl Codec + 'static) -> Self {
        self.inner.codec = Arc::new(codec);
        self
    }

    pub fn with_retry(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.inner.retry = Arc::new(policy);
        self
    }

    pub fn with_middleware(mut self, middleware: Middleware) -> Self {
        self.inner.middleware.push(middleware);
        self
    }

    pub fn with_client_provider(mut self, provider: impl ClientProvider + 'static) -> Self {
        self.inner.client_provider = Some(Arc::new(provider));
        self
    }

    pub fn with_listener(mut self, listener: Listener) -> Self {
        self.inner.listeners.push(listener);
        self
    }

    /// Register a handler for one topic. Registration against a topic not
    /// in the subscribed set is logged and ignored.
    pub fn handle_topic(&mut self, topic: &str, handler: Handler) {
        if topic.is_empty() {
            return;
        }
        if !self.allowed_topics.is_empty() && !self.allowed_topics.contains(topic) {
            warn!(topic = %topic, "handler topic not subscribed, ignoring");
            return;
        }
        self.inner.topic_handlers.insert(topic.to_string(), handler);
        self.topics.push(topic.to_string());
    }

    /// Register a handler for an event type, used when no topic handler
    /// matches.
    pub fn handle_type(&mut self, event_type: &str, handler: Handler) {
        if event_type.is_empty() {
            return;
        }
        self.inner
            .type_handlers
            .insert(event_type.to_string(), handler);
    }

    /// Subscribe to every topic and process messages until the token is
    /// cancelled. After cancellation no new messages are pulled; in-flight
    /// processing runs to completion (with the cancelled token) before
    /// `run` returns. No deadline is imposed on handlers.
    pub async fn run(self, token: CancellationToken) -> Result<(), WorkerError> {
        if self.topics.is_empty() {
            return Err(WorkerError::NoTopics);
        }
        let topics = unique(&self.topics);
        let inner = Arc::new(self.inner);

        inner.notify_start();

        // child token: cancelled either by the parent or on a failed start
        let token = token.child_token();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let tracker = TaskTracker::new();

        for topic in topics {
            let mut stream = match self.subscriber.subscribe(token.clone(), &topic).await {
                Ok(stream) => stream,
                Err(e) => {
                    inner.notify_error(None, &anyhow::Error::msg(e.to_string()));
                    token.cancel();
                    tracker.close();
                    tracker.wait().await;
                    inner.notify_exit();
                    return Err(e.into());
                }
            };

            let token = token.clone();
            let semaphore = semaphore.clone();
            let inner = inner.clone();
            let processing = tracker.clone();
            tracker.spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        next = stream.recv() => {
                            let Some(delivery) = next else { break };
                            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                                break;
                            };
                            let inner = inner.clone();
                            let token = token.clone();
                            let topic = topic.clone();
                            processing.spawn(async move {
                                inner.handle_delivery(token, &topic, delivery).await;
                                drop(permit);
                            });
                        }
                    }
                }
            });
        }

        token.cancelled().await;
        tracker.close();
        tracker.wait().await;
        inner.notify_exit();
        Ok(())
    }

    /// Close the underlying subscriber.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.subscriber.close().await
    }
}

impl Inner {
    async fn handle_delivery(&self, token: CancellationToken, topic: &str, delivery: Delivery) {
        let mut event = match self.codec.decode(topic, &delivery) {
            Ok(event) => event,
            Err(e) => {
                let error = anyhow::Error::new(e);
                warn!(topic = %topic, error = %error, "decode failed");
                self.notify_error(None, &error);
                self.settle(delivery, None, &error).await;
                return;
            }
        };

        if let Some(provider) = &self.client_provider {
            match provider.client(&event).await {
                Ok(client) => event.client = Some(client),
                Err(error) => {
                    warn!(topic = %topic, error = %error, "client init failed");
                    self.notify_error(Some(&event), &error);
                    self.settle(delivery, Some(&event), &error).await;
                    return;
                }
            }
        }

        if let Some(request_id) = event.metadata.get(META_REQUEST_ID) {
            if !request_id.is_empty() {
                info!(
                    request_id = %request_id,
                    topic = %event.topic,
                    provider = %event.provider,
                    event_type = %event.event_type,
                    "processing message"
                );
            }
        }

        self.notify_message_start(&event);

        let handler = self
            .topic_handlers
            .get(topic)
            .or_else(|| self.type_handlers.get(&event.event_type))
            .cloned();
        let Some(handler) = handler else {
            warn!(topic = %topic, event_type = %event.event_type, "no handler registered");
            self.notify_message_finish(&event, None);
            delivery.ack().await;
            return;
        };

        let wrapped = self.wrap(handler);
        let event = Arc::new(event);
        match wrapped(token, event.clone()).await {
            Ok(()) => {
                self.notify_message_finish(&event, None);
                delivery.ack().await;
            }
            Err(error) => {
                self.notify_message_finish(&event, Some(&error));
                self.notify_error(Some(&event), &error);
                self.settle(delivery, Some(&event), &error).await;
            }
        }
    }

    /// Consult the retry policy and ack or nack accordingly.
    async fn settle(&self, delivery: Delivery, event: Option<&Event>, error: &anyhow::Error) {
        let decision = self.retry.on_error(event, error);
        if decision.retry || decision.nack {
            delivery.nack().await;
        } else {
            delivery.ack().await;
        }
    }

    fn wrap(&self, handler: Handler) -> Handler {
        let mut wrapped = handler;
        for middleware in self.middleware.iter().rev() {
            wrapped = middleware(wrapped);
        }
        wrapped
    }

    fn notify_start(&self) {
        for listener in &self.listeners {
            if let Some(hook) = &listener.on_start {
                hook();
            }
        }
    }

    fn notify_exit(&self) {
        for listener in &self.listeners {
            if let Some(hook) = &listener.on_exit {
                hook();
            }
        }
    }

    fn notify_message_start(&self, event: &Event) {
        for listener in &self.listeners {
            if let Some(hook) = &listener.on_message_start {
                hook(event);
            }
        }
    }

    fn notify_message_finish(&self, event: &Event, error: Option<&anyhow::Error>) {
        for listener in &self.listeners {
            if let Some(hook) = &listener.on_message_finish {
                hook(event, error);
            }
        }
    }

    fn notify_error(&self, event: Option<&Event>, error: &anyhow::Error) {
        for listener in &self.listeners {
            if let Some(hook) = &listener.on_error {
                hook(event, error);
            }
        }
    }
}

fn unique(values: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .iter()
        .filter(|v| seen.insert(v.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{channel::ChannelBroker, Message, Sink};
    use crate::config::ChannelConfig;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn broker() -> ChannelBroker {
        ChannelBroker::new(&ChannelConfig::default())
    }

    fn envelope(provider: &str, name: &str) -> Message {
        Message::new(Bytes::from(format!(
            r#"{{"provider":"{provider}","name":"{name}","data":{{}}}}"#
        )))
    }

    async fn run_worker(worker: Worker, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            worker.run(token).await.unwrap();
        })
    }

    #[tokio::test]
    async fn dispatches_to_topic_handler_and_acks() {
        let bus = broker();
        let handled = Arc::new(AtomicUsize::new(0));

        let mut worker =
            Worker::new(Arc::new(bus.clone()) as Arc<dyn Source>).with_topics(["pr.opened"]);
        let counter = handled.clone();
        worker.handle_topic(
            "pr.opened",
            handler_fn(move |_token, _event| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let token = CancellationToken::new();
        let handle = run_worker(worker, token.clone()).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish("pr.opened", envelope("github", "pull_request"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(handled.load(Ordering::SeqCst), 1);
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn type_handler_is_the_fallback() {
        let bus = broker();
        let by_type = Arc::new(AtomicUsize::new(0));

        let mut worker = Worker::new(Arc::new(bus.clone()) as Arc<dyn Source>)
            .with_topics(["events"]);
        let counter = by_type.clone();
        worker.handle_type(
            "push",
            handler_fn(move |_token, event| {
                let counter = counter.clone();
                assert_eq!(event.provider, "github");
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let token = CancellationToken::new();
        let handle = run_worker(worker, token.clone()).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish("events", envelope("github", "push")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(by_type.load(Ordering::SeqCst), 1);
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn concurrency_stays_bounded() {
        let bus = broker();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut worker = Worker::new(Arc::new(bus.clone()) as Arc<dyn Source>)
            .with_topics(["load"])
            .with_concurrency(2);
        let in_flight_h = in_flight.clone();
        let peak_h = peak.clone();
        worker.handle_topic(
            "load",
            handler_fn(move |_token, _event| {
                let in_flight = in_flight_h.clone();
                let peak = peak_h.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let token = CancellationToken::new();
        let handle = run_worker(worker, token.clone()).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        for _ in 0..6 {
            bus.publish("load", envelope("github", "push")).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(peak.load(Ordering::SeqCst) <= 2, "more than 2 handlers ran at once");
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn failed_handler_nacks_then_redelivery_succeeds() {
        // first attempt: {retry: true, nack: true}; second: neither → ack
        struct OnceRetry {
            attempts: AtomicUsize,
        }
        impl RetryPolicy for OnceRetry {
            fn on_error(&self, _event: Option<&Event>, _error: &anyhow::Error) -> RetryDecision {
                if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    RetryDecision { retry: true, nack: true }
                } else {
                    RetryDecision { retry: false, nack: false }
                }
            }
        }

        let bus = broker();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut worker = Worker::new(Arc::new(bus.clone()) as Arc<dyn Source>)
            .with_topics(["flaky"])
            .with_retry(OnceRetry {
                attempts: AtomicUsize::new(0),
            });
        let calls_h = calls.clone();
        worker.handle_topic(
            "flaky",
            handler_fn(move |_token, _event| {
                let calls = calls_h.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("transient failure")
                }
            }),
        );

        let token = CancellationToken::new();
        let handle = run_worker(worker, token.clone()).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish("flaky", envelope("github", "push")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // nacked once, redelivered, handled a second time, then dropped
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn middleware_order_is_first_registered_outermost() {
        let bus = broker();
        let order = Arc::new(Mutex::new(Vec::new()));

        fn tag(order: Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> Middleware {
            Arc::new(move |next: Handler| {
                let order = order.clone();
                handler_fn(move |token, event| {
                    let order = order.clone();
                    let next = next.clone();
                    async move {
                        order.lock().unwrap().push(label);
                        next(token, event).await
                    }
                })
            })
        }

        let mut worker = Worker::new(Arc::new(bus.clone()) as Arc<dyn Source>)
            .with_topics(["mw"])
            .with_middleware(tag(order.clone(), "outer"))
            .with_middleware(tag(order.clone(), "inner"));
        let order_h = order.clone();
        worker.handle_topic(
            "mw",
            handler_fn(move |_token, _event| {
                let order = order_h.clone();
                async move {
                    order.lock().unwrap().push("handler");
                    Ok(())
                }
            }),
        );

        let token = CancellationToken::new();
        let handle = run_worker(worker, token.clone()).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish("mw", envelope("github", "push")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*order.lock().unwrap(), vec!["outer", "inner", "handler"]);
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn listeners_see_the_message_lifecycle() {
        let bus = broker();
        let events = Arc::new(Mutex::new(Vec::new()));

        fn record(events: &Arc<Mutex<Vec<String>>>, label: &str) {
            events.lock().unwrap().push(label.to_string());
        }

        let ev = events.clone();
        let ev2 = events.clone();
        let ev3 = events.clone();
        let ev4 = events.clone();
        let listener = Listener {
            on_start: Some(Arc::new(move || record(&ev, "start"))),
            on_exit: Some(Arc::new(move || record(&ev2, "exit"))),
            on_message_start: Some(Arc::new(move |_e| record(&ev3, "msg-start"))),
            on_message_finish: Some(Arc::new(move |_e, err| {
                record(&ev4, if err.is_none() { "msg-ok" } else { "msg-err" })
            })),
            on_error: None,
        };

        let mut worker = Worker::new(Arc::new(bus.clone()) as Arc<dyn Source>)
            .with_topics(["lc"])
            .with_listener(listener);
        worker.handle_topic("lc", handler_fn(|_token, _event| async { Ok(()) }));

        let token = CancellationToken::new();
        let handle = run_worker(worker, token.clone()).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish("lc", envelope("github", "push")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec!["start", "msg-start", "msg-ok", "exit"]
        );
    }

    #[tokio::test]
    async fn unregistered_topic_handler_is_ignored() {
        let bus = broker();
        let mut worker =
            Worker::new(Arc::new(bus) as Arc<dyn Source>).with_topics(["subscribed"]);
        worker.handle_topic("not-subscribed", handler_fn(|_t, _e| async { Ok(()) }));
        assert!(!worker.inner.topic_handlers.contains_key("not-subscribed"));
    }

    #[tokio::test]
    async fn no_topics_is_an_error() {
        let worker = Worker::new(Arc::new(broker()) as Arc<dyn Source>);
        assert!(matches!(
            worker.run(CancellationToken::new()).await,
            Err(WorkerError::NoTopics)
        ));
    }
}
