//! In-process channel broker.
//!
//! The default driver: topics live in memory, publish fans out to every
//! current subscriber, nack redelivers. Buses are named so the gateway and
//! an embedded worker constructed from the same config share topics, while
//! tests get isolation by picking their own bus (or [`ChannelBroker::new`]).

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{Acker, BrokerError, Delivery, Message, Sink, Source};
use crate::config::ChannelConfig;

static BUSES: LazyLock<StdMutex<HashMap<String, ChannelBroker>>> =
    LazyLock::new(Default::default);

#[derive(Clone)]
pub struct ChannelBroker {
    inner: std::sync::Arc<Inner>,
}

struct Inner {
    buffer: usize,
    persistent: bool,
    topics: Mutex<HashMap<String, TopicState>>,
}

#[derive(Default)]
struct TopicState {
    subscribers: Vec<mpsc::Sender<Delivery>>,
    /// Messages published before the first subscriber arrived
    /// (`persistent` only).
    retained: Vec<Message>,
}

impl ChannelBroker {
    /// An isolated broker instance.
    pub fn new(cfg: &ChannelConfig) -> Self {
        Self {
            inner: std::sync::Arc::new(Inner {
                buffer: cfg.output_buffer.max(1),
                persistent: cfg.persistent,
                topics: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The process-wide bus named in the config; created on first use with
    /// that config's settings.
    pub fn shared(cfg: &ChannelConfig) -> Self {
        let mut buses = BUSES.lock().unwrap_or_else(|e| e.into_inner());
        buses
            .entry(cfg.bus.clone())
            .or_insert_with(|| ChannelBroker::new(cfg))
            .clone()
    }

    async fn deliver(&self, topic: &str, message: Message) -> Result<(), BrokerError> {
        let senders = {
            let mut topics = self.inner.topics.lock().await;
            let state = topics.entry(topic.to_string()).or_default();
            state.subscribers.retain(|tx| !tx.is_closed());
            if state.subscribers.is_empty() {
                if self.inner.persistent {
                    state.retained.push(message);
                }
                return Ok(());
            }
            state.subscribers.clone()
        };

        for tx in senders {
            let delivery = Delivery::new(
                message.clone(),
                Acker::Channel(ChannelAcker {
                    broker: self.clone(),
                    topic: topic.to_string(),
                    message: message.clone(),
                }),
            );
            // a send error only means the subscriber went away mid-publish
            let _ = tx.send(delivery).await;
        }
        Ok(())
    }

    async fn remove_subscriber(&self, topic: &str, tx: &mpsc::Sender<Delivery>) {
        let mut topics = self.inner.topics.lock().await;
        if let Some(state) = topics.get_mut(topic) {
            state.subscribers.retain(|s| !s.same_channel(tx));
        }
    }
}

#[async_trait]
impl Sink for ChannelBroker {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BrokerError> {
        self.deliver(topic, message).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut topics = self.inner.topics.lock().await;
        topics.clear();
        Ok(())
    }
}

#[async_trait]
impl Source for ChannelBroker {
    async fn subscribe(
        &self,
        token: CancellationToken,
        topic: &str,
    ) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
        let (tx, rx) = mpsc::channel(self.inner.buffer);

        let retained = {
            let mut topics = self.inner.topics.lock().await;
            let state = topics.entry(topic.to_string()).or_default();
            state.subscribers.push(tx.clone());
            std::mem::take(&mut state.retained)
        };

        for message in retained {
            let delivery = Delivery::new(
                message.clone(),
                Acker::Channel(ChannelAcker {
                    broker: self.clone(),
                    topic: topic.to_string(),
                    message,
                }),
            );
            let _ = tx.send(delivery).await;
        }

        let broker = self.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            token.cancelled().await;
            broker.remove_subscriber(&topic, &tx).await;
        });

        Ok(rx)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Sink::close(self).await
    }
}

/// Settles one channel delivery; nack puts the message back on the topic.
pub(crate) struct ChannelAcker {
    broker: ChannelBroker,
    topic: String,
    message: Message,
}

impl ChannelAcker {
    pub(crate) async fn ack(self) {}

    pub(crate) async fn nack(self) {
        let _ = self.broker.deliver(&self.topic, self.message).await;
    }
}

impl std::fmt::Debug for ChannelBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelBroker")
            .field("buffer", &self.inner.buffer)
            .field("persistent", &self.inner.persistent)
            .finish()
    }
}
