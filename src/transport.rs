use crate::{Result, ShiftError, log_trace};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Delivery guarantee requested from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn from_level(level: u8) -> Result<Self> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(ShiftError::Config(format!("invalid QoS level {}", other))),
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// Stream of payloads published on one topic after the subscription was made.
pub struct Subscription {
    topic: String,
    receiver: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, receiver: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            topic: topic.into(),
            receiver,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> Result<String> {
        self.receiver
            .recv()
            .await
            .ok_or_else(|| ShiftError::Transport(format!("subscription to '{}' closed", self.topic)))
    }

    /// Next payload if one is already queued.
    pub fn try_recv(&mut self) -> Option<String> {
        self.receiver.try_recv().ok()
    }
}

/// Publish/subscribe messaging used for task replies and the suspend barrier.
#[async_trait]
pub trait Communicator: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str, qos: QoS) -> Result<()>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<Subscription>;

    /// Send a reply on the communicator's default outgoing topic.
    async fn send_message(&self, payload: &str) -> Result<()>;
}

/// Process-local broker. Every subscriber of a topic gets its own copy of each message.
pub struct InMemoryBroker {
    reply_topic: String,
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
    history: Mutex<Vec<(String, String)>>,
}

impl InMemoryBroker {
    pub fn new(reply_topic: &str) -> Self {
        Self {
            reply_topic: reply_topic.to_string(),
            topics: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn reply_topic(&self) -> &str {
        &self.reply_topic
    }

    /// Every `(topic, payload)` published so far, in order.
    pub fn history(&self) -> Vec<(String, String)> {
        self.history.lock().unwrap().clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<String> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl Communicator for InMemoryBroker {
    async fn publish(&self, topic: &str, payload: &str, qos: QoS) -> Result<()> {
        log_trace!("publish on '{}' (qos {}): {}", topic, qos.level(), payload);
        self.history
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string()));

        let mut topics = self.topics.lock().unwrap();
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|tx| tx.send(payload.to_string()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(topic, rx))
    }

    async fn send_message(&self, payload: &str) -> Result<()> {
        self.publish(&self.reply_topic, payload, QoS::ExactlyOnce)
            .await
    }
}
