//! In-process topic hub backing the SQLite store's notifications. One
//! broadcast channel per topic; publishing to a topic nobody subscribed to
//! is a no-op, matching the fire-and-forget contract.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use capstan_core::error::{EngineError, EngineResult};
use capstan_core::listener::ChangeListener;

const TOPIC_BUFFER: usize = 64;

#[derive(Clone, Default)]
pub struct NotifyHub {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<M>(&self, topic: &str) -> HubListener<M> {
        let mut topics = self.topics.lock().expect("topic registry poisoned");
        let sender = topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(TOPIC_BUFFER).0);
        HubListener {
            receiver: sender.subscribe(),
            _message: PhantomData,
        }
    }

    pub fn publish(&self, topic: &str, payload: &str) {
        let topics = self.topics.lock().expect("topic registry poisoned");
        if let Some(sender) = topics.get(topic) {
            let _ = sender.send(payload.to_owned());
        }
    }

    pub fn publish_all(&self, notes: impl IntoIterator<Item = (String, String)>) {
        for (topic, payload) in notes {
            self.publish(&topic, &payload);
        }
    }
}

/// Subscription to one hub topic, parsing payloads into the message type on
/// receipt.
pub struct HubListener<M> {
    receiver: broadcast::Receiver<String>,
    _message: PhantomData<M>,
}

#[async_trait]
impl<M> ChangeListener for HubListener<M>
where
    M: for<'a> From<&'a str> + Send,
{
    type Message = M;

    async fn recv(&mut self) -> EngineResult<Self::Message> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => return Ok(M::from(payload.as_str())),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "notification listener lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EngineError::ListenerClosed)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use capstan_core::listener::JobsNotification;

    use super::*;

    #[tokio::test]
    async fn published_payloads_reach_subscribers() {
        let hub = NotifyHub::new();
        let mut listener = hub.subscribe::<JobsNotification>("jobs");
        hub.publish("jobs", "17");
        assert_eq!(listener.recv().await.unwrap(), JobsNotification::Settle(17.into()));
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_a_no_op() {
        let hub = NotifyHub::new();
        hub.publish("nobody_home", "payload");
    }
}
