//! In-process event bus delivering lifecycle envelopes.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::domain::StateChange;

/// Future returned by a [`StateChangeHandler`]
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Handler invoked for each envelope published on a subscribed topic
pub type StateChangeHandler = Arc<dyn Fn(StateChange) -> HandlerFuture + Send + Sync>;

/// Topic based publish/subscribe
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn subscribe(&self, topic: &str, handler: StateChangeHandler) -> Result<()>;

    /// Deliver an envelope to its topic's handlers; returns how many ran
    async fn publish(&self, envelope: StateChange) -> Result<usize>;
}

/// Bus where handlers run on the publisher's task, in subscription order
#[derive(Default)]
pub struct LocalBus {
    topics: RwLock<HashMap<String, Vec<StateChangeHandler>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.read().await.keys().cloned().collect();
        topics.sort();
        topics
    }
}

#[async_trait]
impl EventBus for LocalBus {
    async fn subscribe(&self, topic: &str, handler: StateChangeHandler) -> Result<()> {
        if topic.is_empty() {
            anyhow::bail!("Topic name cannot be empty");
        }

        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(handler);
        debug!(topic, "Subscribed");
        Ok(())
    }

    async fn publish(&self, envelope: StateChange) -> Result<usize> {
        if envelope.topic.is_empty() {
            anyhow::bail!("Topic name cannot be empty");
        }

        // Clone out so handlers can subscribe or publish themselves
        let handlers = self
            .topics
            .read()
            .await
            .get(&envelope.topic)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!(topic = %envelope.topic, "No subscribers, envelope dropped");
            return Ok(0);
        }

        for handler in &handlers {
            if let Err(e) = handler(envelope.clone()).await {
                warn!(topic = %envelope.topic, error = %format!("{:#}", e), "Handler failed");
            }
        }

        Ok(handlers.len())
    }
}
