use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use shared::protocol::{ClientEnvelope, ServerEvent};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::{
    lock,
    transport::{Channel, ChannelFactory},
};

struct TopicEntry {
    channel: Arc<dyn Channel>,
    consumers: usize,
}

struct Registry {
    factory: Arc<dyn ChannelFactory>,
    topics: Mutex<HashMap<String, TopicEntry>>,
}

impl Registry {
    /// Returns the channel when the departing consumer was the last one.
    fn detach(&self, topic: &str) -> Option<Arc<dyn Channel>> {
        let mut topics = lock(&self.topics);
        let entry = topics.get_mut(topic)?;
        entry.consumers = entry.consumers.saturating_sub(1);
        if entry.consumers == 0 {
            return topics.remove(topic).map(|entry| entry.channel);
        }
        None
    }
}

/// Reference-counted channel registry. Consumers attach to a topic and hold a
/// [`ChannelHandle`]; the channel is created on first attach and left only
/// when the last handle drops, so no consumer can tear a channel down under
/// another.
pub struct ConnectionLifecycleManager {
    registry: Arc<Registry>,
}

impl ConnectionLifecycleManager {
    pub fn new(factory: Arc<dyn ChannelFactory>) -> Self {
        Self {
            registry: Arc::new(Registry {
                factory,
                topics: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn attach(&self, topic: &str) -> ChannelHandle {
        let channel = {
            let mut topics = lock(&self.registry.topics);
            let entry = topics.entry(topic.to_string()).or_insert_with(|| {
                debug!(topic = %topic, "lifecycle: creating channel");
                TopicEntry {
                    channel: self.registry.factory.create(topic),
                    consumers: 0,
                }
            });
            entry.consumers += 1;
            Arc::clone(&entry.channel)
        };
        ChannelHandle {
            topic: topic.to_string(),
            channel,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Consumers currently attached to `topic`.
    pub fn consumer_count(&self, topic: &str) -> usize {
        lock(&self.registry.topics)
            .get(topic)
            .map(|entry| entry.consumers)
            .unwrap_or(0)
    }
}

/// One consumer's attachment to a topic-scoped channel.
pub struct ChannelHandle {
    topic: String,
    channel: Arc<dyn Channel>,
    registry: Arc<Registry>,
}

impl ChannelHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn connect(&self) -> Result<()> {
        self.channel.connect().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.channel.subscribe()
    }

    pub async fn publish(&self, envelope: &ClientEnvelope) -> Result<()> {
        self.channel.publish(envelope).await
    }

    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.channel.connectivity()
    }
}

impl Clone for ChannelHandle {
    fn clone(&self) -> Self {
        if let Some(entry) = lock(&self.registry.topics).get_mut(&self.topic) {
            entry.consumers += 1;
        }
        Self {
            topic: self.topic.clone(),
            channel: Arc::clone(&self.channel),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        if let Some(channel) = self.registry.detach(&self.topic) {
            info!(topic = %self.topic, "lifecycle: last consumer detached, leaving channel");
            // Drop cannot await; the leave runs on the runtime if one exists.
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { channel.leave().await });
            }
        }
    }
}
