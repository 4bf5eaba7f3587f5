use async_trait::async_trait;

use crate::net::ClientId;
use crate::topic::is_match;
use crate::types::{DashMap, Message, TopicName};
use crate::Result;

/// Storage for will messages (keyed by client id) and retained messages (keyed by topic).
#[async_trait]
pub trait MessageStore: Sync + Send {
    async fn add_will_message(&self, client_id: &ClientId, message: Message) -> Result<()>;

    async fn get_will_message(&self, client_id: &str) -> Result<Option<Message>>;

    /// Idempotent.
    async fn clear_will_message(&self, client_id: &str) -> Result<()>;

    /// Stores `message` as the retained message of its topic. An empty payload deletes it.
    async fn add_retain_message(&self, message: Message) -> Result<()>;

    async fn clear_retain_message(&self, topic: &str) -> Result<()>;

    /// Retained messages whose topic matches `topic_filter`.
    async fn get_retain_messages(&self, topic_filter: &str) -> Result<Vec<Message>>;
}

#[derive(Default)]
pub struct InMemoryMessageStore {
    wills: DashMap<ClientId, Message>,
    retains: DashMap<TopicName, Message>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn will_count(&self) -> usize {
        self.wills.len()
    }

    #[inline]
    pub fn retain_count(&self) -> usize {
        self.retains.len()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    #[inline]
    async fn add_will_message(&self, client_id: &ClientId, message: Message) -> Result<()> {
        self.wills.insert(client_id.clone(), message);
        Ok(())
    }

    #[inline]
    async fn get_will_message(&self, client_id: &str) -> Result<Option<Message>> {
        Ok(self.wills.get(client_id).map(|m| m.value().clone()))
    }

    #[inline]
    async fn clear_will_message(&self, client_id: &str) -> Result<()> {
        self.wills.remove(client_id);
        Ok(())
    }

    #[inline]
    async fn add_retain_message(&self, message: Message) -> Result<()> {
        if message.payload.is_empty() {
            self.retains.remove(&message.topic);
        } else {
            self.retains.insert(message.topic.clone(), message);
        }
        Ok(())
    }

    #[inline]
    async fn clear_retain_message(&self, topic: &str) -> Result<()> {
        self.retains.remove(topic);
        Ok(())
    }

    async fn get_retain_messages(&self, topic_filter: &str) -> Result<Vec<Message>> {
        Ok(self
            .retains
            .iter()
            .filter(|entry| is_match(topic_filter, entry.key()))
            .map(|entry| entry.value().clone())
            .collect())
    }
}
