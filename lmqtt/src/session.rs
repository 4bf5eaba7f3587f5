use std::num::NonZeroU16;
use std::sync::atomic::{AtomicU16, Ordering};

use async_trait::async_trait;

use crate::codec::types::QoS;
use crate::net::{timestamp_millis, ClientId, TimestampMillis};
use crate::types::{DashMap, PacketId, TopicFilter};
use crate::Result;

/// Per client state kept while the client is connected.
#[derive(Debug)]
pub struct Session {
    pub client_id: ClientId,
    pub clean: bool,
    pub connected_at: TimestampMillis,
    subscriptions: DashMap<TopicFilter, QoS>,
    next_packet_id: AtomicU16,
}

impl Session {
    pub fn new(client_id: ClientId, clean: bool) -> Self {
        Self {
            client_id,
            clean,
            connected_at: timestamp_millis(),
            subscriptions: DashMap::default(),
            next_packet_id: AtomicU16::new(0),
        }
    }

    #[inline]
    pub fn subscriptions(&self) -> Vec<(TopicFilter, QoS)> {
        self.subscriptions.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }

    #[inline]
    pub fn subscription_qos(&self, topic_filter: &str) -> Option<QoS> {
        self.subscriptions.get(topic_filter).map(|e| *e.value())
    }

    #[inline]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            client_id: self.client_id.clone(),
            clean: self.clean,
            connected_at: self.connected_at,
            subscriptions: self.subscriptions(),
        }
    }

    ///Allocates the next packet id, wrapping from 65535 back to 1.
    #[inline]
    pub fn next_packet_id(&self) -> PacketId {
        loop {
            let prev = self.next_packet_id.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = NonZeroU16::new(prev.wrapping_add(1)) {
                return id;
            }
        }
    }
}

/// Point in time copy of a [`Session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub client_id: ClientId,
    pub clean: bool,
    pub connected_at: TimestampMillis,
    pub subscriptions: Vec<(TopicFilter, QoS)>,
}

/// Client session storage.
#[async_trait]
pub trait SessionManager: Sync + Send {
    async fn add(&self, client_id: &ClientId, clean: bool) -> Result<()>;

    async fn get(&self, client_id: &str) -> Result<Option<SessionInfo>>;

    async fn exists(&self, client_id: &str) -> Result<bool>;

    async fn add_subscription(&self, client_id: &str, topic_filter: &TopicFilter, qos: QoS) -> Result<()>;

    async fn remove_subscription(&self, client_id: &str, topic_filter: &str) -> Result<()>;

    /// Granted QoS of a subscription, if the client has it.
    async fn subscription_qos(&self, client_id: &str, topic_filter: &str) -> Result<Option<QoS>>;

    async fn next_packet_id(&self, client_id: &str) -> Result<PacketId>;

    /// Removes the session. No-op if absent.
    async fn remove(&self, client_id: &str) -> Result<()>;

    async fn count(&self) -> usize;
}

/// The default session manager, keeps everything in process memory.
#[derive(Default)]
pub struct InMemorySessionManager {
    sessions: DashMap<ClientId, Session>,
    //packet ids for clients without a session, e.g. server side publishes racing a disconnect
    fallback_packet_id: AtomicU16,
}

impl InMemorySessionManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionManager for InMemorySessionManager {
    #[inline]
    async fn add(&self, client_id: &ClientId, clean: bool) -> Result<()> {
        self.sessions.insert(client_id.clone(), Session::new(client_id.clone(), clean));
        Ok(())
    }

    #[inline]
    async fn get(&self, client_id: &str) -> Result<Option<SessionInfo>> {
        Ok(self.sessions.get(client_id).map(|s| s.info()))
    }

    #[inline]
    async fn exists(&self, client_id: &str) -> Result<bool> {
        Ok(self.sessions.contains_key(client_id))
    }

    #[inline]
    async fn add_subscription(&self, client_id: &str, topic_filter: &TopicFilter, qos: QoS) -> Result<()> {
        if let Some(s) = self.sessions.get(client_id) {
            s.subscriptions.insert(topic_filter.clone(), qos);
        }
        Ok(())
    }

    #[inline]
    async fn remove_subscription(&self, client_id: &str, topic_filter: &str) -> Result<()> {
        if let Some(s) = self.sessions.get(client_id) {
            s.subscriptions.remove(topic_filter);
        }
        Ok(())
    }

    #[inline]
    async fn subscription_qos(&self, client_id: &str, topic_filter: &str) -> Result<Option<QoS>> {
        Ok(self.sessions.get(client_id).and_then(|s| s.subscription_qos(topic_filter)))
    }

    #[inline]
    async fn next_packet_id(&self, client_id: &str) -> Result<PacketId> {
        if let Some(s) = self.sessions.get(client_id) {
            return Ok(s.next_packet_id());
        }
        loop {
            let prev = self.fallback_packet_id.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = NonZeroU16::new(prev.wrapping_add(1)) {
                return Ok(id);
            }
        }
    }

    #[inline]
    async fn remove(&self, client_id: &str) -> Result<()> {
        self.sessions.remove(client_id);
        Ok(())
    }

    #[inline]
    async fn count(&self) -> usize {
        self.sessions.len()
    }
}
