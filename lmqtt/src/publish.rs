use async_trait::async_trait;

use crate::codec::types::Publish;
use crate::net::ClientId;
use crate::types::{DashMap, Message, PacketId};

/// In-flight QoS 1/2 bookkeeping.
///
/// Outbound publishes stay pending until PUBACK (QoS 1) or PUBCOMP (QoS 2); inbound QoS 2
/// messages are held as pending releases until the client sends PUBREL.
#[async_trait]
pub trait PublishManager: Sync + Send {
    async fn add_pending_publish(&self, client_id: &ClientId, packet_id: PacketId, publish: Publish);

    async fn get_pending_publish(&self, client_id: &str, packet_id: PacketId) -> Option<Publish>;

    async fn remove_pending_publish(&self, client_id: &str, packet_id: PacketId) -> Option<Publish>;

    async fn add_pending_release(&self, client_id: &ClientId, packet_id: PacketId, message: Message);

    async fn remove_pending_release(&self, client_id: &str, packet_id: PacketId) -> Option<Message>;

    /// Drops everything held for the client.
    async fn remove(&self, client_id: &str);
}

#[derive(Default)]
pub struct DefaultPublishManager {
    pending_publishes: DashMap<ClientId, DashMap<PacketId, Publish>>,
    pending_releases: DashMap<ClientId, DashMap<PacketId, Message>>,
}

impl DefaultPublishManager {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn pending_publish_count(&self, client_id: &str) -> usize {
        self.pending_publishes.get(client_id).map(|m| m.len()).unwrap_or_default()
    }

    #[inline]
    pub fn pending_release_count(&self, client_id: &str) -> usize {
        self.pending_releases.get(client_id).map(|m| m.len()).unwrap_or_default()
    }
}

#[async_trait]
impl PublishManager for DefaultPublishManager {
    #[inline]
    async fn add_pending_publish(&self, client_id: &ClientId, packet_id: PacketId, publish: Publish) {
        self.pending_publishes.entry(client_id.clone()).or_default().insert(packet_id, publish);
    }

    #[inline]
    async fn get_pending_publish(&self, client_id: &str, packet_id: PacketId) -> Option<Publish> {
        self.pending_publishes.get(client_id).and_then(|m| m.get(&packet_id).map(|p| p.value().clone()))
    }

    #[inline]
    async fn remove_pending_publish(&self, client_id: &str, packet_id: PacketId) -> Option<Publish> {
        self.pending_publishes.get(client_id).and_then(|m| m.remove(&packet_id).map(|(_, p)| p))
    }

    #[inline]
    async fn add_pending_release(&self, client_id: &ClientId, packet_id: PacketId, message: Message) {
        self.pending_releases.entry(client_id.clone()).or_default().insert(packet_id, message);
    }

    #[inline]
    async fn remove_pending_release(&self, client_id: &str, packet_id: PacketId) -> Option<Message> {
        self.pending_releases.get(client_id).and_then(|m| m.remove(&packet_id).map(|(_, m)| m))
    }

    #[inline]
    async fn remove(&self, client_id: &str) {
        self.pending_publishes.remove(client_id);
        self.pending_releases.remove(client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::types::QoS;

    #[tokio::test]
    async fn pending_bookkeeping() {
        let pm = DefaultPublishManager::new();
        let cid = ClientId::from("dev-01");
        let pid = PacketId::new(7).unwrap();
        let msg = Message::new("a/b", "x", QoS::ExactlyOnce);

        pm.add_pending_publish(&cid, pid, msg.to_publish(QoS::AtLeastOnce, Some(pid), false)).await;
        assert_eq!(pm.pending_publish_count("dev-01"), 1);
        assert!(pm.get_pending_publish("dev-01", pid).await.is_some());
        assert!(pm.remove_pending_publish("dev-01", pid).await.is_some());
        assert!(pm.remove_pending_publish("dev-01", pid).await.is_none());

        pm.add_pending_release(&cid, pid, msg.clone()).await;
        assert_eq!(pm.pending_release_count("dev-01"), 1);
        pm.remove("dev-01").await;
        assert!(pm.remove_pending_release("dev-01", pid).await.is_none());
    }
}
