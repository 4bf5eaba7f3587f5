use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;

use crate::codec::types::QoS;
use crate::codec::v3;
use crate::net::{ClientId, Connections};
use crate::publish::PublishManager;
use crate::session::SessionManager;
use crate::store::MessageStore;
use crate::subscribe::{Subscriber, SubscriptionManager};
use crate::types::Message;
use crate::Result;

/// Publishes a message to its subscribers.
#[async_trait]
pub trait MessageDispatcher: Sync + Send {
    /// Returns `true` if at least one subscriber was reached, or the message was retained.
    async fn send(&self, message: Message) -> Result<bool>;
}

pub struct DefaultMessageDispatcher {
    connections: Connections,
    session_manager: Arc<dyn SessionManager>,
    sub_manager: Arc<dyn SubscriptionManager>,
    publish_manager: Arc<dyn PublishManager>,
    message_store: Arc<dyn MessageStore>,
}

impl DefaultMessageDispatcher {
    pub fn new(
        connections: Connections,
        session_manager: Arc<dyn SessionManager>,
        sub_manager: Arc<dyn SubscriptionManager>,
        publish_manager: Arc<dyn PublishManager>,
        message_store: Arc<dyn MessageStore>,
    ) -> Self {
        Self { connections, session_manager, sub_manager, publish_manager, message_store }
    }

    /// Delivers `message` to one client at `qos`, allocating a packet id for QoS 1/2.
    pub(crate) async fn deliver(&self, client_id: &ClientId, message: &Message, qos: QoS, retain: bool) -> Result<bool> {
        let Some(ctx) = self.connections.get_by_client_id(client_id) else {
            log::debug!("{} is not connected, {} dropped", client_id, message.topic);
            return Ok(false);
        };

        let packet_id = match qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce | QoS::ExactlyOnce => Some(self.session_manager.next_packet_id(client_id).await?),
        };
        let publish = message.to_publish(qos, packet_id, retain);
        if let Some(packet_id) = packet_id {
            self.publish_manager.add_pending_publish(client_id, packet_id, publish.clone()).await;
        }

        match ctx.send(v3::Packet::Publish(Box::new(publish))) {
            Ok(()) => Ok(true),
            Err(e) => {
                log::debug!("{} send publish error, {}", client_id, e);
                if let Some(packet_id) = packet_id {
                    self.publish_manager.remove_pending_publish(client_id, packet_id).await;
                }
                Ok(false)
            }
        }
    }
}

///One target per client, at the highest QoS among its matching subscriptions.
fn dedup_by_client(subscribers: Vec<Subscriber>) -> Vec<(ClientId, QoS)> {
    subscribers
        .into_iter()
        .into_grouping_map_by(|s| s.client_id.clone())
        .fold(QoS::AtMostOnce, |acc, _client_id, s| acc.max(s.qos))
        .into_iter()
        .collect()
}

#[async_trait]
impl MessageDispatcher for DefaultMessageDispatcher {
    async fn send(&self, message: Message) -> Result<bool> {
        let retained = if message.retain {
            self.message_store.add_retain_message(message.clone()).await?;
            true
        } else {
            false
        };

        let targets = dedup_by_client(self.sub_manager.search(&message.topic).await?);
        let mut delivered = 0;
        for (client_id, granted_qos) in targets {
            let qos = message.qos.less_value(granted_qos);
            match self.deliver(&client_id, &message, qos, false).await {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(e) => log::warn!("{} deliver {} error, {:?}", client_id, message.topic, e),
            }
        }
        log::debug!("{} dispatched to {} subscribers, retained: {}", message.topic, delivered, retained);
        Ok(delivered > 0 || retained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{Command, ConnectionContext, Packet};
    use crate::publish::DefaultPublishManager;
    use crate::session::InMemorySessionManager;
    use crate::store::InMemoryMessageStore;
    use crate::session::SessionInfo;
    use crate::subscribe::DefaultSubscriptionManager;
    use crate::types::{PacketId, TopicFilter};

    ///Fails packet id allocation for one client, delegates everything else.
    struct PacketIdsExhausted {
        inner: Arc<InMemorySessionManager>,
        client_id: &'static str,
    }

    #[async_trait]
    impl SessionManager for PacketIdsExhausted {
        async fn add(&self, client_id: &ClientId, clean: bool) -> Result<()> {
            self.inner.add(client_id, clean).await
        }
        async fn get(&self, client_id: &str) -> Result<Option<SessionInfo>> {
            self.inner.get(client_id).await
        }
        async fn exists(&self, client_id: &str) -> Result<bool> {
            self.inner.exists(client_id).await
        }
        async fn add_subscription(&self, client_id: &str, topic_filter: &TopicFilter, qos: QoS) -> Result<()> {
            self.inner.add_subscription(client_id, topic_filter, qos).await
        }
        async fn remove_subscription(&self, client_id: &str, topic_filter: &str) -> Result<()> {
            self.inner.remove_subscription(client_id, topic_filter).await
        }
        async fn subscription_qos(&self, client_id: &str, topic_filter: &str) -> Result<Option<QoS>> {
            self.inner.subscription_qos(client_id, topic_filter).await
        }
        async fn next_packet_id(&self, client_id: &str) -> Result<PacketId> {
            if client_id == self.client_id {
                return Err(anyhow::anyhow!("{} has no free packet id", client_id));
            }
            self.inner.next_packet_id(client_id).await
        }
        async fn remove(&self, client_id: &str) -> Result<()> {
            self.inner.remove(client_id).await
        }
        async fn count(&self) -> usize {
            self.inner.count().await
        }
    }

    struct Fixture {
        connections: Connections,
        sessions: Arc<InMemorySessionManager>,
        subs: Arc<DefaultSubscriptionManager>,
        publishes: Arc<DefaultPublishManager>,
        store: Arc<InMemoryMessageStore>,
        dispatcher: DefaultMessageDispatcher,
    }

    fn fixture() -> Fixture {
        let connections = Connections::new();
        let sessions = Arc::new(InMemorySessionManager::new());
        let subs = Arc::new(DefaultSubscriptionManager::new());
        let publishes = Arc::new(DefaultPublishManager::new());
        let store = Arc::new(InMemoryMessageStore::new());
        let dispatcher = DefaultMessageDispatcher::new(
            connections.clone(),
            sessions.clone(),
            subs.clone(),
            publishes.clone(),
            store.clone(),
        );
        Fixture { connections, sessions, subs, publishes, store, dispatcher }
    }

    async fn online(f: &Fixture, client_id: &str) -> crate::net::CommandReceiver {
        let (ctx, rx) = ConnectionContext::new(f.connections.next_id(), "127.0.0.1:1".parse().unwrap(), "test");
        ctx.set_client_id(client_id.into());
        f.connections.add(ctx.clone());
        f.connections.bind(client_id.into(), ctx);
        f.sessions.add(&client_id.into(), true).await.unwrap();
        rx
    }

    fn next_publish(rx: &mut crate::net::CommandReceiver) -> Option<crate::codec::types::Publish> {
        match rx.try_recv() {
            Ok(Command::Send(Packet::Mqtt(v3::Packet::Publish(p)))) => Some(*p),
            _ => None,
        }
    }

    #[tokio::test]
    async fn fan_out_dedups_and_downgrades_qos() {
        let f = fixture();
        let mut rx_a = online(&f, "a").await;
        let mut rx_b = online(&f, "b").await;
        f.subs.subscribe(&"a".into(), &"status/+".into(), QoS::AtMostOnce).await.unwrap();
        f.subs.subscribe(&"a".into(), &"status/#".into(), QoS::AtLeastOnce).await.unwrap();
        f.subs.subscribe(&"b".into(), &"status/dev-01".into(), QoS::AtMostOnce).await.unwrap();

        let sent = f.dispatcher.send(Message::new("status/dev-01", "offline", QoS::ExactlyOnce)).await.unwrap();
        assert!(sent);

        let p = next_publish(&mut rx_a).unwrap();
        assert_eq!(p.qos, QoS::AtLeastOnce);
        assert!(p.packet_id.is_some());
        assert!(next_publish(&mut rx_a).is_none());
        assert_eq!(f.publishes.pending_publish_count("a"), 1);

        let p = next_publish(&mut rx_b).unwrap();
        assert_eq!(p.qos, QoS::AtMostOnce);
        assert!(p.packet_id.is_none());
        assert_eq!(f.publishes.pending_publish_count("b"), 0);
    }

    #[tokio::test]
    async fn no_subscribers_and_retained() {
        let f = fixture();
        assert!(!f.dispatcher.send(Message::new("nobody/here", "x", QoS::AtMostOnce)).await.unwrap());

        //offline subscriber is skipped
        f.subs.subscribe(&"gone".into(), &"a/b".into(), QoS::AtMostOnce).await.unwrap();
        assert!(!f.dispatcher.send(Message::new("a/b", "x", QoS::AtMostOnce)).await.unwrap());

        assert!(f.dispatcher.send(Message::new("a/b", "x", QoS::AtMostOnce).retain(true)).await.unwrap());
        assert_eq!(f.store.retain_count(), 1);
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_stop_fan_out() {
        let mut f = fixture();
        f.dispatcher = DefaultMessageDispatcher::new(
            f.connections.clone(),
            Arc::new(PacketIdsExhausted { inner: f.sessions.clone(), client_id: "a" }),
            f.subs.clone(),
            f.publishes.clone(),
            f.store.clone(),
        );
        let mut receivers = Vec::new();
        for client_id in ["a", "b", "c", "d"] {
            receivers.push(online(&f, client_id).await);
            f.subs.subscribe(&client_id.into(), &"x".into(), QoS::AtLeastOnce).await.unwrap();
        }

        assert!(f.dispatcher.send(Message::new("x", "hello", QoS::AtLeastOnce)).await.unwrap());

        assert!(next_publish(&mut receivers[0]).is_none());
        assert_eq!(f.publishes.pending_publish_count("a"), 0);
        for (rx, client_id) in receivers.iter_mut().skip(1).zip(["b", "c", "d"]) {
            let p = next_publish(rx).unwrap();
            assert_eq!(p.qos, QoS::AtLeastOnce);
            assert_eq!(f.publishes.pending_publish_count(client_id), 1);
        }
    }
}
