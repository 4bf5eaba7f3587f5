use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bytestring::ByteString;
use uuid::Uuid;

use crate::auth::AuthHandler;
use crate::codec::types::{Publish, QoS, MQTT_LEVEL_31, MQTT_LEVEL_311};
use crate::codec::v3::{Connect, ConnectAck, ConnectAckReason, Packet, SubscribeReturnCode};
use crate::dispatcher::MessageDispatcher;
use crate::event::ConnectStatusListener;
use crate::executor::TaskExecutor;
use crate::net::{ClientId, ConnectionContext, Connections, MqttError};
use crate::publish::PublishManager;
use crate::session::SessionManager;
use crate::store::MessageStore;
use crate::subscribe::SubscriptionManager;
use crate::topic::{validate_topic_filter, validate_topic_name};
use crate::types::{Message, TopicFilter};
use crate::Result;

/// How long a new CONNECT waits for the previous connection with the same client id to close.
pub const DEFAULT_EVICT_TIMEOUT: Duration = Duration::from_secs(5);

#[inline]
fn packet_name(packet: &Packet) -> &'static str {
    match packet {
        Packet::Connect(_) => "CONNECT",
        Packet::ConnectAck(_) => "CONNACK",
        Packet::Publish(_) => "PUBLISH",
        Packet::PublishAck { .. } => "PUBACK",
        Packet::PublishReceived { .. } => "PUBREC",
        Packet::PublishRelease { .. } => "PUBREL",
        Packet::PublishComplete { .. } => "PUBCOMP",
        Packet::Subscribe { .. } => "SUBSCRIBE",
        Packet::SubscribeAck { .. } => "SUBACK",
        Packet::Unsubscribe { .. } => "UNSUBSCRIBE",
        Packet::UnsubscribeAck { .. } => "UNSUBACK",
        Packet::PingRequest => "PINGREQ",
        Packet::PingResponse => "PINGRESP",
        Packet::Disconnect => "DISCONNECT",
    }
}

/// MQTT 3.1 / 3.1.1 protocol processing for one packet at a time.
pub struct DefaultMqttServerProcessor {
    connections: Connections,
    session_manager: Arc<dyn SessionManager>,
    auth_handler: Arc<dyn AuthHandler>,
    sub_manager: Arc<dyn SubscriptionManager>,
    publish_manager: Arc<dyn PublishManager>,
    message_store: Arc<dyn MessageStore>,
    dispatcher: Arc<dyn MessageDispatcher>,
    connect_status_listener: Arc<dyn ConnectStatusListener>,
    executor: Arc<TaskExecutor>,
    evict_timeout: Duration,
}

impl DefaultMqttServerProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connections: Connections,
        session_manager: Arc<dyn SessionManager>,
        auth_handler: Arc<dyn AuthHandler>,
        sub_manager: Arc<dyn SubscriptionManager>,
        publish_manager: Arc<dyn PublishManager>,
        message_store: Arc<dyn MessageStore>,
        dispatcher: Arc<dyn MessageDispatcher>,
        connect_status_listener: Arc<dyn ConnectStatusListener>,
        executor: Arc<TaskExecutor>,
    ) -> Self {
        Self {
            connections,
            session_manager,
            auth_handler,
            sub_manager,
            publish_manager,
            message_store,
            dispatcher,
            connect_status_listener,
            executor,
            evict_timeout: DEFAULT_EVICT_TIMEOUT,
        }
    }

    #[inline]
    pub fn evict_timeout(mut self, evict_timeout: Duration) -> Self {
        self.evict_timeout = evict_timeout;
        self
    }

    /// Processes one decoded packet. An error closes the connection.
    pub async fn process(&self, ctx: &ConnectionContext, packet: Packet) -> Result<()> {
        let packet = match packet {
            Packet::Connect(connect) => {
                if let Some(client_id) = ctx.client_id() {
                    return Err(anyhow!("{} sent a second CONNECT", client_id));
                }
                return self.process_connect(ctx, *connect).await;
            }
            other => other,
        };
        let Some(client_id) = ctx.client_id() else {
            return Err(MqttError::NotConnected(packet_name(&packet)).into());
        };

        match packet {
            Packet::Publish(publish) => self.process_publish(ctx, &client_id, *publish).await,
            Packet::PublishAck { packet_id } => {
                self.publish_manager.remove_pending_publish(&client_id, packet_id).await;
                Ok(())
            }
            Packet::PublishReceived { packet_id } => ctx.send(Packet::PublishRelease { packet_id }),
            Packet::PublishRelease { packet_id } => {
                if let Some(message) = self.publish_manager.remove_pending_release(&client_id, packet_id).await {
                    self.dispatch(message).await;
                }
                ctx.send(Packet::PublishComplete { packet_id })
            }
            Packet::PublishComplete { packet_id } => {
                self.publish_manager.remove_pending_publish(&client_id, packet_id).await;
                Ok(())
            }
            Packet::Subscribe { packet_id, topic_filters } => {
                self.process_subscribe(ctx, &client_id, packet_id, topic_filters).await
            }
            Packet::Unsubscribe { packet_id, topic_filters } => {
                for topic_filter in topic_filters.iter() {
                    self.sub_manager.unsubscribe(&client_id, topic_filter).await?;
                    self.session_manager.remove_subscription(&client_id, topic_filter).await?;
                }
                ctx.send(Packet::UnsubscribeAck { packet_id })
            }
            Packet::PingRequest => ctx.send(Packet::PingResponse),
            Packet::Disconnect => {
                ctx.set_graceful_disconnect(true);
                ctx.close("disconnect");
                Ok(())
            }
            other => Err(anyhow!("{} unexpected {} from client", client_id, packet_name(&other))),
        }
    }

    #[inline]
    fn refuse(&self, ctx: &ConnectionContext, reason: ConnectAckReason) -> Result<()> {
        log::info!("{} Connection Refused, reason: {}", ctx.remote_addr(), reason.reason());
        ctx.send(Packet::ConnectAck(ConnectAck { return_code: reason, session_present: false }))?;
        ctx.close(reason.reason());
        Ok(())
    }

    async fn process_connect(&self, ctx: &ConnectionContext, connect: Connect) -> Result<()> {
        let level = connect.protocol.level();
        if level != MQTT_LEVEL_31 && level != MQTT_LEVEL_311 {
            return self.refuse(ctx, ConnectAckReason::UnacceptableProtocolVersion);
        }

        let client_id = if connect.client_id.is_empty() {
            if !connect.clean_session {
                return self.refuse(ctx, ConnectAckReason::IdentifierRejected);
            }
            ClientId::from(Uuid::new_v4().as_simple().to_string())
        } else {
            connect.client_id.clone()
        };

        match self
            .auth_handler
            .authenticate(ctx, &client_id, connect.username.as_ref(), connect.password.as_ref())
            .await
        {
            Ok(true) => {}
            Ok(false) => return self.refuse(ctx, ConnectAckReason::BadUserNameOrPassword),
            Err(e) => {
                log::warn!("{} authenticate error, {:?}", client_id, e);
                return self.refuse(ctx, ConnectAckReason::ServiceUnavailable);
            }
        }

        ctx.update_state(|s| {
            s.client_id = Some(client_id.clone());
            s.username = connect.username.clone();
        });

        if let Some(prev) = self.connections.bind(client_id.clone(), ctx.clone()) {
            log::info!("{} kicked, previous connection from {}", client_id, prev.remote_addr());
            prev.close("kicked");
            if tokio::time::timeout(self.evict_timeout, prev.closed()).await.is_err() {
                log::warn!(
                    "{} previous connection did not close in {:?}, refusing {}",
                    client_id,
                    self.evict_timeout,
                    ctx.remote_addr()
                );
                //nothing of this client may be released when the refused connection closes
                self.connections.unbind(&client_id, ctx);
                ctx.update_state(|s| {
                    s.client_id = None;
                    s.username = None;
                });
                return self.refuse(ctx, ConnectAckReason::ServiceUnavailable);
            }
        }

        self.session_manager.add(&client_id, connect.clean_session).await?;
        match &connect.last_will {
            Some(last_will) => {
                let will = Message::from_last_will(last_will, &client_id, connect.username.as_ref());
                self.message_store.add_will_message(&client_id, will).await?;
            }
            None => self.message_store.clear_will_message(&client_id).await?,
        }

        ctx.send(Packet::ConnectAck(ConnectAck {
            return_code: ConnectAckReason::ConnectionAccepted,
            session_present: false,
        }))?;

        let listener = self.connect_status_listener.clone();
        let (ctx1, username) = (ctx.clone(), connect.username.clone());
        let cid = client_id.clone();
        if let Err(e) = self
            .executor
            .execute("online", async move {
                listener.online(&ctx1, &cid, username.as_ref()).await;
            })
            .await
        {
            log::warn!("{} online notification not scheduled, {}", client_id, e);
        }
        Ok(())
    }

    async fn process_publish(&self, ctx: &ConnectionContext, client_id: &ClientId, publish: Publish) -> Result<()> {
        validate_topic_name(&publish.topic)?;
        let message = Message::from_publish(&publish, client_id, ctx.username().as_ref());
        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => {
                self.dispatch(message).await;
                Ok(())
            }
            (QoS::AtLeastOnce, Some(packet_id)) => {
                self.dispatch(message).await;
                ctx.send(Packet::PublishAck { packet_id })
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                self.publish_manager.add_pending_release(client_id, packet_id, message).await;
                ctx.send(Packet::PublishReceived { packet_id })
            }
            (_, None) => Err(anyhow!("{} PUBLISH QoS {} without packet id", client_id, publish.qos.value())),
        }
    }

    async fn process_subscribe(
        &self,
        ctx: &ConnectionContext,
        client_id: &ClientId,
        packet_id: NonZeroU16,
        topic_filters: Vec<(ByteString, QoS)>,
    ) -> Result<()> {
        let mut status = Vec::with_capacity(topic_filters.len());
        let mut granted: Vec<(TopicFilter, QoS)> = Vec::with_capacity(topic_filters.len());
        for (topic_filter, qos) in topic_filters {
            if let Err(e) = validate_topic_filter(&topic_filter) {
                log::info!("{} subscribe refused, {}", client_id, e);
                status.push(SubscribeReturnCode::Failure);
                continue;
            }
            self.sub_manager.subscribe(client_id, &topic_filter, qos).await?;
            self.session_manager.add_subscription(client_id, &topic_filter, qos).await?;
            status.push(SubscribeReturnCode::Success(qos));
            granted.push((topic_filter, qos));
        }
        ctx.send(Packet::SubscribeAck { packet_id, status })?;

        for (topic_filter, qos) in granted {
            self.replay_retained(ctx, client_id, &topic_filter, qos).await?;
        }
        Ok(())
    }

    async fn replay_retained(
        &self,
        ctx: &ConnectionContext,
        client_id: &ClientId,
        topic_filter: &str,
        granted_qos: QoS,
    ) -> Result<()> {
        for message in self.message_store.get_retain_messages(topic_filter).await? {
            let qos = message.qos.less_value(granted_qos);
            let packet_id = match qos {
                QoS::AtMostOnce => None,
                _ => Some(self.session_manager.next_packet_id(client_id).await?),
            };
            let publish = message.to_publish(qos, packet_id, true);
            if let Some(packet_id) = packet_id {
                self.publish_manager.add_pending_publish(client_id, packet_id, publish.clone()).await;
            }
            ctx.send(Packet::Publish(Box::new(publish)))?;
        }
        Ok(())
    }

    #[inline]
    async fn dispatch(&self, message: Message) {
        let topic = message.topic.clone();
        if let Err(e) = self.dispatcher.send(message).await {
            log::warn!("dispatch {} error, {:?}", topic, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::auth::DefaultAuthHandler;
    use crate::codec::types::Protocol;
    use crate::codec::v3::LastWill;
    use crate::dispatcher::DefaultMessageDispatcher;
    use crate::event::DefaultConnectStatusListener;
    use crate::net::{Command, CommandReceiver, Packet as NetPacket};
    use crate::publish::DefaultPublishManager;
    use crate::session::InMemorySessionManager;
    use crate::store::InMemoryMessageStore;
    use crate::subscribe::DefaultSubscriptionManager;
    use crate::types::PacketId;

    struct Fixture {
        connections: Connections,
        sessions: Arc<InMemorySessionManager>,
        subs: Arc<DefaultSubscriptionManager>,
        publishes: Arc<DefaultPublishManager>,
        store: Arc<InMemoryMessageStore>,
        processor: DefaultMqttServerProcessor,
    }

    fn fixture() -> Fixture {
        let connections = Connections::new();
        let sessions = Arc::new(InMemorySessionManager::new());
        let subs = Arc::new(DefaultSubscriptionManager::new());
        let publishes = Arc::new(DefaultPublishManager::new());
        let store = Arc::new(InMemoryMessageStore::new());
        let dispatcher = Arc::new(DefaultMessageDispatcher::new(
            connections.clone(),
            sessions.clone(),
            subs.clone(),
            publishes.clone(),
            store.clone(),
        ));
        let processor = DefaultMqttServerProcessor::new(
            connections.clone(),
            sessions.clone(),
            Arc::new(DefaultAuthHandler),
            subs.clone(),
            publishes.clone(),
            store.clone(),
            dispatcher,
            Arc::new(DefaultConnectStatusListener),
            Arc::new(TaskExecutor::new(1, 10)),
        );
        Fixture { connections, sessions, subs, publishes, store, processor }
    }

    fn new_ctx(f: &Fixture) -> (ConnectionContext, CommandReceiver) {
        let (ctx, rx) = ConnectionContext::new(f.connections.next_id(), "127.0.0.1:50000".parse().unwrap(), "test");
        f.connections.add(ctx.clone());
        (ctx, rx)
    }

    fn connect_packet(client_id: &str, clean_session: bool, last_will: Option<LastWill>) -> Packet {
        Packet::Connect(Box::new(Connect {
            protocol: Protocol(MQTT_LEVEL_311),
            clean_session,
            keep_alive: 60,
            last_will,
            client_id: client_id.into(),
            username: None,
            password: None,
        }))
    }

    fn next_mqtt(rx: &mut CommandReceiver) -> Option<Packet> {
        match rx.try_recv() {
            Ok(Command::Send(NetPacket::Mqtt(p))) => Some(p),
            _ => None,
        }
    }

    fn connack_code(rx: &mut CommandReceiver) -> ConnectAckReason {
        match next_mqtt(rx) {
            Some(Packet::ConnectAck(ack)) => ack.return_code,
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    async fn connected(f: &Fixture, client_id: &str) -> (ConnectionContext, CommandReceiver) {
        let (ctx, mut rx) = new_ctx(f);
        f.processor.process(&ctx, connect_packet(client_id, true, None)).await.unwrap();
        assert_eq!(connack_code(&mut rx), ConnectAckReason::ConnectionAccepted);
        (ctx, rx)
    }

    fn pid(id: u16) -> PacketId {
        PacketId::new(id).unwrap()
    }

    #[tokio::test]
    async fn packets_before_connect_are_refused() {
        let f = fixture();
        let (ctx, _rx) = new_ctx(&f);
        let err = f.processor.process(&ctx, Packet::PingRequest).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<MqttError>(), Some(MqttError::NotConnected("PINGREQ"))));
    }

    #[tokio::test]
    async fn connect_client_id_rules() {
        let f = fixture();

        let (ctx, mut rx) = new_ctx(&f);
        f.processor.process(&ctx, connect_packet("", false, None)).await.unwrap();
        assert_eq!(connack_code(&mut rx), ConnectAckReason::IdentifierRejected);
        assert!(matches!(rx.try_recv(), Ok(Command::Close(_))));
        assert!(ctx.client_id().is_none());

        let (ctx, mut rx) = new_ctx(&f);
        f.processor.process(&ctx, connect_packet("", true, None)).await.unwrap();
        assert_eq!(connack_code(&mut rx), ConnectAckReason::ConnectionAccepted);
        let generated = ctx.client_id().unwrap();
        assert_eq!(generated.len(), 32);
        assert!(f.sessions.exists(&generated).await.unwrap());

        assert!(f.processor.process(&ctx, connect_packet("again", true, None)).await.is_err());
    }

    #[tokio::test]
    async fn unsupported_protocol_level_is_refused() {
        let f = fixture();
        let (ctx, mut rx) = new_ctx(&f);
        let mut connect = connect_packet("dev-01", true, None);
        if let Packet::Connect(c) = &mut connect {
            c.protocol = Protocol(5);
        }
        f.processor.process(&ctx, connect).await.unwrap();
        assert_eq!(connack_code(&mut rx), ConnectAckReason::UnacceptableProtocolVersion);
    }

    #[tokio::test]
    async fn connect_registers_and_clears_will() {
        let f = fixture();
        let will = LastWill {
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "status/dev-01".into(),
            message: Bytes::from_static(b"offline"),
        };
        let (ctx, mut rx) = new_ctx(&f);
        f.processor.process(&ctx, connect_packet("dev-01", true, Some(will))).await.unwrap();
        assert_eq!(connack_code(&mut rx), ConnectAckReason::ConnectionAccepted);
        assert_eq!(f.store.will_count(), 1);
        assert!(f.store.get_will_message("dev-01").await.unwrap().unwrap().is_will());

        //the first connection is already unregistered, nothing to evict
        f.connections.remove(&ctx);
        let (ctx2, mut rx2) = new_ctx(&f);
        f.processor.process(&ctx2, connect_packet("dev-01", true, None)).await.unwrap();
        assert_eq!(connack_code(&mut rx2), ConnectAckReason::ConnectionAccepted);
        assert_eq!(f.store.will_count(), 0);
    }

    #[tokio::test]
    async fn qos2_inbound_is_released_once() {
        let f = fixture();
        let (_watcher, mut watcher_rx) = connected(&f, "watcher").await;
        f.subs.subscribe(&"watcher".into(), &"a/#".into(), QoS::AtMostOnce).await.unwrap();
        let (ctx, mut rx) = connected(&f, "dev-01").await;

        let publish = Message::new("a/b", "x", QoS::ExactlyOnce).to_publish(QoS::ExactlyOnce, Some(pid(9)), false);
        f.processor.process(&ctx, Packet::Publish(Box::new(publish))).await.unwrap();
        assert_eq!(next_mqtt(&mut rx), Some(Packet::PublishReceived { packet_id: pid(9) }));
        assert_eq!(f.publishes.pending_release_count("dev-01"), 1);
        assert!(next_mqtt(&mut watcher_rx).is_none());

        f.processor.process(&ctx, Packet::PublishRelease { packet_id: pid(9) }).await.unwrap();
        assert_eq!(next_mqtt(&mut rx), Some(Packet::PublishComplete { packet_id: pid(9) }));
        assert!(matches!(next_mqtt(&mut watcher_rx), Some(Packet::Publish(_))));

        //a repeated PUBREL is completed without a second delivery
        f.processor.process(&ctx, Packet::PublishRelease { packet_id: pid(9) }).await.unwrap();
        assert_eq!(next_mqtt(&mut rx), Some(Packet::PublishComplete { packet_id: pid(9) }));
        assert!(next_mqtt(&mut watcher_rx).is_none());
    }

    #[tokio::test]
    async fn subscribe_replays_retained_and_acks() {
        let f = fixture();
        f.store.add_retain_message(Message::new("cfg/dev-01", "v1", QoS::AtLeastOnce).retain(true)).await.unwrap();
        let (ctx, mut rx) = connected(&f, "dev-01").await;

        let subscribe = Packet::Subscribe {
            packet_id: pid(1),
            topic_filters: vec![("cfg/+".into(), QoS::ExactlyOnce), ("bad/#/filter".into(), QoS::AtMostOnce)],
        };
        f.processor.process(&ctx, subscribe).await.unwrap();
        assert_eq!(
            next_mqtt(&mut rx),
            Some(Packet::SubscribeAck {
                packet_id: pid(1),
                status: vec![SubscribeReturnCode::Success(QoS::ExactlyOnce), SubscribeReturnCode::Failure],
            })
        );
        let retained = match next_mqtt(&mut rx) {
            Some(Packet::Publish(p)) => p,
            other => panic!("expected retained PUBLISH, got {:?}", other),
        };
        assert!(retained.retain);
        assert_eq!(retained.qos, QoS::AtLeastOnce);
        let packet_id = retained.packet_id.unwrap();
        assert_eq!(f.publishes.pending_publish_count("dev-01"), 1);

        f.processor.process(&ctx, Packet::PublishAck { packet_id }).await.unwrap();
        assert_eq!(f.publishes.pending_publish_count("dev-01"), 0);

        f.processor
            .process(&ctx, Packet::Unsubscribe { packet_id: pid(2), topic_filters: vec!["cfg/+".into()] })
            .await
            .unwrap();
        assert_eq!(next_mqtt(&mut rx), Some(Packet::UnsubscribeAck { packet_id: pid(2) }));
        assert_eq!(f.subs.filters_count(), 0);
        assert_eq!(f.sessions.subscription_qos("dev-01", "cfg/+").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ping_and_disconnect() {
        let f = fixture();
        let (ctx, mut rx) = connected(&f, "dev-01").await;
        f.processor.process(&ctx, Packet::PingRequest).await.unwrap();
        assert_eq!(next_mqtt(&mut rx), Some(Packet::PingResponse));

        f.processor.process(&ctx, Packet::Disconnect).await.unwrap();
        assert!(ctx.is_graceful_disconnect());
        assert!(matches!(rx.try_recv(), Ok(Command::Close(remark)) if remark == "disconnect"));
    }

    #[tokio::test]
    async fn reconnect_refused_while_previous_connection_lingers() {
        let mut f = fixture();
        f.processor = f.processor.evict_timeout(Duration::from_millis(50));
        //nothing drives the first connection, so it never finishes closing
        let (old, mut old_rx) = connected(&f, "dup").await;

        let (ctx, mut rx) = new_ctx(&f);
        f.processor.process(&ctx, connect_packet("dup", true, None)).await.unwrap();
        assert!(matches!(old_rx.try_recv(), Ok(Command::Close(remark)) if remark == "kicked"));
        assert_eq!(connack_code(&mut rx), ConnectAckReason::ServiceUnavailable);
        assert!(matches!(rx.try_recv(), Ok(Command::Close(_))));

        assert!(ctx.client_id().is_none());
        assert!(!old.is_closed());
        assert!(f.connections.get_by_client_id("dup").is_none());
        //the lingering connection still owns its session
        assert!(f.sessions.get("dup").await.unwrap().is_some());
    }
}
