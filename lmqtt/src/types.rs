use std::num::NonZeroU16;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::types::{Publish, QoS};
use crate::codec::v3::LastWill;
use crate::net::{timestamp_millis, ClientId, TimestampMillis, UserName};

pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type DashSet<K> = dashmap::DashSet<K, ahash::RandomState>;

pub type TopicName = bytestring::ByteString;
pub type TopicFilter = bytestring::ByteString;
pub type PacketId = NonZeroU16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Publish,
    Will,
}

/// An application message as seen by the broker, independent of any connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: TopicName,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub from_client_id: Option<ClientId>,
    pub from_username: Option<UserName>,
    pub create_time: TimestampMillis,
    pub kind: MessageKind,
}

impl Message {
    #[inline]
    pub fn new<T: Into<TopicName>, P: Into<Bytes>>(topic: T, payload: P, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            from_client_id: None,
            from_username: None,
            create_time: timestamp_millis(),
            kind: MessageKind::Publish,
        }
    }

    #[inline]
    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[inline]
    pub fn from_client(mut self, client_id: Option<ClientId>, username: Option<UserName>) -> Self {
        self.from_client_id = client_id;
        self.from_username = username;
        self
    }

    #[inline]
    pub fn from_publish(p: &Publish, client_id: &ClientId, username: Option<&UserName>) -> Self {
        Self {
            topic: p.topic.clone(),
            payload: p.payload.clone(),
            qos: p.qos,
            retain: p.retain,
            from_client_id: Some(client_id.clone()),
            from_username: username.cloned(),
            create_time: p.create_time.unwrap_or_else(timestamp_millis),
            kind: MessageKind::Publish,
        }
    }

    #[inline]
    pub fn from_last_will(lw: &LastWill, client_id: &ClientId, username: Option<&UserName>) -> Self {
        Self {
            topic: lw.topic.clone(),
            payload: lw.message.clone(),
            qos: lw.qos,
            retain: lw.retain,
            from_client_id: Some(client_id.clone()),
            from_username: username.cloned(),
            create_time: timestamp_millis(),
            kind: MessageKind::Will,
        }
    }

    #[inline]
    pub fn is_will(&self) -> bool {
        matches!(self.kind, MessageKind::Will)
    }

    /// Builds the outbound PUBLISH for one subscriber.
    #[inline]
    pub fn to_publish(&self, qos: QoS, packet_id: Option<PacketId>, retain: bool) -> Publish {
        Publish {
            dup: false,
            retain,
            qos,
            topic: self.topic.clone(),
            packet_id,
            payload: self.payload.clone(),
            properties: None,
            delay_interval: None,
            create_time: Some(self.create_time),
        }
    }
}
