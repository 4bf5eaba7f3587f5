#![deny(unsafe_code)]

//! Transport layer of the lmqtt broker.
//!
//! Accepts TCP (optionally TLS) connections, frames MQTT 3.1/3.1.1 packets with
//! `rmqtt_codec::v3::Codec`, serves one-shot HTTP requests on the same port and raises
//! per-connection lifecycle events through [`ServerListener`], [`ServerHandler`] and
//! [`StatListener`].

mod builder;
mod connection;
mod context;
mod error;
pub mod http;
mod listener;
mod server;
mod tls;

pub use builder::TransportConfig;
pub use context::{Command, CommandReceiver, ConnectionContext, ConnectionState, Packet};
pub use error::{is_io_error, panic_message, MqttError};
pub use listener::{BufferAllocator, ServerHandler, ServerListener, StatListener};
pub use server::{Connections, TransportServer};
pub use tls::{load_tls_config_from_files, load_tls_config_from_readers};

pub use rmqtt_codec::v3;
pub use rmqtt_codec::types::{Publish, QoS};

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;

pub type ContextId = u64;
pub type ClientId = bytestring::ByteString;
pub type UserName = bytestring::ByteString;
pub type TimestampMillis = i64;

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    chrono::Local::now().timestamp_millis()
}
