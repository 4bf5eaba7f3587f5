#![deny(unsafe_code)]

//! # Overall Example
//! ```rust,no_run
//!
//! use lmqtt::server::MqttServerCreator;
//! use lmqtt::subscribe::DefaultSubscriptionManager;
//! use lmqtt::Result;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let server = MqttServerCreator::new()
//!         .name("lmqtt/tcp")
//!         .ip("0.0.0.0")
//!         .port(1883)
//!         .heartbeat_timeout(Some(std::time::Duration::from_secs(120)))
//!         .sub_manager(Arc::new(DefaultSubscriptionManager::new()))
//!         .start()
//!         .await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

/// Collaborator contracts and their in-memory defaults
pub mod auth; // Connection authentication
pub mod event; // Connect / disconnect notifications
pub mod interceptor; // Packet observation hooks
pub mod publish; // In-flight QoS 1/2 tracking
pub mod session; // Client session handling
pub mod store; // Will and retained messages
pub mod subscribe; // Subscription management

/// Broker core
pub mod dispatcher; // Message fan-out
pub mod executor; // Deferred task worker pool
pub mod handler; // Transport packet handler
pub mod listener; // Connection lifecycle state machine
pub mod processor; // MQTT protocol processing
pub mod server; // Server builder and handle

pub mod error;
pub mod topic;
pub mod types;

pub use error::ServerError;
pub use lmqtt_net as net;
pub use net::{Error, Result};
pub use rmqtt_codec as codec;
