use std::io;

/// Errors that prevent a server from being built or started.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("subscription manager is required, call `sub_manager` before building the server")]
    MissingSubscriptionManager,
    #[error("tls configuration error, {0}")]
    Tls(String),
    #[error("invalid bind address, {0}")]
    InvalidAddress(String),
    #[error("bind error, {0}")]
    Bind(#[source] io::Error),
}
