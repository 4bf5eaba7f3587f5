use std::any::Any;
use std::io;

use rmqtt_codec::error::{DecodeError, EncodeError};

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    /// MQTT decoding error
    #[error("Decoding error: {0:?}")]
    Decode(#[from] DecodeError),
    /// MQTT encoding error
    #[error("Encoding error: {0:?}")]
    Encode(#[from] EncodeError),
    /// Read timeout
    #[error("Read timeout")]
    ReadTimeout,
    /// Write timeout
    #[error("Write timeout")]
    WriteTimeout,
    /// Close timeout
    #[error("Close timeout")]
    CloseTimeout,
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("invalid protocol")]
    InvalidProtocol,
    #[error("identifier rejected")]
    IdentifierRejected,
    #[error("not connected, received {0} before CONNECT")]
    NotConnected(&'static str),
    #[error("malformed http request, {0}")]
    HttpRequest(String),
}

impl MqttError {
    /// Decode failures caused by the socket are surfaced as plain `io::Error`s so that
    /// callers can classify them with [`is_io_error`].
    #[inline]
    pub fn from_decode(e: DecodeError) -> anyhow::Error {
        match e {
            DecodeError::Io(e) => anyhow::Error::from(io::Error::other(e.to_string())),
            e => anyhow::Error::from(MqttError::Decode(e)),
        }
    }
}

/// Returns true if any error in the chain is an `std::io::Error`.
#[inline]
pub fn is_io_error(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| cause.downcast_ref::<io::Error>().is_some())
}

/// Renders a panic payload caught by `catch_unwind`.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
