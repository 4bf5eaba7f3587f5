use async_trait::async_trait;
use bytes::Bytes;

use crate::net::{ClientId, ConnectionContext, UserName};
use crate::Result;

#[async_trait]
pub trait AuthHandler: Sync + Send {
    /// Returns `Ok(false)` to refuse the connection with "bad user name or password".
    async fn authenticate(
        &self,
        ctx: &ConnectionContext,
        client_id: &ClientId,
        username: Option<&UserName>,
        password: Option<&Bytes>,
    ) -> Result<bool>;
}

/// Allows every client.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAuthHandler;

#[async_trait]
impl AuthHandler for DefaultAuthHandler {
    #[inline]
    async fn authenticate(
        &self,
        _ctx: &ConnectionContext,
        _client_id: &ClientId,
        _username: Option<&UserName>,
        _password: Option<&Bytes>,
    ) -> Result<bool> {
        Ok(true)
    }
}
