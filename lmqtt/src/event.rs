use async_trait::async_trait;

use crate::net::{ClientId, ConnectionContext, UserName};

/// Receives client connect / disconnect notifications.
///
/// Notifications run on the server's task executor, never on the connection task.
#[async_trait]
pub trait ConnectStatusListener: Sync + Send {
    async fn online(&self, ctx: &ConnectionContext, client_id: &ClientId, username: Option<&UserName>);

    async fn offline(&self, ctx: &ConnectionContext, client_id: &ClientId, username: Option<&UserName>, remark: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnectStatusListener;

#[async_trait]
impl ConnectStatusListener for DefaultConnectStatusListener {
    async fn online(&self, ctx: &ConnectionContext, client_id: &ClientId, username: Option<&UserName>) {
        log::info!("Mqtt clientId:{} username:{:?} online, remote:{}", client_id, username, ctx.remote_addr());
    }

    async fn offline(&self, ctx: &ConnectionContext, client_id: &ClientId, username: Option<&UserName>, remark: &str) {
        log::info!(
            "Mqtt clientId:{} username:{:?} offline, remote:{} remark:{}",
            client_id,
            username,
            ctx.remote_addr(),
            remark
        );
    }
}
