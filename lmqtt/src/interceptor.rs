use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::codec::v3::Packet;
use crate::net::ConnectionContext;
use crate::Result;

/// Observes traffic on every MQTT connection. Errors close the connection.
#[async_trait]
pub trait MessageInterceptor: Sync + Send {
    async fn on_after_received_bytes(&self, _ctx: &ConnectionContext, _received_bytes: usize) -> Result<()> {
        Ok(())
    }

    async fn on_after_decoded(&self, _ctx: &ConnectionContext, _packet: &Packet, _packet_size: usize) -> Result<()> {
        Ok(())
    }

    async fn on_after_handled(&self, _ctx: &ConnectionContext, _packet: &Packet, _cost: Duration) -> Result<()> {
        Ok(())
    }
}

/// Ordered interceptor chain. The first error stops the chain and is returned.
#[derive(Default, Clone)]
pub struct MessageInterceptors {
    interceptors: Vec<Arc<dyn MessageInterceptor>>,
}

impl MessageInterceptors {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&mut self, interceptor: Arc<dyn MessageInterceptor>) {
        self.interceptors.push(interceptor);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub async fn on_after_received_bytes(&self, ctx: &ConnectionContext, received_bytes: usize) -> Result<()> {
        for interceptor in self.interceptors.iter() {
            interceptor.on_after_received_bytes(ctx, received_bytes).await?;
        }
        Ok(())
    }

    pub async fn on_after_decoded(&self, ctx: &ConnectionContext, packet: &Packet, packet_size: usize) -> Result<()> {
        for interceptor in self.interceptors.iter() {
            interceptor.on_after_decoded(ctx, packet, packet_size).await?;
        }
        Ok(())
    }

    pub async fn on_after_handled(&self, ctx: &ConnectionContext, packet: &Packet, cost: Duration) -> Result<()> {
        for interceptor in self.interceptors.iter() {
            interceptor.on_after_handled(ctx, packet, cost).await?;
        }
        Ok(())
    }
}
