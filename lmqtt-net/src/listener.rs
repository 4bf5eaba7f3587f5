use std::time::Duration;

use async_trait::async_trait;

use crate::{ConnectionContext, Packet, Result};

/// Read buffer strategy for a connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum BufferAllocator {
    ///The read buffer starts empty and grows on demand.
    #[default]
    Heap,
    ///The read buffer is allocated at full size up front and its capacity is restored
    ///after every decoded frame.
    Direct,
}

impl BufferAllocator {
    #[inline]
    pub fn initial_capacity(&self, read_buffer_size: usize) -> usize {
        match self {
            BufferAllocator::Heap => 0,
            BufferAllocator::Direct => read_buffer_size,
        }
    }
}

/// Lifecycle events raised by the transport for every connection.
///
/// All hooks run on the connection's own task and must not block.
#[async_trait]
pub trait ServerListener: Sync + Send {
    /// Called when no packet arrived within the heartbeat timeout. `count` is the number of
    /// consecutive timeouts. Returning `false` closes the connection.
    async fn on_heartbeat_timeout(&self, ctx: &ConnectionContext, interval: Duration, count: usize) -> bool;

    /// Called exactly once per connection, before it is unregistered.
    async fn on_before_close(
        &self,
        ctx: &ConnectionContext,
        cause: Option<&anyhow::Error>,
        remark: &str,
        is_remove: bool,
    );

    async fn on_after_sent(&self, _ctx: &ConnectionContext, _packet: &Packet, _is_sent_success: bool) {}

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

/// Application packet handler. An error closes the connection.
#[async_trait]
pub trait ServerHandler: Sync + Send {
    fn buffer_allocator(&self) -> BufferAllocator {
        BufferAllocator::Heap
    }

    async fn handle(&self, ctx: &ConnectionContext, packet: Packet) -> Result<()>;
}

/// Transport statistics callbacks.
pub trait StatListener: Sync + Send {
    fn on_connected(&self, _ctx: &ConnectionContext) {}

    fn on_closed(&self, _ctx: &ConnectionContext) {}

    fn on_received_bytes(&self, _ctx: &ConnectionContext, _bytes: usize) {}

    fn on_sent(&self, _ctx: &ConnectionContext, _bytes: usize) {}
}
