use std::sync::Arc;

use async_trait::async_trait;
use http::Method;

use crate::net::http::{HttpPacket, HttpRequest, HttpResponse};
use crate::net::{BufferAllocator, ConnectionContext, Packet, ServerHandler};
use crate::processor::DefaultMqttServerProcessor;
use crate::Result;

const HEALTH_BODY: &str = r#"{"status":"UP"}"#;

/// Routes decoded packets: MQTT to the protocol processor, HTTP to a one-shot health endpoint.
pub struct MqttServerHandler {
    allocator: BufferAllocator,
    processor: Arc<DefaultMqttServerProcessor>,
}

impl MqttServerHandler {
    pub fn new(allocator: BufferAllocator, processor: Arc<DefaultMqttServerProcessor>) -> Self {
        Self { allocator, processor }
    }

    fn http_response(req: &HttpRequest) -> HttpResponse {
        if req.method != Method::GET {
            return HttpResponse::method_not_allowed();
        }
        match req.path() {
            "/" | "/health" => HttpResponse::ok(HEALTH_BODY),
            _ => HttpResponse::not_found(),
        }
    }
}

#[async_trait]
impl ServerHandler for MqttServerHandler {
    #[inline]
    fn buffer_allocator(&self) -> BufferAllocator {
        self.allocator
    }

    async fn handle(&self, ctx: &ConnectionContext, packet: Packet) -> Result<()> {
        match packet {
            Packet::Mqtt(packet) => self.processor.process(ctx, packet).await,
            Packet::Http(HttpPacket::Request(req)) => {
                log::debug!("{} http {} {}", ctx.remote_addr(), req.method, req.uri);
                ctx.send(Packet::Http(HttpPacket::Response(Self::http_response(&req))))
            }
            Packet::Http(HttpPacket::Response(_)) => {
                log::warn!("{} unexpected http response from client", ctx.remote_addr());
                ctx.close("unexpected http response");
                Ok(())
            }
        }
    }
}
