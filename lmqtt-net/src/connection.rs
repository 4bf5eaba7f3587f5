use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::BytesMut;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::codec::{Decoder, Encoder};

use crate::http::{self, HttpPacket};
use crate::{
    panic_message, v3, BufferAllocator, Command, CommandReceiver, ConnectionContext, Connections, Error,
    MqttError, Packet, Result, TransportConfig,
};

///How a connection ended: the error that caused it, if any, and a short remark.
type Exit = (Option<Error>, String);

#[inline]
fn exit<R: Into<String>>(cause: Option<Error>, remark: R) -> Exit {
    (cause, remark.into())
}

/// Drives one accepted connection until it closes, then raises `on_before_close` and
/// unregisters it.
pub(crate) async fn serve<Io>(io: Io, remote_addr: SocketAddr, cfg: Arc<TransportConfig>, connections: Connections)
where
    Io: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (ctx, rx) = ConnectionContext::new(connections.next_id(), remote_addr, cfg.name.as_str());
    connections.add(ctx.clone());
    if let Some(stat) = &cfg.stat_listener {
        stat.on_connected(&ctx);
    }
    log::debug!("{} {} connected", ctx.id(), remote_addr);

    let driver = Driver { ctx: ctx.clone(), cfg: cfg.clone() };
    let (cause, remark) = match AssertUnwindSafe(driver.run(io, rx)).catch_unwind().await {
        Ok(exit) => exit,
        Err(e) => exit(Some(anyhow!("connection task panicked, {}", panic_message(e.as_ref()))), "panic"),
    };

    if let Err(e) =
        AssertUnwindSafe(cfg.listener.on_before_close(&ctx, cause.as_ref(), &remark, true)).catch_unwind().await
    {
        log::error!("{} on_before_close panicked, {}", ctx.id(), panic_message(e.as_ref()));
    }

    connections.remove(&ctx);
    ctx.mark_closed();
    if let Some(stat) = &cfg.stat_listener {
        stat.on_closed(&ctx);
    }
    log::debug!("{} {} closed, remark: {}", ctx.id(), remote_addr, remark);
}

struct Driver {
    ctx: ConnectionContext,
    cfg: Arc<TransportConfig>,
}

impl Driver {
    async fn run<Io>(self, mut io: Io, mut rx: CommandReceiver) -> Exit
    where
        Io: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut codec = v3::Codec::new(self.cfg.max_packet_size);
        let exit = self.serve_mqtt(&mut io, &mut codec, &mut rx).await;
        match timeout(self.cfg.close_timeout, io.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!("{} shutdown error, {:?}", self.ctx.id(), e),
            Err(_) => log::debug!("{} {}", self.ctx.id(), MqttError::CloseTimeout),
        }
        exit
    }

    async fn serve_mqtt<Io>(&self, io: &mut Io, codec: &mut v3::Codec, rx: &mut CommandReceiver) -> Exit
    where
        Io: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let allocator = self.cfg.handler.buffer_allocator();
        let read_buffer_size = self.cfg.read_buffer_size;
        let mut buf = BytesMut::with_capacity(allocator.initial_capacity(read_buffer_size));
        let heartbeat = self.cfg.heartbeat_timeout;
        let mut last_read = Instant::now();
        let mut timeouts = 0usize;
        let mut sniffed = false;

        loop {
            loop {
                let (packet, remaining_length) = match codec.decode(&mut buf) {
                    Ok(Some(decoded)) => decoded,
                    Ok(None) => break,
                    Err(e) => return exit(Some(MqttError::from_decode(e)), "decode error"),
                };
                let size = wire_size(remaining_length);
                if let Err(e) = self.on_packet(Packet::Mqtt(packet), size).await {
                    return exit(Some(e), "handle error");
                }
            }
            if allocator == BufferAllocator::Direct && buf.capacity() < read_buffer_size {
                buf.reserve(read_buffer_size - buf.len());
            }

            let deadline = heartbeat.map(|d| last_read + d);
            tokio::select! {
                biased;

                cmd = rx.recv() => match cmd {
                    Some(Command::Send(packet)) => {
                        if let Err(e) = self.write(io, codec, packet).await {
                            return exit(Some(e), "write error");
                        }
                    }
                    Some(Command::Close(remark)) => return self.drain_and_exit(io, codec, rx, remark).await,
                    None => return exit(None, "closed"),
                },

                res = io.read_buf(&mut buf) => match res {
                    Ok(0) => return exit(None, "remote closed"),
                    Ok(n) => {
                        last_read = Instant::now();
                        timeouts = 0;
                        if let Err(e) = self.on_received_bytes(n).await {
                            return exit(Some(e), "handle error");
                        }
                        if !sniffed {
                            sniffed = true;
                            if http::is_http_start(buf[0]) {
                                self.ctx.set_http(true);
                                return self.serve_http(io, codec, rx, buf).await;
                            }
                        }
                    }
                    Err(e) => return exit(Some(e.into()), "read error"),
                },

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    timeouts += 1;
                    let interval = heartbeat.unwrap_or_default();
                    if self.cfg.listener.on_heartbeat_timeout(&self.ctx, interval, timeouts).await {
                        last_read = Instant::now();
                    } else {
                        return exit(None, "heartbeat timeout");
                    }
                }
            }
        }
    }

    /// Serves a single HTTP request: reads the head, hands it to the handler and writes
    /// whatever it queued until the connection is asked to close.
    async fn serve_http<Io>(
        &self,
        io: &mut Io,
        codec: &mut v3::Codec,
        rx: &mut CommandReceiver,
        mut buf: BytesMut,
    ) -> Exit
    where
        Io: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (request, consumed) = loop {
            match http::parse_request(&buf) {
                Ok(Some(parsed)) => break parsed,
                Ok(None) => {}
                Err(e) => return exit(Some(e), "bad http request"),
            }
            match timeout(self.cfg.handshake_timeout, io.read_buf(&mut buf)).await {
                Ok(Ok(0)) => return exit(None, "remote closed"),
                Ok(Ok(n)) => {
                    if let Err(e) = self.on_received_bytes(n).await {
                        return exit(Some(e), "handle error");
                    }
                }
                Ok(Err(e)) => return exit(Some(e.into()), "read error"),
                Err(_) => return exit(Some(MqttError::ReadTimeout.into()), "http read timeout"),
            }
        };

        if let Err(e) = self.on_packet(Packet::Http(HttpPacket::Request(request)), consumed).await {
            return exit(Some(e), "handle error");
        }

        loop {
            match timeout(self.cfg.send_timeout, rx.recv()).await {
                Ok(Some(Command::Send(packet))) => {
                    if let Err(e) = self.write(io, codec, packet).await {
                        return exit(Some(e), "write error");
                    }
                }
                Ok(Some(Command::Close(remark))) => return exit(None, remark),
                Ok(None) => return exit(None, "closed"),
                Err(_) => return exit(None, "http response timeout"),
            }
        }
    }

    ///Writes packets queued before the close request so that final acks reach the peer.
    async fn drain_and_exit<Io>(
        &self,
        io: &mut Io,
        codec: &mut v3::Codec,
        rx: &mut CommandReceiver,
        remark: String,
    ) -> Exit
    where
        Io: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            match rx.try_recv() {
                Ok(Command::Send(packet)) => {
                    if let Err(e) = self.write(io, codec, packet).await {
                        return exit(Some(e), "write error");
                    }
                }
                Ok(Command::Close(_)) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return exit(None, remark),
            }
        }
    }

    async fn on_received_bytes(&self, n: usize) -> Result<()> {
        if let Some(stat) = &self.cfg.stat_listener {
            stat.on_received_bytes(&self.ctx, n);
        }
        self.cfg.listener.on_after_received_bytes(&self.ctx, n).await
    }

    async fn on_packet(&self, packet: Packet, size: usize) -> Result<()> {
        if self.cfg.debug {
            log::info!("{} {} recv {:?}", self.ctx.id(), self.ctx.remote_addr(), packet);
        }
        self.cfg.listener.on_after_decoded(&self.ctx, &packet, size).await?;
        let start = std::time::Instant::now();
        self.cfg.handler.handle(&self.ctx, packet.clone()).await?;
        self.cfg.listener.on_after_handled(&self.ctx, &packet, start.elapsed()).await
    }

    async fn write<Io>(&self, io: &mut Io, codec: &mut v3::Codec, packet: Packet) -> Result<()>
    where
        Io: AsyncWrite + Unpin + Send,
    {
        let out = match &packet {
            Packet::Mqtt(p) => {
                let mut out = BytesMut::new();
                codec.encode(p.clone(), &mut out).map_err(MqttError::from)?;
                out
            }
            Packet::Http(HttpPacket::Response(resp)) => resp.encode(),
            Packet::Http(HttpPacket::Request(_)) => return Err(anyhow!("cannot send an http request")),
        };
        if self.cfg.debug {
            log::info!("{} {} send {:?}", self.ctx.id(), self.ctx.remote_addr(), packet);
        }

        let res = match timeout(self.cfg.send_timeout, async {
            io.write_all(&out).await?;
            io.flush().await
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::from(e)),
            Err(_) => Err(MqttError::WriteTimeout.into()),
        };

        if res.is_ok() {
            if let Some(stat) = &self.cfg.stat_listener {
                stat.on_sent(&self.ctx, out.len());
            }
        }
        self.cfg.listener.on_after_sent(&self.ctx, &packet, res.is_ok()).await;
        res
    }
}

///Size of a frame on the wire: fixed header byte, remaining length varint and body.
#[inline]
fn wire_size(remaining_length: u32) -> usize {
    let varint_len = match remaining_length {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    };
    1 + varint_len + remaining_length as usize
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use parking_lot::Mutex;
    use tokio::net::TcpStream;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::http::HttpResponse;
    use crate::{ServerHandler, ServerListener, StatListener, TransportServer};

    #[derive(Default)]
    struct Recorder {
        closes: Mutex<Vec<(Option<String>, String, bool)>>,
        decoded: AtomicUsize,
        heartbeat_timeouts: AtomicUsize,
        keep_alive_on_timeout: bool,
    }

    #[async_trait]
    impl ServerListener for Recorder {
        async fn on_heartbeat_timeout(&self, _ctx: &ConnectionContext, _interval: Duration, _count: usize) -> bool {
            self.heartbeat_timeouts.fetch_add(1, Ordering::SeqCst);
            self.keep_alive_on_timeout
        }

        async fn on_before_close(
            &self,
            ctx: &ConnectionContext,
            cause: Option<&anyhow::Error>,
            remark: &str,
            _is_remove: bool,
        ) {
            self.closes.lock().push((cause.map(|e| e.to_string()), remark.to_owned(), ctx.is_http()));
        }

        async fn on_after_sent(&self, ctx: &ConnectionContext, _packet: &Packet, _is_sent_success: bool) {
            if ctx.is_http() {
                ctx.close("http response sent");
            }
        }

        async fn on_after_decoded(&self, _ctx: &ConnectionContext, _packet: &Packet, _size: usize) -> Result<()> {
            self.decoded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Echo;

    #[async_trait]
    impl ServerHandler for Echo {
        async fn handle(&self, ctx: &ConnectionContext, packet: Packet) -> Result<()> {
            match packet {
                Packet::Mqtt(v3::Packet::PingRequest) => ctx.send(v3::Packet::PingResponse),
                Packet::Mqtt(v3::Packet::Disconnect) => {
                    ctx.set_graceful_disconnect(true);
                    ctx.close("disconnect");
                    Ok(())
                }
                Packet::Mqtt(v3::Packet::Subscribe { .. }) => Err(anyhow!("subscribe refused")),
                Packet::Http(HttpPacket::Request(_)) => ctx.send(Packet::Http(HttpPacket::Response(HttpResponse::ok("{}")))),
                _ => Ok(()),
            }
        }
    }

    #[derive(Default)]
    struct Stats {
        connected: AtomicUsize,
        closed: AtomicUsize,
    }

    impl StatListener for Stats {
        fn on_connected(&self, _ctx: &ConnectionContext) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
        fn on_closed(&self, _ctx: &ConnectionContext) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn start(
        recorder: Arc<Recorder>,
        stats: Arc<Stats>,
        heartbeat: Option<Duration>,
    ) -> (TransportServer, SocketAddr) {
        let cfg = TransportConfig::new("test", Arc::new(Echo), recorder)
            .heartbeat_timeout(heartbeat)
            .stat_listener(stats);
        let server = TransportServer::new(cfg);
        let addr = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        (server, addr)
    }

    fn init_log() {
        let _ = simple_logger::SimpleLogger::new().with_level(log::LevelFilter::Debug).init();
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    async fn wait_closed(recorder: &Recorder, n: usize) {
        wait_for(|| recorder.closes.lock().len() >= n).await
    }

    #[test]
    fn frame_sizes() {
        assert_eq!(wire_size(0), 2);
        assert_eq!(wire_size(127), 129);
        assert_eq!(wire_size(128), 131);
        assert_eq!(wire_size(16_384), 16_388);
    }

    #[tokio::test]
    async fn ping_then_disconnect() {
        init_log();
        let recorder = Arc::new(Recorder::default());
        let stats = Arc::new(Stats::default());
        let (server, addr) = start(recorder.clone(), stats.clone(), None).await;

        let mut client = Framed::new(TcpStream::connect(addr).await.unwrap(), v3::Codec::new(0));
        client.send(v3::Packet::PingRequest).await.unwrap();
        let (resp, _) = client.next().await.unwrap().unwrap();
        assert_eq!(resp, v3::Packet::PingResponse);
        client.send(v3::Packet::Disconnect).await.unwrap();
        assert!(client.next().await.is_none());

        wait_closed(&recorder, 1).await;
        let (cause, remark, is_http) = recorder.closes.lock()[0].clone();
        assert!(cause.is_none());
        assert_eq!(remark, "disconnect");
        assert!(!is_http);
        assert_eq!(recorder.decoded.load(Ordering::SeqCst), 2);
        wait_for(|| stats.closed.load(Ordering::SeqCst) == 1).await;
        assert_eq!(stats.connected.load(Ordering::SeqCst), 1);
        assert_eq!(server.connections().count(), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn handler_error_closes_with_cause() {
        let recorder = Arc::new(Recorder::default());
        let (server, addr) = start(recorder.clone(), Arc::new(Stats::default()), None).await;

        let mut client = Framed::new(TcpStream::connect(addr).await.unwrap(), v3::Codec::new(0));
        client
            .send(v3::Packet::Subscribe {
                packet_id: std::num::NonZeroU16::new(1).unwrap(),
                topic_filters: vec![("a/b".into(), v3::QoS::AtMostOnce)],
            })
            .await
            .unwrap();

        wait_closed(&recorder, 1).await;
        let (cause, remark, _) = recorder.closes.lock()[0].clone();
        assert_eq!(cause.as_deref(), Some("subscribe refused"));
        assert_eq!(remark, "handle error");
        server.stop().await;
    }

    #[tokio::test]
    async fn heartbeat_timeout_closes() {
        let recorder = Arc::new(Recorder::default());
        let (server, addr) =
            start(recorder.clone(), Arc::new(Stats::default()), Some(Duration::from_millis(100))).await;

        let _client = TcpStream::connect(addr).await.unwrap();
        wait_closed(&recorder, 1).await;
        let (cause, remark, _) = recorder.closes.lock()[0].clone();
        assert!(cause.is_none());
        assert_eq!(remark, "heartbeat timeout");
        assert_eq!(recorder.heartbeat_timeouts.load(Ordering::SeqCst), 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn heartbeat_timeout_kept_open() {
        let recorder = Arc::new(Recorder { keep_alive_on_timeout: true, ..Default::default() });
        let (server, addr) =
            start(recorder.clone(), Arc::new(Stats::default()), Some(Duration::from_millis(50))).await;

        let _client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(recorder.heartbeat_timeouts.load(Ordering::SeqCst) >= 2);
        assert!(recorder.closes.lock().is_empty());

        server.stop().await;
        wait_closed(&recorder, 1).await;
        assert_eq!(recorder.closes.lock()[0].1, "server stopped");
    }

    #[tokio::test]
    async fn http_request_is_answered_and_closed() {
        init_log();
        let recorder = Arc::new(Recorder::default());
        let (server, addr) = start(recorder.clone(), Arc::new(Stats::default()), None).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
        let mut resp = Vec::new();
        stream.read_to_end(&mut resp).await.unwrap();
        let resp = String::from_utf8(resp).unwrap();
        assert!(resp.starts_with("HTTP/1.1 200 OK"));

        wait_closed(&recorder, 1).await;
        let (cause, remark, is_http) = recorder.closes.lock()[0].clone();
        assert!(cause.is_none());
        assert_eq!(remark, "http response sent");
        assert!(is_http);
        server.stop().await;
    }
}
