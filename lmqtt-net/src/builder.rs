use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, SockAddr, Socket, Type};
use tokio::net::TcpListener;

use crate::{Result, ServerHandler, ServerListener, StatListener};

/// Everything a [`crate::TransportServer`] needs to accept and drive connections.
#[derive(Clone)]
pub struct TransportConfig {
    /// The name of the server.
    pub name: String,
    pub handler: Arc<dyn ServerHandler>,
    pub listener: Arc<dyn ServerListener>,
    ///Idle read period after which the listener is consulted, `None` or zero disables it.
    pub heartbeat_timeout: Option<Duration>,
    pub stat_listener: Option<Arc<dyn StatListener>>,
    ///Initial read buffer size in bytes.
    pub read_buffer_size: usize,
    ///Maximum allowed mqtt packet length. 0 means unlimited, default: 1M
    pub max_packet_size: u32,
    ///Send timeout.
    pub send_timeout: Duration,
    ///Time allowed to flush and shut down the socket when closing.
    pub close_timeout: Duration,
    ///Handshake timeout.
    pub handshake_timeout: Duration,
    ///The maximum length of the TCP connection queue.
    pub backlog: i32,
    ///Sets the value of the TCP_NODELAY option on accepted sockets.
    pub nodelay: bool,
    ///Whether to enable the SO_REUSEADDR option.
    pub reuseaddr: Option<bool>,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    ///Log every packet in and out.
    pub debug: bool,
}

impl TransportConfig {
    pub fn new<N: Into<String>>(
        name: N,
        handler: Arc<dyn ServerHandler>,
        listener: Arc<dyn ServerListener>,
    ) -> Self {
        TransportConfig {
            name: name.into(),
            handler,
            listener,
            heartbeat_timeout: None,
            stat_listener: None,
            read_buffer_size: 8 * 1024,
            max_packet_size: 1024 * 1024, //"1M"
            send_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(30),
            backlog: 512,
            nodelay: false,
            reuseaddr: Some(true),
            tls: None,
            debug: false,
        }
    }

    pub fn heartbeat_timeout(mut self, heartbeat_timeout: Option<Duration>) -> Self {
        self.heartbeat_timeout = heartbeat_timeout.filter(|d| !d.is_zero());
        self
    }

    pub fn stat_listener(mut self, stat_listener: Arc<dyn StatListener>) -> Self {
        self.stat_listener = Some(stat_listener);
        self
    }

    pub fn read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size;
        self
    }

    pub fn max_packet_size(mut self, max_packet_size: u32) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    pub fn handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn reuseaddr(mut self, reuseaddr: Option<bool>) -> Self {
        self.reuseaddr = reuseaddr;
        self
    }

    pub fn tls(mut self, tls: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub(crate) fn bind(&self, laddr: SocketAddr) -> Result<TcpListener> {
        let builder = match laddr {
            SocketAddr::V4(_) => Socket::new(Domain::IPV4, Type::STREAM, None)?,
            SocketAddr::V6(_) => Socket::new(Domain::IPV6, Type::STREAM, None)?,
        };

        builder.set_linger(Some(Duration::from_secs(10)))?;

        builder.set_nonblocking(true)?;

        if let Some(reuseaddr) = self.reuseaddr {
            builder.set_reuse_address(reuseaddr)?;
        }

        builder.bind(&SockAddr::from(laddr))?;
        builder.listen(self.backlog)?;
        let tcp_listener = TcpListener::from_std(std::net::TcpListener::from(builder))?;
        log::info!(
            "MQTT Broker Listening on {} {}{}",
            self.name,
            tcp_listener.local_addr()?,
            if self.tls.is_some() { " (tls)" } else { "" }
        );
        Ok(tcp_listener)
    }
}
