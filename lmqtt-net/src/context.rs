use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, Notify};

use crate::http::HttpPacket;
use crate::{timestamp_millis, v3, ClientId, ContextId, MqttError, Result, TimestampMillis, UserName};

/// A packet travelling over a connection, either MQTT or a one-shot HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Mqtt(v3::Packet),
    Http(HttpPacket),
}

impl Packet {
    #[inline]
    pub fn is_mqtt(&self) -> bool {
        matches!(self, Packet::Mqtt(_))
    }

    #[inline]
    pub fn as_mqtt(&self) -> Option<&v3::Packet> {
        match self {
            Packet::Mqtt(p) => Some(p),
            Packet::Http(_) => None,
        }
    }
}

impl From<v3::Packet> for Packet {
    #[inline]
    fn from(p: v3::Packet) -> Self {
        Packet::Mqtt(p)
    }
}

/// Instructions sent to the connection driver task.
#[derive(Debug)]
pub enum Command {
    Send(Packet),
    Close(String),
}

pub type CommandReceiver = mpsc::UnboundedReceiver<Command>;

/// Per-connection state read and written by the broker while the connection lives.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub client_id: Option<ClientId>,
    pub username: Option<UserName>,
    ///Set when the client sent DISCONNECT before the socket went away.
    pub graceful_disconnect: bool,
    ///Set when the connection carried an HTTP request instead of MQTT.
    pub is_http: bool,
}

pub struct ContextInner {
    id: ContextId,
    remote_addr: SocketAddr,
    server_name: Arc<str>,
    created_at: TimestampMillis,
    state: RwLock<ConnectionState>,
    tx: mpsc::UnboundedSender<Command>,
    closed: AtomicBool,
    close_notify: Notify,
}

/// Handle to a live transport connection. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionContext(Arc<ContextInner>);

impl Deref for ConnectionContext {
    type Target = ContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("server_name", &self.server_name)
            .field("state", &*self.state.read())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionContext {
    pub fn new<N: Into<Arc<str>>>(
        id: ContextId,
        remote_addr: SocketAddr,
        server_name: N,
    ) -> (Self, CommandReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = ContextInner {
            id,
            remote_addr,
            server_name: server_name.into(),
            created_at: timestamp_millis(),
            state: RwLock::new(ConnectionState::default()),
            tx,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        };
        (Self(Arc::new(inner)), rx)
    }

    #[inline]
    pub fn id(&self) -> ContextId {
        self.id
    }

    #[inline]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    #[inline]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    #[inline]
    pub fn created_at(&self) -> TimestampMillis {
        self.created_at
    }

    ///Snapshot of the current state.
    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    ///Mutates the state under the write lock. The closure must not block.
    #[inline]
    pub fn update_state<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut ConnectionState) -> R,
    {
        f(&mut self.state.write())
    }

    #[inline]
    pub fn client_id(&self) -> Option<ClientId> {
        self.state.read().client_id.clone()
    }

    #[inline]
    pub fn username(&self) -> Option<UserName> {
        self.state.read().username.clone()
    }

    #[inline]
    pub fn is_graceful_disconnect(&self) -> bool {
        self.state.read().graceful_disconnect
    }

    #[inline]
    pub fn is_http(&self) -> bool {
        self.state.read().is_http
    }

    #[inline]
    pub fn set_client_id(&self, client_id: ClientId) {
        self.state.write().client_id = Some(client_id);
    }

    #[inline]
    pub fn set_username(&self, username: Option<UserName>) {
        self.state.write().username = username;
    }

    #[inline]
    pub fn set_graceful_disconnect(&self, graceful: bool) {
        self.state.write().graceful_disconnect = graceful;
    }

    #[inline]
    pub fn set_http(&self, is_http: bool) {
        self.state.write().is_http = is_http;
    }

    /// Queues a packet for the connection's writer.
    #[inline]
    pub fn send<P: Into<Packet>>(&self, packet: P) -> Result<()> {
        if self.is_closed() {
            return Err(MqttError::ConnectionClosed.into());
        }
        self.tx.send(Command::Send(packet.into())).map_err(|_| MqttError::ConnectionClosed)?;
        Ok(())
    }

    /// Asks the driver to close the connection once already queued packets are written.
    #[inline]
    pub fn close<R: Into<String>>(&self, remark: R) {
        if self.tx.send(Command::Close(remark.into())).is_err() {
            log::debug!("{} connection driver already gone", self.id);
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the connection has been fully torn down.
    pub async fn closed(&self) {
        let notified = self.close_notify.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    #[inline]
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_notify.notify_waiters();
    }
}
