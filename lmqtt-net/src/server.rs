use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::connection;
use crate::{ClientId, ConnectionContext, ContextId, Result, TransportConfig};

#[derive(Default)]
struct ConnectionsInner {
    all: DashMap<ContextId, ConnectionContext>,
    by_client_id: DashMap<ClientId, ConnectionContext>,
    next_id: AtomicU64,
}

/// Registry of live connections, indexed by context id and by bound client id.
#[derive(Clone, Default)]
pub struct Connections(Arc<ConnectionsInner>);

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn next_id(&self) -> ContextId {
        self.0.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    #[inline]
    pub fn add(&self, ctx: ConnectionContext) {
        self.0.all.insert(ctx.id(), ctx);
    }

    /// Unregisters the connection, and its client id binding if the binding still points to it.
    pub fn remove(&self, ctx: &ConnectionContext) -> bool {
        let removed = self.0.all.remove(&ctx.id()).is_some();
        if let Some(client_id) = ctx.client_id() {
            self.unbind(&client_id, ctx);
        }
        removed
    }

    /// Drops the `client_id` binding if it still points to `ctx`.
    #[inline]
    pub fn unbind(&self, client_id: &str, ctx: &ConnectionContext) -> bool {
        self.0.by_client_id.remove_if(client_id, |_, bound| bound.id() == ctx.id()).is_some()
    }

    /// Binds `client_id` to `ctx`, returning the connection previously bound to it, if any.
    #[inline]
    pub fn bind(&self, client_id: ClientId, ctx: ConnectionContext) -> Option<ConnectionContext> {
        let id = ctx.id();
        self.0.by_client_id.insert(client_id, ctx).filter(|prev| prev.id() != id)
    }

    #[inline]
    pub fn get_by_client_id(&self, client_id: &str) -> Option<ConnectionContext> {
        self.0.by_client_id.get(client_id).map(|entry| entry.value().clone())
    }

    #[inline]
    pub fn get(&self, id: ContextId) -> Option<ConnectionContext> {
        self.0.all.get(&id).map(|entry| entry.value().clone())
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.0.all.len()
    }

    ///Number of connections that completed CONNECT.
    #[inline]
    pub fn online_count(&self) -> usize {
        self.0.by_client_id.len()
    }

    pub fn contexts(&self) -> Vec<ConnectionContext> {
        self.0.all.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn close_all(&self, remark: &str) {
        for ctx in self.contexts() {
            ctx.close(remark);
        }
    }
}

/// Accepts connections and spawns a driver task for each one.
pub struct TransportServer {
    cfg: Arc<TransportConfig>,
    connections: Connections,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl TransportServer {
    pub fn new(cfg: TransportConfig) -> Self {
        Self::with_connections(cfg, Connections::new())
    }

    pub fn with_connections(cfg: TransportConfig, connections: Connections) -> Self {
        Self { cfg: Arc::new(cfg), connections, acceptor: Mutex::new(None) }
    }

    #[inline]
    pub fn config(&self) -> &TransportConfig {
        &self.cfg
    }

    #[inline]
    pub fn connections(&self) -> &Connections {
        &self.connections
    }

    /// Binds `laddr` and starts accepting. Returns the actual local address.
    pub async fn start(&self, laddr: SocketAddr) -> Result<SocketAddr> {
        let listener = self.cfg.bind(laddr)?;
        let local_addr = listener.local_addr()?;
        let tls_acceptor = self.cfg.tls.clone().map(TlsAcceptor::from);
        let cfg = self.cfg.clone();
        let connections = self.connections.clone();

        let accept_loop = async move {
            loop {
                let (socket, remote_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("{} accept error, {:?}", cfg.name, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                if let Err(e) = socket.set_nodelay(cfg.nodelay) {
                    log::warn!("{} set nodelay error, {:?}", remote_addr, e);
                }
                let cfg = cfg.clone();
                let connections = connections.clone();
                let tls_acceptor = tls_acceptor.clone();
                tokio::spawn(async move {
                    match tls_acceptor {
                        Some(acceptor) => {
                            match tokio::time::timeout(cfg.handshake_timeout, acceptor.accept(socket)).await {
                                Ok(Ok(tls_s)) => connection::serve(tls_s, remote_addr, cfg, connections).await,
                                Ok(Err(e)) => log::warn!("{} tls handshake error, {:?}", remote_addr, e),
                                Err(_) => log::warn!("{} tls handshake timeout", remote_addr),
                            }
                        }
                        None => connection::serve(socket, remote_addr, cfg, connections).await,
                    }
                });
            }
        };

        if let Some(prev) = self.acceptor.lock().replace(tokio::spawn(accept_loop)) {
            prev.abort();
        }
        Ok(local_addr)
    }

    /// Stops accepting, closes every live connection and waits for their teardown.
    pub async fn stop(&self) {
        if let Some(acceptor) = self.acceptor.lock().take() {
            acceptor.abort();
        }
        let contexts = self.connections.contexts();
        for ctx in contexts.iter() {
            ctx.close("server stopped");
        }
        let close_timeout = self.cfg.close_timeout * 2;
        join_all(contexts.iter().map(|ctx| tokio::time::timeout(close_timeout, ctx.closed()))).await;
        log::info!("{} stopped", self.cfg.name);
    }
}
