//! MQTT server builder and running server handle
//!
//! [`MqttServerCreator`] collects settings and collaborators, [`MqttServerCreator::build`]
//! validates them into an immutable [`ServerConfig`] and [`MqttServer::start`] wires the
//! broker together in dependency order:
//!
//! ```text
//! TaskExecutor (2 workers)
//! └── PublishManager
//!     └── MessageDispatcher
//!         └── Processor ── Handler (+ buffer allocator)
//!             └── Listener
//!                 └── TransportConfig ── TransportServer (ip:port)
//! ```

use std::fmt;
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthHandler, DefaultAuthHandler};
use crate::dispatcher::{DefaultMessageDispatcher, MessageDispatcher};
use crate::error::ServerError;
use crate::event::{ConnectStatusListener, DefaultConnectStatusListener};
use crate::executor::{TaskExecutor, DEFAULT_QUEUE_MAX, DEFAULT_WORKERS};
use crate::handler::MqttServerHandler;
use crate::interceptor::{MessageInterceptor, MessageInterceptors};
use crate::listener::MqttServerListener;
use crate::net::{
    load_tls_config_from_files, load_tls_config_from_readers, BufferAllocator, Connections, StatListener,
    TransportConfig, TransportServer,
};
use crate::processor::DefaultMqttServerProcessor;
use crate::publish::{DefaultPublishManager, PublishManager};
use crate::session::{InMemorySessionManager, SessionManager};
use crate::store::{InMemoryMessageStore, MessageStore};
use crate::subscribe::SubscriptionManager;
use crate::types::Message;
use crate::Result;

pub const DEFAULT_NAME: &str = "lmqtt-server";
pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 1024 * 1024;

const EXECUTOR_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type TlsResult = std::result::Result<Arc<rustls::ServerConfig>, String>;

/// Fluent MQTT server builder.
pub struct MqttServerCreator {
    name: String,
    ip: String,
    port: u16,
    heartbeat_timeout: Option<Duration>,
    buffer_allocator: BufferAllocator,
    read_buffer_size: usize,
    max_packet_size: u32,
    tls: Option<TlsResult>,
    stat_listener: Option<Arc<dyn StatListener>>,
    auth_handler: Arc<dyn AuthHandler>,
    session_manager: Arc<dyn SessionManager>,
    sub_manager: Option<Arc<dyn SubscriptionManager>>,
    message_store: Arc<dyn MessageStore>,
    connect_status_listener: Arc<dyn ConnectStatusListener>,
    interceptors: MessageInterceptors,
    exec_workers: usize,
    exec_queue_max: usize,
    debug: bool,
}

impl Default for MqttServerCreator {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.into(),
            ip: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            heartbeat_timeout: None,
            buffer_allocator: BufferAllocator::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            tls: None,
            stat_listener: None,
            auth_handler: Arc::new(DefaultAuthHandler),
            session_manager: Arc::new(InMemorySessionManager::new()),
            sub_manager: None,
            message_store: Arc::new(InMemoryMessageStore::new()),
            connect_status_listener: Arc::new(DefaultConnectStatusListener),
            interceptors: MessageInterceptors::new(),
            exec_workers: DEFAULT_WORKERS,
            exec_queue_max: DEFAULT_QUEUE_MAX,
            debug: false,
        }
    }
}

impl MqttServerCreator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name<N: Into<String>>(mut self, name: N) -> Self {
        self.name = name.into();
        self
    }

    pub fn ip<I: Into<String>>(mut self, ip: I) -> Self {
        self.ip = ip.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// `None` or zero disables the heartbeat check.
    pub fn heartbeat_timeout(mut self, heartbeat_timeout: Option<Duration>) -> Self {
        self.heartbeat_timeout = heartbeat_timeout.filter(|d| !d.is_zero());
        self
    }

    pub fn buffer_allocator(mut self, buffer_allocator: BufferAllocator) -> Self {
        self.buffer_allocator = buffer_allocator;
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

    /// Loads PEM certificate chain and key, and optionally a client CA for mutual TLS.
    /// Load errors are reported by [`Self::build`].
    ///
    /// The key must be an unencrypted PKCS#8, PKCS#1 or SEC1 PEM. Password protected keys
    /// are not supported, decrypt them beforehand (e.g. `openssl pkey -in enc.key -out server.key`).
    pub fn use_tls_files<P: AsRef<Path>>(mut self, cert_file: P, key_file: P, client_ca_file: Option<P>) -> Self {
        self.tls = Some(load_tls_config_from_files(cert_file, key_file, client_ca_file).map_err(|e| e.to_string()));
        self
    }

    /// Same as [`Self::use_tls_files`] with PEM readers. The key must be unencrypted.
    pub fn use_tls_readers<R: Read>(mut self, cert: R, key: R, client_ca: Option<R>) -> Self {
        self.tls = Some(load_tls_config_from_readers(cert, key, client_ca).map_err(|e| e.to_string()));
        self
    }

    pub fn stat_listener(mut self, stat_listener: Arc<dyn StatListener>) -> Self {
        self.stat_listener = Some(stat_listener);
        self
    }

    pub fn auth_handler(mut self, auth_handler: Arc<dyn AuthHandler>) -> Self {
        self.auth_handler = auth_handler;
        self
    }

    pub fn session_manager(mut self, session_manager: Arc<dyn SessionManager>) -> Self {
        self.session_manager = session_manager;
        self
    }

    /// Required.
    pub fn sub_manager(mut self, sub_manager: Arc<dyn SubscriptionManager>) -> Self {
        self.sub_manager = Some(sub_manager);
        self
    }

    pub fn message_store(mut self, message_store: Arc<dyn MessageStore>) -> Self {
        self.message_store = message_store;
        self
    }

    pub fn connect_status_listener(mut self, connect_status_listener: Arc<dyn ConnectStatusListener>) -> Self {
        self.connect_status_listener = connect_status_listener;
        self
    }

    /// Appends an interceptor, interceptors run in the order they were added.
    pub fn message_interceptor(mut self, interceptor: Arc<dyn MessageInterceptor>) -> Self {
        self.interceptors.add(interceptor);
        self
    }

    /// Sizes the worker pool that runs online/offline notifications.
    pub fn task_exec(mut self, workers: usize, queue_max: usize) -> Self {
        self.exec_workers = workers.max(1);
        self.exec_queue_max = queue_max.max(1);
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Validates the settings. Nothing is started or bound here.
    pub fn build(self) -> std::result::Result<ServerConfig, ServerError> {
        let sub_manager = self.sub_manager.ok_or(ServerError::MissingSubscriptionManager)?;
        let tls = self.tls.transpose().map_err(ServerError::Tls)?;
        let ip = self
            .ip
            .parse::<IpAddr>()
            .map_err(|e| ServerError::InvalidAddress(format!("{}, {}", self.ip, e)))?;

        Ok(ServerConfig {
            name: self.name,
            laddr: SocketAddr::new(ip, self.port),
            heartbeat_timeout: self.heartbeat_timeout,
            buffer_allocator: self.buffer_allocator,
            read_buffer_size: self.read_buffer_size,
            max_packet_size: self.max_packet_size,
            tls,
            stat_listener: self.stat_listener,
            auth_handler: self.auth_handler,
            session_manager: self.session_manager,
            sub_manager,
            message_store: self.message_store,
            connect_status_listener: self.connect_status_listener,
            interceptors: self.interceptors,
            exec_workers: self.exec_workers,
            exec_queue_max: self.exec_queue_max,
            debug: self.debug,
        })
    }

    /// [`Self::build`] followed by [`MqttServer::start`].
    pub async fn start(self) -> Result<MqttServer> {
        MqttServer::start(self.build()?).await
    }
}

/// Validated, immutable server settings.
#[derive(Clone)]
pub struct ServerConfig {
    name: String,
    laddr: SocketAddr,
    heartbeat_timeout: Option<Duration>,
    buffer_allocator: BufferAllocator,
    read_buffer_size: usize,
    max_packet_size: u32,
    tls: Option<Arc<rustls::ServerConfig>>,
    stat_listener: Option<Arc<dyn StatListener>>,
    auth_handler: Arc<dyn AuthHandler>,
    session_manager: Arc<dyn SessionManager>,
    sub_manager: Arc<dyn SubscriptionManager>,
    message_store: Arc<dyn MessageStore>,
    connect_status_listener: Arc<dyn ConnectStatusListener>,
    interceptors: MessageInterceptors,
    exec_workers: usize,
    exec_queue_max: usize,
    debug: bool,
}

impl ServerConfig {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn laddr(&self) -> SocketAddr {
        self.laddr
    }

    #[inline]
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        self.heartbeat_timeout
    }

    #[inline]
    pub fn buffer_allocator(&self) -> BufferAllocator {
        self.buffer_allocator
    }

    #[inline]
    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }

    #[inline]
    pub fn max_packet_size(&self) -> u32 {
        self.max_packet_size
    }

    #[inline]
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    #[inline]
    pub fn is_debug(&self) -> bool {
        self.debug
    }

    #[inline]
    pub fn interceptors_count(&self) -> usize {
        self.interceptors.len()
    }

    #[inline]
    pub fn exec_workers(&self) -> usize {
        self.exec_workers
    }

    #[inline]
    pub fn exec_queue_max(&self) -> usize {
        self.exec_queue_max
    }

    fn transport_config(&self, handler: MqttServerHandler, listener: MqttServerListener) -> TransportConfig {
        let mut cfg = TransportConfig::new(self.name.clone(), Arc::new(handler), Arc::new(listener))
            .heartbeat_timeout(self.heartbeat_timeout);
        if let Some(stat_listener) = &self.stat_listener {
            cfg = cfg.stat_listener(stat_listener.clone());
        }
        cfg = cfg.read_buffer_size(self.read_buffer_size).max_packet_size(self.max_packet_size);
        if let Some(tls) = &self.tls {
            cfg = cfg.tls(tls.clone());
        }
        cfg.debug(self.debug)
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("name", &self.name)
            .field("laddr", &self.laddr)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("buffer_allocator", &self.buffer_allocator)
            .field("read_buffer_size", &self.read_buffer_size)
            .field("max_packet_size", &self.max_packet_size)
            .field("tls", &self.tls.is_some())
            .field("interceptors", &self.interceptors.len())
            .field("exec_workers", &self.exec_workers)
            .field("exec_queue_max", &self.exec_queue_max)
            .field("debug", &self.debug)
            .finish()
    }
}

/// A running MQTT server.
pub struct MqttServer {
    config: ServerConfig,
    local_addr: SocketAddr,
    transport: TransportServer,
    publish_manager: Arc<dyn PublishManager>,
    dispatcher: Arc<DefaultMessageDispatcher>,
    executor: Arc<TaskExecutor>,
}

impl MqttServer {
    /// Wires the broker together and binds the configured address.
    pub async fn start(config: ServerConfig) -> Result<MqttServer> {
        let executor = Arc::new(TaskExecutor::new(config.exec_workers, config.exec_queue_max));
        let connections = Connections::new();

        let publish_manager: Arc<dyn PublishManager> = Arc::new(DefaultPublishManager::new());
        let dispatcher = Arc::new(DefaultMessageDispatcher::new(
            connections.clone(),
            config.session_manager.clone(),
            config.sub_manager.clone(),
            publish_manager.clone(),
            config.message_store.clone(),
        ));
        let processor = Arc::new(DefaultMqttServerProcessor::new(
            connections.clone(),
            config.session_manager.clone(),
            config.auth_handler.clone(),
            config.sub_manager.clone(),
            publish_manager.clone(),
            config.message_store.clone(),
            dispatcher.clone(),
            config.connect_status_listener.clone(),
            executor.clone(),
        ));
        let handler = MqttServerHandler::new(config.buffer_allocator, processor);
        let listener = MqttServerListener::new(
            config.session_manager.clone(),
            config.sub_manager.clone(),
            publish_manager.clone(),
            config.message_store.clone(),
            dispatcher.clone(),
            config.connect_status_listener.clone(),
            config.interceptors.clone(),
            executor.clone(),
        );

        let transport = TransportServer::with_connections(config.transport_config(handler, listener), connections);
        let local_addr = match transport.start(config.laddr).await {
            Ok(local_addr) => local_addr,
            Err(e) => {
                executor.shutdown(Duration::ZERO).await;
                return Err(match e.downcast::<io::Error>() {
                    Ok(e) => ServerError::Bind(e).into(),
                    Err(e) => e,
                });
            }
        };
        log::info!("{} started, listening on {}", config.name, local_addr);

        Ok(MqttServer { config, local_addr, transport, publish_manager, dispatcher, executor })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[inline]
    pub fn connections(&self) -> &Connections {
        self.transport.connections()
    }

    #[inline]
    pub fn session_manager(&self) -> &Arc<dyn SessionManager> {
        &self.config.session_manager
    }

    #[inline]
    pub fn publish_manager(&self) -> &Arc<dyn PublishManager> {
        &self.publish_manager
    }

    #[inline]
    pub fn dispatcher(&self) -> &Arc<DefaultMessageDispatcher> {
        &self.dispatcher
    }

    #[inline]
    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    /// Publishes a message on behalf of the server.
    pub async fn publish(&self, message: Message) -> Result<bool> {
        self.dispatcher.send(message).await
    }

    /// Stops accepting, closes every live connection, then shuts the task executor down.
    pub async fn stop(&self) {
        self.transport.stop().await;
        self.executor.shutdown(EXECUTOR_SHUTDOWN_GRACE).await;
        log::info!("{} stopped", self.config.name);
    }
}
