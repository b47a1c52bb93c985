//! The relay inbound and its staged lifecycle.
//!
//! ```text
//! Created ──start──► Starting ──► Running ──post_start──► PostStarting ──► Meshed
//!                        │                                     │
//!                        └──────────────► Failed ◄─────────────┘
//!
//! any state ──close──► Closing ──► Closed
//! ```
//!
//! [`RelayInbound::start`] brings up the identity, the relay engine, TLS, the
//! HTTP listener and the STUN responder. [`RelayInbound::post_start`] then
//! starts mesh federation, which needs a running engine and a mesh key.

use crate::config::{ConfigError, InboundConfig};
use crate::dialer::{Dialer, DirectDialer, DnsLookup, SystemResolver};
use crate::engine::{ClientAdmission, RelayServer, SessionHandler};
use crate::error::{is_closed_or_canceled, is_retryable, InboundError, Result};
use crate::http::{build_router, BootstrapDns, ConnectionService, HomePage};
use crate::keystore;
use crate::mesh::{MeshConnector, MeshFederator};
use crate::metrics::{InboundMetrics, MetricsSnapshot};
use crate::stun;
use crate::tls::{ensure_h2, TlsTermination};
use axum::Router;
use derp_types::MeshKey;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Upper bound on a TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept`.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Lifecycle state of a [`RelayInbound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundState {
    /// Constructed, not started.
    Created,
    /// Start in progress.
    Starting,
    /// Listener and STUN responder are serving.
    Running,
    /// PostStart in progress.
    PostStarting,
    /// Mesh loops are running (or none are configured).
    Meshed,
    /// Close in progress.
    Closing,
    /// Closed; terminal.
    Closed,
    /// A stage failed; only close is allowed.
    Failed,
}

/// Host-supplied collaborators.
#[derive(Clone)]
pub struct Collaborators {
    /// Per-connection DERP protocol engine.
    pub session_handler: Arc<dyn SessionHandler>,
    /// Mesh client factory; required only when mesh peers are configured.
    pub mesh_connector: Option<Arc<dyn MeshConnector>>,
    /// DNS lookup for dialers and bootstrap DNS.
    pub resolver: Arc<dyn DnsLookup>,
}

impl Collaborators {
    /// Collaborators using the system resolver and no mesh connector.
    pub fn new(session_handler: Arc<dyn SessionHandler>) -> Self {
        Self {
            session_handler,
            mesh_connector: None,
            resolver: Arc::new(SystemResolver),
        }
    }

    /// Use `connector` for mesh peers.
    pub fn with_mesh_connector(mut self, connector: Arc<dyn MeshConnector>) -> Self {
        self.mesh_connector = Some(connector);
        self
    }

    /// Resolve names through `resolver`.
    pub fn with_resolver(mut self, resolver: Arc<dyn DnsLookup>) -> Self {
        self.resolver = resolver;
        self
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("mesh_connector", &self.mesh_connector.is_some())
            .finish_non_exhaustive()
    }
}

/// What Start produced.
struct Running {
    server: Arc<RelayServer>,
    local_addr: SocketAddr,
    stun_addr: Option<SocketAddr>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

/// A DERP relay inbound.
pub struct RelayInbound {
    config: InboundConfig,
    key_path: PathBuf,
    inline_mesh_key: Option<MeshKey>,
    dialer: Arc<dyn Dialer>,
    collaborators: Collaborators,
    tls: TlsTermination,
    state: Mutex<InboundState>,
    running: Mutex<Option<Running>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    metrics: Arc<InboundMetrics>,
}

impl std::fmt::Debug for RelayInbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayInbound")
            .field("state", &self.state())
            .field("key_path", &self.key_path)
            .field("local_addr", &self.local_addr())
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RelayInbound {
    /// Validate `config` and create an unstarted inbound.
    ///
    /// # Errors
    ///
    /// Fails when TLS is missing or disabled, no key path can be resolved,
    /// or the inline mesh key is malformed.
    pub fn new(config: InboundConfig, collaborators: Collaborators) -> Result<Self> {
        let tls = config
            .tls
            .as_ref()
            .filter(|tls| tls.enabled)
            .ok_or(ConfigError::TlsRequired)?;
        let tls = TlsTermination::new(tls);

        let key_path = keystore::resolve_path(config.config_path.as_deref())
            .ok_or(ConfigError::MissingConfigPath)?;

        let inline_mesh_key = config
            .inline_mesh_key()
            .map(MeshKey::parse)
            .transpose()
            .map_err(ConfigError::InvalidMeshKey)?;

        let dialer = Arc::new(DirectDialer::new(
            &config.dialer,
            collaborators.resolver.clone(),
        ));

        Ok(Self {
            config,
            key_path,
            inline_mesh_key,
            dialer,
            collaborators,
            tls,
            state: Mutex::new(InboundState::Created),
            running: Mutex::new(None),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            metrics: Arc::new(InboundMetrics::default()),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> InboundState {
        *lock(&self.state)
    }

    /// Bound address of the HTTP/TLS listener, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.running).as_ref().map(|r| r.local_addr)
    }

    /// Bound address of the STUN socket, when STUN is enabled and started.
    pub fn stun_addr(&self) -> Option<SocketAddr> {
        lock(&self.running).as_ref().and_then(|r| r.stun_addr)
    }

    /// The relay engine, once started.
    pub fn server(&self) -> Option<Arc<RelayServer>> {
        lock(&self.running).as_ref().map(|r| r.server.clone())
    }

    /// Operational counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn transition(
        &self,
        operation: &'static str,
        from: InboundState,
        to: InboundState,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        if *state != from {
            return Err(InboundError::InvalidState {
                operation,
                state: *state,
            });
        }
        *state = to;
        Ok(())
    }

    fn finish(&self, result: &Result<()>, success: InboundState) {
        let mut state = lock(&self.state);
        // Close may have run concurrently; never leave Closing/Closed.
        if matches!(*state, InboundState::Closing | InboundState::Closed) {
            return;
        }
        *state = if result.is_ok() {
            success
        } else {
            InboundState::Failed
        };
    }

    /// Stage 1: bring up identity, engine, routes, TLS, listener and STUN.
    ///
    /// No background task is spawned unless every step succeeds.
    pub async fn start(&self) -> Result<()> {
        self.transition("start", InboundState::Created, InboundState::Starting)?;
        let result = self.start_inner().await;
        if let Err(e) = &result {
            tracing::warn!("Relay inbound failed to start: {}", e);
        }
        self.finish(&result, InboundState::Running);
        result
    }

    async fn start_inner(&self) -> Result<()> {
        let identity = keystore::load_or_create(&self.key_path).await?;
        let admission = ClientAdmission::new(self.config.verify_client_url.clone(), self.dialer.clone())?;
        let server = Arc::new(RelayServer::new(
            identity.private_key,
            admission,
            self.collaborators.session_handler.clone(),
        ));

        if let Some(key) = self.load_mesh_key().await? {
            server.set_mesh_key(key);
        }

        let home = HomePage::parse(&self.config.home)?;
        let dns = BootstrapDns {
            resolver: self.collaborators.resolver.clone(),
            options: self.dialer.query_options(),
        };
        let router = build_router(server.clone(), home, dns);

        self.tls.start()?;

        let listen = SocketAddr::new(self.config.listen, self.config.listen_port);
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| InboundError::Bind { addr: listen, source: e })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| InboundError::Bind { addr: listen, source: e })?;
        self.tls.set_next_protocols(ensure_h2(self.tls.next_protocols()));
        let acceptor = self.tls.acceptor()?;

        let stun = if self.config.stun_port != 0 {
            Some(bind_stun(SocketAddr::new(self.config.listen, self.config.stun_port)).await?)
        } else {
            None
        };
        let stun_addr = stun.as_ref().map(|(_, addr)| *addr);

        let mut tasks = Vec::with_capacity(2);
        tasks.push((
            "http",
            tokio::spawn(serve_http(
                listener,
                acceptor,
                router,
                self.metrics.clone(),
                self.cancel.clone(),
                self.tracker.clone(),
            )),
        ));
        tracing::info!(
            "Relay inbound {} listening on {}",
            server.public_key(),
            local_addr
        );

        if let Some((socket, addr)) = stun {
            tasks.push((
                "stun",
                tokio::spawn(stun::serve(socket, self.metrics.clone(), self.cancel.clone())),
            ));
            tracing::info!("STUN responder listening on {}", addr);
        }

        *lock(&self.running) = Some(Running {
            server,
            local_addr,
            stun_addr,
            tasks,
        });
        Ok(())
    }

    async fn load_mesh_key(&self) -> Result<Option<MeshKey>> {
        if let Some(key) = &self.inline_mesh_key {
            return Ok(Some(key.clone()));
        }
        let Some(path) = &self.config.mesh_psk_file else {
            return Ok(None);
        };
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| InboundError::MeshKeyFile {
                path: path.clone(),
                source: e,
            })?;
        let key = MeshKey::parse(content.trim_end()).map_err(|e| ConfigError::InvalidMeshKeyFile {
            path: path.clone(),
            source: e,
        })?;
        Ok(Some(key))
    }

    /// Stage 2: start one mesh watch loop per configured peer.
    ///
    /// Every peer is attempted; all setup failures are reported together.
    pub fn post_start(&self) -> Result<()> {
        self.transition(
            "post_start",
            InboundState::Running,
            InboundState::PostStarting,
        )?;
        let result = self.post_start_inner();
        if let Err(e) = &result {
            tracing::warn!("Relay inbound mesh setup failed: {}", e);
        }
        self.finish(&result, InboundState::Meshed);
        result
    }

    fn post_start_inner(&self) -> Result<()> {
        if self.config.mesh_with.is_empty() {
            return Ok(());
        }
        let server = self.server().ok_or(InboundError::InvalidState {
            operation: "post_start",
            state: InboundState::PostStarting,
        })?;
        if !server.has_mesh_key() {
            return Err(InboundError::MissingMeshKey);
        }
        let connector = self
            .collaborators
            .mesh_connector
            .clone()
            .ok_or(InboundError::MissingMeshConnector)?;

        let federator = MeshFederator::new(
            server,
            connector,
            self.collaborators.resolver.clone(),
            self.cancel.clone(),
            self.tracker.clone(),
        );
        let errors = self
            .config
            .mesh_with
            .iter()
            .filter_map(|peer| federator.start_peer(peer).err())
            .map(InboundError::from)
            .collect();
        InboundError::from_many(errors)
    }

    /// Stop every task and release the listener, STUN socket and TLS resource.
    ///
    /// Idempotent; failures are collected rather than stopping the close.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if matches!(*state, InboundState::Closing | InboundState::Closed) {
                return Ok(());
            }
            *state = InboundState::Closing;
        }

        self.cancel.cancel();
        let tasks = lock(&self.running)
            .as_mut()
            .map(|running| std::mem::take(&mut running.tasks))
            .unwrap_or_default();

        let mut errors = Vec::new();
        for (name, task) in tasks {
            if let Err(e) = task.await {
                errors.push(InboundError::Task {
                    name,
                    reason: e.to_string(),
                });
            }
        }
        self.tracker.close();
        self.tracker.wait().await;
        if let Err(e) = self.tls.close() {
            errors.push(e.into());
        }

        *lock(&self.state) = InboundState::Closed;
        tracing::info!("Relay inbound closed");
        InboundError::from_many(errors)
    }
}

impl Drop for RelayInbound {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn bind_stun(addr: SocketAddr) -> Result<(Arc<UdpSocket>, SocketAddr)> {
    let bind_error = |e: std::io::Error| InboundError::Bind { addr, source: e };
    let socket = UdpSocket::bind(addr).await.map_err(bind_error)?;
    let local = socket.local_addr().map_err(bind_error)?;
    Ok((Arc::new(socket), local))
}

async fn serve_http(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    metrics: Arc<InboundMetrics>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (tcp, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(e) if is_closed_or_canceled(&e) => break,
            Err(e) if is_retryable(&e) => {
                tracing::debug!("Accept interrupted: {}", e);
                continue;
            }
            Err(e) => {
                tracing::warn!("Accept error: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => continue,
                }
            }
        };
        InboundMetrics::incr(&metrics.connections_total);

        let acceptor = acceptor.clone();
        let service =
            ConnectionService::new(router.clone(), remote, tracker.clone(), cancel.clone());
        let metrics = metrics.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = serve_connection(tcp, remote, acceptor, service, metrics) => {}
            }
        });
    }
    tracing::debug!("HTTP listener stopped");
}

async fn serve_connection(
    tcp: TcpStream,
    remote: SocketAddr,
    acceptor: TlsAcceptor,
    service: ConnectionService,
    metrics: Arc<InboundMetrics>,
) {
    if let Err(e) = tcp.set_nodelay(true) {
        tracing::debug!("Failed to set TCP_NODELAY for {}: {}", remote, e);
    }
    let stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            InboundMetrics::incr(&metrics.tls_handshake_failures);
            tracing::debug!("TLS handshake with {} failed: {}", remote, e);
            return;
        }
        Err(_) => {
            InboundMetrics::incr(&metrics.tls_handshake_failures);
            tracing::debug!("TLS handshake with {} timed out", remote);
            return;
        }
    };

    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
    {
        InboundMetrics::incr(&metrics.http_errors_total);
        tracing::debug!("HTTP connection from {} ended: {}", remote, e);
    }
}
