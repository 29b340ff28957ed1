//! TCP listener serving accepting handshakes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::audit::AuditLogger;
use crate::auth::{
    DaemonClass, DaemonDirectory, DiagnosticSink, FailureThrottle, FanoutSink, HandshakeContext,
    HandshakeOptions, JobKeyRegistry, RolePolicy, StaticPeerDirectory, TracingSink,
};
use crate::config::Settings;
use crate::error::DaemonError;

use super::{handle_connection, AuthenticatedConnection};

/// Connection metrics for monitoring.
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    /// Total handshakes finished.
    pub handshakes_total: AtomicU64,
    /// Handshakes that ended in failure.
    pub handshakes_failed: AtomicU64,
    /// Connections currently in a handshake.
    pub active_connections: AtomicUsize,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_handshake(&self, success: bool) {
        self.handshakes_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn total_handshakes(&self) -> u64 {
        self.handshakes_total.load(Ordering::Relaxed)
    }

    pub fn failed_handshakes(&self) -> u64 {
        self.handshakes_failed.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// Build the handshake context described by `settings`.
///
/// `jobs` and `throttle` outlive configuration reloads and are shared.
pub fn handshake_context(
    settings: &Settings,
    jobs: Arc<JobKeyRegistry>,
    throttle: Arc<FailureThrottle>,
) -> Arc<HandshakeContext> {
    let directory = DaemonDirectory::new(StaticPeerDirectory::new(&settings.peers), jobs);
    let mut options = HandshakeOptions::new(settings.daemon.name.clone());
    options.comm_compression = settings.security.comm_compression;
    options.reject_legacy_peers = settings.security.reject_legacy_peers;

    Arc::new(HandshakeContext {
        directory: Arc::new(directory),
        throttle,
        options,
    })
}

/// Build the throttle configured by `settings`.
pub fn failure_throttle(settings: &Settings) -> Arc<FailureThrottle> {
    Arc::new(match settings.security.failure_delay() {
        Some(delay) => FailureThrottle::with_delay(delay),
        None => FailureThrottle::new(),
    })
}

/// Tracing sink plus the audit logger when enabled.
pub fn diagnostic_sink(settings: &Settings) -> Arc<dyn DiagnosticSink> {
    let sink = FanoutSink::new().with(Arc::new(TracingSink));
    if !settings.audit.enabled {
        info!("Audit logging disabled");
        return Arc::new(sink);
    }

    match AuditLogger::new(&settings.audit.log_path) {
        Ok(logger) => {
            info!(path = %settings.audit.log_path.display(), "Audit logging enabled");
            Arc::new(sink.with(Arc::new(logger)))
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %settings.audit.log_path.display(),
                "Failed to create audit logger, audit logging disabled"
            );
            Arc::new(sink)
        }
    }
}

/// TCP server running one handshake task per connection.
pub struct SocketListener {
    listener: TcpListener,
    roles: &'static [RolePolicy],
    context: RwLock<Arc<HandshakeContext>>,
    jobs: Arc<JobKeyRegistry>,
    throttle: Arc<FailureThrottle>,
    sink: Arc<dyn DiagnosticSink>,
    metrics: Arc<ConnectionMetrics>,
    connection_semaphore: Arc<Semaphore>,
    max_connections: usize,
    max_message_size: usize,
    handoff: Option<mpsc::Sender<AuthenticatedConnection>>,
}

impl SocketListener {
    /// Bind to the configured listen address.
    pub async fn bind(settings: &Settings, jobs: Arc<JobKeyRegistry>) -> Result<Self, DaemonError> {
        let addr = settings.listen_addr()?.ok_or_else(|| DaemonError::Config {
            message: "daemon.listen is not set".to_string(),
        })?;
        Self::bind_addr(addr, settings, jobs).await
    }

    /// Bind to `addr`, taking everything else from `settings`.
    pub async fn bind_addr(
        addr: SocketAddr,
        settings: &Settings,
        jobs: Arc<JobKeyRegistry>,
    ) -> Result<Self, DaemonError> {
        let roles = RolePolicy::accepting_roles(settings.daemon.class);
        if roles.is_empty() {
            return Err(DaemonError::Config {
                message: format!("A {} does not accept connections", settings.daemon.class),
            });
        }

        let listener = TcpListener::bind(addr).await.map_err(|e| DaemonError::Socket {
            message: format!("Failed to bind to {}: {}", addr, e),
        })?;

        let throttle = failure_throttle(settings);
        let context = handshake_context(settings, Arc::clone(&jobs), Arc::clone(&throttle));
        let max_connections = settings.limits.max_concurrent_connections;
        info!(max_connections, "Connection limiting enabled");

        info!(
            addr = %addr,
            class = %settings.daemon.class,
            peers = settings.peers.len(),
            "Socket listener bound"
        );

        Ok(Self {
            listener,
            roles,
            context: RwLock::new(context),
            jobs,
            throttle,
            sink: diagnostic_sink(settings),
            metrics: Arc::new(ConnectionMetrics::new()),
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            max_message_size: settings.limits.max_message_size,
            handoff: None,
        })
    }

    /// Forward authenticated connections to `tx` instead of closing them.
    pub fn with_handoff(mut self, tx: mpsc::Sender<AuthenticatedConnection>) -> Self {
        self.handoff = Some(tx);
        self
    }

    /// Replace the diagnostic sink.
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DaemonError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn metrics(&self) -> Arc<ConnectionMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn throttle(&self) -> Arc<FailureThrottle> {
        Arc::clone(&self.throttle)
    }

    pub fn jobs(&self) -> Arc<JobKeyRegistry> {
        Arc::clone(&self.jobs)
    }

    /// Apply reloaded settings to connections accepted from now on.
    ///
    /// Peers, local name and protocol options change; the listen address,
    /// daemon class, throttle and job registry do not.
    pub fn reload(&self, settings: &Settings) {
        let context = handshake_context(settings, Arc::clone(&self.jobs), Arc::clone(&self.throttle));
        let mut guard = self.context.write().unwrap_or_else(|e| e.into_inner());
        *guard = context;
        info!(peers = settings.peers.len(), "Peer directory reloaded");
    }

    fn current_context(&self) -> Arc<HandshakeContext> {
        Arc::clone(&self.context.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Accept connections until `shutdown` is notified.
    ///
    /// Handshakes already running continue until they finish.
    pub async fn run(&self, shutdown: Arc<Notify>) -> Result<(), DaemonError> {
        info!("Socket listener running, waiting for connections...");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    warn!(
                                        max = self.max_connections,
                                        peer = %addr,
                                        "Connection limit reached, rejecting connection"
                                    );
                                    continue;
                                }
                            };

                            let roles = self.roles;
                            let ctx = self.current_context();
                            let sink = Arc::clone(&self.sink);
                            let metrics = Arc::clone(&self.metrics);
                            let handoff = self.handoff.clone();
                            let max_message_size = self.max_message_size;

                            metrics.active_connections.fetch_add(1, Ordering::Relaxed);
                            debug!(active = metrics.active(), peer = %addr, "New connection accepted");

                            tokio::spawn(async move {
                                let _permit = permit;
                                let result =
                                    handle_connection(stream, roles, ctx, sink, max_message_size).await;
                                let success = result.is_ok();

                                match result {
                                    Ok(connection) => {
                                        if let Some(tx) = handoff {
                                            if tx.send(connection).await.is_err() {
                                                warn!(peer = %addr, "Session consumer gone, dropping connection");
                                            }
                                        }
                                    }
                                    Err(DaemonError::Auth { .. }) => {}
                                    Err(e) => error!(error = %e, peer = %addr, "Connection handler error"),
                                }

                                metrics.record_handshake(success);
                                metrics.active_connections.fetch_sub(1, Ordering::Relaxed);
                                debug!(active = metrics.active(), success, "Connection closed");
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown.notified() => {
                    info!("Shutdown signal received, stopping listener");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Wait for all active handshakes to finish.
    pub async fn wait_for_drain(&self) {
        let poll_interval = std::time::Duration::from_millis(100);

        while self.metrics.active() > 0 {
            debug!(active = self.metrics.active(), "Waiting for connections to drain");
            tokio::time::sleep(poll_interval).await;
        }

        info!("All connections drained");
    }
}

/// Local daemon classes that serve handshakes on a socket.
pub fn accepts_connections(class: DaemonClass) -> bool {
    !RolePolicy::accepting_roles(class).is_empty()
}
