//! Protocol server
//!
//! Selects a [`ProtocolState`] from the configuration, binds the listeners
//! for it and serves until stopped. `SecureUpgradedHttp` is the only state
//! that can fail over: when the certificate cannot be loaded or the address
//! cannot be bound, the server logs a warning and serves plain HTTP on the
//! same address instead.
//!
//! # Example
//!
//! ```no_run
//! use kestrel_common::ServerConfig;
//! use kestrel_server::http_router::RequestRouter;
//! use kestrel_server::pipeline::ConfigurationPipeline;
//! use kestrel_server::protocol::{shutdown_signal, ProtocolServer};
//! use kestrel_server::runtime::ContextPool;
//! use kestrel_server::shutdown::ShutdownRegistry;
//! use std::sync::Arc;
//!
//! # async fn run() -> kestrel_common::Result<()> {
//! let config = ServerConfig::new(".");
//! let registry = ShutdownRegistry::new();
//! let pipeline = ConfigurationPipeline::new(ContextPool::default(), 1024);
//! let router = Arc::new(RequestRouter::new(pipeline.capabilities(None)));
//!
//! let running = ProtocolServer::new(&config, router).start(&registry).await?;
//! let report = running.serve_until(shutdown_signal()).await;
//! registry.run_all();
//! println!("served as {:?}", report.attempted);
//! # Ok(())
//! # }
//! ```

pub(crate) mod listener;
mod state;
mod tls;

pub use listener::ConnMode;
pub use state::ProtocolState;
pub use tls::load_tls_acceptor;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kestrel_common::{KestrelError, ListenerLimits, Result, ServerConfig};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::http_router::HttpHandler;
use crate::shutdown::ShutdownRegistry;

/// Shared stop trigger for the listeners.
///
/// The first call to [`trigger`](Self::trigger) wins; later calls do nothing.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
    initiated: Arc<AtomicBool>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            initiated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Requests a stop. Returns true for the call that initiated it.
    pub fn trigger(&self) -> bool {
        if self.initiated.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.tx.send_replace(true);
        tracing::debug!("Stop requested");
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.initiated.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        let mut rx = self.subscribe();
        // An error means every sender is gone, which also means stop
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Outcome of a serving run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeReport {
    /// States attempted, in order
    pub attempted: Vec<ProtocolState>,
    pub final_state: ProtocolState,
}

pub struct ProtocolServer {
    config: ServerConfig,
    handler: Arc<dyn HttpHandler>,
    stop: StopHandle,
}

impl ProtocolServer {
    pub fn new(config: &ServerConfig, handler: Arc<dyn HttpHandler>) -> Self {
        Self {
            config: config.clone(),
            handler,
            stop: StopHandle::new(),
        }
    }

    /// Uses an existing stop trigger, so other components can stop serving.
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Binds the listeners for the selected state and starts serving.
    ///
    /// Registers a "stop listeners" action with `registry`.
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::Transport` when a plain listener cannot be
    /// bound. A failing secure listener falls back (`SecureUpgradedHttp`) or
    /// is skipped with a warning (`Production`).
    pub async fn start(self, registry: &ShutdownRegistry) -> Result<RunningServer> {
        let initial = ProtocolState::select(&self.config.protocol);
        let mut running = RunningServer {
            attempted: vec![initial],
            listeners: Vec::new(),
            stop: self.stop.clone(),
        };

        match initial {
            ProtocolState::PlainHttp => {
                self.spawn_plain(&mut running, self.config.addr, ConnMode::Http1).await?;
            }
            ProtocolState::UpgradedHttp => {
                self.spawn_plain(&mut running, self.config.addr, ConnMode::Http2).await?;
            }
            ProtocolState::SecureUpgradedHttp => {
                if let Err(e) = self.spawn_secure(&mut running, self.config.addr).await {
                    let next = initial.fallback().unwrap_or(ProtocolState::PlainHttp);
                    tracing::warn!(error = %e, "Could not serve {}, falling back to {}", initial, next);
                    running.attempted.push(next);
                    self.spawn_plain(&mut running, self.config.addr, ConnMode::Http1).await?;
                }
            }
            ProtocolState::Production => {
                self.spawn_plain(&mut running, self.config.production_plain_addr, ConnMode::Http1)
                    .await?;
                if let Err(e) = self
                    .spawn_secure(&mut running, self.config.production_secure_addr)
                    .await
                {
                    tracing::warn!(error = %e, "Could not serve HTTPS, serving HTTP only");
                }
            }
            ProtocolState::Stopped => {
                return Err(KestrelError::InvalidConfig("cannot start in the stopped state".into()));
            }
        }

        let stop = self.stop.clone();
        registry.register("stop listeners", move || {
            stop.trigger();
            Ok(())
        });

        Ok(running)
    }

    async fn spawn_plain(&self, running: &mut RunningServer, addr: SocketAddr, mode: ConnMode) -> Result<()> {
        let listener = bind(addr).await?;
        self.spawn_listener(running, listener, None, mode)
    }

    async fn spawn_secure(&self, running: &mut RunningServer, addr: SocketAddr) -> Result<()> {
        let acceptor = load_tls_acceptor(&self.config.cert, &self.config.key)?;
        let listener = bind(addr).await?;
        self.spawn_listener(running, listener, Some(acceptor), ConnMode::Auto)
    }

    fn spawn_listener(
        &self,
        running: &mut RunningServer,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
        mode: ConnMode,
    ) -> Result<()> {
        let addr = listener.local_addr()?;
        let secure = tls.is_some();
        tracing::info!(
            addr = %addr,
            tls = secure,
            "Serving {} on {}",
            if secure { "HTTPS" } else if mode == ConnMode::Http2 { "HTTP/2" } else { "HTTP" },
            addr
        );

        let limits: ListenerLimits = self.config.limits;
        let grace: Duration = self.config.shutdown_timeout;
        let task = tokio::spawn(listener::run_accept_loop(
            listener,
            tls,
            mode,
            limits,
            self.handler.clone(),
            self.stop.subscribe(),
            grace,
        ));
        running.listeners.push(Listener { addr, secure, task });
        Ok(())
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| KestrelError::Transport(format!("Failed to bind to {}: {}", addr, e)))
}

struct Listener {
    addr: SocketAddr,
    secure: bool,
    task: JoinHandle<()>,
}

/// Listeners that are accepting connections.
pub struct RunningServer {
    attempted: Vec<ProtocolState>,
    listeners: Vec<Listener>,
    stop: StopHandle,
}

impl RunningServer {
    /// The state being served.
    pub fn state(&self) -> ProtocolState {
        self.attempted
            .last()
            .copied()
            .unwrap_or(ProtocolState::Stopped)
    }

    /// States attempted so far, in order.
    pub fn transitions(&self) -> &[ProtocolState] {
        &self.attempted
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|l| l.addr).collect()
    }

    pub fn secure_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().filter(|l| l.secure).map(|l| l.addr).collect()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Stops the listener on `addr` and leaves the others serving.
    ///
    /// Open connections on that listener are dropped. Returns false if no
    /// listener is bound to `addr`.
    pub fn stop_listener(&self, addr: SocketAddr) -> bool {
        match self.listeners.iter().find(|l| l.addr == addr) {
            Some(listener) => {
                listener.task.abort();
                tracing::info!(addr = %addr, "Stopped listener");
                true
            }
            None => false,
        }
    }

    /// Waits for every listener to finish draining.
    pub async fn wait(self) -> ServeReport {
        for listener in self.listeners {
            match listener.task.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {
                    tracing::debug!(addr = %listener.addr, "Listener was stopped early");
                }
                Err(e) => {
                    tracing::error!(target: "kestrel::internal", addr = %listener.addr, error = %e, "Listener task failed");
                }
            }
        }
        ServeReport {
            attempted: self.attempted,
            final_state: ProtocolState::Stopped,
        }
    }

    /// Serves until `signal` resolves or a stop is requested elsewhere.
    pub async fn serve_until<F>(self, signal: F) -> ServeReport
    where
        F: Future<Output = ()>,
    {
        let stop = self.stop.clone();
        tokio::select! {
            _ = signal => {
                if stop.trigger() {
                    tracing::info!("Received termination signal, shutting down");
                }
            }
            _ = stop.stopped() => {}
        }
        self.wait().await
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
