//! Server configuration.
//!
//! A [`ServerConfig`] is built once at startup (by the CLI, or directly in
//! tests) and handed by reference to every component. Nothing in kestrel
//! reads configuration from globals.

use crate::error::{KestrelError, Result};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default address for the main listener.
pub const DEFAULT_ADDR: &str = "0.0.0.0:3000";
/// Fixed plain HTTP address used in production mode.
pub const PRODUCTION_PLAIN_ADDR: &str = "0.0.0.0:80";
/// Fixed HTTPS address used in production mode.
pub const PRODUCTION_SECURE_ADDR: &str = "0.0.0.0:443";
/// Default address of the Server-Sent Events listener.
pub const DEFAULT_EVENT_ADDR: &str = "0.0.0.0:5553";
/// File used when the configured internal log cannot be opened.
pub const FALLBACK_INTERNAL_LOG: &str = "internal.log";

/// Flags that select the protocol state at startup.
///
/// The flags are mutually exclusive in practice; when several are set the
/// precedence is `production`, then `just_http2`, then `just_http`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProtocolFlags {
    /// Serve HTTP on :80 and HTTPS on :443 at the same time
    pub production: bool,
    /// Serve plain HTTP only
    pub just_http: bool,
    /// Serve HTTP/2 without TLS only
    pub just_http2: bool,
}

/// Limits applied uniformly to every listener.
///
/// The response header timeout only bounds the time until the response
/// head is produced. Bodies may stream for as long as the handler likes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ListenerLimits {
    pub header_read_timeout: Duration,
    pub response_header_timeout: Duration,
    pub max_header_bytes: usize,
}

impl Default for ListenerLimits {
    fn default() -> Self {
        Self {
            header_read_timeout: Duration::from_secs(5),
            response_header_timeout: Duration::from_secs(10),
            max_header_bytes: 1 << 20,
        }
    }
}

/// Settings for the filesystem-change event server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    pub event_addr: SocketAddr,
    pub base_path: PathBuf,
    pub refresh: Duration,
    pub pattern: String,
}

/// Immutable configuration for one server process.
///
/// # Example
///
/// ```
/// use kestrel_common::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig::new(".")
///     .with_addr("127.0.0.1:8080".parse().unwrap())
///     .with_shutdown_timeout(Duration::from_secs(3));
/// assert_eq!(config.addr.port(), 8080);
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory served by the default routes
    pub server_dir: PathBuf,
    pub addr: SocketAddr,
    pub production_plain_addr: SocketAddr,
    pub production_secure_addr: SocketAddr,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub protocol: ProtocolFlags,
    pub limits: ListenerLimits,
    pub shutdown_timeout: Duration,
    /// Configuration scripts, run in order when they exist
    pub configuration_scripts: Vec<PathBuf>,
    /// Script that replaces the default request handlers entirely
    pub server_script: Option<PathBuf>,
    pub internal_log: PathBuf,
    pub server_log: Option<PathBuf>,
    pub profile: Option<PathBuf>,
    pub watch: Option<WatchConfig>,
    pub use_database: bool,
    pub cache_entries: usize,
    pub interactive: bool,
    pub quiet: bool,
    pub debug: bool,
}

impl ServerConfig {
    /// Creates a configuration serving `server_dir` with default settings.
    pub fn new(server_dir: impl Into<PathBuf>) -> Self {
        Self {
            server_dir: server_dir.into(),
            addr: fixed_addr(DEFAULT_ADDR, 3000),
            production_plain_addr: fixed_addr(PRODUCTION_PLAIN_ADDR, 80),
            production_secure_addr: fixed_addr(PRODUCTION_SECURE_ADDR, 443),
            cert: PathBuf::from("cert.pem"),
            key: PathBuf::from("key.pem"),
            protocol: ProtocolFlags::default(),
            limits: ListenerLimits::default(),
            shutdown_timeout: Duration::from_secs(10),
            configuration_scripts: vec![
                PathBuf::from("serverconf.js"),
                PathBuf::from("server").join("serverconf.js"),
            ],
            server_script: None,
            internal_log: PathBuf::from("/dev/fd/2"),
            server_log: None,
            profile: None,
            watch: None,
            use_database: true,
            cache_entries: 1024,
            interactive: false,
            quiet: false,
            debug: false,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_production_addrs(mut self, plain: SocketAddr, secure: SocketAddr) -> Self {
        self.production_plain_addr = plain;
        self.production_secure_addr = secure;
        self
    }

    pub fn with_tls_files(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.cert = cert.into();
        self.key = key.into();
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolFlags) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_limits(mut self, limits: ListenerLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_configuration_scripts(mut self, scripts: Vec<PathBuf>) -> Self {
        self.configuration_scripts = scripts;
        self
    }

    pub fn with_server_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.server_script = Some(script.into());
        self
    }

    pub fn with_watch(mut self, watch: WatchConfig) -> Self {
        self.watch = Some(watch);
        self
    }

    pub fn with_database(mut self, use_database: bool) -> Self {
        self.use_database = use_database;
        self
    }

    /// Host part of the main address, as shown in server information.
    pub fn server_host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The shutdown timeout is zero or longer than one hour
    /// - A listener limit is zero
    /// - The render cache has no room for entries
    pub fn validate(&self) -> Result<()> {
        if self.shutdown_timeout.is_zero() {
            return Err(KestrelError::InvalidConfig(
                "shutdown timeout must be greater than zero".into(),
            ));
        }
        if self.shutdown_timeout.as_secs() > 3600 {
            return Err(KestrelError::InvalidConfig(format!(
                "shutdown timeout must be <= 1 hour (got {} seconds)",
                self.shutdown_timeout.as_secs()
            )));
        }
        if self.limits.header_read_timeout.is_zero() || self.limits.response_header_timeout.is_zero() {
            return Err(KestrelError::InvalidConfig(
                "header timeouts must be greater than zero".into(),
            ));
        }
        if self.limits.max_header_bytes == 0 {
            return Err(KestrelError::InvalidConfig(
                "maximum header size must be greater than zero".into(),
            ));
        }
        if self.cache_entries == 0 {
            return Err(KestrelError::InvalidConfig(
                "render cache must hold at least one entry".into(),
            ));
        }
        Ok(())
    }
}

/// Parses a listen address, accepting the `:port` shorthand for all interfaces.
///
/// ```
/// use kestrel_common::config::parse_listen_addr;
///
/// assert_eq!(parse_listen_addr(":8080").unwrap().to_string(), "0.0.0.0:8080");
/// assert_eq!(parse_listen_addr("localhost:80").unwrap().to_string(), "127.0.0.1:80");
/// ```
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    let normalized = if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{}", port)
    } else if let Some(port) = addr.strip_prefix("localhost:") {
        format!("127.0.0.1:{}", port)
    } else {
        addr.to_string()
    };
    normalized
        .parse()
        .map_err(|e| KestrelError::InvalidConfig(format!("Invalid address {}: {}", addr, e)))
}

/// Whether a file or directory at `path` can be opened for reading.
pub fn is_readable(path: &Path) -> bool {
    if path.is_dir() {
        std::fs::read_dir(path).is_ok()
    } else {
        std::fs::File::open(path).is_ok()
    }
}

fn fixed_addr(addr: &str, port: u16) -> SocketAddr {
    addr.parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)))
}
