//! Command-line arguments.
//!
//! Parsed once with `argh` and turned into an immutable [`ServerConfig`].

use anyhow::{Context, Result};
use argh::FromArgs;
use kestrel_common::config::{parse_listen_addr, DEFAULT_ADDR, DEFAULT_EVENT_ADDR};
use kestrel_common::{ProtocolFlags, ServerConfig, WatchConfig};
use std::path::PathBuf;
use std::time::Duration;

use crate::root::ServerRoot;

#[derive(FromArgs, Debug)]
/// kestrel - a scriptable web server
pub struct Cli {
    /// directory, server script or single file to serve
    #[argh(positional, default = "String::from(\".\")")]
    pub server_dir: String,

    /// serve HTTP on :80 and HTTPS on :443
    #[argh(switch)]
    pub prod: bool,

    /// serve plain HTTP only
    #[argh(switch)]
    pub httponly: bool,

    /// serve HTTP/2 without TLS only
    #[argh(switch)]
    pub http2only: bool,

    /// address to listen on (defaults to :3000)
    #[argh(option, short = 'a')]
    pub addr: Option<String>,

    /// TLS certificate file
    #[argh(option, short = 'c', default = "String::from(\"cert.pem\")")]
    pub cert: String,

    /// TLS key file
    #[argh(option, short = 'k', default = "String::from(\"key.pem\")")]
    pub key: String,

    /// seconds to wait for open connections when shutting down
    #[argh(option, long = "shutdown-timeout-secs", default = "10")]
    pub shutdown_timeout_secs: u64,

    /// file for internal diagnostics (defaults to standard error)
    #[argh(option, long = "internal-log", default = "String::from(\"/dev/fd/2\")")]
    pub internal_log: String,

    /// run without a permission backend
    #[argh(switch)]
    pub nodb: bool,

    /// permission database file, /dev/null disables the backend
    #[argh(option)]
    pub boltdb: Option<String>,

    /// write the server log as JSON to this file
    #[argh(option)]
    pub log: Option<String>,

    /// no console output and no interactive prompt
    #[argh(switch, short = 'q')]
    pub quiet: bool,

    /// log debug messages
    #[argh(switch, short = 'd')]
    pub debug: bool,

    /// serve without the interactive prompt
    #[argh(switch, short = 's')]
    pub server: bool,

    /// write a runtime profile to this file on shutdown
    #[argh(option)]
    pub profile: Option<String>,

    /// print the version and exit
    #[argh(switch, short = 'V')]
    pub version: bool,

    /// push filesystem changes in the served directory to browsers
    #[argh(switch)]
    pub autorefresh: bool,

    /// directory to watch for changes (implies --autorefresh)
    #[argh(option)]
    pub watchdir: Option<String>,

    /// address of the filesystem event server
    #[argh(option, default = "String::from(DEFAULT_EVENT_ADDR)")]
    pub eventserver: String,

    /// milliseconds to collect filesystem changes before sending them
    #[argh(option, default = "350")]
    pub eventrefresh: u64,

    /// only report changes to files matching this pattern
    #[argh(option, long = "watch-pattern", default = "String::from(\"*\")")]
    pub watch_pattern: String,

    /// number of entries the render cache holds
    #[argh(option, default = "1024")]
    pub cache: usize,
}

impl Cli {
    /// True when a permission backend should be used.
    pub fn use_database(&self) -> bool {
        !(self.nodb || self.boltdb.as_deref() == Some("/dev/null"))
    }

    /// Builds the server configuration for a discovered root.
    ///
    /// # Errors
    ///
    /// Returns an error if an address cannot be parsed or the resulting
    /// configuration is invalid.
    pub fn build_config(&self, root: &ServerRoot) -> Result<ServerConfig> {
        let addr = parse_listen_addr(self.addr.as_deref().unwrap_or(DEFAULT_ADDR))
            .context("Invalid --addr")?;
        let single_file = root.is_single_file();

        let mut config = ServerConfig::new(root.dir())
            .with_addr(addr)
            .with_tls_files(&self.cert, &self.key)
            .with_protocol(ProtocolFlags {
                production: self.prod,
                just_http: self.httponly || single_file,
                just_http2: self.http2only,
            })
            .with_shutdown_timeout(Duration::from_secs(self.shutdown_timeout_secs))
            .with_database(self.use_database());

        if let Some(script) = root.server_script() {
            config = config.with_server_script(script);
        }

        if self.autorefresh || self.watchdir.is_some() {
            let base_path = match &self.watchdir {
                Some(dir) => PathBuf::from(dir),
                None => root.dir().to_path_buf(),
            };
            config = config.with_watch(WatchConfig {
                event_addr: parse_listen_addr(&self.eventserver).context("Invalid --eventserver")?,
                base_path,
                refresh: Duration::from_millis(self.eventrefresh),
                pattern: self.watch_pattern.clone(),
            });
        }

        config.internal_log = PathBuf::from(&self.internal_log);
        config.server_log = self.log.as_ref().map(PathBuf::from);
        config.profile = self.profile.as_ref().map(PathBuf::from);
        config.cache_entries = self.cache;
        config.quiet = self.quiet;
        config.debug = self.debug || single_file;
        config.interactive = !(self.server || self.quiet);

        config.validate()?;
        Ok(config)
    }
}
