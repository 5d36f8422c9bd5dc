//! # kestrel
//!
//! Serves a directory, a server script or a single file.
//!
//! ## Usage
//!
//! ```bash
//! # Serve the current directory over HTTPS with HTTP fallback
//! kestrel
//!
//! # Plain HTTP on a custom port, no prompt
//! kestrel --httponly --addr :8080 --server site/
//!
//! # Production: HTTP on :80 and HTTPS on :443
//! kestrel --prod --cert /etc/tls/cert.pem --key /etc/tls/key.pem site/
//!
//! # Let a script define every route
//! kestrel --nodb app.js
//! ```

use anyhow::Result;
use kestrel_cli::args::Cli;
use kestrel_cli::logging::{self, LogOptions};
use kestrel_cli::repl;
use kestrel_cli::root::ServerRoot;
use kestrel_server::events::EventServer;
use kestrel_server::http_router::RequestRouter;
use kestrel_server::permissions::{MemoryPermissions, Permissions};
use kestrel_server::pipeline::{ConfigurationPipeline, ConfigurationTask};
use kestrel_server::profile::RuntimeProfiler;
use kestrel_server::protocol::{shutdown_signal, ProtocolServer, ProtocolState, StopHandle};
use kestrel_server::runtime::ContextPool;
use kestrel_server::shutdown::ShutdownRegistry;
use std::path::Path;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    if cli.version {
        if !cli.quiet {
            println!("kestrel {}", env!("CARGO_PKG_VERSION"));
        }
        return Ok(());
    }

    let root = ServerRoot::discover(Path::new(&cli.server_dir));
    let single_file = root.as_ref().is_ok_and(ServerRoot::is_single_file);
    let internal_log = logging::init(&LogOptions {
        debug: cli.debug || single_file,
        quiet: cli.quiet,
        server_log: cli.log.as_deref().map(Path::new),
        internal_log: Path::new(&cli.internal_log),
    })?;

    let registry = ShutdownRegistry::new();
    let _guard = registry.guard();

    let root = match root {
        Ok(root) => root,
        Err(e) => registry.fatal_exit(&e),
    };
    let config = match cli.build_config(&root) {
        Ok(config) => config,
        Err(e) => registry.fatal_exit(&format!("{:#}", e)),
    };

    let pool = ContextPool::default();
    let pipeline = ConfigurationPipeline::new(pool.clone(), config.cache_entries);
    let permissions: Option<Arc<dyn Permissions>> = if config.use_database {
        Some(Arc::new(MemoryPermissions::default()))
    } else {
        None
    };
    let caps = pipeline.capabilities(permissions.clone());
    let router = Arc::new(RequestRouter::new(caps.clone()));

    if let Some(profile) = &config.profile {
        if let Err(e) = RuntimeProfiler::start(profile, router.stats(), pool.clone(), &registry) {
            registry.fatal_exit(&e);
        }
    }

    {
        let pool = pool.clone();
        registry.register("shutdown script contexts", move || {
            pool.shutdown_all();
            Ok(())
        });
    }

    // Scratch space that outlives every script context
    let temp_dir = match tempfile::Builder::new().prefix("kestrel").tempdir() {
        Ok(dir) => dir,
        Err(e) => registry.fatal_exit(&format!("Could not create a temporary directory: {}", e)),
    };
    tracing::debug!(path = %temp_dir.path().display(), "Created temporary directory");
    registry.register("remove temporary directory", move || {
        temp_dir.close()?;
        Ok(())
    });

    let task = ConfigurationTask::from_config(&config, permissions.clone());
    let installer = root.installer();
    let report = match tokio::task::spawn_blocking(move || pipeline.run(task, &installer)).await {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => registry.fatal_exit(&e),
        Err(e) => registry.fatal_exit(&e),
    };

    if report.active.is_empty() {
        tracing::info!(
            host = %config.server_host(),
            addr = %config.addr,
            root = %config.server_dir.display(),
            protocol = %ProtocolState::select(&config.protocol),
            permissions = permissions.is_some(),
            debug = config.debug,
            "Server information"
        );
    }

    registry.register("flush internal log", move || internal_log.flush());

    let _events = match &config.watch {
        Some(watch) => match EventServer::start(watch, config.limits, &registry).await {
            Ok(events) => Some(events),
            Err(e) => registry.fatal_exit(&e),
        },
        None => None,
    };

    let stop = StopHandle::new();
    if config.interactive {
        repl::spawn(pool.clone(), caps, stop.clone())?;
    }

    let running = match ProtocolServer::new(&config, router)
        .with_stop_handle(stop)
        .start(&registry)
        .await
    {
        Ok(running) => running,
        Err(e) => registry.fatal_exit(&e),
    };

    let served = running.serve_until(shutdown_signal()).await;
    tracing::debug!(attempted = ?served.attempted, "Stopped serving");

    registry.run_all();
    Ok(())
}
