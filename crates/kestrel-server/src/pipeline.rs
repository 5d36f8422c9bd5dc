//! Configuration pipeline
//!
//! Runs the configuration scripts in order at startup, each in its own
//! checked-out context. Whether a failing script stops startup depends on
//! whether a permission backend is active: with a backend, scripts may have
//! begun to persist state, so an error is fatal. Without one, the script is
//! dropped from the active set and the next one runs.
//!
//! # Example
//!
//! ```no_run
//! use kestrel_server::pipeline::{ConfigurationPipeline, ConfigurationTask};
//! use kestrel_server::routing::StaticFiles;
//! use kestrel_server::runtime::ContextPool;
//!
//! let pipeline = ConfigurationPipeline::new(ContextPool::default(), 1024);
//! let task = ConfigurationTask::new(vec!["serverconf.js".into()]);
//! let report = pipeline.run(task, &StaticFiles::new(".")).unwrap();
//! println!("{} scripts active", report.active.len());
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use kestrel_common::config::is_readable;
use kestrel_common::{KestrelError, Result, ServerConfig};

use crate::cache::RenderCache;
use crate::permissions::Permissions;
use crate::routing::{RouteInstaller, RoutingRegistry};
use crate::runtime::{Capabilities, ContextPool, ScriptSource};

/// Ordered script sources to run once at startup.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationTask {
    sources: Vec<PathBuf>,
    permissions: Option<Arc<dyn Permissions>>,
    final_is_server_script: bool,
}

impl ConfigurationTask {
    pub fn new(sources: Vec<PathBuf>) -> Self {
        Self {
            sources,
            permissions: None,
            final_is_server_script: false,
        }
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn Permissions>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    /// Appends the terminal server script, which replaces the default routes.
    pub fn with_server_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.sources.push(script.into());
        self.final_is_server_script = true;
        self
    }

    /// Builds the task for a server configuration.
    pub fn from_config(config: &ServerConfig, permissions: Option<Arc<dyn Permissions>>) -> Self {
        let mut task = Self::new(config.configuration_scripts.clone());
        task.permissions = permissions;
        match &config.server_script {
            Some(script) => task.with_server_script(script.clone()),
            None => task,
        }
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    pub fn has_permissions(&self) -> bool {
        self.permissions.is_some()
    }
}

/// Result of a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurationReport {
    /// Sources that ran without error, in order
    pub active: Vec<PathBuf>,
    /// Whether the terminal server script ran
    pub server_script_ran: bool,
    /// Whether the default routes were installed
    pub defaults_installed: bool,
}

/// Shared collaborators every configuration script sees.
#[derive(Debug, Clone)]
pub struct ConfigurationPipeline {
    pool: ContextPool,
    cache: Arc<RenderCache>,
    routes: Arc<RoutingRegistry>,
}

impl ConfigurationPipeline {
    pub fn new(pool: ContextPool, cache_entries: usize) -> Self {
        Self {
            pool,
            cache: Arc::new(RenderCache::new(cache_entries)),
            routes: Arc::new(RoutingRegistry::new()),
        }
    }

    pub fn pool(&self) -> &ContextPool {
        &self.pool
    }

    pub fn routes(&self) -> &Arc<RoutingRegistry> {
        &self.routes
    }

    pub fn cache(&self) -> &Arc<RenderCache> {
        &self.cache
    }

    /// Capabilities handed to scripts, for the pipeline and for later use by
    /// request handlers and the REPL.
    pub fn capabilities(&self, permissions: Option<Arc<dyn Permissions>>) -> Capabilities {
        Capabilities {
            permissions,
            pool: self.pool.clone(),
            cache: self.cache.clone(),
            routes: self.routes.clone(),
        }
    }

    /// Runs every readable source in order.
    ///
    /// Blocks until all scripts finish; call from a blocking thread when
    /// inside an async runtime.
    ///
    /// # Errors
    ///
    /// - `KestrelError::FatalConfiguration` if a source fails while a
    ///   permission backend is present, or the terminal server script fails
    /// - `KestrelError::ContextInit` / `KestrelError::PoolClosed` from the pool
    /// - any error returned by `installer`
    pub fn run(&self, task: ConfigurationTask, installer: &dyn RouteInstaller) -> Result<ConfigurationReport> {
        let ConfigurationTask {
            sources,
            permissions,
            final_is_server_script,
        } = task;
        let caps = self.capabilities(permissions);
        let last = sources.len().checked_sub(1);
        let mut report = ConfigurationReport::default();

        for (index, path) in sources.into_iter().enumerate() {
            let terminal = final_is_server_script && Some(index) == last;
            if !is_readable(&path) {
                tracing::debug!(script = %path.display(), "Configuration script not found, skipping");
                continue;
            }

            let outcome = ScriptSource::from_path(&path).map(Arc::new).and_then(|source| {
                let mut context = self.pool.acquire()?;
                let result = context.execute(&source, &caps);
                context.release();
                result
            });

            match outcome {
                Ok(()) => {
                    tracing::debug!(script = %path.display(), "Configuration script ran");
                    if terminal {
                        report.server_script_ran = true;
                    }
                    report.active.push(path);
                }
                Err(e) if is_pool_error(&e) => return Err(e),
                Err(e) if terminal || caps.permissions.is_some() => {
                    return Err(KestrelError::FatalConfiguration {
                        path,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    tracing::error!(script = %path.display(), error = %e, "Could not use configuration script");
                    tracing::warn!("Ignoring script error since database backend is disabled.");
                }
            }
        }

        if !report.server_script_ran {
            installer.install_defaults(&self.routes)?;
            report.defaults_installed = true;
        }
        Ok(report)
    }
}

fn is_pool_error(e: &KestrelError) -> bool {
    matches!(e, KestrelError::ContextInit(_) | KestrelError::PoolClosed)
}
