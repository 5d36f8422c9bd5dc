//! Runtime profiling.
//!
//! While serving, the profiler only remembers when it started. Stopping it
//! writes a JSON summary of the run (uptime, contexts created, requests
//! served) into the profile file. Stopping and closing are two separate
//! shutdown actions, registered in that order.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use kestrel_common::{KestrelError, Result};
use serde::Serialize;

use crate::http_router::ServeStats;
use crate::runtime::ContextPool;
use crate::shutdown::ShutdownRegistry;

#[derive(Debug, Serialize)]
struct ProfileSummary {
    uptime_ms: u128,
    contexts_created: usize,
    requests: u64,
    errors: u64,
}

pub struct RuntimeProfiler;

impl RuntimeProfiler {
    /// Creates the profile file and registers the stop and close actions.
    pub fn start(
        path: &Path,
        stats: Arc<ServeStats>,
        pool: ContextPool,
        registry: &ShutdownRegistry,
    ) -> Result<()> {
        let file = File::create(path).map_err(|e| {
            KestrelError::InvalidConfig(format!("Could not create profile file {}: {}", path.display(), e))
        })?;
        let file = Arc::new(Mutex::new(Some(file)));
        let started = Instant::now();
        let path: PathBuf = path.to_path_buf();
        tracing::info!(path = %path.display(), "Profiling enabled");

        let writer = file.clone();
        let profile_path = path.clone();
        registry.register("stop profiler", move || {
            let summary = ProfileSummary {
                uptime_ms: started.elapsed().as_millis(),
                contexts_created: pool.created(),
                requests: stats.snapshot().requests,
                errors: stats.snapshot().errors,
            };
            let mut guard = writer.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(file) = guard.as_mut() {
                serde_json::to_writer_pretty(&mut *file, &summary)?;
                file.write_all(b"\n")?;
            }
            tracing::info!(path = %profile_path.display(), "Done profiling");
            Ok(())
        });

        registry.register("close profile file", move || {
            let taken = file.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(mut file) = taken {
                file.flush()?;
                file.sync_all()?;
            }
            Ok(())
        });

        Ok(())
    }
}
