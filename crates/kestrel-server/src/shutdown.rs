//! Shutdown coordination.
//!
//! [`ShutdownRegistry`] is an ordered list of named cleanup actions. Every
//! component that acquires a releasable resource (the temporary directory,
//! the profiler, the context pool, log handles, listeners, the event server)
//! registers its release action as soon as it owns the resource. When the
//! process decides to terminate, the registry is drained exactly once and the
//! actions run in registration order.
//!
//! # Example
//!
//! ```
//! use kestrel_server::shutdown::ShutdownRegistry;
//! use std::sync::{Arc, Mutex};
//!
//! let registry = ShutdownRegistry::new();
//! let order = Arc::new(Mutex::new(Vec::new()));
//!
//! for name in ["stop-profiler", "close-log"] {
//!     let order = order.clone();
//!     registry.register(name, move || {
//!         order.lock().unwrap().push(name);
//!         Ok(())
//!     });
//! }
//!
//! registry.run_all();
//! assert_eq!(*order.lock().unwrap(), vec!["stop-profiler", "close-log"]);
//! ```

use kestrel_common::Result;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

type Action = Box<dyn FnOnce() -> Result<()> + Send>;

struct Entry {
    name: String,
    action: Action,
}

enum State {
    Open(Vec<Entry>),
    Drained,
}

/// Outcome of draining the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Actions that were invoked, in order
    pub ran: Vec<String>,
    /// Actions that returned an error or panicked
    pub failed: Vec<String>,
}

/// Process-wide registry of cleanup actions.
///
/// Cloning is cheap; all clones share the same list.
#[derive(Clone)]
pub struct ShutdownRegistry {
    state: Arc<Mutex<State>>,
}

impl Default for ShutdownRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ShutdownRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownRegistry")
            .field("pending", &self.len())
            .field("drained", &self.is_drained())
            .finish()
    }
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Open(Vec::new()))),
        }
    }

    /// Appends a cleanup action.
    ///
    /// If the registry has already been drained the action runs immediately,
    /// so the resource it guards is still released exactly once.
    pub fn register<F>(&self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let name = name.into();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *state {
            State::Open(entries) => {
                tracing::debug!(action = %name, position = entries.len(), "Registered shutdown action");
                entries.push(Entry {
                    name,
                    action: Box::new(action),
                });
            }
            State::Drained => {
                drop(state);
                tracing::warn!(action = %name, "Shutdown already ran, running late action now");
                let mut summary = ShutdownSummary::default();
                run_entry(
                    Entry {
                        name,
                        action: Box::new(action),
                    },
                    &mut summary,
                );
            }
        }
    }

    /// Number of actions waiting to run.
    pub fn len(&self) -> usize {
        match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            State::Open(entries) => entries.len(),
            State::Drained => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_drained(&self) -> bool {
        matches!(
            &*self.state.lock().unwrap_or_else(PoisonError::into_inner),
            State::Drained
        )
    }

    /// Runs every registered action once, in registration order.
    ///
    /// Errors and panics from individual actions are logged and never stop
    /// the remaining actions. Calling this a second time does nothing.
    pub fn run_all(&self) -> ShutdownSummary {
        let entries = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *state, State::Drained) {
                State::Open(entries) => entries,
                State::Drained => return ShutdownSummary::default(),
            }
        };

        let mut summary = ShutdownSummary::default();
        for entry in entries {
            run_entry(entry, &mut summary);
        }

        if summary.failed.is_empty() {
            tracing::debug!(actions = summary.ran.len(), "Shutdown complete");
        } else {
            tracing::warn!(
                actions = summary.ran.len(),
                failed = summary.failed.len(),
                "Shutdown complete with failures"
            );
        }
        summary
    }

    /// Returns a guard that drains the registry when dropped.
    pub fn guard(&self) -> ShutdownGuard {
        ShutdownGuard {
            registry: self.clone(),
        }
    }

    /// Logs `err`, drains the registry and exits with status 1.
    pub fn fatal_exit(&self, err: &dyn fmt::Display) -> ! {
        tracing::error!("{}", err);
        self.run_all();
        std::process::exit(1)
    }
}

fn run_entry(entry: Entry, summary: &mut ShutdownSummary) {
    let Entry { name, action } = entry;
    tracing::debug!(action = %name, "Running shutdown action");
    match catch_unwind(AssertUnwindSafe(action)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(action = %name, error = %e, "Shutdown action failed");
            summary.failed.push(name.clone());
        }
        Err(_) => {
            tracing::error!(action = %name, "Shutdown action panicked");
            summary.failed.push(name.clone());
        }
    }
    summary.ran.push(name);
}

/// Drains the registry on drop, covering early returns from `main`.
pub struct ShutdownGuard {
    registry: ShutdownRegistry,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.registry.run_all();
    }
}
