use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kestrel_common::{KestrelError, Result};
use serde_json::Value as JsonValue;

use crate::runtime::bindings::Capabilities;
use crate::runtime::context::{ScriptContext, ScriptSource};

/// Configuration for the context pool
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Contexts kept on the free list; extra releases are finalized
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_idle: 64 }
    }
}

struct PoolState {
    available: Vec<ScriptContext>,
    closed: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    created: AtomicUsize,
    config: PoolConfig,
}

/// Reusable set of initialized script contexts.
///
/// `acquire` hands out an idle context or creates a new one, so callers
/// never wait on each other. The mutex only guards the free list; scripts
/// run without it held.
#[derive(Clone)]
pub struct ContextPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ContextPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextPool")
            .field("created", &self.created())
            .field("available", &self.available())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl ContextPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    available: Vec::new(),
                    closed: false,
                }),
                created: AtomicUsize::new(0),
                config,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks out a context for exclusive use.
    ///
    /// # Errors
    ///
    /// - `KestrelError::PoolClosed` after [`shutdown_all`](Self::shutdown_all)
    /// - `KestrelError::ContextInit` if a new context cannot be created
    pub fn acquire(&self) -> Result<PooledContext> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(KestrelError::PoolClosed);
            }
            if let Some(context) = state.available.pop() {
                return Ok(PooledContext {
                    context: Some(context),
                    pool: self.clone(),
                });
            }
        }

        let id = self.inner.created.fetch_add(1, Ordering::SeqCst) + 1;
        let context = ScriptContext::spawn(id)?;
        tracing::debug!(context = id, "Created script context");
        Ok(PooledContext {
            context: Some(context),
            pool: self.clone(),
        })
    }

    /// Returns a context to the free list.
    ///
    /// Contexts released after shutdown, or beyond `max_idle`, are finalized.
    pub fn release(&self, context: ScriptContext) {
        let rejected = {
            let mut state = self.lock();
            if state.closed || state.available.len() >= self.inner.config.max_idle {
                Some(context)
            } else {
                state.available.push(context);
                None
            }
        };
        if let Some(context) = rejected {
            context.finalize();
        }
    }

    /// Finalizes every idle context and closes the pool.
    ///
    /// Contexts still checked out are finalized when they are released.
    /// Calling this more than once has no further effect.
    pub fn shutdown_all(&self) {
        let drained = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.available)
        };
        let count = drained.len();
        for context in drained {
            context.finalize();
        }
        tracing::debug!(finalized = count, created = self.created(), "Context pool shut down");
    }

    /// Number of contexts ever created by this pool.
    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }

    /// Number of contexts currently on the free list.
    pub fn available(&self) -> usize {
        self.lock().available.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Guard that holds a checked-out context and releases it when dropped.
pub struct PooledContext {
    context: Option<ScriptContext>,
    pool: ContextPool,
}

impl fmt::Debug for PooledContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledContext").field("context", &self.context).finish()
    }
}

impl PooledContext {
    fn inner(&mut self) -> Result<&mut ScriptContext> {
        self.context.as_mut().ok_or(KestrelError::PoolClosed)
    }

    pub fn id(&self) -> usize {
        self.context.as_ref().map_or(0, |c| c.id())
    }

    pub fn execute(&mut self, source: &Arc<ScriptSource>, caps: &Capabilities) -> Result<()> {
        self.inner()?.execute(source, caps)
    }

    pub fn handle(
        &mut self,
        source: &Arc<ScriptSource>,
        pattern: &str,
        request: JsonValue,
        caps: &Capabilities,
    ) -> Result<JsonValue> {
        self.inner()?.handle(source, pattern, request, caps)
    }

    pub fn eval(&mut self, id: &str, code: &str, caps: &Capabilities) -> Result<String> {
        self.inner()?.eval(id, code, caps)
    }

    pub fn eval_as(&mut self, source: &Arc<ScriptSource>, code: &str, caps: &Capabilities) -> Result<String> {
        self.inner()?.eval_as(source, code, caps)
    }

    /// Releases the context now instead of at the end of scope.
    pub fn release(mut self) {
        if let Some(context) = self.context.take() {
            self.pool.release(context);
        }
    }
}

impl Drop for PooledContext {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            self.pool.release(context);
        }
    }
}
