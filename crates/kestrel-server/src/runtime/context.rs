use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use boa_engine::{js_string, value::JsValue, Context, Source};
use kestrel_common::{KestrelError, Result};
use serde_json::Value as JsonValue;

use crate::runtime::bindings::{self, activate, ActiveScript, Capabilities, Mode};
use crate::runtime::conversions::{js_value_to_json, json_to_js_value};

/// Source code of one script, identified by the path it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSource {
    pub id: String,
    pub code: String,
}

impl ScriptSource {
    pub fn new(id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
        }
    }

    /// Reads a script from disk.
    pub fn from_path(path: &Path) -> Result<Self> {
        let code = std::fs::read_to_string(path).map_err(|e| {
            KestrelError::InvalidRequest(format!("Failed to load script {}: {}", path.display(), e))
        })?;
        Ok(Self::new(path.display().to_string(), code))
    }
}

enum Job {
    Execute {
        source: Arc<ScriptSource>,
        caps: Capabilities,
        reply: mpsc::Sender<Result<()>>,
    },
    Handle {
        source: Arc<ScriptSource>,
        pattern: String,
        request: JsonValue,
        caps: Capabilities,
        reply: mpsc::Sender<Result<JsonValue>>,
    },
    Eval {
        source: Arc<ScriptSource>,
        code: String,
        caps: Capabilities,
        reply: mpsc::Sender<Result<String>>,
    },
}

/// One initialized interpreter.
///
/// The Boa `Context` lives on a dedicated worker thread and never leaves it;
/// this value is the handle used to submit work. Every operation takes
/// `&mut self`, so a context can only run one script at a time.
pub struct ScriptContext {
    id: usize,
    jobs: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl fmt::Debug for ScriptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptContext")
            .field("id", &self.id)
            .field("finalized", &self.jobs.is_none())
            .finish()
    }
}

impl ScriptContext {
    /// Starts a worker thread and initializes its interpreter.
    ///
    /// # Errors
    ///
    /// Returns `KestrelError::ContextInit` if the thread cannot be spawned or
    /// the bindings cannot be installed.
    pub fn spawn(id: usize) -> Result<Self> {
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let worker = thread::Builder::new()
            .name(format!("kestrel-script-{}", id))
            .spawn(move || worker_main(id, jobs_rx, ready_tx))
            .map_err(|e| KestrelError::ContextInit(format!("Failed to spawn script worker {}: {}", id, e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(KestrelError::ContextInit(format!(
                    "Script worker {} exited during initialization",
                    id
                )))
            }
        }

        tracing::debug!(context = id, "Script context initialized");
        Ok(Self {
            id,
            jobs: Some(jobs_tx),
            worker: Some(worker),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Runs `source` to completion as a configuration script.
    pub fn execute(&mut self, source: &Arc<ScriptSource>, caps: &Capabilities) -> Result<()> {
        self.submit(|reply| Job::Execute {
            source: source.clone(),
            caps: caps.clone(),
            reply,
        })
    }

    /// Calls the handler `source` registered for `pattern` with `request`.
    ///
    /// If this context has not evaluated `source` yet, it is evaluated first
    /// without registering routes or running nested scripts.
    pub fn handle(
        &mut self,
        source: &Arc<ScriptSource>,
        pattern: &str,
        request: JsonValue,
        caps: &Capabilities,
    ) -> Result<JsonValue> {
        self.submit(|reply| Job::Handle {
            source: source.clone(),
            pattern: pattern.to_string(),
            request,
            caps: caps.clone(),
            reply,
        })
    }

    /// Evaluates one line of input and returns the printed result.
    pub fn eval(&mut self, id: &str, code: &str, caps: &Capabilities) -> Result<String> {
        let source = Arc::new(ScriptSource::new(id, code));
        self.eval_as(&source, code, caps)
    }

    /// Evaluates `code` on behalf of `source`.
    ///
    /// Handlers registered by `code` are routed to `source`, so other
    /// contexts replay all of `source` before they call them.
    pub fn eval_as(&mut self, source: &Arc<ScriptSource>, code: &str, caps: &Capabilities) -> Result<String> {
        self.submit(|reply| Job::Eval {
            source: source.clone(),
            code: code.to_string(),
            caps: caps.clone(),
            reply,
        })
    }

    fn submit<T>(&mut self, job: impl FnOnce(mpsc::Sender<Result<T>>) -> Job) -> Result<T> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| KestrelError::JavaScriptExecution(format!("Script context {} is finalized", self.id)))?;

        let (reply_tx, reply_rx) = mpsc::channel();
        jobs.send(job(reply_tx))
            .map_err(|_| KestrelError::JavaScriptExecution(format!("Script context {} is gone", self.id)))?;

        reply_rx.recv().map_err(|_| {
            KestrelError::JavaScriptExecution(format!("Script context {} stopped while running a script", self.id))
        })?
    }

    /// Stops the worker thread and waits for it to exit.
    pub fn finalize(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Closing the channel ends the worker loop
        drop(self.jobs.take());
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                tracing::warn!(context = self.id, "Script worker panicked");
            } else {
                tracing::debug!(context = self.id, "Script context finalized");
            }
        }
    }
}

impl Drop for ScriptContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Interpreter {
    ctx: Context,
    loaded: HashSet<String>,
}

fn worker_main(id: usize, jobs: mpsc::Receiver<Job>, ready: mpsc::Sender<Result<()>>) {
    let mut interpreter = match Interpreter::new() {
        Ok(interpreter) => interpreter,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }
    drop(ready);

    while let Ok(job) = jobs.recv() {
        match job {
            Job::Execute { source, caps, reply } => {
                let _ = reply.send(interpreter.execute(source, caps, Mode::Configure));
            }
            Job::Handle {
                source,
                pattern,
                request,
                caps,
                reply,
            } => {
                let _ = reply.send(interpreter.handle(source, &pattern, request, caps));
            }
            Job::Eval {
                source,
                code,
                caps,
                reply,
            } => {
                let _ = reply.send(interpreter.eval(source, &code, caps));
            }
        }
    }
    tracing::trace!(context = id, "Script worker exiting");
}

impl Interpreter {
    fn new() -> Result<Self> {
        let mut ctx = Context::default();
        bindings::install_server_bindings(&mut ctx)?;
        Ok(Self {
            ctx,
            loaded: HashSet::new(),
        })
    }

    fn execute(&mut self, source: Arc<ScriptSource>, caps: Capabilities, mode: Mode) -> Result<()> {
        let _active = activate(ActiveScript {
            caps,
            mode,
            source: source.clone(),
        });
        self.ctx
            .eval(Source::from_bytes(source.code.as_bytes()))
            .map_err(|e| KestrelError::JavaScriptExecution(format!("{}: {}", source.id, e)))?;
        self.loaded.insert(source.id.clone());
        Ok(())
    }

    fn handle(
        &mut self,
        source: Arc<ScriptSource>,
        pattern: &str,
        request: JsonValue,
        caps: Capabilities,
    ) -> Result<JsonValue> {
        if !self.loaded.contains(&source.id) {
            self.execute(source.clone(), caps.clone(), Mode::Replay)?;
        }

        let _active = activate(ActiveScript {
            caps,
            mode: Mode::Serve,
            source: source.clone(),
        });

        let table = bindings::handler_table(&source.id, &mut self.ctx)
            .map_err(|e| KestrelError::JavaScriptExecution(e.to_string()))?;
        let handler = table
            .get(js_string!(pattern), &mut self.ctx)
            .map_err(|e| KestrelError::JavaScriptExecution(e.to_string()))?;
        let handler = handler
            .as_object()
            .filter(|o| o.is_callable())
            .map(|o| o.clone())
            .ok_or_else(|| {
                KestrelError::InvalidRequest(format!("No handler for {} in {}", pattern, source.id))
            })?;

        let request = json_to_js_value(request, &mut self.ctx)?;
        let result = handler
            .call(&JsValue::undefined(), &[request], &mut self.ctx)
            .map_err(|e| KestrelError::JavaScriptExecution(format!("{} handler for {}: {}", source.id, pattern, e)))?;
        js_value_to_json(result, &mut self.ctx)
    }

    fn eval(&mut self, source: Arc<ScriptSource>, code: &str, caps: Capabilities) -> Result<String> {
        let _active = activate(ActiveScript {
            caps,
            mode: Mode::Configure,
            source: source.clone(),
        });
        let value = self
            .ctx
            .eval(Source::from_bytes(code.as_bytes()))
            .map_err(|e| KestrelError::JavaScriptExecution(e.to_string()))?;
        self.loaded.insert(source.id.clone());
        Ok(value.display().to_string())
    }
}
