//! Interactive prompt.
//!
//! Runs on its own thread next to the server. The whole session uses one
//! context checked out from the shared pool, with the same `server` global
//! configuration scripts get. Leaving the prompt stops the server.

use std::sync::Arc;

use anyhow::{Context, Result};
use kestrel_server::protocol::StopHandle;
use kestrel_server::runtime::{Capabilities, ContextPool, PooledContext, ScriptSource};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

const PROMPT: &str = "kestrel> ";

/// What the prompt does with one input line.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Skip,
    Exit,
    Eval(&'a str),
}

fn classify(line: &str) -> Input<'_> {
    match line.trim() {
        "" => Input::Skip,
        "exit" | "quit" => Input::Exit,
        code => Input::Eval(code),
    }
}

/// One prompt session holding its context until the prompt closes.
///
/// Lines that evaluate without error are kept in a transcript. Handlers a
/// line registers are routed to the transcript up to that line, so request
/// contexts see every definition made before it.
pub struct ReplSession {
    context: PooledContext,
    caps: Capabilities,
    transcript: String,
    lines: usize,
}

impl ReplSession {
    /// Checks out the session context.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool is closed or a context cannot be created.
    pub fn new(pool: &ContextPool, caps: Capabilities) -> kestrel_common::Result<Self> {
        Ok(Self {
            context: pool.acquire()?,
            caps,
            transcript: String::new(),
            lines: 0,
        })
    }

    /// Evaluates one line of input and returns its printed result.
    pub fn evaluate(&mut self, code: &str) -> kestrel_common::Result<String> {
        self.lines += 1;
        let mut transcript = self.transcript.clone();
        transcript.push_str(code);
        transcript.push('\n');

        let source = Arc::new(ScriptSource::new(format!("repl:{}", self.lines), transcript.as_str()));
        let output = self.context.eval_as(&source, code, &self.caps)?;
        self.transcript = transcript;
        Ok(output)
    }

    pub fn context_id(&self) -> usize {
        self.context.id()
    }
}

/// Starts the prompt thread.
///
/// # Errors
///
/// Returns an error if the thread cannot be spawned.
pub fn spawn(pool: ContextPool, caps: Capabilities, stop: StopHandle) -> Result<()> {
    std::thread::Builder::new()
        .name("kestrel-repl".into())
        .spawn(move || run(pool, caps, stop))
        .context("Could not start the interactive prompt")?;
    Ok(())
}

fn run(pool: ContextPool, caps: Capabilities, stop: StopHandle) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            tracing::warn!(error = %e, "Interactive prompt unavailable");
            return;
        }
    };
    let mut session = match ReplSession::new(&pool, caps) {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(error = %e, "Interactive prompt unavailable");
            return;
        }
    };
    tracing::debug!(context = session.context_id(), "Interactive prompt ready");

    while !stop.is_triggered() {
        let line = match editor.readline(PROMPT) {
            Ok(line) => line,
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read from the interactive prompt");
                break;
            }
        };

        match classify(&line) {
            Input::Skip => continue,
            Input::Exit => break,
            Input::Eval(code) => {
                let _ = editor.add_history_entry(code);
                match session.evaluate(code) {
                    Ok(output) => println!("{}", output),
                    Err(e) => eprintln!("error: {}", e),
                }
            }
        }
    }

    drop(session);
    if stop.trigger() {
        tracing::info!("Interactive prompt closed, shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_server::pipeline::ConfigurationPipeline;
    use kestrel_server::routing::Route;

    #[test]
    fn test_classify_input() {
        assert_eq!(classify("   "), Input::Skip);
        assert_eq!(classify("exit"), Input::Exit);
        assert_eq!(classify(" quit "), Input::Exit);
        assert_eq!(classify(" 1 + 1 "), Input::Eval("1 + 1"));
    }

    #[test]
    fn test_session_shares_the_server_global() {
        let pool = ContextPool::default();
        let pipeline = ConfigurationPipeline::new(pool.clone(), 8);
        let mut session = ReplSession::new(&pool, pipeline.capabilities(None)).unwrap();

        assert_eq!(session.evaluate("1 + 2").unwrap(), "3");
        session.evaluate("server.cacheSet('from-repl', 'yes')").unwrap();
        assert_eq!(pipeline.cache().get("from-repl").as_deref(), Some("yes"));
        assert!(session.evaluate("throw new Error('nope')").is_err());

        drop(session);
        pool.shutdown_all();
    }

    #[test]
    fn test_session_keeps_one_context() {
        let pool = ContextPool::default();
        let pipeline = ConfigurationPipeline::new(pool.clone(), 8);
        let mut session = ReplSession::new(&pool, pipeline.capabilities(None)).unwrap();

        session.evaluate("var x = 1").unwrap();

        // Another caller gets a different context while the session holds its own
        let mut other = pool.acquire().unwrap();
        assert_ne!(other.id(), session.context_id());
        other.eval("other", "var x = 100", &pipeline.capabilities(None)).unwrap();
        drop(other);

        assert_eq!(session.evaluate("x + 1").unwrap(), "2");

        drop(session);
        pool.shutdown_all();
    }

    #[test]
    fn test_handlers_replay_the_whole_session() {
        let pool = ContextPool::default();
        let pipeline = ConfigurationPipeline::new(pool.clone(), 8);
        let caps = pipeline.capabilities(None);
        let mut session = ReplSession::new(&pool, caps.clone()).unwrap();

        session.evaluate("var greeting = 'hello'").unwrap();
        session
            .evaluate("server.handle('/hi', function(req) { return greeting + ' ' + req.path; })")
            .unwrap();

        let (pattern, route) = caps.routes.resolve("/hi").unwrap();
        assert_eq!(pattern, "/hi");
        let Route::Script { source, pattern } = route else {
            panic!("expected a script route");
        };

        // Served from a fresh context that never saw the prompt
        let mut context = pool.acquire().unwrap();
        assert_ne!(context.id(), session.context_id());
        let reply = context
            .handle(&source, &pattern, serde_json::json!({ "path": "/hi" }), &caps)
            .unwrap();
        assert_eq!(reply, serde_json::json!("hello /hi"));

        drop(context);
        drop(session);
        pool.shutdown_all();
    }
}
