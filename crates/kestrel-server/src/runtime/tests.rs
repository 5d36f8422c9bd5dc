use super::*;
use crate::cache::RenderCache;
use crate::permissions::MemoryPermissions;
use crate::routing::{Route, RoutingRegistry};
use kestrel_common::KestrelError;
use serde_json::json;
use std::fs;
use std::sync::Arc;

fn create_test_script(content: &str) -> tempfile::NamedTempFile {
    let file = tempfile::Builder::new().suffix(".js").tempfile().unwrap();
    fs::write(file.path(), content).unwrap();
    file
}

fn capabilities(pool: &ContextPool) -> Capabilities {
    Capabilities {
        permissions: None,
        pool: pool.clone(),
        cache: Arc::new(RenderCache::new(16)),
        routes: Arc::new(RoutingRegistry::new()),
    }
}

fn source(id: &str, code: &str) -> Arc<ScriptSource> {
    Arc::new(ScriptSource::new(id, code))
}

#[test]
fn test_execute_simple_script() {
    let pool = ContextPool::default();
    let caps = capabilities(&pool);
    let mut ctx = pool.acquire().unwrap();

    ctx.execute(&source("simple.js", "let x = 1 + 1;"), &caps).unwrap();
}

#[test]
fn test_execute_reports_script_errors() {
    let pool = ContextPool::default();
    let caps = capabilities(&pool);
    let mut ctx = pool.acquire().unwrap();

    let err = ctx
        .execute(&source("broken.js", "throw new Error('boom');"), &caps)
        .unwrap_err();
    assert!(matches!(err, KestrelError::JavaScriptExecution(_)));
    assert!(err.to_string().contains("boom"));
}

#[test]
fn test_errored_context_remains_usable() {
    let pool = ContextPool::default();
    let caps = capabilities(&pool);
    let mut ctx = pool.acquire().unwrap();

    assert!(ctx.execute(&source("a.js", "nope("), &caps).is_err());
    assert_eq!(ctx.eval("repl", "6 * 7", &caps).unwrap(), "42");
}

#[test]
fn test_context_keeps_state_between_scripts() {
    let pool = ContextPool::default();
    let caps = capabilities(&pool);
    let mut ctx = pool.acquire().unwrap();

    ctx.execute(&source("a.js", "var counter = 10;"), &caps).unwrap();
    assert_eq!(ctx.eval("repl", "counter + 1", &caps).unwrap(), "11");
}

#[test]
fn test_handle_registers_route_and_serves_request() {
    let pool = ContextPool::default();
    let caps = capabilities(&pool);
    let script = source(
        "hello.js",
        r#"
        server.handle('/hello', function(req) {
            return 'hello ' + req.method + ' ' + req.path;
        });
        "#,
    );

    let mut ctx = pool.acquire().unwrap();
    ctx.execute(&script, &caps).unwrap();

    let (pattern, route) = caps.routes.resolve("/hello").unwrap();
    assert_eq!(pattern, "/hello");
    assert!(matches!(route, Route::Script { .. }));

    let response = ctx
        .handle(&script, "/hello", json!({"method": "GET", "path": "/hello"}), &caps)
        .unwrap();
    assert_eq!(response, json!("hello GET /hello"));
}

#[test]
fn test_handle_replays_script_in_fresh_context() {
    let pool = ContextPool::default();
    let caps = capabilities(&pool);
    let script = source(
        "api.js",
        r#"
        server.log('loading api');
        server.handle('/api/', function(req) {
            return { status: 201, headers: { 'x-api': 'yes' }, body: req.body };
        });
        "#,
    );

    let mut configuring = pool.acquire().unwrap();
    configuring.execute(&script, &caps).unwrap();

    // Held, so the next acquire gets a new context
    let mut serving = pool.acquire().unwrap();
    assert_ne!(configuring.id(), serving.id());

    let response = serving
        .handle(&script, "/api/", json!({"method": "POST", "path": "/api/x", "body": "payload"}), &caps)
        .unwrap();
    assert_eq!(response, json!({"status": 201, "headers": {"x-api": "yes"}, "body": "payload"}));
    assert_eq!(caps.routes.len(), 1);
}

#[test]
fn test_handle_unknown_pattern_fails() {
    let pool = ContextPool::default();
    let caps = capabilities(&pool);
    let mut ctx = pool.acquire().unwrap();

    let err = ctx
        .handle(&source("empty.js", "// nothing"), "/missing", json!({}), &caps)
        .unwrap_err();
    assert!(matches!(err, KestrelError::InvalidRequest(_)));
}

#[test]
fn test_render_cache_bindings() {
    let pool = ContextPool::default();
    let caps = capabilities(&pool);
    let mut ctx = pool.acquire().unwrap();

    ctx.execute(&source("cache.js", "server.cacheSet('page', '<p>cached</p>');"), &caps)
        .unwrap();
    assert_eq!(caps.cache.get("page").as_deref(), Some("<p>cached</p>"));
    assert_eq!(ctx.eval("repl", "server.cacheGet('page') === '<p>cached</p>'", &caps).unwrap(), "true");
    assert_eq!(ctx.eval("repl", "server.cacheGet('other') === undefined", &caps).unwrap(), "true");
}

#[test]
fn test_permission_bindings() {
    let pool = ContextPool::default();
    let mut caps = capabilities(&pool);
    let mut ctx = pool.acquire().unwrap();

    assert_eq!(ctx.eval("repl", "server.hasPermissions()", &caps).unwrap(), "false");

    caps.permissions = Some(Arc::new(MemoryPermissions::default()));
    assert_eq!(ctx.eval("repl", "server.hasPermissions()", &caps).unwrap(), "true");
    assert_eq!(ctx.eval("repl", "server.isRejected('GET', '/admin/x')", &caps).unwrap(), "true");
    assert_eq!(ctx.eval("repl", "server.isRejected('GET', '/')", &caps).unwrap(), "false");
}

#[test]
fn test_nested_run_uses_another_context() {
    let pool = ContextPool::default();
    let caps = capabilities(&pool);
    let nested = create_test_script("server.cacheSet('nested', 'ran');");
    let outer = format!("server.run({:?});", nested.path().display().to_string());

    let mut ctx = pool.acquire().unwrap();
    ctx.execute(&source("outer.js", &outer), &caps).unwrap();

    assert_eq!(caps.cache.get("nested").as_deref(), Some("ran"));
    assert_eq!(pool.created(), 2);
}

#[test]
fn test_nested_run_missing_file_throws() {
    let pool = ContextPool::default();
    let caps = capabilities(&pool);
    let mut ctx = pool.acquire().unwrap();

    let result = ctx.execute(&source("outer.js", "server.run('/no/such/kestrel/script.js');"), &caps);
    assert!(result.is_err());
}

#[test]
fn test_script_source_from_path() {
    let script = create_test_script("var a = 1;");
    let loaded = ScriptSource::from_path(script.path()).unwrap();
    assert_eq!(loaded.code, "var a = 1;");
    assert_eq!(loaded.id, script.path().display().to_string());

    assert!(ScriptSource::from_path(std::path::Path::new("/no/such/file.js")).is_err());
}

#[test]
fn test_finalize_stops_worker() {
    let ctx = ScriptContext::spawn(99).unwrap();
    assert_eq!(ctx.id(), 99);
    ctx.finalize();
}
