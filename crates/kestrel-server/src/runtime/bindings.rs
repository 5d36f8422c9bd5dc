//! Native bindings exposed to scripts
//!
//! Every context gets a global `server` object:
//!
//! - `server.handle(pattern, fn)` - register `fn(request)` for `pattern`
//! - `server.run(path)` - execute another script in its own pooled context
//! - `server.log(...)` / `server.warn(...)` - log on the `kestrel::script` target
//! - `server.cacheGet(key)` / `server.cacheSet(key, value)` - render cache access
//! - `server.hasPermissions()` - whether a permission backend is active
//! - `server.isRejected(method, path)` - ask the permission backend
//!
//! Capabilities are not stored in the interpreter. The worker thread that
//! owns the context installs them in a thread local for the duration of one
//! job, and the native functions read them from there.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use boa_engine::{
    js_string,
    native_function::NativeFunction,
    object::{FunctionObjectBuilder, JsObject},
    property::Attribute,
    value::JsValue,
    Context, JsNativeError, JsResult,
};
use kestrel_common::{KestrelError, Result};

use crate::cache::RenderCache;
use crate::permissions::Permissions;
use crate::routing::{Route, RoutingRegistry};
use crate::runtime::context::ScriptSource;
use crate::runtime::context_pool::ContextPool;

/// Name of the hidden global holding handler functions, keyed by source id
/// and then by route pattern.
pub(crate) const HANDLERS_GLOBAL: &str = "__kestrel_handlers";

/// Everything a script may reach through the `server` global.
#[derive(Clone)]
pub struct Capabilities {
    pub permissions: Option<Arc<dyn Permissions>>,
    pub pool: ContextPool,
    pub cache: Arc<RenderCache>,
    pub routes: Arc<RoutingRegistry>,
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("permissions", &self.permissions.as_ref().map(|p| p.name().to_string()))
            .field("routes", &self.routes.len())
            .finish()
    }
}

/// How the running script is being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// First execution: handlers are registered as routes, nested runs execute
    Configure,
    /// Re-evaluation in another context to recover handler functions
    Replay,
    /// A handler function answering a request
    Serve,
}

#[derive(Clone)]
pub(crate) struct ActiveScript {
    pub caps: Capabilities,
    pub mode: Mode,
    pub source: Arc<ScriptSource>,
}

thread_local! {
    static ACTIVE: RefCell<Option<ActiveScript>> = const { RefCell::new(None) };
}

/// Restores the previously active script when dropped.
pub(crate) struct ActiveGuard {
    previous: Option<ActiveScript>,
}

pub(crate) fn activate(script: ActiveScript) -> ActiveGuard {
    let previous = ACTIVE.with(|active| active.replace(Some(script)));
    ActiveGuard { previous }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        ACTIVE.with(|active| *active.borrow_mut() = previous);
    }
}

fn active() -> JsResult<ActiveScript> {
    ACTIVE
        .with(|active| active.borrow().clone())
        .ok_or_else(|| {
            JsNativeError::error()
                .with_message("server functions are only available while a script runs")
                .into()
        })
}

/// Installs the `server` global and the handler table into `ctx`.
pub(crate) fn install_server_bindings(ctx: &mut Context) -> Result<()> {
    let server = JsObject::default(ctx.intrinsics());

    let functions: [(&str, usize, NativeFunction); 8] = [
        ("handle", 2, NativeFunction::from_copy_closure(handle)),
        ("run", 1, NativeFunction::from_copy_closure(run)),
        ("log", 0, NativeFunction::from_copy_closure(log)),
        ("warn", 0, NativeFunction::from_copy_closure(warn)),
        ("cacheGet", 1, NativeFunction::from_copy_closure(cache_get)),
        ("cacheSet", 2, NativeFunction::from_copy_closure(cache_set)),
        ("hasPermissions", 0, NativeFunction::from_copy_closure(has_permissions)),
        ("isRejected", 2, NativeFunction::from_copy_closure(is_rejected)),
    ];

    for (name, length, native) in functions {
        let function = FunctionObjectBuilder::new(ctx.realm(), native)
            .name(js_string!(name))
            .length(length)
            .build();
        server
            .set(js_string!(name), function, false, ctx)
            .map_err(|e| KestrelError::ContextInit(format!("Failed to install server.{}: {}", name, e)))?;
    }

    ctx.register_global_property(js_string!("server"), server, Attribute::READONLY)
        .map_err(|e| KestrelError::ContextInit(format!("Failed to register server global: {}", e)))?;

    let handlers = JsObject::default(ctx.intrinsics());
    ctx.register_global_property(js_string!(HANDLERS_GLOBAL), handlers, Attribute::READONLY)
        .map_err(|e| KestrelError::ContextInit(format!("Failed to register handler table: {}", e)))?;

    Ok(())
}

fn string_arg(args: &[JsValue], index: usize, what: &str, ctx: &mut Context) -> JsResult<String> {
    match args.get(index) {
        Some(value) if !value.is_undefined() => Ok(value.to_string(ctx)?.to_std_string_escaped()),
        _ => Err(JsNativeError::typ()
            .with_message(format!("{} is required", what))
            .into()),
    }
}

fn joined_args(args: &[JsValue], ctx: &mut Context) -> JsResult<String> {
    let mut parts = Vec::with_capacity(args.len());
    for arg in args {
        parts.push(arg.to_string(ctx)?.to_std_string_escaped());
    }
    Ok(parts.join(" "))
}

/// Returns the handler table for `source_id`, creating it when missing.
pub(crate) fn handler_table(source_id: &str, ctx: &mut Context) -> JsResult<JsObject> {
    let handlers = ctx.global_object().get(js_string!(HANDLERS_GLOBAL), ctx)?;
    let handlers = handlers
        .as_object()
        .map(|o| o.clone())
        .ok_or_else(|| JsNativeError::typ().with_message("handler table is missing"))?;

    let existing = handlers.get(js_string!(source_id), ctx)?;
    if let Some(table) = existing.as_object() {
        return Ok(table.clone());
    }

    let table = JsObject::default(ctx.intrinsics());
    handlers.set(js_string!(source_id), table.clone(), true, ctx)?;
    Ok(table)
}

fn handle(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let pattern = string_arg(args, 0, "route pattern", ctx)?;
    let function = args
        .get(1)
        .and_then(|v| v.as_object())
        .filter(|o| o.is_callable())
        .map(|o| o.clone())
        .ok_or_else(|| JsNativeError::typ().with_message("second argument must be a function"))?;

    let script = active()?;
    let table = handler_table(&script.source.id, ctx)?;
    table.set(js_string!(pattern.as_str()), function, true, ctx)?;

    if script.mode == Mode::Configure {
        script.caps.routes.register(
            pattern.clone(),
            Route::Script {
                source: script.source.clone(),
                pattern: pattern.clone(),
            },
        );
        tracing::debug!(pattern = %pattern, script = %script.source.id, "Registered script handler");
    }

    Ok(JsValue::undefined())
}

fn run(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let path = string_arg(args, 0, "script path", ctx)?;
    let script = active()?;
    if script.mode == Mode::Replay {
        return Ok(JsValue::undefined());
    }

    let source = ScriptSource::from_path(std::path::Path::new(&path))
        .map(Arc::new)
        .map_err(|e| JsNativeError::error().with_message(e.to_string()))?;

    let mut context = script
        .caps
        .pool
        .acquire()
        .map_err(|e| JsNativeError::error().with_message(e.to_string()))?;
    context
        .execute(&source, &script.caps)
        .map_err(|e| JsNativeError::error().with_message(e.to_string()))?;

    Ok(JsValue::undefined())
}

fn log(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let script = active()?;
    if script.mode != Mode::Replay {
        let message = joined_args(args, ctx)?;
        tracing::info!(target: "kestrel::script", script = %script.source.id, "{}", message);
    }
    Ok(JsValue::undefined())
}

fn warn(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let script = active()?;
    if script.mode != Mode::Replay {
        let message = joined_args(args, ctx)?;
        tracing::warn!(target: "kestrel::script", script = %script.source.id, "{}", message);
    }
    Ok(JsValue::undefined())
}

fn cache_get(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let key = string_arg(args, 0, "cache key", ctx)?;
    let script = active()?;
    Ok(match script.caps.cache.get(&key) {
        Some(value) => JsValue::new(js_string!(value)),
        None => JsValue::undefined(),
    })
}

fn cache_set(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let key = string_arg(args, 0, "cache key", ctx)?;
    let value = string_arg(args, 1, "cache value", ctx)?;
    let script = active()?;
    Ok(JsValue::new(script.caps.cache.insert(key, value)))
}

fn has_permissions(_this: &JsValue, _args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    let script = active()?;
    Ok(JsValue::new(script.caps.permissions.is_some()))
}

fn is_rejected(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let method = string_arg(args, 0, "method", ctx)?;
    let path = string_arg(args, 1, "path", ctx)?;
    let script = active()?;
    let rejected = script
        .caps
        .permissions
        .as_ref()
        .is_some_and(|p| p.rejected(&method, &path));
    Ok(JsValue::new(rejected))
}
