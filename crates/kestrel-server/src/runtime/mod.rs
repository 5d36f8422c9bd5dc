pub mod bindings;
pub mod context;
pub mod context_pool;

mod conversions;

#[cfg(test)]
mod tests;

pub use bindings::Capabilities;
pub use context::{ScriptContext, ScriptSource};
pub use context_pool::{ContextPool, PoolConfig, PooledContext};
pub use conversions::{js_value_to_json, json_to_js_value};
