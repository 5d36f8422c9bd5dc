pub mod cache;
pub mod events;
pub mod http_router;
pub mod permissions;
pub mod pipeline;
pub mod profile;
pub mod protocol;
pub mod routing;
pub mod runtime;
pub mod shutdown;

pub use http_router::{HttpHandler, RequestRouter};
pub use pipeline::{ConfigurationPipeline, ConfigurationReport, ConfigurationTask};
pub use protocol::{ProtocolServer, ProtocolState, RunningServer, ServeReport, StopHandle};
pub use runtime::{Capabilities, ContextPool, PooledContext, ScriptContext};
pub use shutdown::ShutdownRegistry;
