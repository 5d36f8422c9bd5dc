//! Kestrel Common Types
//!
//! This crate provides the types shared by every kestrel component:
//!
//! - [`error`] - The [`KestrelError`] enum and the crate-wide [`Result`] alias
//! - [`config`] - The immutable [`ServerConfig`] built once at startup
//!
//! # Example
//!
//! ```
//! use kestrel_common::{ServerConfig, ProtocolFlags};
//!
//! let config = ServerConfig::new("public")
//!     .with_protocol(ProtocolFlags { just_http: true, ..ProtocolFlags::default() });
//! assert!(config.validate().is_ok());
//! ```

pub mod config;
pub mod error;

pub use config::{ListenerLimits, ProtocolFlags, ServerConfig, WatchConfig};
pub use error::{KestrelError, Result};
