//! # kestrel CLI
//!
//! Argument parsing, logging setup, server root discovery and the
//! interactive prompt used by the `kestrel` binary.

pub mod args;
pub mod logging;
pub mod repl;
pub mod root;
