//! Permission backend contract.
//!
//! The runtime treats the backend as an opaque handle. Its presence makes
//! configuration script errors fatal, since scripts may have started to
//! persist state that later requests rely on. Requests the backend rejects
//! are answered with `403 Forbidden`.

use std::fmt;

pub trait Permissions: Send + Sync + fmt::Debug {
    /// Backend name, for server information output
    fn name(&self) -> &str;

    /// Whether a request for `path` with `method` must be refused.
    fn rejected(&self, method: &str, path: &str) -> bool;
}

/// In-process backend that refuses every request under its admin prefixes.
#[derive(Debug, Clone)]
pub struct MemoryPermissions {
    admin_prefixes: Vec<String>,
}

impl Default for MemoryPermissions {
    fn default() -> Self {
        Self {
            admin_prefixes: vec!["/admin".to_string()],
        }
    }
}

impl MemoryPermissions {
    pub fn with_admin_prefixes(prefixes: Vec<String>) -> Self {
        Self {
            admin_prefixes: prefixes,
        }
    }
}

impl Permissions for MemoryPermissions {
    fn name(&self) -> &str {
        "memory"
    }

    fn rejected(&self, _method: &str, path: &str) -> bool {
        self.admin_prefixes.iter().any(|prefix| {
            path == prefix
                || path
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}
