//! Server root discovery.

use anyhow::{bail, Result};
use kestrel_server::routing::StaticFiles;
use std::path::{Path, PathBuf};

/// What the positional argument points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerRoot {
    /// A directory served by the default routes
    Directory(PathBuf),
    /// A `.js` file that defines all request handling
    ServerScript { dir: PathBuf, script: PathBuf },
    /// Any other file, served on its own
    SingleFile(PathBuf),
}

impl ServerRoot {
    /// Classifies `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing exists at `path`.
    pub fn discover(path: &Path) -> Result<Self> {
        if path.is_dir() {
            return Ok(ServerRoot::Directory(path.to_path_buf()));
        }
        if !path.exists() {
            bail!("No such file or directory: {}", path.display());
        }

        if path.extension().is_some_and(|ext| ext == "js") {
            Ok(ServerRoot::ServerScript {
                dir: parent_dir(path),
                script: path.to_path_buf(),
            })
        } else {
            Ok(ServerRoot::SingleFile(path.to_path_buf()))
        }
    }

    /// Directory the server runs from.
    pub fn dir(&self) -> &Path {
        match self {
            ServerRoot::Directory(dir) | ServerRoot::ServerScript { dir, .. } => dir,
            ServerRoot::SingleFile(file) => file
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new(".")),
        }
    }

    pub fn server_script(&self) -> Option<&Path> {
        match self {
            ServerRoot::ServerScript { script, .. } => Some(script),
            _ => None,
        }
    }

    pub fn is_single_file(&self) -> bool {
        matches!(self, ServerRoot::SingleFile(_))
    }

    /// Default routes for this root.
    pub fn installer(&self) -> StaticFiles {
        match self {
            ServerRoot::SingleFile(file) => StaticFiles::single_file(file),
            _ => StaticFiles::new(self.dir()),
        }
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
