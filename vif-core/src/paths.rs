//! Centralized path configuration.
//!
//! All data paths should go through this module so that the daemon and any
//! tooling agree on where state and generated configs live.

use std::path::PathBuf;

/// Get the data directory.
///
/// Resolution order:
/// 1. `NNC_DATA_DIR` environment variable
/// 2. `/var/lib/nnc` if it exists (system install)
/// 3. `~/.nnc` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("NNC_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/nnc");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".nnc")).unwrap_or(system_dir)
}

/// Get the database path.
pub fn db_path() -> PathBuf {
    data_dir().join("nnc.db")
}

/// Get the configuration directory.
pub fn config_dir() -> PathBuf {
    data_dir().join("config")
}

/// Get the runtime directory (sockets, pid files).
pub fn runtime_dir() -> PathBuf {
    data_dir().join("run")
}

/// Resolves per-category base directories for generated files.
pub trait PathResolver: Send + Sync {
    /// Base directory for the given category (e.g. `"gateways"`).
    fn config_path(&self, category: &str) -> PathBuf;
}

/// Resolver rooted at [`config_dir`], or at an explicit base directory.
#[derive(Debug, Clone)]
pub struct DefaultPathResolver {
    base: PathBuf,
}

impl DefaultPathResolver {
    pub fn new() -> Self {
        Self { base: config_dir() }
    }

    /// Root every category under `base` instead of the data directory.
    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl Default for DefaultPathResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PathResolver for DefaultPathResolver {
    fn config_path(&self, category: &str) -> PathBuf {
        self.base.join(category)
    }
}
