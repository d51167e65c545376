//! Data directory management
//!
//! Paths for everything the node persists:
//! - `local.db` — recovery state (community, identity, peer stats)
//! - `store/` — replicated store databases, one file per dataset

use std::path::{Path, PathBuf};

const APP_NAME: &str = "haven";

/// Data directory configuration.
#[derive(Debug, Clone)]
pub struct DataDir {
    base: PathBuf,
}

impl DataDir {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Platform-specific default location:
    ///
    /// - Linux: `~/.local/share/haven/`
    /// - macOS: `~/Library/Application Support/haven/`
    /// - Windows: `C:\Users\<user>\AppData\Roaming\haven\`
    pub fn default_location() -> Option<Self> {
        dirs::data_dir().map(|d| Self::new(d.join(APP_NAME)))
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Recovery state database.
    pub fn local_db(&self) -> PathBuf {
        self.base.join("local.db")
    }

    /// Directory holding replicated store databases.
    pub fn store_dir(&self) -> PathBuf {
        self.base.join("store")
    }

    /// Database path for one named dataset.
    pub fn store_db(&self, name: &str) -> PathBuf {
        self.store_dir().join(format!("{name}.db"))
    }

    /// Create the directory tree if missing.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.store_dir())?;
        Ok(())
    }
}
