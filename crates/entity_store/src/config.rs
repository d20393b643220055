//! Store configuration.

use std::path::{Path, PathBuf};

/// Data directory used when none is configured.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// The environment variable used to override the data directory.
pub const DATA_DIR_ENV: &str = "ENTITY_DATA_DIR";

/// Configuration for an [`EntityStore`](crate::EntityStore).
///
/// Layout under `data_dir`:
///
/// ```text
/// <data_dir>/<entities_dir>/<id>.json
/// <data_dir>/<names_dir>/<category>/<encoded-name>.json
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root of everything the store owns. Exactly one process may use it.
    pub data_dir: PathBuf,
    /// Sub-directory holding entity files.
    pub entities_dir: String,
    /// Sub-directory holding name-lock files.
    pub names_dir: String,
    /// Pretty-print entity files.
    pub pretty_files: bool,
}

impl StoreConfig {
    /// Create a config rooted at `data_dir` with the default layout.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            entities_dir: "entities".to_string(),
            names_dir: "names".to_string(),
            pretty_files: true,
        }
    }

    /// Read the data directory from `ENTITY_DATA_DIR`, falling back to
    /// [`DEFAULT_DATA_DIR`].
    #[must_use]
    pub fn from_env() -> Self {
        let dir = std::env::var(DATA_DIR_ENV).unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());
        Self::new(dir)
    }

    #[must_use]
    pub fn with_entities_dir(mut self, dir: impl Into<String>) -> Self {
        self.entities_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_names_dir(mut self, dir: impl Into<String>) -> Self {
        self.names_dir = dir.into();
        self
    }

    /// Write entity files as single-line JSON.
    #[must_use]
    pub fn compact_files(mut self) -> Self {
        self.pretty_files = false;
        self
    }

    #[must_use]
    pub fn entities_path(&self) -> PathBuf {
        self.data_dir.join(&self.entities_dir)
    }

    #[must_use]
    pub fn names_path(&self) -> PathBuf {
        self.data_dir.join(&self.names_dir)
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_DIR)
    }
}
