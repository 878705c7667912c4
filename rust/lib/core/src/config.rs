use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ServiceError;

/// Service configuration shared by the panel binaries.
///
/// Loaded from a TOML file, then optionally overridden from command-line
/// arguments:
///
/// ```toml
/// data_dir = "/var/lib/panel"
///
/// [webdav]
/// files_to_ignore = [{ name = "desktop.ini" }, { name = "Thumbs.db" }]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Directory holding the panel's local data files.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Path to the SQLite database file.
    /// Defaults to `{data_dir}/panel.sqlite` if not specified.
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,

    /// WebDAV portal settings.
    #[serde(default)]
    pub webdav: WebDavConfig,
}

/// The `[webdav]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebDavConfig {
    /// File names hidden from WebDAV listings, in configured order.
    #[serde(default)]
    pub files_to_ignore: Vec<FileToIgnoreEntry>,
}

/// One configured ignorable file name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileToIgnoreEntry {
    pub name: String,
}

impl FileToIgnoreEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ServiceConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ServiceError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ServiceError::Config(format!("read {}: {e}", path.display())))?;
        let config = Self::from_toml_str(&content)?;
        debug!(
            "loaded configuration from {} ({} ignorable files)",
            path.display(),
            config.webdav.files_to_ignore.len()
        );
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ServiceError> {
        let config: ServiceConfig =
            toml::from_str(content).map_err(|e| ServiceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply command-line overrides.
    ///
    /// Supported flags:
    /// - `--data-dir=PATH`
    /// - `--sqlite=PATH`
    pub fn apply_args(&mut self, args: &[String]) {
        for arg in args {
            if let Some(val) = arg.strip_prefix("--data-dir=") {
                self.data_dir = Some(PathBuf::from(val));
            } else if let Some(val) = arg.strip_prefix("--sqlite=") {
                self.sqlite_path = Some(PathBuf::from(val));
            }
        }
    }

    /// Reject an ignorable-file list with empty or duplicate names.
    pub fn validate(&self) -> Result<(), ServiceError> {
        let mut seen = HashSet::new();
        for (i, entry) in self.webdav.files_to_ignore.iter().enumerate() {
            if entry.name.trim().is_empty() {
                return Err(ServiceError::Config(format!(
                    "webdav.files_to_ignore[{i}]: name is empty"
                )));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(ServiceError::Config(format!(
                    "webdav.files_to_ignore[{i}]: duplicate name {:?}",
                    entry.name
                )));
            }
        }
        Ok(())
    }

    /// Resolve the SQLite database path, falling back to `{data_dir}/panel.sqlite`.
    pub fn resolve_sqlite_path(&self) -> PathBuf {
        self.sqlite_path
            .clone()
            .unwrap_or_else(|| self.resolve_data_subpath("panel.sqlite"))
    }

    fn resolve_data_subpath(&self, name: &str) -> PathBuf {
        self.data_dir
            .as_ref()
            .map(|d| d.join(name))
            .unwrap_or_else(|| PathBuf::from(name))
    }
}
