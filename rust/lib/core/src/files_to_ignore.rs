//! Read-only view over the configured ignorable file names.

use std::slice;

use crate::config::{FileToIgnoreEntry, ServiceConfig};

/// Snapshot of `webdav.files_to_ignore`, taken when the view is built.
///
/// Later changes to the configuration are not reflected. Iteration follows
/// the configured order.
#[derive(Debug, Clone, Default)]
pub struct FilesToIgnore {
    entries: Vec<FileToIgnoreEntry>,
}

impl FilesToIgnore {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::from_entries(config.webdav.files_to_ignore.iter().cloned())
    }

    pub fn from_entries(entries: impl IntoIterator<Item = FileToIgnoreEntry>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact, case-sensitive name match.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    pub fn iter(&self) -> slice::Iter<'_, FileToIgnoreEntry> {
        self.entries.iter()
    }
}

impl<'a> IntoIterator for &'a FilesToIgnore {
    type Item = &'a FileToIgnoreEntry;
    type IntoIter = slice::Iter<'a, FileToIgnoreEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
