//! Directory operations

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::UpdaterError;
use crate::filesys::file::File;

/// A directory wrapper with path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory (and parents)
    pub async fn create(&self) -> Result<(), UpdaterError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// List files with the given extension, sorted by file name.
    ///
    /// Hidden files (leading `.`) are ignored.
    pub async fn list_files_with_extension(&self, extension: &str) -> Result<Vec<File>, UpdaterError> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(true);
            let matches = path.extension().and_then(|e| e.to_str()) == Some(extension);
            if is_file && !hidden && matches {
                files.push(path);
            }
        }

        files.sort();
        Ok(files.into_iter().map(File::new).collect())
    }

    /// Get a file within this directory
    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }
}
