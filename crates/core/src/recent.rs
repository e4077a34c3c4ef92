//! Recently opened documents
//!
//! The list is persisted as a JSON array of paths, most recent first.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Maximum number of recent documents to track
pub const MAX_RECENT_DOCUMENTS: usize = 10;

/// Overrides the directory the list is stored in
pub const DATA_DIR_ENV: &str = "DJVU_READER_DATA_DIR";

const STORAGE_FILE: &str = "recent_documents.json";

/// Manages a list of recently opened documents
#[derive(Debug, Clone)]
pub struct RecentDocuments {
    /// Most recent first
    documents: Vec<PathBuf>,
    storage_path: PathBuf,
}

impl Default for RecentDocuments {
    fn default() -> Self {
        Self::new()
    }
}

impl RecentDocuments {
    pub fn new() -> Self {
        Self::with_storage_path(Self::default_storage_path())
    }

    /// Creates a list persisted at `path` instead of the default location
    pub fn with_storage_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            documents: Vec::new(),
            storage_path: path.as_ref().to_path_buf(),
        }
    }

    /// Returns the default storage path
    ///
    /// `DJVU_READER_DATA_DIR` takes precedence when set. Otherwise:
    /// - macOS: ~/Library/Application Support/djvu-reader/recent_documents.json
    /// - Linux: ~/.local/share/djvu-reader/recent_documents.json
    /// - Windows: %APPDATA%\djvu-reader\recent_documents.json
    pub fn default_storage_path() -> PathBuf {
        if let Some(dir) = env::var_os(DATA_DIR_ENV) {
            return PathBuf::from(dir).join(STORAGE_FILE);
        }
        match dirs::data_dir() {
            Some(data_dir) => data_dir.join("djvu-reader").join(STORAGE_FILE),
            None => PathBuf::from(STORAGE_FILE),
        }
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// Records `path` as the most recent document
    ///
    /// A path already in the list moves to the front. The list is capped at
    /// [`MAX_RECENT_DOCUMENTS`] entries.
    pub fn add<P: AsRef<Path>>(&mut self, path: P) {
        let path = path.as_ref().to_path_buf();
        self.documents.retain(|p| p != &path);
        self.documents.insert(0, path);
        self.documents.truncate(MAX_RECENT_DOCUMENTS);
    }

    /// Removes `path`, returning whether it was listed
    pub fn remove<P: AsRef<Path>>(&mut self, path: P) -> bool {
        let before = self.documents.len();
        self.documents.retain(|p| p != path.as_ref());
        self.documents.len() != before
    }

    pub fn documents(&self) -> &[PathBuf] {
        &self.documents
    }

    pub fn last_opened(&self) -> Option<&Path> {
        self.documents.first().map(PathBuf::as_path)
    }

    pub fn clear(&mut self) {
        self.documents.clear();
    }

    /// Loads the list from disk, dropping documents that no longer exist
    ///
    /// A missing storage file leaves the list empty.
    pub fn load(&mut self) -> Result<(), RecentError> {
        if !self.storage_path.exists() {
            return Ok(());
        }

        let contents = fs::read_to_string(&self.storage_path)?;
        let mut documents: Vec<PathBuf> = serde_json::from_str(&contents)?;
        documents.retain(|p| p.exists());
        documents.truncate(MAX_RECENT_DOCUMENTS);
        self.documents = documents;
        Ok(())
    }

    /// Saves the list to disk, creating the parent directory if needed
    pub fn save(&self) -> Result<(), RecentError> {
        if let Some(parent) = self.storage_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&self.documents)?;
        fs::write(&self.storage_path, json)?;
        Ok(())
    }
}

/// Errors from loading or saving the recent documents list
#[derive(Debug, thiserror::Error)]
pub enum RecentError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed recent documents file: {0}")]
    Parse(#[from] serde_json::Error),
}
