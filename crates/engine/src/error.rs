use std::path::PathBuf;

/// Failure to open a document
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("file not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("cannot read {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported document type {extension:?} (expected .pdf, .djvu or .djv)")]
    Unsupported { extension: String },
    #[error("required tool `{tool}` was not found; install djvulibre")]
    ToolUnavailable { tool: String },
    #[error("malformed document: {reason}")]
    Malformed { reason: String },
    #[error("encrypted documents are not supported")]
    Encrypted,
}

/// Failure to decode a page
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("page {page} out of range (page_count={page_count})")]
    PageOutOfRange { page: u32, page_count: u32 },
    #[error("page {page} could not be converted: {detail}")]
    Conversion { page: u32, detail: String },
    #[error("page {page} produced a corrupt image ({bytes} bytes)")]
    CorruptPage { page: u32, bytes: usize },
    #[error("required tool `{tool}` was not found")]
    ToolUnavailable { tool: String },
    #[error("invalid handle {0}")]
    UnknownHandle(u64),
}

impl DecodeError {
    /// Whether asking again might succeed
    ///
    /// `false` for requests that can never succeed for this document, such as
    /// a page that does not exist.
    pub fn is_transient(&self) -> bool {
        matches!(self, DecodeError::Conversion { .. } | DecodeError::CorruptPage { .. })
    }

    /// Page the error refers to, if any
    pub fn page(&self) -> Option<u32> {
        match self {
            DecodeError::PageOutOfRange { page, .. }
            | DecodeError::Conversion { page, .. }
            | DecodeError::CorruptPage { page, .. } => Some(*page),
            DecodeError::ToolUnavailable { .. } | DecodeError::UnknownHandle(_) => None,
        }
    }
}
