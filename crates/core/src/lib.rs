//! DJVU Reader Core Library
//!
//! Session layer of the reader: it opens one document at a time, keeps the
//! page on screen responsive while the rest of the document is decoded in
//! the background, and exposes the resulting state as snapshots.
//!
//! ```no_run
//! use djvu_reader_core::{DocumentSession, ViewerConfig};
//! use std::time::Duration;
//!
//! let session = DocumentSession::from_config(ViewerConfig::load()?)?;
//! session.load_document("book.djvu")?;
//! session.wait_until(Duration::from_secs(10), |s| s.current_bitmap.is_some());
//! session.next_page();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
mod error;
pub mod recent;
pub mod session;

pub use config::{
    CacheSettings, ConfigError, DjvuSettings, PdfSettings, ViewSettings, ViewerConfig,
    WorkerSettings,
};
pub use error::SessionError;
pub use recent::{RecentDocuments, RecentError, MAX_RECENT_DOCUMENTS};
pub use session::{sweep_order, DocumentSession, ParseViewModeError, SessionSnapshot, ViewMode};
