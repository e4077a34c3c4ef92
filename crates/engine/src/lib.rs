//! Document open and page decode backends.
//!
//! [`PageDecoder`] is the contract the viewer schedules decodes against.
//! [`PdfBackend`] reads PDFs with lopdf, [`DjvuBackend`] drives the djvulibre
//! command-line tools, and [`DocumentBackend`] picks between them by file
//! extension.

mod backend;
pub mod djvu;
mod document;
mod error;
pub mod pdf;

pub use backend::{default_backend, DocumentBackend};
pub use djvu::{DjvuBackend, DjvuOptions};
pub use document::{
    DocumentHandle, DocumentKind, OpenedDocument, PageBitmap, PageDecoder, RgbaImage, ScaleHint,
};
pub use error::{DecodeError, OpenError};
pub use pdf::{PageSize, PdfBackend, PdfOptions};
