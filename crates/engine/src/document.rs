use crate::error::{DecodeError, OpenError};
use image::{ImageBuffer, Rgba};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub type RgbaImage = ImageBuffer<Rgba<u8>, Vec<u8>>;

/// Supported document formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Pdf,
    Djvu,
}

impl DocumentKind {
    /// Classify a path by its extension, case-insensitively
    pub fn from_path(path: &Path) -> Result<Self, OpenError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "pdf" => Ok(DocumentKind::Pdf),
            "djvu" | "djv" => Ok(DocumentKind::Djvu),
            _ => Err(OpenError::Unsupported { extension }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentKind::Pdf => "pdf",
            DocumentKind::Djvu => "djvu",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque reference to an open document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentHandle {
    id: u64,
    kind: DocumentKind,
}

impl DocumentHandle {
    pub fn new(id: u64, kind: DocumentKind) -> Self {
        Self { id, kind }
    }

    pub fn raw(self) -> u64 {
        self.id
    }

    pub fn kind(self) -> DocumentKind {
        self.kind
    }
}

/// Result of a successful open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenedDocument {
    pub handle: DocumentHandle,
    pub page_count: u32,
    pub kind: DocumentKind,
}

/// Resolution a page is decoded at
///
/// Pages the user is looking at are decoded sharper than pages decoded ahead
/// of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScaleHint {
    Display,
    Prefetch,
}

/// A decoded page
///
/// Cheap to clone; the pixel data is shared.
#[derive(Debug, Clone)]
pub struct PageBitmap {
    pub page_index: u32,
    pub image: Arc<RgbaImage>,
}

impl PageBitmap {
    pub fn new(page_index: u32, image: RgbaImage) -> Self {
        Self {
            page_index,
            image: Arc::new(image),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Size of the pixel data in bytes
    pub fn byte_len(&self) -> usize {
        self.image.as_raw().len()
    }
}

/// Opens documents and decodes their pages
///
/// `decode` blocks and may be slow. Implementations must allow concurrent
/// `decode` calls for different pages of the same document.
pub trait PageDecoder: Send + Sync {
    fn open(&self, path: &Path) -> Result<OpenedDocument, OpenError>;

    fn decode(
        &self,
        handle: DocumentHandle,
        page_index: u32,
        scale: ScaleHint,
    ) -> Result<PageBitmap, DecodeError>;

    /// Release the document. Unknown handles are ignored.
    fn close(&self, handle: DocumentHandle);
}
