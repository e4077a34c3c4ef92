use crate::djvu::{DjvuBackend, DjvuOptions};
use crate::document::{DocumentHandle, DocumentKind, OpenedDocument, PageBitmap, PageDecoder, ScaleHint};
use crate::error::{DecodeError, OpenError};
use crate::pdf::{PdfBackend, PdfOptions};
use std::path::Path;

/// Routes each document to the backend for its format
#[derive(Debug, Default)]
pub struct DocumentBackend {
    pdf: PdfBackend,
    djvu: DjvuBackend,
}

impl DocumentBackend {
    pub fn new(pdf: PdfOptions, djvu: DjvuOptions) -> Self {
        Self {
            pdf: PdfBackend::new(pdf),
            djvu: DjvuBackend::new(djvu),
        }
    }

    pub fn pdf(&self) -> &PdfBackend {
        &self.pdf
    }

    pub fn djvu(&self) -> &DjvuBackend {
        &self.djvu
    }

    fn backend_for(&self, kind: DocumentKind) -> &dyn PageDecoder {
        match kind {
            DocumentKind::Pdf => &self.pdf,
            DocumentKind::Djvu => &self.djvu,
        }
    }
}

impl PageDecoder for DocumentBackend {
    fn open(&self, path: &Path) -> Result<OpenedDocument, OpenError> {
        if !path.exists() {
            return Err(OpenError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let kind = DocumentKind::from_path(path)?;
        self.backend_for(kind).open(path)
    }

    fn decode(
        &self,
        handle: DocumentHandle,
        page_index: u32,
        scale: ScaleHint,
    ) -> Result<PageBitmap, DecodeError> {
        self.backend_for(handle.kind()).decode(handle, page_index, scale)
    }

    fn close(&self, handle: DocumentHandle) {
        self.backend_for(handle.kind()).close(handle);
    }
}

pub fn default_backend() -> DocumentBackend {
    DocumentBackend::default()
}
