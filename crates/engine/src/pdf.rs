//! PDF backend built on lopdf.
//!
//! lopdf parses structure only, so pages are rasterized as blank canvases
//! sized from each page's MediaBox.

use crate::document::{
    DocumentHandle, DocumentKind, OpenedDocument, PageBitmap, PageDecoder, RgbaImage, ScaleHint,
};
use crate::error::{DecodeError, OpenError};
use image::Rgba;
use lopdf::{Dictionary, Document, Object};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// US Letter, used when a page has no usable MediaBox
const FALLBACK_PAGE_SIZE: PageSize = PageSize {
    width_pt: 612.0,
    height_pt: 792.0,
};

/// Parent links followed when looking for an inherited MediaBox
const MAX_INHERIT_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width_pt: f32,
    pub height_pt: f32,
}

/// Render scales for the PDF backend
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PdfOptions {
    /// Points-to-pixels factor for pages shown on screen
    pub display_scale: f32,
    /// Points-to-pixels factor for pages decoded ahead of time
    pub prefetch_scale: f32,
}

impl Default for PdfOptions {
    fn default() -> Self {
        Self {
            display_scale: 5.0,
            prefetch_scale: 4.0,
        }
    }
}

impl PdfOptions {
    fn scale_for(&self, hint: ScaleHint) -> f32 {
        let scale = match hint {
            ScaleHint::Display => self.display_scale,
            ScaleHint::Prefetch => self.prefetch_scale,
        };
        if scale <= 0.0 {
            1.0
        } else {
            scale
        }
    }
}

#[derive(Debug, Clone)]
struct DocumentRecord {
    page_sizes: Vec<PageSize>,
}

#[derive(Debug, Default)]
pub struct PdfBackend {
    options: PdfOptions,
    next_handle: AtomicU64,
    docs: RwLock<HashMap<u64, DocumentRecord>>,
}

impl PdfBackend {
    pub fn new(options: PdfOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn options(&self) -> PdfOptions {
        self.options
    }

    fn read_docs(&self) -> RwLockReadGuard<'_, HashMap<u64, DocumentRecord>> {
        self.docs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_docs(&self) -> RwLockWriteGuard<'_, HashMap<u64, DocumentRecord>> {
        self.docs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn media_box(doc: &Document, dict: &Dictionary) -> Option<PageSize> {
        let mut current = dict;
        for _ in 0..MAX_INHERIT_DEPTH {
            if let Some(size) = current
                .get(b"MediaBox")
                .ok()
                .and_then(|obj| obj.as_array().ok())
                .and_then(|array| Self::size_from_box(array))
            {
                return Some(size);
            }
            let parent = current.get(b"Parent").ok()?.as_reference().ok()?;
            current = doc.get_dictionary(parent).ok()?;
        }
        None
    }

    fn size_from_box(array: &[Object]) -> Option<PageSize> {
        if array.len() != 4 {
            return None;
        }
        let x0 = array[0].as_float().ok()?;
        let y0 = array[1].as_float().ok()?;
        let x1 = array[2].as_float().ok()?;
        let y1 = array[3].as_float().ok()?;
        Some(PageSize {
            width_pt: (x1 - x0).abs(),
            height_pt: (y1 - y0).abs(),
        })
    }

    /// Page sizes of a PDF held in memory
    pub fn parse_sizes(bytes: &[u8]) -> Result<Vec<PageSize>, OpenError> {
        if bytes.windows(b"/Encrypt".len()).any(|window| window == b"/Encrypt") {
            return Err(OpenError::Encrypted);
        }

        let doc = Document::load_mem(bytes).map_err(|err| OpenError::Malformed {
            reason: err.to_string(),
        })?;
        let pages = doc.get_pages();
        let mut sizes = Vec::with_capacity(pages.len());

        for (_, object_id) in pages {
            let size = doc
                .get_dictionary(object_id)
                .ok()
                .and_then(|dict| Self::media_box(&doc, dict))
                .unwrap_or(FALLBACK_PAGE_SIZE);
            sizes.push(size);
        }

        if sizes.is_empty() {
            return Err(OpenError::Malformed {
                reason: "document has no pages".to_owned(),
            });
        }

        Ok(sizes)
    }

    /// Size of a page in points
    pub fn page_size(&self, handle: DocumentHandle, page_index: u32) -> Result<PageSize, DecodeError> {
        let docs = self.read_docs();
        let record = docs
            .get(&handle.raw())
            .ok_or(DecodeError::UnknownHandle(handle.raw()))?;
        record
            .page_sizes
            .get(page_index as usize)
            .copied()
            .ok_or(DecodeError::PageOutOfRange {
                page: page_index,
                page_count: record.page_sizes.len() as u32,
            })
    }

    fn render_canvas(size: PageSize, scale: f32) -> RgbaImage {
        let width = (size.width_pt * scale).round().max(1.0) as u32;
        let height = (size.height_pt * scale).round().max(1.0) as u32;

        let mut image = RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]));

        if width >= 4 && height >= 4 {
            let border = Rgba([220, 220, 220, 255]);
            for x in 0..width {
                image.put_pixel(x, 0, border);
                image.put_pixel(x, height - 1, border);
            }
            for y in 0..height {
                image.put_pixel(0, y, border);
                image.put_pixel(width - 1, y, border);
            }
        }

        image
    }
}

impl PageDecoder for PdfBackend {
    fn open(&self, path: &Path) -> Result<OpenedDocument, OpenError> {
        if !path.exists() {
            return Err(OpenError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let bytes = fs::read(path).map_err(|source| OpenError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;

        let page_sizes = Self::parse_sizes(&bytes)?;
        let page_count = page_sizes.len() as u32;

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = DocumentHandle::new(id, DocumentKind::Pdf);
        self.write_docs().insert(id, DocumentRecord { page_sizes });

        tracing::debug!(path = %path.display(), page_count, "opened pdf");
        Ok(OpenedDocument {
            handle,
            page_count,
            kind: DocumentKind::Pdf,
        })
    }

    fn decode(
        &self,
        handle: DocumentHandle,
        page_index: u32,
        scale: ScaleHint,
    ) -> Result<PageBitmap, DecodeError> {
        let size = self.page_size(handle, page_index)?;
        let image = Self::render_canvas(size, self.options.scale_for(scale));
        Ok(PageBitmap::new(page_index, image))
    }

    fn close(&self, handle: DocumentHandle) {
        self.write_docs().remove(&handle.raw());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use lopdf::dictionary;

    /// A PDF with `page_count` pages of `width` x `height` points
    pub(crate) fn sample_pdf_bytes(page_count: u32, width: i64, height: i64) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let kids: Vec<Object> = (0..page_count)
            .map(|_| {
                let page_id = doc.add_object(dictionary! {
                    "Type" => "Page",
                    "Parent" => pages_id,
                    "MediaBox" => vec![
                        Object::Integer(0),
                        Object::Integer(0),
                        Object::Integer(width),
                        Object::Integer(height),
                    ],
                });
                Object::Reference(page_id)
            })
            .collect();

        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => page_count as i64,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).expect("sample pdf should serialize");
        bytes
    }

    fn write_sample(dir: &tempfile::TempDir, name: &str, page_count: u32) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, sample_pdf_bytes(page_count, 60, 80)).unwrap();
        path
    }

    #[test]
    fn opens_pdf_and_reads_page_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(&dir, "three.pdf", 3);

        let backend = PdfBackend::default();
        let opened = backend.open(&path).expect("open should succeed");

        assert_eq!(opened.page_count, 3);
        assert_eq!(opened.kind, DocumentKind::Pdf);
        assert_eq!(opened.handle.kind(), DocumentKind::Pdf);
    }

    #[test]
    fn decode_scales_media_box() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(&dir, "one.pdf", 1);

        let backend = PdfBackend::default();
        let opened = backend.open(&path).unwrap();

        let display = backend.decode(opened.handle, 0, ScaleHint::Display).unwrap();
        assert_eq!((display.width(), display.height()), (300, 400));

        let prefetch = backend.decode(opened.handle, 0, ScaleHint::Prefetch).unwrap();
        assert_eq!((prefetch.width(), prefetch.height()), (240, 320));
        assert_eq!(prefetch.page_index, 0);
    }

    #[test]
    fn inherited_media_box_is_used() {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![Object::Reference(page_id)],
                "Count" => 1_i64,
                "MediaBox" => vec![
                    Object::Integer(0),
                    Object::Integer(0),
                    Object::Integer(100),
                    Object::Integer(50),
                ],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();

        let sizes = PdfBackend::parse_sizes(&bytes).unwrap();
        assert_eq!(sizes, vec![PageSize { width_pt: 100.0, height_pt: 50.0 }]);
    }

    #[test]
    fn page_out_of_range_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(&dir, "two.pdf", 2);
        let backend = PdfBackend::default();
        let opened = backend.open(&path).unwrap();

        let err = backend.decode(opened.handle, 2, ScaleHint::Display).unwrap_err();
        assert_eq!(err, DecodeError::PageOutOfRange { page: 2, page_count: 2 });
        assert!(!err.is_transient());
    }

    #[test]
    fn encrypted_pdf_is_rejected() {
        let mut bytes = sample_pdf_bytes(1, 60, 80);
        bytes.extend_from_slice(b"\n% /Encrypt 5 0 R\n");

        let err = PdfBackend::parse_sizes(&bytes).unwrap_err();
        assert!(matches!(err, OpenError::Encrypted));
    }

    #[test]
    fn garbage_is_malformed() {
        let err = PdfBackend::parse_sizes(b"definitely not a pdf").unwrap_err();
        assert!(matches!(err, OpenError::Malformed { .. }));
    }

    #[test]
    fn missing_file_is_not_found() {
        let backend = PdfBackend::default();
        let err = backend.open(Path::new("/nonexistent/missing.pdf")).unwrap_err();
        assert!(matches!(err, OpenError::NotFound { .. }));
    }

    #[test]
    fn invalid_handle_returns_error() {
        let backend = PdfBackend::default();
        let handle = DocumentHandle::new(999, DocumentKind::Pdf);
        let err = backend.decode(handle, 0, ScaleHint::Display).unwrap_err();

        assert_eq!(err, DecodeError::UnknownHandle(999));
    }

    #[test]
    fn close_forgets_the_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(&dir, "one.pdf", 1);
        let backend = PdfBackend::new(PdfOptions {
            display_scale: 1.0,
            prefetch_scale: 1.0,
        });
        let opened = backend.open(&path).unwrap();

        backend.close(opened.handle);
        assert!(matches!(
            backend.decode(opened.handle, 0, ScaleHint::Display),
            Err(DecodeError::UnknownHandle(_))
        ));
    }
}
