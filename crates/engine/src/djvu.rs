//! DJVU backend driving the djvulibre command-line tools.
//!
//! `djvused` reports the page count and `ddjvu` renders single pages to an
//! image file, which is read back and decoded with `image`. Every rendered
//! file lives in a scoped temporary that is removed when the decode returns.

use crate::document::{DocumentHandle, DocumentKind, OpenedDocument, PageBitmap, PageDecoder, ScaleHint};
use crate::error::{DecodeError, OpenError};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tempfile::TempPath;

pub const DJVUSED: &str = "djvused";
pub const DDJVU: &str = "ddjvu";

/// Rendered files smaller than this are treated as corrupt
pub const MIN_OUTPUT_BYTES: usize = 1000;

/// Scale used when probing whether a page exists
const PROBE_SCALE: u32 = 25;

/// A single `ddjvu` invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RenderAttempt {
    format: &'static str,
    scale: u32,
    mode: Option<&'static str>,
}

impl RenderAttempt {
    const fn new(format: &'static str, scale: u32, mode: Option<&'static str>) -> Self {
        Self {
            format,
            scale,
            mode,
        }
    }

    fn suffix(&self) -> String {
        format!(".{}", self.format)
    }
}

/// Tried in order after the primary attempt fails
const FALLBACK_ATTEMPTS: [RenderAttempt; 5] = [
    RenderAttempt::new("ppm", 350, None),
    RenderAttempt::new("png", 400, None),
    RenderAttempt::new("tiff", 400, None),
    RenderAttempt::new("ppm", 300, Some("color")),
    RenderAttempt::new("ppm", 250, Some("black")),
];

/// Settings for the DJVU backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DjvuOptions {
    /// Directories searched for the tools before `PATH`
    pub search_dirs: Vec<PathBuf>,
    /// Whether to fall back to `PATH` when the search directories miss
    pub search_path: bool,
    /// `ddjvu -scale` for pages shown on screen
    pub display_scale: u32,
    /// `ddjvu -scale` for pages decoded ahead of time
    pub prefetch_scale: u32,
    /// Highest page number probed when `djvused` cannot report a count
    pub probe_limit: u32,
}

impl Default for DjvuOptions {
    fn default() -> Self {
        Self {
            search_dirs: default_search_dirs(),
            search_path: true,
            display_scale: 400,
            prefetch_scale: 300,
            probe_limit: 50,
        }
    }
}

/// Homebrew (Apple silicon and Intel) and system locations
pub fn default_search_dirs() -> Vec<PathBuf> {
    ["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin"]
        .iter()
        .map(PathBuf::from)
        .collect()
}

/// Find a tool in `search_dirs`, then on `PATH` if allowed
pub fn locate_tool(name: &str, search_dirs: &[PathBuf], search_path: bool) -> Option<PathBuf> {
    search_dirs
        .iter()
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
        .or_else(|| {
            if search_path {
                which::which(name).ok()
            } else {
                None
            }
        })
}

/// Paths of the tools a document was opened with
#[derive(Debug, Clone)]
struct Toolchain {
    ddjvu: PathBuf,
    djvused: Option<PathBuf>,
}

#[derive(Debug)]
struct DocumentRecord {
    /// File handed to the tools; an ASCII-named copy when the original name is not ASCII
    source: PathBuf,
    _ascii_copy: Option<TempPath>,
    page_count: u32,
    tools: Toolchain,
}

#[derive(Debug, Default)]
pub struct DjvuBackend {
    options: DjvuOptions,
    next_handle: AtomicU64,
    docs: RwLock<HashMap<u64, Arc<DocumentRecord>>>,
}

impl DjvuBackend {
    pub fn new(options: DjvuOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn options(&self) -> &DjvuOptions {
        &self.options
    }

    fn read_docs(&self) -> RwLockReadGuard<'_, HashMap<u64, Arc<DocumentRecord>>> {
        self.docs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_docs(&self) -> RwLockWriteGuard<'_, HashMap<u64, Arc<DocumentRecord>>> {
        self.docs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn locate(&self, name: &str) -> Option<PathBuf> {
        locate_tool(name, &self.options.search_dirs, self.options.search_path)
    }

    fn toolchain(&self) -> Result<Toolchain, OpenError> {
        let ddjvu = self.locate(DDJVU).ok_or_else(|| OpenError::ToolUnavailable {
            tool: DDJVU.to_owned(),
        })?;
        let djvused = self.locate(DJVUSED);
        if djvused.is_none() {
            tracing::debug!("djvused not found, page count will be probed");
        }
        Ok(Toolchain { ddjvu, djvused })
    }

    /// The djvulibre tools mishandle some non-ASCII paths, so such files are
    /// copied to an ASCII-named temporary first
    fn ascii_source(path: &Path) -> Result<(PathBuf, Option<TempPath>), OpenError> {
        let name_is_ascii = path
            .file_name()
            .map(|name| name.to_string_lossy().is_ascii())
            .unwrap_or(true);
        if name_is_ascii {
            return Ok((path.to_path_buf(), None));
        }

        let unreadable = |source: io::Error| OpenError::Unreadable {
            path: path.to_path_buf(),
            source,
        };
        let copy = tempfile::Builder::new()
            .prefix("djvu-reader-")
            .suffix(".djvu")
            .tempfile()
            .map_err(unreadable)?
            .into_temp_path();
        fs::copy(path, &copy).map_err(unreadable)?;

        tracing::debug!(original = %path.display(), copy = %copy.display(), "using ascii-named copy");
        Ok((copy.to_path_buf(), Some(copy)))
    }

    fn count_with_djvused(djvused: &Path, source: &Path) -> Option<u32> {
        let output = Command::new(djvused)
            .arg(source)
            .arg("-e")
            .arg("n")
            .output()
            .ok()?;
        if !output.status.success() {
            tracing::debug!(status = %output.status, "djvused failed");
            return None;
        }
        parse_page_count(&String::from_utf8_lossy(&output.stdout))
    }

    fn probe_page_count(&self, ddjvu: &Path, source: &Path) -> u32 {
        let attempt = RenderAttempt::new("ppm", PROBE_SCALE, None);
        let mut count = 0;
        for page in 0..self.options.probe_limit {
            match run_ddjvu(ddjvu, source, page, attempt) {
                Ok(_) => count = page + 1,
                Err(_) => break,
            }
        }
        count
    }

    fn record(&self, handle: DocumentHandle) -> Result<Arc<DocumentRecord>, DecodeError> {
        self.read_docs()
            .get(&handle.raw())
            .cloned()
            .ok_or(DecodeError::UnknownHandle(handle.raw()))
    }

    fn attempts(&self, hint: ScaleHint) -> impl Iterator<Item = RenderAttempt> {
        let scale = match hint {
            ScaleHint::Display => self.options.display_scale,
            ScaleHint::Prefetch => self.options.prefetch_scale,
        };
        std::iter::once(RenderAttempt::new("ppm", scale, None)).chain(FALLBACK_ATTEMPTS)
    }
}

/// First integer in `djvused -e n` output
fn parse_page_count(output: &str) -> Option<u32> {
    let trimmed = output.trim();
    if let Ok(count) = trimmed.parse::<u32>() {
        return (count > 0).then_some(count);
    }
    trimmed
        .split(|c: char| !c.is_ascii_digit())
        .filter(|token| !token.is_empty())
        .find_map(|token| token.parse::<u32>().ok())
        .filter(|count| *count > 0)
}

fn spawn_error(page: u32, err: io::Error) -> DecodeError {
    if err.kind() == io::ErrorKind::NotFound {
        DecodeError::ToolUnavailable {
            tool: DDJVU.to_owned(),
        }
    } else {
        DecodeError::Conversion {
            page,
            detail: err.to_string(),
        }
    }
}

fn failure_detail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        output.status.to_string()
    } else {
        format!("{}: {}", output.status, stderr)
    }
}

/// Render one page (0-based) with a single `ddjvu` invocation
fn run_ddjvu(
    ddjvu: &Path,
    source: &Path,
    page: u32,
    attempt: RenderAttempt,
) -> Result<image::RgbaImage, DecodeError> {
    let output_file = tempfile::Builder::new()
        .prefix("djvu-page-")
        .suffix(&attempt.suffix())
        .tempfile()
        .map_err(|err| DecodeError::Conversion {
            page,
            detail: err.to_string(),
        })?
        .into_temp_path();

    let mut command = Command::new(ddjvu);
    command
        .arg(format!("-format={}", attempt.format))
        .arg(format!("-page={}", page + 1))
        .arg(format!("-scale={}", attempt.scale));
    if let Some(mode) = attempt.mode {
        command.arg(format!("-mode={}", mode));
    }
    let output = command
        .arg(source)
        .arg(&output_file)
        .output()
        .map_err(|err| spawn_error(page, err))?;

    if !output.status.success() {
        return Err(DecodeError::Conversion {
            page,
            detail: failure_detail(&output),
        });
    }

    let bytes = fs::read(&output_file).map_err(|err| DecodeError::Conversion {
        page,
        detail: err.to_string(),
    })?;
    if bytes.len() < MIN_OUTPUT_BYTES {
        return Err(DecodeError::CorruptPage {
            page,
            bytes: bytes.len(),
        });
    }

    let image = image::load_from_memory(&bytes).map_err(|err| DecodeError::Conversion {
        page,
        detail: err.to_string(),
    })?;
    Ok(image.to_rgba8())
}

impl PageDecoder for DjvuBackend {
    fn open(&self, path: &Path) -> Result<OpenedDocument, OpenError> {
        if !path.exists() {
            return Err(OpenError::NotFound {
                path: path.to_path_buf(),
            });
        }
        fs::File::open(path).map_err(|source| OpenError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;

        let tools = self.toolchain()?;
        let (source, ascii_copy) = Self::ascii_source(path)?;

        let page_count = tools
            .djvused
            .as_deref()
            .and_then(|djvused| Self::count_with_djvused(djvused, &source))
            .unwrap_or_else(|| self.probe_page_count(&tools.ddjvu, &source));

        if page_count == 0 {
            return Err(OpenError::Malformed {
                reason: "no renderable pages".to_owned(),
            });
        }

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = DocumentHandle::new(id, DocumentKind::Djvu);
        self.write_docs().insert(
            id,
            Arc::new(DocumentRecord {
                source,
                _ascii_copy: ascii_copy,
                page_count,
                tools,
            }),
        );

        tracing::debug!(path = %path.display(), page_count, "opened djvu");
        Ok(OpenedDocument {
            handle,
            page_count,
            kind: DocumentKind::Djvu,
        })
    }

    fn decode(
        &self,
        handle: DocumentHandle,
        page_index: u32,
        scale: ScaleHint,
    ) -> Result<PageBitmap, DecodeError> {
        let record = self.record(handle)?;
        if page_index >= record.page_count {
            return Err(DecodeError::PageOutOfRange {
                page: page_index,
                page_count: record.page_count,
            });
        }

        let mut last_error = None;
        for attempt in self.attempts(scale) {
            match run_ddjvu(&record.tools.ddjvu, &record.source, page_index, attempt) {
                Ok(image) => return Ok(PageBitmap::new(page_index, image)),
                Err(err @ DecodeError::ToolUnavailable { .. }) => return Err(err),
                Err(err) => {
                    tracing::debug!(
                        page = page_index,
                        format = attempt.format,
                        scale = attempt.scale,
                        error = %err,
                        "ddjvu attempt failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or(DecodeError::Conversion {
            page: page_index,
            detail: "no render attempts".to_owned(),
        }))
    }

    fn close(&self, handle: DocumentHandle) {
        self.write_docs().remove(&handle.raw());
    }
}
