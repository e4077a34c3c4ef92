//! Document session
//!
//! A [`DocumentSession`] owns one open document at a time and coordinates the
//! page cache, the decode scheduler and its worker pool. The presentation
//! layer drives it with navigation calls and reads [`SessionSnapshot`]s back.
//!
//! Decodes finish on worker threads. Their results are written to the cache
//! straight away but only reach the observable state when the owner calls
//! [`DocumentSession::pump`] (or one of the `wait_*` helpers, which pump
//! internally). Every document load starts a new generation; results from an
//! older generation are dropped on both paths.

use crate::config::ViewerConfig;
use crate::error::SessionError;
use djvu_reader_cache::{PageCache, PageCacheStats, PageIndex};
use djvu_reader_engine::{
    DecodeError, DocumentBackend, DocumentHandle, DocumentKind, OpenError, OpenedDocument, PageBitmap, PageDecoder,
    ScaleHint,
};
use djvu_reader_scheduler::{
    DecodeExecutor, Dispatch, Generation, JobOutcome, PriorityScheduler, SchedulerStats, Tier,
    WorkerPool,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

const NO_PIN: u32 = u32::MAX;

/// Longest single wait inside the `wait_*` helpers
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// How pages are presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    /// One page at a time
    Single,
    /// Every page stacked for scrolling
    #[default]
    Continuous,
}

impl ViewMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ViewMode::Single => "single",
            ViewMode::Continuous => "continuous",
        }
    }
}

impl fmt::Display for ViewMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown view mode {0:?} (expected single or continuous)")]
pub struct ParseViewModeError(String);

impl FromStr for ViewMode {
    type Err = ParseViewModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(ViewMode::Single),
            "continuous" => Ok(ViewMode::Continuous),
            _ => Err(ParseViewModeError(s.to_string())),
        }
    }
}

/// Read-only view of the session for the presentation layer
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub document_path: Option<PathBuf>,
    pub document_kind: Option<DocumentKind>,
    pub generation: Generation,
    pub current_page: PageIndex,
    pub total_pages: u32,
    pub is_loading: bool,
    pub is_loaded: bool,
    pub error_message: Option<String>,
    pub current_bitmap: Option<PageBitmap>,
    pub view_mode: ViewMode,
    /// Pages materialized for continuous scrolling, ascending
    pub continuous_pages: Vec<PageIndex>,
    pub continuous_progress: f64,
}

impl SessionSnapshot {
    /// Page index of the published bitmap, if any
    pub fn displayed_page(&self) -> Option<PageIndex> {
        self.current_bitmap.as_ref().map(|bitmap| bitmap.page_index)
    }
}

/// Decode result on its way from a worker to the session
#[derive(Debug)]
struct Completion {
    page_index: PageIndex,
    tier: Tier,
    generation: Generation,
    result: Result<PageBitmap, DecodeError>,
}

/// Document and generation the workers decode for
#[derive(Debug, Default)]
struct ActiveDocument {
    generation: Generation,
    handle: Option<DocumentHandle>,
}

#[derive(Debug)]
struct LoadedDocument {
    path: PathBuf,
    handle: DocumentHandle,
    kind: DocumentKind,
    page_count: u32,
}

#[derive(Debug, Default)]
struct SessionState {
    generation: Generation,
    document: Option<LoadedDocument>,
    current_page: PageIndex,
    /// Page whose interactive decode has not been published yet
    pending: Option<PageIndex>,
    current_bitmap: Option<PageBitmap>,
    continuous: BTreeMap<PageIndex, PageBitmap>,
    view_mode: ViewMode,
    is_loading: bool,
    error_message: Option<String>,
}

impl SessionState {
    fn page_count(&self) -> u32 {
        self.document.as_ref().map_or(0, |doc| doc.page_count)
    }

    fn progress(&self) -> f64 {
        match self.page_count() {
            0 => 0.0,
            total => self.continuous.len() as f64 / total as f64,
        }
    }

    fn publish(&mut self, bitmap: PageBitmap) {
        self.pending = None;
        self.is_loading = false;
        self.error_message = None;
        self.current_bitmap = Some(bitmap);
    }
}

/// Runs on worker threads: decode, cache, report
struct DecodeContext {
    decoder: Arc<dyn PageDecoder>,
    cache: Arc<PageCache<PageBitmap>>,
    active: Arc<RwLock<ActiveDocument>>,
    pinned: Arc<AtomicU32>,
    completions: Sender<Completion>,
}

impl DecodeContext {
    fn run(&self, dispatch: Dispatch) -> JobOutcome {
        let handle = {
            let active = read(&self.active);
            match active.handle {
                Some(handle) if active.generation == dispatch.item.generation => handle,
                _ => return JobOutcome::Discarded,
            }
        };

        let page = dispatch.item.page_index;
        let scale = match dispatch.item.tier {
            Tier::Interactive => ScaleHint::Display,
            Tier::Adjacent | Tier::Sweep => ScaleHint::Prefetch,
        };
        let started = Instant::now();
        let decoder = &self.decoder;
        let result = panic::catch_unwind(AssertUnwindSafe(|| decoder.decode(handle, page, scale)))
            .unwrap_or_else(|_| {
                tracing::error!(page, "decoder panicked");
                Err(DecodeError::Conversion {
                    page,
                    detail: "decoder panicked".to_string(),
                })
            });

        {
            // Holding the read lock keeps a new load from clearing the cache
            // between the generation check and the insert.
            let active = read(&self.active);
            if active.generation != dispatch.item.generation {
                tracing::debug!(
                    page,
                    generation = dispatch.item.generation,
                    "dropping decode for a replaced document"
                );
                return JobOutcome::Discarded;
            }
            if let Ok(bitmap) = &result {
                let evicted = self.cache.put(page, bitmap.clone(), pinned_page(&self.pinned));
                if !evicted.is_empty() {
                    tracing::trace!(?evicted, "evicted cached pages");
                }
            }
        }

        // The page must be requestable again by the time the session sees
        // the result.
        let item = dispatch.release();
        let outcome = match &result {
            Ok(_) => {
                tracing::debug!(
                    page,
                    tier = item.tier.as_str(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "page decoded"
                );
                JobOutcome::Completed
            }
            Err(_) => JobOutcome::Failed,
        };

        // The receiver is gone only while the session is being dropped.
        let _ = self.completions.send(Completion {
            page_index: page,
            tier: item.tier,
            generation: item.generation,
            result,
        });
        outcome
    }
}

/// One open document and the machinery that decodes its pages
pub struct DocumentSession {
    config: ViewerConfig,
    decoder: Arc<dyn PageDecoder>,
    cache: Arc<PageCache<PageBitmap>>,
    scheduler: Arc<PriorityScheduler>,
    pool: Option<WorkerPool>,
    active: Arc<RwLock<ActiveDocument>>,
    pinned: Arc<AtomicU32>,
    completions: Mutex<Receiver<Completion>>,
    state: Mutex<SessionState>,
}

impl fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentSession")
            .field("config", &self.config)
            .field("cached_pages", &self.cache.len())
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl DocumentSession {
    /// Create a session and start its decode workers
    ///
    /// # Errors
    /// Fails if the configuration is invalid or a worker thread cannot be
    /// spawned.
    pub fn new(decoder: Arc<dyn PageDecoder>, config: ViewerConfig) -> Result<Self, SessionError> {
        config.validate()?;

        let cache = Arc::new(PageCache::new(config.cache.capacity, config.cache.target_size));
        let residency_cache = Arc::clone(&cache);
        let scheduler = Arc::new(PriorityScheduler::new(Arc::new(move |page: PageIndex| {
            residency_cache.contains(page)
        })));

        let active = Arc::new(RwLock::new(ActiveDocument::default()));
        let pinned = Arc::new(AtomicU32::new(NO_PIN));
        let (sender, receiver) = mpsc::channel();

        let context = DecodeContext {
            decoder: Arc::clone(&decoder),
            cache: Arc::clone(&cache),
            active: Arc::clone(&active),
            pinned: Arc::clone(&pinned),
            completions: sender,
        };
        let executor: DecodeExecutor = Arc::new(move |dispatch: Dispatch| context.run(dispatch));
        let pool = WorkerPool::new(Arc::clone(&scheduler), executor, config.worker_pool_config())
            .map_err(SessionError::WorkerSpawn)?;

        let state = SessionState {
            view_mode: config.view.initial_mode,
            ..SessionState::default()
        };

        Ok(Self {
            config,
            decoder,
            cache,
            scheduler,
            pool: Some(pool),
            active,
            pinned,
            completions: Mutex::new(receiver),
            state: Mutex::new(state),
        })
    }

    /// Create a session decoding through the built-in PDF and DJVU backends
    pub fn from_config(config: ViewerConfig) -> Result<Self, SessionError> {
        let backend = DocumentBackend::new(config.pdf_options(), config.djvu_options());
        Self::new(Arc::new(backend), config)
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    /// Decoded-page cache shared with the workers
    pub fn cache(&self) -> &PageCache<PageBitmap> {
        &self.cache
    }

    pub fn scheduler(&self) -> &PriorityScheduler {
        &self.scheduler
    }

    pub fn cache_stats(&self) -> PageCacheStats {
        self.cache.stats()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Open `path`, replacing the current document
    ///
    /// Pending and running work for the previous document is invalidated and
    /// the cache is emptied before the new document is opened. The session
    /// reports `is_loading` while the file is being opened, and observers are
    /// not blocked by a slow open. On success the first page is requested; on
    /// failure the session is left with no document and a user-visible error
    /// message.
    ///
    /// If another load or [`close_document`](Self::close_document) replaces
    /// this request while the file is being opened, the freshly opened handle
    /// is closed again and the newer request keeps the session.
    pub fn load_document<P: AsRef<Path>>(&self, path: P) -> Result<OpenedDocument, OpenError> {
        let path = path.as_ref();

        let generation = {
            let mut state = self.lock_state();
            let generation = {
                let mut active = write(&self.active);
                let generation = self.scheduler.begin_generation();
                self.scheduler.clear();
                self.cache.clear();
                *active = ActiveDocument {
                    generation,
                    handle: None,
                };
                generation
            };
            self.pinned.store(NO_PIN, Ordering::Release);

            if let Some(previous) = state.document.take() {
                tracing::debug!(path = %previous.path.display(), "closing previous document");
                self.decoder.close(previous.handle);
            }
            *state = SessionState {
                generation,
                view_mode: self.config.view.initial_mode,
                is_loading: true,
                ..SessionState::default()
            };
            generation
        };

        let opened = self.decoder.open(path);

        let mut state = self.lock_state();
        if state.generation != generation {
            tracing::debug!(path = %path.display(), generation, "load replaced while opening");
            if let Ok(opened) = &opened {
                self.decoder.close(opened.handle);
            }
            return opened;
        }

        let opened = match opened {
            Ok(opened) => opened,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to open document");
                state.is_loading = false;
                state.error_message = Some(format!("Could not open {}: {err}", path.display()));
                return Err(err);
            }
        };

        write(&self.active).handle = Some(opened.handle);
        tracing::info!(
            path = %path.display(),
            kind = %opened.kind,
            pages = opened.page_count,
            generation,
            "document opened"
        );

        state.document = Some(LoadedDocument {
            path: path.to_path_buf(),
            handle: opened.handle,
            kind: opened.kind,
            page_count: opened.page_count,
        });

        if opened.page_count == 0 {
            state.is_loading = false;
            state.error_message = Some("The document has no pages".to_string());
            return Ok(opened);
        }

        self.pinned.store(0, Ordering::Release);
        state.pending = Some(0);
        self.scheduler.submit(0, Tier::Interactive, generation);
        Ok(opened)
    }

    /// Close the current document, if any
    pub fn close_document(&self) {
        let mut state = self.lock_state();
        {
            let mut active = write(&self.active);
            let generation = self.scheduler.begin_generation();
            self.scheduler.clear();
            self.cache.clear();
            *active = ActiveDocument {
                generation,
                handle: None,
            };
            state.generation = generation;
        }
        self.pinned.store(NO_PIN, Ordering::Release);

        if let Some(document) = state.document.take() {
            tracing::info!(path = %document.path.display(), "document closed");
            self.decoder.close(document.handle);
        }
        let view_mode = state.view_mode;
        let generation = state.generation;
        *state = SessionState {
            generation,
            view_mode,
            ..SessionState::default()
        };
    }

    /// Show page `page`
    ///
    /// Returns `false` without changing anything if no document is loaded,
    /// `page` is out of range, or `page` is already on screen. A cached page is
    /// published immediately; otherwise it is decoded ahead of all background
    /// work and supersedes any navigation still pending.
    pub fn go_to_page(&self, page: PageIndex) -> bool {
        let mut state = self.lock_state();
        if state.document.is_none() || page >= state.page_count() {
            return false;
        }
        let showing = state.current_bitmap.as_ref().map(|bitmap| bitmap.page_index);
        if page == state.current_page && (state.pending == Some(page) || showing == Some(page)) {
            return false;
        }

        state.current_page = page;
        state.error_message = None;
        self.pinned.store(page, Ordering::Release);

        if let Some(bitmap) = self.cache.get(page) {
            tracing::trace!(page, "page served from cache");
            if state.view_mode == ViewMode::Continuous {
                state.continuous.insert(page, bitmap.clone());
            }
            state.publish(bitmap);
            self.schedule_around(&state, page);
            return true;
        }

        if let Some(superseded) = state.pending.replace(page) {
            if superseded != page {
                tracing::debug!(superseded, page, "navigation superseded");
            }
        }
        state.is_loading = true;
        let admission = self.scheduler.submit(page, Tier::Interactive, state.generation);
        tracing::debug!(page, ?admission, "page requested");
        true
    }

    /// Advance one page; ignored while a page load is pending
    pub fn next_page(&self) -> bool {
        let target = {
            let state = self.lock_state();
            if state.pending.is_some() || state.current_page + 1 >= state.page_count() {
                return false;
            }
            state.current_page + 1
        };
        self.go_to_page(target)
    }

    /// Go back one page; ignored while a page load is pending
    pub fn previous_page(&self) -> bool {
        let target = {
            let state = self.lock_state();
            if state.pending.is_some() || state.current_page == 0 || state.document.is_none() {
                return false;
            }
            state.current_page - 1
        };
        self.go_to_page(target)
    }

    /// Switch between single-page and continuous presentation
    ///
    /// Entering continuous mode seeds the continuous set from the cache and
    /// queues every page still missing.
    pub fn set_view_mode(&self, mode: ViewMode) {
        let mut state = self.lock_state();
        if state.view_mode == mode {
            return;
        }
        state.view_mode = mode;
        tracing::debug!(mode = %mode, "view mode changed");

        if mode == ViewMode::Continuous && state.document.is_some() {
            for (page, bitmap) in self.cache.snapshot() {
                state.continuous.entry(page).or_insert(bitmap);
            }
            if state.pending.is_none() {
                let current = state.current_page;
                self.schedule_around(&state, current);
            }
        }
    }

    /// Drop every cached page and the continuous set
    ///
    /// The page on screen stays published.
    pub fn clear_cache(&self) {
        let mut state = self.lock_state();
        self.cache.clear();
        state.continuous.clear();
        tracing::debug!("page cache cleared");
    }

    /// Apply every decode result that has arrived, without blocking
    ///
    /// Returns the number of results applied to the current document.
    pub fn pump(&self) -> usize {
        let receiver = self.completions.lock().unwrap_or_else(|p| p.into_inner());
        let mut applied = 0;
        while let Ok(completion) = receiver.try_recv() {
            if self.apply(completion) {
                applied += 1;
            }
        }
        applied
    }

    fn apply(&self, completion: Completion) -> bool {
        let mut state = self.lock_state();
        if completion.generation != state.generation || state.document.is_none() {
            return false;
        }
        let page = completion.page_index;

        match completion.result {
            Ok(bitmap) => {
                if state.view_mode == ViewMode::Continuous {
                    state.continuous.insert(page, bitmap.clone());
                }
                if state.pending == Some(page) {
                    state.publish(bitmap);
                    self.schedule_around(&state, page);
                }
            }
            Err(err) => {
                if state.pending == Some(page) {
                    tracing::warn!(page, error = %err, "page failed to load");
                    state.pending = None;
                    state.is_loading = false;
                    state.error_message =
                        Some(format!("Could not load page {}: {err}. Try again.", page + 1));
                } else {
                    tracing::warn!(
                        page,
                        tier = completion.tier.as_str(),
                        error = %err,
                        "background decode failed"
                    );
                }
            }
        }
        true
    }

    /// Queue the neighbours of `page`, then every other page outward from it
    fn schedule_around(&self, state: &SessionState, page: PageIndex) {
        let total = state.page_count();
        let generation = state.generation;

        for neighbour in [page.checked_sub(1), page.checked_add(1)].into_iter().flatten() {
            if neighbour < total && !state.continuous.contains_key(&neighbour) {
                self.scheduler.submit(neighbour, Tier::Adjacent, generation);
            }
        }

        let mut queued = 0usize;
        for other in sweep_order(page, total).filter(|p| p.abs_diff(page) > 1) {
            if state.continuous.contains_key(&other) {
                continue;
            }
            if self.scheduler.submit(other, Tier::Sweep, generation).is_enqueued() {
                queued += 1;
            }
        }
        if queued > 0 {
            tracing::debug!(page, queued, "background sweep queued");
        }
    }

    /// Pump until `predicate` holds or `timeout` elapses
    ///
    /// Returns whether the predicate was satisfied.
    pub fn wait_until<F>(&self, timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            if predicate(&self.snapshot()) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            self.wait_for_completion(remaining.min(WAIT_SLICE));
        }
    }

    /// Pump until no decode is queued or running and nothing is left to apply
    ///
    /// Returns `false` if work was still outstanding after `timeout`.
    pub fn wait_settled(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.scheduler.wait_idle(remaining) {
                return false;
            }
            // Applying results can queue more work.
            if self.pump() == 0 && self.scheduler.is_idle() {
                return true;
            }
        }
    }

    fn wait_for_completion(&self, timeout: Duration) {
        let receiver = self.completions.lock().unwrap_or_else(|p| p.into_inner());
        match receiver.recv_timeout(timeout) {
            Ok(completion) => {
                self.apply(completion);
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.lock_state();
        SessionSnapshot {
            document_path: state.document.as_ref().map(|doc| doc.path.clone()),
            document_kind: state.document.as_ref().map(|doc| doc.kind),
            generation: state.generation,
            current_page: state.current_page,
            total_pages: state.page_count(),
            is_loading: state.is_loading,
            is_loaded: state.document.is_some(),
            error_message: state.error_message.clone(),
            current_bitmap: state.current_bitmap.clone(),
            view_mode: state.view_mode,
            continuous_pages: state.continuous.keys().copied().collect(),
            continuous_progress: state.progress(),
        }
    }

    pub fn current_page(&self) -> PageIndex {
        self.lock_state().current_page
    }

    pub fn total_pages(&self) -> u32 {
        self.lock_state().page_count()
    }

    pub fn is_loading(&self) -> bool {
        self.lock_state().is_loading
    }

    pub fn is_loaded(&self) -> bool {
        self.lock_state().document.is_some()
    }

    pub fn error_message(&self) -> Option<String> {
        self.lock_state().error_message.clone()
    }

    pub fn current_bitmap(&self) -> Option<PageBitmap> {
        self.lock_state().current_bitmap.clone()
    }

    pub fn view_mode(&self) -> ViewMode {
        self.lock_state().view_mode
    }

    /// Bitmap of `page` in the continuous set
    pub fn continuous_page(&self, page: PageIndex) -> Option<PageBitmap> {
        self.lock_state().continuous.get(&page).cloned()
    }

    /// Materialized pages over total pages, `0.0` with no document
    pub fn continuous_progress(&self) -> f64 {
        self.lock_state().progress()
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
        let state = self.state.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(document) = state.document.take() {
            self.decoder.close(document.handle);
        }
    }
}

/// Pages other than `center`, nearest first, later pages before earlier
/// ones at equal distance
pub fn sweep_order(center: PageIndex, total: u32) -> impl Iterator<Item = PageIndex> {
    let max_distance = total.saturating_sub(1);
    (1..=max_distance).flat_map(move |distance| {
        let after = center.checked_add(distance).filter(|&p| p < total);
        let before = center.checked_sub(distance);
        after.into_iter().chain(before)
    })
}

fn pinned_page(pinned: &AtomicU32) -> Option<PageIndex> {
    match pinned.load(Ordering::Acquire) {
        NO_PIN => None,
        page => Some(page),
    }
}

fn read(lock: &RwLock<ActiveDocument>) -> RwLockReadGuard<'_, ActiveDocument> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write(lock: &RwLock<ActiveDocument>) -> RwLockWriteGuard<'_, ActiveDocument> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
