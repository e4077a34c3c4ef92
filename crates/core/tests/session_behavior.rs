use djvu_reader_core::{DocumentSession, ViewMode, ViewerConfig};
use djvu_reader_engine::{
    DecodeError, DocumentHandle, DocumentKind, OpenError, OpenedDocument, PageBitmap, PageDecoder,
    RgbaImage, ScaleHint,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Gate key that holds `open` instead of a page decode
const OPENING: u32 = u32::MAX;

#[derive(Debug, Clone, Default)]
struct Script {
    page_count: u32,
    width: u32,
    failing: HashSet<u32>,
    fail_once: HashSet<u32>,
    panic_once: HashSet<u32>,
    delay: Duration,
}

impl Script {
    fn pages(page_count: u32) -> Self {
        Self {
            page_count,
            width: 4,
            ..Self::default()
        }
    }

    fn width(mut self, width: u32) -> Self {
        self.width = width;
        self
    }

    fn failing(mut self, page: u32) -> Self {
        self.failing.insert(page);
        self
    }

    fn fail_once(mut self, page: u32) -> Self {
        self.fail_once.insert(page);
        self
    }

    fn panic_once(mut self, page: u32) -> Self {
        self.panic_once.insert(page);
        self
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// In-memory decoder whose behavior is scripted per document name
#[derive(Default)]
struct ScriptedDecoder {
    scripts: Mutex<HashMap<String, Script>>,
    handles: Mutex<HashMap<u64, String>>,
    next_handle: AtomicU64,
    gates: Mutex<HashSet<(String, u32)>>,
    gate_opened: Condvar,
    calls: Mutex<Vec<(String, u32, ScaleHint)>>,
    decoding: Mutex<HashSet<(String, u32)>>,
    overlaps: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
    closed: Mutex<Vec<DocumentHandle>>,
    opens_finished: AtomicUsize,
}

impl ScriptedDecoder {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self, name: &str, script: Script) {
        self.scripts.lock().unwrap().insert(name.to_string(), script);
    }

    /// Hold decodes of `page` until released
    fn gate(&self, name: &str, page: u32) {
        self.gates.lock().unwrap().insert((name.to_string(), page));
    }

    fn release(&self, name: &str, page: u32) {
        self.gates.lock().unwrap().remove(&(name.to_string(), page));
        self.gate_opened.notify_all();
    }

    fn calls_for(&self, name: &str, page: u32) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(doc, p, _)| doc == name && *p == page)
            .count()
    }

    fn call_order(&self) -> Vec<u32> {
        self.calls.lock().unwrap().iter().map(|(_, page, _)| *page).collect()
    }

    fn scale_for(&self, page: u32) -> Option<ScaleHint> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|(_, p, _)| *p == page)
            .map(|(_, _, scale)| *scale)
    }

    fn wait_gate(&self, key: &(String, u32)) {
        let deadline = Instant::now() + TIMEOUT;
        let mut gates = self.gates.lock().unwrap();
        while gates.contains(key) && Instant::now() < deadline {
            gates = self
                .gate_opened
                .wait_timeout(gates, Duration::from_millis(20))
                .unwrap()
                .0;
        }
    }
}

impl PageDecoder for ScriptedDecoder {
    fn open(&self, path: &Path) -> Result<OpenedDocument, OpenError> {
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .ok_or_else(|| OpenError::NotFound {
                path: path.to_path_buf(),
            })?;

        let kind = DocumentKind::from_path(path)?;
        self.wait_gate(&(name.clone(), OPENING));
        self.opens_finished.fetch_add(1, Ordering::SeqCst);
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().unwrap().insert(id, name);
        Ok(OpenedDocument {
            handle: DocumentHandle::new(id, kind),
            page_count: script.page_count,
            kind,
        })
    }

    fn decode(
        &self,
        handle: DocumentHandle,
        page_index: u32,
        scale: ScaleHint,
    ) -> Result<PageBitmap, DecodeError> {
        let name = self
            .handles
            .lock()
            .unwrap()
            .get(&handle.raw())
            .cloned()
            .ok_or(DecodeError::UnknownHandle(handle.raw()))?;
        let script = self.scripts.lock().unwrap().get(&name).cloned().unwrap();
        if page_index >= script.page_count {
            return Err(DecodeError::PageOutOfRange {
                page: page_index,
                page_count: script.page_count,
            });
        }

        let key = (name.clone(), page_index);
        self.calls.lock().unwrap().push((name.clone(), page_index, scale));
        if !self.decoding.lock().unwrap().insert(key.clone()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        self.wait_gate(&key);
        if !script.delay.is_zero() {
            thread::sleep(script.delay);
        }

        let (failed_once, panicked_once) = {
            let mut scripts = self.scripts.lock().unwrap();
            scripts
                .get_mut(&name)
                .map(|s| (s.fail_once.remove(&page_index), s.panic_once.remove(&page_index)))
                .unwrap_or((false, false))
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.decoding.lock().unwrap().remove(&key);

        if panicked_once {
            panic!("scripted panic decoding page {page_index}");
        }

        if failed_once || script.failing.contains(&page_index) {
            return Err(DecodeError::Conversion {
                page: page_index,
                detail: "scripted failure".to_string(),
            });
        }
        Ok(PageBitmap::new(page_index, RgbaImage::new(script.width, 2)))
    }

    fn close(&self, handle: DocumentHandle) {
        self.closed.lock().unwrap().push(handle);
    }
}

fn test_config() -> ViewerConfig {
    ViewerConfig::default().with_poll_interval(Duration::from_millis(5))
}

fn session(decoder: &Arc<ScriptedDecoder>, config: ViewerConfig) -> DocumentSession {
    let decoder: Arc<dyn PageDecoder> = decoder.clone();
    DocumentSession::new(decoder, config).unwrap()
}

fn wait_displayed(session: &DocumentSession, page: u32) -> bool {
    session.wait_until(TIMEOUT, |s| s.displayed_page() == Some(page) && !s.is_loading)
}

#[test]
fn test_first_page_then_full_sweep() {
    let decoder = ScriptedDecoder::new();
    decoder.script("ten.djvu", Script::pages(10));
    let session = session(&decoder, test_config());

    let opened = session.load_document("ten.djvu").unwrap();
    assert_eq!(opened.page_count, 10);
    assert!(session.is_loading());

    assert!(wait_displayed(&session, 0));
    assert!(session.wait_settled(TIMEOUT));

    let snapshot = session.snapshot();
    assert_eq!(snapshot.total_pages, 10);
    assert_eq!(snapshot.continuous_pages, (0..10).collect::<Vec<_>>());
    assert_eq!(snapshot.continuous_progress, 1.0);
    assert_eq!(snapshot.error_message, None);

    assert_eq!(decoder.call_order()[0], 0);
    for page in 0..10 {
        assert_eq!(decoder.calls_for("ten.djvu", page), 1, "page {page}");
    }
    assert_eq!(decoder.scale_for(0), Some(ScaleHint::Display));
    assert_eq!(decoder.scale_for(5), Some(ScaleHint::Prefetch));
    assert_eq!(session.cache().len(), 10);
    assert_eq!(session.scheduler_stats().failed, 0);
}

#[test]
fn test_newer_navigation_supersedes_pending_one() {
    let decoder = ScriptedDecoder::new();
    decoder.script("fifty.djvu", Script::pages(50));
    decoder.gate("fifty.djvu", 0);
    decoder.gate("fifty.djvu", 5);
    let session = session(&decoder, test_config());

    session.load_document("fifty.djvu").unwrap();
    assert!(session.go_to_page(5));
    assert!(session.go_to_page(7));
    assert!(wait_displayed(&session, 7));

    decoder.release("fifty.djvu", 0);
    decoder.release("fifty.djvu", 5);
    assert!(session.wait_settled(TIMEOUT));

    let snapshot = session.snapshot();
    assert_eq!(snapshot.current_page, 7);
    assert_eq!(snapshot.displayed_page(), Some(7));
    assert!(!snapshot.is_loading);
    assert_eq!(snapshot.error_message, None);
}

#[test]
fn test_results_from_replaced_document_are_dropped() {
    let decoder = ScriptedDecoder::new();
    decoder.script("first.djvu", Script::pages(3).width(11));
    decoder.script("second.djvu", Script::pages(3).width(22));
    decoder.gate("first.djvu", 0);
    let session = session(&decoder, test_config());

    let first = session.load_document("first.djvu").unwrap();
    session.load_document("second.djvu").unwrap();
    assert!(wait_displayed(&session, 0));

    decoder.release("first.djvu", 0);
    assert!(session.wait_settled(TIMEOUT));

    assert_eq!(decoder.calls_for("first.djvu", 0), 1);
    assert_eq!(session.current_bitmap().unwrap().width(), 22);
    for (_, bitmap) in session.cache().snapshot() {
        assert_eq!(bitmap.width(), 22);
    }
    for page in session.snapshot().continuous_pages {
        assert_eq!(session.continuous_page(page).unwrap().width(), 22);
    }
    assert!(decoder.closed.lock().unwrap().contains(&first.handle));
}

#[test]
fn test_interactive_failure_is_surfaced_and_retryable() {
    let decoder = ScriptedDecoder::new();
    decoder.script("flaky.djvu", Script::pages(4).fail_once(0));
    let session = session(&decoder, test_config());

    session.load_document("flaky.djvu").unwrap();
    assert!(session.wait_until(TIMEOUT, |s| !s.is_loading));

    let snapshot = session.snapshot();
    assert!(snapshot.is_loaded);
    assert!(snapshot.current_bitmap.is_none());
    let message = snapshot.error_message.unwrap();
    assert!(message.contains("page 1"), "{message}");

    assert!(session.go_to_page(0));
    assert!(wait_displayed(&session, 0));
    assert_eq!(session.error_message(), None);
    assert_eq!(decoder.calls_for("flaky.djvu", 0), 2);
}

#[test]
fn test_decoder_panic_is_surfaced_and_retryable() {
    let decoder = ScriptedDecoder::new();
    decoder.script("fragile.djvu", Script::pages(3).panic_once(0));
    let session = session(&decoder, test_config());

    session.load_document("fragile.djvu").unwrap();
    assert!(session.wait_until(TIMEOUT, |s| !s.is_loading));

    let snapshot = session.snapshot();
    assert!(snapshot.current_bitmap.is_none());
    let message = snapshot.error_message.unwrap();
    assert!(message.contains("page 1"), "{message}");
    assert!(session.wait_settled(TIMEOUT));
    assert_eq!(session.scheduler_stats().failed, 1);

    assert!(session.go_to_page(0));
    assert!(wait_displayed(&session, 0));
    assert_eq!(session.error_message(), None);
    assert_eq!(decoder.calls_for("fragile.djvu", 0), 2);

    assert!(session.next_page());
    assert!(wait_displayed(&session, 1));
}

#[test]
fn test_background_failure_is_silent() {
    let decoder = ScriptedDecoder::new();
    decoder.script("holes.djvu", Script::pages(6).failing(4));
    let session = session(&decoder, test_config());

    session.load_document("holes.djvu").unwrap();
    assert!(wait_displayed(&session, 0));
    assert!(session.wait_settled(TIMEOUT));

    let snapshot = session.snapshot();
    assert_eq!(snapshot.error_message, None);
    assert_eq!(snapshot.continuous_pages, vec![0, 1, 2, 3, 5]);
    assert!((snapshot.continuous_progress - 5.0 / 6.0).abs() < 1e-9);

    assert!(session.go_to_page(4));
    assert!(session.wait_until(TIMEOUT, |s| !s.is_loading));
    let message = session.error_message().unwrap();
    assert!(message.contains("page 5"), "{message}");
    assert_eq!(session.current_page(), 4);
}

#[test]
fn test_step_navigation_waits_for_pending_load() {
    let decoder = ScriptedDecoder::new();
    decoder.script("steps.djvu", Script::pages(5));
    decoder.gate("steps.djvu", 0);
    let session = session(&decoder, test_config());

    session.load_document("steps.djvu").unwrap();
    assert!(!session.next_page());
    assert!(!session.previous_page());

    decoder.release("steps.djvu", 0);
    assert!(wait_displayed(&session, 0));
    assert!(!session.previous_page());

    assert!(session.next_page());
    assert!(wait_displayed(&session, 1));
    assert!(session.wait_settled(TIMEOUT));

    // Page 0 is cached, so going back publishes without waiting.
    assert!(session.previous_page());
    assert_eq!(session.snapshot().displayed_page(), Some(0));

    assert!(session.go_to_page(4));
    assert!(wait_displayed(&session, 4));
    assert!(!session.next_page());
}

#[test]
fn test_go_to_page_ignores_invalid_requests() {
    let decoder = ScriptedDecoder::new();
    decoder.script("three.djvu", Script::pages(3));
    let session = session(&decoder, test_config());

    assert!(!session.go_to_page(0));
    assert!(!session.next_page());

    session.load_document("three.djvu").unwrap();
    assert!(wait_displayed(&session, 0));

    assert!(!session.go_to_page(3));
    assert!(!session.go_to_page(0));
    assert_eq!(session.current_page(), 0);
    assert!(!session.is_loading());
}

#[test]
fn test_one_decode_per_page_under_random_navigation() {
    let decoder = ScriptedDecoder::new();
    decoder.script("busy.djvu", Script::pages(40).delay(Duration::from_millis(2)));
    let session = session(&decoder, test_config());
    let mut rng = StdRng::seed_from_u64(7);

    session.load_document("busy.djvu").unwrap();
    for _ in 0..30 {
        session.go_to_page(rng.gen_range(0..40));
        session.pump();
        thread::sleep(Duration::from_millis(1));
    }
    assert!(session.wait_settled(TIMEOUT));

    assert_eq!(decoder.overlaps.load(Ordering::SeqCst), 0);
    assert!(decoder.peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(session.snapshot().continuous_progress, 1.0);
    assert!(session.wait_until(TIMEOUT, |s| !s.is_loading));
}

#[test]
fn test_current_page_survives_eviction() {
    let decoder = ScriptedDecoder::new();
    decoder.script("long.djvu", Script::pages(30));
    let config = test_config()
        .with_cache_limits(5, 3)
        .with_initial_view_mode(ViewMode::Single);
    let session = session(&decoder, config);

    session.load_document("long.djvu").unwrap();
    assert!(wait_displayed(&session, 0));
    assert!(session.wait_settled(TIMEOUT));

    assert!(session.cache().contains(0));
    assert!(session.cache().len() <= 5);
    assert!(session.cache_stats().evictions > 0);
    assert!(session.snapshot().continuous_pages.is_empty());
}

#[test]
fn test_switching_to_continuous_seeds_from_cache() {
    let decoder = ScriptedDecoder::new();
    decoder.script("eight.djvu", Script::pages(8));
    let config = test_config().with_initial_view_mode(ViewMode::Single);
    let session = session(&decoder, config);

    session.load_document("eight.djvu").unwrap();
    assert!(wait_displayed(&session, 0));
    assert!(session.wait_settled(TIMEOUT));
    assert_eq!(session.continuous_progress(), 0.0);

    session.set_view_mode(ViewMode::Continuous);
    let snapshot = session.snapshot();
    assert_eq!(snapshot.view_mode, ViewMode::Continuous);
    assert_eq!(snapshot.continuous_pages, (0..8).collect::<Vec<_>>());
    assert_eq!(snapshot.continuous_progress, 1.0);

    assert!(session.wait_settled(TIMEOUT));
    for page in 0..8 {
        assert_eq!(decoder.calls_for("eight.djvu", page), 1);
    }
}

#[test]
fn test_switching_to_continuous_decodes_evicted_pages() {
    let decoder = ScriptedDecoder::new();
    decoder.script("twelve.djvu", Script::pages(12));
    let config = test_config()
        .with_cache_limits(4, 2)
        .with_initial_view_mode(ViewMode::Single);
    let session = session(&decoder, config);

    session.load_document("twelve.djvu").unwrap();
    assert!(wait_displayed(&session, 0));
    assert!(session.wait_settled(TIMEOUT));
    assert!(session.cache().len() <= 4);

    session.set_view_mode(ViewMode::Continuous);
    assert!(session.wait_until(TIMEOUT, |s| s.continuous_progress == 1.0));
    assert_eq!(session.snapshot().continuous_pages.len(), 12);
}

#[test]
fn test_continuous_neighbours_are_not_decoded_twice() {
    let decoder = ScriptedDecoder::new();
    decoder.script("twenty.djvu", Script::pages(20));
    let config = test_config().with_cache_limits(4, 2);
    let session = session(&decoder, config);

    session.load_document("twenty.djvu").unwrap();
    assert!(wait_displayed(&session, 0));
    assert!(session.wait_settled(TIMEOUT));
    assert_eq!(session.continuous_progress(), 1.0);

    let cache = session.cache();
    let page = (2..19)
        .find(|&p| !cache.contains(p - 1) && !cache.contains(p) && !cache.contains(p + 1))
        .expect("some page and its neighbours should have been evicted");

    assert!(session.go_to_page(page));
    assert!(wait_displayed(&session, page));
    assert!(session.wait_settled(TIMEOUT));

    assert_eq!(decoder.calls_for("twenty.djvu", page), 2);
    assert_eq!(decoder.calls_for("twenty.djvu", page - 1), 1);
    assert_eq!(decoder.calls_for("twenty.djvu", page + 1), 1);
}

#[test]
fn test_observers_are_not_blocked_while_opening() {
    let decoder = ScriptedDecoder::new();
    decoder.script("slow.djvu", Script::pages(3));
    decoder.gate("slow.djvu", OPENING);
    let session = session(&decoder, test_config());

    thread::scope(|scope| {
        let loader = scope.spawn(|| session.load_document("slow.djvu"));

        assert!(session.wait_until(TIMEOUT, |s| s.is_loading));
        assert_eq!(decoder.opens_finished.load(Ordering::SeqCst), 0);
        let snapshot = session.snapshot();
        assert!(!snapshot.is_loaded);
        assert_eq!(snapshot.total_pages, 0);
        assert!(!session.go_to_page(0));

        decoder.release("slow.djvu", OPENING);
        assert_eq!(loader.join().unwrap().unwrap().page_count, 3);
    });

    assert!(wait_displayed(&session, 0));
}

#[test]
fn test_newer_load_wins_over_slow_open() {
    let decoder = ScriptedDecoder::new();
    decoder.script("slow.djvu", Script::pages(3).width(11));
    decoder.script("quick.djvu", Script::pages(2).width(22));
    decoder.gate("slow.djvu", OPENING);
    let session = session(&decoder, test_config());

    thread::scope(|scope| {
        let loader = scope.spawn(|| session.load_document("slow.djvu"));
        assert!(session.wait_until(TIMEOUT, |s| s.is_loading));

        session.load_document("quick.djvu").unwrap();
        decoder.release("slow.djvu", OPENING);
        let stale = loader.join().unwrap().unwrap();
        assert!(decoder.closed.lock().unwrap().contains(&stale.handle));
    });

    assert!(wait_displayed(&session, 0));
    assert!(session.wait_settled(TIMEOUT));
    let snapshot = session.snapshot();
    assert_eq!(snapshot.total_pages, 2);
    assert!(snapshot.document_path.unwrap().ends_with("quick.djvu"));
    assert_eq!(session.current_bitmap().unwrap().width(), 22);
    assert_eq!(decoder.calls_for("slow.djvu", 0), 0);
}

#[test]
fn test_open_failure_leaves_no_document() {
    let decoder = ScriptedDecoder::new();
    decoder.script("good.djvu", Script::pages(2));
    let session = session(&decoder, test_config());

    let good = session.load_document("good.djvu").unwrap();
    assert!(wait_displayed(&session, 0));

    let err = session.load_document("missing.djvu").unwrap_err();
    assert!(matches!(err, OpenError::NotFound { .. }));

    let snapshot = session.snapshot();
    assert!(!snapshot.is_loaded);
    assert!(!snapshot.is_loading);
    assert_eq!(snapshot.total_pages, 0);
    assert!(snapshot.current_bitmap.is_none());
    assert!(snapshot.error_message.unwrap().contains("missing.djvu"));
    assert!(session.cache().is_empty());
    assert!(decoder.closed.lock().unwrap().contains(&good.handle));
}

#[test]
fn test_unsupported_extension_is_reported() {
    let decoder = ScriptedDecoder::new();
    decoder.script("notes.txt", Script::pages(1));
    let session = session(&decoder, test_config());

    let err = session.load_document("notes.txt").unwrap_err();
    assert!(matches!(err, OpenError::Unsupported { .. }));
    assert!(session.error_message().is_some());
}

#[test]
fn test_close_document_resets_state() {
    let decoder = ScriptedDecoder::new();
    decoder.script("short.djvu", Script::pages(3));
    let session = session(&decoder, test_config());

    let opened = session.load_document("short.djvu").unwrap();
    assert!(wait_displayed(&session, 0));
    assert!(session.wait_settled(TIMEOUT));

    session.close_document();
    let snapshot = session.snapshot();
    assert!(!snapshot.is_loaded);
    assert_eq!(snapshot.total_pages, 0);
    assert_eq!(snapshot.continuous_progress, 0.0);
    assert!(session.cache().is_empty());
    assert!(decoder.closed.lock().unwrap().contains(&opened.handle));
}

#[test]
fn test_clear_cache_keeps_displayed_page() {
    let decoder = ScriptedDecoder::new();
    decoder.script("four.djvu", Script::pages(4));
    let session = session(&decoder, test_config());

    session.load_document("four.djvu").unwrap();
    assert!(wait_displayed(&session, 0));
    assert!(session.wait_settled(TIMEOUT));

    session.clear_cache();
    assert!(session.cache().is_empty());
    assert_eq!(session.continuous_progress(), 0.0);
    assert_eq!(session.snapshot().displayed_page(), Some(0));
}

#[test]
fn test_empty_document_reports_no_pages() {
    let decoder = ScriptedDecoder::new();
    decoder.script("blank.djvu", Script::pages(0));
    let session = session(&decoder, test_config());

    session.load_document("blank.djvu").unwrap();
    let snapshot = session.snapshot();
    assert!(snapshot.is_loaded);
    assert!(!snapshot.is_loading);
    assert_eq!(snapshot.continuous_progress, 0.0);
    assert!(snapshot.error_message.is_some());
    assert!(!session.go_to_page(0));
}
