//! Viewer configuration.
//!
//! Settings can be loaded from a TOML file, overridden from environment
//! variables, or built programmatically with the `with_*` methods.

use crate::session::ViewMode;
use djvu_reader_cache::{DEFAULT_CAPACITY, DEFAULT_TARGET_SIZE};
use djvu_reader_engine::{djvu, DjvuOptions, PdfOptions};
use djvu_reader_scheduler::{WorkerPoolConfig, DEFAULT_POLL_INTERVAL, DEFAULT_WORKER_COUNT};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix shared by every environment override
pub const ENV_PREFIX: &str = "DJVU_READER_";

/// Decoded-page cache limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Entry count above which eviction runs
    pub capacity: usize,
    /// Entry count eviction trims down to
    pub target_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            target_size: DEFAULT_TARGET_SIZE,
        }
    }
}

/// Decode worker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub count: usize,
    pub poll_interval_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: DEFAULT_WORKER_COUNT,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

/// PDF render scales (points to pixels)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PdfSettings {
    pub display_scale: f32,
    pub prefetch_scale: f32,
}

impl Default for PdfSettings {
    fn default() -> Self {
        let options = PdfOptions::default();
        Self {
            display_scale: options.display_scale,
            prefetch_scale: options.prefetch_scale,
        }
    }
}

/// djvulibre settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DjvuSettings {
    /// `ddjvu -scale` for the page on screen
    pub display_scale: u32,
    /// `ddjvu -scale` for pages decoded ahead
    pub prefetch_scale: u32,
    /// Directories searched for `ddjvu` and `djvused` before `PATH`
    pub tool_dirs: Vec<PathBuf>,
    /// Whether `PATH` is searched when `tool_dirs` miss
    pub search_path: bool,
    /// Highest page probed when `djvused` is unavailable
    pub probe_limit: u32,
}

impl Default for DjvuSettings {
    fn default() -> Self {
        let options = DjvuOptions::default();
        Self {
            display_scale: options.display_scale,
            prefetch_scale: options.prefetch_scale,
            tool_dirs: djvu::default_search_dirs(),
            search_path: options.search_path,
            probe_limit: options.probe_limit,
        }
    }
}

/// Presentation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewSettings {
    /// Mode a freshly loaded document opens in
    pub initial_mode: ViewMode,
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self {
            initial_mode: ViewMode::Continuous,
        }
    }
}

/// Complete viewer configuration
///
/// # Example
///
/// ```
/// use djvu_reader_core::{ViewerConfig, ViewMode};
///
/// let config = ViewerConfig::default()
///     .with_cache_limits(10, 6)
///     .with_workers(2)
///     .with_initial_view_mode(ViewMode::Single);
///
/// assert_eq!(config.cache.capacity, 10);
/// assert_eq!(config.workers.count, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub cache: CacheSettings,
    pub workers: WorkerSettings,
    pub pdf: PdfSettings,
    pub djvu: DjvuSettings,
    pub view: ViewSettings,
}

impl ViewerConfig {
    /// Sets the cache capacity and eviction target.
    pub fn with_cache_limits(mut self, capacity: usize, target_size: usize) -> Self {
        self.cache.capacity = capacity;
        self.cache.target_size = target_size;
        self
    }

    /// Sets the number of decode workers.
    pub fn with_workers(mut self, count: usize) -> Self {
        self.workers.count = count;
        self
    }

    /// Sets how long an idle worker waits before rechecking for shutdown.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.workers.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the PDF display and prefetch scales.
    pub fn with_pdf_scales(mut self, display: f32, prefetch: f32) -> Self {
        self.pdf.display_scale = display;
        self.pdf.prefetch_scale = prefetch;
        self
    }

    /// Sets the DJVU display and prefetch scales.
    pub fn with_djvu_scales(mut self, display: u32, prefetch: u32) -> Self {
        self.djvu.display_scale = display;
        self.djvu.prefetch_scale = prefetch;
        self
    }

    /// Sets the directories searched for the djvulibre tools.
    pub fn with_djvu_tool_dirs<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.djvu.tool_dirs = dirs.into_iter().map(|dir| dir.as_ref().to_path_buf()).collect();
        self
    }

    /// Sets the view mode new documents open in.
    pub fn with_initial_view_mode(mut self, mode: ViewMode) -> Self {
        self.view.initial_mode = mode;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.workers.poll_interval_ms)
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.workers.count).with_poll_interval(self.poll_interval())
    }

    pub fn pdf_options(&self) -> PdfOptions {
        PdfOptions {
            display_scale: self.pdf.display_scale,
            prefetch_scale: self.pdf.prefetch_scale,
        }
    }

    pub fn djvu_options(&self) -> DjvuOptions {
        DjvuOptions {
            search_dirs: self.djvu.tool_dirs.clone(),
            search_path: self.djvu.search_path,
            display_scale: self.djvu.display_scale,
            prefetch_scale: self.djvu.prefetch_scale,
            probe_limit: self.djvu.probe_limit,
        }
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidValue`] naming the first bad key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, value: String| {
            Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            })
        };

        if self.cache.capacity == 0 {
            return invalid("cache.capacity", self.cache.capacity.to_string());
        }
        if self.cache.target_size > self.cache.capacity {
            return invalid("cache.target_size", self.cache.target_size.to_string());
        }
        if self.workers.count == 0 {
            return invalid("workers.count", self.workers.count.to_string());
        }
        if !(self.pdf.display_scale > 0.0) {
            return invalid("pdf.display_scale", self.pdf.display_scale.to_string());
        }
        if !(self.pdf.prefetch_scale > 0.0) {
            return invalid("pdf.prefetch_scale", self.pdf.prefetch_scale.to_string());
        }
        if self.djvu.display_scale == 0 {
            return invalid("djvu.display_scale", self.djvu.display_scale.to_string());
        }
        if self.djvu.prefetch_scale == 0 {
            return invalid("djvu.prefetch_scale", self.djvu.prefetch_scale.to_string());
        }
        Ok(())
    }

    /// Returns the default configuration file location.
    ///
    /// - macOS: ~/Library/Application Support/djvu-reader/config.toml
    /// - Linux: ~/.config/djvu-reader/config.toml
    /// - Windows: %APPDATA%\djvu-reader\config.toml
    pub fn default_config_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("djvu-reader").join("config.toml")
        } else {
            PathBuf::from("djvu-reader.toml")
        }
    }

    /// Loads configuration from environment variables on top of the defaults.
    ///
    /// Environment variables:
    /// - `DJVU_READER_CACHE_CAPACITY`, `DJVU_READER_CACHE_TARGET`
    /// - `DJVU_READER_WORKERS`, `DJVU_READER_POLL_MS`
    /// - `DJVU_READER_PDF_DISPLAY_SCALE`, `DJVU_READER_PDF_PREFETCH_SCALE`
    /// - `DJVU_READER_DJVU_DISPLAY_SCALE`, `DJVU_READER_DJVU_PREFETCH_SCALE`
    /// - `DJVU_READER_DJVU_TOOL_DIRS` (platform path-list syntax)
    /// - `DJVU_READER_DJVU_PROBE_LIMIT`
    /// - `DJVU_READER_VIEW_MODE` (`single` or `continuous`)
    ///
    /// # Errors
    /// Returns an error if any variable holds an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Applies environment overrides to this configuration.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Some(value) = env_parse("CACHE_CAPACITY")? {
            self.cache.capacity = value;
        }
        if let Some(value) = env_parse("CACHE_TARGET")? {
            self.cache.target_size = value;
        }
        if let Some(value) = env_parse("WORKERS")? {
            self.workers.count = value;
        }
        if let Some(value) = env_parse("POLL_MS")? {
            self.workers.poll_interval_ms = value;
        }
        if let Some(value) = env_parse("PDF_DISPLAY_SCALE")? {
            self.pdf.display_scale = value;
        }
        if let Some(value) = env_parse("PDF_PREFETCH_SCALE")? {
            self.pdf.prefetch_scale = value;
        }
        if let Some(value) = env_parse("DJVU_DISPLAY_SCALE")? {
            self.djvu.display_scale = value;
        }
        if let Some(value) = env_parse("DJVU_PREFETCH_SCALE")? {
            self.djvu.prefetch_scale = value;
        }
        if let Some(value) = env::var_os(format!("{ENV_PREFIX}DJVU_TOOL_DIRS")) {
            self.djvu.tool_dirs = env::split_paths(&value).collect();
        }
        if let Some(value) = env_parse("DJVU_PROBE_LIMIT")? {
            self.djvu.probe_limit = value;
        }
        if let Some(value) = env_parse("VIEW_MODE")? {
            self.view.initial_mode = value;
        }

        self.validate()?;
        Ok(self)
    }

    /// Loads configuration from a TOML file. Missing keys keep their defaults.
    ///
    /// Expected file format:
    /// ```toml
    /// [cache]
    /// capacity = 20
    /// target_size = 15
    ///
    /// [workers]
    /// count = 3
    ///
    /// [view]
    /// initial_mode = "continuous"
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Converts configuration to TOML format.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Saves configuration to a TOML file, creating parent directories.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Loads the default file if it exists, then applies environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_config_path();
        let config = if path.exists() {
            tracing::debug!(path = %path.display(), "loading configuration file");
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env()
    }
}

fn env_parse<T: std::str::FromStr>(suffix: &str) -> Result<Option<T>, ConfigError> {
    let key = format!("{ENV_PREFIX}{suffix}");
    match env::var(&key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for configuration key {key}")]
    InvalidValue { key: String, value: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
