//! Settings persistence and the per-run configuration object.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the settings file kept next to the executable.
pub(crate) const SETTINGS_NAME: &str = "tagrip.json";

/// Lower bound of the date range when the user gives none.
pub(crate) fn epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

/// Upper bound of the date range when the user gives none.
pub(crate) fn today() -> NaiveDate {
    Local::now().date_naive()
}

#[derive(Error, Debug)]
pub(crate) enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed settings file: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid value for {option}: {reason}")]
    InvalidOption {
        option: &'static str,
        reason: String,
    },
}

fn invalid(option: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidOption {
        option,
        reason: reason.into(),
    }
}

/// What to do with a file once its address is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum DownloadMode {
    /// Download the file body.
    Full,
    /// Count the file but never touch the disk.
    Skip,
    /// Create an empty file carrying the final name.
    Touch,
}

impl DownloadMode {
    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "full" => Some(DownloadMode::Full),
            "skip" => Some(DownloadMode::Skip),
            "touch" => Some(DownloadMode::Touch),
            _ => None,
        }
    }
}

impl fmt::Display for DownloadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadMode::Full => write!(f, "full"),
            DownloadMode::Skip => write!(f, "skip"),
            DownloadMode::Touch => write!(f, "touch"),
        }
    }
}

/// Storage form of the fetched-page cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum PageCacheMode {
    /// Keep the response bytes and decode on every hit.
    Raw,
    /// Keep the decoded text.
    Decoded,
}

/// Persisted defaults, created next to the executable on first run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Settings {
    #[serde(rename = "downloadDirectory", default = "default_download_dir")]
    pub(crate) download_directory: String,
    #[serde(rename = "threads", default = "default_threads")]
    pub(crate) threads: usize,
    #[serde(rename = "timeoutSeconds", default = "default_timeout")]
    pub(crate) timeout_secs: u64,
    #[serde(rename = "retries", default = "default_retries")]
    pub(crate) retries: usize,
    #[serde(rename = "fetchBackoffMs", default = "default_backoff_ms")]
    pub(crate) fetch_backoff_ms: u64,
    #[serde(rename = "rateLimitBackoffCapMs", default = "default_rate_cap_ms")]
    pub(crate) rate_limit_backoff_cap_ms: u64,
    #[serde(rename = "notFoundBodyFloor", default = "default_not_found_floor")]
    pub(crate) not_found_body_floor: usize,
    #[serde(rename = "chunkSizeKib", default = "default_chunk_kib")]
    pub(crate) chunk_size_kib: u64,
    #[serde(rename = "chunkSoftRetries", default = "default_soft_retries")]
    pub(crate) chunk_soft_retries: usize,
    #[serde(rename = "chunkSevereAbort", default = "default_severe_abort")]
    pub(crate) chunk_severe_abort: usize,
    #[serde(rename = "severeCodeCeiling", default = "default_severe_ceiling")]
    pub(crate) severe_code_ceiling: u8,
    #[serde(rename = "fileRestarts", default = "default_file_restarts")]
    pub(crate) file_restarts: usize,
    #[serde(rename = "fileRestartBackoffMs", default = "default_restart_backoff_ms")]
    pub(crate) file_restart_backoff_ms: u64,
    #[serde(rename = "pageCacheEntries", default = "default_cache_entries")]
    pub(crate) page_cache_entries: usize,
    #[serde(rename = "pageCacheMode", default = "default_cache_mode")]
    pub(crate) page_cache_mode: PageCacheMode,
    #[serde(rename = "maxQueryLength", default = "default_query_len")]
    pub(crate) max_query_len: usize,
    #[serde(rename = "maxQueryTokens", default = "default_query_tokens")]
    pub(crate) max_query_tokens: usize,
}

fn default_download_dir() -> String {
    String::from(".")
}

fn default_threads() -> usize {
    num_cpus::get().clamp(1, 8)
}

fn default_timeout() -> u64 {
    10
}

fn default_retries() -> usize {
    10
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_rate_cap_ms() -> u64 {
    30_000
}

fn default_not_found_floor() -> usize {
    1024
}

fn default_chunk_kib() -> u64 {
    4096
}

fn default_soft_retries() -> usize {
    15
}

fn default_severe_abort() -> usize {
    3
}

fn default_severe_ceiling() -> u8 {
    4
}

fn default_file_restarts() -> usize {
    3
}

fn default_restart_backoff_ms() -> u64 {
    2000
}

fn default_cache_entries() -> usize {
    256
}

fn default_cache_mode() -> PageCacheMode {
    PageCacheMode::Decoded
}

fn default_query_len() -> usize {
    2000
}

fn default_query_tokens() -> usize {
    64
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_directory: default_download_dir(),
            threads: default_threads(),
            timeout_secs: default_timeout(),
            retries: default_retries(),
            fetch_backoff_ms: default_backoff_ms(),
            rate_limit_backoff_cap_ms: default_rate_cap_ms(),
            not_found_body_floor: default_not_found_floor(),
            chunk_size_kib: default_chunk_kib(),
            chunk_soft_retries: default_soft_retries(),
            chunk_severe_abort: default_severe_abort(),
            severe_code_ceiling: default_severe_ceiling(),
            file_restarts: default_file_restarts(),
            file_restart_backoff_ms: default_restart_backoff_ms(),
            page_cache_entries: default_cache_entries(),
            page_cache_mode: default_cache_mode(),
            max_query_len: default_query_len(),
            max_query_tokens: default_query_tokens(),
        }
    }
}

impl Settings {
    /// Loads the settings file, writing one with defaults first if none
    /// exists yet.
    pub(crate) fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("Creating settings file {:?} with defaults...", path);
            let settings = Settings::default();
            settings.save(path)?;
            return Ok(settings);
        }
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub(crate) fn save(&self, path: &Path) -> Result<(), ConfigError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Network and retry tuning handed to the request sender.
#[derive(Debug, Clone)]
pub(crate) struct FetchTuning {
    pub(crate) timeout_secs: u64,
    pub(crate) retries: usize,
    pub(crate) backoff_ms: u64,
    pub(crate) rate_limit_backoff_cap_ms: u64,
    pub(crate) not_found_body_floor: usize,
    pub(crate) chunk_size: u64,
    pub(crate) chunk_soft_retries: usize,
    pub(crate) chunk_severe_abort: usize,
    pub(crate) severe_code_ceiling: u8,
    pub(crate) file_restarts: usize,
    pub(crate) file_restart_backoff_ms: u64,
    pub(crate) page_cache_entries: usize,
    pub(crate) page_cache_mode: PageCacheMode,
    pub(crate) proxy: Option<String>,
}

impl FetchTuning {
    pub(crate) fn from_settings(settings: &Settings, proxy: Option<String>) -> Self {
        Self {
            timeout_secs: settings.timeout_secs,
            retries: settings.retries,
            backoff_ms: settings.fetch_backoff_ms,
            rate_limit_backoff_cap_ms: settings.rate_limit_backoff_cap_ms,
            not_found_body_floor: settings.not_found_body_floor,
            chunk_size: settings.chunk_size_kib.max(1) * 1024,
            chunk_soft_retries: settings.chunk_soft_retries,
            chunk_severe_abort: settings.chunk_severe_abort,
            severe_code_ceiling: settings.severe_code_ceiling,
            file_restarts: settings.file_restarts,
            file_restart_backoff_ms: settings.file_restart_backoff_ms,
            page_cache_entries: settings.page_cache_entries,
            page_cache_mode: settings.page_cache_mode,
            proxy,
        }
    }
}

#[cfg(test)]
impl Default for FetchTuning {
    fn default() -> Self {
        let mut tuning = FetchTuning::from_settings(&Settings::default(), None);
        // Tests never want real sleeps.
        tuning.backoff_ms = 0;
        tuning.rate_limit_backoff_cap_ms = 0;
        tuning.file_restart_backoff_ms = 0;
        tuning
    }
}

/// Everything one run needs, owned by the run. There is no global
/// configuration cell; callers pass this (or pieces of it) down.
#[derive(Debug, Clone)]
pub(crate) struct RunConfig {
    pub(crate) module: String,
    pub(crate) query: Vec<String>,
    pub(crate) dest: PathBuf,
    pub(crate) threads: usize,
    pub(crate) min_date: NaiveDate,
    pub(crate) max_date: NaiveDate,
    pub(crate) download_limit: Option<usize>,
    pub(crate) mode: DownloadMode,
    pub(crate) skip_images: bool,
    pub(crate) skip_videos: bool,
    pub(crate) split_groups: bool,
    pub(crate) get_maxid: bool,
    pub(crate) max_query_len: usize,
    pub(crate) max_query_tokens: usize,
    pub(crate) fetch: FetchTuning,
}

impl RunConfig {
    /// Rejects out-of-range numeric options and impossible combinations.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=32).contains(&self.threads) {
            return Err(invalid("-threads", format!("{} not in 1..=32", self.threads)));
        }
        if !(2..=600).contains(&self.fetch.timeout_secs) {
            return Err(invalid(
                "-timeout",
                format!("{} not in 2..=600", self.fetch.timeout_secs),
            ));
        }
        if !(1..=1000).contains(&self.fetch.retries) {
            return Err(invalid(
                "-retries",
                format!("{} not in 1..=1000", self.fetch.retries),
            ));
        }
        if self.min_date > self.max_date {
            return Err(invalid(
                "-mindate",
                format!("{} is later than -maxdate {}", self.min_date, self.max_date),
            ));
        }
        if self.dest.as_os_str().is_empty() {
            return Err(invalid("-path", "empty destination"));
        }
        Ok(())
    }

    /// True when the lower date bound was left at its default and cannot
    /// exclude anything.
    pub(crate) fn min_date_irrelevant(&self) -> bool {
        self.min_date <= epoch_date()
    }

    /// True when the upper date bound is today or later: nothing listed can
    /// be newer.
    pub(crate) fn max_date_irrelevant(&self) -> bool {
        self.max_date >= today()
    }

    pub(crate) fn date_filter_active(&self) -> bool {
        !self.min_date_irrelevant() || !self.max_date_irrelevant()
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        RunConfig {
            module: String::from("gelbooru"),
            query: vec![String::from("tag")],
            dest: PathBuf::from("."),
            threads: 4,
            min_date: epoch_date(),
            max_date: today(),
            download_limit: None,
            mode: DownloadMode::Full,
            skip_images: false,
            skip_videos: false,
            split_groups: false,
            get_maxid: false,
            max_query_len: default_query_len(),
            max_query_tokens: default_query_tokens(),
            fetch: FetchTuning::default(),
        }
    }
}

/// Parses the `DD-MM-YYYY` form used by every date option.
pub(crate) fn parse_date(option: &'static str, value: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(value, "%d-%m-%Y")
        .map_err(|e| invalid(option, format!("{value:?} is not DD-MM-YYYY ({e})")))
}
