//! HTTP transport and the two fetch operations everything else is built on:
//! text fetches with caching and rate-limit handling, and whole-file
//! downloads assembled from validated ranged chunks.
//!
//! The wire itself sits behind [HttpBackend] so the rest of the engine (and
//! every test) can run against a scripted transport.

use std::ffi::OsStr;
use std::fs;
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lru::LruCache;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use reqwest::Proxy;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, ETAG, RANGE, RETRY_AFTER};
use thiserror::Error;

use crate::engine::EngineError;
use crate::engine::cancel::CancelToken;
use crate::engine::io::{DownloadMode, FetchTuning, PageCacheMode};

/// Sent with every request; some sites refuse clients without one.
pub(crate) const USER_AGENT: &str = concat!("tagrip/", env!("CARGO_PKG_VERSION"));

static CONTENT_RANGE_ECHO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^bytes (\d+)-(\d+)/(\d+|\*)$").unwrap());

/// Transport-level failure, split by whether it burns a retry budget.
/// Connection-class problems (refused, unreachable, TLS or proxy handshake)
/// are retried without counting; everything else is budgeted.
#[derive(Debug, Error)]
pub(crate) enum BackendError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Other(String),
}

impl BackendError {
    fn is_connection_class(&self) -> bool {
        matches!(self, BackendError::Connect(_))
    }
}

/// What a HEAD probe reports about a file.
#[derive(Debug, Clone)]
pub(crate) struct HeadInfo {
    pub(crate) status: u16,
    pub(crate) content_length: Option<u64>,
    pub(crate) etag: Option<String>,
}

/// One response body plus the headers the fetch layer cares about.
#[derive(Debug, Clone)]
pub(crate) struct FetchedBody {
    pub(crate) status: u16,
    pub(crate) body: Vec<u8>,
    pub(crate) etag: Option<String>,
    pub(crate) content_range: Option<String>,
    pub(crate) retry_after: Option<u64>,
}

/// Blocking HTTP seam. The production implementation wraps reqwest; tests
/// swap in scripted fakes.
pub(crate) trait HttpBackend: Send + Sync {
    fn head(&self, url: &str) -> Result<HeadInfo, BackendError>;
    fn get(&self, url: &str, range: Option<(u64, u64)>) -> Result<FetchedBody, BackendError>;
}

/// Production backend. Cookies set by the site persist across requests
/// through the client's cookie store.
struct ReqwestBackend {
    client: Client,
}

impl ReqwestBackend {
    fn new(tuning: &FetchTuning) -> Result<Self, EngineError> {
        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(tuning.timeout_secs))
            .cookie_store(true);
        if let Some(proxy) = &tuning.proxy {
            let proxy = Proxy::all(proxy)
                .map_err(|e| EngineError::Network(format!("bad proxy {proxy:?}: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| EngineError::Network(format!("client setup failed: {e}")))?;
        Ok(ReqwestBackend { client })
    }
}

fn classify(err: reqwest::Error) -> BackendError {
    if err.is_connect() {
        BackendError::Connect(err.to_string())
    } else if err.is_timeout() {
        BackendError::Timeout(err.to_string())
    } else {
        BackendError::Other(err.to_string())
    }
}

fn header_string(headers: &reqwest::header::HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_owned)
}

impl HttpBackend for ReqwestBackend {
    fn head(&self, url: &str) -> Result<HeadInfo, BackendError> {
        let response = self.client.head(url).send().map_err(classify)?;
        let content_length = header_string(response.headers(), CONTENT_LENGTH)
            .and_then(|v| v.parse::<u64>().ok());
        Ok(HeadInfo {
            status: response.status().as_u16(),
            content_length,
            etag: header_string(response.headers(), ETAG),
        })
    }

    fn get(&self, url: &str, range: Option<(u64, u64)>) -> Result<FetchedBody, BackendError> {
        let mut request = self.client.get(url);
        if let Some((start, end)) = range {
            request = request.header(RANGE, format!("bytes={start}-{end}"));
        }
        let response = request.send().map_err(classify)?;
        let status = response.status().as_u16();
        let etag = header_string(response.headers(), ETAG);
        let content_range = header_string(response.headers(), CONTENT_RANGE);
        let retry_after =
            header_string(response.headers(), RETRY_AFTER).and_then(|v| v.parse::<u64>().ok());
        let body = response.bytes().map_err(classify)?.to_vec();
        Ok(FetchedBody {
            status,
            body,
            etag,
            content_range,
            retry_after,
        })
    }
}

/// Cached page in the form the cache mode keeps it.
enum CachedPage {
    Raw(Vec<u8>),
    Decoded(String),
}

/// Everything a download attempt can end in, short of success. A restart
/// throws the partial file away and begins again from the HEAD probe; an
/// abort fails the download outright.
enum DownloadFailure {
    Restart(String),
    Abort(EngineError),
}

impl From<EngineError> for DownloadFailure {
    fn from(err: EngineError) -> Self {
        DownloadFailure::Abort(err)
    }
}

impl From<std::io::Error> for DownloadFailure {
    fn from(err: std::io::Error) -> Self {
        DownloadFailure::Abort(EngineError::Io(err))
    }
}

/// What a finished download reports back.
#[derive(Debug, Clone)]
pub(crate) struct DownloadOutcome {
    pub(crate) expected_size: Option<u64>,
    pub(crate) actual_size: u64,
    pub(crate) retries: usize,
    pub(crate) note: &'static str,
}

/// Shared fetch front end. Cloning is cheap; clones share the backend, the
/// page cache and the tuning.
#[derive(Clone)]
pub(crate) struct RequestSender {
    backend: Arc<dyn HttpBackend>,
    cache: Arc<RwLock<LruCache<String, CachedPage>>>,
    tuning: Arc<FetchTuning>,
}

impl RequestSender {
    pub(crate) fn new(tuning: FetchTuning) -> Result<Self, EngineError> {
        let backend = ReqwestBackend::new(&tuning)?;
        Ok(Self::with_backend(Arc::new(backend), tuning))
    }

    pub(crate) fn with_backend(backend: Arc<dyn HttpBackend>, tuning: FetchTuning) -> Self {
        let entries = NonZeroUsize::new(tuning.page_cache_entries).unwrap_or(NonZeroUsize::MIN);
        RequestSender {
            backend,
            cache: Arc::new(RwLock::new(LruCache::new(entries))),
            tuning: Arc::new(tuning),
        }
    }

    pub(crate) fn tuning(&self) -> &FetchTuning {
        &self.tuning
    }

    /// Fetches a URL as text. `tries` overrides the configured retry budget.
    /// With `use_cache` the response is remembered and repeated fetches of
    /// the same URL stay off the wire.
    ///
    /// A 404 whose body is at least the configured floor is returned as a
    /// success: some sites serve real content under that status. A smaller
    /// 404 aborts without retrying.
    pub(crate) fn fetch_text(
        &self,
        url: &str,
        tries: Option<usize>,
        use_cache: bool,
        cancel: &CancelToken,
    ) -> Result<String, EngineError> {
        if use_cache {
            if let Some(text) = self.cached(url) {
                trace!("Page cache hit for {url}");
                return Ok(text);
            }
        }

        let budget = tries.unwrap_or(self.tuning.retries).max(1);
        let mut attempts = 0usize;
        let mut rate_limit_hits = 0usize;
        loop {
            cancel.check()?;
            let fetched = match self.backend.get(url, None) {
                Ok(fetched) => fetched,
                Err(err) if err.is_connection_class() => {
                    warn!("Connection problem fetching {url}: {err}");
                    thread::sleep(self.backoff());
                    continue;
                }
                Err(err) => {
                    attempts += 1;
                    if attempts >= budget {
                        return Err(EngineError::RetriesExhausted {
                            url: url.to_string(),
                            attempts,
                        });
                    }
                    warn!("Transport error fetching {url}: {err}");
                    thread::sleep(self.backoff());
                    continue;
                }
            };

            if fetched.status == 429 {
                attempts += 1;
                if attempts >= budget {
                    return Err(EngineError::RetriesExhausted {
                        url: url.to_string(),
                        attempts,
                    });
                }
                rate_limit_hits += 1;
                let delay = self.rate_limit_backoff(rate_limit_hits, fetched.retry_after);
                warn!(
                    "Rate limited fetching {url}, backing off {}ms...",
                    delay.as_millis()
                );
                thread::sleep(delay);
                continue;
            }
            if fetched.status == 404 {
                if fetched.body.len() < self.tuning.not_found_body_floor {
                    return Err(EngineError::Status {
                        status: 404,
                        url: url.to_string(),
                    });
                }
                debug!("Tolerating a {}-byte 404 body from {url}", fetched.body.len());
            } else if !(200..300).contains(&fetched.status) {
                attempts += 1;
                if attempts >= budget {
                    return Err(EngineError::Status {
                        status: fetched.status,
                        url: url.to_string(),
                    });
                }
                warn!("HTTP {} fetching {url}", fetched.status);
                thread::sleep(self.backoff());
                continue;
            }

            let text = String::from_utf8_lossy(&fetched.body).into_owned();
            if use_cache {
                self.store(url, &fetched.body, &text);
            }
            return Ok(text);
        }
    }

    /// Downloads `url` into `dest` according to the mode. Chunked downloads
    /// go through ranged GETs validated against the HEAD probe; anything
    /// else is one unranged GET. The body lands in a `.part` file renamed
    /// into place only after the final size check passes.
    pub(crate) fn download_file(
        &self,
        url: &str,
        dest: &Path,
        mode: DownloadMode,
        chunked: bool,
        cancel: &CancelToken,
    ) -> Result<DownloadOutcome, EngineError> {
        match mode {
            DownloadMode::Skip => Ok(DownloadOutcome {
                expected_size: None,
                actual_size: 0,
                retries: 0,
                note: "skipped",
            }),
            DownloadMode::Touch => {
                fs::File::create(dest)?;
                Ok(DownloadOutcome {
                    expected_size: None,
                    actual_size: 0,
                    retries: 0,
                    note: "touched",
                })
            }
            DownloadMode::Full => self.download_full(url, dest, chunked, cancel),
        }
    }

    fn download_full(
        &self,
        url: &str,
        dest: &Path,
        chunked: bool,
        cancel: &CancelToken,
    ) -> Result<DownloadOutcome, EngineError> {
        let mut restarts = 0usize;
        let mut retries = 0usize;
        loop {
            cancel.check()?;
            match self.attempt_download(url, dest, chunked, cancel, &mut retries) {
                Ok(outcome) => return Ok(outcome),
                Err(DownloadFailure::Abort(err)) => return Err(err),
                Err(DownloadFailure::Restart(reason)) => {
                    restarts += 1;
                    if restarts > self.tuning.file_restarts {
                        return Err(EngineError::Download(format!(
                            "{url}: {reason} (gave up after {restarts} attempts)"
                        )));
                    }
                    warn!("Restarting download of {url}: {reason}");
                    thread::sleep(self.restart_backoff());
                }
            }
        }
    }

    /// One whole-file attempt: HEAD probe, body, final size check, rename.
    /// The `.part` file never survives a failed attempt.
    fn attempt_download(
        &self,
        url: &str,
        dest: &Path,
        chunked: bool,
        cancel: &CancelToken,
        retries: &mut usize,
    ) -> Result<DownloadOutcome, DownloadFailure> {
        let head = loop {
            cancel.check()?;
            match self.backend.head(url) {
                Ok(head) => break head,
                Err(err) if err.is_connection_class() => {
                    warn!("Connection problem probing {url}: {err}");
                    thread::sleep(self.backoff());
                }
                Err(err) => return Err(DownloadFailure::Restart(format!("HEAD failed: {err}"))),
            }
        };
        if head.status == 404 {
            return Err(DownloadFailure::Abort(EngineError::Status {
                status: 404,
                url: url.to_string(),
            }));
        }
        if !(200..300).contains(&head.status) {
            return Err(DownloadFailure::Restart(format!(
                "HEAD answered HTTP {}",
                head.status
            )));
        }
        let total = match head.content_length {
            Some(size) if size > 0 => size,
            // Sporadic empty probe answers clear up on a later attempt.
            _ => return Err(DownloadFailure::Restart(String::from("no size reported"))),
        };

        let part = part_path(dest);
        let written = self.write_part(&part, url, total, head.etag.as_deref(), chunked, cancel, retries);
        match written {
            Ok(actual) if actual == total => {
                fs::rename(&part, dest)?;
                trace!("Downloaded {url} ({total} bytes, {} retries)", *retries);
                Ok(DownloadOutcome {
                    expected_size: Some(total),
                    actual_size: actual,
                    retries: *retries,
                    note: "downloaded",
                })
            }
            Ok(actual) => {
                let _ = fs::remove_file(&part);
                Err(DownloadFailure::Restart(format!(
                    "wrote {actual} of {total} bytes"
                )))
            }
            Err(failure) => {
                let _ = fs::remove_file(&part);
                Err(failure)
            }
        }
    }

    fn write_part(
        &self,
        part: &Path,
        url: &str,
        total: u64,
        etag: Option<&str>,
        chunked: bool,
        cancel: &CancelToken,
        retries: &mut usize,
    ) -> Result<u64, DownloadFailure> {
        let mut file = fs::File::create(part)?;
        if !chunked || total <= self.tuning.chunk_size {
            let body = self.fetch_chunk(url, None, total, etag, cancel, retries)?;
            file.write_all(&body)?;
        } else {
            let mut start = 0u64;
            while start < total {
                cancel.check()?;
                let end = (start + self.tuning.chunk_size - 1).min(total - 1);
                let body = self.fetch_chunk(url, Some((start, end)), total, etag, cancel, retries)?;
                file.write_all(&body)?;
                start = end + 1;
            }
        }
        drop(file);
        Ok(fs::metadata(part)?.len())
    }

    /// Fetches one span (or the whole body when `range` is `None`) until it
    /// validates. Severe mismatches get a short budget, soft ones a longer
    /// one; connection-class transport errors consume neither.
    fn fetch_chunk(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
        total: u64,
        etag: Option<&str>,
        cancel: &CancelToken,
        retries: &mut usize,
    ) -> Result<Vec<u8>, DownloadFailure> {
        let mut soft = 0usize;
        let mut severe = 0usize;
        let mut rate_limit_hits = 0usize;
        loop {
            cancel.check()?;
            let fetched = match self.backend.get(url, range) {
                Ok(fetched) => fetched,
                Err(err) if err.is_connection_class() => {
                    warn!("Connection problem downloading {url}: {err}");
                    thread::sleep(self.backoff());
                    continue;
                }
                Err(err) => {
                    soft += 1;
                    *retries += 1;
                    if soft >= self.tuning.chunk_soft_retries {
                        return Err(DownloadFailure::Restart(format!("transport error: {err}")));
                    }
                    warn!("Transport error downloading {url}: {err}");
                    thread::sleep(self.backoff());
                    continue;
                }
            };

            if !(200..300).contains(&fetched.status) {
                soft += 1;
                *retries += 1;
                if soft >= self.tuning.chunk_soft_retries {
                    return Err(DownloadFailure::Restart(format!("HTTP {}", fetched.status)));
                }
                let delay = if fetched.status == 429 {
                    rate_limit_hits += 1;
                    self.rate_limit_backoff(rate_limit_hits, fetched.retry_after)
                } else {
                    self.backoff()
                };
                warn!("HTTP {} downloading {url}", fetched.status);
                thread::sleep(delay);
                continue;
            }

            match validate_chunk(&fetched, range, total, etag) {
                Ok(()) => return Ok(fetched.body),
                Err(code) => {
                    *retries += 1;
                    if code <= self.tuning.severe_code_ceiling {
                        severe += 1;
                        warn!("Chunk of {url} failed validation (code {code}, severe)");
                        if severe >= self.tuning.chunk_severe_abort {
                            return Err(DownloadFailure::Restart(format!(
                                "chunk validation code {code}"
                            )));
                        }
                    } else {
                        soft += 1;
                        debug!("Chunk of {url} failed validation (code {code})");
                        if soft >= self.tuning.chunk_soft_retries {
                            return Err(DownloadFailure::Restart(format!(
                                "chunk validation code {code} persisted"
                            )));
                        }
                    }
                    thread::sleep(self.backoff());
                }
            }
        }
    }

    fn cached(&self, url: &str) -> Option<String> {
        let mut cache = self.cache.write();
        cache.get(url).map(|page| match page {
            CachedPage::Raw(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            CachedPage::Decoded(text) => text.clone(),
        })
    }

    fn store(&self, url: &str, body: &[u8], text: &str) {
        let page = match self.tuning.page_cache_mode {
            PageCacheMode::Raw => CachedPage::Raw(body.to_vec()),
            PageCacheMode::Decoded => CachedPage::Decoded(text.to_owned()),
        };
        self.cache.write().put(url.to_owned(), page);
    }

    fn backoff(&self) -> Duration {
        Duration::from_millis(self.tuning.backoff_ms)
    }

    /// Whole-file restarts wait longer than per-fetch retries.
    fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.tuning.file_restart_backoff_ms)
    }

    /// Escalating delay for repeated 429 answers, capped, honoring a
    /// Retry-After header when the server sends one.
    fn rate_limit_backoff(&self, hits: usize, retry_after: Option<u64>) -> Duration {
        let scaled = self.tuning.backoff_ms.saturating_mul(1 << hits.min(16) as u32);
        let advised = retry_after.unwrap_or(0).saturating_mul(1000);
        Duration::from_millis(scaled.max(advised).min(self.tuning.rate_limit_backoff_cap_ms))
    }
}

/// Checks one response against the requested span. Code 1 is a body length
/// mismatch, 2 an ETag change since the HEAD probe, 3 a missing or
/// unparseable Content-Range echo, 4 a bounds mismatch in that echo and 5 a
/// total size mismatch. Codes 3 through 5 only apply to ranged requests;
/// the ETag is only compared when both sides sent one.
fn validate_chunk(
    fetched: &FetchedBody,
    range: Option<(u64, u64)>,
    total: u64,
    etag: Option<&str>,
) -> Result<(), u8> {
    let expected_len = match range {
        Some((start, end)) => end - start + 1,
        None => total,
    };
    if fetched.body.len() as u64 != expected_len {
        return Err(1);
    }
    if let (Some(expected), Some(seen)) = (etag, fetched.etag.as_deref()) {
        if expected != seen {
            return Err(2);
        }
    }
    let Some((start, end)) = range else {
        return Ok(());
    };
    let Some(echo) = fetched.content_range.as_deref().and_then(parse_content_range) else {
        return Err(3);
    };
    if echo.start != start || echo.end != end {
        return Err(4);
    }
    if echo.total != Some(total) {
        return Err(5);
    }
    Ok(())
}

struct RangeEcho {
    start: u64,
    end: u64,
    total: Option<u64>,
}

fn parse_content_range(header: &str) -> Option<RangeEcho> {
    let caps = CONTENT_RANGE_ECHO.captures(header.trim())?;
    let start = caps[1].parse().ok()?;
    let end = caps[2].parse().ok()?;
    let total = if &caps[3] == "*" {
        None
    } else {
        Some(caps[3].parse().ok()?)
    };
    Some(RangeEcho { start, end, total })
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(OsStr::to_os_string).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;

    use parking_lot::Mutex;
    use tempfile::tempdir;

    /// Scripted transport: responses are served in push order; an
    /// unscripted request is a test bug and panics.
    #[derive(Default)]
    struct FakeBackend {
        heads: Mutex<VecDeque<HeadInfo>>,
        gets: Mutex<VecDeque<Result<FetchedBody, BackendError>>>,
        ranges_seen: Mutex<Vec<Option<(u64, u64)>>>,
        cancel_after: Mutex<Option<(usize, CancelToken)>>,
    }

    impl FakeBackend {
        fn push_head(&self, head: HeadInfo) {
            self.heads.lock().push_back(head);
        }

        fn push_ok(&self, body: FetchedBody) {
            self.gets.lock().push_back(Ok(body));
        }

        fn push_err(&self, err: BackendError) {
            self.gets.lock().push_back(Err(err));
        }

        fn get_count(&self) -> usize {
            self.ranges_seen.lock().len()
        }
    }

    impl HttpBackend for FakeBackend {
        fn head(&self, _url: &str) -> Result<HeadInfo, BackendError> {
            Ok(self.heads.lock().pop_front().expect("unscripted HEAD"))
        }

        fn get(&self, _url: &str, range: Option<(u64, u64)>) -> Result<FetchedBody, BackendError> {
            self.ranges_seen.lock().push(range);
            if let Some((after, token)) = self.cancel_after.lock().as_ref() {
                if self.ranges_seen.lock().len() >= *after {
                    token.cancel();
                }
            }
            self.gets.lock().pop_front().expect("unscripted GET")
        }
    }

    fn head_of(size: Option<u64>, etag: Option<&str>) -> HeadInfo {
        HeadInfo {
            status: 200,
            content_length: size,
            etag: etag.map(str::to_owned),
        }
    }

    fn status_body(status: u16, body: &[u8]) -> FetchedBody {
        FetchedBody {
            status,
            body: body.to_vec(),
            etag: None,
            content_range: None,
            retry_after: None,
        }
    }

    fn chunk_of(blob: &[u8], start: u64, end: u64) -> FetchedBody {
        FetchedBody {
            status: 206,
            body: blob[start as usize..=end as usize].to_vec(),
            etag: None,
            content_range: Some(format!("bytes {start}-{end}/{}", blob.len())),
            retry_after: None,
        }
    }

    fn test_tuning() -> FetchTuning {
        let mut tuning = FetchTuning::default();
        tuning.retries = 3;
        tuning.not_found_body_floor = 8;
        tuning.chunk_size = 4;
        tuning.chunk_soft_retries = 3;
        tuning.chunk_severe_abort = 3;
        tuning.file_restarts = 1;
        tuning
    }

    fn sender_with(backend: Arc<FakeBackend>, tuning: FetchTuning) -> RequestSender {
        RequestSender::with_backend(backend, tuning)
    }

    #[test]
    fn test_fetch_text_caches_pages() {
        let backend = Arc::new(FakeBackend::default());
        backend.push_ok(status_body(200, b"<count>42</count>"));
        let sender = sender_with(backend.clone(), test_tuning());
        let token = CancelToken::new();

        let first = sender.fetch_text("http://site/a", None, true, &token).unwrap();
        let second = sender.fetch_text("http://site/a", None, true, &token).unwrap();

        assert_eq!(first, "<count>42</count>");
        assert_eq!(first, second);
        assert_eq!(backend.get_count(), 1);
    }

    #[test]
    fn test_fetch_text_distinguishes_404_bodies() {
        let backend = Arc::new(FakeBackend::default());
        backend.push_ok(status_body(404, &[b'x'; 32]));
        backend.push_ok(status_body(404, b"gone"));
        let sender = sender_with(backend.clone(), test_tuning());
        let token = CancelToken::new();

        // Floor is 8 bytes: the padded body passes for content.
        let padded = sender.fetch_text("http://site/a", None, false, &token).unwrap();
        assert_eq!(padded.len(), 32);

        // The short one aborts with no retry spent on it.
        let err = sender.fetch_text("http://site/b", None, false, &token).unwrap_err();
        assert!(matches!(err, EngineError::Status { status: 404, .. }));
        assert_eq!(backend.get_count(), 2);
    }

    #[test]
    fn test_connect_errors_spare_the_retry_budget() {
        let backend = Arc::new(FakeBackend::default());
        for _ in 0..4 {
            backend.push_err(BackendError::Connect(String::from("refused")));
        }
        backend.push_ok(status_body(200, b"late"));
        let sender = sender_with(backend.clone(), test_tuning());

        // Budget of 2, yet four connection failures are all forgiven.
        let text = sender
            .fetch_text("http://site/a", Some(2), false, &CancelToken::new())
            .unwrap();
        assert_eq!(text, "late");
    }

    #[test]
    fn test_fetch_text_gives_up_after_the_budget() {
        let backend = Arc::new(FakeBackend::default());
        backend.push_ok(status_body(500, b""));
        backend.push_ok(status_body(500, b""));
        let sender = sender_with(backend.clone(), test_tuning());

        let err = sender
            .fetch_text("http://site/a", Some(2), false, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::Status { status: 500, .. }));
        assert_eq!(backend.get_count(), 2);
    }

    #[test]
    fn test_rate_limit_backs_off_then_recovers() {
        let backend = Arc::new(FakeBackend::default());
        let mut limited = status_body(429, b"");
        limited.retry_after = Some(0);
        backend.push_ok(limited);
        backend.push_ok(status_body(200, b"ok"));
        let sender = sender_with(backend.clone(), test_tuning());

        let text = sender
            .fetch_text("http://site/a", None, false, &CancelToken::new())
            .unwrap();
        assert_eq!(text, "ok");
        assert_eq!(backend.get_count(), 2);
    }

    #[test]
    fn test_download_assembles_ranged_chunks() {
        let blob: Vec<u8> = (0u8..10).collect();
        let backend = Arc::new(FakeBackend::default());
        backend.push_head(head_of(Some(10), Some("v1")));
        backend.push_ok(chunk_of(&blob, 0, 3));
        backend.push_ok(chunk_of(&blob, 4, 7));
        backend.push_ok(chunk_of(&blob, 8, 9));
        let sender = sender_with(backend.clone(), test_tuning());
        let dir = tempdir().unwrap();
        let dest = dir.path().join("item.webm");

        let outcome = sender
            .download_file("http://site/f.webm", &dest, DownloadMode::Full, true, &CancelToken::new())
            .unwrap();

        assert_eq!(outcome.expected_size, Some(10));
        assert_eq!(outcome.actual_size, 10);
        assert_eq!(outcome.retries, 0);
        assert_eq!(fs::read(&dest).unwrap(), blob);
        assert!(!part_path(&dest).exists());
        assert_eq!(
            *backend.ranges_seen.lock(),
            vec![Some((0, 3)), Some((4, 7)), Some((8, 9))]
        );
    }

    #[test]
    fn test_unchunked_download_uses_one_request() {
        let blob = b"tiny image bits".to_vec();
        let backend = Arc::new(FakeBackend::default());
        backend.push_head(head_of(Some(blob.len() as u64), None));
        backend.push_ok(status_body(200, &blob));
        let sender = sender_with(backend.clone(), test_tuning());
        let dir = tempdir().unwrap();
        let dest = dir.path().join("item.png");

        sender
            .download_file("http://site/f.png", &dest, DownloadMode::Full, false, &CancelToken::new())
            .unwrap();

        assert_eq!(fs::read(&dest).unwrap(), blob);
        assert_eq!(*backend.ranges_seen.lock(), vec![None]);
    }

    #[test]
    fn test_stale_etag_aborts_chunks_and_restarts() {
        let blob: Vec<u8> = (0u8..10).collect();
        let backend = Arc::new(FakeBackend::default());
        // Two whole-file attempts, each: HEAD expecting v1, then three
        // chunks answering v2 (severe code 2) before the chunk loop quits.
        for _ in 0..2 {
            backend.push_head(head_of(Some(10), Some("v1")));
            for _ in 0..3 {
                let mut stale = chunk_of(&blob, 0, 3);
                stale.etag = Some(String::from("v2"));
                backend.push_ok(stale);
            }
        }
        let sender = sender_with(backend.clone(), test_tuning());
        let dir = tempdir().unwrap();
        let dest = dir.path().join("item.webm");

        let err = sender
            .download_file("http://site/f.webm", &dest, DownloadMode::Full, true, &CancelToken::new())
            .unwrap_err();

        assert!(matches!(err, EngineError::Download(_)));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
        assert_eq!(backend.get_count(), 6);
    }

    #[test]
    fn test_soft_total_mismatch_retries_the_chunk() {
        let blob: Vec<u8> = (0u8..6).collect();
        let backend = Arc::new(FakeBackend::default());
        backend.push_head(head_of(Some(6), None));
        backend.push_ok(chunk_of(&blob, 0, 3));
        // Wrong total in the echo is code 5, above the severe ceiling.
        let mut bad = chunk_of(&blob, 4, 5);
        bad.content_range = Some(String::from("bytes 4-5/999"));
        backend.push_ok(bad.clone());
        backend.push_ok(bad);
        backend.push_ok(chunk_of(&blob, 4, 5));
        let sender = sender_with(backend.clone(), test_tuning());
        let dir = tempdir().unwrap();
        let dest = dir.path().join("item.webm");

        let outcome = sender
            .download_file("http://site/f.webm", &dest, DownloadMode::Full, true, &CancelToken::new())
            .unwrap();

        assert_eq!(outcome.retries, 2);
        assert_eq!(fs::read(&dest).unwrap(), blob);
    }

    #[test]
    fn test_missing_head_size_is_transient() {
        let blob: Vec<u8> = (0u8..4).collect();
        let backend = Arc::new(FakeBackend::default());
        backend.push_head(head_of(None, None));
        backend.push_head(head_of(Some(4), None));
        backend.push_ok(status_body(200, &blob));
        let sender = sender_with(backend.clone(), test_tuning());
        let dir = tempdir().unwrap();
        let dest = dir.path().join("item.png");

        sender
            .download_file("http://site/f.png", &dest, DownloadMode::Full, true, &CancelToken::new())
            .unwrap();

        assert_eq!(fs::read(&dest).unwrap(), blob);
        assert!(backend.heads.lock().is_empty());
    }

    #[test]
    fn test_file_restarts_use_their_own_backoff() {
        let blob: Vec<u8> = (0u8..4).collect();
        let backend = Arc::new(FakeBackend::default());
        backend.push_head(head_of(None, None));
        backend.push_head(head_of(Some(4), None));
        backend.push_ok(status_body(200, &blob));
        let mut tuning = test_tuning();
        tuning.file_restart_backoff_ms = 40;
        let sender = sender_with(backend.clone(), tuning);
        let dir = tempdir().unwrap();
        let dest = dir.path().join("item.png");

        // The fetch backoff is zeroed here, so any wait comes from the
        // restart arm alone.
        let started = std::time::Instant::now();
        sender
            .download_file("http://site/f.png", &dest, DownloadMode::Full, false, &CancelToken::new())
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(fs::read(&dest).unwrap(), blob);
    }

    #[test]
    fn test_cancellation_removes_the_partial_file() {
        let blob: Vec<u8> = (0u8..12).collect();
        let token = CancelToken::new();
        let backend = Arc::new(FakeBackend::default());
        backend.push_head(head_of(Some(12), None));
        backend.push_ok(chunk_of(&blob, 0, 3));
        *backend.cancel_after.lock() = Some((1, token.clone()));
        let sender = sender_with(backend.clone(), test_tuning());
        let dir = tempdir().unwrap();
        let dest = dir.path().join("item.mp4");

        let err = sender
            .download_file("http://site/f.mp4", &dest, DownloadMode::Full, true, &token)
            .unwrap_err();

        assert!(matches!(err, EngineError::Interrupted));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[test]
    fn test_touch_creates_an_empty_file() {
        let backend = Arc::new(FakeBackend::default());
        let sender = sender_with(backend.clone(), test_tuning());
        let dir = tempdir().unwrap();
        let dest = dir.path().join("item.png");

        let outcome = sender
            .download_file("http://site/f.png", &dest, DownloadMode::Touch, false, &CancelToken::new())
            .unwrap();

        assert_eq!(outcome.note, "touched");
        assert_eq!(fs::metadata(&dest).unwrap().len(), 0);
        assert_eq!(backend.get_count(), 0);
    }

    #[test]
    fn test_chunk_validation_codes() {
        let blob: Vec<u8> = (0u8..8).collect();
        assert_eq!(validate_chunk(&chunk_of(&blob, 0, 3), Some((0, 3)), 8, None), Ok(()));

        let mut short = chunk_of(&blob, 0, 3);
        short.body.pop();
        assert_eq!(validate_chunk(&short, Some((0, 3)), 8, None), Err(1));

        let mut stale = chunk_of(&blob, 0, 3);
        stale.etag = Some(String::from("v2"));
        assert_eq!(validate_chunk(&stale, Some((0, 3)), 8, Some("v1")), Err(2));

        let mut missing = chunk_of(&blob, 0, 3);
        missing.content_range = None;
        assert_eq!(validate_chunk(&missing, Some((0, 3)), 8, None), Err(3));

        let mut shifted = chunk_of(&blob, 0, 3);
        shifted.content_range = Some(String::from("bytes 4-7/8"));
        assert_eq!(validate_chunk(&shifted, Some((0, 3)), 8, None), Err(4));

        let mut wrong_total = chunk_of(&blob, 0, 3);
        wrong_total.content_range = Some(String::from("bytes 0-3/9"));
        assert_eq!(validate_chunk(&wrong_total, Some((0, 3)), 8, None), Err(5));

        // Unranged bodies only check length and ETag.
        assert_eq!(validate_chunk(&status_body(200, &blob), None, 8, None), Ok(()));
    }
}
