//! The run engine.
//!
//! [WebConnector] owns everything one run needs: the site adapter, the
//! request sender, the run configuration, a cancellation token and the
//! progress reporter. A run drains a FIFO queue of task strings seeded by
//! the query splitter and extended by parent/child follow-ups, then
//! downloads the aggregated survivors in one final phase. All per-run state
//! lives on the connector or its [RunContext]; there are no globals.

pub(crate) mod adapter;
pub(crate) mod boundary;
pub(crate) mod cancel;
pub(crate) mod filters;
pub(crate) mod io;
pub(crate) mod sender;
pub(crate) mod tags;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::NaiveDate;
use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use parking_lot::Mutex;
use rayon::prelude::*;
use thiserror::Error;

use crate::engine::adapter::{ItemInfo, ItemRecord, QueryOutcome, ScannedItem, SiteAdapter};
use crate::engine::boundary::{BoundarySide, ProbePick, locate_boundary_page};
use crate::engine::cancel::CancelToken;
use crate::engine::filters::{FilterContext, ItemFilter};
use crate::engine::io::RunConfig;
use crate::engine::sender::RequestSender;

#[derive(Debug, Error)]
pub(crate) enum EngineError {
    /// Unrecoverable condition; the run stops and the message reaches the user.
    #[error("{0}")]
    Fatal(String),
    #[error("run interrupted")]
    Interrupted,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP {status} for {url}")]
    Status { status: u16, url: String },
    #[error("{url}: retries exhausted after {attempts} attempts")]
    RetriesExhausted { url: String, attempts: usize },
    #[error("malformed tag group {0:?}")]
    MalformedGroup(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error("adapter error: {0}")]
    Adapter(String),
}

/// Weighted run phases. Downloading owns almost the whole bar; the scan
/// phases cycle once per task inside the remaining band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Searching,
    ScanningPages1,
    ScanningPages2,
    Filtering1,
    Filtering2,
    Filtering3,
    Filtering4,
    Downloading,
}

const PROGRESS_SCALE: u64 = 1000;
/// Permille covered by everything before the download phase.
const SCAN_BAND: u64 = 35;

impl Phase {
    fn permille(self) -> u64 {
        match self {
            Phase::Searching => 5,
            Phase::ScanningPages1 => 10,
            Phase::ScanningPages2 => 10,
            Phase::Filtering1 => 2,
            Phase::Filtering2 => 2,
            Phase::Filtering3 => 3,
            Phase::Filtering4 => 3,
            Phase::Downloading => 965,
        }
    }

    /// Permille already completed when this phase begins.
    fn offset(self) -> u64 {
        match self {
            Phase::Searching => 0,
            Phase::ScanningPages1 => 5,
            Phase::ScanningPages2 => 15,
            Phase::Filtering1 => 25,
            Phase::Filtering2 => 27,
            Phase::Filtering3 => 29,
            Phase::Filtering4 => 32,
            Phase::Downloading => SCAN_BAND,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Phase::Searching => "Searching",
            Phase::ScanningPages1 | Phase::ScanningPages2 => "Scanning",
            Phase::Filtering1 | Phase::Filtering2 | Phase::Filtering3 | Phase::Filtering4 => {
                "Filtering"
            }
            Phase::Downloading => "Downloading",
        }
    }
}

/// One monotonic percentage over the whole run. Task counts can grow while
/// scanning, which would move the naive ratio backwards; the reporter pins
/// the bar to the highest position reached.
struct ProgressReporter {
    bar: ProgressBar,
    floor: AtomicU64,
}

const PROGRESS_TEMPLATE: &str = "{spinner} {prefix:>11} {bar:40} {percent:>3}% {msg}";

impl ProgressReporter {
    fn new() -> Self {
        let progress_style = ProgressStyle::default_bar()
            .template(PROGRESS_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        let bar = ProgressBar::new(PROGRESS_SCALE);
        bar.set_style(progress_style);
        bar.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
        ProgressReporter {
            bar,
            floor: AtomicU64::new(0),
        }
    }

    fn scan(&self, task_index: usize, task_count: usize, phase: Phase) {
        self.bar.set_prefix(phase.label());
        let pos = (task_index as u64 * SCAN_BAND + phase.offset()) / (task_count.max(1) as u64);
        self.advance_to(pos);
    }

    fn download(&self, done: usize, total: usize) {
        self.bar.set_prefix(Phase::Downloading.label());
        let band = Phase::Downloading.permille();
        let pos = SCAN_BAND + band * done as u64 / (total.max(1) as u64);
        self.advance_to(pos);
    }

    fn advance_to(&self, pos: u64) {
        let floor = self.floor.fetch_max(pos, Ordering::SeqCst).max(pos);
        self.bar.set_position(floor.min(PROGRESS_SCALE));
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

#[derive(Default)]
struct RunCounters {
    downloaded: usize,
    failed: usize,
    failed_ids: Vec<String>,
}

/// Per-run mutable state. The exclusion cache and parent sets are only
/// touched from the orchestrator thread; the info map and counters are
/// shared with worker pools behind their mutexes.
struct RunContext {
    queue: VecDeque<String>,
    collected: Vec<ScannedItem>,
    collected_ids: HashSet<String>,
    infos: Mutex<HashMap<String, ItemInfo>>,
    excluded: HashSet<String>,
    known_parents: HashSet<i64>,
    pending_parents: HashSet<i64>,
    items_seen: HashSet<i64>,
    counters: Mutex<RunCounters>,
}

impl RunContext {
    fn new(tasks: Vec<String>) -> Self {
        RunContext {
            queue: tasks.into(),
            collected: Vec::new(),
            collected_ids: HashSet::new(),
            infos: Mutex::new(HashMap::new()),
            excluded: HashSet::new(),
            known_parents: HashSet::new(),
            pending_parents: HashSet::new(),
            items_seen: HashSet::new(),
            counters: Mutex::new(RunCounters::default()),
        }
    }
}

pub(crate) struct WebConnector {
    adapter: Box<dyn SiteAdapter>,
    sender: RequestSender,
    config: RunConfig,
    cancel: CancelToken,
    progress: ProgressReporter,
}

impl WebConnector {
    pub(crate) fn new(
        adapter: Box<dyn SiteAdapter>,
        sender: RequestSender,
        config: RunConfig,
    ) -> Self {
        WebConnector {
            adapter,
            sender,
            config,
            cancel: CancelToken::new(),
            progress: ProgressReporter::new(),
        }
    }

    /// Handle callers can trip to stop the run cooperatively.
    pub(crate) fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub(crate) fn run(&self) -> Result<(), EngineError> {
        let tuning = self.sender.tuning();
        trace!(
            "Fetch tuning: {}s timeout, {} retries, {} KiB chunks",
            tuning.timeout_secs,
            tuning.retries,
            tuning.chunk_size / 1024
        );
        if self.config.get_maxid {
            return self.report_max_id();
        }

        info!(
            "Module {} with {} threads",
            style(self.adapter.name()).color256(39),
            self.config.threads
        );
        let split = tags::split_query(
            &self.config.query,
            self.config.split_groups,
            self.adapter.tag_concat(),
            self.config.max_query_len,
            self.config.max_query_tokens,
        )?;
        let groups = split.exclusion_groups;
        let mut ctx = RunContext::new(split.tasks);

        let mut task_index = 0usize;
        while let Some(task) = ctx.queue.pop_front() {
            self.cancel.check()?;
            if let Some(parent) = self.parent_task_id(&task) {
                let full_id = format!("{}{}", self.adapter.id_prefix(), parent);
                if ctx.excluded.contains(&full_id) {
                    debug!("Skipping follow-up {task:?}: {full_id} is excluded");
                    continue;
                }
            }
            let task_count = task_index + 1 + ctx.queue.len();
            self.scan_task(&task, task_index, task_count, &groups, &mut ctx)?;
            task_index += 1;
        }

        self.download_all(&mut ctx)?;
        self.progress.finish();
        Ok(())
    }

    /// `parent<sep><id>` follow-up task strings carry the id to re-check at
    /// dequeue time.
    fn parent_task_id(&self, task: &str) -> Option<i64> {
        task.strip_prefix("parent")?
            .strip_prefix(self.adapter.id_value_sep())?
            .parse()
            .ok()
    }

    fn scan_task(
        &self,
        task: &str,
        index: usize,
        count: usize,
        groups: &[Vec<String>],
        ctx: &mut RunContext,
    ) -> Result<(), EngineError> {
        self.progress.scan(index, count, Phase::Searching);
        info!("Scanning {}", style(task).color256(39).italic());

        let outcome = self
            .adapter
            .query_size_or_page(&self.sender, task, &self.cancel)?;
        let records = match outcome {
            QueryOutcome::Count(0) => {
                info!("Nothing matches {}", style(task).color256(39).italic());
                return Ok(());
            }
            QueryOutcome::Count(total) => {
                let per_page = self.adapter.items_per_page();
                let depth_cap = self.adapter.max_search_depth().saturating_mul(per_page);
                if total > depth_cap {
                    return Err(EngineError::Fatal(format!(
                        "{total} items match {task:?}, more than the {depth_cap} the site can page \
                         through; narrow the query"
                    )));
                }
                let page_count = total.div_ceil(per_page);
                let (start, end) = self.locate_scan_range(task, index, count, page_count)?;
                debug!("{task:?}: scanning pages {start}..={end} of {page_count}");
                self.fetch_span(task, start, end)?
            }
            QueryOutcome::Single(page) => {
                // The site answered the count query with the item itself.
                self.adapter.page_records(&page)?
            }
        };

        self.progress.scan(index, count, Phase::Filtering1);
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for record in records {
            let id = self.adapter.item_id(&record)?;
            ctx.items_seen.insert(id);
            let item = ScannedItem::new(self.adapter.as_ref(), id, record);
            if seen.insert(item.full_id.clone()) {
                items.push(item);
            }
        }
        info!(
            "{} items scanned for {}",
            items.len(),
            style(task).color256(39).italic()
        );

        self.progress.scan(index, count, Phase::Filtering2);
        let filter = ItemFilter::new(
            self.adapter.as_ref(),
            &self.sender,
            &self.config,
            &self.cancel,
        );
        let mut filter_ctx = FilterContext {
            task_index: index,
            collected: &ctx.collected_ids,
            excluded: &mut ctx.excluded,
            pending_parents: &mut ctx.pending_parents,
            exclusion_groups: groups,
        };
        filter.run(&mut items, &mut filter_ctx)?;

        self.progress.scan(index, count, Phase::Filtering3);
        self.extract_infos(&items, ctx);

        self.progress.scan(index, count, Phase::Filtering4);
        self.discover_parents(&items, ctx);

        for item in items {
            if ctx.collected_ids.insert(item.full_id.clone()) {
                ctx.collected.push(item);
            }
        }
        Ok(())
    }

    /// Narrows `[0, page_count-1]` with one boundary search per active date
    /// bound; an irrelevant bound skips its search and its fetches.
    fn locate_scan_range(
        &self,
        task: &str,
        index: usize,
        count: usize,
        page_count: usize,
    ) -> Result<(usize, usize), EngineError> {
        let mut start = 0usize;
        let mut end = page_count - 1;

        self.progress.scan(index, count, Phase::ScanningPages1);
        if !self.config.max_date_irrelevant() {
            let max_date = self.config.max_date;
            let mut probe = |page: usize, pick: ProbePick| {
                self.page_probe_date(task, page, pick)
                    .map(|date| date <= max_date)
            };
            start = locate_boundary_page(BoundarySide::Lowest, 0, end, &mut probe, &self.cancel)?;
        }

        self.progress.scan(index, count, Phase::ScanningPages2);
        if !self.config.min_date_irrelevant() {
            let min_date = self.config.min_date;
            let mut probe = |page: usize, pick: ProbePick| {
                self.page_probe_date(task, page, pick)
                    .map(|date| date >= min_date)
            };
            end = locate_boundary_page(BoundarySide::Highest, start, end, &mut probe, &self.cancel)?;
        }

        Ok((start, end))
    }

    fn page_probe_date(
        &self,
        task: &str,
        page: usize,
        pick: ProbePick,
    ) -> Result<NaiveDate, EngineError> {
        let records = self.fetch_page_records(task, page)?;
        let record = match pick {
            ProbePick::First => records.first(),
            ProbePick::Last => records.last(),
        }
        .ok_or_else(|| {
            EngineError::Fatal(format!("page {page} of {task:?} returned no records"))
        })?;
        self.adapter.post_date(&self.sender, record, &self.cancel)
    }

    fn fetch_page_records(&self, task: &str, page: usize) -> Result<Vec<ItemRecord>, EngineError> {
        let address = self.adapter.page_address(task, page);
        let body = self.sender.fetch_text(&address, None, true, &self.cancel)?;
        let doc = self.adapter.parse_page(&body)?;
        self.adapter.page_records(&doc)
    }

    /// Fetches pages `[start..=end]`, pooled when threads allow, reassembled
    /// in page order. Any failed page fails the task.
    fn fetch_span(
        &self,
        task: &str,
        start: usize,
        end: usize,
    ) -> Result<Vec<ItemRecord>, EngineError> {
        let pages: Vec<usize> = (start..=end).collect();
        let gathered: Mutex<BTreeMap<usize, Vec<ItemRecord>>> = Mutex::new(BTreeMap::new());
        let failure: Mutex<Option<EngineError>> = Mutex::new(None);

        if self.config.threads > 1 && pages.len() > 1 {
            let workers = (self.config.threads / 2).max(2);
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()
                .map_err(|e| EngineError::Fatal(format!("page pool: {e}")))?;
            pool.scope(|scope| {
                for page in &pages {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    let gathered = &gathered;
                    let failure = &failure;
                    scope.spawn(move |_| {
                        if failure.lock().is_some() {
                            return;
                        }
                        match self.fetch_page_records(task, *page) {
                            Ok(records) => {
                                gathered.lock().insert(*page, records);
                            }
                            Err(err) => {
                                let mut slot = failure.lock();
                                if slot.is_none() {
                                    *slot = Some(err);
                                }
                            }
                        }
                    });
                }
            });
        } else {
            for page in &pages {
                self.cancel.check()?;
                let records = self.fetch_page_records(task, *page)?;
                gathered.lock().insert(*page, records);
            }
        }

        self.cancel.check()?;
        if let Some(err) = failure.into_inner() {
            return Err(err);
        }
        Ok(gathered.into_inner().into_values().flatten().collect())
    }

    /// Info extraction tolerates per-item failures; a failed item keeps a
    /// minimal record instead of aborting the task.
    fn extract_infos(&self, items: &[ScannedItem], ctx: &RunContext) {
        if items.is_empty() {
            return;
        }
        let extract = |item: &ScannedItem| {
            let info = match self
                .adapter
                .item_info(&self.sender, &item.record, &self.cancel)
            {
                Ok(info) => info,
                Err(err) => {
                    debug!(
                        "{}: info extraction failed ({err}); keeping a minimal record",
                        item.full_id
                    );
                    ItemInfo::minimal(item.id)
                }
            };
            ctx.infos.lock().insert(item.full_id.clone(), info);
        };

        if self.adapter.metadata_is_local() && self.config.threads > 1 && items.len() > 1 {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.threads)
                .build()
            {
                Ok(pool) => pool.install(|| items.par_iter().for_each(extract)),
                Err(err) => {
                    warn!("Info pool unavailable ({err}); extracting sequentially");
                    items.iter().for_each(extract);
                }
            }
        } else {
            items.iter().for_each(extract);
        }
    }

    /// Items pointing at a parent, or flagged as parents themselves, queue a
    /// `parent<sep><id>` follow-up task. Parents already scanned or already
    /// followed up never re-enter the queue.
    fn discover_parents(&self, items: &[ScannedItem], ctx: &mut RunContext) {
        for item in items {
            if let Some(parent) = self.adapter.parent_id(&item.record) {
                if !ctx.items_seen.contains(&parent) && !ctx.known_parents.contains(&parent) {
                    ctx.pending_parents.insert(parent);
                }
            }
            if self.adapter.has_children(&item.record) && !ctx.known_parents.contains(&item.id) {
                ctx.pending_parents.insert(item.id);
            }
        }
        if ctx.pending_parents.is_empty() {
            return;
        }
        let mut fresh: Vec<i64> = ctx.pending_parents.drain().collect();
        fresh.sort_unstable();
        for parent in fresh {
            ctx.known_parents.insert(parent);
            let follow_up = format!("parent{}{parent}", self.adapter.id_value_sep());
            debug!("Queueing follow-up {follow_up:?}");
            ctx.queue.push_back(follow_up);
        }
    }

    /// The final phase: newest N when limited, dispatched oldest-first to a
    /// pool of the configured width.
    fn download_all(&self, ctx: &mut RunContext) -> Result<(), EngineError> {
        self.cancel.check()?;
        if ctx.collected.is_empty() {
            info!("Nothing to download");
            return Ok(());
        }

        ctx.collected.sort_by(|a, b| b.id.cmp(&a.id));
        if let Some(limit) = self.config.download_limit {
            if ctx.collected.len() > limit {
                let trimmed = ctx.collected.len() - limit;
                ctx.collected.truncate(limit);
                info!("Download limit keeps the {limit} most recent items ({trimmed} trimmed)");
            }
        }
        ctx.collected.reverse();

        fs::create_dir_all(&self.config.dest)?;
        let total = ctx.collected.len();
        info!(
            "Downloading {} items with {} threads",
            style(total).color256(39),
            self.config.threads
        );

        let done = AtomicUsize::new(0);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.threads)
            .build()
            .map_err(|e| EngineError::Fatal(format!("download pool: {e}")))?;
        let shared: &RunContext = ctx;
        pool.scope(|scope| {
            for item in &shared.collected {
                if self.cancel.is_cancelled() {
                    break;
                }
                let done = &done;
                scope.spawn(move |_| {
                    match self.process_item(item, shared) {
                        Ok(()) => shared.counters.lock().downloaded += 1,
                        Err(EngineError::Interrupted) => {}
                        Err(err) => {
                            warn!("{}: {err}", item.full_id);
                            let mut counters = shared.counters.lock();
                            counters.failed += 1;
                            counters.failed_ids.push(item.full_id.clone());
                        }
                    }
                    let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                    self.progress.download(finished, total);
                });
            }
        });
        self.cancel.check()?;

        {
            let counters = ctx.counters.lock();
            info!(
                "{} of {} items downloaded",
                style(counters.downloaded).color256(39),
                total
            );
            if !counters.failed_ids.is_empty() {
                warn!("Failed items: {}", counters.failed_ids.join(", "));
            }
        }
        self.write_info_dumps(ctx)?;
        Ok(())
    }

    fn process_item(&self, item: &ScannedItem, ctx: &RunContext) -> Result<(), EngineError> {
        self.cancel.check()?;
        let (url, ext) = if self.adapter.is_video(&item.record) {
            self.adapter
                .video_address(&self.sender, &item.record, &self.cancel)?
        } else {
            self.adapter.image_address(&item.record)?
        };
        let file = self.config.dest.join(format!("{}.{ext}", item.full_id));
        let chunked = self.adapter.downloads_in_chunks(&ext);
        let outcome = self
            .sender
            .download_file(&url, &file, self.config.mode, chunked, &self.cancel)?;
        if let Some(size) = outcome.expected_size {
            if let Some(info) = ctx.infos.lock().get_mut(&item.full_id) {
                info.expected_size = Some(size);
            }
        }
        trace!(
            "{}: {} ({} bytes, {} retries)",
            item.full_id, outcome.note, outcome.actual_size, outcome.retries
        );
        Ok(())
    }

    /// Machine-readable and human-readable dumps of everything collected,
    /// in dispatch order.
    fn write_info_dumps(&self, ctx: &RunContext) -> Result<(), EngineError> {
        let infos = ctx.infos.lock();
        let ordered: Vec<&ItemInfo> = ctx
            .collected
            .iter()
            .filter_map(|item| infos.get(&item.full_id))
            .collect();
        let json = serde_json::to_string_pretty(&ordered)
            .map_err(|e| EngineError::Fatal(format!("info dump serialization: {e}")))?;
        fs::write(self.config.dest.join("!items_info.json"), json)?;

        let mut text = String::new();
        for info in &ordered {
            text.push_str(&info.to_string());
            text.push('\n');
        }
        fs::write(self.config.dest.join("!items_info.txt"), text)?;
        trace!("Item info dumps written to {:?}", self.config.dest);
        Ok(())
    }

    /// No scan, no downloads: fetch the newest unfiltered page and report
    /// the first id on it.
    fn report_max_id(&self) -> Result<(), EngineError> {
        let address = self.adapter.page_address("", 0);
        let body = self.sender.fetch_text(&address, None, false, &self.cancel)?;
        let page = self.adapter.parse_page(&body)?;
        let records = self.adapter.page_records(&page)?;
        let first = records.first().ok_or_else(|| {
            EngineError::Adapter(String::from("newest-first page returned no records"))
        })?;
        let id = self.adapter.item_id(first)?;
        info!(
            "Newest item id on {}: {}",
            self.adapter.name(),
            style(id).color256(39)
        );
        Ok(())
    }
}
