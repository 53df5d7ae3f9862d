//! Post-scan filtering pipeline.
//!
//! Every task's scanned items pass through the same fixed stage order: date
//! re-check at the list's ends, media type, cross-task dedup, on-disk
//! existence, excluded tag groups, then the adapter's own pass. Each stage
//! activates only when its inputs call for it, logs what it removed, and
//! leaves the list ready for the next stage, so running the pipeline twice
//! removes nothing the second time.

use std::collections::HashSet;

use walkdir::WalkDir;

use crate::engine::EngineError;
use crate::engine::adapter::{ScannedItem, SiteAdapter};
use crate::engine::boundary::{BoundarySide, ProbePick, locate_boundary_page};
use crate::engine::cancel::CancelToken;
use crate::engine::io::RunConfig;
use crate::engine::sender::RequestSender;

/// Cross-task state the pipeline reads and feeds. Owned by the run, lent to
/// the pipeline per task.
pub(crate) struct FilterContext<'a> {
    /// Position of the current task in the work queue, zero-based.
    pub(crate) task_index: usize,
    /// Full ids already merged into the cross-task aggregate.
    pub(crate) collected: &'a HashSet<String>,
    /// Permanently excluded full ids; grows when tag groups strike items.
    pub(crate) excluded: &'a mut HashSet<String>,
    /// Parent ids queued for follow-up tasks; struck items leave it.
    pub(crate) pending_parents: &'a mut HashSet<i64>,
    /// AND-groups of tag patterns from the query splitter.
    pub(crate) exclusion_groups: &'a [Vec<String>],
}

pub(crate) struct ItemFilter<'a> {
    adapter: &'a dyn SiteAdapter,
    sender: &'a RequestSender,
    config: &'a RunConfig,
    cancel: &'a CancelToken,
}

impl<'a> ItemFilter<'a> {
    pub(crate) fn new(
        adapter: &'a dyn SiteAdapter,
        sender: &'a RequestSender,
        config: &'a RunConfig,
        cancel: &'a CancelToken,
    ) -> Self {
        ItemFilter {
            adapter,
            sender,
            config,
            cancel,
        }
    }

    /// Runs all stages in order over `items`.
    pub(crate) fn run(
        &self,
        items: &mut Vec<ScannedItem>,
        ctx: &mut FilterContext,
    ) -> Result<(), EngineError> {
        let removed = self.date_tail(items)?;
        log_removed("date bounds", removed, items.len());

        let removed = self.media(items);
        log_removed("media type", removed, items.len());

        let removed = self.cross_task(items, ctx);
        log_removed("already collected", removed, items.len());

        let removed = self.on_disk(items);
        log_removed("already on disk", removed, items.len());

        let removed = self.tag_groups(items, ctx);
        log_removed("excluded tag groups", removed, items.len());

        let before = items.len();
        self.adapter.site_filter(items);
        log_removed("site filter", before - items.len(), items.len());

        Ok(())
    }

    /// Page-level boundary search is approximate, so the ends of the list
    /// can hold items outside the date range. Re-check only there, with the
    /// same locator at item granularity; the middle is trusted.
    fn date_tail(&self, items: &mut Vec<ScannedItem>) -> Result<usize, EngineError> {
        if !self.config.date_filter_active() || items.is_empty() {
            return Ok(0);
        }
        let before = items.len();

        if !self.config.max_date_irrelevant() {
            let window = (self.adapter.items_per_page() * 2).min(items.len());
            let max_date = self.config.max_date;
            if window <= 2 {
                // The locator returns an endpoint unprobed on ranges this
                // small; walk the window directly.
                let mut keep_from = 0;
                while keep_from < window && self.item_date(&items[keep_from])? > max_date {
                    keep_from += 1;
                }
                items.drain(..keep_from);
            } else {
                let mut probe = |idx: usize, _pick: ProbePick| {
                    self.adapter
                        .post_date(self.sender, &items[idx].record, self.cancel)
                        .map(|date| date <= max_date)
                };
                let found = locate_boundary_page(
                    BoundarySide::Lowest,
                    0,
                    window - 1,
                    &mut probe,
                    self.cancel,
                )?;
                // The clamp can land on a failing item; cut past it then.
                let keep_from = if self.item_date(&items[found])? <= max_date {
                    found
                } else {
                    found + 1
                };
                items.drain(..keep_from);
            }
        }

        if !self.config.min_date_irrelevant() && !items.is_empty() {
            let window = (self.adapter.items_per_page() * 2).min(items.len());
            let offset = items.len() - window;
            let min_date = self.config.min_date;
            if window <= 2 {
                let mut keep_to = items.len();
                while keep_to > offset && self.item_date(&items[keep_to - 1])? < min_date {
                    keep_to -= 1;
                }
                items.truncate(keep_to);
            } else {
                let mut probe = |idx: usize, _pick: ProbePick| {
                    self.adapter
                        .post_date(self.sender, &items[offset + idx].record, self.cancel)
                        .map(|date| date >= min_date)
                };
                let found = locate_boundary_page(
                    BoundarySide::Highest,
                    0,
                    window - 1,
                    &mut probe,
                    self.cancel,
                )?;
                let keep_to = if self.item_date(&items[offset + found])? >= min_date {
                    offset + found + 1
                } else {
                    offset + found
                };
                items.truncate(keep_to);
            }
        }

        Ok(before - items.len())
    }

    fn item_date(&self, item: &ScannedItem) -> Result<chrono::NaiveDate, EngineError> {
        self.adapter.post_date(self.sender, &item.record, self.cancel)
    }

    fn media(&self, items: &mut Vec<ScannedItem>) -> usize {
        if !self.config.skip_videos && !self.config.skip_images {
            return 0;
        }
        let before = items.len();
        items.retain(|item| {
            let video = self.adapter.is_video(&item.record);
            if video {
                !self.config.skip_videos
            } else {
                !self.config.skip_images
            }
        });
        before - items.len()
    }

    fn cross_task(&self, items: &mut Vec<ScannedItem>, ctx: &FilterContext) -> usize {
        if ctx.task_index == 0 {
            return 0;
        }
        let before = items.len();
        items.retain(|item| {
            !ctx.collected.contains(&item.full_id) && !ctx.excluded.contains(&item.full_id)
        });
        before - items.len()
    }

    /// One destination-directory walk per task; an item whose
    /// `"<full_id>."` stem is already present is dropped.
    fn on_disk(&self, items: &mut Vec<ScannedItem>) -> usize {
        let before = items.len();
        let mut stems: HashSet<String> = HashSet::new();
        for entry in WalkDir::new(&self.config.dest)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() {
                let name = entry.file_name().to_string_lossy();
                if let Some((stem, _)) = name.rsplit_once('.') {
                    stems.insert(stem.to_owned());
                }
            }
        }
        items.retain(|item| !stems.contains(&item.full_id));
        before - items.len()
    }

    /// An item matching every pattern of any exclusion group is dropped,
    /// struck from the pending parent set, and excluded for the rest of the
    /// run so follow-up tasks never resurrect it.
    fn tag_groups(&self, items: &mut Vec<ScannedItem>, ctx: &mut FilterContext) -> usize {
        if ctx.exclusion_groups.is_empty() {
            return 0;
        }
        let before = items.len();
        let mut struck: Vec<(i64, String)> = Vec::new();
        items.retain(|item| {
            let tags = self.adapter.item_tags(&item.record);
            let hit = ctx.exclusion_groups.iter().any(|group| {
                group
                    .iter()
                    .all(|pattern| tags.iter().any(|tag| wildcard_match(pattern, tag)))
            });
            if hit {
                struck.push((item.id, item.full_id.clone()));
            }
            !hit
        });
        for (id, full_id) in struck {
            ctx.pending_parents.remove(&id);
            ctx.excluded.insert(full_id);
        }
        before - items.len()
    }
}

fn log_removed(stage: &str, removed: usize, remaining: usize) {
    if removed > 0 {
        info!("Filtered {removed} items ({stage}); {remaining} remain");
    }
}

/// `*`-wildcard match over characters; everything else is literal.
pub(crate) fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::NaiveDate;
    use serde_json::json;
    use tempfile::tempdir;

    use crate::engine::adapter::{ItemInfo, ItemRecord, PageDoc, QueryOutcome};
    use crate::engine::io::FetchTuning;
    use crate::engine::sender::{BackendError, FetchedBody, HeadInfo, HttpBackend};

    /// Adapter over synthetic JSON records; date probes are counted so
    /// tests can assert the date stage stayed quiet.
    #[derive(Default)]
    struct FakeAdapter {
        date_probes: AtomicUsize,
    }

    impl SiteAdapter for FakeAdapter {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn tag_concat(&self) -> char {
            '+'
        }

        fn id_value_sep(&self) -> char {
            ':'
        }

        fn id_prefix(&self) -> &'static str {
            "fk"
        }

        fn items_per_page(&self) -> usize {
            3
        }

        fn max_search_depth(&self) -> usize {
            1000
        }

        fn count_address(&self, tags: &str) -> String {
            format!("http://fake/count?tags={tags}")
        }

        fn page_address(&self, tags: &str, page: usize) -> String {
            format!("http://fake/page/{page}?tags={tags}")
        }

        fn query_size_or_page(
            &self,
            _sender: &RequestSender,
            _tags: &str,
            _cancel: &CancelToken,
        ) -> Result<QueryOutcome, EngineError> {
            unimplemented!("not exercised by filter tests")
        }

        fn parse_page(&self, _body: &str) -> Result<PageDoc, EngineError> {
            unimplemented!("not exercised by filter tests")
        }

        fn page_records(&self, _page: &PageDoc) -> Result<Vec<ItemRecord>, EngineError> {
            unimplemented!("not exercised by filter tests")
        }

        fn item_id(&self, record: &ItemRecord) -> Result<i64, EngineError> {
            Ok(record.as_json()?["id"].as_i64().unwrap_or(0))
        }

        fn item_address(&self, _record: &ItemRecord) -> Result<String, EngineError> {
            Ok(String::new())
        }

        fn is_video(&self, record: &ItemRecord) -> bool {
            record
                .as_json()
                .map(|v| v["video"].as_bool().unwrap_or(false))
                .unwrap_or(false)
        }

        fn post_date(
            &self,
            _sender: &RequestSender,
            record: &ItemRecord,
            _cancel: &CancelToken,
        ) -> Result<NaiveDate, EngineError> {
            self.date_probes.fetch_add(1, Ordering::SeqCst);
            let raw = record.as_json()?["date"].as_str().unwrap_or_default().to_owned();
            NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                .map_err(|e| EngineError::Adapter(e.to_string()))
        }

        fn image_address(&self, _record: &ItemRecord) -> Result<(String, String), EngineError> {
            Ok((String::from("http://fake/img.png"), String::from("png")))
        }

        fn video_address(
            &self,
            _sender: &RequestSender,
            _record: &ItemRecord,
            _cancel: &CancelToken,
        ) -> Result<(String, String), EngineError> {
            Ok((String::from("http://fake/vid.webm"), String::from("webm")))
        }

        fn item_info(
            &self,
            _sender: &RequestSender,
            record: &ItemRecord,
            _cancel: &CancelToken,
        ) -> Result<ItemInfo, EngineError> {
            Ok(ItemInfo::minimal(self.item_id(record)?))
        }

        fn item_tags(&self, record: &ItemRecord) -> Vec<String> {
            record
                .as_json()
                .ok()
                .and_then(|v| v["tags"].as_str())
                .map(|s| s.split_whitespace().map(str::to_owned).collect())
                .unwrap_or_default()
        }

        fn has_children(&self, _record: &ItemRecord) -> bool {
            false
        }

        fn parent_id(&self, _record: &ItemRecord) -> Option<i64> {
            None
        }

        fn metadata_is_local(&self) -> bool {
            true
        }
    }

    /// Transport that must never be reached.
    struct NoNetwork;

    impl HttpBackend for NoNetwork {
        fn head(&self, url: &str) -> Result<HeadInfo, BackendError> {
            panic!("unexpected HEAD {url}")
        }

        fn get(&self, url: &str, _range: Option<(u64, u64)>) -> Result<FetchedBody, BackendError> {
            panic!("unexpected GET {url}")
        }
    }

    fn offline_sender() -> RequestSender {
        RequestSender::with_backend(Arc::new(NoNetwork), FetchTuning::default())
    }

    fn base_config() -> RunConfig {
        let mut config = RunConfig::for_tests();
        // A destination that does not exist keeps the disk stage inert.
        config.dest = std::env::temp_dir().join("tagrip-filter-tests-void");
        config
    }

    fn item(adapter: &FakeAdapter, id: i64, date: &str, tags: &str, video: bool) -> ScannedItem {
        let record = ItemRecord::Json(json!({
            "id": id,
            "date": date,
            "tags": tags,
            "video": video,
        }));
        ScannedItem::new(adapter, id, record)
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    struct Ctx {
        collected: HashSet<String>,
        excluded: HashSet<String>,
        pending_parents: HashSet<i64>,
        groups: Vec<Vec<String>>,
    }

    impl Ctx {
        fn new() -> Self {
            Ctx {
                collected: HashSet::new(),
                excluded: HashSet::new(),
                pending_parents: HashSet::new(),
                groups: Vec::new(),
            }
        }

        fn borrow(&mut self, task_index: usize) -> FilterContext<'_> {
            FilterContext {
                task_index,
                collected: &self.collected,
                excluded: &mut self.excluded,
                pending_parents: &mut self.pending_parents,
                exclusion_groups: &self.groups,
            }
        }
    }

    #[test]
    fn test_media_filter_drops_flagged_kinds() {
        let adapter = FakeAdapter::default();
        let sender = offline_sender();
        let token = CancelToken::new();
        let mut config = base_config();
        config.skip_videos = true;

        let mut items = vec![
            item(&adapter, 1, "2024-01-01", "a", false),
            item(&adapter, 2, "2024-01-01", "a", true),
            item(&adapter, 3, "2024-01-01", "a", false),
        ];
        let filter = ItemFilter::new(&adapter, &sender, &config, &token);
        let mut ctx = Ctx::new();
        filter.run(&mut items, &mut ctx.borrow(0)).unwrap();
        assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), vec![1, 3]);

        let mut config = base_config();
        config.skip_images = true;
        let mut items = vec![
            item(&adapter, 1, "2024-01-01", "a", false),
            item(&adapter, 2, "2024-01-01", "a", true),
        ];
        let filter = ItemFilter::new(&adapter, &sender, &config, &token);
        filter.run(&mut items, &mut ctx.borrow(0)).unwrap();
        assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_date_stage_trims_both_ends() {
        let adapter = FakeAdapter::default();
        let sender = offline_sender();
        let token = CancelToken::new();
        let mut config = base_config();
        config.min_date = date("2024-01-03");
        config.max_date = date("2024-01-10");

        // Newest first: days 12 down to 1.
        let mut items: Vec<ScannedItem> = (0..12)
            .map(|i| {
                let day = 12 - i;
                item(&adapter, day, &format!("2024-01-{day:02}"), "a", false)
            })
            .collect();

        let filter = ItemFilter::new(&adapter, &sender, &config, &token);
        let mut ctx = Ctx::new();
        filter.run(&mut items, &mut ctx.borrow(0)).unwrap();

        let ids: Vec<i64> = items.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![10, 9, 8, 7, 6, 5, 4, 3]);
    }

    #[test]
    fn test_date_stage_drops_both_of_two_items_past_max() {
        let adapter = FakeAdapter::default();
        let sender = offline_sender();
        let token = CancelToken::new();
        let mut config = base_config();
        config.max_date = date("2024-01-10");
        let filter = ItemFilter::new(&adapter, &sender, &config, &token);
        let mut ctx = Ctx::new();

        let mut items = vec![
            item(&adapter, 20, "2024-01-20", "a", false),
            item(&adapter, 19, "2024-01-19", "a", false),
        ];
        filter.run(&mut items, &mut ctx.borrow(0)).unwrap();
        assert!(items.is_empty());

        // A compliant second item still ends the cut after the first.
        let mut items = vec![
            item(&adapter, 20, "2024-01-20", "a", false),
            item(&adapter, 9, "2024-01-09", "a", false),
        ];
        filter.run(&mut items, &mut ctx.borrow(0)).unwrap();
        assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), vec![9]);
    }

    #[test]
    fn test_date_stage_drops_both_of_two_items_before_min() {
        let adapter = FakeAdapter::default();
        let sender = offline_sender();
        let token = CancelToken::new();
        let mut config = base_config();
        config.min_date = date("2024-03-01");

        let mut items = vec![
            item(&adapter, 21, "2024-01-21", "a", false),
            item(&adapter, 20, "2024-01-20", "a", false),
        ];
        let filter = ItemFilter::new(&adapter, &sender, &config, &token);
        let mut ctx = Ctx::new();
        filter.run(&mut items, &mut ctx.borrow(0)).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn test_date_stage_stays_quiet_without_bounds() {
        let adapter = FakeAdapter::default();
        let sender = offline_sender();
        let token = CancelToken::new();
        let config = base_config();

        let mut items = vec![item(&adapter, 1, "1990-06-06", "a", false)];
        let filter = ItemFilter::new(&adapter, &sender, &config, &token);
        let mut ctx = Ctx::new();
        filter.run(&mut items, &mut ctx.borrow(0)).unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(adapter.date_probes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cross_task_dedup_starts_with_the_second_task() {
        let adapter = FakeAdapter::default();
        let sender = offline_sender();
        let token = CancelToken::new();
        let config = base_config();
        let filter = ItemFilter::new(&adapter, &sender, &config, &token);

        let mut ctx = Ctx::new();
        ctx.collected.insert(String::from("fk1"));

        // First task keeps everything even when the aggregate knows the id.
        let mut items = vec![item(&adapter, 1, "2024-01-01", "a", false)];
        filter.run(&mut items, &mut ctx.borrow(0)).unwrap();
        assert_eq!(items.len(), 1);

        // From the second task on it is dropped.
        let mut items = vec![
            item(&adapter, 1, "2024-01-01", "a", false),
            item(&adapter, 2, "2024-01-01", "a", false),
        ];
        filter.run(&mut items, &mut ctx.borrow(1)).unwrap();
        assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_on_disk_stems_are_skipped() {
        let adapter = FakeAdapter::default();
        let sender = offline_sender();
        let token = CancelToken::new();
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("fk7.png"), b"x").unwrap();
        std::fs::write(dir.path().join("fk9.png.part"), b"x").unwrap();
        let mut config = base_config();
        config.dest = dir.path().to_path_buf();

        let mut items = vec![
            item(&adapter, 7, "2024-01-01", "a", false),
            item(&adapter, 8, "2024-01-01", "a", false),
            item(&adapter, 9, "2024-01-01", "a", false),
        ];
        let filter = ItemFilter::new(&adapter, &sender, &config, &token);
        let mut ctx = Ctx::new();
        filter.run(&mut items, &mut ctx.borrow(0)).unwrap();

        // 7 exists on disk; the leftover .part of 9 does not count.
        assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), vec![8, 9]);
    }

    #[test]
    fn test_tag_groups_strike_items_and_parents() {
        let adapter = FakeAdapter::default();
        let sender = offline_sender();
        let token = CancelToken::new();
        let config = base_config();
        let filter = ItemFilter::new(&adapter, &sender, &config, &token);

        let mut ctx = Ctx::new();
        ctx.groups = vec![vec![String::from("red_*"), String::from("cat")]];
        ctx.pending_parents.insert(1);
        ctx.pending_parents.insert(2);

        let mut items = vec![
            item(&adapter, 1, "2024-01-01", "red_fur cat", false),
            item(&adapter, 2, "2024-01-01", "red_fur dog", false),
            item(&adapter, 3, "2024-01-01", "blue cat", false),
        ];
        filter.run(&mut items, &mut ctx.borrow(0)).unwrap();

        assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), vec![2, 3]);
        assert!(ctx.excluded.contains("fk1"));
        assert!(!ctx.pending_parents.contains(&1));
        assert!(ctx.pending_parents.contains(&2));
    }

    #[test]
    fn test_pipeline_is_idempotent() {
        let adapter = FakeAdapter::default();
        let sender = offline_sender();
        let token = CancelToken::new();
        let mut config = base_config();
        config.min_date = date("2024-01-03");
        config.max_date = date("2024-01-10");
        config.skip_videos = true;

        let mut items: Vec<ScannedItem> = (0..12)
            .map(|i| {
                let day = 12 - i;
                item(&adapter, day, &format!("2024-01-{day:02}"), "a", day == 6)
            })
            .collect();
        let filter = ItemFilter::new(&adapter, &sender, &config, &token);
        let mut ctx = Ctx::new();
        ctx.groups = vec![vec![String::from("b")]];

        filter.run(&mut items, &mut ctx.borrow(0)).unwrap();
        let after_first: Vec<i64> = items.iter().map(|i| i.id).collect();

        filter.run(&mut items, &mut ctx.borrow(0)).unwrap();
        let after_second: Vec<i64> = items.iter().map(|i| i.id).collect();

        assert_eq!(after_first, after_second);
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*_fur", "red_fur"));
        assert!(wildcard_match("cat", "cat"));
        assert!(wildcard_match("c*t", "coat"));
        assert!(wildcard_match("*", "anything"));
        assert!(!wildcard_match("c*t", "cab"));
        assert!(!wildcard_match("cat", "cats"));
    }
}
