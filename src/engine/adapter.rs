//! The contract every supported site implements.
//!
//! The engine never interprets a page body or an item record itself; it
//! routes them through a [SiteAdapter], which knows the site's addressing
//! scheme and payload layout. Records stay opaque between adapter calls so
//! JSON sites and scraped-HTML sites run through the same pipeline.

use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;

use crate::engine::EngineError;
use crate::engine::cancel::CancelToken;
use crate::engine::sender::RequestSender;

/// A fetched listing page in whatever shape the site returned it.
#[derive(Clone, Debug)]
pub(crate) enum PageDoc {
    Text(String),
    Json(Value),
}

impl PageDoc {
    pub(crate) fn as_json(&self) -> Result<&Value, EngineError> {
        match self {
            PageDoc::Json(value) => Ok(value),
            PageDoc::Text(_) => Err(EngineError::Adapter(String::from(
                "expected a JSON page document",
            ))),
        }
    }
}

/// One item entry lifted out of a listing page. Only the adapter that
/// produced it knows the layout.
#[derive(Clone, Debug)]
pub(crate) enum ItemRecord {
    Text(String),
    Json(Value),
}

impl ItemRecord {
    pub(crate) fn as_json(&self) -> Result<&Value, EngineError> {
        match self {
            ItemRecord::Json(value) => Ok(value),
            ItemRecord::Text(_) => Err(EngineError::Adapter(String::from(
                "expected a JSON item record",
            ))),
        }
    }
}

/// Result of the initial count query: either a matched-item count or, when
/// the site redirected a single-match query straight to the item, the page
/// that came back.
#[derive(Clone, Debug)]
pub(crate) enum QueryOutcome {
    Count(usize),
    Single(PageDoc),
}

/// An item that survived page scanning, keyed by its site-qualified id.
#[derive(Clone, Debug)]
pub(crate) struct ScannedItem {
    pub(crate) full_id: String,
    pub(crate) id: i64,
    pub(crate) record: ItemRecord,
}

impl ScannedItem {
    pub(crate) fn new(adapter: &dyn SiteAdapter, id: i64, record: ItemRecord) -> Self {
        ScannedItem {
            full_id: format!("{}{}", adapter.id_prefix(), id),
            id,
            record,
        }
    }
}

/// One comment on an item, kept in posting order.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct Comment {
    pub(crate) author: String,
    pub(crate) body: String,
}

/// Everything worth keeping about a grabbed item, written to the info dumps
/// at the end of a run.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct ItemInfo {
    pub(crate) id: i64,
    pub(crate) width: i64,
    pub(crate) height: i64,
    pub(crate) tags: String,
    pub(crate) ext: String,
    pub(crate) source: String,
    pub(crate) score: i64,
    pub(crate) comments: Vec<Comment>,
    /// Byte size reported by the server, filled in after the download.
    pub(crate) expected_size: Option<u64>,
}

impl ItemInfo {
    /// Fallback info for a record whose extraction failed.
    pub(crate) fn minimal(id: i64) -> Self {
        ItemInfo {
            id,
            width: 0,
            height: 0,
            tags: String::new(),
            ext: String::new(),
            source: String::new(),
            score: 0,
            comments: Vec::new(),
            expected_size: None,
        }
    }
}

impl fmt::Display for ItemInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "id: {}", self.id)?;
        writeln!(f, "dimensions: {}x{}", self.width, self.height)?;
        writeln!(f, "extension: {}", self.ext)?;
        writeln!(f, "score: {}", self.score)?;
        writeln!(f, "source: {}", self.source)?;
        writeln!(f, "tags: {}", self.tags)?;
        if let Some(size) = self.expected_size {
            writeln!(f, "size: {size} bytes")?;
        }
        if !self.comments.is_empty() {
            writeln!(f, "comments:")?;
            for comment in &self.comments {
                writeln!(f, "  {}: {}", comment.author, comment.body)?;
            }
        }
        Ok(())
    }
}

/// Per-site behavior the engine calls through. One instance per module name;
/// implementations carry no per-run state.
pub(crate) trait SiteAdapter: Send + Sync {
    /// Module name the `-module` option selects.
    fn name(&self) -> &'static str;

    /// Character joining tags in a composed task string.
    fn tag_concat(&self) -> char;

    /// Separator between a meta key and its value, `parent:123` style.
    fn id_value_sep(&self) -> char;

    /// Prefix qualifying a numeric id across sites, `full_id = prefix + id`.
    fn id_prefix(&self) -> &'static str;

    /// Items the site returns per listing page.
    fn items_per_page(&self) -> usize;

    /// Deepest page the site will serve before refusing the query.
    fn max_search_depth(&self) -> usize;

    /// Address answering "how many items match these tags".
    fn count_address(&self, tags: &str) -> String;

    /// Address of one listing page, zero-based from the newest items.
    fn page_address(&self, tags: &str, page: usize) -> String;

    /// Runs the count query. Sites that redirect single-match queries to the
    /// item itself report the fetched page instead of a count.
    fn query_size_or_page(
        &self,
        sender: &RequestSender,
        tags: &str,
        cancel: &CancelToken,
    ) -> Result<QueryOutcome, EngineError>;

    /// Parses a fetched listing page body.
    fn parse_page(&self, body: &str) -> Result<PageDoc, EngineError>;

    /// All item records of a page, newest first.
    fn page_records(&self, page: &PageDoc) -> Result<Vec<ItemRecord>, EngineError>;

    /// Numeric id of a record.
    fn item_id(&self, record: &ItemRecord) -> Result<i64, EngineError>;

    /// Address of the record's own page on the site.
    fn item_address(&self, record: &ItemRecord) -> Result<String, EngineError>;

    /// Whether the record is a video rather than a still image.
    fn is_video(&self, record: &ItemRecord) -> bool;

    /// Fetches the record's detail document. Sites whose listing records
    /// already carry everything return the record unchanged.
    fn fetch_item_detail(
        &self,
        _sender: &RequestSender,
        record: &ItemRecord,
        _cancel: &CancelToken,
    ) -> Result<ItemRecord, EngineError> {
        Ok(record.clone())
    }

    /// Post date of a record, fetching the detail document when the listing
    /// record does not carry one.
    fn post_date(
        &self,
        sender: &RequestSender,
        record: &ItemRecord,
        cancel: &CancelToken,
    ) -> Result<NaiveDate, EngineError>;

    /// Full-size image URL and its extension.
    fn image_address(&self, record: &ItemRecord) -> Result<(String, String), EngineError>;

    /// Video URL and its extension; may need the detail document.
    fn video_address(
        &self,
        sender: &RequestSender,
        record: &ItemRecord,
        cancel: &CancelToken,
    ) -> Result<(String, String), EngineError>;

    /// Extracts the dump-worthy info of a record.
    fn item_info(
        &self,
        sender: &RequestSender,
        record: &ItemRecord,
        cancel: &CancelToken,
    ) -> Result<ItemInfo, EngineError>;

    /// Tags attached to a record, lowercased.
    fn item_tags(&self, record: &ItemRecord) -> Vec<String>;

    /// Whether the record is flagged as having child items.
    fn has_children(&self, record: &ItemRecord) -> bool;

    /// Parent id the record points at, when it has one.
    fn parent_id(&self, record: &ItemRecord) -> Option<i64>;

    /// True when [SiteAdapter::item_info] never touches the network, which
    /// lets the engine extract in a worker pool.
    fn metadata_is_local(&self) -> bool;

    /// Whether files with this extension download in ranged chunks.
    fn downloads_in_chunks(&self, ext: &str) -> bool {
        matches!(ext, "mp4" | "webm" | "zip")
    }

    /// Site-specific filter pass over scanned items. Default keeps everything.
    fn site_filter(&self, _items: &mut Vec<ScannedItem>) {}
}
