//! Gelbooru-API family: XML count attribute, JSON listing pages, zero-based
//! `pid` page addressing. Serves gelbooru.com and rule34.

use chrono::{DateTime, NaiveDate};
use serde::Deserialize;
use serde_json::Value;

use super::{BoolOrString, NumberOrString, excerpt, parse_xml_count, url_extension};
use crate::engine::EngineError;
use crate::engine::adapter::{ItemInfo, ItemRecord, PageDoc, QueryOutcome, SiteAdapter};
use crate::engine::cancel::CancelToken;
use crate::engine::sender::RequestSender;

const PER_PAGE: usize = 100;

/// Listing record as both deployments serve it. Field encodings drift
/// between versions, hence the flexible scalar types.
#[derive(Debug, Clone, Deserialize)]
struct GelbooruPost {
    id: i64,
    #[serde(default)]
    file_url: String,
    #[serde(default)]
    width: i64,
    #[serde(default)]
    height: i64,
    #[serde(default)]
    tags: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    score: Option<NumberOrString>,
    #[serde(default)]
    change: Option<i64>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    parent_id: Option<NumberOrString>,
    #[serde(default)]
    has_children: Option<BoolOrString>,
}

pub(crate) struct GelbooruAdapter {
    name: &'static str,
    prefix: &'static str,
    base: &'static str,
    max_depth: usize,
}

impl GelbooruAdapter {
    pub(crate) fn gelbooru() -> Self {
        GelbooruAdapter {
            name: "gelbooru",
            prefix: "gb",
            base: "https://gelbooru.com",
            // Anonymous API access refuses pages past the 20000th post.
            max_depth: 200,
        }
    }

    pub(crate) fn rule34() -> Self {
        GelbooruAdapter {
            name: "rule34",
            prefix: "r34",
            base: "https://api.rule34.xxx",
            max_depth: 2000,
        }
    }

    fn post(&self, record: &ItemRecord) -> Result<GelbooruPost, EngineError> {
        serde_json::from_value(record.as_json()?.clone()).map_err(|e| {
            EngineError::Adapter(format!("{}: unreadable post record ({e})", self.name))
        })
    }
}

impl SiteAdapter for GelbooruAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    fn tag_concat(&self) -> char {
        '+'
    }

    fn id_value_sep(&self) -> char {
        ':'
    }

    fn id_prefix(&self) -> &'static str {
        self.prefix
    }

    fn items_per_page(&self) -> usize {
        PER_PAGE
    }

    fn max_search_depth(&self) -> usize {
        self.max_depth
    }

    fn count_address(&self, tags: &str) -> String {
        format!(
            "{}/index.php?page=dapi&s=post&q=index&limit=0&tags={tags}",
            self.base
        )
    }

    fn page_address(&self, tags: &str, page: usize) -> String {
        format!(
            "{}/index.php?page=dapi&s=post&q=index&json=1&limit={PER_PAGE}&pid={page}&tags={tags}",
            self.base
        )
    }

    fn query_size_or_page(
        &self,
        sender: &RequestSender,
        tags: &str,
        cancel: &CancelToken,
    ) -> Result<QueryOutcome, EngineError> {
        let body = sender.fetch_text(&self.count_address(tags), None, true, cancel)?;
        let count = parse_xml_count(&body).ok_or_else(|| {
            EngineError::Adapter(format!(
                "{}: count attribute missing in {:?}",
                self.name,
                excerpt(&body)
            ))
        })?;
        Ok(QueryOutcome::Count(count))
    }

    fn parse_page(&self, body: &str) -> Result<PageDoc, EngineError> {
        let value: Value = serde_json::from_str(body).map_err(|e| {
            EngineError::Adapter(format!("{}: listing page is not JSON ({e})", self.name))
        })?;
        Ok(PageDoc::Json(value))
    }

    /// Older deployments answer with a bare array, newer ones wrap the posts
    /// in an object; a count-only object means an empty page.
    fn page_records(&self, page: &PageDoc) -> Result<Vec<ItemRecord>, EngineError> {
        let root = page.as_json()?;
        let posts: &[Value] = match root {
            Value::Array(entries) => entries,
            Value::Object(map) => match map.get("post") {
                Some(Value::Array(entries)) => entries,
                None => &[],
                Some(other) => {
                    return Err(EngineError::Adapter(format!(
                        "{}: post key holds {other} instead of an array",
                        self.name
                    )));
                }
            },
            other => {
                return Err(EngineError::Adapter(format!(
                    "{}: unexpected listing root {other}",
                    self.name
                )));
            }
        };
        Ok(posts.iter().cloned().map(ItemRecord::Json).collect())
    }

    fn item_id(&self, record: &ItemRecord) -> Result<i64, EngineError> {
        Ok(self.post(record)?.id)
    }

    fn item_address(&self, record: &ItemRecord) -> Result<String, EngineError> {
        Ok(format!(
            "{}/index.php?page=post&s=view&id={}",
            self.base,
            self.item_id(record)?
        ))
    }

    fn is_video(&self, record: &ItemRecord) -> bool {
        self.post(record)
            .ok()
            .and_then(|post| url_extension(&post.file_url))
            .map(|ext| matches!(ext.as_str(), "mp4" | "webm" | "swf"))
            .unwrap_or(false)
    }

    fn post_date(
        &self,
        _sender: &RequestSender,
        record: &ItemRecord,
        _cancel: &CancelToken,
    ) -> Result<NaiveDate, EngineError> {
        let post = self.post(record)?;
        if let Some(raw) = post.created_at.as_deref() {
            if let Ok(stamp) = DateTime::parse_from_str(raw, "%a %b %d %H:%M:%S %z %Y") {
                return Ok(stamp.date_naive());
            }
        }
        if let Some(secs) = post.change {
            if let Some(stamp) = DateTime::from_timestamp(secs, 0) {
                return Ok(stamp.date_naive());
            }
        }
        Err(EngineError::Adapter(format!(
            "{}: post {} carries no usable date",
            self.name, post.id
        )))
    }

    fn image_address(&self, record: &ItemRecord) -> Result<(String, String), EngineError> {
        let post = self.post(record)?;
        if post.file_url.is_empty() {
            return Err(EngineError::Adapter(format!(
                "{}: post {} has no file URL",
                self.name, post.id
            )));
        }
        let ext = url_extension(&post.file_url).ok_or_else(|| {
            EngineError::Adapter(format!(
                "{}: no extension in {:?}",
                self.name, post.file_url
            ))
        })?;
        Ok((post.file_url, ext))
    }

    fn video_address(
        &self,
        _sender: &RequestSender,
        record: &ItemRecord,
        _cancel: &CancelToken,
    ) -> Result<(String, String), EngineError> {
        // The listing record's file URL is the media for videos too.
        self.image_address(record)
    }

    fn item_info(
        &self,
        _sender: &RequestSender,
        record: &ItemRecord,
        _cancel: &CancelToken,
    ) -> Result<ItemInfo, EngineError> {
        let post = self.post(record)?;
        let (_, ext) = self.image_address(record)?;
        Ok(ItemInfo {
            id: post.id,
            width: post.width,
            height: post.height,
            tags: post.tags.split_whitespace().collect::<Vec<_>>().join(" "),
            ext,
            source: post.source.unwrap_or_default(),
            score: post.score.and_then(|s| s.as_i64()).unwrap_or(0),
            // Listing records carry no comment bodies.
            comments: Vec::new(),
            expected_size: None,
        })
    }

    fn item_tags(&self, record: &ItemRecord) -> Vec<String> {
        self.post(record)
            .map(|post| {
                post.tags
                    .split_whitespace()
                    .map(|tag| tag.to_ascii_lowercase())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn has_children(&self, record: &ItemRecord) -> bool {
        self.post(record)
            .ok()
            .and_then(|post| post.has_children)
            .map(|flag| flag.as_bool())
            .unwrap_or(false)
    }

    fn parent_id(&self, record: &ItemRecord) -> Option<i64> {
        self.post(record)
            .ok()
            .and_then(|post| post.parent_id)
            .and_then(|id| id.as_i64())
            .filter(|id| *id > 0)
    }

    fn metadata_is_local(&self) -> bool {
        true
    }
}
