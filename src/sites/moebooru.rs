//! Moebooru-API family: JSON array pages with one-based page addressing and
//! Unix-timestamp dates. Serves yande.re and konachan.

use chrono::{DateTime, NaiveDate};
use serde::Deserialize;
use serde_json::Value;

use super::{excerpt, parse_xml_count, url_extension};
use crate::engine::EngineError;
use crate::engine::adapter::{ItemInfo, ItemRecord, PageDoc, QueryOutcome, SiteAdapter};
use crate::engine::cancel::CancelToken;
use crate::engine::sender::RequestSender;

const PER_PAGE: usize = 100;

#[derive(Debug, Clone, Deserialize)]
struct MoebooruPost {
    id: i64,
    #[serde(default)]
    created_at: Option<i64>,
    #[serde(default)]
    file_url: String,
    #[serde(default)]
    file_ext: Option<String>,
    #[serde(default)]
    file_size: Option<u64>,
    #[serde(default)]
    width: i64,
    #[serde(default)]
    height: i64,
    #[serde(default)]
    tags: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    score: Option<i64>,
    #[serde(default)]
    parent_id: Option<i64>,
    #[serde(default)]
    has_children: Option<bool>,
}

pub(crate) struct MoebooruAdapter {
    name: &'static str,
    prefix: &'static str,
    base: &'static str,
}

impl MoebooruAdapter {
    pub(crate) fn yandere() -> Self {
        MoebooruAdapter {
            name: "yandere",
            prefix: "yd",
            base: "https://yande.re",
        }
    }

    pub(crate) fn konachan() -> Self {
        MoebooruAdapter {
            name: "konachan",
            prefix: "kc",
            base: "https://konachan.com",
        }
    }

    fn post(&self, record: &ItemRecord) -> Result<MoebooruPost, EngineError> {
        serde_json::from_value(record.as_json()?.clone()).map_err(|e| {
            EngineError::Adapter(format!("{}: unreadable post record ({e})", self.name))
        })
    }

    fn extension(&self, post: &MoebooruPost) -> Option<String> {
        post.file_ext
            .as_deref()
            .map(|ext| ext.to_ascii_lowercase())
            .or_else(|| url_extension(&post.file_url))
    }
}

/// Older deployments serve protocol-relative file URLs.
fn absolute(url: &str) -> String {
    match url.strip_prefix("//") {
        Some(rest) => format!("https://{rest}"),
        None => url.to_owned(),
    }
}

impl SiteAdapter for MoebooruAdapter {
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
        5000
    }

    fn count_address(&self, tags: &str) -> String {
        format!("{}/post.xml?limit=1&tags={tags}", self.base)
    }

    fn page_address(&self, tags: &str, page: usize) -> String {
        // The API counts pages from one.
        format!(
            "{}/post.json?limit={PER_PAGE}&page={}&tags={tags}",
            self.base,
            page + 1
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

    fn page_records(&self, page: &PageDoc) -> Result<Vec<ItemRecord>, EngineError> {
        match page.as_json()? {
            Value::Array(entries) => Ok(entries.iter().cloned().map(ItemRecord::Json).collect()),
            other => Err(EngineError::Adapter(format!(
                "{}: unexpected listing root {other}",
                self.name
            ))),
        }
    }

    fn item_id(&self, record: &ItemRecord) -> Result<i64, EngineError> {
        Ok(self.post(record)?.id)
    }

    fn item_address(&self, record: &ItemRecord) -> Result<String, EngineError> {
        Ok(format!("{}/post/show/{}", self.base, self.item_id(record)?))
    }

    fn is_video(&self, record: &ItemRecord) -> bool {
        self.post(record)
            .ok()
            .and_then(|post| self.extension(&post))
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
        post.created_at
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map(|stamp| stamp.date_naive())
            .ok_or_else(|| {
                EngineError::Adapter(format!(
                    "{}: post {} carries no usable date",
                    self.name, post.id
                ))
            })
    }

    fn image_address(&self, record: &ItemRecord) -> Result<(String, String), EngineError> {
        let post = self.post(record)?;
        if post.file_url.is_empty() {
            return Err(EngineError::Adapter(format!(
                "{}: post {} has no file URL",
                self.name, post.id
            )));
        }
        let ext = self.extension(&post).ok_or_else(|| {
            EngineError::Adapter(format!(
                "{}: no extension in {:?}",
                self.name, post.file_url
            ))
        })?;
        Ok((absolute(&post.file_url), ext))
    }

    fn video_address(
        &self,
        _sender: &RequestSender,
        record: &ItemRecord,
        _cancel: &CancelToken,
    ) -> Result<(String, String), EngineError> {
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
            score: post.score.unwrap_or(0),
            comments: Vec::new(),
            expected_size: post.file_size.filter(|size| *size > 0),
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
            .unwrap_or(false)
    }

    fn parent_id(&self, record: &ItemRecord) -> Option<i64> {
        self.post(record)
            .ok()
            .and_then(|post| post.parent_id)
            .filter(|id| *id > 0)
    }

    fn metadata_is_local(&self) -> bool {
        true
    }
}
