//! Site adapter registry and shared booru-API plumbing.
//!
//! Each supported site is a thin [SiteAdapter] over one of two API families;
//! the engine does all the heavy lifting. `adapter_for` maps a `-module`
//! name to its adapter.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::engine::adapter::SiteAdapter;

mod gelbooru;
mod moebooru;

use gelbooru::GelbooruAdapter;
use moebooru::MoebooruAdapter;

/// Module names accepted by `-module`, alphabetical.
pub(crate) const KNOWN_MODULES: &[&str] = &["gelbooru", "konachan", "rule34", "yandere"];

pub(crate) fn adapter_for(name: &str) -> Option<Box<dyn SiteAdapter>> {
    match name {
        "gelbooru" => Some(Box::new(GelbooruAdapter::gelbooru())),
        "rule34" => Some(Box::new(GelbooruAdapter::rule34())),
        "yandere" => Some(Box::new(MoebooruAdapter::yandere())),
        "konachan" => Some(Box::new(MoebooruAdapter::konachan())),
        _ => None,
    }
}

/// Both API families report the match total as an XML attribute.
static XML_COUNT: Lazy<Regex> = Lazy::new(|| Regex::new(r#"count="(\d+)""#).unwrap());

pub(crate) fn parse_xml_count(body: &str) -> Option<usize> {
    XML_COUNT
        .captures(body)
        .and_then(|caps| caps[1].parse().ok())
}

/// Extension of the file a URL points at, lowercased; `None` when the last
/// path segment has no dot.
pub(crate) fn url_extension(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or(path);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// First characters of a body, for error messages about unparseable pages.
pub(crate) fn excerpt(body: &str) -> String {
    body.chars().take(120).collect()
}

/// Booru deployments disagree about scalar encodings; both forms appear in
/// live responses.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum NumberOrString {
    Number(i64),
    Text(String),
}

impl NumberOrString {
    pub(crate) fn as_i64(&self) -> Option<i64> {
        match self {
            NumberOrString::Number(n) => Some(*n),
            NumberOrString::Text(s) => s.parse().ok(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum BoolOrString {
    Flag(bool),
    Text(String),
}

impl BoolOrString {
    pub(crate) fn as_bool(&self) -> bool {
        match self {
            BoolOrString::Flag(flag) => *flag,
            BoolOrString::Text(s) => s == "true" || s == "1",
        }
    }
}
