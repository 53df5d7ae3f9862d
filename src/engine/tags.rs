//! Tag-expression grammar and the task splitter.
//!
//! A query is a list of tokens: plain tags, negative tags (`-tag`),
//! OR-groups `(a~b~c)`, exclusion groups `-(a,b,c)` and `key:value` meta
//! tags. Exclusion groups never reach the site; they become filter rules.
//! OR-groups are either passed through verbatim for the site to evaluate or
//! expanded into one task per branch combination.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::engine::EngineError;

static OR_GROUP: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\([^()~,]+(?:~[^()~,]+)+\)$").unwrap());
static EXCLUDE_GROUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-\([^()~,]+(?:,[^()~,]+)+\)$").unwrap());

/// The splitter's output: the task strings to scan, in order, plus the
/// AND-groups of tag patterns the filter pipeline must exclude.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SplitQuery {
    pub(crate) tasks: Vec<String>,
    pub(crate) exclusion_groups: Vec<Vec<String>>,
}

#[derive(Debug, Clone)]
enum Piece {
    /// Plain, negative or meta tag, emitted into every task as written.
    Plain(String),
    /// OR-group the site evaluates natively, emitted verbatim.
    Literal(String),
    /// OR-group expanded into one task per branch.
    Split(Vec<String>),
}

fn is_meta(tag: &str) -> bool {
    tag.contains(':')
}

fn is_negative(tag: &str) -> bool {
    tag.starts_with('-')
}

/// Splits a raw token list into scan tasks and exclusion rules.
///
/// `force_split` expands every OR-group; otherwise a group is expanded only
/// when one of its branches is negative or a meta tag, which sites cannot
/// evaluate inside their own OR syntax. `concat` joins the tokens of each
/// composed task string.
pub(crate) fn split_query(
    tokens: &[String],
    force_split: bool,
    concat: char,
    max_len: usize,
    max_tokens: usize,
) -> Result<SplitQuery, EngineError> {
    let mut pieces: Vec<Piece> = Vec::with_capacity(tokens.len());
    let mut exclusion_groups: Vec<Vec<String>> = Vec::new();

    for token in tokens {
        if EXCLUDE_GROUP.is_match(token) {
            let inner = &token[2..token.len() - 1];
            exclusion_groups.push(inner.split(',').map(str::to_string).collect());
        } else if OR_GROUP.is_match(token) {
            let inner = &token[1..token.len() - 1];
            let branches: Vec<String> = inner.split('~').map(str::to_string).collect();
            if force_split || branches.iter().any(|b| is_negative(b) || is_meta(b)) {
                pieces.push(Piece::Split(branches));
            } else {
                pieces.push(Piece::Literal(token.clone()));
            }
        } else if token.contains('(') || token.contains(')') {
            return Err(EngineError::MalformedGroup(token.clone()));
        } else {
            pieces.push(Piece::Plain(token.clone()));
        }
    }

    let has_positive = pieces.iter().any(|piece| match piece {
        Piece::Plain(tag) => !is_negative(tag),
        Piece::Literal(_) => true,
        Piece::Split(branches) => branches.iter().any(|b| !is_negative(b)),
    });
    if !has_positive {
        return Err(EngineError::Fatal(String::from(
            "query contains no positive tags",
        )));
    }

    // Odometer over the split groups, later groups advancing fastest, so the
    // produced task order is deterministic.
    let split_sizes: Vec<usize> = pieces
        .iter()
        .filter_map(|piece| match piece {
            Piece::Split(branches) => Some(branches.len()),
            _ => None,
        })
        .collect();
    let combinations: usize = split_sizes.iter().product::<usize>().max(1);
    let separator = concat.to_string();

    let mut cursor = vec![0usize; split_sizes.len()];
    let mut tasks = Vec::with_capacity(combinations);
    for _ in 0..combinations {
        let mut parts: Vec<&str> = Vec::with_capacity(pieces.len());
        let mut group = 0usize;
        for piece in &pieces {
            match piece {
                Piece::Plain(tag) | Piece::Literal(tag) => parts.push(tag),
                Piece::Split(branches) => {
                    parts.push(&branches[cursor[group]]);
                    group += 1;
                }
            }
        }

        if parts.len() > max_tokens {
            return Err(EngineError::Fatal(format!(
                "composed query holds {} tags, over the {} cap",
                parts.len(),
                max_tokens
            )));
        }
        let task = parts.join(&separator);
        if task.len() > max_len {
            return Err(EngineError::Fatal(format!(
                "composed query is {} characters, over the {} cap and not reducible",
                task.len(),
                max_len
            )));
        }
        tasks.push(task);

        for slot in (0..cursor.len()).rev() {
            cursor[slot] += 1;
            if cursor[slot] < split_sizes[slot] {
                break;
            }
            cursor[slot] = 0;
        }
    }

    Ok(SplitQuery { tasks, exclusion_groups })
}
