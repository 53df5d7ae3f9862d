//! Page-range boundary locator.
//!
//! Listing pages are ordered newest-first, so a date bound maps to a page
//! boundary: every page before it fails the bound, every page after it
//! satisfies it (or the mirror image for the other bound). The locator finds
//! that page with an exponential probe walk that keeps a shrinking
//! `lim_backward`/`lim_forward` bracket, touching a logarithmic-ish number
//! of pages. Listings are only approximately ordered, so forward probes
//! judge a page by its first record and backward probes by its last record,
//! which lets a page straddling the bound land on the correct side.

use std::collections::HashMap;

use crate::engine::EngineError;
use crate::engine::cancel::CancelToken;

/// Which end of the satisfying page range the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BoundarySide {
    /// First page whose probe record satisfies the predicate; pages below it
    /// fail (the satisfying region is a suffix of the range).
    Lowest,
    /// Last page whose probe record satisfies the predicate; pages above it
    /// fail (the satisfying region is a prefix of the range).
    Highest,
}

/// Which record of a probed page the predicate is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbePick {
    First,
    Last,
}

/// Verdicts already collected for one page, also serving as the probe memo
/// so no (page, pick) pair is fetched twice.
#[derive(Debug, Default, Clone, Copy)]
struct PageCheck {
    first: Option<bool>,
    last: Option<bool>,
}

/// Locates the boundary page of `[min_page, max_page]`.
///
/// `probe(page, pick)` fetches the page and evaluates the caller's predicate
/// against its first or last record; an empty page or a failed record fetch
/// must surface as an error, which aborts the search. Cancellation is polled
/// once per iteration.
pub(crate) fn locate_boundary_page(
    side: BoundarySide,
    min_page: usize,
    max_page: usize,
    probe: &mut dyn FnMut(usize, ProbePick) -> Result<bool, EngineError>,
    cancel: &CancelToken,
) -> Result<usize, EngineError> {
    debug_assert!(min_page <= max_page);
    let page_count = max_page - min_page + 1;
    if page_count <= 2 {
        // Nothing to search; the range is already the boundary.
        return Ok(match side {
            BoundarySide::Lowest => min_page,
            BoundarySide::Highest => max_page,
        });
    }

    let min = min_page as i64;
    let max = max_page as i64;
    let half_div = page_count / 2;

    let mut lim_backward: i64 = min - 1;
    let mut lim_forward: i64 = max + 1;
    let mut divider: usize = 1;
    let mut direction: i64 = 1;
    let mut cur: i64 = min;
    let mut checks: HashMap<usize, PageCheck> = HashMap::new();

    let finish = |lim_backward: i64| (lim_backward + 1).clamp(min, max) as usize;

    // Approximately ordered listings can flap; bail out instead of orbiting.
    let iteration_guard = page_count * 4 + 16;

    for _ in 0..iteration_guard {
        cancel.check()?;

        divider = (divider * 2).min(page_count);
        let step = (page_count / divider).max(1) as i64;
        cur += step * direction;

        // Walked off the search range: the boundary sits at the clamp.
        if cur < min {
            return Ok(min_page);
        }
        if cur > max {
            return Ok(max_page);
        }
        // Keep probes strictly inside the open bracket.
        if cur <= lim_backward {
            cur = lim_backward + 1;
        } else if cur >= lim_forward {
            cur = lim_forward - 1;
        }
        if lim_forward - lim_backward <= 2 {
            return Ok(finish(lim_backward));
        }

        let page = cur as usize;
        let pick = if direction > 0 { ProbePick::First } else { ProbePick::Last };
        let memo = checks.entry(page).or_default();
        let satisfied = match pick {
            ProbePick::First if memo.first.is_some() => memo.first == Some(true),
            ProbePick::Last if memo.last.is_some() => memo.last == Some(true),
            _ => {
                let verdict = probe(page, pick)?;
                match pick {
                    ProbePick::First => memo.first = Some(verdict),
                    ProbePick::Last => memo.last = Some(verdict),
                }
                verdict
            }
        };
        trace!(
            "boundary probe: page {} ({:?}) satisfied={} bracket=({}, {})",
            page, pick, satisfied, lim_backward, lim_forward
        );

        // A first-record verdict cannot exclude the probed page itself: a
        // straddling page fails at its first record yet still belongs to the
        // satisfying region. Last-record verdicts are the mirror image.
        match (side, satisfied, pick) {
            (BoundarySide::Lowest, true, _) => {
                lim_forward = lim_forward.min(cur + 1);
                direction = -1;
            }
            (BoundarySide::Lowest, false, ProbePick::Last) => {
                lim_backward = lim_backward.max(cur);
                direction = 1;
            }
            (BoundarySide::Lowest, false, ProbePick::First) => {
                lim_backward = lim_backward.max(cur - 1);
                direction = 1;
            }
            (BoundarySide::Highest, true, _) => {
                lim_backward = lim_backward.max(cur - 1);
                direction = 1;
            }
            (BoundarySide::Highest, false, ProbePick::First) => {
                lim_forward = lim_forward.min(cur);
                direction = -1;
            }
            (BoundarySide::Highest, false, ProbePick::Last) => {
                lim_forward = lim_forward.min(cur + 1);
                direction = -1;
            }
        }

        if lim_forward - lim_backward <= 2 {
            return Ok(finish(lim_backward));
        }

        // Refinement-phase convergence: a page whose first and last verdicts
        // disagree straddles the bound and is itself the boundary.
        if divider > half_div {
            if let Some(check) = checks.get(&page) {
                let straddles = match side {
                    BoundarySide::Lowest => {
                        check.first == Some(false) && check.last == Some(true)
                    }
                    BoundarySide::Highest => {
                        check.first == Some(true) && check.last == Some(false)
                    }
                };
                if straddles {
                    return Ok(page);
                }
            }
        }
    }

    Err(EngineError::Fatal(format!(
        "page boundary search did not converge over pages {min_page}..={max_page}"
    )))
}
