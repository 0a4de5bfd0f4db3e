//! Query truncation for pending changes
//!
//! A staged diff can be far larger than one embedding request allows. Rather
//! than dropping whole files, every file section is cut to a common length
//! `t`, chosen as large as possible so the total still fits.

use super::budget::{TokenEstimator, hard_cut};
use std::borrow::Cow;

const SECTION_HEADER: &str = "diff --git ";

/// Largest cutoff `t` such that `Σ min(lᵢ, t) <= budget`.
///
/// Returns `None` when the lengths already fit and nothing has to be cut.
pub fn compute_truncation(lengths: &[usize], budget: usize) -> Option<usize> {
    let total: usize = lengths.iter().sum();
    if total <= budget {
        return None;
    }

    let truncated_total = |t: usize| -> usize { lengths.iter().map(|&l| l.min(t)).sum() };

    // truncated_total(0) == 0 always fits; truncated_total(max) == total does not
    let max = lengths.iter().copied().max().unwrap_or(0);
    let (mut lo, mut hi) = (0usize, max);
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if truncated_total(mid) <= budget {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Some(lo)
}

/// Fit a pending-change text into `budget` estimated tokens.
///
/// Text that already fits is returned unchanged. Otherwise the text is split
/// into `diff --git` sections, each section is cut to the common length from
/// [`compute_truncation`] at line boundaries, and the result is hard-cut to
/// the budget as a last resort.
pub fn truncate_query<'a>(
    text: &'a str,
    budget: usize,
    estimator: &dyn TokenEstimator,
) -> Cow<'a, str> {
    if estimator.estimate(text) <= budget {
        return Cow::Borrowed(text);
    }

    let sections = split_sections(text);
    let lengths: Vec<usize> = sections.iter().map(|s| estimator.estimate(s)).collect();
    let Some(cutoff) = compute_truncation(&lengths, budget) else {
        // Sections fit but the joined text does not (non-additive estimator)
        return Cow::Borrowed(hard_cut(text, budget, estimator));
    };

    tracing::debug!(
        "Truncating query of {} sections to {} tokens each",
        sections.len(),
        cutoff
    );

    let mut out = String::with_capacity(text.len().min(budget.saturating_mul(4)));
    for section in sections {
        out.push_str(truncate_section(section, cutoff, estimator));
    }

    if out.trim().is_empty() {
        return Cow::Borrowed(hard_cut(text, budget, estimator));
    }
    if estimator.estimate(&out) > budget {
        let cut = hard_cut(&out, budget, estimator).len();
        out.truncate(cut);
    }
    Cow::Owned(out)
}

/// Split at lines starting a new file section; text before the first header
/// is its own section
fn split_sections(text: &str) -> Vec<&str> {
    let mut starts = vec![0usize];
    let mut offset = 0usize;
    for line in text.split_inclusive('\n') {
        if offset > 0 && line.starts_with(SECTION_HEADER) {
            starts.push(offset);
        }
        offset += line.len();
    }
    starts.push(text.len());

    starts
        .windows(2)
        .map(|w| &text[w[0]..w[1]])
        .filter(|s| !s.is_empty())
        .collect()
}

/// Longest run of whole leading lines within `budget`; falls back to a
/// character cut when not even the first line fits
fn truncate_section<'a>(section: &'a str, budget: usize, estimator: &dyn TokenEstimator) -> &'a str {
    if estimator.estimate(section) <= budget {
        return section;
    }

    let mut end = 0usize;
    for line in section.split_inclusive('\n') {
        let candidate = end + line.len();
        if estimator.estimate(&section[..candidate]) > budget {
            break;
        }
        end = candidate;
    }

    if end == 0 {
        hard_cut(section, budget, estimator)
    } else {
        &section[..end]
    }
}
