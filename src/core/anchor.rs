//! Noise tolerant anchor matching.
//!
//! An anchor phrase is split into alphanumeric tokens which are joined with a
//! "any run of non-word characters" separator, so line breaks, repeated spaces
//! and stray punctuation from OCR do not break a match. Token order still
//! matters.

use std::sync::LazyLock;

use moka::sync::Cache;
use regex::Regex;
use xxhash_rust::xxh64::Xxh64;

use crate::core::model::AnchorTemplate;
use crate::core::text;

/// Compiled matchers keyed by xxh64 of the anchor phrase
static MATCHERS: LazyLock<Cache<u64, Option<Regex>>> = LazyLock::new(|| Cache::new(4_096));

fn cache_key(anchor: &str) -> u64
{
    let mut hasher = Xxh64::new(0);
    hasher.update(anchor.as_bytes());
    hasher.digest()
}

/// Build the tolerant pattern for one anchor, `None` when it has no tokens
pub fn compile_anchor(anchor: &str) -> Option<Regex>
{
    let key = cache_key(anchor);

    if let Some(hit) = MATCHERS.get(&key)
    {
        return hit;
    }

    let tokens = text::phrase_tokens(anchor);
    let compiled = if tokens.is_empty()
    {
        None
    }
    else
    {
        let body = tokens
            .iter()
            .map(|t| regex::escape(t))
            .collect::<Vec<_>>()
            .join(r"[\W_]+");
        Regex::new(&format!("(?i){body}")).ok()
    };

    MATCHERS.insert(key, compiled.clone());
    compiled
}

/// Byte range of the first match of `anchor` at or after `from`
pub fn find_anchor(
    haystack: &str,
    anchor: &str,
    from: usize,
) -> Option<(usize, usize)>
{
    if from > haystack.len() || !haystack.is_char_boundary(from)
    {
        return None;
    }

    compile_anchor(anchor)?
        .find_at(haystack, from)
        .map(|m| (m.start(), m.end()))
}

/// A template chunk whose anchor was found in the text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedAnchor
{
    /// Index into `AnchorTemplate::chunks`
    pub chunk_index: usize,
    pub start: usize,
    pub end: usize,
    pub candidate: String,
}

/// Walk the template in order, locating each chunk strictly after the
/// previous located anchor. Chunks with no candidate found are skipped.
pub fn locate_template(
    haystack: &str,
    template: &AnchorTemplate,
) -> Vec<LocatedAnchor>
{
    let mut out = Vec::with_capacity(template.len());
    let mut cursor = 0usize;

    for (chunk_index, chunk) in template
        .chunks
        .iter()
        .enumerate()
    {
        // Earliest match wins; longer candidate breaks ties
        let mut best: Option<(usize, usize, &str)> = None;

        for candidate in &chunk.anchor_candidates
        {
            let Some((start, end)) = find_anchor(haystack, candidate, cursor)
            else
            {
                continue;
            };

            let better = match best
            {
                None => true,
                Some((b_start, _, b_cand)) =>
                {
                    start < b_start
                        || (start == b_start
                            && candidate
                                .chars()
                                .count()
                                > b_cand
                                    .chars()
                                    .count())
                }
            };

            if better
            {
                best = Some((start, end, candidate.as_str()));
            }
        }

        if let Some((start, end, candidate)) = best
        {
            cursor = text::next_char_boundary(haystack, start);
            out.push(LocatedAnchor { chunk_index, start, end, candidate: candidate.to_string() });
        }
    }

    out
}

/// Fraction of template chunks whose anchor is located in order
pub fn template_fit(
    haystack: &str,
    template: &AnchorTemplate,
) -> f64
{
    if template.is_empty()
    {
        return 0.0;
    }

    locate_template(haystack, template).len() as f64 / template.len() as f64
}
