//! Per-chunk change scoring between two chunk sets.
//!
//! Chunks are paired by stable id. A pair's score combines the token-set
//! delta with the numeric multiset delta scaled by `numeric_weight`, so a
//! price change that leaves the wording intact still registers. Entries
//! carry bounded evidence snippets instead of full chunk text.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use std::time::Duration;

use indexmap::IndexMap;
use itertools::Itertools;
use regex::Regex;
use serde::Serialize;
use similar::{DiffTag, TextDiff};
use tracing::{debug, warn};

use crate::core::fingerprint::{FingerprintError, FingerprintMatcher};
use crate::core::model::{Chunk, ChunkSet};
use crate::core::text;
use crate::infra::config::DiffConfig;

/// Literal number tokens used to center evidence windows
static NUMBER_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:[.,]\d+)?").expect("number token regex"));

/// Changed numbers that may each add a snippet center
const MAX_NUMBER_CENTERS: usize = 6;

/// Head/tail length of added or removed chunk snippets
const HEAD_TAIL_CHARS: usize = 180;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScoreError
{
    #[error("chunk `{id}` has an unreadable fingerprint: {source}")]
    Fingerprint
    {
        id: String,
        #[source]
        source: FingerprintError,
    },
}

/// Per-call overrides; `None` falls back to the configured value
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DiffOptions
{
    pub numeric_weight: Option<f64>,
    pub threshold: Option<f64>,
    pub max_for_judge: Option<usize>,
}

/// Scores of one (previous, current) pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PairScore
{
    /// Token-set Jaccard similarity
    pub similarity: f64,
    pub delta: f64,
    pub numeric_delta: f64,
    pub score: f64,
}

/// A chunk present in both sets whose score crossed the threshold
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkChange
{
    pub id: String,
    pub key: Option<String>,
    pub title: String,
    pub similarity: f64,
    pub delta: f64,
    pub numeric_delta: f64,
    pub score: f64,
    pub before_snippets: Vec<String>,
    pub after_snippets: Vec<String>,
    pub before_preview: String,
    pub after_preview: String,
}

/// A chunk present in only one of the two sets
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkPresence
{
    pub id: String,
    pub key: Option<String>,
    pub title: String,
    pub snippets: Vec<String>,
    pub preview: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiffResult
{
    /// Sorted by descending score
    pub changed: Vec<ChunkChange>,
    pub added: Vec<ChunkPresence>,
    pub removed: Vec<ChunkPresence>,
    pub changed_chunks: usize,
    pub now_chunks: usize,
    pub significant: bool,
    /// Highest-scoring changes, bounded by `max_for_judge`
    pub for_judge: Vec<ChunkChange>,
    /// Ids that could not be scored and were reported as removed + added
    pub unscorable: Vec<String>,
}

impl DiffResult
{
    pub fn is_unchanged(&self) -> bool
    {
        self.changed
            .is_empty()
            && self
                .added
                .is_empty()
            && self
                .removed
                .is_empty()
    }
}

/// Thresholds resolved from configuration and per-call overrides
#[derive(Debug, Clone)]
pub struct DiffScorer
{
    numeric_weight: f64,
    threshold: f64,
    numeric_threshold: f64,
    numeric_dominance: f64,
    significant_threshold: f64,
    significant_numeric_threshold: f64,
    significant_ratio: f64,
    significant_changed_chunks: usize,
    max_for_judge: usize,
    excerpt_chars: usize,
    snippets: SnippetOptions,
}

#[derive(Debug, Clone, Copy)]
struct SnippetOptions
{
    window: usize,
    max_chars: usize,
    max_snippets: usize,
}

fn usable(v: Option<f64>) -> Option<f64>
{
    v.filter(|x| x.is_finite() && *x >= 0.0)
}

fn clamp01(v: f64) -> f64
{
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

impl DiffScorer
{
    pub fn new(
        cfg: &DiffConfig,
        opts: &DiffOptions,
    ) -> Self
    {
        let numeric_weight = usable(opts.numeric_weight).unwrap_or(cfg.numeric_weight);
        let threshold = usable(opts.threshold).unwrap_or(cfg.threshold);

        // An explicit threshold also caps the numeric one
        let numeric_threshold = match usable(opts.threshold)
        {
            Some(t) => cfg
                .numeric_threshold
                .min(t),
            None => cfg.numeric_threshold,
        };

        Self {
            numeric_weight,
            threshold,
            numeric_threshold,
            numeric_dominance: cfg.numeric_dominance,
            significant_threshold: cfg.significant_threshold,
            significant_numeric_threshold: cfg.significant_numeric_threshold,
            significant_ratio: cfg.significant_ratio,
            significant_changed_chunks: cfg.significant_changed_chunks,
            max_for_judge: opts
                .max_for_judge
                .unwrap_or(cfg.max_for_judge),
            excerpt_chars: cfg.excerpt_chars,
            snippets: SnippetOptions {
                window: cfg.snippet_window,
                max_chars: cfg
                    .snippet_max_chars
                    .max(1),
                max_snippets: cfg.max_snippets,
            },
        }
    }

    pub fn numeric_weight(&self) -> f64
    {
        self.numeric_weight
    }

    /// Change threshold for a pair with the given numeric delta
    pub fn threshold_for(
        &self,
        numeric_delta: f64,
    ) -> f64
    {
        if numeric_delta >= self.numeric_dominance { self.numeric_threshold } else { self.threshold }
    }

    fn significant_threshold_for(
        &self,
        numeric_delta: f64,
    ) -> f64
    {
        if numeric_delta >= self.numeric_dominance
        {
            self.significant_numeric_threshold
        }
        else
        {
            self.significant_threshold
        }
    }

    /// Score one pair; both fingerprints must decode
    pub fn score_pair(
        &self,
        before: &Chunk,
        after: &Chunk,
    ) -> Result<PairScore, ScoreError>
    {
        for chunk in [before, after]
        {
            chunk
                .fingerprint_value()
                .map_err(|source| ScoreError::Fingerprint { id: chunk.id.clone(), source })?;
        }

        let similarity = text::jaccard(&text::token_set(&before.text), &text::token_set(&after.text));
        let delta = clamp01(1.0 - similarity);
        let numeric_delta = clamp01(1.0 - multiset_jaccard(&before.numbers, &after.numbers));
        let score = clamp01(delta.max(numeric_delta * self.numeric_weight));

        Ok(PairScore { similarity, delta, numeric_delta, score })
    }

    /// Diff two chunk lists whose ids are already stabilised
    pub fn diff(
        &self,
        previous: &[Chunk],
        current: &[Chunk],
    ) -> DiffResult
    {
        let prev_by_id: IndexMap<&str, &Chunk> = previous
            .iter()
            .map(|c| (c.id.as_str(), c))
            .collect();
        let now_by_id: IndexMap<&str, &Chunk> = current
            .iter()
            .map(|c| (c.id.as_str(), c))
            .collect();

        let mut result = DiffResult { now_chunks: current.len(), ..Default::default() };
        let mut unscorable: HashSet<&str> = HashSet::new();

        // Scored pairs, in current order
        let mut scored: Vec<(&Chunk, &Chunk, PairScore)> = Vec::new();

        for (id, after) in &now_by_id
        {
            let Some(before) = prev_by_id.get(id)
            else
            {
                continue;
            };

            match self.score_pair(before, after)
            {
                Ok(score) => scored.push((*before, *after, score)),
                Err(e) =>
                {
                    warn!(id = %id, error = %e, "chunk_diff_unscorable");
                    unscorable.insert(*id);
                }
            }
        }

        for (id, before) in &prev_by_id
        {
            if !now_by_id.contains_key(id) || unscorable.contains(id)
            {
                result
                    .removed
                    .push(self.presence(before));
            }
        }

        for (id, after) in &now_by_id
        {
            if !prev_by_id.contains_key(id) || unscorable.contains(id)
            {
                result
                    .added
                    .push(self.presence(after));
            }
        }

        for (before, after, s) in scored
        {
            if s.score < self.threshold_for(s.numeric_delta)
            {
                continue;
            }

            let (before_snippets, after_snippets) = evidence_snippets(&before.text, &after.text, self.snippets);

            result
                .changed
                .push(ChunkChange {
                    id: after
                        .id
                        .clone(),
                    key: after
                        .key
                        .clone()
                        .or_else(|| {
                            before
                                .key
                                .clone()
                        }),
                    title: pick_title(after, before),
                    similarity: s.similarity,
                    delta: s.delta,
                    numeric_delta: s.numeric_delta,
                    score: s.score,
                    before_snippets,
                    after_snippets,
                    before_preview: text::excerpt(&before.text, self.excerpt_chars),
                    after_preview: text::excerpt(&after.text, self.excerpt_chars),
                });
        }

        // Stable: equal scores keep document order
        result
            .changed
            .sort_by(|a, b| b.score.total_cmp(&a.score));

        result.changed_chunks = result.changed.len();
        result.for_judge = result
            .changed
            .iter()
            .take(self.max_for_judge)
            .cloned()
            .collect();
        result.unscorable = previous
            .iter()
            .map(|c| c.id.as_str())
            .filter(|id| unscorable.contains(id))
            .map(str::to_string)
            .collect();
        result.significant = self.is_significant(&result);

        debug!(
            changed = result.changed_chunks,
            added = result.added.len(),
            removed = result.removed.len(),
            now = result.now_chunks,
            significant = result.significant,
            "chunk_diff_scored"
        );

        result
    }

    fn is_significant(
        &self,
        result: &DiffResult,
    ) -> bool
    {
        if !result.added.is_empty() || !result.removed.is_empty()
        {
            return true;
        }

        let changed = result.changed_chunks;
        if changed == 0
        {
            return false;
        }
        if changed >= self.significant_changed_chunks
        {
            return true;
        }
        if result.now_chunks > 0 && changed as f64 / result.now_chunks as f64 >= self.significant_ratio
        {
            return true;
        }

        result
            .changed
            .iter()
            .any(|c| c.score >= self.significant_threshold_for(c.numeric_delta))
    }

    fn presence(
        &self,
        chunk: &Chunk,
    ) -> ChunkPresence
    {
        ChunkPresence {
            id: chunk
                .id
                .clone(),
            key: chunk
                .key
                .clone(),
            title: chunk
                .title
                .clone(),
            snippets: head_tail_snippets(&chunk.text, self.snippets.max_chars),
            preview: text::excerpt(&chunk.text, self.excerpt_chars),
        }
    }
}

fn pick_title(
    after: &Chunk,
    before: &Chunk,
) -> String
{
    if after
        .title
        .trim()
        .is_empty()
    {
        before
            .title
            .clone()
    }
    else
    {
        after
            .title
            .clone()
    }
}

/// Duplicate-aware Jaccard over values rounded to 2 decimals; two empty sides are identical
pub fn multiset_jaccard(
    a: &[f64],
    b: &[f64],
) -> f64
{
    if a.is_empty() && b.is_empty()
    {
        return 1.0;
    }

    let counts = |xs: &[f64]| {
        let mut m: HashMap<i64, usize> = HashMap::new();
        for x in xs
        {
            *m.entry((x * 100.0).round() as i64)
                .or_insert(0) += 1;
        }
        m
    };

    let ca = counts(a);
    let cb = counts(b);

    let mut inter = 0usize;
    let mut union = 0usize;

    for key in ca
        .keys()
        .chain(cb.keys())
        .unique()
    {
        let x = ca
            .get(key)
            .copied()
            .unwrap_or(0);
        let y = cb
            .get(key)
            .copied()
            .unwrap_or(0);
        inter += x.min(y);
        union += x.max(y);
    }

    if union == 0 { 1.0 } else { inter as f64 / union as f64 }
}

/// Stabilise `current` ids against `previous`, then score
pub fn compute_chunk_diff(
    previous: &ChunkSet,
    current: &ChunkSet,
    scorer: &DiffScorer,
    matcher: &FingerprintMatcher,
) -> DiffResult
{
    let mut stabilized = current
        .chunks
        .clone();
    matcher.stabilize(&previous.chunks, &mut stabilized);

    scorer.diff(&previous.chunks, &stabilized)
}

/// Literal snippets covering a chunk's beginning and end
pub fn head_tail_snippets(
    text: &str,
    max_chars: usize,
) -> Vec<String>
{
    if text
        .trim()
        .is_empty()
    {
        return Vec::new();
    }

    let chars: Vec<char> = text
        .chars()
        .collect();
    if chars.len() <= max_chars
    {
        return vec![
            text.trim()
                .to_string(),
        ];
    }

    let span = HEAD_TAIL_CHARS.min(max_chars);
    let head = collect_trimmed(&chars[..span]);
    let tail = collect_trimmed(&chars[chars.len() - span..]);

    if tail.is_empty() || head.contains(&tail)
    {
        return vec![head];
    }

    vec![head, tail]
}

fn collect_trimmed(chars: &[char]) -> String
{
    chars
        .iter()
        .collect::<String>()
        .trim()
        .to_string()
}

/// Char-index bounds of the first and last differing positions on each side
fn change_region(
    before: &str,
    after: &str,
) -> Option<((usize, usize), (usize, usize))>
{
    let diff = TextDiff::configure()
        .timeout(Duration::from_millis(250))
        .diff_chars(before, after);

    let edits: Vec<_> = diff
        .ops()
        .iter()
        .filter(|op| op.tag() != DiffTag::Equal)
        .collect();

    let first = edits.first()?;
    let last = edits.last()?;

    Some((
        (
            first
                .old_range()
                .start,
            last.old_range()
                .end,
        ),
        (
            first
                .new_range()
                .start,
            last.new_range()
                .end,
        ),
    ))
}

/// Number tokens present on one side only, in first-seen order
fn changed_number_tokens<'a>(
    before: &'a str,
    after: &'a str,
) -> Vec<&'a str>
{
    let scan = |s: &'a str| -> Vec<&'a str> {
        NUMBER_TOKEN_RE
            .find_iter(s)
            .map(|m| m.as_str())
            .collect()
    };
    let a = scan(before);
    let b = scan(after);
    let set_a: HashSet<&str> = a
        .iter()
        .copied()
        .collect();
    let set_b: HashSet<&str> = b
        .iter()
        .copied()
        .collect();

    let mut out: Vec<&str> = Vec::new();
    for t in a
        .iter()
        .filter(|t| !set_b.contains(*t))
        .chain(
            b.iter()
                .filter(|t| !set_a.contains(*t)),
        )
    {
        if !out.contains(t)
        {
            out.push(*t);
        }
    }

    out
}

/// Char index of the last occurrence of `needle`
fn last_char_index(
    haystack: &str,
    needle: &str,
) -> Option<usize>
{
    haystack
        .rfind(needle)
        .map(|byte| {
            haystack[..byte]
                .chars()
                .count()
        })
}

/// Window of `window` chars either side of `center`, hard-capped at `max_chars`
fn window_range(
    len: usize,
    center: usize,
    opts: SnippetOptions,
) -> (usize, usize)
{
    let c = center.min(len);
    let mut start = c.saturating_sub(opts.window);
    let mut end = (c + opts.window).min(len);

    if end - start > opts.max_chars
    {
        start = c.saturating_sub(opts.max_chars / 2);
        end = (start + opts.max_chars).min(len);
        if end - start < opts.max_chars && start > 0
        {
            start = end.saturating_sub(opts.max_chars);
        }
    }

    (start, end)
}

/// Keep the first of any overlapping ranges, ordered by start
fn disjoint_ranges(ranges: Vec<(usize, usize)>) -> Vec<(usize, usize)>
{
    let mut out: Vec<(usize, usize)> = Vec::new();

    for (start, end) in ranges
    {
        let overlaps = out
            .iter()
            .any(|(s, e)| !(end <= *s || start >= *e));
        if !overlaps
        {
            out.push((start, end));
        }
    }

    out.sort_by_key(|r| r.0);
    out
}

fn snippets_at(
    text: &str,
    centers: &[usize],
    opts: SnippetOptions,
) -> Vec<String>
{
    let chars: Vec<char> = text
        .chars()
        .collect();
    let ranges = centers
        .iter()
        .map(|c| window_range(chars.len(), *c, opts))
        .collect();

    disjoint_ranges(ranges)
        .into_iter()
        .take(opts.max_snippets)
        .map(|(s, e)| collect_trimmed(&chars[s..e]))
        .filter(|s| !s.is_empty())
        .collect()
}

/// Before/after snippets around the changed region and changed numbers
fn evidence_snippets(
    before: &str,
    after: &str,
    opts: SnippetOptions,
) -> (Vec<String>, Vec<String>)
{
    if before.is_empty() && after.is_empty()
    {
        return (Vec::new(), Vec::new());
    }

    if before == after
    {
        let single = collect_trimmed(
            &before
                .chars()
                .take(opts.max_chars)
                .collect::<Vec<_>>(),
        );
        return (vec![single.clone()], vec![single]);
    }

    let mut before_centers = Vec::new();
    let mut after_centers = Vec::new();

    if let Some(((b_start, b_end), (a_start, a_end))) = change_region(before, after)
    {
        before_centers.extend([b_start, b_end.saturating_sub(1)]);
        after_centers.extend([a_start, a_end.saturating_sub(1)]);
    }

    for token in changed_number_tokens(before, after)
        .into_iter()
        .take(MAX_NUMBER_CENTERS)
    {
        before_centers.extend(last_char_index(before, token));
        after_centers.extend(last_char_index(after, token));
    }

    (snippets_at(before, &before_centers, opts), snippets_at(after, &after_centers, opts))
}
