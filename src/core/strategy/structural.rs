//! Deterministic chunking over reflowed paragraphs.
//!
//! Wrapped lines are joined back into paragraphs while headings and list runs
//! stay hard boundaries. Short one-line segments are folded into the next real
//! paragraph, then segments are packed into chunks near an even character
//! target. Every segment is rendered behind a `[Pnnn]` paragraph marker.

use std::sync::LazyLock;

use itertools::Itertools;
use regex::Regex;

use crate::core::model::{Chunk, ChunkMethod};
use crate::core::strategy::{BoundaryStrategy, ChunkInput, StrategyFailure, StrategyOutput, checked_output};
use crate::core::text::{self, ChunkLine};
use crate::infra::config::{StructuralConfig, WindowConfig};

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#{1,6}\s+\S").expect("heading regex"));

static LIST_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-*•]|\d+\.|\d+\))\s+\S").expect("list item regex"));

static SENTENCE_END_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[.!?]["'”’)]?$"#).expect("sentence end regex"));

/// Trailing characters that mark a line as continued
static SOFT_END_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"[,;:/(\[“„"'–—…]$"#).expect("soft end regex"));

/// Hard limit on the even-split chunk count
const MAX_DESIRED_CHUNKS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentKind
{
    Heading,
    /// Standalone layout token such as `[toc]`
    Token,
    List,
    Paragraph,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Segment
{
    pub kind: SegmentKind,
    pub from: usize,
    pub to: usize,
    pub text: String,
}

fn is_heading(t: &str) -> bool
{
    HEADING_RE.is_match(t)
}

fn is_list_item(t: &str) -> bool
{
    LIST_ITEM_RE.is_match(t)
}

fn is_token(t: &str) -> bool
{
    let lower = t
        .trim()
        .to_lowercase();
    lower == "[toc]" || lower == "toc"
}

/// Join a wrapped continuation, undoing end-of-line hyphenation
pub(crate) fn join_soft(
    left: &str,
    right: &str,
) -> String
{
    let left = left.trim_end();
    let right = right.trim_start();

    if left.is_empty()
    {
        return right.to_string();
    }
    if right.is_empty()
    {
        return left.to_string();
    }

    match left.strip_suffix('-')
    {
        Some(stem) if !stem.ends_with(char::is_whitespace) => format!("{stem}{right}"),
        _ => format!("{left} {right}"),
    }
}

/// Whether `curr` continues the paragraph ending in `prev`
pub(crate) fn joins_wrapped(
    prev: &str,
    curr: &str,
    wrap_at: usize,
) -> bool
{
    let p = prev.trim_end();
    let c = curr.trim();

    if p.is_empty() || c.is_empty()
    {
        return false;
    }
    if is_heading(c) || is_list_item(c) || is_token(c)
    {
        return false;
    }
    if SENTENCE_END_RE.is_match(p)
    {
        return false;
    }
    if SOFT_END_RE.is_match(p)
    {
        return true;
    }

    let wrap_at = if wrap_at > 0 { wrap_at } else { 140 };
    let threshold = (wrap_at * 3 / 5).max(40);

    p.chars()
        .count()
        >= threshold
}

/// Segment the line list; paragraph breaks always end the open segment
pub(crate) fn build_segments(
    lines: &[ChunkLine],
    wrap_at: usize,
) -> Vec<Segment>
{
    let mut segs = Vec::new();
    let mut cur: Option<Segment> = None;

    let flush = |cur: &mut Option<Segment>, segs: &mut Vec<Segment>| {
        if let Some(mut seg) = cur.take()
        {
            seg.text = seg
                .text
                .trim()
                .to_string();
            if !seg
                .text
                .is_empty()
            {
                segs.push(seg);
            }
        }
    };

    for (i, line) in lines
        .iter()
        .enumerate()
    {
        let t = line
            .text
            .trim();

        if line.after_break || t.is_empty()
        {
            flush(&mut cur, &mut segs);
        }
        if t.is_empty()
        {
            continue;
        }

        if is_heading(t) || is_token(t)
        {
            flush(&mut cur, &mut segs);
            let kind = if is_heading(t) { SegmentKind::Heading } else { SegmentKind::Token };
            segs.push(Segment { kind, from: i, to: i, text: t.to_string() });
            continue;
        }

        if is_list_item(t)
        {
            match cur.as_mut()
            {
                Some(seg) if seg.kind == SegmentKind::List =>
                {
                    seg.to = i;
                    seg.text = format!("{}\n{t}", seg.text.trim_end());
                }
                _ =>
                {
                    flush(&mut cur, &mut segs);
                    cur = Some(Segment { kind: SegmentKind::List, from: i, to: i, text: t.to_string() });
                }
            }
            continue;
        }

        match cur.as_mut()
        {
            Some(seg) if seg.kind == SegmentKind::Paragraph && joins_wrapped(&seg.text, t, wrap_at) =>
            {
                seg.to = i;
                seg.text = join_soft(&seg.text, t);
            }
            _ =>
            {
                flush(&mut cur, &mut segs);
                cur = Some(Segment { kind: SegmentKind::Paragraph, from: i, to: i, text: t.to_string() });
            }
        }
    }

    flush(&mut cur, &mut segs);
    segs
}

/// Multi-line segments and long single-line paragraphs or lists stand on their own
fn is_anchor(
    seg: &Segment,
    paragraph_min_chars: usize,
) -> bool
{
    let t = seg
        .text
        .trim();

    match seg.kind
    {
        _ if t.is_empty() => false,
        SegmentKind::Heading | SegmentKind::Token => false,
        _ if t.contains('\n') => true,
        SegmentKind::List | SegmentKind::Paragraph =>
        {
            t.chars()
                .count()
                >= paragraph_min_chars
        }
    }
}

/// Fold runs of one-liners into the next anchor segment; a trailing run joins the last one
pub(crate) fn merge_one_liners(
    segs: Vec<Segment>,
    paragraph_min_chars: usize,
) -> Vec<Segment>
{
    let mut out: Vec<Segment> = Vec::with_capacity(segs.len());
    let mut pending: Vec<Segment> = Vec::new();

    for seg in segs
    {
        if !is_anchor(&seg, paragraph_min_chars)
        {
            pending.push(seg);
            continue;
        }

        if pending.is_empty()
        {
            out.push(seg);
            continue;
        }

        let prefix = pending
            .iter()
            .map(|p| p.text.trim())
            .join("\n");
        out.push(Segment {
            from: pending[0].from,
            text: format!("{prefix}\n{}", seg.text.trim()),
            ..seg
        });
        pending.clear();
    }

    let Some(last_pending) = pending.last()
    else
    {
        return out;
    };

    let tail = pending
        .iter()
        .map(|p| p.text.trim())
        .join("\n");
    let to = last_pending.to;

    match out.last_mut()
    {
        Some(last) =>
        {
            last.to = to;
            last.text = format!("{}\n{tail}", last.text.trim());
        }
        None => out.push(Segment { kind: SegmentKind::Paragraph, from: pending[0].from, to, text: tail }),
    }

    out
}

#[derive(Debug, Clone)]
pub struct StructuralStrategy
{
    cfg: StructuralConfig,
    window: WindowConfig,
}

impl StructuralStrategy
{
    pub fn new(
        cfg: StructuralConfig,
        window: WindowConfig,
    ) -> Self
    {
        Self { cfg, window }
    }

    /// Segments in document order, before packing
    pub(crate) fn segments(
        &self,
        canonical: &str,
    ) -> Vec<Segment>
    {
        let lines = text::chunk_lines(
            canonical,
            self.window
                .max_chars,
        );
        let segs = build_segments(&lines, self.cfg.wrap_at);

        if self.cfg.merge_one_liners
        {
            merge_one_liners(segs, self.cfg.paragraph_min_chars)
        }
        else
        {
            segs
        }
    }

    /// `[start, end)` segment ranges of each chunk
    fn pack(
        &self,
        widths: &[usize],
    ) -> Vec<(usize, usize)>
    {
        let max_chars = self
            .cfg
            .max_chars
            .clamp(600, 10_000);
        let min_chars = self
            .cfg
            .min_chars
            .min(max_chars);
        let overlap = self
            .window
            .overlap;
        // Fixed window size counts segments here
        let max_segs = if self.window.fixed_lines > 0 { self.window.fixed_lines } else { self.window.max_lines.max(1) };

        let total: usize = widths
            .iter()
            .map(|w| w + 2)
            .sum();
        let desired = total
            .div_ceil(max_chars)
            .clamp(1, MAX_DESIRED_CHUNKS);
        let target = total.div_ceil(desired);

        let n = widths.len();
        let mut ranges = Vec::new();
        let mut start = 0usize;

        while start < n
        {
            let mut end = start;
            let mut used = 0usize;

            while end < n && end - start < max_segs
            {
                let next = used + widths[end] + if end > start { 2 } else { 0 };
                if end > start && next > max_chars
                {
                    break;
                }

                used = next;
                end += 1;

                // Soft stop once the chunk reached the even target
                if used >= target && used >= min_chars
                {
                    break;
                }
            }

            let end = end.max(start + 1);
            ranges.push((start, end));

            if end >= n
            {
                break;
            }

            start = end
                .saturating_sub(overlap)
                .max(start + 1);
        }

        ranges
    }
}

impl BoundaryStrategy for StructuralStrategy
{
    fn name(&self) -> &'static str
    {
        "structural"
    }

    fn chunk(
        &self,
        input: &ChunkInput<'_>,
    ) -> Result<StrategyOutput, StrategyFailure>
    {
        let segs = self.segments(input.canonical);
        if segs.is_empty()
        {
            return Err(StrategyFailure::EmptyInput);
        }

        let widths: Vec<usize> = segs
            .iter()
            .map(|s| s.text.chars().count())
            .collect();
        let ranges = self.pack(&widths);

        let chunks = ranges
            .iter()
            .enumerate()
            .map(|(order, &(start, end))| {
                let body = (start..end)
                    .map(|k| format!("{} {}", text::paragraph_marker(k + 1), segs[k].text))
                    .join("\n");
                let from = segs[start].from;
                let to = segs[end - 1].to;

                Chunk::new(input.source, order, format!("Lines {}-{}", from + 1, to + 1), body).with_lines(from, to)
            })
            .collect();

        let overlap = self
            .window
            .overlap;

        checked_output(ChunkMethod::Structural { segments: segs.len(), overlap }, chunks)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::core::model::SourceKind;

    fn seg(
        kind: SegmentKind,
        from: usize,
        to: usize,
        text: &str,
    ) -> Segment
    {
        Segment { kind, from, to, text: text.into() }
    }

    fn paragraphs(n: usize) -> String
    {
        (0..n)
            .map(|i| format!("Paragraph {i} {}", "lorem ".repeat(50).trim_end()))
            .join("\n\n")
    }

    fn strategy(
        max_chars: usize,
        overlap: usize,
    ) -> StructuralStrategy
    {
        StructuralStrategy::new(
            StructuralConfig { enabled: true, max_chars, min_chars: 0, ..Default::default() },
            WindowConfig { overlap, ..Default::default() },
        )
    }

    #[test]
    fn wrapped_lines_join_but_headings_and_lists_stay_apart()
    {
        let canonical = "# Title\n\
                         This line was wrapped by the extractor because it is long and keeps going on,\n\
                         and continues here with more words.\n\
                         - first item\n\
                         - second item\n\
                         \n\
                         Short tail.";
        let lines = text::chunk_lines(canonical, 0);

        let segs = build_segments(&lines, 140);

        let shape: Vec<_> = segs
            .iter()
            .map(|s| (s.kind, s.from, s.to))
            .collect();
        assert_eq!(
            shape,
            vec![
                (SegmentKind::Heading, 0, 0),
                (SegmentKind::Paragraph, 1, 2),
                (SegmentKind::List, 3, 4),
                (SegmentKind::Paragraph, 5, 5),
            ]
        );
        assert!(segs[1]
            .text
            .ends_with("going on, and continues here with more words."));
        assert_eq!(segs[2].text, "- first item\n- second item");
    }

    #[test]
    fn soft_joins_undo_hyphenation()
    {
        assert_eq!(join_soft("architek-", "tura"), "architektura");
        assert_eq!(join_soft("a -", "b"), "a - b");
        assert_eq!(join_soft("", " b"), "b");

        assert!(joins_wrapped(&"x".repeat(90), "next", 140));
        assert!(!joins_wrapped("Short", "next", 140));
        assert!(joins_wrapped("Short,", "next", 140));
        assert!(!joins_wrapped(&format!("{}.", "x".repeat(90)), "next", 140));
        assert!(!joins_wrapped(&"x".repeat(90), "# Heading", 140));
    }

    #[test]
    fn one_liners_fold_into_the_next_anchor()
    {
        let segs = vec![
            seg(SegmentKind::Heading, 0, 0, "# Specs"),
            seg(SegmentKind::Paragraph, 1, 1, "Weight 2 kg"),
            seg(SegmentKind::List, 2, 3, "- a\n- b"),
            seg(SegmentKind::Paragraph, 4, 4, "Footer note"),
        ];

        let merged = merge_one_liners(segs, 160);

        assert_eq!(merged, vec![seg(SegmentKind::List, 0, 4, "# Specs\nWeight 2 kg\n- a\n- b\nFooter note")]);

        // Nothing to fold into
        let only_short = merge_one_liners(
            vec![seg(SegmentKind::Heading, 0, 0, "# A"), seg(SegmentKind::Paragraph, 1, 1, "b")],
            160,
        );
        assert_eq!(only_short, vec![seg(SegmentKind::Paragraph, 0, 1, "# A\nb")]);
    }

    #[test]
    fn segments_pack_near_an_even_target_with_markers()
    {
        let canonical = paragraphs(6);
        let input = ChunkInput { canonical: &canonical, lines: &[], source: SourceKind::Extracted };

        let out = strategy(700, 0)
            .chunk(&input)
            .expect("structural chunking");

        let titles: Vec<_> = out
            .chunks
            .iter()
            .map(|c| c.title.as_str())
            .collect();
        assert_eq!(titles, vec!["Lines 1-2", "Lines 3-4", "Lines 5-6"]);
        assert!(out.chunks[0]
            .text
            .starts_with("[P001] Paragraph 0"));
        assert!(out.chunks[1]
            .text
            .contains("\n[P004] Paragraph 3"));
        assert_eq!(out.method, ChunkMethod::Structural { segments: 6, overlap: 0 });
    }

    #[test]
    fn segment_overlap_progresses_and_stops_at_the_end()
    {
        let canonical = paragraphs(6);
        let input = ChunkInput { canonical: &canonical, lines: &[], source: SourceKind::Extracted };

        let out = strategy(700, 1)
            .chunk(&input)
            .expect("structural chunking");

        let starts: Vec<_> = out
            .chunks
            .iter()
            .filter_map(|c| c.lines.map(|l| l.from))
            .collect();
        assert_eq!(starts, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn blank_text_has_no_segments()
    {
        let input = ChunkInput { canonical: "", lines: &[], source: SourceKind::Ocr };

        assert_eq!(strategy(2200, 0).chunk(&input), Err(StrategyFailure::EmptyInput));
    }
}
