//! LLM line-range chunking.
//!
//! The model sees the normalized lines with their indices and must return a
//! covering, gap-free, ascending partition of `0..N-1`. Invalid output gets a
//! bounded number of repair rounds that echo the violations back; anything
//! still invalid is a failure and the caller falls back.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::core::model::{Chunk, ChunkMethod};
use crate::core::strategy::{BoundaryStrategy, ChunkInput, StrategyFailure, StrategyOutput, checked_output};
use crate::core::text;
use crate::infra::config::SemanticConfig;
use crate::llm::json::extract_json;
use crate::llm::service::{GenerateOptions, TextCompletionService};

const MIN_TARGET: usize = 2;
const MAX_TARGET: usize = 32;
const TITLE_CHARS: usize = 72;
const KEY_CHARS: usize = 32;
const OUTPUT_SCHEMA: &str = r#"{ "chunks": [ { "id": string, "title": string, "from": number, "to": number } ] }"#;

/// One inclusive line range proposed by the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSpec
{
    pub from: i64,
    pub to: i64,
    pub title: Option<String>,
}

/// Ranges read from a model response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedRanges
{
    /// Entries in the response's chunk array, valid or not
    pub items: usize,
    /// Entries with integer bounds, in response order
    pub ranges: Vec<RangeSpec>,
}

/// Partition defects, rendered as stable codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeViolation
{
    ChunksEmpty,
    NoValidRanges,
    FirstFromNotZero(i64),
    LastToNotEnd
    {
        got: i64,
        expected: i64,
    },
    OutOfBounds
    {
        from: i64,
        to: i64,
    },
    Hole
    {
        from: i64,
        to: i64,
    },
    OverlapOrUnsorted
    {
        expected_from: i64,
        got: i64,
    },
    CoverageEndMismatch
    {
        expected_end: i64,
        n: usize,
    },
}

impl std::fmt::Display for RangeViolation
{
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result
    {
        match self
        {
            RangeViolation::ChunksEmpty => write!(f, "chunks_empty"),
            RangeViolation::NoValidRanges => write!(f, "chunks_no_valid_ranges"),
            RangeViolation::FirstFromNotZero(x) => write!(f, "first_from_not_0:{x}"),
            RangeViolation::LastToNotEnd { got, expected } => write!(f, "last_to_not_Nminus1:{got}!={expected}"),
            RangeViolation::OutOfBounds { from, to } => write!(f, "range_out_of_bounds:{from}-{to}"),
            RangeViolation::Hole { from, to } => write!(f, "hole:{from}..{to}"),
            RangeViolation::OverlapOrUnsorted { expected_from, got } =>
            {
                write!(f, "overlap_or_unsorted:expected_from={expected_from}, got={got}")
            }
            RangeViolation::CoverageEndMismatch { expected_end, n } =>
            {
                write!(f, "coverage_end_mismatch:expected_end={expected_end}, N={n}")
            }
        }
    }
}

fn as_int(v: Option<&Value>) -> Option<i64>
{
    let v = v?;

    if let Some(i) = v.as_i64()
    {
        return Some(i);
    }

    // Accept 3.0 but not 3.5
    v.as_f64()
        .filter(|f| f.fract() == 0.0 && f.is_finite())
        .map(|f| f as i64)
}

/// Read `{"chunks": [...]}` (or a bare array) from raw model output
pub fn parse_ranges(raw: &str) -> ParsedRanges
{
    let Ok(extracted) = extract_json(raw)
    else
    {
        return ParsedRanges::default();
    };

    let items = match &extracted.value
    {
        Value::Array(a) => a.as_slice(),
        Value::Object(o) => match o.get("chunks")
        {
            Some(Value::Array(a)) => a.as_slice(),
            _ => &[],
        },
        _ => &[],
    };

    let ranges = items
        .iter()
        .filter_map(|item| {
            let from = as_int(item.get("from"))?;
            let to = as_int(item.get("to"))?;
            let title = item
                .get("title")
                .and_then(Value::as_str)
                .map(str::to_string);
            Some(RangeSpec { from, to, title })
        })
        .collect();

    ParsedRanges { items: items.len(), ranges }
}

/// All partition violations of `parsed` against `n` lines, empty when valid
pub fn validate_ranges(
    parsed: &ParsedRanges,
    n: usize,
) -> Vec<RangeViolation>
{
    if parsed.items == 0
    {
        return vec![RangeViolation::ChunksEmpty];
    }

    let ranges = &parsed.ranges;
    let (Some(first), Some(last)) = (ranges.first(), ranges.last())
    else
    {
        return vec![RangeViolation::NoValidRanges];
    };

    let n_i = n as i64;
    let mut out = Vec::new();

    if first.from != 0
    {
        out.push(RangeViolation::FirstFromNotZero(first.from));
    }
    if last.to != n_i - 1
    {
        out.push(RangeViolation::LastToNotEnd { got: last.to, expected: n_i - 1 });
    }

    let mut expected_from = 0i64;

    for r in ranges
    {
        if r.from < 0 || r.to < 0 || r.from > r.to || r.to >= n_i
        {
            out.push(RangeViolation::OutOfBounds { from: r.from, to: r.to });
        }

        if r.from > expected_from
        {
            out.push(RangeViolation::Hole { from: expected_from, to: r.from - 1 });
        }
        else if r.from < expected_from
        {
            out.push(RangeViolation::OverlapOrUnsorted { expected_from, got: r.from });
        }

        expected_from = r.to + 1;
    }

    if expected_from != n_i
    {
        out.push(RangeViolation::CoverageEndMismatch { expected_end: expected_from, n });
    }

    out
}

fn codes(violations: &[RangeViolation]) -> Vec<String>
{
    violations
        .iter()
        .map(ToString::to_string)
        .collect()
}

pub struct SemanticStrategy<'s>
{
    service: &'s dyn TextCompletionService,
    cfg: SemanticConfig,
    target: usize,
    /// Line count from which a single returned range counts as degenerate
    degenerate_min_lines: usize,
}

impl<'s> SemanticStrategy<'s>
{
    pub fn new(
        service: &'s dyn TextCompletionService,
        cfg: SemanticConfig,
        target: usize,
        window_max_lines: usize,
    ) -> Self
    {
        Self {
            service,
            cfg,
            target: target.clamp(MIN_TARGET, MAX_TARGET),
            degenerate_min_lines: (window_max_lines * 2).max(60),
        }
    }

    pub fn target(&self) -> usize
    {
        self.target
    }

    fn system_prompt(
        &self,
        n: usize,
    ) -> String
    {
        let min_c = self
            .target
            .saturating_sub(2)
            .max(MIN_TARGET);
        let max_c = (self.target + 2).max(min_c);

        [
            "You are a strict semantic chunker.".to_string(),
            "You receive lines of text with integer indices from 0..N-1.".to_string(),
            "Return ONLY valid JSON (no markdown, no commentary).".to_string(),
            String::new(),
            "You MUST output chunks covering ALL lines with NO holes and NO overlaps.".to_string(),
            "Rules:".to_string(),
            "- from/to are INCLUSIVE.".to_string(),
            "- First chunk must have from=0.".to_string(),
            format!("- Last chunk must have to={}.", n.saturating_sub(1)),
            "- Chunks must be sorted by from ascending.".to_string(),
            "- No gaps: next.from must equal prev.to+1.".to_string(),
            "- No overlaps: a line cannot belong to two chunks.".to_string(),
            "- title must describe the chunk and be derived from its content (do not invent).".to_string(),
            String::new(),
            format!("Try to produce around {} chunks (allowed range: {min_c}..{max_c}).", self.target),
            String::new(),
            "Output schema:".to_string(),
            OUTPUT_SCHEMA.to_string(),
        ]
        .join("\n")
    }

    fn lines_block(lines: &[String]) -> String
    {
        let list: Vec<Value> = lines
            .iter()
            .enumerate()
            .map(|(i, t)| json!({ "i": i, "t": t }))
            .collect();

        format!("N={}\nLINES:\n{}", lines.len(), Value::Array(list))
    }

    fn repair_prompt(
        lines: &[String],
        violations: &[RangeViolation],
    ) -> String
    {
        format!(
            "{}\n\nYour previous JSON was invalid.\nVALIDATION_ERRORS: {}\n\nFix it and return ONLY valid JSON with schema:\n{OUTPUT_SCHEMA}",
            Self::lines_block(lines),
            Value::from(codes(violations)),
        )
    }

    fn options(&self) -> GenerateOptions
    {
        GenerateOptions {
            json_mode: true,
            temperature: 0.0,
            seed: Some(self.cfg.seed),
            timeout: Duration::from_millis(self.cfg.timeout_ms),
        }
    }

    fn build_chunks(
        &self,
        input: &ChunkInput<'_>,
        ranges: &[RangeSpec],
    ) -> Vec<Chunk>
    {
        let mut used_keys: HashMap<String, usize> = HashMap::new();
        let mut out = Vec::with_capacity(ranges.len());

        for (order, r) in ranges
            .iter()
            .enumerate()
        {
            // Bounds were validated against the line count
            let (from, to) = (r.from as usize, r.to as usize);
            let slice = &input.lines[from..=to];

            let title = r
                .title
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .or_else(|| {
                    slice
                        .iter()
                        .find(|l| {
                            !l.trim()
                                .is_empty()
                        })
                        .map(|l| text::excerpt(l, TITLE_CHARS))
                })
                .unwrap_or_else(|| format!("Chunk {}", order + 1));

            let base = text::slugify_key(&title, KEY_CHARS);
            let seen = used_keys
                .entry(base.clone())
                .or_insert(0);
            *seen += 1;
            let key = if *seen == 1 { base } else { format!("{base}_{seen}") };

            out.push(
                Chunk::new(input.source, order, title, slice.join("\n"))
                    .with_key(key)
                    .with_lines(from, to),
            );
        }

        out
    }
}

impl BoundaryStrategy for SemanticStrategy<'_>
{
    fn name(&self) -> &'static str
    {
        "semantic"
    }

    #[instrument(skip(self, input), fields(lines = input.lines.len(), target = self.target))]
    fn chunk(
        &self,
        input: &ChunkInput<'_>,
    ) -> Result<StrategyOutput, StrategyFailure>
    {
        let lines = input.lines;
        let n = lines.len();

        if n == 0
        {
            return Err(StrategyFailure::EmptyInput);
        }
        if n > self.cfg.max_lines
        {
            return Err(StrategyFailure::TooManyLines { lines: n, max: self.cfg.max_lines });
        }

        let system = self.system_prompt(n);
        let prompt = Self::lines_block(lines);
        let prompt_chars = prompt
            .chars()
            .count();

        if prompt_chars > self.cfg.max_prompt_chars
        {
            return Err(StrategyFailure::PromptTooLarge { chars: prompt_chars, max: self.cfg.max_prompt_chars });
        }

        let opts = self.options();

        // Service errors are not retried
        let raw = self
            .service
            .generate(&system, &prompt, &opts)?;
        let mut parsed = parse_ranges(&raw);
        let mut violations = validate_ranges(&parsed, n);
        let mut repaired = false;

        for round in 0..self.cfg.repair_rounds
        {
            if violations.is_empty()
            {
                break;
            }

            debug!(round, violations = ?codes(&violations), "semantic_chunker_repair");

            let raw = self
                .service
                .generate(&system, &Self::repair_prompt(lines, &violations), &opts)?;
            parsed = parse_ranges(&raw);
            violations = validate_ranges(&parsed, n);
            repaired = true;
        }

        if !violations.is_empty()
        {
            let violations = codes(&violations);
            warn!(lines = n, errors = ?violations, "semantic_chunker_invalid");
            return Err(StrategyFailure::InvalidRanges { violations });
        }

        if parsed.ranges.len() == 1 && n >= self.degenerate_min_lines
        {
            warn!(lines = n, threshold = self.degenerate_min_lines, "semantic_chunker_single_chunk_fallback");
            return Err(StrategyFailure::Degenerate { lines: n });
        }

        let chunks = self.build_chunks(input, &parsed.ranges);

        checked_output(ChunkMethod::Semantic { ranges: chunks.len(), repaired }, chunks)
    }
}
