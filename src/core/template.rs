//! Anchor template generation.
//!
//! The builder asks the completion service for a template, normalises the
//! loosely shaped JSON it gets back, checks that the template fits its own
//! source text, and repairs it a bounded number of times. When that does not
//! converge it derives a template from the text itself, so a caller always
//! gets something usable.

use std::collections::HashSet;
use std::time::Duration;

use itertools::Itertools;
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use crate::core::anchor::template_fit;
use crate::core::model::{AnchorTemplate, SourceKind, TemplateChunk};
use crate::core::text;
use crate::infra::config::TemplateConfig;
use crate::llm::json::{ExtractionStage, extract_json};
use crate::llm::service::{GenerateOptions, ServiceError, TextCompletionService};

/// Characters of a bad response echoed into the repair prompt
const REPAIR_ECHO_CHARS: usize = 2000;

/// Why a template response was rejected
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateIssue
{
    #[error("TEMPLATE_UNPARSEABLE")]
    Unparseable,

    #[error("TEMPLATE_NOT_OBJECT")]
    NotObject,

    #[error("TEMPLATE_NO_CHUNKS_ARRAY")]
    NoChunksArray,

    #[error("TEMPLATE_EMPTY")]
    Empty,

    #[error("CHUNK_NOT_OBJECT")]
    ChunkNotObject,

    #[error("CHUNK_KEY_MISSING")]
    KeyMissing,

    #[error("CHUNK_KEY_DUPLICATE:{0}")]
    DuplicateKey(String),

    #[error("CHUNK_ANCHORS_MISSING:{0}")]
    AnchorsMissing(String),

    #[error("LOW_FIT_RATIO({0:.3})")]
    LowFit(f64),

    #[error("SERVICE_FAILURE:{0}")]
    Service(String),
}

impl TemplateIssue
{
    pub fn code(&self) -> String
    {
        self.to_string()
    }
}

impl From<ServiceError> for TemplateIssue
{
    fn from(e: ServiceError) -> Self
    {
        TemplateIssue::Service(e.to_string())
    }
}

/// Result of parsing one model response
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateVerdict
{
    Valid
    {
        template: AnchorTemplate,
        stage: ExtractionStage,
    },
    Invalid(TemplateIssue),
}

/// Where a returned template came from
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateOrigin
{
    /// Supplied template still fits the text
    Reused,
    Generated
    {
        repairs: usize,
    },
    /// Derived from the text after generation did not converge
    Fallback
    {
        reason: String,
        repairs: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemplateOutcome
{
    pub template: AnchorTemplate,
    /// Fit on the text the template was built or checked against
    pub fit: f64,
    pub origin: TemplateOrigin,
}

fn str_field<'v>(
    obj: &'v Map<String, Value>,
    names: &[&str],
) -> Option<&'v str>
{
    names
        .iter()
        .filter_map(|n| obj.get(*n))
        .filter_map(Value::as_str)
        .find(|s| {
            !s.trim()
                .is_empty()
        })
}

/// Anchor aliases merged, normalised, deduplicated and length filtered
fn anchor_candidates(
    obj: &Map<String, Value>,
    cfg: &TemplateConfig,
) -> Vec<String>
{
    let mut raw: Vec<&str> = Vec::new();

    for name in ["anchor_candidates", "anchors", "anchor", "anchorCandidates"]
    {
        match obj.get(name)
        {
            Some(Value::Array(items)) => raw.extend(
                items
                    .iter()
                    .filter_map(Value::as_str),
            ),
            Some(Value::String(s)) => raw.push(s),
            _ => {}
        }
    }

    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for a in raw
    {
        let norm = text::normalize_whitespace(a);
        if norm.is_empty() || !seen.insert(norm.to_lowercase())
        {
            continue;
        }

        let cut = text::truncate_chars(&norm, cfg.anchor_max_chars);
        if cut
            .chars()
            .count()
            >= cfg.anchor_min_chars
        {
            out.push(cut.to_string());
        }
    }

    out
}

/// Turn a parsed JSON value into a template, tolerating common shape drift
pub fn normalize_template(
    value: &Value,
    cfg: &TemplateConfig,
) -> Result<AnchorTemplate, TemplateIssue>
{
    // Unwrap {"template": {...}}
    let value = match value.get("template")
    {
        Some(inner @ Value::Object(_)) => inner,
        _ => value,
    };

    let Value::Object(obj) = value
    else
    {
        return Err(TemplateIssue::NotObject);
    };

    let items = ["chunks", "sections", "parts"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_array))
        .ok_or(TemplateIssue::NoChunksArray)?;

    if items.is_empty()
    {
        return Err(TemplateIssue::Empty);
    }

    let mut chunks: Vec<TemplateChunk> = Vec::new();
    let mut keys = HashSet::new();
    let mut first_issue: Option<TemplateIssue> = None;

    for (idx, item) in items
        .iter()
        .enumerate()
    {
        let Value::Object(c) = item
        else
        {
            if first_issue.is_none()
            {
                first_issue = Some(TemplateIssue::ChunkNotObject);
            }
            continue;
        };

        let title = str_field(c, &["title", "label", "name", "heading"]).map(text::normalize_whitespace);
        let key = match (str_field(c, &["key", "id", "slug"]), &title)
        {
            (Some(k), _) => text::slugify_key(k, 48),
            (None, Some(t)) => text::slugify_key(t, 48),
            (None, None) => format!("chunk_{}", idx + 1),
        };

        let anchors = anchor_candidates(c, cfg);
        if anchors.is_empty()
        {
            if first_issue.is_none()
            {
                first_issue = Some(TemplateIssue::AnchorsMissing(key));
            }
            continue;
        }

        // Duplicate keys keep the first
        if !keys.insert(key.clone())
        {
            continue;
        }

        chunks.push(TemplateChunk { title: title.unwrap_or_else(|| key.clone()), key, anchor_candidates: anchors });
    }

    chunks.truncate(cfg.max_chunks);

    if chunks.is_empty()
    {
        return Err(first_issue.unwrap_or(TemplateIssue::Empty));
    }

    let template = AnchorTemplate { chunks };
    template.validate(cfg.anchor_min_chars, cfg.anchor_max_chars)?;

    Ok(template)
}

/// Strict-then-lenient JSON extraction followed by normalisation
pub fn parse_template(
    raw: &str,
    cfg: &TemplateConfig,
) -> TemplateVerdict
{
    let extracted = match extract_json(raw)
    {
        Ok(x) => x,
        Err(_) => return TemplateVerdict::Invalid(TemplateIssue::Unparseable),
    };

    match normalize_template(&extracted.value, cfg)
    {
        Ok(template) => TemplateVerdict::Valid { template, stage: extracted.stage },
        Err(issue) => TemplateVerdict::Invalid(issue),
    }
}

/// Byte spans of `parts` in `src`, searched in order
fn part_spans(
    src: &str,
    parts: &[String],
) -> Vec<(usize, usize)>
{
    let mut cursor = 0usize;

    parts
        .iter()
        .map(|part| match src[cursor..].find(part.as_str())
        {
            Some(at) =>
            {
                let start = cursor + at;
                cursor = start + part.len();
                (start, cursor)
            }
            None => (cursor, cursor),
        })
        .collect()
}

/// Deterministic template whose anchors are the opening words of text blocks
pub fn fallback_template(
    source_text: &str,
    cfg: &TemplateConfig,
) -> AnchorTemplate
{
    let src = source_text.trim();
    if src.is_empty()
    {
        return AnchorTemplate::default();
    }

    let min_parts = cfg
        .min_chunks
        .max(1);
    let pieces = |sep: &str| -> Vec<String> {
        src.split(sep)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    };

    // Blank lines, then single newlines, then sentences
    let mut parts = pieces("\n\n");
    if parts.len() < min_parts
    {
        parts = pieces("\n");
    }
    if parts.len() < min_parts
    {
        parts = text::split_sentences(src);
    }

    let lo = min_parts;
    let hi = cfg
        .max_chunks
        .max(lo);
    let per_group = cfg
        .fallback_chars_per_group
        .max(1) as f64;
    let target = ((src.chars().count() as f64 / per_group).round() as usize).clamp(lo, hi);

    // Groups stay slices of the source so anchors are copied verbatim
    let spans = part_spans(src, &parts);
    let group = if spans.len() > target { spans.len().div_ceil(target) } else { 1 };
    let groups: Vec<&str> = spans
        .chunks(group)
        .filter_map(|g| Some(&src[g.first()?.0..g.last()?.1]))
        .collect();

    let chunks = groups
        .iter()
        .take(cfg.max_chunks)
        .enumerate()
        .map(|(i, block)| {
            let mut anchor = text::opening_words(block, cfg.fallback_anchor_words, cfg.anchor_max_chars);
            if anchor
                .chars()
                .count()
                < cfg.anchor_min_chars
            {
                anchor = text::opening_words(block, usize::MAX, cfg.anchor_max_chars);
            }

            let title = if block.trim().is_empty()
            {
                format!("Section {}", i + 1)
            }
            else
            {
                block
                    .split_whitespace()
                    .take(4)
                    .join(" ")
            };

            TemplateChunk { key: format!("section_{}", i + 1), title, anchor_candidates: vec![anchor.to_string()] }
        })
        .collect();

    AnchorTemplate { chunks }
}

const SYSTEM_PROMPT: &str = "\
You split page text into stable topical sections.
Input: raw TEXT of a web page (DOM extraction or OCR).

Split TEXT into meaningful sections that stay stable between captures of the same page \
(e.g. \"Reviews\", \"Specifications\", \"Contact\", \"FAQ\", \"Terms\", \"Pricing\").

Do NOT extract data (no product lists, no prices).
anchor_candidates MUST be literal fragments copied from TEXT (exact copy/paste).
Anchors should have 4-12 words, ideally from a heading or a fixed section label.

Return ONLY valid JSON shaped like:
{
  \"chunks\": [
    { \"key\": \"stable_id\", \"title\": \"Section name\", \"anchor_candidates\": [\"exact fragment of TEXT\", \"...\"] }
  ]
}

Rules:
- key: short stable identifier (slug), no spaces.
- Do not repeat keys.
- Give 3-6 anchor_candidates per chunk.
- Long TEXT: 6-18 chunks. Short TEXT: 2-6 chunks.";

pub struct TemplateBuilder<'s>
{
    service: &'s dyn TextCompletionService,
    cfg: TemplateConfig,
    /// Minimum fit for reusing a supplied template
    min_reuse_fit: f64,
}

impl<'s> TemplateBuilder<'s>
{
    pub fn new(
        service: &'s dyn TextCompletionService,
        cfg: TemplateConfig,
        min_reuse_fit: f64,
    ) -> Self
    {
        Self { service, cfg, min_reuse_fit }
    }

    fn options(&self) -> GenerateOptions
    {
        GenerateOptions {
            json_mode: true,
            temperature: self.cfg.temperature,
            seed: None,
            timeout: Duration::from_millis(self.cfg.timeout_ms),
        }
    }

    fn prompt(
        text: &str,
        source: Option<SourceKind>,
    ) -> String
    {
        let source = source.map_or_else(|| "unknown".to_string(), |s| s.to_string());

        format!("SOURCE: {source}\n\nTEXT:\n{text}")
    }

    fn repair_prompt(
        text: &str,
        source: Option<SourceKind>,
        bad_output: &str,
        issue: &TemplateIssue,
    ) -> String
    {
        [
            "Your previous JSON answer was INVALID for the required chunk template schema.".to_string(),
            format!("Reason: {}", issue.code()),
            String::new(),
            "FIX it and return ONLY JSON shaped like {chunks:[{key,title,anchor_candidates}]}.".to_string(),
            "anchor_candidates MUST be copied verbatim from TEXT.".to_string(),
            String::new(),
            "Previous answer (to be fixed):".to_string(),
            text::truncate_chars(bad_output, REPAIR_ECHO_CHARS).to_string(),
            String::new(),
            "---".to_string(),
            Self::prompt(text, source),
        ]
        .join("\n")
    }

    /// Check a response against the schema and the fit gate
    fn judge(
        &self,
        raw: &str,
        text: &str,
    ) -> Result<(AnchorTemplate, f64), TemplateIssue>
    {
        let template = match parse_template(raw, &self.cfg)
        {
            TemplateVerdict::Valid { template, .. } => template,
            TemplateVerdict::Invalid(issue) => return Err(issue),
        };

        let fit = template_fit(text, &template);
        if fit >= self.cfg.min_fit_new
        {
            Ok((template, fit))
        }
        else
        {
            Err(TemplateIssue::LowFit(fit))
        }
    }

    /// Generate a template for `text`, repairing and finally falling back
    #[instrument(skip(self, text), fields(chars = text.len()))]
    pub fn build(
        &self,
        text: &str,
        source: Option<SourceKind>,
    ) -> TemplateOutcome
    {
        let text = text.trim();
        if text.is_empty()
        {
            return TemplateOutcome {
                template: AnchorTemplate::default(),
                fit: 0.0,
                origin: TemplateOrigin::Fallback { reason: TemplateIssue::Empty.code(), repairs: 0 },
            };
        }

        let opts = self.options();
        let prompt = Self::prompt(text, source);

        // A failed first call still enters the repair loop
        let (mut last_raw, mut issue) = match self
            .service
            .generate(SYSTEM_PROMPT, &prompt, &opts)
        {
            Ok(raw) => (raw, None),
            Err(e) => (String::new(), Some(TemplateIssue::from(e))),
        };
        let mut repairs = 0usize;

        for attempt in 0..=self.cfg.repair_rounds
        {
            if attempt > 0 || issue.is_none()
            {
                match self.judge(&last_raw, text)
                {
                    Ok((template, fit)) =>
                    {
                        info!(chunks = template.len(), fit, repairs, "template_build_ok");
                        return TemplateOutcome { template, fit, origin: TemplateOrigin::Generated { repairs } };
                    }
                    Err(e) => issue = Some(e),
                }
            }

            if attempt >= self.cfg.repair_rounds
            {
                break;
            }

            let current = issue
                .clone()
                .unwrap_or(TemplateIssue::Unparseable);
            repairs += 1;

            match self.service.generate(
                SYSTEM_PROMPT,
                &Self::repair_prompt(text, source, &last_raw, &current),
                &opts,
            )
            {
                Ok(raw) => last_raw = raw,
                Err(e) =>
                {
                    // Service trouble during repair ends the loop
                    issue = Some(TemplateIssue::from(e));
                    break;
                }
            }
        }

        let reason = issue
            .unwrap_or(TemplateIssue::Unparseable)
            .code();
        let template = fallback_template(text, &self.cfg);
        let fit = template_fit(text, &template);

        warn!(reason = %reason, repairs, chunks = template.len(), fit, "template_build_fallback");

        TemplateOutcome { template, fit, origin: TemplateOrigin::Fallback { reason, repairs } }
    }

    /// Return `reuse` while it still fits `text`, otherwise build a new template
    pub fn build_or_reuse(
        &self,
        text: &str,
        source: Option<SourceKind>,
        reuse: Option<&AnchorTemplate>,
    ) -> TemplateOutcome
    {
        if let Some(existing) = reuse.filter(|t| !t.is_empty())
        {
            if let Err(issue) = existing.validate(self.cfg.anchor_min_chars, self.cfg.anchor_max_chars)
            {
                warn!(issue = %issue, "template_reuse_invalid");
                return self.build(text, source);
            }

            let fit = template_fit(text, existing);
            if fit >= self.min_reuse_fit
            {
                return TemplateOutcome { template: existing.clone(), fit, origin: TemplateOrigin::Reused };
            }

            info!(fit, min = self.min_reuse_fit, "template_reuse_rejected");
        }

        self.build(text, source)
    }
}
