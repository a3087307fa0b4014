//! Snapshot, chunk and template data model.
//!
//! `ChunkSet` and `AnchorTemplate` are the only persisted shapes; stores treat
//! them as opaque JSON documents. Both validate their own structure so a
//! strategy's output is checked at its boundary before it propagates.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::fingerprint::{self, FingerprintError};
use crate::core::template::TemplateIssue;
use crate::core::text;

/// Which extraction pipeline produced a piece of text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind
{
    Extracted,
    Ocr,
}

impl std::fmt::Display for SourceKind
{
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result
    {
        match self
        {
            SourceKind::Extracted => write!(f, "extracted"),
            SourceKind::Ocr => write!(f, "ocr"),
        }
    }
}

/// Concrete text variant picked as canonical for a snapshot, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextVariant
{
    ExtractedClean,
    OcrClean,
    ExtractedRaw,
    OcrRaw,
}

impl TextVariant
{
    pub fn kind(self) -> SourceKind
    {
        match self
        {
            TextVariant::ExtractedClean | TextVariant::ExtractedRaw => SourceKind::Extracted,
            TextVariant::OcrClean | TextVariant::OcrRaw => SourceKind::Ocr,
        }
    }
}

impl std::fmt::Display for TextVariant
{
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result
    {
        match self
        {
            TextVariant::ExtractedClean => write!(f, "extracted_clean"),
            TextVariant::OcrClean => write!(f, "ocr_clean"),
            TextVariant::ExtractedRaw => write!(f, "extracted_raw"),
            TextVariant::OcrRaw => write!(f, "ocr_raw"),
        }
    }
}

/// Text variants one extraction pipeline produced for a snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextVariants
{
    pub clean_text: Option<String>,
    pub clean_lines: Option<Vec<String>>,
    pub raw_text: Option<String>,
}

/// A captured page as handed over by the snapshot store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot
{
    pub id: String,

    /// Monitored target this snapshot belongs to (template reuse scope)
    #[serde(default)]
    pub target_id: Option<String>,

    #[serde(default)]
    pub extracted: TextVariants,

    #[serde(default)]
    pub ocr: TextVariants,
}

impl Snapshot
{
    /// Snapshot carrying a single extracted clean text
    pub fn from_extracted(
        id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self
    {
        Self {
            id: id.into(),
            extracted: TextVariants { clean_text: Some(text.into()), ..Default::default() },
            ..Default::default()
        }
    }

    /// Snapshot carrying a single OCR clean text
    pub fn from_ocr(
        id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self
    {
        Self {
            id: id.into(),
            ocr: TextVariants { clean_text: Some(text.into()), ..Default::default() },
            ..Default::default()
        }
    }
}

/// Canonical text picked for chunking, immutable per snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotText
{
    pub variant: TextVariant,
    pub text: String,
    pub content_hash: String,
}

impl SnapshotText
{
    pub fn new(
        variant: TextVariant,
        text: String,
    ) -> Self
    {
        let content_hash = text::content_hash(&text);
        Self { variant, text, content_hash }
    }

    pub fn source_kind(&self) -> SourceKind
    {
        self.variant
            .kind()
    }
}

/// Inclusive 0-based line span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSpan
{
    pub from: usize,
    pub to: usize,
}

/// One section of a snapshot's text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk
{
    /// Identity, stable across snapshots while content stays similar
    pub id: String,
    pub order: usize,
    #[serde(default)]
    pub key: Option<String>,
    pub title: String,
    pub text: String,
    /// 64-bit SimHash of the non-numeric tokens, 16 hex chars
    pub fingerprint: String,
    /// Sorted numeric values found in `text`
    pub numbers: Vec<f64>,
    pub source: SourceKind,
    #[serde(default)]
    pub lines: Option<LineSpan>,
}

impl Chunk
{
    /// Build a chunk, deriving fingerprint, numbers and a fresh id from the text
    pub fn new(
        source: SourceKind,
        order: usize,
        title: impl Into<String>,
        text: impl Into<String>,
    ) -> Self
    {
        let text = text.into();
        let fingerprint = fingerprint::to_hex(fingerprint::fingerprint_text(&text));
        let numbers = text::extract_numbers(&text);
        let id = fresh_chunk_id(source, order, &fingerprint);

        Self { id, order, key: None, title: title.into(), text, fingerprint, numbers, source, lines: None }
    }

    pub fn with_key(
        mut self,
        key: impl Into<String>,
    ) -> Self
    {
        self.key = Some(key.into());
        self
    }

    pub fn with_lines(
        mut self,
        from: usize,
        to: usize,
    ) -> Self
    {
        self.lines = Some(LineSpan { from, to });
        self
    }

    /// Decoded fingerprint value
    pub fn fingerprint_value(&self) -> Result<u64, FingerprintError>
    {
        fingerprint::parse_hex(&self.fingerprint)
    }
}

/// Deterministic id for a chunk that inherited no identity
pub fn fresh_chunk_id(
    source: SourceKind,
    index: usize,
    fingerprint: &str,
) -> String
{
    let digest = blake3::hash(format!("{source}:{index}:{fingerprint}").as_bytes());
    let hex = digest.to_hex();

    format!("c_{}", &hex.as_str()[..12])
}

/// Configured chunking mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChunkMode
{
    /// Semantic (if enabled), then template (if supplied), then fixed windows
    #[default]
    Auto,
    Deterministic,
    Template,
    Semantic,
}

impl std::fmt::Display for ChunkMode
{
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result
    {
        match self
        {
            ChunkMode::Auto => write!(f, "auto"),
            ChunkMode::Deterministic => write!(f, "deterministic"),
            ChunkMode::Template => write!(f, "template"),
            ChunkMode::Semantic => write!(f, "semantic"),
        }
    }
}

/// How a chunk set was produced, one variant per strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkMethod
{
    Empty,
    Deterministic
    {
        window_lines: usize,
        overlap: usize,
    },
    /// Reflowed paragraphs packed by character budget
    Structural
    {
        segments: usize,
        overlap: usize,
    },
    Template
    {
        fit: f64,
        template_chunks: usize,
    },
    Semantic
    {
        ranges: usize,
        repaired: bool,
    },
}

/// Coarse method grouping used by the cache reuse policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodFamily
{
    Empty,
    Deterministic,
    Template,
    Semantic,
}

impl ChunkMethod
{
    pub fn family(&self) -> MethodFamily
    {
        match self
        {
            ChunkMethod::Empty => MethodFamily::Empty,
            ChunkMethod::Deterministic { .. } | ChunkMethod::Structural { .. } => MethodFamily::Deterministic,
            ChunkMethod::Template { .. } => MethodFamily::Template,
            ChunkMethod::Semantic { .. } => MethodFamily::Semantic,
        }
    }

    pub fn label(&self) -> &'static str
    {
        match self
        {
            ChunkMethod::Empty => "empty",
            ChunkMethod::Deterministic { .. } => "deterministic",
            ChunkMethod::Structural { .. } => "structural",
            ChunkMethod::Template { .. } => "template",
            ChunkMethod::Semantic { .. } => "semantic",
        }
    }
}

/// Structural defects in a chunk set
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkSetError
{
    #[error("non-empty method `{0}` produced no chunks")]
    NoChunks(&'static str),

    #[error("chunk {order} has an empty id")]
    EmptyId
    {
        order: usize,
    },

    #[error("duplicate chunk id `{0}`")]
    DuplicateId(String),

    #[error("chunk order {got} out of sequence (expected {expected})")]
    OrderGap
    {
        expected: usize,
        got: usize,
    },

    #[error("chunk `{id}` has an invalid fingerprint")]
    BadFingerprint
    {
        id: String,
    },
}

/// All chunks of one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSet
{
    pub method: ChunkMethod,
    #[serde(default)]
    pub source: Option<TextVariant>,
    pub text_hash: String,
    pub chunks: Vec<Chunk>,
    pub created_at: DateTime<Utc>,
}

impl ChunkSet
{
    pub fn new(
        method: ChunkMethod,
        source: Option<TextVariant>,
        text_hash: impl Into<String>,
        chunks: Vec<Chunk>,
    ) -> Self
    {
        Self { method, source, text_hash: text_hash.into(), chunks, created_at: Utc::now() }
    }

    /// Result for a snapshot without any text
    pub fn empty(source: Option<TextVariant>) -> Self
    {
        Self::new(ChunkMethod::Empty, source, String::new(), Vec::new())
    }

    pub fn is_empty(&self) -> bool
    {
        self.chunks
            .is_empty()
    }

    pub fn len(&self) -> usize
    {
        self.chunks
            .len()
    }

    /// Check ids, ordering and fingerprints
    pub fn validate(&self) -> Result<(), ChunkSetError>
    {
        if self.chunks.is_empty() && self.method != ChunkMethod::Empty
        {
            return Err(ChunkSetError::NoChunks(
                self.method
                    .label(),
            ));
        }

        let mut seen = HashSet::with_capacity(self.chunks.len());

        for (expected, chunk) in self
            .chunks
            .iter()
            .enumerate()
        {
            if chunk.id.is_empty()
            {
                return Err(ChunkSetError::EmptyId { order: chunk.order });
            }
            if chunk.order != expected
            {
                return Err(ChunkSetError::OrderGap { expected, got: chunk.order });
            }
            if chunk
                .fingerprint_value()
                .is_err()
            {
                return Err(ChunkSetError::BadFingerprint { id: chunk.id.clone() });
            }
            if !seen.insert(chunk.id.as_str())
            {
                return Err(ChunkSetError::DuplicateId(chunk.id.clone()));
            }
        }

        Ok(())
    }
}

/// One section of an anchor template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateChunk
{
    pub key: String,
    pub title: String,
    /// Verbatim substrings of the source text, best first
    pub anchor_candidates: Vec<String>,
}

/// Ordered section waypoints reused across snapshots of one target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorTemplate
{
    pub chunks: Vec<TemplateChunk>,
}

impl AnchorTemplate
{
    pub fn is_empty(&self) -> bool
    {
        self.chunks
            .is_empty()
    }

    pub fn len(&self) -> usize
    {
        self.chunks
            .len()
    }

    /// Every chunk needs a unique key and at least one anchor of
    /// `min_anchor_chars..=max_anchor_chars` characters
    pub fn validate(
        &self,
        min_anchor_chars: usize,
        max_anchor_chars: usize,
    ) -> Result<(), TemplateIssue>
    {
        if self.chunks.is_empty()
        {
            return Err(TemplateIssue::Empty);
        }

        let mut keys = HashSet::new();

        for chunk in &self.chunks
        {
            if chunk
                .key
                .trim()
                .is_empty()
            {
                return Err(TemplateIssue::KeyMissing);
            }
            if !keys.insert(chunk.key.as_str())
            {
                return Err(TemplateIssue::DuplicateKey(chunk.key.clone()));
            }

            let bounded = chunk
                .anchor_candidates
                .iter()
                .any(|a| {
                    let n = a
                        .chars()
                        .count();
                    n > 0 && n >= min_anchor_chars && n <= max_anchor_chars
                });
            if !bounded
            {
                return Err(TemplateIssue::AnchorsMissing(chunk.key.clone()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn chunk_derives_fingerprint_numbers_and_id()
    {
        let a = Chunk::new(SourceKind::Extracted, 0, "t", "Price: 100 PLN");
        let b = Chunk::new(SourceKind::Extracted, 0, "t", "Price: 100 PLN");

        assert_eq!(a.id, b.id);
        assert_eq!(a.fingerprint.len(), 16);
        assert_eq!(a.numbers, vec![100.0]);
        assert!(a.id.starts_with("c_"));
    }

    #[test]
    fn fresh_id_depends_on_source_and_index()
    {
        let fp = "00ff00ff00ff00ff";

        assert_ne!(fresh_chunk_id(SourceKind::Ocr, 0, fp), fresh_chunk_id(SourceKind::Extracted, 0, fp));
        assert_ne!(fresh_chunk_id(SourceKind::Ocr, 0, fp), fresh_chunk_id(SourceKind::Ocr, 1, fp));
    }

    #[test]
    fn method_serializes_with_kind_tag()
    {
        let m = ChunkMethod::Deterministic { window_lines: 2, overlap: 0 };
        let json = serde_json::to_value(&m).expect("json");

        assert_eq!(json["kind"], "deterministic");
        assert_eq!(json["window_lines"], 2);
        assert_eq!(m.family(), MethodFamily::Deterministic);
    }

    #[test]
    fn validate_rejects_duplicate_ids_and_order_gaps()
    {
        let c0 = Chunk::new(SourceKind::Ocr, 0, "a", "alpha");
        let mut c1 = Chunk::new(SourceKind::Ocr, 1, "b", "beta");

        c1.id = c0.id.clone();
        let set = ChunkSet::new(ChunkMethod::Empty, None, "h", vec![c0.clone(), c1]);
        assert!(matches!(set.validate(), Err(ChunkSetError::DuplicateId(_))));

        let c2 = Chunk::new(SourceKind::Ocr, 5, "c", "gamma");
        let set = ChunkSet::new(ChunkMethod::Empty, None, "h", vec![c0, c2]);
        assert!(matches!(set.validate(), Err(ChunkSetError::OrderGap { expected: 1, got: 5 })));
    }

    #[test]
    fn validate_rejects_empty_non_empty_method()
    {
        let set = ChunkSet::new(ChunkMethod::Semantic { ranges: 0, repaired: false }, None, "h", vec![]);

        assert_eq!(set.validate(), Err(ChunkSetError::NoChunks("semantic")));
        assert!(ChunkSet::empty(None).validate().is_ok());
    }

    #[test]
    fn template_validation_requires_bounded_anchor()
    {
        let tpl = AnchorTemplate {
            chunks: vec![TemplateChunk {
                key: "intro".into(),
                title: "Intro".into(),
                anchor_candidates: vec!["x".repeat(120)],
            }],
        };

        assert_eq!(tpl.validate(14, 96), Err(TemplateIssue::AnchorsMissing("intro".into())));
        assert_eq!(AnchorTemplate::default().validate(14, 96), Err(TemplateIssue::Empty));
    }

    #[test]
    fn template_validation_rejects_short_anchors()
    {
        let mut tpl = AnchorTemplate {
            chunks: vec![TemplateChunk {
                key: "price".into(),
                title: "Price".into(),
                anchor_candidates: vec!["Price".into()],
            }],
        };

        assert_eq!(tpl.validate(14, 96), Err(TemplateIssue::AnchorsMissing("price".into())));

        tpl.chunks[0]
            .anchor_candidates
            .push("Price of the product is".into());
        assert!(tpl.validate(14, 96).is_ok());
    }
}
