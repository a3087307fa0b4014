//! Chunk boundary strategies.
//!
//! Each strategy turns one snapshot's text into an ordered chunk partition or
//! reports a coded failure so the caller can move on to the next strategy.

pub mod semantic;
pub mod structural;
pub mod template;
pub mod window;

use crate::core::model::{Chunk, ChunkMethod, ChunkSet, ChunkSetError, SourceKind};
use crate::core::template::TemplateIssue;
use crate::llm::service::ServiceError;

pub use semantic::{RangeSpec, RangeViolation, SemanticStrategy, validate_ranges};
pub use structural::StructuralStrategy;
pub use template::TemplateStrategy;
pub use window::WindowStrategy;

/// Text handed to a strategy
#[derive(Debug, Clone, Copy)]
pub struct ChunkInput<'a>
{
    /// Canonical text (see `text::canonical_text`)
    pub canonical: &'a str,
    /// Line list of `canonical` (see `text::chunk_lines`)
    pub lines: &'a [String],
    pub source: SourceKind,
}

/// Validated strategy result
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyOutput
{
    pub method: ChunkMethod,
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StrategyFailure
{
    #[error("no lines to chunk")]
    EmptyInput,

    #[error("none of {template_chunks} template anchors located")]
    NoAnchorsLocated
    {
        template_chunks: usize,
    },

    #[error("too many lines for semantic chunking: {lines} > {max}")]
    TooManyLines
    {
        lines: usize,
        max: usize,
    },

    #[error("semantic prompt too large: {chars} > {max}")]
    PromptTooLarge
    {
        chars: usize,
        max: usize,
    },

    #[error("completion service: {0}")]
    Service(#[from] ServiceError),

    #[error("invalid ranges: {}", .violations.join("; "))]
    InvalidRanges
    {
        violations: Vec<String>,
    },

    #[error("single range for {lines} lines")]
    Degenerate
    {
        lines: usize,
    },

    #[error("template could not be built")]
    TemplateUnavailable,

    #[error("supplied template rejected: {0}")]
    InvalidTemplate(TemplateIssue),

    #[error("strategy output failed validation: {0}")]
    Malformed(#[from] ChunkSetError),
}

impl StrategyFailure
{
    /// Stable code logged when falling back
    pub fn reason_code(&self) -> String
    {
        match self
        {
            StrategyFailure::EmptyInput => "no_lines".to_string(),
            StrategyFailure::NoAnchorsLocated { .. } => "no_anchors_located".to_string(),
            StrategyFailure::TooManyLines { lines, max } => format!("too_many_lines:{lines}>{max}"),
            StrategyFailure::PromptTooLarge { chars, max } => format!("prompt_too_big:{chars}>{max}"),
            StrategyFailure::Service(e) => format!("service_{}", e.code()),
            StrategyFailure::InvalidRanges { .. } => "invalid_ranges".to_string(),
            StrategyFailure::Degenerate { .. } => "single_range_for_large_input".to_string(),
            StrategyFailure::TemplateUnavailable => "template_unavailable".to_string(),
            StrategyFailure::InvalidTemplate(_) => "template_invalid".to_string(),
            StrategyFailure::Malformed(_) => "malformed_output".to_string(),
        }
    }
}

pub trait BoundaryStrategy
{
    fn name(&self) -> &'static str;

    fn chunk(
        &self,
        input: &ChunkInput<'_>,
    ) -> Result<StrategyOutput, StrategyFailure>;
}

/// Structural check every strategy runs on its own output
pub(crate) fn checked_output(
    method: ChunkMethod,
    chunks: Vec<Chunk>,
) -> Result<StrategyOutput, StrategyFailure>
{
    let staged = ChunkSet::new(method, None, "", chunks);
    staged.validate()?;

    Ok(StrategyOutput { method: staged.method, chunks: staged.chunks })
}

/// Single chunk holding the whole text, the last resort for non-empty input
pub fn whole_text_output(input: &ChunkInput<'_>) -> StrategyOutput
{
    let n = input.lines.len();
    let chunk = Chunk::new(input.source, 0, "Full text", input.canonical)
        .with_lines(0, n.saturating_sub(1));

    StrategyOutput { method: ChunkMethod::Deterministic { window_lines: n, overlap: 0 }, chunks: vec![chunk] }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn reason_codes_carry_detail()
    {
        assert_eq!(StrategyFailure::TooManyLines { lines: 500, max: 420 }.reason_code(), "too_many_lines:500>420");
        assert_eq!(
            StrategyFailure::Service(ServiceError::Timeout { timeout_ms: 5 }).reason_code(),
            "service_timeout"
        );
    }

    #[test]
    fn checked_output_rejects_empty_chunk_list()
    {
        let got = checked_output(ChunkMethod::Template { fit: 1.0, template_chunks: 2 }, vec![]);

        assert!(matches!(got, Err(StrategyFailure::Malformed(ChunkSetError::NoChunks("template")))));
    }
}
