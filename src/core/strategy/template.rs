//! Anchor template chunking.
//!
//! Each located anchor opens a chunk that runs until the next located anchor
//! (or the end of the text). Text before the first located anchor is not part
//! of any chunk.

use crate::core::anchor::{LocatedAnchor, locate_template};
use crate::core::model::{AnchorTemplate, Chunk, ChunkMethod};
use crate::core::strategy::{BoundaryStrategy, ChunkInput, StrategyFailure, StrategyOutput, checked_output};

#[derive(Debug, Clone, Copy)]
pub struct TemplateStrategy<'t>
{
    template: &'t AnchorTemplate,
}

impl<'t> TemplateStrategy<'t>
{
    pub fn new(template: &'t AnchorTemplate) -> Self
    {
        Self { template }
    }
}

/// 0-based line number of byte offset `at`
fn line_of(
    text: &str,
    at: usize,
) -> usize
{
    text.as_bytes()[..at.min(text.len())]
        .iter()
        .filter(|b| **b == b'\n')
        .count()
}

impl BoundaryStrategy for TemplateStrategy<'_>
{
    fn name(&self) -> &'static str
    {
        "template"
    }

    fn chunk(
        &self,
        input: &ChunkInput<'_>,
    ) -> Result<StrategyOutput, StrategyFailure>
    {
        let text = input.canonical;
        let total = self
            .template
            .len();

        if text.is_empty()
        {
            return Err(StrategyFailure::EmptyInput);
        }

        let located: Vec<LocatedAnchor> = locate_template(text, self.template);
        if located.is_empty()
        {
            return Err(StrategyFailure::NoAnchorsLocated { template_chunks: total });
        }

        let mut chunks = Vec::with_capacity(located.len());

        for (i, loc) in located
            .iter()
            .enumerate()
        {
            // Span ends where the next located anchor starts
            let end = located
                .get(i + 1)
                .map_or(text.len(), |next| next.start);
            let raw = &text[loc.start..end];
            let body = raw.trim();

            if body.is_empty()
            {
                continue;
            }

            let tpl_chunk = &self.template.chunks[loc.chunk_index];
            let first_line = line_of(text, loc.start);
            let last_line = line_of(text, loc.start + raw.trim_end().len());

            chunks.push(
                Chunk::new(input.source, chunks.len(), tpl_chunk.title.clone(), body)
                    .with_key(tpl_chunk.key.clone())
                    .with_lines(first_line, last_line),
            );
        }

        let fit = located.len() as f64 / total as f64;

        checked_output(ChunkMethod::Template { fit, template_chunks: total }, chunks)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::core::model::{SourceKind, TemplateChunk};

    fn template() -> AnchorTemplate
    {
        let section = |key: &str, anchor: &str| TemplateChunk {
            key: key.into(),
            title: key.to_uppercase(),
            anchor_candidates: vec![anchor.into()],
        };

        AnchorTemplate {
            chunks: vec![
                section("price", "Price of the product"),
                section("missing", "This anchor is nowhere"),
                section("reviews", "Customer reviews"),
            ],
        }
    }

    #[test]
    fn chunks_run_between_located_anchors()
    {
        let text = "Header noise\nPrice of the product: 100 PLN\nIn stock\n\nCustomer reviews\nGreat kettle";
        let input = ChunkInput { canonical: text, lines: &[], source: SourceKind::Extracted };
        let tpl = template();

        let out = TemplateStrategy::new(&tpl)
            .chunk(&input)
            .expect("template chunking");

        assert_eq!(out.chunks.len(), 2);
        assert_eq!(out.chunks[0].key.as_deref(), Some("price"));
        assert_eq!(out.chunks[0].text, "Price of the product: 100 PLN\nIn stock");
        assert_eq!(out.chunks[1].text, "Customer reviews\nGreat kettle");
        assert_eq!(out.chunks[1].lines.map(|l| (l.from, l.to)), Some((4, 5)));
        assert!(!out.chunks[0].text.contains("Header"));

        match out.method
        {
            ChunkMethod::Template { fit, template_chunks } =>
            {
                assert!((fit - 2.0 / 3.0).abs() < 1e-9);
                assert_eq!(template_chunks, 3);
            }
            other => panic!("unexpected method {other:?}"),
        }
    }

    #[test]
    fn no_located_anchor_fails()
    {
        let input = ChunkInput { canonical: "unrelated text", lines: &[], source: SourceKind::Ocr };
        let tpl = template();

        assert_eq!(
            TemplateStrategy::new(&tpl).chunk(&input),
            Err(StrategyFailure::NoAnchorsLocated { template_chunks: 3 })
        );
    }
}
