//! Deterministic fixed-window chunking over the normalized line list, capped
//! by a per-window character budget.

use crate::core::model::{Chunk, ChunkMethod};
use crate::core::strategy::{BoundaryStrategy, ChunkInput, StrategyFailure, StrategyOutput, checked_output};
use crate::infra::config::WindowConfig;

/// Lines per window the auto sizing aims at
const AUTO_TARGET_LINES: f64 = 22.0;

#[derive(Debug, Clone)]
pub struct WindowStrategy
{
    cfg: WindowConfig,
}

impl WindowStrategy
{
    pub fn new(cfg: WindowConfig) -> Self
    {
        Self { cfg }
    }

    /// Window length in lines for an input of `n` lines
    pub fn window_size(
        &self,
        n: usize,
    ) -> usize
    {
        let cap = self
            .cfg
            .max_lines
            .max(1);

        if self.cfg.fixed_lines > 0
        {
            return self
                .cfg
                .fixed_lines
                .clamp(1, cap);
        }

        let lo = self
            .cfg
            .auto_min_lines
            .max(1);
        let hi = self
            .cfg
            .auto_max_lines
            .max(lo);

        // Split into roughly even windows of ~22 lines
        let groups = ((n as f64 / AUTO_TARGET_LINES).round() as usize).max(1);
        let size = n.div_ceil(groups);

        size.clamp(lo, hi)
            .min(cap)
    }

    /// Last line of the window starting at `from` that keeps it within the
    /// character budget; the first line always fits
    fn fit_budget(
        &self,
        widths: &[usize],
        from: usize,
        to: usize,
    ) -> usize
    {
        let budget = self
            .cfg
            .max_chars;
        if budget == 0
        {
            return to;
        }

        let mut used = widths[from];
        let mut end = from;

        while end < to && used + 1 + widths[end + 1] <= budget
        {
            end += 1;
            used += 1 + widths[end];
        }

        end
    }

    /// Overlap never reaches the window size so every step advances
    pub fn effective_overlap(
        &self,
        size: usize,
    ) -> usize
    {
        self.cfg
            .overlap
            .min(size.saturating_sub(1))
    }
}

impl BoundaryStrategy for WindowStrategy
{
    fn name(&self) -> &'static str
    {
        "deterministic"
    }

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

        let size = self.window_size(n);
        let overlap = self.effective_overlap(size);
        let widths: Vec<usize> = lines
            .iter()
            .map(|l| l.chars().count())
            .collect();

        let mut chunks = Vec::new();
        let mut from = 0usize;

        loop
        {
            let to = self.fit_budget(&widths, from, (from + size - 1).min(n - 1));
            let body = lines[from..=to].join("\n");
            let title = format!("Lines {}-{}", from + 1, to + 1);

            chunks.push(Chunk::new(input.source, chunks.len(), title, body).with_lines(from, to));

            if to + 1 >= n
            {
                break;
            }

            from = (to + 1)
                .saturating_sub(overlap)
                .max(from + 1);
        }

        checked_output(ChunkMethod::Deterministic { window_lines: size, overlap }, chunks)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::core::model::SourceKind;

    fn lines(n: usize) -> Vec<String>
    {
        (0..n)
            .map(|i| format!("line number {i}"))
            .collect()
    }

    fn run(
        cfg: WindowConfig,
        lines: &[String],
    ) -> StrategyOutput
    {
        let canonical = lines.join("\n");
        let input = ChunkInput { canonical: &canonical, lines, source: SourceKind::Extracted };

        WindowStrategy::new(cfg)
            .chunk(&input)
            .expect("window chunking")
    }

    #[test]
    fn fixed_window_covers_all_lines_in_order()
    {
        let cfg = WindowConfig { fixed_lines: 2, ..Default::default() };
        let out = run(cfg, &lines(5));

        let spans: Vec<_> = out
            .chunks
            .iter()
            .map(|c| c.lines.map(|l| (l.from, l.to)))
            .collect();

        assert_eq!(spans, vec![Some((0, 1)), Some((2, 3)), Some((4, 4))]);
        assert_eq!(out.chunks[2].title, "Lines 5-5");
        assert_eq!(out.method, ChunkMethod::Deterministic { window_lines: 2, overlap: 0 });
    }

    #[test]
    fn overlap_repeats_lines_but_progresses()
    {
        let cfg = WindowConfig { fixed_lines: 3, overlap: 5, ..Default::default() };
        let out = run(cfg, &lines(7));

        let starts: Vec<_> = out
            .chunks
            .iter()
            .filter_map(|c| c.lines.map(|l| l.from))
            .collect();

        // Overlap is capped at size - 1
        assert_eq!(starts, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn char_budget_shortens_windows()
    {
        let wide: Vec<String> = (0..10)
            .map(|i| format!("{i}{}", "x".repeat(99)))
            .collect();
        let cfg = WindowConfig { fixed_lines: 5, max_chars: 350, ..Default::default() };
        let out = run(cfg, &wide);

        let spans: Vec<_> = out
            .chunks
            .iter()
            .map(|c| c.lines.map(|l| (l.from, l.to)))
            .collect();

        // Three 100-char lines plus two newlines fit, a fourth does not
        assert_eq!(spans, vec![Some((0, 2)), Some((3, 5)), Some((6, 8)), Some((9, 9))]);
        assert!(out
            .chunks
            .iter()
            .all(|c| c.text.chars().count() <= 350));
    }

    #[test]
    fn budget_with_overlap_still_progresses()
    {
        let wide: Vec<String> = (0..4)
            .map(|i| format!("{i}{}", "y".repeat(99)))
            .collect();
        let cfg = WindowConfig { fixed_lines: 4, overlap: 3, max_chars: 150, ..Default::default() };
        let out = run(cfg, &wide);

        let starts: Vec<_> = out
            .chunks
            .iter()
            .filter_map(|c| c.lines.map(|l| l.from))
            .collect();

        assert_eq!(starts, vec![0, 1, 2, 3]);
    }

    #[test]
    fn auto_size_stays_within_bounds()
    {
        let s = WindowStrategy::new(WindowConfig::default());

        assert_eq!(s.window_size(5), 18);
        assert_eq!(s.window_size(44), 22);
        assert_eq!(s.window_size(100), 20);
        assert!(s.window_size(10_000) <= 28);
    }

    #[test]
    fn fixed_size_is_capped_by_max_lines()
    {
        let s = WindowStrategy::new(WindowConfig { fixed_lines: 500, ..Default::default() });

        assert_eq!(s.window_size(1000), 35);
    }

    #[test]
    fn empty_input_fails()
    {
        let input = ChunkInput { canonical: "", lines: &[], source: SourceKind::Ocr };

        assert_eq!(
            WindowStrategy::new(WindowConfig::default()).chunk(&input),
            Err(StrategyFailure::EmptyInput)
        );
    }
}
