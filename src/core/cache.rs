//! Canonical text selection and cached chunk set reuse.
//!
//! `ChunkCache::ensure` either returns the stored chunk set for a snapshot
//! (same canonical hash, compatible method family) or runs the configured
//! strategies in order, persists the result and returns it.

use tracing::{info, instrument, warn};

use crate::core::model::{
    AnchorTemplate, ChunkMethod, ChunkMode, ChunkSet, MethodFamily, Snapshot, SnapshotText, TextVariant,
    TextVariants,
};
use crate::core::strategy::{
    BoundaryStrategy, ChunkInput, SemanticStrategy, StrategyFailure, StrategyOutput, StructuralStrategy,
    TemplateStrategy, WindowStrategy, whole_text_output,
};
use crate::core::template::{TemplateBuilder, TemplateOrigin};
use crate::core::{anchor, text};
use crate::infra::config::Config;
use crate::infra::store::SnapshotStore;
use crate::llm::service::TextCompletionService;

/// Range count asked for when semantic mode is forced without a target
pub const DEFAULT_SEMANTIC_TARGET: usize = 8;

/// Per-call overrides for `ChunkCache::ensure`
#[derive(Debug, Clone, Copy, Default)]
pub struct EnsureOptions<'a>
{
    pub template: Option<&'a AnchorTemplate>,
    pub force_rebuild: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnsuredChunks
{
    pub set: ChunkSet,
    pub cache_hit: bool,
    /// Reason codes of strategies that failed before the one that produced `set`
    pub fallbacks: Vec<String>,
}

/// Clean lines keep the extractor's line structure, so they win over `clean_text`
fn clean_of(v: &TextVariants) -> Option<String>
{
    v.clean_lines
        .as_ref()
        .map(|lines| lines.join("\n"))
        .filter(|t| {
            !t.trim()
                .is_empty()
        })
        .or_else(|| v.clean_text.clone())
}

/// Highest priority non-blank text variant, canonicalised and hashed
pub fn pick_canonical(snapshot: &Snapshot) -> Option<SnapshotText>
{
    let candidates = [
        (TextVariant::ExtractedClean, clean_of(&snapshot.extracted)),
        (TextVariant::OcrClean, clean_of(&snapshot.ocr)),
        (
            TextVariant::ExtractedRaw,
            snapshot
                .extracted
                .raw_text
                .clone(),
        ),
        (
            TextVariant::OcrRaw,
            snapshot
                .ocr
                .raw_text
                .clone(),
        ),
    ];

    candidates
        .into_iter()
        .filter_map(|(variant, raw)| raw.map(|r| (variant, text::canonical_text(&r))))
        .find(|(_, canonical)| !canonical.is_empty())
        .map(|(variant, canonical)| SnapshotText::new(variant, canonical))
}

/// Whether a cached set of `family` may serve a request in `mode`
pub fn mode_accepts(
    mode: ChunkMode,
    family: MethodFamily,
    semantic_enabled: bool,
) -> bool
{
    match (mode, family)
    {
        (_, MethodFamily::Empty) => false,
        (ChunkMode::Deterministic, f) => f == MethodFamily::Deterministic,
        (ChunkMode::Template, f) => f == MethodFamily::Template,
        (ChunkMode::Semantic, f) => f == MethodFamily::Semantic,
        (ChunkMode::Auto, MethodFamily::Semantic) => semantic_enabled,
        (ChunkMode::Auto, _) => true,
    }
}

/// Full reuse check for a stored chunk set
pub fn should_reuse(
    cached: &ChunkSet,
    text_hash: &str,
    mode: ChunkMode,
    semantic_enabled: bool,
) -> bool
{
    cached.text_hash == text_hash
        && !cached.is_empty()
        && mode_accepts(mode, cached.method.family(), semantic_enabled)
        && cached
            .validate()
            .is_ok()
}

pub struct ChunkCache<'a>
{
    store: &'a dyn SnapshotStore,
    service: &'a dyn TextCompletionService,
    cfg: &'a Config,
}

impl<'a> ChunkCache<'a>
{
    pub fn new(
        store: &'a dyn SnapshotStore,
        service: &'a dyn TextCompletionService,
        cfg: &'a Config,
    ) -> Self
    {
        Self { store, service, cfg }
    }

    fn semantic_enabled(&self) -> bool
    {
        self.cfg
            .chunking
            .semantic
            .target_ranges
            > 0
    }

    /// Cached chunk set for `snapshot`, or a freshly computed and persisted one
    #[instrument(skip_all, fields(snapshot = %snapshot.id, mode = %self.cfg.chunking.mode))]
    pub fn ensure(
        &self,
        snapshot: &Snapshot,
        opts: EnsureOptions<'_>,
    ) -> EnsuredChunks
    {
        let Some(picked) = pick_canonical(snapshot)
        else
        {
            info!("snapshot_chunks_empty");
            return EnsuredChunks { set: ChunkSet::empty(None), cache_hit: false, fallbacks: Vec::new() };
        };

        let mode = self.cfg.chunking.mode;
        let force = opts.force_rebuild || self.cfg.chunking.force_rebuild;

        if !force
        {
            match self
                .store
                .load_chunks(&snapshot.id)
            {
                Ok(Some(cached))
                    if should_reuse(&cached, &picked.content_hash, mode, self.semantic_enabled())
                        && self.flavour_matches(&cached.method) =>
                {
                    info!(method = cached.method.label(), chunks = cached.len(), "snapshot_chunks_cache_hit");
                    return EnsuredChunks { set: cached, cache_hit: true, fallbacks: Vec::new() };
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "snapshot_chunks_cache_read_failed"),
            }
        }

        let lines = text::normalized_lines(
            &picked.text,
            self.cfg
                .chunking
                .window
                .max_chars,
        );
        let input = ChunkInput { canonical: &picked.text, lines: &lines, source: picked.source_kind() };

        let mut fallbacks = Vec::new();
        let output = self.resolve(snapshot, &input, opts.template, &mut fallbacks);

        let set = ChunkSet::new(output.method, Some(picked.variant), picked.content_hash, output.chunks);

        if let Err(e) = self
            .store
            .save_chunks(&snapshot.id, &set)
        {
            warn!(error = %e, "snapshot_chunks_persist_failed");
        }

        info!(
            method = set.method.label(),
            chunks = set.len(),
            source = %picked.variant,
            fallbacks = fallbacks.len(),
            "snapshot_chunks_ready"
        );

        EnsuredChunks { set, cache_hit: false, fallbacks }
    }

    /// Run strategies in mode order; line windows (or structural reflow) are the final fallback
    fn resolve(
        &self,
        snapshot: &Snapshot,
        input: &ChunkInput<'_>,
        supplied: Option<&AnchorTemplate>,
        fallbacks: &mut Vec<String>,
    ) -> StrategyOutput
    {
        let chunking = &self.cfg.chunking;
        let semantic_target = chunking.semantic.target_ranges;
        let supplied = supplied.filter(|tpl| self.template_usable(tpl, fallbacks));

        let attempt = match chunking.mode
        {
            ChunkMode::Deterministic => None,
            ChunkMode::Semantic =>
            {
                let target = if semantic_target > 0 { semantic_target } else { DEFAULT_SEMANTIC_TARGET };
                Some(self.run_semantic(input, target))
            }
            ChunkMode::Template => Some(self.run_forced_template(snapshot, input, supplied)),
            ChunkMode::Auto =>
            {
                let mut result = None;

                if self.semantic_enabled()
                {
                    match self.run_semantic(input, semantic_target)
                    {
                        Ok(out) => result = Some(Ok(out)),
                        Err(e) => note_failure("semantic", &e, fallbacks),
                    }
                }

                if result.is_none()
                {
                    result = supplied.map(|tpl| self.run_fitting_template(input, tpl));
                }

                result
            }
        };

        match attempt
        {
            Some(Ok(out)) => return out,
            Some(Err(e)) => note_failure(chunking.mode.to_string().as_str(), &e, fallbacks),
            None => {}
        }

        let deterministic: Box<dyn BoundaryStrategy> = if chunking.structural.enabled
        {
            Box::new(StructuralStrategy::new(
                chunking
                    .structural
                    .clone(),
                chunking
                    .window
                    .clone(),
            ))
        }
        else
        {
            Box::new(WindowStrategy::new(
                chunking
                    .window
                    .clone(),
            ))
        };

        match deterministic.chunk(input)
        {
            Ok(out) => out,
            Err(e) =>
            {
                note_failure(deterministic.name(), &e, fallbacks);
                whole_text_output(input)
            }
        }
    }

    /// Toggling structural reflow invalidates deterministic sets of the other flavour
    fn flavour_matches(
        &self,
        method: &ChunkMethod,
    ) -> bool
    {
        let structural = self
            .cfg
            .chunking
            .structural
            .enabled;

        match method
        {
            ChunkMethod::Deterministic { .. } => !structural,
            ChunkMethod::Structural { .. } => structural,
            _ => true,
        }
    }

    /// Templates loaded from files skip the builder, so their anchors are checked here
    fn template_usable(
        &self,
        template: &AnchorTemplate,
        fallbacks: &mut Vec<String>,
    ) -> bool
    {
        let cfg = &self.cfg.template;

        match template.validate(cfg.anchor_min_chars, cfg.anchor_max_chars)
        {
            Ok(()) => true,
            Err(issue) =>
            {
                note_failure("template", &StrategyFailure::InvalidTemplate(issue), fallbacks);
                false
            }
        }
    }

    fn run_semantic(
        &self,
        input: &ChunkInput<'_>,
        target: usize,
    ) -> Result<StrategyOutput, StrategyFailure>
    {
        let chunking = &self.cfg.chunking;

        SemanticStrategy::new(
            self.service,
            chunking
                .semantic
                .clone(),
            target,
            chunking
                .window
                .max_lines,
        )
        .chunk(input)
    }

    /// Auto mode only applies a supplied template that still fits
    fn run_fitting_template(
        &self,
        input: &ChunkInput<'_>,
        template: &AnchorTemplate,
    ) -> Result<StrategyOutput, StrategyFailure>
    {
        let fit = anchor::template_fit(input.canonical, template);
        let min = self
            .cfg
            .chunking
            .min_template_fit;

        if fit < min
        {
            return Err(StrategyFailure::NoAnchorsLocated { template_chunks: template.len() });
        }

        TemplateStrategy::new(template).chunk(input)
    }

    /// Forced template mode builds (or reuses the target's stored) template when none is supplied
    fn run_forced_template(
        &self,
        snapshot: &Snapshot,
        input: &ChunkInput<'_>,
        supplied: Option<&AnchorTemplate>,
    ) -> Result<StrategyOutput, StrategyFailure>
    {
        if let Some(tpl) = supplied
        {
            return TemplateStrategy::new(tpl).chunk(input);
        }

        let stored = snapshot
            .target_id
            .as_deref()
            .and_then(|target| {
                self.store
                    .load_template(target)
                    .unwrap_or_else(|e| {
                        warn!(error = %e, target, "template_load_failed");
                        None
                    })
            });

        let builder = TemplateBuilder::new(
            self.service,
            self.cfg
                .template
                .clone(),
            self.cfg
                .chunking
                .min_template_fit,
        );
        let outcome = builder.build_or_reuse(input.canonical, Some(input.source), stored.as_ref());

        if outcome.template.is_empty()
        {
            return Err(StrategyFailure::TemplateUnavailable);
        }

        let persist_target = snapshot
            .target_id
            .as_deref()
            .filter(|_| outcome.origin != TemplateOrigin::Reused);

        if let Some(target) = persist_target
        {
            if let Err(e) = self
                .store
                .save_template(target, &outcome.template)
            {
                warn!(error = %e, target, "template_persist_failed");
            }
        }

        TemplateStrategy::new(&outcome.template).chunk(input)
    }
}

fn note_failure(
    strategy: &str,
    failure: &StrategyFailure,
    fallbacks: &mut Vec<String>,
)
{
    let reason = failure.reason_code();
    warn!(strategy, reason = %reason, detail = %failure, "snapshot_chunks_strategy_failed");
    fallbacks.push(reason);
}
