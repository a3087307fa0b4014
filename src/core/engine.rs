//! Engine facade: chunk, stabilise and diff snapshots.
//!
//! All completion calls made by one engine share a `CompletionGate`. Build
//! several engines with `Engine::with_gate` to share one gate across them.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::cache::{ChunkCache, EnsureOptions, EnsuredChunks, pick_canonical};
use crate::core::diff::{self, DiffOptions, DiffResult, DiffScorer};
use crate::core::fingerprint::{FingerprintMatcher, MatchStats};
use crate::core::model::{AnchorTemplate, ChunkSet, Snapshot};
use crate::core::template::{TemplateBuilder, TemplateOrigin, TemplateOutcome};
use crate::infra::config::Config;
use crate::infra::store::SnapshotStore;
use crate::llm::gate::CompletionGate;
use crate::llm::service::{GatedService, TextCompletionService};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError
{
    #[error("snapshot has no id")]
    MissingSnapshotId,
}

/// Result of tracking one snapshot against its predecessor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotReport
{
    pub snapshot_id: String,
    pub previous_id: Option<String>,
    /// Current chunk set with stabilised ids
    pub chunks: ChunkSet,
    pub cache_hit: bool,
    pub fallbacks: Vec<String>,
    pub matching: MatchStats,
    /// `None` when there is no previous snapshot
    pub diff: Option<DiffResult>,
}

pub struct Engine
{
    store: Arc<dyn SnapshotStore>,
    service: GatedService,
    cfg: Config,
    matcher: FingerprintMatcher,
}

fn require_id(snapshot: &Snapshot) -> Result<(), EngineError>
{
    if snapshot
        .id
        .trim()
        .is_empty()
    {
        return Err(EngineError::MissingSnapshotId);
    }
    Ok(())
}

impl Engine
{
    /// Engine with its own gate sized by `llm.max_concurrent`
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        service: Arc<dyn TextCompletionService>,
        cfg: Config,
    ) -> Self
    {
        let gate = Arc::new(CompletionGate::new(cfg.llm.max_concurrent));
        Self::with_gate(store, service, gate, cfg)
    }

    pub fn with_gate(
        store: Arc<dyn SnapshotStore>,
        service: Arc<dyn TextCompletionService>,
        gate: Arc<CompletionGate>,
        cfg: Config,
    ) -> Self
    {
        let matcher = FingerprintMatcher::new(cfg.matching.min_similarity);

        Self { store, service: GatedService::new(service, gate), cfg, matcher }
    }

    pub fn config(&self) -> &Config
    {
        &self.cfg
    }

    pub fn gate(&self) -> &Arc<CompletionGate>
    {
        self.service
            .gate()
    }

    pub fn store(&self) -> &dyn SnapshotStore
    {
        self.store
            .as_ref()
    }

    fn cache(&self) -> ChunkCache<'_>
    {
        ChunkCache::new(self.store.as_ref(), &self.service, &self.cfg)
    }

    /// Cached or freshly computed chunk set of `snapshot`
    #[instrument(skip_all, fields(snapshot = %snapshot.id))]
    pub fn ensure_chunks(
        &self,
        snapshot: &Snapshot,
        opts: EnsureOptions<'_>,
    ) -> Result<EnsuredChunks, EngineError>
    {
        require_id(snapshot)?;

        Ok(self
            .cache()
            .ensure(snapshot, opts))
    }

    /// Reuse `existing` (or the target's stored template) while it fits, else build one.
    ///
    /// Non-reused templates are saved for the snapshot's target.
    #[instrument(skip_all, fields(snapshot = %snapshot.id, target = ?snapshot.target_id))]
    pub fn build_or_reuse_anchor_template(
        &self,
        snapshot: &Snapshot,
        existing: Option<&AnchorTemplate>,
    ) -> Result<TemplateOutcome, EngineError>
    {
        require_id(snapshot)?;

        let picked = pick_canonical(snapshot);
        let (text, source) = match &picked
        {
            Some(p) => (p.text.as_str(), Some(p.source_kind())),
            None => ("", None),
        };

        let target = snapshot
            .target_id
            .as_deref();

        let stored = match (existing, target)
        {
            (Some(_), _) | (None, None) => None,
            (None, Some(t)) => self
                .store
                .load_template(t)
                .unwrap_or_else(|e| {
                    warn!(error = %e, target = t, "template_load_failed");
                    None
                }),
        };

        let builder = TemplateBuilder::new(
            &self.service,
            self.cfg
                .template
                .clone(),
            self.cfg
                .chunking
                .min_template_fit,
        );
        let outcome = builder.build_or_reuse(text, source, existing.or(stored.as_ref()));

        if outcome.origin != TemplateOrigin::Reused && !outcome.template.is_empty()
        {
            if let Some(t) = target
            {
                if let Err(e) = self
                    .store
                    .save_template(t, &outcome.template)
                {
                    warn!(error = %e, target = t, "template_persist_failed");
                }
            }
        }

        Ok(outcome)
    }

    /// Stabilise `current` ids against `previous`, then score every chunk pair
    pub fn compute_chunk_diff(
        &self,
        previous: &ChunkSet,
        current: &ChunkSet,
        opts: DiffOptions,
    ) -> DiffResult
    {
        let scorer = DiffScorer::new(&self.cfg.diff, &opts);

        diff::compute_chunk_diff(previous, current, &scorer, &self.matcher)
    }

    /// Full flow for one capture: chunk both snapshots, carry ids over, persist, diff
    pub fn track_snapshot(
        &self,
        previous: Option<&Snapshot>,
        current: &Snapshot,
        template: Option<&AnchorTemplate>,
    ) -> Result<SnapshotReport, EngineError>
    {
        self.track_snapshot_with(previous, current, template, DiffOptions::default())
    }

    /// `track_snapshot` with per-call diff overrides
    #[instrument(skip_all, fields(snapshot = %current.id, previous = ?previous.map(|p| p.id.as_str())))]
    pub fn track_snapshot_with(
        &self,
        previous: Option<&Snapshot>,
        current: &Snapshot,
        template: Option<&AnchorTemplate>,
        diff_opts: DiffOptions,
    ) -> Result<SnapshotReport, EngineError>
    {
        require_id(current)?;

        let opts = EnsureOptions { template, force_rebuild: false };

        let prev_set = match previous
        {
            Some(p) => Some(
                self.ensure_chunks(p, opts)?
                    .set,
            ),
            None => None,
        };

        let EnsuredChunks { set: mut now_set, cache_hit, fallbacks } = self.ensure_chunks(current, opts)?;

        let mut matching = MatchStats::default();

        if let Some(prev) = &prev_set
        {
            let before: Vec<String> = now_set
                .chunks
                .iter()
                .map(|c| c.id.clone())
                .collect();

            matching = self
                .matcher
                .stabilize(&prev.chunks, &mut now_set.chunks);

            let relabelled = now_set
                .chunks
                .iter()
                .zip(&before)
                .any(|(c, old)| c.id != *old);

            if relabelled && !now_set.is_empty()
            {
                if let Err(e) = self
                    .store
                    .save_chunks(&current.id, &now_set)
                {
                    warn!(error = %e, "snapshot_chunks_persist_failed");
                }
            }
        }

        let diff = prev_set
            .as_ref()
            .map(|prev| DiffScorer::new(&self.cfg.diff, &diff_opts).diff(&prev.chunks, &now_set.chunks));

        info!(
            chunks = now_set.len(),
            inherited = matching.inherited,
            changed = diff.as_ref().map_or(0, |d| d.changed_chunks),
            significant = diff.as_ref().is_some_and(|d| d.significant),
            "snapshot_tracked"
        );

        Ok(SnapshotReport {
            snapshot_id: current
                .id
                .clone(),
            previous_id: previous.map(|p| p.id.clone()),
            chunks: now_set,
            cache_hit,
            fallbacks,
            matching,
            diff,
        })
    }
}
