//! End-to-end engine flows over in-memory stores and scripted services.

mod util;

use std::sync::Arc;

use snapdiff::core::cache::EnsureOptions;
use snapdiff::core::diff::DiffOptions;
use snapdiff::core::model::{AnchorTemplate, ChunkMethod, ChunkMode, MethodFamily, Snapshot, TemplateChunk};
use snapdiff::infra::store::{MemoryStore, SnapshotStore};
use snapdiff::llm::service::{ScriptedService, UnavailableService};

use util::*;

#[test]
fn price_change_yields_one_numeric_change()
{
    let e = engine(Arc::new(MemoryStore::new()), Arc::new(UnavailableService), window_config(2));

    let s1 = report_snapshot("s1", 100);
    let s2 = report_snapshot("s2", 120);

    let report = e
        .track_snapshot(Some(&s1), &s2, None)
        .expect("track");

    assert_eq!(report.chunks.len(), 2);
    assert_eq!(report.matching.inherited, 2);

    let diff = report
        .diff
        .expect("diff against previous");
    assert_eq!(diff.changed_chunks, 1);
    assert!(diff.added.is_empty());
    assert!(diff.removed.is_empty());

    let change = &diff.changed[0];
    assert!(change.numeric_delta > 0.0);
    assert!(change.score >= 0.08);
    assert!(change.title.starts_with("Lines 1-2"));
    assert!(diff.significant);
}

#[test]
fn raw_chunk_sets_are_stabilised_before_diffing()
{
    let e = engine(Arc::new(MemoryStore::new()), Arc::new(UnavailableService), window_config(2));

    let a = e
        .ensure_chunks(&report_snapshot("a", 100), EnsureOptions::default())
        .expect("a")
        .set;
    let b = e
        .ensure_chunks(&report_snapshot("b", 120), EnsureOptions::default())
        .expect("b")
        .set;

    let diff = e.compute_chunk_diff(&a, &b, DiffOptions::default());
    assert_eq!(diff.changed_chunks, 1);

    let same = e.compute_chunk_diff(&a, &a, DiffOptions::default());
    assert_eq!(same.changed_chunks, 0);
    assert!(same.added.is_empty() && same.removed.is_empty());
}

#[test]
fn second_ensure_hits_the_cache()
{
    let store = Arc::new(MemoryStore::new());
    let e = engine(store.clone(), Arc::new(UnavailableService), window_config(2));
    let snap = report_snapshot("s1", 100);

    let first = e
        .ensure_chunks(&snap, EnsureOptions::default())
        .unwrap();
    let second = e
        .ensure_chunks(&snap, EnsureOptions::default())
        .unwrap();

    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert_eq!(first.set.chunks, second.set.chunks);
    assert_eq!(store.chunk_writes(), 1);

    // Forced rebuild recomputes and persists again
    let forced = e
        .ensure_chunks(&snap, EnsureOptions { template: None, force_rebuild: true })
        .unwrap();
    assert!(!forced.cache_hit);
    assert_eq!(store.chunk_writes(), 2);
}

#[test]
fn changed_text_under_same_id_is_rechunked()
{
    let store = Arc::new(MemoryStore::new());
    let e = engine(store.clone(), Arc::new(UnavailableService), window_config(2));

    e.ensure_chunks(&report_snapshot("s1", 100), EnsureOptions::default())
        .unwrap();
    let again = e
        .ensure_chunks(&report_snapshot("s1", 999), EnsureOptions::default())
        .unwrap();

    assert!(!again.cache_hit);
    assert!(again.set.chunks[0].text.contains("999"));
}

#[test]
fn structural_reflow_folds_headings_and_toggles_the_cache()
{
    let store = Arc::new(MemoryStore::new());
    let mut cfg = window_config(2);
    cfg.chunking
        .structural
        .enabled = true;
    let reflow = engine(store.clone(), Arc::new(UnavailableService), cfg);
    let snap = report_snapshot("s1", 100);

    let out = reflow
        .ensure_chunks(&snap, EnsureOptions::default())
        .unwrap();

    // Headings and one-line paragraphs fold into a single segment
    assert_eq!(out.set.method, ChunkMethod::Structural { segments: 1, overlap: 0 });
    assert_eq!(out.set.len(), 1);
    assert_eq!(out.set.chunks[0].text, "[P001] # Report\nPrice: 100 PLN\n# Notes\nNothing else.");
    assert_eq!(out.set.chunks[0].numbers, vec![100.0]);

    let later = reflow
        .ensure_chunks(&report_snapshot("s2", 120), EnsureOptions::default())
        .unwrap();
    let diff = reflow.compute_chunk_diff(&out.set, &later.set, DiffOptions::default());
    assert_eq!(diff.changed_chunks, 1);

    // Plain windows do not reuse the reflowed set
    let windows = engine(store.clone(), Arc::new(UnavailableService), window_config(2));
    let plain = windows
        .ensure_chunks(&snap, EnsureOptions::default())
        .unwrap();
    assert!(!plain.cache_hit);
    assert_eq!(plain.set.method, ChunkMethod::Deterministic { window_lines: 2, overlap: 0 });
}

#[test]
fn persistence_failure_still_returns_chunks()
{
    let store = Arc::new(MemoryStore::failing_writes());
    let e = engine(store.clone(), Arc::new(UnavailableService), window_config(2));
    let snap = report_snapshot("s1", 100);

    let first = e
        .ensure_chunks(&snap, EnsureOptions::default())
        .unwrap();
    let second = e
        .ensure_chunks(&snap, EnsureOptions::default())
        .unwrap();

    assert_eq!(first.set.len(), 2);
    assert!(!second.cache_hit);
    assert!(store.load_chunks("s1").unwrap().is_none());
}

#[test]
fn snapshot_without_text_gives_empty_unpersisted_set()
{
    let store = Arc::new(MemoryStore::new());
    let e = engine(store.clone(), Arc::new(UnavailableService), window_config(2));

    let out = e
        .ensure_chunks(&Snapshot { id: "blank".into(), ..Default::default() }, EnsureOptions::default())
        .unwrap();

    assert!(out.set.is_empty());
    assert_eq!(out.set.method, ChunkMethod::Empty);
    assert_eq!(store.chunk_writes(), 0);
}

#[test]
fn invalid_semantic_ranges_repair_once_then_fall_back()
{
    let mut cfg = window_config(2);
    cfg.chunking
        .mode = ChunkMode::Semantic;
    cfg.chunking
        .semantic
        .target_ranges = 4;

    let service = Arc::new(ScriptedService::replies(["not json at all", r#"{"chunks":[{"from":1,"to":3}]}"#]));
    let e = engine(Arc::new(MemoryStore::new()), service.clone(), cfg);

    let out = e
        .ensure_chunks(&report_snapshot("s1", 100), EnsureOptions::default())
        .unwrap();

    assert_eq!(service.call_count(), 2);
    assert_eq!(out.fallbacks, vec!["invalid_ranges".to_string()]);
    assert_eq!(out.set.method.family(), MethodFamily::Deterministic);
    assert_eq!(out.set.len(), 2);
    assert_eq!(
        e.gate()
            .stats()
            .acquired,
        2
    );
}

#[test]
fn semantic_service_failure_is_not_retried()
{
    let mut cfg = window_config(2);
    cfg.chunking
        .mode = ChunkMode::Semantic;

    let service = Arc::new(ScriptedService::new([None]));
    let e = engine(Arc::new(MemoryStore::new()), service.clone(), cfg);

    let out = e
        .ensure_chunks(&report_snapshot("s1", 100), EnsureOptions::default())
        .unwrap();

    assert_eq!(service.call_count(), 1);
    assert_eq!(out.fallbacks.len(), 1);
    assert!(out.fallbacks[0].starts_with("service_"));
    assert_eq!(out.set.method.family(), MethodFamily::Deterministic);
}

#[test]
fn semantic_ranges_become_keyed_chunks_with_pinned_sampling()
{
    let mut cfg = window_config(2);
    cfg.chunking
        .mode = ChunkMode::Semantic;

    let response = ranges_response(&[(0, 1, "Report"), (2, 3, "Notes")]);
    let service = Arc::new(ScriptedService::replies([response.clone()]));
    let e = engine(Arc::new(MemoryStore::new()), service.clone(), cfg.clone());

    let out = e
        .ensure_chunks(&report_snapshot("s1", 100), EnsureOptions::default())
        .unwrap();

    assert_eq!(out.set.method, ChunkMethod::Semantic { ranges: 2, repaired: false });
    assert_eq!(out.set.chunks[0].key.as_deref(), Some("report"));
    assert_eq!(out.set.chunks[1].text, "# Notes\nNothing else.");

    let call = &service.calls()[0];
    assert_eq!(call.options.temperature, 0.0);
    assert_eq!(call.options.seed, Some(42));
    assert!(call.options.json_mode);

    // Same inputs and response give the same chunks on a fresh engine
    let replay = Arc::new(ScriptedService::replies([response]));
    let other = engine(Arc::new(MemoryStore::new()), replay, cfg);
    let again = other
        .ensure_chunks(&report_snapshot("s1", 100), EnsureOptions::default())
        .unwrap();

    assert_eq!(out.set.chunks, again.set.chunks);
}

#[test]
fn template_mode_builds_persists_and_reuses_per_target()
{
    let mut cfg = window_config(2);
    cfg.chunking
        .mode = ChunkMode::Template;

    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(ScriptedService::replies([product_template_response()]));
    let e = engine(store.clone(), service.clone(), cfg);

    let mut s1 = Snapshot::from_extracted("p1", product_page(100));
    s1.target_id = Some("shop".into());
    let mut s2 = Snapshot::from_extracted("p2", product_page(120));
    s2.target_id = Some("shop".into());

    let first = e
        .ensure_chunks(&s1, EnsureOptions::default())
        .unwrap();

    assert_eq!(first.set.method.family(), MethodFamily::Template);
    assert_eq!(first.set.len(), 3);
    assert_eq!(first.set.chunks[0].key.as_deref(), Some("price"));
    assert!(!first.set.chunks[0].text.contains("Kettle Pro"));
    assert!(
        store
            .load_template("shop")
            .unwrap()
            .is_some()
    );

    let report = e
        .track_snapshot(Some(&s1), &s2, None)
        .unwrap();

    // Stored template was reused for the second capture
    assert_eq!(service.call_count(), 1);

    let diff = report.diff.unwrap();
    assert_eq!(diff.changed_chunks, 1);
    assert_eq!(diff.changed[0].key.as_deref(), Some("price"));
}

#[test]
fn auto_mode_applies_supplied_template_only_when_it_fits()
{
    let e = engine(Arc::new(MemoryStore::new()), Arc::new(UnavailableService), window_config(2));
    let snap = Snapshot::from_extracted("p1", product_page(100));

    let section = |key: &str, anchor: &str| TemplateChunk {
        key: key.into(),
        title: key.into(),
        anchor_candidates: vec![anchor.into()],
    };
    let fitting = AnchorTemplate {
        chunks: vec![
            section("price", "Price of the product is"),
            section("reviews", "Customer reviews and ratings"),
        ],
    };
    let stale = AnchorTemplate {
        chunks: vec![
            section("faq", "Frequently asked questions"),
            section("contact", "Contact our support team"),
        ],
    };

    let out = e
        .ensure_chunks(&snap, EnsureOptions { template: Some(&fitting), force_rebuild: true })
        .unwrap();
    assert_eq!(out.set.method.family(), MethodFamily::Template);

    let out = e
        .ensure_chunks(&snap, EnsureOptions { template: Some(&stale), force_rebuild: true })
        .unwrap();
    assert_eq!(out.set.method.family(), MethodFamily::Deterministic);
    assert_eq!(out.fallbacks, vec!["no_anchors_located".to_string()]);
}

#[test]
fn supplied_template_with_short_anchors_is_rejected()
{
    let e = engine(Arc::new(MemoryStore::new()), Arc::new(UnavailableService), window_config(2));
    let snap = Snapshot::from_extracted("p1", product_page(100));
    let short = AnchorTemplate {
        chunks: vec![TemplateChunk { key: "price".into(), title: "Price".into(), anchor_candidates: vec!["Price".into()] }],
    };

    let out = e
        .ensure_chunks(&snap, EnsureOptions { template: Some(&short), force_rebuild: true })
        .unwrap();

    assert_eq!(out.set.method.family(), MethodFamily::Deterministic);
    assert_eq!(out.fallbacks, vec!["template_invalid".to_string()]);
}

#[test]
fn template_build_falls_back_when_service_keeps_failing()
{
    let service = Arc::new(ScriptedService::new([None, None, None]));
    let store = Arc::new(MemoryStore::new());
    let e = engine(store.clone(), service.clone(), window_config(2));

    let mut snap = Snapshot::from_extracted("p1", product_page(100));
    snap.target_id = Some("shop".into());

    let outcome = e
        .build_or_reuse_anchor_template(&snap, None)
        .unwrap();

    // First failure enters repair, a failure during repair ends it
    assert_eq!(service.call_count(), 2);
    assert!(!outcome.template.is_empty());
    assert_eq!(
        store
            .load_template("shop")
            .unwrap(),
        Some(outcome.template.clone())
    );

    // Stored template now fits and is reused without calls
    let reused = e
        .build_or_reuse_anchor_template(&snap, None)
        .unwrap();
    assert_eq!(reused.template, outcome.template);
    assert_eq!(service.call_count(), 2);
}
