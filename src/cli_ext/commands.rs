//! Handlers for the `chunk`, `template` and `diff` subcommands.
//!
//! Each handler builds an `Engine` over a `FileStore`, runs one operation and
//! renders the result as text, JSON or a table.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use owo_colors::{OwoColorize, Style};
use tabled::{Table, Tabled};
use tracing::debug;

use crate::cli::{AppContext, ChunkArgs, DiffArgs, OutputFormat, SnapshotInput, TemplateArgs};
use crate::core::cache::EnsureOptions;
use crate::core::diff::{DiffOptions, DiffResult};
use crate::core::engine::{Engine, SnapshotReport};
use crate::core::model::{AnchorTemplate, ChunkSet, Snapshot, SourceKind};
use crate::core::template::{TemplateOrigin, TemplateOutcome};
use crate::core::text;
use crate::infra::config::{Config, load_config};
use crate::infra::store::FileStore;
use crate::llm::service::{ScriptedService, TextCompletionService, UnavailableService};

fn paint(
    ctx: &AppContext,
    s: &str,
    style: Style,
) -> String
{
    if ctx.no_color { s.to_string() } else { s.style(style).to_string() }
}

/// Snapshot id from a file stem, restricted to store-safe characters
fn id_from_path(path: &Path) -> String
{
    let stem = path
        .file_stem()
        .map(|s| {
            s.to_string_lossy()
                .into_owned()
        })
        .unwrap_or_default();

    let id: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();

    id.trim_start_matches('.')
        .to_string()
}

/// Read a JSON `Snapshot` document, or wrap a plain text file as one
pub fn load_snapshot(
    path: &Path,
    input: &SnapshotInput,
) -> Result<Snapshot>
{
    let raw = fs::read_to_string(path).with_context(|| format!("read snapshot {}", path.display()))?;

    if raw
        .trim_start()
        .starts_with('{')
    {
        match serde_json::from_str::<Snapshot>(&raw)
        {
            Ok(mut snap) =>
            {
                if snap.target_id.is_none()
                {
                    snap.target_id = input
                        .target
                        .clone();
                }
                return Ok(snap);
            }
            Err(e) => debug!(error = %e, path = %path.display(), "snapshot_not_json_document"),
        }
    }

    let id = id_from_path(path);
    let mut snap = match input.kind
    {
        SourceKind::Extracted => Snapshot::from_extracted(id, raw),
        SourceKind::Ocr => Snapshot::from_ocr(id, raw),
    };
    snap.target_id = input
        .target
        .clone();

    Ok(snap)
}

fn load_template(path: &Path) -> Result<AnchorTemplate>
{
    let raw = fs::read_to_string(path).with_context(|| format!("read template {}", path.display()))?;

    serde_json::from_str(&raw).with_context(|| format!("parse template {}", path.display()))
}

fn completion_service(ctx: &AppContext) -> Result<Arc<dyn TextCompletionService>>
{
    match &ctx.replay
    {
        Some(path) =>
        {
            let raw = fs::read_to_string(path).with_context(|| format!("read replay file {}", path.display()))?;
            let service =
                ScriptedService::from_json(&raw).with_context(|| format!("parse replay file {}", path.display()))?;
            Ok(Arc::new(service))
        }
        None => Ok(Arc::new(UnavailableService)),
    }
}

/// Engine over the configured (or `--store`) directory
pub fn build_engine(
    cfg: Config,
    ctx: &AppContext,
) -> Result<Engine>
{
    let dir = match &ctx.store
    {
        Some(dir) => dir.clone(),
        None => cfg
            .store
            .resolved_dir()?,
    };
    let store = FileStore::open(&dir).with_context(|| format!("open store {}", dir.display()))?;

    debug!(
        store = %dir.display(),
        model = %cfg.llm.model,
        replay = ctx.replay.is_some(),
        "engine_ready"
    );

    Ok(Engine::new(Arc::new(store), completion_service(ctx)?, cfg))
}

pub fn chunk_run(
    args: ChunkArgs,
    ctx: &AppContext,
) -> Result<()>
{
    let mut cfg = load_config()?;
    if let Some(mode) = args.mode
    {
        cfg.chunking
            .mode = mode;
    }

    let engine = build_engine(cfg, ctx)?;
    let snapshot = load_snapshot(&args.snapshot, &args.input)?;
    let template = args
        .template
        .as_deref()
        .map(load_template)
        .transpose()?;

    let ensured = engine.ensure_chunks(
        &snapshot,
        EnsureOptions { template: template.as_ref(), force_rebuild: args.force },
    )?;

    match args.format
    {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&ensured.set)?),
        OutputFormat::Table =>
        {
            println!("{}", chunk_table(&ensured.set));
        }
        OutputFormat::Text =>
        {
            if !ctx.quiet
            {
                let origin = if ensured.cache_hit { "cached" } else { "computed" };
                println!(
                    "{} {} chunks via {} ({origin})",
                    paint(ctx, &snapshot.id, Style::new().bold()),
                    ensured.set.len(),
                    paint(ctx, ensured.set.method.label(), Style::new().cyan()),
                );
                for reason in &ensured.fallbacks
                {
                    println!("  fallback: {}", paint(ctx, reason, Style::new().yellow()));
                }
            }
            for c in &ensured.set.chunks
            {
                println!("[{}] {} {}", c.order, paint(ctx, &c.id, Style::new().dimmed()), c.title);
                println!("    {}", text::excerpt(&c.text, 100));
            }
        }
    }

    Ok(())
}

fn chunk_table(set: &ChunkSet) -> String
{
    #[derive(Tabled)]
    struct ChunkRow
    {
        order: usize,
        id: String,
        title: String,
        lines: String,
        numbers: usize,
        preview: String,
    }

    let rows: Vec<ChunkRow> = set
        .chunks
        .iter()
        .map(|c| ChunkRow {
            order: c.order,
            id: c
                .id
                .clone(),
            title: text::excerpt(&c.title, 40),
            lines: c
                .lines
                .map_or_else(|| "-".to_string(), |l| format!("{}-{}", l.from + 1, l.to + 1)),
            numbers: c.numbers.len(),
            preview: text::excerpt(&c.text, 60),
        })
        .collect();

    Table::new(rows).to_string()
}

pub fn template_run(
    args: TemplateArgs,
    ctx: &AppContext,
) -> Result<()>
{
    let engine = build_engine(load_config()?, ctx)?;
    let snapshot = load_snapshot(&args.snapshot, &args.input)?;
    let reuse = args
        .reuse
        .as_deref()
        .map(load_template)
        .transpose()?;

    let outcome = engine.build_or_reuse_anchor_template(&snapshot, reuse.as_ref())?;
    let body = serde_json::to_string_pretty(&outcome.template)?;

    match &args.output
    {
        Some(path) =>
        {
            fs::write(path, format!("{body}\n")).with_context(|| format!("write template {}", path.display()))?;
            if !ctx.quiet
            {
                println!("{} -> {}", describe_outcome(ctx, &outcome), path.display());
            }
        }
        None =>
        {
            if !ctx.quiet
            {
                eprintln!("{}", describe_outcome(ctx, &outcome));
            }
            println!("{body}");
        }
    }

    Ok(())
}

fn describe_outcome(
    ctx: &AppContext,
    outcome: &TemplateOutcome,
) -> String
{
    let origin = match &outcome.origin
    {
        TemplateOrigin::Reused => paint(ctx, "reused", Style::new().green()),
        TemplateOrigin::Generated { repairs } => paint(ctx, &format!("generated ({repairs} repairs)"), Style::new().green()),
        TemplateOrigin::Fallback { reason, repairs } =>
        {
            paint(ctx, &format!("fallback after {repairs} repairs: {reason}"), Style::new().yellow())
        }
    };

    format!("template {origin}, {} chunks, fit {:.2}", outcome.template.len(), outcome.fit)
}

pub fn diff_run(
    args: DiffArgs,
    ctx: &AppContext,
) -> Result<()>
{
    let engine = build_engine(load_config()?, ctx)?;
    let previous = load_snapshot(&args.previous, &args.input)?;
    let current = load_snapshot(&args.current, &args.input)?;
    let template = args
        .template
        .as_deref()
        .map(load_template)
        .transpose()?;

    let opts = DiffOptions {
        numeric_weight: args.numeric_weight,
        threshold: args.threshold,
        max_for_judge: args.max_for_judge,
    };
    let report = engine.track_snapshot_with(Some(&previous), &current, template.as_ref(), opts)?;

    match args.format
    {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Table => println!("{}", diff_table(&report)),
        OutputFormat::Text => print_diff_text(ctx, &report),
    }

    Ok(())
}

fn diff_table(report: &SnapshotReport) -> String
{
    #[derive(Tabled)]
    struct DiffRow
    {
        status: &'static str,
        id: String,
        title: String,
        score: String,
        delta: String,
        numeric: String,
    }

    let Some(diff) = &report.diff
    else
    {
        return String::new();
    };

    let fmt = |v: f64| format!("{v:.3}");
    let mut rows: Vec<DiffRow> = diff
        .changed
        .iter()
        .map(|c| DiffRow {
            status: "changed",
            id: c
                .id
                .clone(),
            title: text::excerpt(&c.title, 40),
            score: fmt(c.score),
            delta: fmt(c.delta),
            numeric: fmt(c.numeric_delta),
        })
        .collect();

    for (status, entries) in [("added", &diff.added), ("removed", &diff.removed)]
    {
        rows.extend(
            entries
                .iter()
                .map(|p| DiffRow {
                    status,
                    id: p
                        .id
                        .clone(),
                    title: text::excerpt(&p.title, 40),
                    score: "-".into(),
                    delta: "-".into(),
                    numeric: "-".into(),
                }),
        );
    }

    Table::new(rows).to_string()
}

fn print_diff_text(
    ctx: &AppContext,
    report: &SnapshotReport,
)
{
    let Some(diff) = &report.diff
    else
    {
        return;
    };

    if !ctx.quiet
    {
        print_summary(ctx, report, diff);
    }

    for c in &diff.changed
    {
        println!(
            "{} {} {} (score {:.3}, text {:.3}, numeric {:.3})",
            paint(ctx, "~", Style::new().yellow()),
            c.id,
            c.title,
            c.score,
            c.delta,
            c.numeric_delta
        );
        for (before, after) in c
            .before_snippets
            .iter()
            .zip(&c.after_snippets)
        {
            println!("    - {}", paint(ctx, &text::excerpt(before, 160), Style::new().red()));
            println!("    + {}", paint(ctx, &text::excerpt(after, 160), Style::new().green()));
        }
    }
    for a in &diff.added
    {
        println!("{} {} {}", paint(ctx, "+", Style::new().green()), a.id, a.title);
        println!("    {}", a.preview);
    }
    for r in &diff.removed
    {
        println!("{} {} {}", paint(ctx, "-", Style::new().red()), r.id, r.title);
        println!("    {}", r.preview);
    }
}

fn print_summary(
    ctx: &AppContext,
    report: &SnapshotReport,
    diff: &DiffResult,
)
{
    let verdict = if diff.significant
    {
        paint(ctx, "significant", Style::new().red().bold())
    }
    else
    {
        paint(ctx, "minor", Style::new().green())
    };

    println!(
        "{} -> {}: {} changed, {} added, {} removed of {} chunks ({verdict})",
        report
            .previous_id
            .as_deref()
            .unwrap_or("-"),
        report.snapshot_id,
        diff.changed_chunks,
        diff.added.len(),
        diff.removed.len(),
        diff.now_chunks,
    );
}
