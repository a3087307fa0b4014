use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cli::{AppContext, InitArgs};
use crate::core::model::ChunkMode;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config
{
    /// Boundary detection and cache reuse
    pub chunking: ChunkingConfig,

    /// Anchor template generation and repair
    pub template: TemplateConfig,

    /// Cross-snapshot identity matching
    pub matching: MatchingConfig,

    /// Per-chunk change scoring
    pub diff: DiffConfig,

    /// Completion service access
    pub llm: LlmConfig,

    /// On-disk snapshot store used by the CLI
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig
{
    pub mode: ChunkMode,
    pub force_rebuild: bool,
    /// Minimum fit ratio for reusing a template on new text
    pub min_template_fit: f64,
    pub window: WindowConfig,
    /// Paragraph reflow in place of plain line windows
    pub structural: StructuralConfig,
    pub semantic: SemanticConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig
{
    /// Fixed window size in lines (0 = auto-size)
    pub fixed_lines: usize,
    pub overlap: usize,
    pub auto_min_lines: usize,
    pub auto_max_lines: usize,
    pub max_lines: usize,
    /// Character budget per window; longer lines are split to fit (0 = unbounded)
    pub max_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StructuralConfig
{
    pub enabled: bool,
    /// Width the source lines were wrapped at
    pub wrap_at: usize,
    /// Fold short one-line segments into the next real paragraph
    pub merge_one_liners: bool,
    /// Single-line paragraphs shorter than this count as one-liners
    pub paragraph_min_chars: usize,
    /// Character ceiling per chunk, clamped to 600..=10000
    pub max_chars: usize,
    /// A chunk past the even target may stop once it holds this many characters
    pub min_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticConfig
{
    /// Target range count (0 = semantic disabled in auto mode)
    pub target_ranges: usize,
    pub max_lines: usize,
    pub max_prompt_chars: usize,
    pub repair_rounds: usize,
    pub timeout_ms: u64,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig
{
    pub max_chunks: usize,
    pub min_chunks: usize,
    pub anchor_min_chars: usize,
    pub anchor_max_chars: usize,
    /// Fit a freshly generated template must reach on its own source text
    pub min_fit_new: f64,
    pub repair_rounds: usize,
    pub timeout_ms: u64,
    pub temperature: f32,
    pub fallback_chars_per_group: usize,
    pub fallback_anchor_words: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig
{
    pub min_similarity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig
{
    pub numeric_weight: f64,
    pub threshold: f64,
    pub numeric_threshold: f64,
    /// Numeric delta above which the numeric thresholds apply
    pub numeric_dominance: f64,
    pub significant_threshold: f64,
    pub significant_numeric_threshold: f64,
    pub significant_ratio: f64,
    pub significant_changed_chunks: usize,
    pub max_for_judge: usize,
    pub excerpt_chars: usize,
    pub snippet_window: usize,
    pub snippet_max_chars: usize,
    pub max_snippets: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig
{
    pub max_concurrent: usize,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig
{
    pub dir: String,
}

impl Default for ChunkingConfig
{
    fn default() -> Self
    {
        Self {
            mode: ChunkMode::Auto,
            force_rebuild: false,
            min_template_fit: 0.6,
            window: WindowConfig::default(),
            structural: StructuralConfig::default(),
            semantic: SemanticConfig::default(),
        }
    }
}

impl Default for WindowConfig
{
    fn default() -> Self
    {
        Self { fixed_lines: 0, overlap: 0, auto_min_lines: 18, auto_max_lines: 28, max_lines: 35, max_chars: 1800 }
    }
}

impl Default for StructuralConfig
{
    fn default() -> Self
    {
        Self {
            enabled: false,
            wrap_at: 140,
            merge_one_liners: true,
            paragraph_min_chars: 160,
            max_chars: 2200,
            min_chars: 900,
        }
    }
}

impl Default for SemanticConfig
{
    fn default() -> Self
    {
        Self {
            target_ranges: 0,
            max_lines: 420,
            max_prompt_chars: 22_000,
            repair_rounds: 1,
            timeout_ms: 180_000,
            seed: 42,
        }
    }
}

impl Default for TemplateConfig
{
    fn default() -> Self
    {
        Self {
            max_chunks: 18,
            min_chunks: 3,
            anchor_min_chars: 14,
            anchor_max_chars: 96,
            min_fit_new: 0.75,
            repair_rounds: 2,
            timeout_ms: 15_000,
            temperature: 0.1,
            fallback_chars_per_group: 1200,
            fallback_anchor_words: 12,
        }
    }
}

impl Default for MatchingConfig
{
    fn default() -> Self
    {
        Self { min_similarity: 0.75 }
    }
}

impl Default for DiffConfig
{
    fn default() -> Self
    {
        Self {
            numeric_weight: 2.0,
            threshold: 0.10,
            numeric_threshold: 0.08,
            numeric_dominance: 0.12,
            significant_threshold: 0.18,
            significant_numeric_threshold: 0.14,
            significant_ratio: 0.08,
            significant_changed_chunks: 2,
            max_for_judge: 8,
            excerpt_chars: 220,
            snippet_window: 140,
            snippet_max_chars: 320,
            max_snippets: 2,
        }
    }
}

impl Default for LlmConfig
{
    fn default() -> Self
    {
        Self { max_concurrent: 1, model: "llama3.2:3b".to_string() }
    }
}

impl Default for StoreConfig
{
    fn default() -> Self
    {
        Self { dir: ".snapdiff".to_string() }
    }
}

impl StoreConfig
{
    /// Store directory with `~` and `$VAR` expanded
    pub fn resolved_dir(&self) -> Result<PathBuf>
    {
        let expanded = shellexpand::full(&self.dir)
            .with_context(|| format!("expand store dir: {}", self.dir))?;

        Ok(PathBuf::from(expanded.as_ref()))
    }
}

pub fn load_config() -> Result<Config>
{
    let mut builder = config::Config::builder();

    // Load from config files in priority order
    let config_paths = ["snapdiff.toml", "snapdiff.yaml", "snapdiff.json", ".snapdiff.toml"];

    for path in &config_paths
    {
        if Path::new(path).exists()
        {
            builder = builder.add_source(config::File::with_name(path));
            break;
        }
    }

    // Environment overrides, e.g. SNAPDIFF_DIFF__NUMERIC_WEIGHT=3
    builder = builder.add_source(
        config::Environment::with_prefix("SNAPDIFF")
            .prefix_separator("_")
            .separator("__"),
    );

    let cfg = builder
        .build()
        .context("Failed to load configuration")?;
    let parsed: Config = cfg
        .try_deserialize()
        .context("Failed to parse configuration")?;

    Ok(parsed)
}

pub fn init(
    args: InitArgs,
    ctx: &AppContext,
) -> Result<()>
{
    let config_path = args
        .path
        .join("snapdiff.toml");

    if config_path.exists() && !args.force
    {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    let config = Config::default();
    let toml_string =
        toml::to_string_pretty(&config).context("Failed to serialize default config")?;

    std::fs::write(&config_path, toml_string).context("Failed to write config file")?;

    if !ctx.quiet
    {
        println!("Created config file at {}", config_path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn defaults_roundtrip_through_toml()
    {
        let text = toml::to_string_pretty(&Config::default()).expect("serialize");
        let back: Config = toml::from_str(&text).expect("parse");

        assert_eq!(back.chunking.mode, ChunkMode::Auto);
        assert_eq!(back.diff.max_for_judge, 8);
        assert!((back.chunking.min_template_fit - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_file_keeps_other_defaults()
    {
        let cfg: Config = toml::from_str("[diff]\nnumeric_weight = 3.0\n").expect("parse");

        assert!((cfg.diff.numeric_weight - 3.0).abs() < f64::EPSILON);
        assert!((cfg.diff.threshold - 0.10).abs() < f64::EPSILON);
        assert_eq!(cfg.template.repair_rounds, 2);
    }

    #[test]
    fn structural_reflow_is_opt_in()
    {
        assert!(!Config::default().chunking.structural.enabled);

        let cfg: Config = toml::from_str("[chunking.structural]\nenabled = true\nwrap_at = 100\n").expect("parse");
        assert!(cfg.chunking.structural.enabled);
        assert_eq!(cfg.chunking.structural.wrap_at, 100);
        assert_eq!(cfg.chunking.structural.max_chars, 2200);
        assert_eq!(cfg.chunking.window.max_chars, 1800);
    }
}
