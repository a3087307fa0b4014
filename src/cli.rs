use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::core::model::{ChunkMode, SourceKind};

/// Shared application context for global flags
#[derive(Clone, Debug)]
pub struct AppContext {
    pub quiet: bool,             // global --quiet
    pub no_color: bool,          // global --no-color
    pub verbose: bool,           // global -v
    pub store: Option<PathBuf>,  // global --store
    pub replay: Option<PathBuf>, // global --replay
}

#[derive(Parser)]
#[command(name = "snapdiff")]
#[command(
    about = "Split page snapshots into stable sections and score what changed between captures"
)]
#[command(version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Snapshot store directory (overrides store.dir from config)
    #[arg(long, global = true, value_name = "DIR")]
    pub store: Option<PathBuf>,

    /// JSON array of canned completion responses (null = service failure)
    #[arg(long, global = true, value_name = "FILE")]
    pub replay: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Debug logging (SNAPDIFF_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Split a snapshot into chunks (cached in the store)
    Chunk(ChunkArgs),

    /// Build or reuse an anchor template for a snapshot
    Template(TemplateArgs),

    /// Score section-level changes between two snapshots
    Diff(DiffArgs),

    /// Initialize a snapdiff.toml config file
    Init(InitArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

/// How a snapshot file is interpreted
#[derive(Debug, Clone, Args)]
pub struct SnapshotInput {
    /// Variant used for plain text files
    #[arg(long, value_enum, default_value = "extracted")]
    pub kind: SourceKind,

    /// Monitored target id for plain text files (template reuse scope)
    #[arg(long)]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Table,
}

#[derive(Debug, Parser)]
pub struct ChunkArgs {
    /// Snapshot JSON document or plain text file
    pub snapshot: PathBuf,

    /// Chunking mode (overrides chunking.mode from config)
    #[arg(long, value_enum)]
    pub mode: Option<ChunkMode>,

    /// Anchor template JSON file
    #[arg(long, value_name = "FILE")]
    pub template: Option<PathBuf>,

    /// Ignore the cached chunk set
    #[arg(long)]
    pub force: bool,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    pub format: OutputFormat,

    #[command(flatten)]
    pub input: SnapshotInput,
}

#[derive(Debug, Parser)]
pub struct TemplateArgs {
    /// Snapshot JSON document or plain text file
    pub snapshot: PathBuf,

    /// Existing template to reuse while it still fits
    #[arg(long, value_name = "FILE")]
    pub reuse: Option<PathBuf>,

    /// Write the template JSON here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub input: SnapshotInput,
}

#[derive(Debug, Parser)]
pub struct DiffArgs {
    /// Earlier snapshot
    pub previous: PathBuf,

    /// Later snapshot
    pub current: PathBuf,

    /// Anchor template JSON file
    #[arg(long, value_name = "FILE")]
    pub template: Option<PathBuf>,

    /// Multiplier applied to the numeric delta
    #[arg(long)]
    pub numeric_weight: Option<f64>,

    /// Change threshold (also caps the numeric threshold)
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Number of top changes handed to the judge
    #[arg(long)]
    pub max_for_judge: Option<usize>,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    pub format: OutputFormat,

    #[command(flatten)]
    pub input: SnapshotInput,
}

#[derive(Parser)]
pub struct InitArgs {
    /// Directory to initialize config in
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Overwrite existing config file
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

#[derive(Parser)]
pub struct CompletionsArgs {
    /// Target shell
    #[arg(value_enum)]
    pub shell: Shell,

    /// Directory the script is written to (required without --stdout)
    #[arg(long)]
    pub out_dir: Option<PathBuf>,

    /// Print completion script to stdout instead of a file
    #[arg(long)]
    pub stdout: bool,
}
