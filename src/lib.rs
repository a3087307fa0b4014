//! **snapdiff** - section-level change detection for monitored web pages
//!
//! Splits each snapshot's text into stable chunks, carries chunk identities
//! across captures with SimHash matching, and scores per-chunk change so a
//! downstream judge only sees bounded evidence.

/// Command-line interface with clap integration
pub mod cli;

/// Subcommand handlers and output rendering
pub mod cli_ext {
    pub mod commands;
    pub use commands::{chunk_run, diff_run, template_run};
}

/// Shell completion generation
pub mod completion;

/// Chunking, identity tracking and diff scoring
pub mod core {
    /// Snapshots, chunks, chunk sets and anchor templates
    pub mod model;

    /// Tokens, numbers, excerpts and hashing helpers
    pub mod text;

    /// 64-bit SimHash and stable id assignment
    pub mod fingerprint;
    pub use fingerprint::FingerprintMatcher;

    /// Whitespace-tolerant anchor matching with a moka-memoised matcher cache
    pub mod anchor;

    /// Boundary strategies: fixed windows, anchor templates, semantic ranges
    pub mod strategy;

    /// Anchor template generation, repair and fallback
    pub mod template;
    pub use template::TemplateBuilder;

    /// Canonical text selection and chunk set reuse
    pub mod cache;
    pub use cache::{ChunkCache, EnsureOptions, EnsuredChunks};

    /// Textual + numeric change scoring
    pub mod diff;
    pub use diff::{DiffOptions, DiffResult, DiffScorer};

    /// Facade over the whole flow
    pub mod engine;
    pub use engine::{Engine, EngineError, SnapshotReport};
}

/// Completion service access
pub mod llm {
    /// FIFO bounded-concurrency gate
    pub mod gate;
    pub use gate::CompletionGate;

    /// Strict-then-lenient JSON extraction from model output
    pub mod json;

    /// Service trait, gated wrapper and scripted test double
    pub mod service;
    pub use service::{GatedService, ScriptedService, TextCompletionService};
}

/// Infrastructure - configuration, persistence and logging
pub mod infra {
    /// Layered configuration with TOML defaults
    pub mod config;
    pub use config::{Config, init as config_init, load_config};

    /// Snapshot, chunk set and template persistence
    pub mod store;
    pub use store::{FileStore, MemoryStore, SnapshotStore};

    /// tracing-subscriber setup
    pub mod logging;
}

// Strategic re-exports for clean CLI interface
pub use cli::{AppContext, Cli, Commands};
pub use cli_ext::{chunk_run, diff_run, template_run};
pub use infra::{Config, load_config};

// Core types for external consumers
pub use core::model::{AnchorTemplate, Chunk, ChunkSet, Snapshot};
pub use core::{DiffOptions, DiffResult, Engine};
