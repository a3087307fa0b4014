use anyhow::Result;
use clap::Parser;
use snapdiff::cli::{AppContext, Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    snapdiff::infra::logging::init(cli.verbose, cli.no_color);

    // Build a context once, pass everywhere
    let ctx = AppContext {
        quiet: cli.quiet,
        no_color: cli.no_color,
        verbose: cli.verbose,
        store: cli.store,
        replay: cli.replay,
    };

    match cli.command {
        Commands::Chunk(args) => snapdiff::chunk_run(args, &ctx),
        Commands::Template(args) => snapdiff::template_run(args, &ctx),
        Commands::Diff(args) => snapdiff::diff_run(args, &ctx),
        Commands::Init(args) => snapdiff::infra::config::init(args, &ctx),
        Commands::Completions(args) => snapdiff::completion::run(args, &ctx),
    }
}
