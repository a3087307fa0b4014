//! Tracing subscriber setup for the binary.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directives
pub const LOG_ENV: &str = "SNAPDIFF_LOG";

/// Filter from `SNAPDIFF_LOG`, else `warn` (`debug` when verbose)
pub fn env_filter(verbose: bool) -> EnvFilter
{
    let fallback = if verbose { "snapdiff=debug,warn" } else { "warn" };

    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Install the global fmt subscriber writing to stderr; later calls are no-ops
pub fn init(
    verbose: bool,
    no_color: bool,
)
{
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_writer(std::io::stderr)
        .with_ansi(!no_color)
        .with_target(false)
        .try_init();
}
