//! `snapdiff completions`: shell completion scripts rendered from the clap definition.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::CommandFactory;
use clap_complete::{Shell as CompletionShell, generate, generate_to};
use tracing::debug;

use crate::cli::{AppContext, Cli, CompletionsArgs, Shell};

impl From<Shell> for CompletionShell {
    fn from(shell: Shell) -> Self {
        match shell {
            Shell::Bash => CompletionShell::Bash,
            Shell::Zsh => CompletionShell::Zsh,
            Shell::Fish => CompletionShell::Fish,
            Shell::PowerShell => CompletionShell::PowerShell,
            Shell::Elvish => CompletionShell::Elvish,
        }
    }
}

/// Binary name the scripts complete, taken from the clap command
fn bin_name() -> String {
    Cli::command().get_name().to_string()
}

/// Write the script for `shell` into `out`
pub fn render(shell: Shell, out: &mut dyn Write) {
    let mut cmd = Cli::command();
    let name = bin_name();

    generate(CompletionShell::from(shell), &mut cmd, name, out);
}

/// Write the script for `shell` under `dir`, creating it when missing
pub fn write_to_dir(shell: Shell, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create completion dir {}", dir.display()))?;

    let mut cmd = Cli::command();
    let path = generate_to(CompletionShell::from(shell), &mut cmd, bin_name(), dir)
        .with_context(|| format!("write {shell:?} completion into {}", dir.display()))?;

    debug!(shell = ?shell, path = %path.display(), "completion_written");
    Ok(path)
}

pub fn run(args: CompletionsArgs, ctx: &AppContext) -> Result<()> {
    if args.stdout {
        let stdout = io::stdout();
        render(args.shell, &mut stdout.lock());
        return Ok(());
    }

    let Some(dir) = args.out_dir else {
        bail!("no destination for the {:?} completion script: pass --out-dir <DIR> or --stdout", args.shell);
    };

    let path = write_to_dir(args.shell, &dir)?;

    if !ctx.quiet {
        eprintln!("{:?} completion: {}", args.shell, path.display());
    }
    Ok(())
}
