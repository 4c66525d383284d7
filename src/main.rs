//! ramforge - initramfs builder for Rust command packages.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use commands::build::BuildArgs;
use ramforge::config::Config;

#[derive(Parser)]
#[command(name = "ramforge")]
#[command(about = "Build minimal Linux initramfs images from Rust command packages")]
#[command(
    after_help = "QUICK START:\n  ramforge preflight                    Check the toolchain\n  ramforge build --build bb cmds/*      Build one multiplexed binary\n  ramforge show archive <file>          List an image"
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an initramfs image
    Build(BuildArgs),

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowTarget,
    },

    /// Run preflight checks (verify the toolchain before building)
    Preflight {
        /// Exit with an error if any check fails
        #[arg(long)]
        strict: bool,

        /// Target triple to check (default: host)
        #[arg(long)]
        target: Option<String>,
    },
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Show current configuration
    Config,
    /// List the contents of an archive
    Archive {
        /// Archive file (cpio or cpio.gz)
        path: PathBuf,
    },
}

/// Load `.env` (or `env_file`), then build the log filter, so `RUST_LOG`
/// may come from either the process environment or the file.
fn load_env(env_file: Option<&Path>, verbose: bool) -> EnvFilter {
    match env_file {
        Some(path) => dotenvy::from_path(path).ok(),
        None => dotenvy::dotenv().ok().map(|_| ()),
    };
    let default_level = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(load_env(None, cli.verbose))
        .with_target(false)
        .init();

    let config = Config::load();

    match cli.command {
        Commands::Build(args) => {
            commands::cmd_build(args, &config)?;
        }

        Commands::Show { what } => {
            let show_target = match what {
                ShowTarget::Config => commands::show::ShowTarget::Config,
                ShowTarget::Archive { path } => commands::show::ShowTarget::Archive(path),
            };
            commands::cmd_show(show_target, &config)?;
        }

        Commands::Preflight { strict, target } => {
            commands::cmd_preflight(&config, target.as_deref(), strict)?;
        }
    }

    Ok(())
}
