//! Build command - builds an initramfs image.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use ramforge::archive::Format;
use ramforge::builder::Builder;
use ramforge::config::{split_command_line, Config};
use ramforge::initramfs::default_output;
use ramforge::stats::{self, BuildStats};
use ramforge::{create_image, BuildOpts, CommandGroup};

/// Flags of `ramforge build`.
#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Builder to use: bb (one multiplexed binary) or binary (one per command)
    #[arg(long, default_value = "bb")]
    pub build: String,

    /// Archive format: cpio or cpio.gz
    #[arg(long, default_value = "cpio")]
    pub format: String,

    /// Workspace directory to use instead of a temporary one (kept afterwards)
    #[arg(long)]
    pub tmpdir: Option<PathBuf>,

    /// Base archive to merge onto (default: built-in skeleton)
    #[arg(long)]
    pub base: Option<PathBuf>,

    /// Keep /init from the base archive
    #[arg(long)]
    pub useinit: bool,

    /// Output file (default: /tmp/initramfs.<os>_<arch>.cpio)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Command or path /init links to; empty to omit
    #[arg(long, default_value = "init")]
    pub initcmd: String,

    /// Command line /bin/uinit runs; arguments go to /etc/uinit.flags
    #[arg(long, default_value = "")]
    pub uinitcmd: String,

    /// Command or path /bin/sh and /bin/defaultsh link to; empty to omit.
    /// No shell is assumed, since the command set is whatever packages are built
    #[arg(long, default_value = "")]
    pub defaultsh: String,

    /// Build no commands, only the base, extra files and links
    #[arg(long)]
    pub nocmd: bool,

    /// Extra file or directory, `src` or `src:dst` (repeatable)
    #[arg(long = "files")]
    pub files: Vec<String>,

    /// Install bb command entries as `#!/bbin/bb` scripts instead of symlinks
    #[arg(long)]
    pub shellbang: bool,

    /// Keep symbols in compiled binaries
    #[arg(long)]
    pub no_strip: bool,

    /// Comma-separated cfg names passed to the compiler
    #[arg(long, default_value = "")]
    pub tags: String,

    /// Allow dynamic linking against the target C library
    #[arg(long)]
    pub native_linkage: bool,

    /// Target triple (default: host)
    #[arg(long)]
    pub target: Option<String>,

    /// Root for shared library lookups of extra files
    #[arg(long)]
    pub sysroot: Option<PathBuf>,

    /// Concurrent compiles (default: number of CPUs)
    #[arg(short, long, default_value_t = 0)]
    pub jobs: usize,

    /// Upsert build statistics into this JSON file
    #[arg(long)]
    pub stats_output_path: Option<PathBuf>,

    /// Label for the statistics entry
    #[arg(long)]
    pub stats_label: Option<String>,

    /// Package directories or template names; `dir/*` selects every package
    /// under dir. Defaults to RAMFORGE_PACKAGES
    pub packages: Vec<String>,
}

/// Execute the build command.
pub fn cmd_build(args: BuildArgs, config: &Config) -> Result<()> {
    let opts = build_opts(&args, config)?;
    info!("Building {} for {}", opts.output.display(), opts.env);

    let summary = create_image(&opts)?;

    let digest = sha256_file(&summary.output)?;
    println!(
        "{} ({} bytes, sha256 {})",
        summary.output.display(),
        summary.output_size,
        digest
    );

    if let Some(path) = &args.stats_output_path {
        let label = args
            .stats_label
            .clone()
            .unwrap_or_else(|| stats::default_label(&args.build, &opts.env, &summary.commands));
        stats::record(path, BuildStats::from_summary(&label, &summary))?;
        info!("Recorded stats for {} in {}", label, path.display());
    }
    Ok(())
}

/// Turn flags and configuration into one immutable build description.
pub fn build_opts(args: &BuildArgs, config: &Config) -> Result<BuildOpts> {
    let mut env = config.environment(args.target.as_deref());
    env.build_tags = args
        .tags
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    env.native_linkage = args.native_linkage;

    let builder = Builder::from_name(&args.build)?;
    let format = Format::from_name(&args.format)?;

    let mut uinit = split_command_line(&args.uinitcmd)
        .with_context(|| format!("Invalid --uinitcmd {:?}", args.uinitcmd))?
        .into_iter();
    let uinit_cmd = uinit.next().unwrap_or_default();
    let uinit_args: Vec<String> = uinit.collect();

    let commands = if args.nocmd {
        if !args.packages.is_empty() {
            warn!("--nocmd given; ignoring {} package(s)", args.packages.len());
        }
        Vec::new()
    } else {
        vec![CommandGroup {
            builder,
            packages: config.expand_packages(&args.packages),
        }]
    };

    let mut opts = BuildOpts::new(env);
    opts.output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output(&opts.env));
    opts.commands = commands;
    opts.temp_dir = args.tmpdir.clone().or_else(|| config.tmpdir.clone());
    opts.extra_files = args.files.clone();
    opts.format = format;
    opts.base_archive = args.base.clone();
    opts.use_existing_init = args.useinit;
    opts.init_cmd = args.initcmd.clone();
    opts.default_shell = args.defaultsh.clone();
    opts.uinit_cmd = uinit_cmd;
    opts.uinit_args = uinit_args;
    opts.no_strip = args.no_strip;
    opts.shellbang = args.shellbang;
    opts.sysroot = args.sysroot.clone().unwrap_or_else(|| config.sysroot.clone());
    opts.jobs = args.jobs;
    Ok(opts)
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}
