//! Image orchestration.
//!
//! ```text
//! validate env + output -> workspace -> builders -> extra files
//!   -> symlinks -> merge -> <output>.tmp -> rename
//! ```
//!
//! The output file is written next to its destination with a `.tmp`
//! suffix and renamed into place only after every stage succeeded. A
//! workspace created here is removed on every exit path.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::archive::{compose, Base, Format, Layers, Record};
use crate::builder::{resolve_packages, BuildContext, BuildOutput, Builder};
use crate::environment::Environment;
use crate::error::{ArchiveError, Error, Result};
use crate::libdeps::{ExtraFile, Resolver};
use crate::timing::Timer;

const UINIT_FLAGS: &str = "etc/uinit.flags";

/// Packages built by one builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandGroup {
    pub builder: Builder,
    /// Package directories, or `<dir>/*` for every package under `dir`.
    pub packages: Vec<String>,
}

/// Everything one image build needs.
#[derive(Debug, Clone)]
pub struct BuildOpts {
    pub env: Environment,
    /// Built in order; later groups win on path collisions.
    pub commands: Vec<CommandGroup>,
    /// Workspace to use instead of a fresh temporary directory. Never removed.
    pub temp_dir: Option<PathBuf>,
    /// `src` or `src:dst` entries.
    pub extra_files: Vec<String>,
    pub output: PathBuf,
    pub format: Format,
    /// Lowest layer. `None` selects the built-in skeleton; an empty file
    /// such as `/dev/null` gives an empty base.
    pub base_archive: Option<PathBuf>,
    pub use_existing_init: bool,
    pub init_cmd: String,
    pub default_shell: String,
    pub uinit_cmd: String,
    pub uinit_args: Vec<String>,
    pub no_strip: bool,
    /// Install bb entries as `#!` scripts instead of symlinks.
    pub shellbang: bool,
    /// Root under which shared libraries of extra files are looked up.
    pub sysroot: PathBuf,
    /// Concurrent compiles; zero means one per CPU.
    pub jobs: usize,
}

impl BuildOpts {
    pub fn new(env: Environment) -> Self {
        let output = default_output(&env);
        Self {
            env,
            commands: Vec::new(),
            temp_dir: None,
            extra_files: Vec::new(),
            output,
            format: Format::default(),
            base_archive: None,
            use_existing_init: false,
            init_cmd: "init".to_string(),
            default_shell: String::new(),
            uinit_cmd: String::new(),
            uinit_args: Vec::new(),
            no_strip: false,
            shellbang: false,
            sysroot: PathBuf::from("/"),
            jobs: 0,
        }
    }
}

/// What a successful build produced.
#[derive(Debug, Clone)]
pub struct ImageSummary {
    pub output: PathBuf,
    pub output_size: u64,
    pub records: usize,
    /// Commands built across all groups, sorted.
    pub commands: Vec<String>,
    pub started: SystemTime,
    pub duration: Duration,
}

/// `/tmp/initramfs.<os>_<arch>.cpio`
pub fn default_output(env: &Environment) -> PathBuf {
    PathBuf::from(format!(
        "/tmp/initramfs.{}_{}.cpio",
        env.target_os, env.target_arch
    ))
}

/// Build the image described by `opts`.
///
/// Either a complete archive ends up at `opts.output` or nothing does.
pub fn create_image(opts: &BuildOpts) -> Result<ImageSummary> {
    let started = SystemTime::now();
    let clock = Instant::now();

    opts.env.validate()?;
    check_output_dir(&opts.output)?;

    let mut groups = Vec::new();
    for group in &opts.commands {
        let commands = resolve_packages(&group.packages)?;
        group.builder.check(&commands)?;
        groups.push((group.builder, commands));
    }

    let workspace = Workspace::acquire(opts.temp_dir.as_deref())?;
    let ctx = BuildContext::new(workspace.path(), opts.env.clone())
        .with_strip(!opts.no_strip)
        .with_jobs(opts.jobs)
        .with_shellbang(opts.shellbang);

    let outputs = if groups.is_empty() {
        Vec::new()
    } else {
        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| Error::Environment(format!("cannot start async runtime: {}", e)))?;
        runtime.block_on(async {
            let mut outputs = Vec::new();
            for (builder, commands) in &groups {
                outputs.push(builder.build(commands, &ctx).await?);
            }
            Ok::<_, Error>(outputs)
        })?
    };

    let timer = Timer::start("Extra files");
    let extra_files = extra_file_records(opts)?;
    timer.finish();

    let layers = Layers {
        groups: outputs.iter().map(BuildOutput::records).collect(),
        extra_files,
        symlinks: symlink_records(opts, &outputs)?,
    };

    let timer = Timer::start("Archive");
    let records = match open_base(opts.base_archive.as_deref())? {
        Some((file, format)) => {
            info!("Merging onto base archive ({})", format);
            compose(
                Base::Archive(format.reader(BufReader::new(file))),
                layers,
                opts.use_existing_init,
            )?
        }
        None => compose(Base::Skeleton, layers, opts.use_existing_init)?,
    };

    let (pending, file) = PendingOutput::create(&opts.output)?;
    {
        let mut writer = opts.format.open_writer(BufWriter::new(&file));
        for record in &records {
            writer.write_record(record)?;
        }
        writer.finish()?;
    }
    file.sync_all()
        .map_err(|e| ArchiveError::io(format!("sync {}", pending.tmp.display()), e))?;
    let output_size = pending.commit()?;
    timer.finish();

    let mut commands: Vec<String> = outputs.iter().flat_map(BuildOutput::commands).collect();
    commands.sort();
    drop(workspace);

    info!(
        "Wrote {} ({} records, {} bytes)",
        opts.output.display(),
        records.len(),
        output_size
    );
    Ok(ImageSummary {
        output: opts.output.clone(),
        output_size,
        records: records.len(),
        commands,
        started,
        duration: clock.elapsed(),
    })
}

fn check_output_dir(output: &Path) -> Result<()> {
    if output.file_name().is_none() {
        return Err(Error::config(format!(
            "output path {} does not name a file",
            output.display()
        )));
    }
    let dir = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let meta = fs::metadata(dir).map_err(|e| Error::io(dir, e))?;
    if !meta.is_dir() {
        return Err(Error::config(format!("{} is not a directory", dir.display())));
    }
    Ok(())
}

fn extra_file_records(opts: &BuildOpts) -> Result<Vec<Record>> {
    let resolver = Resolver::new(&opts.sysroot, &opts.env.target_arch);
    let mut records = Vec::new();
    for spec in &opts.extra_files {
        let Some(extra) = ExtraFile::parse(spec) else {
            continue;
        };
        for (source, dest) in resolver.resolve(&extra)? {
            debug!("{} -> {}", source.display(), dest);
            records.push(Record::from_host(&source, &dest)?);
        }
    }
    Ok(records)
}

/// Links for init, uinit and the default shell, plus `etc/uinit.flags`.
fn symlink_records(opts: &BuildOpts, outputs: &[BuildOutput]) -> Result<Vec<Record>> {
    let mut installed: HashMap<String, String> = HashMap::new();
    for output in outputs {
        let dir = output.builder.install_dir();
        for name in output.commands() {
            let path = format!("/{}/{}", dir, name);
            installed.insert(name, path);
        }
    }

    let resolve = |option: &str, target: &str| -> Result<Option<String>> {
        if target.is_empty() {
            return Ok(None);
        }
        if target.contains('/') {
            return Ok(Some(target.to_string()));
        }
        match installed.get(target) {
            Some(path) => Ok(Some(path.clone())),
            None if !outputs.is_empty() => Err(Error::config(format!(
                "{} {:?} is neither a path nor a built command",
                option, target
            ))),
            None => {
                warn!("{} {:?} was not built; skipping its link", option, target);
                Ok(None)
            }
        }
    };

    let mut records = Vec::new();
    if let Some(target) = resolve("init command", &opts.init_cmd)? {
        records.push(Record::symlink("init", &relative_target("init", &target)));
    }
    if let Some(target) = resolve("uinit command", &opts.uinit_cmd)? {
        records.push(Record::symlink("bin/uinit", &relative_target("bin/uinit", &target)));
        if !opts.uinit_args.is_empty() {
            let flags: Vec<String> = opts.uinit_args.iter().map(|a| format!("{:?}", a)).collect();
            records.push(Record::file(UINIT_FLAGS, flags.join("\n"), 0o444));
        }
    }
    if let Some(target) = resolve("default shell", &opts.default_shell)? {
        for link in ["bin/sh", "bin/defaultsh"] {
            records.push(Record::symlink(link, &relative_target(link, &target)));
        }
    }
    Ok(records)
}

/// Express an absolute `target` relative to the directory holding `link`.
///
/// Relative targets are returned unchanged.
pub fn relative_target(link: &str, target: &str) -> String {
    if !target.starts_with('/') {
        return target.to_string();
    }
    let link = Path::new("/").join(link);
    let link_dir = link.parent().unwrap_or(Path::new("/"));
    match pathdiff::diff_paths(target, link_dir) {
        Some(rel) if !rel.as_os_str().is_empty() => rel.to_string_lossy().into_owned(),
        _ => ".".to_string(),
    }
}

/// Open the base archive and detect its compression.
fn open_base(path: Option<&Path>) -> Result<Option<(File, Format)>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let mut header = [0u8; 2];
    let mut head = File::open(path).map_err(|e| Error::io(path, e))?;
    let read = head.read(&mut header).map_err(|e| Error::io(path, e))?;
    let format = Format::detect(&header[..read]);

    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    Ok(Some((file, format)))
}

/// Scratch directory for one run.
enum Workspace {
    /// Removed when dropped.
    Owned(TempDir),
    /// Supplied by the user and left in place.
    User(PathBuf),
}

impl Workspace {
    fn acquire(dir: Option<&Path>) -> Result<Self> {
        match dir {
            Some(dir) => {
                fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
                info!("Using workspace {}", dir.display());
                Ok(Workspace::User(dir.to_path_buf()))
            }
            None => {
                let tmp = tempfile::Builder::new()
                    .prefix("ramforge-")
                    .tempdir()
                    .map_err(|e| Error::io(std::env::temp_dir(), e))?;
                debug!("Created workspace {}", tmp.path().display());
                Ok(Workspace::Owned(tmp))
            }
        }
    }

    fn path(&self) -> &Path {
        match self {
            Workspace::Owned(tmp) => tmp.path(),
            Workspace::User(dir) => dir,
        }
    }
}

/// `<output>.tmp`, removed unless committed.
struct PendingOutput {
    tmp: PathBuf,
    dest: PathBuf,
    committed: bool,
}

impl PendingOutput {
    fn create(dest: &Path) -> Result<(Self, File)> {
        let mut name = dest.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        let tmp = dest.with_file_name(name);
        let file = File::create(&tmp).map_err(|e| Error::io(&tmp, e))?;
        Ok((
            Self {
                tmp,
                dest: dest.to_path_buf(),
                committed: false,
            },
            file,
        ))
    }

    /// Move the finished file into place and return its size.
    fn commit(mut self) -> Result<u64> {
        fs::rename(&self.tmp, &self.dest).map_err(|e| Error::io(&self.dest, e))?;
        self.committed = true;
        let meta = fs::metadata(&self.dest).map_err(|e| Error::io(&self.dest, e))?;
        Ok(meta.len())
    }
}

impl Drop for PendingOutput {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}
