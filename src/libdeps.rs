//! Extra-file expansion and shared-library dependency resolution.
//!
//! Uses `readelf` instead of `ldd` to find dependencies. readelf reads the
//! ELF headers directly, so it works for foreign-architecture binaries where
//! ldd would have to execute them through the host dynamic linker.

use std::collections::{HashSet, VecDeque};
use std::ffi::OsStr;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::archive::record::normalize_path;
use crate::error::{Error, Result};
use crate::process::Cmd;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const MAX_LINK_DEPTH: usize = 40;

/// One `--files` entry: `src` or `src:dst`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraFile {
    pub source: PathBuf,
    /// Destination relative to the archive root.
    pub dest: String,
}

impl ExtraFile {
    /// Parse a `--files` argument. Empty entries yield `None`.
    ///
    /// Without an explicit destination, an absolute source keeps its path
    /// inside the archive and a relative source is placed at the same
    /// relative path.
    pub fn parse(spec: &str) -> Option<Self> {
        if spec.is_empty() {
            return None;
        }
        let (source, dest) = match spec.split_once(':') {
            Some((src, dst)) => (src, dst),
            None => (spec, spec),
        };
        Some(Self {
            source: PathBuf::from(source),
            dest: normalize_path(dest).unwrap_or_default(),
        })
    }
}

/// Dynamic linking information read from one ELF object.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DynamicInfo {
    pub interpreter: Option<String>,
    pub needed: Vec<String>,
    pub runpath: Vec<String>,
}

/// Parse `readelf -W -l -d` output.
///
/// Example:
/// ```text
///       [Requesting program interpreter: /lib64/ld-linux-x86-64.so.2]
///  0x0000000000000001 (NEEDED)             Shared library: [libc.so.6]
///  0x000000000000001d (RUNPATH)            Library runpath: [$ORIGIN/../lib]
/// ```
pub fn parse_readelf_output(output: &str) -> DynamicInfo {
    let mut info = DynamicInfo::default();

    for line in output.lines() {
        let bracketed = || {
            let start = line.find('[')?;
            let end = line.rfind(']')?;
            (start < end).then(|| line[start + 1..end].to_string())
        };

        if line.contains("Requesting program interpreter:") {
            if let Some(value) = bracketed() {
                let path = value
                    .trim_start_matches("Requesting program interpreter:")
                    .trim()
                    .to_string();
                info.interpreter = Some(path);
            }
        } else if line.contains("(NEEDED)") && line.contains("Shared library:") {
            if let Some(lib) = bracketed() {
                info.needed.push(lib);
            }
        } else if line.contains("(RUNPATH)") || line.contains("(RPATH)") {
            if let Some(paths) = bracketed() {
                info.runpath
                    .extend(paths.split(':').filter(|p| !p.is_empty()).map(str::to_string));
            }
        }
    }

    info
}

/// Multiarch directory name for an architecture, as used by Debian-style systems.
fn multiarch_dir(arch: &str) -> Option<&'static str> {
    match arch {
        "x86_64" => Some("x86_64-linux-gnu"),
        "x86" => Some("i386-linux-gnu"),
        "aarch64" => Some("aarch64-linux-gnu"),
        "arm" => Some("arm-linux-gnueabihf"),
        "riscv64" => Some("riscv64-linux-gnu"),
        "powerpc64" => Some("powerpc64le-linux-gnu"),
        "s390x" => Some("s390x-linux-gnu"),
        _ => None,
    }
}

/// Resolves extra files and the shared libraries they need.
///
/// Library lookups happen under `sysroot`, and resolved libraries are
/// placed in the archive at their path relative to it.
#[derive(Debug, Clone)]
pub struct Resolver {
    sysroot: PathBuf,
    search_dirs: Vec<String>,
}

impl Resolver {
    pub fn new(sysroot: impl Into<PathBuf>, arch: &str) -> Self {
        let mut search_dirs: Vec<String> = Vec::new();
        for dir in ["lib64", "usr/lib64", "lib", "usr/lib"] {
            search_dirs.push(dir.to_string());
        }
        if let Some(multiarch) = multiarch_dir(arch) {
            search_dirs.push(format!("lib/{}", multiarch));
            search_dirs.push(format!("usr/lib/{}", multiarch));
        }
        search_dirs.push("usr/local/lib".to_string());

        Self {
            sysroot: sysroot.into(),
            search_dirs,
        }
    }

    /// Expand one extra file into `(source, archive path)` pairs.
    ///
    /// Directories are walked recursively (symlinks are not followed). Every
    /// ELF file found is followed by its interpreter and transitive
    /// libraries. A missing source or library is an error.
    pub fn resolve(&self, extra: &ExtraFile) -> Result<Vec<(PathBuf, String)>> {
        let source = &extra.source;
        let meta = fs::symlink_metadata(source)
            .map_err(|e| Error::resolution(source, format!("does not exist: {}", e)))?;

        let mut entries = Vec::new();
        let mut seen = HashSet::new();

        if meta.is_dir() {
            for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
                let entry = entry.map_err(|e| Error::resolution(source, e.to_string()))?;
                let rel = entry.path().strip_prefix(source).unwrap_or(entry.path());
                let dest = join_archive(&extra.dest, rel);
                if dest.is_empty() {
                    continue;
                }
                seen.insert(dest.clone());
                entries.push((entry.path().to_path_buf(), dest));
            }
        } else {
            if extra.dest.is_empty() {
                return Err(Error::resolution(source, "has no destination inside the archive"));
            }
            seen.insert(extra.dest.clone());
            entries.push((source.clone(), extra.dest.clone()));
        }

        let mut libraries = Vec::new();
        for (path, _) in &entries {
            if path.is_file() && is_elf(path) {
                for lib in self.dependencies(path)? {
                    let dest = self.archive_path(&lib)?;
                    if seen.insert(dest.clone()) {
                        libraries.push((lib, dest));
                    }
                }
            }
        }
        entries.extend(libraries);
        Ok(entries)
    }

    /// Transitive shared-library closure of an ELF binary, in discovery order.
    ///
    /// Symlinked libraries are returned together with the file they point to.
    pub fn dependencies(&self, binary: &Path) -> Result<Vec<PathBuf>> {
        let mut result: Vec<PathBuf> = Vec::new();
        let mut known: HashSet<PathBuf> = HashSet::new();
        let mut queue: VecDeque<PathBuf> = VecDeque::from([binary.to_path_buf()]);

        while let Some(object) = queue.pop_front() {
            let info = read_dynamic_info(&object)?;

            let mut found = Vec::new();
            if let Some(interp) = &info.interpreter {
                let path = self.sysroot.join(interp.trim_start_matches('/'));
                if fs::symlink_metadata(&path).is_err() {
                    return Err(Error::resolution(
                        binary,
                        format!("program interpreter {} not found under {}", interp, self.sysroot.display()),
                    ));
                }
                found.push(path);
            }
            for lib in &info.needed {
                let path = self.find_library(lib, &info.runpath, &object).ok_or_else(|| {
                    Error::resolution(
                        binary,
                        format!(
                            "{} needs {} which was not found under {} (searched {})",
                            object.display(),
                            lib,
                            self.sysroot.display(),
                            self.search_dirs.join(", ")
                        ),
                    )
                })?;
                found.push(path);
            }

            for path in found {
                if !known.insert(path.clone()) {
                    continue;
                }
                debug!("{} -> {}", object.display(), path.display());
                result.push(path.clone());
                if path.is_symlink() {
                    let real = self.follow_link(&path)?;
                    if known.insert(real.clone()) {
                        result.push(real.clone());
                    }
                    queue.push_back(real);
                } else {
                    queue.push_back(path);
                }
            }
        }

        Ok(result)
    }

    fn find_library(&self, lib: &str, runpath: &[String], object: &Path) -> Option<PathBuf> {
        let origin = object.parent().unwrap_or(Path::new("/"));
        let runpath_dirs = runpath.iter().map(|dir| {
            if dir.contains("$ORIGIN") || dir.contains("${ORIGIN}") {
                let origin = origin.to_string_lossy();
                PathBuf::from(dir.replace("${ORIGIN}", &origin).replace("$ORIGIN", &origin))
            } else {
                self.sysroot.join(dir.trim_start_matches('/'))
            }
        });
        let default_dirs = self.search_dirs.iter().map(|dir| self.sysroot.join(dir));

        runpath_dirs
            .chain(default_dirs)
            .map(|dir| dir.join(lib))
            .find(|p| p.exists() || p.is_symlink())
    }

    /// Resolve a library symlink without leaving the sysroot.
    ///
    /// Absolute link targets are taken relative to the sysroot, relative
    /// ones to the directory holding the link.
    fn follow_link(&self, link: &Path) -> Result<PathBuf> {
        let mut path = link.to_path_buf();
        for _ in 0..MAX_LINK_DEPTH {
            let target = match fs::read_link(&path) {
                Ok(target) => target,
                Err(_) if path.exists() => return Ok(path),
                Err(e) => {
                    return Err(Error::resolution(
                        link,
                        format!("dangling library symlink ({}): {}", path.display(), e),
                    ))
                }
            };
            path = if target.is_absolute() {
                lexical_join(&self.sysroot, &target)
            } else {
                let dir = path.parent().unwrap_or(Path::new("/"));
                match dir.strip_prefix(&self.sysroot) {
                    Ok(rel) => lexical_join(&self.sysroot, &rel.join(&target)),
                    Err(_) => dir.join(&target),
                }
            };
        }
        Err(Error::resolution(link, "too many levels of symbolic links"))
    }

    /// Archive location of a resolved library: its path relative to the sysroot.
    fn archive_path(&self, lib: &Path) -> Result<String> {
        let sysroot = fs::canonicalize(&self.sysroot).unwrap_or_else(|_| self.sysroot.clone());
        let rel = lib
            .strip_prefix(&self.sysroot)
            .or_else(|_| lib.strip_prefix(&sysroot))
            .map_err(|_| {
                Error::resolution(
                    lib,
                    format!("resolves outside the sysroot {}", self.sysroot.display()),
                )
            })?;
        normalize_path(&rel.to_string_lossy())
            .ok_or_else(|| Error::resolution(lib, "has no path inside the archive"))
    }
}

/// `base` joined with `rel`, with `.` and `..` resolved textually.
///
/// `..` never climbs above `base`.
fn lexical_join(base: &Path, rel: &Path) -> PathBuf {
    let mut parts: Vec<&OsStr> = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    let mut path = base.to_path_buf();
    path.extend(parts);
    path
}

fn join_archive(dest: &str, rel: &Path) -> String {
    let rel = rel.to_string_lossy();
    let joined = if dest.is_empty() {
        rel.into_owned()
    } else if rel.is_empty() {
        dest.to_string()
    } else {
        format!("{}/{}", dest, rel)
    };
    normalize_path(&joined).unwrap_or_default()
}

/// True if the file starts with the ELF magic.
pub fn is_elf(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map(|_| &magic == ELF_MAGIC)
        .unwrap_or(false)
}

fn read_dynamic_info(object: &Path) -> Result<DynamicInfo> {
    let output = Cmd::new("readelf")
        .args(["-W", "-l", "-d"])
        .arg_path(object)
        .error_msg(format!("readelf failed on {}", object.display()))
        .run()
        .map_err(|e| Error::resolution(object, e.to_string()))?;
    Ok(parse_readelf_output(&output.stdout))
}
