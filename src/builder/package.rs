//! Source package resolution.
//!
//! A package is a directory holding a `Cargo.toml` with exactly one binary
//! target. The command name is the directory's base name.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct Manifest {
    package: Option<PackageSection>,
    #[serde(default)]
    bin: Vec<BinTarget>,
    lib: Option<toml::Value>,
}

#[derive(Debug, Deserialize)]
struct PackageSection {
    name: String,
}

#[derive(Debug, Deserialize)]
struct BinTarget {
    name: Option<String>,
    path: Option<PathBuf>,
}

/// One resolved command package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Name the command is installed and invoked under.
    pub name: String,
    /// Package directory.
    pub dir: PathBuf,
    pub package_name: String,
    /// Binary target passed to `--bin`.
    pub bin_name: String,
    /// Source file holding `main`, relative to `dir`.
    pub entry_file: PathBuf,
    /// The package also declares a library target.
    pub has_lib: bool,
}

impl Command {
    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join("Cargo.toml")
    }

    /// Resolve the package rooted at `dir`.
    pub fn resolve(dir: &Path) -> Result<Self> {
        let dir = fs::canonicalize(dir)
            .map_err(|e| Error::config(format!("package {} not found: {}", dir.display(), e)))?;
        let manifest_path = dir.join("Cargo.toml");
        let text = fs::read_to_string(&manifest_path).map_err(|e| {
            Error::config(format!("{} is not a package: {}", dir.display(), e))
        })?;
        let manifest: Manifest = toml::from_str(&text).map_err(|e| {
            Error::config(format!("invalid manifest {}: {}", manifest_path.display(), e))
        })?;

        let package_name = manifest
            .package
            .map(|p| p.name)
            .ok_or_else(|| Error::config(format!("{} has no [package] section", manifest_path.display())))?;

        let (bin_name, entry_file) = match manifest.bin.as_slice() {
            [] => (package_name.clone(), PathBuf::from("src/main.rs")),
            [bin] => (
                bin.name.clone().unwrap_or_else(|| package_name.clone()),
                bin.path.clone().unwrap_or_else(|| PathBuf::from("src/main.rs")),
            ),
            _ => {
                return Err(Error::config(format!(
                    "{} declares {} binary targets, expected exactly one",
                    manifest_path.display(),
                    manifest.bin.len()
                )))
            }
        };
        if !dir.join(&entry_file).is_file() {
            return Err(Error::config(format!(
                "{} has no binary entry point {}",
                dir.display(),
                entry_file.display()
            )));
        }

        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::config(format!("cannot derive a command name from {}", dir.display())))?;

        Ok(Self {
            name,
            has_lib: manifest.lib.is_some() || dir.join("src/lib.rs").is_file(),
            dir,
            package_name,
            bin_name,
            entry_file,
        })
    }
}

/// Expand package identifiers and resolve each one.
///
/// An identifier ending in `/*` stands for every immediate subdirectory
/// that contains a `Cargo.toml`, in name order.
pub fn resolve_packages(specs: &[String]) -> Result<Vec<Command>> {
    let mut commands = Vec::new();
    for spec in specs {
        for dir in expand(spec)? {
            commands.push(Command::resolve(&dir)?);
        }
    }
    Ok(commands)
}

fn expand(spec: &str) -> Result<Vec<PathBuf>> {
    let Some(parent) = spec.strip_suffix("/*") else {
        return Ok(vec![PathBuf::from(spec)]);
    };
    let parent = if parent.is_empty() { "/" } else { parent };

    let entries = fs::read_dir(parent)
        .map_err(|e| Error::config(format!("cannot expand {}: {}", spec, e)))?;
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.join("Cargo.toml").is_file())
        .collect();
    dirs.sort();

    if dirs.is_empty() {
        return Err(Error::config(format!("{} matched no packages", spec)));
    }
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_package(root: &Path, dir: &str, manifest: &str) -> PathBuf {
        let pkg = root.join(dir);
        fs::create_dir_all(pkg.join("src")).unwrap();
        fs::write(pkg.join("Cargo.toml"), manifest).unwrap();
        fs::write(pkg.join("src/main.rs"), "fn main() {}\n").unwrap();
        pkg
    }

    #[test]
    fn test_resolve_default_bin() {
        let tmp = tempfile::tempdir().unwrap();
        let pkg = write_package(tmp.path(), "ls", "[package]\nname = \"u-ls\"\nversion = \"0.1.0\"\n");

        let cmd = Command::resolve(&pkg).unwrap();
        assert_eq!(cmd.name, "ls");
        assert_eq!(cmd.package_name, "u-ls");
        assert_eq!(cmd.bin_name, "u-ls");
        assert_eq!(cmd.entry_file, PathBuf::from("src/main.rs"));
        assert!(!cmd.has_lib);
    }

    #[test]
    fn test_resolve_explicit_bin() {
        let tmp = tempfile::tempdir().unwrap();
        let pkg = tmp.path().join("cat");
        fs::create_dir_all(pkg.join("src")).unwrap();
        fs::write(
            pkg.join("Cargo.toml"),
            "[package]\nname = \"cat\"\n\n[[bin]]\nname = \"kitty\"\npath = \"src/cat.rs\"\n",
        )
        .unwrap();
        fs::write(pkg.join("src/cat.rs"), "fn main() {}\n").unwrap();

        let cmd = Command::resolve(&pkg).unwrap();
        assert_eq!(cmd.bin_name, "kitty");
        assert_eq!(cmd.entry_file, PathBuf::from("src/cat.rs"));
    }

    #[test]
    fn test_missing_package_is_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Command::resolve(&tmp.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_entry_point() {
        let tmp = tempfile::tempdir().unwrap();
        let pkg = tmp.path().join("lib-only");
        fs::create_dir_all(&pkg).unwrap();
        fs::write(pkg.join("Cargo.toml"), "[package]\nname = \"x\"\n").unwrap();
        assert!(matches!(Command::resolve(&pkg), Err(Error::Config(_))));
    }

    #[test]
    fn test_glob_expansion_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        write_package(tmp.path(), "zz", "[package]\nname = \"zz\"\n");
        write_package(tmp.path(), "aa", "[package]\nname = \"aa\"\n");
        fs::create_dir_all(tmp.path().join("not-a-package")).unwrap();

        let spec = format!("{}/*", tmp.path().display());
        let names: Vec<String> = resolve_packages(&[spec])
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["aa", "zz"]);
    }
}
