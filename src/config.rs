//! Configuration from environment variables and `.env`.
//!
//! Command-line flags win over environment variables, which win over the
//! defaults below.
//!
//! Package templates name a list of package directories:
//!
//! ```text
//! RAMFORGE_TEMPLATE_CORE="cmds/core/* tools/init"   ramforge build core
//! RAMFORGE_PACKAGES="cmds/core/*"                    ramforge build
//! ``` The CLI loads `.env` with dotenvy before calling
//! [`Config::load`].

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use anyhow::{bail, Result};

use crate::environment::{default_triple, Environment};
use crate::process::Cmd;

pub const ENV_CARGO: &str = "RAMFORGE_CARGO";
pub const ENV_TARGET: &str = "RAMFORGE_TARGET";
pub const ENV_TARGET_OS: &str = "RAMFORGE_TARGET_OS";
pub const ENV_TARGET_ARCH: &str = "RAMFORGE_TARGET_ARCH";
pub const ENV_TMPDIR: &str = "RAMFORGE_TMPDIR";
pub const ENV_SYSROOT: &str = "RAMFORGE_SYSROOT";
pub const ENV_PACKAGES: &str = "RAMFORGE_PACKAGES";
pub const ENV_TEMPLATE_PREFIX: &str = "RAMFORGE_TEMPLATE_";

/// Settings that do not come from command-line flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Toolchain driver (default: `cargo`).
    pub cargo: PathBuf,
    /// Full target triple; overrides OS and architecture.
    pub target: Option<String>,
    pub target_os: Option<String>,
    pub target_arch: Option<String>,
    /// Workspace directory to reuse instead of a fresh temporary one.
    pub tmpdir: Option<PathBuf>,
    /// Where shared libraries of extra files are looked up (default: `/`).
    pub sysroot: PathBuf,
    /// Packages built when none are named on the command line.
    pub default_packages: Vec<String>,
    /// Template name (lowercase) to the packages it stands for.
    pub templates: BTreeMap<String, Vec<String>>,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn load() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build a configuration from explicit key/value pairs.
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter(|(_, v)| !v.is_empty())
            .collect();

        let words = |v: &String| v.split_whitespace().map(str::to_string).collect::<Vec<_>>();
        let templates = vars
            .iter()
            .filter_map(|(key, value)| {
                let name = key.strip_prefix(ENV_TEMPLATE_PREFIX)?;
                (!name.is_empty()).then(|| (name.to_lowercase(), words(value)))
            })
            .collect();

        Self {
            cargo: vars
                .get(ENV_CARGO)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("cargo")),
            target: vars.get(ENV_TARGET).cloned(),
            target_os: vars.get(ENV_TARGET_OS).cloned(),
            target_arch: vars.get(ENV_TARGET_ARCH).cloned(),
            tmpdir: vars.get(ENV_TMPDIR).map(PathBuf::from),
            sysroot: vars
                .get(ENV_SYSROOT)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/")),
            default_packages: vars.get(ENV_PACKAGES).map(words).unwrap_or_default(),
            templates,
        }
    }

    /// Replace template names with their packages.
    ///
    /// An empty list becomes the default package set.
    pub fn expand_packages(&self, args: &[String]) -> Vec<String> {
        let mut packages = Vec::new();
        for arg in args {
            match self.templates.get(arg) {
                Some(expansion) => packages.extend(expansion.iter().cloned()),
                None => packages.push(arg.clone()),
            }
        }
        if packages.is_empty() {
            packages = self.default_packages.clone();
        }
        packages
    }

    /// Target environment, with `target` (from `--target`) taking priority.
    ///
    /// Without any target setting the host triple reported by `rustc` is
    /// used, so that native builds match what cargo would pick.
    pub fn environment(&self, target: Option<&str>) -> Environment {
        let mut env = match target.or(self.target.as_deref()) {
            Some(triple) => Environment::for_target(triple),
            None => {
                let mut env = Environment::host();
                let os = self.target_os.as_deref().unwrap_or(std::env::consts::OS);
                let arch = self.target_arch.as_deref().unwrap_or(std::env::consts::ARCH);
                if os == std::env::consts::OS && arch == std::env::consts::ARCH {
                    if let Some(triple) = host_triple() {
                        env.target = triple;
                    }
                } else {
                    env.target = default_triple(arch, os);
                }
                env.target_os = os.to_string();
                env.target_arch = arch.to_string();
                env
            }
        };
        env.cargo = self.cargo.clone();
        env
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "(unset)".to_string());
        println!("Configuration:");
        println!("  {}: {}", ENV_CARGO, self.cargo.display());
        println!("  {}: {}", ENV_TARGET, show(&self.target));
        println!("  {}: {}", ENV_TARGET_OS, show(&self.target_os));
        println!("  {}: {}", ENV_TARGET_ARCH, show(&self.target_arch));
        println!(
            "  {}: {}",
            ENV_TMPDIR,
            show(&self.tmpdir.as_ref().map(|p| p.display().to_string()))
        );
        println!("  {}: {}", ENV_SYSROOT, self.sysroot.display());
        println!("  {}: {}", ENV_PACKAGES, self.default_packages.join(" "));
        for (name, packages) in &self.templates {
            println!("  template {}: {}", name, packages.join(" "));
        }
        println!("  Resolved target: {}", self.environment(None));
    }
}

/// Host triple as reported by `rustc -vV`.
pub fn host_triple() -> Option<String> {
    let output = Cmd::new("rustc").arg("-vV").run().ok()?;
    output
        .stdout_trimmed()
        .lines()
        .find_map(|line| line.strip_prefix("host: "))
        .map(|triple| triple.trim().to_string())
}

/// Split a command line into words the way a POSIX shell would.
///
/// Single quotes are literal, double quotes allow backslash escapes, and an
/// unquoted backslash escapes the next character.
pub fn split_command_line(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => bail!("unterminated single quote in {:?}", line),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => word.push(c),
                            Some(c) => {
                                word.push('\\');
                                word.push(c);
                            }
                            None => bail!("unterminated double quote in {:?}", line),
                        },
                        Some(c) => word.push(c),
                        None => bail!("unterminated double quote in {:?}", line),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => word.push(c),
                    None => bail!("trailing backslash in {:?}", line),
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    if in_word {
        words.push(word);
    }
    Ok(words)
}
