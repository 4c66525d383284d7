//! Build strategies that turn command packages into installable binaries.
//!
//! | Strategy    | Name     | Installs                              |
//! |-------------|----------|---------------------------------------|
//! | Multiplexed | `bb`     | `bbin/bb` + `bbin/<name> -> bb` links |
//! | PerCommand  | `binary` | `bin/<name>`                          |
//!
//! With shellbang enabled the `bbin/<name>` entries are `#!/bbin/bb`
//! scripts instead of links, for filesystems without symlink support.

pub mod binary;
mod compile;
mod context;
pub mod multiplex;
pub mod package;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::info;

use crate::archive::Record;
use crate::error::{Error, Result};
use crate::timing::Timer;

pub use context::BuildContext;
pub use package::{resolve_packages, Command};

/// Compiled output of a builder run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// One binary serving every command, selected by invocation name.
    Multiplexed {
        path: PathBuf,
        /// Command name to the entry point the dispatcher calls.
        dispatch_table: BTreeMap<String, String>,
    },
    /// One binary for one command.
    Binary { name: String, path: PathBuf },
}

/// Result of [`Builder::build`].
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub builder: Builder,
    pub artifacts: Vec<Artifact>,
    /// `(link name, target)` pairs, both relative to the install directory.
    pub symlink_hints: Vec<(String, String)>,
    /// Write the hints as `#!` scripts rather than symlinks.
    pub shellbang: bool,
}

impl BuildOutput {
    /// Names of the commands this build provides.
    pub fn commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .artifacts
            .iter()
            .flat_map(|artifact| match artifact {
                Artifact::Multiplexed { dispatch_table, .. } => {
                    dispatch_table.keys().cloned().collect::<Vec<_>>()
                }
                Artifact::Binary { name, .. } => vec![name.clone()],
            })
            .collect();
        names.sort();
        names
    }

    /// Archive records for the artifacts and their links.
    pub fn records(&self) -> Vec<Record> {
        let dir = self.builder.install_dir();
        let mut records: Vec<Record> = self
            .artifacts
            .iter()
            .map(|artifact| match artifact {
                Artifact::Multiplexed { path, .. } => {
                    Record::host_file(&format!("{}/{}", dir, multiplex::DISPATCHER), path, 0o755)
                }
                Artifact::Binary { name, path } => {
                    Record::host_file(&format!("{}/{}", dir, name), path, 0o755)
                }
            })
            .collect();
        records.extend(self.symlink_hints.iter().map(|(name, target)| {
            let path = format!("{}/{}", dir, name);
            if self.shellbang {
                Record::file(&path, format!("#!/{}/{}\n", dir, target), 0o755)
            } else {
                Record::symlink(&path, target)
            }
        }));
        records
    }
}

/// Strategy for turning packages into binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builder {
    Multiplexed,
    PerCommand,
}

impl Builder {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "bb" => Ok(Builder::Multiplexed),
            "binary" => Ok(Builder::PerCommand),
            "source" => Err(Error::config(
                "the source builder is no longer supported; use bb or binary",
            )),
            other => Err(Error::config(format!(
                "unknown builder {:?} (expected bb or binary)",
                other
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Builder::Multiplexed => "bb",
            Builder::PerCommand => "binary",
        }
    }

    /// Archive directory the builder installs into.
    pub fn install_dir(self) -> &'static str {
        match self {
            Builder::Multiplexed => "bbin",
            Builder::PerCommand => "bin",
        }
    }

    /// Reject command lists this strategy cannot build.
    ///
    /// Runs before any compiler is started.
    pub fn check(self, commands: &[Command]) -> Result<()> {
        if commands.is_empty() {
            return Err(Error::config(format!("no packages given to the {} builder", self)));
        }
        let mut names = HashSet::new();
        for cmd in commands {
            if !names.insert(cmd.name.as_str()) {
                return Err(Error::config(format!(
                    "command name {:?} is provided by more than one package",
                    cmd.name
                )));
            }
        }
        if self == Builder::Multiplexed {
            multiplex::check_idents(commands)?;
        }
        Ok(())
    }

    /// Compile `commands` into artifacts under `ctx.workspace`.
    pub async fn build(self, commands: &[Command], ctx: &BuildContext) -> Result<BuildOutput> {
        self.check(commands)?;

        let timer = Timer::start(&format!("{} build of {} command(s)", self, commands.len()));
        let artifacts = match self {
            Builder::Multiplexed => multiplex::build(commands, ctx).await?,
            Builder::PerCommand => binary::build(commands, ctx).await?,
        };
        timer.finish();

        let symlink_hints = match self {
            Builder::Multiplexed => commands
                .iter()
                .map(|cmd| (cmd.name.clone(), multiplex::DISPATCHER.to_string()))
                .collect(),
            Builder::PerCommand => Vec::new(),
        };
        info!("{} builder produced {} artifact(s)", self, artifacts.len());

        Ok(BuildOutput {
            builder: self,
            artifacts,
            symlink_hints,
            shellbang: ctx.shellbang && self == Builder::Multiplexed,
        })
    }
}

impl FromStr for Builder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Builder::from_name(s)
    }
}

impl fmt::Display for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
