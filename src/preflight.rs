//! Host readiness checks run by `ramforge preflight`.
//!
//! Every check lands in one [`Section`] with an [`Outcome`]. A `Blocked`
//! outcome means `ramforge build` cannot succeed on this host.

use std::fmt;
use std::path::Path;

use tracing::debug;

use crate::config::Config;
use crate::environment::Environment;
use crate::process::Cmd;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Section {
    HostTools,
    Target,
    Workspace,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Section::HostTools => "Host tools",
            Section::Target => "Target",
            Section::Workspace => "Workspace",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ready,
    /// Usable, but some feature will not work.
    Degraded,
    Blocked,
    /// A prerequisite of the check itself is missing.
    NotChecked,
}

impl Outcome {
    fn tag(self) -> &'static str {
        match self {
            Outcome::Ready => "ok",
            Outcome::Degraded => "warn",
            Outcome::Blocked => "FAIL",
            Outcome::NotChecked => "skip",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Check {
    pub section: Section,
    pub name: String,
    pub outcome: Outcome,
    pub detail: String,
}

type Finding = (Outcome, String);

#[derive(Debug, Default)]
pub struct PreflightReport {
    checks: Vec<Check>,
}

impl PreflightReport {
    fn record(&mut self, section: Section, name: &str, (outcome, detail): Finding) {
        debug!("preflight {}: {} ({})", name, outcome.tag(), detail);
        self.checks.push(Check {
            section,
            name: name.to_string(),
            outcome,
            detail,
        });
    }

    pub fn checks(&self) -> &[Check] {
        &self.checks
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.checks.iter().filter(|c| c.outcome == outcome).count()
    }

    /// True when nothing blocks a build.
    pub fn is_ready(&self) -> bool {
        self.count(Outcome::Blocked) == 0
    }
}

impl fmt::Display for PreflightReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.checks.iter().map(|c| c.name.len()).max().unwrap_or(0);
        let mut current = None;
        for check in &self.checks {
            if current != Some(check.section) {
                if current.is_some() {
                    writeln!(f)?;
                }
                writeln!(f, "{}", check.section)?;
                current = Some(check.section);
            }
            writeln!(
                f,
                "  {:<4}  {:<width$}  {}",
                check.outcome.tag(),
                check.name,
                check.detail,
                width = width
            )?;
        }
        writeln!(f)?;
        write!(
            f,
            "{} ok, {} warnings, {} failed, {} skipped",
            self.count(Outcome::Ready),
            self.count(Outcome::Degraded),
            self.count(Outcome::Blocked),
            self.count(Outcome::NotChecked)
        )
    }
}

/// Check whether this host can build images for `env`.
pub fn run_preflight(config: &Config, env: &Environment) -> PreflightReport {
    let mut report = PreflightReport::default();
    let cargo = env.cargo.to_string_lossy();

    report.record(
        Section::HostTools,
        &cargo,
        find_tool(&cargo, Outcome::Blocked, "install a Rust toolchain (rustup)"),
    );
    report.record(
        Section::HostTools,
        "readelf",
        find_tool(
            "readelf",
            Outcome::Blocked,
            "install binutils; needed to find libraries of --files binaries",
        ),
    );
    report.record(
        Section::HostTools,
        "rustc",
        find_tool("rustc", Outcome::Degraded, "host target detection falls back to a guess"),
    );

    let env_finding = match env.validate() {
        Ok(()) => (Outcome::Ready, env.to_string()),
        Err(e) => (Outcome::Blocked, e.to_string()),
    };
    report.record(Section::Target, "environment", env_finding);
    report.record(Section::Target, "standard library", target_std(&env.target));

    let workspace = config.tmpdir.clone().unwrap_or_else(std::env::temp_dir);
    report.record(Section::Workspace, "scratch directory", writable(&workspace));
    report.record(Section::Workspace, "sysroot", sysroot(&config.sysroot));

    report
}

fn find_tool(tool: &str, when_missing: Outcome, hint: &str) -> Finding {
    match which::which(tool) {
        Ok(path) => (Outcome::Ready, path.display().to_string()),
        Err(_) => (when_missing, format!("not found; {}", hint)),
    }
}

fn target_std(target: &str) -> Finding {
    if which::which("rustup").is_err() {
        return (
            Outcome::NotChecked,
            "rustup not found; cannot list installed targets".to_string(),
        );
    }
    match Cmd::new("rustup").args(["target", "list", "--installed"]).run() {
        Ok(out) if out.stdout_trimmed().lines().any(|l| l.trim() == target) => {
            (Outcome::Ready, target.to_string())
        }
        Ok(_) => (
            Outcome::Blocked,
            format!("{} missing; run `rustup target add {}`", target, target),
        ),
        Err(e) => (Outcome::Degraded, e.to_string()),
    }
}

fn writable(dir: &Path) -> Finding {
    let attempt = std::fs::create_dir_all(dir).and_then(|_| tempfile::tempfile_in(dir));
    match attempt {
        Ok(_) => (Outcome::Ready, dir.display().to_string()),
        Err(e) => (Outcome::Blocked, format!("{}: {}", dir.display(), e)),
    }
}

fn sysroot(dir: &Path) -> Finding {
    if dir.is_dir() {
        (Outcome::Ready, dir.display().to_string())
    } else {
        (Outcome::Blocked, format!("{} is not a directory", dir.display()))
    }
}
