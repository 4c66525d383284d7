//! Build context shared by both builder strategies.

use std::path::{Path, PathBuf};
use std::thread;

use crate::environment::Environment;

/// Everything a builder needs besides its package list.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Scratch directory owned by the current run.
    pub workspace: PathBuf,
    /// Target platform and toolchain.
    pub env: Environment,
    /// Strip symbols from produced binaries.
    pub strip: bool,
    /// Maximum number of concurrent compiler invocations.
    pub jobs: usize,
    /// Install `#!` scripts instead of symlinks for dispatcher entries.
    pub shellbang: bool,
}

impl BuildContext {
    /// Create a context that strips binaries and compiles with one job per CPU.
    pub fn new(workspace: &Path, env: Environment) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            env,
            strip: true,
            jobs: default_jobs(),
            shellbang: false,
        }
    }

    pub fn with_strip(mut self, strip: bool) -> Self {
        self.strip = strip;
        self
    }

    pub fn with_shellbang(mut self, shellbang: bool) -> Self {
        self.shellbang = shellbang;
        self
    }

    /// Set the compile concurrency. Zero means one job per CPU.
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = if jobs == 0 { default_jobs() } else { jobs };
        self
    }
}

fn default_jobs() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_jobs_means_default() {
        let ctx = BuildContext::new(Path::new("/tmp/ws"), Environment::host()).with_jobs(0);
        assert!(ctx.jobs >= 1);
        assert!(ctx.strip);
        assert!(!ctx.shellbang);

        let ctx = ctx.with_jobs(3).with_strip(false);
        assert_eq!(ctx.jobs, 3);
        assert!(!ctx.strip);
    }
}
