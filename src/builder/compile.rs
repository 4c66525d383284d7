//! Concurrent toolchain invocations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::context::BuildContext;
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::process::Cmd;

/// Separator cargo expects between entries of `CARGO_ENCODED_RUSTFLAGS`.
const FLAG_SEPARATOR: &str = "\x1f";

/// One `cargo build` of one binary target.
#[derive(Debug, Clone)]
pub(crate) struct CompileJob {
    /// Name reported when the job fails.
    pub package: String,
    pub manifest: PathBuf,
    pub target_dir: PathBuf,
    pub bin: String,
}

impl CompileJob {
    fn output_path(&self, env: &Environment) -> PathBuf {
        self.target_dir
            .join(&env.target)
            .join("release")
            .join(&self.bin)
    }
}

/// Compiler flags for the target environment.
pub(crate) fn rustflags(env: &Environment, strip: bool) -> Vec<String> {
    let mut flags = Vec::new();
    for tag in &env.build_tags {
        flags.push("--cfg".to_string());
        flags.push(tag.clone());
    }
    if !env.native_linkage {
        flags.push("-C".to_string());
        flags.push("target-feature=+crt-static".to_string());
    }
    if strip {
        flags.push("-C".to_string());
        flags.push("strip=symbols".to_string());
    }
    flags
}

/// Run every job, at most `ctx.jobs` at a time.
///
/// Returns the produced binaries in job order. The first failure aborts
/// the jobs still running (their compilers are killed) and is returned.
pub(crate) async fn compile_all(ctx: &BuildContext, jobs: Vec<CompileJob>) -> Result<Vec<PathBuf>> {
    let flags = rustflags(&ctx.env, ctx.strip).join(FLAG_SEPARATOR);
    let permits = Arc::new(Semaphore::new(ctx.jobs.max(1)));
    let mut set = JoinSet::new();

    info!("Compiling {} package(s) with {} job(s)", jobs.len(), ctx.jobs);
    for (index, job) in jobs.iter().cloned().enumerate() {
        let permits = Arc::clone(&permits);
        let env = ctx.env.clone();
        let flags = flags.clone();
        set.spawn(async move {
            let _permit = permits.acquire_owned().await;
            (index, compile_one(&env, &flags, &job).await)
        });
    }

    let mut outputs: Vec<Option<PathBuf>> = vec![None; jobs.len()];
    while let Some(joined) = set.join_next().await {
        let result = match joined {
            Ok((index, result)) => result.map(|path| (index, path)),
            Err(e) => Err(Error::Compile {
                package: "build task".to_string(),
                cause: e.to_string(),
            }),
        };
        match result {
            Ok((index, path)) => outputs[index] = Some(path),
            Err(e) => {
                set.shutdown().await;
                return Err(e);
            }
        }
    }

    outputs
        .into_iter()
        .zip(&jobs)
        .map(|(path, job)| {
            path.ok_or_else(|| Error::Compile {
                package: job.package.clone(),
                cause: "compile did not complete".to_string(),
            })
        })
        .collect()
}

async fn compile_one(env: &Environment, flags: &str, job: &CompileJob) -> Result<PathBuf> {
    debug!("cargo build {} ({})", job.bin, job.manifest.display());
    // Run from the package so its own `.cargo/config.toml` applies.
    let package_dir = job.manifest.parent().unwrap_or(Path::new("/"));
    Cmd::new(&env.cargo)
        .dir(package_dir)
        .args(["build", "--release", "--manifest-path"])
        .arg_path(&job.manifest)
        .arg("--target-dir")
        .arg_path(&job.target_dir)
        .arg("--target")
        .arg(&env.target)
        .arg("--bin")
        .arg(&job.bin)
        .env("CARGO_ENCODED_RUSTFLAGS", flags)
        .error_msg(format!("cargo build of {} failed", job.package))
        .run_async()
        .await
        .map_err(|e| Error::Compile {
            package: job.package.clone(),
            cause: e.to_string(),
        })?;

    let output = job.output_path(env);
    if !output.is_file() {
        return Err(Error::Compile {
            package: job.package.clone(),
            cause: format!("toolchain reported success but {} is missing", output.display()),
        });
    }
    Ok(output)
}
