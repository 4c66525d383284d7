//! One binary per command.

use super::compile::{compile_all, CompileJob};
use super::context::BuildContext;
use super::package::Command;
use super::Artifact;
use crate::error::Result;

/// Compile each command with its own target directory.
pub(crate) async fn build(commands: &[Command], ctx: &BuildContext) -> Result<Vec<Artifact>> {
    let target_root = ctx.workspace.join("target");
    let jobs: Vec<CompileJob> = commands
        .iter()
        .map(|cmd| CompileJob {
            package: cmd.name.clone(),
            manifest: cmd.manifest_path(),
            target_dir: target_root.join(&cmd.name),
            bin: cmd.bin_name.clone(),
        })
        .collect();

    let outputs = compile_all(ctx, jobs).await?;
    Ok(commands
        .iter()
        .zip(outputs)
        .map(|(cmd, path)| Artifact::Binary {
            name: cmd.name.clone(),
            path,
        })
        .collect())
}
