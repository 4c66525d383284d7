//! Build statistics persisted across runs.
//!
//! The stats file is a JSON array of [`BuildStats`], one entry per label,
//! sorted by label. Recording a build replaces the entry with the same
//! label.

use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::environment::Environment;
use crate::initramfs::ImageSummary;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStats {
    pub label: String,
    /// Unix timestamp of the build start.
    pub time: u64,
    /// Wall-clock seconds.
    pub duration: f64,
    pub output_size: u64,
}

impl BuildStats {
    pub fn from_summary(label: &str, summary: &ImageSummary) -> Self {
        Self {
            label: label.to_string(),
            time: summary
                .started
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            duration: summary.duration.as_secs_f64(),
            output_size: summary.output_size,
        }
    }
}

/// `<build>-<os>-<arch>-<cmd1_cmd2...>`, or `...-core` without commands.
pub fn default_label(build: &str, env: &Environment, commands: &[String]) -> String {
    let cmds = if commands.is_empty() {
        "core".to_string()
    } else {
        commands.join("_")
    };
    format!("{}-{}-{}-{}", build, env.target_os, env.target_arch, cmds)
}

/// Upsert `stats` into the file at `path`, creating it if needed.
pub fn record(path: &Path, stats: BuildStats) -> Result<()> {
    let mut all: Vec<BuildStats> = match fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse stats file {}", path.display()))?,
        Ok(_) => Vec::new(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };

    all.retain(|s| s.label != stats.label);
    all.push(stats);
    all.sort_by(|a, b| a.label.cmp(&b.label));

    let json = serde_json::to_string_pretty(&all)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json + "\n").with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}
