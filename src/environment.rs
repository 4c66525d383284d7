//! Target platform description handed to the builders.

use std::fmt;
use std::path::PathBuf;

use tracing::warn;

use crate::error::{Error, Result};

/// Architectures with a known target triple mapping.
const KNOWN_ARCHES: &[&str] = &[
    "x86_64",
    "x86",
    "aarch64",
    "arm",
    "riscv64",
    "powerpc64",
    "s390x",
    "mips",
    "mips64",
    "loongarch64",
];

/// Immutable description of what the toolchain should target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub target_os: String,
    pub target_arch: String,
    /// Full target triple passed to the toolchain (`--target`).
    pub target: String,
    /// Names passed to the compiler as `--cfg <tag>`.
    pub build_tags: Vec<String>,
    /// Allow dynamically linking against the target C library.
    pub native_linkage: bool,
    /// Toolchain driver program.
    pub cargo: PathBuf,
}

impl Environment {
    /// Environment targeting the host OS and architecture.
    pub fn host() -> Self {
        let os = std::env::consts::OS;
        let arch = std::env::consts::ARCH;
        Self {
            target_os: os.to_string(),
            target_arch: arch.to_string(),
            target: default_triple(arch, os),
            build_tags: Vec::new(),
            native_linkage: false,
            cargo: PathBuf::from("cargo"),
        }
    }

    /// Derive OS and architecture from a target triple.
    pub fn for_target(triple: &str) -> Self {
        let mut parts = triple.split('-');
        let arch = parts.next().unwrap_or_default();
        let os = triple
            .split('-')
            .find(|p| matches!(*p, "linux" | "windows" | "darwin" | "freebsd" | "netbsd" | "openbsd" | "none"))
            .unwrap_or_default();
        Self {
            target_os: if os == "darwin" { "macos".to_string() } else { os.to_string() },
            target_arch: normalize_arch(arch).to_string(),
            target: triple.to_string(),
            ..Self::host()
        }
    }

    /// Check that the platform description is usable.
    ///
    /// A non-Linux OS is only warned about, since the archive is still valid.
    pub fn validate(&self) -> Result<()> {
        if self.target_os.is_empty() || self.target_arch.is_empty() {
            return Err(Error::Environment(format!(
                "target OS and architecture must be set (have os={:?}, arch={:?})",
                self.target_os, self.target_arch
            )));
        }
        if !KNOWN_ARCHES.contains(&self.target_arch.as_str()) {
            return Err(Error::Environment(format!(
                "unsupported target architecture {:?}",
                self.target_arch
            )));
        }
        let triple_arch = self.target.split('-').next().unwrap_or_default();
        if normalize_arch(triple_arch) != self.target_arch {
            return Err(Error::Environment(format!(
                "target triple {:?} does not match architecture {:?}",
                self.target, self.target_arch
            )));
        }
        if self.target_os != "linux" {
            warn!(
                "Target OS is {:?}, not linux. Did you mean to pass --target <arch>-unknown-linux-gnu?",
                self.target_os
            );
        }
        for tag in &self.build_tags {
            if !is_cfg_name(tag) {
                return Err(Error::Environment(format!(
                    "build tag {:?} is not a valid cfg name",
                    tag
                )));
            }
        }
        if self.cargo.as_os_str().is_empty() {
            return Err(Error::Environment("toolchain driver path is empty".into()));
        }
        Ok(())
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "target={} os={} arch={} tags=[{}] native_linkage={} cargo={}",
            self.target,
            self.target_os,
            self.target_arch,
            self.build_tags.join(","),
            self.native_linkage,
            self.cargo.display()
        )
    }
}

/// Default GNU triple for an architecture/OS pair.
pub fn default_triple(arch: &str, os: &str) -> String {
    let arch = match arch {
        "x86" => "i686",
        "arm" => "armv7",
        "powerpc64" => "powerpc64le",
        other => other,
    };
    let suffix = if arch == "armv7" { "gnueabihf" } else { "gnu" };
    format!("{}-unknown-{}-{}", arch, os, suffix)
}

/// Map triple architecture spellings to `std::env::consts::ARCH` names.
fn normalize_arch(arch: &str) -> &str {
    match arch {
        "i386" | "i586" | "i686" => "x86",
        "powerpc64le" => "powerpc64",
        "mipsel" => "mips",
        "mips64el" => "mips64",
        a if a.starts_with("arm") || a.starts_with("thumb") => "arm",
        a if a.starts_with("riscv64") => "riscv64",
        other => other,
    }
}

fn is_cfg_name(tag: &str) -> bool {
    let mut chars = tag.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
