//! Shared test utilities for ramforge tests.

#![allow(dead_code)]

use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use ramforge::archive::{Format, Record};
use ramforge::builder::Builder;
use ramforge::{BuildOpts, CommandGroup, Environment};
use tempfile::TempDir;

/// Stand-in for cargo: records each invocation and writes a shell script
/// where cargo would put the binary. A `FAIL` file in the package makes it
/// fail, a `SLOW` file makes it hang.
const FAKE_CARGO: &str = r#"#!/bin/sh
manifest=""
target_dir=""
triple=""
bin=""
while [ $# -gt 0 ]; do
    case "$1" in
        --manifest-path) manifest="$2"; shift ;;
        --target-dir) target_dir="$2"; shift ;;
        --target) triple="$2"; shift ;;
        --bin) bin="$2"; shift ;;
    esac
    shift
done
pkg=$(dirname "$manifest")
echo "$bin" >> "@LOG@"
if [ -f "$pkg/FAIL" ]; then
    echo "error: could not compile \`$bin\`" >&2
    exit 101
fi
if [ -f "$pkg/SLOW" ]; then
    exec sleep 30
fi
out="$target_dir/$triple/release"
mkdir -p "$out"
printf '#!/bin/sh\necho %s\n' "$bin" > "$out/$bin"
chmod 755 "$out/$bin"
"#;

/// Temporary tree holding packages, a fake toolchain and the output.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    pub root: PathBuf,
    /// Parent of the generated packages
    pub packages: PathBuf,
    /// Fake toolchain driver
    pub cargo: PathBuf,
    /// One line per toolchain invocation
    pub log: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path().to_path_buf();
        let packages = root.join("packages");
        fs::create_dir_all(&packages).expect("Failed to create packages dir");

        let log = root.join("cargo.log");
        let cargo = root.join("fake-cargo");
        fs::write(&cargo, FAKE_CARGO.replace("@LOG@", &log.to_string_lossy()))
            .expect("Failed to write fake cargo");
        fs::set_permissions(&cargo, fs::Permissions::from_mode(0o755))
            .expect("Failed to chmod fake cargo");

        Self {
            _temp_dir: temp_dir,
            root,
            packages,
            cargo,
            log,
        }
    }

    /// Create a command package under `packages/<rel>`.
    pub fn package(&self, rel: &str) -> PathBuf {
        let dir = self.packages.join(rel);
        let name = dir.file_name().unwrap().to_string_lossy().into_owned();
        fs::create_dir_all(dir.join("src")).expect("Failed to create package");
        fs::write(
            dir.join("Cargo.toml"),
            format!("[package]\nname = \"{}\"\nversion = \"0.1.0\"\nedition = \"2021\"\n", name),
        )
        .expect("Failed to write manifest");
        fs::write(
            dir.join("src/main.rs"),
            format!("fn main() {{\n    println!(\"{}\");\n}}\n", name),
        )
        .expect("Failed to write main.rs");
        dir
    }

    /// Host environment driven by the fake toolchain.
    pub fn env(&self) -> Environment {
        let mut env = Environment::host();
        env.cargo = self.cargo.clone();
        env
    }

    /// Options building `packages` with `builder` into `root/out.cpio`.
    pub fn opts(&self, builder: Builder, packages: &[&Path]) -> BuildOpts {
        let mut opts = BuildOpts::new(self.env());
        opts.output = self.root.join("out.cpio");
        opts.init_cmd = String::new();
        if !packages.is_empty() {
            opts.commands = vec![CommandGroup {
                builder,
                packages: packages
                    .iter()
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect(),
            }];
        }
        opts
    }

    /// Toolchain invocations so far, in order.
    pub fn compile_log(&self) -> Vec<String> {
        fs::read_to_string(&self.log)
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// Read every record of a cpio or cpio.gz file.
pub fn read_archive(path: &Path) -> Vec<Record> {
    let format = if path.to_string_lossy().ends_with(".gz") {
        Format::CpioGz
    } else {
        Format::Cpio
    };
    let file = File::open(path).expect("Failed to open archive");
    format
        .reader(file)
        .collect::<Result<_, _>>()
        .expect("Failed to read archive")
}

/// Find a record by path.
pub fn find<'a>(records: &'a [Record], path: &str) -> Option<&'a Record> {
    records.iter().find(|r| r.path == path)
}

/// Write `records` as an uncompressed cpio archive.
pub fn write_archive(path: &Path, records: &[Record]) {
    let file = File::create(path).expect("Failed to create archive");
    let mut writer = Format::Cpio.open_writer(file);
    for record in records {
        writer.write_record(record).expect("Failed to write record");
    }
    writer.finish().expect("Failed to finish archive");
}
