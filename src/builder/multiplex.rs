//! Busybox-style builds: every command linked into one dispatcher binary.
//!
//! Layout inside the workspace:
//!
//! ```text
//! bb/
//!   Cargo.toml        generated dispatcher package
//!   src/main.rs       dispatch table + argv[0] lookup
//!   cmds/<name>/      copy of each command, turned into a library
//! ```
//!
//! Each command's `main` is renamed to `bb_main_<ident>` and wrapped by a
//! generated `bb_entry_<ident>() -> ExitCode`, which the dispatcher calls
//! when invoked under the command's name.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use regex::Regex;
use tracing::{info, warn};
use walkdir::WalkDir;

use super::compile::{compile_all, CompileJob};
use super::context::BuildContext;
use super::package::Command;
use super::Artifact;
use crate::error::{Error, Result};

/// Name of the dispatcher binary and of its generic alias.
pub const DISPATCHER: &str = "bb";

const MAIN_FN: &str = r"(?m)^(?:pub(?:\s*\([^)]*\))?\s+)?(async\s+)?fn\s+main\s*\(";
const STATIC_MUT: &str = r"\bstatic\s+mut\b";
const DEPENDENCY_TABLES: &[&str] = &["dependencies", "dev-dependencies", "build-dependencies"];

const DISPATCHER_MANIFEST: &str = r#"[package]
name = "bb"
version = "0.1.0"
edition = "2021"
publish = false

[workspace]

[dependencies]
{{DEPENDENCIES}}
"#;

const DISPATCHER_MAIN: &str = r##"// Generated by ramforge. Do not edit.

use std::ffi::OsStr;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

type Entry = fn() -> ExitCode;

const DISPATCHER: &str = "bb";
const MAX_LINKS: usize = 40;

/// Sorted by name.
const COMMANDS: &[(&str, Entry)] = &[
{{COMMANDS}}
];

fn lookup(name: &str) -> Option<Entry> {
    COMMANDS
        .binary_search_by(|(n, _)| (*n).cmp(name))
        .ok()
        .map(|i| COMMANDS[i].1)
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Path of an invocation name, searching PATH for bare names.
fn locate(arg: &OsStr) -> PathBuf {
    let path = PathBuf::from(arg);
    if path.components().count() > 1 {
        return path;
    }
    std::env::var_os("PATH")
        .and_then(|dirs| {
            std::env::split_paths(&dirs)
                .map(|dir| dir.join(&path))
                .find(|candidate| candidate.symlink_metadata().is_ok())
        })
        .unwrap_or(path)
}

/// Command an invocation name stands for.
///
/// Links such as `/bin/sh -> ../bbin/elvish -> bb` are followed up to the
/// last one before the dispatcher, whose name selects the command.
fn command_name(arg: &OsStr) -> String {
    let mut path = locate(arg);
    for _ in 0..MAX_LINKS {
        let Ok(target) = std::fs::read_link(&path) else {
            break;
        };
        if basename(&target) == DISPATCHER {
            break;
        }
        path = match path.parent() {
            Some(dir) => dir.join(target),
            None => target,
        };
    }
    basename(&path)
}

fn usage() -> ExitCode {
    eprintln!("usage: bb <command> [args...]");
    eprintln!("commands:");
    for (name, _) in COMMANDS {
        eprintln!("  {}", name);
    }
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    let mut args = std::env::args_os();
    let name = args.next().map(|a| command_name(&a)).unwrap_or_default();

    if let Some(entry) = lookup(&name) {
        return entry();
    }
    if name != DISPATCHER {
        eprintln!("bb: unknown command {:?}", name);
        return ExitCode::FAILURE;
    }

    // Invoked as `bb <cmd> args...` or through a `#!/bbin/bb` script:
    // run again with argv[0] naming the command.
    let Some(cmd) = args.next() else {
        return usage();
    };
    let name = if Path::new(&cmd).components().count() > 1 {
        command_name(&cmd)
    } else {
        cmd.to_string_lossy().into_owned()
    };
    if lookup(&name).is_none() {
        eprintln!("bb: unknown command {:?}", cmd);
        return usage();
    }
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            eprintln!("bb: cannot locate own executable: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let arg0 = match exe.parent() {
        Some(dir) => dir.join(&name),
        None => PathBuf::from(&name),
    };
    let err = std::process::Command::new(&exe).arg0(&arg0).args(args).exec();
    eprintln!("bb: exec {:?}: {}", cmd, err);
    ExitCode::FAILURE
}
"##;

/// Rust identifier fragment for a command name.
pub fn command_ident(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// Reject command sets that cannot share one dispatcher.
pub(crate) fn check_idents(commands: &[Command]) -> Result<()> {
    let mut idents: HashMap<String, &str> = HashMap::new();
    for cmd in commands {
        if cmd.name == DISPATCHER {
            return Err(Error::config(format!(
                "command name {:?} is reserved for the dispatcher in bb mode",
                DISPATCHER
            )));
        }
        if cmd.has_lib {
            return Err(Error::config(format!(
                "{} also defines a library target and cannot be linked into bb; use the binary builder",
                cmd.name
            )));
        }
        if let Some(other) = idents.insert(command_ident(&cmd.name), &cmd.name) {
            return Err(Error::config(format!(
                "commands {:?} and {:?} map to the same identifier in bb mode",
                other, cmd.name
            )));
        }
    }
    Ok(())
}

pub(crate) async fn build(commands: &[Command], ctx: &BuildContext) -> Result<Vec<Artifact>> {
    let root = ctx.workspace.join(DISPATCHER);
    let dispatch_table = generate(commands, &root)?;

    let job = CompileJob {
        package: DISPATCHER.to_string(),
        manifest: root.join("Cargo.toml"),
        target_dir: root.join("target"),
        bin: DISPATCHER.to_string(),
    };
    let path = compile_all(ctx, vec![job])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Compile {
            package: DISPATCHER.to_string(),
            cause: "no binary produced".to_string(),
        })?;

    Ok(vec![Artifact::Multiplexed {
        path,
        dispatch_table,
    }])
}

/// Write the dispatcher package and return its dispatch table.
pub(crate) fn generate(commands: &[Command], root: &Path) -> Result<BTreeMap<String, String>> {
    let main_fn = Regex::new(MAIN_FN).map_err(|e| Error::config(e.to_string()))?;
    let static_mut = Regex::new(STATIC_MUT).map_err(|e| Error::config(e.to_string()))?;

    let mut table = BTreeMap::new();
    let mut dependencies = Vec::new();

    for cmd in commands {
        let ident = command_ident(&cmd.name);
        let crate_name = format!("bbcmd_{}", ident);
        let dest = root.join("cmds").join(&cmd.name);

        copy_package(&cmd.dir, &dest)?;
        rewrite_manifest(cmd, &dest, &crate_name)?;
        rewrite_entry(cmd, &dest.join(&cmd.entry_file), &ident, &main_fn)?;
        warn_static_mut(cmd, &dest, &static_mut);

        dependencies.push(format!(
            "{} = {{ path = {:?} }}",
            crate_name,
            format!("cmds/{}", cmd.name)
        ));
        table.insert(cmd.name.clone(), format!("{}::bb_entry_{}", crate_name, ident));
    }

    let entries: Vec<String> = table
        .iter()
        .map(|(name, entry)| format!("    ({:?}, {}),", name, entry))
        .collect();

    write(
        &root.join("Cargo.toml"),
        &DISPATCHER_MANIFEST.replace("{{DEPENDENCIES}}", &dependencies.join("\n")),
    )?;
    write(
        &root.join("src/main.rs"),
        &DISPATCHER_MAIN.replace("{{COMMANDS}}", &entries.join("\n")),
    )?;

    info!("Generated dispatcher for {} command(s)", table.len());
    Ok(table)
}

fn copy_package(src: &Path, dest: &Path) -> Result<()> {
    let walker = WalkDir::new(src)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !matches!(e.file_name().to_str(), Some("target" | ".git")));

    for entry in walker {
        let entry = entry.map_err(|e| Error::config(format!("cannot read {}: {}", src.display(), e)))?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| Error::io(&target, e))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| Error::io(entry.path(), e))?;
        }
    }
    Ok(())
}

/// Turn the command's binary package into a library named `crate_name`.
fn rewrite_manifest(cmd: &Command, dest: &Path, crate_name: &str) -> Result<()> {
    let path = dest.join("Cargo.toml");
    let text = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
    let mut manifest: toml::Table = text
        .parse()
        .map_err(|e| Error::config(format!("invalid manifest {}: {}", path.display(), e)))?;

    for key in ["bin", "lib", "workspace", "profile"] {
        manifest.remove(key);
    }
    if let Some(toml::Value::Table(package)) = manifest.get_mut("package") {
        package.insert("name".into(), crate_name.into());
        package.insert("autobins".into(), false.into());
        package.remove("default-run");
    }

    let mut lib = toml::Table::new();
    lib.insert("name".into(), crate_name.into());
    lib.insert(
        "path".into(),
        cmd.entry_file.to_string_lossy().into_owned().into(),
    );
    manifest.insert("lib".into(), lib.into());

    absolutize_paths(&mut manifest, &cmd.dir);
    if let Some(toml::Value::Table(targets)) = manifest.get_mut("target") {
        for (_, cfg) in targets.iter_mut() {
            if let toml::Value::Table(cfg) = cfg {
                absolutize_paths(cfg, &cmd.dir);
            }
        }
    }

    let text = toml::to_string(&manifest)
        .map_err(|e| Error::config(format!("cannot serialize {}: {}", path.display(), e)))?;
    write(&path, &text)
}

/// Make `path = "..."` dependencies independent of the package location.
fn absolutize_paths(table: &mut toml::Table, base: &Path) {
    for section in DEPENDENCY_TABLES {
        let Some(toml::Value::Table(deps)) = table.get_mut(*section) else {
            continue;
        };
        for (_, dep) in deps.iter_mut() {
            let toml::Value::Table(dep) = dep else {
                continue;
            };
            if let Some(toml::Value::String(path)) = dep.get_mut("path") {
                if Path::new(path.as_str()).is_relative() {
                    *path = base.join(path.as_str()).to_string_lossy().into_owned();
                }
            }
        }
    }
}

/// Rename `main` and append the exported entry point.
fn rewrite_entry(cmd: &Command, entry: &Path, ident: &str, main_fn: &Regex) -> Result<()> {
    let source = fs::read_to_string(entry).map_err(|e| Error::io(entry, e))?;
    if !main_fn.is_match(&source) {
        return Err(Error::config(format!(
            "{}: no `fn main` found in {}",
            cmd.name,
            cmd.entry_file.display()
        )));
    }

    let renamed = main_fn.replace(&source, format!("pub ${{1}}fn bb_main_{}(", ident).as_str());
    let rewritten = format!(
        "{}\n\n#[doc(hidden)]\npub fn bb_entry_{ident}() -> ::std::process::ExitCode {{\n    \
         ::std::process::Termination::report(bb_main_{ident}())\n}}\n",
        renamed,
        ident = ident
    );
    write(entry, &rewritten)
}

fn warn_static_mut(cmd: &Command, dir: &Path, static_mut: &Regex) {
    let sources = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"));

    for file in sources {
        if let Ok(text) = fs::read_to_string(file.path()) {
            if static_mut.is_match(&text) {
                warn!(
                    "{}: {} declares `static mut`; state is shared by every command in bb",
                    cmd.name,
                    file.path().strip_prefix(dir).unwrap_or(file.path()).display()
                );
            }
        }
    }
}

fn write(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    fs::write(path, contents).map_err(|e| Error::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(root: &Path, name: &str, main: &str) -> Command {
        let dir = root.join(name);
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::write(
            dir.join("Cargo.toml"),
            format!(
                "[package]\nname = \"{name}\"\nversion = \"0.1.0\"\nedition = \"2021\"\n\n\
                 [dependencies]\nshared = {{ path = \"../shared\" }}\n\n[profile.release]\nlto = true\n"
            ),
        )
        .unwrap();
        fs::write(dir.join("src/main.rs"), main).unwrap();
        fs::create_dir_all(dir.join("target/release")).unwrap();
        fs::write(dir.join("target/release/junk"), "x").unwrap();
        Command::resolve(&dir).unwrap()
    }

    #[test]
    fn test_command_ident() {
        assert_eq!(command_ident("ls"), "ls");
        assert_eq!(command_ident("run-parts"), "run_parts");
        assert_eq!(command_ident("Foo.Bar"), "foo_bar");
    }

    #[test]
    fn test_generate_dispatcher() {
        let src = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        let cmds = vec![
            command(src.path(), "true", "fn main() {}\n"),
            command(
                src.path(),
                "echo",
                "use std::process::ExitCode;\n\nfn main() -> ExitCode {\n    ExitCode::SUCCESS\n}\n",
            ),
        ];

        let root = ws.path().join("bb");
        let table = generate(&cmds, &root).unwrap();
        assert_eq!(
            table.keys().collect::<Vec<_>>(),
            vec!["echo", "true"]
        );
        assert_eq!(table["echo"], "bbcmd_echo::bb_entry_echo");

        let main = fs::read_to_string(root.join("src/main.rs")).unwrap();
        let echo = main.find("(\"echo\", bbcmd_echo::bb_entry_echo)").unwrap();
        let truth = main.find("(\"true\", bbcmd_true::bb_entry_true)").unwrap();
        assert!(echo < truth);

        let manifest = fs::read_to_string(root.join("Cargo.toml")).unwrap();
        assert!(manifest.contains("bbcmd_echo = { path = \"cmds/echo\" }"));

        let entry = fs::read_to_string(root.join("cmds/echo/src/main.rs")).unwrap();
        assert!(entry.contains("pub fn bb_main_echo() -> ExitCode"));
        assert!(entry.contains("pub fn bb_entry_echo() -> ::std::process::ExitCode"));
        assert!(!entry.contains("fn main("));

        assert!(!root.join("cmds/echo/target").exists());
    }

    #[test]
    fn test_manifest_rewrite() {
        let src = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        let cmd = command(src.path(), "cat", "fn main() {}\n");
        let mut manifest = fs::read_to_string(cmd.manifest_path()).unwrap();
        manifest.push_str("\n[target.'cfg(unix)'.dependencies]\nunixy = { path = \"../unixy\" }\n");
        fs::write(cmd.manifest_path(), manifest).unwrap();
        generate(std::slice::from_ref(&cmd), ws.path()).unwrap();

        let text = fs::read_to_string(ws.path().join("cmds/cat/Cargo.toml")).unwrap();
        let manifest: toml::Table = text.parse().unwrap();
        assert_eq!(manifest["package"]["name"].as_str(), Some("bbcmd_cat"));
        assert_eq!(manifest["lib"]["path"].as_str(), Some("src/main.rs"));
        assert!(manifest.get("profile").is_none());

        let dep = manifest["dependencies"]["shared"]["path"].as_str().unwrap();
        assert!(Path::new(dep).is_absolute());
        assert!(dep.ends_with("shared"));

        let unixy = manifest["target"]["cfg(unix)"]["dependencies"]["unixy"]["path"]
            .as_str()
            .unwrap();
        assert_eq!(Path::new(unixy), cmd.dir.join("../unixy"));
    }

    #[test]
    fn test_dispatcher_follows_alias_links() {
        let src = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        let cmd = command(src.path(), "hello", "fn main() {}\n");
        generate(&[cmd], ws.path()).unwrap();

        let main = fs::read_to_string(ws.path().join("src/main.rs")).unwrap();
        assert!(main.contains("fn command_name(arg: &OsStr) -> String"));
        assert!(main.contains("std::fs::read_link(&path)"));
        assert!(main.contains("let name = args.next().map(|a| command_name(&a))"));
    }

    #[test]
    fn test_async_and_pub_main() {
        let src = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        let cmd = command(
            src.path(),
            "sleep",
            "#[tokio::main]\npub async fn main() -> std::io::Result<()> {\n    Ok(())\n}\n",
        );
        generate(std::slice::from_ref(&cmd), ws.path()).unwrap();

        let entry = fs::read_to_string(ws.path().join("cmds/sleep/src/main.rs")).unwrap();
        assert!(entry.contains("#[tokio::main]\npub async fn bb_main_sleep()"));
    }

    #[test]
    fn test_missing_main() {
        let src = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        let cmd = command(src.path(), "odd", "fn start() {}\n");
        let err = generate(&[cmd], ws.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_ident_collision() {
        let src = tempfile::tempdir().unwrap();
        let a = command(src.path(), "run-parts", "fn main() {}\n");
        let b = command(src.path(), "run_parts", "fn main() {}\n");
        assert!(matches!(check_idents(&[a, b]), Err(Error::Config(_))));
    }

    #[test]
    fn test_reserved_name() {
        let src = tempfile::tempdir().unwrap();
        let cmd = command(src.path(), "bb", "fn main() {}\n");
        assert!(matches!(check_idents(&[cmd]), Err(Error::Config(_))));
    }
}
