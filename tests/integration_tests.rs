//! End-to-end image builds against a fake toolchain.

mod helpers;

use std::fs;
use std::time::{Duration, Instant};

use helpers::{find, read_archive, write_archive, TestEnv};
use ramforge::archive::{Content, Format, Record, RecordKind};
use ramforge::builder::{resolve_packages, BuildContext, Builder};
use ramforge::{create_image, Error};

fn link(target: &str) -> Content {
    Content::Link(target.to_string())
}

#[test]
fn test_binary_build_installs_each_command() {
    let env = TestEnv::new();
    let ls = env.package("ls");
    let cat = env.package("cat");

    let mut opts = env.opts(Builder::PerCommand, &[&ls, &cat]);
    opts.init_cmd = "ls".into();
    let summary = create_image(&opts).unwrap();

    assert_eq!(summary.commands, vec!["cat", "ls"]);
    let records = read_archive(&opts.output);
    for name in ["ls", "cat"] {
        let record = find(&records, &format!("bin/{}", name)).unwrap();
        assert_eq!(record.kind, RecordKind::File);
        assert_eq!(record.perm, 0o755);
        assert_eq!(
            record.content,
            Content::Bytes(format!("#!/bin/sh\necho {}\n", name).into_bytes())
        );
    }
    assert_eq!(find(&records, "init").unwrap().content, link("bin/ls"));

    let mut log = env.compile_log();
    log.sort();
    assert_eq!(log, vec!["cat", "ls"]);
}

#[test]
fn test_bb_build_single_dispatcher() {
    let env = TestEnv::new();
    let ls = env.package("ls");
    let cat = env.package("cat");

    let mut opts = env.opts(Builder::Multiplexed, &[&ls, &cat]);
    opts.init_cmd = "cat".into();
    opts.default_shell = "ls".into();
    create_image(&opts).unwrap();

    let records = read_archive(&opts.output);
    assert_eq!(find(&records, "bbin/bb").unwrap().kind, RecordKind::File);
    assert_eq!(find(&records, "bbin/ls").unwrap().content, link("bb"));
    assert_eq!(find(&records, "bbin/cat").unwrap().content, link("bb"));
    assert_eq!(find(&records, "init").unwrap().content, link("bbin/cat"));
    assert_eq!(find(&records, "bin/sh").unwrap().content, link("../bbin/ls"));
    assert_eq!(find(&records, "bin/defaultsh").unwrap().content, link("../bbin/ls"));
    assert!(find(&records, "bin/ls").is_none());

    // One toolchain run for the whole dispatcher.
    assert_eq!(env.compile_log(), vec!["bb"]);
}

#[test]
fn test_bb_name_collision_fails_before_compiling() {
    let env = TestEnv::new();
    let first = env.package("a/ls");
    let second = env.package("b/ls");

    let opts = env.opts(Builder::Multiplexed, &[&first, &second]);
    let err = create_image(&opts).unwrap_err();

    assert!(matches!(err, Error::Config(ref msg) if msg.contains("ls")), "{}", err);
    assert!(env.compile_log().is_empty());
    assert!(!opts.output.exists());
}

#[test]
fn test_compile_failure_cancels_siblings() {
    let env = TestEnv::new();
    let mut packages = Vec::new();
    for i in 1..=5 {
        let dir = env.package(&format!("p{}", i));
        let marker = if i == 3 { "FAIL" } else { "SLOW" };
        fs::write(dir.join(marker), "").unwrap();
        packages.push(dir);
    }
    let refs: Vec<&std::path::Path> = packages.iter().map(|p| p.as_path()).collect();

    let mut opts = env.opts(Builder::PerCommand, &refs);
    opts.jobs = 5;
    let start = Instant::now();
    let err = create_image(&opts).unwrap_err();

    match err {
        Error::Compile { package, cause } => {
            assert_eq!(package, "p3");
            assert!(cause.contains("could not compile"), "{}", cause);
        }
        other => panic!("expected a compile error, got {}", other),
    }
    assert!(start.elapsed() < Duration::from_secs(20));
    assert!(!opts.output.exists());
    assert!(!env.root.join("out.cpio.tmp").exists());
}

#[test]
fn test_identical_inputs_identical_output() {
    let env = TestEnv::new();
    let ls = env.package("ls");
    let cat = env.package("cat");
    fs::write(env.root.join("motd"), "hello\n").unwrap();

    let mut opts = env.opts(Builder::PerCommand, &[&ls, &cat]);
    opts.extra_files = vec![format!("{}:etc/motd", env.root.join("motd").display())];
    opts.init_cmd = "ls".into();

    create_image(&opts).unwrap();
    let first = fs::read(&opts.output).unwrap();

    // Reverse the package order; the archive must not change.
    opts.commands[0].packages.reverse();
    create_image(&opts).unwrap();
    let second = fs::read(&opts.output).unwrap();

    assert_eq!(first, second);
}

#[test]
fn test_command_group_overrides_base() {
    let env = TestEnv::new();
    let foo = env.package("foo");
    let base = env.root.join("base.cpio");
    write_archive(
        &base,
        &[
            Record::directory("bin", 0o755),
            Record::file("bin/foo", "base foo", 0o755),
            Record::file("etc/keep", "kept", 0o644),
            Record::file("init", "#!/bin/sh\n", 0o755),
        ],
    );

    let mut opts = env.opts(Builder::PerCommand, &[&foo]);
    opts.base_archive = Some(base);
    opts.init_cmd = "foo".into();
    opts.use_existing_init = true;
    create_image(&opts).unwrap();

    let records = read_archive(&opts.output);
    assert_eq!(
        find(&records, "bin/foo").unwrap().content,
        Content::Bytes(b"#!/bin/sh\necho foo\n".to_vec())
    );
    assert_eq!(
        find(&records, "etc/keep").unwrap().content,
        Content::Bytes(b"kept".to_vec())
    );
    // Base init wins; generated link moves aside.
    assert_eq!(find(&records, "init").unwrap().kind, RecordKind::File);
    assert_eq!(find(&records, "inito").unwrap().content, link("bin/foo"));
    // Skeleton is not used when a base is given.
    assert!(find(&records, "dev/console").is_none());
}

#[test]
fn test_dev_null_base_is_empty() {
    let env = TestEnv::new();
    let motd = env.root.join("motd");
    fs::write(&motd, "hi").unwrap();

    let mut opts = env.opts(Builder::PerCommand, &[]);
    opts.base_archive = Some("/dev/null".into());
    opts.extra_files = vec![format!("{}:etc/motd", motd.display())];
    create_image(&opts).unwrap();

    let records = read_archive(&opts.output);
    let paths: Vec<&str> = records.iter().map(|r| r.path.as_str()).collect();
    // No skeleton: only the extra file and its synthesized parent.
    assert_eq!(paths, vec!["etc", "etc/motd"]);
}

#[test]
fn test_empty_targets_suppress_links() {
    let env = TestEnv::new();
    let opts = env.opts(Builder::PerCommand, &[]);
    create_image(&opts).unwrap();

    let records = read_archive(&opts.output);
    for path in ["init", "bin/uinit", "bin/sh", "bin/defaultsh", "etc/uinit.flags"] {
        assert!(find(&records, path).is_none(), "{} should be absent", path);
    }
}

#[test]
fn test_uinit_flags_written() {
    let env = TestEnv::new();
    let elvish = env.package("elvish");
    let mut opts = env.opts(Builder::Multiplexed, &[&elvish]);
    opts.uinit_cmd = "elvish".into();
    opts.uinit_args = vec!["-c".into(), "echo hi".into()];
    create_image(&opts).unwrap();

    let records = read_archive(&opts.output);
    assert_eq!(find(&records, "bin/uinit").unwrap().content, link("../bbin/elvish"));
    let flags = find(&records, "etc/uinit.flags").unwrap();
    assert_eq!(flags.perm, 0o444);
    assert_eq!(flags.content, Content::Bytes(b"\"-c\"\n\"echo hi\"".to_vec()));
}

#[test]
fn test_extra_files_and_directories() {
    let env = TestEnv::new();
    let tree = env.root.join("tree");
    fs::create_dir_all(tree.join("sub")).unwrap();
    fs::write(tree.join("a.txt"), "a").unwrap();
    fs::write(tree.join("sub/b.txt"), "b").unwrap();
    fs::write(env.root.join("motd"), "first").unwrap();
    fs::write(env.root.join("motd2"), "second").unwrap();

    let mut opts = env.opts(Builder::PerCommand, &[]);
    opts.extra_files = vec![
        format!("{}:usr/share/tree", tree.display()),
        String::new(),
        format!("{}:/etc/motd", env.root.join("motd").display()),
        format!("{}:/etc/motd", env.root.join("motd2").display()),
    ];
    create_image(&opts).unwrap();

    let records = read_archive(&opts.output);
    assert!(find(&records, "usr/share/tree").unwrap().is_dir());
    assert!(find(&records, "usr/share/tree/sub").unwrap().is_dir());
    assert_eq!(
        find(&records, "usr/share/tree/sub/b.txt").unwrap().content,
        Content::Bytes(b"b".to_vec())
    );
    // Later entries win.
    assert_eq!(
        find(&records, "etc/motd").unwrap().content,
        Content::Bytes(b"second".to_vec())
    );
    // Synthesized parent.
    assert!(find(&records, "usr/share").unwrap().is_dir());
}

#[test]
fn test_missing_extra_file_is_resolution_error() {
    let env = TestEnv::new();
    let mut opts = env.opts(Builder::PerCommand, &[]);
    opts.extra_files = vec![env.root.join("does-not-exist").display().to_string()];

    let err = create_image(&opts).unwrap_err();
    assert!(matches!(err, Error::Resolution { .. }), "{}", err);
    assert!(!opts.output.exists());
}

#[test]
fn test_missing_shared_library_is_resolution_error() {
    let sh = std::path::Path::new("/bin/sh");
    if which::which("readelf").is_err() || !ramforge::libdeps::is_elf(sh) {
        eprintln!("skipping: needs readelf and an ELF /bin/sh");
        return;
    }
    let env = TestEnv::new();
    let sysroot = env.root.join("empty-sysroot");
    fs::create_dir_all(&sysroot).unwrap();
    let resolver = ramforge::libdeps::Resolver::new(&sysroot, std::env::consts::ARCH);
    if resolver.dependencies(sh).is_ok() {
        eprintln!("skipping: /bin/sh is statically linked");
        return;
    }

    let mut opts = env.opts(Builder::PerCommand, &[]);
    opts.sysroot = sysroot;
    opts.extra_files = vec!["/bin/sh:bin/hostsh".to_string()];

    let err = create_image(&opts).unwrap_err();
    assert!(matches!(err, Error::Resolution { .. }), "{}", err);
    assert!(!opts.output.exists());
    assert!(!env.root.join("out.cpio.tmp").exists());
}

#[test]
fn test_gzip_output() {
    let env = TestEnv::new();
    let mut opts = env.opts(Builder::PerCommand, &[]);
    opts.format = Format::CpioGz;
    opts.output = env.root.join("out.cpio.gz");
    let summary = create_image(&opts).unwrap();

    let bytes = fs::read(&opts.output).unwrap();
    assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
    assert_eq!(summary.output_size, bytes.len() as u64);
    assert!(find(&read_archive(&opts.output), "etc/resolv.conf").is_some());
}

#[test]
fn test_user_workspace_is_kept() {
    let env = TestEnv::new();
    let ls = env.package("ls");
    let workspace = env.root.join("ws");

    let mut opts = env.opts(Builder::PerCommand, &[&ls]);
    opts.temp_dir = Some(workspace.clone());
    create_image(&opts).unwrap();

    assert!(workspace.join("target/ls").is_dir());
}

#[test]
fn test_invalid_environment_fails_first() {
    let env = TestEnv::new();
    let ls = env.package("ls");
    let mut opts = env.opts(Builder::PerCommand, &[&ls]);
    opts.env.target_arch = String::new();

    let err = create_image(&opts).unwrap_err();
    assert!(matches!(err, Error::Environment(_)), "{}", err);
    assert!(env.compile_log().is_empty());
}

#[test]
fn test_unknown_init_command_is_config_error() {
    let env = TestEnv::new();
    let ls = env.package("ls");
    let mut opts = env.opts(Builder::PerCommand, &[&ls]);
    opts.init_cmd = "nosuch".into();

    assert!(matches!(create_image(&opts), Err(Error::Config(_))));
    assert!(!opts.output.exists());
}

#[test]
fn test_glob_packages() {
    let env = TestEnv::new();
    env.package("cmds/true");
    env.package("cmds/false");

    let spec = format!("{}/*", env.packages.join("cmds").display());
    let mut opts = env.opts(Builder::PerCommand, &[]);
    opts.commands = vec![ramforge::CommandGroup {
        builder: Builder::PerCommand,
        packages: vec![spec],
    }];
    let summary = create_image(&opts).unwrap();
    assert_eq!(summary.commands, vec!["false", "true"]);
}

#[tokio::test]
async fn test_builder_returns_one_artifact_per_command() {
    let env = TestEnv::new();
    let a = env.package("a");
    let b = env.package("b");
    let commands = resolve_packages(&[
        a.display().to_string(),
        b.display().to_string(),
    ])
    .unwrap();

    let workspace = tempfile::tempdir().unwrap();
    let ctx = BuildContext::new(workspace.path(), env.env()).with_jobs(2);
    let output = Builder::PerCommand.build(&commands, &ctx).await.unwrap();

    assert_eq!(output.artifacts.len(), 2);
    assert_eq!(output.commands(), vec!["a", "b"]);
    assert!(output.symlink_hints.is_empty());
}

#[test]
#[ignore = "compiles with the real toolchain"]
fn test_real_dispatcher_runs_by_name() {
    use std::os::unix::fs::{symlink, PermissionsExt};
    use std::process::Command;

    let env = TestEnv::new();
    let hello = env.package("hello");
    let bye = env.package("bye");

    let mut opts = env.opts(Builder::Multiplexed, &[&hello, &bye]);
    opts.env = ramforge::Environment::host();
    opts.env.native_linkage = true;
    create_image(&opts).unwrap();

    let records = read_archive(&opts.output);
    let Content::Bytes(bb) = &find(&records, "bbin/bb").unwrap().content else {
        panic!("bbin/bb has no data");
    };
    let bin = env.root.join("run");
    fs::create_dir_all(&bin).unwrap();
    fs::write(bin.join("bb"), bb).unwrap();
    fs::set_permissions(bin.join("bb"), fs::Permissions::from_mode(0o755)).unwrap();
    symlink("bb", bin.join("hello")).unwrap();

    let out = Command::new(bin.join("hello")).output().unwrap();
    assert_eq!(String::from_utf8_lossy(&out.stdout), "hello\n");

    let out = Command::new(bin.join("bb")).arg("bye").output().unwrap();
    assert_eq!(String::from_utf8_lossy(&out.stdout), "bye\n");

    let out = Command::new(bin.join("bb")).arg("nosuch").output().unwrap();
    assert!(!out.status.success());
}

/// Recreate an archive's directories, files and links under `root`.
fn unpack(records: &[Record], root: &std::path::Path) {
    use std::os::unix::fs::{symlink, PermissionsExt};

    for record in records {
        let path = root.join(&record.path);
        match (&record.kind, &record.content) {
            (RecordKind::Directory, _) => fs::create_dir_all(&path).unwrap(),
            (RecordKind::Symlink, Content::Link(target)) => symlink(target, &path).unwrap(),
            (RecordKind::File, Content::Bytes(data)) => {
                fs::write(&path, data).unwrap();
                fs::set_permissions(&path, fs::Permissions::from_mode(record.perm)).unwrap();
            }
            _ => {}
        }
    }
}

#[test]
#[ignore = "compiles with the real toolchain"]
fn test_real_dispatcher_follows_alias_links() {
    use std::process::Command;

    let env = TestEnv::new();
    let hello = env.package("hello");
    let bye = env.package("bye");

    let mut opts = env.opts(Builder::Multiplexed, &[&hello, &bye]);
    opts.env = ramforge::Environment::host();
    opts.env.native_linkage = true;
    opts.base_archive = Some("/dev/null".into());
    opts.default_shell = "hello".into();
    opts.uinit_cmd = "bye".into();
    create_image(&opts).unwrap();

    let records = read_archive(&opts.output);
    assert_eq!(find(&records, "bin/sh").unwrap().content, link("../bbin/hello"));
    let root = env.root.join("image");
    unpack(&records, &root);

    // bin/sh -> ../bbin/hello -> bb
    let out = Command::new(root.join("bin/sh")).output().unwrap();
    assert_eq!(String::from_utf8_lossy(&out.stdout), "hello\n");
    let out = Command::new(root.join("bin/uinit")).output().unwrap();
    assert_eq!(String::from_utf8_lossy(&out.stdout), "bye\n");
    let out = Command::new(root.join("bin/defaultsh")).output().unwrap();
    assert_eq!(String::from_utf8_lossy(&out.stdout), "hello\n");
}

#[test]
#[ignore = "compiles with the real toolchain"]
fn test_real_dispatcher_shellbang_scripts() {
    use std::process::Command;

    let env = TestEnv::new();
    let hello = env.package("hello");

    let mut opts = env.opts(Builder::Multiplexed, &[&hello]);
    opts.env = ramforge::Environment::host();
    opts.env.native_linkage = true;
    opts.base_archive = Some("/dev/null".into());
    opts.shellbang = true;
    opts.default_shell = "hello".into();
    create_image(&opts).unwrap();

    let records = read_archive(&opts.output);
    assert_eq!(
        find(&records, "bbin/hello").unwrap().content,
        Content::Bytes(b"#!/bbin/bb\n".to_vec())
    );
    let root = env.root.join("image");
    unpack(&records, &root);

    // What the kernel runs for `/bin/sh` when /bbin/hello is a script.
    let out = Command::new(root.join("bbin/bb"))
        .arg(root.join("bin/sh"))
        .output()
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&out.stdout), "hello\n");
}
