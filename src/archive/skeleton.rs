//! Minimal filesystem used as the base layer when no base archive is given.

use super::record::Record;

const RESOLV_CONF: &str = "nameserver 8.8.8.8\n";

/// Directories, device nodes and config files every image starts with.
pub fn default_skeleton() -> Vec<Record> {
    vec![
        Record::directory("bin", 0o755),
        Record::directory("dev", 0o755),
        Record::directory("etc", 0o755),
        Record::directory("lib64", 0o755),
        Record::directory("tmp", 0o1777),
        Record::directory("ubin", 0o755),
        Record::directory("usr", 0o755),
        Record::directory("usr/lib", 0o755),
        Record::directory("var/log", 0o777),
        Record::char_device("dev/console", 0o600, 5, 1),
        Record::char_device("dev/tty", 0o666, 5, 0),
        Record::char_device("dev/null", 0o666, 1, 3),
        Record::char_device("dev/port", 0o640, 1, 4),
        Record::char_device("dev/urandom", 0o666, 1, 9),
        Record::file("etc/resolv.conf", RESOLV_CONF, 0o644),
    ]
}
