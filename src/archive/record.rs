//! Archive records: one file, directory, symlink or device node.

use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// File type bits (`S_IFMT`).
pub const S_IFMT: u32 = 0o170000;

/// Default mode for directories synthesized to hold a record.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Type of an archive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    File,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl RecordKind {
    /// The `S_IF*` bits for this kind.
    pub fn type_bits(self) -> u32 {
        match self {
            RecordKind::Fifo => 0o010000,
            RecordKind::CharDevice => 0o020000,
            RecordKind::Directory => 0o040000,
            RecordKind::BlockDevice => 0o060000,
            RecordKind::File => 0o100000,
            RecordKind::Symlink => 0o120000,
            RecordKind::Socket => 0o140000,
        }
    }

    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            0o010000 => Some(RecordKind::Fifo),
            0o020000 => Some(RecordKind::CharDevice),
            0o040000 => Some(RecordKind::Directory),
            0o060000 => Some(RecordKind::BlockDevice),
            0o100000 => Some(RecordKind::File),
            0o120000 => Some(RecordKind::Symlink),
            0o140000 => Some(RecordKind::Socket),
            _ => None,
        }
    }
}

/// Payload of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// Directories, devices, FIFOs and sockets.
    Empty,
    /// In-memory file data.
    Bytes(Vec<u8>),
    /// File data read from the host when the record is written.
    Host(PathBuf),
    /// Symlink target.
    Link(String),
}

/// One archive entry.
///
/// `path` is relative to the archive root and never starts with `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub path: String,
    pub kind: RecordKind,
    /// Permission bits (`0o7777`), without the type bits.
    pub perm: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u64,
    /// Device number (major, minor) for device nodes.
    pub rdev: (u32, u32),
    pub content: Content,
}

impl Record {
    fn new(path: &str, kind: RecordKind, perm: u32, content: Content) -> Self {
        Self {
            path: normalize_path(path).unwrap_or_default(),
            kind,
            perm: perm & 0o7777,
            uid: 0,
            gid: 0,
            mtime: 0,
            rdev: (0, 0),
            content,
        }
    }

    pub fn directory(path: &str, perm: u32) -> Self {
        Self::new(path, RecordKind::Directory, perm, Content::Empty)
    }

    pub fn file(path: &str, data: impl Into<Vec<u8>>, perm: u32) -> Self {
        Self::new(path, RecordKind::File, perm, Content::Bytes(data.into()))
    }

    /// A regular file whose data is read from `source` when written.
    pub fn host_file(path: &str, source: impl Into<PathBuf>, perm: u32) -> Self {
        Self::new(path, RecordKind::File, perm, Content::Host(source.into()))
    }

    pub fn symlink(path: &str, target: &str) -> Self {
        Self::new(
            path,
            RecordKind::Symlink,
            0o777,
            Content::Link(target.to_string()),
        )
    }

    pub fn char_device(path: &str, perm: u32, major: u32, minor: u32) -> Self {
        let mut record = Self::new(path, RecordKind::CharDevice, perm, Content::Empty);
        record.rdev = (major, minor);
        record
    }

    /// Build a record from a host path without following symlinks.
    ///
    /// Ownership and modification time are reset so that images built from
    /// the same tree are identical.
    pub fn from_host(source: &Path, archive_path: &str) -> Result<Self> {
        let meta = fs::symlink_metadata(source).map_err(|e| Error::io(source, e))?;
        let file_type = meta.file_type();
        let perm = meta.permissions().mode();

        let record = if file_type.is_symlink() {
            let target = fs::read_link(source).map_err(|e| Error::io(source, e))?;
            Self::symlink(archive_path, &target.to_string_lossy())
        } else if file_type.is_dir() {
            Self::directory(archive_path, perm)
        } else if file_type.is_file() {
            Self::host_file(archive_path, source, perm)
        } else {
            let kind = if file_type.is_char_device() {
                RecordKind::CharDevice
            } else if file_type.is_block_device() {
                RecordKind::BlockDevice
            } else if file_type.is_fifo() {
                RecordKind::Fifo
            } else {
                RecordKind::Socket
            };
            let mut record = Self::new(archive_path, kind, perm, Content::Empty);
            let rdev = meta.rdev();
            record.rdev = (dev_major(rdev), dev_minor(rdev));
            record
        };
        Ok(record)
    }

    /// Full `st_mode`: type bits plus permissions.
    pub fn mode(&self) -> u32 {
        self.kind.type_bits() | self.perm
    }

    /// Size of the payload when it is held in memory.
    pub fn inline_size(&self) -> Option<u64> {
        match &self.content {
            Content::Empty => Some(0),
            Content::Bytes(data) => Some(data.len() as u64),
            Content::Link(target) => Some(target.len() as u64),
            Content::Host(_) => None,
        }
    }

    /// Zero out fields that vary between otherwise identical builds.
    pub fn make_reproducible(mut self) -> Self {
        self.mtime = 0;
        self.uid = 0;
        self.gid = 0;
        self
    }

    pub fn is_dir(&self) -> bool {
        self.kind == RecordKind::Directory
    }
}

fn dev_major(dev: u64) -> u32 {
    (((dev >> 32) & 0xffff_f000) | ((dev >> 8) & 0x0000_0fff)) as u32
}

fn dev_minor(dev: u64) -> u32 {
    (((dev >> 12) & 0xffff_ff00) | (dev & 0x0000_00ff)) as u32
}

/// Normalize an archive path: strip leading `/` and `./`, drop `.` segments.
///
/// Returns `None` for the archive root and for paths escaping it via `..`.
pub fn normalize_path(path: &str) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => return None,
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Every proper ancestor of `path`, outermost first (`a/b/c` -> `a`, `a/b`).
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(idx, _)| &path[..idx])
}
