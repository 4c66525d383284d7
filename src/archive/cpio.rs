//! SVR4 "newc" cpio codec, the format the kernel's initramfs unpacker reads.
//!
//! Each entry is a 110-byte ASCII header (magic `070701` followed by thirteen
//! 8-digit hex fields), the NUL-terminated name padded to 4 bytes, then the
//! data padded to 4 bytes. The stream ends with an entry named `TRAILER!!!`.

use std::borrow::Cow;
use std::fs;
use std::io::{self, Read, Write};

use super::record::{normalize_path, Content, Record, RecordKind, S_IFMT};
use super::RecordWriter;
use crate::error::ArchiveError;

const MAGIC: &[u8; 6] = b"070701";
const MAGIC_CRC: &[u8; 6] = b"070702";
const HEADER_LEN: usize = 110;
const TRAILER: &str = "TRAILER!!!";

fn pad4(len: u64) -> u64 {
    (4 - (len % 4)) % 4
}

// =============================================================================
// Writer
// =============================================================================

/// Writes records to a newc stream in the order given.
pub struct CpioWriter<W: Write> {
    inner: W,
    offset: u64,
    next_ino: u32,
}

impl<W: Write> CpioWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            offset: 0,
            next_ino: 1,
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ArchiveError> {
        self.inner.write_all(bytes).map_err(|e| {
            ArchiveError::io(format!("writing archive at offset {}", self.offset), e)
        })?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    fn write_padding(&mut self) -> Result<(), ArchiveError> {
        let pad = pad4(self.offset) as usize;
        if pad > 0 {
            self.write_bytes(&[0u8; 3][..pad])?;
        }
        Ok(())
    }

    fn write_entry(
        &mut self,
        name: &str,
        ino: u32,
        record: Option<&Record>,
        data: &[u8],
    ) -> Result<(), ArchiveError> {
        let (mode, uid, gid, nlink, mtime, rdev) = match record {
            Some(r) => (
                r.mode(),
                r.uid,
                r.gid,
                if r.is_dir() { 2 } else { 1 },
                r.mtime as u32,
                r.rdev,
            ),
            None => (0, 0, 0, 1, 0, (0, 0)),
        };
        let header = format!(
            "070701{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}",
            ino,
            mode,
            uid,
            gid,
            nlink,
            mtime,
            data.len() as u32,
            0, // devmajor
            0, // devminor
            rdev.0,
            rdev.1,
            name.len() + 1,
            0, // check
        );
        self.write_bytes(header.as_bytes())?;
        self.write_bytes(name.as_bytes())?;
        self.write_bytes(&[0])?;
        self.write_padding()?;
        self.write_bytes(data)?;
        self.write_padding()
    }

    /// Write the trailer and hand back the underlying stream.
    pub fn finish_stream(mut self) -> Result<W, ArchiveError> {
        self.write_entry(TRAILER, 0, None, &[])?;
        self.inner
            .flush()
            .map_err(|e| ArchiveError::io("flushing archive", e))?;
        Ok(self.inner)
    }
}

impl<W: Write> RecordWriter for CpioWriter<W> {
    fn write_record(&mut self, record: &Record) -> Result<(), ArchiveError> {
        if record.path.is_empty() {
            return Err(ArchiveError::malformed(
                self.offset,
                "record has an empty path",
            ));
        }
        let data: Cow<'_, [u8]> = match &record.content {
            Content::Empty => Cow::Borrowed(&[]),
            Content::Bytes(bytes) => Cow::Borrowed(bytes),
            Content::Link(target) => Cow::Borrowed(target.as_bytes()),
            Content::Host(source) => Cow::Owned(fs::read(source).map_err(|e| {
                ArchiveError::io(format!("reading {}", source.display()), e)
            })?),
        };
        if data.len() > u32::MAX as usize {
            return Err(ArchiveError::malformed(
                self.offset,
                format!("{} is too large for a newc archive", record.path),
            ));
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.write_entry(&record.path, ino, Some(record), &data)
    }

    fn finish(self: Box<Self>) -> Result<(), ArchiveError> {
        self.finish_stream().map(|_| ())
    }
}

/// newc writer wrapped in a gzip stream.
pub struct GzCpioWriter<W: Write>(CpioWriter<flate2::write::GzEncoder<W>>);

impl<W: Write> GzCpioWriter<W> {
    pub fn new(inner: W) -> Self {
        let encoder = flate2::write::GzEncoder::new(inner, flate2::Compression::default());
        Self(CpioWriter::new(encoder))
    }
}

impl<W: Write> RecordWriter for GzCpioWriter<W> {
    fn write_record(&mut self, record: &Record) -> Result<(), ArchiveError> {
        self.0.write_record(record)
    }

    fn finish(self: Box<Self>) -> Result<(), ArchiveError> {
        let encoder = self.0.finish_stream()?;
        let mut inner = encoder
            .finish()
            .map_err(|e| ArchiveError::io("finishing gzip stream", e))?;
        inner
            .flush()
            .map_err(|e| ArchiveError::io("flushing archive", e))
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Lazily yields records from a newc stream.
///
/// Iteration stops at the trailer, or at a clean end of stream on a record
/// boundary (so an empty file such as `/dev/null` reads as an empty archive).
/// Entries naming the archive root (`.`) are skipped.
pub struct CpioReader<R: Read> {
    inner: R,
    offset: u64,
    done: bool,
}

impl<R: Read> CpioReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            offset: 0,
            done: false,
        }
    }

    /// Fill `buf` completely, or report how many bytes were read before EOF.
    fn read_up_to(&mut self, buf: &mut [u8]) -> Result<usize, ArchiveError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(ArchiveError::io(
                        format!("reading archive at offset {}", self.offset),
                        e,
                    ))
                }
            }
        }
        self.offset += filled as u64;
        Ok(filled)
    }

    fn read_exact_at(&mut self, buf: &mut [u8], what: &str) -> Result<(), ArchiveError> {
        let start = self.offset;
        let n = self.read_up_to(buf)?;
        if n < buf.len() {
            return Err(ArchiveError::malformed(
                start,
                format!("truncated {} ({} of {} bytes)", what, n, buf.len()),
            ));
        }
        Ok(())
    }

    fn skip_padding(&mut self) -> Result<(), ArchiveError> {
        let pad = pad4(self.offset) as usize;
        if pad > 0 {
            let mut scratch = [0u8; 3];
            self.read_exact_at(&mut scratch[..pad], "padding")?;
        }
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<Record>, ArchiveError> {
        loop {
            let start = self.offset;
            let mut header = [0u8; HEADER_LEN];
            let n = self.read_up_to(&mut header)?;
            if n == 0 {
                return Ok(None);
            }
            if n < HEADER_LEN {
                return Err(ArchiveError::malformed(start, "truncated header"));
            }
            if &header[..6] != MAGIC && &header[..6] != MAGIC_CRC {
                return Err(ArchiveError::malformed(
                    start,
                    format!(
                        "bad magic {:?} (only newc archives are supported)",
                        String::from_utf8_lossy(&header[..6])
                    ),
                ));
            }
            let mut fields = [0u32; 13];
            for (i, field) in fields.iter_mut().enumerate() {
                let raw = &header[6 + i * 8..14 + i * 8];
                *field = std::str::from_utf8(raw)
                    .ok()
                    .and_then(|s| u32::from_str_radix(s, 16).ok())
                    .ok_or_else(|| {
                        ArchiveError::malformed(start, format!("bad header field {}", i))
                    })?;
            }
            let [_ino, mode, uid, gid, _nlink, mtime, filesize, _maj, _min, rmaj, rmin, namesize, _check] =
                fields;

            if namesize == 0 {
                return Err(ArchiveError::malformed(start, "zero-length name"));
            }
            let mut name = vec![0u8; namesize as usize];
            self.read_exact_at(&mut name, "name")?;
            self.skip_padding()?;
            if name.last() == Some(&0) {
                name.pop();
            }
            let name = String::from_utf8(name)
                .map_err(|_| ArchiveError::malformed(start, "name is not valid UTF-8"))?;

            if name == TRAILER {
                return Ok(None);
            }

            let mut data = vec![0u8; filesize as usize];
            self.read_exact_at(&mut data, "file data")?;
            self.skip_padding()?;

            let kind = RecordKind::from_mode(mode).ok_or_else(|| {
                ArchiveError::malformed(
                    start,
                    format!("{}: unknown file type {:o}", name, mode & S_IFMT),
                )
            })?;

            let Some(path) = normalize_path(&name) else {
                continue;
            };

            let content = match kind {
                RecordKind::File => Content::Bytes(data),
                RecordKind::Symlink => Content::Link(String::from_utf8(data).map_err(|_| {
                    ArchiveError::malformed(start, format!("{}: symlink target is not UTF-8", path))
                })?),
                _ => Content::Empty,
            };

            return Ok(Some(Record {
                path,
                kind,
                perm: mode & 0o7777,
                uid,
                gid,
                mtime: mtime as u64,
                rdev: (rmaj, rmin),
                content,
            }));
        }
    }
}

impl<R: Read> Iterator for CpioReader<R> {
    type Item = Result<Record, ArchiveError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
