//! Archive formats and the merge engine.
//!
//! - `record` - the entry type shared by every format
//! - `cpio` - newc reader and writer
//! - `skeleton` - default filesystem used when no base archive is given
//! - `merge` - precedence-resolved composition of all record sources

pub mod cpio;
pub mod merge;
pub mod record;
pub mod skeleton;

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use crate::error::{ArchiveError, Error};

pub use merge::{compose, merge, Base, Layers};
pub use record::{Content, Record, RecordKind};

/// Lazy, single-pass sequence of records read from a stream.
pub type RecordReader<'a> = Box<dyn Iterator<Item = Result<Record, ArchiveError>> + 'a>;

/// Accepts records in the order presented and finalizes the stream.
pub trait RecordWriter {
    fn write_record(&mut self, record: &Record) -> Result<(), ArchiveError>;

    /// Write the trailer and flush.
    fn finish(self: Box<Self>) -> Result<(), ArchiveError>;
}

/// Supported archive wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Uncompressed SVR4 newc cpio.
    #[default]
    Cpio,
    /// newc cpio inside a gzip stream.
    CpioGz,
}

impl Format {
    /// Look up a format by name.
    pub fn from_name(name: &str) -> Result<Self, Error> {
        match name {
            "cpio" => Ok(Format::Cpio),
            "cpio.gz" | "cpio-gz" => Ok(Format::CpioGz),
            other => Err(Error::UnsupportedFormat(other.to_string())),
        }
    }

    /// Guess the format of a stream from its first bytes.
    pub fn detect(header: &[u8]) -> Self {
        if header.starts_with(&[0x1f, 0x8b]) {
            Format::CpioGz
        } else {
            Format::Cpio
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Format::Cpio => "cpio",
            Format::CpioGz => "cpio.gz",
        }
    }

    pub fn reader<'a>(self, stream: impl Read + 'a) -> RecordReader<'a> {
        match self {
            Format::Cpio => Box::new(cpio::CpioReader::new(stream)),
            Format::CpioGz => Box::new(cpio::CpioReader::new(flate2::read::GzDecoder::new(
                stream,
            ))),
        }
    }

    pub fn open_writer<'a>(self, stream: impl Write + 'a) -> Box<dyn RecordWriter + 'a> {
        match self {
            Format::Cpio => Box::new(cpio::CpioWriter::new(stream)),
            Format::CpioGz => Box::new(cpio::GzCpioWriter::new(stream)),
        }
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Format::from_name(s)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
