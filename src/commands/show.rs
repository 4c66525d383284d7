//! Show command - displays information.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};

use ramforge::archive::{Content, Format, RecordKind};
use ramforge::config::Config;

/// Show target for the show command.
pub enum ShowTarget {
    /// Show configuration
    Config,
    /// List the records of an archive
    Archive(PathBuf),
}

/// Execute the show command.
pub fn cmd_show(target: ShowTarget, config: &Config) -> Result<()> {
    match target {
        ShowTarget::Config => config.print(),
        ShowTarget::Archive(path) => {
            let mut header = [0u8; 2];
            let read = File::open(&path)
                .and_then(|mut f| f.read(&mut header))
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let format = Format::detect(&header[..read]);

            let file = File::open(&path)?;
            for record in format.reader(BufReader::new(file)) {
                let record = record.with_context(|| format!("Failed to read {}", path.display()))?;
                let kind = match record.kind {
                    RecordKind::Directory => 'd',
                    RecordKind::Symlink => 'l',
                    RecordKind::CharDevice => 'c',
                    RecordKind::BlockDevice => 'b',
                    RecordKind::Fifo => 'p',
                    RecordKind::Socket => 's',
                    RecordKind::File => '-',
                };
                match &record.content {
                    Content::Link(target) => {
                        println!("{}{:04o} {} -> {}", kind, record.perm, record.path, target)
                    }
                    _ => println!("{}{:04o} {}", kind, record.perm, record.path),
                }
            }
        }
    }
    Ok(())
}
