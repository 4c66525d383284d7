//! Deterministic composition of every record source into one archive.
//!
//! Layers, lowest precedence first:
//!
//! ```text
//! 1. base archive (or the default skeleton)
//! 2. command groups, in group order
//! 3. extra files, in the order given
//! 4. generated symlinks (/init, /bin/uinit, /bin/sh, ...)
//! ```
//!
//! A later layer replaces an earlier record at the same path. The one
//! exception is `/init` when the caller asked to keep the base archive's
//! init: the generated init link is then written as `/inito` instead.
//!
//! Records are emitted sorted by path, which places every directory before
//! its contents. Missing parent directories are synthesized.

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::record::{ancestors, Record, DEFAULT_DIR_MODE};
use super::skeleton::default_skeleton;
use super::{RecordReader, RecordWriter};
use crate::error::Result;

const INIT: &str = "init";
const INIT_ORIGINAL: &str = "inito";

/// Lowest-precedence layer.
pub enum Base<'a> {
    /// Records read from a user-supplied archive.
    Archive(RecordReader<'a>),
    /// The built-in skeleton.
    Skeleton,
}

/// Generated record sources, each already in its own order.
#[derive(Debug, Default)]
pub struct Layers {
    /// One entry per build group, in group order.
    pub groups: Vec<Vec<Record>>,
    pub extra_files: Vec<Record>,
    pub symlinks: Vec<Record>,
}

/// Resolve precedence and return the final record list in write order.
pub fn compose(base: Base<'_>, layers: Layers, use_existing_init: bool) -> Result<Vec<Record>> {
    let mut tree: BTreeMap<String, Record> = BTreeMap::new();

    let from_archive = matches!(base, Base::Archive(_));
    match base {
        Base::Archive(reader) => {
            for record in reader {
                let record = record?.make_reproducible();
                tree.insert(record.path.clone(), record);
            }
        }
        Base::Skeleton => {
            for record in default_skeleton() {
                tree.insert(record.path.clone(), record);
            }
        }
    }
    let base_init = if from_archive {
        tree.get(INIT).cloned()
    } else {
        None
    };

    for mut group in layers.groups {
        group.sort_by(|a, b| a.path.cmp(&b.path));
        for record in group {
            if tree.contains_key(&record.path) {
                debug!("{} overrides an earlier record", record.path);
            }
            tree.insert(record.path.clone(), record);
        }
    }

    for record in layers.extra_files {
        tree.insert(record.path.clone(), record);
    }

    for mut record in layers.symlinks {
        if record.path == INIT {
            if let Some(base_init) = &base_init {
                if use_existing_init {
                    info!("Keeping /init from base archive; generated init written to /inito");
                    record.path = INIT_ORIGINAL.to_string();
                } else if !tree.contains_key(INIT_ORIGINAL) {
                    info!("Base archive /init preserved as /inito");
                    let mut original = base_init.clone();
                    original.path = INIT_ORIGINAL.to_string();
                    tree.insert(original.path.clone(), original);
                }
            }
        }
        tree.insert(record.path.clone(), record);
    }

    let missing: Vec<String> = tree
        .keys()
        .flat_map(|path| ancestors(path))
        .filter(|dir| !tree.contains_key(*dir))
        .map(str::to_string)
        .collect();
    for dir in missing {
        tree.entry(dir.clone())
            .or_insert_with(|| Record::directory(&dir, DEFAULT_DIR_MODE));
    }

    Ok(tree.into_values().collect())
}

/// Compose all layers and stream them into `writer`.
///
/// Nothing is written until every layer (including the base archive) has
/// been read successfully. The writer is not finished here.
pub fn merge(
    base: Base<'_>,
    layers: Layers,
    use_existing_init: bool,
    writer: &mut dyn RecordWriter,
) -> Result<usize> {
    let records = compose(base, layers, use_existing_init)?;
    for record in &records {
        writer.write_record(record)?;
    }
    Ok(records.len())
}
