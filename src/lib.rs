//! ramforge builds minimal Linux initramfs images from Rust command packages.
//!
//! - [`builder`] compiles packages, either into one busybox-style binary or
//!   one binary per command
//! - [`libdeps`] expands extra files and pulls in their shared libraries
//! - [`archive`] holds the cpio codec and the merge engine
//! - [`initramfs`] sequences a whole build via [`create_image`]

pub mod archive;
pub mod builder;
pub mod config;
pub mod environment;
pub mod error;
pub mod initramfs;
pub mod libdeps;
pub mod preflight;
pub mod process;
pub mod stats;
pub mod timing;

pub use environment::Environment;
pub use error::{ArchiveError, Error, Result};
pub use initramfs::{create_image, BuildOpts, CommandGroup, ImageSummary};
