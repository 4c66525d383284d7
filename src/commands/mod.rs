//! CLI command handlers.
//!
//! - `build` - Build an initramfs image
//! - `show` - Display configuration or archive contents
//! - `preflight` - Run preflight checks

pub mod build;
mod preflight;
pub mod show;

pub use build::cmd_build;
pub use preflight::cmd_preflight;
pub use show::cmd_show;
