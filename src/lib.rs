// vim: tw=80
//! Applies declarative firmware update bundles to block devices and image
//! files.
//!
//! A bundle is a directory holding a `manifest.toml` and a `data/` directory
//! of resource payloads. The manifest names resources (with expected sizes
//! and BLAKE2b-256 digests) and tasks, each task an ordered list of actions
//! that write raw bytes, format and edit FAT filesystems, render partition
//! tables, and rewrite U-Boot environments on the destination.

pub mod actions;
pub mod apply;
pub mod block_cache;
pub mod errors;
pub mod fat;
pub mod manifest;
pub mod mbr;
pub mod pad_writer;
pub mod progress;
pub mod resource;
pub mod sparse;
pub mod uboot_env;

/// The addressing unit for destination offsets.
pub const BLOCK_SIZE: usize = 512;

/// Upper bound on the number of argv slots of a single action, the action
/// name included.
pub const MAX_ARGS: usize = 8;
