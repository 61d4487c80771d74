#![forbid(unsafe_code)]
//! Tree ingestion for sqsh.
//!
//! Three producers feed the same tree: a host-directory scanner, a
//! textual pseudo-file description parser, and a sort-file reader that
//! reorders the packing work list. A small input helper transparently
//! decompresses gzip/zstd sources.

mod input;
mod pseudo;
mod scan;
mod sortfile;

pub use input::open_for_reading;
pub use pseudo::{tree_from_pseudo_file, tree_from_pseudo_reader};
pub use scan::{scan_into, ScanConfig, ScanDefaults, ScanFlags};
pub use sortfile::{apply_sort_file, apply_sort_reader};
