//! Host-directory scanning.
//!
//! Walks a directory tree in sorted order and adds every accepted entry
//! to the filesystem tree. Filters cover per-kind exclusion, staying on
//! one filesystem, recursion control, and glob name matching; host
//! attributes are kept or replaced by defaults per the `KEEP_*` flags.

use bitflags::bitflags;
use sqsh_error::{Result, SqshError};
use sqsh_tree::{NodeAttrs, Payload, Tree};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::debug;

bitflags! {
    /// Scan behavior switches; the `NO_*` kind flags exclude node kinds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ScanFlags: u32 {
        const NO_BLK          = 1;
        const NO_CHR          = 1 << 1;
        const NO_DIR          = 1 << 2;
        const NO_FIFO         = 1 << 3;
        const NO_FILE         = 1 << 4;
        const NO_SLINK        = 1 << 5;
        const NO_SOCK         = 1 << 6;
        const ONE_FILESYSTEM  = 1 << 7;
        const KEEP_TIME       = 1 << 8;
        const KEEP_UID        = 1 << 9;
        const KEEP_GID        = 1 << 10;
        const KEEP_MODE       = 1 << 11;
        const NO_RECURSION    = 1 << 12;
        const MATCH_FULL_PATH = 1 << 13;
    }
}

impl ScanFlags {
    /// Every kind-exclusion flag at once; the glob `-type` whitelist
    /// starts from here.
    #[must_use]
    pub fn all_kinds() -> Self {
        Self::NO_BLK
            | Self::NO_CHR
            | Self::NO_DIR
            | Self::NO_FIFO
            | Self::NO_FILE
            | Self::NO_SLINK
            | Self::NO_SOCK
    }
}

/// Attribute values used when the corresponding `KEEP_*` flag is absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanDefaults {
    pub mtime: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
}

/// Full scan configuration.
#[derive(Debug, Default)]
pub struct ScanConfig {
    pub flags: ScanFlags,
    pub defaults: ScanDefaults,
    /// Tree path the scanned entries land under ("" for the root).
    pub prefix: String,
    pub name_pattern: Option<glob::Pattern>,
}

/// Walk `root` on the host filesystem and add every accepted entry.
pub fn scan_into(tree: &mut Tree, root: &Path, cfg: &ScanConfig) -> Result<()> {
    let root_meta = fs::symlink_metadata(root).map_err(|e| SqshError::io_at(root, e))?;
    let root_dev = root_meta.dev();

    let mut pending: Vec<(PathBuf, String)> = vec![(root.to_path_buf(), String::new())];
    let mut entries_added = 0_usize;

    while let Some((dir, rel)) = pending.pop() {
        let mut names = Vec::new();
        let iter = fs::read_dir(&dir).map_err(|e| SqshError::io_at(&dir, e))?;
        for entry in iter {
            let entry = entry.map_err(|e| SqshError::io_at(&dir, e))?;
            names.push(entry.file_name());
        }
        names.sort();

        for name in names {
            let Some(name) = name.to_str().map(str::to_owned) else {
                return Err(SqshError::Limit(format!(
                    "{}: file name is not valid UTF-8",
                    dir.display()
                )));
            };
            let host_path = dir.join(&name);
            let rel_path = if rel.is_empty() {
                name.clone()
            } else {
                format!("{rel}/{name}")
            };
            let meta =
                fs::symlink_metadata(&host_path).map_err(|e| SqshError::io_at(&host_path, e))?;
            let ft = meta.file_type();

            if cfg.flags.contains(ScanFlags::ONE_FILESYSTEM) && meta.dev() != root_dev {
                continue;
            }

            let descend = ft.is_dir()
                && !cfg.flags.contains(ScanFlags::NO_RECURSION)
                && !ft.is_symlink();
            if descend {
                pending.push((host_path.clone(), rel_path.clone()));
            }

            if excluded_kind(cfg.flags, &ft) {
                continue;
            }
            if let Some(pattern) = &cfg.name_pattern {
                let subject = if cfg.flags.contains(ScanFlags::MATCH_FULL_PATH) {
                    rel_path.as_str()
                } else {
                    name.as_str()
                };
                if !pattern.matches(subject) {
                    continue;
                }
            }

            let attrs = attrs_from(cfg, &meta);
            let payload = payload_from(&host_path, &meta)?;
            let tree_path = if cfg.prefix.is_empty() {
                rel_path.clone()
            } else {
                format!("{}/{}", cfg.prefix, rel_path)
            };
            tree.add(&tree_path, attrs, payload)?;
            entries_added += 1;
        }
    }

    debug!(
        root = %root.display(),
        prefix = %cfg.prefix,
        entries = entries_added,
        "directory scan complete"
    );
    Ok(())
}

fn excluded_kind(flags: ScanFlags, ft: &fs::FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    if ft.is_dir() {
        flags.contains(ScanFlags::NO_DIR)
    } else if ft.is_file() {
        flags.contains(ScanFlags::NO_FILE)
    } else if ft.is_symlink() {
        flags.contains(ScanFlags::NO_SLINK)
    } else if ft.is_block_device() {
        flags.contains(ScanFlags::NO_BLK)
    } else if ft.is_char_device() {
        flags.contains(ScanFlags::NO_CHR)
    } else if ft.is_fifo() {
        flags.contains(ScanFlags::NO_FIFO)
    } else if ft.is_socket() {
        flags.contains(ScanFlags::NO_SOCK)
    } else {
        true
    }
}

fn attrs_from(cfg: &ScanConfig, meta: &fs::Metadata) -> NodeAttrs {
    let flags = cfg.flags;
    let mode = if flags.contains(ScanFlags::KEEP_MODE) {
        (meta.mode() & 0o7777) as u16
    } else {
        cfg.defaults.mode
    };
    let uid = if flags.contains(ScanFlags::KEEP_UID) {
        meta.uid()
    } else {
        cfg.defaults.uid
    };
    let gid = if flags.contains(ScanFlags::KEEP_GID) {
        meta.gid()
    } else {
        cfg.defaults.gid
    };
    let mtime = if flags.contains(ScanFlags::KEEP_TIME) {
        u32::try_from(meta.mtime()).unwrap_or(0)
    } else {
        cfg.defaults.mtime
    };
    NodeAttrs {
        mode,
        uid,
        gid,
        mtime,
    }
}

fn payload_from(host_path: &Path, meta: &fs::Metadata) -> Result<Payload> {
    use std::os::unix::fs::FileTypeExt;
    let ft = meta.file_type();
    Ok(if ft.is_dir() {
        Payload::empty_dir()
    } else if ft.is_file() {
        Payload::file_from(Some(host_path.to_path_buf()))
    } else if ft.is_symlink() {
        let target = fs::read_link(host_path).map_err(|e| SqshError::io_at(host_path, e))?;
        let Some(target) = target.to_str().map(str::to_owned) else {
            return Err(SqshError::Limit(format!(
                "{}: symlink target is not valid UTF-8",
                host_path.display()
            )));
        };
        Payload::Symlink { target }
    } else if ft.is_block_device() {
        let (major, minor) = split_dev(meta.rdev());
        Payload::BlockDev { major, minor }
    } else if ft.is_char_device() {
        let (major, minor) = split_dev(meta.rdev());
        Payload::CharDev { major, minor }
    } else if ft.is_fifo() {
        Payload::Fifo
    } else {
        Payload::Socket
    })
}

/// Split a Linux `dev_t` into (major, minor).
fn split_dev(rdev: u64) -> (u32, u32) {
    let major = ((rdev >> 8) & 0xFFF) | ((rdev >> 32) & !0xFFF_u64);
    let minor = (rdev & 0xFF) | ((rdev >> 12) & 0xFFFF_FF00);
    (major as u32, minor as u32)
}
