#![forbid(unsafe_code)]
//! In-memory filesystem tree for sqsh.
//!
//! Nodes live in an arena and reference each other by `NodeId`, so growth
//! never invalidates a relation. Construction happens through `add` /
//! `add_hard_link`; `post_process` then sorts every directory, assigns
//! inode numbers, resolves hard links, builds the packing work list, and
//! folds owners into the id table.

use sqsh_error::{Result, SqshError, TreeConflict};
use sqsh_types::{PackedBlocks, MODE_MASK, XATTR_NONE};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::debug;

/// Index of a node in the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Owner, permission, and timestamp attributes of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttrs {
    /// Permission bits only (12 bits); the kind lives in the payload.
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
}

/// Per-file packing controls, set by the sort-file feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileFlags {
    /// Store the trailing partial block as a full data block.
    pub no_fragment: bool,
    /// Store every data block raw.
    pub no_compress: bool,
}

/// Regular-file payload.
#[derive(Debug, Clone, Default)]
pub struct FileData {
    /// Host path to read content from; `None` means the node's own path
    /// (relative to the pack directory) is the source.
    pub source: Option<PathBuf>,
    /// Filled by the block processor after packing.
    pub packed: Option<PackedBlocks>,
    pub flags: FileFlags,
    /// Packing priority from the sort file; ties keep inode order.
    pub priority: i64,
}

/// Kind-specific payload of a node.
#[derive(Debug, Clone)]
pub enum Payload {
    Dir { children: Vec<NodeId> },
    File(FileData),
    Symlink { target: String },
    CharDev { major: u32, minor: u32 },
    BlockDev { major: u32, minor: u32 },
    Fifo,
    Socket,
    /// Alias recorded by `add_hard_link`, resolved during post-processing.
    HardLink {
        target_path: String,
        target: Option<NodeId>,
    },
}

impl Payload {
    #[must_use]
    pub fn empty_dir() -> Self {
        Payload::Dir {
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn file_from(source: Option<PathBuf>) -> Self {
        Payload::File(FileData {
            source,
            ..FileData::default()
        })
    }

    fn is_dir(&self) -> bool {
        matches!(self, Payload::Dir { .. })
    }
}

/// One node of the tree.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub parent: Option<NodeId>,
    pub attrs: NodeAttrs,
    /// Index into the xattr id table, `XATTR_NONE` when absent.
    pub xattr_idx: u32,
    /// Assigned by `post_process`; 0 until then.
    pub inode_num: u32,
    /// Id-table indices, valid after `post_process`.
    pub uid_idx: u16,
    pub gid_idx: u16,
    /// Number of hard-link aliases resolved onto this node.
    pub extra_links: u32,
    pub payload: Payload,
}

impl Node {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.payload.is_dir()
    }

    #[must_use]
    pub fn as_file(&self) -> Option<&FileData> {
        match &self.payload {
            Payload::File(data) => Some(data),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_file_mut(&mut self) -> Option<&mut FileData> {
        match &mut self.payload {
            Payload::File(data) => Some(data),
            _ => None,
        }
    }
}

/// Attribute defaults applied to implicitly created directories.
#[derive(Debug, Clone, Copy)]
pub struct TreeDefaults {
    pub mtime: u32,
}

impl Default for TreeDefaults {
    fn default() -> Self {
        Self { mtime: 0 }
    }
}

/// The tree itself plus the artifacts of post-processing.
#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Node>,
    defaults: TreeDefaults,
    /// Regular files in inode order; the packing work list.
    files: Vec<NodeId>,
    /// Sorted, deduplicated uid/gid values.
    id_table: Vec<u32>,
    inode_count: u32,
    processed: bool,
}

pub const ROOT: NodeId = NodeId(0);

impl Tree {
    #[must_use]
    pub fn new(defaults: TreeDefaults) -> Self {
        let root = Node {
            name: String::new(),
            parent: None,
            attrs: NodeAttrs {
                mode: 0o755,
                uid: 0,
                gid: 0,
                mtime: defaults.mtime,
            },
            xattr_idx: XATTR_NONE,
            inode_num: 0,
            uid_idx: 0,
            gid_idx: 0,
            extra_links: 0,
            payload: Payload::empty_dir(),
        };
        Self {
            nodes: vec![root],
            defaults,
            files: Vec::new(),
            id_table: Vec::new(),
            inode_count: 0,
            processed: false,
        }
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Every node id, in creation order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(|i| NodeId(i as u32))
    }

    #[must_use]
    pub fn defaults(&self) -> TreeDefaults {
        self.defaults
    }

    /// Regular files in inode order. Valid after `post_process`.
    #[must_use]
    pub fn files(&self) -> &[NodeId] {
        &self.files
    }

    /// Sorted unique uid/gid values. Valid after `post_process`.
    #[must_use]
    pub fn id_table(&self) -> &[u32] {
        &self.id_table
    }

    #[must_use]
    pub fn inode_count(&self) -> u32 {
        self.inode_count
    }

    /// Reconstruct the canonical path of a node, for error reporting.
    #[must_use]
    pub fn path_of(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(n) = cur {
            let node = self.node(n);
            if node.parent.is_some() {
                parts.push(node.name.clone());
            }
            cur = node.parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    /// Split a path into canonical components: empty and `.` segments are
    /// dropped, `..` is rejected.
    pub fn canonicalize(path: &str) -> Result<Vec<&str>> {
        let mut parts = Vec::new();
        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    return Err(SqshError::tree(path, TreeConflict::InvalidPath));
                }
                name => parts.push(name),
            }
        }
        Ok(parts)
    }

    /// Walk the directory chain to `path`. Never follows symlinks.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<NodeId> {
        let parts = Self::canonicalize(path).ok()?;
        let mut cur = ROOT;
        for part in parts {
            let Payload::Dir { children } = &self.node(cur).payload else {
                return None;
            };
            cur = *children
                .iter()
                .find(|c| self.node(**c).name == part)?;
        }
        Some(cur)
    }

    /// Add a node at `path`, creating missing intermediate directories with
    /// default attributes.
    ///
    /// Re-adding an existing directory as a directory overwrites its
    /// attributes; every other collision is a name conflict. Adding the
    /// root path is only valid for directories.
    pub fn add(&mut self, path: &str, attrs: NodeAttrs, payload: Payload) -> Result<NodeId> {
        if attrs.mode & !MODE_MASK != 0 {
            return Err(SqshError::Limit(format!(
                "mode {:o} exceeds 07777",
                attrs.mode
            )));
        }
        let parts = Self::canonicalize(path)?;

        let Some((last, dirs)) = parts.split_last() else {
            // Addressing the root: only meaningful for directories.
            if payload.is_dir() {
                self.nodes[ROOT.index()].attrs = attrs;
                return Ok(ROOT);
            }
            return Err(SqshError::tree(path, TreeConflict::InvalidPath));
        };

        let mut cur = ROOT;
        for part in dirs {
            cur = self.descend_or_create(cur, part, path)?;
        }

        if !self.node(cur).is_dir() {
            return Err(SqshError::tree(path, TreeConflict::ParentNotDirectory));
        }

        if let Some(existing) = self.child_by_name(cur, last) {
            // Explicit directory over an implicitly created one: take the
            // stated attributes.
            if self.node(existing).is_dir() && payload.is_dir() {
                self.node_mut(existing).attrs = attrs;
                return Ok(existing);
            }
            return Err(SqshError::tree(path, TreeConflict::NameConflict));
        }

        Ok(self.attach(cur, last, attrs, payload))
    }

    /// Record a hard-link alias at `path` pointing to `target_path`.
    pub fn add_hard_link(&mut self, path: &str, target_path: &str) -> Result<NodeId> {
        let attrs = NodeAttrs {
            mode: 0,
            uid: 0,
            gid: 0,
            mtime: self.defaults.mtime,
        };
        self.add(
            path,
            attrs,
            Payload::HardLink {
                target_path: target_path.to_owned(),
                target: None,
            },
        )
    }

    /// Apply force-uid / force-gid to every node. Must run before
    /// `post_process`.
    pub fn override_owner(&mut self, force_uid: Option<u32>, force_gid: Option<u32>) {
        for node in &mut self.nodes {
            if let Some(uid) = force_uid {
                node.attrs.uid = uid;
            }
            if let Some(gid) = force_gid {
                node.attrs.gid = gid;
            }
        }
    }

    fn child_by_name(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        let Payload::Dir { children } = &self.node(dir).payload else {
            return None;
        };
        children
            .iter()
            .copied()
            .find(|c| self.node(*c).name == name)
    }

    fn descend_or_create(&mut self, dir: NodeId, name: &str, full_path: &str) -> Result<NodeId> {
        if let Some(existing) = self.child_by_name(dir, name) {
            if !self.node(existing).is_dir() {
                return Err(SqshError::tree(full_path, TreeConflict::ParentNotDirectory));
            }
            return Ok(existing);
        }
        let attrs = NodeAttrs {
            mode: 0o755,
            uid: 0,
            gid: 0,
            mtime: self.defaults.mtime,
        };
        Ok(self.attach(dir, name, attrs, Payload::empty_dir()))
    }

    fn attach(&mut self, parent: NodeId, name: &str, attrs: NodeAttrs, payload: Payload) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            name: name.to_owned(),
            parent: Some(parent),
            attrs,
            xattr_idx: XATTR_NONE,
            inode_num: 0,
            uid_idx: 0,
            gid_idx: 0,
            extra_links: 0,
            payload,
        });
        let Payload::Dir { children } = &mut self.nodes[parent.index()].payload else {
            unreachable!("attach target verified as directory");
        };
        children.push(id);
        id
    }

    // ── Post-processing ─────────────────────────────────────────────────

    /// Sort, number, resolve links, and build the id table. One shot.
    pub fn post_process(&mut self) -> Result<()> {
        if self.processed {
            return Err(SqshError::Internal("tree post-processed twice".into()));
        }
        self.sort_children();
        self.assign_inode_numbers()?;
        self.resolve_hard_links()?;
        self.build_id_table()?;
        self.processed = true;
        debug!(
            inodes = self.inode_count,
            files = self.files.len(),
            ids = self.id_table.len(),
            "tree post-processing complete"
        );
        Ok(())
    }

    fn sort_children(&mut self) {
        for idx in 0..self.nodes.len() {
            if !self.nodes[idx].is_dir() {
                continue;
            }
            let Payload::Dir { children } = &mut self.nodes[idx].payload else {
                continue;
            };
            let mut taken = std::mem::take(children);
            taken.sort_by(|a, b| {
                self.nodes[a.index()]
                    .name
                    .as_bytes()
                    .cmp(self.nodes[b.index()].name.as_bytes())
            });
            let Payload::Dir { children } = &mut self.nodes[idx].payload else {
                continue;
            };
            *children = taken;
        }
    }

    /// Pre-order walk over sorted children: parents before children, the
    /// root is inode 1. Hard-link aliases take their target's number later
    /// and are skipped here so numbering stays contiguous. Also collects
    /// the regular-file work list.
    fn assign_inode_numbers(&mut self) -> Result<()> {
        if self.nodes.len() > u32::MAX as usize {
            return Err(SqshError::Limit("more than 2^32 nodes".into()));
        }
        self.files.clear();
        let mut next = 1_u32;
        let mut stack = vec![ROOT];
        while let Some(id) = stack.pop() {
            if matches!(self.nodes[id.index()].payload, Payload::HardLink { .. }) {
                continue;
            }
            self.nodes[id.index()].inode_num = next;
            next += 1;
            match &self.nodes[id.index()].payload {
                Payload::Dir { children } => {
                    // Reverse so the stack pops them in sorted order.
                    stack.extend(children.iter().rev().copied());
                }
                Payload::File(_) => self.files.push(id),
                _ => {}
            }
        }
        self.inode_count = next - 1;
        Ok(())
    }

    fn resolve_hard_links(&mut self) -> Result<()> {
        let link_ids: Vec<NodeId> = (0..self.nodes.len())
            .map(|i| NodeId(i as u32))
            .filter(|id| matches!(self.nodes[id.index()].payload, Payload::HardLink { .. }))
            .collect();

        for id in link_ids {
            let Payload::HardLink { target_path, .. } = &self.nodes[id.index()].payload else {
                continue;
            };
            let mut seen = BTreeSet::new();
            seen.insert(id.0);
            let mut path = target_path.clone();
            let target = loop {
                let Some(found) = self.resolve(&path) else {
                    return Err(SqshError::tree(
                        self.path_of(id),
                        TreeConflict::LinkTargetMissing,
                    ));
                };
                match &self.nodes[found.index()].payload {
                    Payload::HardLink {
                        target_path: next, ..
                    } => {
                        if !seen.insert(found.0) {
                            return Err(SqshError::tree(
                                self.path_of(id),
                                TreeConflict::LinkCycle,
                            ));
                        }
                        path = next.clone();
                    }
                    Payload::Dir { .. } => {
                        return Err(SqshError::tree(
                            self.path_of(id),
                            TreeConflict::LinkToDirectory,
                        ));
                    }
                    _ => break found,
                }
            };

            self.nodes[id.index()].inode_num = self.nodes[target.index()].inode_num;
            self.nodes[id.index()].payload = Payload::HardLink {
                target_path: path,
                target: Some(target),
            };
            self.nodes[target.index()].extra_links += 1;
        }
        Ok(())
    }

    fn build_id_table(&mut self) -> Result<()> {
        let mut ids = BTreeSet::new();
        for node in &self.nodes {
            ids.insert(node.attrs.uid);
            ids.insert(node.attrs.gid);
        }
        self.id_table = ids.into_iter().collect();
        if self.id_table.len() > u16::MAX as usize {
            return Err(SqshError::Limit(format!(
                "{} distinct uid/gid values exceed the 65535-entry id table",
                self.id_table.len()
            )));
        }
        for idx in 0..self.nodes.len() {
            let uid = self.nodes[idx].attrs.uid;
            let gid = self.nodes[idx].attrs.gid;
            let uid_idx = self.id_table.binary_search(&uid).map_err(|_| {
                SqshError::Internal("uid missing from freshly built id table".into())
            })?;
            let gid_idx = self.id_table.binary_search(&gid).map_err(|_| {
                SqshError::Internal("gid missing from freshly built id table".into())
            })?;
            self.nodes[idx].uid_idx = uid_idx as u16;
            self.nodes[idx].gid_idx = gid_idx as u16;
        }
        Ok(())
    }

    /// Reorder the packing work list by sort-file priority; equal
    /// priorities keep inode order.
    pub fn sort_work_list(&mut self) {
        let mut keyed: Vec<(i64, NodeId)> = self
            .files
            .iter()
            .map(|id| {
                let priority = self.nodes[id.index()]
                    .as_file()
                    .map(|f| f.priority)
                    .unwrap_or(0);
                (priority, *id)
            })
            .collect();
        keyed.sort_by_key(|(priority, _)| *priority);
        self.files = keyed.into_iter().map(|(_, id)| id).collect();
    }

    /// Total hard-link count of a node: itself plus resolved aliases; for
    /// directories, 2 plus one per child directory.
    #[must_use]
    pub fn link_count(&self, id: NodeId) -> u32 {
        let node = self.node(id);
        match &node.payload {
            Payload::Dir { children } => {
                2 + children
                    .iter()
                    .filter(|c| self.node(**c).is_dir())
                    .count() as u32
            }
            Payload::HardLink {
                target: Some(target),
                ..
            } => self.link_count(*target),
            _ => 1 + node.extra_links,
        }
    }
}
