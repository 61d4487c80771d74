//! Sort-file handling.
//!
//! A sort file reorders the packing work list and attaches per-file
//! packing flags. Each non-empty, non-comment line is
//! `<priority> [flags] <path>`: a signed decimal priority, an optional
//! bracketed, comma-separated flag list (`glob`, `dont_fragment`,
//! `dont_compress`), and a path or glob pattern. Files pack in ascending
//! priority; equal priorities keep inode order.

use sqsh_error::{Result, SqshError};
use sqsh_tree::{Payload, Tree};
use std::io::BufRead;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
struct LineFlags {
    glob: bool,
    dont_fragment: bool,
    dont_compress: bool,
}

/// Apply a sort file from disk; call after `post_process`.
pub fn apply_sort_file(tree: &mut Tree, path: &Path) -> Result<()> {
    let file = std::fs::File::open(path).map_err(|e| SqshError::io_at(path, e))?;
    let name = path.display().to_string();
    apply_sort_reader(tree, std::io::BufReader::new(file), &name)
}

/// Apply sort-file lines from any source; `filename` is for error
/// context.
pub fn apply_sort_reader(tree: &mut Tree, reader: impl BufRead, filename: &str) -> Result<()> {
    let mut applied = 0_usize;
    for (idx, line) in reader.lines().enumerate() {
        let line_num = idx + 1;
        let line = line.map_err(|e| SqshError::io_at(filename, e))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        applied += handle_line(tree, filename, line_num, line)?;
    }
    tree.sort_work_list();
    debug!(entries = applied, "sort file applied");
    Ok(())
}

fn handle_line(tree: &mut Tree, filename: &str, line_num: usize, line: &str) -> Result<usize> {
    let fail = |msg: String| SqshError::format(filename, line_num, msg);

    let (priority_str, rest) = line
        .split_once(char::is_whitespace)
        .ok_or_else(|| fail("expected '<priority> [flags] <path>'".into()))?;
    let priority: i64 = priority_str
        .parse()
        .map_err(|_| fail(format!("bad priority '{priority_str}'")))?;

    let rest = rest.trim_start();
    let (flags, path) = if let Some(tail) = rest.strip_prefix('[') {
        let (list, path) = tail
            .split_once(']')
            .ok_or_else(|| fail("unterminated flag list".into()))?;
        (parse_flags(filename, line_num, list)?, path.trim_start())
    } else {
        (LineFlags::default(), rest)
    };
    if path.is_empty() {
        return Err(fail("missing path".into()));
    }

    if flags.glob {
        let pattern = glob::Pattern::new(path)
            .map_err(|e| fail(format!("bad pattern '{path}': {e}")))?;
        let matches: Vec<_> = tree
            .files()
            .iter()
            .copied()
            .filter(|id| pattern.matches(tree.path_of(*id).as_str()))
            .collect();
        for id in &matches {
            mark(tree, *id, priority, flags);
        }
        Ok(matches.len())
    } else {
        let Some(id) = tree.resolve(path) else {
            return Err(fail(format!("{path}: no such file")));
        };
        if !matches!(tree.node(id).payload, Payload::File(_)) {
            return Err(fail(format!("{path}: not a regular file")));
        }
        mark(tree, id, priority, flags);
        Ok(1)
    }
}

fn parse_flags(filename: &str, line_num: usize, list: &str) -> Result<LineFlags> {
    let mut flags = LineFlags::default();
    for item in list.split(',') {
        match item.trim() {
            "glob" => flags.glob = true,
            "dont_fragment" => flags.dont_fragment = true,
            "dont_compress" => flags.dont_compress = true,
            other => {
                return Err(SqshError::format(
                    filename,
                    line_num,
                    format!("unknown sort flag '{other}'"),
                ));
            }
        }
    }
    Ok(flags)
}

fn mark(tree: &mut Tree, id: sqsh_tree::NodeId, priority: i64, flags: LineFlags) {
    if let Some(file) = tree.node_mut(id).as_file_mut() {
        file.priority = priority;
        file.flags.no_fragment |= flags.dont_fragment;
        file.flags.no_compress |= flags.dont_compress;
    }
}
