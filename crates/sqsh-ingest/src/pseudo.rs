//! Pseudo-file description parser.
//!
//! Each non-empty, non-comment line is
//! `<kind> <path> <mode> <uid> <gid> [extra]` with kinds `dir`, `slink`,
//! `link`, `nod`, `pipe`, `sock`, `file`, and `glob`. Paths may be
//! quoted; `glob` accepts `*` for mode/uid/gid (keep the host value) and
//! a find(1)-like option sublanguage in its extra field. Errors carry
//! `filename:line` and stop the parse.

use crate::scan::{scan_into, ScanConfig, ScanDefaults, ScanFlags};
use sqsh_error::{Result, SqshError};
use sqsh_tree::{NodeAttrs, Payload, Tree};
use std::io::BufRead;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Dir,
    Slink,
    Link,
    Nod,
    Pipe,
    Sock,
    File,
    Glob,
}

struct Hook {
    keyword: &'static str,
    kind: Kind,
    need_extra: bool,
    allow_root: bool,
}

/// Keyword dispatch table; kept static and exhaustive.
const HOOKS: &[Hook] = &[
    Hook {
        keyword: "dir",
        kind: Kind::Dir,
        need_extra: false,
        allow_root: true,
    },
    Hook {
        keyword: "slink",
        kind: Kind::Slink,
        need_extra: true,
        allow_root: false,
    },
    Hook {
        keyword: "link",
        kind: Kind::Link,
        need_extra: true,
        allow_root: false,
    },
    Hook {
        keyword: "nod",
        kind: Kind::Nod,
        need_extra: true,
        allow_root: false,
    },
    Hook {
        keyword: "pipe",
        kind: Kind::Pipe,
        need_extra: false,
        allow_root: false,
    },
    Hook {
        keyword: "sock",
        kind: Kind::Sock,
        need_extra: false,
        allow_root: false,
    },
    Hook {
        keyword: "file",
        kind: Kind::File,
        need_extra: false,
        allow_root: false,
    },
    Hook {
        keyword: "glob",
        kind: Kind::Glob,
        need_extra: false,
        allow_root: true,
    },
];

/// Which of mode/uid/gid were given as `*` on a glob line.
#[derive(Debug, Clone, Copy, Default)]
struct KeepFields {
    mode: bool,
    uid: bool,
    gid: bool,
}

/// Build the tree from a description file on disk.
pub fn tree_from_pseudo_file(tree: &mut Tree, path: &Path, base_dir: Option<&Path>) -> Result<()> {
    let file = std::fs::File::open(path).map_err(|e| SqshError::io_at(path, e))?;
    let name = path.display().to_string();
    tree_from_pseudo_reader(tree, std::io::BufReader::new(file), &name, base_dir)
}

/// Build the tree from any line source; `filename` is for error context,
/// `base_dir` anchors relative `file` sources and `glob` scans.
pub fn tree_from_pseudo_reader(
    tree: &mut Tree,
    reader: impl BufRead,
    filename: &str,
    base_dir: Option<&Path>,
) -> Result<()> {
    for (idx, line) in reader.lines().enumerate() {
        let line_num = idx + 1;
        let line = line.map_err(|e| SqshError::io_at(filename, e))?;
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        handle_line(tree, filename, line_num, line, base_dir)?;
    }
    Ok(())
}

fn handle_line(
    tree: &mut Tree,
    filename: &str,
    line_num: usize,
    line: &str,
    base_dir: Option<&Path>,
) -> Result<()> {
    let fail = |msg: &str| SqshError::format(filename, line_num, msg);

    let Some((hook, rest)) = match_keyword(line) else {
        return Err(fail("unknown entry type"));
    };

    let Some((path, rest)) = read_str(rest) else {
        return Err(fail("error in entry description"));
    };
    let is_root = Tree::canonicalize(&path)
        .map_err(|_| fail("error in entry description"))?
        .is_empty();
    if is_root && !hook.allow_root {
        return Err(SqshError::format(
            filename,
            line_num,
            format!("cannot use / as argument for {}", hook.keyword),
        ));
    }

    let mut keep = KeepFields::default();

    let (mode, rest) = if hook.kind == Kind::Glob && rest.starts_with('*') {
        keep.mode = true;
        (0, skip_space(&rest[1..]))
    } else {
        let Some((value, rest)) = read_number(rest, 8) else {
            return Err(fail("mode must be an octal number <= 07777"));
        };
        if value > 0o7777 {
            return Err(fail("mode must be an octal number <= 07777"));
        }
        (value as u16, rest)
    };

    let (uid, rest) = if hook.kind == Kind::Glob && rest.starts_with('*') {
        keep.uid = true;
        (0, skip_space(&rest[1..]))
    } else {
        let Some((value, rest)) = read_number(rest, 10) else {
            return Err(fail("uid & gid must be decimal numbers < 2^32"));
        };
        (value, rest)
    };

    let (gid, rest) = if hook.kind == Kind::Glob && rest.starts_with('*') {
        keep.gid = true;
        (0, skip_space(&rest[1..]))
    } else {
        let Some((value, rest)) = read_number(rest, 10) else {
            return Err(fail("uid & gid must be decimal numbers < 2^32"));
        };
        (value, rest)
    };

    let extra = {
        let trimmed = rest.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    };
    if hook.need_extra && extra.is_none() {
        return Err(SqshError::format(
            filename,
            line_num,
            format!("missing argument for {}", hook.keyword),
        ));
    }

    let attrs = NodeAttrs {
        mode,
        uid,
        gid,
        mtime: tree.defaults().mtime,
    };

    match hook.kind {
        Kind::Dir => {
            tree.add(&path, attrs, Payload::empty_dir())?;
        }
        Kind::Slink => {
            let target = extra.unwrap_or_default().to_owned();
            tree.add(&path, attrs, Payload::Symlink { target })?;
        }
        Kind::Link => {
            tree.add_hard_link(&path, extra.unwrap_or_default())?;
        }
        Kind::Nod => {
            let payload = parse_device(filename, line_num, extra.unwrap_or_default())?;
            tree.add(&path, attrs, payload)?;
        }
        Kind::Pipe => {
            tree.add(&path, attrs, Payload::Fifo)?;
        }
        Kind::Sock => {
            tree.add(&path, attrs, Payload::Socket)?;
        }
        Kind::File => {
            let source = extra.unwrap_or(&path);
            let source = resolve_source(source, base_dir);
            tree.add(&path, attrs, Payload::file_from(Some(source)))?;
        }
        Kind::Glob => {
            glob_scan(
                tree, filename, line_num, &path, attrs, keep, extra, base_dir,
            )?;
        }
    }
    Ok(())
}

fn match_keyword(line: &str) -> Option<(&'static Hook, &str)> {
    for hook in HOOKS {
        if let Some(rest) = line.strip_prefix(hook.keyword) {
            if rest.starts_with(char::is_whitespace) {
                return Some((hook, skip_space(rest)));
            }
        }
    }
    None
}

fn skip_space(s: &str) -> &str {
    s.trim_start()
}

/// Parse one path token: up to whitespace, or a `"…"` / `'…'` quoted
/// span. Inside double quotes, `\"` and `\\` unescape.
fn read_str(input: &str) -> Option<(String, &str)> {
    let bytes = input.as_bytes();
    if bytes.first() == Some(&b'"') {
        let mut out = String::new();
        let mut i = 1;
        while i < bytes.len() && bytes[i] != b'"' {
            if bytes[i] == b'\\' && i + 1 < bytes.len() && matches!(bytes[i + 1], b'"' | b'\\') {
                out.push(bytes[i + 1] as char);
                i += 2;
            } else {
                out.push(input[i..].chars().next()?);
                i += input[i..].chars().next()?.len_utf8();
            }
        }
        if i >= bytes.len() {
            return None;
        }
        Some((out, skip_space(&input[i + 1..])))
    } else {
        let end = input
            .find(char::is_whitespace)
            .unwrap_or(input.len());
        if end == 0 {
            return None;
        }
        Some((input[..end].to_owned(), skip_space(&input[end..])))
    }
}

/// Parse an unsigned number in `base`, rejecting overflow past u32.
fn read_number(input: &str, base: u32) -> Option<(u32, &str)> {
    let mut value: u32 = 0;
    let mut digits = 0;
    let mut rest = input;
    for (i, c) in input.char_indices() {
        let Some(d) = c.to_digit(base) else {
            rest = &input[i..];
            break;
        };
        value = value.checked_mul(base)?.checked_add(d)?;
        digits += 1;
        rest = &input[i + c.len_utf8()..];
    }
    if digits == 0 {
        return None;
    }
    // A following non-space character means a malformed field.
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some((value, skip_space(rest)))
}

fn parse_device(filename: &str, line_num: usize, extra: &str) -> Result<Payload> {
    let mut parts = extra.split_whitespace();
    let (Some(kind), Some(major), Some(minor)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(SqshError::format(
            filename,
            line_num,
            "expected '<c|b> major minor'",
        ));
    };
    let major: u32 = major.parse().map_err(|_| {
        SqshError::format(filename, line_num, "expected '<c|b> major minor'")
    })?;
    let minor: u32 = minor.parse().map_err(|_| {
        SqshError::format(filename, line_num, "expected '<c|b> major minor'")
    })?;
    match kind {
        "c" | "C" => Ok(Payload::CharDev { major, minor }),
        "b" | "B" => Ok(Payload::BlockDev { major, minor }),
        other => Err(SqshError::format(
            filename,
            line_num,
            format!("unknown device type '{other}'"),
        )),
    }
}

fn resolve_source(source: &str, base_dir: Option<&Path>) -> PathBuf {
    let path = Path::new(source);
    match base_dir {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    }
}

/// Option table for the glob sublanguage: (option, kind flag to clear,
/// behavior flag to set).
const GLOB_FLAGS: &[(&str, ScanFlags, ScanFlags)] = &[
    ("-type b", ScanFlags::NO_BLK, ScanFlags::empty()),
    ("-type c", ScanFlags::NO_CHR, ScanFlags::empty()),
    ("-type d", ScanFlags::NO_DIR, ScanFlags::empty()),
    ("-type p", ScanFlags::NO_FIFO, ScanFlags::empty()),
    ("-type f", ScanFlags::NO_FILE, ScanFlags::empty()),
    ("-type l", ScanFlags::NO_SLINK, ScanFlags::empty()),
    ("-type s", ScanFlags::NO_SOCK, ScanFlags::empty()),
    ("-xdev", ScanFlags::empty(), ScanFlags::ONE_FILESYSTEM),
    ("-mount", ScanFlags::empty(), ScanFlags::ONE_FILESYSTEM),
    ("-keeptime", ScanFlags::empty(), ScanFlags::KEEP_TIME),
    ("-nonrecursive", ScanFlags::empty(), ScanFlags::NO_RECURSION),
];

#[allow(clippy::too_many_arguments)]
fn glob_scan(
    tree: &mut Tree,
    filename: &str,
    line_num: usize,
    path: &str,
    attrs: NodeAttrs,
    keep: KeepFields,
    extra: Option<&str>,
    base_dir: Option<&Path>,
) -> Result<()> {
    // The glob's attributes are defaults for the scanned entries, not
    // for the target directory: create it with stock attributes when
    // missing, leave it untouched when present.
    let target = match tree.resolve(path) {
        Some(id) => id,
        None => {
            let dir_attrs = NodeAttrs {
                mode: 0o755,
                uid: 0,
                gid: 0,
                mtime: tree.defaults().mtime,
            };
            tree.add(path, dir_attrs, Payload::empty_dir())?
        }
    };
    if !tree.node(target).is_dir() {
        return Err(SqshError::format(
            filename,
            line_num,
            format!("{path} is not a directory"),
        ));
    }
    let prefix = tree
        .path_of(target)
        .trim_start_matches('/')
        .to_owned();

    let mut flags = ScanFlags::empty();
    let mut first_clear = true;
    let mut name_pattern = None;
    let mut rest = extra.unwrap_or("");

    loop {
        rest = rest.trim_start();
        if rest.is_empty() || !rest.starts_with('-') {
            break;
        }
        if let Some(tail) = rest.strip_prefix("--") {
            if tail.is_empty() || tail.starts_with(char::is_whitespace) {
                rest = tail;
                break;
            }
        }

        let mut matched = false;
        for (option, clear, set) in GLOB_FLAGS {
            if let Some(tail) = rest.strip_prefix(option) {
                if !tail.is_empty() && !tail.starts_with(char::is_whitespace) {
                    continue;
                }
                if !clear.is_empty() && first_clear {
                    flags |= ScanFlags::all_kinds();
                    first_clear = false;
                }
                flags &= !*clear;
                flags |= *set;
                rest = tail;
                matched = true;
                break;
            }
        }
        if matched {
            continue;
        }

        let pattern_opt = if rest.starts_with("-name") {
            Some(false)
        } else if rest.starts_with("-path") {
            Some(true)
        } else {
            None
        };
        if let Some(full_path) = pattern_opt {
            let tail = skip_space(&rest[5..]);
            let (raw, remaining) = take_name_token(tail);
            let pattern = glob::Pattern::new(&raw).map_err(|e| {
                SqshError::format(filename, line_num, format!("bad pattern: {e}"))
            })?;
            name_pattern = Some(pattern);
            if full_path {
                flags |= ScanFlags::MATCH_FULL_PATH;
            }
            rest = remaining;
            continue;
        }

        return Err(SqshError::format(filename, line_num, "unknown option"));
    }

    let scan_root = {
        let rest = rest.trim();
        let relative = if rest.is_empty() { "." } else { rest };
        resolve_source(relative, base_dir)
    };

    let cfg = ScanConfig {
        flags: flags | keep_flags(keep),
        defaults: ScanDefaults {
            mtime: tree.defaults().mtime,
            uid: attrs.uid,
            gid: attrs.gid,
            mode: attrs.mode,
        },
        prefix,
        name_pattern,
    };
    scan_into(tree, &scan_root, &cfg)
}

fn keep_flags(keep: KeepFields) -> ScanFlags {
    let mut flags = ScanFlags::empty();
    if keep.mode {
        flags |= ScanFlags::KEEP_MODE;
    }
    if keep.uid {
        flags |= ScanFlags::KEEP_UID;
    }
    if keep.gid {
        flags |= ScanFlags::KEEP_GID;
    }
    flags
}

/// Take one `-name` / `-path` argument: quoted with `"` or `'`, or up to
/// whitespace.
fn take_name_token(input: &str) -> (String, &str) {
    let bytes = input.as_bytes();
    if matches!(bytes.first(), Some(b'"') | Some(b'\'')) {
        let quote = bytes[0];
        let mut i = 1;
        while i < bytes.len() && bytes[i] != quote {
            i += 1;
        }
        let token = input[1..i].to_owned();
        let rest = if i < bytes.len() { &input[i + 1..] } else { "" };
        (token, rest)
    } else {
        let end = input.find(char::is_whitespace).unwrap_or(input.len());
        (input[..end].to_owned(), &input[end..])
    }
}
