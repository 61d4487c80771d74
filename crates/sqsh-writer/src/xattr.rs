//! Xattr indexing.
//!
//! Each distinct set of (key, value) pairs is stored once. A per-node
//! record is bracketed by `begin` and `end`: pairs accumulate in between,
//! and `end` canonicalizes the set (namespace tag resolved, sorted by
//! key, duplicates rejected), deduplicates it against previously stored
//! sets, and returns the node's index.

use sqsh_error::{Result, SqshError};
use sqsh_types::XATTR_NONE;
use std::collections::HashMap;

/// One canonicalized pair: namespace tag, key without prefix, value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct XattrPair {
    pub ns_tag: u16,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Split a full key (`user.foo`, …) into its namespace tag and the
/// remainder stored on disk.
pub fn split_key(full: &str) -> Result<(u16, &str)> {
    for (prefix, tag) in sqsh_ondisk::XATTR_PREFIXES {
        if let Some(rest) = full.strip_prefix(prefix) {
            if rest.is_empty() {
                return Err(SqshError::Limit(format!(
                    "xattr key '{full}' is empty after its namespace prefix"
                )));
            }
            return Ok((*tag, rest));
        }
    }
    Err(SqshError::Limit(format!(
        "xattr key '{full}' has no recognized namespace prefix"
    )))
}

/// Collects xattr sets and assigns indices.
#[derive(Debug, Default)]
pub struct XattrWriter {
    sets: Vec<Vec<XattrPair>>,
    lookup: HashMap<Vec<XattrPair>, u32>,
    pending: Option<Vec<XattrPair>>,
}

impl XattrWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a per-node record.
    pub fn begin(&mut self) -> Result<()> {
        if self.pending.is_some() {
            return Err(SqshError::Internal(
                "xattr record opened twice without end".into(),
            ));
        }
        self.pending = Some(Vec::new());
        Ok(())
    }

    /// Add one pair to the open record.
    pub fn add(&mut self, full_key: &str, value: &[u8]) -> Result<()> {
        let (ns_tag, key) = split_key(full_key)?;
        let Some(pending) = self.pending.as_mut() else {
            return Err(SqshError::Internal(
                "xattr pair added outside begin/end".into(),
            ));
        };
        pending.push(XattrPair {
            ns_tag,
            key: key.as_bytes().to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    /// Close the record: canonicalize, dedup, and hand out the index.
    /// An empty record yields `XATTR_NONE`.
    pub fn end(&mut self) -> Result<u32> {
        let Some(mut pending) = self.pending.take() else {
            return Err(SqshError::Internal("xattr end without begin".into()));
        };
        if pending.is_empty() {
            return Ok(XATTR_NONE);
        }

        pending.sort_by(|a, b| (a.ns_tag, &a.key).cmp(&(b.ns_tag, &b.key)));
        for pair in pending.windows(2) {
            if pair[0].ns_tag == pair[1].ns_tag && pair[0].key == pair[1].key {
                return Err(SqshError::Limit(format!(
                    "duplicate xattr key '{}' in one record",
                    String::from_utf8_lossy(&pair[0].key)
                )));
            }
        }

        if let Some(index) = self.lookup.get(&pending) {
            return Ok(*index);
        }
        let index = u32::try_from(self.sets.len())
            .map_err(|_| SqshError::Limit("more than 2^32 xattr sets".into()))?;
        self.lookup.insert(pending.clone(), index);
        self.sets.push(pending);
        Ok(index)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Stored sets in index order.
    #[must_use]
    pub fn sets(&self) -> &[Vec<XattrPair>] {
        &self.sets
    }
}
