//! Prototype files describing the initial contents of an image.
//!
//! One entry per line: `d PATH` creates a directory, `f PATH` an empty
//! regular file. Blank lines and lines starting with `#` are ignored.
//! Parents must be listed before their children.

use std::sync::Arc;

use anyhow::{Context as _, bail};
use libxfs::{LockFlags, Mount, ops, path};
use log::debug;
use xfs_types::S_IFREG;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub kind: EntryKind,
    pub path: String,
}

pub fn parse(text: &str) -> anyhow::Result<Vec<Entry>> {
    let mut entries = vec![];
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((kind, path)) = line.split_once(char::is_whitespace) else {
            bail!("line {}: missing path", lineno + 1);
        };
        let kind = match kind {
            "d" => EntryKind::Dir,
            "f" => EntryKind::File,
            _ => bail!("line {}: unknown entry type {kind:?}", lineno + 1),
        };
        entries.push(Entry {
            kind,
            path: path.trim().to_owned(),
        });
    }
    Ok(entries)
}

/// Creates every entry of `entries` on `mount`.
pub fn populate(mount: &Arc<Mount>, entries: &[Entry]) -> anyhow::Result<()> {
    for entry in entries {
        let (dp, name) = path::resolve_parent(mount, entry.path.as_bytes())
            .with_context(|| format!("resolving parent of {}", entry.path))?;
        let res = match entry.kind {
            EntryKind::Dir => ops::mkdir(mount, &dp, name, 0o755),
            EntryKind::File => ops::create(mount, &dp, name, S_IFREG | 0o644),
        };
        mount.iput(dp, LockFlags::empty());
        let ip = res.with_context(|| format!("creating {}", entry.path))?;
        debug!("{}: inode {}", entry.path, ip.ino());
        mount.iput(ip, LockFlags::empty());
    }
    Ok(())
}
