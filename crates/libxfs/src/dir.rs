//! Directories.
//!
//! Directory entry manipulation goes through the [`DirOps`] trait so that
//! the namespace code does not depend on the directory format. The only
//! format provided is [`ShortformDir`], which keeps all entries in the
//! literal area of the inode:
//!
//! ```text
//! +-------+-------------+---------+---------+-----+
//! | count | parent: u64 | entry 0 | entry 1 | ... |
//! +-------+-------------+---------+---------+-----+
//! entry: | namelen: u8 | ino: u64 | name |
//! ```
//!
//! Integers are little-endian. `.` and `..` are implicit.

use std::{fmt, sync::Arc};

use log::trace;
use xfs_types::{InodeNo, MAXNAMELEN, SF_HDR_SIZE, sf_entry_size};

use crate::{
    Mount,
    error::{Errno, Result},
    inode::{DataFork, ILogFlags, Inode},
    trans::Trans,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SfEntry {
    pub(crate) name: Vec<u8>,
    pub(crate) ino: InodeNo,
}

/// A short-form directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SfDir {
    parent: InodeNo,
    entries: Vec<SfEntry>,
}

impl SfDir {
    pub(crate) fn new(parent: InodeNo) -> Self {
        Self {
            parent,
            entries: vec![],
        }
    }

    pub(crate) fn parent(&self) -> InodeNo {
        self.parent
    }

    pub(crate) fn entries(&self) -> &[SfEntry] {
        &self.entries
    }

    /// Encoded size in bytes.
    pub(crate) fn size(&self) -> usize {
        SF_HDR_SIZE
            + self
                .entries
                .iter()
                .map(|e| sf_entry_size(e.name.len()))
                .sum::<usize>()
    }

    fn find(&self, name: &[u8]) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    pub(crate) fn encode(&self, out: &mut [u8]) -> Result<()> {
        let count = u8::try_from(self.entries.len()).map_err(|_| Errno::Corrupted)?;
        if self.size() > out.len() {
            return Err(Errno::Corrupted);
        }
        out[0] = count;
        out[1..SF_HDR_SIZE].copy_from_slice(&self.parent.value().to_le_bytes());
        let mut off = SF_HDR_SIZE;
        for e in &self.entries {
            let namelen = u8::try_from(e.name.len()).map_err(|_| Errno::Corrupted)?;
            out[off] = namelen;
            out[off + 1..off + 9].copy_from_slice(&e.ino.value().to_le_bytes());
            out[off + 9..off + 9 + e.name.len()].copy_from_slice(&e.name);
            off += sf_entry_size(e.name.len());
        }
        Ok(())
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        let Some((&count, rest)) = bytes.split_first() else {
            return Err(Errno::Corrupted);
        };
        let Some((parent, mut rest)) = rest.split_first_chunk::<8>() else {
            return Err(Errno::Corrupted);
        };
        let mut entries = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let Some((&namelen, tail)) = rest.split_first() else {
                return Err(Errno::Corrupted);
            };
            let Some((ino, tail)) = tail.split_first_chunk::<8>() else {
                return Err(Errno::Corrupted);
            };
            let namelen = usize::from(namelen);
            if namelen == 0 || tail.len() < namelen {
                return Err(Errno::Corrupted);
            }
            entries.push(SfEntry {
                name: tail[..namelen].to_vec(),
                ino: InodeNo::new(u64::from_le_bytes(*ino)),
            });
            rest = &tail[namelen..];
        }
        Ok(Self {
            parent: InodeNo::new(u64::from_le_bytes(*parent)),
            entries,
        })
    }
}

/// Returns `true` for `.` and `..`.
#[must_use]
pub fn is_dot_or_dotdot(name: &[u8]) -> bool {
    name == b"." || name == b".."
}

/// Checks that `name` can be stored as a directory entry.
pub fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name.contains(&b'/') || name.contains(&0) {
        return Err(Errno::InvalidInput);
    }
    if name.len() > MAXNAMELEN {
        return Err(Errno::InvalidFilename);
    }
    Ok(())
}

/// Directory entry operations.
///
/// Mutating operations are called with the directory locked exclusively and
/// joined to `tp`; they log whatever they change. Lookups need the directory
/// locked in either mode.
pub trait DirOps: Send + Sync + fmt::Debug {
    /// Makes `dp` an empty directory whose parent is `parent`.
    fn init(&self, tp: &mut Trans, dp: &Inode, parent: InodeNo) -> Result<()>;

    /// Returns the inode number `name` refers to in `dp`.
    fn lookup(&self, dp: &Inode, name: &[u8]) -> Result<InodeNo>;

    /// Adds an entry. `total` is the number of blocks reserved for it.
    fn create_name(
        &self,
        tp: &mut Trans,
        dp: &Inode,
        name: &[u8],
        ino: InodeNo,
        total: u64,
    ) -> Result<()>;

    /// Removes the entry `name`, which must refer to `ino`.
    fn remove_name(&self, tp: &mut Trans, dp: &Inode, name: &[u8], ino: InodeNo) -> Result<()>;

    /// Points the existing entry `name` at `ino`.
    fn replace(&self, tp: &mut Trans, dp: &Inode, name: &[u8], ino: InodeNo) -> Result<()>;

    /// Checks that `name` can be added without allocating blocks.
    fn can_enter(&self, dp: &Inode, name: &[u8]) -> Result<()>;

    /// Returns `true` if `dp` has no entries besides `.` and `..`.
    fn is_empty(&self, dp: &Inode) -> bool;
}

/// Directories stored entirely in the inode literal area.
#[derive(Debug)]
pub struct ShortformDir {
    literal_size: usize,
}

impl ShortformDir {
    #[must_use]
    pub fn new(literal_size: usize) -> Self {
        Self { literal_size }
    }

    fn with_sf<T>(dp: &Inode, f: impl FnOnce(&mut SfDir) -> Result<T>) -> Result<T> {
        let mut df = dp.df();
        let sf = df.as_sf_dir_mut().ok_or(Errno::NotADirectory)?;
        let res = f(sf)?;
        let size = sf.size() as u64;
        drop(df);
        dp.core_mut().size = size;
        Ok(res)
    }

    fn log(tp: &mut Trans, dp: &Inode) {
        tp.log_inode(dp, ILogFlags::CORE | ILogFlags::DDATA);
    }
}

impl DirOps for ShortformDir {
    fn init(&self, tp: &mut Trans, dp: &Inode, parent: InodeNo) -> Result<()> {
        debug_assert!(dp.lock.is_excl_locked());
        let sf = SfDir::new(parent);
        dp.core_mut().size = sf.size() as u64;
        *dp.df() = DataFork::Local(sf);
        Self::log(tp, dp);
        Ok(())
    }

    fn lookup(&self, dp: &Inode, name: &[u8]) -> Result<InodeNo> {
        let df = dp.df();
        let sf = df.as_sf_dir().ok_or(Errno::NotADirectory)?;
        match name {
            b"." => Ok(dp.ino()),
            b".." => Ok(sf.parent()),
            _ => sf
                .find(name)
                .map(|i| sf.entries[i].ino)
                .ok_or(Errno::NotFound),
        }
    }

    fn create_name(
        &self,
        tp: &mut Trans,
        dp: &Inode,
        name: &[u8],
        ino: InodeNo,
        _total: u64,
    ) -> Result<()> {
        debug_assert!(dp.lock.is_excl_locked());
        validate_name(name)?;
        if is_dot_or_dotdot(name) {
            return Err(Errno::AlreadyExists);
        }
        let literal_size = self.literal_size;
        Self::with_sf(dp, |sf| {
            if sf.find(name).is_some() {
                return Err(Errno::AlreadyExists);
            }
            if sf.size() + sf_entry_size(name.len()) > literal_size
                || sf.entries.len() >= usize::from(u8::MAX)
            {
                return Err(Errno::StorageFull);
            }
            sf.entries.push(SfEntry {
                name: name.to_vec(),
                ino,
            });
            Ok(())
        })?;
        Self::log(tp, dp);
        Ok(())
    }

    fn remove_name(&self, tp: &mut Trans, dp: &Inode, name: &[u8], ino: InodeNo) -> Result<()> {
        debug_assert!(dp.lock.is_excl_locked());
        Self::with_sf(dp, |sf| {
            let i = sf.find(name).ok_or(Errno::NotFound)?;
            if sf.entries[i].ino != ino {
                return Err(Errno::NotFound);
            }
            sf.entries.remove(i);
            Ok(())
        })?;
        Self::log(tp, dp);
        Ok(())
    }

    fn replace(&self, tp: &mut Trans, dp: &Inode, name: &[u8], ino: InodeNo) -> Result<()> {
        debug_assert!(dp.lock.is_excl_locked());
        Self::with_sf(dp, |sf| {
            if name == b".." {
                sf.parent = ino;
                return Ok(());
            }
            let i = sf.find(name).ok_or(Errno::NotFound)?;
            sf.entries[i].ino = ino;
            Ok(())
        })?;
        Self::log(tp, dp);
        Ok(())
    }

    fn can_enter(&self, dp: &Inode, name: &[u8]) -> Result<()> {
        let df = dp.df();
        let sf = df.as_sf_dir().ok_or(Errno::NotADirectory)?;
        if sf.size() + sf_entry_size(name.len()) > self.literal_size {
            return Err(Errno::StorageFull);
        }
        Ok(())
    }

    fn is_empty(&self, dp: &Inode) -> bool {
        dp.df().as_sf_dir().is_some_and(|sf| sf.entries.is_empty())
    }
}

// Entry points used by the namespace code. They keep the name cache in step
// with the directory contents.

/// Looks up `name` in `dp`, which must be locked.
pub(crate) fn lookup(mount: &Mount, dp: &Inode, name: &[u8]) -> Result<InodeNo> {
    debug_assert!(dp.lock.is_locked());
    if !dp.is_dir() {
        return Err(Errno::NotADirectory);
    }
    if let Some(ino) = mount.name_cache().lookup(dp.ino(), name) {
        return Ok(ino);
    }
    let ino = mount.dir_ops().lookup(dp, name)?;
    if !is_dot_or_dotdot(name) {
        mount.name_cache().enter(dp.ino(), name, ino);
    }
    Ok(ino)
}

pub(crate) fn create_name(
    tp: &mut Trans,
    dp: &Inode,
    name: &[u8],
    ino: InodeNo,
    total: u64,
) -> Result<()> {
    let mount = Arc::clone(tp.mount());
    trace!("dir {}: create {:?} -> {ino}", dp.ino(), name.escape_ascii().to_string());
    mount.dir_ops().create_name(tp, dp, name, ino, total)?;
    mount.name_cache().remove(dp.ino(), name);
    Ok(())
}

pub(crate) fn remove_name(tp: &mut Trans, dp: &Inode, name: &[u8], ino: InodeNo) -> Result<()> {
    let mount = Arc::clone(tp.mount());
    trace!("dir {}: remove {:?}", dp.ino(), name.escape_ascii().to_string());
    mount.dir_ops().remove_name(tp, dp, name, ino)?;
    mount.name_cache().remove(dp.ino(), name);
    Ok(())
}

pub(crate) fn replace(tp: &mut Trans, dp: &Inode, name: &[u8], ino: InodeNo) -> Result<()> {
    let mount = Arc::clone(tp.mount());
    trace!("dir {}: replace {:?} -> {ino}", dp.ino(), name.escape_ascii().to_string());
    mount.dir_ops().replace(tp, dp, name, ino)?;
    mount.name_cache().remove(dp.ino(), name);
    Ok(())
}
