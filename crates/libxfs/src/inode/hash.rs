//! The per-mount inode hash.
//!
//! Each bucket is guarded by its own reader-writer lock and carries a
//! version number bumped on every insertion, so that a lookup which dropped
//! the bucket lock to read an inode from disk can tell whether it has to
//! rescan before inserting.

use std::{
    collections::VecDeque,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use xfs_types::InodeNo;

use super::Inode;
use crate::param::{IHASH_MAX, IHASH_MIN};

#[derive(Debug, Default)]
pub(crate) struct Bucket {
    /// Most recently used first.
    chain: VecDeque<Arc<Inode>>,
    version: u64,
}

impl Bucket {
    pub(crate) fn find(&self, ino: InodeNo) -> Option<&Arc<Inode>> {
        self.chain.iter().find(|ip| ip.ino() == ino)
    }

    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn insert(&mut self, ip: Arc<Inode>) {
        debug_assert!(self.find(ip.ino()).is_none());
        self.chain.push_front(ip);
        self.version += 1;
    }

    /// Removes exactly `ip` from the chain.
    pub(crate) fn remove(&mut self, ip: &Arc<Inode>) -> bool {
        let Some(pos) = self.chain.iter().position(|p| Arc::ptr_eq(p, ip)) else {
            return false;
        };
        self.chain.remove(pos);
        true
    }

    fn promote(&mut self, ip: &Arc<Inode>) {
        if let Some(pos) = self.chain.iter().position(|p| Arc::ptr_eq(p, ip))
            && pos != 0
            && let Some(ip) = self.chain.remove(pos)
        {
            self.chain.push_front(ip);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.chain.len()
    }
}

#[derive(Debug)]
pub(crate) struct InodeHash {
    buckets: Box<[RwLock<Bucket>]>,
}

impl InodeHash {
    /// Picks the bucket count for a filesystem with `inode_max` inodes.
    pub(crate) fn size_for(inode_max: u64) -> usize {
        let size = usize::try_from(inode_max / 4).unwrap_or(IHASH_MAX);
        size.clamp(IHASH_MIN, IHASH_MAX)
    }

    pub(crate) fn init(size: usize) -> Self {
        assert!(size > 0);
        let buckets = (0..size).map(|_| RwLock::default()).collect();
        Self { buckets }
    }

    /// Drops every inode still hashed.
    pub(crate) fn free(&self) {
        for bucket in &self.buckets {
            let mut bucket = bucket.write().unwrap_or_else(PoisonError::into_inner);
            bucket.chain.clear();
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.buckets.len()
    }

    fn index(&self, ino: InodeNo) -> usize {
        let size = self.buckets.len() as u64;
        usize::try_from(ino.value() % size).unwrap_or(0)
    }

    pub(crate) fn read(&self, ino: InodeNo) -> RwLockReadGuard<'_, Bucket> {
        self.buckets[self.index(ino)]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self, ino: InodeNo) -> RwLockWriteGuard<'_, Bucket> {
        self.buckets[self.index(ino)]
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves `ip` to the front of its chain if the bucket is uncontended.
    pub(crate) fn promote(&self, ip: &Arc<Inode>) {
        if let Ok(mut bucket) = self.buckets[self.index(ip.ino())].try_write() {
            bucket.promote(ip);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.read().unwrap_or_else(PoisonError::into_inner).len()).sum()
    }
}
