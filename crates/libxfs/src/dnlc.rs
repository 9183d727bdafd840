//! Directory name lookup cache.
//!
//! Maps `(directory, name)` to the inode number the entry refers to.
//! Entries are added by lookups made under the directory lock and dropped by
//! every change of the entry, so a hit is always current.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use log::trace;
use xfs_types::InodeNo;

#[derive(Debug)]
pub struct NameCache {
    capacity: usize,
    map: Mutex<HashMap<(InodeNo, Vec<u8>), InodeNo>>,
}

impl NameCache {
    /// Creates a cache of at most `capacity` entries; zero disables it.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: Mutex::default(),
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<(InodeNo, Vec<u8>), InodeNo>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn lookup(&self, dir: InodeNo, name: &[u8]) -> Option<InodeNo> {
        self.map().get(&(dir, name.to_vec())).copied()
    }

    pub fn enter(&self, dir: InodeNo, name: &[u8], ino: InodeNo) {
        if self.capacity == 0 {
            return;
        }
        let mut map = self.map();
        if map.len() >= self.capacity {
            trace!("name cache full, flushing {} entries", map.len());
            map.clear();
        }
        map.insert((dir, name.to_vec()), ino);
    }

    pub fn remove(&self, dir: InodeNo, name: &[u8]) {
        self.map().remove(&(dir, name.to_vec()));
    }

    /// Drops every entry naming `ino` or living in directory `ino`.
    pub fn purge_inode(&self, ino: InodeNo) {
        self.map()
            .retain(|(dir, _), target| *dir != ino && *target != ino);
    }

    pub fn purge_all(&self) {
        self.map().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}
