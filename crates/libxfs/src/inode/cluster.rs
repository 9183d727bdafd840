//! The per-mount cluster hash.
//!
//! Groups in-core inodes by the on-disk cluster buffer holding them so that
//! writeback can flush a whole cluster with one read and one write.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use xfs_types::InodeNo;

use super::Inode;

type Cluster = BTreeMap<InodeNo, Arc<Inode>>;

fn lock(m: &Mutex<HashMap<u64, Cluster>>) -> MutexGuard<'_, HashMap<u64, Cluster>> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub(crate) struct ClusterHash {
    buckets: Box<[Mutex<HashMap<u64, Cluster>>]>,
    /// Serializes writeback of the clusters hashing to the same bucket.
    flush_locks: Box<[Mutex<()>]>,
}

impl ClusterHash {
    /// Picks the bucket count from the inode hash size.
    pub(crate) fn size_for(ihash_size: usize, inodes_per_cluster: u64, min: usize) -> usize {
        let per_cluster = usize::try_from(inodes_per_cluster).unwrap_or(1).max(1);
        (ihash_size / per_cluster).max(min)
    }

    pub(crate) fn init(size: usize) -> Self {
        assert!(size > 0);
        let buckets = (0..size).map(|_| Mutex::default()).collect();
        let flush_locks = (0..size).map(|_| Mutex::default()).collect();
        Self {
            buckets,
            flush_locks,
        }
    }

    pub(crate) fn free(&self) {
        for bucket in &self.buckets {
            lock(bucket).clear();
        }
    }

    fn index(&self, daddr: u64) -> usize {
        let size = self.buckets.len() as u64;
        usize::try_from(daddr % size).unwrap_or(0)
    }

    fn bucket(&self, daddr: u64) -> MutexGuard<'_, HashMap<u64, Cluster>> {
        lock(&self.buckets[self.index(daddr)])
    }

    /// Locks writeback of the cluster at `daddr`.
    pub(crate) fn lock_flush(&self, daddr: u64) -> MutexGuard<'_, ()> {
        self.flush_locks[self.index(daddr)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, ip: &Arc<Inode>) {
        self.bucket(ip.cluster_daddr())
            .entry(ip.cluster_daddr())
            .or_default()
            .insert(ip.ino(), Arc::clone(ip));
    }

    pub(crate) fn remove(&self, ip: &Arc<Inode>) {
        let mut bucket = self.bucket(ip.cluster_daddr());
        let Some(cluster) = bucket.get_mut(&ip.cluster_daddr()) else {
            return;
        };
        if cluster.get(&ip.ino()).is_some_and(|p| Arc::ptr_eq(p, ip)) {
            cluster.remove(&ip.ino());
        }
        if cluster.is_empty() {
            bucket.remove(&ip.cluster_daddr());
        }
    }

    /// Returns the in-core inodes of the cluster at `daddr`.
    pub(crate) fn cluster(&self, daddr: u64) -> Vec<Arc<Inode>> {
        self.bucket(daddr)
            .get(&daddr)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }
}
