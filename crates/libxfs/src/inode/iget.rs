//! Inode cache lookup and reclaim.

use std::{sync::Arc, thread};

use log::{debug, trace};
use xfs_types::InodeNo;

use super::{Inode, LockFlags};
use crate::{
    Mount,
    error::{Errno, Result},
    trans::Trans,
};

impl Mount {
    /// Looks up inode `ino`, reading it from disk if it is not in core.
    ///
    /// Returns the inode with a reference held and the locks in `lock_flags`
    /// acquired. There is never more than one in-core inode per inode number:
    /// two racing misses for the same inode both read it but only the first
    /// one to insert wins, and the other retries the lookup.
    ///
    /// When `tp` is given the inode cluster is read through it.
    pub fn iget(
        &self,
        mut tp: Option<&mut Trans>,
        ino: InodeNo,
        lock_flags: LockFlags,
    ) -> Result<Arc<Inode>> {
        loop {
            let (found, version) = {
                let bucket = self.ihash().read(ino);
                (bucket.find(ino).map(Arc::clone), bucket.version())
            };

            if let Some(ip) = found {
                self.ihash().promote(&ip);
                if !ip.grab() {
                    // Being reclaimed; wait for it to leave the hash.
                    self.stats().iget_restarts.inc();
                    thread::yield_now();
                    continue;
                }
                self.stats().iget_hits.inc();
                ip.ilock(lock_flags);
                return Ok(ip);
            }

            self.stats().iget_misses.inc();
            let ip = Arc::new(Inode::read(self, tp.as_deref_mut(), ino)?);
            ip.ilock(lock_flags);

            let mut bucket = self.ihash().write(ino);
            if bucket.version() != version && bucket.find(ino).is_some() {
                drop(bucket);
                trace!("iget: lost insertion race for inode {ino}");
                self.stats().iget_dups.inc();
                ip.iunlock(lock_flags);
                continue;
            }
            bucket.insert(Arc::clone(&ip));
            self.chash().insert(&ip);
            self.inode_list().insert(ino, Arc::clone(&ip));
            drop(bucket);
            return Ok(ip);
        }
    }

    /// Returns the in-core inode `ino` if it is joined to `tp`.
    ///
    /// No reference is taken; the transaction already owns one.
    #[must_use]
    pub fn inode_incore(&self, ino: InodeNo, tp: &Trans) -> Option<Arc<Inode>> {
        let bucket = self.ihash().read(ino);
        let ip = bucket.find(ino)?;
        (ip.item_trans() == Some(tp.id())).then(|| Arc::clone(ip))
    }

    /// Releases the locks in `lock_flags` and one reference.
    pub fn iput(&self, ip: Arc<Inode>, lock_flags: LockFlags) {
        ip.iunlock(lock_flags);
        ip.release();
    }

    /// Removes an unreferenced inode from the cache.
    ///
    /// Fails with [`Errno::ResourceBusy`] while a reference is held.
    pub fn ireclaim(&self, ip: Arc<Inode>) -> Result<()> {
        if !ip.start_reclaim() {
            return Err(Errno::ResourceBusy);
        }
        assert!(
            ip.item_trans().is_none(),
            "reclaiming inode {} joined to a transaction",
            ip.ino()
        );

        // Wait out anybody still holding a lock on it.
        let flags = LockFlags::ILOCK_EXCL | LockFlags::IOLOCK_EXCL;
        ip.ilock(flags);
        ip.iunlock(flags);

        self.iextract(&ip);
        self.stats().reclaims.inc();
        debug!("reclaimed inode {}", ip.ino());
        Ok(())
    }

    /// Unlinks `ip` from the inode hash, the cluster hash and the mount list.
    ///
    /// # Panics
    ///
    /// Panics if the inode is not hashed.
    pub(crate) fn iextract(&self, ip: &Arc<Inode>) {
        let ino = ip.ino();
        let mut bucket = self.ihash().write(ino);
        assert!(bucket.remove(ip), "inode {ino} is not in the inode hash");
        self.chash().remove(ip);
        let mut list = self.inode_list();
        assert!(
            list.get(&ino).is_some_and(|p| Arc::ptr_eq(p, ip)),
            "inode {ino} is not in the mount inode list"
        );
        list.remove(&ino);
    }

    /// Reclaims every unreferenced inode that needs no writeback.
    ///
    /// Returns the number of inodes reclaimed.
    pub fn reclaim_inactive(&self) -> usize {
        let candidates: Vec<_> = self.inode_list().values().cloned().collect();
        let mut reclaimed = 0;
        for ip in candidates {
            if ip.refcount() > 0 || ip.needs_flush() {
                continue;
            }
            if self.ireclaim(ip).is_ok() {
                reclaimed += 1;
            }
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;
    use crate::test_utils::TestFs;

    #[test]
    fn iget_returns_the_same_inode() {
        let fs = TestFs::new();
        let a = fs.mount.iget(None, InodeNo::new(7), LockFlags::empty()).unwrap();
        let b = fs.mount.iget(None, InodeNo::new(7), LockFlags::empty()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.refcount(), 2);
        let stats = fs.mount.stats().snapshot();
        assert_eq!(stats.iget_hits, 1);
        fs.mount.iput(a, LockFlags::empty());
        fs.mount.iput(b, LockFlags::empty());
    }

    #[test]
    fn concurrent_misses_yield_one_inode() {
        let fs = TestFs::new();
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mount = Arc::clone(&fs.mount);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    mount.iget(None, InodeNo::new(9), LockFlags::empty()).unwrap()
                })
            })
            .collect();
        let inodes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for ip in &inodes[1..] {
            assert!(Arc::ptr_eq(&inodes[0], ip));
        }
        assert_eq!(inodes[0].refcount(), 8);
        assert_eq!(fs.mount.ihash().read(InodeNo::new(9)).len(), 1);
        for ip in inodes {
            fs.mount.iput(ip, LockFlags::empty());
        }
    }

    #[test]
    fn cache_hit_leaves_free_inode_alone() {
        let fs = TestFs::new();
        let ip = fs.mount.iget(None, InodeNo::new(7), LockFlags::empty()).unwrap();
        assert!(ip.is_free());
        ip.ilock(LockFlags::ILOCK_EXCL);
        ip.bump_generation();
        let gen_ = ip.generation();

        // A lookup that does not lock must not touch an inode held by others.
        let again = fs.mount.iget(None, InodeNo::new(7), LockFlags::empty()).unwrap();
        assert_eq!(again.generation(), gen_);
        fs.mount.iput(again, LockFlags::empty());
        fs.mount.iput(ip, LockFlags::ILOCK_EXCL);
    }

    #[test]
    fn iget_acquires_requested_locks() {
        let fs = TestFs::new();
        let ip = fs.mount.iget(None, InodeNo::new(4), LockFlags::ILOCK_EXCL).unwrap();
        assert!(ip.is_ilocked(LockFlags::ILOCK_EXCL));
        fs.mount.iput(ip, LockFlags::ILOCK_EXCL);
    }

    #[test]
    fn invalid_inode_number() {
        let fs = TestFs::new();
        let err = fs.mount.iget(None, InodeNo::new(0), LockFlags::empty()).unwrap_err();
        assert_eq!(err, Errno::InvalidInput);
    }

    #[test]
    fn reclaim_refuses_referenced_inode() {
        let fs = TestFs::new();
        let ip = fs.mount.iget(None, InodeNo::new(6), LockFlags::empty()).unwrap();
        assert_eq!(fs.mount.ireclaim(Arc::clone(&ip)), Err(Errno::ResourceBusy));
        fs.mount.iput(Arc::clone(&ip), LockFlags::empty());

        fs.mount.ireclaim(Arc::clone(&ip)).unwrap();
        assert!(fs.mount.ihash().read(InodeNo::new(6)).find(InodeNo::new(6)).is_none());
        assert!(!fs.mount.inode_list().contains_key(&InodeNo::new(6)));

        // A fresh lookup builds a new inode.
        let again = fs.mount.iget(None, InodeNo::new(6), LockFlags::empty()).unwrap();
        assert!(!Arc::ptr_eq(&ip, &again));
        fs.mount.iput(again, LockFlags::empty());
    }

    #[test]
    fn reclaim_inactive_keeps_referenced() {
        let fs = TestFs::new();
        let held = fs.mount.iget(None, InodeNo::new(10), LockFlags::empty()).unwrap();
        let idle = fs.mount.iget(None, InodeNo::new(11), LockFlags::empty()).unwrap();
        fs.mount.iput(idle, LockFlags::empty());

        assert!(fs.mount.reclaim_inactive() >= 1);
        assert!(fs.mount.inode_list().contains_key(&InodeNo::new(10)));
        assert!(!fs.mount.inode_list().contains_key(&InodeNo::new(11)));
        fs.mount.iput(held, LockFlags::empty());
    }

    #[test]
    #[should_panic(expected = "is not in the inode hash")]
    fn extracting_unhashed_inode_panics() {
        let fs = TestFs::new();
        let ip = fs.mount.iget(None, InodeNo::new(12), LockFlags::empty()).unwrap();
        fs.mount.iextract(&ip);
        fs.mount.iextract(&ip);
    }
}
