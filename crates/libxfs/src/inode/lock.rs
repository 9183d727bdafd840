//! Inode lock flag protocol.
//!
//! Every inode has two multi-reader locks (the I/O lock and the inode lock)
//! and a binary flush lock. Callers pass a combination of [`LockFlags`]; when
//! both locks are requested the I/O lock is always taken first.

use std::sync::Arc;

use bitflags::bitflags;

use super::{DataFork, Inode};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LockFlags: u32 {
        const IOLOCK_EXCL = 0x1;
        const IOLOCK_SHARED = 0x2;
        const ILOCK_EXCL = 0x4;
        const ILOCK_SHARED = 0x8;
    }
}

impl LockFlags {
    fn check(self) {
        assert!(
            !self.contains(Self::IOLOCK_EXCL | Self::IOLOCK_SHARED),
            "both I/O lock modes requested"
        );
        assert!(
            !self.contains(Self::ILOCK_EXCL | Self::ILOCK_SHARED),
            "both inode lock modes requested"
        );
    }
}

impl Inode {
    /// Acquires the locks selected by `flags`, blocking as needed.
    pub fn ilock(&self, flags: LockFlags) {
        flags.check();
        if flags.contains(LockFlags::IOLOCK_EXCL) {
            self.iolock.acquire_excl();
        } else if flags.contains(LockFlags::IOLOCK_SHARED) {
            self.iolock.acquire_shared();
        }
        if flags.contains(LockFlags::ILOCK_EXCL) {
            self.lock.acquire_excl();
        } else if flags.contains(LockFlags::ILOCK_SHARED) {
            self.lock.acquire_shared();
        }
    }

    /// Tries to acquire the locks selected by `flags` without blocking.
    ///
    /// Returns `false` with nothing held if either lock is unavailable.
    #[must_use]
    pub fn ilock_nowait(&self, flags: LockFlags) -> bool {
        flags.check();
        let io_taken = if flags.contains(LockFlags::IOLOCK_EXCL) {
            self.iolock.try_acquire_excl()
        } else if flags.contains(LockFlags::IOLOCK_SHARED) {
            self.iolock.try_acquire_shared()
        } else {
            true
        };
        if !io_taken {
            return false;
        }

        let i_taken = if flags.contains(LockFlags::ILOCK_EXCL) {
            self.lock.try_acquire_excl()
        } else if flags.contains(LockFlags::ILOCK_SHARED) {
            self.lock.try_acquire_shared()
        } else {
            true
        };
        if !i_taken {
            if flags.contains(LockFlags::IOLOCK_EXCL) {
                self.iolock.release_excl();
            } else if flags.contains(LockFlags::IOLOCK_SHARED) {
                self.iolock.release_shared();
            }
            return false;
        }
        true
    }

    /// Releases the locks selected by `flags`.
    ///
    /// Only lock waiters are woken. Log items never wait for an inode to be
    /// unlocked, so there is nobody else to notify.
    pub fn iunlock(&self, flags: LockFlags) {
        flags.check();
        if flags.contains(LockFlags::IOLOCK_EXCL) {
            self.iolock.release_excl();
        } else if flags.contains(LockFlags::IOLOCK_SHARED) {
            self.iolock.release_shared();
        }
        if flags.contains(LockFlags::ILOCK_EXCL) {
            self.lock.release_excl();
        } else if flags.contains(LockFlags::ILOCK_SHARED) {
            self.lock.release_shared();
        }
    }

    /// Downgrades the exclusive locks in `flags` to shared.
    pub fn ilock_demote(&self, flags: LockFlags) {
        assert!(
            (flags - (LockFlags::ILOCK_EXCL | LockFlags::IOLOCK_EXCL)).is_empty(),
            "only exclusive locks can be demoted"
        );
        if flags.contains(LockFlags::ILOCK_EXCL) {
            self.lock.demote();
        }
        if flags.contains(LockFlags::IOLOCK_EXCL) {
            self.iolock.demote();
        }
    }

    /// Locks the inode for reading its block map.
    ///
    /// The lock is taken exclusively when a btree-format extent map still has
    /// to be read in. Returns the mode taken, to be passed to
    /// [`Self::iunlock_map_shared`].
    pub fn ilock_map_shared(&self) -> LockFlags {
        let mode = match &*self.df() {
            DataFork::Btree { loaded: false } => LockFlags::ILOCK_EXCL,
            _ => LockFlags::ILOCK_SHARED,
        };
        self.ilock(mode);
        mode
    }

    pub fn iunlock_map_shared(&self, mode: LockFlags) {
        self.iunlock(mode);
    }

    /// Returns `true` if the inode lock is held in at least the modes of `flags`.
    #[must_use]
    pub fn is_ilocked(&self, flags: LockFlags) -> bool {
        if flags.contains(LockFlags::ILOCK_EXCL) && !self.lock.is_excl_locked() {
            return false;
        }
        if flags.contains(LockFlags::ILOCK_SHARED) && !self.lock.is_locked() {
            return false;
        }
        if flags.contains(LockFlags::IOLOCK_EXCL) && !self.iolock.is_excl_locked() {
            return false;
        }
        if flags.contains(LockFlags::IOLOCK_SHARED) && !self.iolock.is_locked() {
            return false;
        }
        true
    }

    /// Acquires the flush lock.
    pub fn iflock(&self) {
        self.flock.p();
    }

    #[must_use]
    pub fn iflock_nowait(&self) -> bool {
        self.flock.cp()
    }

    pub fn ifunlock(&self) {
        self.flock.v();
    }
}

/// Sorts `inodes` by ascending inode number.
///
/// Entries referring to the same inode end up adjacent.
pub fn sort_inodes(inodes: &mut [Arc<Inode>]) {
    // Insertion order is kept for equal keys; the arrays are tiny.
    let n = inodes.len();
    for i in 0..n {
        for j in 0..n - 1 - i {
            if inodes[j].ino() > inodes[j + 1].ino() {
                inodes.swap(j, j + 1);
            }
        }
    }
}

pub(crate) fn distinct(inodes: &[Arc<Inode>]) -> impl Iterator<Item = &Arc<Inode>> {
    inodes
        .iter()
        .enumerate()
        .filter(|(i, ip)| *i == 0 || !Arc::ptr_eq(ip, &inodes[i - 1]))
        .map(|(_, ip)| ip)
}

/// Locks every distinct inode of a sorted array in order.
pub fn lock_inodes(inodes: &[Arc<Inode>], flags: LockFlags) {
    debug_assert!(inodes.is_sorted_by_key(|ip| ip.ino()));
    for ip in distinct(inodes) {
        ip.ilock(flags);
    }
}

/// Unlocks every distinct inode of a sorted array.
pub fn unlock_inodes(inodes: &[Arc<Inode>], flags: LockFlags) {
    for ip in distinct(inodes) {
        ip.iunlock(flags);
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use xfs_types::InodeNo;

    use super::*;
    use crate::test_utils::TestFs;

    #[test]
    fn nowait_rolls_back_io_lock() {
        let fs = TestFs::new();
        let ip = fs.mount.root().unwrap();
        ip.ilock(LockFlags::ILOCK_EXCL);
        assert!(!ip.ilock_nowait(LockFlags::IOLOCK_EXCL | LockFlags::ILOCK_SHARED));
        // The I/O lock must have been released again.
        assert!(!ip.iolock.is_locked());
        ip.iunlock(LockFlags::ILOCK_EXCL);

        assert!(ip.ilock_nowait(LockFlags::IOLOCK_EXCL | LockFlags::ILOCK_SHARED));
        assert!(ip.is_ilocked(LockFlags::IOLOCK_EXCL | LockFlags::ILOCK_SHARED));
        ip.iunlock(LockFlags::IOLOCK_EXCL | LockFlags::ILOCK_SHARED);
        fs.mount.iput(ip, LockFlags::empty());
    }

    #[test]
    fn unlock_wakes_lock_waiter() {
        let fs = TestFs::new();
        let ip = fs.mount.root().unwrap();
        ip.ilock(LockFlags::ILOCK_EXCL);
        let waiter = {
            let ip = Arc::clone(&ip);
            thread::spawn(move || {
                ip.ilock(LockFlags::ILOCK_SHARED);
                ip.iunlock(LockFlags::ILOCK_SHARED);
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        ip.iunlock(LockFlags::ILOCK_EXCL);
        waiter.join().unwrap();
        assert!(!ip.lock.is_locked());
        fs.mount.iput(ip, LockFlags::empty());
    }

    #[test]
    fn demote_lets_readers_in() {
        let fs = TestFs::new();
        let ip = fs.mount.root().unwrap();
        ip.ilock(LockFlags::ILOCK_EXCL | LockFlags::IOLOCK_EXCL);
        ip.ilock_demote(LockFlags::ILOCK_EXCL);
        assert!(ip.ilock_nowait(LockFlags::ILOCK_SHARED));
        assert!(!ip.ilock_nowait(LockFlags::IOLOCK_SHARED));
        ip.iunlock(LockFlags::ILOCK_SHARED);
        ip.iunlock(LockFlags::ILOCK_SHARED | LockFlags::IOLOCK_EXCL);
        assert!(!ip.lock.is_locked());
        fs.mount.iput(ip, LockFlags::empty());
    }

    #[test]
    fn map_shared_is_exclusive_for_unloaded_btree() {
        let fs = TestFs::new();
        let ip = fs.mount.root().unwrap();
        assert_eq!(ip.ilock_map_shared(), LockFlags::ILOCK_SHARED);
        ip.iunlock_map_shared(LockFlags::ILOCK_SHARED);

        *ip.df() = DataFork::Btree { loaded: false };
        let mode = ip.ilock_map_shared();
        assert_eq!(mode, LockFlags::ILOCK_EXCL);
        ip.load_extents();
        ip.iunlock_map_shared(mode);
        assert_eq!(ip.ilock_map_shared(), LockFlags::ILOCK_SHARED);
        ip.iunlock_map_shared(LockFlags::ILOCK_SHARED);
        fs.mount.iput(ip, LockFlags::empty());
    }

    #[test]
    fn flush_lock_excludes() {
        let fs = TestFs::new();
        let ip = fs.mount.root().unwrap();
        ip.iflock();
        assert!(!ip.iflock_nowait());
        let waiter = {
            let ip = Arc::clone(&ip);
            thread::spawn(move || {
                ip.iflock();
                ip.ifunlock();
            })
        };
        thread::sleep(Duration::from_millis(20));
        ip.ifunlock();
        waiter.join().unwrap();
        assert!(ip.iflock_nowait());
        ip.ifunlock();
        fs.mount.iput(ip, LockFlags::empty());
    }

    #[test]
    fn sort_groups_duplicates() {
        let fs = TestFs::new();
        let a = fs.mount.iget(None, InodeNo::new(5), LockFlags::empty()).unwrap();
        let b = fs.mount.iget(None, InodeNo::new(3), LockFlags::empty()).unwrap();
        let mut v = vec![Arc::clone(&a), Arc::clone(&b), Arc::clone(&a)];
        sort_inodes(&mut v);
        let inos: Vec<_> = v.iter().map(|ip| ip.ino().value()).collect();
        assert_eq!(inos, [3, 5, 5]);

        lock_inodes(&v, LockFlags::ILOCK_EXCL);
        assert!(a.is_ilocked(LockFlags::ILOCK_EXCL));
        unlock_inodes(&v, LockFlags::ILOCK_EXCL);
        assert!(!a.lock.is_locked());
        assert!(!b.lock.is_locked());
        fs.mount.iput(a, LockFlags::empty());
        fs.mount.iput(b, LockFlags::empty());
    }
}
