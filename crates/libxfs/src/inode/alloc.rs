use std::sync::{Arc, atomic::Ordering};

use log::{debug, trace};
use xfs_types::InodeNo;

use super::{DataFork, ILogFlags, Inode, LockFlags, now};
use crate::{
    Mount,
    error::{Errno, Result},
    trans::{SbField, Trans},
};

impl Mount {
    /// Allocates an inode with `mode` and joins it to `tp`.
    ///
    /// The new inode is returned locked exclusively with a link count of
    /// zero and an empty extent-format data fork.
    ///
    /// Candidates are locked without blocking. An inode locked by someone
    /// else is in use and is skipped, so the scan never waits on an inode
    /// lock out of inode number order.
    pub fn ialloc(&self, tp: &mut Trans, mode: u16) -> Result<Arc<Inode>> {
        assert_ne!(mode, 0, "allocating inode without a mode");
        loop {
            let ino = InodeNo::new(self.ino_cursor().fetch_add(1, Ordering::Relaxed));
            if !self.geometry().is_valid_ino(ino) {
                self.ino_cursor().fetch_sub(1, Ordering::Relaxed);
                return Err(Errno::StorageFull);
            }

            let ip = self.iget(Some(&mut *tp), ino, LockFlags::empty())?;
            if !ip.ilock_nowait(LockFlags::ILOCK_EXCL) {
                trace!("ialloc: inode {ino} is busy");
                self.iput(ip, LockFlags::empty());
                continue;
            }
            if !ip.is_free() {
                self.iput(ip, LockFlags::ILOCK_EXCL);
                continue;
            }
            ip.reinit_if_new();
            tp.ijoin_looked_up(&ip, LockFlags::ILOCK_EXCL);

            let now = now();
            {
                let mut core = ip.core_mut();
                core.mode = mode;
                core.generation = core.generation.wrapping_add(1);
                core.atime = now;
                core.mtime = now;
                core.ctime = now;
            }
            *ip.df() = DataFork::Extents;

            tp.mod_sb(SbField::Icount, 1);
            tp.log_inode(&ip, ILogFlags::CORE);
            debug!("allocated inode {ino} mode {mode:o}");
            return Ok(ip);
        }
    }
}
