//! Inodes in transactions.

use std::sync::Arc;

use xfs_types::InodeNo;

use super::{
    DescId, Trans,
    item::{InodeLogItem, ItemRef, LogItem},
};
use crate::{
    error::Result,
    inode::{ILogFlags, Inode, LockFlags},
};

impl Trans {
    fn ili_mut(&mut self, id: DescId) -> &mut InodeLogItem {
        match &mut self.items.get_mut(id).item {
            LogItem::Inode(ili) => ili,
            LogItem::Buf(_) => panic!("descriptor {id:?} does not hold an inode"),
        }
    }

    /// Joins a locked inode to the transaction.
    ///
    /// The inode must be locked exclusively; the locks in `lock_flags` are
    /// released when the transaction finishes unless [`Self::ihold`] is
    /// called.
    pub fn ijoin(&mut self, ip: &Arc<Inode>, lock_flags: LockFlags) {
        assert_eq!(ip.mount_id(), self.mount.id(), "inode from another mount");
        assert!(
            ip.is_ilocked(LockFlags::ILOCK_EXCL),
            "joining inode {} without holding its lock exclusively",
            ip.ino()
        );
        if let Some(trans) = ip.item_trans() {
            panic!("inode {} is already joined to transaction {trans}", ip.ino());
        }
        self.add_item(LogItem::Inode(InodeLogItem {
            inode: Arc::clone(ip),
            lock_flags,
            hold: false,
            iget_count: 0,
            owns_ref: false,
            saved: Some(ip.snapshot()),
        }));
    }

    /// Keeps `ip` locked past the end of the transaction.
    pub fn ihold(&mut self, ip: &Inode) {
        let id = self.find_item(ItemRef::Inode(ip));
        self.ili_mut(id).hold = true;
    }

    /// Marks the parts of `ip` selected by `flags` as modified.
    pub fn log_inode(&mut self, ip: &Inode, flags: ILogFlags) {
        let id = self.find_item(ItemRef::Inode(ip));
        {
            let mut state = ip.item();
            let last = state.last_fields;
            state.fields |= flags | last;
        }
        self.mark_dirty(id);
    }

    /// Looks up inode `ino` and joins it to the transaction.
    ///
    /// `lock_flags` must include [`LockFlags::ILOCK_EXCL`]. An inode already
    /// joined is returned again without further locking.
    pub fn iget(&mut self, ino: InodeNo, lock_flags: LockFlags) -> Result<Arc<Inode>> {
        assert!(
            lock_flags.contains(LockFlags::ILOCK_EXCL),
            "transaction lookups lock the inode exclusively"
        );
        let mount = Arc::clone(&self.mount);
        if let Some(ip) = mount.inode_incore(ino, self) {
            let id = self.find_item(ItemRef::Inode(&ip));
            let ili = self.ili_mut(id);
            let missing_io = (lock_flags - ili.lock_flags)
                & (LockFlags::IOLOCK_EXCL | LockFlags::IOLOCK_SHARED);
            if !missing_io.is_empty() {
                ip.ilock(missing_io);
                ili.lock_flags |= missing_io;
            }
            ili.iget_count += 1;
            return Ok(ip);
        }

        let ip = mount.iget(Some(&mut *self), ino, lock_flags)?;
        self.ijoin_looked_up(&ip, lock_flags);
        Ok(ip)
    }

    /// Joins a locked inode whose reference is handed over to the
    /// transaction, as if it had been obtained by [`Self::iget`].
    pub(crate) fn ijoin_looked_up(&mut self, ip: &Arc<Inode>, lock_flags: LockFlags) {
        self.ijoin(ip, lock_flags);
        let id = self.find_item(ItemRef::Inode(ip));
        let ili = self.ili_mut(id);
        ili.iget_count = 1;
        ili.owns_ref = true;
    }

    /// Puts back an inode obtained by [`Self::iget`].
    ///
    /// The last put of an unmodified inode detaches, unlocks and releases it.
    pub fn iput(&mut self, ip: &Arc<Inode>, lock_flags: LockFlags) {
        let id = self.find_item(ItemRef::Inode(ip));
        let dirty = self.is_desc_dirty(id);
        let ili = self.ili_mut(id);
        assert!(ili.iget_count > 0, "inode {} was not looked up through the transaction", ip.ino());
        debug_assert!(ili.lock_flags.contains(lock_flags));
        ili.iget_count -= 1;
        if ili.iget_count > 0 || dirty {
            return;
        }
        if let LogItem::Inode(ili) = self.free_item(id) {
            ip.iunlock(ili.lock_flags);
            if ili.owns_ref {
                ip.release();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use xfs_types::InodeNo;

    use crate::{
        inode::{ILogFlags, LockFlags},
        test_utils::TestFs,
        trans::{CancelFlags, CommitFlags, ItemRef, Trans, TransType},
    };

    #[test]
    fn trans_iget_joins_once() {
        let fs = TestFs::new();
        let mut tp = Trans::alloc(&fs.mount, TransType::Setattr);
        let a = tp.iget(InodeNo::new(5), LockFlags::ILOCK_EXCL).unwrap();
        assert_eq!(a.item_trans(), Some(tp.id()));
        assert_eq!(a.refcount(), 1);

        let b = tp.iget(InodeNo::new(5), LockFlags::ILOCK_EXCL).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.refcount(), 1);
        assert_eq!(tp.item_count(), 1);

        tp.iput(&b, LockFlags::ILOCK_EXCL);
        assert_eq!(tp.item_count(), 1);
        tp.iput(&a, LockFlags::ILOCK_EXCL);
        assert_eq!(tp.item_count(), 0);
        assert!(!a.lock.is_locked());
        assert_eq!(a.refcount(), 0);
        tp.cancel(CancelFlags::empty());
    }

    #[test]
    fn inode_incore_sees_only_own_transaction() {
        let fs = TestFs::new();
        let mut tp = Trans::alloc(&fs.mount, TransType::Setattr);
        let other = Trans::alloc(&fs.mount, TransType::Setattr);
        let ip = tp.iget(InodeNo::new(8), LockFlags::ILOCK_EXCL).unwrap();
        assert!(fs.mount.inode_incore(InodeNo::new(8), &tp).is_some());
        assert!(fs.mount.inode_incore(InodeNo::new(8), &other).is_none());
        assert!(fs.mount.inode_incore(InodeNo::new(9), &tp).is_none());
        drop(ip);
        tp.cancel(CancelFlags::empty());
        other.cancel(CancelFlags::empty());
    }

    #[test]
    fn log_inode_carries_unflushed_fields() {
        let fs = TestFs::new();
        let root = fs.mount.root().unwrap();
        root.item().last_fields = ILogFlags::DDATA;

        let mut tp = Trans::alloc(&fs.mount, TransType::Setattr);
        root.ilock(LockFlags::ILOCK_EXCL);
        tp.ijoin(&root, LockFlags::ILOCK_EXCL);
        tp.log_inode(&root, ILogFlags::CORE);
        assert_eq!(root.item().fields, ILogFlags::CORE | ILogFlags::DDATA);
        let _ = tp.find_item(ItemRef::Inode(&root));
        tp.commit(CommitFlags::empty()).unwrap();
        assert!(!root.needs_flush());
        fs.mount.iput(root, LockFlags::empty());
    }

    #[test]
    fn held_inode_stays_locked() {
        let fs = TestFs::new();
        let root = fs.mount.root().unwrap();
        let mut tp = Trans::alloc(&fs.mount, TransType::Setattr);
        root.ilock(LockFlags::ILOCK_EXCL);
        tp.ijoin(&root, LockFlags::ILOCK_EXCL);
        tp.ihold(&root);
        tp.log_inode(&root, ILogFlags::CORE);
        tp.commit(CommitFlags::empty()).unwrap();
        assert!(root.is_ilocked(LockFlags::ILOCK_EXCL));
        assert!(root.item_trans().is_none());
        fs.mount.iput(root, LockFlags::ILOCK_EXCL);
    }

    #[test]
    #[should_panic(expected = "without holding its lock exclusively")]
    fn joining_unlocked_inode_panics() {
        let fs = TestFs::new();
        let root = fs.mount.root().unwrap();
        let mut tp = Trans::alloc(&fs.mount, TransType::Setattr);
        tp.ijoin(&root, LockFlags::ILOCK_EXCL);
    }
}
