//! Transactions.
//!
//! A [`Trans`] collects the buffers and inodes modified by one filesystem
//! operation. Nothing is journaled: committing a dirty transaction applies
//! its superblock deltas and writes every dirty buffer and inode straight to
//! the device. Cancelling releases everything, and with
//! [`CancelFlags::ABORT`] discards the in-core changes of dirty inodes by
//! re-reading them from disk.
//!
//! Items are tracked through descriptors living in fixed-size chunks (see
//! [`DescId`]). The first chunk is always resident; further chunks are
//! allocated when the transaction grows and released once empty.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bitflags::bitflags;
use log::{debug, trace, warn};

pub use self::{chunk::DescId, item::ItemRef};
pub(crate) use self::{
    chunk::{DescArena, DescFlags},
    item::{BufLogItem, InodeLogItem, LogItem},
};
use crate::{
    Mount,
    error::{Errno, Result},
    inode::Inode,
};

mod buf;
mod chunk;
mod inode;
mod item;

/// Transaction identifier, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransId(u64);

impl fmt::Display for TransId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

static NEXT_TRANS_ID: AtomicU64 = AtomicU64::new(1);

/// Commit sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Returned by commits that had nothing to write.
    pub const NULL: Self = Self(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum TransType {
    Create,
    Mkdir,
    Link,
    Remove,
    Rename,
    Setattr,
    Mkfs,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransFlags: u32 {
        /// Something was logged.
        const DIRTY = 0x01;
        /// Superblock counters were changed.
        const SB_DIRTY = 0x02;
        /// Holds a permanent log reservation.
        const PERM_LOG_RES = 0x04;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReserveFlags: u32 {
        const PERM_LOG_RES = 0x04;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommitFlags: u32 {
        const RELEASE_LOG_RES = 0x04;
        const SYNC = 0x08;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CancelFlags: u32 {
        const RELEASE_LOG_RES = 0x04;
        /// Discard the changes of dirty items.
        const ABORT = 0x10;
    }
}

/// Superblock counters a transaction can change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SbField {
    Icount,
    Ifree,
    Fdblocks,
    Frextents,
}

/// Pending superblock counter changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SbDeltas {
    pub icount: i64,
    pub ifree: i64,
    pub fdblocks: i64,
    pub frextents: i64,
}

/// A transaction.
pub struct Trans {
    id: TransId,
    mount: Arc<Mount>,
    ty: TransType,
    flags: TransFlags,
    blk_res: u64,
    rtx_res: u64,
    log_res: u32,
    log_count: u32,
    deltas: SbDeltas,
    items: DescArena,
    finished: bool,
}

impl fmt::Debug for Trans {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trans")
            .field("id", &self.id)
            .field("ty", &self.ty)
            .field("flags", &self.flags)
            .field("blk_res", &self.blk_res)
            .field("rtx_res", &self.rtx_res)
            .field("log_res", &self.log_res)
            .field("log_count", &self.log_count)
            .field("deltas", &self.deltas)
            .field("items", &self.items.occupied_count())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Trans {
    /// Starts an empty transaction on `mount`.
    #[must_use]
    pub fn alloc(mount: &Arc<Mount>, ty: TransType) -> Self {
        let id = TransId(NEXT_TRANS_ID.fetch_add(1, Ordering::Relaxed));
        trace!("trans {id}: alloc {ty}");
        Self {
            id,
            mount: Arc::clone(mount),
            ty,
            flags: TransFlags::empty(),
            blk_res: 0,
            rtx_res: 0,
            log_res: 0,
            log_count: 0,
            deltas: SbDeltas::default(),
            items: DescArena::new(),
            finished: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> TransId {
        self.id
    }

    #[must_use]
    pub fn mount(&self) -> &Arc<Mount> {
        &self.mount
    }

    #[must_use]
    pub fn ty(&self) -> TransType {
        self.ty
    }

    #[must_use]
    pub fn flags(&self) -> TransFlags {
        self.flags
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(TransFlags::DIRTY)
    }

    #[must_use]
    pub fn blk_res(&self) -> u64 {
        self.blk_res
    }

    #[must_use]
    pub fn log_res(&self) -> (u32, u32) {
        (self.log_res, self.log_count)
    }

    #[must_use]
    pub fn deltas(&self) -> SbDeltas {
        self.deltas
    }

    /// Number of attached items.
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.items.occupied_count()
    }

    /// Number of free descriptor slots.
    #[must_use]
    pub fn free_desc_count(&self) -> usize {
        self.items.free_count()
    }

    /// Number of resident descriptor chunks.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.items.resident_chunks()
    }

    /// Records the space the transaction may consume.
    ///
    /// Fails with [`Errno::StorageFull`] if fewer than `blocks` data blocks
    /// (or `rtextents` realtime extents) are free. Nothing is deducted from
    /// the free counters.
    pub fn reserve(
        &mut self,
        blocks: u64,
        logspace: u32,
        rtextents: u64,
        flags: ReserveFlags,
        logcount: u32,
    ) -> Result<()> {
        let sb = self.mount.sb();
        if blocks > 0 {
            if blocks > sb.fdblocks {
                debug!(
                    "trans {}: cannot reserve {blocks} blocks, {} free",
                    self.id, sb.fdblocks
                );
                return Err(Errno::StorageFull);
            }
            self.blk_res = blocks;
        }
        if rtextents > 0 {
            if rtextents > sb.frextents {
                return Err(Errno::StorageFull);
            }
            self.rtx_res = rtextents;
        }
        self.log_res = logspace;
        self.log_count = logcount;
        if flags.contains(ReserveFlags::PERM_LOG_RES) {
            self.flags |= TransFlags::PERM_LOG_RES;
        }
        Ok(())
    }

    /// Records a change of a superblock counter, applied at commit.
    pub fn mod_sb(&mut self, field: SbField, delta: i64) {
        let counter = match field {
            SbField::Icount => &mut self.deltas.icount,
            SbField::Ifree => &mut self.deltas.ifree,
            SbField::Fdblocks => &mut self.deltas.fdblocks,
            SbField::Frextents => &mut self.deltas.frextents,
        };
        *counter += delta;
        self.flags |= TransFlags::DIRTY | TransFlags::SB_DIRTY;
    }

    /// Attaches `item` to the transaction and returns its descriptor.
    pub(crate) fn add_item(&mut self, item: LogItem) -> DescId {
        let id = self.items.insert(item);
        match &mut self.items.get_mut(id).item {
            LogItem::Buf(bli) => bli.desc = Some(id),
            LogItem::Inode(ili) => {
                let mut state = ili.inode.item();
                state.trans = Some(self.id);
                state.desc = Some(id);
            }
        }
        id
    }

    /// Detaches the item of descriptor `id` and frees the descriptor.
    pub(crate) fn free_item(&mut self, id: DescId) -> LogItem {
        let mut item = self.items.remove(id);
        clear_back_pointer(&mut item);
        item
    }

    /// Returns the descriptor of the item tracking `item`.
    ///
    /// # Panics
    ///
    /// Panics if the object is not attached to this transaction.
    #[must_use]
    pub fn find_item(&self, item: ItemRef<'_>) -> DescId {
        match item {
            ItemRef::Inode(ip) => {
                let state = ip.item();
                match (state.trans, state.desc) {
                    (Some(trans), Some(desc)) if trans == self.id => desc,
                    _ => panic!("inode {} is not joined to transaction {}", ip.ino(), self.id),
                }
            }
            ItemRef::Buf(buf) => {
                let bli = self
                    .items
                    .ids()
                    .into_iter()
                    .find_map(|id| match &self.items.get(id).item {
                        LogItem::Buf(bli) if bli.buf.ptr_eq(buf) => Some(bli),
                        _ => None,
                    });
                match bli.and_then(|bli| bli.desc) {
                    Some(desc) => desc,
                    None => panic!(
                        "buffer {} is not attached to transaction {}",
                        buf.key(),
                        self.id
                    ),
                }
            }
        }
    }

    pub(crate) fn mark_dirty(&mut self, id: DescId) {
        self.items.get_mut(id).flags |= DescFlags::DIRTY;
        self.flags |= TransFlags::DIRTY;
    }

    fn is_desc_dirty(&self, id: DescId) -> bool {
        self.items.get(id).flags.contains(DescFlags::DIRTY)
    }

    /// Releases the items of descriptor chunk `chunk`.
    ///
    /// Every item is detached from the transaction and its object unlocked.
    /// With `abort`, dirty inodes get their in-core changes discarded. When
    /// `freeing_chunk` is set every descriptor of the chunk is freed;
    /// otherwise only clean descriptors (or all of them when aborting) are
    /// freed one by one and the rest are left for the caller.
    ///
    /// Returns the number of descriptors freed.
    pub fn unlock_chunk(
        &mut self,
        chunk: usize,
        freeing_chunk: bool,
        abort: bool,
        lsn: Lsn,
    ) -> usize {
        let mut freed = 0;
        for id in self.items.chunk_ids(chunk) {
            let dirty = self.is_desc_dirty(id);
            self.unlock_item(id, dirty, abort, lsn);
            if !freeing_chunk && (!dirty || abort) {
                self.items.remove(id);
                freed += 1;
            }
        }
        if freeing_chunk {
            freed += self.items.drain_chunk(chunk).len();
        }
        freed
    }

    fn unlock_item(&mut self, id: DescId, dirty: bool, abort: bool, lsn: Lsn) {
        let desc = self.items.get_mut(id);
        clear_back_pointer(&mut desc.item);
        match &mut desc.item {
            LogItem::Buf(bli) => {
                bli.flags.remove(item::BliFlags::HOLD);
                bli.recur = 0;
            }
            LogItem::Inode(ili) => {
                let ip = &ili.inode;
                if abort && dirty {
                    if let Some(saved) = ili.saved.take() {
                        trace!("inode {}: discarding aborted changes", ip.ino());
                        ip.restore(saved);
                    }
                } else if dirty && lsn != Lsn::NULL {
                    trace!("inode {} committed at lsn {}", ip.ino(), lsn.0);
                }
                if !ili.hold {
                    ip.iunlock(ili.lock_flags);
                }
                if ili.owns_ref {
                    ip.release();
                    ili.owns_ref = false;
                }
            }
        }
    }

    fn unlock_items(&mut self, abort: bool, lsn: Lsn) {
        for chunk in self.items.chunk_indices() {
            self.unlock_chunk(chunk, false, abort, lsn);
        }
        // Dirty descriptors were kept by the pass above; their items are
        // already detached.
        for chunk in self.items.chunk_indices() {
            self.items.drain_chunk(chunk);
        }
    }

    fn free_all(&mut self, abort: bool) {
        for chunk in self.items.chunk_indices() {
            self.unlock_chunk(chunk, true, abort, Lsn::NULL);
        }
    }

    /// Commits the transaction.
    ///
    /// A transaction that logged nothing is freed without I/O and returns
    /// [`Lsn::NULL`]. Otherwise the superblock deltas are applied, every
    /// dirty buffer and inode is written, and all items are released. Write
    /// errors do not stop the writeback of the remaining items; the first
    /// one is returned.
    pub fn commit(mut self, flags: CommitFlags) -> Result<Lsn> {
        self.finished = true;
        if !self.is_dirty() {
            trace!("trans {}: clean commit", self.id);
            self.unlock_items(false, Lsn::NULL);
            return Ok(Lsn::NULL);
        }

        let lsn = self.mount.next_lsn();
        if self.flags.contains(TransFlags::SB_DIRTY) {
            self.mount.apply_sb_deltas(&self.deltas);
        }
        let res = self.write_items();
        if flags.contains(CommitFlags::SYNC)
            && let Err(e) = self.mount.bufs().device().flush()
        {
            warn!("trans {}: device flush failed: {e}", self.id);
        }
        self.unlock_items(false, lsn);
        debug!("trans {} ({}): committed at lsn {}", self.id, self.ty, lsn.0);
        res.map(|()| lsn)
    }

    fn write_items(&self) -> Result<()> {
        let mut first_err = None;
        let mut clusters: BTreeMap<u64, Vec<Arc<Inode>>> = BTreeMap::new();

        for id in self.items.ids() {
            let desc = self.items.get(id);
            if !desc.flags.contains(DescFlags::DIRTY) {
                continue;
            }
            match &desc.item {
                LogItem::Buf(bli) if bli.is_dirty() => {
                    trace!(
                        "trans {}: writing buffer {} {:?}",
                        self.id,
                        bli.buf.key(),
                        bli.dirty_ranges()
                    );
                    if let Err(e) = self.mount.bufs().write(&bli.buf) {
                        warn!("trans {}: writing buffer {} failed: {e}", self.id, bli.buf.key());
                        first_err.get_or_insert(Errno::from(e));
                    }
                }
                LogItem::Buf(_) => {}
                LogItem::Inode(ili) => clusters
                    .entry(ili.inode.cluster_daddr())
                    .or_default()
                    .push(Arc::clone(&ili.inode)),
            }
        }

        for (daddr, mut inodes) in clusters {
            inodes.sort_by_key(|ip| ip.ino());
            if let Err(e) = self.mount.flush_cluster(daddr, &inodes) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Cancels the transaction, releasing every item.
    pub fn cancel(mut self, flags: CancelFlags) {
        self.finished = true;
        let abort = flags.contains(CancelFlags::ABORT);
        if self.is_dirty() && !abort {
            warn!("trans {}: cancelling dirty transaction without abort", self.id);
        }
        trace!("trans {}: cancel (abort: {abort})", self.id);
        self.free_all(abort);
    }
}

impl Drop for Trans {
    fn drop(&mut self) {
        if !self.finished {
            warn!("trans {} ({}) dropped without commit or cancel", self.id, self.ty);
            self.free_all(true);
        }
    }
}

fn clear_back_pointer(item: &mut LogItem) {
    match item {
        LogItem::Buf(bli) => bli.desc = None,
        LogItem::Inode(ili) => {
            let mut state = ili.inode.item();
            state.trans = None;
            state.desc = None;
        }
    }
}
