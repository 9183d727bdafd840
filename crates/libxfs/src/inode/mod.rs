//! In-core inodes.
//!
//! An [`Inode`] is shared through `Arc` and is unique per inode number while
//! it stays in the per-mount inode hash (see [`Mount::iget`]). Its fields are
//! protected as follows:
//!
//! * `core` and `df` may be read under the inode lock held in either mode and
//!   may be modified only under the inode lock held exclusively, which in
//!   turn is only done by the transaction the inode is joined to.
//! * `item` (the inode log item state) belongs to the transaction the inode
//!   is joined to and to the flush path holding the flush lock.
//! * `vref` is the reference count taken by lookups and dropped by
//!   [`Mount::iput`].
//!
//! [`Mount::iget`]: crate::Mount::iget
//! [`Mount::iput`]: crate::Mount::iput

use std::{
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use bitflags::bitflags;
use block_io::BufGuard;
use log::warn;
use xfs_types::{DINODE_CORE_SIZE, DinodeCore, DinodeFormat, InodeNo, SuperBlock, Timestamp};

pub use self::lock::{LockFlags, lock_inodes, sort_inodes, unlock_inodes};
pub(crate) use self::{cluster::ClusterHash, hash::InodeHash, lock::distinct};
use crate::{
    Mount, MountId,
    dir::SfDir,
    error::{Errno, Result},
    events::EventMask,
    sync::{MrLock, Sema},
    trans::{DescId, Trans, TransId},
};

mod alloc;
mod cluster;
mod hash;
mod iget;
mod lock;

bitflags! {
    /// Parts of an inode logged by a transaction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ILogFlags: u32 {
        /// The inode core.
        const CORE = 0x001;
        /// Inline data fork.
        const DDATA = 0x002;
        /// Extent list.
        const DEXT = 0x004;
        /// Btree root.
        const DBROOT = 0x008;
        /// Device number.
        const DEV = 0x010;
        /// Timestamps only.
        const TIMESTAMP = 0x4000;
    }
}

impl ILogFlags {
    /// Flags that require the data fork to be written.
    pub const DATA_FORK: Self = Self::DDATA.union(Self::DEXT).union(Self::DBROOT);
}

bitflags! {
    /// Timestamps updated by [`Inode::ichgtime`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChgFlags: u8 {
        const ACC = 0x1;
        const MOD = 0x2;
        const CHG = 0x4;
    }
}

/// The in-core copy of the inode core.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InodeCore {
    pub mode: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub generation: u32,
    pub size: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub nextents: u32,
    pub flags: u32,
}

impl InodeCore {
    fn from_disk(dic: &DinodeCore) -> Self {
        Self {
            mode: dic.mode,
            nlink: dic.nlink,
            uid: dic.uid,
            gid: dic.gid,
            generation: dic.generation,
            size: dic.size,
            atime: dic.atime,
            mtime: dic.mtime,
            ctime: dic.ctime,
            nextents: dic.nextents,
            flags: dic.flags,
        }
    }

    fn to_disk(&self, format: DinodeFormat) -> DinodeCore {
        DinodeCore {
            magic: DinodeCore::MAGIC,
            mode: self.mode,
            version: DinodeCore::VERSION,
            format: format as u8,
            pad: 0,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            generation: self.generation,
            size: self.size,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            nextents: self.nextents,
            flags: self.flags,
        }
    }

    /// Returns `true` if this is an unallocated inode.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.mode == 0
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        xfs_types::s_isdir(self.mode)
    }
}

/// The in-core data fork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DataFork {
    Dev,
    /// Short-form directory stored in the literal area.
    Local(SfDir),
    Extents,
    /// Btree-format fork; `loaded` is set once the extent map is in memory.
    Btree { loaded: bool },
}

impl DataFork {
    fn decode(dic: &DinodeCore, literal: &[u8]) -> Result<Self> {
        let Some(format) = DinodeFormat::from_repr(dic.format) else {
            return Err(Errno::Corrupted);
        };
        let df = match format {
            DinodeFormat::Dev => Self::Dev,
            DinodeFormat::Local if xfs_types::s_isdir(dic.mode) => {
                Self::Local(SfDir::decode(literal)?)
            }
            DinodeFormat::Local => return Err(Errno::Corrupted),
            DinodeFormat::Extents => Self::Extents,
            DinodeFormat::Btree => Self::Btree { loaded: false },
        };
        Ok(df)
    }

    fn format(&self) -> DinodeFormat {
        match self {
            Self::Dev => DinodeFormat::Dev,
            Self::Local(_) => DinodeFormat::Local,
            Self::Extents => DinodeFormat::Extents,
            Self::Btree { .. } => DinodeFormat::Btree,
        }
    }

    pub(crate) fn as_sf_dir(&self) -> Option<&SfDir> {
        match self {
            Self::Local(sf) => Some(sf),
            _ => None,
        }
    }

    pub(crate) fn as_sf_dir_mut(&mut self) -> Option<&mut SfDir> {
        match self {
            Self::Local(sf) => Some(sf),
            _ => None,
        }
    }
}

/// In-core state of an inode at the time it joined a transaction.
#[derive(Debug)]
pub(crate) struct InodeSnapshot {
    core: InodeCore,
    df: DataFork,
    fields: ILogFlags,
}

/// Log item state shared between an inode and the transaction it is joined to.
#[derive(Debug, Default)]
pub(crate) struct InodeItemState {
    /// Transaction the inode is joined to.
    pub(crate) trans: Option<TransId>,
    /// Descriptor of the inode log item in that transaction.
    pub(crate) desc: Option<DescId>,
    /// Fields logged since the last flush.
    pub(crate) fields: ILogFlags,
    /// Fields being written by the flush in progress.
    pub(crate) last_fields: ILogFlags,
    /// A flush failed; the inode still has to be written back.
    pub(crate) needs_flush: bool,
}

#[derive(Debug, Default)]
struct VnodeRef {
    count: u32,
    reclaiming: bool,
}

/// An in-core inode.
#[derive(Debug)]
pub struct Inode {
    ino: InodeNo,
    mount_id: MountId,
    cluster_daddr: u64,
    cluster_offset: usize,
    pub(crate) lock: MrLock,
    pub(crate) iolock: MrLock,
    pub(crate) flock: Sema,
    core: Mutex<InodeCore>,
    df: Mutex<DataFork>,
    /// Directory generation counter, bumped on every name change in this directory.
    generation: AtomicU64,
    item: Mutex<InodeItemState>,
    vref: Mutex<VnodeRef>,
    event_mask: AtomicU32,
}

fn lock_or_recover<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns the current time as an on-disk timestamp.
pub(crate) fn now() -> Timestamp {
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Timestamp {
        sec: u32::try_from(d.as_secs()).unwrap_or(u32::MAX),
        nsec: d.subsec_nanos(),
    }
}

impl Inode {
    fn new(mount: &Mount, ino: InodeNo, core: InodeCore, df: DataFork) -> Self {
        let sb = mount.geometry();
        Self {
            ino,
            mount_id: mount.id(),
            cluster_daddr: sb.cluster_daddr(ino),
            cluster_offset: sb.cluster_offset(ino),
            lock: MrLock::new(),
            iolock: MrLock::new(),
            flock: Sema::new(),
            core: Mutex::new(core),
            df: Mutex::new(df),
            generation: AtomicU64::new(0),
            item: Mutex::new(InodeItemState::default()),
            vref: Mutex::new(VnodeRef {
                count: 1,
                reclaiming: false,
            }),
            event_mask: AtomicU32::new(0),
        }
    }

    /// Reads the on-disk inode `ino`.
    ///
    /// With a transaction the cluster buffer is read through it and released
    /// again before returning.
    pub(crate) fn read(mount: &Mount, tp: Option<&mut Trans>, ino: InodeNo) -> Result<Self> {
        let (core, df) = read_dinode(mount, tp, ino)?;
        Ok(Self::new(mount, ino, core, df))
    }

    /// Captures the in-core state so that it can be put back later.
    pub(crate) fn snapshot(&self) -> InodeSnapshot {
        InodeSnapshot {
            core: self.core(),
            df: self.df().clone(),
            fields: self.item().fields,
        }
    }

    /// Puts back a state captured by [`Self::snapshot`].
    ///
    /// Used to discard modifications of an aborted transaction. Changes
    /// committed earlier but not yet written stay pending.
    pub(crate) fn restore(&self, snap: InodeSnapshot) {
        *self.core_mut() = snap.core;
        *self.df() = snap.df;
        self.item().fields = snap.fields;
    }

    /// Resets the in-core state of an unallocated inode.
    ///
    /// Leftovers of an earlier instance (for example an allocation that was
    /// cancelled) must not leak into the next allocation of the slot. The
    /// caller holds the inode lock exclusively. The directory generation is
    /// bumped rather than reset so that it never goes backwards.
    pub(crate) fn reinit_if_new(&self) {
        debug_assert!(self.is_ilocked(LockFlags::ILOCK_EXCL));
        let mut core = self.core_mut();
        if !core.is_free() {
            return;
        }
        let generation = core.generation;
        *core = InodeCore {
            generation,
            ..InodeCore::default()
        };
        *self.df() = DataFork::Extents;
        self.bump_generation();
    }

    #[must_use]
    pub fn ino(&self) -> InodeNo {
        self.ino
    }

    #[must_use]
    pub fn mount_id(&self) -> MountId {
        self.mount_id
    }

    pub(crate) fn cluster_daddr(&self) -> u64 {
        self.cluster_daddr
    }

    pub(crate) fn cluster_offset(&self) -> usize {
        self.cluster_offset
    }

    /// Returns a copy of the inode core.
    #[must_use]
    pub fn core(&self) -> InodeCore {
        self.core_mut().clone()
    }

    pub(crate) fn core_mut(&self) -> MutexGuard<'_, InodeCore> {
        lock_or_recover(&self.core)
    }

    pub(crate) fn df(&self) -> MutexGuard<'_, DataFork> {
        lock_or_recover(&self.df)
    }

    #[must_use]
    pub fn mode(&self) -> u16 {
        self.core_mut().mode
    }

    #[must_use]
    pub fn nlink(&self) -> u32 {
        self.core_mut().nlink
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.core_mut().size
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.core_mut().is_dir()
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.core_mut().is_free()
    }

    /// Returns the data fork format.
    #[must_use]
    pub fn format(&self) -> DinodeFormat {
        self.df().format()
    }

    /// Loads the extent map of a btree-format fork.
    ///
    /// The caller must hold the inode lock exclusively.
    pub fn load_extents(&self) {
        debug_assert!(self.lock.is_excl_locked());
        if let DataFork::Btree { loaded } = &mut *self.df() {
            *loaded = true;
        }
    }

    /// Returns the directory generation counter.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    #[must_use]
    pub fn event_mask(&self) -> EventMask {
        EventMask::from_bits_truncate(self.event_mask.load(Ordering::Relaxed))
    }

    pub fn set_event_mask(&self, mask: EventMask) {
        self.event_mask.store(mask.bits(), Ordering::Relaxed);
    }

    /// Updates the timestamps selected by `flags` to the current time.
    pub fn ichgtime(&self, flags: ChgFlags) {
        let now = now();
        let mut core = self.core_mut();
        if flags.contains(ChgFlags::ACC) {
            core.atime = now;
        }
        if flags.contains(ChgFlags::MOD) {
            core.mtime = now;
        }
        if flags.contains(ChgFlags::CHG) {
            core.ctime = now;
        }
    }

    /// Increments the link count and logs the core.
    pub fn bumplink(&self, tp: &mut Trans) {
        {
            let mut core = self.core_mut();
            assert!(core.nlink < xfs_types::MAXLINK, "link count overflow");
            core.nlink += 1;
        }
        self.ichgtime(ChgFlags::CHG);
        tp.log_inode(self, ILogFlags::CORE);
    }

    /// Decrements the link count and logs the core.
    pub fn droplink(&self, tp: &mut Trans) {
        {
            let mut core = self.core_mut();
            assert!(core.nlink > 0, "dropping link of unlinked inode {}", self.ino);
            core.nlink -= 1;
        }
        self.ichgtime(ChgFlags::CHG);
        tp.log_inode(self, ILogFlags::CORE);
    }

    // Reference counting.

    /// Takes a reference unless the inode is being reclaimed.
    pub(crate) fn grab(&self) -> bool {
        let mut vref = lock_or_recover(&self.vref);
        if vref.reclaiming {
            return false;
        }
        vref.count += 1;
        true
    }

    /// Takes another reference on an inode the caller already holds one on.
    pub fn hold(&self) {
        let mut vref = lock_or_recover(&self.vref);
        assert!(vref.count > 0, "holding unreferenced inode {}", self.ino);
        vref.count += 1;
    }

    pub(crate) fn release(&self) {
        let mut vref = lock_or_recover(&self.vref);
        assert!(vref.count > 0, "releasing unreferenced inode {}", self.ino);
        vref.count -= 1;
    }

    /// Returns the number of references held by lookups.
    #[must_use]
    pub fn refcount(&self) -> u32 {
        lock_or_recover(&self.vref).count
    }

    /// Marks the inode as being reclaimed if nobody references it.
    fn start_reclaim(&self) -> bool {
        let mut vref = lock_or_recover(&self.vref);
        if vref.count > 0 || vref.reclaiming {
            return false;
        }
        vref.reclaiming = true;
        true
    }

    // Log item state.

    pub(crate) fn item(&self) -> MutexGuard<'_, InodeItemState> {
        lock_or_recover(&self.item)
    }

    pub(crate) fn item_trans(&self) -> Option<TransId> {
        self.item().trans
    }

    #[must_use]
    pub fn needs_flush(&self) -> bool {
        let item = self.item();
        item.needs_flush || !item.fields.is_empty()
    }

    /// Moves the logged fields to the in-flight set and returns them.
    pub(crate) fn begin_flush(&self) -> ILogFlags {
        let mut item = self.item();
        item.last_fields = item.fields | item.last_fields;
        item.fields = ILogFlags::empty();
        item.last_fields
    }

    pub(crate) fn flush_done(&self, ok: bool) {
        let mut item = self.item();
        if ok {
            item.last_fields = ILogFlags::empty();
            item.needs_flush = false;
        } else {
            item.needs_flush = true;
        }
    }

    /// Writes the in-core inode into its slot of a locked cluster buffer.
    ///
    /// The caller must hold the flush lock.
    pub(crate) fn flush_into(
        &self,
        data: &mut BufGuard<'_>,
        sb: &SuperBlock,
        fields: ILogFlags,
    ) -> Result<()> {
        debug_assert!(self.flock.is_taken());
        let offset = self.cluster_offset;
        let literal = offset + DINODE_CORE_SIZE..offset + usize::from(sb.inode_size);
        let core = self.core_mut();
        let df = self.df();

        if core.is_free() {
            data.bytes_mut()[offset..literal.end].fill(0);
            return Ok(());
        }

        data.write_pod(offset, &core.to_disk(df.format()));
        if fields.intersects(ILogFlags::DATA_FORK) {
            let area = &mut data.bytes_mut()[literal];
            area.fill(0);
            if let DataFork::Local(sf) = &*df {
                sf.encode(area)?;
            }
        }
        Ok(())
    }
}

fn read_dinode(
    mount: &Mount,
    tp: Option<&mut Trans>,
    ino: InodeNo,
) -> Result<(InodeCore, DataFork)> {
    let sb = mount.geometry();
    if !sb.is_valid_ino(ino) {
        return Err(Errno::InvalidInput);
    }
    let daddr = sb.cluster_daddr(ino);
    let len = sb.cluster_len_bb();
    let offset = sb.cluster_offset(ino);

    let (dic, literal) = match tp {
        Some(tp) => {
            let buf = tp.read_buf(daddr, len)?;
            let res = decode_slot(&buf.lock(), offset, sb);
            tp.brelse(&buf);
            res
        }
        None => {
            let buf = mount.bufs().read(daddr, len)?;
            decode_slot(&buf.lock(), offset, sb)
        }
    };

    if dic.is_free() {
        return Ok((InodeCore::default(), DataFork::Extents));
    }
    if dic.magic != DinodeCore::MAGIC {
        warn!("inode {ino}: bad magic {:#x}", dic.magic);
        return Err(Errno::Corrupted);
    }
    let df = DataFork::decode(&dic, &literal).inspect_err(|_| {
        warn!("inode {ino}: bad data fork (format {})", dic.format);
    })?;
    Ok((InodeCore::from_disk(&dic), df))
}

fn decode_slot(data: &BufGuard<'_>, offset: usize, sb: &SuperBlock) -> (DinodeCore, Vec<u8>) {
    let dic: DinodeCore = data.read_pod(offset);
    let literal_range = offset + DINODE_CORE_SIZE..offset + usize::from(sb.inode_size);
    let literal = data.bytes()[literal_range].to_vec();
    (dic, literal)
}
