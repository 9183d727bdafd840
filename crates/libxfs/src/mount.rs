//! Mounted filesystems.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};

use block_io::{BlockDevice, BufCache, DevId};
use log::{debug, info, warn};
use xfs_types::{BBSIZE, DINODE_CORE_SIZE, InodeNo, SF_HDR_SIZE, SuperBlock};

use crate::{
    dir::{DirOps, ShortformDir},
    dnlc::NameCache,
    error::{Errno, Result},
    events::{EventHooks, EventMask},
    inode::{ClusterHash, Inode, InodeHash, LockFlags},
    param::{CHASH_MIN, NAME_CACHE_SIZE, RENAME_RETRY_WARN},
    trans::{Lsn, SbDeltas},
};

/// Mount identifier, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MountId(u32);

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mount{}", self.0)
    }
}

static NEXT_MOUNT_ID: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone)]
pub struct MountParams {
    /// Number of inode hash buckets. Derived from the inode count if `None`.
    pub ihash_size: Option<usize>,
    /// Lower bound of the cluster hash size.
    pub chash_min: usize,
    /// Capacity of the name lookup cache; zero disables it.
    pub name_cache_size: usize,
    /// Restarts of one rename after which a warning is logged.
    pub rename_retry_warn: u64,
}

impl Default for MountParams {
    fn default() -> Self {
        Self {
            ihash_size: None,
            chash_min: CHASH_MIN,
            name_cache_size: NAME_CACHE_SIZE,
            rename_retry_warn: RENAME_RETRY_WARN,
        }
    }
}

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub(crate) fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Event counters of a mount.
#[derive(Debug, Default)]
pub struct MountStats {
    pub iget_hits: Counter,
    pub iget_misses: Counter,
    /// Lookups restarted because the inode was being reclaimed.
    pub iget_restarts: Counter,
    /// Misses that lost the insertion race to another lookup.
    pub iget_dups: Counter,
    pub reclaims: Counter,
    /// Lock-for-rename passes that found a directory changed.
    pub rename_lock_retries: Counter,
    /// Renames restarted after re-locking.
    pub rename_restarts: Counter,
}

/// A copy of [`MountStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub iget_hits: u64,
    pub iget_misses: u64,
    pub iget_restarts: u64,
    pub iget_dups: u64,
    pub reclaims: u64,
    pub rename_lock_retries: u64,
    pub rename_restarts: u64,
}

impl MountStats {
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            iget_hits: self.iget_hits.get(),
            iget_misses: self.iget_misses.get(),
            iget_restarts: self.iget_restarts.get(),
            iget_dups: self.iget_dups.get(),
            reclaims: self.reclaims.get(),
            rename_lock_retries: self.rename_lock_retries.get(),
            rename_restarts: self.rename_restarts.get(),
        }
    }
}

/// Points inside rename where tests can inject concurrent changes.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum RacePoint {
    /// Lookups done, directory locks about to be re-taken in order.
    RenameLookup,
    /// All locks dropped before the transaction is allocated.
    RenameUnlocked,
}

#[cfg(test)]
type RaceHook = Box<dyn FnOnce() + Send>;

/// A mounted filesystem.
pub struct Mount {
    id: MountId,
    bufs: BufCache,
    /// Geometry, fixed at mount time.
    geometry: SuperBlock,
    /// In-core superblock with current counters.
    sb: Mutex<SuperBlock>,
    params: MountParams,
    ihash: InodeHash,
    chash: ClusterHash,
    inodes: Mutex<BTreeMap<InodeNo, Arc<Inode>>>,
    root: Mutex<Option<Arc<Inode>>>,
    ino_cursor: AtomicU64,
    lsn: AtomicU64,
    dir_ops: Box<dyn DirOps>,
    name_cache: NameCache,
    hooks: RwLock<Option<Arc<dyn EventHooks>>>,
    event_mask: AtomicU32,
    stats: MountStats,
    #[cfg(test)]
    race_hooks: Mutex<BTreeMap<RacePoint, RaceHook>>,
}

impl fmt::Debug for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("id", &self.id)
            .field("geometry", &self.geometry)
            .field("params", &self.params)
            .field("dir_ops", &self.dir_ops)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_sb(bufs: &BufCache) -> Result<SuperBlock> {
    let buf = bufs.read(0, 1)?;
    let sb = buf.lock().read_pod(0);
    Ok(sb)
}

fn validate_sb(sb: &SuperBlock, device_bb: u64) -> Result<()> {
    let bad = |what: &str| {
        warn!("mount: bad superblock: {what}");
        Err(Errno::Corrupted)
    };
    if sb.magic != SuperBlock::MAGIC {
        return bad("magic");
    }
    if sb.version != SuperBlock::VERSION {
        return bad("version");
    }
    if !sb.block_size.is_power_of_two()
        || (sb.block_size as usize) < BBSIZE
        || sb.block_size > 65536
    {
        return bad("block size");
    }
    let inode_size = usize::from(sb.inode_size);
    if !inode_size.is_power_of_two()
        || inode_size < DINODE_CORE_SIZE + SF_HDR_SIZE
        || inode_size > sb.block_size as usize
        || usize::from(sb.inodes_per_block) != sb.block_size as usize / inode_size
    {
        return bad("inode size");
    }
    if sb.inode_cluster_blocks == 0 || sb.inode_start == 0 {
        return bad("inode table layout");
    }
    if sb.inode_start + sb.inode_table_blocks() > sb.data_blocks {
        return bad("inode table beyond the data device");
    }
    if !sb.is_valid_ino(InodeNo::new(sb.root_ino)) {
        return bad("root inode");
    }
    if sb.data_blocks * sb.bb_per_block() > device_bb {
        warn!("mount: device smaller than the filesystem");
        return Err(Errno::InvalidInput);
    }
    Ok(())
}

impl Mount {
    /// Mounts the filesystem on `device` with short-form directories.
    pub fn mount(device: Arc<dyn BlockDevice>, params: MountParams) -> Result<Arc<Self>> {
        Self::mount_with(device, params, None)
    }

    /// Mounts the filesystem on `device`.
    ///
    /// `dir_ops` overrides the directory implementation.
    pub fn mount_with(
        device: Arc<dyn BlockDevice>,
        params: MountParams,
        dir_ops: Option<Box<dyn DirOps>>,
    ) -> Result<Arc<Self>> {
        let id = MountId(NEXT_MOUNT_ID.fetch_add(1, Ordering::Relaxed));
        let device_bb = device.size_bb();
        let bufs = BufCache::new(DevId(id.0), device);
        let sb = read_sb(&bufs)?;
        validate_sb(&sb, device_bb)?;

        let ihash_size = params
            .ihash_size
            .unwrap_or_else(|| InodeHash::size_for(sb.inode_max));
        let chash_size =
            ClusterHash::size_for(ihash_size, sb.inodes_per_cluster(), params.chash_min);
        let dir_ops = dir_ops.unwrap_or_else(|| Box::new(ShortformDir::new(sb.literal_size())));
        let root_ino = InodeNo::new(sb.root_ino);

        let mount = Arc::new(Self {
            id,
            bufs,
            geometry: sb.clone(),
            ino_cursor: AtomicU64::new(sb.root_ino + sb.icount),
            sb: Mutex::new(sb),
            ihash: InodeHash::init(ihash_size),
            chash: ClusterHash::init(chash_size),
            inodes: Mutex::default(),
            root: Mutex::default(),
            lsn: AtomicU64::new(0),
            dir_ops,
            name_cache: NameCache::new(params.name_cache_size),
            params,
            hooks: RwLock::default(),
            event_mask: AtomicU32::new(0),
            stats: MountStats::default(),
            #[cfg(test)]
            race_hooks: Mutex::default(),
        });

        let root = mount.iget(None, root_ino, LockFlags::empty())?;
        if !root.is_dir() {
            warn!("mount: root inode {root_ino} is not a directory");
            mount.iput(root, LockFlags::empty());
            return Err(Errno::Corrupted);
        }
        *lock(&mount.root) = Some(root);
        info!(
            "{id}: mounted, {} blocks of {} bytes, {} inodes (ihash {}, chash {})",
            mount.geometry.data_blocks,
            mount.geometry.block_size,
            mount.geometry.inode_max,
            mount.ihash.size(),
            chash_size
        );
        Ok(mount)
    }

    /// Writes back everything and tears down the inode caches.
    pub fn unmount(&self) -> Result<()> {
        let res = self.sync_inodes();
        if let Some(root) = lock(&self.root).take() {
            self.iput(root, LockFlags::empty());
        }
        self.reclaim_inactive();
        let left = self.ihash.len();
        if left > 0 {
            warn!("{}: {left} inodes still in use at unmount", self.id);
        }
        self.write_sb()?;
        self.bufs.device().flush()?;
        self.ihash.free();
        self.chash.free();
        self.inode_list().clear();
        self.name_cache.purge_all();
        info!("{}: unmounted", self.id);
        res
    }

    #[must_use]
    pub fn id(&self) -> MountId {
        self.id
    }

    #[must_use]
    pub fn bufs(&self) -> &BufCache {
        &self.bufs
    }

    /// Returns the filesystem geometry. Counters in it are stale; see [`Self::sb`].
    #[must_use]
    pub fn geometry(&self) -> &SuperBlock {
        &self.geometry
    }

    /// Returns a copy of the in-core superblock.
    #[must_use]
    pub fn sb(&self) -> SuperBlock {
        lock(&self.sb).clone()
    }

    #[must_use]
    pub fn params(&self) -> &MountParams {
        &self.params
    }

    #[must_use]
    pub fn stats(&self) -> &MountStats {
        &self.stats
    }

    #[must_use]
    pub fn dir_ops(&self) -> &dyn DirOps {
        &*self.dir_ops
    }

    #[must_use]
    pub fn name_cache(&self) -> &NameCache {
        &self.name_cache
    }

    #[must_use]
    pub fn root_ino(&self) -> InodeNo {
        InodeNo::new(self.geometry.root_ino)
    }

    /// Returns the root directory with a reference held.
    pub fn root(&self) -> Result<Arc<Inode>> {
        match &*lock(&self.root) {
            Some(root) => {
                root.hold();
                Ok(Arc::clone(root))
            }
            None => Err(Errno::NotFound),
        }
    }

    pub(crate) fn ihash(&self) -> &InodeHash {
        &self.ihash
    }

    pub(crate) fn chash(&self) -> &ClusterHash {
        &self.chash
    }

    pub(crate) fn inode_list(&self) -> MutexGuard<'_, BTreeMap<InodeNo, Arc<Inode>>> {
        lock(&self.inodes)
    }

    /// Number of in-core inodes.
    #[must_use]
    pub fn inode_count(&self) -> usize {
        self.inode_list().len()
    }

    pub(crate) fn ino_cursor(&self) -> &AtomicU64 {
        &self.ino_cursor
    }

    pub(crate) fn next_lsn(&self) -> Lsn {
        Lsn(self.lsn.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn apply_sb_deltas(&self, deltas: &SbDeltas) {
        let mut sb = lock(&self.sb);
        sb.icount = sb.icount.saturating_add_signed(deltas.icount);
        sb.ifree = sb.ifree.saturating_add_signed(deltas.ifree);
        sb.fdblocks = sb.fdblocks.saturating_add_signed(deltas.fdblocks);
        sb.frextents = sb.frextents.saturating_add_signed(deltas.frextents);
    }

    /// Writes the in-core superblock to disk.
    pub fn write_sb(&self) -> Result<()> {
        let sb = self.sb();
        let buf = self.bufs.read(0, 1)?;
        buf.lock().write_pod(0, &sb);
        self.bufs.write(&buf)?;
        debug!("{}: superblock written (icount {}, fdblocks {})", self.id, sb.icount, sb.fdblocks);
        Ok(())
    }

    #[must_use]
    pub fn event_mask(&self) -> EventMask {
        EventMask::from_bits_truncate(self.event_mask.load(Ordering::Relaxed))
    }

    pub fn set_event_mask(&self, mask: EventMask) {
        self.event_mask.store(mask.bits(), Ordering::Relaxed);
    }

    pub fn set_event_hooks(&self, hooks: Option<Arc<dyn EventHooks>>) {
        *self.hooks.write().unwrap_or_else(PoisonError::into_inner) = hooks;
    }

    pub(crate) fn event_hooks(&self) -> Option<Arc<dyn EventHooks>> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Writes the in-core state of `inodes`, which all live in the cluster
    /// at `daddr`, with one read and one write of the cluster buffer.
    ///
    /// `inodes` must be sorted by inode number.
    pub(crate) fn flush_cluster(&self, daddr: u64, inodes: &[Arc<Inode>]) -> Result<()> {
        let _guard = self.chash.lock_flush(daddr);
        for ip in inodes {
            ip.iflock();
        }
        let fields: Vec<_> = inodes.iter().map(|ip| ip.begin_flush()).collect();
        let res = self.write_cluster(daddr, inodes, &fields);
        if let Err(e) = &res {
            warn!("{}: writing inode cluster at daddr {daddr} failed: {e}", self.id);
        }
        for ip in inodes {
            ip.flush_done(res.is_ok());
            ip.ifunlock();
        }
        res
    }

    fn write_cluster(
        &self,
        daddr: u64,
        inodes: &[Arc<Inode>],
        fields: &[crate::inode::ILogFlags],
    ) -> Result<()> {
        let buf = self.bufs.read(daddr, self.geometry.cluster_len_bb())?;
        {
            let mut data = buf.lock();
            for (ip, fields) in inodes.iter().zip(fields) {
                debug_assert_eq!(ip.cluster_daddr(), daddr);
                ip.flush_into(&mut data, &self.geometry, *fields)?;
            }
        }
        self.bufs.write(&buf)?;
        Ok(())
    }

    /// Writes back every in-core inode with unwritten changes.
    ///
    /// Returns the first error; the remaining clusters are still written.
    pub fn sync_inodes(&self) -> Result<()> {
        let daddrs: BTreeSet<u64> = self
            .inode_list()
            .values()
            .filter(|ip| ip.needs_flush())
            .map(|ip| ip.cluster_daddr())
            .collect();

        let mut first_err = None;
        for daddr in daddrs {
            let mut inodes: Vec<_> = self
                .chash
                .cluster(daddr)
                .into_iter()
                .filter(|ip| ip.needs_flush() && ip.item_trans().is_none())
                .collect();
            if inodes.is_empty() {
                continue;
            }
            inodes.sort_by_key(|ip| ip.ino());
            for ip in &inodes {
                ip.ilock(LockFlags::ILOCK_SHARED);
            }
            if let Err(e) = self.flush_cluster(daddr, &inodes) {
                first_err.get_or_insert(e);
            }
            for ip in &inodes {
                ip.iunlock(LockFlags::ILOCK_SHARED);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    #[cfg(test)]
    pub(crate) fn set_race_hook(&self, point: RacePoint, hook: impl FnOnce() + Send + 'static) {
        lock(&self.race_hooks).insert(point, Box::new(hook));
    }

    #[cfg(test)]
    pub(crate) fn race_point(&self, point: RacePoint) {
        let hook = lock(&self.race_hooks).remove(&point);
        if let Some(hook) = hook {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use block_io::MemDevice;

    use super::*;
    use crate::{
        init::{FormatParams, format},
        test_utils::TestFs,
    };

    #[test]
    fn mount_reads_geometry() {
        let fs = TestFs::new();
        let sb = fs.mount.sb();
        assert_eq!(sb.magic, SuperBlock::MAGIC);
        assert_eq!(fs.mount.root_ino(), InodeNo::new(sb.root_ino));
        assert_eq!(fs.mount.inode_count(), 1);
        let root = fs.mount.root().unwrap();
        assert!(root.is_dir());
        fs.mount.iput(root, LockFlags::empty());
    }

    #[test]
    fn unformatted_device_is_rejected() {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(1024));
        let err = Mount::mount(dev, MountParams::default()).unwrap_err();
        assert_eq!(err, Errno::Corrupted);
    }

    #[test]
    fn explicit_hash_sizes() {
        let dev = Arc::new(MemDevice::new(2048));
        format(&*dev, &FormatParams::default()).unwrap();
        let params = MountParams {
            ihash_size: Some(100),
            chash_min: 5,
            ..MountParams::default()
        };
        let mount = Mount::mount(dev, params).unwrap();
        assert_eq!(mount.ihash().size(), 100);
        mount.unmount().unwrap();
    }

    #[test]
    fn unmount_persists_counters() {
        let fs = TestFs::new();
        let mut tp = crate::trans::Trans::alloc(&fs.mount, crate::trans::TransType::Setattr);
        tp.mod_sb(crate::trans::SbField::Fdblocks, -5);
        tp.commit(crate::trans::CommitFlags::empty()).unwrap();
        let fdblocks = fs.mount.sb().fdblocks;
        fs.mount.unmount().unwrap();

        let dev = Arc::clone(&fs.dev) as Arc<dyn BlockDevice>;
        let again = Mount::mount(dev, MountParams::default()).unwrap();
        assert_eq!(again.sb().fdblocks, fdblocks);
        again.unmount().unwrap();
    }

    #[test]
    fn race_hooks_fire_once() {
        let fs = TestFs::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        fs.mount.set_race_hook(RacePoint::RenameUnlocked, move || {
            h.fetch_add(1, Ordering::Relaxed);
        });
        fs.mount.race_point(RacePoint::RenameLookup);
        fs.mount.race_point(RacePoint::RenameUnlocked);
        fs.mount.race_point(RacePoint::RenameUnlocked);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
