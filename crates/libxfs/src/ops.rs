//! Namespace operations.
//!
//! Each mutation runs in its own transaction, locks the inodes it changes in
//! ascending inode number and bumps the generation counter of every
//! directory it modifies. Inodes passed in and returned carry a reference
//! owned by the caller; give it back with [`Mount::iput`].

use std::sync::Arc;

use log::{debug, trace};
use xfs_types::{InodeNo, MAXLINK, S_IFDIR, S_IFMT, s_isdir};

use crate::{
    Mount,
    dir::{self, is_dot_or_dotdot, validate_name},
    error::{Errno, Result},
    events::EventMask,
    inode::{ChgFlags, ILogFlags, Inode, LockFlags, lock_inodes, sort_inodes, unlock_inodes},
    param::{DIROP_LOG_COUNT, DIROP_LOG_RES, DIRENTER_BASE_BLOCKS},
    trans::{CancelFlags, CommitFlags, ReserveFlags, Trans, TransType},
};

/// Blocks reserved for entering a name of `namelen` bytes.
pub(crate) fn direnter_space_res(mount: &Mount, namelen: usize) -> u64 {
    let block_size = u64::from(mount.geometry().block_size);
    DIRENTER_BASE_BLOCKS + (namelen as u64).div_ceil(block_size)
}

/// Reserves `blocks` for a directory operation, falling back to no block
/// reservation when space is short.
///
/// Returns the number of blocks actually reserved. With zero the caller must
/// check [`crate::dir::DirOps::can_enter`] before adding an entry.
pub(crate) fn reserve_dirop(
    tp: &mut Trans,
    blocks: u64,
    log_res: u32,
    log_count: u32,
) -> Result<u64> {
    match tp.reserve(blocks, log_res, 0, ReserveFlags::PERM_LOG_RES, log_count) {
        Ok(()) => Ok(blocks),
        Err(Errno::StorageFull) => {
            trace!("trans {}: no space for {blocks} blocks, reserving none", tp.id());
            tp.reserve(0, log_res, 0, ReserveFlags::PERM_LOG_RES, log_count)?;
            Ok(0)
        }
        Err(e) => Err(e),
    }
}

/// Commits `tp` if `res` is a success, otherwise cancels it.
///
/// A dirty transaction is cancelled with [`CancelFlags::ABORT`].
pub(crate) fn finish<T>(tp: Trans, res: Result<T>) -> Result<T> {
    match res {
        Ok(v) => {
            tp.commit(CommitFlags::RELEASE_LOG_RES)?;
            Ok(v)
        }
        Err(e) => {
            let mut flags = CancelFlags::RELEASE_LOG_RES;
            if tp.is_dirty() {
                flags |= CancelFlags::ABORT;
            }
            tp.cancel(flags);
            Err(e)
        }
    }
}

/// Looks up `name` in directory `dp`.
pub fn lookup(mount: &Mount, dp: &Inode, name: &[u8]) -> Result<Arc<Inode>> {
    let mode = dp.ilock_map_shared();
    let res = if dp.nlink() == 0 {
        Err(Errno::NotFound)
    } else {
        dir::lookup(mount, dp, name)
    };
    dp.iunlock_map_shared(mode);
    mount.iget(None, res?, LockFlags::empty())
}

/// Creates an inode of `mode` named `name` in directory `dp`.
///
/// Directories get `.` and `..` and add a link to `dp`.
pub fn create(mount: &Arc<Mount>, dp: &Arc<Inode>, name: &[u8], mode: u16) -> Result<Arc<Inode>> {
    validate_name(name)?;
    if is_dot_or_dotdot(name) {
        return Err(Errno::AlreadyExists);
    }
    if mode & S_IFMT == 0 {
        return Err(Errno::InvalidInput);
    }

    let is_dir = s_isdir(mode);
    let ty = if is_dir { TransType::Mkdir } else { TransType::Create };
    let mut tp = Trans::alloc(mount, ty);
    let resblks = direnter_space_res(mount, name.len());
    let total = reserve_dirop(&mut tp, resblks, DIROP_LOG_RES, DIROP_LOG_COUNT)?;

    dp.ilock(LockFlags::ILOCK_EXCL);
    tp.ijoin(dp, LockFlags::ILOCK_EXCL);

    let ip = match create_locked(mount, &mut tp, dp, name, mode, total) {
        Ok(ip) => ip,
        Err(e) => return finish(tp, Err(e)),
    };
    if let Err(e) = tp.commit(CommitFlags::RELEASE_LOG_RES) {
        mount.iput(ip, LockFlags::empty());
        return Err(e);
    }
    debug!("created {} {:?} in {}", ip.ino(), name.escape_ascii().to_string(), dp.ino());
    Ok(ip)
}

fn create_locked(
    mount: &Mount,
    tp: &mut Trans,
    dp: &Arc<Inode>,
    name: &[u8],
    mode: u16,
    total: u64,
) -> Result<Arc<Inode>> {
    let is_dir = s_isdir(mode);
    if !dp.is_dir() {
        return Err(Errno::NotADirectory);
    }
    if dp.nlink() == 0 {
        return Err(Errno::NotFound);
    }
    if is_dir && dp.nlink() >= MAXLINK {
        return Err(Errno::TooManyLinks);
    }
    match dir::lookup(mount, dp, name) {
        Ok(_) => return Err(Errno::AlreadyExists),
        Err(Errno::NotFound) => {}
        Err(e) => return Err(e),
    }
    if total == 0 {
        mount.dir_ops().can_enter(dp, name)?;
    }

    let ip = mount.ialloc(tp, mode)?;
    ip.bumplink(tp);
    if is_dir {
        mount.dir_ops().init(tp, &ip, dp.ino())?;
        ip.bumplink(tp);
    }
    dir::create_name(tp, dp, name, ip.ino(), total)?;
    dp.ichgtime(ChgFlags::MOD | ChgFlags::CHG);
    if is_dir {
        dp.bumplink(tp);
    }
    tp.log_inode(dp, ILogFlags::CORE);
    dp.bump_generation();

    // The transaction drops its own reference at commit.
    ip.hold();
    Ok(ip)
}

/// Creates directory `name` in `dp` with permission bits `perm`.
pub fn mkdir(mount: &Arc<Mount>, dp: &Arc<Inode>, name: &[u8], perm: u16) -> Result<Arc<Inode>> {
    create(mount, dp, name, S_IFDIR | (perm & !S_IFMT))
}

/// Adds the name `name` in directory `tdp` for the existing inode `ip`.
pub fn link(mount: &Arc<Mount>, ip: &Arc<Inode>, tdp: &Arc<Inode>, name: &[u8]) -> Result<()> {
    validate_name(name)?;
    if is_dot_or_dotdot(name) {
        return Err(Errno::AlreadyExists);
    }
    if ip.is_dir() {
        return Err(Errno::NotPermitted);
    }
    if !tdp.is_dir() {
        return Err(Errno::NotADirectory);
    }

    let mut tp = Trans::alloc(mount, TransType::Link);
    let resblks = direnter_space_res(mount, name.len());
    let total = reserve_dirop(&mut tp, resblks, DIROP_LOG_RES, DIROP_LOG_COUNT)?;

    let mut inodes = [Arc::clone(ip), Arc::clone(tdp)];
    sort_inodes(&mut inodes);
    lock_inodes(&inodes, LockFlags::ILOCK_EXCL);
    tp.ijoin(ip, LockFlags::ILOCK_EXCL);
    tp.ijoin(tdp, LockFlags::ILOCK_EXCL);

    let res = link_locked(mount, &mut tp, ip, tdp, name, total);
    finish(tp, res)
}

fn link_locked(
    mount: &Mount,
    tp: &mut Trans,
    ip: &Inode,
    tdp: &Inode,
    name: &[u8],
    total: u64,
) -> Result<()> {
    if ip.nlink() == 0 || tdp.nlink() == 0 {
        return Err(Errno::NotFound);
    }
    if ip.nlink() >= MAXLINK {
        return Err(Errno::TooManyLinks);
    }
    match dir::lookup(mount, tdp, name) {
        Ok(_) => return Err(Errno::AlreadyExists),
        Err(Errno::NotFound) => {}
        Err(e) => return Err(e),
    }
    if total == 0 {
        mount.dir_ops().can_enter(tdp, name)?;
    }

    dir::create_name(tp, tdp, name, ip.ino(), total)?;
    tdp.ichgtime(ChgFlags::MOD | ChgFlags::CHG);
    tp.log_inode(tdp, ILogFlags::CORE);
    ip.bumplink(tp);
    tdp.bump_generation();
    Ok(())
}

/// Removes the entry `name` from directory `dp`.
///
/// A directory entry can only be removed if the directory is empty.
pub fn remove(mount: &Arc<Mount>, dp: &Arc<Inode>, name: &[u8]) -> Result<()> {
    validate_name(name)?;
    if is_dot_or_dotdot(name) {
        return Err(Errno::InvalidInput);
    }

    loop {
        let (ip, gen_) = {
            let mode = dp.ilock_map_shared();
            let res = if dp.nlink() == 0 {
                Err(Errno::NotFound)
            } else {
                dir::lookup(mount, dp, name).map(|ino| (ino, dp.generation()))
            };
            dp.iunlock_map_shared(mode);
            let (ino, gen_) = res?;
            (mount.iget(None, ino, LockFlags::empty())?, gen_)
        };

        let mut tp = Trans::alloc(mount, TransType::Remove);
        if let Err(e) = tp.reserve(0, DIROP_LOG_RES, 0, ReserveFlags::PERM_LOG_RES, DIROP_LOG_COUNT)
        {
            tp.cancel(CancelFlags::empty());
            mount.iput(ip, LockFlags::empty());
            return Err(e);
        }

        let mut inodes = [Arc::clone(dp), Arc::clone(&ip)];
        sort_inodes(&mut inodes);
        lock_inodes(&inodes, LockFlags::ILOCK_EXCL);
        if dp.generation() != gen_ {
            trace!("remove: directory {} changed, retrying", dp.ino());
            unlock_inodes(&inodes, LockFlags::ILOCK_EXCL);
            tp.cancel(CancelFlags::RELEASE_LOG_RES);
            mount.iput(ip, LockFlags::empty());
            continue;
        }
        tp.ijoin(dp, LockFlags::ILOCK_EXCL);
        tp.ijoin(&ip, LockFlags::ILOCK_EXCL);

        let res = remove_locked(mount, &mut tp, dp, &ip, name);
        let res = finish(tp, res);
        if let Ok(true) = res {
            mount.name_cache().purge_inode(ip.ino());
            if let Some(hooks) = mount.event_hooks_for(EventMask::POSTREMOVE, &[&**dp]) {
                hooks.link_removed(dp.ino(), ip.ino());
            }
        }
        mount.iput(ip, LockFlags::empty());
        return res.map(|_| ());
    }
}

fn remove_locked(
    mount: &Mount,
    tp: &mut Trans,
    dp: &Inode,
    ip: &Inode,
    name: &[u8],
) -> Result<bool> {
    let is_dir = ip.is_dir();
    if is_dir && (!mount.dir_ops().is_empty(ip) || ip.nlink() > 2) {
        return Err(Errno::DirectoryNotEmpty);
    }

    dir::remove_name(tp, dp, name, ip.ino())?;
    dp.ichgtime(ChgFlags::MOD | ChgFlags::CHG);
    tp.log_inode(dp, ILogFlags::CORE);
    ip.droplink(tp);
    if is_dir {
        // The directory's own "." and the parent's link from "..".
        ip.droplink(tp);
        dp.droplink(tp);
    }
    dp.bump_generation();
    Ok(ip.nlink() == 0)
}

/// Reads the entries of directory `dp`, excluding `.` and `..`.
pub fn read_dir(dp: &Inode) -> Result<Vec<(Vec<u8>, InodeNo)>> {
    let mode = dp.ilock_map_shared();
    let res = dp
        .df()
        .as_sf_dir()
        .map(|sf| {
            sf.entries()
                .iter()
                .map(|e| (e.name.clone(), e.ino))
                .collect()
        })
        .ok_or(Errno::NotADirectory);
    dp.iunlock_map_shared(mode);
    res
}
