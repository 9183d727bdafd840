//! Cross-directory rename.
//!
//! Names are looked up with only the directories locked, then every inode
//! involved is locked in ascending inode number. Directory generation
//! counters sampled at lookup time detect changes made in between; a
//! mismatch restarts the whole operation, so callers never observe it.

use std::sync::Arc;

use arrayvec::ArrayVec;
use log::{debug, trace, warn};
use xfs_types::{InodeNo, MAXLINK};

use crate::{
    Mount,
    dir::{self, is_dot_or_dotdot, validate_name},
    error::{Errno, Result},
    events::{EventMask, RenameEvent},
    inode::{
        ChgFlags, ILogFlags, Inode, LockFlags, distinct, lock_inodes, sort_inodes, unlock_inodes,
    },
    ops::{direnter_space_res, finish, reserve_dirop},
    param::{RENAME_LOG_COUNT, RENAME_LOG_RES},
    trans::{CancelFlags, Trans, TransType},
};

#[cfg(test)]
use crate::mount::RacePoint;

/// The inodes of a rename, locked exclusively in ascending inode number.
#[derive(Debug)]
pub struct RenameLockSet {
    /// Sorted; an inode playing two roles appears in adjacent slots.
    inodes: ArrayVec<Arc<Inode>, 4>,
    /// Generation of each entry of `inodes`, sampled once it was locked.
    gens: ArrayVec<u64, 4>,
    src_ip: Arc<Inode>,
    target_ip: Option<Arc<Inode>>,
}

impl RenameLockSet {
    #[must_use]
    pub fn inodes(&self) -> &[Arc<Inode>] {
        &self.inodes
    }

    #[must_use]
    pub fn generations(&self) -> &[u64] {
        &self.gens
    }

    /// The inode the source name refers to.
    #[must_use]
    pub fn src_ip(&self) -> &Arc<Inode> {
        &self.src_ip
    }

    /// The inode the target name refers to, if it exists.
    #[must_use]
    pub fn target_ip(&self) -> Option<&Arc<Inode>> {
        self.target_ip.as_ref()
    }

    fn changed(&self) -> bool {
        self.inodes
            .iter()
            .zip(&self.gens)
            .any(|(ip, gen_)| ip.generation() != *gen_)
    }

    /// Drops the references taken by the lookups. The locks must already
    /// be released.
    fn put(self, mount: &Mount) {
        if let Some(target_ip) = self.target_ip {
            mount.iput(target_ip, LockFlags::empty());
        }
        mount.iput(self.src_ip, LockFlags::empty());
    }

    /// Unlocks every inode and drops the references taken by the lookups.
    pub fn release(self, mount: &Mount) {
        unlock_inodes(&self.inodes, LockFlags::ILOCK_EXCL);
        self.put(mount);
    }
}

/// Looks up `name1` in `dp1` and `name2` in `dp2` and locks all of the
/// inodes involved.
///
/// The target name need not exist. Fails with [`Errno::NotFound`] if the
/// source name is missing or either directory has been unlinked.
pub fn lock_for_rename(
    mount: &Mount,
    dp1: &Arc<Inode>,
    dp2: &Arc<Inode>,
    name1: &[u8],
    name2: &[u8],
) -> Result<RenameLockSet> {
    let same_dir = Arc::ptr_eq(dp1, dp2);
    let mut retries = 0_u64;
    loop {
        let mode1 = dp1.ilock_map_shared();
        let (ino1, dir_gen1) = match lookup_source(mount, dp1, name1) {
            Ok(found) => found,
            Err(e) => {
                dp1.iunlock_map_shared(mode1);
                return Err(e);
            }
        };

        let mode2 = if same_dir {
            mode1
        } else {
            dp1.iunlock_map_shared(mode1);
            dp2.ilock_map_shared()
        };
        let target = if dp2.nlink() == 0 {
            Err(Errno::NotFound)
        } else {
            lookup_target(mount, dp2, name2)
        };
        let ino2 = match target {
            Ok(ino) => ino,
            Err(e) => {
                dp2.iunlock_map_shared(mode2);
                return Err(e);
            }
        };
        let dir_gen2 = dp2.generation();

        let refs = take_refs(mount, ino1, ino2);
        let (src_ip, target_ip) = match refs {
            Ok(refs) => refs,
            Err(e) => {
                dp2.iunlock_map_shared(mode2);
                return Err(e);
            }
        };

        let mut inodes = ArrayVec::<Arc<Inode>, 4>::new();
        inodes.push(Arc::clone(dp1));
        if !same_dir {
            inodes.push(Arc::clone(dp2));
        }
        inodes.push(Arc::clone(&src_ip));
        if let Some(ip) = &target_ip {
            inodes.push(Arc::clone(ip));
        }
        sort_inodes(&mut inodes);

        if Arc::ptr_eq(&inodes[0], dp2) && mode2 == LockFlags::ILOCK_EXCL {
            // dp2 already holds the lock it needs and comes first.
            let skip = inodes.iter().take_while(|ip| Arc::ptr_eq(*ip, dp2)).count();
            lock_inodes(&inodes[skip..], LockFlags::ILOCK_EXCL);
        } else {
            dp2.iunlock_map_shared(mode2);
            #[cfg(test)]
            mount.race_point(RacePoint::RenameLookup);
            lock_inodes(&inodes, LockFlags::ILOCK_EXCL);
        }

        if dp1.generation() != dir_gen1 || dp2.generation() != dir_gen2 {
            unlock_inodes(&inodes, LockFlags::ILOCK_EXCL);
            if let Some(ip) = target_ip {
                mount.iput(ip, LockFlags::empty());
            }
            mount.iput(src_ip, LockFlags::empty());
            mount.stats().rename_lock_retries.inc();
            retries += 1;
            if retries % mount.params().rename_retry_warn.max(1) == 0 {
                warn!("lock_for_rename: {retries} retries on {} and {}", dp1.ino(), dp2.ino());
            }
            trace!("lock_for_rename: directories changed, retrying");
            continue;
        }

        let gens = inodes.iter().map(|ip| ip.generation()).collect();
        return Ok(RenameLockSet {
            inodes,
            gens,
            src_ip,
            target_ip,
        });
    }
}

fn lookup_source(mount: &Mount, dp: &Inode, name: &[u8]) -> Result<(InodeNo, u64)> {
    if dp.nlink() == 0 {
        return Err(Errno::NotFound);
    }
    let ino = dir::lookup(mount, dp, name)?;
    Ok((ino, dp.generation()))
}

fn lookup_target(mount: &Mount, dp: &Inode, name: &[u8]) -> Result<Option<InodeNo>> {
    match dir::lookup(mount, dp, name) {
        Ok(ino) => Ok(Some(ino)),
        Err(Errno::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

fn take_refs(
    mount: &Mount,
    ino1: InodeNo,
    ino2: Option<InodeNo>,
) -> Result<(Arc<Inode>, Option<Arc<Inode>>)> {
    let src_ip = mount.iget(None, ino1, LockFlags::empty())?;
    let target_ip = match ino2.map(|ino| mount.iget(None, ino, LockFlags::empty())) {
        Some(Ok(ip)) => Some(ip),
        Some(Err(e)) => {
            mount.iput(src_ip, LockFlags::empty());
            return Err(e);
        }
        None => None,
    };
    Ok((src_ip, target_ip))
}

/// Renames `src_name` in `src_dp` to `target_name` in `target_dp`,
/// replacing an existing target entry.
///
/// Registered [`crate::EventHooks`] get a pre-rename event, which may veto
/// the rename, and exactly one post-rename event with the outcome.
pub fn rename(
    mount: &Arc<Mount>,
    src_dp: &Arc<Inode>,
    src_name: &[u8],
    target_dp: &Arc<Inode>,
    target_name: &[u8],
) -> Result<()> {
    validate_name(src_name)?;
    validate_name(target_name)?;
    if src_dp.mount_id() != mount.id() || target_dp.mount_id() != mount.id() {
        return Err(Errno::CrossesDevices);
    }
    if !src_dp.is_dir() || !target_dp.is_dir() {
        return Err(Errno::NotADirectory);
    }

    let event = RenameEvent {
        src_dir: src_dp.ino(),
        src_name,
        target_dir: target_dp.ino(),
        target_name,
    };
    let dirs: [&Inode; 2] = [src_dp, target_dp];
    if let Some(hooks) = mount.event_hooks_for(EventMask::RENAME, &dirs) {
        hooks.pre_rename(&event)?;
    }

    let res = rename_retrying(mount, src_dp, src_name, target_dp, target_name);

    if let Some(hooks) = mount.event_hooks_for(EventMask::POSTRENAME, &dirs) {
        hooks.post_rename(&event, res);
    }
    res
}

fn rename_retrying(
    mount: &Arc<Mount>,
    src_dp: &Arc<Inode>,
    src_name: &[u8],
    target_dp: &Arc<Inode>,
    target_name: &[u8],
) -> Result<()> {
    let mut restarts = 0_u64;
    loop {
        let set = lock_for_rename(mount, src_dp, target_dp, src_name, target_name)?;
        unlock_inodes(&set.inodes, LockFlags::ILOCK_EXCL);
        #[cfg(test)]
        mount.race_point(RacePoint::RenameUnlocked);

        let mut tp = Trans::alloc(mount, TransType::Rename);
        let spaceres = direnter_space_res(mount, target_name.len());
        let total = match reserve_dirop(&mut tp, spaceres, RENAME_LOG_RES, RENAME_LOG_COUNT) {
            Ok(total) => total,
            Err(e) => {
                tp.cancel(CancelFlags::empty());
                set.put(mount);
                return Err(e);
            }
        };

        lock_inodes(&set.inodes, LockFlags::ILOCK_EXCL);
        if set.changed() {
            set.release(mount);
            tp.cancel(CancelFlags::RELEASE_LOG_RES);
            mount.stats().rename_restarts.inc();
            restarts += 1;
            if restarts % mount.params().rename_retry_warn.max(1) == 0 {
                warn!(
                    "rename: restarted {restarts} times on {} and {}",
                    src_dp.ino(),
                    target_dp.ino()
                );
            }
            trace!("rename: inodes changed while unlocked, restarting");
            continue;
        }

        for ip in distinct(&set.inodes) {
            tp.ijoin(ip, LockFlags::ILOCK_EXCL);
        }
        let names = Names {
            src_dp,
            src_name,
            target_dp,
            target_name,
        };
        let res = rename_locked(mount, &mut tp, &set, &names, total);
        let res = finish(tp, res);

        if let Ok(Some((ino, last_link))) = res {
            mount.name_cache().purge_inode(ino);
            let dirs: [&Inode; 2] = [src_dp, target_dp];
            if last_link
                && let Some(hooks) = mount.event_hooks_for(EventMask::POSTREMOVE, &dirs)
            {
                hooks.link_removed(target_dp.ino(), ino);
            }
        }
        set.put(mount);
        if res.is_ok() {
            debug!(
                "renamed {}/{:?} to {}/{:?}",
                src_dp.ino(),
                src_name.escape_ascii().to_string(),
                target_dp.ino(),
                target_name.escape_ascii().to_string()
            );
        }
        return res.map(|_| ());
    }
}

#[derive(Clone, Copy)]
struct Names<'a> {
    src_dp: &'a Arc<Inode>,
    src_name: &'a [u8],
    target_dp: &'a Arc<Inode>,
    target_name: &'a [u8],
}

/// Validates the rename and applies it with every inode locked and joined.
///
/// Returns the replaced target inode and whether it lost its last link.
fn rename_locked(
    mount: &Mount,
    tp: &mut Trans,
    set: &RenameLockSet,
    names: &Names<'_>,
    total: u64,
) -> Result<Option<(InodeNo, bool)>> {
    let Names {
        src_dp,
        src_name,
        target_dp,
        target_name,
    } = *names;
    let src_ip = &set.src_ip;
    let target_ip = set.target_ip.as_ref();

    if target_dp.nlink() == 0 {
        return Err(Errno::NotFound);
    }
    if Arc::ptr_eq(src_ip, src_dp)
        || Arc::ptr_eq(src_ip, target_dp)
        || target_ip.is_some_and(|ip| Arc::ptr_eq(ip, target_dp))
    {
        return Err(Errno::InvalidInput);
    }
    if target_ip.is_some_and(|ip| Arc::ptr_eq(ip, src_ip)) {
        trace!("rename: source and target are the same inode");
        return Ok(None);
    }

    let src_is_dir = src_ip.is_dir();
    let new_parent = !Arc::ptr_eq(src_dp, target_dp);
    if src_is_dir && (is_dot_or_dotdot(src_name) || is_dot_or_dotdot(target_name)) {
        return Err(Errno::InvalidInput);
    }
    if src_is_dir && new_parent && target_dp.nlink() >= MAXLINK {
        return Err(Errno::TooManyLinks);
    }

    let replaced = match target_ip {
        None => {
            if total == 0 {
                mount.dir_ops().can_enter(target_dp, target_name)?;
            }
            dir::create_name(tp, target_dp, target_name, src_ip.ino(), total)?;
            target_dp.ichgtime(ChgFlags::MOD | ChgFlags::CHG);
            if new_parent && src_is_dir {
                target_dp.bumplink(tp);
            }
            None
        }
        Some(target_ip) => Some(replace_target(
            mount,
            tp,
            src_ip,
            target_dp,
            target_ip,
            target_name,
        )?),
    };
    tp.log_inode(target_dp, ILogFlags::CORE);

    if new_parent && src_is_dir {
        dir::replace(tp, src_ip, b"..", target_dp.ino())?;
    }
    src_ip.ichgtime(ChgFlags::CHG);
    tp.log_inode(src_ip, ILogFlags::CORE);

    if src_is_dir && (new_parent || target_ip.is_some()) {
        src_dp.droplink(tp);
    }
    dir::remove_name(tp, src_dp, src_name, src_ip.ino())?;
    src_dp.ichgtime(ChgFlags::MOD | ChgFlags::CHG);
    tp.log_inode(src_dp, ILogFlags::CORE);

    src_dp.bump_generation();
    if new_parent {
        target_dp.bump_generation();
    }
    Ok(replaced)
}

/// Points the existing entry `name` in `target_dp` at `src_ip` and drops
/// the links of the inode it replaces.
fn replace_target(
    mount: &Mount,
    tp: &mut Trans,
    src_ip: &Inode,
    target_dp: &Inode,
    target_ip: &Inode,
    name: &[u8],
) -> Result<(InodeNo, bool)> {
    let src_is_dir = src_ip.is_dir();
    match (src_is_dir, target_ip.is_dir()) {
        (false, true) => return Err(Errno::IsADirectory),
        (true, false) => return Err(Errno::NotADirectory),
        (true, true) if !mount.dir_ops().is_empty(target_ip) || target_ip.nlink() > 2 => {
            return Err(Errno::DirectoryNotEmpty);
        }
        _ => {}
    }

    dir::replace(tp, target_dp, name, src_ip.ino())?;
    target_dp.ichgtime(ChgFlags::MOD | ChgFlags::CHG);
    target_ip.droplink(tp);
    if src_is_dir {
        // The replaced directory's "." goes away too.
        target_ip.droplink(tp);
    }
    Ok((target_ip.ino(), target_ip.nlink() == 0))
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Mutex, mpsc},
        thread,
        time::Duration,
    };

    use xfs_types::S_IFREG;

    use super::*;
    use crate::{
        events::EventHooks,
        ops,
        test_utils::TestFs,
        trans::{CommitFlags, SbField},
    };

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Pre(Vec<u8>, Vec<u8>),
        Post(Result<()>),
        LinkRemoved(InodeNo, InodeNo),
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
        veto: Option<Errno>,
    }

    impl Recorder {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    impl EventHooks for Recorder {
        fn pre_rename(&self, event: &RenameEvent<'_>) -> Result<()> {
            self.events.lock().unwrap().push(Event::Pre(
                event.src_name.to_vec(),
                event.target_name.to_vec(),
            ));
            self.veto.map_or(Ok(()), Err)
        }

        fn post_rename(&self, _event: &RenameEvent<'_>, status: Result<()>) {
            self.events.lock().unwrap().push(Event::Post(status));
        }

        fn link_removed(&self, dir: InodeNo, ino: InodeNo) {
            self.events.lock().unwrap().push(Event::LinkRemoved(dir, ino));
        }
    }

    fn record(fs: &TestFs, veto: Option<Errno>) -> Arc<Recorder> {
        let rec = Arc::new(Recorder {
            veto,
            ..Recorder::default()
        });
        fs.mount
            .set_event_hooks(Some(Arc::clone(&rec) as Arc<dyn EventHooks>));
        fs.mount
            .set_event_mask(EventMask::RENAME | EventMask::POSTRENAME | EventMask::POSTREMOVE);
        rec
    }

    struct Tree {
        root: Arc<Inode>,
        a: Arc<Inode>,
        b: Arc<Inode>,
    }

    impl Tree {
        fn new(fs: &TestFs) -> Self {
            let root = fs.mount.root().unwrap();
            let a = ops::mkdir(&fs.mount, &root, b"a", 0o755).unwrap();
            let b = ops::mkdir(&fs.mount, &root, b"b", 0o755).unwrap();
            Self { root, a, b }
        }

        fn put(self, fs: &TestFs) {
            for ip in [self.b, self.a, self.root] {
                fs.mount.iput(ip, LockFlags::empty());
            }
        }
    }

    fn file(fs: &TestFs, dp: &Arc<Inode>, name: &[u8]) -> InodeNo {
        let ip = ops::create(&fs.mount, dp, name, S_IFREG | 0o644).unwrap();
        let ino = ip.ino();
        fs.mount.iput(ip, LockFlags::empty());
        ino
    }

    fn dir(fs: &TestFs, dp: &Arc<Inode>, name: &[u8]) -> Arc<Inode> {
        ops::mkdir(&fs.mount, dp, name, 0o755).unwrap()
    }

    fn ino_of(fs: &TestFs, dp: &Inode, name: &[u8]) -> Result<InodeNo> {
        let ip = ops::lookup(&fs.mount, dp, name)?;
        let ino = ip.ino();
        fs.mount.iput(ip, LockFlags::empty());
        Ok(ino)
    }

    fn nlink_of(fs: &TestFs, ino: InodeNo) -> u32 {
        let ip = fs.mount.iget(None, ino, LockFlags::empty()).unwrap();
        let nlink = ip.nlink();
        fs.mount.iput(ip, LockFlags::empty());
        nlink
    }

    fn is_unlocked(ip: &Inode) -> bool {
        let free = ip.ilock_nowait(LockFlags::ILOCK_EXCL);
        if free {
            ip.iunlock(LockFlags::ILOCK_EXCL);
        }
        free
    }

    #[test]
    fn lock_set_is_sorted_and_locked() {
        let fs = TestFs::new();
        let t = Tree::new(&fs);
        let f1 = file(&fs, &t.a, b"f1");
        let f2 = file(&fs, &t.b, b"f2");

        let set = lock_for_rename(&fs.mount, &t.b, &t.a, b"f2", b"f1").unwrap();
        assert_eq!(set.inodes().len(), 4);
        assert!(set.inodes().is_sorted_by_key(|ip| ip.ino()));
        assert!(set.inodes().iter().all(|ip| ip.is_ilocked(LockFlags::ILOCK_EXCL)));
        assert_eq!(set.src_ip().ino(), f2);
        assert_eq!(set.target_ip().map(|ip| ip.ino()), Some(f1));
        assert_eq!(set.generations().len(), 4);
        let inodes = set.inodes().to_vec();
        set.release(&fs.mount);
        assert!(inodes.iter().all(|ip| is_unlocked(ip)));
        t.put(&fs);
    }

    #[test]
    fn lock_set_within_one_directory() {
        let fs = TestFs::new();
        let t = Tree::new(&fs);
        let f1 = file(&fs, &t.a, b"f1");

        let set = lock_for_rename(&fs.mount, &t.a, &t.a, b"f1", b"new").unwrap();
        assert_eq!(set.inodes().len(), 2);
        assert_eq!(set.src_ip().ino(), f1);
        assert!(set.target_ip().is_none());
        set.release(&fs.mount);

        // Both names refer to the same inode: it appears twice but is
        // locked once.
        let set = lock_for_rename(&fs.mount, &t.a, &t.a, b"f1", b"f1").unwrap();
        assert_eq!(set.inodes().len(), 3);
        set.release(&fs.mount);
        assert!(is_unlocked(&t.a));
        t.put(&fs);
    }

    #[test]
    fn lock_set_missing_source() {
        let fs = TestFs::new();
        let t = Tree::new(&fs);
        let err = lock_for_rename(&fs.mount, &t.a, &t.b, b"nope", b"x").unwrap_err();
        assert_eq!(err, Errno::NotFound);
        assert!(is_unlocked(&t.a));
        assert!(is_unlocked(&t.b));
        t.put(&fs);
    }

    #[test]
    fn lock_set_retries_after_concurrent_change() {
        let fs = TestFs::new();
        let t = Tree::new(&fs);
        file(&fs, &t.a, b"f1");

        let (mount, b) = (Arc::clone(&fs.mount), Arc::clone(&t.b));
        fs.mount.set_race_hook(RacePoint::RenameLookup, move || {
            let ip = ops::create(&mount, &b, b"g", S_IFREG).unwrap();
            mount.iput(ip, LockFlags::empty());
        });
        let set = lock_for_rename(&fs.mount, &t.a, &t.b, b"f1", b"g").unwrap();
        assert_eq!(fs.mount.stats().snapshot().rename_lock_retries, 1);
        let g = set.target_ip().map(|ip| ip.ino());
        set.release(&fs.mount);
        assert!(g.is_some());
        assert_eq!(g, ino_of(&fs, &t.b, b"g").ok());
        t.put(&fs);
    }

    #[test]
    fn file_replaces_file_across_directories() {
        let fs = TestFs::new();
        let rec = record(&fs, None);
        let t = Tree::new(&fs);
        let f1 = file(&fs, &t.a, b"f1");
        let f2 = file(&fs, &t.b, b"f2");
        let (a_links, b_links) = (t.a.nlink(), t.b.nlink());

        rename(&fs.mount, &t.a, b"f1", &t.b, b"f2").unwrap();

        assert_eq!(ino_of(&fs, &t.a, b"f1"), Err(Errno::NotFound));
        assert_eq!(ino_of(&fs, &t.b, b"f2"), Ok(f1));
        assert_eq!(nlink_of(&fs, f2), 0);
        assert_eq!(nlink_of(&fs, f1), 1);
        assert_eq!((t.a.nlink(), t.b.nlink()), (a_links, b_links));
        assert_eq!(
            rec.events(),
            [
                Event::Pre(b"f1".to_vec(), b"f2".to_vec()),
                Event::LinkRemoved(t.b.ino(), f2),
                Event::Post(Ok(())),
            ]
        );
        t.put(&fs);
    }

    #[test]
    fn replaced_target_with_other_links() {
        let fs = TestFs::new();
        let rec = record(&fs, None);
        let t = Tree::new(&fs);
        file(&fs, &t.a, b"f1");
        let f2 = file(&fs, &t.b, b"f2");
        let f2_ip = fs.mount.iget(None, f2, LockFlags::empty()).unwrap();
        ops::link(&fs.mount, &f2_ip, &t.a, b"f2-link").unwrap();

        rename(&fs.mount, &t.a, b"f1", &t.b, b"f2").unwrap();
        assert_eq!(f2_ip.nlink(), 1);
        assert_eq!(ino_of(&fs, &t.a, b"f2-link"), Ok(f2));
        // f2 survives through its other link.
        assert!(
            !rec.events()
                .iter()
                .any(|e| matches!(e, Event::LinkRemoved(..)))
        );
        fs.mount.iput(f2_ip, LockFlags::empty());
        t.put(&fs);
    }

    #[test]
    fn directory_moves_to_new_parent() {
        let fs = TestFs::new();
        let t = Tree::new(&fs);
        let sub = dir(&fs, &t.a, b"sub");
        let (a_links, b_links) = (t.a.nlink(), t.b.nlink());

        rename(&fs.mount, &t.a, b"sub", &t.b, b"sub2").unwrap();

        assert_eq!(ino_of(&fs, &sub, b".."), Ok(t.b.ino()));
        assert_eq!(t.a.nlink(), a_links - 1);
        assert_eq!(t.b.nlink(), b_links + 1);
        assert_eq!(sub.nlink(), 2);
        assert_eq!(ino_of(&fs, &t.b, b"sub2"), Ok(sub.ino()));
        assert_eq!(ino_of(&fs, &t.a, b"sub"), Err(Errno::NotFound));
        fs.mount.iput(sub, LockFlags::empty());
        t.put(&fs);
    }

    #[test]
    fn rename_within_directory() {
        let fs = TestFs::new();
        let t = Tree::new(&fs);
        let f = file(&fs, &t.a, b"old");
        let gen_ = t.a.generation();
        rename(&fs.mount, &t.a, b"old", &t.a, b"new").unwrap();
        assert_eq!(ino_of(&fs, &t.a, b"new"), Ok(f));
        assert_eq!(ino_of(&fs, &t.a, b"old"), Err(Errno::NotFound));
        assert!(t.a.generation() > gen_);
        t.put(&fs);
    }

    #[test]
    fn rename_onto_itself_is_a_no_op() {
        let fs = TestFs::new();
        let rec = record(&fs, None);
        let t = Tree::new(&fs);
        let f = file(&fs, &t.a, b"f");
        let f_ip = fs.mount.iget(None, f, LockFlags::empty()).unwrap();
        ops::link(&fs.mount, &f_ip, &t.a, b"g").unwrap();
        let gen_ = t.a.generation();

        rename(&fs.mount, &t.a, b"f", &t.a, b"f").unwrap();
        rename(&fs.mount, &t.a, b"f", &t.a, b"g").unwrap();

        assert_eq!(t.a.generation(), gen_);
        assert_eq!(f_ip.nlink(), 2);
        assert_eq!(ino_of(&fs, &t.a, b"f"), Ok(f));
        assert_eq!(ino_of(&fs, &t.a, b"g"), Ok(f));
        assert!(
            !rec.events()
                .iter()
                .any(|e| matches!(e, Event::LinkRemoved(..)))
        );
        fs.mount.iput(f_ip, LockFlags::empty());
        t.put(&fs);
    }

    #[test]
    fn non_empty_directory_target_is_refused() {
        let fs = TestFs::new();
        let t = Tree::new(&fs);
        let d1 = dir(&fs, &t.a, b"d1");
        let d2 = dir(&fs, &t.b, b"d2");
        file(&fs, &d2, b"keep");
        let (a_links, b_links) = (t.a.nlink(), t.b.nlink());

        let err = rename(&fs.mount, &t.a, b"d1", &t.b, b"d2").unwrap_err();
        assert_eq!(err, Errno::DirectoryNotEmpty);
        assert_eq!((t.a.nlink(), t.b.nlink()), (a_links, b_links));
        assert_eq!(ino_of(&fs, &t.a, b"d1"), Ok(d1.ino()));
        assert_eq!(ino_of(&fs, &d1, b".."), Ok(t.a.ino()));

        ops::remove(&fs.mount, &d2, b"keep").unwrap();
        rename(&fs.mount, &t.a, b"d1", &t.b, b"d2").unwrap();
        assert_eq!(d2.nlink(), 0);
        assert_eq!(t.a.nlink(), a_links - 1);
        assert_eq!(t.b.nlink(), b_links);
        assert_eq!(ino_of(&fs, &t.b, b"d2"), Ok(d1.ino()));
        assert_eq!(ino_of(&fs, &d1, b".."), Ok(t.b.ino()));
        for ip in [d2, d1] {
            fs.mount.iput(ip, LockFlags::empty());
        }
        t.put(&fs);
    }

    #[test]
    fn mismatched_types_are_refused() {
        let fs = TestFs::new();
        let t = Tree::new(&fs);
        let f = file(&fs, &t.a, b"f");
        let d = dir(&fs, &t.b, b"d");
        let gens = (t.a.generation(), t.b.generation());

        assert_eq!(
            rename(&fs.mount, &t.a, b"f", &t.b, b"d").unwrap_err(),
            Errno::IsADirectory
        );
        assert_eq!(
            rename(&fs.mount, &t.b, b"d", &t.a, b"f").unwrap_err(),
            Errno::NotADirectory
        );

        assert_eq!((t.a.generation(), t.b.generation()), gens);
        assert_eq!(ino_of(&fs, &t.a, b"f"), Ok(f));
        assert_eq!(ino_of(&fs, &t.b, b"d"), Ok(d.ino()));
        assert_eq!(nlink_of(&fs, f), 1);
        assert_eq!(d.nlink(), 2);
        assert_eq!(ino_of(&fs, &d, b".."), Ok(t.b.ino()));
        fs.mount.iput(d, LockFlags::empty());
        t.put(&fs);
    }

    #[test]
    fn degenerate_names_are_refused() {
        let fs = TestFs::new();
        let t = Tree::new(&fs);
        let sub = dir(&fs, &t.a, b"sub");
        assert_eq!(
            rename(&fs.mount, &t.a, b".", &t.b, b"x").unwrap_err(),
            Errno::InvalidInput
        );
        assert_eq!(
            rename(&fs.mount, &sub, b"..", &t.b, b"x").unwrap_err(),
            Errno::InvalidInput
        );
        assert_eq!(
            rename(&fs.mount, &t.a, b"sub", &sub, b"x").unwrap_err(),
            Errno::InvalidInput
        );
        assert_eq!(
            rename(&fs.mount, &t.a, b"sub", &t.b, b"").unwrap_err(),
            Errno::InvalidInput
        );
        fs.mount.iput(sub, LockFlags::empty());
        t.put(&fs);
    }

    #[test]
    fn pre_rename_veto() {
        let fs = TestFs::new();
        let rec = record(&fs, Some(Errno::NotPermitted));
        let t = Tree::new(&fs);
        let f = file(&fs, &t.a, b"f");
        let err = rename(&fs.mount, &t.a, b"f", &t.b, b"g").unwrap_err();
        assert_eq!(err, Errno::NotPermitted);
        assert_eq!(rec.events(), [Event::Pre(b"f".to_vec(), b"g".to_vec())]);
        assert_eq!(ino_of(&fs, &t.a, b"f"), Ok(f));
        t.put(&fs);
    }

    #[test]
    fn failed_rename_is_reported_once() {
        let fs = TestFs::new();
        let rec = record(&fs, None);
        let t = Tree::new(&fs);
        let err = rename(&fs.mount, &t.a, b"missing", &t.b, b"g").unwrap_err();
        assert_eq!(err, Errno::NotFound);
        assert_eq!(
            rec.events(),
            [
                Event::Pre(b"missing".to_vec(), b"g".to_vec()),
                Event::Post(Err(Errno::NotFound)),
            ]
        );
        t.put(&fs);
    }

    #[test]
    fn hooks_follow_directory_masks() {
        let fs = TestFs::new();
        let rec = record(&fs, None);
        fs.mount.set_event_mask(EventMask::empty());
        let t = Tree::new(&fs);
        file(&fs, &t.a, b"f");
        rename(&fs.mount, &t.a, b"f", &t.b, b"g").unwrap();
        assert!(rec.events().is_empty());

        t.b.set_event_mask(EventMask::POSTRENAME);
        rename(&fs.mount, &t.b, b"g", &t.a, b"f").unwrap();
        assert_eq!(rec.events(), [Event::Post(Ok(()))]);
        t.put(&fs);
    }

    #[test]
    fn restarts_when_directory_changes_while_unlocked() {
        let fs = TestFs::new();
        let t = Tree::new(&fs);
        let f = file(&fs, &t.a, b"f");

        let (mount, a) = (Arc::clone(&fs.mount), Arc::clone(&t.a));
        fs.mount.set_race_hook(RacePoint::RenameUnlocked, move || {
            let ip = ops::create(&mount, &a, b"other", S_IFREG).unwrap();
            mount.iput(ip, LockFlags::empty());
        });
        rename(&fs.mount, &t.a, b"f", &t.b, b"f").unwrap();

        assert_eq!(fs.mount.stats().snapshot().rename_restarts, 1);
        assert_eq!(ino_of(&fs, &t.b, b"f"), Ok(f));
        assert!(ino_of(&fs, &t.a, b"other").is_ok());
        assert_eq!(ino_of(&fs, &t.a, b"f"), Err(Errno::NotFound));
        t.put(&fs);
    }

    #[test]
    fn restart_observes_removed_source() {
        let fs = TestFs::new();
        let t = Tree::new(&fs);
        file(&fs, &t.a, b"f");

        let (mount, a) = (Arc::clone(&fs.mount), Arc::clone(&t.a));
        fs.mount.set_race_hook(RacePoint::RenameUnlocked, move || {
            ops::remove(&mount, &a, b"f").unwrap();
        });
        let err = rename(&fs.mount, &t.a, b"f", &t.b, b"f").unwrap_err();
        assert_eq!(err, Errno::NotFound);
        assert_eq!(ino_of(&fs, &t.b, b"f"), Err(Errno::NotFound));
        t.put(&fs);
    }

    #[test]
    fn no_block_reservation_falls_back_to_free_space_check() {
        let fs = TestFs::new();
        let t = Tree::new(&fs);
        let f = file(&fs, &t.a, b"f");

        let mut tp = Trans::alloc(&fs.mount, TransType::Setattr);
        let free = i64::try_from(fs.mount.sb().fdblocks).unwrap();
        tp.mod_sb(SbField::Fdblocks, -free);
        tp.commit(CommitFlags::empty()).unwrap();
        assert_eq!(fs.mount.sb().fdblocks, 0);

        rename(&fs.mount, &t.a, b"f", &t.b, b"g").unwrap();
        assert_eq!(ino_of(&fs, &t.b, b"g"), Ok(f));

        // Fill the target so that nothing more fits in its literal area.
        let mut n = 0;
        while ops::create(&fs.mount, &t.a, format!("n{n:03}").as_bytes(), S_IFREG)
            .map(|ip| fs.mount.iput(ip, LockFlags::empty()))
            .is_ok()
        {
            n += 1;
        }
        let err = rename(&fs.mount, &t.b, b"g", &t.a, b"zzzz").unwrap_err();
        assert_eq!(err, Errno::StorageFull);
        assert_eq!(ino_of(&fs, &t.b, b"g"), Ok(f));
        assert_eq!(ino_of(&fs, &t.a, b"zzzz"), Err(Errno::NotFound));
        t.put(&fs);
    }

    #[test]
    fn concurrent_renames_do_not_deadlock() {
        const ROUNDS: usize = 200;

        let fs = TestFs::new();
        let t = Tree::new(&fs);
        let x = file(&fs, &t.a, b"x");
        let y = file(&fs, &t.b, b"y");

        let (done_tx, done_rx) = mpsc::channel();
        let spawn = |src: &Arc<Inode>, dst: &Arc<Inode>, name: &'static [u8]| {
            let (mount, src, dst, done) = (
                Arc::clone(&fs.mount),
                Arc::clone(src),
                Arc::clone(dst),
                done_tx.clone(),
            );
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    rename(&mount, &src, name, &dst, name).unwrap();
                    rename(&mount, &dst, name, &src, name).unwrap();
                }
                done.send(()).unwrap();
            })
        };
        let handles = [
            spawn(&t.a, &t.b, b"x"),
            spawn(&t.b, &t.a, b"y"),
        ];
        let churn = {
            let (mount, a, done) = (Arc::clone(&fs.mount), Arc::clone(&t.a), done_tx.clone());
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let ip = ops::create(&mount, &a, b"tmp", S_IFREG).unwrap();
                    mount.iput(ip, LockFlags::empty());
                    ops::remove(&mount, &a, b"tmp").unwrap();
                }
                done.send(()).unwrap();
            })
        };

        for _ in 0..3 {
            done_rx
                .recv_timeout(Duration::from_secs(60))
                .expect("renames deadlocked");
        }
        for h in handles {
            h.join().unwrap();
        }
        churn.join().unwrap();

        assert_eq!(ino_of(&fs, &t.a, b"x"), Ok(x));
        assert_eq!(ino_of(&fs, &t.b, b"y"), Ok(y));
        assert_eq!(nlink_of(&fs, x), 1);
        assert_eq!(nlink_of(&fs, y), 1);
        t.put(&fs);
    }
}
