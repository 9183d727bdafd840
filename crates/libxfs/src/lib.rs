//! Userspace XFS metadata layer.
//!
//! Provides the transaction shim, the in-core inode cache with its locks,
//! short-form directories and the namespace operations built on them
//! (create, link, remove and cross-directory rename).
//!
//! Lock order, outermost first:
//!
//! 1. inode locks, in ascending inode number;
//! 2. the per-cluster flush lock;
//! 3. inode flush locks.
//!
//! Hash bucket locks are leaves and are never held while blocking on an
//! inode lock.

pub use self::{
    error::{Errno, Result},
    events::{EventHooks, EventMask, RenameEvent},
    init::{FormatParams, format},
    inode::{Inode, InodeCore, LockFlags},
    mount::{Mount, MountId, MountParams, MountStats, StatsSnapshot},
    rename::{RenameLockSet, lock_for_rename, rename},
    trans::{CancelFlags, CommitFlags, Lsn, ReserveFlags, Trans, TransType},
};

pub mod dir;
pub mod dnlc;
mod error;
mod events;
mod init;
pub mod inode;
mod mount;
pub mod ops;
pub mod param;
pub mod path;
mod rename;
pub mod sync;
pub mod trans;

#[cfg(test)]
pub(crate) mod test_utils {
    use std::sync::Arc;

    use block_io::{BlockDevice, MemDevice};

    use crate::{FormatParams, Mount, MountParams, format};

    /// A freshly formatted in-memory filesystem.
    pub(crate) struct TestFs {
        pub(crate) dev: Arc<MemDevice>,
        pub(crate) mount: Arc<Mount>,
    }

    impl TestFs {
        pub(crate) fn new() -> Self {
            Self::with_params(&FormatParams::default(), MountParams::default())
        }

        pub(crate) fn with_params(format_params: &FormatParams, params: MountParams) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let size_bb = format_params.data_blocks * u64::from(format_params.block_size) / 512;
            let dev = Arc::new(MemDevice::new(size_bb));
            format(&*dev, format_params).unwrap();
            let device = Arc::clone(&dev) as Arc<dyn BlockDevice>;
            let mount = Mount::mount(device, params).unwrap();
            Self { dev, mount }
        }
    }
}
