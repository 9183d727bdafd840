//! Namespace event notifications.
//!
//! A consumer registers [`EventHooks`] on the mount and selects events with
//! an [`EventMask`], either for the whole mount or per inode. A pre-event
//! may veto the operation; post-events only observe the outcome.

use std::sync::Arc;

use bitflags::bitflags;
use xfs_types::InodeNo;

use crate::{Mount, error::Result, inode::Inode};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventMask: u32 {
        const RENAME = 0x01;
        const POSTRENAME = 0x02;
        const REMOVE = 0x04;
        const POSTREMOVE = 0x08;
    }
}

/// Arguments of a rename event.
#[derive(Debug, Clone, Copy)]
pub struct RenameEvent<'a> {
    pub src_dir: InodeNo,
    pub src_name: &'a [u8],
    pub target_dir: InodeNo,
    pub target_name: &'a [u8],
}

pub trait EventHooks: Send + Sync {
    /// Called before a rename; an error aborts it.
    fn pre_rename(&self, event: &RenameEvent<'_>) -> Result<()> {
        let _ = event;
        Ok(())
    }

    /// Called exactly once after every rename that passed the pre-event.
    fn post_rename(&self, event: &RenameEvent<'_>, status: Result<()>) {
        let _ = (event, status);
    }

    /// Called when the last link to `ino`, held by directory `dir`, went
    /// away.
    ///
    /// Removing a link of an inode that keeps other links is not reported.
    fn link_removed(&self, dir: InodeNo, ino: InodeNo) {
        let _ = (dir, ino);
    }
}

impl Mount {
    /// Returns the hooks if `event` is enabled on the mount or on any of
    /// `inodes`.
    pub(crate) fn event_hooks_for(
        &self,
        event: EventMask,
        inodes: &[&Inode],
    ) -> Option<Arc<dyn EventHooks>> {
        let hooks = self.event_hooks()?;
        let enabled = self.event_mask().intersects(event)
            || inodes.iter().any(|ip| ip.event_mask().intersects(event));
        enabled.then_some(hooks)
    }
}
