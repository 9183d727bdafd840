//! Log items attached to a transaction.

use std::sync::Arc;

use bitflags::bitflags;
use block_io::Buf;

use super::DescId;
use crate::{
    inode::{Inode, InodeSnapshot, LockFlags},
    param::BLI_CHUNK,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct BliFlags: u8 {
        /// Keep the buffer attached past commit.
        const HOLD = 0x1;
        /// Some range of the buffer was logged.
        const DIRTY = 0x2;
    }
}

/// A buffer attached to a transaction.
#[derive(Debug)]
pub(crate) struct BufLogItem {
    pub(crate) buf: Buf,
    /// Descriptor holding this item, set when it is added to a transaction.
    pub(crate) desc: Option<DescId>,
    /// Number of times the buffer was re-acquired by the transaction.
    pub(crate) recur: u32,
    pub(crate) flags: BliFlags,
    /// One bit per [`BLI_CHUNK`] bytes of the buffer.
    dirty_map: Vec<u64>,
}

impl BufLogItem {
    pub(crate) fn new(buf: Buf) -> Self {
        let chunks = buf.len_bytes().div_ceil(BLI_CHUNK);
        Self {
            buf,
            desc: None,
            recur: 0,
            flags: BliFlags::empty(),
            dirty_map: vec![0; chunks.div_ceil(64)],
        }
    }

    /// Marks bytes `first..=last` as logged.
    pub(crate) fn log_range(&mut self, first: usize, last: usize) {
        assert!(
            first <= last && last < self.buf.len_bytes(),
            "logging range {first}..={last} outside buffer of {} bytes",
            self.buf.len_bytes()
        );
        for chunk in first / BLI_CHUNK..=last / BLI_CHUNK {
            self.dirty_map[chunk / 64] |= 1 << (chunk % 64);
        }
        self.flags |= BliFlags::DIRTY;
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.flags.contains(BliFlags::DIRTY)
    }

    /// Returns the logged byte ranges, merged and in ascending order.
    pub(crate) fn dirty_ranges(&self) -> Vec<(usize, usize)> {
        let nchunks = self.buf.len_bytes().div_ceil(BLI_CHUNK);
        let mut ranges: Vec<(usize, usize)> = vec![];
        for chunk in (0..nchunks).filter(|c| self.dirty_map[c / 64] & (1 << (c % 64)) != 0) {
            let start = chunk * BLI_CHUNK;
            let end = (start + BLI_CHUNK).min(self.buf.len_bytes());
            match ranges.last_mut() {
                Some(last) if last.1 == start => last.1 = end,
                _ => ranges.push((start, end)),
            }
        }
        ranges
    }
}

/// An inode joined to a transaction.
#[derive(Debug)]
pub(crate) struct InodeLogItem {
    pub(crate) inode: Arc<Inode>,
    /// Locks released when the transaction finishes.
    pub(crate) lock_flags: LockFlags,
    /// Keep the inode locked past commit.
    pub(crate) hold: bool,
    /// Lookups of the inode through the transaction not yet put back.
    pub(crate) iget_count: u32,
    /// The item holds the inode reference taken by the first lookup.
    pub(crate) owns_ref: bool,
    /// State put back if the transaction aborts.
    pub(crate) saved: Option<InodeSnapshot>,
}

/// An item tracked by a transaction.
#[derive(Debug)]
pub(crate) enum LogItem {
    Buf(BufLogItem),
    Inode(InodeLogItem),
}

/// Identifies the object whose log item is looked up.
#[derive(Debug, Clone, Copy)]
pub enum ItemRef<'a> {
    Buf(&'a Buf),
    Inode(&'a Inode),
}

#[cfg(test)]
mod tests {
    use block_io::{BufCache, DevId, MemDevice};

    use super::*;

    #[test]
    fn dirty_ranges_are_chunk_aligned_and_merged() {
        let cache = BufCache::new(DevId(0), Arc::new(MemDevice::new(16)));
        let mut bli = BufLogItem::new(cache.get(0, 2));
        assert!(!bli.is_dirty());

        bli.log_range(10, 20);
        bli.log_range(130, 140);
        bli.log_range(600, 700);
        assert!(bli.is_dirty());
        assert_eq!(bli.dirty_ranges(), [(0, 256), (512, 768)]);
    }

    #[test]
    #[should_panic(expected = "outside buffer")]
    fn logging_past_the_end_panics() {
        let cache = BufCache::new(DevId(0), Arc::new(MemDevice::new(16)));
        let mut bli = BufLogItem::new(cache.get(0, 1));
        bli.log_range(0, 512);
    }
}
