//! Buffers in transactions.

use block_io::{Buf, BufKey};
use log::trace;

use super::{
    DescId, Trans,
    item::{BliFlags, BufLogItem, ItemRef, LogItem},
};
use crate::error::Result;

impl Trans {
    /// Returns the descriptor of the attached buffer matching `key`.
    fn match_buf(&self, key: BufKey) -> Option<DescId> {
        self.items.ids().into_iter().find(|&id| {
            matches!(&self.items.get(id).item, LogItem::Buf(bli) if bli.buf.key() == key)
        })
    }

    fn bli_mut(&mut self, id: DescId) -> &mut BufLogItem {
        match &mut self.items.get_mut(id).item {
            LogItem::Buf(bli) => bli,
            LogItem::Inode(_) => panic!("descriptor {id:?} does not hold a buffer"),
        }
    }

    /// Re-acquires an attached buffer, if any.
    fn recur_buf(&mut self, daddr: u64, len: u32) -> Option<Buf> {
        let id = self.match_buf(self.mount.bufs().key(daddr, len))?;
        let bli = self.bli_mut(id);
        bli.recur += 1;
        Some(bli.buf.clone())
    }

    /// Returns the buffer for `len` basic blocks at `daddr` without reading it.
    ///
    /// A buffer already attached to the transaction is returned again.
    pub fn get_buf(&mut self, daddr: u64, len: u32) -> Buf {
        if let Some(buf) = self.recur_buf(daddr, len) {
            return buf;
        }
        let buf = self.mount.bufs().get(daddr, len);
        self.add_item(LogItem::Buf(BufLogItem::new(buf.clone())));
        buf
    }

    /// Reads `len` basic blocks at `daddr` and attaches the buffer.
    ///
    /// A buffer already attached to the transaction is returned again
    /// without I/O.
    pub fn read_buf(&mut self, daddr: u64, len: u32) -> Result<Buf> {
        if let Some(buf) = self.recur_buf(daddr, len) {
            return Ok(buf);
        }
        let buf = self.mount.bufs().read(daddr, len)?;
        self.add_item(LogItem::Buf(BufLogItem::new(buf.clone())));
        Ok(buf)
    }

    /// Attaches a buffer obtained outside the transaction.
    pub fn bjoin(&mut self, buf: &Buf) {
        assert!(
            self.match_buf(buf.key()).is_none(),
            "buffer {} is already attached to transaction {}",
            buf.key(),
            self.id
        );
        self.add_item(LogItem::Buf(BufLogItem::new(buf.clone())));
    }

    /// Keeps `buf` attached to its caller past commit.
    pub fn bhold(&mut self, buf: &Buf) {
        let id = self.find_item(ItemRef::Buf(buf));
        self.bli_mut(id).flags |= BliFlags::HOLD;
    }

    /// Releases one acquisition of `buf`.
    ///
    /// The buffer is detached once every acquisition is released, unless it
    /// was logged; logged buffers stay until commit.
    pub fn brelse(&mut self, buf: &Buf) {
        let id = self.find_item(ItemRef::Buf(buf));
        let dirty = self.is_desc_dirty(id);
        let bli = self.bli_mut(id);
        if bli.recur > 0 {
            bli.recur -= 1;
            return;
        }
        if dirty || bli.is_dirty() {
            return;
        }
        trace!("trans {}: releasing buffer {}", self.id, buf.key());
        if let LogItem::Buf(bli) = self.free_item(id) {
            self.mount.bufs().release(bli.buf);
        }
    }

    /// Marks bytes `first..=last` of `buf` as modified.
    pub fn log_buf(&mut self, buf: &Buf, first: usize, last: usize) {
        let id = self.find_item(ItemRef::Buf(buf));
        self.bli_mut(id).log_range(first, last);
        self.mark_dirty(id);
    }
}
