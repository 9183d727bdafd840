//! Log item descriptor storage.
//!
//! Descriptors live in fixed-size chunks. Each chunk carries a free mask and
//! a hint of the first never-used slot. A descriptor is addressed by a
//! [`DescId`] which stays valid until the descriptor is freed, whatever
//! happens to other chunks.

use bitflags::bitflags;

use super::item::LogItem;
use crate::param::LIC_NUM_SLOTS;

/// Address of a log item descriptor inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DescId {
    chunk: u16,
    slot: u8,
}

impl DescId {
    #[must_use]
    pub fn chunk(self) -> usize {
        usize::from(self.chunk)
    }

    #[must_use]
    pub fn slot(self) -> usize {
        usize::from(self.slot)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct DescFlags: u8 {
        /// The item was modified by the transaction.
        const DIRTY = 0x1;
    }
}

#[derive(Debug)]
pub(crate) struct ItemDesc {
    pub(crate) item: LogItem,
    pub(crate) flags: DescFlags,
}

const ALL_FREE: u16 = (1 << LIC_NUM_SLOTS) - 1;
const _: () = const { assert!(LIC_NUM_SLOTS < 16) };

#[derive(Debug)]
pub(crate) struct ItemChunk {
    /// Bit `n` is set while slot `n` is free.
    free: u16,
    /// Slots at or above this index have never been used.
    unused: u8,
    descs: [Option<ItemDesc>; LIC_NUM_SLOTS],
}

impl ItemChunk {
    fn new() -> Box<Self> {
        Box::new(Self {
            free: ALL_FREE,
            unused: 0,
            descs: [const { None }; LIC_NUM_SLOTS],
        })
    }

    pub(crate) fn is_all_free(&self) -> bool {
        self.free == ALL_FREE
    }

    fn claim(&mut self) -> Option<usize> {
        if self.free == 0 {
            return None;
        }
        let slot = if usize::from(self.unused) < LIC_NUM_SLOTS {
            let slot = usize::from(self.unused);
            self.unused += 1;
            slot
        } else {
            self.free.trailing_zeros() as usize
        };
        debug_assert!(self.free & (1 << slot) != 0);
        self.free &= !(1 << slot);
        Some(slot)
    }

    fn release(&mut self, slot: usize) {
        assert!(self.free & (1 << slot) == 0, "freeing free descriptor slot {slot}");
        self.free |= 1 << slot;
    }

    /// Returns the occupied slots in ascending order.
    pub(crate) fn occupied(&self) -> impl Iterator<Item = usize> + '_ {
        (0..LIC_NUM_SLOTS).filter(|&i| self.free & (1 << i) == 0)
    }
}

#[derive(Debug)]
pub(crate) struct DescArena {
    chunks: Vec<Option<Box<ItemChunk>>>,
    nfree: usize,
}

impl DescArena {
    pub(crate) fn new() -> Self {
        Self {
            chunks: vec![Some(ItemChunk::new())],
            nfree: LIC_NUM_SLOTS,
        }
    }

    /// Number of free descriptor slots in resident chunks.
    pub(crate) fn free_count(&self) -> usize {
        self.nfree
    }

    pub(crate) fn resident_chunks(&self) -> usize {
        self.chunks.iter().flatten().count()
    }

    pub(crate) fn occupied_count(&self) -> usize {
        self.resident_chunks() * LIC_NUM_SLOTS - self.nfree
    }

    /// Returns the indices of resident chunks.
    pub(crate) fn chunk_indices(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|_| i))
            .collect()
    }

    pub(crate) fn chunk(&self, idx: usize) -> Option<&ItemChunk> {
        self.chunks.get(idx)?.as_deref()
    }

    /// Returns the ids of the occupied descriptors of chunk `idx`.
    pub(crate) fn chunk_ids(&self, idx: usize) -> Vec<DescId> {
        self.chunk(idx)
            .map(|chunk| chunk.occupied().map(|slot| make_id(idx, slot)).collect())
            .unwrap_or_default()
    }

    /// Returns the ids of every occupied descriptor in chunk order.
    pub(crate) fn ids(&self) -> Vec<DescId> {
        self.chunk_indices()
            .into_iter()
            .flat_map(|idx| self.chunk_ids(idx))
            .collect()
    }

    /// Stores `item` in a free slot, growing the arena when none is left.
    pub(crate) fn insert(&mut self, item: LogItem) -> DescId {
        if self.nfree == 0 {
            let chunk = Some(ItemChunk::new());
            match self.chunks.iter().position(Option::is_none) {
                Some(idx) => self.chunks[idx] = chunk,
                None => self.chunks.push(chunk),
            }
            self.nfree += LIC_NUM_SLOTS;
        }

        for (idx, chunk) in self.chunks.iter_mut().enumerate() {
            let Some(chunk) = chunk else { continue };
            if let Some(slot) = chunk.claim() {
                chunk.descs[slot] = Some(ItemDesc {
                    item,
                    flags: DescFlags::empty(),
                });
                self.nfree -= 1;
                return make_id(idx, slot);
            }
        }
        unreachable!("descriptor arena has free slots but none was found");
    }

    pub(crate) fn get(&self, id: DescId) -> &ItemDesc {
        self.chunks
            .get(id.chunk())
            .and_then(Option::as_ref)
            .and_then(|c| c.descs[id.slot()].as_ref())
            .unwrap_or_else(|| panic!("descriptor {id:?} is not allocated"))
    }

    pub(crate) fn get_mut(&mut self, id: DescId) -> &mut ItemDesc {
        self.chunks
            .get_mut(id.chunk())
            .and_then(Option::as_mut)
            .and_then(|c| c.descs[id.slot()].as_mut())
            .unwrap_or_else(|| panic!("descriptor {id:?} is not allocated"))
    }

    /// Frees descriptor `id` and returns its item.
    ///
    /// A chunk left completely free is released unless it is the only
    /// resident one.
    pub(crate) fn remove(&mut self, id: DescId) -> LogItem {
        let resident = self.resident_chunks();
        let Some(Some(chunk)) = self.chunks.get_mut(id.chunk()) else {
            panic!("descriptor {id:?} is not allocated");
        };
        let Some(desc) = chunk.descs[id.slot()].take() else {
            panic!("descriptor {id:?} is not allocated");
        };
        chunk.release(id.slot());
        self.nfree += 1;

        if chunk.is_all_free() && resident > 1 {
            self.chunks[id.chunk()] = None;
            self.nfree -= LIC_NUM_SLOTS;
        }
        desc.item
    }

    /// Frees every descriptor of chunk `idx` and drops the chunk unless it is
    /// the only resident one.
    pub(crate) fn drain_chunk(&mut self, idx: usize) -> Vec<ItemDesc> {
        let resident = self.resident_chunks();
        let Some(Some(chunk)) = self.chunks.get_mut(idx) else {
            return vec![];
        };
        let slots: Vec<_> = chunk.occupied().collect();
        let mut descs = vec![];
        for slot in slots {
            chunk.release(slot);
            descs.extend(chunk.descs[slot].take());
        }
        self.nfree += descs.len();
        if resident > 1 {
            self.chunks[idx] = None;
            self.nfree -= LIC_NUM_SLOTS;
        }
        descs
    }
}

fn make_id(chunk: usize, slot: usize) -> DescId {
    DescId {
        chunk: u16::try_from(chunk).unwrap_or_else(|_| panic!("too many descriptor chunks")),
        slot: u8::try_from(slot).unwrap_or_else(|_| panic!("bad descriptor slot {slot}")),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use block_io::{BufCache, DevId, MemDevice};

    use super::*;
    use crate::trans::item::BufLogItem;

    fn item(cache: &BufCache, daddr: u64) -> LogItem {
        LogItem::Buf(BufLogItem::new(cache.get(daddr, 1)))
    }

    fn cache() -> BufCache {
        BufCache::new(DevId(0), Arc::new(MemDevice::new(64)))
    }

    #[test]
    fn first_chunk_is_embedded() {
        let arena = DescArena::new();
        assert_eq!(arena.resident_chunks(), 1);
        assert_eq!(arena.free_count(), LIC_NUM_SLOTS);
        assert_eq!(arena.occupied_count(), 0);
    }

    #[test]
    fn grows_and_shrinks_by_chunks() {
        let cache = cache();
        let mut arena = DescArena::new();
        let ids: Vec<_> = (0..LIC_NUM_SLOTS as u64 + 1)
            .map(|d| arena.insert(item(&cache, d)))
            .collect();
        assert_eq!(arena.resident_chunks(), 2);
        assert_eq!(arena.free_count(), LIC_NUM_SLOTS - 1);
        assert_eq!(ids.last().unwrap().chunk(), 1);

        // Emptying the second chunk releases it.
        arena.remove(ids[LIC_NUM_SLOTS]);
        assert_eq!(arena.resident_chunks(), 1);
        assert_eq!(arena.free_count(), 0);

        // The last chunk stays resident even when empty.
        for id in &ids[..LIC_NUM_SLOTS] {
            arena.remove(*id);
        }
        assert_eq!(arena.resident_chunks(), 1);
        assert_eq!(arena.free_count(), LIC_NUM_SLOTS);
    }

    #[test]
    fn ids_stay_valid_when_other_chunks_go() {
        let cache = cache();
        let mut arena = DescArena::new();
        let ids: Vec<_> = (0..2 * LIC_NUM_SLOTS as u64)
            .map(|d| arena.insert(item(&cache, d)))
            .collect();
        for id in &ids[..LIC_NUM_SLOTS] {
            arena.remove(*id);
        }
        assert_eq!(arena.resident_chunks(), 1);
        let LogItem::Buf(bli) = &arena.get(ids[LIC_NUM_SLOTS]).item else {
            panic!("expected buffer item");
        };
        assert_eq!(bli.buf.daddr(), LIC_NUM_SLOTS as u64);

        // A new chunk reuses the vacated index.
        let mut more = vec![];
        for d in 0..LIC_NUM_SLOTS as u64 {
            more.push(arena.insert(item(&cache, 100 + d)));
        }
        assert_eq!(more.last().unwrap().chunk(), 0);
    }

    #[test]
    fn freed_slots_are_reused_after_unused_ones() {
        let cache = cache();
        let mut arena = DescArena::new();
        let a = arena.insert(item(&cache, 0));
        let b = arena.insert(item(&cache, 1));
        arena.remove(a);
        let c = arena.insert(item(&cache, 2));
        assert_eq!(c.slot(), 2);
        for d in 3..LIC_NUM_SLOTS as u64 {
            arena.insert(item(&cache, d));
        }
        let reused = arena.insert(item(&cache, 99));
        assert_eq!(reused, a);
        assert_ne!(reused, b);
    }

    #[test]
    #[should_panic(expected = "is not allocated")]
    fn double_free_panics() {
        let cache = cache();
        let mut arena = DescArena::new();
        let a = arena.insert(item(&cache, 0));
        arena.insert(item(&cache, 1));
        arena.remove(a);
        arena.remove(a);
    }
}
