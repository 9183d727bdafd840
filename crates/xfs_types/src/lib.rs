//! Data types for the on-disk layout used by the userspace XFS shim.
//!
//! The layout is a simplified stand-in for the real XFS format:
//!
//! | block no.          | # of blocks               | content     | type                     |
//! |--------------------|---------------------------|-------------|--------------------------|
//! | 0                  | 1                         | Super Block | [`SuperBlock`]           |
//! | `sb.inode_start`   | [`SuperBlock::inode_table_blocks`] | inode table | [`DinodeCore`] + literal area |
//! | after inode table  | rest                      | data blocks | (unused by the shim)     |
//!
//! Disk addresses (`daddr`) are counted in 512-byte basic blocks, filesystem
//! block numbers in `sb.block_size` units.

use core::fmt;

use dataview::Pod;
use strum::FromRepr;

/// log2 of the basic block size.
pub const BBSHIFT: u32 = 9;

/// Basic block size in bytes.
pub const BBSIZE: usize = 1 << BBSHIFT;

/// Maximum length of a single path component.
pub const MAXNAMELEN: usize = 255;

/// Maximum link count of an inode.
pub const MAXLINK: u32 = 0x7fff_ffff;

/// Inode number used for "no inode".
pub const NULL_INO: InodeNo = InodeNo::new(0);

pub const S_IFMT: u16 = 0o170_000;
pub const S_IFDIR: u16 = 0o040_000;
pub const S_IFREG: u16 = 0o100_000;
pub const S_IFLNK: u16 = 0o120_000;

/// Returns `true` if `mode` describes a directory.
#[must_use]
pub const fn s_isdir(mode: u16) -> bool {
    mode & S_IFMT == S_IFDIR
}

/// Returns `true` if `mode` describes a regular file.
#[must_use]
pub const fn s_isreg(mode: u16) -> bool {
    mode & S_IFMT == S_IFREG
}

/// Represents a filesystem block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod)]
#[repr(transparent)]
pub struct BlockNo(u64);

impl fmt::Display for BlockNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl BlockNo {
    #[must_use]
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

/// Represents an inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod)]
#[repr(transparent)]
pub struct InodeNo(u64);

impl fmt::Display for InodeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl InodeNo {
    #[must_use]
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// Allocation group number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AgNumber(pub u32);

/// Represents the super block of the file system.
///
/// All fields are stored in native byte order.
#[derive(Debug, Clone, Pod)]
#[repr(C)]
pub struct SuperBlock {
    /// Magic number. Must be [`Self::MAGIC`].
    pub magic: u32,
    /// Filesystem block size in bytes.
    pub block_size: u32,
    /// Number of blocks in the data device.
    pub data_blocks: u64,
    /// Blocks per allocation group.
    pub ag_blocks: u32,
    /// Number of allocation groups.
    pub ag_count: u32,
    /// Inode slot size in bytes.
    pub inode_size: u16,
    /// Inodes per filesystem block.
    pub inodes_per_block: u16,
    /// Inode cluster size in filesystem blocks.
    pub inode_cluster_blocks: u16,
    /// Format version.
    pub version: u16,
    /// Root directory inode number.
    pub root_ino: u64,
    /// First block of the inode table.
    pub inode_start: u64,
    /// Capacity of the inode table.
    pub inode_max: u64,
    /// Allocated inodes.
    pub icount: u64,
    /// Free inodes among the allocated ones.
    pub ifree: u64,
    /// Free data blocks.
    pub fdblocks: u64,
    /// Free realtime extents.
    pub frextents: u64,
}
const _: () = const { assert!(size_of::<SuperBlock>() == 88) };

impl SuperBlock {
    /// Magic number for the file system ("XFSB").
    pub const MAGIC: u32 = 0x5846_5342;
    /// Current format version.
    pub const VERSION: u16 = 1;
    /// Block number of the super block.
    pub const SUPER_BLOCK_NO: BlockNo = BlockNo::new(0);

    /// Number of basic blocks per filesystem block.
    #[must_use]
    pub fn bb_per_block(&self) -> u64 {
        u64::from(self.block_size) >> BBSHIFT
    }

    /// Converts a filesystem block number to a disk address.
    #[must_use]
    pub fn block_to_daddr(&self, bno: BlockNo) -> u64 {
        bno.0 * self.bb_per_block()
    }

    /// Length of `blocks` filesystem blocks in basic blocks.
    #[must_use]
    pub fn blocks_to_bb(&self, blocks: u64) -> u32 {
        u32::try_from(blocks * self.bb_per_block()).unwrap_or(u32::MAX)
    }

    /// Number of inodes in one inode cluster.
    #[must_use]
    pub fn inodes_per_cluster(&self) -> u64 {
        u64::from(self.inodes_per_block) * u64::from(self.inode_cluster_blocks)
    }

    /// Number of blocks occupied by the inode table, rounded up to whole clusters.
    #[must_use]
    pub fn inode_table_blocks(&self) -> u64 {
        let per_cluster = self.inodes_per_cluster();
        self.inode_max.div_ceil(per_cluster) * u64::from(self.inode_cluster_blocks)
    }

    /// Returns the block number containing the specified inode.
    #[must_use]
    pub fn inode_block(&self, ino: InodeNo) -> BlockNo {
        BlockNo::new(self.inode_start + ino.0 / u64::from(self.inodes_per_block))
    }

    /// Returns the first block of the cluster containing the specified inode.
    #[must_use]
    pub fn cluster_block(&self, ino: InodeNo) -> BlockNo {
        let cluster = ino.0 / self.inodes_per_cluster();
        BlockNo::new(self.inode_start + cluster * u64::from(self.inode_cluster_blocks))
    }

    /// Returns the disk address of the cluster containing the specified inode.
    #[must_use]
    pub fn cluster_daddr(&self, ino: InodeNo) -> u64 {
        self.block_to_daddr(self.cluster_block(ino))
    }

    /// Length of an inode cluster buffer in basic blocks.
    #[must_use]
    pub fn cluster_len_bb(&self) -> u32 {
        self.blocks_to_bb(u64::from(self.inode_cluster_blocks))
    }

    /// Byte offset of the specified inode inside its cluster buffer.
    #[must_use]
    pub fn cluster_offset(&self, ino: InodeNo) -> usize {
        let index = ino.0 % self.inodes_per_cluster();
        usize::try_from(index).unwrap_or(usize::MAX) * usize::from(self.inode_size)
    }

    /// Size of the literal area following the inode core.
    #[must_use]
    pub fn literal_size(&self) -> usize {
        usize::from(self.inode_size).saturating_sub(DINODE_CORE_SIZE)
    }

    /// Returns the allocation group containing `bno`.
    #[must_use]
    pub fn ag_of_block(&self, bno: BlockNo) -> AgNumber {
        let ag = bno.0 / u64::from(self.ag_blocks.max(1));
        AgNumber(u32::try_from(ag).unwrap_or(u32::MAX))
    }

    /// Returns `true` if `ino` is a valid inode number for this filesystem.
    #[must_use]
    pub fn is_valid_ino(&self, ino: InodeNo) -> bool {
        !ino.is_null() && ino.0 < self.inode_max
    }
}

/// On-disk timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod)]
#[repr(C)]
pub struct Timestamp {
    pub sec: u32,
    pub nsec: u32,
}

/// Format of an inode data fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, strum::Display)]
#[repr(u8)]
pub enum DinodeFormat {
    Dev = 0,
    Local = 1,
    Extents = 2,
    Btree = 3,
}

/// The fixed part of an on-disk inode.
///
/// The literal area (inline data fork) follows it inside the inode slot.
#[derive(Debug, Clone, Pod)]
#[repr(C)]
pub struct DinodeCore {
    /// Magic number. Must be [`Self::MAGIC`] for allocated inodes.
    pub magic: u16,
    pub mode: u16,
    pub version: u8,
    /// Data fork format, see [`DinodeFormat`].
    pub format: u8,
    pub pad: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    /// Inode generation number.
    pub generation: u32,
    pub size: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub nextents: u32,
    pub flags: u32,
}

/// Size of [`DinodeCore`] in bytes.
pub const DINODE_CORE_SIZE: usize = size_of::<DinodeCore>();
const _: () = const { assert!(DINODE_CORE_SIZE == 64) };

impl DinodeCore {
    /// Magic number of an allocated inode ("IN").
    pub const MAGIC: u16 = 0x494e;
    pub const VERSION: u8 = 2;

    /// Returns `true` if the slot does not hold an allocated inode.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.mode == 0
    }
}

/// Short-form directory header size: entry count (`u8`) and parent inode (`u64`).
pub const SF_HDR_SIZE: usize = 1 + 8;

/// Size of one short-form directory entry with a name of `namelen` bytes.
#[must_use]
pub const fn sf_entry_size(namelen: usize) -> usize {
    1 + 8 + namelen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sb() -> SuperBlock {
        SuperBlock {
            magic: SuperBlock::MAGIC,
            block_size: 4096,
            data_blocks: 1024,
            ag_blocks: 256,
            ag_count: 4,
            inode_size: 256,
            inodes_per_block: 16,
            inode_cluster_blocks: 2,
            version: SuperBlock::VERSION,
            root_ino: 1,
            inode_start: 1,
            inode_max: 100,
            icount: 0,
            ifree: 0,
            fdblocks: 0,
            frextents: 0,
        }
    }

    #[test]
    fn test_inode_addressing() {
        let sb = sb();
        assert_eq!(sb.bb_per_block(), 8);
        assert_eq!(sb.inodes_per_cluster(), 32);
        assert_eq!(sb.inode_block(InodeNo::new(17)), BlockNo::new(2));
        assert_eq!(sb.cluster_block(InodeNo::new(17)), BlockNo::new(1));
        assert_eq!(sb.cluster_block(InodeNo::new(33)), BlockNo::new(3));
        assert_eq!(sb.cluster_offset(InodeNo::new(33)), 256);
        assert_eq!(sb.cluster_len_bb(), 16);
        // 100 inodes -> 4 clusters of 2 blocks
        assert_eq!(sb.inode_table_blocks(), 8);
        assert_eq!(sb.literal_size(), 192);
    }

    #[test]
    fn test_valid_ino() {
        let sb = sb();
        assert!(!sb.is_valid_ino(NULL_INO));
        assert!(sb.is_valid_ino(InodeNo::new(99)));
        assert!(!sb.is_valid_ino(InodeNo::new(100)));
    }

    #[test]
    fn test_mode_helpers() {
        assert!(s_isdir(S_IFDIR | 0o755));
        assert!(!s_isdir(S_IFREG | 0o644));
        assert!(s_isreg(S_IFREG));
    }
}
