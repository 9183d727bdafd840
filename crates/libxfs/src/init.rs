//! Filesystem creation.

use block_io::BlockDevice;
use dataview::PodMethods as _;
use log::{debug, info};
use xfs_types::{
    BBSIZE, BlockNo, DINODE_CORE_SIZE, DinodeCore, DinodeFormat, InodeNo, S_IFDIR, SF_HDR_SIZE,
    SuperBlock,
};

use crate::{
    dir::SfDir,
    error::{Errno, Result},
    inode::now,
};

/// Geometry of a filesystem to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatParams {
    pub block_size: u32,
    /// Size of the data device in filesystem blocks.
    pub data_blocks: u64,
    pub inode_size: u16,
    /// Number of inode slots in the inode table, including the unused slot 0.
    pub inode_max: u64,
    pub inode_cluster_blocks: u16,
    pub ag_count: u32,
}

impl Default for FormatParams {
    fn default() -> Self {
        Self {
            block_size: 4096,
            data_blocks: 256,
            inode_size: 256,
            inode_max: 256,
            inode_cluster_blocks: 2,
            ag_count: 1,
        }
    }
}

const ROOT_INO: InodeNo = InodeNo::new(1);
const MAX_BLOCK_SIZE: u32 = 65536;
const MIN_INODE_SIZE: u16 = 128;

impl FormatParams {
    fn validate(&self) -> Result<()> {
        let block_size_ok = self.block_size.is_power_of_two()
            && self.block_size as usize >= BBSIZE
            && self.block_size <= MAX_BLOCK_SIZE;
        let inode_size_ok = self.inode_size.is_power_of_two()
            && self.inode_size >= MIN_INODE_SIZE
            && u32::from(self.inode_size) <= self.block_size;
        if !block_size_ok
            || !inode_size_ok
            || self.inode_cluster_blocks == 0
            || self.ag_count == 0
            || self.inode_max <= ROOT_INO.value()
        {
            return Err(Errno::InvalidInput);
        }
        Ok(())
    }

    fn superblock(&self) -> Result<SuperBlock> {
        self.validate()?;
        let inodes_per_block = u16::try_from(self.block_size / u32::from(self.inode_size))
            .map_err(|_e| Errno::InvalidInput)?;
        let ag_blocks = u32::try_from(self.data_blocks.div_ceil(u64::from(self.ag_count)))
            .map_err(|_e| Errno::InvalidInput)?;
        let mut sb = SuperBlock {
            magic: SuperBlock::MAGIC,
            block_size: self.block_size,
            data_blocks: self.data_blocks,
            ag_blocks,
            ag_count: self.ag_count,
            inode_size: self.inode_size,
            inodes_per_block,
            inode_cluster_blocks: self.inode_cluster_blocks,
            version: SuperBlock::VERSION,
            root_ino: ROOT_INO.value(),
            inode_start: 1,
            inode_max: self.inode_max,
            icount: 1,
            ifree: 0,
            fdblocks: 0,
            frextents: 0,
        };
        let used = sb.inode_start + sb.inode_table_blocks();
        if used >= sb.data_blocks {
            return Err(Errno::StorageFull);
        }
        sb.fdblocks = sb.data_blocks - used;
        debug_assert!(sb.literal_size() >= SF_HDR_SIZE);
        Ok(sb)
    }
}

/// Creates an empty filesystem on `device`.
///
/// Writes the superblock, zeroes the inode table and creates the root
/// directory, whose parent is itself.
pub fn format(device: &dyn BlockDevice, params: &FormatParams) -> Result<SuperBlock> {
    let sb = params.superblock()?;
    let needed_bb = sb.data_blocks * sb.bb_per_block();
    if device.size_bb() < needed_bb {
        return Err(Errno::StorageFull);
    }

    let mut block = vec![0; sb.block_size as usize];
    block[..size_of::<SuperBlock>()].copy_from_slice(sb.as_bytes());
    device.write(sb.block_to_daddr(SuperBlock::SUPER_BLOCK_NO), &block)?;

    let cluster_bytes = sb.block_size as usize * usize::from(sb.inode_cluster_blocks);
    let zero = vec![0; cluster_bytes];
    let table_end = sb.inode_start + sb.inode_table_blocks();
    for bno in (sb.inode_start..table_end).step_by(usize::from(sb.inode_cluster_blocks)) {
        device.write(sb.block_to_daddr(BlockNo::new(bno)), &zero)?;
    }

    let mut cluster = zero;
    write_root(&sb, &mut cluster)?;
    device.write(sb.cluster_daddr(ROOT_INO), &cluster)?;
    device.flush()?;

    debug!(
        "format: inode table at block {}, {} blocks",
        sb.inode_start,
        sb.inode_table_blocks()
    );
    info!(
        "format: {} blocks of {} bytes, {} inodes, {} free blocks",
        sb.data_blocks, sb.block_size, sb.inode_max, sb.fdblocks
    );
    Ok(sb)
}

fn write_root(sb: &SuperBlock, cluster: &mut [u8]) -> Result<()> {
    let sf = SfDir::new(ROOT_INO);
    let now = now();
    let dic = DinodeCore {
        magic: DinodeCore::MAGIC,
        mode: S_IFDIR | 0o755,
        version: DinodeCore::VERSION,
        format: DinodeFormat::Local as u8,
        pad: 0,
        nlink: 2,
        uid: 0,
        gid: 0,
        generation: 0,
        size: sf.size() as u64,
        atime: now,
        mtime: now,
        ctime: now,
        nextents: 0,
        flags: 0,
    };
    let offset = sb.cluster_offset(ROOT_INO);
    cluster[offset..offset + DINODE_CORE_SIZE].copy_from_slice(dic.as_bytes());
    sf.encode(&mut cluster[offset + DINODE_CORE_SIZE..offset + usize::from(sb.inode_size)])
}
