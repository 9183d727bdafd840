use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context as _;
use block_io::{BlockDevice, FileDevice};
use clap::Parser;
use libxfs::{FormatParams, Mount, MountParams, format};
use log::info;
use xfs_types::BBSHIFT;

mod proto;

/// Creates a filesystem image.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Image file to create or overwrite
    image: PathBuf,

    /// Size of the filesystem in blocks
    #[arg(long, default_value_t = 4096)]
    blocks: u64,

    /// Filesystem block size in bytes
    #[arg(long, default_value_t = 4096)]
    block_size: u32,

    /// Size of an on-disk inode in bytes
    #[arg(long, default_value_t = 256)]
    inode_size: u16,

    /// Number of inode slots
    #[arg(long, default_value_t = 1024)]
    inodes: u64,

    /// Blocks per inode cluster
    #[arg(long, default_value_t = 2)]
    cluster_blocks: u16,

    /// Number of allocation groups
    #[arg(long, default_value_t = 1)]
    ag_count: u32,

    /// Prototype file listing the directories and files to create
    #[arg(long)]
    proto: Option<PathBuf>,
}

impl Args {
    fn format_params(&self) -> FormatParams {
        FormatParams {
            block_size: self.block_size,
            data_blocks: self.blocks,
            inode_size: self.inode_size,
            inode_max: self.inodes,
            inode_cluster_blocks: self.cluster_blocks,
            ag_count: self.ag_count,
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    run(&args)
}

fn run(args: &Args) -> anyhow::Result<()> {
    let entries = match &args.proto {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            proto::parse(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => vec![],
    };

    let params = args.format_params();
    let device = create_image(&args.image, &params)?;
    let sb = format(&*device, &params).context("formatting image")?;
    if entries.is_empty() {
        return Ok(());
    }

    let mount = Mount::mount(device, MountParams::default()).context("mounting new image")?;
    let res = proto::populate(&mount, &entries);
    let unmount = mount.unmount().context("unmounting image");
    res?;
    unmount?;
    info!(
        "{}: {} entries created, {} of {} blocks free",
        args.image.display(),
        entries.len(),
        mount.sb().fdblocks,
        sb.data_blocks
    );
    Ok(())
}

fn create_image(path: &Path, params: &FormatParams) -> anyhow::Result<Arc<dyn BlockDevice>> {
    let bytes = params
        .data_blocks
        .checked_mul(u64::from(params.block_size))
        .context("image size overflows")?;
    let file = File::options()
        .read(true)
        .write(true)
        .truncate(true)
        .create(true)
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;
    let device = FileDevice::create(file, bytes >> BBSHIFT)?;
    Ok(Arc::new(device))
}
