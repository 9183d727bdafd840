//! Block I/O for the userspace shim.
//!
//! [`BufCache`] hands out buffers keyed by `(device, daddr, length)`. It does
//! no caching or write coalescing of its own: every [`BufCache::get`] or
//! [`BufCache::read`] returns a fresh buffer, and callers decide when a
//! buffer is written back. Any sharing of buffers is orchestrated by the
//! transaction layer above.

use std::{
    fmt,
    fs::File,
    io,
    ops::{Deref, DerefMut},
    os::unix::fs::FileExt as _,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use dataview::{Pod, PodMethods as _};

/// log2 of the basic block size.
pub const BBSHIFT: u32 = 9;

/// Basic block size in bytes.
pub const BBSIZE: usize = 1 << BBSHIFT;

/// Converts a length in basic blocks to bytes.
#[must_use]
pub fn bb_to_bytes(len: u32) -> usize {
    usize::try_from(len).unwrap_or(usize::MAX) << BBSHIFT
}

/// A trait representing a block device addressed in basic blocks.
pub trait BlockDevice: Send + Sync {
    /// Reads `data.len()` bytes starting at basic block `daddr`.
    fn read(&self, daddr: u64, data: &mut [u8]) -> io::Result<()>;

    /// Writes `data` starting at basic block `daddr`.
    fn write(&self, daddr: u64, data: &[u8]) -> io::Result<()>;

    /// Flushes device caches.
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    /// Returns the device size in basic blocks.
    fn size_bb(&self) -> u64;
}

/// A block device backed by a regular file (an image file).
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    size_bb: u64,
}

impl FileDevice {
    /// Opens an existing image file.
    pub fn open(file: File) -> io::Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            size_bb: len >> BBSHIFT,
        })
    }

    /// Sizes `file` to `size_bb` basic blocks and uses it as a device.
    pub fn create(file: File, size_bb: u64) -> io::Result<Self> {
        file.set_len(size_bb << BBSHIFT)?;
        Ok(Self { file, size_bb })
    }
}

fn check_range(daddr: u64, len: usize, size_bb: u64) -> io::Result<u64> {
    let offset = daddr << BBSHIFT;
    let end = offset + len as u64;
    if end > size_bb << BBSHIFT {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("I/O beyond end of device: daddr={daddr} len={len}"),
        ));
    }
    Ok(offset)
}

impl BlockDevice for FileDevice {
    fn read(&self, daddr: u64, data: &mut [u8]) -> io::Result<()> {
        let offset = check_range(daddr, data.len(), self.size_bb)?;
        self.file.read_exact_at(data, offset)
    }

    fn write(&self, daddr: u64, data: &[u8]) -> io::Result<()> {
        let offset = check_range(daddr, data.len(), self.size_bb)?;
        self.file.write_all_at(data, offset)
    }

    fn flush(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn size_bb(&self) -> u64 {
        self.size_bb
    }
}

/// An in-memory block device.
///
/// Counts reads and writes, and can be told to fail writes to exercise
/// error paths.
#[derive(Debug)]
pub struct MemDevice {
    data: Mutex<Vec<u8>>,
    reads: AtomicU64,
    writes: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemDevice {
    /// Creates a zero-filled device of `size_bb` basic blocks.
    #[must_use]
    pub fn new(size_bb: u64) -> Self {
        let len = usize::try_from(size_bb).unwrap_or(usize::MAX) << BBSHIFT;
        Self {
            data: Mutex::new(vec![0; len]),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Number of read calls so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of write calls so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Makes every subsequent write fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn image_size_bb(image: &[u8]) -> u64 {
    (image.len() >> BBSHIFT) as u64
}

impl BlockDevice for MemDevice {
    fn read(&self, daddr: u64, data: &mut [u8]) -> io::Result<()> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let image = self.lock();
        let offset = check_range(daddr, data.len(), image_size_bb(&image))?;
        let offset = usize::try_from(offset).map_err(io::Error::other)?;
        data.copy_from_slice(&image[offset..offset + data.len()]);
        Ok(())
    }

    fn write(&self, daddr: u64, data: &[u8]) -> io::Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(io::Error::other("injected write failure"));
        }
        let mut image = self.lock();
        let offset = check_range(daddr, data.len(), image_size_bb(&image))?;
        let offset = usize::try_from(offset).map_err(io::Error::other)?;
        image[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn size_bb(&self) -> u64 {
        image_size_bb(&self.lock())
    }
}

/// Device identifier carried by buffer keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevId(pub u32);

/// Identity of a buffer: device, disk address and length in basic blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufKey {
    pub dev: DevId,
    pub daddr: u64,
    pub len: u32,
}

impl fmt::Display for BufKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev={} daddr={} len={}", self.dev.0, self.daddr, self.len)
    }
}

/// The data of a buffer.
#[derive(Debug)]
pub struct BufData {
    valid: bool,
    bytes: Vec<u8>,
}

#[derive(Debug)]
struct BufInner {
    key: BufKey,
    data: Mutex<BufData>,
}

/// A handle to a buffer.
///
/// Cloning the handle shares the buffer.
#[derive(Debug, Clone)]
pub struct Buf(Arc<BufInner>);

impl Buf {
    fn new(key: BufKey) -> Self {
        Self(Arc::new(BufInner {
            key,
            data: Mutex::new(BufData {
                valid: false,
                bytes: vec![0; bb_to_bytes(key.len)],
            }),
        }))
    }

    /// Returns the buffer key.
    #[must_use]
    pub fn key(&self) -> BufKey {
        self.0.key
    }

    /// Returns the disk address of the buffer.
    #[must_use]
    pub fn daddr(&self) -> u64 {
        self.0.key.daddr
    }

    /// Returns the length of the buffer in basic blocks.
    #[must_use]
    pub fn len_bb(&self) -> u32 {
        self.0.key.len
    }

    /// Returns the length of the buffer in bytes.
    #[must_use]
    pub fn len_bytes(&self) -> usize {
        bb_to_bytes(self.0.key.len)
    }

    /// Returns `true` if `self` and `other` refer to the same buffer.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Locks the buffer data.
    pub fn lock(&self) -> BufGuard<'_> {
        BufGuard(self.0.data.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// A lock guard of a buffer providing exclusive access to its bytes.
pub struct BufGuard<'a>(MutexGuard<'a, BufData>);

impl BufGuard<'_> {
    /// Returns `true` if the buffer holds data read from (or meant for) disk.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.0.valid
    }

    /// Returns a reference to the buffer bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.0.bytes
    }

    /// Returns a mutable reference to the buffer bytes.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.0.valid = true;
        &mut self.0.bytes
    }

    /// Fills the whole buffer with zero.
    pub fn zero(&mut self) {
        self.bytes_mut().fill(0);
    }

    /// Reads a POD value at byte `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the value does not fit in the buffer.
    #[must_use]
    pub fn read_pod<T>(&self, offset: usize) -> T
    where
        T: Pod,
    {
        let mut value = T::zeroed();
        let len = size_of::<T>();
        value
            .as_bytes_mut()
            .copy_from_slice(&self.bytes()[offset..offset + len]);
        value
    }

    /// Writes a POD value at byte `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the value does not fit in the buffer.
    pub fn write_pod<T>(&mut self, offset: usize, value: &T)
    where
        T: Pod,
    {
        let bytes = value.as_bytes();
        self.bytes_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl Deref for BufGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.bytes()
    }
}

impl DerefMut for BufGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.bytes_mut()
    }
}

/// I/O statistics of a [`BufCache`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IoStats {
    pub gets: u64,
    pub reads: u64,
    pub writes: u64,
}

/// Buffer provider for one block device.
pub struct BufCache {
    dev_id: DevId,
    device: Arc<dyn BlockDevice>,
    gets: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl fmt::Debug for BufCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufCache")
            .field("dev_id", &self.dev_id)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl BufCache {
    /// Creates a new [`BufCache`] for `device`.
    pub fn new(dev_id: DevId, device: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev_id,
            device,
            gets: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Returns the device identifier.
    #[must_use]
    pub fn dev_id(&self) -> DevId {
        self.dev_id
    }

    /// Returns the underlying device.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Returns the key a buffer at `daddr` of `len` basic blocks would have.
    #[must_use]
    pub fn key(&self, daddr: u64, len: u32) -> BufKey {
        BufKey {
            dev: self.dev_id,
            daddr,
            len,
        }
    }

    /// Returns a zero-filled buffer without reading the device.
    pub fn get(&self, daddr: u64, len: u32) -> Buf {
        self.gets.fetch_add(1, Ordering::Relaxed);
        Buf::new(self.key(daddr, len))
    }

    /// Returns a buffer filled from the device.
    pub fn read(&self, daddr: u64, len: u32) -> io::Result<Buf> {
        let buf = self.get(daddr, len);
        {
            let mut data = buf.0.data.lock().unwrap_or_else(PoisonError::into_inner);
            self.reads.fetch_add(1, Ordering::Relaxed);
            self.device.read(daddr, &mut data.bytes)?;
            data.valid = true;
        }
        Ok(buf)
    }

    /// Writes the buffer to the device.
    pub fn write(&self, buf: &Buf) -> io::Result<()> {
        assert_eq!(buf.key().dev, self.dev_id, "buffer from another device");
        let data = buf.lock();
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.device.write(buf.daddr(), data.bytes())
    }

    /// Releases a buffer without writing it.
    pub fn release(&self, buf: Buf) {
        log::trace!("release buffer {}", buf.key());
        drop(buf);
    }

    /// Returns the I/O statistics.
    pub fn stats(&self) -> IoStats {
        IoStats {
            gets: self.gets.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}
