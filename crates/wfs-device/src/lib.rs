#![forbid(unsafe_code)]
//! Byte-source and sector-reader abstractions.
//!
//! `ByteDevice` is the random-access byte source under the EWF decoder;
//! `SectorRead` is the reconstructed-disk contract consumed by the
//! partition and filesystem layers. Every read is positional — no shared
//! seek cursor anywhere.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;
use wfs_error::{Result, WfsError};
use wfs_types::{ByteOffset, Lba};

/// Byte-addressed source with positional reads (pread semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    ///
    /// A read extending past the end of the source is an I/O error.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;
}

/// File-backed byte device using `pread`-style positional I/O.
///
/// `std::os::unix::fs::FileExt` reads are thread-safe and do not touch a
/// shared seek position, so one handle serves concurrent readers.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| WfsError::out_of_range("byte offset overflows u64"))?;
        if end.0 > self.len {
            return Err(WfsError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "read past end of segment: offset={offset} len={} segment_len={}",
                    buf.len(),
                    self.len
                ),
            )));
        }
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }
}

/// In-memory byte device, used by fixtures and tests.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Arc<Vec<u8>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset.0)
            .map_err(|_| WfsError::out_of_range("byte offset does not fit usize"))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| WfsError::out_of_range("byte range overflows usize"))?;
        if end > self.bytes.len() {
            return Err(WfsError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "read past end of buffer: offset={offset} len={} buffer_len={}",
                    buf.len(),
                    self.bytes.len()
                ),
            )));
        }
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }
}

// ── Sector reader contract ──────────────────────────────────────────────────

/// Sector-addressable view of a reconstructed disk.
///
/// Partition decoders and filesystem readers consume only this contract.
/// Implementations must be shareable across concurrent readers.
pub trait SectorRead: Send + Sync {
    /// Sector size in bytes.
    fn sector_size(&self) -> u32;

    /// Total number of sectors.
    fn sector_count(&self) -> u64;

    /// Read one sector.
    fn read_sector(&self, lba: Lba) -> Result<Vec<u8>>;

    /// Read `count` contiguous sectors starting at `start`.
    fn read_sectors(&self, start: Lba, count: u64) -> Result<Vec<u8>> {
        let end = start
            .checked_add(count)
            .ok_or_else(|| WfsError::out_of_range("sector range overflows u64"))?;
        if end.0 > self.sector_count() {
            return Err(WfsError::out_of_range(format!(
                "sectors {start}..{end} beyond disk of {} sectors",
                self.sector_count()
            )));
        }
        let mut out = Vec::with_capacity(
            usize::try_from(count * u64::from(self.sector_size())).unwrap_or(0),
        );
        for i in 0..count {
            out.extend_from_slice(&self.read_sector(Lba(start.0 + i))?);
        }
        Ok(out)
    }

    /// Read an arbitrary byte range, implemented over sector reads with
    /// head/tail trimming.
    fn read_bytes(&self, offset: ByteOffset, len: u64) -> Result<Vec<u8>> {
        let sector_size = u64::from(self.sector_size());
        let disk_size = self.sector_count() * sector_size;
        let end = offset
            .checked_add(len)
            .ok_or_else(|| WfsError::out_of_range("byte range overflows u64"))?;
        if end.0 > disk_size {
            return Err(WfsError::out_of_range(format!(
                "bytes {offset}..{end} beyond disk of {disk_size} bytes"
            )));
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        let start_sector = offset.0 / sector_size;
        let end_sector = (end.0 - 1) / sector_size;
        let raw = self.read_sectors(Lba(start_sector), end_sector - start_sector + 1)?;

        let head = usize::try_from(offset.0 % sector_size)
            .map_err(|_| WfsError::out_of_range("sector offset does not fit usize"))?;
        let want =
            usize::try_from(len).map_err(|_| WfsError::out_of_range("length does not fit usize"))?;
        Ok(raw[head..head + want].to_vec())
    }
}

/// Sector-granularity window over another reader.
///
/// Used to expose a partition as a filesystem-relative disk: LBA 0 of the
/// view is `base` of the underlying reader.
#[derive(Clone, Copy)]
pub struct SectorView<'r> {
    inner: &'r dyn SectorRead,
    base: Lba,
    count: u64,
}

impl<'r> SectorView<'r> {
    /// A view spanning the whole underlying reader.
    #[must_use]
    pub fn whole(inner: &'r dyn SectorRead) -> Self {
        Self {
            base: Lba(0),
            count: inner.sector_count(),
            inner,
        }
    }

    /// A view over `count` sectors starting at `base`.
    ///
    /// The window is clamped to the underlying disk; an empty window is
    /// rejected by the caller, not here.
    #[must_use]
    pub fn window(inner: &'r dyn SectorRead, base: Lba, count: u64) -> Self {
        let available = inner.sector_count().saturating_sub(base.0);
        Self {
            inner,
            base,
            count: count.min(available),
        }
    }

    #[must_use]
    pub fn base(&self) -> Lba {
        self.base
    }
}

impl SectorRead for SectorView<'_> {
    fn sector_size(&self) -> u32 {
        self.inner.sector_size()
    }

    fn sector_count(&self) -> u64 {
        self.count
    }

    fn read_sector(&self, lba: Lba) -> Result<Vec<u8>> {
        if lba.0 >= self.count {
            return Err(WfsError::out_of_range(format!(
                "sector {lba} beyond view of {} sectors",
                self.count
            )));
        }
        self.inner.read_sector(Lba(self.base.0 + lba.0))
    }

    fn read_sectors(&self, start: Lba, count: u64) -> Result<Vec<u8>> {
        let end = start
            .checked_add(count)
            .ok_or_else(|| WfsError::out_of_range("sector range overflows u64"))?;
        if end.0 > self.count {
            return Err(WfsError::out_of_range(format!(
                "sectors {start}..{end} beyond view of {} sectors",
                self.count
            )));
        }
        self.inner.read_sectors(Lba(self.base.0 + start.0), count)
    }
}

/// Adapts any `ByteDevice` into a raw sector reader.
///
/// This is the degenerate "the file *is* the disk" case used for raw
/// fixtures; the EWF image provides its own `SectorRead` implementation.
pub struct ByteSectorReader<D: ByteDevice> {
    device: D,
    sector_size: u32,
    sector_count: u64,
}

impl<D: ByteDevice> ByteSectorReader<D> {
    pub fn new(device: D, sector_size: u32) -> Result<Self> {
        if sector_size == 0 || !sector_size.is_power_of_two() {
            return Err(WfsError::Unsupported(format!(
                "sector size {sector_size} is not a power of two"
            )));
        }
        let len = device.len_bytes();
        let sector_count = len / u64::from(sector_size);
        trace!(
            target: "wfs::device",
            event = "byte_sector_reader",
            len_bytes = len,
            sector_size,
            sector_count
        );
        Ok(Self {
            device,
            sector_size,
            sector_count,
        })
    }
}

impl<D: ByteDevice> SectorRead for ByteSectorReader<D> {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_sector(&self, lba: Lba) -> Result<Vec<u8>> {
        if lba.0 >= self.sector_count {
            return Err(WfsError::out_of_range(format!(
                "sector {lba} beyond disk of {} sectors",
                self.sector_count
            )));
        }
        let offset = lba
            .to_byte_offset(self.sector_size)
            .ok_or_else(|| WfsError::out_of_range("sector offset overflows u64"))?;
        let mut buf = vec![0_u8; self.sector_size as usize];
        self.device.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }

    fn read_sectors(&self, start: Lba, count: u64) -> Result<Vec<u8>> {
        let end = start
            .checked_add(count)
            .ok_or_else(|| WfsError::out_of_range("sector range overflows u64"))?;
        if end.0 > self.sector_count {
            return Err(WfsError::out_of_range(format!(
                "sectors {start}..{end} beyond disk of {} sectors",
                self.sector_count
            )));
        }
        let offset = start
            .to_byte_offset(self.sector_size)
            .ok_or_else(|| WfsError::out_of_range("sector offset overflows u64"))?;
        let len = usize::try_from(count * u64::from(self.sector_size))
            .map_err(|_| WfsError::out_of_range("read length does not fit usize"))?;
        let mut buf = vec![0_u8; len];
        self.device.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }
}
