#![forbid(unsafe_code)]
//! Top-level WitnessFS API: open an E01 image, read sectors, discover
//! partitions, and open the filesystem inside.

use std::path::Path;
use wfs_device::{ByteDevice, SectorRead};
use wfs_error::Result;
use wfs_ewf::EwfImage;
use wfs_types::{ByteOffset, CancelToken, Lba};

pub use wfs_device::{FileByteDevice, MemoryByteDevice, SectorView};
pub use wfs_error::WfsError;
pub use wfs_ewf::{
    AcquisitionError, CaseInfo, DigestInfo, EwfMetadata, OpenOptions, SectionDescriptor,
    SectionKind, VolumeDescriptorKind, VolumeInfo, Warning, DEFAULT_CHUNK_CACHE,
};
pub use wfs_fs::{
    Dir, Entry, EntryKind, EntryMeta, File, FileStream, Filesystem, FilesystemKind, Partition,
    PartitionKind,
};
pub use wfs_types::CancelToken as Cancel;

/// An opened forensic image.
///
/// Owns the byte source; dropping the image releases it. Filesystem and
/// reader views borrow the image and cannot outlive it.
pub struct Image {
    ewf: EwfImage,
}

impl Image {
    /// Open the image at `path` in lax (warning-collecting) mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            ewf: EwfImage::open(path)?,
        })
    }

    /// Open with explicit strictness, cache sizing, and cancellation.
    pub fn open_with(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        Ok(Self {
            ewf: EwfImage::open_with(path, options)?,
        })
    }

    /// Open from an arbitrary byte device (memory images, custom
    /// sources).
    pub fn from_device(device: Box<dyn ByteDevice>, options: OpenOptions) -> Result<Self> {
        Ok(Self {
            ewf: EwfImage::from_device(device, options)?,
        })
    }

    /// Quick signature check without a full parse.
    #[must_use]
    pub fn is_ewf_file(path: impl AsRef<Path>) -> bool {
        EwfImage::is_ewf_file(path)
    }

    #[must_use]
    pub fn sector_size(&self) -> u32 {
        self.ewf.sector_size()
    }

    #[must_use]
    pub fn sector_count(&self) -> u64 {
        self.ewf.sector_count()
    }

    /// Reconstructed disk size in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.ewf.disk_size()
    }

    #[must_use]
    pub fn metadata(&self) -> &EwfMetadata {
        self.ewf.metadata()
    }

    #[must_use]
    pub fn sections(&self) -> &[SectionDescriptor] {
        self.ewf.sections()
    }

    /// Recoverable problems collected at open time and during reads.
    #[must_use]
    pub fn warnings(&self) -> Vec<Warning> {
        self.ewf.warnings()
    }

    /// Handle for cancelling in-flight operations on this image.
    #[must_use]
    pub fn canceller(&self) -> CancelToken {
        self.ewf.canceller()
    }

    pub fn read_sector(&self, lba: u64) -> Result<Vec<u8>> {
        self.ewf.read_sector(Lba(lba))
    }

    pub fn read_sectors(&self, start: u64, count: u64) -> Result<Vec<u8>> {
        self.ewf.read_sectors(Lba(start), count)
    }

    pub fn read_bytes(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.ewf.read_bytes(ByteOffset(offset), len)
    }

    /// The sector-reader contract consumed by partition and filesystem
    /// code.
    #[must_use]
    pub fn reader(&self) -> &dyn SectorRead {
        &self.ewf
    }

    /// Partition table of the reconstructed disk (MBR, or GPT behind a
    /// protective entry).
    pub fn partitions(&self) -> Result<Vec<Partition>> {
        wfs_fs::discover_partitions(&self.ewf)
    }

    /// Kind of the filesystem found on the disk or inside its first
    /// recognisable partition.
    pub fn detect_filesystem(&self) -> Result<FilesystemKind> {
        wfs_fs::detect_filesystem(&self.ewf)
    }

    /// Open the filesystem for directory listing and file extraction.
    pub fn open_filesystem(&self) -> Result<Filesystem<'_>> {
        wfs_fs::open_filesystem(&self.ewf, self.ewf.canceller())
    }
}
