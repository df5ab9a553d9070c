#![forbid(unsafe_code)]
//! Filesystem readers over the sector-reader contract.
//!
//! Detects and interprets FAT12/16/32, NTFS, and EXT2/3/4 volumes found
//! either at sector 0 or inside an MBR/GPT partition, exposing a shared
//! file/directory entry model with lazy, cached directory listings.

mod detect;
mod entry;
mod ext;
mod fat;
mod ntfs;
mod path;

pub use detect::{
    discover_partitions, locate_filesystem, probe_filesystem, FilesystemLocation, Partition,
    PartitionKind,
};
pub use entry::{Entry, EntryKind, EntryMeta};

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use wfs_device::{SectorRead, SectorView};
use wfs_error::{Result, WfsError};
use wfs_types::CancelToken;

/// Recognised filesystem families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FilesystemKind {
    Unknown,
    Raw,
    Fat12,
    Fat16,
    Fat32,
    Ntfs,
    Ext2,
    Ext3,
    Ext4,
    Hfs,
    HfsPlus,
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Raw => "raw",
            Self::Fat12 => "FAT12",
            Self::Fat16 => "FAT16",
            Self::Fat32 => "FAT32",
            Self::Ntfs => "NTFS",
            Self::Ext2 => "ext2",
            Self::Ext3 => "ext3",
            Self::Ext4 => "ext4",
            Self::Hfs => "HFS",
            Self::HfsPlus => "HFS+",
        };
        f.write_str(name)
    }
}

/// One opened filesystem; a non-owning view bound to the image's
/// sector reader.
pub struct Filesystem<'r> {
    inner: FsInner<'r>,
}

enum FsInner<'r> {
    Fat(fat::FatFilesystem<'r>),
    Ntfs(ntfs::NtfsFilesystem<'r>),
    Ext(ext::ExtFilesystem<'r>),
}

/// Locate and open the filesystem on `reader` (whole-disk or first
/// recognisable partition).
pub fn open_filesystem<'r>(
    reader: &'r dyn SectorRead,
    cancel: CancelToken,
) -> Result<Filesystem<'r>> {
    let location = locate_filesystem(reader)?;
    let view = match &location.partition {
        Some(partition) => SectorView::window(
            reader,
            wfs_types::Lba(partition.start_lba),
            partition.sector_count,
        ),
        None => SectorView::whole(reader),
    };
    Filesystem::with_view(view, location.kind, cancel)
}

/// Detect the filesystem kind on `reader` without opening it.
pub fn detect_filesystem(reader: &dyn SectorRead) -> Result<FilesystemKind> {
    Ok(locate_filesystem(reader)?.kind)
}

impl<'r> Filesystem<'r> {
    /// Open a known filesystem kind on an explicit sector window.
    pub fn with_view(
        view: SectorView<'r>,
        kind: FilesystemKind,
        cancel: CancelToken,
    ) -> Result<Self> {
        let inner = match kind {
            FilesystemKind::Fat12 | FilesystemKind::Fat16 | FilesystemKind::Fat32 => {
                FsInner::Fat(fat::FatFilesystem::open(view, cancel)?)
            }
            FilesystemKind::Ntfs => FsInner::Ntfs(ntfs::NtfsFilesystem::open(view, cancel)?),
            FilesystemKind::Ext2 | FilesystemKind::Ext3 | FilesystemKind::Ext4 => {
                FsInner::Ext(ext::ExtFilesystem::open(view, cancel)?)
            }
            FilesystemKind::Hfs | FilesystemKind::HfsPlus => {
                return Err(WfsError::Unsupported(
                    "HFS family volumes are detected but not readable".to_owned(),
                ));
            }
            FilesystemKind::Raw | FilesystemKind::Unknown => {
                return Err(WfsError::Unsupported(
                    "no readable filesystem was recognised".to_owned(),
                ));
            }
        };
        Ok(Self { inner })
    }

    /// The concrete kind that was opened (FAT variant resolved).
    #[must_use]
    pub fn kind(&self) -> FilesystemKind {
        match &self.inner {
            FsInner::Fat(fs) => fs.kind(),
            FsInner::Ntfs(fs) => fs.kind(),
            FsInner::Ext(fs) => fs.kind(),
        }
    }

    /// FAT and NTFS names compare case-insensitively, EXT exactly.
    #[must_use]
    pub fn case_insensitive(&self) -> bool {
        !matches!(self.inner, FsInner::Ext(_))
    }

    pub fn root(&self) -> Result<Dir<'_, 'r>> {
        let entry = self.root_entry()?;
        Ok(Dir { fs: self, entry })
    }

    pub fn open_dir(&self, path: &str) -> Result<Dir<'_, 'r>> {
        let entry = path::resolve(self, path)?;
        if !entry.is_dir() {
            return Err(not_a_directory(path));
        }
        Ok(Dir { fs: self, entry })
    }

    pub fn open_file(&self, path: &str) -> Result<File<'_, 'r>> {
        let entry = path::resolve(self, path)?;
        if entry.is_dir() {
            return Err(is_a_directory(path));
        }
        Ok(File { fs: self, entry })
    }

    /// Wrap a listed entry into a directory handle.
    pub fn dir_from(&self, entry: &Entry) -> Result<Dir<'_, 'r>> {
        if !entry.is_dir() {
            return Err(not_a_directory(&entry.meta.path));
        }
        Ok(Dir {
            fs: self,
            entry: entry.clone(),
        })
    }

    /// Wrap a listed entry into a file handle.
    pub fn file_from(&self, entry: &Entry) -> Result<File<'_, 'r>> {
        if entry.is_dir() {
            return Err(is_a_directory(&entry.meta.path));
        }
        Ok(File {
            fs: self,
            entry: entry.clone(),
        })
    }

    pub(crate) fn root_entry(&self) -> Result<Entry> {
        match &self.inner {
            FsInner::Fat(fs) => Ok(fs.root_entry()),
            FsInner::Ntfs(fs) => fs.root_entry(),
            FsInner::Ext(fs) => fs.root_entry(),
        }
    }

    pub(crate) fn entries_of(&self, dir: &Entry) -> Result<Arc<Vec<Entry>>> {
        match &self.inner {
            FsInner::Fat(fs) => fs.entries_of(dir),
            FsInner::Ntfs(fs) => fs.entries_of(dir),
            FsInner::Ext(fs) => fs.entries_of(dir),
        }
    }

    pub(crate) fn read_span(&self, file: &Entry, offset: u64, len: u64) -> Result<Vec<u8>> {
        match &self.inner {
            FsInner::Fat(fs) => fs.read_span(file, offset, len),
            FsInner::Ntfs(fs) => fs.read_span(file, offset, len),
            FsInner::Ext(fs) => fs.read_span(file, offset, len),
        }
    }

    /// Natural allocation unit, used as the stream granularity.
    pub(crate) fn io_unit(&self) -> u64 {
        match &self.inner {
            FsInner::Fat(fs) => fs.cluster_size(),
            FsInner::Ntfs(fs) => fs.cluster_size(),
            FsInner::Ext(fs) => fs.block_size(),
        }
    }
}

fn not_a_directory(path: &str) -> WfsError {
    WfsError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("not a directory: {path}"),
    ))
}

fn is_a_directory(path: &str) -> WfsError {
    WfsError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("is a directory: {path}"),
    ))
}

/// Directory handle borrowing its filesystem.
pub struct Dir<'f, 'r> {
    fs: &'f Filesystem<'r>,
    entry: Entry,
}

impl<'f, 'r> Dir<'f, 'r> {
    #[must_use]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Materialised child list; cached by the filesystem after the
    /// first enumeration.
    pub fn entries(&self) -> Result<Vec<Entry>> {
        Ok(self.fs.entries_of(&self.entry)?.as_ref().clone())
    }

    /// Look up one child by name under the filesystem's case rule.
    pub fn find(&self, name: &str) -> Result<Option<Entry>> {
        let case_insensitive = self.fs.case_insensitive();
        Ok(self
            .fs
            .entries_of(&self.entry)?
            .iter()
            .find(|e| path::name_matches(case_insensitive, &e.meta.name, name))
            .cloned())
    }

    /// Child files only.
    pub fn files(&self) -> Result<Vec<Entry>> {
        Ok(self
            .fs
            .entries_of(&self.entry)?
            .iter()
            .filter(|e| e.is_file())
            .cloned()
            .collect())
    }

    /// Child directories only.
    pub fn dirs(&self) -> Result<Vec<Entry>> {
        Ok(self
            .fs
            .entries_of(&self.entry)?
            .iter()
            .filter(|e| e.is_dir())
            .cloned()
            .collect())
    }

    /// Descend into a child directory.
    pub fn open_dir(&self, name: &str) -> Result<Dir<'f, 'r>> {
        match self.find(name)? {
            Some(entry) if entry.is_dir() => Ok(Dir {
                fs: self.fs,
                entry,
            }),
            Some(entry) => Err(not_a_directory(&entry.meta.path)),
            None => Err(WfsError::not_found(name)),
        }
    }

    /// Open a child file.
    pub fn open_file(&self, name: &str) -> Result<File<'f, 'r>> {
        match self.find(name)? {
            Some(entry) if entry.is_file() => Ok(File {
                fs: self.fs,
                entry,
            }),
            Some(entry) => Err(is_a_directory(&entry.meta.path)),
            None => Err(WfsError::not_found(name)),
        }
    }
}

/// File handle borrowing its filesystem.
pub struct File<'f, 'r> {
    fs: &'f Filesystem<'r>,
    entry: Entry,
}

impl<'f, 'r> File<'f, 'r> {
    #[must_use]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.entry.meta.size
    }

    /// Read the whole content.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        self.fs.read_span(&self.entry, 0, self.entry.meta.size)
    }

    /// Positional read; returns the number of bytes copied, short only
    /// at end of file.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let size = self.entry.meta.size;
        if offset > size {
            return Err(WfsError::out_of_range(format!(
                "offset {offset} beyond file of {size} bytes"
            )));
        }
        let want = (buf.len() as u64).min(size - offset);
        if want == 0 {
            return Ok(0);
        }
        let data = self.fs.read_span(&self.entry, offset, want)?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    /// Pull-based content stream: finite, non-restartable, one
    /// allocation unit per pull.
    #[must_use]
    pub fn open_stream(&self) -> FileStream<'f, 'r> {
        FileStream {
            fs: self.fs,
            entry: self.entry.clone(),
            position: 0,
            unit: self.fs.io_unit().max(512),
        }
    }
}

/// Iterator of content buffers; ends after the final chunk or the
/// first error.
pub struct FileStream<'f, 'r> {
    fs: &'f Filesystem<'r>,
    entry: Entry,
    position: u64,
    unit: u64,
}

impl Iterator for FileStream<'_, '_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let size = self.entry.meta.size;
        if self.position >= size {
            return None;
        }
        let take = self.unit.min(size - self.position);
        match self.fs.read_span(&self.entry, self.position, take) {
            Ok(data) => {
                self.position += take;
                Some(Ok(data))
            }
            Err(err) => {
                self.position = size; // fuse after an error
                Some(Err(err))
            }
        }
    }
}
