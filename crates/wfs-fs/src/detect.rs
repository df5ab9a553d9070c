use crate::FilesystemKind;
use serde::Serialize;
use tracing::{debug, warn};
use wfs_device::{SectorRead, SectorView};
use wfs_error::{Result, WfsError};
use wfs_types::{ByteOffset, Lba};
use wfs_ondisk::ext::{ExtSuperblock, EXT_SUPERBLOCK_OFFSET, EXT_SUPERBLOCK_SIZE};
use wfs_ondisk::fat::{FatBootSector, FatVariant};
use wfs_ondisk::gpt::{GptHeader, GptPartitionEntry};
use wfs_ondisk::mbr::Mbr;
use wfs_ondisk::ntfs::NtfsBootSector;

/// Upper bound on GPT entries walked, matching the on-disk norm.
const MAX_GPT_ENTRIES: u32 = 1024;

/// How a partition is described by its table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PartitionKind {
    Mbr { partition_type: u8 },
    Gpt { type_guid: String },
}

/// One discovered partition, in table order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub index: usize,
    pub start_lba: u64,
    pub sector_count: u64,
    pub kind: PartitionKind,
    pub name: Option<String>,
}

/// Parse MBR (and GPT behind a protective entry) from the first
/// sectors. A disk without a recognisable table yields an empty list.
pub fn discover_partitions(reader: &dyn SectorRead) -> Result<Vec<Partition>> {
    if reader.sector_count() == 0 {
        return Ok(Vec::new());
    }
    let sector0 = reader.read_sector(Lba(0))?;
    let Ok(mbr) = Mbr::parse(&sector0) else {
        return Ok(Vec::new());
    };

    if mbr.has_protective_gpt() {
        return discover_gpt(reader);
    }

    let disk_sectors = reader.sector_count();
    let mut partitions = Vec::new();
    for (index, entry) in mbr.used_entries().enumerate() {
        let start = u64::from(entry.start_lba);
        let count = u64::from(entry.sector_count);
        if start == 0 || start >= disk_sectors {
            warn!(
                target: "wfs::fs",
                index,
                start,
                "MBR entry outside the disk, skipped"
            );
            continue;
        }
        partitions.push(Partition {
            index,
            start_lba: start,
            sector_count: count.min(disk_sectors - start),
            kind: PartitionKind::Mbr {
                partition_type: entry.partition_type,
            },
            name: None,
        });
    }
    debug!(target: "wfs::fs", event = "mbr", partitions = partitions.len());
    Ok(partitions)
}

fn discover_gpt(reader: &dyn SectorRead) -> Result<Vec<Partition>> {
    let header_sector = reader.read_sector(Lba(1))?;
    let header = GptHeader::parse(&header_sector).map_err(|e| {
        WfsError::FilesystemCorrupt(format!("GPT header behind protective MBR: {e}"))
    })?;
    if !header.header_crc_valid(&header_sector) {
        warn!(
            target: "wfs::fs",
            stored = header.header_crc,
            "GPT header CRC mismatch; continuing with parsed values"
        );
    }

    let entry_size = header.entry_size as u64;
    let entry_count = header.entry_count.min(MAX_GPT_ENTRIES);
    let table = reader.read_bytes(
        ByteOffset(header.partition_entry_lba * u64::from(reader.sector_size())),
        u64::from(entry_count) * entry_size,
    )?;

    let mut partitions = Vec::new();
    for index in 0..entry_count as usize {
        let raw = &table[index * entry_size as usize..(index + 1) * entry_size as usize];
        let entry = GptPartitionEntry::parse(raw)
            .map_err(|e| WfsError::FilesystemCorrupt(format!("GPT entry {index}: {e}")))?;
        if entry.is_unused() {
            continue;
        }
        partitions.push(Partition {
            index,
            start_lba: entry.first_lba,
            sector_count: entry.sector_count(),
            kind: PartitionKind::Gpt {
                type_guid: entry.type_guid_string(),
            },
            name: if entry.name.is_empty() {
                None
            } else {
                Some(entry.name.clone())
            },
        });
    }
    debug!(target: "wfs::fs", event = "gpt", partitions = partitions.len());
    Ok(partitions)
}

/// Probe one view (whole disk or partition) for a filesystem signature.
///
/// Order: NTFS OEM string, FAT BPB, EXT superblock at byte 1024, HFS
/// family signatures at byte 1024.
pub fn probe_filesystem(reader: &dyn SectorRead) -> Result<FilesystemKind> {
    if reader.sector_count() == 0 {
        return Ok(FilesystemKind::Unknown);
    }
    let sector0 = reader.read_sector(Lba(0))?;

    if NtfsBootSector::parse(&sector0).is_ok() {
        return Ok(FilesystemKind::Ntfs);
    }
    if let Ok(boot) = FatBootSector::parse(&sector0) {
        return Ok(match boot.variant() {
            FatVariant::Fat12 => FilesystemKind::Fat12,
            FatVariant::Fat16 => FilesystemKind::Fat16,
            FatVariant::Fat32 => FilesystemKind::Fat32,
        });
    }

    let disk_bytes = reader.sector_count() * u64::from(reader.sector_size());
    if disk_bytes >= EXT_SUPERBLOCK_OFFSET + EXT_SUPERBLOCK_SIZE as u64 {
        let region = reader.read_bytes(
            ByteOffset(EXT_SUPERBLOCK_OFFSET),
            EXT_SUPERBLOCK_SIZE as u64,
        )?;
        if let Ok(superblock) = ExtSuperblock::parse(&region) {
            return Ok(match superblock.variant() {
                wfs_ondisk::ext::ExtVariant::Ext2 => FilesystemKind::Ext2,
                wfs_ondisk::ext::ExtVariant::Ext3 => FilesystemKind::Ext3,
                wfs_ondisk::ext::ExtVariant::Ext4 => FilesystemKind::Ext4,
            });
        }
        // HFS volume headers live at the same 1024-byte offset.
        if region[..2] == *b"H+" || region[..2] == *b"HX" {
            return Ok(FilesystemKind::HfsPlus);
        }
        if region[..2] == *b"BD" {
            return Ok(FilesystemKind::Hfs);
        }
    }

    Ok(FilesystemKind::Raw)
}

/// Where a filesystem was found on the disk.
#[derive(Debug, Clone)]
pub struct FilesystemLocation {
    pub kind: FilesystemKind,
    /// `None` when the filesystem starts at sector 0 (superfloppy).
    pub partition: Option<Partition>,
}

/// Probe the whole disk first, then each discovered partition; the
/// first recognisable filesystem wins.
pub fn locate_filesystem(reader: &dyn SectorRead) -> Result<FilesystemLocation> {
    let direct = probe_filesystem(reader)?;
    if direct != FilesystemKind::Raw && direct != FilesystemKind::Unknown {
        return Ok(FilesystemLocation {
            kind: direct,
            partition: None,
        });
    }

    for partition in discover_partitions(reader)? {
        let view = SectorView::window(reader, Lba(partition.start_lba), partition.sector_count);
        let kind = probe_filesystem(&view)?;
        if kind != FilesystemKind::Raw && kind != FilesystemKind::Unknown {
            debug!(
                target: "wfs::fs",
                event = "located",
                kind = %kind,
                start_lba = partition.start_lba
            );
            return Ok(FilesystemLocation {
                kind,
                partition: Some(partition),
            });
        }
    }

    Ok(FilesystemLocation {
        kind: FilesystemKind::Raw,
        partition: None,
    })
}
