use crate::entry::{child_path, Entry, EntryKind, EntryMeta, Locator};
use crate::FilesystemKind;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use wfs_device::{SectorRead, SectorView};
use wfs_error::{Result, WfsError};
use wfs_types::{ByteOffset, CancelToken, Lba};
use wfs_ondisk::fat::{
    assemble_long_name, FatBootSector, FatDirEntryRaw, FatLfnEntryRaw, FatVariant,
    FAT_ATTR_LFN, FAT_DIR_ENTRY_SIZE,
};

/// Sentinel locator for the fixed FAT12/16 root directory region.
const ROOT_REGION: u32 = 0;

pub(crate) struct FatFilesystem<'r> {
    view: SectorView<'r>,
    boot: FatBootSector,
    variant: FatVariant,
    cancel: CancelToken,
    dir_cache: Mutex<HashMap<u32, Arc<Vec<Entry>>>>,
}

impl<'r> FatFilesystem<'r> {
    pub(crate) fn open(view: SectorView<'r>, cancel: CancelToken) -> Result<Self> {
        let sector0 = view.read_sector(Lba(0))?;
        let boot = FatBootSector::parse(&sector0)
            .map_err(|e| WfsError::FilesystemCorrupt(format!("FAT boot sector: {e}")))?;
        let variant = boot.variant();
        debug!(
            target: "wfs::fs",
            event = "fat_open",
            variant = ?variant,
            clusters = boot.cluster_count(),
            bytes_per_sector = boot.bytes_per_sector
        );
        Ok(Self {
            view,
            boot,
            variant,
            cancel,
            dir_cache: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn kind(&self) -> FilesystemKind {
        match self.variant {
            FatVariant::Fat12 => FilesystemKind::Fat12,
            FatVariant::Fat16 => FilesystemKind::Fat16,
            FatVariant::Fat32 => FilesystemKind::Fat32,
        }
    }

    fn bps(&self) -> u64 {
        u64::from(self.boot.bytes_per_sector)
    }

    pub(crate) fn cluster_size(&self) -> u64 {
        u64::from(self.boot.sectors_per_cluster) * self.bps()
    }

    fn cluster_byte_offset(&self, cluster: u32) -> u64 {
        self.boot.data_start_sector() * self.bps()
            + u64::from(cluster - 2) * self.cluster_size()
    }

    pub(crate) fn root_entry(&self) -> Entry {
        let first_cluster = match self.variant {
            FatVariant::Fat32 => self.boot.root_cluster,
            _ => ROOT_REGION,
        };
        Entry {
            meta: EntryMeta {
                name: String::new(),
                path: "/".to_owned(),
                size: 0,
                kind: EntryKind::Directory,
                deleted: false,
                attributes: 0x10,
                created: None,
                modified: None,
                accessed: None,
            },
            locator: Locator::Fat { first_cluster },
        }
    }

    /// FAT lookup: `getNextCluster` with the variant's entry width and
    /// end-of-chain threshold.
    fn next_cluster(&self, cluster: u32) -> Result<Option<u32>> {
        if cluster < 2 {
            return Err(WfsError::FilesystemCorrupt(format!(
                "FAT chain references reserved cluster {cluster}"
            )));
        }
        let fat_base = self.boot.fat_start_sector() * self.bps();
        let value = match self.variant {
            FatVariant::Fat32 => {
                let raw = self
                    .view
                    .read_bytes(ByteOffset(fat_base + u64::from(cluster) * 4), 4)?;
                u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) & 0x0FFF_FFFF
            }
            FatVariant::Fat16 => {
                let raw = self
                    .view
                    .read_bytes(ByteOffset(fat_base + u64::from(cluster) * 2), 2)?;
                u32::from(u16::from_le_bytes([raw[0], raw[1]]))
            }
            FatVariant::Fat12 => {
                // Entries straddle byte boundaries: 1.5 bytes each.
                let offset = u64::from(cluster) + u64::from(cluster / 2);
                let raw = self.view.read_bytes(ByteOffset(fat_base + offset), 2)?;
                let word = u16::from_le_bytes([raw[0], raw[1]]);
                if cluster & 1 == 1 {
                    u32::from(word >> 4)
                } else {
                    u32::from(word & 0x0FFF)
                }
            }
        };

        if value >= self.variant.end_of_chain() {
            return Ok(None);
        }
        if value < 2 {
            return Err(WfsError::FilesystemCorrupt(format!(
                "FAT chain from cluster {cluster} hits free/reserved entry {value}"
            )));
        }
        Ok(Some(value))
    }

    fn cluster_chain(&self, start: u32) -> Result<Vec<u32>> {
        let mut chain = vec![start];
        let mut current = start;
        let limit = self.boot.cluster_count() + 2;
        while let Some(next) = self.next_cluster(current)? {
            self.cancel.checkpoint()?;
            chain.push(next);
            current = next;
            if chain.len() as u64 > limit {
                return Err(WfsError::FilesystemCorrupt(format!(
                    "cluster chain from {start} exceeds the cluster count; loop suspected"
                )));
            }
        }
        Ok(chain)
    }

    /// Raw bytes of a directory: fixed root region or cluster chain.
    fn directory_bytes(&self, locator: u32) -> Result<Vec<u8>> {
        if locator == ROOT_REGION {
            let offset = self.boot.root_dir_start_sector() * self.bps();
            let len = self.boot.root_dir_sectors() * self.bps();
            return self.view.read_bytes(ByteOffset(offset), len);
        }
        let mut bytes = Vec::new();
        for cluster in self.cluster_chain(locator)? {
            bytes.extend_from_slice(&self.view.read_bytes(
                ByteOffset(self.cluster_byte_offset(cluster)),
                self.cluster_size(),
            )?);
        }
        Ok(bytes)
    }

    pub(crate) fn entries_of(&self, dir: &Entry) -> Result<Arc<Vec<Entry>>> {
        let Locator::Fat { first_cluster } = dir.locator else {
            return Err(WfsError::FilesystemCorrupt(
                "foreign entry handed to a FAT filesystem".to_owned(),
            ));
        };
        if let Some(cached) = self.dir_cache.lock().get(&first_cluster) {
            return Ok(Arc::clone(cached));
        }

        let bytes = self.directory_bytes(first_cluster)?;
        let entries = Arc::new(self.parse_directory(&bytes, &dir.meta.path)?);
        self.dir_cache
            .lock()
            .insert(first_cluster, Arc::clone(&entries));
        Ok(entries)
    }

    fn parse_directory(&self, bytes: &[u8], parent_path: &str) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        let mut lfn: Vec<FatLfnEntryRaw> = Vec::new();

        for record in bytes.chunks_exact(FAT_DIR_ENTRY_SIZE) {
            self.cancel.checkpoint()?;
            match record[0] {
                // Free entry: the listing ends here.
                0x00 => break,
                // Deleted entry; any pending LFN run is orphaned.
                0xE5 => {
                    lfn.clear();
                    continue;
                }
                _ => {}
            }

            if record[11] == FAT_ATTR_LFN {
                let component = FatLfnEntryRaw::parse(record).map_err(|e| {
                    WfsError::FilesystemCorrupt(format!("long name entry: {e}"))
                })?;
                lfn.push(component);
                continue;
            }

            let raw = FatDirEntryRaw::parse(record)
                .map_err(|e| WfsError::FilesystemCorrupt(format!("directory entry: {e}")))?;
            if raw.is_volume_label() {
                lfn.clear();
                continue;
            }

            let short = raw.short_name();
            if short == "." || short == ".." {
                lfn.clear();
                continue;
            }
            let name = assemble_long_name(&lfn).unwrap_or(short);
            lfn.clear();

            let kind = if raw.is_directory() {
                EntryKind::Directory
            } else {
                EntryKind::File
            };
            entries.push(Entry {
                meta: EntryMeta {
                    path: child_path(parent_path, &name),
                    name,
                    size: if kind == EntryKind::Directory {
                        0
                    } else {
                        u64::from(raw.size)
                    },
                    kind,
                    deleted: false,
                    attributes: u32::from(raw.attributes),
                    created: fat_datetime(raw.creation_date, raw.creation_time),
                    modified: fat_datetime(raw.write_date, raw.write_time),
                    accessed: fat_datetime(raw.access_date, 0),
                },
                locator: Locator::Fat {
                    first_cluster: raw.first_cluster,
                },
            });
        }
        Ok(entries)
    }

    pub(crate) fn read_span(&self, file: &Entry, offset: u64, len: u64) -> Result<Vec<u8>> {
        let Locator::Fat { first_cluster } = file.locator else {
            return Err(WfsError::FilesystemCorrupt(
                "foreign entry handed to a FAT filesystem".to_owned(),
            ));
        };
        if len == 0 {
            return Ok(Vec::new());
        }
        if first_cluster < 2 {
            // Zero-length files carry no cluster at all.
            return Err(WfsError::FilesystemCorrupt(format!(
                "file {} has data but no start cluster",
                file.meta.path
            )));
        }

        let cluster_size = self.cluster_size();
        let chain = self.cluster_chain(first_cluster)?;
        let first_index = usize::try_from(offset / cluster_size)
            .map_err(|_| WfsError::out_of_range("cluster index does not fit usize"))?;

        let mut out = Vec::with_capacity(usize::try_from(len).unwrap_or(0));
        let mut skip = offset % cluster_size;
        let mut remaining = len;

        for cluster in chain.iter().skip(first_index) {
            if remaining == 0 {
                break;
            }
            self.cancel.checkpoint()?;
            let take = (cluster_size - skip).min(remaining);
            let data = self.view.read_bytes(
                ByteOffset(self.cluster_byte_offset(*cluster) + skip),
                take,
            )?;
            out.extend_from_slice(&data);
            remaining -= take;
            skip = 0;
        }

        if remaining > 0 {
            return Err(WfsError::FilesystemCorrupt(format!(
                "cluster chain of {} ends {remaining} bytes early",
                file.meta.path
            )));
        }
        Ok(out)
    }
}

/// Decode a DOS date/time pair (2-second precision). A zero date means
/// "not set"; implausible field values also map to `None`.
fn fat_datetime(date: u16, time: u16) -> Option<DateTime<Utc>> {
    if date == 0 {
        return None;
    }
    let year = 1980 + i32::from(date >> 9);
    let month = u32::from((date >> 5) & 0x0F);
    let day = u32::from(date & 0x1F);
    let hour = u32::from(time >> 11);
    let minute = u32::from((time >> 5) & 0x3F);
    let second = u32::from(time & 0x1F) * 2;

    Some(
        NaiveDate::from_ymd_opt(year, month, day)?
            .and_hms_opt(hour, minute, second)?
            .and_utc(),
    )
}
