use crate::entry::{child_path, Entry, EntryKind, EntryMeta, Locator};
use crate::FilesystemKind;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use wfs_device::{SectorRead, SectorView};
use wfs_error::{Result, WfsError};
use wfs_types::{ByteOffset, CancelToken, Lba};
use wfs_ondisk::ntfs::{
    apply_fixups, decode_data_runs, filetime_to_unix, parse_attributes, parse_index_block,
    AttrContent, DataRun, FileNameAttr, IndexEntry, IndexRoot, MftRecordHeader, NtfsBootSector,
    StandardInfo, ATTR_DATA, ATTR_FILE_NAME, ATTR_INDEX_ALLOCATION, ATTR_INDEX_ROOT,
    ATTR_STANDARD_INFORMATION, FILE_NAME_NAMESPACE_DOS, MFT_RECORD_ROOT, MFT_REFERENCE_MASK,
};

/// `$FILE_NAME` flag bit marking directories in index keys.
const FILE_NAME_FLAG_DIRECTORY: u32 = 0x1000_0000;

pub(crate) struct NtfsFilesystem<'r> {
    view: SectorView<'r>,
    cluster_size: u64,
    record_size: u64,
    index_block_size: u64,
    mft_byte_offset: u64,
    sector_size: usize,
    cancel: CancelToken,
    record_cache: Mutex<HashMap<u64, Arc<ParsedRecord>>>,
    dir_cache: Mutex<HashMap<u64, Arc<Vec<Entry>>>>,
}

/// Attributes of one MFT record, lifted into reader-friendly form.
struct ParsedRecord {
    header: MftRecordHeader,
    std_info: Option<StandardInfo>,
    file_name: Option<FileNameAttr>,
    data_resident: Option<Vec<u8>>,
    data_runs: Option<(Vec<DataRun>, u64)>,
    index_root_entries: Vec<IndexEntry>,
    index_alloc_runs: Vec<DataRun>,
}

impl<'r> NtfsFilesystem<'r> {
    pub(crate) fn open(view: SectorView<'r>, cancel: CancelToken) -> Result<Self> {
        let sector0 = view.read_sector(Lba(0))?;
        let boot = NtfsBootSector::parse(&sector0)
            .map_err(|e| WfsError::FilesystemCorrupt(format!("NTFS boot sector: {e}")))?;

        let cluster_size = boot.cluster_size();
        let record_size = boot.mft_record_size();
        if record_size == 0 || record_size > 64 * 1024 {
            return Err(WfsError::FilesystemCorrupt(format!(
                "implausible MFT record size {record_size}"
            )));
        }
        debug!(
            target: "wfs::fs",
            event = "ntfs_open",
            cluster_size,
            record_size,
            mft_cluster = boot.mft_start_cluster
        );
        Ok(Self {
            mft_byte_offset: boot.mft_start_cluster * cluster_size,
            index_block_size: boot.index_block_size(),
            sector_size: usize::from(boot.bytes_per_sector),
            cluster_size,
            record_size,
            view,
            cancel,
            record_cache: Mutex::new(HashMap::new()),
            dir_cache: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn kind(&self) -> FilesystemKind {
        FilesystemKind::Ntfs
    }

    pub(crate) fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    fn record(&self, number: u64) -> Result<Arc<ParsedRecord>> {
        if let Some(cached) = self.record_cache.lock().get(&number) {
            return Ok(Arc::clone(cached));
        }

        let offset = self.mft_byte_offset + number * self.record_size;
        let mut raw = self
            .view
            .read_bytes(ByteOffset(offset), self.record_size)?;
        apply_fixups(&mut raw, self.sector_size).map_err(|e| {
            WfsError::FilesystemCorrupt(format!("MFT record {number} fixups: {e}"))
        })?;
        let header = MftRecordHeader::parse(&raw)
            .map_err(|e| WfsError::FilesystemCorrupt(format!("MFT record {number}: {e}")))?;
        let attrs = parse_attributes(&raw, &header)
            .map_err(|e| WfsError::FilesystemCorrupt(format!("MFT record {number}: {e}")))?;

        let mut parsed = ParsedRecord {
            header,
            std_info: None,
            file_name: None,
            data_resident: None,
            data_runs: None,
            index_root_entries: Vec::new(),
            index_alloc_runs: Vec::new(),
        };

        for attr in attrs {
            match (attr.attr_type, &attr.content) {
                (ATTR_STANDARD_INFORMATION, AttrContent::Resident { data }) => {
                    parsed.std_info = Some(StandardInfo::parse(data).map_err(|e| {
                        WfsError::FilesystemCorrupt(format!("record {number} $STANDARD_INFORMATION: {e}"))
                    })?);
                }
                (ATTR_FILE_NAME, AttrContent::Resident { data }) => {
                    let name = FileNameAttr::parse(data).map_err(|e| {
                        WfsError::FilesystemCorrupt(format!("record {number} $FILE_NAME: {e}"))
                    })?;
                    // Prefer a Win32/POSIX name over a DOS-only alias.
                    let replace = match &parsed.file_name {
                        None => true,
                        Some(current) => {
                            current.namespace == FILE_NAME_NAMESPACE_DOS
                                && name.namespace != FILE_NAME_NAMESPACE_DOS
                        }
                    };
                    if replace {
                        parsed.file_name = Some(name);
                    }
                }
                (ATTR_DATA, AttrContent::Resident { data }) if attr.name.is_empty() => {
                    parsed.data_resident = Some(data.clone());
                }
                (
                    ATTR_DATA,
                    AttrContent::NonResident {
                        runs_raw,
                        real_size,
                        ..
                    },
                ) if attr.name.is_empty() => {
                    let runs = decode_data_runs(runs_raw).map_err(|e| {
                        WfsError::FilesystemCorrupt(format!("record {number} data runs: {e}"))
                    })?;
                    parsed.data_runs = Some((runs, *real_size));
                }
                (ATTR_INDEX_ROOT, AttrContent::Resident { data }) if attr.name == "$I30" => {
                    let root = IndexRoot::parse(data).map_err(|e| {
                        WfsError::FilesystemCorrupt(format!("record {number} $INDEX_ROOT: {e}"))
                    })?;
                    parsed.index_root_entries = root.entries;
                }
                (
                    ATTR_INDEX_ALLOCATION,
                    AttrContent::NonResident { runs_raw, .. },
                ) if attr.name == "$I30" => {
                    parsed.index_alloc_runs = decode_data_runs(runs_raw).map_err(|e| {
                        WfsError::FilesystemCorrupt(format!(
                            "record {number} $INDEX_ALLOCATION runs: {e}"
                        ))
                    })?;
                }
                _ => {}
            }
        }

        let parsed = Arc::new(parsed);
        self.record_cache
            .lock()
            .insert(number, Arc::clone(&parsed));
        Ok(parsed)
    }

    pub(crate) fn root_entry(&self) -> Result<Entry> {
        let record = self.record(MFT_RECORD_ROOT)?;
        let std = record.std_info.as_ref();
        Ok(Entry {
            meta: EntryMeta {
                name: String::new(),
                path: "/".to_owned(),
                size: 0,
                kind: EntryKind::Directory,
                deleted: !record.header.is_in_use(),
                attributes: std.map_or(0, |s| s.dos_attributes),
                created: std.and_then(|s| nt_datetime(s.created)),
                modified: std.and_then(|s| nt_datetime(s.modified)),
                accessed: std.and_then(|s| nt_datetime(s.accessed)),
            },
            locator: Locator::Ntfs {
                record: MFT_RECORD_ROOT,
            },
        })
    }

    /// Read the full byte extent of a run list (sparse runs as zeros).
    fn read_runs(&self, runs: &[DataRun]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for run in runs {
            self.cancel.checkpoint()?;
            let run_bytes = run.clusters * self.cluster_size;
            match run.lcn {
                Some(lcn) => {
                    let data = self
                        .view
                        .read_bytes(ByteOffset(lcn * self.cluster_size), run_bytes)?;
                    out.extend_from_slice(&data);
                }
                None => out.resize(
                    out.len()
                        + usize::try_from(run_bytes).map_err(|_| {
                            WfsError::out_of_range("sparse run does not fit usize")
                        })?,
                    0,
                ),
            }
        }
        Ok(out)
    }

    fn index_entries(&self, record: &ParsedRecord, number: u64) -> Result<Vec<IndexEntry>> {
        let mut entries = record.index_root_entries.clone();

        if !record.index_alloc_runs.is_empty() {
            let bytes = self.read_runs(&record.index_alloc_runs)?;
            let block_size = usize::try_from(self.index_block_size)
                .map_err(|_| WfsError::out_of_range("index block size does not fit usize"))?;
            for block in bytes.chunks(block_size) {
                self.cancel.checkpoint()?;
                if block.len() < block_size || block.iter().all(|b| *b == 0) {
                    continue;
                }
                let mut block = block.to_vec();
                apply_fixups(&mut block, self.sector_size).map_err(|e| {
                    WfsError::FilesystemCorrupt(format!(
                        "INDX block of record {number} fixups: {e}"
                    ))
                })?;
                entries.extend(parse_index_block(&block).map_err(|e| {
                    WfsError::FilesystemCorrupt(format!("INDX block of record {number}: {e}"))
                })?);
            }
        }
        Ok(entries)
    }

    pub(crate) fn entries_of(&self, dir: &Entry) -> Result<Arc<Vec<Entry>>> {
        let Locator::Ntfs { record: number } = dir.locator else {
            return Err(WfsError::FilesystemCorrupt(
                "foreign entry handed to an NTFS filesystem".to_owned(),
            ));
        };
        if let Some(cached) = self.dir_cache.lock().get(&number) {
            return Ok(Arc::clone(cached));
        }

        let record = self.record(number)?;
        if !record.header.is_directory() {
            return Err(WfsError::FilesystemCorrupt(format!(
                "MFT record {number} is not a directory"
            )));
        }

        let mut out = Vec::new();
        for index_entry in self.index_entries(&record, number)? {
            self.cancel.checkpoint()?;
            if index_entry.is_last() {
                continue;
            }
            let Some(key) = &index_entry.key else {
                continue;
            };
            // DOS aliases duplicate the Win32 entry; drop them.
            if key.namespace == FILE_NAME_NAMESPACE_DOS {
                continue;
            }
            if key.name == "." {
                continue;
            }

            let is_dir = key.flags & FILE_NAME_FLAG_DIRECTORY != 0;
            out.push(Entry {
                meta: EntryMeta {
                    path: child_path(&dir.meta.path, &key.name),
                    name: key.name.clone(),
                    size: if is_dir { 0 } else { key.real_size },
                    kind: if is_dir {
                        EntryKind::Directory
                    } else {
                        EntryKind::File
                    },
                    deleted: false,
                    attributes: key.flags,
                    created: nt_datetime(key.created),
                    modified: nt_datetime(key.modified),
                    accessed: nt_datetime(key.accessed),
                },
                locator: Locator::Ntfs {
                    record: index_entry.mft_reference & MFT_REFERENCE_MASK,
                },
            });
        }

        let out = Arc::new(out);
        self.dir_cache.lock().insert(number, Arc::clone(&out));
        Ok(out)
    }

    pub(crate) fn read_span(&self, file: &Entry, offset: u64, len: u64) -> Result<Vec<u8>> {
        let Locator::Ntfs { record: number } = file.locator else {
            return Err(WfsError::FilesystemCorrupt(
                "foreign entry handed to an NTFS filesystem".to_owned(),
            ));
        };
        if len == 0 {
            return Ok(Vec::new());
        }
        let record = self.record(number)?;

        if let Some(data) = &record.data_resident {
            let start = usize::try_from(offset)
                .map_err(|_| WfsError::out_of_range("offset does not fit usize"))?;
            let want = usize::try_from(len)
                .map_err(|_| WfsError::out_of_range("length does not fit usize"))?;
            if start + want > data.len() {
                return Err(WfsError::FilesystemCorrupt(format!(
                    "resident data of {} shorter than its declared size",
                    file.meta.path
                )));
            }
            return Ok(data[start..start + want].to_vec());
        }

        let Some((runs, _real_size)) = &record.data_runs else {
            return Err(WfsError::FilesystemCorrupt(format!(
                "{} carries no usable $DATA attribute",
                file.meta.path
            )));
        };

        let end = offset + len;
        let mut out = Vec::with_capacity(usize::try_from(len).unwrap_or(0));
        let mut cursor = 0_u64; // logical byte position of the run start

        for run in runs.iter() {
            if cursor >= end {
                break;
            }
            self.cancel.checkpoint()?;
            let run_bytes = run.clusters * self.cluster_size;
            let run_end = cursor + run_bytes;
            if run_end > offset {
                let span_start = offset.max(cursor);
                let span_end = end.min(run_end);
                let take = span_end - span_start;
                match run.lcn {
                    Some(lcn) => {
                        let data = self.view.read_bytes(
                            ByteOffset(lcn * self.cluster_size + (span_start - cursor)),
                            take,
                        )?;
                        out.extend_from_slice(&data);
                    }
                    // Sparse runs read as zeros.
                    None => out.resize(
                        out.len()
                            + usize::try_from(take).map_err(|_| {
                                WfsError::out_of_range("sparse span does not fit usize")
                            })?,
                        0,
                    ),
                }
            }
            cursor = run_end;
        }

        if (out.len() as u64) < len {
            return Err(WfsError::FilesystemCorrupt(format!(
                "data runs of {} end {} bytes early",
                file.meta.path,
                len - out.len() as u64
            )));
        }
        Ok(out)
    }
}

/// FILETIME to `DateTime<Utc>`; zero ticks mean "not set".
fn nt_datetime(ticks: u64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(filetime_to_unix(ticks)?, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn nt_datetime_epoch_and_zero() {
        assert_eq!(nt_datetime(0), None);
        let epoch = nt_datetime(116_444_736_000_000_000).expect("epoch");
        assert_eq!(epoch.year(), 1970);
        assert_eq!(epoch.timestamp(), 0);
    }
}
