use serde::{Deserialize, Serialize};
use wfs_types::{ensure_slice, read_le_u16, read_le_u32, read_le_u64, ParseError};

/// OEM identifier at offset 3 of the boot sector.
pub const NTFS_OEM: [u8; 8] = *b"NTFS    ";
/// `FILE` magic of an MFT record.
pub const MFT_RECORD_MAGIC: [u8; 4] = *b"FILE";
/// `INDX` magic of an index allocation block.
pub const INDEX_BLOCK_MAGIC: [u8; 4] = *b"INDX";

/// MFT record number of the root directory.
pub const MFT_RECORD_ROOT: u64 = 5;
/// Low 48 bits of an MFT reference are the record number.
pub const MFT_REFERENCE_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

// Attribute types.
pub const ATTR_STANDARD_INFORMATION: u32 = 0x10;
pub const ATTR_FILE_NAME: u32 = 0x30;
pub const ATTR_DATA: u32 = 0x80;
pub const ATTR_INDEX_ROOT: u32 = 0x90;
pub const ATTR_INDEX_ALLOCATION: u32 = 0xA0;
const ATTR_END_MARKER: u32 = 0xFFFF_FFFF;

/// MFT record header flag: record is in use.
pub const MFT_FLAG_IN_USE: u16 = 0x0001;
/// MFT record header flag: record describes a directory.
pub const MFT_FLAG_DIRECTORY: u16 = 0x0002;

/// Index entry flag: entry points at a sub-node.
pub const INDEX_ENTRY_HAS_SUBNODE: u16 = 0x01;
/// Index entry flag: end-of-node marker, carries no key.
pub const INDEX_ENTRY_LAST: u16 = 0x02;

/// `$FILE_NAME` namespace for DOS-only short names.
pub const FILE_NAME_NAMESPACE_DOS: u8 = 2;

/// NTFS boot sector parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NtfsBootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub total_sectors: u64,
    pub mft_start_cluster: u64,
    pub mft_mirror_cluster: u64,
    mft_record_size_raw: i8,
    index_block_size_raw: i8,
}

impl NtfsBootSector {
    pub fn parse(sector: &[u8]) -> Result<Self, ParseError> {
        let oem = ensure_slice(sector, 3, 8)?;
        if oem != NTFS_OEM {
            return Err(ParseError::InvalidMagic {
                expected: u64::from_le_bytes(NTFS_OEM),
                actual: u64::from_le_bytes([
                    oem[0], oem[1], oem[2], oem[3], oem[4], oem[5], oem[6], oem[7],
                ]),
            });
        }

        let boot = Self {
            bytes_per_sector: read_le_u16(sector, 11)?,
            sectors_per_cluster: ensure_slice(sector, 13, 1)?[0],
            total_sectors: read_le_u64(sector, 40)?,
            mft_start_cluster: read_le_u64(sector, 48)?,
            mft_mirror_cluster: read_le_u64(sector, 56)?,
            mft_record_size_raw: ensure_slice(sector, 64, 1)?[0] as i8,
            index_block_size_raw: ensure_slice(sector, 68, 1)?[0] as i8,
        };

        if !matches!(boot.bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return Err(ParseError::InvalidField {
                field: "bytes_per_sector",
                reason: "must be 512, 1024, 2048, or 4096",
            });
        }
        if boot.sectors_per_cluster == 0 {
            return Err(ParseError::InvalidField {
                field: "sectors_per_cluster",
                reason: "cannot be zero",
            });
        }
        Ok(boot)
    }

    #[must_use]
    pub fn cluster_size(&self) -> u64 {
        u64::from(self.bytes_per_sector) * u64::from(self.sectors_per_cluster)
    }

    /// Bytes per MFT record: positive values count clusters, negative
    /// values encode `1 << -v`.
    #[must_use]
    pub fn mft_record_size(&self) -> u64 {
        decode_size_field(self.mft_record_size_raw, self.cluster_size())
    }

    /// Bytes per index allocation block, same encoding as MFT records.
    #[must_use]
    pub fn index_block_size(&self) -> u64 {
        decode_size_field(self.index_block_size_raw, self.cluster_size())
    }
}

fn decode_size_field(raw: i8, cluster_size: u64) -> u64 {
    if raw > 0 {
        cluster_size * raw as u64
    } else {
        1_u64 << (-i32::from(raw))
    }
}

/// Apply the update-sequence fixup array in place.
///
/// The last two bytes of every stride-sized block must match the update
/// sequence number and are replaced with the saved original bytes.
pub fn apply_fixups(buf: &mut [u8], stride: usize) -> Result<(), ParseError> {
    if stride < 2 {
        return Err(ParseError::InvalidField {
            field: "update_sequence",
            reason: "fixup stride must be at least 2",
        });
    }
    let usa_offset = read_le_u16(buf, 4)? as usize;
    let usa_count = read_le_u16(buf, 6)? as usize;
    if usa_count < 2 {
        return Ok(());
    }

    ensure_slice(buf, usa_offset, usa_count * 2)?;
    let usn = [buf[usa_offset], buf[usa_offset + 1]];

    for i in 1..usa_count {
        let end = i
            .checked_mul(stride)
            .ok_or(ParseError::InvalidField {
                field: "update_sequence",
                reason: "fixup position overflow",
            })?;
        ensure_slice(buf, end - 2, 2)?;
        if [buf[end - 2], buf[end - 1]] != usn {
            return Err(ParseError::InvalidField {
                field: "update_sequence",
                reason: "sector tail does not match the update sequence number",
            });
        }
        buf[end - 2] = buf[usa_offset + i * 2];
        buf[end - 1] = buf[usa_offset + i * 2 + 1];
    }
    Ok(())
}

/// MFT record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MftRecordHeader {
    pub sequence: u16,
    pub hard_links: u16,
    pub first_attribute_offset: u16,
    pub flags: u16,
    pub used_size: u32,
    pub allocated_size: u32,
    pub base_reference: u64,
}

impl MftRecordHeader {
    pub fn parse(record: &[u8]) -> Result<Self, ParseError> {
        let magic = ensure_slice(record, 0, 4)?;
        if magic != MFT_RECORD_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(u32::from_le_bytes(MFT_RECORD_MAGIC)),
                actual: u64::from(u32::from_le_bytes([
                    magic[0], magic[1], magic[2], magic[3],
                ])),
            });
        }
        Ok(Self {
            sequence: read_le_u16(record, 16)?,
            hard_links: read_le_u16(record, 18)?,
            first_attribute_offset: read_le_u16(record, 20)?,
            flags: read_le_u16(record, 22)?,
            used_size: read_le_u32(record, 24)?,
            allocated_size: read_le_u32(record, 28)?,
            base_reference: read_le_u64(record, 32)?,
        })
    }

    #[must_use]
    pub fn is_in_use(&self) -> bool {
        self.flags & MFT_FLAG_IN_USE != 0
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.flags & MFT_FLAG_DIRECTORY != 0
    }
}

/// Payload of one parsed attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrContent {
    Resident {
        data: Vec<u8>,
    },
    NonResident {
        runs_raw: Vec<u8>,
        start_vcn: u64,
        allocated_size: u64,
        real_size: u64,
    },
}

/// One attribute lifted out of an MFT record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MftAttribute {
    pub attr_type: u32,
    pub name: String,
    pub content: AttrContent,
}

/// Walk the attribute list of a fixed-up MFT record.
pub fn parse_attributes(record: &[u8], header: &MftRecordHeader) -> Result<Vec<MftAttribute>, ParseError> {
    let mut attrs = Vec::new();
    let mut offset = header.first_attribute_offset as usize;
    let used = (header.used_size as usize).min(record.len());

    while offset + 8 <= used {
        let attr_type = read_le_u32(record, offset)?;
        if attr_type == ATTR_END_MARKER {
            break;
        }
        let length = read_le_u32(record, offset + 4)? as usize;
        if length < 16 || offset + length > used {
            return Err(ParseError::InvalidField {
                field: "attribute_length",
                reason: "attribute extends beyond the used record area",
            });
        }
        let attr = &record[offset..offset + length];
        let non_resident = attr[8] != 0;
        let name_len = attr[9] as usize;
        let name_offset = read_le_u16(attr, 10)? as usize;
        let name = if name_len == 0 {
            String::new()
        } else {
            let raw = ensure_slice(attr, name_offset, name_len * 2)?;
            let units: Vec<u16> = raw
                .chunks_exact(2)
                .map(|p| u16::from_le_bytes([p[0], p[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        };

        let content = if non_resident {
            let start_vcn = read_le_u64(attr, 16)?;
            let run_offset = read_le_u16(attr, 32)? as usize;
            let allocated_size = read_le_u64(attr, 40)?;
            let real_size = read_le_u64(attr, 48)?;
            let runs_len = length.checked_sub(run_offset).ok_or(ParseError::InvalidField {
                field: "run_offset",
                reason: "run list starts past the attribute end",
            })?;
            let runs_raw = ensure_slice(attr, run_offset, runs_len)?.to_vec();
            AttrContent::NonResident {
                runs_raw,
                start_vcn,
                allocated_size,
                real_size,
            }
        } else {
            let content_len = read_le_u32(attr, 16)? as usize;
            let content_offset = read_le_u16(attr, 20)? as usize;
            let data = ensure_slice(attr, content_offset, content_len)?.to_vec();
            AttrContent::Resident { data }
        };

        attrs.push(MftAttribute {
            attr_type,
            name,
            content,
        });
        offset += length;
    }

    Ok(attrs)
}

/// `$STANDARD_INFORMATION` (0x10): timestamps and DOS attribute flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardInfo {
    pub created: u64,
    pub modified: u64,
    pub mft_modified: u64,
    pub accessed: u64,
    pub dos_attributes: u32,
}

impl StandardInfo {
    pub fn parse(content: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            created: read_le_u64(content, 0)?,
            modified: read_le_u64(content, 8)?,
            mft_modified: read_le_u64(content, 16)?,
            accessed: read_le_u64(content, 24)?,
            dos_attributes: read_le_u32(content, 32)?,
        })
    }
}

/// `$FILE_NAME` (0x30): parent reference, timestamps, sizes, and name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNameAttr {
    pub parent_reference: u64,
    pub created: u64,
    pub modified: u64,
    pub accessed: u64,
    pub allocated_size: u64,
    pub real_size: u64,
    pub flags: u32,
    pub namespace: u8,
    pub name: String,
}

impl FileNameAttr {
    pub fn parse(content: &[u8]) -> Result<Self, ParseError> {
        let name_len = ensure_slice(content, 64, 1)?[0] as usize;
        let namespace = ensure_slice(content, 65, 1)?[0];
        let raw_name = ensure_slice(content, 66, name_len * 2)?;
        let units: Vec<u16> = raw_name
            .chunks_exact(2)
            .map(|p| u16::from_le_bytes([p[0], p[1]]))
            .collect();

        Ok(Self {
            parent_reference: read_le_u64(content, 0)?,
            created: read_le_u64(content, 8)?,
            modified: read_le_u64(content, 16)?,
            accessed: read_le_u64(content, 32)?,
            allocated_size: read_le_u64(content, 40)?,
            real_size: read_le_u64(content, 48)?,
            flags: read_le_u32(content, 56)?,
            namespace,
            name: String::from_utf16_lossy(&units),
        })
    }
}

/// One decoded data run. `lcn` is `None` for sparse runs, which read as
/// zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRun {
    pub lcn: Option<u64>,
    pub clusters: u64,
}

/// Decode a run list.
///
/// Each run is `(length_size:4 | offset_size:4) length offset`, where the
/// offset is signed and relative to the previous run's start cluster; a
/// zero header byte terminates the list.
pub fn decode_data_runs(raw: &[u8]) -> Result<Vec<DataRun>, ParseError> {
    let mut runs = Vec::new();
    let mut pos = 0_usize;
    let mut current_lcn = 0_i64;

    while pos < raw.len() {
        let header = raw[pos];
        if header == 0 {
            break;
        }
        let length_size = (header & 0x0F) as usize;
        let offset_size = (header >> 4) as usize;
        if length_size == 0 || length_size > 8 || offset_size > 8 {
            return Err(ParseError::InvalidField {
                field: "data_run",
                reason: "invalid length/offset field sizes",
            });
        }
        ensure_slice(raw, pos + 1, length_size + offset_size)?;

        let mut clusters = 0_u64;
        for i in 0..length_size {
            clusters |= u64::from(raw[pos + 1 + i]) << (i * 8);
        }

        if offset_size == 0 {
            runs.push(DataRun {
                lcn: None,
                clusters,
            });
        } else {
            let offset_bytes = &raw[pos + 1 + length_size..pos + 1 + length_size + offset_size];
            let mut delta = 0_i64;
            for (i, b) in offset_bytes.iter().enumerate() {
                delta |= i64::from(*b) << (i * 8);
            }
            // Sign-extend from the top bit of the highest offset byte.
            let shift = 64 - offset_size * 8;
            delta = (delta << shift) >> shift;

            current_lcn += delta;
            if current_lcn < 0 {
                return Err(ParseError::InvalidField {
                    field: "data_run",
                    reason: "run resolves to a negative cluster",
                });
            }
            runs.push(DataRun {
                lcn: Some(current_lcn as u64),
                clusters,
            });
        }
        pos += 1 + length_size + offset_size;
    }

    Ok(runs)
}

/// Node header shared by `$INDEX_ROOT` nodes and `INDX` blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexNodeHeader {
    pub entries_offset: u32,
    pub index_size: u32,
    pub allocated_size: u32,
    pub flags: u8,
}

impl IndexNodeHeader {
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            entries_offset: read_le_u32(data, offset)?,
            index_size: read_le_u32(data, offset + 4)?,
            allocated_size: read_le_u32(data, offset + 8)?,
            flags: ensure_slice(data, offset + 12, 1)?[0],
        })
    }
}

/// `$INDEX_ROOT` (0x90) content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRoot {
    pub indexed_attr_type: u32,
    pub index_block_size: u32,
    pub node: IndexNodeHeader,
    pub entries: Vec<IndexEntry>,
}

impl IndexRoot {
    pub fn parse(content: &[u8]) -> Result<Self, ParseError> {
        let node = IndexNodeHeader::parse(content, 16)?;
        let entries_start = 16_usize
            .checked_add(node.entries_offset as usize)
            .ok_or(ParseError::InvalidField {
                field: "entries_offset",
                reason: "overflow",
            })?;
        let entries = parse_index_entries(content, entries_start)?;
        Ok(Self {
            indexed_attr_type: read_le_u32(content, 0)?,
            index_block_size: read_le_u32(content, 8)?,
            node,
            entries,
        })
    }
}

/// One directory index entry keyed by a `$FILE_NAME` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub mft_reference: u64,
    pub flags: u16,
    pub key: Option<FileNameAttr>,
}

impl IndexEntry {
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.flags & INDEX_ENTRY_LAST != 0
    }

    #[must_use]
    pub fn record_number(&self) -> u64 {
        self.mft_reference & MFT_REFERENCE_MASK
    }
}

/// Walk the entry list of one index node until the end marker.
pub fn parse_index_entries(data: &[u8], start: usize) -> Result<Vec<IndexEntry>, ParseError> {
    let mut entries = Vec::new();
    let mut pos = start;

    loop {
        ensure_slice(data, pos, 16)?;
        let mft_reference = read_le_u64(data, pos)?;
        let entry_len = read_le_u16(data, pos + 8)? as usize;
        let key_len = read_le_u16(data, pos + 10)? as usize;
        let flags = read_le_u16(data, pos + 12)?;

        if entry_len < 16 {
            return Err(ParseError::InvalidField {
                field: "index_entry_length",
                reason: "must be at least 16",
            });
        }
        ensure_slice(data, pos, entry_len)?;

        let is_last = flags & INDEX_ENTRY_LAST != 0;
        let key = if !is_last && key_len > 0 {
            Some(FileNameAttr::parse(&data[pos + 16..pos + 16 + key_len])?)
        } else {
            None
        };

        entries.push(IndexEntry {
            mft_reference,
            flags,
            key,
        });

        if is_last {
            break;
        }
        pos += entry_len;
    }

    Ok(entries)
}

/// Parse a fixed-up `INDX` block and return its entries.
pub fn parse_index_block(block: &[u8]) -> Result<Vec<IndexEntry>, ParseError> {
    let magic = ensure_slice(block, 0, 4)?;
    if magic != INDEX_BLOCK_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(u32::from_le_bytes(INDEX_BLOCK_MAGIC)),
            actual: u64::from(u32::from_le_bytes([
                magic[0], magic[1], magic[2], magic[3],
            ])),
        });
    }
    let node = IndexNodeHeader::parse(block, 24)?;
    let entries_start =
        24_usize
            .checked_add(node.entries_offset as usize)
            .ok_or(ParseError::InvalidField {
                field: "entries_offset",
                reason: "overflow",
            })?;
    parse_index_entries(block, entries_start)
}

/// Convert an NTFS FILETIME (100 ns ticks since 1601-01-01) to Unix
/// seconds. Zero ticks mean "no timestamp".
#[must_use]
pub fn filetime_to_unix(ticks: u64) -> Option<i64> {
    if ticks == 0 {
        return None;
    }
    Some(ticks as i64 / 10_000_000 - 11_644_473_600)
}
