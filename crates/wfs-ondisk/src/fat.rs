use serde::{Deserialize, Serialize};
use wfs_types::{ensure_slice, read_le_u16, read_le_u32, ParseError};

/// Boot signature shared with the MBR, stored at offset 510.
const FAT_BOOT_SIGNATURE: u16 = 0xAA55;
/// Size of one directory record.
pub const FAT_DIR_ENTRY_SIZE: usize = 32;
/// Attribute byte marking a long-file-name component.
pub const FAT_ATTR_LFN: u8 = 0x0F;
/// Attribute bit for directories.
pub const FAT_ATTR_DIRECTORY: u8 = 0x10;
/// Attribute bit for the volume label.
pub const FAT_ATTR_VOLUME_ID: u8 = 0x08;

/// Cluster-count boundaries between the FAT variants.
const FAT12_MAX_CLUSTERS: u64 = 4085;
const FAT16_MAX_CLUSTERS: u64 = 65525;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FatVariant {
    Fat12,
    Fat16,
    Fat32,
}

impl FatVariant {
    /// End-of-chain threshold for this variant's FAT entries.
    #[must_use]
    pub fn end_of_chain(self) -> u32 {
        match self {
            Self::Fat12 => 0x0FF8,
            Self::Fat16 => 0xFFF8,
            Self::Fat32 => 0x0FFF_FFF8,
        }
    }
}

/// FAT BIOS parameter block, parsed from sector 0 of the volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatBootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub root_entries: u16,
    pub total_sectors_16: u16,
    pub media_descriptor: u8,
    pub sectors_per_fat_16: u16,
    pub total_sectors_32: u32,
    pub sectors_per_fat_32: u32,
    pub root_cluster: u32,
}

impl FatBootSector {
    pub fn parse(sector: &[u8]) -> Result<Self, ParseError> {
        let signature = read_le_u16(sector, 510)?;
        if signature != FAT_BOOT_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(FAT_BOOT_SIGNATURE),
                actual: u64::from(signature),
            });
        }

        let boot = Self {
            bytes_per_sector: read_le_u16(sector, 11)?,
            sectors_per_cluster: ensure_slice(sector, 13, 1)?[0],
            reserved_sectors: read_le_u16(sector, 14)?,
            num_fats: ensure_slice(sector, 16, 1)?[0],
            root_entries: read_le_u16(sector, 17)?,
            total_sectors_16: read_le_u16(sector, 19)?,
            media_descriptor: ensure_slice(sector, 21, 1)?[0],
            sectors_per_fat_16: read_le_u16(sector, 22)?,
            total_sectors_32: read_le_u32(sector, 32)?,
            sectors_per_fat_32: read_le_u32(sector, 36)?,
            root_cluster: read_le_u32(sector, 44)?,
        };
        boot.validate()?;
        Ok(boot)
    }

    fn validate(&self) -> Result<(), ParseError> {
        if !matches!(self.bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return Err(ParseError::InvalidField {
                field: "bytes_per_sector",
                reason: "must be 512, 1024, 2048, or 4096",
            });
        }
        if self.sectors_per_cluster == 0 || !self.sectors_per_cluster.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "sectors_per_cluster",
                reason: "must be a non-zero power of two",
            });
        }
        if self.reserved_sectors == 0 {
            return Err(ParseError::InvalidField {
                field: "reserved_sectors",
                reason: "cannot be zero",
            });
        }
        if self.num_fats == 0 {
            return Err(ParseError::InvalidField {
                field: "num_fats",
                reason: "cannot be zero",
            });
        }
        if self.total_sectors() == 0 {
            return Err(ParseError::InvalidField {
                field: "total_sectors",
                reason: "cannot be zero",
            });
        }
        if self.sectors_per_fat() == 0 {
            return Err(ParseError::InvalidField {
                field: "sectors_per_fat",
                reason: "cannot be zero",
            });
        }
        Ok(())
    }

    /// 16-bit count when set, 32-bit count otherwise.
    #[must_use]
    pub fn total_sectors(&self) -> u64 {
        if self.total_sectors_16 != 0 {
            u64::from(self.total_sectors_16)
        } else {
            u64::from(self.total_sectors_32)
        }
    }

    /// 16-bit FAT size when set, the FAT32 field otherwise.
    #[must_use]
    pub fn sectors_per_fat(&self) -> u64 {
        if self.sectors_per_fat_16 != 0 {
            u64::from(self.sectors_per_fat_16)
        } else {
            u64::from(self.sectors_per_fat_32)
        }
    }

    /// Sectors occupied by the fixed FAT12/16 root directory region.
    #[must_use]
    pub fn root_dir_sectors(&self) -> u64 {
        let bytes = u64::from(self.root_entries) * FAT_DIR_ENTRY_SIZE as u64;
        bytes.div_ceil(u64::from(self.bytes_per_sector))
    }

    /// First sector of the FAT region.
    #[must_use]
    pub fn fat_start_sector(&self) -> u64 {
        u64::from(self.reserved_sectors)
    }

    /// First sector of the fixed root directory (FAT12/16 only).
    #[must_use]
    pub fn root_dir_start_sector(&self) -> u64 {
        self.fat_start_sector() + u64::from(self.num_fats) * self.sectors_per_fat()
    }

    /// First sector of the data region (cluster 2).
    #[must_use]
    pub fn data_start_sector(&self) -> u64 {
        self.root_dir_start_sector() + self.root_dir_sectors()
    }

    /// Number of data clusters.
    #[must_use]
    pub fn cluster_count(&self) -> u64 {
        let data_sectors = self.total_sectors().saturating_sub(self.data_start_sector());
        data_sectors / u64::from(self.sectors_per_cluster)
    }

    /// Classify by cluster count; the usual boundaries are FAT12 < 4085
    /// and FAT16 < 65525.
    #[must_use]
    pub fn variant(&self) -> FatVariant {
        let clusters = self.cluster_count();
        if clusters < FAT12_MAX_CLUSTERS {
            FatVariant::Fat12
        } else if clusters < FAT16_MAX_CLUSTERS {
            FatVariant::Fat16
        } else {
            FatVariant::Fat32
        }
    }
}

/// One 32-byte short (8.3) directory record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatDirEntryRaw {
    pub name_raw: [u8; 11],
    pub attributes: u8,
    pub creation_time: u16,
    pub creation_date: u16,
    pub access_date: u16,
    pub write_time: u16,
    pub write_date: u16,
    pub first_cluster: u32,
    pub size: u32,
}

impl FatDirEntryRaw {
    pub fn parse(record: &[u8]) -> Result<Self, ParseError> {
        let raw = ensure_slice(record, 0, FAT_DIR_ENTRY_SIZE)?;
        let mut name_raw = [0_u8; 11];
        name_raw.copy_from_slice(&raw[..11]);
        let cluster_hi = u32::from(read_le_u16(raw, 20)?);
        let cluster_lo = u32::from(read_le_u16(raw, 26)?);
        Ok(Self {
            name_raw,
            attributes: raw[11],
            creation_time: read_le_u16(raw, 14)?,
            creation_date: read_le_u16(raw, 16)?,
            access_date: read_le_u16(raw, 18)?,
            write_time: read_le_u16(raw, 22)?,
            write_date: read_le_u16(raw, 24)?,
            first_cluster: (cluster_hi << 16) | cluster_lo,
            size: read_le_u32(raw, 28)?,
        })
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.attributes & FAT_ATTR_DIRECTORY != 0
    }

    #[must_use]
    pub fn is_volume_label(&self) -> bool {
        self.attributes & FAT_ATTR_VOLUME_ID != 0 && self.attributes != FAT_ATTR_LFN
    }

    /// Combine the space-padded name and extension as `name.ext`.
    #[must_use]
    pub fn short_name(&self) -> String {
        let base: Vec<u8> = self.name_raw[..8]
            .iter()
            .copied()
            .take_while(|b| *b != 0x20)
            .collect();
        let ext: Vec<u8> = self.name_raw[8..]
            .iter()
            .copied()
            .take_while(|b| *b != 0x20)
            .collect();

        let mut name = String::from_utf8_lossy(&base).into_owned();
        if !ext.is_empty() {
            name.push('.');
            name.push_str(&String::from_utf8_lossy(&ext));
        }
        name
    }
}

/// One long-file-name component (attribute byte 0x0F).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatLfnEntryRaw {
    pub sequence: u8,
    pub is_last: bool,
    pub checksum: u8,
    pub units: Vec<u16>,
}

/// UCS-2 unit positions within an LFN record.
const LFN_UNIT_OFFSETS: [usize; 13] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

impl FatLfnEntryRaw {
    pub fn parse(record: &[u8]) -> Result<Self, ParseError> {
        let raw = ensure_slice(record, 0, FAT_DIR_ENTRY_SIZE)?;
        let mut units = Vec::with_capacity(13);
        for offset in LFN_UNIT_OFFSETS {
            units.push(u16::from_le_bytes([raw[offset], raw[offset + 1]]));
        }
        Ok(Self {
            sequence: raw[0] & 0x1F,
            is_last: raw[0] & 0x40 != 0,
            checksum: raw[13],
            units,
        })
    }
}

/// Assemble LFN components into a file name.
///
/// Components are keyed by their sequence number (1-based); the name ends
/// at the first 0x0000 or 0xFFFF unit.
#[must_use]
pub fn assemble_long_name(components: &[FatLfnEntryRaw]) -> Option<String> {
    if components.is_empty() {
        return None;
    }
    let mut ordered: Vec<&FatLfnEntryRaw> = components.iter().collect();
    ordered.sort_by_key(|c| c.sequence);

    let mut units = Vec::with_capacity(ordered.len() * 13);
    for component in ordered {
        units.extend_from_slice(&component.units);
    }
    let end = units
        .iter()
        .position(|u| *u == 0x0000 || *u == 0xFFFF)
        .unwrap_or(units.len());
    if end == 0 {
        return None;
    }
    Some(String::from_utf16_lossy(&units[..end]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot_sector_fat32() -> Vec<u8> {
        let mut sector = vec![0_u8; 512];
        sector[11..13].copy_from_slice(&512_u16.to_le_bytes());
        sector[13] = 1;
        sector[14..16].copy_from_slice(&32_u16.to_le_bytes());
        sector[16] = 2;
        sector[32..36].copy_from_slice(&1_048_576_u32.to_le_bytes());
        sector[36..40].copy_from_slice(&1024_u32.to_le_bytes());
        sector[44..48].copy_from_slice(&2_u32.to_le_bytes());
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }

    #[test]
    fn parse_fat32_boot_sector() {
        let boot = FatBootSector::parse(&boot_sector_fat32()).expect("boot");
        assert_eq!(boot.bytes_per_sector, 512);
        assert_eq!(boot.sectors_per_fat(), 1024);
        assert_eq!(boot.root_dir_sectors(), 0);
        assert_eq!(boot.data_start_sector(), 32 + 2 * 1024);
        assert_eq!(boot.variant(), FatVariant::Fat32);
    }

    #[test]
    fn classify_fat12_and_fat16() {
        let mut sector = boot_sector_fat32();
        // 2 MiB volume: cluster count lands under the FAT12 boundary.
        sector[32..36].copy_from_slice(&4096_u32.to_le_bytes());
        sector[36..40].fill(0);
        sector[22..24].copy_from_slice(&12_u16.to_le_bytes());
        sector[17..19].copy_from_slice(&512_u16.to_le_bytes());
        let boot = FatBootSector::parse(&sector).expect("boot");
        assert_eq!(boot.variant(), FatVariant::Fat12);

        sector[32..36].copy_from_slice(&65536_u32.to_le_bytes());
        sector[22..24].copy_from_slice(&64_u16.to_le_bytes());
        let boot = FatBootSector::parse(&sector).expect("boot");
        assert_eq!(boot.variant(), FatVariant::Fat16);
    }

    #[test]
    fn reject_invalid_geometry() {
        let mut sector = boot_sector_fat32();
        sector[13] = 3; // not a power of two
        assert!(FatBootSector::parse(&sector).is_err());

        let mut sector = boot_sector_fat32();
        sector[11..13].copy_from_slice(&100_u16.to_le_bytes());
        assert!(FatBootSector::parse(&sector).is_err());
    }

    #[test]
    fn short_name_combines_extension() {
        let mut record = [0x20_u8; FAT_DIR_ENTRY_SIZE];
        record[..5].copy_from_slice(b"HELLO");
        record[8..11].copy_from_slice(b"TXT");
        record[11] = 0x20; // archive
        record[26..28].copy_from_slice(&5_u16.to_le_bytes());
        record[28..32].copy_from_slice(&6_u32.to_le_bytes());

        let entry = FatDirEntryRaw::parse(&record).expect("entry");
        assert_eq!(entry.short_name(), "HELLO.TXT");
        assert_eq!(entry.first_cluster, 5);
        assert_eq!(entry.size, 6);
        assert!(!entry.is_directory());
    }

    #[test]
    fn short_name_without_extension() {
        let mut record = [0x20_u8; FAT_DIR_ENTRY_SIZE];
        record[..3].copy_from_slice(b"SUB");
        record[11] = FAT_ATTR_DIRECTORY;
        let entry = FatDirEntryRaw::parse(&record).expect("entry");
        assert_eq!(entry.short_name(), "SUB");
        assert!(entry.is_directory());
    }

    fn lfn_record(sequence: u8, last: bool, text: &str) -> [u8; FAT_DIR_ENTRY_SIZE] {
        let mut record = [0xFF_u8; FAT_DIR_ENTRY_SIZE];
        record[0] = sequence | if last { 0x40 } else { 0 };
        record[11] = FAT_ATTR_LFN;
        record[13] = 0;
        record[26] = 0;
        record[27] = 0;
        let units: Vec<u16> = text.encode_utf16().chain(std::iter::once(0)).collect();
        for (i, offset) in LFN_UNIT_OFFSETS.iter().enumerate() {
            if i < units.len() {
                record[*offset..offset + 2].copy_from_slice(&units[i].to_le_bytes());
            }
        }
        record
    }

    #[test]
    fn assemble_long_name_across_components() {
        let second = FatLfnEntryRaw::parse(&lfn_record(2, true, "name.txt")).expect("lfn");
        let first =
            FatLfnEntryRaw::parse(&lfn_record(1, false, "a-very-long-f")).expect("lfn");
        // Directory order is last component first; assembly sorts by sequence.
        let name = assemble_long_name(&[second, first]).expect("name");
        assert_eq!(name, "a-very-long-fname.txt");
    }
}
