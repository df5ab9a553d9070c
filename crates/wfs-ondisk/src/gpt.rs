use serde::{Deserialize, Serialize};
use wfs_types::{
    decode_utf16le_nul_terminated, ensure_slice, format_guid, read_fixed, read_le_u32, read_le_u64,
    ParseError,
};

/// `"EFI PART"` at the start of the header sector (LBA 1).
pub const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";
/// Size of one partition entry in every GPT written in practice.
pub const GPT_ENTRY_SIZE: usize = 128;
/// Length of the partition name field in UTF-16LE code units.
const GPT_NAME_UNITS: usize = 36;

/// GPT header at LBA 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    pub header_crc: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: [u8; 16],
    pub partition_entry_lba: u64,
    pub entry_count: u32,
    pub entry_size: u32,
    pub entries_crc: u32,
}

impl GptHeader {
    /// Parse the GPT header from the sector at LBA 1.
    pub fn parse(sector: &[u8]) -> Result<Self, ParseError> {
        let signature = read_fixed::<8>(sector, 0)?;
        if signature != GPT_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: u64::from_le_bytes(GPT_SIGNATURE),
                actual: u64::from_le_bytes(signature),
            });
        }

        let header = Self {
            revision: read_le_u32(sector, 8)?,
            header_size: read_le_u32(sector, 12)?,
            header_crc: read_le_u32(sector, 16)?,
            current_lba: read_le_u64(sector, 24)?,
            backup_lba: read_le_u64(sector, 32)?,
            first_usable_lba: read_le_u64(sector, 40)?,
            last_usable_lba: read_le_u64(sector, 48)?,
            disk_guid: read_fixed::<16>(sector, 56)?,
            partition_entry_lba: read_le_u64(sector, 72)?,
            entry_count: read_le_u32(sector, 80)?,
            entry_size: read_le_u32(sector, 84)?,
            entries_crc: read_le_u32(sector, 88)?,
        };

        if header.header_size < 92 {
            return Err(ParseError::InvalidField {
                field: "header_size",
                reason: "must be at least 92",
            });
        }
        if header.entry_size == 0 || !header.entry_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "entry_size",
                reason: "must be a non-zero power of two",
            });
        }

        Ok(header)
    }

    /// Recompute the header CRC-32 over `header_size` bytes with the CRC
    /// field zeroed and compare with the stored value.
    #[must_use]
    pub fn header_crc_valid(&self, raw_sector: &[u8]) -> bool {
        let size = self.header_size as usize;
        if raw_sector.len() < size {
            return false;
        }
        let mut bytes = raw_sector[..size].to_vec();
        bytes[16..20].fill(0);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes);
        hasher.finalize() == self.header_crc
    }

    #[must_use]
    pub fn disk_guid_string(&self) -> String {
        format_guid(&self.disk_guid)
    }
}

/// One 128-byte GPT partition entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GptPartitionEntry {
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub first_lba: u64,
    pub last_lba: u64,
    pub attributes: u64,
    pub name: String,
}

impl GptPartitionEntry {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let raw = ensure_slice(data, 0, GPT_ENTRY_SIZE)?;
        Ok(Self {
            type_guid: read_fixed::<16>(raw, 0)?,
            unique_guid: read_fixed::<16>(raw, 16)?,
            first_lba: read_le_u64(raw, 32)?,
            last_lba: read_le_u64(raw, 40)?,
            attributes: read_le_u64(raw, 48)?,
            name: decode_utf16le_nul_terminated(&raw[56..56 + GPT_NAME_UNITS * 2]),
        })
    }

    /// An all-zero type GUID marks an unused slot.
    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.type_guid.iter().all(|b| *b == 0)
    }

    /// Number of sectors spanned by this partition.
    #[must_use]
    pub fn sector_count(&self) -> u64 {
        if self.last_lba < self.first_lba {
            0
        } else {
            self.last_lba - self.first_lba + 1
        }
    }

    #[must_use]
    pub fn type_guid_string(&self) -> String {
        format_guid(&self.type_guid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_header_sector() -> Vec<u8> {
        let mut sector = vec![0_u8; 512];
        sector[..8].copy_from_slice(&GPT_SIGNATURE);
        sector[8..12].copy_from_slice(&0x0001_0000_u32.to_le_bytes());
        sector[12..16].copy_from_slice(&92_u32.to_le_bytes());
        sector[24..32].copy_from_slice(&1_u64.to_le_bytes());
        sector[32..40].copy_from_slice(&8191_u64.to_le_bytes());
        sector[40..48].copy_from_slice(&34_u64.to_le_bytes());
        sector[48..56].copy_from_slice(&8158_u64.to_le_bytes());
        sector[72..80].copy_from_slice(&2_u64.to_le_bytes());
        sector[80..84].copy_from_slice(&128_u32.to_le_bytes());
        sector[84..88].copy_from_slice(&128_u32.to_le_bytes());

        // Stamp the CRC over the 92-byte header with the field zeroed.
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&sector[..92]);
        let crc = hasher.finalize();
        sector[16..20].copy_from_slice(&crc.to_le_bytes());
        sector
    }

    #[test]
    fn parse_header_and_verify_crc() {
        let sector = build_header_sector();
        let header = GptHeader::parse(&sector).expect("header");
        assert_eq!(header.partition_entry_lba, 2);
        assert_eq!(header.entry_count, 128);
        assert_eq!(header.entry_size, 128);
        assert!(header.header_crc_valid(&sector));

        let mut tampered = sector.clone();
        tampered[40] ^= 0xFF;
        let reparsed = GptHeader::parse(&tampered).expect("header");
        assert!(!reparsed.header_crc_valid(&tampered));
    }

    #[test]
    fn parse_rejects_bad_signature() {
        let sector = vec![0_u8; 512];
        assert!(matches!(
            GptHeader::parse(&sector),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn entry_name_and_bounds() {
        let mut raw = vec![0_u8; GPT_ENTRY_SIZE];
        raw[0] = 0xA2; // non-zero type GUID
        raw[32..40].copy_from_slice(&2048_u64.to_le_bytes());
        raw[40..48].copy_from_slice(&4095_u64.to_le_bytes());
        for (i, unit) in "basic data".encode_utf16().enumerate() {
            raw[56 + i * 2..58 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }

        let entry = GptPartitionEntry::parse(&raw).expect("entry");
        assert!(!entry.is_unused());
        assert_eq!(entry.sector_count(), 2048);
        assert_eq!(entry.name, "basic data");

        let unused = GptPartitionEntry::parse(&vec![0_u8; GPT_ENTRY_SIZE]).expect("entry");
        assert!(unused.is_unused());
    }
}
