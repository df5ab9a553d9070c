#![forbid(unsafe_code)]
//! In-memory fixture builders for WitnessFS tests.
//!
//! Synthesises byte-exact EWF segments and small FAT32/NTFS/EXT volumes
//! so the decode pipeline can be driven end-to-end without binary
//! fixtures in the repository.

mod e01;
mod ext;
mod fat;
mod ntfs;

pub use e01::E01Builder;
pub use ext::{ExtBuilder, ExtFlavor};
pub use fat::Fat32Builder;
pub use ntfs::NtfsBuilder;

pub(crate) fn adler32_of(data: &[u8]) -> u32 {
    adler32::RollingAdler32::from_buffer(data).hash()
}

pub(crate) fn zlib_compress(data: &[u8]) -> Vec<u8> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("zlib encode");
    encoder.finish().expect("zlib finish")
}

/// A whole disk with one MBR partition holding `volume`.
pub fn disk_with_mbr_partition(
    partition_type: u8,
    start_lba: u64,
    volume: &[u8],
    total_sectors: u64,
) -> Vec<u8> {
    let volume_sectors = volume.len().div_ceil(512) as u64;
    assert!(start_lba + volume_sectors <= total_sectors, "volume overflows disk");

    let mut disk = vec![0_u8; (total_sectors * 512) as usize];
    disk[446] = 0x80;
    disk[446 + 4] = partition_type;
    disk[446 + 8..446 + 12].copy_from_slice(&(start_lba as u32).to_le_bytes());
    disk[446 + 12..446 + 16].copy_from_slice(&(volume_sectors as u32).to_le_bytes());
    disk[510] = 0x55;
    disk[511] = 0xAA;

    let offset = (start_lba * 512) as usize;
    disk[offset..offset + volume.len()].copy_from_slice(volume);
    disk
}

/// A whole disk with a protective MBR and one GPT partition holding
/// `volume`.
pub fn disk_with_gpt_partition(
    type_guid: [u8; 16],
    name: &str,
    start_lba: u64,
    volume: &[u8],
    total_sectors: u64,
) -> Vec<u8> {
    let volume_sectors = volume.len().div_ceil(512) as u64;
    assert!(start_lba + volume_sectors <= total_sectors, "volume overflows disk");

    let mut disk = vec![0_u8; (total_sectors * 512) as usize];

    // Protective MBR.
    disk[446 + 4] = 0xEE;
    disk[446 + 8..446 + 12].copy_from_slice(&1_u32.to_le_bytes());
    disk[446 + 12..446 + 16]
        .copy_from_slice(&(u32::try_from(total_sectors - 1).unwrap_or(u32::MAX)).to_le_bytes());
    disk[510] = 0x55;
    disk[511] = 0xAA;

    // One partition entry at LBA 2.
    let mut entry = vec![0_u8; 128];
    entry[..16].copy_from_slice(&type_guid);
    entry[16] = 0x99; // unique GUID, content irrelevant
    entry[32..40].copy_from_slice(&start_lba.to_le_bytes());
    entry[40..48].copy_from_slice(&(start_lba + volume_sectors - 1).to_le_bytes());
    for (i, unit) in name.encode_utf16().take(35).enumerate() {
        entry[56 + i * 2..58 + i * 2].copy_from_slice(&unit.to_le_bytes());
    }
    let entries_offset = 2 * 512;
    disk[entries_offset..entries_offset + 128].copy_from_slice(&entry);

    // GPT header at LBA 1.
    let header_offset = 512;
    disk[header_offset..header_offset + 8].copy_from_slice(b"EFI PART");
    disk[header_offset + 8..header_offset + 12].copy_from_slice(&0x0001_0000_u32.to_le_bytes());
    disk[header_offset + 12..header_offset + 16].copy_from_slice(&92_u32.to_le_bytes());
    disk[header_offset + 24..header_offset + 32].copy_from_slice(&1_u64.to_le_bytes());
    disk[header_offset + 32..header_offset + 40]
        .copy_from_slice(&(total_sectors - 1).to_le_bytes());
    disk[header_offset + 40..header_offset + 48].copy_from_slice(&34_u64.to_le_bytes());
    disk[header_offset + 48..header_offset + 56]
        .copy_from_slice(&(total_sectors - 2).to_le_bytes());
    disk[header_offset + 72..header_offset + 80].copy_from_slice(&2_u64.to_le_bytes());
    disk[header_offset + 80..header_offset + 84].copy_from_slice(&128_u32.to_le_bytes());
    disk[header_offset + 84..header_offset + 88].copy_from_slice(&128_u32.to_le_bytes());

    let entries_crc = crc32fast::hash(&disk[entries_offset..entries_offset + 128 * 128]);
    disk[header_offset + 88..header_offset + 92].copy_from_slice(&entries_crc.to_le_bytes());
    let header_crc = crc32fast::hash(&disk[header_offset..header_offset + 92]);
    disk[header_offset + 16..header_offset + 20].copy_from_slice(&header_crc.to_le_bytes());

    let volume_offset = (start_lba * 512) as usize;
    disk[volume_offset..volume_offset + volume.len()].copy_from_slice(volume);
    disk
}
