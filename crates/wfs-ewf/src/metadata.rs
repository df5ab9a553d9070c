use crate::{adler32_of, Warning};
use flate2::read::ZlibDecoder;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Read;
use tracing::debug;
use wfs_error::{Result, WfsError};
use wfs_types::{bytes_to_hex, format_guid, read_fixed, read_le_u32, read_le_u64};

/// Size of the SMART-style volume/disk body.
const DISK_SMART_LEN: usize = 1052;
/// Size of the older EWF specification volume body.
const EWF_SPECIFICATION_LEN: usize = 94;
/// digest and hash bodies: MD5 + SHA-1 + padding + Adler-32.
const DIGEST_BODY_LEN: usize = 80;

/// Case metadata carried by the `header`/`header2` sections.
///
/// Line 3 of the decompressed text names the flags, line 4 the values;
/// unknown flags are retained verbatim in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CaseInfo {
    pub unique_description: Option<String>,
    pub case_number: Option<String>,
    pub evidence_number: Option<String>,
    pub examiner: Option<String>,
    pub notes: Option<String>,
    pub acquisition_version: Option<String>,
    pub os: Option<String>,
    pub acquisition_time: Option<String>,
    pub system_time: Option<String>,
    pub password_hash: Option<String>,
    pub media_model: Option<String>,
    pub serial_number: Option<String>,
    pub label: Option<String>,
    pub process_id: Option<String>,
    pub unused_dc: Option<String>,
    pub extents: Option<String>,
    pub compression_level: Option<String>,
    pub extra: BTreeMap<String, String>,
}

/// Decode the BOM-prefixed header text: UTF-32LE/BE and UTF-16LE/BE by
/// their marks, UTF-8 otherwise.
#[must_use]
pub fn decode_bom_text(bytes: &[u8]) -> String {
    // Four-byte marks first: the UTF-32LE BOM starts with the UTF-16LE one.
    if bytes.len() >= 4 && bytes[..4] == [0xFF, 0xFE, 0x00, 0x00] {
        let units: Vec<u32> = bytes[4..]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        return units
            .into_iter()
            .map(|u| char::from_u32(u).unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect();
    }
    if bytes.len() >= 4 && bytes[..4] == [0x00, 0x00, 0xFE, 0xFF] {
        let units: Vec<u32> = bytes[4..]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        return units
            .into_iter()
            .map(|u| char::from_u32(u).unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect();
    }
    if bytes.len() >= 2 && bytes[..2] == [0xFF, 0xFE] {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    if bytes.len() >= 2 && bytes[..2] == [0xFE, 0xFF] {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    String::from_utf8_lossy(bytes).into_owned()
}

/// Parse a zlib-compressed `header`/`header2` body.
pub fn parse_header_body(compressed: &[u8], body_offset: u64) -> Result<CaseInfo> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut text_bytes = Vec::new();
    decoder
        .read_to_end(&mut text_bytes)
        .map_err(|e| WfsError::Decompress {
            offset: body_offset,
            detail: format!("header body: {e}"),
        })?;

    let text = decode_bom_text(&text_bytes);
    let lines: Vec<&str> = text.split('\n').map(|l| l.trim_end_matches('\r')).collect();
    if lines.len() < 4 {
        return Err(WfsError::malformed(
            "header",
            body_offset,
            format!("{} text lines, need at least 4", lines.len()),
        ));
    }

    let flags: Vec<&str> = lines[2].split('\t').collect();
    let values: Vec<&str> = lines[3].split('\t').collect();
    if flags.len() != values.len() {
        return Err(WfsError::malformed(
            "header",
            body_offset,
            format!(
                "flag list has {} entries but value line has {}",
                flags.len(),
                values.len()
            ),
        ));
    }

    let mut info = CaseInfo::default();
    for (flag, value) in flags.iter().zip(values.iter()) {
        let value = (*value).to_owned();
        match *flag {
            "a" => info.unique_description = Some(value),
            "c" => info.case_number = Some(value),
            "n" => info.evidence_number = Some(value),
            "e" => info.examiner = Some(value),
            "t" => info.notes = Some(value),
            "av" => info.acquisition_version = Some(value),
            "ov" => info.os = Some(value),
            "m" => info.acquisition_time = Some(value),
            "u" => info.system_time = Some(value),
            "p" => info.password_hash = Some(value),
            "md" => info.media_model = Some(value),
            "sn" => info.serial_number = Some(value),
            "l" => info.label = Some(value),
            "pid" => info.process_id = Some(value),
            "dc" => info.unused_dc = Some(value),
            "ext" => info.extents = Some(value),
            "r" => info.compression_level = Some(value),
            other => {
                info.extra.insert(other.to_owned(), value);
            }
        }
    }
    debug!(
        target: "wfs::ewf",
        event = "case_info",
        case = info.case_number.as_deref().unwrap_or(""),
        evidence = info.evidence_number.as_deref().unwrap_or("")
    );
    Ok(info)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VolumeDescriptorKind {
    /// 1052-byte SMART-style descriptor.
    DiskSmart,
    /// 94-byte EWF specification descriptor.
    Specification,
}

/// Geometry and acquisition parameters from the `volume`/`disk` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeInfo {
    pub descriptor: VolumeDescriptorKind,
    pub media_type: u8,
    pub chunk_count: u64,
    pub sectors_per_chunk: u32,
    pub bytes_per_sector: u32,
    pub sector_count: u64,
    pub chs_cylinders: u32,
    pub chs_heads: u32,
    pub chs_sectors: u32,
    pub media_flags: u8,
    pub compression_level: u8,
    pub sector_error_granularity: u32,
    pub set_identifier: Option<String>,
}

impl VolumeInfo {
    /// Bytes covered by one chunk.
    #[must_use]
    pub fn chunk_size(&self) -> u64 {
        u64::from(self.sectors_per_chunk) * u64::from(self.bytes_per_sector)
    }

    /// Reconstructed disk size in bytes.
    #[must_use]
    pub fn disk_size(&self) -> u64 {
        self.sector_count * u64::from(self.bytes_per_sector)
    }
}

/// Parse a `volume`/`disk` body; 1052 bytes or more selects the SMART
/// layout, anything down to 94 bytes the EWF specification layout.
pub fn parse_volume_body(
    body: &[u8],
    body_offset: u64,
    strict: bool,
    warnings: &mut Vec<Warning>,
) -> Result<VolumeInfo> {
    let map_err = |e: wfs_types::ParseError| WfsError::malformed("volume", body_offset, e.to_string());

    let info = if body.len() >= DISK_SMART_LEN {
        verify_body_checksum(
            &body[..DISK_SMART_LEN],
            DISK_SMART_LEN - 4,
            "volume",
            body_offset,
            strict,
            warnings,
        )?;
        let guid = read_fixed::<16>(body, 64).map_err(map_err)?;
        VolumeInfo {
            descriptor: VolumeDescriptorKind::DiskSmart,
            media_type: body[0],
            chunk_count: u64::from(read_le_u32(body, 4).map_err(map_err)?),
            sectors_per_chunk: read_le_u32(body, 8).map_err(map_err)?,
            bytes_per_sector: read_le_u32(body, 12).map_err(map_err)?,
            sector_count: read_le_u64(body, 16).map_err(map_err)?,
            chs_cylinders: read_le_u32(body, 24).map_err(map_err)?,
            chs_heads: read_le_u32(body, 28).map_err(map_err)?,
            chs_sectors: read_le_u32(body, 32).map_err(map_err)?,
            media_flags: body[36],
            compression_level: body[52],
            sector_error_granularity: read_le_u32(body, 56).map_err(map_err)?,
            set_identifier: if guid.iter().any(|b| *b != 0) {
                Some(format_guid(&guid))
            } else {
                None
            },
        }
    } else if body.len() >= EWF_SPECIFICATION_LEN {
        verify_body_checksum(
            &body[..EWF_SPECIFICATION_LEN],
            EWF_SPECIFICATION_LEN - 4,
            "volume",
            body_offset,
            strict,
            warnings,
        )?;
        VolumeInfo {
            descriptor: VolumeDescriptorKind::Specification,
            media_type: 0,
            chunk_count: u64::from(read_le_u32(body, 4).map_err(map_err)?),
            sectors_per_chunk: read_le_u32(body, 8).map_err(map_err)?,
            bytes_per_sector: read_le_u32(body, 12).map_err(map_err)?,
            sector_count: u64::from(read_le_u32(body, 16).map_err(map_err)?),
            chs_cylinders: 0,
            chs_heads: 0,
            chs_sectors: 0,
            media_flags: 0,
            compression_level: 0,
            sector_error_granularity: 0,
            set_identifier: None,
        }
    } else {
        return Err(WfsError::malformed(
            "volume",
            body_offset,
            format!("body is {} bytes, need at least 94", body.len()),
        ));
    };

    if !matches!(info.bytes_per_sector, 512 | 1024 | 2048 | 4096) {
        return Err(WfsError::malformed(
            "volume",
            body_offset,
            format!(
                "bytes_per_sector {} not one of 512/1024/2048/4096",
                info.bytes_per_sector
            ),
        ));
    }
    if info.sectors_per_chunk == 0 || !info.sectors_per_chunk.is_power_of_two() {
        return Err(WfsError::malformed(
            "volume",
            body_offset,
            format!(
                "sectors_per_chunk {} is not a power of two",
                info.sectors_per_chunk
            ),
        ));
    }

    Ok(info)
}

/// MD5/SHA-1 digests from the `digest`/`hash` sections, hex-encoded.
/// All-zero digests are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DigestInfo {
    pub md5: Option<String>,
    pub sha1: Option<String>,
}

/// Parse a `digest` or `hash` body: MD5[16], SHA-1[20], padding,
/// Adler-32.
pub fn parse_digest_body(
    body: &[u8],
    section: &str,
    body_offset: u64,
    strict: bool,
    warnings: &mut Vec<Warning>,
) -> Result<DigestInfo> {
    if body.len() < DIGEST_BODY_LEN {
        return Err(WfsError::malformed(
            section,
            body_offset,
            format!("body is {} bytes, need {DIGEST_BODY_LEN}", body.len()),
        ));
    }
    verify_body_checksum(
        &body[..DIGEST_BODY_LEN],
        DIGEST_BODY_LEN - 4,
        section,
        body_offset,
        strict,
        warnings,
    )?;

    let md5 = &body[..16];
    let sha1 = &body[16..36];
    Ok(DigestInfo {
        md5: if md5.iter().any(|b| *b != 0) {
            Some(bytes_to_hex(md5))
        } else {
            None
        },
        sha1: if sha1.iter().any(|b| *b != 0) {
            Some(bytes_to_hex(sha1))
        } else {
            None
        },
    })
}

/// One bad-sector range recorded at acquisition time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AcquisitionError {
    pub first_sector: u32,
    pub sector_count: u32,
}

/// Parse an `error2` body: a 12-byte header whose first word is the
/// entry count, then `{first_sector, sector_count}` pairs.
#[must_use]
pub fn parse_error2_body(body: &[u8]) -> Vec<AcquisitionError> {
    let Ok(count) = read_le_u32(body, 0) else {
        return Vec::new();
    };
    let count = (count as usize).min(10_000);
    let mut errors = Vec::with_capacity(count);
    for i in 0..count {
        let offset = 12 + i * 8;
        let (Ok(first_sector), Ok(sector_count)) =
            (read_le_u32(body, offset), read_le_u32(body, offset + 4))
        else {
            break;
        };
        errors.push(AcquisitionError {
            first_sector,
            sector_count,
        });
    }
    errors
}

/// Verify the Adler-32 stored at `checksum_offset` over the bytes that
/// precede it; strict mode raises, lax mode records a warning.
fn verify_body_checksum(
    body: &[u8],
    checksum_offset: usize,
    section: &str,
    body_offset: u64,
    strict: bool,
    warnings: &mut Vec<Warning>,
) -> Result<()> {
    let stored = read_le_u32(body, checksum_offset)
        .map_err(|e| WfsError::malformed(section, body_offset, e.to_string()))?;
    let computed = adler32_of(&body[..checksum_offset]);
    if stored != computed {
        if strict {
            return Err(WfsError::ChecksumFailure {
                section: section.to_owned(),
                offset: body_offset,
                stored,
                computed,
            });
        }
        warnings.push(Warning::new(
            section,
            body_offset,
            format!("body Adler-32 mismatch: stored {stored:#010x}, computed {computed:#010x}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn compress(text: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text).expect("write");
        encoder.finish().expect("finish")
    }

    const HEADER_TEXT: &str =
        "1\nmain\nc\tn\ta\te\tav\tov\tm\tzz\n0451\tdrive-7\tacquired laptop\tjdoe\t1.1\tlinux\t1422\tmystery\n\n";

    #[test]
    fn parse_header_maps_flags_and_keeps_unknown() {
        let info = parse_header_body(&compress(HEADER_TEXT.as_bytes()), 89).expect("case info");
        assert_eq!(info.case_number.as_deref(), Some("0451"));
        assert_eq!(info.evidence_number.as_deref(), Some("drive-7"));
        assert_eq!(info.unique_description.as_deref(), Some("acquired laptop"));
        assert_eq!(info.examiner.as_deref(), Some("jdoe"));
        assert_eq!(info.acquisition_version.as_deref(), Some("1.1"));
        assert_eq!(info.os.as_deref(), Some("linux"));
        assert_eq!(info.acquisition_time.as_deref(), Some("1422"));
        assert_eq!(info.extra.get("zz").map(String::as_str), Some("mystery"));
    }

    #[test]
    fn parse_header_utf16le_bom() {
        let mut text = vec![0xFF, 0xFE];
        for unit in HEADER_TEXT.encode_utf16() {
            text.extend_from_slice(&unit.to_le_bytes());
        }
        let info = parse_header_body(&compress(&text), 0).expect("case info");
        assert_eq!(info.case_number.as_deref(), Some("0451"));
    }

    #[test]
    fn parse_header_utf16be_bom() {
        let mut text = vec![0xFE, 0xFF];
        for unit in HEADER_TEXT.encode_utf16() {
            text.extend_from_slice(&unit.to_be_bytes());
        }
        let info = parse_header_body(&compress(&text), 0).expect("case info");
        assert_eq!(info.examiner.as_deref(), Some("jdoe"));
    }

    #[test]
    fn parse_header_utf32le_bom_wins_over_utf16() {
        let mut text = vec![0xFF, 0xFE, 0x00, 0x00];
        for ch in HEADER_TEXT.chars() {
            text.extend_from_slice(&(ch as u32).to_le_bytes());
        }
        let info = parse_header_body(&compress(&text), 0).expect("case info");
        assert_eq!(info.os.as_deref(), Some("linux"));
    }

    #[test]
    fn parse_header_rejects_mismatched_counts() {
        let text = "1\nmain\nc\tn\nonly-one\n\n";
        let err = parse_header_body(&compress(text.as_bytes()), 0).expect_err("mismatch");
        assert!(matches!(err, WfsError::Malformed { .. }));
    }

    #[test]
    fn parse_header_rejects_garbage_zlib() {
        let err = parse_header_body(&[0x01, 0x02, 0x03], 7).expect_err("zlib");
        assert!(matches!(err, WfsError::Decompress { offset: 7, .. }));
    }

    fn smart_volume_body(chunk_count: u32, spc: u32, bps: u32, sectors: u64) -> Vec<u8> {
        let mut body = vec![0_u8; DISK_SMART_LEN];
        body[0] = 1;
        body[4..8].copy_from_slice(&chunk_count.to_le_bytes());
        body[8..12].copy_from_slice(&spc.to_le_bytes());
        body[12..16].copy_from_slice(&bps.to_le_bytes());
        body[16..24].copy_from_slice(&sectors.to_le_bytes());
        body[52] = 1;
        let sum = adler32_of(&body[..DISK_SMART_LEN - 4]);
        body[DISK_SMART_LEN - 4..].copy_from_slice(&sum.to_le_bytes());
        body
    }

    #[test]
    fn parse_smart_volume() {
        let body = smart_volume_body(32, 64, 512, 2048);
        let mut warnings = Vec::new();
        let info = parse_volume_body(&body, 0, true, &mut warnings).expect("volume");
        assert_eq!(info.descriptor, VolumeDescriptorKind::DiskSmart);
        assert_eq!(info.chunk_count, 32);
        assert_eq!(info.chunk_size(), 32768);
        assert_eq!(info.disk_size(), 1_048_576);
        assert!(warnings.is_empty());
    }

    #[test]
    fn parse_specification_volume() {
        let mut body = vec![0_u8; EWF_SPECIFICATION_LEN];
        body[4..8].copy_from_slice(&16_u32.to_le_bytes());
        body[8..12].copy_from_slice(&64_u32.to_le_bytes());
        body[12..16].copy_from_slice(&512_u32.to_le_bytes());
        body[16..20].copy_from_slice(&1024_u32.to_le_bytes());
        let sum = adler32_of(&body[..EWF_SPECIFICATION_LEN - 4]);
        body[EWF_SPECIFICATION_LEN - 4..].copy_from_slice(&sum.to_le_bytes());

        let mut warnings = Vec::new();
        let info = parse_volume_body(&body, 0, true, &mut warnings).expect("volume");
        assert_eq!(info.descriptor, VolumeDescriptorKind::Specification);
        assert_eq!(info.sector_count, 1024);
    }

    #[test]
    fn volume_checksum_strict_vs_lax() {
        let mut body = smart_volume_body(32, 64, 512, 2048);
        body[100] ^= 0xAA; // corrupt a padding byte covered by the checksum

        let mut warnings = Vec::new();
        let err = parse_volume_body(&body, 89, true, &mut warnings).expect_err("strict");
        assert!(err.is_checksum_failure());

        let mut warnings = Vec::new();
        let info = parse_volume_body(&body, 89, false, &mut warnings).expect("lax");
        assert_eq!(info.sector_count, 2048);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].detail.contains("Adler-32"));
    }

    #[test]
    fn volume_rejects_bad_geometry() {
        let mut warnings = Vec::new();
        let body = smart_volume_body(32, 64, 513, 2048);
        assert!(parse_volume_body(&body, 0, false, &mut warnings).is_err());

        let body = smart_volume_body(32, 63, 512, 2048);
        assert!(parse_volume_body(&body, 0, false, &mut warnings).is_err());
    }

    #[test]
    fn digest_body_hex_and_zero_handling() {
        let mut body = vec![0_u8; DIGEST_BODY_LEN];
        for (i, b) in body.iter_mut().take(16).enumerate() {
            *b = i as u8 + 1;
        }
        let sum = adler32_of(&body[..DIGEST_BODY_LEN - 4]);
        body[DIGEST_BODY_LEN - 4..].copy_from_slice(&sum.to_le_bytes());

        let mut warnings = Vec::new();
        let info = parse_digest_body(&body, "hash", 0, true, &mut warnings).expect("digest");
        assert_eq!(
            info.md5.as_deref(),
            Some("0102030405060708090a0b0c0d0e0f10")
        );
        assert_eq!(info.sha1, None);
    }

    #[test]
    fn error2_entries() {
        let mut body = vec![0_u8; 12 + 16];
        body[0..4].copy_from_slice(&2_u32.to_le_bytes());
        body[12..16].copy_from_slice(&100_u32.to_le_bytes());
        body[16..20].copy_from_slice(&8_u32.to_le_bytes());
        body[20..24].copy_from_slice(&500_u32.to_le_bytes());
        body[24..28].copy_from_slice(&1_u32.to_le_bytes());

        let errors = parse_error2_body(&body);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].first_sector, 100);
        assert_eq!(errors[0].sector_count, 8);
        assert_eq!(errors[1].first_sector, 500);
    }
}
