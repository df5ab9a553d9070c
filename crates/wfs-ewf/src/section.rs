use crate::{adler32_of, Warning};
use std::collections::HashSet;
use tracing::{debug, trace, warn};
use wfs_device::ByteDevice;
use wfs_error::{Result, WfsError};
use wfs_types::{read_le_u16, read_le_u32, read_le_u64, trim_nul_padded, ByteOffset};

/// Length of the segment file header.
pub const SEGMENT_HEADER_LEN: u64 = 13;
/// Length of every section descriptor.
pub const SECTION_DESCRIPTOR_LEN: u64 = 76;
/// `"EVF\x09\x0d\x0a\xff\x00"`.
pub const EVF_SIGNATURE: [u8; 8] = [0x45, 0x56, 0x46, 0x09, 0x0D, 0x0A, 0xFF, 0x00];

/// 13-byte segment file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub segment_number: u16,
}

impl SegmentHeader {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < SEGMENT_HEADER_LEN as usize {
            return Err(WfsError::malformed(
                "file header",
                0,
                format!("{} bytes, need 13", raw.len()),
            ));
        }
        if raw[..8] != EVF_SIGNATURE {
            return Err(WfsError::NotEwf);
        }
        if raw[8] != 1 {
            return Err(WfsError::malformed(
                "file header",
                8,
                format!("fields_start is {}, must be 1", raw[8]),
            ));
        }
        if raw[11] != 0 || raw[12] != 0 {
            return Err(WfsError::malformed(
                "file header",
                11,
                "fields_end is not zero",
            ));
        }
        Ok(Self {
            segment_number: read_le_u16(raw, 9)
                .map_err(|e| WfsError::malformed("file header", 9, e.to_string()))?,
        })
    }
}

/// Recognised section types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Header,
    Header2,
    Volume,
    Disk,
    Data,
    Sectors,
    Table,
    Table2,
    Next,
    Ltype,
    Ltree,
    Map,
    Session,
    Error2,
    Digest,
    Hash,
    Done,
    Unknown,
}

impl SectionKind {
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "header" => Self::Header,
            "header2" => Self::Header2,
            "volume" => Self::Volume,
            "disk" => Self::Disk,
            "data" => Self::Data,
            "sectors" => Self::Sectors,
            "table" => Self::Table,
            "table2" => Self::Table2,
            "next" => Self::Next,
            "ltype" => Self::Ltype,
            "ltree" => Self::Ltree,
            "map" => Self::Map,
            "session" => Self::Session,
            "error2" => Self::Error2,
            "digest" => Self::Digest,
            "hash" => Self::Hash,
            "done" => Self::Done,
            _ => Self::Unknown,
        }
    }
}

/// One 76-byte section descriptor, keyed by its absolute offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionDescriptor {
    pub kind: SectionKind,
    pub type_name: String,
    pub offset: u64,
    pub next_offset: u64,
    pub size: u64,
    pub checksum: u32,
}

impl SectionDescriptor {
    fn parse(raw: &[u8], offset: u64) -> Result<(Self, u32)> {
        let type_name = trim_nul_padded(&raw[..16]);
        let next_offset = read_le_u64(raw, 16)
            .map_err(|e| WfsError::malformed("section", offset, e.to_string()))?;
        let size = read_le_u64(raw, 24)
            .map_err(|e| WfsError::malformed("section", offset, e.to_string()))?;
        let checksum = read_le_u32(raw, 72)
            .map_err(|e| WfsError::malformed("section", offset, e.to_string()))?;
        let computed = adler32_of(&raw[..72]);
        Ok((
            Self {
                kind: SectionKind::from_name(&type_name),
                type_name,
                offset,
                next_offset,
                size,
                checksum,
            },
            computed,
        ))
    }

    /// Absolute offset of the section body.
    #[must_use]
    pub fn body_offset(&self) -> u64 {
        self.offset + SECTION_DESCRIPTOR_LEN
    }

    /// Body length (section size minus the descriptor).
    #[must_use]
    pub fn body_len(&self) -> u64 {
        self.size.saturating_sub(SECTION_DESCRIPTOR_LEN)
    }

    /// Absolute offset one past the section body.
    #[must_use]
    pub fn body_end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Walk the linked list of sections starting at offset 13.
///
/// Records every descriptor; does not parse bodies. Terminates on `done`
/// or on a self-linked descriptor; a `next` section ends the primary
/// segment with a warning. Backward jumps, revisited offsets, and chains
/// running past the end of the segment are malformed.
pub fn scan_sections(
    device: &dyn ByteDevice,
    strict: bool,
    warnings: &mut Vec<Warning>,
) -> Result<Vec<SectionDescriptor>> {
    let segment_size = device.len_bytes();
    let mut sections = Vec::new();
    let mut visited: HashSet<u64> = HashSet::new();
    let mut offset = SEGMENT_HEADER_LEN;

    loop {
        if offset + SECTION_DESCRIPTOR_LEN > segment_size {
            return Err(WfsError::malformed(
                "section",
                offset,
                "descriptor extends past the end of the segment (chain missing done)",
            ));
        }
        if !visited.insert(offset) {
            return Err(WfsError::malformed(
                "section",
                offset,
                "section chain revisits an already-scanned offset",
            ));
        }

        let mut raw = [0_u8; SECTION_DESCRIPTOR_LEN as usize];
        device.read_exact_at(ByteOffset(offset), &mut raw)?;
        let (descriptor, computed) = SectionDescriptor::parse(&raw, offset)?;

        if computed != descriptor.checksum {
            if strict {
                return Err(WfsError::ChecksumFailure {
                    section: descriptor.type_name.clone(),
                    offset,
                    stored: descriptor.checksum,
                    computed,
                });
            }
            warnings.push(Warning::new(
                descriptor.type_name.clone(),
                offset,
                format!(
                    "descriptor Adler-32 mismatch: stored {:#010x}, computed {computed:#010x}",
                    descriptor.checksum
                ),
            ));
        }

        trace!(
            target: "wfs::ewf",
            event = "section",
            kind = %descriptor.type_name,
            offset,
            size = descriptor.size,
            next = descriptor.next_offset
        );
        if descriptor.kind == SectionKind::Unknown {
            warnings.push(Warning::new(
                descriptor.type_name.clone(),
                offset,
                "unknown section type, body skipped",
            ));
        }

        let kind = descriptor.kind;
        let next_offset = descriptor.next_offset;
        let size = descriptor.size;
        sections.push(descriptor);

        match kind {
            SectionKind::Done => break,
            SectionKind::Next => {
                warn!(
                    target: "wfs::ewf",
                    offset,
                    "segment chains into a continuation file; only the primary segment is read"
                );
                warnings.push(Warning::new(
                    "next",
                    offset,
                    "continuation segments are unsupported; chain ends here",
                ));
                break;
            }
            _ => {}
        }

        // Final sections may link to themselves instead of carrying done.
        if next_offset == offset {
            break;
        }
        if next_offset < offset {
            return Err(WfsError::malformed(
                "section",
                offset,
                format!("next offset {next_offset} jumps backwards"),
            ));
        }
        if next_offset > segment_size {
            return Err(WfsError::malformed(
                "section",
                offset,
                format!(
                    "next offset {next_offset} points past the end of the segment ({segment_size} bytes)"
                ),
            ));
        }
        if size < SECTION_DESCRIPTOR_LEN {
            return Err(WfsError::malformed(
                "section",
                offset,
                format!("section size {size} smaller than the 76-byte descriptor"),
            ));
        }

        offset = next_offset;
    }

    debug!(
        target: "wfs::ewf",
        event = "scan_complete",
        sections = sections.len()
    );
    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wfs_device::MemoryByteDevice;

    fn descriptor(type_name: &str, next: u64, size: u64) -> Vec<u8> {
        let mut raw = vec![0_u8; 76];
        raw[..type_name.len()].copy_from_slice(type_name.as_bytes());
        raw[16..24].copy_from_slice(&next.to_le_bytes());
        raw[24..32].copy_from_slice(&size.to_le_bytes());
        let sum = adler32_of(&raw[..72]);
        raw[72..76].copy_from_slice(&sum.to_le_bytes());
        raw
    }

    fn segment(sections: &[Vec<u8>]) -> Vec<u8> {
        let mut bytes = vec![0_u8; 13];
        bytes[..8].copy_from_slice(&EVF_SIGNATURE);
        bytes[8] = 1;
        bytes[9..11].copy_from_slice(&1_u16.to_le_bytes());
        for section in sections {
            bytes.extend_from_slice(section);
        }
        bytes
    }

    #[test]
    fn segment_header_round_trip() {
        let bytes = segment(&[]);
        let header = SegmentHeader::parse(&bytes).expect("header");
        assert_eq!(header.segment_number, 1);

        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(matches!(SegmentHeader::parse(&bad), Err(WfsError::NotEwf)));

        let mut bad_fields = bytes;
        bad_fields[8] = 2;
        assert!(matches!(
            SegmentHeader::parse(&bad_fields),
            Err(WfsError::Malformed { .. })
        ));
    }

    #[test]
    fn scan_terminates_on_done() {
        let bytes = segment(&[
            descriptor("header", 13 + 76, 76),
            descriptor("done", 13 + 76, 76),
        ]);
        let device = MemoryByteDevice::new(bytes);
        let mut warnings = Vec::new();
        let sections = scan_sections(&device, true, &mut warnings).expect("scan");
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].kind, SectionKind::Header);
        assert_eq!(sections[1].kind, SectionKind::Done);
        assert!(warnings.is_empty());
    }

    #[test]
    fn scan_terminates_on_self_link() {
        // Final section points at itself instead of carrying done.
        let second_offset = 13 + 76;
        let bytes = segment(&[
            descriptor("header", second_offset, 76),
            descriptor("volume", second_offset, 76),
        ]);
        let device = MemoryByteDevice::new(bytes);
        let mut warnings = Vec::new();
        let sections = scan_sections(&device, true, &mut warnings).expect("scan");
        assert_eq!(sections.len(), 2);
    }

    #[test]
    fn scan_rejects_backward_jump() {
        let bytes = segment(&[
            descriptor("header", 13 + 76, 76),
            descriptor("volume", 13, 76),
        ]);
        let device = MemoryByteDevice::new(bytes);
        let mut warnings = Vec::new();
        let err = scan_sections(&device, true, &mut warnings).expect_err("backward");
        assert!(matches!(err, WfsError::Malformed { .. }));
    }

    #[test]
    fn scan_rejects_chain_past_eof() {
        let bytes = segment(&[descriptor("header", 1_000_000, 76)]);
        let device = MemoryByteDevice::new(bytes);
        let mut warnings = Vec::new();
        let err = scan_sections(&device, true, &mut warnings).expect_err("eof");
        match err {
            WfsError::Malformed { section, .. } => assert_eq!(section, "section"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn descriptor_checksum_strict_vs_lax() {
        let mut bad = descriptor("header", 13 + 76, 76);
        bad[72] ^= 0xFF;
        let done = descriptor("done", 13 + 76, 76);
        let bytes = segment(&[bad, done]);

        let device = MemoryByteDevice::new(bytes);
        let mut warnings = Vec::new();
        let err = scan_sections(&device, true, &mut warnings).expect_err("strict");
        assert!(err.is_checksum_failure());

        let mut warnings = Vec::new();
        let sections = scan_sections(&device, false, &mut warnings).expect("lax");
        assert_eq!(sections.len(), 2);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].offset, 13);
    }

    #[test]
    fn next_section_ends_primary_segment() {
        let bytes = segment(&[descriptor("next", 13, 76)]);
        let device = MemoryByteDevice::new(bytes);
        let mut warnings = Vec::new();
        let sections = scan_sections(&device, false, &mut warnings).expect("scan");
        assert_eq!(sections.len(), 1);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].detail.contains("continuation"));
    }
}
