use crate::section::{SectionDescriptor, SectionKind};
use crate::{adler32_of, Warning};
use flate2::read::ZlibDecoder;
use std::io::Read;
use tracing::{debug, trace};
use wfs_device::ByteDevice;
use wfs_error::{Result, WfsError};
use wfs_types::{read_le_u32, u64_to_usize, ByteOffset, ChunkNumber};

/// Fixed part of a table body: entry count, padding, Adler-32.
const TABLE_HEADER_LEN: usize = 24;
/// Bit 31 of a table entry marks a zlib-deflated chunk.
const ENTRY_COMPRESSED_BIT: u32 = 0x8000_0000;
/// Bits 0-30 carry the offset relative to the paired `sectors` body.
const ENTRY_OFFSET_MASK: u32 = 0x7FFF_FFFF;

/// One chunk's stored location within the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkEntry {
    /// Absolute byte offset of the stored data.
    pub offset: u64,
    /// Stored byte count (compressed size for deflated chunks).
    pub stored_size: u64,
    pub compressed: bool,
}

/// Process-wide chunk number to stored-location map, built once during
/// open by concatenating every `table` section in file order.
#[derive(Debug, Default)]
pub struct ChunkIndex {
    entries: Vec<ChunkEntry>,
}

impl ChunkIndex {
    #[must_use]
    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn get(&self, chunk: ChunkNumber) -> Option<&ChunkEntry> {
        usize::try_from(chunk.0)
            .ok()
            .and_then(|i| self.entries.get(i))
    }
}

/// Raw 32-bit words of one parsed table, kept for mirror comparison.
struct ParsedTable {
    sectors_offset: u64,
    words: Vec<u32>,
}

/// Merge every `table`/`table2` section into a single chunk index.
///
/// Entry offsets are relative to the body of the nearest preceding
/// `sectors` section; stored sizes are inferred from successive offsets,
/// with the last entry bounded by the end of the sectors body. `table2`
/// is a recovery mirror: it is compared against its `table` and only
/// used when the `table` is absent.
pub fn build_chunk_index(
    device: &dyn ByteDevice,
    sections: &[SectionDescriptor],
    strict: bool,
    warnings: &mut Vec<Warning>,
) -> Result<ChunkIndex> {
    let segment_size = device.len_bytes();
    let mut index = ChunkIndex::default();
    let mut current_sectors: Option<&SectionDescriptor> = None;
    let mut last_table: Option<ParsedTable> = None;

    for section in sections {
        match section.kind {
            SectionKind::Sectors => {
                current_sectors = Some(section);
                last_table = None;
            }
            SectionKind::Table => {
                let sectors = current_sectors.ok_or_else(|| {
                    WfsError::malformed(
                        "table",
                        section.offset,
                        "table with no preceding sectors section",
                    )
                })?;
                let words = read_table_words(device, section, strict, warnings)?;
                append_entries(&mut index, sectors, &words, segment_size, section)?;
                last_table = Some(ParsedTable {
                    sectors_offset: sectors.offset,
                    words,
                });
            }
            SectionKind::Table2 => {
                let sectors = current_sectors.ok_or_else(|| {
                    WfsError::malformed(
                        "table2",
                        section.offset,
                        "table2 with no preceding sectors section",
                    )
                })?;
                let words = read_table_words(device, section, strict, warnings)?;
                match &last_table {
                    Some(table) if table.sectors_offset == sectors.offset => {
                        if table.words != words {
                            let differing = table
                                .words
                                .iter()
                                .zip(words.iter())
                                .filter(|(a, b)| a != b)
                                .count()
                                .max(table.words.len().abs_diff(words.len()));
                            warnings.push(Warning::new(
                                "table2",
                                section.offset,
                                format!(
                                    "mirror diverges from its table ({differing} entries differ); table kept"
                                ),
                            ));
                        }
                    }
                    _ => {
                        warnings.push(Warning::new(
                            "table2",
                            section.offset,
                            "no usable table for this sectors section; recovered from the mirror",
                        ));
                        append_entries(&mut index, sectors, &words, segment_size, section)?;
                        last_table = Some(ParsedTable {
                            sectors_offset: sectors.offset,
                            words,
                        });
                    }
                }
            }
            _ => {}
        }
    }

    debug!(
        target: "wfs::ewf",
        event = "chunk_index",
        chunks = index.len()
    );
    Ok(index)
}

/// Read one table body and return its entry words.
fn read_table_words(
    device: &dyn ByteDevice,
    section: &SectionDescriptor,
    strict: bool,
    warnings: &mut Vec<Warning>,
) -> Result<Vec<u32>> {
    let section_name = section.type_name.as_str();
    let body_len = u64_to_usize(section.body_len(), "table body length")
        .map_err(|e| WfsError::malformed(section_name, section.offset, e.to_string()))?;
    if body_len < TABLE_HEADER_LEN {
        return Err(WfsError::malformed(
            section_name,
            section.offset,
            format!("body is {body_len} bytes, need at least {TABLE_HEADER_LEN}"),
        ));
    }

    let mut body = vec![0_u8; body_len];
    device.read_exact_at(ByteOffset(section.body_offset()), &mut body)?;

    let parse_err =
        |e: wfs_types::ParseError| WfsError::malformed(section_name, section.offset, e.to_string());
    let mut entry_count = read_le_u32(&body, 0).map_err(parse_err)? as usize;

    // Occasionally the whole table body is itself deflated: a zlib magic
    // prefix plus an entry count that cannot fit in the section.
    let fits = |count: usize, len: usize| {
        count
            .checked_mul(4)
            .and_then(|n| n.checked_add(TABLE_HEADER_LEN))
            .is_some_and(|needed| needed <= len)
    };
    if !fits(entry_count, body.len())
        && body.len() > 2
        && body[0] == 0x78
        && matches!(body[1], 0x01 | 0x9C | 0xDA)
    {
        let mut inflated = Vec::new();
        ZlibDecoder::new(body.as_slice())
            .read_to_end(&mut inflated)
            .map_err(|e| WfsError::Decompress {
                offset: section.body_offset(),
                detail: format!("compressed table body: {e}"),
            })?;
        trace!(
            target: "wfs::ewf",
            event = "compressed_table",
            offset = section.offset,
            inflated = inflated.len()
        );
        body = inflated;
        if body.len() < TABLE_HEADER_LEN {
            return Err(WfsError::malformed(
                section_name,
                section.offset,
                "inflated table body shorter than its header",
            ));
        }
        entry_count = read_le_u32(&body, 0).map_err(parse_err)? as usize;
    }

    if !fits(entry_count, body.len()) {
        return Err(WfsError::malformed(
            section_name,
            section.offset,
            format!(
                "{entry_count} entries do not fit in a {} byte body",
                body.len()
            ),
        ));
    }

    let stored = read_le_u32(&body, 20).map_err(parse_err)?;
    let computed = adler32_of(&body[..20]);
    if stored != computed {
        if strict {
            return Err(WfsError::ChecksumFailure {
                section: section_name.to_owned(),
                offset: section.offset,
                stored,
                computed,
            });
        }
        warnings.push(Warning::new(
            section_name,
            section.offset,
            format!("header Adler-32 mismatch: stored {stored:#010x}, computed {computed:#010x}"),
        ));
    }

    let mut words = Vec::with_capacity(entry_count);
    for i in 0..entry_count {
        words.push(read_le_u32(&body, TABLE_HEADER_LEN + i * 4).map_err(parse_err)?);
    }
    Ok(words)
}

/// Resolve entry words against their `sectors` section and append to the
/// global index.
fn append_entries(
    index: &mut ChunkIndex,
    sectors: &SectionDescriptor,
    words: &[u32],
    segment_size: u64,
    table: &SectionDescriptor,
) -> Result<()> {
    let base = sectors.body_offset();
    let body_end = sectors.body_end();

    for (i, word) in words.iter().enumerate() {
        let relative = u64::from(word & ENTRY_OFFSET_MASK);
        let compressed = word & ENTRY_COMPRESSED_BIT != 0;
        let start = base + relative;

        let end = match words.get(i + 1) {
            Some(next) => {
                let next_relative = u64::from(next & ENTRY_OFFSET_MASK);
                if next_relative < relative {
                    return Err(WfsError::malformed(
                        &table.type_name,
                        table.offset,
                        format!("entry {} offset moves backwards", i + 1),
                    ));
                }
                base + next_relative
            }
            None => body_end,
        };

        if start > end || end > segment_size || end > body_end {
            return Err(WfsError::malformed(
                &table.type_name,
                table.offset,
                format!(
                    "entry {i} spans {start}..{end}, outside the sectors body {}..{body_end}",
                    base
                ),
            ));
        }

        index.entries.push(ChunkEntry {
            offset: start,
            stored_size: end - start,
            compressed,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::SECTION_DESCRIPTOR_LEN;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;
    use wfs_device::MemoryByteDevice;

    struct Layout {
        bytes: Vec<u8>,
        sections: Vec<SectionDescriptor>,
    }

    fn descriptor(kind: &str, offset: u64, size: u64) -> SectionDescriptor {
        SectionDescriptor {
            kind: SectionKind::from_name(kind),
            type_name: kind.to_owned(),
            offset,
            next_offset: offset + size,
            size,
            checksum: 0,
        }
    }

    fn table_body(words: &[u32]) -> Vec<u8> {
        let mut body = vec![0_u8; TABLE_HEADER_LEN + words.len() * 4];
        body[0..4].copy_from_slice(&(words.len() as u32).to_le_bytes());
        let sum = adler32_of(&body[..20]);
        body[20..24].copy_from_slice(&sum.to_le_bytes());
        for (i, word) in words.iter().enumerate() {
            body[TABLE_HEADER_LEN + i * 4..TABLE_HEADER_LEN + i * 4 + 4]
                .copy_from_slice(&word.to_le_bytes());
        }
        body
    }

    /// A segment fragment: sectors section with `chunks` stored runs,
    /// then table (and optionally table2) sections.
    fn layout(chunks: &[&[u8]], compressed_bits: &[bool], mirror: Option<Vec<u32>>) -> Layout {
        let mut bytes = Vec::new();
        let mut sections = Vec::new();

        let sectors_offset = 0_u64;
        let mut chunk_rel = Vec::new();
        let mut sectors_body = Vec::new();
        for chunk in chunks {
            chunk_rel.push(sectors_body.len() as u32);
            sectors_body.extend_from_slice(chunk);
        }
        let sectors_size = SECTION_DESCRIPTOR_LEN + sectors_body.len() as u64;
        sections.push(descriptor("sectors", sectors_offset, sectors_size));
        bytes.extend_from_slice(&vec![0_u8; SECTION_DESCRIPTOR_LEN as usize]);
        bytes.extend_from_slice(&sectors_body);

        let words: Vec<u32> = chunk_rel
            .iter()
            .zip(compressed_bits.iter())
            .map(|(rel, compressed)| {
                if *compressed {
                    rel | ENTRY_COMPRESSED_BIT
                } else {
                    *rel
                }
            })
            .collect();

        let table_offset = bytes.len() as u64;
        let body = table_body(&words);
        sections.push(descriptor(
            "table",
            table_offset,
            SECTION_DESCRIPTOR_LEN + body.len() as u64,
        ));
        bytes.extend_from_slice(&vec![0_u8; SECTION_DESCRIPTOR_LEN as usize]);
        bytes.extend_from_slice(&body);

        if let Some(mirror_words) = mirror {
            let body = table_body(&mirror_words);
            let offset = bytes.len() as u64;
            sections.push(descriptor(
                "table2",
                offset,
                SECTION_DESCRIPTOR_LEN + body.len() as u64,
            ));
            bytes.extend_from_slice(&vec![0_u8; SECTION_DESCRIPTOR_LEN as usize]);
            bytes.extend_from_slice(&body);
        }

        Layout { bytes, sections }
    }

    #[test]
    fn sizes_inferred_from_successive_offsets() {
        let layout = layout(
            &[&[0xAA; 100], &[0xBB; 50], &[0xCC; 25]],
            &[true, false, true],
            None,
        );
        let device = MemoryByteDevice::new(layout.bytes);
        let mut warnings = Vec::new();
        let index =
            build_chunk_index(&device, &layout.sections, true, &mut warnings).expect("index");

        assert_eq!(index.len(), 3);
        let first = index.get(ChunkNumber(0)).expect("entry");
        assert_eq!(first.offset, SECTION_DESCRIPTOR_LEN);
        assert_eq!(first.stored_size, 100);
        assert!(first.compressed);

        let second = index.get(ChunkNumber(1)).expect("entry");
        assert_eq!(second.offset, SECTION_DESCRIPTOR_LEN + 100);
        assert_eq!(second.stored_size, 50);
        assert!(!second.compressed);

        // Last entry is bounded by the end of the sectors body.
        let third = index.get(ChunkNumber(2)).expect("entry");
        assert_eq!(third.stored_size, 25);
        assert!(index.get(ChunkNumber(3)).is_none());
        assert!(warnings.is_empty());
    }

    #[test]
    fn first_entry_at_relative_offset_zero_is_valid() {
        let layout = layout(&[&[0x42; 10]], &[false], None);
        let device = MemoryByteDevice::new(layout.bytes);
        let mut warnings = Vec::new();
        let index =
            build_chunk_index(&device, &layout.sections, true, &mut warnings).expect("index");
        assert_eq!(index.get(ChunkNumber(0)).expect("entry").offset, 76);
    }

    #[test]
    fn matching_mirror_is_silent_divergent_mirror_warns() {
        let l = layout(
            &[&[0xAA; 10], &[0xBB; 10]],
            &[false, false],
            Some(vec![0, 10]),
        );
        let device = MemoryByteDevice::new(l.bytes);
        let mut warnings = Vec::new();
        let index = build_chunk_index(&device, &l.sections, true, &mut warnings).expect("index");
        assert_eq!(index.len(), 2);
        assert!(warnings.is_empty());

        let l = layout(
            &[&[0xAA; 10], &[0xBB; 10]],
            &[false, false],
            Some(vec![0, 12]),
        );
        let device = MemoryByteDevice::new(l.bytes);
        let mut warnings = Vec::new();
        let index = build_chunk_index(&device, &l.sections, false, &mut warnings).expect("index");
        // table wins; mirror divergence only recorded
        assert_eq!(index.get(ChunkNumber(1)).expect("entry").stored_size, 10);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].detail.contains("diverges"));
    }

    #[test]
    fn table_header_checksum_strict() {
        let mut l = layout(&[&[0xAA; 10]], &[false], None);
        // Corrupt the table header checksum.
        let table_body_start = l.sections[1].offset as usize + SECTION_DESCRIPTOR_LEN as usize;
        l.bytes[table_body_start + 20] ^= 0xFF;

        let device = MemoryByteDevice::new(l.bytes.clone());
        let mut warnings = Vec::new();
        let err = build_chunk_index(&device, &l.sections, true, &mut warnings).expect_err("strict");
        assert!(err.is_checksum_failure());

        let mut warnings = Vec::new();
        let index = build_chunk_index(&device, &l.sections, false, &mut warnings).expect("lax");
        assert_eq!(index.len(), 1);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn compressed_table_body_is_inflated_first() {
        // Build an oversized entry list, deflate it, and wrap it in a
        // table section that is too small for the plain layout.
        let words: Vec<u32> = (0..64_u32).map(|i| i * 8).collect();
        let plain = table_body(&words);
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&plain).expect("write");
        let deflated = encoder.finish().expect("finish");
        assert!(deflated.len() < plain.len());

        let mut bytes = Vec::new();
        let sectors_body_len = 64 * 8;
        let mut sections = Vec::new();
        sections.push(descriptor(
            "sectors",
            0,
            SECTION_DESCRIPTOR_LEN + sectors_body_len,
        ));
        bytes.extend_from_slice(&vec![0_u8; (SECTION_DESCRIPTOR_LEN + sectors_body_len) as usize]);

        let table_offset = bytes.len() as u64;
        sections.push(descriptor(
            "table",
            table_offset,
            SECTION_DESCRIPTOR_LEN + deflated.len() as u64,
        ));
        bytes.extend_from_slice(&vec![0_u8; SECTION_DESCRIPTOR_LEN as usize]);
        bytes.extend_from_slice(&deflated);

        let device = MemoryByteDevice::new(bytes);
        let mut warnings = Vec::new();
        let index = build_chunk_index(&device, &sections, true, &mut warnings).expect("index");
        assert_eq!(index.len(), 64);
        assert_eq!(index.get(ChunkNumber(63)).expect("entry").stored_size, 8);
    }

    #[test]
    fn entries_outside_the_sectors_body_are_malformed() {
        let l = layout(&[&[0xAA; 10]], &[false], None);
        let mut sections = l.sections.clone();
        // Shrink the recorded sectors section under the entry span.
        sections[0].size = SECTION_DESCRIPTOR_LEN + 4;
        let device = MemoryByteDevice::new(l.bytes);
        let mut warnings = Vec::new();
        assert!(build_chunk_index(&device, &sections, true, &mut warnings).is_err());
    }

    #[test]
    fn table_without_sectors_is_malformed() {
        let body = table_body(&[0]);
        let mut bytes = vec![0_u8; SECTION_DESCRIPTOR_LEN as usize];
        bytes.extend_from_slice(&body);
        let sections = vec![descriptor(
            "table",
            0,
            SECTION_DESCRIPTOR_LEN + body.len() as u64,
        )];
        let device = MemoryByteDevice::new(bytes);
        let mut warnings = Vec::new();
        assert!(build_chunk_index(&device, &sections, true, &mut warnings).is_err());
    }
}
