use crate::{adler32_of, zlib_compress};

const SECTION_DESCRIPTOR_LEN: usize = 76;
const DISK_SMART_LEN: usize = 1052;

/// Builds a syntactically valid single-segment E01 in memory.
///
/// The default image is 1 MiB of zeros at 512-byte sectors and 64
/// sectors per chunk, with deflated chunks and a full section chain
/// (`header`, `volume`, `sectors`/`table`/`table2`, `hash`, `done`).
pub struct E01Builder {
    bytes_per_sector: u32,
    sectors_per_chunk: u32,
    data: Vec<u8>,
    compress: bool,
    chunk_checksums: bool,
    corrupt_volume_checksum: bool,
    truncated_chain: bool,
    case_fields: Vec<(String, String)>,
}

impl Default for E01Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl E01Builder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bytes_per_sector: 512,
            sectors_per_chunk: 64,
            data: vec![0_u8; 1024 * 1024],
            compress: true,
            chunk_checksums: false,
            corrupt_volume_checksum: false,
            truncated_chain: false,
            case_fields: vec![
                ("c".to_owned(), "case-001".to_owned()),
                ("n".to_owned(), "evidence-01".to_owned()),
                ("a".to_owned(), "synthetic image".to_owned()),
                ("e".to_owned(), "examiner".to_owned()),
                ("av".to_owned(), "1.0".to_owned()),
                ("ov".to_owned(), "linux".to_owned()),
                ("m".to_owned(), "1700000000".to_owned()),
                ("u".to_owned(), "1700000001".to_owned()),
                ("p".to_owned(), "0".to_owned()),
            ],
        }
    }

    /// Set the disk contents; padded up to a whole sector.
    #[must_use]
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    #[must_use]
    pub fn zeroed(mut self, len: usize) -> Self {
        self.data = vec![0_u8; len];
        self
    }

    #[must_use]
    pub fn bytes_per_sector(mut self, bps: u32) -> Self {
        self.bytes_per_sector = bps;
        self
    }

    #[must_use]
    pub fn sectors_per_chunk(mut self, spc: u32) -> Self {
        self.sectors_per_chunk = spc;
        self
    }

    /// Store chunks verbatim instead of deflating them.
    #[must_use]
    pub fn uncompressed(mut self) -> Self {
        self.compress = false;
        self
    }

    /// Suffix uncompressed chunks with their Adler-32.
    #[must_use]
    pub fn with_chunk_checksums(mut self) -> Self {
        self.compress = false;
        self.chunk_checksums = true;
        self
    }

    /// Flip a bit inside the volume body so its Adler-32 no longer
    /// matches.
    #[must_use]
    pub fn corrupt_volume_checksum(mut self) -> Self {
        self.corrupt_volume_checksum = true;
        self
    }

    /// Drop `done` and point the final section past the end of the file.
    #[must_use]
    pub fn truncated_chain(mut self) -> Self {
        self.truncated_chain = true;
        self
    }

    #[must_use]
    pub fn case_field(mut self, flag: &str, value: &str) -> Self {
        self.case_fields.push((flag.to_owned(), value.to_owned()));
        self
    }

    /// Corrupt the stored Adler-32 of one chunk (requires
    /// `with_chunk_checksums`). Applied at build time.
    #[must_use]
    pub fn build_with_corrupt_chunk(self, chunk: usize) -> Vec<u8> {
        self.build_inner(Some(chunk))
    }

    #[must_use]
    pub fn build(self) -> Vec<u8> {
        self.build_inner(None)
    }

    fn build_inner(mut self, corrupt_chunk: Option<usize>) -> Vec<u8> {
        let bps = self.bytes_per_sector as usize;
        let spc = self.sectors_per_chunk as usize;
        let chunk_size = bps * spc;

        // Pad to a whole sector.
        let padded = self.data.len().div_ceil(bps) * bps;
        self.data.resize(padded, 0);
        let sector_count = (self.data.len() / bps) as u64;
        let chunk_count = self.data.len().div_ceil(chunk_size);

        let mut out = Vec::new();

        // 13-byte segment header.
        out.extend_from_slice(&[0x45, 0x56, 0x46, 0x09, 0x0D, 0x0A, 0xFF, 0x00]);
        out.push(1);
        out.extend_from_slice(&1_u16.to_le_bytes());
        out.extend_from_slice(&0_u16.to_le_bytes());

        // header section: zlib-compressed tab-separated case text.
        let flags: Vec<&str> = self.case_fields.iter().map(|(f, _)| f.as_str()).collect();
        let values: Vec<&str> = self.case_fields.iter().map(|(_, v)| v.as_str()).collect();
        let text = format!("1\nmain\n{}\n{}\n\n", flags.join("\t"), values.join("\t"));
        let header_body = zlib_compress(text.as_bytes());
        append_section(&mut out, "header", &header_body, None);

        // volume section: SMART layout.
        let mut volume_body = vec![0_u8; DISK_SMART_LEN];
        volume_body[0] = 1; // fixed media
        volume_body[4..8].copy_from_slice(&(chunk_count as u32).to_le_bytes());
        volume_body[8..12].copy_from_slice(&self.sectors_per_chunk.to_le_bytes());
        volume_body[12..16].copy_from_slice(&self.bytes_per_sector.to_le_bytes());
        volume_body[16..24].copy_from_slice(&sector_count.to_le_bytes());
        volume_body[24..28].copy_from_slice(&64_u32.to_le_bytes()); // cylinders
        volume_body[28..32].copy_from_slice(&255_u32.to_le_bytes()); // heads
        volume_body[32..36].copy_from_slice(&63_u32.to_le_bytes()); // sectors
        volume_body[36] = 0x01; // image flag
        volume_body[52] = u8::from(self.compress);
        volume_body[64..80].copy_from_slice(&[0xA5; 16]); // set GUID
        let sum = adler32_of(&volume_body[..DISK_SMART_LEN - 4]);
        volume_body[DISK_SMART_LEN - 4..].copy_from_slice(&sum.to_le_bytes());
        if self.corrupt_volume_checksum {
            volume_body[100] ^= 0xFF; // inside the checksummed span
        }
        append_section(&mut out, "volume", &volume_body, None);

        // sectors section: concatenated (possibly deflated) chunks.
        let mut sectors_body = Vec::new();
        let mut entry_words: Vec<u32> = Vec::with_capacity(chunk_count);
        for (i, chunk) in self.data.chunks(chunk_size).enumerate() {
            let relative = sectors_body.len() as u32;
            if self.compress {
                entry_words.push(relative | 0x8000_0000);
                sectors_body.extend_from_slice(&zlib_compress(chunk));
            } else {
                entry_words.push(relative);
                if self.chunk_checksums {
                    // Keep stored chunks full-sized so the trailing
                    // checksum stays unambiguous.
                    let mut full = chunk.to_vec();
                    full.resize(chunk_size, 0);
                    let mut sum = adler32_of(&full);
                    if corrupt_chunk == Some(i) {
                        sum ^= 0xDEAD;
                    }
                    sectors_body.extend_from_slice(&full);
                    sectors_body.extend_from_slice(&sum.to_le_bytes());
                } else {
                    sectors_body.extend_from_slice(chunk);
                }
            }
        }
        append_section(&mut out, "sectors", &sectors_body, None);

        // table + mirror.
        let mut table_body = vec![0_u8; 24 + entry_words.len() * 4];
        table_body[0..4].copy_from_slice(&(entry_words.len() as u32).to_le_bytes());
        let sum = adler32_of(&table_body[..20]);
        table_body[20..24].copy_from_slice(&sum.to_le_bytes());
        for (i, word) in entry_words.iter().enumerate() {
            table_body[24 + i * 4..28 + i * 4].copy_from_slice(&word.to_le_bytes());
        }
        if self.truncated_chain {
            // Final section in the file: next offset points past EOF and
            // no done section follows.
            let bogus_next = (out.len() + SECTION_DESCRIPTOR_LEN + table_body.len() + 4096) as u64;
            append_section(&mut out, "table", &table_body, Some(bogus_next));
            return out;
        }
        append_section(&mut out, "table", &table_body, None);
        append_section(&mut out, "table2", &table_body, None);

        // hash section: deterministic dummy MD5, zero SHA-1.
        let mut hash_body = vec![0_u8; 80];
        for (i, b) in hash_body.iter_mut().take(16).enumerate() {
            *b = 0x10 + i as u8;
        }
        let sum = adler32_of(&hash_body[..76]);
        hash_body[76..80].copy_from_slice(&sum.to_le_bytes());
        append_section(&mut out, "hash", &hash_body, None);

        // done: empty body, self-linked.
        let done_offset = out.len() as u64;
        let mut descriptor = [0_u8; SECTION_DESCRIPTOR_LEN];
        descriptor[..4].copy_from_slice(b"done");
        descriptor[16..24].copy_from_slice(&done_offset.to_le_bytes());
        descriptor[24..32].copy_from_slice(&(SECTION_DESCRIPTOR_LEN as u64).to_le_bytes());
        let sum = adler32_of(&descriptor[..72]);
        descriptor[72..76].copy_from_slice(&sum.to_le_bytes());
        out.extend_from_slice(&descriptor);

        out
    }
}

/// Append a descriptor + body, chaining `next` to the following offset
/// unless overridden.
fn append_section(out: &mut Vec<u8>, type_name: &str, body: &[u8], next_override: Option<u64>) {
    let offset = out.len() as u64;
    let size = (SECTION_DESCRIPTOR_LEN + body.len()) as u64;
    let next = next_override.unwrap_or(offset + size);

    let mut descriptor = [0_u8; SECTION_DESCRIPTOR_LEN];
    descriptor[..type_name.len()].copy_from_slice(type_name.as_bytes());
    descriptor[16..24].copy_from_slice(&next.to_le_bytes());
    descriptor[24..32].copy_from_slice(&size.to_le_bytes());
    let sum = adler32_of(&descriptor[..72]);
    descriptor[72..76].copy_from_slice(&sum.to_le_bytes());

    out.extend_from_slice(&descriptor);
    out.extend_from_slice(body);
}
