/// Builds a small NTFS volume: a boot sector, a contiguous MFT, and a
/// handful of records with resident and non-resident data.
///
/// Geometry: 512-byte sectors, 8 sectors per cluster (4 KiB), 1 KiB MFT
/// records, MFT at cluster 4. Directory trees are expressed through
/// resident `$INDEX_ROOT` attributes.
pub struct NtfsBuilder {
    files: Vec<NtfsNode>,
}

struct NtfsNode {
    /// Path components, e.g. `["dir", "data.bin"]`.
    path: Vec<String>,
    content: Vec<u8>,
}

const BPS: usize = 512;
const SPC: usize = 8;
const CLUSTER: usize = BPS * SPC;
const RECORD: usize = 1024;
const MFT_CLUSTER: u64 = 4;
const TOTAL_SECTORS: u64 = 8192;
/// First cluster handed to non-resident file content.
const DATA_CLUSTER_BASE: u64 = 100;
/// Resident storage limit: anything larger goes into data runs.
const RESIDENT_LIMIT: usize = 700;

/// Mid-2023 in FILETIME ticks.
const FILETIME: u64 = 133_300_000_000_000_000;

const ATTR_STANDARD_INFORMATION: u32 = 0x10;
const ATTR_FILE_NAME: u32 = 0x30;
const ATTR_DATA: u32 = 0x80;
const ATTR_INDEX_ROOT: u32 = 0x90;
/// `$FILE_NAME` flag bit marking a directory in index keys.
const FILE_NAME_FLAG_DIRECTORY: u32 = 0x1000_0000;

impl Default for NtfsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NtfsBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self { files: Vec::new() }
    }

    /// Add a file at `path` (components separated by `/`). Intermediate
    /// directories are created implicitly; at most one level deep.
    #[must_use]
    pub fn file(mut self, path: &str, content: &[u8]) -> Self {
        let components: Vec<String> = path
            .trim_matches('/')
            .split('/')
            .map(str::to_owned)
            .collect();
        assert!(
            (1..=2).contains(&components.len()),
            "builder supports root files and one directory level"
        );
        self.files.push(NtfsNode {
            path: components,
            content: content.to_vec(),
        });
        self
    }

    #[must_use]
    pub fn build(self) -> Vec<u8> {
        let mut volume = vec![0_u8; TOTAL_SECTORS as usize * BPS];

        // Assign record numbers: 0 = $MFT, 5 = root, children from 64.
        let mut next_record: u64 = 64;
        let mut next_data_cluster = DATA_CLUSTER_BASE;

        // directory name -> (record number, entries)
        let mut dirs: Vec<(String, u64, Vec<IndexChild>)> = Vec::new();
        let mut root_children: Vec<IndexChild> = Vec::new();
        let mut file_records: Vec<(u64, u64, String, Vec<u8>)> = Vec::new(); // (record, parent, name, content)

        for node in &self.files {
            match node.path.as_slice() {
                [name] => {
                    let record = next_record;
                    next_record += 1;
                    root_children.push(IndexChild {
                        name: name.clone(),
                        record,
                        is_dir: false,
                        size: node.content.len() as u64,
                    });
                    file_records.push((record, 5, name.clone(), node.content.clone()));
                }
                [dir, name] => {
                    let dir_record = match dirs.iter().position(|(d, _, _)| d == dir) {
                        Some(i) => dirs[i].1,
                        None => {
                            let record = next_record;
                            next_record += 1;
                            dirs.push((dir.clone(), record, Vec::new()));
                            root_children.push(IndexChild {
                                name: dir.clone(),
                                record,
                                is_dir: true,
                                size: 0,
                            });
                            record
                        }
                    };
                    let record = next_record;
                    next_record += 1;
                    let slot = dirs
                        .iter_mut()
                        .find(|(d, _, _)| d == dir)
                        .expect("directory just inserted");
                    slot.2.push(IndexChild {
                        name: name.clone(),
                        record,
                        is_dir: false,
                        size: node.content.len() as u64,
                    });
                    file_records.push((record, dir_record, name.clone(), node.content.clone()));
                }
                _ => unreachable!(),
            }
        }

        let mft_offset = MFT_CLUSTER as usize * CLUSTER;
        let write_record = |volume: &mut Vec<u8>, number: u64, record: Vec<u8>| {
            let offset = mft_offset + number as usize * RECORD;
            volume[offset..offset + RECORD].copy_from_slice(&record);
        };

        // $MFT itself (record 0): just enough to be a valid record.
        let mft_record = build_record(
            false,
            vec![
                attr_standard_info(),
                attr_file_name(5, "$MFT", false, 0),
            ],
        );
        write_record(&mut volume, 0, mft_record);

        // Root directory (record 5).
        let root_record = build_record(
            true,
            vec![
                attr_standard_info(),
                attr_file_name(5, ".", true, 0),
                attr_index_root(&root_children),
            ],
        );
        write_record(&mut volume, 5, root_record);

        // Directories.
        for (name, record, children) in &dirs {
            let dir_record = build_record(
                true,
                vec![
                    attr_standard_info(),
                    attr_file_name(5, name, true, 0),
                    attr_index_root(children),
                ],
            );
            write_record(&mut volume, *record, dir_record);
        }

        // Files.
        for (record, parent, name, content) in &file_records {
            let data_attr = if content.len() <= RESIDENT_LIMIT {
                attr_resident(ATTR_DATA, None, content)
            } else {
                let clusters = content.len().div_ceil(CLUSTER);
                let first = next_data_cluster;
                next_data_cluster += clusters as u64;
                let offset = first as usize * CLUSTER;
                volume[offset..offset + content.len()].copy_from_slice(content);
                attr_data_non_resident(first, clusters as u64, content.len() as u64)
            };
            let file_record = build_record(
                false,
                vec![
                    attr_standard_info(),
                    attr_file_name(*parent, name, false, content.len() as u64),
                    data_attr,
                ],
            );
            write_record(&mut volume, *record, file_record);
        }

        // Boot sector last, over the zeroed first cluster.
        volume[0] = 0xEB;
        volume[1] = 0x52;
        volume[2] = 0x90;
        volume[3..11].copy_from_slice(b"NTFS    ");
        volume[11..13].copy_from_slice(&(BPS as u16).to_le_bytes());
        volume[13] = SPC as u8;
        volume[21] = 0xF8;
        volume[40..48].copy_from_slice(&TOTAL_SECTORS.to_le_bytes());
        volume[48..56].copy_from_slice(&MFT_CLUSTER.to_le_bytes());
        volume[56..64].copy_from_slice(&2_u64.to_le_bytes());
        volume[64] = 0xF6_u8; // -10: 1 KiB records
        volume[68] = 1; // one cluster per index block
        volume[72..80].copy_from_slice(&0x1234_5678_9ABC_DEF0_u64.to_le_bytes());
        volume[510] = 0x55;
        volume[511] = 0xAA;

        volume
    }
}

struct IndexChild {
    name: String,
    record: u64,
    is_dir: bool,
    size: u64,
}

/// Assemble a 1 KiB `FILE` record with update-sequence fixups applied.
fn build_record(is_dir: bool, attrs: Vec<Vec<u8>>) -> Vec<u8> {
    let mut record = vec![0_u8; RECORD];
    record[..4].copy_from_slice(b"FILE");
    record[4..6].copy_from_slice(&48_u16.to_le_bytes()); // usa offset
    record[6..8].copy_from_slice(&3_u16.to_le_bytes()); // usn + 2 fixups
    record[16..18].copy_from_slice(&1_u16.to_le_bytes()); // sequence
    record[18..20].copy_from_slice(&1_u16.to_le_bytes()); // hard links
    record[20..22].copy_from_slice(&56_u16.to_le_bytes()); // first attribute
    let flags: u16 = 0x0001 | if is_dir { 0x0002 } else { 0 };
    record[22..24].copy_from_slice(&flags.to_le_bytes());
    record[28..32].copy_from_slice(&(RECORD as u32).to_le_bytes());

    let mut offset = 56;
    for attr in attrs {
        record[offset..offset + attr.len()].copy_from_slice(&attr);
        offset += attr.len();
    }
    record[offset..offset + 4].copy_from_slice(&0xFFFF_FFFF_u32.to_le_bytes());
    offset += 8;
    record[24..28].copy_from_slice(&(offset as u32).to_le_bytes()); // used size

    // Fixups: stash the true sector tails in the USA, stamp the USN.
    let usn = 0x0001_u16.to_le_bytes();
    record[48..50].copy_from_slice(&usn);
    for i in 0..2 {
        let tail = 510 + i * 512;
        let saved = [record[tail], record[tail + 1]];
        record[50 + i * 2..52 + i * 2].copy_from_slice(&saved);
        record[tail..tail + 2].copy_from_slice(&usn);
    }
    record
}

fn align8(len: usize) -> usize {
    (len + 7) & !7
}

/// Resident attribute with optional name.
fn attr_resident(attr_type: u32, name: Option<&str>, content: &[u8]) -> Vec<u8> {
    let name_units: Vec<u16> = name.unwrap_or("").encode_utf16().collect();
    let name_len = name_units.len();
    let name_offset = 24;
    let content_offset = align8(name_offset + name_len * 2);
    let total = align8(content_offset + content.len());

    let mut attr = vec![0_u8; total];
    attr[0..4].copy_from_slice(&attr_type.to_le_bytes());
    attr[4..8].copy_from_slice(&(total as u32).to_le_bytes());
    attr[8] = 0; // resident
    attr[9] = name_len as u8;
    attr[10..12].copy_from_slice(&(name_offset as u16).to_le_bytes());
    attr[16..20].copy_from_slice(&(content.len() as u32).to_le_bytes());
    attr[20..22].copy_from_slice(&(content_offset as u16).to_le_bytes());
    for (i, unit) in name_units.iter().enumerate() {
        attr[name_offset + i * 2..name_offset + i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
    }
    attr[content_offset..content_offset + content.len()].copy_from_slice(content);
    attr
}

fn attr_standard_info() -> Vec<u8> {
    let mut content = vec![0_u8; 48];
    content[0..8].copy_from_slice(&FILETIME.to_le_bytes());
    content[8..16].copy_from_slice(&(FILETIME + 10_000_000).to_le_bytes());
    content[16..24].copy_from_slice(&(FILETIME + 20_000_000).to_le_bytes());
    content[24..32].copy_from_slice(&(FILETIME + 30_000_000).to_le_bytes());
    content[32..36].copy_from_slice(&0x20_u32.to_le_bytes()); // archive
    attr_resident(ATTR_STANDARD_INFORMATION, None, &content)
}

/// `$FILE_NAME` content bytes.
fn file_name_content(parent: u64, name: &str, is_dir: bool, size: u64) -> Vec<u8> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let mut content = vec![0_u8; 66 + units.len() * 2];
    // Parent reference carries the parent's sequence number in the top
    // 16 bits.
    content[0..8].copy_from_slice(&(parent | (1_u64 << 48)).to_le_bytes());
    content[8..16].copy_from_slice(&FILETIME.to_le_bytes());
    content[16..24].copy_from_slice(&(FILETIME + 10_000_000).to_le_bytes());
    content[24..32].copy_from_slice(&(FILETIME + 20_000_000).to_le_bytes());
    content[32..40].copy_from_slice(&(FILETIME + 30_000_000).to_le_bytes());
    content[40..48].copy_from_slice(&size.next_multiple_of(CLUSTER as u64).to_le_bytes());
    content[48..56].copy_from_slice(&size.to_le_bytes());
    let flags = if is_dir { FILE_NAME_FLAG_DIRECTORY } else { 0x20 };
    content[56..60].copy_from_slice(&flags.to_le_bytes());
    content[64] = units.len() as u8;
    content[65] = 3; // Win32 + DOS namespace
    for (i, unit) in units.iter().enumerate() {
        content[66 + i * 2..68 + i * 2].copy_from_slice(&unit.to_le_bytes());
    }
    content
}

fn attr_file_name(parent: u64, name: &str, is_dir: bool, size: u64) -> Vec<u8> {
    attr_resident(ATTR_FILE_NAME, None, &file_name_content(parent, name, is_dir, size))
}

/// Resident `$INDEX_ROOT` ($I30) with one leaf node of entries.
fn attr_index_root(children: &[IndexChild]) -> Vec<u8> {
    let mut entries = Vec::new();
    for child in children {
        let key = file_name_content(5, &child.name, child.is_dir, child.size);
        let entry_len = align8(16 + key.len());
        let mut entry = vec![0_u8; entry_len];
        entry[0..8].copy_from_slice(&(child.record | (1_u64 << 48)).to_le_bytes());
        entry[8..10].copy_from_slice(&(entry_len as u16).to_le_bytes());
        entry[10..12].copy_from_slice(&(key.len() as u16).to_le_bytes());
        entry[16..16 + key.len()].copy_from_slice(&key);
        entries.extend_from_slice(&entry);
    }
    // End marker.
    let mut last = vec![0_u8; 16];
    last[8..10].copy_from_slice(&16_u16.to_le_bytes());
    last[12..14].copy_from_slice(&2_u16.to_le_bytes());
    entries.extend_from_slice(&last);

    let mut content = vec![0_u8; 32 + entries.len()];
    content[0..4].copy_from_slice(&ATTR_FILE_NAME.to_le_bytes()); // indexed attribute
    content[4..8].copy_from_slice(&1_u32.to_le_bytes()); // collation
    content[8..12].copy_from_slice(&(CLUSTER as u32).to_le_bytes());
    content[12] = 1;
    // Node header, relative to its own start at byte 16.
    content[16..20].copy_from_slice(&16_u32.to_le_bytes());
    content[20..24].copy_from_slice(&((16 + entries.len()) as u32).to_le_bytes());
    content[24..28].copy_from_slice(&((16 + entries.len()) as u32).to_le_bytes());
    content[32..].copy_from_slice(&entries);

    attr_resident(ATTR_INDEX_ROOT, Some("$I30"), &content)
}

/// Non-resident unnamed `$DATA` with one contiguous run.
fn attr_data_non_resident(first_cluster: u64, clusters: u64, real_size: u64) -> Vec<u8> {
    // Run header 0x?1: 1 length byte, enough offset bytes for the LCN.
    let mut runs = Vec::new();
    let offset_bytes: Vec<u8> = {
        let mut bytes = first_cluster.to_le_bytes().to_vec();
        while bytes.len() > 1 && bytes[bytes.len() - 1] == 0 && bytes[bytes.len() - 2] < 0x80 {
            bytes.pop();
        }
        bytes
    };
    assert!(clusters <= 0xFF, "fixture runs are at most 255 clusters");
    runs.push(((offset_bytes.len() as u8) << 4) | 1);
    runs.push(clusters as u8);
    runs.extend_from_slice(&offset_bytes);
    runs.push(0);

    let run_offset = 64;
    let total = align8(run_offset + runs.len());
    let mut attr = vec![0_u8; total];
    attr[0..4].copy_from_slice(&ATTR_DATA.to_le_bytes());
    attr[4..8].copy_from_slice(&(total as u32).to_le_bytes());
    attr[8] = 1; // non-resident
    attr[16..24].copy_from_slice(&0_u64.to_le_bytes()); // start VCN
    attr[24..32].copy_from_slice(&(clusters - 1).to_le_bytes()); // last VCN
    attr[32..34].copy_from_slice(&(run_offset as u16).to_le_bytes());
    attr[40..48].copy_from_slice(&(clusters * CLUSTER as u64).to_le_bytes());
    attr[48..56].copy_from_slice(&real_size.to_le_bytes());
    attr[56..64].copy_from_slice(&real_size.to_le_bytes());
    attr[run_offset..run_offset + runs.len()].copy_from_slice(&runs);
    attr
}
