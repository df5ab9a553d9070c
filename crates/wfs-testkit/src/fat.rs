/// Builds a minimal but structurally valid FAT32 volume.
///
/// Geometry: 512-byte sectors, one sector per cluster, 32 reserved
/// sectors, two FATs, and enough clusters (66 000) to classify as
/// FAT32. Root directory lives in cluster 2; files and directories are
/// allocated sequentially from cluster 3.
pub struct Fat32Builder {
    root_files: Vec<(String, Vec<u8>)>,
    subdirs: Vec<(String, Vec<(String, Vec<u8>)>)>,
}

const BPS: usize = 512;
const RESERVED: usize = 32;
const NUM_FATS: usize = 2;
const CLUSTERS: usize = 66_000;
const ROOT_CLUSTER: u32 = 2;
const EOC: u32 = 0x0FFF_FFFF;

/// 2024-03-15 and 12:30:10 in DOS date/time encoding.
const DOS_DATE: u16 = (44 << 9) | (3 << 5) | 15;
const DOS_TIME: u16 = (12 << 11) | (30 << 5) | 5;

impl Default for Fat32Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Fat32Builder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            root_files: Vec::new(),
            subdirs: Vec::new(),
        }
    }

    /// Add a file to the root directory. Names that do not fit plain
    /// 8.3 get long-file-name components.
    #[must_use]
    pub fn file(mut self, name: &str, content: &[u8]) -> Self {
        self.root_files.push((name.to_owned(), content.to_vec()));
        self
    }

    /// Add a subdirectory with its own files.
    #[must_use]
    pub fn dir(mut self, name: &str, files: &[(&str, &[u8])]) -> Self {
        self.subdirs.push((
            name.to_owned(),
            files
                .iter()
                .map(|(n, c)| ((*n).to_owned(), c.to_vec()))
                .collect(),
        ));
        self
    }

    #[must_use]
    pub fn build(self) -> Vec<u8> {
        let fat_entries = CLUSTERS + 2;
        let spf = (fat_entries * 4).div_ceil(BPS);
        let data_start = RESERVED + NUM_FATS * spf;
        let total_sectors = data_start + CLUSTERS;

        let mut layout = Layout {
            volume: vec![0_u8; total_sectors * BPS],
            fat: vec![0_u32; fat_entries],
            next_free: 3,
            data_start,
            alias_counter: 1,
        };
        layout.fat[0] = 0x0FFF_FFF8;
        layout.fat[1] = EOC;
        layout.fat[ROOT_CLUSTER as usize] = EOC;

        let mut root_records: Vec<Vec<[u8; 32]>> = Vec::new();

        for (name, content) in &self.root_files {
            root_records.push(layout.place_file(name, content));
        }

        for (dir_name, files) in &self.subdirs {
            let dir_cluster = layout.allocate(1);
            let (lfn, dir_entry) =
                make_entry(dir_name, dir_cluster, 0, true, &mut layout.alias_counter);

            let mut dir_records: Vec<[u8; 32]> = Vec::new();
            dir_records.push(dot_entry(b".          ", dir_cluster));
            dir_records.push(dot_entry(b"..         ", 0));
            for (name, content) in files {
                dir_records.extend(layout.place_file(name, content));
            }
            assert!(
                dir_records.len() <= BPS / 32,
                "directory fixture overflows one cluster"
            );
            let offset = layout.cluster_offset(dir_cluster);
            for (i, record) in dir_records.iter().enumerate() {
                layout.volume[offset + i * 32..offset + (i + 1) * 32].copy_from_slice(record);
            }

            let mut run = lfn;
            run.push(dir_entry);
            root_records.push(run);
        }

        // Root directory cluster.
        let root_offset = layout.cluster_offset(ROOT_CLUSTER);
        let mut cursor = 0;
        for run in &root_records {
            for record in run {
                layout.volume[root_offset + cursor..root_offset + cursor + 32]
                    .copy_from_slice(record);
                cursor += 32;
            }
        }
        assert!(cursor <= BPS, "root directory fixture overflows one cluster");

        // Boot sector.
        let volume = &mut layout.volume;
        volume[0] = 0xEB;
        volume[1] = 0x58;
        volume[2] = 0x90;
        volume[3..11].copy_from_slice(b"MSDOS5.0");
        volume[11..13].copy_from_slice(&(BPS as u16).to_le_bytes());
        volume[13] = 1;
        volume[14..16].copy_from_slice(&(RESERVED as u16).to_le_bytes());
        volume[16] = NUM_FATS as u8;
        volume[21] = 0xF8;
        volume[32..36].copy_from_slice(&(total_sectors as u32).to_le_bytes());
        volume[36..40].copy_from_slice(&(spf as u32).to_le_bytes());
        volume[44..48].copy_from_slice(&ROOT_CLUSTER.to_le_bytes());
        volume[82..90].copy_from_slice(b"FAT32   ");
        volume[510] = 0x55;
        volume[511] = 0xAA;

        // Both FAT copies.
        for copy in 0..NUM_FATS {
            let offset = (RESERVED + copy * spf) * BPS;
            for (i, entry) in layout.fat.iter().enumerate() {
                volume[offset + i * 4..offset + i * 4 + 4].copy_from_slice(&entry.to_le_bytes());
            }
        }

        layout.volume
    }
}

/// Mutable build state: the raw volume, the FAT, and allocation
/// cursors.
struct Layout {
    volume: Vec<u8>,
    fat: Vec<u32>,
    next_free: u32,
    data_start: usize,
    alias_counter: u32,
}

impl Layout {
    fn allocate(&mut self, clusters: usize) -> u32 {
        let first = self.next_free;
        for i in 0..clusters {
            let this = self.next_free + i as u32;
            self.fat[this as usize] = if i + 1 == clusters { EOC } else { this + 1 };
        }
        self.next_free += clusters as u32;
        first
    }

    fn cluster_offset(&self, cluster: u32) -> usize {
        (self.data_start + (cluster as usize - 2)) * BPS
    }

    /// Allocate and write file content, returning its directory records
    /// (LFN components followed by the short entry).
    fn place_file(&mut self, name: &str, content: &[u8]) -> Vec<[u8; 32]> {
        let clusters = content.len().div_ceil(BPS).max(1);
        let first = self.allocate(clusters);
        let offset = self.cluster_offset(first);
        self.volume[offset..offset + content.len()].copy_from_slice(content);

        let (mut records, entry) = make_entry(
            name,
            first,
            content.len() as u32,
            false,
            &mut self.alias_counter,
        );
        records.push(entry);
        records
    }
}

fn dot_entry(name: &[u8; 11], cluster: u32) -> [u8; 32] {
    let mut record = [0_u8; 32];
    record[..11].copy_from_slice(name);
    record[11] = 0x10;
    record[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
    record[26..28].copy_from_slice(&((cluster & 0xFFFF) as u16).to_le_bytes());
    record
}

/// Build the short entry (and LFN components when needed) for `name`.
fn make_entry(
    name: &str,
    cluster: u32,
    size: u32,
    is_dir: bool,
    alias_counter: &mut u32,
) -> (Vec<[u8; 32]>, [u8; 32]) {
    let (short, needs_lfn) = short_name_for(name, alias_counter);

    let mut record = [0_u8; 32];
    record[..11].copy_from_slice(&short);
    record[11] = if is_dir { 0x10 } else { 0x20 };
    record[14..16].copy_from_slice(&DOS_TIME.to_le_bytes());
    record[16..18].copy_from_slice(&DOS_DATE.to_le_bytes());
    record[18..20].copy_from_slice(&DOS_DATE.to_le_bytes());
    record[22..24].copy_from_slice(&DOS_TIME.to_le_bytes());
    record[24..26].copy_from_slice(&DOS_DATE.to_le_bytes());
    record[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
    record[26..28].copy_from_slice(&((cluster & 0xFFFF) as u16).to_le_bytes());
    record[28..32].copy_from_slice(&size.to_le_bytes());

    let lfn = if needs_lfn {
        lfn_components(name, &short)
    } else {
        Vec::new()
    };
    (lfn, record)
}

/// Uppercase 8.3 encoding; falls back to a `~N` alias when the name
/// does not fit.
fn short_name_for(name: &str, alias_counter: &mut u32) -> ([u8; 11], bool) {
    let mut short = [0x20_u8; 11];
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) => (stem, ext),
        None => (name, ""),
    };

    let plain = name == name.to_ascii_uppercase()
        && stem.len() <= 8
        && ext.len() <= 3
        && !stem.is_empty()
        && stem.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && ext.chars().all(|c| c.is_ascii_alphanumeric());

    if plain {
        for (i, b) in stem.bytes().take(8).enumerate() {
            short[i] = b;
        }
        for (i, b) in ext.bytes().take(3).enumerate() {
            short[8 + i] = b;
        }
        (short, false)
    } else {
        let filtered: Vec<u8> = stem
            .to_ascii_uppercase()
            .bytes()
            .filter(|b| b.is_ascii_alphanumeric())
            .take(6)
            .collect();
        let alias = format!("{}~{}", String::from_utf8_lossy(&filtered), *alias_counter);
        *alias_counter += 1;
        for (i, b) in alias.bytes().take(8).enumerate() {
            short[i] = b;
        }
        for (i, b) in ext
            .to_ascii_uppercase()
            .bytes()
            .filter(|b| b.is_ascii_alphanumeric())
            .take(3)
            .enumerate()
        {
            short[8 + i] = b;
        }
        (short, true)
    }
}

/// Split `name` into 13-unit LFN components, last component first as
/// they appear on disk.
fn lfn_components(name: &str, short: &[u8; 11]) -> Vec<[u8; 32]> {
    let checksum = short.iter().fold(0_u8, |sum, b| {
        ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(*b)
    });

    let mut units: Vec<u16> = name.encode_utf16().collect();
    units.push(0);
    while units.len() % 13 != 0 {
        units.push(0xFFFF);
    }

    let unit_offsets = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];
    let count = units.len() / 13;
    let mut components = Vec::with_capacity(count);
    // Highest sequence number first, as directories store them.
    for seq in (1..=count).rev() {
        let mut record = [0_u8; 32];
        record[0] = seq as u8 | if seq == count { 0x40 } else { 0 };
        record[11] = 0x0F;
        record[13] = checksum;
        for (i, offset) in unit_offsets.iter().enumerate() {
            let unit = units[(seq - 1) * 13 + i];
            record[*offset..offset + 2].copy_from_slice(&unit.to_le_bytes());
        }
        components.push(record);
    }
    components
}
