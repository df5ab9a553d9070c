/// Builds a one-group EXT2/3/4 volume with 1 KiB blocks.
///
/// Layout: block 0 boot area, block 1 superblock, block 2 group
/// descriptors, blocks 3/4 bitmaps, blocks 5-8 the inode table
/// (32 inodes of 128 bytes), data from block 9. The root directory
/// occupies block 9; file content is allocated sequentially after it.
pub struct ExtBuilder {
    flavor: ExtFlavor,
    root_files: Vec<(String, Vec<u8>)>,
    subdirs: Vec<(String, Vec<(String, Vec<u8>)>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtFlavor {
    Ext2,
    Ext3,
    Ext4,
}

const BLOCK: usize = 1024;
const TOTAL_BLOCKS: u32 = 2048;
const INODES: u32 = 32;
const INODE_SIZE: usize = 128;
const INODE_TABLE_BLOCK: u32 = 5;
const FIRST_DATA_BLOCK_NO: u32 = 9;
const ROOT_INODE: u32 = 2;
const FIRST_FILE_INODE: u32 = 11;

const EPOCH: u32 = 1_700_000_000;

const S_IFDIR: u16 = 0x4000;
const S_IFREG: u16 = 0x8000;
const FLAG_EXTENTS: u32 = 0x0008_0000;
const INCOMPAT_FILETYPE: u32 = 0x0002;
const INCOMPAT_EXTENTS: u32 = 0x0040;
const COMPAT_HAS_JOURNAL: u32 = 0x0004;
const EXTENT_MAGIC: u16 = 0xF30A;

impl ExtBuilder {
    #[must_use]
    pub fn new(flavor: ExtFlavor) -> Self {
        Self {
            flavor,
            root_files: Vec::new(),
            subdirs: Vec::new(),
        }
    }

    #[must_use]
    pub fn file(mut self, name: &str, content: &[u8]) -> Self {
        self.root_files.push((name.to_owned(), content.to_vec()));
        self
    }

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
        let mut volume = vec![0_u8; TOTAL_BLOCKS as usize * BLOCK];
        let mut next_block: u32 = FIRST_DATA_BLOCK_NO;
        let mut next_inode: u32 = FIRST_FILE_INODE;

        let root_dir_block = next_block;
        next_block += 1;

        struct Dirent {
            inode: u32,
            file_type: u8,
            name: String,
        }

        let mut root_entries: Vec<Dirent> = vec![
            Dirent {
                inode: ROOT_INODE,
                file_type: 2,
                name: ".".to_owned(),
            },
            Dirent {
                inode: ROOT_INODE,
                file_type: 2,
                name: "..".to_owned(),
            },
        ];

        let use_extents = self.flavor == ExtFlavor::Ext4;

        // Writes one inode into the table.
        let write_inode = |volume: &mut Vec<u8>,
                           inode: u32,
                           mode: u16,
                           size: u64,
                           blocks: &[u32]| {
            let offset =
                INODE_TABLE_BLOCK as usize * BLOCK + (inode as usize - 1) * INODE_SIZE;
            let raw = &mut volume[offset..offset + INODE_SIZE];
            raw[0..2].copy_from_slice(&mode.to_le_bytes());
            raw[4..8].copy_from_slice(&(size as u32).to_le_bytes());
            raw[8..12].copy_from_slice(&EPOCH.to_le_bytes()); // atime
            raw[12..16].copy_from_slice(&(EPOCH - 100).to_le_bytes()); // ctime
            raw[16..20].copy_from_slice(&(EPOCH - 50).to_le_bytes()); // mtime
            raw[26..28].copy_from_slice(&1_u16.to_le_bytes()); // links
            let sector_count = (blocks.len() * (BLOCK / 512)) as u32;
            raw[28..32].copy_from_slice(&sector_count.to_le_bytes());
            raw[108..112].copy_from_slice(&((size >> 32) as u32).to_le_bytes());

            if use_extents && mode & S_IFREG != 0 {
                // Depth-0 extent tree: contiguous runs as leaves.
                let mut runs: Vec<(u32, u32, u16)> = Vec::new(); // (logical, physical, len)
                for (i, block) in blocks.iter().enumerate() {
                    match runs.last_mut() {
                        Some((_, physical, len))
                            if *physical + u32::from(*len) == *block =>
                        {
                            *len += 1;
                        }
                        _ => runs.push((i as u32, *block, 1)),
                    }
                }
                assert!(runs.len() <= 4, "extent fixture needs at most 4 runs");
                raw[40..42].copy_from_slice(&EXTENT_MAGIC.to_le_bytes());
                raw[42..44].copy_from_slice(&(runs.len() as u16).to_le_bytes());
                raw[44..46].copy_from_slice(&4_u16.to_le_bytes());
                raw[46..48].copy_from_slice(&0_u16.to_le_bytes()); // depth
                for (i, (logical, physical, len)) in runs.iter().enumerate() {
                    let base = 52 + i * 12;
                    raw[base..base + 4].copy_from_slice(&logical.to_le_bytes());
                    raw[base + 4..base + 6].copy_from_slice(&len.to_le_bytes());
                    raw[base + 8..base + 12].copy_from_slice(&physical.to_le_bytes());
                }
                raw[32..36].copy_from_slice(&FLAG_EXTENTS.to_le_bytes());
            } else {
                assert!(blocks.len() <= 12 + BLOCK / 4, "fixture exceeds single indirection");
                for (i, block) in blocks.iter().take(12).enumerate() {
                    raw[40 + i * 4..44 + i * 4].copy_from_slice(&block.to_le_bytes());
                }
                // The thirteenth pointer is filled by the caller when an
                // indirect block is in play.
            }
        };

        // Directory data writer: classic variable-length records, last
        // record stretched to the end of the block.
        let write_dir_block = |volume: &mut Vec<u8>, block: u32, entries: &[Dirent]| {
            let base = block as usize * BLOCK;
            let mut pos = 0_usize;
            for (i, entry) in entries.iter().enumerate() {
                let name_bytes = entry.name.as_bytes();
                let needed = (8 + name_bytes.len() + 3) & !3;
                let rec_len = if i + 1 == entries.len() {
                    BLOCK - pos
                } else {
                    needed
                };
                let raw = &mut volume[base + pos..base + pos + 8 + name_bytes.len()];
                raw[0..4].copy_from_slice(&entry.inode.to_le_bytes());
                raw[4..6].copy_from_slice(&(rec_len as u16).to_le_bytes());
                raw[6] = name_bytes.len() as u8;
                raw[7] = entry.file_type;
                raw[8..].copy_from_slice(name_bytes);
                pos += rec_len;
            }
        };

        // Allocate file content, returning the block list (with an
        // indirect block appended to the map when needed).
        let place_content = |volume: &mut Vec<u8>,
                                 next_block: &mut u32,
                                 content: &[u8]|
         -> (Vec<u32>, Option<(u32, Vec<u32>)>) {
            let count = content.len().div_ceil(BLOCK);
            let mut blocks = Vec::with_capacity(count);
            for i in 0..count {
                let block = *next_block;
                *next_block += 1;
                blocks.push(block);
                let chunk = &content[i * BLOCK..content.len().min((i + 1) * BLOCK)];
                let offset = block as usize * BLOCK;
                volume[offset..offset + chunk.len()].copy_from_slice(chunk);
            }
            if use_extents || blocks.len() <= 12 {
                (blocks, None)
            } else {
                let indirect_block = *next_block;
                *next_block += 1;
                let overflow: Vec<u32> = blocks[12..].to_vec();
                let offset = indirect_block as usize * BLOCK;
                for (i, block) in overflow.iter().enumerate() {
                    volume[offset + i * 4..offset + i * 4 + 4]
                        .copy_from_slice(&block.to_le_bytes());
                }
                (blocks, Some((indirect_block, overflow)))
            }
        };

        // Root files.
        for (name, content) in &self.root_files {
            let inode = next_inode;
            next_inode += 1;
            let (blocks, indirect) = place_content(&mut volume, &mut next_block, content);
            write_inode(
                &mut volume,
                inode,
                S_IFREG | 0o644,
                content.len() as u64,
                &blocks,
            );
            if let Some((indirect_block, _)) = indirect {
                let offset =
                    INODE_TABLE_BLOCK as usize * BLOCK + (inode as usize - 1) * INODE_SIZE;
                volume[offset + 40 + 12 * 4..offset + 40 + 13 * 4]
                    .copy_from_slice(&indirect_block.to_le_bytes());
            }
            root_entries.push(Dirent {
                inode,
                file_type: 1,
                name: name.clone(),
            });
        }

        // Subdirectories.
        for (dir_name, files) in &self.subdirs {
            let dir_inode = next_inode;
            next_inode += 1;
            let dir_block = next_block;
            next_block += 1;

            let mut entries: Vec<Dirent> = vec![
                Dirent {
                    inode: dir_inode,
                    file_type: 2,
                    name: ".".to_owned(),
                },
                Dirent {
                    inode: ROOT_INODE,
                    file_type: 2,
                    name: "..".to_owned(),
                },
            ];
            for (name, content) in files {
                let inode = next_inode;
                next_inode += 1;
                let (blocks, indirect) = place_content(&mut volume, &mut next_block, content);
                write_inode(
                    &mut volume,
                    inode,
                    S_IFREG | 0o644,
                    content.len() as u64,
                    &blocks,
                );
                if let Some((indirect_block, _)) = indirect {
                    let offset =
                        INODE_TABLE_BLOCK as usize * BLOCK + (inode as usize - 1) * INODE_SIZE;
                    volume[offset + 40 + 12 * 4..offset + 40 + 13 * 4]
                        .copy_from_slice(&indirect_block.to_le_bytes());
                }
                entries.push(Dirent {
                    inode,
                    file_type: 1,
                    name: name.clone(),
                });
            }
            write_dir_block(&mut volume, dir_block, &entries);
            // Directory inodes always use the classic block map; the
            // kernel does the same for small ext4 directories without
            // the extents inode flag forced on.
            write_inode(
                &mut volume,
                dir_inode,
                S_IFDIR | 0o755,
                BLOCK as u64,
                &[dir_block],
            );
            root_entries.push(Dirent {
                inode: dir_inode,
                file_type: 2,
                name: dir_name.clone(),
            });
        }

        write_dir_block(&mut volume, root_dir_block, &root_entries);
        write_inode(
            &mut volume,
            ROOT_INODE,
            S_IFDIR | 0o755,
            BLOCK as u64,
            &[root_dir_block],
        );

        assert!(next_block <= TOTAL_BLOCKS, "fixture exceeds the volume");

        // Group descriptor (block 2).
        let gd = 2 * BLOCK;
        volume[gd..gd + 4].copy_from_slice(&3_u32.to_le_bytes()); // block bitmap
        volume[gd + 4..gd + 8].copy_from_slice(&4_u32.to_le_bytes()); // inode bitmap
        volume[gd + 8..gd + 12].copy_from_slice(&INODE_TABLE_BLOCK.to_le_bytes());

        // Superblock (block 1).
        let sb = BLOCK;
        let (compat, incompat) = match self.flavor {
            ExtFlavor::Ext2 => (0, INCOMPAT_FILETYPE),
            ExtFlavor::Ext3 => (COMPAT_HAS_JOURNAL, INCOMPAT_FILETYPE),
            ExtFlavor::Ext4 => (
                COMPAT_HAS_JOURNAL,
                INCOMPAT_FILETYPE | INCOMPAT_EXTENTS,
            ),
        };
        volume[sb..sb + 4].copy_from_slice(&INODES.to_le_bytes());
        volume[sb + 4..sb + 8].copy_from_slice(&TOTAL_BLOCKS.to_le_bytes());
        volume[sb + 0x14..sb + 0x18].copy_from_slice(&1_u32.to_le_bytes()); // first data block
        volume[sb + 0x18..sb + 0x1C].copy_from_slice(&0_u32.to_le_bytes()); // 1 KiB blocks
        volume[sb + 0x20..sb + 0x24].copy_from_slice(&8192_u32.to_le_bytes()); // blocks/group
        volume[sb + 0x28..sb + 0x2C].copy_from_slice(&INODES.to_le_bytes()); // inodes/group
        volume[sb + 0x38..sb + 0x3A].copy_from_slice(&0xEF53_u16.to_le_bytes());
        volume[sb + 0x3A..sb + 0x3C].copy_from_slice(&1_u16.to_le_bytes()); // clean
        volume[sb + 0x4C..sb + 0x50].copy_from_slice(&1_u32.to_le_bytes()); // rev 1
        volume[sb + 0x54..sb + 0x58].copy_from_slice(&FIRST_FILE_INODE.to_le_bytes());
        volume[sb + 0x58..sb + 0x5A].copy_from_slice(&(INODE_SIZE as u16).to_le_bytes());
        volume[sb + 0x5C..sb + 0x60].copy_from_slice(&compat.to_le_bytes());
        volume[sb + 0x60..sb + 0x64].copy_from_slice(&incompat.to_le_bytes());
        volume[sb + 0x68..sb + 0x78].copy_from_slice(&[0xEE; 16]); // uuid
        volume[sb + 0x78..sb + 0x80].copy_from_slice(b"witness\0");

        volume
    }
}
