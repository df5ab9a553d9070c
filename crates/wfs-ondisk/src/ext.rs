use serde::{Deserialize, Serialize};
use wfs_types::{
    ensure_slice, read_fixed, read_le_u16, read_le_u32, trim_nul_padded, ParseError,
};

/// Superblock location relative to the start of the filesystem.
pub const EXT_SUPERBLOCK_OFFSET: u64 = 1024;
/// Size of the superblock region.
pub const EXT_SUPERBLOCK_SIZE: usize = 1024;
/// `0xEF53` at byte 56 of the superblock.
pub const EXT_SUPER_MAGIC: u16 = 0xEF53;
/// Root directory inode.
pub const EXT_ROOT_INODE: u32 = 2;

/// Compat feature: has a journal (EXT3+).
pub const EXT_FEATURE_COMPAT_HAS_JOURNAL: u32 = 0x0004;
/// Incompat feature: directory entries carry a file type byte.
pub const EXT_FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;
/// Incompat feature: extents (EXT4).
pub const EXT_FEATURE_INCOMPAT_EXTENTS: u32 = 0x0040;
/// Incompat feature: 64-bit block counts and wide group descriptors.
pub const EXT_FEATURE_INCOMPAT_64BIT: u32 = 0x0080;
/// Incompat feature: inline data in the inode.
pub const EXT_FEATURE_INCOMPAT_INLINE_DATA: u32 = 0x8000;

/// Inode flag: content is mapped by an extent tree.
pub const EXT_INODE_FLAG_EXTENTS: u32 = 0x0008_0000;
/// Inode flag: content is stored inline in `i_block`.
pub const EXT_INODE_FLAG_INLINE_DATA: u32 = 0x1000_0000;

/// Extent tree node magic.
pub const EXT_EXTENT_MAGIC: u16 = 0xF30A;

/// Mode bits.
pub const EXT_S_IFMT: u16 = 0xF000;
pub const EXT_S_IFDIR: u16 = 0x4000;
pub const EXT_S_IFREG: u16 = 0x8000;
pub const EXT_S_IFLNK: u16 = 0xA000;

/// Number of direct block pointers in `i_block`.
pub const EXT_DIRECT_BLOCKS: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtVariant {
    Ext2,
    Ext3,
    Ext4,
}

/// EXT superblock, 1024 bytes at offset 1024 from the filesystem start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtSuperblock {
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub first_data_block: u32,
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub first_ino: u32,
    pub rev_level: u32,
    pub state: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub uuid: [u8; 16],
    pub volume_name: String,
    pub desc_size: u16,
}

impl ExtSuperblock {
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < EXT_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != EXT_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let log_block_size = read_le_u32(region, 0x18)?;
        if log_block_size > 6 {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "shift larger than 6",
            });
        }
        let block_size = 1024_u32 << log_block_size;

        let feature_incompat = read_le_u32(region, 0x60)?;
        let blocks_lo = u64::from(read_le_u32(region, 0x04)?);
        let blocks_hi = if feature_incompat & EXT_FEATURE_INCOMPAT_64BIT != 0 {
            u64::from(read_le_u32(region, 0x150)?)
        } else {
            0
        };

        let rev_level = read_le_u32(region, 0x4C)?;
        let inode_size = if rev_level == 0 {
            128
        } else {
            read_le_u16(region, 0x58)?
        };

        let sb = Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: blocks_lo | (blocks_hi << 32),
            first_data_block: read_le_u32(region, 0x14)?,
            block_size,
            blocks_per_group: read_le_u32(region, 0x20)?,
            inodes_per_group: read_le_u32(region, 0x28)?,
            inode_size,
            first_ino: if rev_level == 0 {
                11
            } else {
                read_le_u32(region, 0x54)?
            },
            rev_level,
            state: read_le_u16(region, 0x3A)?,
            feature_compat: read_le_u32(region, 0x5C)?,
            feature_incompat,
            feature_ro_compat: read_le_u32(region, 0x64)?,
            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: trim_nul_padded(&read_fixed::<16>(region, 0x78)?),
            desc_size: read_le_u16(region, 0xFE)?,
        };
        sb.validate()?;
        Ok(sb)
    }

    fn validate(&self) -> Result<(), ParseError> {
        if self.blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "cannot be zero",
            });
        }
        if self.inodes_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "cannot be zero",
            });
        }
        if self.inode_size < 128 || !self.inode_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be a power of two >= 128",
            });
        }
        Ok(())
    }

    /// EXT4 when extents are enabled, EXT3 when a journal is present,
    /// EXT2 otherwise.
    #[must_use]
    pub fn variant(&self) -> ExtVariant {
        if self.feature_incompat & EXT_FEATURE_INCOMPAT_EXTENTS != 0 {
            ExtVariant::Ext4
        } else if self.feature_compat & EXT_FEATURE_COMPAT_HAS_JOURNAL != 0 {
            ExtVariant::Ext3
        } else {
            ExtVariant::Ext2
        }
    }

    #[must_use]
    pub fn is_64bit(&self) -> bool {
        self.feature_incompat & EXT_FEATURE_INCOMPAT_64BIT != 0
    }

    /// Bytes per group descriptor: 32 unless the 64-bit feature widens it.
    #[must_use]
    pub fn group_desc_size(&self) -> usize {
        if self.is_64bit() && self.desc_size >= 64 {
            usize::from(self.desc_size)
        } else {
            32
        }
    }

    /// Number of block groups.
    #[must_use]
    pub fn groups_count(&self) -> u32 {
        let data_blocks = self
            .blocks_count
            .saturating_sub(u64::from(self.first_data_block));
        u32::try_from(data_blocks.div_ceil(u64::from(self.blocks_per_group))).unwrap_or(u32::MAX)
    }
}

/// Block-group descriptor; only the inode table location matters to a
/// reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtGroupDesc {
    pub block_bitmap: u64,
    pub inode_bitmap: u64,
    pub inode_table: u64,
}

impl ExtGroupDesc {
    pub fn parse(raw: &[u8], wide: bool) -> Result<Self, ParseError> {
        let lo_table = u64::from(read_le_u32(raw, 0x08)?);
        let lo_block_bitmap = u64::from(read_le_u32(raw, 0x00)?);
        let lo_inode_bitmap = u64::from(read_le_u32(raw, 0x04)?);

        let (hi_block, hi_inode, hi_table) = if wide && raw.len() >= 0x2C {
            (
                u64::from(read_le_u32(raw, 0x20)?),
                u64::from(read_le_u32(raw, 0x24)?),
                u64::from(read_le_u32(raw, 0x28)?),
            )
        } else {
            (0, 0, 0)
        };

        Ok(Self {
            block_bitmap: lo_block_bitmap | (hi_block << 32),
            inode_bitmap: lo_inode_bitmap | (hi_inode << 32),
            inode_table: lo_table | (hi_table << 32),
        })
    }
}

/// On-disk inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtInode {
    pub mode: u16,
    pub uid: u16,
    pub size_lo: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u16,
    pub links_count: u16,
    pub flags: u32,
    pub block: [u8; 60],
    pub size_high: u32,
}

impl ExtInode {
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        if raw.len() < 128 {
            return Err(ParseError::InsufficientData {
                needed: 128,
                offset: 0,
                actual: raw.len(),
            });
        }
        Ok(Self {
            mode: read_le_u16(raw, 0)?,
            uid: read_le_u16(raw, 2)?,
            size_lo: read_le_u32(raw, 4)?,
            atime: read_le_u32(raw, 8)?,
            ctime: read_le_u32(raw, 12)?,
            mtime: read_le_u32(raw, 16)?,
            dtime: read_le_u32(raw, 20)?,
            gid: read_le_u16(raw, 24)?,
            links_count: read_le_u16(raw, 26)?,
            flags: read_le_u32(raw, 32)?,
            block: read_fixed::<60>(raw, 40)?,
            size_high: read_le_u32(raw, 108)?,
        })
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.mode & EXT_S_IFMT == EXT_S_IFDIR
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.mode & EXT_S_IFMT == EXT_S_IFREG
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.mode & EXT_S_IFMT == EXT_S_IFLNK
    }

    #[must_use]
    pub fn uses_extents(&self) -> bool {
        self.flags & EXT_INODE_FLAG_EXTENTS != 0
    }

    #[must_use]
    pub fn has_inline_data(&self) -> bool {
        self.flags & EXT_INODE_FLAG_INLINE_DATA != 0
    }

    /// File size; directories only use the low word.
    #[must_use]
    pub fn size(&self) -> u64 {
        if self.is_regular() {
            u64::from(self.size_lo) | (u64::from(self.size_high) << 32)
        } else {
            u64::from(self.size_lo)
        }
    }

    /// The `i_block` area interpreted as 15 block pointers (EXT2/3 map).
    #[must_use]
    pub fn block_pointers(&self) -> [u32; 15] {
        let mut out = [0_u32; 15];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = u32::from_le_bytes([
                self.block[i * 4],
                self.block[i * 4 + 1],
                self.block[i * 4 + 2],
                self.block[i * 4 + 3],
            ]);
        }
        out
    }
}

/// Extent tree node header (lives in `i_block` or an interior block).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtExtentHeader {
    pub entries: u16,
    pub max_entries: u16,
    pub depth: u16,
}

impl ExtExtentHeader {
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u16(raw, 0)?;
        if magic != EXT_EXTENT_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT_EXTENT_MAGIC),
                actual: u64::from(magic),
            });
        }
        Ok(Self {
            entries: read_le_u16(raw, 2)?,
            max_entries: read_le_u16(raw, 4)?,
            depth: read_le_u16(raw, 6)?,
        })
    }
}

/// Leaf extent: a run of contiguous physical blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtExtentLeaf {
    pub logical_block: u32,
    pub len: u16,
    pub unwritten: bool,
    pub physical_start: u64,
}

impl ExtExtentLeaf {
    /// Parse the `i`-th leaf entry following a node header at `base`.
    pub fn parse(raw: &[u8], base: usize, i: usize) -> Result<Self, ParseError> {
        let off = base + 12 + i * 12;
        let raw_len = read_le_u16(raw, off + 4)?;
        // Lengths above 32768 mark unwritten (preallocated) extents.
        let (len, unwritten) = if raw_len > 32768 {
            (raw_len - 32768, true)
        } else {
            (raw_len, false)
        };
        let hi = u64::from(read_le_u16(raw, off + 6)?);
        let lo = u64::from(read_le_u32(raw, off + 8)?);
        Ok(Self {
            logical_block: read_le_u32(raw, off)?,
            len,
            unwritten,
            physical_start: (hi << 32) | lo,
        })
    }
}

/// Interior extent index: points at a child node block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtExtentIndex {
    pub logical_block: u32,
    pub child_block: u64,
}

impl ExtExtentIndex {
    /// Parse the `i`-th index entry following a node header at `base`.
    pub fn parse(raw: &[u8], base: usize, i: usize) -> Result<Self, ParseError> {
        let off = base + 12 + i * 12;
        let lo = u64::from(read_le_u32(raw, off + 4)?);
        let hi = u64::from(read_le_u16(raw, off + 8)?);
        Ok(Self {
            logical_block: read_le_u32(raw, off)?,
            child_block: (hi << 32) | lo,
        })
    }
}

/// Variable-length directory record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtDirEntryRaw {
    pub inode: u32,
    pub rec_len: u16,
    pub file_type: u8,
    pub name: String,
}

impl ExtDirEntryRaw {
    /// Parse the record starting at `pos`; `rec_len` always advances the
    /// cursor, including over unused (inode 0) holes.
    pub fn parse(data: &[u8], pos: usize) -> Result<Self, ParseError> {
        ensure_slice(data, pos, 8)?;
        let inode = read_le_u32(data, pos)?;
        let rec_len = read_le_u16(data, pos + 4)?;
        let name_len = data[pos + 6] as usize;
        let file_type = data[pos + 7];

        if rec_len < 8 || usize::from(rec_len) % 4 != 0 {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "must be a multiple of four and at least eight",
            });
        }
        if usize::from(rec_len) < 8 + name_len {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "record shorter than its name",
            });
        }
        ensure_slice(data, pos, usize::from(rec_len))?;

        let name_bytes = &data[pos + 8..pos + 8 + name_len];
        Ok(Self {
            inode,
            rec_len,
            file_type,
            name: String::from_utf8_lossy(name_bytes).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn superblock_region(feature_compat: u32, feature_incompat: u32) -> Vec<u8> {
        let mut region = vec![0_u8; EXT_SUPERBLOCK_SIZE];
        region[0x00..0x04].copy_from_slice(&1024_u32.to_le_bytes()); // inodes
        region[0x04..0x08].copy_from_slice(&8192_u32.to_le_bytes()); // blocks
        region[0x14..0x18].copy_from_slice(&1_u32.to_le_bytes()); // first data block
        region[0x18..0x1C].copy_from_slice(&0_u32.to_le_bytes()); // 1 KiB blocks
        region[0x20..0x24].copy_from_slice(&8192_u32.to_le_bytes());
        region[0x28..0x2C].copy_from_slice(&1024_u32.to_le_bytes());
        region[0x38..0x3A].copy_from_slice(&EXT_SUPER_MAGIC.to_le_bytes());
        region[0x4C..0x50].copy_from_slice(&1_u32.to_le_bytes()); // rev 1
        region[0x54..0x58].copy_from_slice(&11_u32.to_le_bytes());
        region[0x58..0x5A].copy_from_slice(&128_u16.to_le_bytes());
        region[0x5C..0x60].copy_from_slice(&feature_compat.to_le_bytes());
        region[0x60..0x64].copy_from_slice(&feature_incompat.to_le_bytes());
        region[0x78..0x80].copy_from_slice(b"fixture\0");
        region
    }

    #[test]
    fn variant_classification() {
        let sb = ExtSuperblock::parse(&superblock_region(0, 0)).expect("sb");
        assert_eq!(sb.variant(), ExtVariant::Ext2);
        assert_eq!(sb.block_size, 1024);
        assert_eq!(sb.volume_name, "fixture");

        let sb = ExtSuperblock::parse(&superblock_region(EXT_FEATURE_COMPAT_HAS_JOURNAL, 0))
            .expect("sb");
        assert_eq!(sb.variant(), ExtVariant::Ext3);

        let sb = ExtSuperblock::parse(&superblock_region(
            EXT_FEATURE_COMPAT_HAS_JOURNAL,
            EXT_FEATURE_INCOMPAT_EXTENTS,
        ))
        .expect("sb");
        assert_eq!(sb.variant(), ExtVariant::Ext4);
    }

    #[test]
    fn reject_bad_magic_and_geometry() {
        let mut region = superblock_region(0, 0);
        region[0x38] = 0;
        assert!(matches!(
            ExtSuperblock::parse(&region),
            Err(ParseError::InvalidMagic { .. })
        ));

        let mut region = superblock_region(0, 0);
        region[0x28..0x2C].fill(0);
        assert!(ExtSuperblock::parse(&region).is_err());
    }

    #[test]
    fn group_desc_wide_and_narrow() {
        let mut raw = vec![0_u8; 64];
        raw[0x08..0x0C].copy_from_slice(&21_u32.to_le_bytes());
        let narrow = ExtGroupDesc::parse(&raw[..32], false).expect("desc");
        assert_eq!(narrow.inode_table, 21);

        raw[0x28..0x2C].copy_from_slice(&1_u32.to_le_bytes());
        let wide = ExtGroupDesc::parse(&raw, true).expect("desc");
        assert_eq!(wide.inode_table, (1_u64 << 32) | 21);
    }

    #[test]
    fn inode_size_and_kind() {
        let mut raw = vec![0_u8; 128];
        raw[0..2].copy_from_slice(&(EXT_S_IFREG | 0o644).to_le_bytes());
        raw[4..8].copy_from_slice(&4096_u32.to_le_bytes());
        raw[108..112].copy_from_slice(&1_u32.to_le_bytes());
        let inode = ExtInode::parse(&raw).expect("inode");
        assert!(inode.is_regular());
        assert_eq!(inode.size(), (1_u64 << 32) | 4096);

        raw[0..2].copy_from_slice(&(EXT_S_IFDIR | 0o755).to_le_bytes());
        let dir = ExtInode::parse(&raw).expect("inode");
        assert!(dir.is_directory());
        assert_eq!(dir.size(), 4096);
    }

    #[test]
    fn extent_header_and_leaf() {
        let mut block = vec![0_u8; 60];
        block[0..2].copy_from_slice(&EXT_EXTENT_MAGIC.to_le_bytes());
        block[2..4].copy_from_slice(&1_u16.to_le_bytes());
        block[4..6].copy_from_slice(&4_u16.to_le_bytes());
        block[6..8].copy_from_slice(&0_u16.to_le_bytes());
        // Leaf 0: logical 0, len 8, physical 100.
        block[12..16].copy_from_slice(&0_u32.to_le_bytes());
        block[16..18].copy_from_slice(&8_u16.to_le_bytes());
        block[20..24].copy_from_slice(&100_u32.to_le_bytes());

        let header = ExtExtentHeader::parse(&block).expect("header");
        assert_eq!(header.depth, 0);
        assert_eq!(header.entries, 1);

        let leaf = ExtExtentLeaf::parse(&block, 0, 0).expect("leaf");
        assert_eq!(leaf.logical_block, 0);
        assert_eq!(leaf.len, 8);
        assert!(!leaf.unwritten);
        assert_eq!(leaf.physical_start, 100);
    }

    #[test]
    fn dir_entry_walk_and_validation() {
        let mut data = vec![0_u8; 64];
        data[0..4].copy_from_slice(&2_u32.to_le_bytes());
        data[4..6].copy_from_slice(&12_u16.to_le_bytes());
        data[6] = 1;
        data[7] = 2;
        data[8] = b'.';

        data[12..16].copy_from_slice(&11_u32.to_le_bytes());
        data[16..18].copy_from_slice(&52_u16.to_le_bytes());
        data[18] = 5;
        data[19] = 1;
        data[20..25].copy_from_slice(b"hello");

        let dot = ExtDirEntryRaw::parse(&data, 0).expect("dot");
        assert_eq!(dot.name, ".");
        assert_eq!(dot.rec_len, 12);

        let hello = ExtDirEntryRaw::parse(&data, 12).expect("hello");
        assert_eq!(hello.name, "hello");
        assert_eq!(hello.inode, 11);

        // A rec_len that is not four-aligned is corruption.
        data[16..18].copy_from_slice(&13_u16.to_le_bytes());
        assert!(ExtDirEntryRaw::parse(&data, 12).is_err());
    }
}
