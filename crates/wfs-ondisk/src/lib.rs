#![forbid(unsafe_code)]
//! On-disk structure parsers.
//!
//! Pure `&[u8]` to struct decoding with no I/O: partition tables (MBR,
//! GPT), FAT boot sectors and directory records, NTFS boot sectors, MFT
//! records and index nodes, and EXT superblocks, group descriptors,
//! inodes, and directory entries. All multi-byte integers are
//! little-endian unless a format says otherwise.

pub mod ext;
pub mod fat;
pub mod gpt;
pub mod mbr;
pub mod ntfs;

pub use ext::{
    ExtDirEntryRaw, ExtExtentHeader, ExtExtentIndex, ExtExtentLeaf, ExtGroupDesc, ExtInode,
    ExtSuperblock, ExtVariant,
};
pub use fat::{FatBootSector, FatDirEntryRaw, FatLfnEntryRaw, FatVariant};
pub use gpt::{GptHeader, GptPartitionEntry};
pub use mbr::{Mbr, MbrPartitionEntry};
pub use ntfs::{
    AttrContent, DataRun, FileNameAttr, IndexEntry, IndexNodeHeader, IndexRoot, MftAttribute,
    MftRecordHeader, NtfsBootSector, StandardInfo,
};
