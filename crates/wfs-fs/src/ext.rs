use crate::entry::{child_path, Entry, EntryKind, EntryMeta, Locator};
use crate::FilesystemKind;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use wfs_device::{SectorRead, SectorView};
use wfs_error::{Result, WfsError};
use wfs_types::{ByteOffset, CancelToken};
use wfs_ondisk::ext::{
    ExtDirEntryRaw, ExtExtentHeader, ExtExtentIndex, ExtExtentLeaf, ExtGroupDesc, ExtInode,
    ExtSuperblock, ExtVariant, EXT_ROOT_INODE, EXT_SUPERBLOCK_OFFSET, EXT_SUPERBLOCK_SIZE,
};

pub(crate) struct ExtFilesystem<'r> {
    view: SectorView<'r>,
    superblock: ExtSuperblock,
    variant: ExtVariant,
    block_size: u64,
    groups: Vec<ExtGroupDesc>,
    cancel: CancelToken,
    dir_cache: Mutex<HashMap<u32, Arc<Vec<Entry>>>>,
}

impl<'r> ExtFilesystem<'r> {
    pub(crate) fn open(view: SectorView<'r>, cancel: CancelToken) -> Result<Self> {
        let region = view.read_bytes(
            ByteOffset(EXT_SUPERBLOCK_OFFSET),
            EXT_SUPERBLOCK_SIZE as u64,
        )?;
        let superblock = ExtSuperblock::parse(&region)
            .map_err(|e| WfsError::FilesystemCorrupt(format!("EXT superblock: {e}")))?;
        let variant = superblock.variant();
        let block_size = u64::from(superblock.block_size);

        // Group descriptor table sits in the block after the superblock.
        let desc_size = superblock.group_desc_size();
        let groups_count = superblock.groups_count() as usize;
        let table_block = u64::from(superblock.first_data_block) + 1;
        let table = view.read_bytes(
            ByteOffset(table_block * block_size),
            (groups_count * desc_size) as u64,
        )?;
        let wide = desc_size >= 64;
        let mut groups = Vec::with_capacity(groups_count);
        for i in 0..groups_count {
            groups.push(
                ExtGroupDesc::parse(&table[i * desc_size..(i + 1) * desc_size], wide).map_err(
                    |e| WfsError::FilesystemCorrupt(format!("group descriptor {i}: {e}")),
                )?,
            );
        }

        debug!(
            target: "wfs::fs",
            event = "ext_open",
            variant = ?variant,
            block_size,
            groups = groups.len(),
            volume = %superblock.volume_name
        );
        Ok(Self {
            view,
            superblock,
            variant,
            block_size,
            groups,
            cancel,
            dir_cache: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn kind(&self) -> FilesystemKind {
        match self.variant {
            ExtVariant::Ext2 => FilesystemKind::Ext2,
            ExtVariant::Ext3 => FilesystemKind::Ext3,
            ExtVariant::Ext4 => FilesystemKind::Ext4,
        }
    }

    pub(crate) fn block_size(&self) -> u64 {
        self.block_size
    }

    fn read_block(&self, block: u64) -> Result<Vec<u8>> {
        self.view
            .read_bytes(ByteOffset(block * self.block_size), self.block_size)
    }

    fn inode(&self, number: u32) -> Result<ExtInode> {
        if number == 0 {
            return Err(WfsError::FilesystemCorrupt(
                "inode number zero referenced".to_owned(),
            ));
        }
        let index = u64::from(number - 1);
        let per_group = u64::from(self.superblock.inodes_per_group);
        let group = usize::try_from(index / per_group)
            .map_err(|_| WfsError::out_of_range("group index does not fit usize"))?;
        let Some(desc) = self.groups.get(group) else {
            return Err(WfsError::FilesystemCorrupt(format!(
                "inode {number} maps to nonexistent group {group}"
            )));
        };

        let inode_size = u64::from(self.superblock.inode_size);
        let offset = desc.inode_table * self.block_size + (index % per_group) * inode_size;
        let raw = self.view.read_bytes(ByteOffset(offset), inode_size)?;
        ExtInode::parse(&raw)
            .map_err(|e| WfsError::FilesystemCorrupt(format!("inode {number}: {e}")))
    }

    /// Resolve a logical block index through the classic 12+1+1+1 block
    /// map. Zero means a hole.
    fn mapped_block(&self, inode: &ExtInode, logical: u64) -> Result<u64> {
        let pointers = inode.block_pointers();
        let per_block = self.block_size / 4;

        if logical < 12 {
            return Ok(u64::from(pointers[logical as usize]));
        }
        let mut remaining = logical - 12;

        if remaining < per_block {
            return self.indirect_lookup(u64::from(pointers[12]), &[remaining]);
        }
        remaining -= per_block;

        if remaining < per_block * per_block {
            return self.indirect_lookup(
                u64::from(pointers[13]),
                &[remaining / per_block, remaining % per_block],
            );
        }
        remaining -= per_block * per_block;

        if remaining < per_block * per_block * per_block {
            return self.indirect_lookup(
                u64::from(pointers[14]),
                &[
                    remaining / (per_block * per_block),
                    (remaining / per_block) % per_block,
                    remaining % per_block,
                ],
            );
        }

        Err(WfsError::FilesystemCorrupt(format!(
            "logical block {logical} beyond triple indirection"
        )))
    }

    /// Follow a chain of indirection levels; each step picks one pointer
    /// out of a pointer block.
    fn indirect_lookup(&self, mut block: u64, steps: &[u64]) -> Result<u64> {
        for step in steps {
            if block == 0 {
                return Ok(0);
            }
            self.cancel.checkpoint()?;
            let table = self.read_block(block)?;
            let offset = usize::try_from(step * 4)
                .map_err(|_| WfsError::out_of_range("pointer offset does not fit usize"))?;
            block = u64::from(u32::from_le_bytes([
                table[offset],
                table[offset + 1],
                table[offset + 2],
                table[offset + 3],
            ]));
        }
        Ok(block)
    }

    /// Resolve a logical block through the extent tree rooted in
    /// `i_block`. Zero means a hole.
    fn extent_block(&self, inode: &ExtInode, logical: u64) -> Result<u64> {
        let logical = u32::try_from(logical).map_err(|_| {
            WfsError::FilesystemCorrupt("logical block beyond the extent address space".to_owned())
        })?;
        let root = inode.block.to_vec();
        self.extent_walk(&root, logical, 0)
    }

    fn extent_walk(&self, node: &[u8], logical: u32, depth_guard: u32) -> Result<u64> {
        if depth_guard > 8 {
            return Err(WfsError::FilesystemCorrupt(
                "extent tree deeper than eight levels".to_owned(),
            ));
        }
        let header = ExtExtentHeader::parse(node)
            .map_err(|e| WfsError::FilesystemCorrupt(format!("extent node: {e}")))?;

        if header.depth == 0 {
            for i in 0..usize::from(header.entries) {
                let leaf = ExtExtentLeaf::parse(node, 0, i)
                    .map_err(|e| WfsError::FilesystemCorrupt(format!("extent leaf: {e}")))?;
                let end = leaf.logical_block + u32::from(leaf.len);
                if logical >= leaf.logical_block && logical < end {
                    if leaf.unwritten {
                        return Ok(0);
                    }
                    return Ok(leaf.physical_start + u64::from(logical - leaf.logical_block));
                }
            }
            return Ok(0);
        }

        // Interior node: the child covering `logical` is the last index
        // whose first logical block does not exceed it.
        let mut child: Option<ExtExtentIndex> = None;
        for i in 0..usize::from(header.entries) {
            let index = ExtExtentIndex::parse(node, 0, i)
                .map_err(|e| WfsError::FilesystemCorrupt(format!("extent index: {e}")))?;
            if index.logical_block <= logical {
                child = Some(index);
            } else {
                break;
            }
        }
        let Some(index) = child else {
            return Ok(0);
        };
        self.cancel.checkpoint()?;
        let node = self.read_block(index.child_block)?;
        self.extent_walk(&node, logical, depth_guard + 1)
    }

    fn content_block(&self, inode: &ExtInode, logical: u64) -> Result<u64> {
        if inode.has_inline_data() {
            return Err(WfsError::Unsupported(
                "EXT inline data is not supported".to_owned(),
            ));
        }
        if inode.uses_extents() {
            self.extent_block(inode, logical)
        } else {
            self.mapped_block(inode, logical)
        }
    }

    /// Read a byte span of an inode's content. Holes read as zeros.
    fn read_inode_span(&self, inode: &ExtInode, offset: u64, len: u64) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }

        // Fast symlinks stash their target right in the block array.
        if inode.is_symlink() && inode.size() <= 60 && !inode.uses_extents() {
            let size = inode.size() as usize;
            let start = usize::try_from(offset)
                .map_err(|_| WfsError::out_of_range("offset does not fit usize"))?;
            let want = usize::try_from(len)
                .map_err(|_| WfsError::out_of_range("length does not fit usize"))?;
            if start + want > size {
                return Err(WfsError::out_of_range("read beyond symlink target"));
            }
            return Ok(inode.block[start..start + want].to_vec());
        }

        let mut out = Vec::with_capacity(usize::try_from(len).unwrap_or(0));
        let mut position = offset;
        let end = offset + len;

        while position < end {
            self.cancel.checkpoint()?;
            let logical = position / self.block_size;
            let in_block = position % self.block_size;
            let take = (self.block_size - in_block).min(end - position);

            let physical = self.content_block(inode, logical)?;
            if physical == 0 {
                out.resize(
                    out.len()
                        + usize::try_from(take)
                            .map_err(|_| WfsError::out_of_range("hole does not fit usize"))?,
                    0,
                );
            } else {
                let data = self
                    .view
                    .read_bytes(ByteOffset(physical * self.block_size + in_block), take)?;
                out.extend_from_slice(&data);
            }
            position += take;
        }
        Ok(out)
    }

    pub(crate) fn root_entry(&self) -> Result<Entry> {
        let inode = self.inode(EXT_ROOT_INODE)?;
        Ok(self.entry_from_inode(EXT_ROOT_INODE, &inode, String::new(), "/".to_owned()))
    }

    fn entry_from_inode(&self, number: u32, inode: &ExtInode, name: String, path: String) -> Entry {
        let kind = if inode.is_directory() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        Entry {
            meta: EntryMeta {
                name,
                path,
                size: if kind == EntryKind::Directory {
                    0
                } else {
                    inode.size()
                },
                kind,
                deleted: inode.mode == 0 || inode.dtime != 0,
                attributes: u32::from(inode.mode),
                created: epoch_datetime(inode.ctime),
                modified: epoch_datetime(inode.mtime),
                accessed: epoch_datetime(inode.atime),
            },
            locator: Locator::Ext { inode: number },
        }
    }

    pub(crate) fn entries_of(&self, dir: &Entry) -> Result<Arc<Vec<Entry>>> {
        let Locator::Ext { inode: number } = dir.locator else {
            return Err(WfsError::FilesystemCorrupt(
                "foreign entry handed to an EXT filesystem".to_owned(),
            ));
        };
        if let Some(cached) = self.dir_cache.lock().get(&number) {
            return Ok(Arc::clone(cached));
        }

        let inode = self.inode(number)?;
        if !inode.is_directory() {
            return Err(WfsError::FilesystemCorrupt(format!(
                "inode {number} is not a directory"
            )));
        }

        let data = self.read_inode_span(&inode, 0, u64::from(inode.size_lo))?;
        let mut entries = Vec::new();
        let mut pos = 0_usize;
        while pos + 8 <= data.len() {
            self.cancel.checkpoint()?;
            let raw = ExtDirEntryRaw::parse(&data, pos)
                .map_err(|e| WfsError::FilesystemCorrupt(format!("directory entry: {e}")))?;
            let rec_len = usize::from(raw.rec_len);

            // Unused slots and the dot entries are skipped, but their
            // record length still advances the walk.
            if raw.inode != 0 && raw.name != "." && raw.name != ".." {
                let child = self.inode(raw.inode)?;
                entries.push(self.entry_from_inode(
                    raw.inode,
                    &child,
                    raw.name.clone(),
                    child_path(&dir.meta.path, &raw.name),
                ));
            }
            pos += rec_len;
        }

        let entries = Arc::new(entries);
        self.dir_cache.lock().insert(number, Arc::clone(&entries));
        Ok(entries)
    }

    pub(crate) fn read_span(&self, file: &Entry, offset: u64, len: u64) -> Result<Vec<u8>> {
        let Locator::Ext { inode: number } = file.locator else {
            return Err(WfsError::FilesystemCorrupt(
                "foreign entry handed to an EXT filesystem".to_owned(),
            ));
        };
        let inode = self.inode(number)?;
        self.read_inode_span(&inode, offset, len)
    }
}

/// Unix epoch seconds to `DateTime<Utc>`; zero means "not set".
fn epoch_datetime(seconds: u32) -> Option<DateTime<Utc>> {
    if seconds == 0 {
        return None;
    }
    DateTime::from_timestamp(i64::from(seconds), 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_datetime_zero_is_unset() {
        assert_eq!(epoch_datetime(0), None);
        assert_eq!(
            epoch_datetime(1_700_000_000).expect("timestamp").timestamp(),
            1_700_000_000
        );
    }
}
