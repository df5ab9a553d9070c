use chrono::{DateTime, Utc};
use serde::Serialize;

/// Closed variant: every filesystem produces files and directories,
/// nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryKind {
    File,
    Directory,
}

/// Shared capability set of a filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryMeta {
    pub name: String,
    /// Absolute path within the filesystem, `/`-separated.
    pub path: String,
    /// Size in bytes; zero for directories.
    pub size: u64,
    pub kind: EntryKind,
    pub deleted: bool,
    /// Filesystem-specific attribute bits (FAT attribute byte, NTFS DOS
    /// flags, EXT mode).
    pub attributes: u32,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
}

/// One file or directory, with enough location state to re-enter its
/// filesystem for data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub meta: EntryMeta,
    pub(crate) locator: Locator,
}

impl Entry {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.meta.kind == EntryKind::Directory
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.meta.kind == EntryKind::File
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.meta.path
    }
}

/// Filesystem-private location of an entry's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Locator {
    /// First cluster; zero addresses the fixed FAT12/16 root region.
    Fat { first_cluster: u32 },
    /// MFT record number.
    Ntfs { record: u64 },
    /// Inode number.
    Ext { inode: u32 },
}

/// Join a parent path and a child name.
pub(crate) fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_path_joins() {
        assert_eq!(child_path("/", "HELLO.TXT"), "/HELLO.TXT");
        assert_eq!(child_path("/docs", "a.txt"), "/docs/a.txt");
    }
}
