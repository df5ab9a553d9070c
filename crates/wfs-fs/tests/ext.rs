//! EXT2/3/4 reader tests over synthetic volumes.

use wfs_device::{ByteSectorReader, MemoryByteDevice};
use wfs_fs::{open_filesystem, probe_filesystem, FilesystemKind};
use wfs_testkit::{ExtBuilder, ExtFlavor};
use wfs_types::CancelToken;

fn reader(volume: Vec<u8>) -> ByteSectorReader<MemoryByteDevice> {
    ByteSectorReader::new(MemoryByteDevice::new(volume), 512).expect("reader")
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

#[test]
fn variant_detection_follows_feature_flags() {
    for (flavor, kind) in [
        (ExtFlavor::Ext2, FilesystemKind::Ext2),
        (ExtFlavor::Ext3, FilesystemKind::Ext3),
        (ExtFlavor::Ext4, FilesystemKind::Ext4),
    ] {
        let volume = ExtBuilder::new(flavor).file("hello.txt", b"hi\n").build();
        let reader = reader(volume);
        assert_eq!(probe_filesystem(&reader).expect("probe"), kind);
    }
}

#[test]
fn ext2_lists_and_reads() {
    let volume = ExtBuilder::new(ExtFlavor::Ext2)
        .file("hello.txt", b"hi ext2\n")
        .dir("docs", &[("note.txt", b"a note\n")])
        .build();
    let reader = reader(volume);
    let fs = open_filesystem(&reader, CancelToken::new()).expect("open");
    assert_eq!(fs.kind(), FilesystemKind::Ext2);

    let root = fs.root().expect("root");
    let root_entries = root.entries().expect("entries");
    let names: Vec<&str> = root_entries.iter().map(|e| e.name()).collect();
    assert_eq!(names, vec!["hello.txt", "docs"]);

    let file = fs.open_file("/hello.txt").expect("file");
    assert_eq!(file.read_all().expect("read"), b"hi ext2\n");

    let nested = fs.open_file("/docs/note.txt").expect("nested");
    assert_eq!(nested.read_all().expect("read"), b"a note\n");
}

#[test]
fn ext_lookup_is_case_sensitive() {
    let volume = ExtBuilder::new(ExtFlavor::Ext2)
        .file("hello.txt", b"hi ext2\n")
        .build();
    let reader = reader(volume);
    let fs = open_filesystem(&reader, CancelToken::new()).expect("open");

    assert!(fs.open_file("/hello.txt").is_ok());
    assert!(fs.open_file("/HELLO.TXT").is_err());

    let root = fs.root().expect("root");
    assert!(root.find("HELLO.TXT").expect("find").is_none());
    assert!(root.find("hello.txt").expect("find").is_some());
}

#[test]
fn single_indirect_blocks_resolve() {
    // Thirteen 1 KiB blocks: twelve direct plus one through the
    // single-indirect pointer.
    let content = patterned(13 * 1024);
    let volume = ExtBuilder::new(ExtFlavor::Ext2)
        .file("big.bin", &content)
        .build();
    let reader = reader(volume);
    let fs = open_filesystem(&reader, CancelToken::new()).expect("open");

    let file = fs.open_file("/big.bin").expect("file");
    assert_eq!(file.size(), 13 * 1024);
    assert_eq!(file.read_all().expect("read"), content);

    // Positional read across the direct/indirect boundary.
    let mut buf = [0_u8; 64];
    let n = file.read_at(&mut buf, 12 * 1024 - 32).expect("read_at");
    assert_eq!(n, 64);
    assert_eq!(&buf[..], &content[12 * 1024 - 32..12 * 1024 + 32]);
}

#[test]
fn ext4_extent_tree_reads() {
    let content = patterned(5 * 1024);
    let volume = ExtBuilder::new(ExtFlavor::Ext4)
        .file("extents.bin", &content)
        .dir("docs", &[("note.txt", b"ext4 note\n")])
        .build();
    let reader = reader(volume);
    let fs = open_filesystem(&reader, CancelToken::new()).expect("open");
    assert_eq!(fs.kind(), FilesystemKind::Ext4);

    let file = fs.open_file("/extents.bin").expect("file");
    assert_eq!(file.read_all().expect("read"), content);

    let nested = fs.open_file("/docs/note.txt").expect("nested");
    assert_eq!(nested.read_all().expect("read"), b"ext4 note\n");
}

#[test]
fn timestamps_come_from_inode_seconds() {
    let volume = ExtBuilder::new(ExtFlavor::Ext2)
        .file("hello.txt", b"hi ext2\n")
        .build();
    let reader = reader(volume);
    let fs = open_filesystem(&reader, CancelToken::new()).expect("open");

    let file = fs.open_file("/hello.txt").expect("file");
    let meta = &file.entry().meta;
    assert_eq!(meta.modified.expect("mtime").timestamp(), 1_699_999_950);
    assert_eq!(meta.created.expect("ctime").timestamp(), 1_699_999_900);
    assert_eq!(meta.accessed.expect("atime").timestamp(), 1_700_000_000);
    assert!(!meta.deleted);
}

#[test]
fn stream_matches_read_all() {
    let content = patterned(5000);
    let volume = ExtBuilder::new(ExtFlavor::Ext2)
        .file("big.bin", &content)
        .build();
    let reader = reader(volume);
    let fs = open_filesystem(&reader, CancelToken::new()).expect("open");

    let file = fs.open_file("/big.bin").expect("file");
    let mut streamed = Vec::new();
    for chunk in file.open_stream() {
        streamed.extend_from_slice(&chunk.expect("chunk"));
    }
    assert_eq!(streamed, content);
}
