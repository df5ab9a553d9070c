//! NTFS reader tests over a synthetic MFT.

use chrono::Datelike;
use wfs_device::{ByteSectorReader, MemoryByteDevice};
use wfs_fs::{open_filesystem, probe_filesystem, FilesystemKind};
use wfs_testkit::NtfsBuilder;
use wfs_types::CancelToken;

fn reader(volume: Vec<u8>) -> ByteSectorReader<MemoryByteDevice> {
    ByteSectorReader::new(MemoryByteDevice::new(volume), 512).expect("reader")
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

#[test]
fn detects_ntfs() {
    let volume = NtfsBuilder::new().file("/small.txt", b"hello, ntfs!\n").build();
    let reader = reader(volume);
    assert_eq!(
        probe_filesystem(&reader).expect("probe"),
        FilesystemKind::Ntfs
    );
}

#[test]
fn lists_tree_and_reads_non_resident_data() {
    let content = patterned(4096);
    let volume = NtfsBuilder::new()
        .file("/dir/data.bin", &content)
        .file("/small.txt", b"hello, ntfs!\n")
        .build();
    let reader = reader(volume);
    let fs = open_filesystem(&reader, CancelToken::new()).expect("open");
    assert_eq!(fs.kind(), FilesystemKind::Ntfs);

    let root = fs.root().expect("root");
    let mut names: Vec<String> = root
        .entries()
        .expect("entries")
        .iter()
        .map(|e| e.name().to_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["dir", "small.txt"]);

    let dir = fs.open_dir("/dir").expect("dir");
    let children = dir.entries().expect("children");
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].name(), "data.bin");
    assert_eq!(children[0].meta.size, 4096);

    let file = fs.open_file("/dir/data.bin").expect("file");
    assert_eq!(file.read_all().expect("read"), content);
}

#[test]
fn read_at_tail_of_patterned_file() {
    let content = patterned(4096);
    let volume = NtfsBuilder::new().file("/dir/data.bin", &content).build();
    let reader = reader(volume);
    let fs = open_filesystem(&reader, CancelToken::new()).expect("open");

    // The last sixteen bytes of an `i % 256` file are 0xF0..=0xFF.
    let file = fs.open_file("/dir/data.bin").expect("file");
    let mut buf = [0_u8; 16];
    let n = file.read_at(&mut buf, 4080).expect("read_at");
    assert_eq!(n, 16);
    let expected: Vec<u8> = (0xF0..=0xFF).collect();
    assert_eq!(&buf[..], expected.as_slice());
}

#[test]
fn resident_data_reads_in_full_and_partially() {
    let volume = NtfsBuilder::new().file("/small.txt", b"hello, ntfs!\n").build();
    let reader = reader(volume);
    let fs = open_filesystem(&reader, CancelToken::new()).expect("open");

    let file = fs.open_file("/small.txt").expect("file");
    assert_eq!(file.size(), 13);
    assert_eq!(file.read_all().expect("read"), b"hello, ntfs!\n");

    let mut buf = [0_u8; 5];
    let n = file.read_at(&mut buf, 7).expect("read_at");
    assert_eq!(n, 5);
    assert_eq!(&buf[..], b"ntfs!");
}

#[test]
fn lookup_is_case_insensitive() {
    let volume = NtfsBuilder::new().file("/dir/data.bin", &patterned(4096)).build();
    let reader = reader(volume);
    let fs = open_filesystem(&reader, CancelToken::new()).expect("open");

    let file = fs.open_file("/DIR/DATA.BIN").expect("file");
    assert_eq!(file.size(), 4096);
}

#[test]
fn filetime_stamps_decode() {
    let volume = NtfsBuilder::new().file("/small.txt", b"hello, ntfs!\n").build();
    let reader = reader(volume);
    let fs = open_filesystem(&reader, CancelToken::new()).expect("open");

    let file = fs.open_file("/small.txt").expect("file");
    let created = file.entry().meta.created.expect("created");
    assert_eq!(created.year(), 2023);
    assert!(file.entry().meta.modified.is_some());
    assert!(file.entry().meta.accessed.is_some());
}

#[test]
fn directories_reject_file_operations() {
    let volume = NtfsBuilder::new().file("/dir/data.bin", &patterned(4096)).build();
    let reader = reader(volume);
    let fs = open_filesystem(&reader, CancelToken::new()).expect("open");

    assert!(fs.open_file("/dir").is_err());
    assert!(fs.open_dir("/dir/data.bin").is_err());
}
