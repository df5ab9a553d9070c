//! FAT reader tests over synthetic volumes.

use chrono::Datelike;
use wfs_device::{ByteSectorReader, MemoryByteDevice};
use wfs_fs::{open_filesystem, probe_filesystem, FilesystemKind};
use wfs_testkit::Fat32Builder;
use wfs_types::CancelToken;

fn reader(volume: Vec<u8>) -> ByteSectorReader<MemoryByteDevice> {
    ByteSectorReader::new(MemoryByteDevice::new(volume), 512).expect("reader")
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

#[test]
fn detects_fat32_superfloppy() {
    let volume = Fat32Builder::new().file("HELLO.TXT", b"hello\n").build();
    let reader = reader(volume);
    assert_eq!(
        probe_filesystem(&reader).expect("probe"),
        FilesystemKind::Fat32
    );
}

#[test]
fn lists_root_and_reads_files() {
    let volume = Fat32Builder::new()
        .file("HELLO.TXT", b"hello\n")
        .file("readme-longer.txt", b"long name content\n")
        .dir("DOCS", &[("NOTE.TXT", b"a note\n")])
        .build();
    let reader = reader(volume);
    let fs = open_filesystem(&reader, CancelToken::new()).expect("open");
    assert_eq!(fs.kind(), FilesystemKind::Fat32);

    let root = fs.root().expect("root");
    let entries = root.entries().expect("entries");
    let names: Vec<&str> = entries.iter().map(|e| e.name()).collect();
    assert_eq!(names, vec!["HELLO.TXT", "readme-longer.txt", "DOCS"]);

    // Long names survive the LFN run; short names stay 8.3.
    let long = root
        .find("readme-longer.txt")
        .expect("find")
        .expect("present");
    assert!(long.is_file());
    assert_eq!(long.path(), "/readme-longer.txt");

    let file = fs.open_file("/HELLO.TXT").expect("open file");
    assert_eq!(file.read_all().expect("read"), b"hello\n");

    // Directory filters split files from subdirectories.
    assert_eq!(root.files().expect("files").len(), 2);
    assert_eq!(root.dirs().expect("dirs").len(), 1);
}

#[test]
fn path_lookup_is_case_insensitive() {
    let volume = Fat32Builder::new()
        .file("HELLO.TXT", b"hello\n")
        .dir("DOCS", &[("NOTE.TXT", b"a note\n")])
        .build();
    let reader = reader(volume);
    let fs = open_filesystem(&reader, CancelToken::new()).expect("open");

    let file = fs.open_file("/docs/note.txt").expect("open file");
    assert_eq!(file.read_all().expect("read"), b"a note\n");

    // Backslash paths are normalised too.
    let file = fs.open_file("\\DOCS\\NOTE.TXT").expect("open file");
    assert_eq!(file.read_all().expect("read"), b"a note\n");

    assert!(fs.open_file("/docs/missing.txt").is_err());
}

#[test]
fn multi_cluster_file_reads_and_read_at() {
    let content = patterned(1500); // three 512-byte clusters
    let volume = Fat32Builder::new().file("BIG.BIN", &content).build();
    let reader = reader(volume);
    let fs = open_filesystem(&reader, CancelToken::new()).expect("open");

    let file = fs.open_file("/BIG.BIN").expect("open");
    assert_eq!(file.size(), 1500);
    assert_eq!(file.read_all().expect("read"), content);

    // Positional read across a cluster boundary.
    let mut buf = [0_u8; 100];
    let n = file.read_at(&mut buf, 480).expect("read_at");
    assert_eq!(n, 100);
    assert_eq!(&buf[..], &content[480..580]);

    // Reads shorten at end of file.
    let mut tail = [0_u8; 100];
    let n = file.read_at(&mut tail, 1450).expect("tail");
    assert_eq!(n, 50);
    assert_eq!(&tail[..50], &content[1450..]);

    assert!(file.read_at(&mut buf, 1501).is_err());
}

#[test]
fn stream_matches_read_all() {
    let content = patterned(2000);
    let volume = Fat32Builder::new().file("BIG.BIN", &content).build();
    let reader = reader(volume);
    let fs = open_filesystem(&reader, CancelToken::new()).expect("open");

    let file = fs.open_file("/BIG.BIN").expect("open");
    let mut streamed = Vec::new();
    for chunk in file.open_stream() {
        streamed.extend_from_slice(&chunk.expect("chunk"));
    }
    assert_eq!(streamed, file.read_all().expect("read_all"));
}

#[test]
fn timestamps_decode_from_dos_fields() {
    let volume = Fat32Builder::new().file("HELLO.TXT", b"hello\n").build();
    let reader = reader(volume);
    let fs = open_filesystem(&reader, CancelToken::new()).expect("open");

    let file = fs.open_file("/HELLO.TXT").expect("open");
    let modified = file.entry().meta.modified.expect("modified");
    assert_eq!(modified.year(), 2024);
    assert_eq!(modified.month(), 3);
    assert_eq!(modified.day(), 15);
    assert!(file.entry().meta.created.is_some());
    assert!(file.entry().meta.accessed.is_some());
}

#[test]
fn directory_listings_are_cached() {
    let volume = Fat32Builder::new().file("HELLO.TXT", b"hello\n").build();
    let reader = reader(volume);
    let fs = open_filesystem(&reader, CancelToken::new()).expect("open");

    let root = fs.root().expect("root");
    let first = root.entries().expect("first");
    let second = root.entries().expect("second");
    assert_eq!(first, second);
}

#[test]
fn cancellation_interrupts_listing() {
    let volume = Fat32Builder::new().file("HELLO.TXT", b"hello\n").build();
    let reader = reader(volume);
    let cancel = CancelToken::new();
    let fs = open_filesystem(&reader, cancel.clone()).expect("open");

    cancel.cancel();
    assert!(fs.root().expect("root").entries().is_err());

    cancel.reset();
    assert_eq!(fs.root().expect("root").entries().expect("entries").len(), 1);
}
