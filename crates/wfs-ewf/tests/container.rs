//! End-to-end container tests over synthetic segments.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use wfs_device::{ByteDevice, MemoryByteDevice, SectorRead};
use wfs_error::WfsError;
use wfs_ewf::{EwfImage, OpenOptions};
use wfs_testkit::E01Builder;
use wfs_types::{ByteOffset, Lba};

fn open_lax(bytes: Vec<u8>) -> EwfImage {
    EwfImage::from_device(Box::new(MemoryByteDevice::new(bytes)), OpenOptions::default())
        .expect("open image")
}

fn open_strict(bytes: Vec<u8>) -> Result<EwfImage, WfsError> {
    EwfImage::from_device(
        Box::new(MemoryByteDevice::new(bytes)),
        OpenOptions {
            strict: true,
            ..OpenOptions::default()
        },
    )
}

/// A deterministic non-zero disk: byte i is `i % 251`.
fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn zeroed_image_geometry_and_first_sector() {
    let image = open_lax(E01Builder::new().build());
    assert_eq!(image.sector_size(), 512);
    assert_eq!(image.sector_count(), 2048);
    assert_eq!(image.chunk_count(), 32);
    assert_eq!(image.disk_size(), 1_048_576);

    let sector = image.read_sector(Lba(0)).expect("sector 0");
    assert_eq!(sector.len(), 512);
    assert!(sector.iter().all(|b| *b == 0));
}

#[test]
fn last_byte_reads_and_byte_past_end_fails() {
    let image = open_lax(E01Builder::new().build());

    let last = image.read_bytes(ByteOffset(1_048_575), 1).expect("last byte");
    assert_eq!(last, vec![0x00]);

    let err = image
        .read_bytes(ByteOffset(1_048_576), 1)
        .expect_err("past end");
    assert!(matches!(err, WfsError::OutOfRange { .. }));

    let err = image.read_sector(Lba(2048)).expect_err("sector past end");
    assert!(matches!(err, WfsError::OutOfRange { .. }));
}

#[test]
fn truncated_chain_is_malformed() {
    let bytes = E01Builder::new().truncated_chain().build();
    let err = EwfImage::from_device(
        Box::new(MemoryByteDevice::new(bytes)),
        OpenOptions::default(),
    )
    .expect_err("truncated");
    assert!(matches!(err, WfsError::Malformed { .. }));
}

#[test]
fn bad_volume_checksum_strict_fails_lax_warns() {
    let bytes = E01Builder::new().corrupt_volume_checksum().build();

    let err = open_strict(bytes.clone()).expect_err("strict open");
    assert!(err.is_checksum_failure());

    let image = open_lax(bytes);
    assert_eq!(image.sector_count(), 2048);
    let warnings = image.warnings();
    assert!(
        warnings.iter().any(|w| w.section == "volume"),
        "expected a volume warning, got {warnings:?}"
    );
}

#[test]
fn compressed_image_round_trips_patterned_data() {
    let data = patterned(3 * 32 * 1024 / 2); // 1.5 chunks of 32 KiB
    let image = open_lax(E01Builder::new().with_data(data.clone()).build());

    assert_eq!(image.sector_count(), 96);
    assert_eq!(image.chunk_count(), 2);

    let all = image.read_sectors(Lba(0), 96).expect("full read");
    assert_eq!(all, data);

    // Short last chunk: the final sector still reads its exact bytes.
    let tail = image.read_sector(Lba(95)).expect("last sector");
    assert_eq!(tail.as_slice(), &data[95 * 512..]);
}

#[test]
fn sector_byte_and_batch_reads_agree() {
    let data = patterned(4 * 32 * 1024);
    let image = open_lax(E01Builder::new().with_data(data).build());

    for lba in [0_u64, 1, 63, 64, 127, 200, 255] {
        let single = image.read_sector(Lba(lba)).expect("sector");
        let batch = image.read_sectors(Lba(lba), 1).expect("batch");
        let bytes = image
            .read_bytes(ByteOffset(lba * 512), 512)
            .expect("bytes");
        assert_eq!(single, batch, "sector {lba}");
        assert_eq!(single, bytes, "sector {lba}");
    }

    // A read spanning chunk boundaries equals stitched single reads.
    let span = image.read_sectors(Lba(60), 10).expect("span");
    let mut stitched = Vec::new();
    for lba in 60..70 {
        stitched.extend_from_slice(&image.read_sector(Lba(lba)).expect("sector"));
    }
    assert_eq!(span, stitched);
}

#[test]
fn uncompressed_chunks_verify_trailing_checksums() {
    let data = patterned(64 * 1024);
    let bytes = E01Builder::new()
        .with_data(data.clone())
        .with_chunk_checksums()
        .build();

    let image = open_strict(bytes).expect("strict open");
    let all = image.read_sectors(Lba(0), 128).expect("read");
    assert_eq!(all, data);
    assert!(image.warnings().is_empty());
}

#[test]
fn corrupt_chunk_checksum_strict_vs_lax() {
    let data = patterned(64 * 1024);
    let bytes = E01Builder::new()
        .with_data(data.clone())
        .with_chunk_checksums()
        .build_with_corrupt_chunk(1);

    // Strict: reading a sector of chunk 1 surfaces the mismatch.
    let image = open_strict(bytes.clone()).expect("open is fine, chunk read is not");
    let err = image.read_sector(Lba(64)).expect_err("strict chunk read");
    assert!(err.is_checksum_failure());
    // Chunk 0 stays readable.
    assert!(image.read_sector(Lba(0)).is_ok());

    // Lax: data comes back and a warning lands on the image.
    let image = open_lax(bytes);
    let sector = image.read_sector(Lba(64)).expect("lax chunk read");
    assert_eq!(sector.as_slice(), &data[64 * 512..65 * 512]);
    assert!(image
        .warnings()
        .iter()
        .any(|w| w.section == "sectors" && w.detail.contains("Adler-32")));
}

#[test]
fn case_metadata_and_digests_surface() {
    let bytes = E01Builder::new().case_field("md", "TestDisk 9000").build();
    let image = open_lax(bytes);
    let metadata = image.metadata();

    assert_eq!(metadata.segment_number, 1);
    let case = metadata.case_info.as_ref().expect("case info");
    assert_eq!(case.case_number.as_deref(), Some("case-001"));
    assert_eq!(case.evidence_number.as_deref(), Some("evidence-01"));
    assert_eq!(case.media_model.as_deref(), Some("TestDisk 9000"));

    let hash = metadata.hash.as_ref().expect("hash section");
    assert_eq!(
        hash.md5.as_deref(),
        Some("101112131415161718191a1b1c1d1e1f")
    );
    assert_eq!(hash.sha1, None);

    assert!(metadata.volume.set_identifier.is_some());
}

/// Counts positional reads that reach the byte source.
struct CountingDevice {
    inner: MemoryByteDevice,
    reads: Arc<AtomicU64>,
}

impl ByteDevice for CountingDevice {
    fn len_bytes(&self) -> u64 {
        self.inner.len_bytes()
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> wfs_error::Result<()> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.inner.read_exact_at(offset, buf)
    }
}

/// More cache never means more byte-source reads for the same trace.
#[test]
fn cache_capacity_is_monotone_in_source_reads() {
    let bytes = E01Builder::new().with_data(patterned(8 * 32 * 1024)).build();

    let trace: Vec<u64> = vec![0, 1, 0, 2, 0, 3, 1, 2, 4, 0, 5, 1, 6, 2, 7, 0];
    let mut reads_by_capacity = Vec::new();

    for capacity in [0_usize, 2, 1024] {
        let reads = Arc::new(AtomicU64::new(0));
        let device = CountingDevice {
            inner: MemoryByteDevice::new(bytes.clone()),
            reads: Arc::clone(&reads),
        };
        let image = EwfImage::from_device(
            Box::new(device),
            OpenOptions {
                cache_chunks: capacity,
                ..OpenOptions::default()
            },
        )
        .expect("open");

        let after_open = reads.load(Ordering::Relaxed);
        for chunk in &trace {
            image.read_sector(Lba(chunk * 64)).expect("read");
        }
        reads_by_capacity.push(reads.load(Ordering::Relaxed) - after_open);
    }

    assert!(
        reads_by_capacity[0] >= reads_by_capacity[1],
        "no cache should read at least as much as a small cache: {reads_by_capacity:?}"
    );
    assert!(
        reads_by_capacity[1] >= reads_by_capacity[2],
        "a small cache should read at least as much as a large one: {reads_by_capacity:?}"
    );
    // With every chunk cached, each of the 8 chunks is read exactly once.
    assert_eq!(reads_by_capacity[2], 8);
}

#[test]
fn cancellation_aborts_and_image_stays_usable() {
    let image = open_lax(E01Builder::new().build());

    let token = image.canceller();
    token.cancel();
    let err = image.read_sectors(Lba(0), 128).expect_err("cancelled");
    assert!(matches!(err, WfsError::Cancelled));

    // Cancellation leaves the image unchanged and reusable.
    token.reset();
    let all = image.read_sectors(Lba(0), 128).expect("read after reset");
    assert_eq!(all.len(), 128 * 512);
}

#[test]
fn open_from_file_and_signature_probe() {
    use std::io::Write;

    let bytes = E01Builder::new().build();
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    file.write_all(&bytes).expect("write");

    assert!(EwfImage::is_ewf_file(file.path()));
    let image = EwfImage::open(file.path()).expect("open");
    assert_eq!(image.sector_count(), 2048);

    let mut garbage = tempfile::NamedTempFile::new().expect("tempfile");
    garbage.write_all(b"definitely not an ewf file").expect("write");
    assert!(!EwfImage::is_ewf_file(garbage.path()));
    assert!(matches!(
        EwfImage::open(garbage.path()),
        Err(WfsError::NotEwf)
    ));
}
