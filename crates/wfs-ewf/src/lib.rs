#![forbid(unsafe_code)]
//! Expert Witness Format (E01) container decoder.
//!
//! Turns an on-disk EWF segment into live, random-access sector reads:
//! section scanning, metadata parsing, chunk-table reconstruction,
//! per-chunk zlib decompression, and a bounded chunk cache behind the
//! `SectorRead` contract.

mod cache;
mod image;
mod metadata;
mod section;
mod table;

pub use cache::ChunkCache;
pub use image::{EwfImage, EwfMetadata, OpenOptions, DEFAULT_CHUNK_CACHE};
pub use metadata::{AcquisitionError, CaseInfo, DigestInfo, VolumeDescriptorKind, VolumeInfo};
pub use section::{
    SectionDescriptor, SectionKind, SegmentHeader, EVF_SIGNATURE, SECTION_DESCRIPTOR_LEN,
    SEGMENT_HEADER_LEN,
};
pub use table::{ChunkEntry, ChunkIndex};

use serde::Serialize;
use std::fmt;

/// Recoverable problem recorded while decoding a segment.
///
/// Warnings carry the section type and byte offset at fault; in strict
/// mode most of them are raised as errors instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub section: String,
    pub offset: u64,
    pub detail: String,
}

impl Warning {
    pub(crate) fn new(
        section: impl Into<String>,
        offset: u64,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            section: section.into(),
            offset,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} section at offset {}: {}",
            self.section, self.offset, self.detail
        )
    }
}

/// Adler-32 as EWF uses it everywhere.
pub(crate) fn adler32_of(data: &[u8]) -> u32 {
    adler32::RollingAdler32::from_buffer(data).hash()
}
