use crate::cache::ChunkCache;
use crate::metadata::{
    parse_digest_body, parse_error2_body, parse_header_body, parse_volume_body, AcquisitionError,
    CaseInfo, DigestInfo, VolumeInfo,
};
use crate::section::{scan_sections, SectionDescriptor, SectionKind, SegmentHeader};
use crate::table::{build_chunk_index, ChunkIndex};
use crate::{adler32_of, Warning};
use flate2::read::ZlibDecoder;
use parking_lot::Mutex;
use serde::Serialize;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, trace};
use wfs_device::{ByteDevice, FileByteDevice, SectorRead};
use wfs_error::{Result, WfsError};
use wfs_types::{u64_to_usize, ByteOffset, CancelToken, ChunkNumber, Lba};

/// Default chunk cache capacity, in chunks.
pub const DEFAULT_CHUNK_CACHE: usize = 1024;

/// Options for opening a segment.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Raise checksum mismatches as errors instead of warnings.
    pub strict: bool,
    /// Chunk cache capacity; zero disables caching.
    pub cache_chunks: usize,
    /// Cooperative cancellation signal polled between chunk reads.
    pub cancel: CancelToken,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            strict: false,
            cache_chunks: DEFAULT_CHUNK_CACHE,
            cancel: CancelToken::new(),
        }
    }
}

/// Everything the segment says about the acquired media.
#[derive(Debug, Clone, Serialize)]
pub struct EwfMetadata {
    pub segment_number: u16,
    pub case_info: Option<CaseInfo>,
    pub volume: VolumeInfo,
    pub digest: Option<DigestInfo>,
    pub hash: Option<DigestInfo>,
    pub acquisition_errors: Vec<AcquisitionError>,
}

/// A parsed EWF segment exposing the reconstructed disk as live,
/// random-access sector reads.
///
/// The image owns its byte source; dropping it releases the source.
/// Everything built at open time is immutable afterwards, so one image
/// serves concurrent readers.
pub struct EwfImage {
    device: Box<dyn ByteDevice>,
    sections: Vec<SectionDescriptor>,
    metadata: EwfMetadata,
    index: ChunkIndex,
    cache: ChunkCache,
    chunk_size: usize,
    strict: bool,
    cancel: CancelToken,
    warnings: Mutex<Vec<Warning>>,
}

impl std::fmt::Debug for EwfImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EwfImage")
            .field("sections", &self.sections)
            .field("metadata", &self.metadata)
            .field("chunk_size", &self.chunk_size)
            .field("strict", &self.strict)
            .finish_non_exhaustive()
    }
}

impl EwfImage {
    /// Open the primary segment at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, OpenOptions::default())
    }

    /// Open the primary segment at `path`.
    pub fn open_with(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let device = FileByteDevice::open(path)?;
        Self::from_device(Box::new(device), options)
    }

    /// Quick signature probe without a full parse.
    #[must_use]
    pub fn is_ewf_file(path: impl AsRef<Path>) -> bool {
        let Ok(device) = FileByteDevice::open(path) else {
            return false;
        };
        let mut signature = [0_u8; 8];
        device.read_exact_at(ByteOffset(0), &mut signature).is_ok()
            && signature == crate::EVF_SIGNATURE
    }

    /// Decode a segment already wrapped in a byte device.
    pub fn from_device(device: Box<dyn ByteDevice>, options: OpenOptions) -> Result<Self> {
        let mut warnings = Vec::new();
        let strict = options.strict;

        let mut header_raw = [0_u8; crate::SEGMENT_HEADER_LEN as usize];
        device
            .read_exact_at(ByteOffset(0), &mut header_raw)
            .map_err(|_| WfsError::NotEwf)?;
        let segment_header = SegmentHeader::parse(&header_raw)?;

        let sections = scan_sections(device.as_ref(), strict, &mut warnings)?;

        let volume_section = sections
            .iter()
            .find(|s| matches!(s.kind, SectionKind::Volume | SectionKind::Disk))
            .ok_or_else(|| {
                WfsError::malformed("volume", 0, "segment carries no volume or disk section")
            })?;
        let volume = parse_volume_body(
            &read_body(device.as_ref(), volume_section)?,
            volume_section.body_offset(),
            strict,
            &mut warnings,
        )?;

        // header2 takes precedence over header for case metadata.
        let header_section = sections
            .iter()
            .find(|s| s.kind == SectionKind::Header2)
            .or_else(|| sections.iter().find(|s| s.kind == SectionKind::Header));
        let case_info = match header_section {
            Some(section) => Some(parse_header_body(
                &read_body(device.as_ref(), section)?,
                section.body_offset(),
            )?),
            None => None,
        };

        let digest = parse_optional_digest(device.as_ref(), &sections, SectionKind::Digest, strict, &mut warnings)?;
        let hash = parse_optional_digest(device.as_ref(), &sections, SectionKind::Hash, strict, &mut warnings)?;

        let acquisition_errors = match sections.iter().find(|s| s.kind == SectionKind::Error2) {
            Some(section) => parse_error2_body(&read_body(device.as_ref(), section)?),
            None => Vec::new(),
        };

        let index = build_chunk_index(device.as_ref(), &sections, strict, &mut warnings)?;

        if index.len() != volume.chunk_count {
            return Err(WfsError::malformed(
                "table",
                0,
                format!(
                    "chunk index has {} entries, volume declares {}",
                    index.len(),
                    volume.chunk_count
                ),
            ));
        }
        let expected_chunks = volume
            .sector_count
            .div_ceil(u64::from(volume.sectors_per_chunk));
        if volume.chunk_count != expected_chunks {
            return Err(WfsError::malformed(
                "volume",
                volume_section.offset,
                format!(
                    "{} chunks cannot cover {} sectors at {} sectors per chunk",
                    volume.chunk_count, volume.sector_count, volume.sectors_per_chunk
                ),
            ));
        }

        let chunk_size = u64_to_usize(volume.chunk_size(), "chunk size")
            .map_err(|e| WfsError::malformed("volume", volume_section.offset, e.to_string()))?;

        info!(
            target: "wfs::ewf",
            event = "image_open",
            segment = segment_header.segment_number,
            sectors = volume.sector_count,
            bytes_per_sector = volume.bytes_per_sector,
            chunks = volume.chunk_count,
            warnings = warnings.len()
        );

        Ok(Self {
            metadata: EwfMetadata {
                segment_number: segment_header.segment_number,
                case_info,
                volume,
                digest,
                hash,
                acquisition_errors,
            },
            sections,
            index,
            cache: ChunkCache::new(options.cache_chunks),
            chunk_size,
            strict,
            cancel: options.cancel,
            warnings: Mutex::new(warnings),
            device,
        })
    }

    #[must_use]
    pub fn metadata(&self) -> &EwfMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn sections(&self) -> &[SectionDescriptor] {
        &self.sections
    }

    /// Recoverable problems recorded at open time and during reads.
    #[must_use]
    pub fn warnings(&self) -> Vec<Warning> {
        self.warnings.lock().clone()
    }

    #[must_use]
    pub fn chunk_count(&self) -> u64 {
        self.index.len()
    }

    /// Reconstructed disk size in bytes.
    #[must_use]
    pub fn disk_size(&self) -> u64 {
        self.metadata.volume.disk_size()
    }

    /// Handle for cancelling in-flight reads on this image.
    #[must_use]
    pub fn canceller(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Fetch one decoded chunk, through the cache.
    fn chunk(&self, number: u64) -> Result<Arc<Vec<u8>>> {
        if let Some(hit) = self.cache.get(number) {
            trace!(target: "wfs::ewf", event = "chunk_hit", chunk = number);
            return Ok(hit);
        }

        let entry = *self
            .index
            .get(ChunkNumber(number))
            .ok_or(WfsError::MissingChunk { chunk: number })?;
        let stored_size = u64_to_usize(entry.stored_size, "stored chunk size")
            .map_err(|_| WfsError::MissingChunk { chunk: number })?;
        let mut stored = vec![0_u8; stored_size];
        self.device
            .read_exact_at(ByteOffset(entry.offset), &mut stored)?;

        let is_last = number + 1 == self.index.len();
        let mut data = if entry.compressed {
            let mut inflated = Vec::with_capacity(self.chunk_size);
            ZlibDecoder::new(stored.as_slice())
                .read_to_end(&mut inflated)
                .map_err(|e| WfsError::Decompress {
                    offset: entry.offset,
                    detail: format!("chunk {number}: {e}"),
                })?;
            if inflated.len() != self.chunk_size && !(is_last && inflated.len() < self.chunk_size)
            {
                return Err(WfsError::malformed(
                    "sectors",
                    entry.offset,
                    format!(
                        "chunk {number} inflated to {} bytes, expected {}",
                        inflated.len(),
                        self.chunk_size
                    ),
                ));
            }
            inflated
        } else if stored.len() == self.chunk_size + 4 {
            // Uncompressed chunk with a trailing Adler-32.
            let stored_sum = u32::from_le_bytes([
                stored[self.chunk_size],
                stored[self.chunk_size + 1],
                stored[self.chunk_size + 2],
                stored[self.chunk_size + 3],
            ]);
            let computed = adler32_of(&stored[..self.chunk_size]);
            if stored_sum != computed {
                if self.strict {
                    return Err(WfsError::ChecksumFailure {
                        section: "sectors".to_owned(),
                        offset: entry.offset,
                        stored: stored_sum,
                        computed,
                    });
                }
                self.warnings.lock().push(Warning::new(
                    "sectors",
                    entry.offset,
                    format!(
                        "chunk {number} Adler-32 mismatch: stored {stored_sum:#010x}, computed {computed:#010x}"
                    ),
                ));
            }
            stored.truncate(self.chunk_size);
            stored
        } else if stored.len() == self.chunk_size || (is_last && stored.len() < self.chunk_size) {
            stored
        } else {
            return Err(WfsError::malformed(
                "sectors",
                entry.offset,
                format!(
                    "chunk {number} stores {} bytes, expected {} (or {} with checksum)",
                    stored.len(),
                    self.chunk_size,
                    self.chunk_size + 4
                ),
            ));
        };

        // The last chunk may cover fewer sectors than a full chunk; pad
        // with zeros so in-chunk slicing stays uniform.
        if data.len() < self.chunk_size {
            data.resize(self.chunk_size, 0);
        }

        let data = Arc::new(data);
        self.cache.insert(number, Arc::clone(&data));
        debug!(target: "wfs::ewf", event = "chunk_decoded", chunk = number, compressed = entry.compressed);
        Ok(data)
    }
}

fn read_body(device: &dyn ByteDevice, section: &SectionDescriptor) -> Result<Vec<u8>> {
    let len = u64_to_usize(section.body_len(), "section body length")
        .map_err(|e| WfsError::malformed(&section.type_name, section.offset, e.to_string()))?;
    let mut body = vec![0_u8; len];
    device.read_exact_at(ByteOffset(section.body_offset()), &mut body)?;
    Ok(body)
}

fn parse_optional_digest(
    device: &dyn ByteDevice,
    sections: &[SectionDescriptor],
    kind: SectionKind,
    strict: bool,
    warnings: &mut Vec<Warning>,
) -> Result<Option<DigestInfo>> {
    let Some(section) = sections.iter().find(|s| s.kind == kind) else {
        return Ok(None);
    };
    parse_digest_body(
        &read_body(device, section)?,
        &section.type_name,
        section.body_offset(),
        strict,
        warnings,
    )
    .map(Some)
}

impl SectorRead for EwfImage {
    fn sector_size(&self) -> u32 {
        self.metadata.volume.bytes_per_sector
    }

    fn sector_count(&self) -> u64 {
        self.metadata.volume.sector_count
    }

    fn read_sector(&self, lba: Lba) -> Result<Vec<u8>> {
        if lba.0 >= self.sector_count() {
            return Err(WfsError::out_of_range(format!(
                "sector {lba} beyond disk of {} sectors",
                self.sector_count()
            )));
        }
        let spc = u64::from(self.metadata.volume.sectors_per_chunk);
        let bps = self.sector_size() as usize;
        let chunk = self.chunk(lba.0 / spc)?;
        let in_chunk = (lba.0 % spc) as usize;
        Ok(chunk[in_chunk * bps..(in_chunk + 1) * bps].to_vec())
    }

    fn read_sectors(&self, start: Lba, count: u64) -> Result<Vec<u8>> {
        let end = start
            .checked_add(count)
            .ok_or_else(|| WfsError::out_of_range("sector range overflows u64"))?;
        if end.0 > self.sector_count() {
            return Err(WfsError::out_of_range(format!(
                "sectors {start}..{end} beyond disk of {} sectors",
                self.sector_count()
            )));
        }

        let spc = u64::from(self.metadata.volume.sectors_per_chunk);
        let bps = self.sector_size() as usize;
        let mut out = Vec::with_capacity(usize::try_from(count).unwrap_or(0) * bps);

        // Sectors falling in the same chunk are copied in one pass.
        let mut lba = start.0;
        while lba < end.0 {
            self.cancel.checkpoint()?;
            let chunk_number = lba / spc;
            let in_chunk = (lba % spc) as usize;
            let take = ((spc - lba % spc).min(end.0 - lba)) as usize;
            let chunk = self.chunk(chunk_number)?;
            out.extend_from_slice(&chunk[in_chunk * bps..(in_chunk + take) * bps]);
            lba += take as u64;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_options_defaults() {
        let options = OpenOptions::default();
        assert!(!options.strict);
        assert_eq!(options.cache_chunks, DEFAULT_CHUNK_CACHE);
        assert!(!options.cancel.is_cancelled());
    }
}
