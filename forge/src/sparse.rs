//! Android sparse image decoding
//!
//! A sparse image is a 28-byte file header followed by chunks. Each chunk
//! carries a 12-byte header: raw chunks hold `chunk_sz * blk_sz` payload
//! bytes, fill chunks a 4-byte pattern, don't-care chunks only advance the
//! output cursor, and crc32 chunks are ignored.

use tracing::debug;

use crate::error::{FastbootError, Result};
use crate::flash::PartitionWriter;

/// Sparse file magic.
pub const SPARSE_MAGIC: u32 = 0xED26_FF3A;

const FILE_HEADER_LEN: usize = 28;
const CHUNK_HEADER_LEN: usize = 12;

const CHUNK_TYPE_RAW: u16 = 0xCAC1;
const CHUNK_TYPE_FILL: u16 = 0xCAC2;
const CHUNK_TYPE_DONT_CARE: u16 = 0xCAC3;
const CHUNK_TYPE_CRC32: u16 = 0xCAC4;

#[derive(Debug, Clone, Copy)]
struct SparseHeader {
    major_version: u16,
    file_hdr_sz: u16,
    chunk_hdr_sz: u16,
    blk_sz: u32,
    total_chunks: u32,
}

impl SparseHeader {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FILE_HEADER_LEN {
            return Err(FastbootError::InvalidParameter);
        }
        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if magic != SPARSE_MAGIC {
            return Err(FastbootError::InvalidParameter);
        }
        Ok(Self {
            major_version: u16::from_le_bytes(data[4..6].try_into().unwrap()),
            file_hdr_sz: u16::from_le_bytes(data[8..10].try_into().unwrap()),
            chunk_hdr_sz: u16::from_le_bytes(data[10..12].try_into().unwrap()),
            blk_sz: u32::from_le_bytes(data[12..16].try_into().unwrap()),
            total_chunks: u32::from_le_bytes(data[20..24].try_into().unwrap()),
        })
    }
}

/// Whether a downloaded blob is a sparse image.
pub fn is_sparse_image(data: &[u8]) -> bool {
    data.len() >= FILE_HEADER_LEN
        && u32::from_le_bytes(data[0..4].try_into().unwrap()) == SPARSE_MAGIC
}

/// Expand a sparse image into a partition. The writer's bounds checks
/// keep every chunk inside the resolved partition.
pub fn write_sparse(writer: &mut PartitionWriter<'_>, data: &[u8]) -> Result<()> {
    let header = SparseHeader::parse(data)?;
    if header.major_version != 1
        || (header.file_hdr_sz as usize) < FILE_HEADER_LEN
        || (header.chunk_hdr_sz as usize) < CHUNK_HEADER_LEN
        || header.blk_sz == 0
    {
        return Err(FastbootError::InvalidParameter);
    }

    debug!(
        "sparse image: {} chunks, block size {}",
        header.total_chunks, header.blk_sz
    );

    let mut pos = header.file_hdr_sz as usize;
    for _ in 0..header.total_chunks {
        let chunk = data
            .get(pos..pos + header.chunk_hdr_sz as usize)
            .ok_or(FastbootError::InvalidParameter)?;
        let chunk_type = u16::from_le_bytes(chunk[0..2].try_into().unwrap());
        let chunk_blocks = u32::from_le_bytes(chunk[4..8].try_into().unwrap());
        let total_sz = u32::from_le_bytes(chunk[8..12].try_into().unwrap()) as usize;

        if total_sz < header.chunk_hdr_sz as usize {
            return Err(FastbootError::InvalidParameter);
        }
        let payload = data
            .get(pos + header.chunk_hdr_sz as usize..pos + total_sz)
            .ok_or(FastbootError::InvalidParameter)?;
        let out_len = chunk_blocks as u64 * header.blk_sz as u64;

        match chunk_type {
            CHUNK_TYPE_RAW => {
                if payload.len() as u64 != out_len {
                    return Err(FastbootError::InvalidParameter);
                }
                writer.write(payload)?;
            }
            CHUNK_TYPE_FILL => {
                let pattern: [u8; 4] = payload
                    .try_into()
                    .map_err(|_| FastbootError::InvalidParameter)?;
                writer.fill(u32::from_le_bytes(pattern), out_len)?;
            }
            CHUNK_TYPE_DONT_CARE => writer.skip(out_len)?,
            CHUNK_TYPE_CRC32 => {
                // checksum chunks are not validated
            }
            other => {
                debug!("unknown sparse chunk type {other:#06x}");
                return Err(FastbootError::InvalidParameter);
            }
        }

        pos += total_sz;
    }

    Ok(())
}
