//! Blosc1 frame decoding.
//!
//! Handles the frames numcodecs writes by default: byte-shuffled (or
//! unshuffled) blocks compressed with lz4, zstd or zlib. Bit-shuffle, delta
//! and the blosclz codec are reported as unsupported.

use super::error::ZarrError;
use flate2::read::ZlibDecoder;
use std::io::Read;

const HEADER_LEN: usize = 16;

const FLAG_SHUFFLE: u8 = 0x01;
const FLAG_MEMCPYED: u8 = 0x02;
const FLAG_BITSHUFFLE: u8 = 0x04;
const FLAG_DELTA: u8 = 0x08;
const FLAG_DONT_SPLIT: u8 = 0x10;

/// Inner codec recorded in bits 5-7 of the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InnerCodec {
    BloscLz,
    Lz4,
    Snappy,
    Zlib,
    Zstd,
}

impl InnerCodec {
    fn from_flags(flags: u8) -> Result<Self, ZarrError> {
        match (flags & 0xe0) >> 5 {
            0 => Ok(InnerCodec::BloscLz),
            1 => Ok(InnerCodec::Lz4),
            2 => Ok(InnerCodec::Snappy),
            3 => Ok(InnerCodec::Zlib),
            4 => Ok(InnerCodec::Zstd),
            other => Err(ZarrError::Decompress(format!(
                "unknown blosc compressor code {}",
                other
            ))),
        }
    }
}

/// Parsed 16-byte Blosc header.
#[derive(Debug, Clone, Copy)]
struct Header {
    flags: u8,
    typesize: usize,
    nbytes: usize,
    blocksize: usize,
    cbytes: usize,
}

fn read_u32(buf: &[u8], offset: usize) -> Result<usize, ZarrError> {
    buf.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
        .ok_or_else(|| ZarrError::Decompress("truncated blosc frame".to_string()))
}

impl Header {
    fn parse(buf: &[u8]) -> Result<Self, ZarrError> {
        if buf.len() < HEADER_LEN {
            return Err(ZarrError::Decompress("blosc frame shorter than header".to_string()));
        }
        Ok(Self {
            flags: buf[2],
            typesize: buf[3].max(1) as usize,
            nbytes: read_u32(buf, 4)?,
            blocksize: read_u32(buf, 8)?,
            cbytes: read_u32(buf, 12)?,
        })
    }
}

/// Decode a complete Blosc1 frame.
pub fn decompress(frame: &[u8]) -> Result<Vec<u8>, ZarrError> {
    let header = Header::parse(frame)?;

    if header.cbytes > frame.len() {
        return Err(ZarrError::Decompress(format!(
            "blosc frame claims {} bytes, buffer has {}",
            header.cbytes,
            frame.len()
        )));
    }

    if header.flags & FLAG_MEMCPYED != 0 {
        let end = HEADER_LEN + header.nbytes;
        return frame
            .get(HEADER_LEN..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| ZarrError::Decompress("truncated memcpyed blosc frame".to_string()));
    }

    if header.flags & FLAG_BITSHUFFLE != 0 && header.typesize > 1 {
        return Err(ZarrError::UnsupportedCodec("blosc bitshuffle".to_string()));
    }
    if header.flags & FLAG_DELTA != 0 {
        return Err(ZarrError::UnsupportedCodec("blosc delta filter".to_string()));
    }

    let codec = InnerCodec::from_flags(header.flags)?;
    if matches!(codec, InnerCodec::BloscLz | InnerCodec::Snappy) {
        return Err(ZarrError::UnsupportedCodec(format!("blosc/{:?}", codec).to_lowercase()));
    }

    if header.nbytes == 0 {
        return Ok(Vec::new());
    }
    if header.blocksize == 0 {
        return Err(ZarrError::Decompress("blosc blocksize is zero".to_string()));
    }

    let nblocks = header.nbytes.div_ceil(header.blocksize);
    let mut output = vec![0u8; header.nbytes];

    for block in 0..nblocks {
        let block_start = read_u32(frame, HEADER_LEN + 4 * block)?;
        let out_start = block * header.blocksize;
        let bsize = header.blocksize.min(header.nbytes - out_start);
        let leftover = bsize < header.blocksize;

        let decoded = decode_block(frame, block_start, bsize, leftover, codec, &header)?;
        output[out_start..out_start + bsize].copy_from_slice(&decoded);
    }

    Ok(output)
}

fn decode_block(
    frame: &[u8],
    mut cursor: usize,
    bsize: usize,
    leftover: bool,
    codec: InnerCodec,
    header: &Header,
) -> Result<Vec<u8>, ZarrError> {
    let split = header.flags & FLAG_DONT_SPLIT == 0 && !leftover;
    let nsplits = if split { header.typesize } else { 1 };
    let split_size = bsize / nsplits;

    let mut block = Vec::with_capacity(bsize);
    for _ in 0..nsplits {
        let csize = read_u32(frame, cursor)?;
        cursor += 4;
        let payload = frame
            .get(cursor..cursor + csize)
            .ok_or_else(|| ZarrError::Decompress("truncated blosc split".to_string()))?;
        cursor += csize;

        if csize == split_size {
            // Stored uncompressed
            block.extend_from_slice(payload);
        } else {
            block.extend(inflate(codec, payload, split_size)?);
        }
    }

    if block.len() != bsize {
        return Err(ZarrError::Decompress(format!(
            "blosc block decoded to {} bytes, expected {}",
            block.len(),
            bsize
        )));
    }

    if header.flags & FLAG_SHUFFLE != 0 && header.typesize > 1 {
        Ok(unshuffle(&block, header.typesize))
    } else {
        Ok(block)
    }
}

fn inflate(codec: InnerCodec, payload: &[u8], size: usize) -> Result<Vec<u8>, ZarrError> {
    match codec {
        InnerCodec::Lz4 => lz4_flex::block::decompress(payload, size)
            .map_err(|e| ZarrError::Decompress(format!("lz4: {}", e))),
        InnerCodec::Zstd => zstd::bulk::decompress(payload, size)
            .map_err(|e| ZarrError::Decompress(format!("zstd: {}", e))),
        InnerCodec::Zlib => {
            let mut out = Vec::with_capacity(size);
            ZlibDecoder::new(payload)
                .read_to_end(&mut out)
                .map_err(|e| ZarrError::Decompress(format!("zlib: {}", e)))?;
            Ok(out)
        }
        InnerCodec::BloscLz | InnerCodec::Snappy => Err(ZarrError::UnsupportedCodec(format!(
            "blosc/{:?}",
            codec
        ))),
    }
}

/// Reverse Blosc's byte shuffle over one block.
///
/// Trailing bytes that do not fill a whole element are stored unshuffled.
pub fn unshuffle(src: &[u8], typesize: usize) -> Vec<u8> {
    let elements = src.len() / typesize;
    let shuffled_len = elements * typesize;
    let mut out = vec![0u8; src.len()];

    for byte in 0..typesize {
        for element in 0..elements {
            out[element * typesize + byte] = src[byte * elements + element];
        }
    }
    out[shuffled_len..].copy_from_slice(&src[shuffled_len..]);
    out
}
