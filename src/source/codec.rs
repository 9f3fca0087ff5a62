//! Chunk codecs: decompression and typed decoding to `f64`.

use super::blosc;
use super::error::ZarrError;
use super::metadata::{CompressorConfig, DataType, Endian, ScalarKind};
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Undo the chunk compressor. `None` means the chunk is stored raw.
pub fn decompress(compressor: Option<&CompressorConfig>, raw: &[u8]) -> Result<Vec<u8>, ZarrError> {
    let Some(compressor) = compressor else {
        return Ok(raw.to_vec());
    };

    match compressor.id.as_str() {
        "zlib" => read_all(ZlibDecoder::new(raw), "zlib"),
        "gzip" => read_all(GzDecoder::new(raw), "gzip"),
        "zstd" => zstd::stream::decode_all(raw)
            .map_err(|e| ZarrError::Decompress(format!("zstd: {}", e))),
        "blosc" => blosc::decompress(raw),
        other => Err(ZarrError::UnsupportedCodec(other.to_string())),
    }
}

fn read_all(mut reader: impl Read, name: &str) -> Result<Vec<u8>, ZarrError> {
    let mut out = Vec::new();
    reader
        .read_to_end(&mut out)
        .map_err(|e| ZarrError::Decompress(format!("{}: {}", name, e)))?;
    Ok(out)
}

/// Decode raw little/big-endian scalars, mapping `missing` to NaN.
pub fn decode_values(
    bytes: &[u8],
    dtype: DataType,
    missing: Option<f64>,
) -> Result<Vec<f64>, ZarrError> {
    if bytes.len() % dtype.size != 0 {
        return Err(ZarrError::Decompress(format!(
            "{} bytes is not a whole number of {} values",
            bytes.len(),
            dtype
        )));
    }

    let values = bytes.chunks_exact(dtype.size).map(|b| {
        let value = scalar_to_f64(b, dtype);
        match missing {
            Some(fill) if value == fill => f64::NAN,
            _ => value,
        }
    });
    Ok(values.collect())
}

fn scalar_to_f64(b: &[u8], dtype: DataType) -> f64 {
    macro_rules! read {
        ($ty:ty, $n:expr) => {{
            let mut buf = [0u8; $n];
            buf.copy_from_slice(b);
            match dtype.endian {
                Endian::Little => <$ty>::from_le_bytes(buf) as f64,
                Endian::Big => <$ty>::from_be_bytes(buf) as f64,
            }
        }};
    }

    match (dtype.kind, dtype.size) {
        (ScalarKind::Int, 1) => b[0] as i8 as f64,
        (ScalarKind::UInt, 1) => b[0] as f64,
        (ScalarKind::Int, 2) => read!(i16, 2),
        (ScalarKind::UInt, 2) => read!(u16, 2),
        (ScalarKind::Int, 4) => read!(i32, 4),
        (ScalarKind::UInt, 4) => read!(u32, 4),
        (ScalarKind::Int, 8) => read!(i64, 8),
        (ScalarKind::UInt, 8) => read!(u64, 8),
        (ScalarKind::Float, 4) => read!(f32, 4),
        (ScalarKind::Float, 8) => read!(f64, 8),
        // DataType parsing only admits the sizes above
        _ => f64::NAN,
    }
}

/// Encode values as little-endian `f8`.
pub fn encode_f64(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// zlib-compress a chunk for writing.
pub fn compress_zlib(bytes: &[u8], level: u32) -> Result<Vec<u8>, ZarrError> {
    let encode_err = |e: std::io::Error| ZarrError::Decompress(format!("zlib encode: {}", e));
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(bytes).map_err(encode_err)?;
    encoder.finish().map_err(encode_err)
}
