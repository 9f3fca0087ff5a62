//! Local Zarr v2 directory store writer.
//!
//! Every array is stored as zlib-compressed little-endian `f8` with NaN as
//! fill value. Edge chunks are padded with NaN to the full chunk shape.
//! `finish` writes the consolidated `.zmetadata` so readers need a single
//! request to discover the whole hierarchy.

use crate::source::codec;
use crate::source::loader::chunks_overlapping;
use crate::source::metadata::{ArrayMetadata, ArrayOrder, CompressorConfig, DataType};
use anyhow::{bail, Context, Result};
use ndarray::{ArrayD, ArrayViewD, IxDyn, Slice};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A Zarr v2 group being written to disk.
pub struct OutputStore {
    root: PathBuf,
    compression_level: u32,
    metadata: Map<String, Value>,
}

impl OutputStore {
    /// Create an empty group at `path`, replacing an existing store there.
    ///
    /// A non-empty directory that is not a Zarr group is left alone and
    /// reported as an error.
    pub fn create(path: &Path, compression_level: u32) -> Result<Self> {
        if path.is_file() {
            bail!("Output path {} is a file", path.display());
        }
        if path.is_dir() {
            let is_store = path.join(".zgroup").exists() || path.join(".zmetadata").exists();
            let is_empty = fs::read_dir(path)
                .with_context(|| format!("Failed to read {}", path.display()))?
                .next()
                .is_none();
            if !is_store && !is_empty {
                bail!(
                    "Output path {} exists and is not a Zarr store; refusing to replace it",
                    path.display()
                );
            }
            info!("Replacing existing output store {}", path.display());
            fs::remove_dir_all(path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;

        let mut store = Self {
            root: path.to_path_buf(),
            compression_level: compression_level.min(9),
            metadata: Map::new(),
        };
        store.put_document(".zgroup", json!({ "zarr_format": 2 }))?;
        Ok(store)
    }

    fn put_document(&mut self, key: &str, document: Value) -> Result<()> {
        let path = self.root.join(key);
        let text = serde_json::to_string_pretty(&document)?;
        fs::write(&path, text).with_context(|| format!("Failed to write {}", path.display()))?;
        self.metadata.insert(key.to_string(), document);
        Ok(())
    }

    /// Set the group's attributes.
    pub fn set_attributes(&mut self, attrs: Map<String, Value>) -> Result<()> {
        self.put_document(".zattrs", Value::Object(attrs))
    }

    /// Write one array. `dims` names each axis for xarray-style readers.
    pub fn write_array(
        &mut self,
        name: &str,
        dims: &[&str],
        data: ArrayViewD<'_, f64>,
        chunks: &[usize],
        mut attrs: Map<String, Value>,
    ) -> Result<()> {
        let shape = data.shape().to_vec();
        if dims.len() != shape.len() || chunks.len() != shape.len() {
            bail!(
                "Array {} has {} dimensions but {} names and {} chunk sizes",
                name,
                shape.len(),
                dims.len(),
                chunks.len()
            );
        }
        if shape.iter().any(|&n| n == 0) || chunks.iter().any(|&c| c == 0) {
            bail!("Array {} has an empty dimension or chunk", name);
        }

        let dir = self.root.join(name);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;

        let meta = ArrayMetadata {
            zarr_format: 2,
            shape: shape.clone(),
            chunks: chunks.to_vec(),
            dtype: DataType::F64_LE,
            compressor: Some(CompressorConfig::zlib(self.compression_level as i32)),
            fill_value: Value::String("NaN".to_string()),
            order: ArrayOrder::C,
            filters: None,
            dimension_separator: ".".to_string(),
        };
        self.put_document(&format!("{}/.zarray", name), serde_json::to_value(&meta)?)?;

        attrs.insert("_ARRAY_DIMENSIONS".to_string(), json!(dims));
        self.put_document(&format!("{}/.zattrs", name), Value::Object(attrs))?;

        let ranges: Vec<_> = shape.iter().map(|&n| 0..n).collect();
        let grid = chunks_overlapping(&ranges, chunks);
        for coords in &grid {
            let mut block = ArrayD::from_elem(IxDyn(chunks), f64::NAN);
            let src: Vec<_> = coords
                .iter()
                .zip(chunks)
                .zip(&shape)
                .map(|((&c, &size), &len)| c * size..((c + 1) * size).min(len))
                .collect();

            block
                .slice_each_axis_mut(|ax| Slice::from(0..src[ax.axis.index()].len()))
                .assign(&data.slice_each_axis(|ax| Slice::from(src[ax.axis.index()].clone())));

            let values: Vec<f64> = block.iter().copied().collect();
            let compressed =
                codec::compress_zlib(&codec::encode_f64(&values), self.compression_level)?;

            let key = coords
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(".");
            let path = dir.join(&key);
            fs::write(&path, compressed)
                .with_context(|| format!("Failed to write chunk {}", path.display()))?;
        }

        debug!("Wrote {} ({:?}) in {} chunks", name, shape, grid.len());
        Ok(())
    }

    /// Write the consolidated metadata and close the store.
    pub fn finish(self) -> Result<PathBuf> {
        let consolidated = json!({
            "zarr_consolidated_format": 1,
            "metadata": Value::Object(self.metadata),
        });
        let path = self.root.join(".zmetadata");
        fs::write(&path, serde_json::to_string_pretty(&consolidated)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(self.root)
    }
}

/// Chunk shape: each dimension capped at the matching entry of `caps`.
pub fn chunk_shape(shape: &[usize], caps: &[usize]) -> Vec<usize> {
    shape
        .iter()
        .zip(caps.iter().chain(std::iter::repeat(&usize::MAX)))
        .map(|(&n, &cap)| n.clamp(1, cap.max(1)))
        .collect()
}
