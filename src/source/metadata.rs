//! Zarr v2 metadata documents.
//!
//! Covers `.zarray`, `.zattrs` and the consolidated `.zmetadata` object,
//! plus the CF attributes needed to turn stored integers into physical
//! values.

use super::error::ZarrError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Byte order of a stored scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Numeric family of a stored scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Int,
    UInt,
    Float,
}

/// A NumPy-style dtype string such as `<f4` or `>i2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataType {
    pub endian: Endian,
    pub kind: ScalarKind,
    pub size: usize,
}

impl DataType {
    pub const F64_LE: DataType = DataType {
        endian: Endian::Little,
        kind: ScalarKind::Float,
        size: 8,
    };
}

impl TryFrom<String> for DataType {
    type Error = ZarrError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let unsupported = || ZarrError::UnsupportedDtype(value.clone());
        let mut chars = value.chars();

        let endian = match chars.next() {
            Some('<') => Endian::Little,
            Some('>') => Endian::Big,
            // Single-byte types carry no byte order
            Some('|') => Endian::Little,
            _ => return Err(unsupported()),
        };
        let kind = match chars.next() {
            Some('i') => ScalarKind::Int,
            Some('u') => ScalarKind::UInt,
            Some('f') => ScalarKind::Float,
            _ => return Err(unsupported()),
        };
        let size: usize = chars.as_str().parse().map_err(|_| unsupported())?;

        let valid = match kind {
            ScalarKind::Int | ScalarKind::UInt => matches!(size, 1 | 2 | 4 | 8),
            ScalarKind::Float => matches!(size, 4 | 8),
        };
        if !valid || (value.starts_with('|') && size != 1) {
            return Err(unsupported());
        }

        Ok(Self { endian, kind, size })
    }
}

impl From<DataType> for String {
    fn from(dtype: DataType) -> Self {
        dtype.to_string()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let order = match (self.size, self.endian) {
            (1, _) => '|',
            (_, Endian::Little) => '<',
            (_, Endian::Big) => '>',
        };
        let kind = match self.kind {
            ScalarKind::Int => 'i',
            ScalarKind::UInt => 'u',
            ScalarKind::Float => 'f',
        };
        write!(f, "{}{}{}", order, kind, self.size)
    }
}

/// Memory layout of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ArrayOrder {
    #[default]
    #[serde(rename = "C")]
    C,
    #[serde(rename = "F")]
    F,
}

/// numcodecs compressor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressorConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clevel: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shuffle: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocksize: Option<usize>,
}

impl CompressorConfig {
    pub fn zlib(level: i32) -> Self {
        Self {
            id: "zlib".to_string(),
            level: Some(level),
            cname: None,
            clevel: None,
            shuffle: None,
            blocksize: None,
        }
    }
}

/// Contents of a `.zarray` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayMetadata {
    pub zarr_format: u8,
    pub shape: Vec<usize>,
    pub chunks: Vec<usize>,
    pub dtype: DataType,
    pub compressor: Option<CompressorConfig>,
    #[serde(default)]
    pub fill_value: Value,
    #[serde(default)]
    pub order: ArrayOrder,
    #[serde(default)]
    pub filters: Option<Vec<Value>>,
    #[serde(default = "default_separator")]
    pub dimension_separator: String,
}

fn default_separator() -> String {
    ".".to_string()
}

impl ArrayMetadata {
    /// Parse and sanity-check a `.zarray` document.
    pub fn from_value(key: &str, value: Value) -> Result<Self, ZarrError> {
        let meta: ArrayMetadata =
            serde_json::from_value(value).map_err(|e| ZarrError::InvalidMetadata {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        meta.validate(key)?;
        Ok(meta)
    }

    fn validate(&self, key: &str) -> Result<(), ZarrError> {
        let invalid = |message: String| ZarrError::InvalidMetadata {
            key: key.to_string(),
            message,
        };

        if self.zarr_format != 2 {
            return Err(invalid(format!(
                "zarr_format {} is not supported",
                self.zarr_format
            )));
        }
        if self.shape.len() != self.chunks.len() {
            return Err(invalid(format!(
                "shape has {} dimensions but chunks has {}",
                self.shape.len(),
                self.chunks.len()
            )));
        }
        if self.chunks.iter().any(|&c| c == 0) {
            return Err(invalid("chunk sizes must be positive".to_string()));
        }
        if self.filters.as_ref().is_some_and(|f| !f.is_empty()) {
            return Err(ZarrError::UnsupportedCodec("filters".to_string()));
        }
        if self.dimension_separator != "." && self.dimension_separator != "/" {
            return Err(invalid(format!(
                "dimension_separator {:?}",
                self.dimension_separator
            )));
        }
        Ok(())
    }

    /// Fill value in stored (raw) units, if any.
    pub fn fill_value(&self) -> Option<f64> {
        parse_number(&self.fill_value)
    }
}

/// Parse a JSON number, including the `"NaN"`/`"Infinity"` spellings Zarr uses.
pub fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => match s.as_str() {
            "NaN" => Some(f64::NAN),
            "Infinity" => Some(f64::INFINITY),
            "-Infinity" => Some(f64::NEG_INFINITY),
            _ => None,
        },
        _ => None,
    }
}

/// CF and xarray attributes read from `.zattrs`.
#[derive(Debug, Clone, Default)]
pub struct VariableAttributes {
    pub dimensions: Option<Vec<String>>,
    pub scale_factor: Option<f64>,
    pub add_offset: Option<f64>,
    pub fill_value: Option<f64>,
    pub units: Option<String>,
    pub calendar: Option<String>,
}

impl VariableAttributes {
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let text = |name: &str| map.get(name).and_then(Value::as_str).map(String::from);

        Self {
            dimensions: map
                .get("_ARRAY_DIMENSIONS")
                .and_then(Value::as_array)
                .map(|dims| {
                    dims.iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                }),
            scale_factor: map.get("scale_factor").and_then(parse_number),
            add_offset: map.get("add_offset").and_then(parse_number),
            fill_value: map.get("_FillValue").and_then(parse_number),
            units: text("units"),
            calendar: text("calendar"),
        }
    }
}

/// An opened array: metadata, attributes and its key prefix.
#[derive(Debug, Clone)]
pub struct ZarrArray {
    pub name: String,
    pub meta: ArrayMetadata,
    pub attrs: VariableAttributes,
}

impl ZarrArray {
    pub fn ndim(&self) -> usize {
        self.meta.shape.len()
    }

    pub fn shape(&self) -> &[usize] {
        &self.meta.shape
    }

    /// Number of chunks along each dimension.
    pub fn chunk_grid(&self) -> Vec<usize> {
        self.meta
            .shape
            .iter()
            .zip(&self.meta.chunks)
            .map(|(&n, &c)| n.div_ceil(c))
            .collect()
    }

    /// Element count of one (full-size) chunk.
    pub fn chunk_len(&self) -> usize {
        self.meta.chunks.iter().product()
    }

    /// Store key of the chunk at the given chunk-grid coordinates.
    pub fn chunk_key(&self, coords: &[usize]) -> String {
        let index = if coords.is_empty() {
            "0".to_string()
        } else {
            coords
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(&self.meta.dimension_separator)
        };
        format!("{}/{}", self.name, index)
    }

    /// Dimension names, falling back to `dim_N` when `.zattrs` has none.
    pub fn dimension_names(&self) -> Vec<String> {
        match &self.attrs.dimensions {
            Some(dims) if dims.len() == self.ndim() => dims.clone(),
            _ => (0..self.ndim()).map(|i| format!("dim_{}", i)).collect(),
        }
    }

    /// Raw sentinel marking missing data. `_FillValue` wins over `fill_value`.
    pub fn missing_value(&self) -> Option<f64> {
        self.attrs.fill_value.or_else(|| self.meta.fill_value())
    }

    /// Apply CF packing (`scale_factor`, `add_offset`) to a raw value.
    pub fn unpack(&self, raw: f64) -> f64 {
        raw * self.attrs.scale_factor.unwrap_or(1.0) + self.attrs.add_offset.unwrap_or(0.0)
    }

    pub fn is_packed(&self) -> bool {
        self.attrs.scale_factor.is_some() || self.attrs.add_offset.is_some()
    }
}

/// The consolidated `.zmetadata` document.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsolidatedMetadata {
    pub metadata: HashMap<String, Value>,
}

impl ConsolidatedMetadata {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dtype_parse() {
        let dtype = DataType::try_from("<i2".to_string()).unwrap();
        assert_eq!(dtype.endian, Endian::Little);
        assert_eq!(dtype.kind, ScalarKind::Int);
        assert_eq!(dtype.size, 2);

        let dtype = DataType::try_from(">f8".to_string()).unwrap();
        assert_eq!(dtype.endian, Endian::Big);
        assert_eq!(dtype.kind, ScalarKind::Float);

        assert_eq!(DataType::try_from("|u1".to_string()).unwrap().size, 1);
        assert_eq!(DataType::F64_LE.to_string(), "<f8");
    }

    #[test]
    fn test_dtype_rejects_unsupported() {
        for bad in ["<f2", "<c8", "|i4", "<U10", "f4", ""] {
            assert!(DataType::try_from(bad.to_string()).is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_parse_zarray() {
        let doc = json!({
            "zarr_format": 2,
            "shape": [10, 4, 6],
            "chunks": [5, 4, 4],
            "dtype": "<i2",
            "compressor": {"id": "blosc", "cname": "lz4", "clevel": 5, "shuffle": 1, "blocksize": 0},
            "fill_value": -32768,
            "order": "C",
            "filters": null
        });

        let meta = ArrayMetadata::from_value("sst/.zarray", doc).unwrap();
        assert_eq!(meta.shape, vec![10, 4, 6]);
        assert_eq!(meta.fill_value(), Some(-32768.0));
        assert_eq!(meta.dimension_separator, ".");
        let compressor = meta.compressor.unwrap();
        assert_eq!(compressor.id, "blosc");
        assert_eq!(compressor.cname.as_deref(), Some("lz4"));
    }

    #[test]
    fn test_parse_zarray_mismatched_chunks() {
        let doc = json!({
            "zarr_format": 2,
            "shape": [10, 4],
            "chunks": [5],
            "dtype": "<f4",
            "compressor": null,
            "fill_value": "NaN",
            "order": "C",
            "filters": null
        });
        assert!(ArrayMetadata::from_value("x/.zarray", doc).is_err());
    }

    #[test]
    fn test_parse_number_spellings() {
        assert!(parse_number(&json!("NaN")).unwrap().is_nan());
        assert_eq!(parse_number(&json!("-Infinity")), Some(f64::NEG_INFINITY));
        assert_eq!(parse_number(&json!(1.5)), Some(1.5));
        assert_eq!(parse_number(&json!(null)), None);
    }

    #[test]
    fn test_chunk_grid_and_keys() {
        let meta = ArrayMetadata::from_value(
            "sst/.zarray",
            json!({
                "zarr_format": 2,
                "shape": [10, 4, 6],
                "chunks": [4, 4, 4],
                "dtype": "<f4",
                "compressor": null,
                "fill_value": "NaN",
                "order": "C",
                "filters": null,
                "dimension_separator": "/"
            }),
        )
        .unwrap();
        let array = ZarrArray {
            name: "sst".to_string(),
            meta,
            attrs: VariableAttributes::default(),
        };

        assert_eq!(array.chunk_grid(), vec![3, 1, 2]);
        assert_eq!(array.chunk_len(), 64);
        assert_eq!(array.chunk_key(&[2, 0, 1]), "sst/2/0/1");
        assert_eq!(array.dimension_names(), vec!["dim_0", "dim_1", "dim_2"]);
    }

    #[test]
    fn test_attributes_and_unpack() {
        let attrs = json!({
            "_ARRAY_DIMENSIONS": ["time", "lat", "lon"],
            "scale_factor": 0.001,
            "add_offset": 298.15,
            "_FillValue": -32768,
            "units": "kelvin"
        });
        let attrs = VariableAttributes::from_map(attrs.as_object().unwrap());
        assert_eq!(
            attrs.dimensions.as_deref(),
            Some(&["time".to_string(), "lat".to_string(), "lon".to_string()][..])
        );

        let array = ZarrArray {
            name: "analysed_sst".to_string(),
            meta: ArrayMetadata::from_value(
                "analysed_sst/.zarray",
                json!({
                    "zarr_format": 2, "shape": [1, 1, 1], "chunks": [1, 1, 1],
                    "dtype": "<i2", "compressor": null, "fill_value": 0,
                    "order": "C", "filters": null
                }),
            )
            .unwrap(),
            attrs,
        };

        assert!(array.is_packed());
        assert_eq!(array.missing_value(), Some(-32768.0));
        assert!((array.unpack(1000.0) - 299.15).abs() < 1e-9);
    }
}
