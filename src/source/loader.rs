//! Dataset loading: from store keys to an in-memory [`SstCube`].
//!
//! The variable's coordinates decide which index ranges to read; every chunk
//! holding a selected index is fetched (a bounded number at a time),
//! decoded and copied into place.

use super::cftime::CfTimeUnits;
use super::codec;
use super::error::ZarrError;
use super::metadata::{ArrayMetadata, ArrayOrder, ConsolidatedMetadata, VariableAttributes, ZarrArray};
use super::store::ChunkStore;
use crate::models::{GeoBounds, SstCube, TemporalAggregation, TimeWindow};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{s, Array2, Array3, ArrayD, Axis, Ix3, IxDyn, ShapeBuilder, Slice};
use serde_json::Value;
use std::ops::Range;
use tracing::{debug, info, warn};

/// What to read from the store and how to shape it.
#[derive(Debug, Clone)]
pub struct SelectionRequest {
    pub variable: String,
    pub time_name: String,
    pub lat_name: String,
    pub lon_name: String,
    pub bounds: GeoBounds,
    pub window: TimeWindow,
    pub stride: usize,
    pub aggregation: TemporalAggregation,
    pub to_celsius: bool,
    pub concurrency: usize,
    pub show_progress: bool,
}

/// Index ranges and coordinates resolved from a [`SelectionRequest`].
#[derive(Debug, Clone)]
pub struct SelectionPlan {
    pub variable: ZarrArray,
    pub time_range: Range<usize>,
    pub lat_range: Range<usize>,
    pub lon_range: Range<usize>,
    pub time: Vec<DateTime<Utc>>,
    pub lat: Vec<f64>,
    pub lon: Vec<f64>,
    /// Position of the time, lat and lon axes in the stored array.
    pub axis_positions: [usize; 3],
    /// Spatial step; `lat` and `lon` already hold only the kept points.
    pub stride: usize,
    pub chunk_count: usize,
    /// Uncompressed bytes of every chunk that will be fetched.
    pub estimated_bytes: u64,
}

/// An opened Zarr hierarchy.
pub struct Dataset<'a> {
    store: &'a dyn ChunkStore,
    consolidated: Option<ConsolidatedMetadata>,
}

impl<'a> Dataset<'a> {
    /// Open a store, using consolidated metadata when present.
    pub async fn open(store: &'a dyn ChunkStore) -> Result<Self> {
        let consolidated = match store.get(".zmetadata").await? {
            Some(bytes) => {
                let parsed: ConsolidatedMetadata = serde_json::from_slice(&bytes)
                    .context("Failed to parse consolidated .zmetadata")?;
                debug!("Consolidated metadata with {} entries", parsed.metadata.len());
                Some(parsed)
            }
            None => {
                debug!("No consolidated metadata at {}", store.location());
                None
            }
        };

        Ok(Self {
            store,
            consolidated,
        })
    }

    pub fn location(&self) -> &str {
        self.store.location()
    }

    async fn document(&self, key: &str) -> Result<Option<Value>> {
        if let Some(value) = self.consolidated.as_ref().and_then(|c| c.get(key)) {
            return Ok(Some(value.clone()));
        }
        match self.store.get(key).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Failed to parse {}", key))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Open the array stored under `name`.
    pub async fn array(&self, name: &str) -> Result<ZarrArray> {
        let zarray_key = format!("{}/.zarray", name);
        let zarray = self
            .document(&zarray_key)
            .await?
            .ok_or_else(|| ZarrError::MissingMetadata(zarray_key.clone()))?;
        let meta = ArrayMetadata::from_value(&zarray_key, zarray)?;

        let attrs = match self.document(&format!("{}/.zattrs", name)).await? {
            Some(Value::Object(map)) => VariableAttributes::from_map(&map),
            _ => VariableAttributes::default(),
        };

        Ok(ZarrArray {
            name: name.to_string(),
            meta,
            attrs,
        })
    }

    /// Read a whole 1-D coordinate array.
    pub async fn read_coordinate(
        &self,
        name: &str,
        concurrency: usize,
    ) -> Result<(ZarrArray, Vec<f64>)> {
        let array = self.array(name).await?;
        if array.ndim() != 1 {
            bail!("Coordinate {} has {} dimensions, expected 1", name, array.ndim());
        }
        let values = self
            .read_subset(&array, &[0..array.shape()[0]], concurrency, None)
            .await?;
        Ok((array, values.iter().copied().collect()))
    }

    /// Read the hyper-rectangle `ranges` (one range per dimension) as `f64`.
    ///
    /// Missing chunks read as NaN; packed integers are unpacked.
    pub async fn read_subset(
        &self,
        array: &ZarrArray,
        ranges: &[Range<usize>],
        concurrency: usize,
        progress: Option<&ProgressBar>,
    ) -> Result<ArrayD<f64>> {
        let steps = vec![1; ranges.len()];
        self.read_strided(array, ranges, &steps, concurrency, progress)
            .await
    }

    /// Like [`read_subset`](Self::read_subset), keeping every `steps[d]`-th
    /// index of each range. Chunks holding no kept index are not fetched.
    pub async fn read_strided(
        &self,
        array: &ZarrArray,
        ranges: &[Range<usize>],
        steps: &[usize],
        concurrency: usize,
        progress: Option<&ProgressBar>,
    ) -> Result<ArrayD<f64>> {
        if ranges.len() != array.ndim() || steps.len() != array.ndim() {
            bail!(
                "Selection has {} ranges for {}-dimensional array {}",
                ranges.len(),
                array.ndim(),
                array.name
            );
        }
        for (range, &len) in ranges.iter().zip(array.shape()) {
            if range.start >= range.end || range.end > len {
                bail!("Selection {:?} is outside {} (len {})", range, array.name, len);
            }
        }

        if steps.iter().any(|&s| s == 0) {
            bail!("Selection steps must be positive, got {:?}", steps);
        }

        let out_shape: Vec<usize> = ranges
            .iter()
            .zip(steps)
            .map(|(r, &step)| r.len().div_ceil(step))
            .collect();
        let mut out = ArrayD::from_elem(IxDyn(&out_shape), f64::NAN);
        let coords = strided_chunks(ranges, steps, &array.meta.chunks);

        let mut fetches = stream::iter(coords)
            .map(|coords| async move {
                let key = array.chunk_key(&coords);
                let raw = self.store.get(&key).await?;
                let chunk = match raw {
                    Some(bytes) => Some(decode_chunk(array, &key, &bytes)?),
                    None => None,
                };
                Ok::<_, anyhow::Error>((coords, chunk))
            })
            .buffer_unordered(concurrency.max(1));

        while let Some(result) = fetches.next().await {
            let (coords, chunk) = result?;
            if let Some(pb) = progress {
                pb.inc(1);
            }
            let Some(chunk) = chunk else {
                debug!("Chunk {:?} of {} absent, left as fill", coords, array.name);
                continue;
            };

            let mut src = Vec::with_capacity(ranges.len());
            let mut dst = Vec::with_capacity(ranges.len());
            for (d, range) in ranges.iter().enumerate() {
                let (from, to) = axis_overlap(range, steps[d], coords[d], array.meta.chunks[d])
                    .context("Fetched a chunk outside the selection")?;
                src.push(from);
                dst.push(to);
            }

            out.slice_each_axis_mut(|ax| Slice::from(dst[ax.axis.index()].clone()))
                .assign(&chunk.slice_each_axis(|ax| src[ax.axis.index()]));
        }

        Ok(out)
    }
}

fn decode_chunk(array: &ZarrArray, key: &str, bytes: &[u8]) -> Result<ArrayD<f64>> {
    let raw = codec::decompress(array.meta.compressor.as_ref(), bytes)?;
    let mut values = codec::decode_values(&raw, array.meta.dtype, array.missing_value())?;

    if values.len() != array.chunk_len() {
        return Err(ZarrError::CorruptChunk {
            key: key.to_string(),
            message: format!("{} values, expected {}", values.len(), array.chunk_len()),
        }
        .into());
    }
    if array.is_packed() {
        values.iter_mut().for_each(|v| *v = array.unpack(*v));
    }

    let shape = IxDyn(&array.meta.chunks);
    let chunk = match array.meta.order {
        ArrayOrder::C => ArrayD::from_shape_vec(shape, values),
        ArrayOrder::F => ArrayD::from_shape_vec(shape.f(), values),
    }
    .with_context(|| format!("Chunk {} does not match its shape", key))?;
    Ok(chunk)
}

/// Chunk-grid coordinates of every chunk that intersects `ranges`.
pub fn chunks_overlapping(ranges: &[Range<usize>], chunks: &[usize]) -> Vec<Vec<usize>> {
    let mut result: Vec<Vec<usize>> = vec![Vec::new()];
    for (range, &chunk) in ranges.iter().zip(chunks) {
        let first = range.start / chunk;
        let last = (range.end - 1) / chunk;
        result = result
            .into_iter()
            .flat_map(|prefix| {
                (first..=last).map(move |c| {
                    let mut next = prefix.clone();
                    next.push(c);
                    next
                })
            })
            .collect();
    }
    result
}

/// Where chunk `chunk_index` meets the strided selection along one axis.
///
/// Returns the slice of kept indices inside the chunk and the output
/// positions they land on, or `None` when the chunk holds no kept index.
fn axis_overlap(
    range: &Range<usize>,
    step: usize,
    chunk_index: usize,
    chunk: usize,
) -> Option<(Slice, Range<usize>)> {
    let origin = chunk_index * chunk;
    let lo = range.start.max(origin);
    let hi = range.end.min(origin + chunk);
    if lo >= hi {
        return None;
    }

    // First kept index at or after `lo`
    let first = range.start + (lo - range.start).div_ceil(step) * step;
    if first >= hi {
        return None;
    }
    let count = (hi - first).div_ceil(step);
    let out_start = (first - range.start) / step;

    let src = Slice::new(
        (first - origin) as isize,
        Some((hi - origin) as isize),
        step as isize,
    );
    Some((src, out_start..out_start + count))
}

/// Chunks intersecting `ranges` that hold at least one kept index.
pub fn strided_chunks(
    ranges: &[Range<usize>],
    steps: &[usize],
    chunks: &[usize],
) -> Vec<Vec<usize>> {
    chunks_overlapping(ranges, chunks)
        .into_iter()
        .filter(|coords| {
            coords
                .iter()
                .enumerate()
                .all(|(d, &c)| axis_overlap(&ranges[d], steps[d], c, chunks[d]).is_some())
        })
        .collect()
}

/// Contiguous index range of coordinate values inside `[lo, hi]`.
pub fn index_range(coord: &[f64], lo: f64, hi: f64) -> Option<Range<usize>> {
    let first = coord.iter().position(|&c| c >= lo && c <= hi)?;
    let last = coord.iter().rposition(|&c| c >= lo && c <= hi)?;
    Some(first..last + 1)
}

fn matches_role(name: &str, wanted: &str, aliases: &[&str]) -> bool {
    name.eq_ignore_ascii_case(wanted) || aliases.iter().any(|a| name.eq_ignore_ascii_case(a))
}

fn axis_positions(variable: &ZarrArray, request: &SelectionRequest) -> Result<[usize; 3]> {
    if variable.ndim() != 3 {
        bail!(
            "Variable {} has {} dimensions, expected (time, lat, lon)",
            variable.name,
            variable.ndim()
        );
    }
    if variable.attrs.dimensions.is_none() {
        debug!("{} has no dimension names, assuming (time, lat, lon)", variable.name);
        return Ok([0, 1, 2]);
    }

    let names = variable.dimension_names();
    let find = |wanted: &str, aliases: &[&str]| {
        names
            .iter()
            .position(|n| matches_role(n, wanted, aliases))
            .with_context(|| format!("Variable {} has no {} dimension ({:?})", variable.name, wanted, names))
    };

    Ok([
        find(&request.time_name, &["time", "t"])?,
        find(&request.lat_name, &["lat", "latitude", "y"])?,
        find(&request.lon_name, &["lon", "longitude", "x"])?,
    ])
}

/// Resolve the request against the store's coordinates.
pub async fn plan_selection(dataset: &Dataset<'_>, request: &SelectionRequest) -> Result<SelectionPlan> {
    let variable = dataset
        .array(&request.variable)
        .await
        .with_context(|| format!("Failed to open variable {}", request.variable))?;
    let axis_positions = axis_positions(&variable, request)?;

    let concurrency = request.concurrency;
    let (time_array, raw_time) = dataset
        .read_coordinate(&request.time_name, concurrency)
        .await
        .context("Failed to read time coordinate")?;
    let (_, lat) = dataset
        .read_coordinate(&request.lat_name, concurrency)
        .await
        .context("Failed to read latitude coordinate")?;
    let (_, lon) = dataset
        .read_coordinate(&request.lon_name, concurrency)
        .await
        .context("Failed to read longitude coordinate")?;

    let shape = variable.shape();
    let expected = [raw_time.len(), lat.len(), lon.len()];
    for (role, (&position, &len)) in ["time", "lat", "lon"]
        .iter()
        .zip(axis_positions.iter().zip(&expected))
    {
        if shape[position] != len {
            bail!(
                "Variable {} has {} {} steps but the coordinate has {}",
                variable.name,
                shape[position],
                role,
                len
            );
        }
    }

    let time_units = time_array
        .attrs
        .units
        .as_deref()
        .context("Time coordinate has no units attribute")?;
    let units = CfTimeUnits::parse(time_units, time_array.attrs.calendar.as_deref())?;
    let time: Vec<DateTime<Utc>> = raw_time
        .iter()
        .map(|&t| units.to_datetime(t))
        .collect::<Result<_>>()?;

    let mut bounds = request.bounds;
    if lon.iter().any(|&l| l > 180.0) && (bounds.lon_min < 0.0 || bounds.lon_max < 0.0) {
        bounds = bounds.to_positive_longitudes();
        debug!("Store uses 0..360 longitudes; bounds now {}", bounds);
    }
    if bounds.lon_min > bounds.lon_max {
        bail!("Longitude range {} crosses the dateline, which is not supported", bounds);
    }

    let time_range = {
        let first = time.iter().position(|t| request.window.contains(t));
        let last = time.iter().rposition(|t| request.window.contains(t));
        match (first, last) {
            (Some(first), Some(last)) => first..last + 1,
            _ => bail!(
                "No time steps between {} and {}",
                request.window.start,
                request.window.end
            ),
        }
    };
    let lat_range = index_range(&lat, bounds.lat_min, bounds.lat_max)
        .with_context(|| format!("No latitudes inside {}", bounds))?;
    let lon_range = index_range(&lon, bounds.lon_min, bounds.lon_max)
        .with_context(|| format!("No longitudes inside {}", bounds))?;

    let stride = request.stride.max(1);
    let (native, steps) = native_selection(
        axis_positions,
        [&time_range, &lat_range, &lon_range],
        stride,
    );
    let chunk_count = strided_chunks(&native, &steps, &variable.meta.chunks).len();
    let estimated_bytes =
        (chunk_count * variable.chunk_len() * variable.meta.dtype.size) as u64;

    Ok(SelectionPlan {
        time: time[time_range.clone()].to_vec(),
        lat: lat[lat_range.clone()].iter().step_by(stride).copied().collect(),
        lon: lon[lon_range.clone()].iter().step_by(stride).copied().collect(),
        variable,
        time_range,
        lat_range,
        lon_range,
        axis_positions,
        stride,
        chunk_count,
        estimated_bytes,
    })
}

/// Ranges and steps in the stored axis order. Time is never strided.
fn native_selection(
    axis_positions: [usize; 3],
    ranges: [&Range<usize>; 3],
    stride: usize,
) -> (Vec<Range<usize>>, Vec<usize>) {
    let mut native = vec![0..0; 3];
    let mut steps = vec![1; 3];
    for (role, &position) in axis_positions.iter().enumerate() {
        native[position] = ranges[role].clone();
        if role > 0 {
            steps[position] = stride;
        }
    }
    (native, steps)
}

/// Fetch the planned selection and shape it into a cube.
pub async fn load_cube(
    dataset: &Dataset<'_>,
    plan: &SelectionPlan,
    request: &SelectionRequest,
) -> Result<SstCube> {
    let [pt, pla, plo] = plan.axis_positions;
    let (native, steps) = native_selection(
        plan.axis_positions,
        [&plan.time_range, &plan.lat_range, &plan.lon_range],
        plan.stride,
    );

    let progress = request.show_progress.then(|| {
        let pb = ProgressBar::new(plan.chunk_count as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb
    });

    info!(
        "Fetching {} chunks of {} from {}",
        plan.chunk_count,
        plan.variable.name,
        dataset.location()
    );
    let subset = dataset
        .read_strided(
            &plan.variable,
            &native,
            &steps,
            request.concurrency,
            progress.as_ref(),
        )
        .await?;
    if let Some(pb) = progress {
        pb.finish_with_message("Download complete");
    }

    let values = subset
        .permuted_axes(&[pt, pla, plo][..])
        .into_dimensionality::<Ix3>()
        .context("Selection is not three-dimensional")?
        .as_standard_layout()
        .into_owned();

    let mut cube = SstCube {
        time: plan.time.clone(),
        lat: plan.lat.clone(),
        lon: plan.lon.clone(),
        values,
        units: plan.variable.attrs.units.clone().unwrap_or_default(),
    };

    if request.to_celsius {
        convert_to_celsius(&mut cube);
    }
    if request.aggregation == TemporalAggregation::Monthly {
        cube = aggregate_monthly(&cube)?;
    }

    let valid = cube.valid_fraction();
    if valid == 0.0 {
        warn!("Selection contains no valid values");
    }
    debug!("Loaded cube {:?}, {:.1}% valid", cube.values.dim(), valid * 100.0);

    Ok(cube)
}

fn is_kelvin(units: &str) -> bool {
    matches!(
        units.trim().to_lowercase().as_str(),
        "k" | "kelvin" | "kelvins" | "degrees_k" | "degk" | "deg_k"
    )
}

/// Convert Kelvin values to degrees Celsius in place; other units are left alone.
pub fn convert_to_celsius(cube: &mut SstCube) {
    if is_kelvin(&cube.units) {
        cube.values.mapv_inplace(|v| v - 273.15);
        cube.units = "degC".to_string();
    }
}

/// Average each calendar month, ignoring NaN. Months with no data stay NaN.
pub fn aggregate_monthly(cube: &SstCube) -> Result<SstCube> {
    let (nlat, nlon) = cube.grid_shape();
    let mut groups: Vec<(NaiveDate, Range<usize>)> = Vec::new();

    for (i, t) in cube.time.iter().enumerate() {
        let month = NaiveDate::from_ymd_opt(t.year(), t.month(), 1)
            .with_context(|| format!("Invalid month for {}", t))?;
        match groups.last_mut() {
            Some((m, range)) if *m == month => range.end = i + 1,
            Some((m, _)) if *m > month => bail!("Time coordinate is not sorted at {}", t),
            _ => groups.push((month, i..i + 1)),
        }
    }

    let mut values = Array3::from_elem((groups.len(), nlat, nlon), f64::NAN);
    for (g, (_, range)) in groups.iter().enumerate() {
        let block = cube.values.slice(s![range.clone(), .., ..]);
        let mut sum = Array2::<f64>::zeros((nlat, nlon));
        let mut count = Array2::<f64>::zeros((nlat, nlon));
        for step in block.axis_iter(Axis(0)) {
            ndarray::Zip::from(&mut sum)
                .and(&mut count)
                .and(&step)
                .for_each(|s, c, &v| {
                    if v.is_finite() {
                        *s += v;
                        *c += 1.0;
                    }
                });
        }
        let mean = ndarray::Zip::from(&sum)
            .and(&count)
            .map_collect(|&s, &c| if c > 0.0 { s / c } else { f64::NAN });
        values.index_axis_mut(Axis(0), g).assign(&mean);
    }

    let time = groups
        .iter()
        .map(|(month, _)| {
            month
                .and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc())
                .context("Invalid month start")
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(SstCube {
        time,
        lat: cube.lat.clone(),
        lon: cube.lon.clone(),
        values,
        units: cube.units.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputStore;
    use crate::source::store::FileStore;
    use chrono::TimeZone;
    use ndarray::Array1;
    use serde_json::{json, Map};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn cube_with(time: Vec<DateTime<Utc>>, values: Array3<f64>) -> SstCube {
        let (_, nlat, nlon) = values.dim();
        SstCube {
            time,
            lat: (0..nlat).map(|i| i as f64).collect(),
            lon: (0..nlon).map(|i| i as f64).collect(),
            values,
            units: "kelvin".to_string(),
        }
    }

    #[test]
    fn test_chunks_overlapping() {
        let coords = chunks_overlapping(&[3..9, 0..2], &[4, 5]);
        assert_eq!(coords, vec![vec![0, 0], vec![1, 0], vec![2, 0]]);

        let coords = chunks_overlapping(&[0..4], &[4]);
        assert_eq!(coords, vec![vec![0]]);
    }

    #[test]
    fn test_index_range_ascending_and_descending() {
        let asc = [10.0, 10.5, 11.0, 11.5, 12.0];
        assert_eq!(index_range(&asc, 10.4, 11.5), Some(1..4));

        let desc = [12.0, 11.5, 11.0, 10.5, 10.0];
        assert_eq!(index_range(&desc, 10.4, 11.5), Some(1..4));

        assert_eq!(index_range(&asc, 20.0, 21.0), None);
    }

    /// Four days of `t * 100 + i * 10 + j` on a 4x4 grid in (2, 2, 2) chunks.
    fn write_grid(path: &Path, lon: [f64; 4]) {
        let mut store = OutputStore::create(path, 1).unwrap();
        let mut time_attrs = Map::new();
        time_attrs.insert("units".to_string(), json!("days since 2020-01-01"));
        let time = Array1::from(vec![0.0, 1.0, 2.0, 3.0]);
        store
            .write_array("time", &["time"], time.view().into_dyn(), &[4], time_attrs)
            .unwrap();
        let lat = Array1::from(vec![0.0, 1.0, 2.0, 3.0]);
        store
            .write_array("lat", &["lat"], lat.view().into_dyn(), &[4], Map::new())
            .unwrap();
        let lon = Array1::from(lon.to_vec());
        store
            .write_array("lon", &["lon"], lon.view().into_dyn(), &[4], Map::new())
            .unwrap();
        let sst = Array3::from_shape_fn((4, 4, 4), |(t, i, j)| (t * 100 + i * 10 + j) as f64);
        store
            .write_array(
                "sst",
                &["time", "lat", "lon"],
                sst.view().into_dyn(),
                &[2, 2, 2],
                Map::new(),
            )
            .unwrap();
        store.finish().unwrap();
    }

    fn request(bounds: GeoBounds) -> SelectionRequest {
        SelectionRequest {
            variable: "sst".to_string(),
            time_name: "time".to_string(),
            lat_name: "lat".to_string(),
            lon_name: "lon".to_string(),
            bounds,
            window: TimeWindow {
                start: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(),
            },
            stride: 1,
            aggregation: TemporalAggregation::None,
            to_celsius: false,
            concurrency: 2,
            show_progress: false,
        }
    }

    #[test]
    fn test_axis_overlap() {
        // Kept indices 1, 4 and 7 over chunks of 4
        let (src, dst) = axis_overlap(&(1..8), 3, 0, 4).unwrap();
        assert_eq!(src, Slice::new(1, Some(4), 3));
        assert_eq!(dst, 0..1);
        let (src, dst) = axis_overlap(&(1..8), 3, 1, 4).unwrap();
        assert_eq!(src, Slice::new(0, Some(4), 3));
        assert_eq!(dst, 1..3);

        // Chunk 2..4 sits between kept indices 0 and 4
        assert!(axis_overlap(&(0..9), 4, 1, 2).is_none());
        assert_eq!(strided_chunks(&[0..9], &[4], &[2]), vec![vec![0], vec![2], vec![4]]);
    }

    #[tokio::test]
    async fn test_missing_chunk_reads_as_nan() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("grid.zarr");
        let mut store = OutputStore::create(&path, 1).unwrap();
        let grid = Array2::from_shape_fn((5, 6), |(i, j)| (i * 10 + j) as f64);
        store
            .write_array("grid", &["y", "x"], grid.view().into_dyn(), &[2, 2], Map::new())
            .unwrap();
        store.finish().unwrap();
        fs::remove_file(path.join("grid").join("0.1")).unwrap();

        let files = FileStore::new(&path);
        let dataset = Dataset::open(&files).await.unwrap();
        let array = dataset.array("grid").await.unwrap();
        let values = dataset
            .read_subset(&array, &[0..5, 0..6], 2, None)
            .await
            .unwrap();

        assert_eq!(values.shape(), &[5, 6]);
        assert!(values[[0, 2]].is_nan());
        assert!(values[[1, 3]].is_nan());
        assert_eq!(values[[0, 1]], 1.0);
        assert_eq!(values[[1, 4]], 14.0);
        assert_eq!(values[[4, 5]], 45.0);
    }

    #[tokio::test]
    async fn test_read_strided_skips_unselected_chunks() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("grid.zarr");
        let mut store = OutputStore::create(&path, 1).unwrap();
        let grid = Array2::from_shape_fn((5, 6), |(i, j)| (i * 10 + j) as f64);
        store
            .write_array("grid", &["y", "x"], grid.view().into_dyn(), &[2, 2], Map::new())
            .unwrap();
        store.finish().unwrap();
        // Row 4 is never kept with a step of 3; reading it would fail to decode
        for col in 0..3 {
            fs::write(path.join("grid").join(format!("2.{}", col)), b"garbage").unwrap();
        }

        let files = FileStore::new(&path);
        let dataset = Dataset::open(&files).await.unwrap();
        let array = dataset.array("grid").await.unwrap();
        let values = dataset
            .read_strided(&array, &[0..5, 1..6], &[3, 2], 2, None)
            .await
            .unwrap();

        assert_eq!(values.shape(), &[2, 3]);
        assert_eq!(values[[0, 0]], 1.0);
        assert_eq!(values[[0, 2]], 5.0);
        assert_eq!(values[[1, 1]], 33.0);
        assert_eq!(values[[1, 2]], 35.0);
    }

    #[tokio::test]
    async fn test_fortran_order_chunk() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("f");
        fs::create_dir_all(&dir).unwrap();
        let zarray = json!({
            "zarr_format": 2,
            "shape": [2, 3],
            "chunks": [2, 3],
            "dtype": "<f8",
            "compressor": null,
            "fill_value": "NaN",
            "order": "F",
            "filters": null
        });
        fs::write(dir.join(".zarray"), zarray.to_string()).unwrap();
        // Column-major [[0, 1, 2], [10, 11, 12]]
        let raw = codec::encode_f64(&[0.0, 10.0, 1.0, 11.0, 2.0, 12.0]);
        fs::write(dir.join("0.0"), raw).unwrap();

        let files = FileStore::new(temp_dir.path());
        let dataset = Dataset::open(&files).await.unwrap();
        let array = dataset.array("f").await.unwrap();
        let values = dataset
            .read_subset(&array, &[0..2, 0..3], 1, None)
            .await
            .unwrap();

        assert_eq!(values[[0, 1]], 1.0);
        assert_eq!(values[[1, 0]], 10.0);
        assert_eq!(values[[1, 2]], 12.0);
    }

    #[tokio::test]
    async fn test_plan_remaps_negative_longitudes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("grid.zarr");
        write_grid(&path, [200.0, 230.0, 240.0, 250.0]);

        let files = FileStore::new(&path);
        let dataset = Dataset::open(&files).await.unwrap();
        let bounds = GeoBounds {
            lat_min: 0.0,
            lat_max: 3.0,
            lon_min: -135.0,
            lon_max: -115.0,
        };
        let plan = plan_selection(&dataset, &request(bounds)).await.unwrap();
        assert_eq!(plan.lon, vec![230.0, 240.0]);
        assert_eq!(plan.lon_range, 1..3);
        assert_eq!(plan.time.len(), 4);

        let dateline = GeoBounds {
            lon_min: -10.0,
            lon_max: 10.0,
            ..bounds
        };
        let err = plan_selection(&dataset, &request(dateline)).await.unwrap_err();
        assert!(err.to_string().contains("dateline"));
    }

    #[tokio::test]
    async fn test_plan_and_load_with_stride() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("grid.zarr");
        write_grid(&path, [0.0, 1.0, 2.0, 3.0]);

        let files = FileStore::new(&path);
        let dataset = Dataset::open(&files).await.unwrap();
        let mut req = request(GeoBounds {
            lat_min: 0.0,
            lat_max: 3.0,
            lon_min: 0.0,
            lon_max: 3.0,
        });
        req.stride = 3;
        let plan = plan_selection(&dataset, &req).await.unwrap();
        assert_eq!(plan.lat, vec![0.0, 3.0]);
        assert_eq!(plan.lon, vec![0.0, 3.0]);
        assert_eq!(plan.chunk_count, 8);

        let cube = load_cube(&dataset, &plan, &req).await.unwrap();
        assert_eq!(cube.values.dim(), (4, 2, 2));
        assert_eq!(cube.values[(0, 1, 1)], 33.0);
        assert_eq!(cube.values[(3, 1, 0)], 330.0);
    }

    #[tokio::test]
    async fn test_load_packed_integers() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("packed.zarr");
        let mut store = OutputStore::create(&path, 1).unwrap();
        let mut time_attrs = Map::new();
        time_attrs.insert("units".to_string(), json!("days since 2020-01-01"));
        let time = Array1::from(vec![0.0, 1.0]);
        store
            .write_array("time", &["time"], time.view().into_dyn(), &[2], time_attrs)
            .unwrap();
        let axis = Array1::from(vec![0.0, 1.0]);
        store
            .write_array("lat", &["lat"], axis.view().into_dyn(), &[2], Map::new())
            .unwrap();
        store
            .write_array("lon", &["lon"], axis.view().into_dyn(), &[2], Map::new())
            .unwrap();
        store.finish().unwrap();

        // Not in the consolidated metadata, so read straight from the store
        let dir = path.join("sst");
        fs::create_dir_all(&dir).unwrap();
        let zarray = json!({
            "zarr_format": 2,
            "shape": [2, 2, 2],
            "chunks": [2, 2, 2],
            "dtype": "<i2",
            "compressor": null,
            "fill_value": null,
            "order": "C",
            "filters": null
        });
        fs::write(dir.join(".zarray"), zarray.to_string()).unwrap();
        let zattrs = json!({
            "_ARRAY_DIMENSIONS": ["time", "lat", "lon"],
            "scale_factor": 0.01,
            "add_offset": 273.15,
            "_FillValue": -32768,
            "units": "kelvin"
        });
        fs::write(dir.join(".zattrs"), zattrs.to_string()).unwrap();
        let raw: Vec<u8> = [1000i16, -32768, 0, 500, 1000, 1000, 1000, -100]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        fs::write(dir.join("0.0.0"), raw).unwrap();

        let files = FileStore::new(&path);
        let dataset = Dataset::open(&files).await.unwrap();
        let mut req = request(GeoBounds {
            lat_min: 0.0,
            lat_max: 1.0,
            lon_min: 0.0,
            lon_max: 1.0,
        });
        req.to_celsius = true;
        let plan = plan_selection(&dataset, &req).await.unwrap();
        let cube = load_cube(&dataset, &plan, &req).await.unwrap();

        assert_eq!(cube.units, "degC");
        assert!((cube.values[(0, 0, 0)] - 10.0).abs() < 1e-9);
        assert!(cube.values[(0, 0, 1)].is_nan());
        assert!(cube.values[(0, 1, 0)].abs() < 1e-9);
        assert!((cube.values[(1, 1, 1)] + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_convert_to_celsius() {
        let mut cube = cube_with(vec![Utc::now()], Array3::from_elem((1, 1, 1), 300.0));
        convert_to_celsius(&mut cube);
        assert!((cube.values[(0, 0, 0)] - 26.85).abs() < 1e-9);
        assert_eq!(cube.units, "degC");

        // Already Celsius: untouched
        convert_to_celsius(&mut cube);
        assert!((cube.values[(0, 0, 0)] - 26.85).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_monthly_skips_nan() {
        let time = vec![
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2020, 1, 15, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2020, 2, 3, 0, 0, 0).unwrap(),
        ];
        let mut values = Array3::from_elem((3, 1, 2), 1.0);
        values[(1, 0, 0)] = 3.0;
        values[(1, 0, 1)] = f64::NAN;
        values[(2, 0, 1)] = f64::NAN;

        let monthly = aggregate_monthly(&cube_with(time, values)).unwrap();
        assert_eq!(monthly.values.dim(), (2, 1, 2));
        assert_eq!(monthly.values[(0, 0, 0)], 2.0);
        assert_eq!(monthly.values[(0, 0, 1)], 1.0);
        assert!(monthly.values[(1, 0, 1)].is_nan());
        assert_eq!(monthly.time[1], Utc.with_ymd_and_hms(2020, 2, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_aggregate_monthly_rejects_unsorted() {
        let time = vec![
            Utc.with_ymd_and_hms(2020, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        ];
        let cube = cube_with(time, Array3::zeros((2, 1, 1)));
        assert!(aggregate_monthly(&cube).is_err());
    }
}
