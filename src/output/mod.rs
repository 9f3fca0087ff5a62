//! Gridded output of the analysis.

pub mod zarr_writer;

pub use zarr_writer::OutputStore;

use crate::analysis::harmonic::COEFF_NAMES;
use crate::models::{HarmonicFit, HeatwaveDetection, SstCube};
use crate::source::cftime::CfTimeUnits;
use anyhow::Result;
use chrono::Utc;
use ndarray::{Array1, Array2, Array3};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tracing::info;
use zarr_writer::chunk_shape;

/// Time axis encoding used for the output store.
const TIME_UNITS: &str = "days since 1970-01-01 00:00:00";

/// Largest chunk along (time, lat, lon).
const CHUNK_CAPS: [usize; 3] = [365, 256, 256];

/// Run-level values recorded as root attributes.
#[derive(Debug, Clone)]
pub struct OutputAttributes {
    pub source: String,
    pub variable: String,
    pub min_duration: usize,
    pub compression_level: u32,
}

fn attrs(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn write_grid(
    store: &mut OutputStore,
    name: &str,
    layer: &Array2<f64>,
    long_name: &str,
    units: &str,
) -> Result<()> {
    let chunks = chunk_shape(layer.shape(), &CHUNK_CAPS[1..]);
    store.write_array(
        name,
        &["lat", "lon"],
        layer.view().into_dyn(),
        &chunks,
        attrs(&[("long_name", json!(long_name)), ("units", json!(units))]),
    )
}

fn write_cube(
    store: &mut OutputStore,
    name: &str,
    layer: &Array3<f64>,
    long_name: &str,
    units: &str,
) -> Result<()> {
    let chunks = chunk_shape(layer.shape(), &CHUNK_CAPS);
    store.write_array(
        name,
        &["time", "lat", "lon"],
        layer.view().into_dyn(),
        &chunks,
        attrs(&[("long_name", json!(long_name)), ("units", json!(units))]),
    )
}

/// Write every derived layer into a fresh store at `path`.
pub fn write_results(
    path: &Path,
    cube: &SstCube,
    fit: &HarmonicFit,
    detection: &HeatwaveDetection,
    run: &OutputAttributes,
) -> Result<PathBuf> {
    let mut store = OutputStore::create(path, run.compression_level)?;
    let units = cube.units.as_str();
    let per_year = format!("{} year-1", units);

    // Coordinates
    let time_units = CfTimeUnits::parse(TIME_UNITS, Some("standard"))?;
    let time = Array1::from_iter(cube.time.iter().map(|t| time_units.from_datetime(t)));
    store.write_array(
        "time",
        &["time"],
        time.view().into_dyn(),
        &[time.len().max(1)],
        attrs(&[
            ("standard_name", json!("time")),
            ("units", json!(TIME_UNITS)),
            ("calendar", json!("standard")),
        ]),
    )?;
    for (name, values, coord_units) in [
        ("lat", &cube.lat, "degrees_north"),
        ("lon", &cube.lon, "degrees_east"),
    ] {
        let coord = Array1::from(values.clone());
        store.write_array(
            name,
            &[name],
            coord.view().into_dyn(),
            &[coord.len().max(1)],
            attrs(&[("units", json!(coord_units))]),
        )?;
    }

    write_cube(&mut store, "sst", &cube.values, "sea surface temperature", units)?;
    write_grid(&mut store, "mean", &fit.mean, "harmonic model intercept", units)?;
    write_grid(&mut store, "trend", &fit.trend, "linear trend", &per_year)?;
    write_grid(
        &mut store,
        "annual_amplitude",
        &fit.annual_amplitude,
        "annual cycle amplitude",
        units,
    )?;
    write_grid(
        &mut store,
        "semiannual_amplitude",
        &fit.semiannual_amplitude,
        "semiannual cycle amplitude",
        units,
    )?;
    write_cube(&mut store, "seasonal", &fit.seasonal, "seasonal cycle", units)?;
    write_cube(&mut store, "anomaly", &fit.anomaly, "residual anomaly", units)?;

    let coefficient_chunks = chunk_shape(fit.coefficients.shape(), &[COEFF_NAMES.len(), 256, 256]);
    store.write_array(
        "harmonic_coefficients",
        &["coefficient", "lat", "lon"],
        fit.coefficients.view().into_dyn(),
        &coefficient_chunks,
        attrs(&[
            ("long_name", json!("harmonic regression coefficients")),
            ("coefficient_names", json!(COEFF_NAMES)),
            ("t_ref", json!(fit.t_ref)),
        ]),
    )?;

    let grid = &detection.grid;
    write_grid(&mut store, "mhw_count", &grid.count, "number of heatwave events", "1")?;
    write_grid(
        &mut store,
        "mhw_duration_max",
        &grid.duration_max,
        "longest heatwave duration",
        "time steps",
    )?;
    write_grid(
        &mut store,
        "mhw_duration_mean",
        &grid.duration_mean,
        "mean heatwave duration",
        "time steps",
    )?;
    write_grid(
        &mut store,
        "mhw_total_steps",
        &grid.total_steps,
        "time steps in heatwave conditions",
        "time steps",
    )?;
    write_grid(
        &mut store,
        "mhw_intensity_max",
        &grid.intensity_max,
        "peak heatwave anomaly",
        units,
    )?;
    write_grid(
        &mut store,
        "mhw_intensity_mean",
        &grid.intensity_mean,
        "mean heatwave anomaly",
        units,
    )?;

    store.set_attributes(attrs(&[
        ("title", json!("Marine heatwave analysis")),
        ("source", json!(run.source)),
        ("source_variable", json!(run.variable)),
        ("threshold", json!(detection.threshold)),
        ("percentile", json!(detection.percentile)),
        ("min_duration", json!(run.min_duration)),
        ("t_ref", json!(fit.t_ref)),
        ("created", json!(Utc::now().to_rfc3339())),
        (
            "history",
            json!(format!("Created by sst-heatwaves {}", env!("CARGO_PKG_VERSION"))),
        ),
    ]))?;

    let path = store.finish()?;
    info!("Output store written to {}", path.display());
    Ok(path)
}
