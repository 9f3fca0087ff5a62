//! The analysis pipeline: fetch, regress, threshold, summarise, write.

use crate::analysis::{self, HarmonicModel};
use crate::config::Config;
use crate::models::{Report, ReportMetadata, SstCube};
use crate::output::{self, OutputAttributes};
use crate::source::{load_cube, plan_selection, ChunkStore, Dataset, SelectionPlan, SelectionRequest};
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunOutcome {
    pub report: Report,
    pub output_path: PathBuf,
}

/// Build the loader request from the merged configuration.
pub fn selection_request(config: &Config, show_progress: bool) -> SelectionRequest {
    SelectionRequest {
        variable: config.source.variable.clone(),
        time_name: config.source.time_name.clone(),
        lat_name: config.source.lat_name.clone(),
        lon_name: config.source.lon_name.clone(),
        bounds: config.bounds(),
        window: config.window(),
        stride: config.region.stride,
        aggregation: config.region.aggregation,
        to_celsius: config.model.to_celsius,
        concurrency: config.general.concurrency,
        show_progress,
    }
}

/// Resolve the selection without downloading any data chunk.
pub async fn plan(config: &Config, store: &dyn ChunkStore) -> Result<SelectionPlan> {
    let dataset = Dataset::open(store)
        .await
        .with_context(|| format!("Failed to open store {}", store.location()))?;
    plan_selection(&dataset, &selection_request(config, false)).await
}

/// Run the whole analysis against `store` and write the output store.
pub async fn run(config: &Config, store: &dyn ChunkStore, show_progress: bool) -> Result<RunOutcome> {
    let start_time = Instant::now();
    let request = selection_request(config, show_progress);

    // Step 1: fetch
    let dataset = Dataset::open(store)
        .await
        .with_context(|| format!("Failed to open store {}", store.location()))?;
    let selection = plan_selection(&dataset, &request).await?;
    if show_progress {
        println!(
            "📥 Loading {} ({} time steps, {} x {} grid, {} chunks)",
            request.variable,
            selection.time.len(),
            selection.lat.len(),
            selection.lon.len(),
            selection.chunk_count
        );
    }
    let cube = load_cube(&dataset, &selection, &request).await?;

    // Step 2: regress
    if show_progress {
        println!("📈 Fitting harmonic model over {} pixels...", cube.lat.len() * cube.lon.len());
    }
    let model = HarmonicModel::new(&cube.time, config.model.min_valid_fraction)?;
    let fit = model.fit(&cube)?;

    // Step 3: threshold
    let percentile = config.detection.percentile;
    let threshold = analysis::global_percentile(&fit.anomaly, percentile)
        .context("Cannot compute the heatwave threshold")?;
    let exceedances = analysis::exceedance_mask(&fit.anomaly, threshold)
        .iter()
        .filter(|e| **e)
        .count();
    debug!("{} of {} samples exceed the threshold", exceedances, fit.anomaly.len());

    // Step 4: summarise
    if show_progress {
        println!(
            "🌡️  Detecting heatwaves above {:.3} {} ({:.0}th percentile)...",
            threshold,
            cube.units,
            percentile * 100.0
        );
    }
    let detection = analysis::detect_grid(&fit, threshold, percentile, config.detection.min_duration);
    let summary = analysis::summarize(&fit, &detection, &cube.time, &cube.lat, &cube.lon);
    if summary.total_events == 0 {
        warn!("No heatwave events detected");
    }
    let hottest = analysis::hottest_pixels(
        &detection,
        &cube.lat,
        &cube.lon,
        config.detection.hottest_pixels,
    );
    let yearly_onsets = analysis::yearly_onsets(&detection.events, &cube.time);

    // Step 5: write
    if show_progress {
        println!("💾 Writing output store to {}", config.output.path);
    }
    let output_path = output::write_results(
        Path::new(&config.output.path),
        &cube,
        &fit,
        &detection,
        &OutputAttributes {
            source: store.location().to_string(),
            variable: request.variable.clone(),
            min_duration: config.detection.min_duration,
            compression_level: config.output.compression_level,
        },
    )?;

    let metadata = report_metadata(config, store, &cube, threshold, &output_path, start_time);
    info!("Analysis finished in {:.1}s", metadata.duration_seconds);

    Ok(RunOutcome {
        report: Report {
            metadata,
            summary,
            hottest_pixels: hottest,
            yearly_onsets,
        },
        output_path,
    })
}

fn report_metadata(
    config: &Config,
    store: &dyn ChunkStore,
    cube: &SstCube,
    threshold: f64,
    output_path: &Path,
    start_time: Instant,
) -> ReportMetadata {
    ReportMetadata {
        store: store.location().to_string(),
        variable: config.source.variable.clone(),
        bounds: config.bounds(),
        window: config.window(),
        aggregation: config.region.aggregation,
        time_steps: cube.n_time(),
        lat_points: cube.lat.len(),
        lon_points: cube.lon.len(),
        units: cube.units.clone(),
        percentile: config.detection.percentile,
        threshold,
        min_duration: config.detection.min_duration,
        output_path: output_path.display().to_string(),
        analysis_date: Utc::now(),
        duration_seconds: start_time.elapsed().as_secs_f64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputStore;
    use crate::source::cftime::CfTimeUnits;
    use crate::source::store::FileStore;
    use chrono::{DateTime, Duration, NaiveDate, TimeZone};
    use ndarray::{Array1, Array3};
    use serde_json::{json, Map};
    use std::f64::consts::PI;
    use tempfile::TempDir;

    const N_DAYS: usize = 730;
    const LAT: [f64; 3] = [10.0, 10.5, 11.0];
    const LON: [f64; 4] = [-60.0, -59.5, -59.0, -58.5];
    const HEATWAVE: std::ops::Range<usize> = 400..411;

    fn times() -> Vec<DateTime<Utc>> {
        let start = Utc.with_ymd_and_hms(2015, 1, 1, 12, 0, 0).unwrap();
        (0..N_DAYS).map(|d| start + Duration::days(d as i64)).collect()
    }

    /// Seasonal Kelvin SST with deterministic wiggle, one land pixel at
    /// (0, 0) and an 11-day warm spell at (1, 2).
    fn write_input_store(path: &Path) {
        let time = times();
        let units = CfTimeUnits::parse("days since 1970-01-01", None).unwrap();
        let raw_time = Array1::from_iter(time.iter().map(|t| units.from_datetime(t)));

        let sst = Array3::from_shape_fn((N_DAYS, LAT.len(), LON.len()), |(d, i, j)| {
            if (i, j) == (0, 0) {
                return f64::NAN;
            }
            let phase = 2.0 * PI * d as f64 / 365.25;
            let wiggle = 0.3 * (1.3 * d as f64 + (i * 4 + j) as f64).sin();
            let warm = if (i, j) == (1, 2) && HEATWAVE.contains(&d) { 3.0 } else { 0.0 };
            290.0 + i as f64 + 2.0 * phase.cos() + 0.0005 * d as f64 + wiggle + warm
        });

        let mut store = OutputStore::create(path, 1).unwrap();
        let mut time_attrs = Map::new();
        time_attrs.insert("units".to_string(), json!("days since 1970-01-01"));
        time_attrs.insert("calendar".to_string(), json!("standard"));
        store
            .write_array("time", &["time"], raw_time.view().into_dyn(), &[N_DAYS], time_attrs)
            .unwrap();
        let lat = Array1::from(LAT.to_vec());
        store
            .write_array("lat", &["lat"], lat.view().into_dyn(), &[3], Map::new())
            .unwrap();
        let lon = Array1::from(LON.to_vec());
        store
            .write_array("lon", &["lon"], lon.view().into_dyn(), &[4], Map::new())
            .unwrap();
        let mut sst_attrs = Map::new();
        sst_attrs.insert("units".to_string(), json!("kelvin"));
        store
            .write_array(
                "analysed_sst",
                &["time", "lat", "lon"],
                sst.view().into_dyn(),
                &[200, 2, 3],
                sst_attrs,
            )
            .unwrap();
        store.finish().unwrap();
    }

    fn test_config(input: &Path, output: &Path) -> Config {
        let mut config = Config::default();
        config.source.store = input.display().to_string();
        config.region.lat_min = 9.0;
        config.region.lat_max = 12.0;
        config.region.lon_min = -61.0;
        config.region.lon_max = -58.0;
        config.region.start = NaiveDate::from_ymd_opt(2015, 1, 1).unwrap();
        config.region.end = NaiveDate::from_ymd_opt(2017, 1, 1).unwrap();
        config.output.path = output.display().to_string();
        config
    }

    #[tokio::test]
    async fn test_end_to_end_run() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("input.zarr");
        let output = temp_dir.path().join("output.zarr");
        write_input_store(&input);

        let config = test_config(&input, &output);
        let store = FileStore::new(&input);
        let outcome = run(&config, &store, false).await.unwrap();
        let report = &outcome.report;

        assert_eq!(report.metadata.time_steps, N_DAYS);
        assert_eq!(report.metadata.units, "degC");
        assert_eq!(report.summary.valid_pixels, 11);
        assert!(report.summary.total_events > 0);

        let longest = report.summary.longest_event.as_ref().unwrap();
        assert_eq!((longest.lat, longest.lon), (10.5, -59.0));
        assert!(longest.duration_steps >= HEATWAVE.len());
        assert!(longest.start <= times()[HEATWAVE.start]);

        let strongest = report.summary.strongest_event.as_ref().unwrap();
        assert!(strongest.peak_intensity > 2.0);
        assert!(!report.hottest_pixels.is_empty());
        assert!(report.hottest_pixels.len() <= config.detection.hottest_pixels);

        // Trend of 0.0005 K/day
        assert!((report.summary.mean_trend_per_decade - 0.0005 * 365.25 * 10.0).abs() < 0.05);

        // The output store reads back with the same grid
        let written = FileStore::new(&outcome.output_path);
        let dataset = Dataset::open(&written).await.unwrap();
        let count = dataset.array("mhw_count").await.unwrap();
        assert_eq!(count.shape(), &[3, 4]);
        let values = dataset
            .read_subset(&count, &[0..3, 0..4], 1, None)
            .await
            .unwrap();
        assert!(values[[0, 0]].is_nan());
        assert!(values[[1, 2]] >= 1.0);

        let anomaly = dataset.array("anomaly").await.unwrap();
        assert_eq!(anomaly.shape(), &[N_DAYS, 3, 4]);
    }

    #[tokio::test]
    async fn test_plan_only_reads_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("input.zarr");
        write_input_store(&input);

        let mut config = test_config(&input, &temp_dir.path().join("unused.zarr"));
        config.region.lat_min = 10.4;
        config.region.end = NaiveDate::from_ymd_opt(2015, 3, 1).unwrap();

        let store = FileStore::new(&input);
        let selection = plan(&config, &store).await.unwrap();
        assert_eq!(selection.time.len(), 59);
        assert_eq!(selection.lat, vec![10.5, 11.0]);
        assert_eq!(selection.chunk_count, 4);
        assert!(!temp_dir.path().join("unused.zarr").exists());
    }

    #[tokio::test]
    async fn test_empty_region_fails() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("input.zarr");
        write_input_store(&input);

        let mut config = test_config(&input, &temp_dir.path().join("out.zarr"));
        config.region.lat_min = 40.0;
        config.region.lat_max = 41.0;

        let store = FileStore::new(&input);
        assert!(run(&config, &store, false).await.is_err());
    }
}
