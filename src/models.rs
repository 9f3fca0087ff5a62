//! Data models for the heatwave analysis.
//!
//! This module contains the core data structures that flow through the
//! pipeline: the selected SST cube, the harmonic fit layers, detected
//! heatwave events and the final run report.

use chrono::{DateTime, NaiveDate, Utc};
use ndarray::{s, Array2, Array3, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Geographic bounding box in degrees (inclusive on every side).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl GeoBounds {
    /// Re-express the longitudes in the 0..360 convention.
    pub fn to_positive_longitudes(self) -> Self {
        Self {
            lon_min: self.lon_min.rem_euclid(360.0),
            lon_max: self.lon_max.rem_euclid(360.0),
            ..self
        }
    }
}

impl fmt::Display for GeoBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lat {:.2}..{:.2}, lon {:.2}..{:.2}",
            self.lat_min, self.lat_max, self.lon_min, self.lon_max
        )
    }
}

/// Half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TimeWindow {
    pub fn contains(&self, time: &DateTime<Utc>) -> bool {
        let day = time.date_naive();
        day >= self.start && day < self.end
    }
}

/// Temporal aggregation applied to the cube before fitting.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum TemporalAggregation {
    /// Keep the native time steps
    #[default]
    None,
    /// Average every calendar month
    Monthly,
}

impl fmt::Display for TemporalAggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemporalAggregation::None => write!(f, "none"),
            TemporalAggregation::Monthly => write!(f, "monthly"),
        }
    }
}

/// Sea-surface temperature grid laid out as `(time, lat, lon)`.
#[derive(Debug, Clone)]
pub struct SstCube {
    pub time: Vec<DateTime<Utc>>,
    pub lat: Vec<f64>,
    pub lon: Vec<f64>,
    pub values: Array3<f64>,
    pub units: String,
}

impl SstCube {
    pub fn n_time(&self) -> usize {
        self.time.len()
    }

    /// Grid shape as `(lat, lon)`.
    pub fn grid_shape(&self) -> (usize, usize) {
        (self.lat.len(), self.lon.len())
    }

    pub fn pixel_series(&self, lat_index: usize, lon_index: usize) -> ArrayView1<'_, f64> {
        self.values.slice(s![.., lat_index, lon_index])
    }

    /// Share of finite values across the whole cube.
    pub fn valid_fraction(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let finite = self.values.iter().filter(|v| v.is_finite()).count();
        finite as f64 / self.values.len() as f64
    }
}

/// Per-pixel harmonic regression layers.
#[derive(Debug, Clone)]
pub struct HarmonicFit {
    /// Reference time (decimal years) the trend is centred on.
    pub t_ref: f64,
    /// Intercept at `t_ref`; equals the time-mean for complete series.
    pub mean: Array2<f64>,
    /// Linear trend in units per year.
    pub trend: Array2<f64>,
    pub annual_amplitude: Array2<f64>,
    pub semiannual_amplitude: Array2<f64>,
    /// Raw coefficients laid out as `(coefficient, lat, lon)`.
    pub coefficients: Array3<f64>,
    /// Fitted seasonal component, `(time, lat, lon)`.
    pub seasonal: Array3<f64>,
    /// Residual after removing mean, trend and seasonal cycle.
    pub anomaly: Array3<f64>,
}

impl HarmonicFit {
    /// Pixels that received a fit.
    pub fn valid_mask(&self) -> Array2<bool> {
        self.mean.mapv(|m| m.is_finite())
    }
}

/// A single run of consecutive exceedances at one pixel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeatwaveEvent {
    /// Index of the first time step of the run.
    pub start: usize,
    /// Number of time steps in the run.
    pub duration: usize,
    /// Largest anomaly inside the run.
    pub peak_intensity: f64,
    /// Mean anomaly over the run.
    pub mean_intensity: f64,
}

/// A heatwave event tagged with its grid position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocatedEvent {
    pub lat_index: usize,
    pub lon_index: usize,
    pub event: HeatwaveEvent,
}

/// Summary statistics of all events at one pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelStats {
    pub count: usize,
    pub duration_max: usize,
    pub duration_mean: f64,
    pub total_steps: usize,
    pub intensity_max: f64,
    pub intensity_mean: f64,
}

impl PixelStats {
    pub fn from_events(events: &[HeatwaveEvent]) -> Self {
        if events.is_empty() {
            return Self {
                count: 0,
                duration_max: 0,
                duration_mean: 0.0,
                total_steps: 0,
                intensity_max: f64::NAN,
                intensity_mean: f64::NAN,
            };
        }

        let total_steps: usize = events.iter().map(|e| e.duration).sum();
        let duration_max = events.iter().map(|e| e.duration).max().unwrap_or(0);
        let intensity_max = events
            .iter()
            .map(|e| e.peak_intensity)
            .fold(f64::NEG_INFINITY, f64::max);
        // Weighted by duration
        let intensity_sum: f64 = events
            .iter()
            .map(|e| e.mean_intensity * e.duration as f64)
            .sum();

        Self {
            count: events.len(),
            duration_max,
            duration_mean: total_steps as f64 / events.len() as f64,
            total_steps,
            intensity_max,
            intensity_mean: intensity_sum / total_steps as f64,
        }
    }
}

/// Gridded heatwave summary layers, `(lat, lon)`. NaN marks pixels without data.
#[derive(Debug, Clone)]
pub struct HeatwaveGrid {
    pub count: Array2<f64>,
    pub duration_max: Array2<f64>,
    pub duration_mean: Array2<f64>,
    pub total_steps: Array2<f64>,
    pub intensity_max: Array2<f64>,
    pub intensity_mean: Array2<f64>,
}

impl HeatwaveGrid {
    pub fn filled(shape: (usize, usize), value: f64) -> Self {
        Self {
            count: Array2::from_elem(shape, value),
            duration_max: Array2::from_elem(shape, value),
            duration_mean: Array2::from_elem(shape, value),
            total_steps: Array2::from_elem(shape, value),
            intensity_max: Array2::from_elem(shape, value),
            intensity_mean: Array2::from_elem(shape, value),
        }
    }

    pub fn set(&mut self, lat_index: usize, lon_index: usize, stats: &PixelStats) {
        let idx = (lat_index, lon_index);
        self.count[idx] = stats.count as f64;
        self.duration_max[idx] = stats.duration_max as f64;
        self.duration_mean[idx] = stats.duration_mean;
        self.total_steps[idx] = stats.total_steps as f64;
        self.intensity_max[idx] = stats.intensity_max;
        self.intensity_mean[idx] = stats.intensity_mean;
    }
}

/// Result of thresholding and run-length detection over the whole grid.
#[derive(Debug, Clone)]
pub struct HeatwaveDetection {
    pub threshold: f64,
    pub percentile: f64,
    pub grid: HeatwaveGrid,
    pub events: Vec<LocatedEvent>,
}

/// A notable event, resolved to coordinates and dates for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHighlight {
    pub lat: f64,
    pub lon: f64,
    pub start: DateTime<Utc>,
    pub duration_steps: usize,
    pub peak_intensity: f64,
}

/// A pixel ranked by total heatwave time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotPixel {
    pub lat: f64,
    pub lon: f64,
    pub event_count: usize,
    pub total_steps: usize,
    pub intensity_max: f64,
}

/// Grid-wide summary statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeatwaveSummary {
    pub valid_pixels: usize,
    pub affected_pixels: usize,
    pub affected_fraction: f64,
    pub total_events: usize,
    pub mean_events_per_pixel: f64,
    pub mean_duration_steps: f64,
    /// Mean linear trend over valid pixels, per decade.
    pub mean_trend_per_decade: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longest_event: Option<EventHighlight>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strongest_event: Option<EventHighlight>,
}

/// Metadata about one analysis run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub store: String,
    pub variable: String,
    pub bounds: GeoBounds,
    pub window: TimeWindow,
    pub aggregation: TemporalAggregation,
    pub time_steps: usize,
    pub lat_points: usize,
    pub lon_points: usize,
    pub units: String,
    pub percentile: f64,
    pub threshold: f64,
    pub min_duration: usize,
    pub output_path: String,
    pub analysis_date: DateTime<Utc>,
    pub duration_seconds: f64,
}

/// The complete run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub summary: HeatwaveSummary,
    pub hottest_pixels: Vec<HotPixel>,
    /// Number of events starting in each calendar year.
    pub yearly_onsets: BTreeMap<i32, usize>,
}
