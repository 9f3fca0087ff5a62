//! Run-length detection of heatwave events.
//!
//! An event is a maximal run of consecutive time steps whose anomaly is
//! strictly above the threshold. Runs touching either end of the series are
//! kept as they are. NaN breaks a run.

use super::threshold::exceeds;
use crate::models::{
    HarmonicFit, HeatwaveDetection, HeatwaveEvent, HeatwaveGrid, LocatedEvent, PixelStats,
};
use ndarray::ArrayView1;
use rayon::prelude::*;
use tracing::{debug, info};

/// Find every run of exceedances in one series that lasts at least
/// `min_duration` steps.
pub fn detect_events(
    series: ArrayView1<'_, f64>,
    threshold: f64,
    min_duration: usize,
) -> Vec<HeatwaveEvent> {
    let mut events = Vec::new();
    let mut run: Option<(usize, f64, f64)> = None; // (start, peak, sum)

    for (step, &value) in series.iter().enumerate() {
        if exceeds(value, threshold) {
            run = Some(match run {
                Some((start, peak, sum)) => (start, peak.max(value), sum + value),
                None => (step, value, value),
            });
        } else if let Some((start, peak, sum)) = run.take() {
            push_run(&mut events, start, step, peak, sum, min_duration);
        }
    }
    if let Some((start, peak, sum)) = run {
        push_run(&mut events, start, series.len(), peak, sum, min_duration);
    }

    events
}

fn push_run(
    events: &mut Vec<HeatwaveEvent>,
    start: usize,
    end: usize,
    peak: f64,
    sum: f64,
    min_duration: usize,
) {
    let duration = end - start;
    if duration >= min_duration.max(1) {
        events.push(HeatwaveEvent {
            start,
            duration,
            peak_intensity: peak,
            mean_intensity: sum / duration as f64,
        });
    }
}

/// Detect events at every fitted pixel.
///
/// Pixels without a fit keep NaN in every layer. Fitted pixels without an
/// event get zero counts and NaN intensities.
pub fn detect_grid(
    fit: &HarmonicFit,
    threshold: f64,
    percentile: f64,
    min_duration: usize,
) -> HeatwaveDetection {
    let (_, nlat, nlon) = fit.anomaly.dim();
    let valid = fit.valid_mask();

    let per_pixel: Vec<Option<Vec<HeatwaveEvent>>> = (0..nlat * nlon)
        .into_par_iter()
        .map(|p| {
            let (i, j) = (p / nlon, p % nlon);
            valid[(i, j)].then(|| {
                detect_events(
                    fit.anomaly.slice(ndarray::s![.., i, j]),
                    threshold,
                    min_duration,
                )
            })
        })
        .collect();

    let mut grid = HeatwaveGrid::filled((nlat, nlon), f64::NAN);
    let mut events = Vec::new();

    for (p, pixel_events) in per_pixel.into_iter().enumerate() {
        let Some(pixel_events) = pixel_events else { continue };
        let (i, j) = (p / nlon, p % nlon);
        grid.set(i, j, &PixelStats::from_events(&pixel_events));
        events.extend(pixel_events.into_iter().map(|event| LocatedEvent {
            lat_index: i,
            lon_index: j,
            event,
        }));
    }

    debug!("Detection grid {}x{}", nlat, nlon);
    info!(
        "Detected {} heatwave events above {:.4} (min duration {})",
        events.len(),
        threshold,
        min_duration
    );

    HeatwaveDetection {
        threshold,
        percentile,
        grid,
        events,
    }
}
