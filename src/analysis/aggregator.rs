//! Heatwave aggregation and statistics.
//!
//! This module turns per-pixel events into the grid-wide numbers that the
//! report shows.

use crate::models::{
    EventHighlight, HarmonicFit, HeatwaveDetection, HeatwaveSummary, HotPixel, LocatedEvent,
};
use chrono::{DateTime, Datelike, Utc};
use std::collections::BTreeMap;

/// Resolve an event to coordinates and a start date.
pub fn highlight(
    located: &LocatedEvent,
    time: &[DateTime<Utc>],
    lat: &[f64],
    lon: &[f64],
) -> Option<EventHighlight> {
    Some(EventHighlight {
        lat: *lat.get(located.lat_index)?,
        lon: *lon.get(located.lon_index)?,
        start: *time.get(located.event.start)?,
        duration_steps: located.event.duration,
        peak_intensity: located.event.peak_intensity,
    })
}

/// Compute the grid-wide summary.
pub fn summarize(
    fit: &HarmonicFit,
    detection: &HeatwaveDetection,
    time: &[DateTime<Utc>],
    lat: &[f64],
    lon: &[f64],
) -> HeatwaveSummary {
    let valid_pixels = fit.valid_mask().iter().filter(|v| **v).count();
    let affected_pixels = detection.grid.count.iter().filter(|c| **c > 0.0).count();
    let total_events = detection.events.len();
    let total_steps: usize = detection.events.iter().map(|e| e.event.duration).sum();

    let trends: Vec<f64> = fit.trend.iter().copied().filter(|t| t.is_finite()).collect();
    let mean_trend_per_decade = if trends.is_empty() {
        f64::NAN
    } else {
        trends.iter().sum::<f64>() / trends.len() as f64 * 10.0
    };

    let longest = detection
        .events
        .iter()
        .max_by_key(|e| e.event.duration)
        .and_then(|e| highlight(e, time, lat, lon));
    let strongest = detection
        .events
        .iter()
        .max_by(|a, b| {
            a.event
                .peak_intensity
                .partial_cmp(&b.event.peak_intensity)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .and_then(|e| highlight(e, time, lat, lon));

    HeatwaveSummary {
        valid_pixels,
        affected_pixels,
        affected_fraction: ratio(affected_pixels as f64, valid_pixels as f64),
        total_events,
        mean_events_per_pixel: ratio(total_events as f64, valid_pixels as f64),
        mean_duration_steps: ratio(total_steps as f64, total_events as f64),
        mean_trend_per_decade,
        longest_event: longest,
        strongest_event: strongest,
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

/// Identify the pixels that spent the most time in heatwave conditions.
pub fn hottest_pixels(detection: &HeatwaveDetection, lat: &[f64], lon: &[f64], n: usize) -> Vec<HotPixel> {
    let grid = &detection.grid;
    let mut pixels: Vec<HotPixel> = grid
        .total_steps
        .indexed_iter()
        .filter(|(_, steps)| **steps > 0.0)
        .filter_map(|((i, j), steps)| {
            Some(HotPixel {
                lat: *lat.get(i)?,
                lon: *lon.get(j)?,
                event_count: grid.count[(i, j)] as usize,
                total_steps: *steps as usize,
                intensity_max: grid.intensity_max[(i, j)],
            })
        })
        .collect();

    pixels.sort_by(|a, b| {
        b.total_steps.cmp(&a.total_steps).then(
            b.intensity_max
                .partial_cmp(&a.intensity_max)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });
    pixels.truncate(n);

    pixels
}

/// Count event onsets per calendar year.
pub fn yearly_onsets(events: &[LocatedEvent], time: &[DateTime<Utc>]) -> BTreeMap<i32, usize> {
    let mut onsets: BTreeMap<i32, usize> = BTreeMap::new();

    for located in events {
        if let Some(start) = time.get(located.event.start) {
            *onsets.entry(start.year()).or_default() += 1;
        }
    }

    onsets
}
