//! Markdown report generation.
//!
//! This module renders the run report as Markdown for people or as JSON
//! for downstream tooling.

use crate::models::{EventHighlight, HeatwaveSummary, HotPixel, Report, ReportMetadata};
use anyhow::Result;
use std::collections::BTreeMap;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &Report) -> String {
    let mut output = String::new();

    output.push_str("# Marine Heatwave Report\n\n");
    output.push_str(&generate_metadata_section(&report.metadata));
    output.push_str(&generate_summary_section(&report.summary, &report.metadata));
    output.push_str(&generate_events_section(&report.summary, &report.metadata.units));
    output.push_str(&generate_hottest_section(&report.hottest_pixels, &report.metadata.units));
    output.push_str(&generate_onsets_section(&report.yearly_onsets));
    output.push_str(&generate_footer());

    output
}

fn format_value(value: f64, precision: usize) -> String {
    if value.is_finite() {
        format!("{:.*}", precision, value)
    } else {
        "n/a".to_string()
    }
}

/// Generate the metadata section.
fn generate_metadata_section(metadata: &ReportMetadata) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Source:** {}\n", metadata.store));
    section.push_str(&format!("- **Variable:** `{}`\n", metadata.variable));
    section.push_str(&format!("- **Region:** {}\n", metadata.bounds));
    section.push_str(&format!(
        "- **Period:** {} to {} (exclusive)\n",
        metadata.window.start, metadata.window.end
    ));
    section.push_str(&format!(
        "- **Grid:** {} time steps x {} lat x {} lon\n",
        metadata.time_steps, metadata.lat_points, metadata.lon_points
    ));
    if metadata.aggregation != crate::models::TemporalAggregation::None {
        section.push_str(&format!("- **Aggregation:** {}\n", metadata.aggregation));
    }
    section.push_str(&format!(
        "- **Threshold:** {} {} ({:.0}th percentile of anomalies)\n",
        format_value(metadata.threshold, 3),
        metadata.units,
        metadata.percentile * 100.0
    ));
    section.push_str(&format!(
        "- **Minimum Duration:** {} step(s)\n",
        metadata.min_duration
    ));
    section.push_str(&format!("- **Output Store:** `{}`\n", metadata.output_path));
    section.push_str(&format!(
        "- **Analysis Date:** {}\n",
        metadata.analysis_date.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!(
        "- **Analysis Duration:** {:.1}s\n",
        metadata.duration_seconds
    ));
    section.push('\n');

    section
}

/// Generate the summary section.
fn generate_summary_section(summary: &HeatwaveSummary, metadata: &ReportMetadata) -> String {
    let mut section = String::new();

    section.push_str("## Summary\n\n");
    section.push_str("| Metric | Value |\n");
    section.push_str("|:---|---:|\n");
    section.push_str(&format!("| Valid pixels | {} |\n", summary.valid_pixels));
    section.push_str(&format!(
        "| Pixels with heatwaves | {} ({:.1}%) |\n",
        summary.affected_pixels,
        summary.affected_fraction * 100.0
    ));
    section.push_str(&format!("| Heatwave events | {} |\n", summary.total_events));
    section.push_str(&format!(
        "| Events per valid pixel | {:.2} |\n",
        summary.mean_events_per_pixel
    ));
    section.push_str(&format!(
        "| Mean duration | {:.1} steps |\n",
        summary.mean_duration_steps
    ));
    section.push_str(&format!(
        "| Mean trend | {} {} per decade |\n",
        format_value(summary.mean_trend_per_decade, 3),
        metadata.units
    ));
    section.push('\n');

    if summary.valid_pixels == 0 {
        section.push_str("No pixel had enough valid data to fit. Check the region and period.\n\n");
    }

    section
}

fn highlight_row(label: &str, event: &EventHighlight, units: &str) -> String {
    format!(
        "| {} | {:.3} | {:.3} | {} | {} | {:.3} {} |\n",
        label,
        event.lat,
        event.lon,
        event.start.format("%Y-%m-%d"),
        event.duration_steps,
        event.peak_intensity,
        units
    )
}

/// Generate the notable events section.
fn generate_events_section(summary: &HeatwaveSummary, units: &str) -> String {
    if summary.longest_event.is_none() && summary.strongest_event.is_none() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Notable Events\n\n");
    section.push_str("| Event | Lat | Lon | Start | Duration (steps) | Peak Anomaly |\n");
    section.push_str("|:---|---:|---:|:---:|---:|---:|\n");
    if let Some(ref event) = summary.longest_event {
        section.push_str(&highlight_row("Longest", event, units));
    }
    if let Some(ref event) = summary.strongest_event {
        section.push_str(&highlight_row("Strongest", event, units));
    }
    section.push('\n');

    section
}

/// Generate the most-affected pixels section.
fn generate_hottest_section(pixels: &[HotPixel], units: &str) -> String {
    if pixels.is_empty() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Most Affected Pixels\n\n");
    section.push_str("| Lat | Lon | Events | Heatwave Steps | Peak Anomaly |\n");
    section.push_str("|---:|---:|---:|---:|---:|\n");
    for pixel in pixels {
        section.push_str(&format!(
            "| {:.3} | {:.3} | {} | {} | {} {} |\n",
            pixel.lat,
            pixel.lon,
            pixel.event_count,
            pixel.total_steps,
            format_value(pixel.intensity_max, 3),
            units
        ));
    }
    section.push('\n');

    section
}

/// Generate the events-per-year section.
fn generate_onsets_section(onsets: &BTreeMap<i32, usize>) -> String {
    if onsets.is_empty() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Event Onsets by Year\n\n");
    section.push_str("| Year | Events |\n");
    section.push_str("|:---:|---:|\n");
    for (year, count) in onsets {
        section.push_str(&format!("| {} | {} |\n", year, count));
    }
    section.push('\n');

    section
}

/// Generate the report footer.
fn generate_footer() -> String {
    let mut footer = String::new();

    footer.push_str("---\n\n");
    footer.push_str(&format!(
        "*Report generated by sst-heatwaves {}*\n",
        env!("CARGO_PKG_VERSION")
    ));

    footer
}

/// Generate a JSON report.
pub fn generate_json_report(report: &Report) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GeoBounds, TemporalAggregation, TimeWindow};
    use chrono::{NaiveDate, TimeZone, Utc};

    fn create_test_metadata() -> ReportMetadata {
        ReportMetadata {
            store: "https://example.com/sst.zarr".to_string(),
            variable: "analysed_sst".to_string(),
            bounds: GeoBounds {
                lat_min: 36.0,
                lat_max: 37.0,
                lon_min: -123.5,
                lon_max: -122.5,
            },
            window: TimeWindow {
                start: NaiveDate::from_ymd_opt(2014, 1, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2017, 1, 1).unwrap(),
            },
            aggregation: TemporalAggregation::None,
            time_steps: 1096,
            lat_points: 100,
            lon_points: 100,
            units: "degC".to_string(),
            percentile: 0.9,
            threshold: 1.234,
            min_duration: 5,
            output_path: "mhw_output.zarr".to_string(),
            analysis_date: Utc::now(),
            duration_seconds: 12.5,
        }
    }

    fn create_test_report() -> Report {
        let longest = EventHighlight {
            lat: 36.5,
            lon: -123.0,
            start: Utc.with_ymd_and_hms(2015, 8, 1, 9, 0, 0).unwrap(),
            duration_steps: 42,
            peak_intensity: 3.1,
        };

        Report {
            metadata: create_test_metadata(),
            summary: HeatwaveSummary {
                valid_pixels: 9000,
                affected_pixels: 4500,
                affected_fraction: 0.5,
                total_events: 12000,
                mean_events_per_pixel: 1.33,
                mean_duration_steps: 6.2,
                mean_trend_per_decade: 0.31,
                longest_event: Some(longest.clone()),
                strongest_event: Some(longest),
            },
            hottest_pixels: vec![HotPixel {
                lat: 36.5,
                lon: -123.0,
                event_count: 7,
                total_steps: 120,
                intensity_max: 3.1,
            }],
            yearly_onsets: [(2014, 3000), (2015, 7000), (2016, 2000)].into_iter().collect(),
        }
    }

    #[test]
    fn test_generate_markdown_report() {
        let report = create_test_report();
        let markdown = generate_markdown_report(&report);

        assert!(markdown.contains("# Marine Heatwave Report"));
        assert!(markdown.contains("## Metadata"));
        assert!(markdown.contains("## Summary"));
        assert!(markdown.contains("## Notable Events"));
        assert!(markdown.contains("## Most Affected Pixels"));
        assert!(markdown.contains("| 2015 | 7000 |"));
        assert!(markdown.contains("2015-08-01"));
    }

    #[test]
    fn test_generate_metadata_section() {
        let section = generate_metadata_section(&create_test_metadata());

        assert!(section.contains("https://example.com/sst.zarr"));
        assert!(section.contains("`analysed_sst`"));
        assert!(section.contains("1.234 degC (90th percentile"));
        assert!(section.contains("2014-01-01 to 2017-01-01"));
        assert!(!section.contains("Aggregation"));
    }

    #[test]
    fn test_empty_sections_are_omitted() {
        let mut report = create_test_report();
        report.summary = HeatwaveSummary::default();
        report.hottest_pixels.clear();
        report.yearly_onsets.clear();

        let markdown = generate_markdown_report(&report);
        assert!(!markdown.contains("## Notable Events"));
        assert!(!markdown.contains("## Most Affected Pixels"));
        assert!(!markdown.contains("## Event Onsets by Year"));
        assert!(markdown.contains("No pixel had enough valid data"));
    }

    #[test]
    fn test_format_value_handles_nan() {
        assert_eq!(format_value(f64::NAN, 2), "n/a");
        assert_eq!(format_value(1.005, 1), "1.0");
    }

    #[test]
    fn test_generate_json_report() {
        let report = create_test_report();
        let json = generate_json_report(&report).unwrap();

        assert!(json.contains("\"metadata\""));
        assert!(json.contains("\"hottest_pixels\""));
        assert!(json.contains("\"yearly_onsets\""));
        assert!(json.contains("\"2015\": 7000"));
    }
}
