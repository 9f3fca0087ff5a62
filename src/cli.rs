//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::models::TemporalAggregation;
use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;

/// sst-heatwaves - marine heatwave statistics from gridded SST
///
/// Reads a sea-surface temperature Zarr store (public cloud bucket or local
/// directory), removes mean, trend and seasonal cycle per pixel, and
/// summarises anomalies above a global percentile into heatwave layers.
///
/// Examples:
///   sst-heatwaves --lat-min 36 --lat-max 37 --lon-min -123.5 --lon-max -122.5
///   sst-heatwaves --start 2014-01-01 --end 2017-01-01 --percentile 0.95
///   sst-heatwaves --store ./local_sst.zarr --variable sst --aggregate monthly
///   sst-heatwaves --dry-run
///   sst-heatwaves --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Zarr store to read: https:// URL, s3://bucket/prefix or local directory
    ///
    /// Defaults to the public MUR SST store or .sst-heatwaves.toml.
    #[arg(long, value_name = "URL", env = "SST_STORE")]
    pub store: Option<String>,

    /// SST variable inside the store
    #[arg(long, value_name = "NAME")]
    pub variable: Option<String>,

    /// Southern edge of the region (degrees north)
    #[arg(long, value_name = "DEG", allow_negative_numbers = true)]
    pub lat_min: Option<f64>,

    /// Northern edge of the region (degrees north)
    #[arg(long, value_name = "DEG", allow_negative_numbers = true)]
    pub lat_max: Option<f64>,

    /// Western edge of the region (degrees east)
    #[arg(long, value_name = "DEG", allow_negative_numbers = true)]
    pub lon_min: Option<f64>,

    /// Eastern edge of the region (degrees east)
    #[arg(long, value_name = "DEG", allow_negative_numbers = true)]
    pub lon_max: Option<f64>,

    /// First day of the period (YYYY-MM-DD, inclusive)
    #[arg(long, value_name = "DATE")]
    pub start: Option<NaiveDate>,

    /// End of the period (YYYY-MM-DD, exclusive)
    #[arg(long, value_name = "DATE")]
    pub end: Option<NaiveDate>,

    /// Anomaly percentile used as heatwave threshold (0 < P < 1)
    #[arg(long, value_name = "P")]
    pub percentile: Option<f64>,

    /// Minimum number of consecutive time steps for an event
    #[arg(long, value_name = "STEPS")]
    pub min_duration: Option<usize>,

    /// Keep every Nth latitude and longitude
    #[arg(long, value_name = "N")]
    pub stride: Option<usize>,

    /// Temporal aggregation before fitting
    #[arg(long, value_name = "MODE")]
    pub aggregate: Option<TemporalAggregation>,

    /// Output Zarr store (replaced if it exists)
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Report file path [default: mhw_report.md, or mhw_report.json with --format json]
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,

    /// Report format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Path to configuration file
    ///
    /// If not specified, looks for .sst-heatwaves.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Request timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Number of chunks downloaded in parallel
    #[arg(long, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Dry run: resolve the selection and show what would be downloaded
    #[arg(long)]
    pub dry_run: bool,

    /// Generate a default .sst-heatwaves.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

fn check_lat(name: &str, value: Option<f64>) -> Result<(), String> {
    match value {
        Some(v) if !(-90.0..=90.0).contains(&v) => {
            Err(format!("{} must be between -90 and 90, got {}", name, v))
        }
        _ => Ok(()),
    }
}

fn check_lon(name: &str, value: Option<f64>) -> Result<(), String> {
    match value {
        Some(v) if !(-180.0..=360.0).contains(&v) => {
            Err(format!("{} must be between -180 and 360, got {}", name, v))
        }
        _ => Ok(()),
    }
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    ///
    /// Only values given on the command line are checked here; the merged
    /// configuration is checked again by [`crate::config::Config::validate`].
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        check_lat("--lat-min", self.lat_min)?;
        check_lat("--lat-max", self.lat_max)?;
        check_lon("--lon-min", self.lon_min)?;
        check_lon("--lon-max", self.lon_max)?;

        if let (Some(lo), Some(hi)) = (self.lat_min, self.lat_max) {
            if lo > hi {
                return Err("--lat-min must not exceed --lat-max".to_string());
            }
        }
        if let (Some(lo), Some(hi)) = (self.lon_min, self.lon_max) {
            if lo > hi {
                return Err("--lon-min must not exceed --lon-max".to_string());
            }
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if end <= start {
                return Err("--end must be after --start".to_string());
            }
        }

        if let Some(p) = self.percentile {
            if !(p > 0.0 && p < 1.0) {
                return Err("Percentile must be strictly between 0 and 1".to_string());
            }
        }
        if self.min_duration == Some(0) {
            return Err("Minimum duration must be at least 1 step".to_string());
        }
        if self.stride == Some(0) {
            return Err("Stride must be at least 1".to_string());
        }
        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }
        if self.timeout == Some(0) {
            return Err("Timeout must be at least 1 second".to_string());
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
