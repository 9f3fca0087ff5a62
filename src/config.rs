//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.sst-heatwaves.toml` files.

use crate::cli::OutputFormat;
use crate::models::{GeoBounds, TemporalAggregation, TimeWindow};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file name.
pub const CONFIG_FILE: &str = ".sst-heatwaves.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Input store settings.
    #[serde(default)]
    pub source: SourceConfig,

    /// Region and period.
    #[serde(default)]
    pub region: RegionConfig,

    /// Harmonic model settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Heatwave detection settings.
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Output settings.
    #[serde(default)]
    pub output: OutputConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Number of chunks downloaded in parallel.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> usize {
    8
}

/// Input store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Store URL, `s3://` location or local directory.
    #[serde(default = "default_store")]
    pub store: String,

    /// SST variable name.
    #[serde(default = "default_variable")]
    pub variable: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Retries for timed-out or failed requests.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Coordinate array names.
    #[serde(default = "default_time_name")]
    pub time_name: String,
    #[serde(default = "default_lat_name")]
    pub lat_name: String,
    #[serde(default = "default_lon_name")]
    pub lon_name: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            store: default_store(),
            variable: default_variable(),
            timeout_seconds: default_timeout(),
            retries: default_retries(),
            time_name: default_time_name(),
            lat_name: default_lat_name(),
            lon_name: default_lon_name(),
        }
    }
}

fn default_store() -> String {
    "https://mur-sst.s3.us-west-2.amazonaws.com/zarr-v1".to_string()
}

fn default_variable() -> String {
    "analysed_sst".to_string()
}

fn default_timeout() -> u64 {
    120
}

fn default_retries() -> u32 {
    2
}

fn default_time_name() -> String {
    "time".to_string()
}

fn default_lat_name() -> String {
    "lat".to_string()
}

fn default_lon_name() -> String {
    "lon".to_string()
}

/// Region and period of the analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    #[serde(default = "default_lat_min")]
    pub lat_min: f64,
    #[serde(default = "default_lat_max")]
    pub lat_max: f64,
    #[serde(default = "default_lon_min")]
    pub lon_min: f64,
    #[serde(default = "default_lon_max")]
    pub lon_max: f64,

    /// First day (inclusive).
    #[serde(default = "default_start")]
    pub start: NaiveDate,

    /// Last day (exclusive).
    #[serde(default = "default_end")]
    pub end: NaiveDate,

    /// Spatial subsampling step.
    #[serde(default = "default_stride")]
    pub stride: usize,

    /// Temporal aggregation before fitting.
    #[serde(default)]
    pub aggregation: TemporalAggregation,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            lat_min: default_lat_min(),
            lat_max: default_lat_max(),
            lon_min: default_lon_min(),
            lon_max: default_lon_max(),
            start: default_start(),
            end: default_end(),
            stride: default_stride(),
            aggregation: TemporalAggregation::None,
        }
    }
}

// Monterey Bay, through the 2014-2016 northeast Pacific warm anomaly
fn default_lat_min() -> f64 {
    36.0
}

fn default_lat_max() -> f64 {
    37.0
}

fn default_lon_min() -> f64 {
    -123.5
}

fn default_lon_max() -> f64 {
    -122.5
}

fn default_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2013, 1, 1).unwrap_or_default()
}

fn default_end() -> NaiveDate {
    NaiveDate::from_ymd_opt(2017, 1, 1).unwrap_or_default()
}

fn default_stride() -> usize {
    1
}

/// Harmonic regression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Share of valid samples a gappy pixel needs to be fitted.
    #[serde(default = "default_min_valid_fraction")]
    pub min_valid_fraction: f64,

    /// Convert Kelvin input to degrees Celsius.
    #[serde(default = "default_true")]
    pub to_celsius: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            min_valid_fraction: default_min_valid_fraction(),
            to_celsius: true,
        }
    }
}

fn default_min_valid_fraction() -> f64 {
    0.5
}

fn default_true() -> bool {
    true
}

/// Heatwave detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Global anomaly percentile used as threshold.
    #[serde(default = "default_percentile")]
    pub percentile: f64,

    /// Minimum event length in time steps.
    #[serde(default = "default_min_duration")]
    pub min_duration: usize,

    /// Pixels listed in the report's ranking.
    #[serde(default = "default_hottest_pixels")]
    pub hottest_pixels: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            percentile: default_percentile(),
            min_duration: default_min_duration(),
            hottest_pixels: default_hottest_pixels(),
        }
    }
}

fn default_percentile() -> f64 {
    0.9
}

fn default_min_duration() -> usize {
    1
}

fn default_hottest_pixels() -> usize {
    10
}

/// Output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output Zarr store path.
    #[serde(default = "default_output_path")]
    pub path: String,

    /// Report file path.
    #[serde(default = "default_report_path")]
    pub report: String,

    /// zlib level (0-9) for output chunks.
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_output_path(),
            report: default_report_path(),
            compression_level: default_compression_level(),
        }
    }
}

fn default_output_path() -> String {
    "mhw_output.zarr".to_string()
}

fn default_report_path() -> String {
    "mhw_report.md".to_string()
}

fn default_compression_level() -> u32 {
    5
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    /// This method only overrides config when CLI provides explicit values.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref store) = args.store {
            self.source.store = store.clone();
        }
        if let Some(ref variable) = args.variable {
            self.source.variable = variable.clone();
        }
        if let Some(timeout) = args.timeout {
            self.source.timeout_seconds = timeout;
        }

        // Region
        let region = &mut self.region;
        region.lat_min = args.lat_min.unwrap_or(region.lat_min);
        region.lat_max = args.lat_max.unwrap_or(region.lat_max);
        region.lon_min = args.lon_min.unwrap_or(region.lon_min);
        region.lon_max = args.lon_max.unwrap_or(region.lon_max);
        region.start = args.start.unwrap_or(region.start);
        region.end = args.end.unwrap_or(region.end);
        region.stride = args.stride.unwrap_or(region.stride);
        region.aggregation = args.aggregate.unwrap_or(region.aggregation);

        // Detection
        if let Some(percentile) = args.percentile {
            self.detection.percentile = percentile;
        }
        if let Some(min_duration) = args.min_duration {
            self.detection.min_duration = min_duration;
        }

        // Output
        if let Some(ref output) = args.output {
            self.output.path = output.display().to_string();
        }
        if let Some(ref report) = args.report {
            self.output.report = report.display().to_string();
        }

        // General settings
        if let Some(concurrency) = args.concurrency {
            self.general.concurrency = concurrency;
        }
    }

    /// Check the merged settings.
    pub fn validate(&self) -> Result<(), String> {
        let r = &self.region;
        if !(-90.0..=90.0).contains(&r.lat_min) || !(-90.0..=90.0).contains(&r.lat_max) {
            return Err("Latitudes must be between -90 and 90".to_string());
        }
        if !(-180.0..=360.0).contains(&r.lon_min) || !(-180.0..=360.0).contains(&r.lon_max) {
            return Err("Longitudes must be between -180 and 360".to_string());
        }
        if r.lat_min > r.lat_max || r.lon_min > r.lon_max {
            return Err(format!("Region {} is inverted", self.bounds()));
        }
        if r.end <= r.start {
            return Err(format!("Period end {} is not after start {}", r.end, r.start));
        }
        if r.stride == 0 {
            return Err("Stride must be at least 1".to_string());
        }

        let p = self.detection.percentile;
        if !(p > 0.0 && p < 1.0) {
            return Err(format!("Percentile must be strictly between 0 and 1, got {}", p));
        }
        if self.detection.min_duration == 0 {
            return Err("Minimum duration must be at least 1 step".to_string());
        }
        if !(0.0..=1.0).contains(&self.model.min_valid_fraction) {
            return Err("min_valid_fraction must be between 0 and 1".to_string());
        }
        if self.general.concurrency == 0 {
            return Err("Concurrency must be at least 1".to_string());
        }
        if self.source.timeout_seconds == 0 {
            return Err("Timeout must be at least 1 second".to_string());
        }
        if self.output.compression_level > 9 {
            return Err("compression_level must be between 0 and 9".to_string());
        }

        Ok(())
    }

    pub fn bounds(&self) -> GeoBounds {
        GeoBounds {
            lat_min: self.region.lat_min,
            lat_max: self.region.lat_max,
            lon_min: self.region.lon_min,
            lon_max: self.region.lon_max,
        }
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow {
            start: self.region.start,
            end: self.region.end,
        }
    }

    /// Where to write the report. The default name follows the format.
    pub fn report_path(&self, format: OutputFormat) -> PathBuf {
        let path = PathBuf::from(&self.output.report);
        if format == OutputFormat::Json && self.output.report == default_report_path() {
            path.with_extension("json")
        } else {
            path
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Args, OutputFormat};
    use std::path::PathBuf;

    fn empty_args() -> Args {
        Args {
            store: None,
            variable: None,
            lat_min: None,
            lat_max: None,
            lon_min: None,
            lon_max: None,
            start: None,
            end: None,
            percentile: None,
            min_duration: None,
            stride: None,
            aggregate: None,
            output: None,
            report: None,
            format: OutputFormat::Markdown,
            config: None,
            verbose: false,
            quiet: false,
            timeout: None,
            concurrency: None,
            dry_run: false,
            init_config: false,
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.source.variable, "analysed_sst");
        assert_eq!(config.detection.percentile, 0.9);
        assert_eq!(config.model.min_valid_fraction, 0.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[source]
store = "s3://my-bucket/sst.zarr"
variable = "sst"

[region]
lat_min = -10.0
lat_max = 10.0
start = "2020-01-01"
aggregation = "monthly"

[detection]
percentile = 0.95
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.source.store, "s3://my-bucket/sst.zarr");
        assert_eq!(config.source.variable, "sst");
        assert_eq!(config.source.time_name, "time");
        assert_eq!(config.region.lat_min, -10.0);
        assert_eq!(config.region.lon_min, -123.5);
        assert_eq!(config.region.start, NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());
        assert_eq!(config.region.aggregation, TemporalAggregation::Monthly);
        assert_eq!(config.detection.percentile, 0.95);
        assert_eq!(config.detection.min_duration, 1);
    }

    #[test]
    fn test_merge_with_args() {
        let mut config = Config::default();
        let mut args = empty_args();
        args.store = Some("./local.zarr".to_string());
        args.lat_max = Some(36.5);
        args.percentile = Some(0.99);
        args.output = Some(PathBuf::from("out.zarr"));
        args.concurrency = Some(2);

        config.merge_with_args(&args);
        assert_eq!(config.source.store, "./local.zarr");
        assert_eq!(config.region.lat_max, 36.5);
        assert_eq!(config.region.lat_min, 36.0);
        assert_eq!(config.detection.percentile, 0.99);
        assert_eq!(config.output.path, "out.zarr");
        assert_eq!(config.general.concurrency, 2);
        assert_eq!(config.output.report, "mhw_report.md");
    }

    #[test]
    fn test_report_path_follows_format() {
        let mut config = Config::default();
        assert_eq!(config.report_path(OutputFormat::Markdown), PathBuf::from("mhw_report.md"));
        assert_eq!(config.report_path(OutputFormat::Json), PathBuf::from("mhw_report.json"));

        // An explicit name is kept as given
        let mut args = empty_args();
        args.report = Some(PathBuf::from("out/summary.txt"));
        config.merge_with_args(&args);
        assert_eq!(config.report_path(OutputFormat::Json), PathBuf::from("out/summary.txt"));
    }

    #[test]
    fn test_validate_merged_region() {
        let mut config = Config::default();
        let mut args = empty_args();
        // Only one edge given: the merged box is inverted
        args.lat_min = Some(50.0);
        config.merge_with_args(&args);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[general]\nconcurrency = 3\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.general.concurrency, 3);

        std::fs::write(&path, "[general\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(!toml_str.is_empty());
        assert!(toml_str.contains("[source]"));
        assert!(toml_str.contains("[region]"));
        assert!(toml_str.contains("[detection]"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.region.start, Config::default().region.start);
    }
}
