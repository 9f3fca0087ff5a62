//! sst-heatwaves - marine heatwave statistics from gridded SST
//!
//! A CLI tool that reads a cloud-hosted sea-surface temperature Zarr store,
//! fits a per-pixel harmonic model, thresholds the anomalies at a global
//! percentile and writes heatwave layers plus a run report.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Any error (arguments, config, network, data, output)

mod analysis;
mod cli;
mod config;
mod models;
mod output;
mod pipeline;
mod report;
mod source;

use anyhow::{anyhow, Context, Result};
use cli::{Args, OutputFormat};
use config::{Config, CONFIG_FILE};
use source::SelectionPlan;
use std::path::Path;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // Initialize logging
    init_logging(&args);

    info!("sst-heatwaves v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run_analysis(args).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Analysis failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .sst-heatwaves.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content).with_context(|| format!("Failed to write {}", CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE);
    println!("   Edit it to set the store, region, period and thresholds.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let level = args.log_level();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Run the complete analysis workflow. Returns the exit code.
async fn run_analysis(args: Args) -> Result<i32> {
    // Load configuration
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;

    let show_progress = !args.quiet;
    let store = source::open_store(
        &config.source.store,
        config.source.timeout_seconds,
        config.source.retries,
    )?;

    if show_progress {
        let access = if source::store::is_remote(&config.source.store) {
            "anonymous HTTPS"
        } else {
            "local directory"
        };
        println!("🌊 Store: {} ({})", store.location(), access);
        println!("   Variable: {}", config.source.variable);
        println!("   Region: {}", config.bounds());
        println!(
            "   Period: {} to {} (exclusive)",
            config.region.start, config.region.end
        );
    }

    // Handle --dry-run: resolve the selection and exit
    if args.dry_run {
        let selection = pipeline::plan(&config, store.as_ref()).await?;
        return Ok(handle_dry_run(&selection));
    }

    let outcome = pipeline::run(&config, store.as_ref(), show_progress).await?;
    let report = &outcome.report;

    // Write the report
    let output = match args.format {
        OutputFormat::Json => report::generate_json_report(report)?,
        OutputFormat::Markdown => report::generate_markdown_report(report),
    };
    let report_path = config.report_path(args.format);
    std::fs::write(&report_path, &output)
        .with_context(|| format!("Failed to write report to {}", report_path.display()))?;

    let summary = &report.summary;
    if summary.valid_pixels == 0 {
        warn!("No pixel could be fitted");
    }

    // Print summary
    if show_progress {
        println!("\n📊 Heatwave Summary:");
        println!(
            "   Threshold: {:.3} {}",
            report.metadata.threshold, report.metadata.units
        );
        println!("   Valid pixels: {}", summary.valid_pixels);
        println!(
            "   Pixels with heatwaves: {} ({:.1}%)",
            summary.affected_pixels,
            summary.affected_fraction * 100.0
        );
        println!("   Events: {}", summary.total_events);
        if let Some(ref longest) = summary.longest_event {
            println!(
                "   Longest: {} steps from {} at ({:.3}, {:.3})",
                longest.duration_steps,
                longest.start.format("%Y-%m-%d"),
                longest.lat,
                longest.lon
            );
        }
        println!("   Duration: {:.1}s", report.metadata.duration_seconds);
        println!(
            "\n✅ Analysis complete! Layers saved to: {}",
            outcome.output_path.display()
        );
        println!("   Report saved to: {}", report_path.display());
    }

    Ok(0)
}

/// Handle --dry-run: print the resolved selection, download nothing.
fn handle_dry_run(selection: &SelectionPlan) -> i32 {
    println!("\n🔍 Dry run: resolved selection (no data chunks downloaded)...\n");

    let variable = &selection.variable;
    println!(
        "   Variable: {} {:?} ({}, chunks {:?}, chunk grid {:?})",
        variable.name,
        variable.shape(),
        variable.meta.dtype,
        variable.meta.chunks,
        variable.chunk_grid()
    );
    if let (Some(first), Some(last)) = (selection.time.first(), selection.time.last()) {
        println!(
            "   Time: {} steps, {} .. {}",
            selection.time.len(),
            first.format("%Y-%m-%d"),
            last.format("%Y-%m-%d")
        );
    }
    println!(
        "   Grid: {} lat x {} lon",
        selection.lat.len(),
        selection.lon.len()
    );
    println!(
        "   Chunks to fetch: {} (~{:.1} MiB uncompressed)",
        selection.chunk_count,
        selection.estimated_bytes as f64 / (1024.0 * 1024.0)
    );

    println!("\n✅ Dry run complete. No data was downloaded.");
    0
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}
