//! # BioIntertidal Mapper Entry Point
//!
//! Loads the run parameters, validates them, and runs one selection pass
//! against Earth Search and WorldTides. Matched dates go to stdout, one per
//! line; logs and the progress bar go to stderr. Export jobs are written as
//! JSON manifests under the configured output directory.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use intertidal_lib::catalog::{StacCatalog, StacCatalogOptions};
use intertidal_lib::config::{Config, CONFIG_FILE};
use intertidal_lib::index::{ExportSettings, IndexExporter, ManifestSink};
use intertidal_lib::pipeline::{
    CancellationFlag, MatchedImage, Pipeline, ProgressReporter, RunStatus,
};
use intertidal_lib::tide_data::{HttpTransport, TidePredictionClient};
use intertidal_lib::validation::validate;

#[derive(Parser, Debug)]
#[command(name = "biointertidal-mapper")]
#[command(about = "Select Sentinel-2 scenes acquired at low tide and queue index exports")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// WorldTides API key (overrides the config file)
    #[arg(long, env = "WORLDTIDES_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Directory receiving export job manifests
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Log level, used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Disable the progress bar
    #[arg(long)]
    no_progress: bool,

    /// Write the default configuration to --config and exit
    #[arg(long)]
    write_default_config: bool,
}

/// Progress bar on stderr, 0 to 100.
struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    fn new(hidden: bool) -> Self {
        let bar = if hidden {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(100)
        };
        if let Ok(style) = ProgressStyle::with_template("{bar:40.cyan/blue} {pos:>3}% {msg}") {
            bar.set_style(style);
        }
        Self { bar }
    }
}

impl ProgressReporter for BarProgress {
    fn progress(&mut self, percent: f64) {
        self.bar.set_position(percent.clamp(0.0, 100.0).round() as u64);
    }

    fn matched(&mut self, found: &MatchedImage) {
        self.bar.set_message(format!("{} matched", found.date));
    }
}

/// Main application entry point.
fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if args.write_default_config {
        Config::default()
            .save_to_path(&args.config)
            .with_context(|| format!("writing {}", args.config.display()))?;
        return Ok(());
    }

    let mut config = Config::load_from_path(&args.config);
    if let Some(key) = args.api_key {
        config.parameters.api_key = key;
    }
    if let Some(dir) = args.output_dir {
        config.export.output_dir = dir;
    }

    let run = match validate(&config) {
        Ok(run) => run,
        Err(e) => {
            error!(error = %e, "invalid parameters");
            return Err(anyhow!(e).context("invalid parameters, run not started"));
        }
    };

    let transport = HttpTransport::new(Duration::from_secs(config.tides.timeout_secs))
        .context("building tide HTTP client")?;
    let tides = TidePredictionClient::new(transport, config.tides.endpoint.clone(), run.key_ring())
        .with_date_dedupe(config.tides.dedupe_by_date);

    let catalog = StacCatalog::new(StacCatalogOptions {
        endpoint: config.catalog.endpoint.clone(),
        collection: config.catalog.collection.clone(),
        page_size: config.catalog.page_size,
        max_items: config.catalog.max_items,
        request_timeout: Duration::from_secs(config.catalog.timeout_secs),
        max_retries: config.catalog.max_retries,
    })
    .context("building catalog HTTP client")?;

    let exporter = IndexExporter::new(
        ManifestSink::new(&config.export.output_dir),
        run.index,
        run.mask,
        ExportSettings {
            folder: run.folder.clone(),
            epsg: run.epsg,
            scale_m: config.export.scale_m,
            max_pixels: config.export.max_pixels,
        },
    );

    let mut pipeline = Pipeline::new(catalog, tides, exporter);
    let mut progress = BarProgress::new(args.no_progress);
    let cancel = CancellationFlag::new();

    // Create Tokio runtime for async operations
    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after the current scene");
                on_signal.cancel();
            }
        });
        pipeline.run(&run, &mut progress, &cancel).await
    });
    progress.bar.finish_and_clear();

    for found in &result.matches {
        println!("{}", found.date);
    }
    info!(
        found = result.scenes_found,
        checked = result.scenes_checked,
        matched = result.matches.len(),
        export_failures = result.export_failures,
        "run finished"
    );

    match result.status {
        RunStatus::Completed => Ok(()),
        RunStatus::NoMatches => {
            println!("No images were found that meet the conditions.");
            Ok(())
        }
        RunStatus::Cancelled => Err(anyhow!("run cancelled")),
        RunStatus::Aborted(reason) => Err(anyhow!("run aborted: {}", reason)),
    }
}
