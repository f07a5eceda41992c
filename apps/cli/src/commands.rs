//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tracing::{info, warn};
use url::Url;

use meshharvest_converter::BlenderConverter;
use meshharvest_core::cleaner::ModelCleaner;
use meshharvest_core::pipeline::{PipelineConfig, ProgressReporter, run_pipeline};
use meshharvest_core::report::RunState;
use meshharvest_core::{CrawlerConfig, DownloaderConfig};
use meshharvest_shared::{
    AppConfig, DownloadResult, OutputLayout, RecordId, RetryPolicy, init_config, load_config,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// MeshHarvest — harvest 3D building models over a map grid.
#[derive(Parser)]
#[command(
    name = "meshharvest",
    version,
    about = "Crawl a map listing over a GeoJSON grid and harvest 3D building models.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the full pipeline: crawl, clean, download, convert.
    Run {
        /// GeoJSON grid file describing the cells to crawl.
        #[arg(long)]
        grid: PathBuf,

        /// Output root directory (defaults to config `output.root`).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Listing endpoint URL (overrides config `endpoints.listing_url`).
        #[arg(long)]
        listing_url: Option<String>,

        /// Grid cells crawled in parallel.
        #[arg(long)]
        crawl_concurrency: Option<u32>,

        /// Concurrent asset downloads.
        #[arg(long)]
        download_concurrency: Option<u32>,

        /// Maximum pages fetched per grid cell.
        #[arg(long)]
        page_cap: Option<u32>,

        /// Path to the Blender executable.
        #[arg(long, env = "MESHHARVEST_BLENDER_EXE")]
        blender: Option<PathBuf>,

        /// Path to the Blender-side conversion script.
        #[arg(long)]
        convert_script: Option<PathBuf>,

        /// Skip the conversion stage even if Blender is configured.
        #[arg(long)]
        skip_convert: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "meshharvest=info",
        1 => "meshharvest=debug",
        _ => "meshharvest=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            grid,
            out,
            listing_url,
            crawl_concurrency,
            download_concurrency,
            page_cap,
            blender,
            convert_script,
            skip_convert,
        } => {
            cmd_run(RunArgs {
                grid,
                out,
                listing_url,
                crawl_concurrency,
                download_concurrency,
                page_cap,
                blender,
                convert_script,
                skip_convert,
            })
            .await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

struct RunArgs {
    grid: PathBuf,
    out: Option<PathBuf>,
    listing_url: Option<String>,
    crawl_concurrency: Option<u32>,
    download_concurrency: Option<u32>,
    page_cap: Option<u32>,
    blender: Option<PathBuf>,
    convert_script: Option<PathBuf>,
    skip_convert: bool,
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let config = load_config()?;

    // CLI flags override config file values, which override defaults.
    let listing_url = args
        .listing_url
        .or_else(|| {
            (!config.endpoints.listing_url.is_empty()).then(|| config.endpoints.listing_url.clone())
        })
        .ok_or_else(|| {
            eyre!("no listing URL: pass --listing-url or set endpoints.listing_url in the config")
        })?;
    let listing_url =
        Url::parse(&listing_url).map_err(|e| eyre!("invalid listing URL '{listing_url}': {e}"))?;

    let out_root = args
        .out
        .unwrap_or_else(|| PathBuf::from(&config.output.root));
    let layout = OutputLayout::new(&out_root);

    let blender_exe = args
        .blender
        .or_else(|| config.output.blender_exe.as_ref().map(PathBuf::from));
    let convert_script = args
        .convert_script
        .or_else(|| config.output.convert_script.as_ref().map(PathBuf::from));

    let convert = match (&blender_exe, &convert_script) {
        _ if args.skip_convert => false,
        (Some(_), Some(_)) => true,
        (None, None) => {
            info!("blender not configured, conversion stage disabled");
            false
        }
        _ => {
            warn!("conversion needs both blender_exe and convert_script, stage disabled");
            false
        }
    };

    let retry = RetryPolicy::from(&config.retry);
    let timeout = Duration::from_secs(config.endpoints.timeout_secs);

    let pipeline_config = PipelineConfig {
        grid_file: args.grid.clone(),
        crawler: CrawlerConfig {
            listing_url,
            zoom: config.endpoints.zoom,
            page_cap: args.page_cap.unwrap_or(config.defaults.page_cap),
            concurrency: args
                .crawl_concurrency
                .unwrap_or(config.defaults.crawl_concurrency) as usize,
            timeout,
            retry: retry.clone(),
        },
        downloader: DownloaderConfig {
            obj_dir: layout.obj_dir.clone(),
            texture_dir: layout.texture_dir.clone(),
            concurrency: args
                .download_concurrency
                .unwrap_or(config.defaults.download_concurrency) as usize,
            timeout,
            retry,
        },
        layout: layout.clone(),
        convert,
    };

    // The converter is constructed even when conversion is disabled; the
    // pipeline only invokes it when `convert` is set.
    let converter = BlenderConverter::new(
        blender_exe.unwrap_or_else(|| PathBuf::from("blender")),
        convert_script.unwrap_or_else(|| PathBuf::from("scripts/obj_to_glb.py")),
        layout.converter_dir.clone(),
    )?;

    info!(grid = %args.grid.display(), out = %out_root.display(), convert, "starting run");

    // Ctrl-C flips the cancellation flag; stages stop starting new work
    // and the run ends with a partial report.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight work");
            let _ = cancel_tx.send(true);
        }
    });

    let reporter = CliProgress::new();
    let report = run_pipeline(
        pipeline_config,
        &ModelCleaner::new(),
        &converter,
        &reporter,
        cancel_rx,
    )
    .await?;
    reporter.finish();

    println!();
    print!("{}", report.render());
    println!();

    if !report.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn stage_changed(&self, state: RunState) {
        self.spinner.set_message(format!("{state:?}"));
    }

    fn record_crawled(&self, total: u64) {
        self.spinner.set_message(format!("Crawling: {total} records"));
    }

    fn download_completed(&self, result: &DownloadResult) {
        self.spinner.set_message(format!(
            "Downloaded {}/{}",
            result.job.record_id, result.job.kind
        ));
    }

    fn model_converted(&self, id: &RecordId, ok: bool) {
        let verdict = if ok { "converted" } else { "failed" };
        self.spinner.set_message(format!("Converting: {id} {verdict}"));
    }
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
