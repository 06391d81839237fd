//! Exposes the command line application.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use pictor_service::caching::{DecodeOptions, MaxSize};
use pictor_service::config::Config;
use pictor_service::logging;
use pictor_service::metrics;
use pictor_service::services::SharedServices;
use pictor_service::types::RequestOptions;

use crate::load::{LoadPlan, load_all};
use crate::output;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Outputs one row per request.
    Table,
    /// Outputs all requests as a JSON array.
    Json,
}

/// Loads images through the Pictor pipeline.
///
/// Every URI is submitted as its own request. Local paths, `file://` and `http(s)://` URIs
/// are supported.
#[derive(Clone, Parser, Debug)]
#[command(author, version, about, long_about)]
pub struct Cli {
    /// The images to load.
    #[arg(required = true)]
    pub uris: Vec<String>,

    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// The output format.
    #[arg(long, value_enum, default_value = "table")]
    pub format: OutputFormat,

    /// Downscale images to fit into `WIDTHxHEIGHT`.
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_max_size)]
    pub max_size: Option<MaxSize>,

    /// Load every image a second time after the first round has finished.
    ///
    /// With the memory cache enabled, the second round is served from the cache.
    #[arg(long)]
    pub twice: bool,

    /// Neither read from nor write to the memory cache.
    #[arg(long)]
    pub no_cache: bool,
}

fn parse_max_size(value: &str) -> Result<MaxSize, String> {
    let (width, height) = value
        .split_once('x')
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got `{value}`"))?;
    let width = width
        .trim()
        .parse()
        .map_err(|e| format!("invalid width: {e}"))?;
    let height = height
        .trim()
        .parse()
        .map_err(|e| format!("invalid height: {e}"))?;

    if width == 0 || height == 0 {
        return Err("width and height must be positive".into());
    }
    Ok(MaxSize { width, height })
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        ..Default::default()
    });

    // SAFETY: The runtime is not started yet, so we are still single-threaded.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd,
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure metrics")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("pictor-io")
        .enable_all()
        .build()
        .context("failed to create runtime")?;

    let services = SharedServices::new(config, runtime.handle().clone())
        .context("failed to create services")?;

    let plan = LoadPlan {
        uris: cli.uris,
        decode: DecodeOptions {
            max_size: cli.max_size,
        },
        options: match cli.no_cache {
            true => RequestOptions::uncached(),
            false => RequestOptions::default(),
        },
        rounds: if cli.twice { 2 } else { 1 },
    };

    let reports = runtime.block_on(load_all(&services, plan));

    match cli.format {
        OutputFormat::Table => output::print_table(&reports),
        OutputFormat::Json => output::print_json(&reports)?,
    }

    let failed = reports.iter().filter(|report| !report.is_completed()).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} requests did not complete", reports.len());
    }

    Ok(())
}
