//! obsingest: register raw exposure files in an observation registry.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use obsingest_core::{IngestConfig, InstrumentIdentityProvider};
use obsingest_ingest::FitsHeaderExtractor;
use obsingest_registry::SqliteRegistry;
use obsingest_runtime::{CancelHandle, Orchestrator};

const USAGE: &str = "\
Usage: obsingest <command> [options]

Commands:
  ingest --config <file> --instruments <file> [--registry <dir>] <raw-file>...
                           Ingest raw files and print the report as JSON
  stats [--registry <dir>] Show registry row counts
  help                     Show this help message

The registry directory defaults to $OBSINGEST_REGISTRY, then ./registry.";

struct IngestArgs {
    config: PathBuf,
    instruments: PathBuf,
    registry: Option<PathBuf>,
    files: Vec<PathBuf>,
}

fn resolve_registry_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var("OBSINGEST_REGISTRY").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("registry"))
}

fn parse_ingest(args: &[String]) -> anyhow::Result<IngestArgs> {
    let mut config = None;
    let mut instruments = None;
    let mut registry = None;
    let mut files = Vec::new();

    let mut it = args.iter();
    while let Some(arg) = it.next() {
        let mut value = |flag: &str| {
            it.next()
                .map(PathBuf::from)
                .ok_or_else(|| anyhow!("{} needs a value", flag))
        };
        match arg.as_str() {
            "--config" => config = Some(value("--config")?),
            "--instruments" => instruments = Some(value("--instruments")?),
            "--registry" => registry = Some(value("--registry")?),
            flag if flag.starts_with("--") => bail!("unknown option {}", flag),
            file => files.push(PathBuf::from(file)),
        }
    }

    Ok(IngestArgs {
        config: config.context("--config is required")?,
        instruments: instruments.context("--instruments is required")?,
        registry,
        files,
    })
}

fn parse_registry_flag(args: &[String]) -> anyhow::Result<Option<PathBuf>> {
    match args {
        [] => Ok(None),
        [flag, dir] if flag == "--registry" => Ok(Some(PathBuf::from(dir))),
        _ => bail!("expected [--registry <dir>]"),
    }
}

async fn run_ingest(args: IngestArgs) -> anyhow::Result<bool> {
    if args.files.is_empty() {
        bail!("no raw files given");
    }
    let config = IngestConfig::load(&args.config)?;
    let instruments = InstrumentIdentityProvider::from_definitions_file(&args.instruments)?;

    let registry_dir = resolve_registry_dir(args.registry);
    info!("Registry directory: {}", registry_dir.display());
    let registry = SqliteRegistry::open(&registry_dir)
        .map_err(|e| anyhow!("Failed to open registry: {}", e))?;

    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        Arc::new(FitsHeaderExtractor::new()),
        Arc::new(instruments),
    );

    let cancel = CancelHandle::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight files");
            on_signal.cancel();
        }
    });

    let report = orchestrator
        .ingest_with_cancel(args.files, &config, cancel)
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    for failed in report.failures() {
        warn!(
            "{}: {} ({})",
            failed.path.display(),
            failed.reason.as_deref().unwrap_or("unknown"),
            failed
                .error_kind
                .map(|k| k.to_string())
                .unwrap_or_default()
        );
    }
    Ok(report.exit_success())
}

fn run_stats(registry: Option<PathBuf>) -> anyhow::Result<()> {
    let registry = SqliteRegistry::open(resolve_registry_dir(registry))
        .map_err(|e| anyhow!("Failed to open registry: {}", e))?;
    let stats = registry.get_stats()?;
    println!("Exposures:         {}", stats.exposures);
    println!("Raw datasets:      {}", stats.raw_datasets);
    println!("Visit definitions: {}", stats.visit_definitions);
    for (dimension, count) in &stats.dimension_records {
        println!("  {:<16} {}", dimension, count);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");
    let rest = args.get(2..).unwrap_or(&[]);

    match command {
        "ingest" => {
            let ok = run_ingest(parse_ingest(rest)?).await?;
            std::process::exit(if ok { 0 } else { 1 });
        }
        "stats" => run_stats(parse_registry_flag(rest)?),
        "--help" | "-h" | "help" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}. Use 'obsingest help' for usage.", other);
            std::process::exit(2);
        }
    }
}
