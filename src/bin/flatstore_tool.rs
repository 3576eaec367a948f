use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use flatstore::StoreConfig;
use flatstore::recovery::{inspect_data_dir, recover_interrupted_writes};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flatstore-tool")]
#[command(about = "Maintenance tooling for flatstore data directories")]
struct Cli {
    /// Data directory; defaults to $FLATSTORE_DATA_DIR or ./data
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Extension of collection documents
    #[arg(long, global = true, default_value = "json")]
    extension: String,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Promote or drop temp files left by interrupted writes
    Recover,
    /// List collections and their record counts
    Inspect,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let data_dir = cli
        .data_dir
        .unwrap_or_else(|| StoreConfig::from_env().data_dir);

    match cli.command {
        Command::Recover => recover(&data_dir, &cli.extension, cli.json).await,
        Command::Inspect => inspect(&data_dir, &cli.extension, cli.json).await,
    }
}

async fn recover(data_dir: &Path, extension: &str, json: bool) -> Result<()> {
    let report = recover_interrupted_writes(data_dir, extension)
        .await
        .with_context(|| format!("Recovery sweep over '{}' failed", data_dir.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for item in &report.recovered {
            println!(
                "recovered {} ({} records) -> {}",
                item.collection,
                item.records,
                item.target.display()
            );
        }
        for path in &report.dropped {
            println!("dropped   {}", path.display());
        }
        for failed in &report.failed {
            println!("FAILED    {}: {}", failed.path.display(), failed.error);
        }
        for path in &report.stale_backups {
            println!("stale bak {}", path.display());
        }
        if report.is_clean() {
            println!("nothing to recover in {}", data_dir.display());
        }
    }

    if !report.failed.is_empty() {
        bail!("{} artifact(s) could not be reconciled", report.failed.len());
    }
    Ok(())
}

async fn inspect(data_dir: &Path, extension: &str, json: bool) -> Result<()> {
    let summaries = inspect_data_dir(data_dir, extension)
        .await
        .with_context(|| format!("Failed to inspect '{}'", data_dir.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    println!("{:<32} {:>10} {:>12}", "COLLECTION", "RECORDS", "BYTES");
    for summary in &summaries {
        let records = summary
            .records
            .map(|n| n.to_string())
            .unwrap_or_else(|| "corrupt".to_string());
        println!("{:<32} {:>10} {:>12}", summary.name, records, summary.bytes);
    }
    Ok(())
}
