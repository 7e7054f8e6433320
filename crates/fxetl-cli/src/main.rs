use anyhow::Result;
use clap::{Parser, Subcommand};
use fxetl_core::SourceKind;
use fxetl_sync::{Etl, EtlConfig, RunSummary};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fxetl")]
#[command(about = "Forex rates batch ETL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest the daily rates API
    Api,
    /// Ingest the historical rates CSV
    Csv,
    /// Ingest the scraped rates page
    Scrape,
    /// Run all three pipelines in sequence
    All,
}

fn print_summary(summary: &RunSummary) {
    match &summary.outcome {
        Some(outcome) => println!(
            "{}: run_id={} rows={} inserted={} skipped={} synced={}",
            summary.kind,
            summary.run_id,
            summary.normalized_rows,
            outcome.inserted(),
            outcome.skipped(),
            summary.synced
        ),
        None => println!(
            "{}: run_id={} no usable rows, nothing persisted",
            summary.kind, summary.run_id
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = EtlConfig::from_env();
    info!(db = %config.db_path.display(), "starting etl");
    let etl = Etl::new(config)?;

    match cli.command.unwrap_or(Commands::All) {
        Commands::Api => print_summary(&etl.run(SourceKind::Api).await?),
        Commands::Csv => print_summary(&etl.run(SourceKind::History).await?),
        Commands::Scrape => print_summary(&etl.run(SourceKind::Scrape).await?),
        Commands::All => {
            let mut failed = 0usize;
            for (kind, result) in etl.run_all().await {
                match result {
                    Ok(summary) => print_summary(&summary),
                    Err(err) => {
                        failed += 1;
                        eprintln!("{kind}: failed: {err:#}");
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} pipeline(s) failed");
            }
        }
    }

    Ok(())
}
