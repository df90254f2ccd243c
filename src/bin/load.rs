use clap::Parser;
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use bqtransfer::config::{
    LoadConfig, LOAD_DATASET_ID, LOAD_FILE_PATH, LOAD_LOCATION, LOAD_TABLE_ID, PROJECT_ID,
};
use bqtransfer::error::{BigQueryError, TransferError};
use bqtransfer::{BqClient, DatasetStatus, Loader};

#[derive(Parser)]
#[command(name = "bqtransfer-load")]
#[command(about = "Replace a BigQuery table with the contents of a newline-delimited JSON file")]
#[command(version)]
struct Cli {
    /// Newline-delimited JSON file to load
    #[arg(short, long, default_value = LOAD_FILE_PATH)]
    file: PathBuf,

    /// GCP project ID
    #[arg(short, long, default_value = PROJECT_ID)]
    project: String,

    /// Destination dataset (created if absent)
    #[arg(short, long, default_value = LOAD_DATASET_ID)]
    dataset: String,

    /// Destination table (contents are replaced)
    #[arg(short, long, default_value = LOAD_TABLE_ID)]
    table: String,

    /// Location for a newly created dataset
    #[arg(long, default_value = LOAD_LOCATION)]
    location: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("bqtransfer=debug,info")
    } else {
        EnvFilter::new("bqtransfer=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            print_error(e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = LoadConfig::default()
        .with_source(cli.file)
        .with_destination(&cli.project, &cli.dataset, &cli.table)
        .with_location(cli.location);

    // Client setup may reach the metadata server, so a missing file fails first.
    config.resolve_source()?;

    let client = BqClient::new().await?;
    let report = Loader::new(&client, config).run().await?;

    let dataset_note = match report.dataset {
        DatasetStatus::Created => " (dataset created)",
        DatasetStatus::Existing => "",
    };
    println!(
        "{} Loaded {} rows from {} into {}{} in {:.1}s",
        "✓".green(),
        report.stats.output_rows,
        report.source.display(),
        report.stats.destination,
        dataset_note,
        report.stats.elapsed().num_milliseconds() as f64 / 1000.0
    );
    println!("  Job: {}", report.stats.job_id);

    Ok(())
}

fn print_error(err: Box<dyn std::error::Error>) {
    if let Some(transfer_err) = err.downcast_ref::<TransferError>() {
        if let Some(bq) = transfer_err.bigquery() {
            print_bq_error(transfer_err, bq);
            return;
        }
    }

    eprintln!("{} {}", "✗ Error:".red(), err);
}

fn print_bq_error(err: &TransferError, bq: &BigQueryError) {
    eprintln!("\n{}", format!("✗ BigQuery Error [{}]", bq.error_code()).red());
    eprintln!("  {}", err);
    eprintln!("\n{}", "Suggestion:".yellow());
    for line in bq.suggestion().lines() {
        eprintln!("  {}", line);
    }
    eprintln!();
}
