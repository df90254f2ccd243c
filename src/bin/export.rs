use clap::Parser;
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use tabled::{Table, settings::Style};
use tracing_subscriber::EnvFilter;

use bqtransfer::config::{ExportConfig, EXPORT_DATASET_ID, PROJECT_ID};
use bqtransfer::error::{BigQueryError, TransferError};
use bqtransfer::{BqClient, Exporter};

#[derive(Parser)]
#[command(name = "bqtransfer-export")]
#[command(about = "Export every table of a BigQuery dataset to local CSV files")]
#[command(version)]
struct Cli {
    /// GCP project ID
    #[arg(short, long, default_value = PROJECT_ID)]
    project: String,

    /// Dataset whose tables are exported
    #[arg(short, long, default_value = EXPORT_DATASET_ID)]
    dataset: String,

    /// Output directory (defaults to exports/<dataset>)
    #[arg(short, long)]
    output: Option<PathBuf>,

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
    let mut config = ExportConfig::default().with_dataset(&cli.project, &cli.dataset);
    if let Some(dir) = cli.output {
        config = config.with_output_dir(dir);
    }

    let client = BqClient::new().await?;
    let exporter = Exporter::new(&client, config);
    let report = exporter.run().await?;

    let mut table = Table::new(report.summary_rows());
    table.with(Style::markdown());
    println!("\n{}\n", table);

    let elapsed = report.finished_at - report.started_at;
    println!(
        "{} Exported {} tables ({} rows) from {} in {:.1}s",
        "✓".green(),
        report.tables.len(),
        report.total_rows(),
        report.dataset,
        elapsed.num_milliseconds() as f64 / 1000.0
    );

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
