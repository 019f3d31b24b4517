use anyhow::Context;
use clap::{Parser, Subcommand};
use geoflow::pipeline::ingestion::{Delimiter, Ingestor};
use geoflow::{logging, storage, CancelToken, GeoflowError, JobConfig, Pipeline, RunReport, Services};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "geoflow")]
#[command(about = "Delimited text to spatial table ETL: ingest, merge, geocode, derive, write")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a job file
    Run {
        /// Path to the TOML job file
        #[arg(long)]
        job: PathBuf,
        /// Run every stage and validate the output without writing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// List the fields found in the headers of delimited files
    Fields {
        /// colon, comma, pipe, semicolon, space or tab
        #[arg(long, default_value = "comma")]
        delimiter: Delimiter,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Put a verified backup back in place of a spatial table
    Restore {
        #[arg(long)]
        backup: PathBuf,
        #[arg(long)]
        dest: PathBuf,
    },
}

fn print_report(report: &RunReport) {
    let verb = if report.dry_run { "validated (dry run)" } else { "completed" };
    println!("\n✅ Job '{}' {} in {:.2?}", report.job, verb, report.elapsed);
    println!("   Records read: {}", report.records_read);
    println!("   Records merged: {}", report.records_merged);
    println!("   Features written: {}", report.written);
    println!(
        "   Skipped: {} (geometry_parse {}, lookup_miss {}, service_error {})",
        report.skipped.total(),
        report.skipped.geometry_parse,
        report.skipped.lookup_miss,
        report.skipped.service_error
    );
    for path in &report.outputs {
        println!("   Output: {}", path.display());
    }
    for path in &report.tabular {
        println!("   Tabular: {} ({} rows)", path.display(), report.tabular_rows);
    }
    for path in &report.backups {
        println!("   Backup: {}", path.display());
    }
}

fn run_job(job_path: &Path, dry_run: bool) -> anyhow::Result<RunReport> {
    let job = JobConfig::load(job_path)?;
    let cancel = CancelToken::new();
    signal_hook::flag::register(signal_hook::consts::SIGINT, cancel.flag())
        .context("failed to install Ctrl-C handler")?;

    let services = if job.geometry.needs_services() {
        Services::nominatim(job.service.settings(), &cancel)?
    } else {
        Services::offline()
    };

    let report = Pipeline::new(&job, &services, cancel).dry_run(dry_run).run()?;
    Ok(report)
}

fn list_fields(delimiter: Delimiter, files: &[PathBuf]) -> anyhow::Result<()> {
    let (_, catalog) = Ingestor::new(delimiter).read_files(files)?;
    for (file, fields) in files.iter().zip(&catalog.per_source) {
        println!("📄 {}: {}", file.display(), fields.join(", "));
    }
    if files.len() > 1 {
        let union: Vec<&str> = catalog.union.iter().map(String::as_str).collect();
        println!("🧮 All fields: {}", union.join(", "));
    }
    Ok(())
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    logging::init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { job, dry_run } => {
            info!(job = %job.display(), dry_run, "Starting run");
            match run_job(&job, dry_run) {
                Ok(report) => {
                    print_report(&report);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!("Job {} failed: {:#}", job.display(), e);
                    println!("❌ Job {} failed: {:#}", job.display(), e);
                    if let Some(GeoflowError::Write {
                        backup: Some(backup),
                        ..
                    }) = e.downcast_ref::<GeoflowError>()
                    {
                        println!(
                            "   Restore with: geoflow restore --backup {} --dest <table>",
                            backup.display()
                        );
                    }
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Fields { delimiter, files } => match list_fields(delimiter, &files) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                println!("❌ Could not read fields: {:#}", e);
                ExitCode::FAILURE
            }
        },
        Commands::Restore { backup, dest } => match storage::restore_backup(&backup, &dest) {
            Ok(rows) => {
                println!("✅ Restored {} rows into {}", rows, dest.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Restore failed: {}", e);
                println!("❌ Restore of {} failed: {}", dest.display(), e);
                ExitCode::FAILURE
            }
        },
    }
}
