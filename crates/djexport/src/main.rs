//! djexport - Export a DJ library snapshot to an Engine-style database
//!
//! ## Commands
//!
//! - `export`: copy tracks and crates to a destination directory
//! - `init-config`: write the default configuration file
//! - `show-config`: print the configuration in effect
//!
//! Exit status of `export`: 0 when finished, 2 when cancelled, 1 on failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use djexport_core::config::{default_config_path, load_config, read_config, save_config, ExportConfig};
use djexport_core::copier::FsFileCopier;
use djexport_core::db::EngineLibrary;
use djexport_core::export::{ExportOutcome, ExportRequest, ExportScope, LibraryExporter};
use djexport_core::jobs::JobRunner;
use djexport_core::library::{LibrarySnapshot, WorkSetResolver};
use djexport_core::services::{AnalysisClient, AnalysisCommand, AnalysisService};
use djexport_core::CrateId;

const EXIT_CANCELLED: u8 = 2;

#[derive(Parser)]
#[command(name = "djexport", version, about = "Export a DJ library to an Engine-style database")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Export tracks and crates to a destination directory
    Export(ExportArgs),
    /// Write the default configuration file
    InitConfig {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the configuration in effect
    ShowConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ExportArgs {
    /// Library snapshot (YAML)
    #[arg(long)]
    library: PathBuf,
    /// Directory to export into, e.g. the root of a USB drive
    #[arg(long)]
    destination: PathBuf,
    /// Only export these crates (repeatable); exports everything if omitted
    #[arg(long = "crate", value_name = "ID")]
    crates: Vec<i64>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Write the database in place instead of staging it
    #[arg(long)]
    no_staging: bool,
}

fn main() -> ExitCode {
    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Export(args) => export(args),
        Command::InitConfig { config, force } => init_config(config, force),
        Command::ShowConfig { config } => show_config(config),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn export(args: ExportArgs) -> Result<ExitCode> {
    let config_path = args.config.unwrap_or_else(default_config_path);
    let config: ExportConfig = load_config(&config_path);

    let mut library = LibrarySnapshot::load(&args.library)
        .with_context(|| format!("Failed to load library {:?}", args.library))?;
    log::info!("Loaded library with {} tracks", library.track_count());

    let scope = if args.crates.is_empty() {
        ExportScope::WholeLibrary
    } else {
        ExportScope::SelectedCrates(args.crates.into_iter().map(CrateId).collect())
    };

    let mut analysis = AnalysisService::spawn().context("Failed to start analysis service")?;
    let locations = library.locations(&library.all_track_ids());
    let client = AnalysisClient::new(&analysis, locations);

    let mut exporter = LibraryExporter::new(
        Arc::new(FsFileCopier::new(config.copy_retries)),
        Arc::new(client),
        config.settings(),
    );
    let runner = JobRunner::new();
    let staged = config.stage_database && !args.no_staging;

    let request = ExportRequest {
        destination: Some(config.destination(&args.destination)),
        scope,
    };
    let job = exporter.submit_export(&runner, &library, request, |dest| {
        Box::new(EngineLibrary::with_staging(dest.database_dir.clone(), staged))
    })?;

    let progress_rx = &job.progress_rx;
    let outcome = runner.run_until_complete(&mut library, job.result, |_| {
        for message in progress_rx.try_iter() {
            println!("{}", message.description());
        }
    })?;
    for message in progress_rx.try_iter() {
        println!("{}", message.description());
    }

    runner.shutdown(&mut library);
    analysis.stop(AnalysisCommand::Shutdown);

    Ok(match outcome {
        ExportOutcome::Finished(summary) => {
            for (track, reason) in &summary.failed_tracks {
                eprintln!("Track {} was not exported: {}", track, reason);
            }
            ExitCode::SUCCESS
        }
        ExportOutcome::Cancelled(_) => ExitCode::from(EXIT_CANCELLED),
        ExportOutcome::Failed(_) => ExitCode::FAILURE,
    })
}

fn init_config(path: Option<PathBuf>, force: bool) -> Result<ExitCode> {
    let path = path.unwrap_or_else(default_config_path);
    if path.exists() && !force {
        anyhow::bail!("{:?} already exists (use --force to overwrite)", path);
    }
    save_config(&ExportConfig::default(), &path)?;
    println!("Wrote {}", path.display());
    Ok(ExitCode::SUCCESS)
}

fn show_config(path: Option<PathBuf>) -> Result<ExitCode> {
    let path = path.unwrap_or_else(default_config_path);
    let config: ExportConfig = match read_config(&path)? {
        Some(config) => {
            println!("# {}", path.display());
            config
        }
        None => {
            println!("# {} does not exist, showing defaults", path.display());
            ExportConfig::default()
        }
    };
    print!("{}", config.to_yaml().context("Failed to serialize config")?);
    Ok(ExitCode::SUCCESS)
}
