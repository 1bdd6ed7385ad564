//! Command line entry point: demo sweeps, run listing and CSV export.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mesoscope::config::Settings;
use mesoscope::data::CsvExporter;
use mesoscope::experiment::{create_exp, init_db};
use mesoscope::measurement::{lin_array, Spacing, Sweep1d};
use mesoscope::station::init_station;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "mesoscope",
    about = "Measurement automation for mesoscopic transport experiments",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a hardware-free gate sweep against the configured mock instrument.
    Demo {
        /// Number of setpoints.
        #[arg(long, default_value_t = 51)]
        points: usize,
    },
    /// List recorded runs.
    ListRuns,
    /// Export one stream of a recorded run to CSV.
    Export {
        /// Run id.
        run: u64,
        /// Stream name.
        #[arg(long, default_value = "primary")]
        stream: String,
        /// Output file.
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    let db = init_db(&settings.database.path)?;

    match cli.command {
        Command::Demo { points } => {
            let station = init_station(&settings).await?;
            let exp = create_exp(&db, "demo", "mock_sample");

            let gate = station.find_settable("mock1", "gate")?;
            let x = station.find_readable("mock1", "x")?;
            let current = station.find_readable("mock1", "current")?;

            let array = lin_array(-1.0, 1.0, Spacing::Points(points))?;
            let summary = Sweep1d::new(gate, array)
                .read(x)
                .read(current)
                .with_defaults(&settings.sweep)
                .named("demo gate trace")
                .run(&exp)
                .await?;
            info!(
                run_id = summary.run_id,
                events = summary.num_events,
                "demo sweep recorded"
            );
            println!(
                "run {} recorded with {} events in {}",
                summary.run_id,
                summary.num_events,
                settings.database.path.display()
            );
            station.close_all().await?;
        }
        Command::ListRuns => {
            for id in db.run_ids()? {
                let record = db.load_run(id)?;
                let (kind, name) = record
                    .start
                    .as_ref()
                    .map(|s| (s.sweep_kind.clone(), s.name.clone()))
                    .unwrap_or_default();
                let status = record
                    .stop
                    .as_ref()
                    .map(|s| format!("{:?}", s.exit_status))
                    .unwrap_or_else(|| "incomplete".to_string());
                println!(
                    "run {id}: {kind} '{name}' [{status}] {} events",
                    record.events.len()
                );
            }
        }
        Command::Export {
            run,
            stream,
            output,
        } => {
            CsvExporter::new().export(&db, run, &stream, &output)?;
            println!(
                "run {run} stream '{stream}' exported to {}",
                output.display()
            );
        }
    }
    Ok(())
}
