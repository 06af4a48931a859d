use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use scanq_core::app::{Console, ConsoleBuilder, QueueSnapshot, TickOutcome, WorkerKind};
use scanq_core::config::{ConfigSource, ConsoleConfig};
use scanq_core::domain::{ExamId, FolderName, ParamValue, Parameters, ReconMode, ScanSpec};

mod collaborators;

use collaborators::{SimulatedAcquisition, SimulatedReconstruction};

#[derive(Parser)]
#[command(name = "scanq", version, about = "Scan task queue for the scanner console")]
struct Cli {
    /// Config file (TOML or JSON); defaults to $SCANQ_CONFIG_PATH / $SCANQ_CONFIG_JSON
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the directory holding the stage directories
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the stage directories
    Init,
    /// Queue a new scan
    Create {
        /// Sequence identifier
        sequence: String,
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        counter: i64,
        #[arg(long, value_enum, default_value_t = ModeArg::Full)]
        mode: ModeArg,
        /// Sequence parameter, repeatable: --param te=70
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, ParamValue)>,
        /// Existing exam id; a new exam is opened otherwise
        #[arg(long)]
        exam: Option<ExamId>,
        #[arg(long, default_value = "HFS")]
        patient_position: String,
        #[arg(long, default_value = "")]
        protocol: String,
        /// Schedule immediately instead of leaving the scan editable
        #[arg(long)]
        schedule: bool,
    },
    /// Freeze a created scan and hand it to acquisition
    Schedule { folder: String },
    /// Copy a scan's settings into a new scan
    Duplicate {
        folder: String,
        #[arg(long, allow_negative_numbers = true)]
        counter: i64,
    },
    /// Print a scan's record and state
    Show { folder: String },
    /// List every scan with its state
    List {
        #[arg(long)]
        json: bool,
    },
    /// Run the acquisition worker
    Acq(WorkerArgs),
    /// Run the reconstruction worker
    Recon(WorkerArgs),
    /// Run both workers until interrupted
    Run(WorkerArgs),
    /// Delete a completed or failed scan
    Purge { folder: String },
    /// Delete every scan in every stage
    Clear {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(clap::Args, Clone)]
struct WorkerArgs {
    /// Drain the input stage once and exit instead of polling
    #[arg(long)]
    once: bool,
    /// Simulated acquisition time
    #[arg(long, default_value_t = 500)]
    acq_ms: u64,
    /// Simulated reconstruction time
    #[arg(long, default_value_t = 500)]
    recon_ms: u64,
    /// Number of placeholder images per scan
    #[arg(long, default_value_t = 3)]
    images: u32,
    /// Fail the first N acquisitions with "device timeout"
    #[arg(long, default_value_t = 0)]
    fail_acq: u32,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Bypass,
    FakeDicoms,
    Full,
}

impl From<ModeArg> for ReconMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Bypass => ReconMode::Bypass,
            ModeArg::FakeDicoms => ReconMode::FakeDicoms,
            ModeArg::Full => ReconMode::Full,
        }
    }
}

/// `key=value`; the value is read as JSON when it parses, as text otherwise.
fn parse_param(raw: &str) -> Result<(String, ParamValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter key in '{raw}'"));
    }
    let value = serde_json::from_str::<ParamValue>(value)
        .unwrap_or_else(|_| ParamValue::Text(value.to_string()));
    Ok((key.to_string(), value))
}

fn folder_arg(raw: &str) -> Result<FolderName> {
    FolderName::parse(raw).with_context(|| format!("'{raw}' is not a valid task folder name"))
}

fn load_config(cli: &Cli) -> Result<ConsoleConfig> {
    let (mut config, source) = match &cli.config {
        Some(path) => (
            ConsoleConfig::load_from_file(path)?,
            ConfigSource::File(path.clone()),
        ),
        None => ConsoleConfig::load_from_env()?,
    };
    if let Some(root) = &cli.data_root {
        config.data_root = root.clone();
    }
    info!(?source, data_root = %config.data_root.display(), "configuration loaded");
    Ok(config)
}

fn build_console(config: &ConsoleConfig, workers: Option<&WorkerArgs>) -> Result<Console> {
    let mut builder = ConsoleBuilder::from_config(config);
    if let Some(args) = workers {
        builder = builder
            .acquisition(Arc::new(SimulatedAcquisition::new(
                Duration::from_millis(args.acq_ms),
                args.fail_acq,
            )))
            .reconstruction(Arc::new(SimulatedReconstruction::new(
                Duration::from_millis(args.recon_ms),
                args.images,
            )))
            .expect_workers(&[WorkerKind::Acquisition, WorkerKind::Reconstruction]);
    }
    Ok(builder.build()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Init => {
            let console = build_console(&config, None)?;
            console.store().ensure_layout().await?;
            println!("stage directories ready under {}", config.data_root.display());
        }
        Commands::Create {
            sequence,
            counter,
            mode,
            params,
            exam,
            patient_position,
            protocol,
            schedule,
        } => {
            let console = build_console(&config, None)?;
            console.store().ensure_layout().await?;
            let mut exam_info = console.tasks.open_exam(patient_position);
            if let Some(id) = exam {
                exam_info.id = id;
            }
            let mut spec = ScanSpec::new(sequence, counter, exam_info).with_mode(mode.into());
            spec.protocol_name = protocol;
            spec.parameters = params.into_iter().collect::<Parameters>();

            let folder = console.tasks.create(spec).await?;
            if schedule {
                console.tasks.schedule(&folder).await?;
            }
            println!("{folder}");
        }
        Commands::Schedule { folder } => {
            let console = build_console(&config, None)?;
            let folder = folder_arg(&folder)?;
            console.tasks.schedule(&folder).await?;
            println!("{folder} scheduled");
        }
        Commands::Duplicate { folder, counter } => {
            let console = build_console(&config, None)?;
            let copy = console.tasks.duplicate(&folder_arg(&folder)?, counter).await?;
            println!("{copy}");
        }
        Commands::Show { folder } => {
            let console = build_console(&config, None)?;
            let folder = folder_arg(&folder)?;
            let Some(stage) = console.tasks.locate(&folder).await? else {
                bail!("task {folder} is not in any stage");
            };
            let state = console.tasks.state_of(&folder).await?;
            let record = console.tasks.read(stage, &folder).await?;
            println!("state: {state}");
            println!("path:  {}", console.tasks.path_of(&folder).await?.display());
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::List { json } => {
            let console = build_console(&config, None)?;
            let snapshot = console.introspection.snapshot().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_snapshot(&snapshot);
            }
        }
        Commands::Acq(args) => run_workers(&config, &args, &[WorkerKind::Acquisition]).await?,
        Commands::Recon(args) => run_workers(&config, &args, &[WorkerKind::Reconstruction]).await?,
        Commands::Run(args) => {
            run_workers(
                &config,
                &args,
                &[WorkerKind::Acquisition, WorkerKind::Reconstruction],
            )
            .await?
        }
        Commands::Purge { folder } => {
            let console = build_console(&config, None)?;
            let folder = folder_arg(&folder)?;
            let stage = console.cleanup.purge(&folder).await?;
            println!("{folder} removed from {stage}");
        }
        Commands::Clear { yes } => {
            if !yes {
                bail!("refusing to delete every task without --yes");
            }
            let console = build_console(&config, None)?;
            console.cleanup.clear_all().await?;
            println!("all stages cleared");
        }
    }

    Ok(())
}

async fn run_workers(config: &ConsoleConfig, args: &WorkerArgs, kinds: &[WorkerKind]) -> Result<()> {
    let console = build_console(config, Some(args))?;
    let scanners: Vec<_> = kinds.iter().filter_map(|&kind| console.scanner(kind)).collect();

    if args.once {
        for scanner in &scanners {
            let report = scanner.prepare().await?;
            if !report.is_empty() {
                info!(
                    worker = scanner.kind().name(),
                    requeued = report.requeued.len(),
                    forwarded = report.forwarded.len(),
                    failed = report.failed.len(),
                    "recovered stranded tasks"
                );
            }
            loop {
                match scanner.tick().await? {
                    TickOutcome::Idle => break,
                    outcome => println!("{}: {outcome:?}", scanner.kind().name()),
                }
            }
        }
        return Ok(());
    }

    let group = scanq_core::app::WorkerGroup::spawn(scanners);
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for ctrl-c")?;
            info!("received ctrl-c, finishing in-flight scans");
        }
        _ = group.stopped() => {
            warn!("a worker stopped on its own");
        }
    }
    group.shutdown_and_join().await?;
    Ok(())
}

fn print_snapshot(snapshot: &QueueSnapshot) {
    println!("{:<36} STATE", "FOLDER");
    for entry in &snapshot.entries {
        println!("{:<36} {}", entry.folder, entry.state);
    }
    let counts = &snapshot.counts;
    println!();
    println!(
        "created {} | scheduled {} | acq {} | recon queue {} | recon {} | complete {} | failure {}",
        counts.created,
        counts.scheduled_acq,
        counts.acq,
        counts.scheduled_recon,
        counts.recon,
        counts.complete,
        counts.failure
    );
    println!(
        "acquisition {} | reconstruction {} | last completed {}",
        if snapshot.acquisition_active { "busy" } else { "idle" },
        if snapshot.reconstruction_active { "busy" } else { "idle" },
        snapshot
            .last_completed
            .as_ref()
            .map(FolderName::as_str)
            .unwrap_or("-")
    );
}
