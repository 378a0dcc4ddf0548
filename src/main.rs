//! CLI Entry Point for lab_daq
//!
//! Provides a command-line interface for:
//! - Listing the device catalog and who holds which device
//! - Verifying or scanning instrument addresses
//! - Running a batch (sweep, repeat, temperature ramp) on one device
//! - Inspecting batch checkpoints
//!
//! # Usage
//!
//! ```bash
//! lab_daq devices --kind SMU
//! lab_daq verify "SMU-B" /dev/ttyUSB0 --save
//! lab_daq run SMU-A --sample S1 --measurement iv linear 0 1 0.25
//! lab_daq run SMU-A --sample S1 --measurement noise --dry-run repeat 3 --wait 1
//! lab_daq checkpoint data/checkpoints
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lab_daq::config::{DeviceCatalogFile, LabConfig};
use lab_daq::data::storage::{MemorySink, PersistenceSink, TextFileSink};
use lab_daq::error::AppResult;
use lab_daq::experiment::{
    BatchCheckpoint, BatchDriver, BatchEvent, BatchSequencer, BatchStatus, OutputNaming,
    StepPolicy, SuffixMode,
};
use lab_daq::hardware::probe::available_serial_ports;
use lab_daq::hardware::{CapabilityKind, DeviceRegistry};
use lab_daq::logging;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "lab_daq")]
#[command(about = "Instrument catalog and batch measurements", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = lab_daq::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured devices
    Devices {
        /// Only devices of these kinds (e.g. SMU, Lockin)
        #[arg(long = "kind")]
        kinds: Vec<CapabilityKind>,
    },

    /// Check that an address hosts the named device
    Verify {
        name: String,
        address: String,
        /// Save the catalog as the last working configuration on success
        #[arg(long)]
        save: bool,
    },

    /// Try candidate addresses until one verifies
    Scan {
        name: String,
        /// Candidate addresses; defaults to every serial port on the host
        #[arg(long = "port")]
        ports: Vec<String>,
        #[arg(long)]
        save: bool,
    },

    /// Run a batch on one device
    Run {
        device: String,
        #[arg(long)]
        sample: String,
        #[arg(long)]
        measurement: String,
        #[arg(long, default_value = "")]
        comment: String,
        /// Step file suffix: counter, value or timestamp
        #[arg(long, default_value = "counter")]
        suffix: SuffixMode,
        /// Label in front of value suffixes
        #[arg(long)]
        label: Option<String>,
        /// Output directory (overrides storage.output_dir)
        #[arg(long)]
        output: Option<PathBuf>,
        /// Continue after the last step recorded in the summary log
        #[arg(long)]
        resume: bool,
        /// Keep results in memory instead of writing files
        #[arg(long)]
        dry_run: bool,
        #[command(subcommand)]
        policy: PolicyArgs,
    },

    /// Show a checkpoint file, or the latest one in a directory
    Checkpoint { path: PathBuf },
}

#[derive(Subcommand)]
enum PolicyArgs {
    /// Linear sweep from start to stop
    Linear { start: f64, stop: f64, step: f64 },
    /// Logarithmic sweep with a fixed number of points per decade
    Log {
        start: f64,
        stop: f64,
        points_per_decade: u32,
    },
    /// Repeat the same measurement
    Repeat {
        count: usize,
        /// Seconds to wait between repetitions
        #[arg(long, default_value_t = 0.0)]
        wait: f64,
    },
    /// Temperature ramp
    Ramp { start: f64, stop: f64, step: f64 },
}

impl From<PolicyArgs> for StepPolicy {
    fn from(args: PolicyArgs) -> Self {
        match args {
            PolicyArgs::Linear { start, stop, step } => StepPolicy::LinearSweep { start, stop, step },
            PolicyArgs::Log {
                start,
                stop,
                points_per_decade,
            } => StepPolicy::LogSweep {
                start,
                stop,
                points_per_decade,
            },
            PolicyArgs::Repeat { count, wait } => StepPolicy::RepeatN {
                count,
                wait_seconds: wait,
            },
            PolicyArgs::Ramp { start, stop, step } => StepPolicy::TemperatureRamp { start, stop, step },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = LabConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    config.validate()?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let registry = DeviceRegistry::with_builtin().with_verify_timeout(config.timeouts.verify);
    registry.load(config.devices.clone())?;
    info!(devices = registry.len(), "Device catalog loaded");

    match cli.command {
        Commands::Devices { kinds } => list_devices(&registry, &kinds),
        Commands::Verify {
            name,
            address,
            save,
        } => {
            let verified = registry.verify(&name, &address).await;
            println!("{name} at {address}: {}", if verified { "verified" } else { "not verified" });
            if verified && save {
                save_catalog(&registry)?;
            }
            Ok(())
        }
        Commands::Scan { name, ports, save } => {
            let candidates = if ports.is_empty() {
                available_serial_ports()
            } else {
                ports
            };
            match registry.scan(&name, &candidates).await {
                Some(address) => {
                    println!("{name} found at {address}");
                    if save {
                        save_catalog(&registry)?;
                    }
                }
                None => println!("{name} not found on {} candidate(s)", candidates.len()),
            }
            Ok(())
        }
        Commands::Run {
            device,
            sample,
            measurement,
            comment,
            suffix,
            label,
            output,
            resume,
            dry_run,
            policy,
        } => {
            let mut naming = OutputNaming::new(
                output.unwrap_or_else(|| config.storage.output_dir.clone()),
                sample,
                measurement,
            )
            .with_comment(comment)
            .with_suffix_mode(suffix)
            .with_file_header(config.storage.file_header.clone());
            if let Some(label) = label {
                naming = naming.with_value_label(label);
            }
            let request = RunRequest {
                device,
                policy: policy.into(),
                naming,
                resume,
                dry_run,
            };
            run_batch(&registry, &config, request).await
        }
        Commands::Checkpoint { path } => show_checkpoint(path),
    }
}

fn list_devices(registry: &DeviceRegistry, kinds: &[CapabilityKind]) -> Result<()> {
    let busy = registry.busy_devices();
    let names = if kinds.is_empty() {
        registry.descriptors().into_iter().map(|d| d.name).collect()
    } else {
        registry.list_by_kind(kinds)
    };

    for name in names {
        let Some(d) = registry.descriptor(&name) else {
            continue;
        };
        let state = if busy.contains(&d.name) { "busy" } else { "free" };
        println!(
            "{:<24} {:<22} {:<8} {:<24} {}",
            d.name,
            d.kind.to_string(),
            d.connection.to_string(),
            d.address,
            state
        );
    }
    Ok(())
}

fn save_catalog(registry: &DeviceRegistry) -> Result<()> {
    let path = DeviceCatalogFile::default_path().context("No home directory for the device catalog")?;
    DeviceCatalogFile::new(registry.descriptors()).save(&path)?;
    println!("Saved device catalog to {}", path.display());
    Ok(())
}

struct RunRequest {
    device: String,
    policy: StepPolicy,
    naming: OutputNaming,
    resume: bool,
    dry_run: bool,
}

async fn run_batch(registry: &DeviceRegistry, config: &LabConfig, request: RunRequest) -> Result<()> {
    let handle = registry.open_device(&request.device).await?;

    let sink: Arc<dyn PersistenceSink> = if request.dry_run {
        Arc::new(MemorySink::new())
    } else {
        Arc::new(TextFileSink::new())
    };

    let mut sequencer = BatchSequencer::new();
    if let Some(dir) = &config.storage.checkpoint_dir {
        sequencer = sequencer.with_auto_checkpoint(dir.clone());
    }
    let mut events = sequencer.subscribe();
    let progress = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                BatchEvent::StepCompleted { index, filename, .. } => {
                    println!("step {:>4}  {}", index + 1, filename.display());
                }
                BatchEvent::Failed { step, reason } => {
                    println!("failed at step {}: {reason}", step + 1);
                }
                _ => {}
            }
        }
    });

    let outcome: AppResult<BatchStatus> = async {
        sequencer.configure(request.policy, handle.clone(), request.naming, sink)?;
        sequencer.batch_ready()?;
        if request.resume {
            let from = sequencer.resume_from_summary().await?;
            info!(step = from + 1, "Resuming batch");
        }

        let driver = BatchDriver::new(config.timeouts.measure);
        let control = driver.control();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling batch");
                control.cancel();
            }
        });

        if sequencer.status() == BatchStatus::Completed {
            return Ok(BatchStatus::Completed);
        }
        driver.run(&mut sequencer).await
    }
    .await;

    registry.close_device(&handle).await;
    drop(sequencer);
    let _ = progress.await;

    match outcome? {
        BatchStatus::Completed => println!("Batch completed"),
        status => println!("Batch stopped ({status})"),
    }
    Ok(())
}

fn show_checkpoint(path: PathBuf) -> Result<()> {
    let file = if path.is_dir() {
        BatchCheckpoint::latest_in(&path)?
            .with_context(|| format!("No checkpoints in {}", path.display()))?
    } else {
        path
    };
    let checkpoint = BatchCheckpoint::load(&file)?;
    println!("{}", serde_json::to_string_pretty(&checkpoint)?);
    Ok(())
}
