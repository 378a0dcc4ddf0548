//! # Lab DAQ Core Library
//!
//! This crate is the core of the `lab_daq` application: a catalog of laboratory
//! instruments with exclusive checkout, and a batch sequencer that steps an
//! experiment through a parameter sweep while persisting every step. Frontends
//! (the bundled CLI, a GUI, a scripting host) share this logic.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-based configuration (`config/lab_daq.toml` plus
//!   `LAB_DAQ_` environment variables) and the last-working device catalog.
//! - **`data`**: The `StepData` table handed from devices to sinks, and the
//!   persistence sinks that write step files and summary logs.
//! - **`error`**: The `DaqError` enum shared across the library.
//! - **`experiment`**: Step policies, output naming, the summary log, the
//!   `BatchSequencer` state machine and the `BatchDriver` measurement loop.
//! - **`hardware`**: The `Device` capability trait, the `DeviceRegistry`,
//!   connection probes used for verification, and simulated devices.
//! - **`logging`**: `tracing-subscriber` initialisation.
//!
//! ## Example
//!
//! ```no_run
//! use lab_daq::data::storage::TextFileSink;
//! use lab_daq::experiment::{BatchDriver, BatchSequencer, OutputNaming, StepPolicy};
//! use lab_daq::hardware::{CapabilityKind, DeviceDescriptor, DeviceRegistry};
//! use std::sync::Arc;
//!
//! # async fn run() -> lab_daq::error::AppResult<()> {
//! let registry = DeviceRegistry::with_builtin();
//! registry.load(vec![DeviceDescriptor::dummy("SMU-A", CapabilityKind::Smu)])?;
//! let smu = registry.open_device("SMU-A").await?;
//!
//! let mut sequencer = BatchSequencer::new();
//! sequencer.configure(
//!     StepPolicy::LinearSweep { start: 0.0, stop: 1.0, step: 0.25 },
//!     smu.clone(),
//!     OutputNaming::new("data", "S1", "iv"),
//!     Arc::new(TextFileSink::new()),
//! )?;
//! sequencer.batch_ready()?;
//! BatchDriver::default().run(&mut sequencer).await?;
//!
//! registry.close_device(&smu).await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;
