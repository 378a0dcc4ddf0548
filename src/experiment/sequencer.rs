//! Batch sequencer: the step-by-step state machine shared by every experiment.
//!
//! A runner configures the sequencer with a [`StepPolicy`], a device handle from
//! the registry, output naming and a [`PersistenceSink`], then drives it:
//!
//! ```text
//! configure ─> batch_ready ─> start ─┬─> batch_proceed ─> (measure) ─> batch_wrapup ─┐
//!                                    └───────────────────<───────────────────────────┘
//! ```
//!
//! `batch_proceed` marks the current step in flight and returns; the physical
//! measurement happens afterwards, outside the sequencer, and `batch_wrapup`
//! closes the step once data is available. The step index only advances on a
//! successful wrapup, so a step that fails, is cancelled or cannot be persisted is
//! executed again on restart.

use crate::data::storage::PersistenceSink;
use crate::data::StepData;
use crate::error::{AppResult, DaqError};
use crate::experiment::naming::{OutputNaming, SuffixMode};
use crate::experiment::policy::{StepParameters, StepPolicy};
use crate::experiment::state::{BatchCheckpoint, BatchStatus};
use crate::experiment::summary::{parse_summary, SummaryRow};
use crate::hardware::capabilities::Device;
use crate::hardware::registry::DeviceHandle;
use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;

// =============================================================================
// Runner seam
// =============================================================================

/// Applies a step's parameters to the device before it is measured.
///
/// This is the experiment-specific part of a batch: an IV runner sets the bias,
/// a spectroscopy runner moves the monochromator, a temperature runner changes
/// the setpoint.
#[async_trait]
pub trait StepApplier: Send + Sync {
    /// Bring `device` to the parameters of `step`.
    async fn apply(&self, device: &dyn Device, step: &InFlightStep) -> anyhow::Result<()>;

    /// Called once after the last step was persisted (e.g. switch an SMU output off).
    async fn finish(&self, _device: &dyn Device) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Default applier: forwards the step parameters to `Device::configure`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigureApplier;

#[async_trait]
impl StepApplier for ConfigureApplier {
    async fn apply(&self, device: &dyn Device, step: &InFlightStep) -> anyhow::Result<()> {
        device.configure(&step.parameters.to_options()).await
    }
}

// =============================================================================
// Run state
// =============================================================================

/// The step currently between `batch_proceed` and `batch_wrapup`.
#[derive(Debug, Clone, PartialEq)]
pub struct InFlightStep {
    /// 0-based step index
    pub index: usize,
    /// Number of steps in the batch
    pub total: usize,
    /// Parameters applied to the device
    pub parameters: StepParameters,
    /// Step file the data is written to
    pub filename: PathBuf,
    /// Time the step was proceeded
    pub started: NaiveDateTime,
}

impl InFlightStep {
    /// First header line of the step file.
    pub fn description(&self) -> String {
        if self.parameters.is_empty() {
            format!("Step = {}\tFilename = {}", self.index + 1, self.filename.display())
        } else {
            format!(
                "Step = {}\t{}\tFilename = {}",
                self.index + 1,
                self.parameters,
                self.filename.display()
            )
        }
    }
}

/// Mutable execution state of a sequencer.
#[derive(Debug, Clone)]
pub struct BatchRun {
    /// UUID v4 assigned at `batch_ready`
    pub run_id: String,
    /// Lifecycle state
    pub status: BatchStatus,
    /// Index of the next step to execute (0-based)
    pub current_step: usize,
    /// Step count of the policy
    pub total_steps: usize,
    /// Output directory joined with the root name
    pub root: PathBuf,
    /// Summary log file
    pub summary_path: PathBuf,
    /// Frozen at `batch_ready`
    pub suffix_mode: SuffixMode,
    /// Step between proceed and wrapup
    pub in_flight: Option<InFlightStep>,
    /// Completed steps, strictly increasing
    pub rows: Vec<SummaryRow>,
    /// Reason of the last failure
    pub last_error: Option<String>,
    header_written: bool,
}

impl BatchRun {
    fn idle() -> Self {
        Self {
            run_id: String::new(),
            status: BatchStatus::Idle,
            current_step: 0,
            total_steps: 0,
            root: PathBuf::new(),
            summary_path: PathBuf::new(),
            suffix_mode: SuffixMode::default(),
            in_flight: None,
            rows: Vec::new(),
            last_error: None,
            header_written: false,
        }
    }

    /// Output files of completed steps followed by the in-flight one.
    pub fn filenames(&self) -> Vec<PathBuf> {
        self.rows
            .iter()
            .map(|row| row.filename.clone())
            .chain(self.in_flight.iter().map(|step| step.filename.clone()))
            .collect()
    }
}

/// Progress notifications published by a sequencer.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    /// Policy and device accepted
    Configured { policy: String, device: String },
    /// Validated; suffix mode frozen
    Ready { run_id: String, total_steps: usize },
    /// Running from `from_step`
    Started { from_step: usize },
    /// Step applied and in flight
    StepStarted { index: usize, total: usize, filename: PathBuf },
    /// Step persisted and logged
    StepCompleted { index: usize, filename: PathBuf, duration_secs: f64 },
    /// Paused before `step`
    Paused { step: usize },
    /// Resumed at `step`
    Resumed { step: usize },
    /// Every step logged
    Completed { steps: usize },
    /// Failed at `step`, which will be repeated
    Failed { step: usize, reason: String },
    /// Reset to Idle; the in-flight step, if any, was discarded
    Cancelled { discarded_step: Option<usize> },
}

#[derive(Clone)]
struct BatchSetup {
    policy: StepPolicy,
    device: DeviceHandle,
    naming: OutputNaming,
    sink: Arc<dyn PersistenceSink>,
    applier: Arc<dyn StepApplier>,
}

// =============================================================================
// Sequencer
// =============================================================================

/// Generic batch state machine.
pub struct BatchSequencer {
    setup: Option<BatchSetup>,
    run: BatchRun,
    events: broadcast::Sender<BatchEvent>,
    checkpoint_dir: Option<PathBuf>,
}

impl Default for BatchSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchSequencer {
    /// Unconfigured sequencer in Idle.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            setup: None,
            run: BatchRun::idle(),
            events,
            checkpoint_dir: None,
        }
    }

    /// Write a checkpoint to `dir` whenever the run pauses, fails or is cancelled.
    pub fn with_auto_checkpoint(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    /// Receive progress events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.events.subscribe()
    }

    /// Current lifecycle state.
    pub fn status(&self) -> BatchStatus {
        self.run.status
    }

    /// Execution state of the current run.
    pub fn run(&self) -> &BatchRun {
        &self.run
    }

    /// Index of the next step to execute (0-based).
    pub fn current_step(&self) -> usize {
        self.run.current_step
    }

    /// Number of steps of the configured policy.
    pub fn total_steps(&self) -> usize {
        self.run.total_steps
    }

    /// Rows of the completed steps.
    pub fn summary_rows(&self) -> &[SummaryRow] {
        &self.run.rows
    }

    /// Step between proceed and wrapup, if any.
    pub fn in_flight(&self) -> Option<&InFlightStep> {
        self.run.in_flight.as_ref()
    }

    /// Configured policy.
    pub fn policy(&self) -> Option<&StepPolicy> {
        self.setup.as_ref().map(|s| &s.policy)
    }

    /// Configured device handle.
    pub fn device(&self) -> Option<&DeviceHandle> {
        self.setup.as_ref().map(|s| &s.device)
    }

    fn emit(&self, event: BatchEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn invalid(&self, operation: &'static str) -> DaqError {
        DaqError::InvalidState {
            operation,
            state: self.run.status,
        }
    }

    fn active_setup(&self, operation: &'static str) -> AppResult<BatchSetup> {
        self.setup.clone().ok_or_else(|| self.invalid(operation))
    }

    // -------------------------------------------------------------------------
    // Preparation
    // -------------------------------------------------------------------------

    /// Set policy, device, naming and sink for the next run.
    ///
    /// Allowed while Idle, Completed or Failed; replaces any previous
    /// configuration and leaves the sequencer Idle.
    pub fn configure(
        &mut self,
        policy: StepPolicy,
        device: DeviceHandle,
        naming: OutputNaming,
        sink: Arc<dyn PersistenceSink>,
    ) -> AppResult<()> {
        if !self.run.status.can_prepare() {
            return Err(self.invalid("configure"));
        }

        debug!(policy = %policy, device = %device.name(), "Batch configured");
        self.emit(BatchEvent::Configured {
            policy: policy.to_string(),
            device: device.name().to_string(),
        });
        self.setup = Some(BatchSetup {
            policy,
            device,
            naming,
            sink,
            applier: Arc::new(ConfigureApplier),
        });
        self.run = BatchRun::idle();
        Ok(())
    }

    /// Replace the step applier. Refused while a run is Running or Paused.
    pub fn set_applier(&mut self, applier: Arc<dyn StepApplier>) -> AppResult<()> {
        if matches!(self.run.status, BatchStatus::Running | BatchStatus::Paused) {
            return Err(self.invalid("set_applier"));
        }
        match self.setup.as_mut() {
            Some(setup) => {
                setup.applier = applier;
                Ok(())
            }
            None => Err(DaqError::Validation("Batch is not configured".into())),
        }
    }

    /// Validate preconditions and prepare a fresh run.
    ///
    /// # Errors
    ///
    /// `ValidationError` (state unchanged) when the sequencer is not configured,
    /// the sample/measurement names are empty, the output directory is not
    /// writable or the policy yields no steps.
    pub fn batch_ready(&mut self) -> AppResult<()> {
        if !self.run.status.can_prepare() {
            return Err(self.invalid("batch_ready"));
        }
        let setup = self
            .setup
            .as_ref()
            .ok_or_else(|| DaqError::Validation("Batch is not configured".into()))?;

        setup.policy.validate()?;
        let total_steps = setup.policy.count();
        let root = setup.naming.root_path()?;
        let summary_path = setup.naming.summary_path()?;
        setup.naming.check_writable()?;

        self.run = BatchRun {
            run_id: uuid::Uuid::new_v4().to_string(),
            status: BatchStatus::Ready,
            total_steps,
            root,
            summary_path,
            suffix_mode: setup.naming.suffix_mode,
            ..BatchRun::idle()
        };

        info!(
            run_id = %self.run.run_id,
            steps = total_steps,
            root = %self.run.root.display(),
            suffix = ?self.run.suffix_mode,
            "Batch ready"
        );
        self.emit(BatchEvent::Ready {
            run_id: self.run.run_id.clone(),
            total_steps,
        });
        Ok(())
    }

    /// Restore completed steps from the persisted summary log.
    ///
    /// Only valid while Ready. Returns the step index the run will continue at.
    /// A log that already covers every step completes the run.
    pub async fn resume_from_summary(&mut self) -> AppResult<usize> {
        if self.run.status != BatchStatus::Ready {
            return Err(self.invalid("resume_from_summary"));
        }
        let setup = self.active_setup("resume_from_summary")?;

        let lines = setup.sink.read_rows(&self.run.summary_path).await?;
        let rows = parse_summary(&lines)?;
        if rows.len() > self.run.total_steps {
            return Err(DaqError::Validation(format!(
                "Summary log {} has {} steps but the policy only has {}",
                self.run.summary_path.display(),
                rows.len(),
                self.run.total_steps
            )));
        }

        self.run.header_written = !lines.is_empty();
        self.run.current_step = rows.len();
        self.run.rows = rows;

        info!(
            summary = %self.run.summary_path.display(),
            resume_at = self.run.current_step,
            total = self.run.total_steps,
            "Batch resumed from summary log"
        );

        if self.run.current_step == self.run.total_steps {
            self.run.status = BatchStatus::Completed;
            self.emit(BatchEvent::Completed {
                steps: self.run.total_steps,
            });
        }
        Ok(self.run.current_step)
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Ready → Running, or restart a Failed run at its unfinished step.
    pub fn start(&mut self) -> AppResult<()> {
        if !self.run.status.can_start() {
            return Err(self.invalid("start"));
        }
        if self.run.status == BatchStatus::Failed {
            info!(step = self.run.current_step, "Restarting failed batch");
        }
        self.run.status = BatchStatus::Running;
        self.run.last_error = None;
        self.emit(BatchEvent::Started {
            from_step: self.run.current_step,
        });
        Ok(())
    }

    /// Open the current step: apply its parameters and mark it in flight.
    ///
    /// The first step of a fresh summary log also writes the log's header line.
    pub async fn batch_proceed(&mut self) -> AppResult<InFlightStep> {
        if !self.run.status.accepts_steps() || self.run.in_flight.is_some() {
            return Err(self.invalid("batch_proceed"));
        }
        let setup = self.active_setup("batch_proceed")?;

        let index = self.run.current_step;
        let parameters = setup.policy.parameters_at(index).ok_or_else(|| {
            DaqError::Validation(format!("Policy has no step {index}"))
        })?;

        if !self.run.header_written {
            let header = SummaryRow::header(parameters.names());
            setup.sink.append_row(&self.run.summary_path, &header).await?;
            self.run.header_written = true;
        }

        let started = Local::now().naive_local();
        let filename = setup
            .naming
            .step_path(self.run.suffix_mode, index, &parameters, started)?;
        let step = InFlightStep {
            index,
            total: self.run.total_steps,
            parameters,
            filename,
            started,
        };

        setup
            .applier
            .apply(setup.device.device().as_ref(), &step)
            .await
            .map_err(|e| DaqError::hardware(setup.device.name(), e))?;

        info!(
            step = index + 1,
            total = step.total,
            parameters = %step.parameters,
            file = %step.filename.display(),
            "Next point in batch"
        );
        self.run.in_flight = Some(step.clone());
        self.emit(BatchEvent::StepStarted {
            index,
            total: step.total,
            filename: step.filename.clone(),
        });
        Ok(step)
    }

    /// Close the in-flight step with its data: persist, log, advance.
    ///
    /// # Errors
    ///
    /// - `InvalidState` when not Running or when no step is in flight (a second
    ///   wrapup for the same step never adds a row)
    /// - `Persist` when the sink fails; the step stays in flight and the call
    ///   may be retried with the same data
    pub async fn batch_wrapup(&mut self, data: &StepData) -> AppResult<BatchStatus> {
        if !self.run.status.accepts_steps() {
            return Err(self.invalid("batch_wrapup"));
        }
        let Some(step) = self.run.in_flight.clone() else {
            return Err(self.invalid("batch_wrapup"));
        };
        let setup = self.active_setup("batch_wrapup")?;

        let finished = Local::now().naive_local();
        let duration_secs = (finished - step.started)
            .num_microseconds()
            .map_or(0.0, |us| us as f64 / 1e6);
        let row = SummaryRow {
            index: step.index,
            parameters: step.parameters.clone(),
            started: step.started,
            finished,
            duration_secs,
            filename: step.filename.clone(),
        };

        let second_line = if setup.naming.file_header.is_empty() {
            data.column_header()
        } else {
            setup.naming.file_header.clone()
        };
        let header = format!("{}\n{}", step.description(), second_line);

        let persisted = async {
            setup.sink.persist(&step.filename, data, &header).await?;
            setup
                .sink
                .append_row(&self.run.summary_path, &row.to_fields())
                .await
        }
        .await;

        if let Err(e) = persisted {
            let e = match e {
                DaqError::Persist(_) => e,
                other => DaqError::Persist(other.to_string()),
            };
            warn!(step = step.index + 1, error = %e, "Step data not persisted, step stays in flight");
            return Err(e);
        }

        self.run.in_flight = None;
        self.run.rows.push(row);
        self.run.current_step += 1;
        self.emit(BatchEvent::StepCompleted {
            index: step.index,
            filename: step.filename,
            duration_secs,
        });

        if self.run.current_step == self.run.total_steps {
            self.run.status = BatchStatus::Completed;
            if let Err(e) = setup.applier.finish(setup.device.device().as_ref()).await {
                warn!(device = %setup.device.name(), error = %e, "Device finish hook failed");
            }
            info!(run_id = %self.run.run_id, steps = self.run.total_steps, "Batch completed");
            self.emit(BatchEvent::Completed {
                steps: self.run.total_steps,
            });
        }

        Ok(self.run.status)
    }

    /// Running → Paused.
    pub fn pause(&mut self) -> AppResult<()> {
        if !self.run.status.can_pause() {
            return Err(self.invalid("pause"));
        }
        self.run.status = BatchStatus::Paused;
        info!(step = self.run.current_step, "Batch paused");
        self.write_checkpoint("paused");
        self.emit(BatchEvent::Paused {
            step: self.run.current_step,
        });
        Ok(())
    }

    /// Paused → Running.
    pub fn resume(&mut self) -> AppResult<()> {
        if !self.run.status.can_resume() {
            return Err(self.invalid("resume"));
        }
        self.run.status = BatchStatus::Running;
        info!(step = self.run.current_step, "Batch resumed");
        self.emit(BatchEvent::Resumed {
            step: self.run.current_step,
        });
        Ok(())
    }

    /// Abandon the run from any state.
    ///
    /// The in-flight step gets no summary row and its hardware operation is
    /// aborted; files already written stay on disk.
    pub async fn cancel(&mut self) {
        let discarded = self.run.in_flight.take();

        if let (Some(step), Some(setup)) = (&discarded, &self.setup) {
            if let Err(e) = setup.device.device().abort().await {
                warn!(device = %setup.device.name(), step = step.index + 1, error = %e, "Abort failed");
            }
        }
        if self.run.status != BatchStatus::Idle {
            self.write_checkpoint("cancelled");
            info!(
                step = self.run.current_step,
                discarded = discarded.is_some(),
                "Batch cancelled"
            );
        }

        self.run = BatchRun::idle();
        self.emit(BatchEvent::Cancelled {
            discarded_step: discarded.map(|step| step.index),
        });
    }

    /// Running/Paused → Failed.
    ///
    /// The in-flight step is rolled back: a restart repeats the unfinished step
    /// instead of skipping it.
    pub fn fail(&mut self, reason: impl Into<String>) -> AppResult<()> {
        if !self.run.status.can_fail() {
            return Err(self.invalid("fail"));
        }
        let reason = reason.into();
        let rolled_back = self.run.in_flight.take();

        self.run.status = BatchStatus::Failed;
        self.run.last_error = Some(reason.clone());
        error!(
            step = self.run.current_step + 1,
            rolled_back = rolled_back.is_some(),
            reason = %reason,
            "Batch failed"
        );
        self.write_checkpoint("failed");
        self.emit(BatchEvent::Failed {
            step: self.run.current_step,
            reason,
        });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Checkpoints
    // -------------------------------------------------------------------------

    /// Snapshot of the current run.
    pub fn checkpoint(&self) -> BatchCheckpoint {
        let mut checkpoint = BatchCheckpoint::new(
            self.run.run_id.clone(),
            self.run.status,
            self.run.current_step,
            self.run.total_steps,
            self.run.root.clone(),
            self.run.suffix_mode,
        );
        if let Some(policy) = self.policy() {
            checkpoint = checkpoint.with_policy(policy.clone());
        }
        if let Some(error) = &self.run.last_error {
            checkpoint = checkpoint.with_error(error.clone());
        }
        checkpoint
    }

    fn write_checkpoint(&self, label: &str) {
        let Some(dir) = &self.checkpoint_dir else {
            return;
        };
        let checkpoint = self.checkpoint().with_label(label.to_string());
        let path = dir.join(checkpoint.default_filename());
        match checkpoint.save(&path) {
            Ok(()) => debug!(path = %path.display(), "Checkpoint written"),
            Err(e) => warn!(error = %e, "Failed to write checkpoint"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::storage::MemorySink;
    use crate::hardware::capabilities::CapabilityKind;
    use crate::hardware::registry::{DeviceDescriptor, DeviceRegistry};
    use tempfile::tempdir;

    async fn smu() -> DeviceHandle {
        let registry = DeviceRegistry::with_builtin();
        registry
            .load(vec![DeviceDescriptor::dummy("SMU-A", CapabilityKind::Smu)])
            .unwrap();
        registry.open_device("SMU-A").await.unwrap()
    }

    fn data() -> StepData {
        StepData::new(["Voltage (V)", "Current (A)"]).with_row(vec![0.0, 1e-9])
    }

    #[tokio::test]
    async fn test_operations_refused_before_start() {
        let mut seq = BatchSequencer::new();
        assert!(matches!(seq.batch_ready(), Err(DaqError::Validation(_))));
        assert!(matches!(seq.start(), Err(DaqError::InvalidState { .. })));
        assert!(matches!(
            seq.batch_proceed().await,
            Err(DaqError::InvalidState { .. })
        ));
        assert!(matches!(seq.pause(), Err(DaqError::InvalidState { .. })));
        assert!(matches!(seq.fail("x"), Err(DaqError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_header_written_once_and_step_header() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(MemorySink::new());
        let mut seq = BatchSequencer::new();
        seq.configure(
            StepPolicy::LinearSweep {
                start: 0.0,
                stop: 0.1,
                step: 0.1,
            },
            smu().await,
            OutputNaming::new(dir.path(), "S1", "iv").with_file_header("Dark IV"),
            sink.clone(),
        )
        .unwrap();
        seq.batch_ready().unwrap();
        seq.start().unwrap();

        for _ in 0..2 {
            let step = seq.batch_proceed().await.unwrap();
            seq.batch_wrapup(&data()).await.unwrap();
            let stored = sink.step(&step.filename).unwrap();
            let lines: Vec<&str> = stored.header.lines().collect();
            assert_eq!(lines.len(), 2);
            assert!(lines[0].starts_with(&format!("Step = {}\tvalue = ", step.index + 1)));
            assert_eq!(lines[1], "Dark IV");
        }

        let log = sink.rows(&seq.run().summary_path);
        assert_eq!(log.len(), 3);
        assert_eq!(log[0][0], "Step");
        assert_eq!(seq.status(), BatchStatus::Completed);
    }

    #[tokio::test]
    async fn test_cannot_reconfigure_while_running() {
        let dir = tempdir().unwrap();
        let mut seq = BatchSequencer::new();
        let device = smu().await;
        let policy = StepPolicy::RepeatN {
            count: 2,
            wait_seconds: 0.0,
        };
        seq.configure(
            policy.clone(),
            device.clone(),
            OutputNaming::new(dir.path(), "S1", "t"),
            Arc::new(MemorySink::new()),
        )
        .unwrap();
        seq.batch_ready().unwrap();
        seq.start().unwrap();

        let result = seq.configure(
            policy,
            device,
            OutputNaming::new(dir.path(), "S2", "t"),
            Arc::new(MemorySink::new()),
        );
        assert!(matches!(result, Err(DaqError::InvalidState { .. })));
    }
}
