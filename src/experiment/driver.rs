//! Measurement loop on top of [`BatchSequencer`].
//!
//! The sequencer only knows about step boundaries; the driver performs the actual
//! measurement between `batch_proceed` and `batch_wrapup`, bounds it with a
//! timeout and honours pause/cancel requests coming from another task through
//! [`BatchControl`].

use crate::data::StepData;
use crate::error::{AppResult, DaqError};
use crate::experiment::sequencer::{BatchSequencer, InFlightStep};
use crate::experiment::state::BatchStatus;
use crate::hardware::registry::DeviceHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Measurement timeout used by [`BatchDriver::default`].
pub const DEFAULT_MEASURE_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Default)]
struct ControlFlags {
    pause: AtomicBool,
    cancel: AtomicBool,
}

/// Cloneable pause/cancel switch shared between a driver and its controllers.
///
/// Requests take effect at the next step boundary; a cancel that arrives while
/// a measurement is running discards that step.
#[derive(Debug, Clone, Default)]
pub struct BatchControl {
    flags: Arc<ControlFlags>,
}

impl BatchControl {
    /// New control with both flags cleared.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a pause at the next step boundary.
    pub fn pause(&self) {
        self.flags.pause.store(true, Ordering::SeqCst);
    }

    /// Withdraw a pause request.
    pub fn resume(&self) {
        self.flags.pause.store(false, Ordering::SeqCst);
    }

    /// Request cancellation of the run.
    pub fn cancel(&self) {
        self.flags.cancel.store(true, Ordering::SeqCst);
    }

    /// Whether a pause is requested.
    pub fn is_paused(&self) -> bool {
        self.flags.pause.load(Ordering::SeqCst)
    }

    /// Whether a cancel is requested.
    pub fn is_cancelled(&self) -> bool {
        self.flags.cancel.load(Ordering::SeqCst)
    }

    /// Clear both flags so the control can be reused for another run.
    pub fn reset(&self) {
        self.flags.pause.store(false, Ordering::SeqCst);
        self.flags.cancel.store(false, Ordering::SeqCst);
    }
}

/// Runs a prepared sequencer to completion.
///
/// Data of a step whose wrapup failed is kept, so the next `run` stores it
/// again instead of repeating the measurement.
#[derive(Debug, Clone)]
pub struct BatchDriver {
    measure_timeout: Duration,
    persist_retries: usize,
    control: BatchControl,
    unsaved: Arc<Mutex<Option<(InFlightStep, StepData)>>>,
}

impl Default for BatchDriver {
    fn default() -> Self {
        Self::new(DEFAULT_MEASURE_TIMEOUT)
    }
}

impl BatchDriver {
    /// Driver bounding every measurement by `measure_timeout`.
    pub fn new(measure_timeout: Duration) -> Self {
        Self {
            measure_timeout,
            persist_retries: 0,
            control: BatchControl::new(),
            unsaved: Arc::new(Mutex::new(None)),
        }
    }

    /// Share an existing control handle.
    pub fn with_control(mut self, control: BatchControl) -> Self {
        self.control = control;
        self
    }

    /// Retry a failed wrapup this many times before giving up.
    pub fn with_persist_retries(mut self, retries: usize) -> Self {
        self.persist_retries = retries;
        self
    }

    /// Handle for pausing or cancelling from another task.
    pub fn control(&self) -> BatchControl {
        self.control.clone()
    }

    /// Drive `sequencer` until it completes, is cancelled or fails.
    ///
    /// A Ready or Failed sequencer is started first. Returns the final status:
    /// `Completed`, or `Idle` after a cancel.
    ///
    /// # Errors
    ///
    /// - `HardwareTimeout` / `Hardware` when a measurement does not finish or
    ///   fails; the sequencer is moved to Failed first
    /// - `Persist` when the step data cannot be stored; the sequencer stays
    ///   Running with the step in flight
    pub async fn run(&self, sequencer: &mut BatchSequencer) -> AppResult<BatchStatus> {
        if matches!(sequencer.status(), BatchStatus::Ready | BatchStatus::Failed) {
            sequencer.start()?;
        }
        let device = sequencer
            .device()
            .cloned()
            .ok_or_else(|| DaqError::Validation("Batch is not configured".into()))?;

        loop {
            match sequencer.status() {
                BatchStatus::Completed => return Ok(BatchStatus::Completed),
                BatchStatus::Running => {}
                state => {
                    return Err(DaqError::InvalidState {
                        operation: "run",
                        state,
                    })
                }
            }

            if self.control.is_cancelled() {
                sequencer.cancel().await;
                return Ok(BatchStatus::Idle);
            }
            if self.control.is_paused() && sequencer.in_flight().is_none() {
                sequencer.pause()?;
                if !self.wait_while_paused().await {
                    sequencer.cancel().await;
                    return Ok(BatchStatus::Idle);
                }
                sequencer.resume()?;
            }

            let pending = sequencer.in_flight().cloned();
            let step = match pending {
                Some(step) => step,
                None => match sequencer.batch_proceed().await {
                    Ok(step) => step,
                    Err(e @ DaqError::Hardware(_)) => {
                        sequencer.fail(e.to_string())?;
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                },
            };

            // A step left in flight by a persist failure keeps its data; only a
            // step the driver never measured goes back to the instrument.
            let data = match self.take_unsaved(&step) {
                Some(data) => {
                    debug!(step = step.index + 1, "Storing data kept from a failed wrapup");
                    data
                }
                None => self.measure(sequencer, &device, &step).await?,
            };

            if self.control.is_cancelled() {
                sequencer.cancel().await;
                return Ok(BatchStatus::Idle);
            }

            let mut attempts = 0;
            let status = loop {
                match sequencer.batch_wrapup(&data).await {
                    Ok(status) => break status,
                    Err(e @ DaqError::Persist(_)) if attempts < self.persist_retries => {
                        attempts += 1;
                        warn!(step = step.index + 1, attempt = attempts, error = %e, "Retrying wrapup");
                    }
                    Err(e @ DaqError::Persist(_)) => {
                        self.keep_unsaved(step, data);
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                }
            };
            if status == BatchStatus::Completed {
                info!(steps = sequencer.total_steps(), "Batch finished");
                return Ok(status);
            }

            let wait = sequencer
                .policy()
                .map_or(Duration::ZERO, |policy| policy.wait_after(step.index));
            if !wait.is_zero() && !self.wait_unless_cancelled(wait).await {
                sequencer.cancel().await;
                return Ok(BatchStatus::Idle);
            }
        }
    }

    /// Measure `step`, failing the sequencer on error or timeout.
    async fn measure(
        &self,
        sequencer: &mut BatchSequencer,
        device: &DeviceHandle,
        step: &InFlightStep,
    ) -> AppResult<StepData> {
        let started = Instant::now();
        let data = match timeout(self.measure_timeout, device.device().measure()).await {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => {
                let err = DaqError::hardware(device.name(), e);
                sequencer.fail(err.to_string())?;
                return Err(err);
            }
            Err(_) => {
                if let Err(e) = device.device().abort().await {
                    warn!(device = %device.name(), error = %e, "Abort after timeout failed");
                }
                let err = DaqError::HardwareTimeout(format!(
                    "{} did not finish step {} within {:?}",
                    device.name(),
                    step.index + 1,
                    self.measure_timeout
                ));
                sequencer.fail(err.to_string())?;
                return Err(err);
            }
        };
        debug!(step = step.index + 1, elapsed = ?started.elapsed(), points = data.len(), "Measurement done");
        Ok(data)
    }

    fn keep_unsaved(&self, step: InFlightStep, data: StepData) {
        *self.unsaved.lock().unwrap_or_else(PoisonError::into_inner) = Some((step, data));
    }

    /// Data kept for exactly this in-flight step, if any. Stale data is dropped.
    fn take_unsaved(&self, step: &InFlightStep) -> Option<StepData> {
        let kept = self.unsaved.lock().unwrap_or_else(PoisonError::into_inner).take();
        kept.and_then(|(kept_step, data)| (kept_step == *step).then_some(data))
    }

    /// Returns false when cancelled while waiting.
    async fn wait_while_paused(&self) -> bool {
        while self.control.is_paused() {
            if self.control.is_cancelled() {
                return false;
            }
            sleep(POLL_INTERVAL).await;
        }
        !self.control.is_cancelled()
    }

    /// Returns false when cancelled while waiting.
    async fn wait_unless_cancelled(&self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            if self.control.is_cancelled() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            sleep(remaining.min(POLL_INTERVAL)).await;
        }
        !self.control.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_flags_are_shared() {
        let control = BatchControl::new();
        let remote = control.clone();
        remote.pause();
        assert!(control.is_paused());
        remote.cancel();
        assert!(control.is_cancelled());
        control.reset();
        assert!(!remote.is_paused());
        assert!(!remote.is_cancelled());
    }
}
