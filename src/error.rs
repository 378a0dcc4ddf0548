//! Custom error types for the library.
//!
//! This module defines the primary error type, `DaqError`, shared by the device
//! registry, the batch sequencer and the persistence sinks. Using the `thiserror`
//! crate it gives every failure a stable, printable shape.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`ConfigLoad`**: bad or duplicate descriptors, unparsable
//!   configuration. Fatal at load time.
//! - **`NotFound`**: an unknown device name. Fatal to the single call only.
//! - **`DeviceBusy`**: an exclusive device is already checked out. The caller may
//!   retry later or pick another device.
//! - **`Validation`**: batch preconditions unmet. The sequencer stays where it was.
//! - **`InvalidState`**: an operation was invoked in the wrong sequencer state. This
//!   is a programming error and should not be retried.
//! - **`Persist`**: a sink failure. The step stays in flight so the wrapup can be
//!   retried with the same data.
//! - **`HardwareTimeout`**: a device did not signal completion in time. Reported
//!   through the sequencer's `fail` transition, leaving the run resumable.
//! - **`Hardware`**: any other driver failure (open, configure, measure).
//!
//! Driver code works with `anyhow::Result`; the registry and sequencer translate
//! those errors into `DaqError::Hardware` at the boundary.

use crate::experiment::state::BatchStatus;
use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors of the registry, the sequencer and their configuration.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Invalid configuration or catalog (duplicate names, bad log level)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration sources could not be read or merged
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    /// No descriptor with this name
    #[error("Device '{0}' not found")]
    NotFound(String),

    /// Exclusive device already checked out
    #[error("Device '{0}' is already in use")]
    DeviceBusy(String),

    /// Batch or policy rejected before it started
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation '{operation}' is not allowed while the batch is {state}")]
    /// Operation refused in the current lifecycle state
    InvalidState {
        /// Refused operation
        operation: &'static str,
        /// State the batch was in
        state: BatchStatus,
    },

    /// Step data or summary row could not be stored
    #[error("Persist error: {0}")]
    Persist(String),

    /// Instrument did not answer in time
    #[error("Hardware timeout: {0}")]
    HardwareTimeout(String),

    /// Driver error while talking to an instrument
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Built without the `instrument_serial` feature
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    /// Built without the named cargo feature
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::ConfigLoad(Box::new(err))
    }
}

impl DaqError {
    /// Wrap a driver error raised while talking to `device`.
    pub fn hardware(device: &str, err: impl std::fmt::Display) -> Self {
        DaqError::Hardware(format!("{device}: {err}"))
    }

    /// Wrap a sink error for `path`.
    pub fn persist(path: &std::path::Path, err: impl std::fmt::Display) -> Self {
        DaqError::Persist(format!("{}: {err}", path.display()))
    }

    /// Whether the front end may offer a retry for this error.
    ///
    /// Configuration and state errors point at a bug or a broken setup and are
    /// reported as-is; everything touching hardware or storage may be retried.
    pub fn is_recoverable(&self) -> bool {
        match self {
            DaqError::NotFound(_)
            | DaqError::DeviceBusy(_)
            | DaqError::Validation(_)
            | DaqError::Persist(_)
            | DaqError::HardwareTimeout(_)
            | DaqError::Hardware(_)
            | DaqError::Io(_) => true,
            DaqError::Config(_)
            | DaqError::ConfigLoad(_)
            | DaqError::InvalidState { .. }
            | DaqError::SerialFeatureDisabled
            | DaqError::FeatureNotEnabled(_) => false,
        }
    }
}
