//! Batch experiments.
//!
//! - [`policy`]: how a batch enumerates its steps
//! - [`naming`]: output file naming
//! - [`summary`]: the per-run summary log
//! - [`sequencer`]: the batch state machine
//! - [`driver`]: measurement loop with timeout and pause/cancel control
//! - [`state`]: batch status and checkpoints

pub mod driver;
pub mod naming;
pub mod policy;
pub mod sequencer;
pub mod state;
pub mod summary;

pub use driver::{BatchControl, BatchDriver};
pub use naming::{OutputNaming, SuffixMode};
pub use policy::{StepParameters, StepPolicy};
pub use sequencer::{
    BatchEvent, BatchRun, BatchSequencer, ConfigureApplier, InFlightStep, StepApplier,
};
pub use state::{BatchCheckpoint, BatchStatus};
pub use summary::SummaryRow;
