//! Batch state management and checkpointing.
//!
//! This module provides the lifecycle states of a [`BatchSequencer`] and the
//! checkpoint record written when a run pauses, fails or is cancelled.
//!
//! [`BatchSequencer`]: crate::experiment::sequencer::BatchSequencer

use crate::experiment::naming::SuffixMode;
use crate::experiment::policy::StepPolicy;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Batch execution state.
///
/// # State Machine
///
/// ```text
///  Idle ──batch_ready──> Ready ──start──> Running ──last wrapup──> Completed
///   ▲                                     │   ▲  │
///   │                               pause │   │ resume
///   │                                     ▼   │  │ fail
///   │                                   Paused   ▼
///   │                                          Failed ──start──> Running
///   └──────────────── cancel (from any state) ─────────────────────────
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Not prepared; configuration may be replaced
    Idle,
    /// Prepared by `batch_ready`, waiting for `start`
    Ready,
    /// Steps are being executed
    Running,
    /// Paused between or during steps
    Paused,
    /// Every step was persisted
    Completed,
    /// Halted by `fail`; can be restarted at the unfinished step
    Failed,
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchStatus::Idle => write!(f, "Idle"),
            BatchStatus::Ready => write!(f, "Ready"),
            BatchStatus::Running => write!(f, "Running"),
            BatchStatus::Paused => write!(f, "Paused"),
            BatchStatus::Completed => write!(f, "Completed"),
            BatchStatus::Failed => write!(f, "Failed"),
        }
    }
}

impl BatchStatus {
    /// Check if the state allows (re)configuring and preparing a new run.
    pub fn can_prepare(&self) -> bool {
        matches!(
            self,
            BatchStatus::Idle | BatchStatus::Completed | BatchStatus::Failed
        )
    }

    /// Check if the state allows `start`.
    pub fn can_start(&self) -> bool {
        matches!(self, BatchStatus::Ready | BatchStatus::Failed)
    }

    /// Check if the state allows pausing.
    pub fn can_pause(&self) -> bool {
        matches!(self, BatchStatus::Running)
    }

    /// Check if the state allows resuming.
    pub fn can_resume(&self) -> bool {
        matches!(self, BatchStatus::Paused)
    }

    /// Check if the state allows `fail`.
    pub fn can_fail(&self) -> bool {
        matches!(self, BatchStatus::Running | BatchStatus::Paused)
    }

    /// Whether steps may be proceeded or wrapped up.
    pub fn accepts_steps(&self) -> bool {
        matches!(self, BatchStatus::Running)
    }
}

/// Serializable snapshot of a batch run.
///
/// Checkpoints record where a run stood when it paused, failed or was
/// cancelled: the step a restart would execute next, the frozen naming choice,
/// the policy and the failure reason. Completed steps themselves live in the
/// summary log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCheckpoint {
    /// Unique run identifier
    pub run_id: String,
    /// Checkpoint creation timestamp
    pub timestamp: DateTime<Utc>,
    /// Status when the checkpoint was created
    pub status: BatchStatus,
    /// Index of the next step to execute
    pub current_step: usize,
    /// Total number of steps
    pub total_steps: usize,
    /// Root output path (directory joined with the root name)
    pub root: PathBuf,
    /// Filename suffix mode of the run
    pub suffix_mode: SuffixMode,
    /// Step policy of the run
    pub policy: Option<StepPolicy>,
    /// Optional checkpoint label for identification
    pub label: Option<String>,
    /// Optional error message if checkpoint created after failure
    pub error: Option<String>,
}

impl BatchCheckpoint {
    /// Create a new checkpoint.
    pub fn new(
        run_id: String,
        status: BatchStatus,
        current_step: usize,
        total_steps: usize,
        root: PathBuf,
        suffix_mode: SuffixMode,
    ) -> Self {
        Self {
            run_id,
            timestamp: Utc::now(),
            status,
            current_step,
            total_steps,
            root,
            suffix_mode,
            policy: None,
            label: None,
            error: None,
        }
    }

    /// Set the checkpoint label.
    pub fn with_label(mut self, label: String) -> Self {
        self.label = Some(label);
        self
    }

    /// Set the error message.
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    /// Set the step policy.
    pub fn with_policy(mut self, policy: StepPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Save checkpoint to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The parent directory cannot be created
    /// - Serialization fails
    /// - File write fails
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize checkpoint")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("Failed to create checkpoint directory")?;
        }

        fs::write(&path, json)
            .with_context(|| format!("Failed to write checkpoint to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load checkpoint from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read checkpoint from {:?}", path.as_ref()))?;

        let checkpoint = serde_json::from_str(&json).context("Failed to deserialize checkpoint")?;

        Ok(checkpoint)
    }

    /// Checkpoint filename: `checkpoint_<run_id>_<timestamp>.json`
    pub fn default_filename(&self) -> String {
        format!(
            "checkpoint_{}_{}.json",
            self.run_id,
            self.timestamp.format("%Y%m%d_%H%M%S%.3f")
        )
    }

    /// Most recent checkpoint in `dir`, by file name.
    pub fn latest_in<P: AsRef<Path>>(dir: P) -> Result<Option<PathBuf>> {
        let mut candidates: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("Failed to list checkpoints in {:?}", dir.as_ref()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension().is_some_and(|ext| ext == "json")
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("checkpoint_"))
            })
            .collect();
        candidates.sort_by_key(|path| {
            fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
        });
        Ok(candidates.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_state_transitions() {
        assert!(BatchStatus::Idle.can_prepare());
        assert!(BatchStatus::Completed.can_prepare());
        assert!(BatchStatus::Failed.can_prepare());
        assert!(!BatchStatus::Running.can_prepare());

        assert!(BatchStatus::Ready.can_start());
        assert!(BatchStatus::Failed.can_start());
        assert!(!BatchStatus::Paused.can_start());

        assert!(BatchStatus::Running.can_pause());
        assert!(!BatchStatus::Paused.can_pause());
        assert!(BatchStatus::Paused.can_resume());
        assert!(!BatchStatus::Paused.accepts_steps());
    }

    #[test]
    fn test_checkpoint_save_load() {
        let dir = tempdir().unwrap();

        let checkpoint = BatchCheckpoint::new(
            "run-1".to_string(),
            BatchStatus::Failed,
            2,
            5,
            dir.path().join("S1_iv"),
            SuffixMode::Counter,
        )
        .with_policy(StepPolicy::LinearSweep {
            start: 0.0,
            stop: 1.0,
            step: 0.25,
        })
        .with_error("Hardware timeout".to_string())
        .with_label("after-step-2".to_string());

        let path = dir.path().join(checkpoint.default_filename());
        checkpoint.save(&path).unwrap();

        let loaded = BatchCheckpoint::load(&path).unwrap();
        assert_eq!(loaded.run_id, "run-1");
        assert_eq!(loaded.status, BatchStatus::Failed);
        assert_eq!(loaded.current_step, 2);
        assert_eq!(loaded.total_steps, 5);
        assert_eq!(loaded.suffix_mode, SuffixMode::Counter);
        assert_eq!(loaded.error.as_deref(), Some("Hardware timeout"));
        assert!(matches!(loaded.policy, Some(StepPolicy::LinearSweep { .. })));

        assert_eq!(BatchCheckpoint::latest_in(dir.path()).unwrap(), Some(path));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(BatchStatus::Completed.to_string(), "Completed");
        assert_eq!(BatchStatus::Paused.to_string(), "Paused");
    }
}
