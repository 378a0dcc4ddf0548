//! Persistence sinks for batch data.
//!
//! A sink stores two things for a batch: the numeric table of each finished step
//! and the append-only summary log. [`TextFileSink`] writes the tab-delimited text
//! files analysis scripts expect; [`MemorySink`] keeps everything in memory for
//! dry runs and tests.
//!
//! # Step file layout
//!
//! ```text
//! # Step = 1	value = 1.0000e-01	Filename = /data/S1_iv_001.txt
//! # Voltage (V)	Current (A)
//! 1.0000e-01	2.3400e-09
//! 1.0100e-01	2.5100e-09
//! ```
use crate::data::{format_sci, StepData};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Storage capability the batch sequencer writes through.
///
/// Every failure is reported as `DaqError::Persist`.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Write a finished step's table to `filename`, replacing any previous file.
    ///
    /// Each line of `header` is written as a `# ` comment line before the data.
    async fn persist(&self, filename: &Path, data: &StepData, header: &str) -> AppResult<()>;

    /// Append one tab-separated line to the summary log `file`.
    async fn append_row(&self, file: &Path, fields: &[String]) -> AppResult<()>;

    /// Read back every line of the summary log `file`. A missing log has no rows.
    async fn read_rows(&self, file: &Path) -> AppResult<Vec<Vec<String>>>;
}

// =============================================================================
// Text files
// =============================================================================

/// Tab-delimited text file sink.
#[derive(Debug, Clone, Default)]
pub struct TextFileSink;

impl TextFileSink {
    /// Sink writing into the filesystem.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PersistenceSink for TextFileSink {
    async fn persist(&self, filename: &Path, data: &StepData, header: &str) -> AppResult<()> {
        #[cfg(not(feature = "storage_csv"))]
        {
            let _ = (filename, data, header);
            return Err(DaqError::FeatureNotEnabled("storage_csv".to_string()));
        }

        #[cfg(feature = "storage_csv")]
        {
            use std::io::Write;

            if let Some(parent) = filename.parent() {
                std::fs::create_dir_all(parent).map_err(|e| DaqError::persist(filename, e))?;
            }
            let mut file =
                std::fs::File::create(filename).map_err(|e| DaqError::persist(filename, e))?;

            for line in header.lines() {
                writeln!(file, "# {line}").map_err(|e| DaqError::persist(filename, e))?;
            }

            let mut writer = csv::WriterBuilder::new()
                .delimiter(b'\t')
                .has_headers(false)
                .flexible(true)
                .from_writer(file);
            for row in &data.rows {
                writer
                    .write_record(row.iter().map(|v| format_sci(*v)))
                    .map_err(|e| DaqError::persist(filename, e))?;
            }
            writer.flush().map_err(|e| DaqError::persist(filename, e))?;

            tracing::debug!(file = %filename.display(), rows = data.len(), "Step data written");
            Ok(())
        }
    }

    async fn append_row(&self, file: &Path, fields: &[String]) -> AppResult<()> {
        #[cfg(not(feature = "storage_csv"))]
        {
            let _ = (file, fields);
            return Err(DaqError::FeatureNotEnabled("storage_csv".to_string()));
        }

        #[cfg(feature = "storage_csv")]
        {
            if let Some(parent) = file.parent() {
                std::fs::create_dir_all(parent).map_err(|e| DaqError::persist(file, e))?;
            }
            let handle = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .map_err(|e| DaqError::persist(file, e))?;

            let mut writer = csv::WriterBuilder::new()
                .delimiter(b'\t')
                .has_headers(false)
                .flexible(true)
                .from_writer(handle);
            writer
                .write_record(fields)
                .map_err(|e| DaqError::persist(file, e))?;
            writer.flush().map_err(|e| DaqError::persist(file, e))?;
            Ok(())
        }
    }

    async fn read_rows(&self, file: &Path) -> AppResult<Vec<Vec<String>>> {
        #[cfg(not(feature = "storage_csv"))]
        {
            let _ = file;
            return Err(DaqError::FeatureNotEnabled("storage_csv".to_string()));
        }

        #[cfg(feature = "storage_csv")]
        {
            if !file.exists() {
                return Ok(Vec::new());
            }
            let mut reader = csv::ReaderBuilder::new()
                .delimiter(b'\t')
                .has_headers(false)
                .flexible(true)
                .from_path(file)
                .map_err(|e| DaqError::persist(file, e))?;

            reader
                .records()
                .map(|record| {
                    record
                        .map(|r| r.iter().map(String::from).collect())
                        .map_err(|e| DaqError::persist(file, e))
                })
                .collect()
        }
    }
}

// =============================================================================
// In memory
// =============================================================================

/// A step table as handed to [`MemorySink::persist`].
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedStep {
    /// Two-line step header
    pub header: String,
    /// Stored table
    pub data: StepData,
}

#[derive(Default)]
struct MemoryState {
    steps: HashMap<PathBuf, PersistedStep>,
    logs: HashMap<PathBuf, Vec<Vec<String>>>,
    failures_remaining: usize,
    persist_calls: usize,
}

/// Sink that keeps everything in memory.
///
/// Supports failure injection: after [`fail_next`](Self::fail_next)`(n)` the next
/// `n` step tables handed to `persist` are refused with `PersistError`.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

impl MemorySink {
    /// Empty sink with no injected failures.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `count` calls to `persist`.
    pub fn fail_next(&self, count: usize) {
        self.lock().failures_remaining = count;
    }

    /// Step table stored under `path`.
    pub fn step(&self, path: &Path) -> Option<PersistedStep> {
        self.lock().steps.get(path).cloned()
    }

    /// Number of distinct step files stored.
    pub fn step_count(&self) -> usize {
        self.lock().steps.len()
    }

    /// Number of successful `persist` calls, including overwrites.
    pub fn persist_calls(&self) -> usize {
        self.lock().persist_calls
    }

    /// Lines of the summary log `path`.
    pub fn rows(&self, path: &Path) -> Vec<Vec<String>> {
        self.lock().logs.get(path).cloned().unwrap_or_default()
    }

    fn injected_failure(state: &mut MemoryState, path: &Path) -> AppResult<()> {
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(DaqError::persist(path, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn persist(&self, filename: &Path, data: &StepData, header: &str) -> AppResult<()> {
        let mut state = self.lock();
        Self::injected_failure(&mut state, filename)?;
        state.persist_calls += 1;
        state.steps.insert(
            filename.to_path_buf(),
            PersistedStep {
                header: header.to_string(),
                data: data.clone(),
            },
        );
        Ok(())
    }

    async fn append_row(&self, file: &Path, fields: &[String]) -> AppResult<()> {
        self.lock()
            .logs
            .entry(file.to_path_buf())
            .or_default()
            .push(fields.to_vec());
        Ok(())
    }

    async fn read_rows(&self, file: &Path) -> AppResult<Vec<Vec<String>>> {
        Ok(self.rows(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> StepData {
        StepData::new(["Voltage (V)", "Current (A)"])
            .with_row(vec![0.1, 2.34e-9])
            .with_row(vec![0.101, 2.51e-9])
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test]
    async fn text_step_file_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("S1_iv_001.txt");
        let sink = TextFileSink::new();

        sink.persist(&path, &sample(), "Step = 1\tvalue = 1.0000e-01\nVoltage (V)\tCurrent (A)")
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "# Step = 1\tvalue = 1.0000e-01");
        assert_eq!(lines[1], "# Voltage (V)\tCurrent (A)");
        assert_eq!(lines[2], "1.0000e-01\t2.3400e-09");
        assert_eq!(lines[3], "1.0100e-01\t2.5100e-09");
        assert_eq!(lines.len(), 4);
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test]
    async fn text_summary_appends_and_reads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("S1_iv.txt");
        let sink = TextFileSink::new();

        assert!(sink.read_rows(&path).await.unwrap().is_empty());

        let header: Vec<String> = vec!["Step".into(), "Filename".into()];
        let first: Vec<String> = vec!["1".into(), "/data/with space.txt".into()];
        sink.append_row(&path, &header).await.unwrap();
        sink.append_row(&path, &first).await.unwrap();

        let rows = sink.read_rows(&path).await.unwrap();
        assert_eq!(rows, vec![header, first]);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "Step\tFilename\n1\t/data/with space.txt\n"
        );
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test]
    async fn unwritable_target_is_persist_error() {
        let dir = tempdir().unwrap();
        let sink = TextFileSink::new();
        // A directory cannot be opened as a file.
        let result = sink.persist(dir.path(), &sample(), "h").await;
        assert!(matches!(result, Err(DaqError::Persist(_))));
    }

    #[tokio::test]
    async fn memory_sink_failure_injection() {
        let sink = MemorySink::new();
        let path = PathBuf::from("/mem/S1_iv_001.txt");

        sink.fail_next(1);
        assert!(matches!(
            sink.persist(&path, &sample(), "h").await,
            Err(DaqError::Persist(_))
        ));
        assert_eq!(sink.step_count(), 0);

        sink.persist(&path, &sample(), "h").await.unwrap();
        assert_eq!(sink.step(&path).unwrap().data, sample());
        assert_eq!(sink.persist_calls(), 1);
    }
}
