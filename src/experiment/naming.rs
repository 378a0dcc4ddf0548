//! Output file naming for batch runs.
//!
//! Every run writes into `<directory>/<root>` where the root name is
//! `sample_measurement` or `sample_measurement_comment`. Step files get a suffix
//! (`<root>_<suffix>.txt`) and the summary log is `<root>.txt`.

use crate::data::format_sci;
use crate::error::{AppResult, DaqError};
use crate::experiment::policy::StepParameters;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// How step filenames are suffixed. Fixed for a run once it is ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuffixMode {
    /// Consecutive 1-based counter, zero padded: `_001`, `_002`, ...
    #[default]
    Counter,
    /// The step's primary value in `%.4e` notation, optionally labelled: `_V_1.0000e-01`
    StepValue,
    /// Step start time: `_240131_14-05-09-123456`
    Timestamp,
}

impl std::str::FromStr for SuffixMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "counter" => Ok(SuffixMode::Counter),
            "value" | "step_value" => Ok(SuffixMode::StepValue),
            "timestamp" | "time" => Ok(SuffixMode::Timestamp),
            _ => Err(format!(
                "Invalid suffix mode '{}'. Must be one of: counter, value, timestamp",
                s
            )),
        }
    }
}

fn default_extension() -> String {
    "txt".to_string()
}

/// Naming inputs of a batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputNaming {
    /// Output directory
    pub directory: PathBuf,
    /// Sample identifier (required)
    pub sample_id: String,
    /// Measurement name (required)
    pub measurement: String,
    /// Optional free-text comment appended to the root name
    #[serde(default)]
    pub comment: String,
    /// Suffix mode requested for step files
    #[serde(default)]
    pub suffix_mode: SuffixMode,
    /// Label in front of value suffixes, e.g. "V" or "T"
    #[serde(default)]
    pub value_label: Option<String>,
    /// Second header line of every step file
    #[serde(default)]
    pub file_header: String,
    /// Extension of step files and the summary log
    #[serde(default = "default_extension")]
    pub extension: String,
}

impl OutputNaming {
    /// Naming for `sample_id`/`measurement` runs written into `directory`.
    pub fn new(
        directory: impl Into<PathBuf>,
        sample_id: impl Into<String>,
        measurement: impl Into<String>,
    ) -> Self {
        Self {
            directory: directory.into(),
            sample_id: sample_id.into(),
            measurement: measurement.into(),
            comment: String::new(),
            suffix_mode: SuffixMode::default(),
            value_label: None,
            file_header: String::new(),
            extension: default_extension(),
        }
    }

    /// Append a free-text comment to the root name.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Choose how step files are suffixed.
    pub fn with_suffix_mode(mut self, mode: SuffixMode) -> Self {
        self.suffix_mode = mode;
        self
    }

    /// Prefix for the value suffix (e.g. `V` gives `V_1.0000e-01`).
    pub fn with_value_label(mut self, label: impl Into<String>) -> Self {
        self.value_label = Some(label.into());
        self
    }

    /// User header written as the second line of every step file.
    pub fn with_file_header(mut self, header: impl Into<String>) -> Self {
        self.file_header = header.into();
        self
    }

    /// `sample_measurement[_comment]`.
    ///
    /// Sample and measurement must be non-empty and no part may contain a path
    /// separator.
    pub fn root_name(&self) -> AppResult<String> {
        let sample = self.sample_id.trim();
        let measurement = self.measurement.trim();
        let comment = self.comment.trim();

        if sample.is_empty() || measurement.is_empty() {
            return Err(DaqError::Validation(
                "Sample ID and Measurement fields can not be empty".into(),
            ));
        }
        for part in [sample, measurement, comment] {
            if part.contains(['/', '\\']) {
                return Err(DaqError::Validation(format!(
                    "Name part '{part}' must not contain path separators"
                )));
            }
        }

        Ok(if comment.is_empty() {
            format!("{sample}_{measurement}")
        } else {
            format!("{sample}_{measurement}_{comment}")
        })
    }

    /// Output directory joined with the root name.
    pub fn root_path(&self) -> AppResult<PathBuf> {
        Ok(self.directory.join(self.root_name()?))
    }

    /// Path of the summary log: `<root>.<ext>`.
    pub fn summary_path(&self) -> AppResult<PathBuf> {
        Ok(self
            .directory
            .join(format!("{}.{}", self.root_name()?, self.extension)))
    }

    /// Path of the step file for `index` under `mode`.
    pub fn step_path(
        &self,
        mode: SuffixMode,
        index: usize,
        parameters: &StepParameters,
        started: NaiveDateTime,
    ) -> AppResult<PathBuf> {
        let suffix = match (mode, parameters.primary_value()) {
            (SuffixMode::StepValue, Some(value)) => match &self.value_label {
                Some(label) => format!("{}_{}", label, format_sci(value)),
                None => format_sci(value),
            },
            (SuffixMode::Timestamp, _) => started.format("%y%m%d_%H-%M-%S-%6f").to_string(),
            (SuffixMode::Counter, _) | (SuffixMode::StepValue, None) => {
                format!("{:03}", index + 1)
            }
        };
        Ok(self
            .directory
            .join(format!("{}_{}.{}", self.root_name()?, suffix, self.extension)))
    }

    /// Create the output directory if needed and make sure it is writable.
    pub fn check_writable(&self) -> AppResult<()> {
        fs::create_dir_all(&self.directory).map_err(|e| {
            DaqError::Validation(format!(
                "Cannot create output directory {}: {e}",
                self.directory.display()
            ))
        })?;
        let metadata = fs::metadata(&self.directory).map_err(|e| {
            DaqError::Validation(format!(
                "Cannot access output directory {}: {e}",
                self.directory.display()
            ))
        })?;
        if !metadata.is_dir() {
            return Err(DaqError::Validation(format!(
                "{} is not a directory",
                self.directory.display()
            )));
        }
        if metadata.permissions().readonly() {
            return Err(DaqError::Validation(format!(
                "Output directory {} is read-only",
                self.directory.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn started() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 31)
            .unwrap()
            .and_hms_micro_opt(14, 5, 9, 123_456)
            .unwrap()
    }

    #[test]
    fn root_name_with_and_without_comment() {
        let naming = OutputNaming::new("/data", "S1", "iv");
        assert_eq!(naming.root_name().unwrap(), "S1_iv");
        assert_eq!(
            naming.clone().with_comment("dark").root_name().unwrap(),
            "S1_iv_dark"
        );
        assert_eq!(naming.summary_path().unwrap(), PathBuf::from("/data/S1_iv.txt"));
    }

    #[test]
    fn empty_names_are_rejected() {
        let naming = OutputNaming::new("/data", "", "iv");
        assert!(matches!(naming.root_name(), Err(DaqError::Validation(_))));
        let naming = OutputNaming::new("/data", "S1", "a/b");
        assert!(matches!(naming.root_name(), Err(DaqError::Validation(_))));
    }

    #[test]
    fn suffixes() {
        let naming = OutputNaming::new("/data", "S1", "iv").with_value_label("V");
        let params = StepParameters::new().with("value", 0.1);

        assert_eq!(
            naming.step_path(SuffixMode::Counter, 6, &params, started()).unwrap(),
            PathBuf::from("/data/S1_iv_007.txt")
        );
        assert_eq!(
            naming.step_path(SuffixMode::StepValue, 0, &params, started()).unwrap(),
            PathBuf::from("/data/S1_iv_V_1.0000e-01.txt")
        );
        assert_eq!(
            naming.step_path(SuffixMode::Timestamp, 0, &params, started()).unwrap(),
            PathBuf::from("/data/S1_iv_240131_14-05-09-123456.txt")
        );
        assert_eq!(
            naming
                .step_path(SuffixMode::StepValue, 1, &StepParameters::new(), started())
                .unwrap(),
            PathBuf::from("/data/S1_iv_002.txt")
        );
    }

    #[test]
    fn writable_directory_is_created() {
        let dir = tempdir().unwrap();
        let naming = OutputNaming::new(dir.path().join("nested/out"), "S1", "cv");
        naming.check_writable().unwrap();
        assert!(dir.path().join("nested/out").is_dir());
    }

    #[test]
    fn suffix_mode_parsing() {
        assert_eq!("value".parse::<SuffixMode>().unwrap(), SuffixMode::StepValue);
        assert_eq!("Counter".parse::<SuffixMode>().unwrap(), SuffixMode::Counter);
        assert!("random".parse::<SuffixMode>().is_err());
    }
}
