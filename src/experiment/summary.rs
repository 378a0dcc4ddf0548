//! Summary log rows.
//!
//! The summary log holds one tab-separated line per completed step, preceded by
//! a header line:
//!
//! ```text
//! Step  value       Start time                  End time                    Duration (s)  Filename
//! 1     0.0000e+00  2024-01-31 14:05:09.123456  2024-01-31 14:05:10.200000  1.076544      /data/S1_iv_001.txt
//! ```
//!
//! `Step` is 1-based on disk and 0-based in memory.

use crate::error::{AppResult, DaqError};
use crate::experiment::policy::StepParameters;
use crate::hardware::capabilities::ParamValue;
use chrono::NaiveDateTime;
use std::path::PathBuf;

/// Timestamp format of the start/end columns.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

const STEP_COLUMN: &str = "Step";
const TRAILING_COLUMNS: [&str; 4] = ["Start time", "End time", "Duration (s)", "Filename"];

/// Record of one completed step.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    /// 0-based step index
    pub index: usize,
    /// Parameters applied for the step
    pub parameters: StepParameters,
    /// Proceed time
    pub started: NaiveDateTime,
    /// Wrapup time
    pub finished: NaiveDateTime,
    /// Seconds between start and end
    pub duration_secs: f64,
    /// Step file
    pub filename: PathBuf,
}

impl SummaryRow {
    /// Header line for a log whose steps carry `parameter_names`.
    pub fn header<'a>(parameter_names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut header = vec![STEP_COLUMN.to_string()];
        header.extend(parameter_names.into_iter().map(String::from));
        header.extend(TRAILING_COLUMNS.iter().map(|c| c.to_string()));
        header
    }

    /// Fields as written to the log.
    pub fn to_fields(&self) -> Vec<String> {
        let mut fields = Vec::with_capacity(self.parameters.len() + 5);
        fields.push((self.index + 1).to_string());
        fields.extend(self.parameters.values().map(ToString::to_string));
        fields.push(self.started.format(TIME_FORMAT).to_string());
        fields.push(self.finished.format(TIME_FORMAT).to_string());
        fields.push(format!("{:.6}", self.duration_secs));
        fields.push(self.filename.display().to_string());
        fields
    }

    /// Rebuild a row from its logged fields, using `header` for parameter names.
    pub fn from_fields(header: &[String], fields: &[String]) -> AppResult<Self> {
        let corrupt = |what: &str| DaqError::Persist(format!("Corrupt summary row {fields:?}: {what}"));

        if fields.len() != header.len() || fields.len() < 1 + TRAILING_COLUMNS.len() {
            return Err(corrupt("unexpected number of fields"));
        }
        let n_params = fields.len() - 1 - TRAILING_COLUMNS.len();

        let step: usize = fields[0].trim().parse().map_err(|_| corrupt("bad step number"))?;
        let index = step.checked_sub(1).ok_or_else(|| corrupt("step numbers start at 1"))?;

        let mut parameters = StepParameters::new();
        for (name, cell) in header[1..=n_params].iter().zip(&fields[1..=n_params]) {
            parameters.insert(name.clone(), ParamValue::parse(cell));
        }

        let rest = &fields[1 + n_params..];
        let parse_time = |cell: &str| {
            NaiveDateTime::parse_from_str(cell.trim(), TIME_FORMAT).map_err(|_| corrupt("bad timestamp"))
        };

        Ok(Self {
            index,
            parameters,
            started: parse_time(&rest[0])?,
            finished: parse_time(&rest[1])?,
            duration_secs: rest[2].trim().parse().map_err(|_| corrupt("bad duration"))?,
            filename: PathBuf::from(rest[3].trim()),
        })
    }
}

/// Parse a whole summary log (header first) into rows.
///
/// Rows must be contiguous from step 1; anything else means the log does not
/// belong to a single run and cannot be resumed.
pub fn parse_summary(rows: &[Vec<String>]) -> AppResult<Vec<SummaryRow>> {
    let mut lines = rows.iter().filter(|row| row.iter().any(|cell| !cell.trim().is_empty()));

    let Some(header) = lines.next() else {
        return Ok(Vec::new());
    };
    if header.first().map(|c| c.trim()) != Some(STEP_COLUMN) {
        return Err(DaqError::Persist(format!(
            "Summary log does not start with a header line: {header:?}"
        )));
    }

    let mut parsed = Vec::new();
    for fields in lines {
        let row = SummaryRow::from_fields(header, fields)?;
        if row.index != parsed.len() {
            return Err(DaqError::Persist(format!(
                "Summary log out of order: expected step {}, found step {}",
                parsed.len() + 1,
                row.index + 1
            )));
        }
        parsed.push(row);
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 31)
            .unwrap()
            .and_hms_micro_opt(14, 5, second, 250_000)
            .unwrap()
    }

    fn row(index: usize) -> SummaryRow {
        SummaryRow {
            index,
            parameters: StepParameters::new().with("value", 0.25 * index as f64),
            started: at(index as u32),
            finished: at(index as u32 + 1),
            duration_secs: 1.0,
            filename: PathBuf::from(format!("/data/S1_iv_{:03}.txt", index + 1)),
        }
    }

    #[test]
    fn header_and_fields_line_up() {
        let header = SummaryRow::header(["value"]);
        assert_eq!(
            header,
            vec!["Step", "value", "Start time", "End time", "Duration (s)", "Filename"]
        );

        let fields = row(1).to_fields();
        assert_eq!(fields.len(), header.len());
        assert_eq!(fields[0], "2");
        assert_eq!(fields[1], "2.5000e-01");
        assert_eq!(fields[2], "2024-01-31 14:05:01.250000");
    }

    #[test]
    fn summary_parses_back() {
        let mut log = vec![SummaryRow::header(["value"])];
        log.extend((0..3).map(|i| row(i).to_fields()));

        let rows = parse_summary(&log).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2], row(2));
    }

    #[test]
    fn gaps_are_rejected() {
        let log = vec![SummaryRow::header(["value"]), row(0).to_fields(), row(2).to_fields()];
        assert!(matches!(parse_summary(&log), Err(DaqError::Persist(_))));
    }

    #[test]
    fn empty_log_has_no_rows() {
        assert!(parse_summary(&[]).unwrap().is_empty());
    }
}
