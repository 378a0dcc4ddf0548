//! Measurement data and storage sinks.
pub mod storage;

use serde::{Deserialize, Serialize};

/// Two-dimensional numeric table produced by a single measurement.
///
/// Every row is expected to have one value per column label. Labels are only used
/// for the step file header; the numeric rows are what gets persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepData {
    /// Column labels, e.g. `["Voltage (V)", "Current (A)"]`
    pub columns: Vec<String>,
    /// Row-major values
    pub rows: Vec<Vec<f64>>,
}

impl StepData {
    /// Create an empty table with the given column labels.
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Append a row.
    pub fn push_row(&mut self, row: Vec<f64>) {
        self.rows.push(row);
    }

    /// Builder-style row append.
    pub fn with_row(mut self, row: Vec<f64>) -> Self {
        self.rows.push(row);
        self
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column labels joined by tabs, used as the second header line of step files.
    pub fn column_header(&self) -> String {
        self.columns.join("\t")
    }
}

/// Format a value in C-style `%.4e` notation (`1.2340e-03`).
///
/// Rust's `{:e}` formatter prints exponents without sign padding (`1.2340e-3`);
/// step files keep the two-digit signed exponent that existing analysis scripts
/// parse.
pub fn format_sci(value: f64) -> String {
    if !value.is_finite() {
        return format!("{value}");
    }
    let formatted = format!("{value:.4e}");
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => formatted,
    }
}
