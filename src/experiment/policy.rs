//! Step-generating policies.
//!
//! A [`StepPolicy`] is a pure function from a step index to the parameters of
//! that step. Policies hold nothing but the numbers they were built from, so
//! asking twice for the same index always gives the same answer.

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{DeviceOptions, ParamValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lower clamp for logarithmic sweep bounds.
pub const LOG_FLOOR: f64 = 1e-9;

/// Relative tolerance on the last point of stepped sweeps, so that
/// `0..1 step 0.25` includes 1.0 despite rounding.
const STEP_TOLERANCE: f64 = 1e-4;

/// Largest number of steps a single policy may produce.
pub const MAX_STEPS: usize = 10_000_000;

/// `floor(span) + 1`, or zero when the span is not finite or exceeds [`MAX_STEPS`].
fn bounded_count(span: f64) -> usize {
    if !span.is_finite() || span < 0.0 || span >= MAX_STEPS as f64 {
        return 0;
    }
    (span.floor() as usize).saturating_add(1)
}

/// Ordered parameters of one step.
///
/// Order is the declaration order of the policy and becomes the column order of
/// the summary log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepParameters(Vec<(String, ParamValue)>);

impl StepParameters {
    /// Empty parameter set.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Set `name`, replacing an existing value in place.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.0.push((name, value)),
        }
    }

    /// Append `name = value`.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Value of `name`, if present.
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Parameter names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }

    /// Parameter values in order.
    pub fn values(&self) -> impl Iterator<Item = &ParamValue> {
        self.0.iter().map(|(_, v)| v)
    }

    /// `(name, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// First numeric value, used for value-based filenames.
    pub fn primary_value(&self) -> Option<f64> {
        self.0.iter().find_map(|(_, v)| v.as_f64())
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parameters as a device settings mapping.
    pub fn to_options(&self) -> DeviceOptions {
        self.0.iter().cloned().collect()
    }
}

impl fmt::Display for StepParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(n, v)| format!("{n} = {v}")).collect();
        f.write_str(&parts.join("\t"))
    }
}

/// Step generator of a batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum StepPolicy {
    /// Evenly spaced values from `start` to `stop` (inclusive) every `step`
    LinearSweep { start: f64, stop: f64, step: f64 },
    /// Logarithmically spaced values with `points_per_decade`
    LogSweep {
        start: f64,
        stop: f64,
        points_per_decade: u32,
    },
    /// The same measurement `count` times, waiting `wait_seconds` after each
    RepeatN { count: usize, wait_seconds: f64 },
    /// Setpoints from `start` towards `stop` every `step`, clamped to the range
    TemperatureRamp { start: f64, stop: f64, step: f64 },
}

fn stepped_count(start: f64, stop: f64, step: f64) -> usize {
    if !(start.is_finite() && stop.is_finite() && step.is_finite()) || step == 0.0 {
        return 0;
    }
    bounded_count((stop - start).abs() / step.abs() + STEP_TOLERANCE)
}

fn log_bounds(start: f64, stop: f64) -> (f64, f64) {
    (start.max(LOG_FLOOR).log10(), stop.max(LOG_FLOOR).log10())
}

impl StepPolicy {
    /// Total number of steps. Zero for an invalid policy.
    pub fn count(&self) -> usize {
        match *self {
            StepPolicy::LinearSweep { start, stop, step }
            | StepPolicy::TemperatureRamp { start, stop, step } => stepped_count(start, stop, step),
            StepPolicy::LogSweep {
                start,
                stop,
                points_per_decade,
            } => {
                if !(start.is_finite() && stop.is_finite()) || points_per_decade == 0 {
                    return 0;
                }
                let high = start.max(stop).max(LOG_FLOOR);
                let low = start.min(stop).max(LOG_FLOOR);
                let decades = high.log10() - low.log10();
                bounded_count(decades * f64::from(points_per_decade) + 1e-9)
            }
            StepPolicy::RepeatN { count, .. } => count,
        }
    }

    /// Primary value of step `index`, or `None` past the end.
    ///
    /// `RepeatN` yields the 1-based repetition number.
    pub fn value_at(&self, index: usize) -> Option<f64> {
        let count = self.count();
        if index >= count {
            return None;
        }
        let i = index as f64;
        let value = match *self {
            StepPolicy::LinearSweep { start, stop, step } => {
                start + (stop - start).signum() * step.abs() * i
            }
            StepPolicy::LogSweep { start, stop, .. } => {
                let (ini, fin) = log_bounds(start, stop);
                if count == 1 {
                    10f64.powf(ini)
                } else if index == count - 1 {
                    10f64.powf(fin)
                } else {
                    10f64.powf(ini + i * (fin - ini) / (count - 1) as f64)
                }
            }
            StepPolicy::RepeatN { .. } => i + 1.0,
            StepPolicy::TemperatureRamp { start, stop, step } => {
                let (low, high) = (start.min(stop), start.max(stop));
                let direction = if stop >= start { 1.0 } else { -1.0 };
                (start + direction * step.abs() * i).clamp(low, high)
            }
        };
        Some(value)
    }

    /// Name of the parameter `value_at` fills.
    pub fn parameter_name(&self) -> &'static str {
        match self {
            StepPolicy::LinearSweep { .. } | StepPolicy::LogSweep { .. } => "value",
            StepPolicy::RepeatN { .. } => "repetition",
            StepPolicy::TemperatureRamp { .. } => "temperature",
        }
    }

    /// Parameters of step `index`, or `None` past the end.
    pub fn parameters_at(&self, index: usize) -> Option<StepParameters> {
        self.value_at(index)
            .map(|value| StepParameters::new().with(self.parameter_name(), value))
    }

    /// Pause after step `index` completes.
    pub fn wait_after(&self, _index: usize) -> Duration {
        match *self {
            StepPolicy::RepeatN { wait_seconds, .. } if wait_seconds.is_finite() && wait_seconds > 0.0 => {
                Duration::from_secs_f64(wait_seconds)
            }
            _ => Duration::ZERO,
        }
    }

    /// All values in step order.
    pub fn values(&self) -> Vec<f64> {
        (0..self.count()).filter_map(|i| self.value_at(i)).collect()
    }

    /// Reject non-finite bounds, zero steps and empty policies.
    pub fn validate(&self) -> AppResult<()> {
        let finite = |name: &str, value: f64| {
            if value.is_finite() {
                Ok(())
            } else {
                Err(DaqError::Validation(format!("{name} must be finite, got {value}")))
            }
        };

        match *self {
            StepPolicy::LinearSweep { start, stop, step }
            | StepPolicy::TemperatureRamp { start, stop, step } => {
                finite("start", start)?;
                finite("stop", stop)?;
                finite("step", step)?;
                if step == 0.0 {
                    return Err(DaqError::Validation("step must be non-zero".into()));
                }
            }
            StepPolicy::LogSweep {
                start,
                stop,
                points_per_decade,
            } => {
                finite("start", start)?;
                finite("stop", stop)?;
                if points_per_decade == 0 {
                    return Err(DaqError::Validation(
                        "points_per_decade must be at least 1".into(),
                    ));
                }
            }
            StepPolicy::RepeatN {
                count,
                wait_seconds,
            } => {
                finite("wait_seconds", wait_seconds)?;
                if wait_seconds < 0.0 {
                    return Err(DaqError::Validation(format!(
                        "wait_seconds must not be negative, got {wait_seconds}"
                    )));
                }
                if count == 0 {
                    return Err(DaqError::Validation("count must be at least 1".into()));
                }
            }
        }

        if self.count() == 0 {
            return Err(DaqError::Validation(format!(
                "{self} yields no steps or more than {MAX_STEPS}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for StepPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepPolicy::LinearSweep { start, stop, step } => {
                write!(f, "linear sweep {start} to {stop} every {step}")
            }
            StepPolicy::LogSweep {
                start,
                stop,
                points_per_decade,
            } => write!(f, "log sweep {start:e} to {stop:e}, {points_per_decade}/decade"),
            StepPolicy::RepeatN {
                count,
                wait_seconds,
            } => write!(f, "{count} repetitions, {wait_seconds} s apart"),
            StepPolicy::TemperatureRamp { start, stop, step } => {
                write!(f, "temperature ramp {start} K to {stop} K every {step} K")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1e-30)
    }

    #[test]
    fn linear_sweep_includes_stop() {
        let policy = StepPolicy::LinearSweep {
            start: 0.0,
            stop: 1.0,
            step: 0.25,
        };
        assert_eq!(policy.count(), 5);
        assert_eq!(policy.values(), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(policy.value_at(5), None);
    }

    #[test]
    fn linear_sweep_downwards() {
        let policy = StepPolicy::LinearSweep {
            start: 1.0,
            stop: -1.0,
            step: 0.5,
        };
        assert_eq!(policy.count(), 5);
        assert_eq!(policy.value_at(4), Some(-1.0));
    }

    #[test]
    fn linear_sweep_partial_last_step() {
        let policy = StepPolicy::LinearSweep {
            start: 0.0,
            stop: 1.0,
            step: 0.3,
        };
        assert_eq!(policy.count(), 4);
        assert!(close(policy.value_at(3).unwrap(), 0.9));
    }

    #[test]
    fn log_sweep_six_decades() {
        let policy = StepPolicy::LogSweep {
            start: 1e-9,
            stop: 1e-3,
            points_per_decade: 10,
        };
        assert_eq!(policy.count(), 61);
        assert!(close(policy.value_at(0).unwrap(), 1e-9));
        assert!(close(policy.value_at(60).unwrap(), 1e-3));
        assert!(close(policy.value_at(10).unwrap(), 1e-8));

        let values = policy.values();
        assert!(values.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn log_sweep_clamps_zero_start() {
        let policy = StepPolicy::LogSweep {
            start: 0.0,
            stop: 1e-6,
            points_per_decade: 5,
        };
        assert_eq!(policy.count(), 16);
        assert!(close(policy.value_at(0).unwrap(), 1e-9));
    }

    #[test]
    fn repeat_n_counts_repetitions() {
        let policy = StepPolicy::RepeatN {
            count: 3,
            wait_seconds: 1.0,
        };
        assert_eq!(policy.count(), 3);
        assert_eq!(policy.values(), vec![1.0, 2.0, 3.0]);
        assert_eq!(policy.wait_after(0), Duration::from_secs(1));
        assert_eq!(
            policy.parameters_at(2).unwrap().get("repetition"),
            Some(&ParamValue::Number(3.0))
        );
    }

    #[test]
    fn temperature_ramp_is_monotonic_and_clamped() {
        let up = StepPolicy::TemperatureRamp {
            start: 280.0,
            stop: 300.0,
            step: -7.0,
        };
        assert_eq!(up.count(), 3);
        assert_eq!(up.values(), vec![280.0, 287.0, 294.0]);

        let down = StepPolicy::TemperatureRamp {
            start: 300.0,
            stop: 77.0,
            step: 50.0,
        };
        let values = down.values();
        assert_eq!(values.len(), 5);
        assert!(values.windows(2).all(|w| w[1] < w[0]));
        assert!(values.iter().all(|v| (77.0..=300.0).contains(v)));
    }

    #[test]
    fn policies_are_pure() {
        let policy = StepPolicy::LogSweep {
            start: 1e-3,
            stop: 1.0,
            points_per_decade: 7,
        };
        for i in 0..policy.count() {
            assert_eq!(policy.value_at(i), policy.value_at(i));
        }
    }

    #[test]
    fn validation_rejects_degenerate_policies() {
        assert!(StepPolicy::LinearSweep {
            start: 0.0,
            stop: 1.0,
            step: 0.0
        }
        .validate()
        .is_err());
        assert!(StepPolicy::LogSweep {
            start: 1.0,
            stop: 10.0,
            points_per_decade: 0
        }
        .validate()
        .is_err());
        assert!(StepPolicy::RepeatN {
            count: 0,
            wait_seconds: 0.0
        }
        .validate()
        .is_err());
        assert!(StepPolicy::RepeatN {
            count: 2,
            wait_seconds: -1.0
        }
        .validate()
        .is_err());
        assert!(StepPolicy::TemperatureRamp {
            start: f64::NAN,
            stop: 1.0,
            step: 1.0
        }
        .validate()
        .is_err());
    }

    #[test]
    fn parameters_keep_insertion_order() {
        let params = StepParameters::new()
            .with("wavelength", 500.0)
            .with("filter", "OD1")
            .with("wavelength", 510.0);
        assert_eq!(params.names().collect::<Vec<_>>(), vec!["wavelength", "filter"]);
        assert_eq!(params.primary_value(), Some(510.0));
        assert_eq!(params.to_string(), "wavelength = 5.1000e+02\tfilter = OD1");
    }
}
