//! Dummy Hardware Implementations
//!
//! Provides simulated instruments for every [`CapabilityKind`], so batches can be
//! exercised end to end without physical hardware. Descriptors with the `Dummy`
//! connection kind are instantiated as [`DummyDevice`] by the built-in factories.
//! All timing uses `tokio::time::sleep`, never `std::thread::sleep`.
//!
//! # Simulated behaviour
//!
//! | Kind | Columns | Model |
//! |------|---------|-------|
//! | SMU | Voltage, Current | diode around the configured bias |
//! | Lockin | Time, R, Theta | flat signal with noise |
//! | Monochromator | Wavelength, Signal | current wavelength |
//! | Spectrometer | Wavelength, Counts | gaussian line at 550 nm |
//! | ImpedanceAnalyzer | Frequency, Z, Phase | series RC |
//! | TemperatureController | Time, Temperature, Setpoint | setpoint ± 1 K |
//! | Oscilloscope | Time, Voltage | 1 kHz sine |

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

use crate::data::StepData;
use crate::hardware::capabilities::{CapabilityKind, Device, DeviceOptions, ParamValue};

const DEFAULT_POINTS: usize = 11;

#[derive(Debug, Default)]
struct DummyState {
    open: bool,
    options: DeviceOptions,
}

/// Simulated instrument of any kind.
///
/// # Example
///
/// ```rust,ignore
/// let smu = DummyDevice::new(CapabilityKind::Smu, "Dummy SMU");
/// smu.open().await?;
/// smu.configure(&[("value".to_string(), 0.5.into())].into()).await?;
/// let data = smu.measure().await?;
/// assert_eq!(data.columns[0], "Voltage (V)");
/// ```
pub struct DummyDevice {
    kind: CapabilityKind,
    name: String,
    latency: Duration,
    state: RwLock<DummyState>,
    measure_count: AtomicUsize,
    fail_next_measure: AtomicBool,
    aborted: AtomicBool,
}

impl DummyDevice {
    /// Create a dummy of the given kind that answers instantly.
    pub fn new(kind: CapabilityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            latency: Duration::ZERO,
            state: RwLock::new(DummyState::default()),
            measure_count: AtomicUsize::new(0),
            fail_next_measure: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
        }
    }

    /// Simulated acquisition time per `measure` call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `measure` call fail once.
    pub fn inject_measure_failure(&self) {
        self.fail_next_measure.store(true, Ordering::SeqCst);
    }

    /// Number of completed `measure` calls.
    pub fn measure_count(&self) -> usize {
        self.measure_count.load(Ordering::SeqCst)
    }

    /// Whether `abort` was called.
    pub fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Whether the device is currently open.
    pub async fn is_open(&self) -> bool {
        self.state.read().await.open
    }

    /// Last value set for `key` through `configure`.
    pub async fn option(&self, key: &str) -> Option<ParamValue> {
        self.state.read().await.options.get(key).cloned()
    }

    fn simulate(&self, options: &DeviceOptions) -> StepData {
        let number = |keys: &[&str], default: f64| {
            keys.iter()
                .find_map(|key| options.get(*key).and_then(ParamValue::as_f64))
                .unwrap_or(default)
        };
        let points = number(&["points"], DEFAULT_POINTS as f64).max(1.0) as usize;
        let mut rng = rand::thread_rng();

        match self.kind {
            CapabilityKind::Smu => {
                let bias = number(&["value", "bias"], 0.0);
                let mut data = StepData::new(["Voltage (V)", "Current (A)"]);
                for i in 0..points {
                    let v = bias + (i as f64 - (points / 2) as f64) * 1e-3;
                    let i_diode = 1e-12 * ((v / 0.025_f64).min(40.0).exp() - 1.0);
                    data.push_row(vec![v, i_diode + rng.gen_range(-1e-12..1e-12)]);
                }
                data
            }
            CapabilityKind::Lockin => {
                let mut data = StepData::new(["Time (s)", "R (V)", "Theta (deg)"]);
                for i in 0..points {
                    data.push_row(vec![
                        i as f64 * 0.1,
                        1e-3 + rng.gen_range(-1e-5..1e-5),
                        rng.gen_range(-180.0..180.0),
                    ]);
                }
                data
            }
            CapabilityKind::Monochromator => {
                let wavelength = number(&["value", "wavelength"], 500.0);
                StepData::new(["Wavelength (nm)", "Signal"])
                    .with_row(vec![wavelength, rng.gen_range(0.0..1.0)])
            }
            CapabilityKind::Spectrometer => {
                let mut data = StepData::new(["Wavelength (nm)", "Counts"]);
                for i in 0..points {
                    let wl = 400.0 + 300.0 * i as f64 / points.max(2).saturating_sub(1) as f64;
                    let line = 1e4 * (-((wl - 550.0) / 20.0).powi(2)).exp();
                    data.push_row(vec![wl, line + rng.gen_range(0.0..50.0)]);
                }
                data
            }
            CapabilityKind::ImpedanceAnalyzer => {
                let (r, c) = (1e3, 1e-9);
                let mut data = StepData::new(["Frequency (Hz)", "Z (Ohm)", "Phase (deg)"]);
                for i in 0..points {
                    let f = 10f64.powf(2.0 + 4.0 * i as f64 / points.max(2).saturating_sub(1) as f64);
                    let xc = 1.0 / (2.0 * std::f64::consts::PI * f * c);
                    data.push_row(vec![
                        f,
                        (r * r + xc * xc).sqrt(),
                        -(xc / r).atan().to_degrees(),
                    ]);
                }
                data
            }
            CapabilityKind::TemperatureController => {
                let setpoint = number(&["temperature", "value", "setpoint"], 300.0);
                let mut data = StepData::new(["Time (s)", "Temperature (K)", "Setpoint (K)"]);
                for i in 0..points {
                    data.push_row(vec![
                        i as f64,
                        setpoint + rng.gen_range(-1.0..1.0),
                        setpoint,
                    ]);
                }
                data
            }
            CapabilityKind::Oscilloscope => {
                let mut data = StepData::new(["Time (s)", "Voltage (V)"]);
                for i in 0..points {
                    let t = i as f64 * 1e-5;
                    let v = (2.0 * std::f64::consts::PI * 1e3 * t).sin();
                    data.push_row(vec![t, v + rng.gen_range(-0.01..0.01)]);
                }
                data
            }
        }
    }
}

#[async_trait]
impl Device for DummyDevice {
    fn kind(&self) -> CapabilityKind {
        self.kind
    }

    async fn open(&self) -> Result<()> {
        self.state.write().await.open = true;
        tracing::debug!(device = %self.name, kind = %self.kind, "Dummy device opened");
        Ok(())
    }

    async fn close(&self) {
        self.state.write().await.open = false;
        tracing::debug!(device = %self.name, "Dummy device closed");
    }

    async fn configure(&self, options: &DeviceOptions) -> Result<()> {
        let mut state = self.state.write().await;
        for (key, value) in options {
            state.options.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn measure(&self) -> Result<StepData> {
        if !self.state.read().await.open {
            bail!("{} is not open", self.name);
        }
        if self.fail_next_measure.swap(false, Ordering::SeqCst) {
            bail!("{}: simulated acquisition failure", self.name);
        }
        self.aborted.store(false, Ordering::SeqCst);

        sleep(self.latency).await;

        let options = self.state.read().await.options.clone();
        let data = self.simulate(&options);
        self.measure_count.fetch_add(1, Ordering::SeqCst);
        Ok(data)
    }

    async fn identify(&self) -> Result<String> {
        Ok(self.name.clone())
    }

    async fn abort(&self) -> Result<()> {
        self.aborted.store(true, Ordering::SeqCst);
        tracing::info!(device = %self.name, "Dummy acquisition aborted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn smu_follows_bias() {
        let smu = DummyDevice::new(CapabilityKind::Smu, "Dummy SMU");
        smu.open().await.unwrap();

        let mut options = DeviceOptions::new();
        options.insert("value".into(), ParamValue::Number(0.5));
        options.insert("points".into(), ParamValue::Number(3.0));
        smu.configure(&options).await.unwrap();

        let data = smu.measure().await.unwrap();
        assert_eq!(data.columns, vec!["Voltage (V)", "Current (A)"]);
        assert_eq!(data.len(), 3);
        assert!((data.rows[1][0] - 0.5).abs() < 1e-12);
        assert_eq!(smu.measure_count(), 1);
    }

    #[tokio::test]
    async fn temperature_tracks_setpoint() {
        let controller = DummyDevice::new(CapabilityKind::TemperatureController, "Dummy T");
        controller.open().await.unwrap();

        let mut options = DeviceOptions::new();
        options.insert("temperature".into(), ParamValue::Number(77.0));
        controller.configure(&options).await.unwrap();

        let data = controller.measure().await.unwrap();
        for row in &data.rows {
            assert!((row[1] - 77.0).abs() <= 1.0);
            assert_eq!(row[2], 77.0);
        }
    }

    #[tokio::test]
    async fn measure_requires_open() {
        let scope = DummyDevice::new(CapabilityKind::Oscilloscope, "Dummy scope");
        assert!(scope.measure().await.is_err());

        scope.open().await.unwrap();
        scope.close().await;
        scope.close().await;
        assert!(!scope.is_open().await);
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let lockin = DummyDevice::new(CapabilityKind::Lockin, "Dummy lock-in");
        lockin.open().await.unwrap();
        lockin.inject_measure_failure();

        assert!(lockin.measure().await.is_err());
        assert!(lockin.measure().await.is_ok());
    }

    #[tokio::test]
    async fn every_kind_produces_data() {
        for kind in CapabilityKind::ALL {
            let device = DummyDevice::new(kind, format!("Dummy {kind}"));
            device.open().await.unwrap();
            let data = device.measure().await.unwrap();
            assert!(!data.is_empty(), "{kind} produced no rows");
            assert!(data.rows.iter().all(|row| row.len() == data.columns.len()));
            assert_eq!(device.identify().await.unwrap(), format!("Dummy {kind}"));
        }
    }
}
