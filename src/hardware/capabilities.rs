//! Device Capability Contract
//!
//! Every instrument the registry can hand out implements [`Device`]. The batch core
//! never talks to hardware through anything else: drivers for source-measure units,
//! lock-in amplifiers, monochromators and the rest only have to satisfy this one
//! async trait.
//!
//! # Design
//!
//! The trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync) so a handle can be shared between the
//!   registry and a running batch
//! - Uses anyhow::Result for errors; the registry and sequencer translate them
//! - Keeps optional capabilities (`identify`, `interface`, `abort`) behind default
//!   methods, so callers probe for them instead of assuming them
//!
//! # Example
//!
//! ```rust,ignore
//! struct Keithley2400 { port: SerialAdapter }
//!
//! #[async_trait]
//! impl Device for Keithley2400 {
//!     fn kind(&self) -> CapabilityKind { CapabilityKind::Smu }
//!
//!     async fn open(&self) -> Result<()> { self.port.connect().await }
//!     async fn close(&self) {
//!         if let Err(e) = self.port.disconnect().await {
//!             tracing::warn!(error = %e, "Keithley close failed");
//!         }
//!     }
//!     async fn configure(&self, options: &DeviceOptions) -> Result<()> { /* ... */ Ok(()) }
//!     async fn measure(&self) -> Result<StepData> { /* ... */ }
//! }
//! ```

use crate::data::StepData;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// Device Classification
// =============================================================================

/// Instrument family a descriptor belongs to.
///
/// The registry keys its factory catalog by this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CapabilityKind {
    /// Source-measure unit
    #[serde(rename = "SMU", alias = "Smu")]
    Smu,
    /// Lock-in amplifier
    Lockin,
    /// Monochromator
    Monochromator,
    /// Spectrometer
    Spectrometer,
    /// Impedance analyzer
    ImpedanceAnalyzer,
    /// Temperature controller
    TemperatureController,
    /// Oscilloscope
    Oscilloscope,
}

impl CapabilityKind {
    /// Every kind, in a stable order.
    pub const ALL: [CapabilityKind; 7] = [
        CapabilityKind::Smu,
        CapabilityKind::Lockin,
        CapabilityKind::Monochromator,
        CapabilityKind::Spectrometer,
        CapabilityKind::ImpedanceAnalyzer,
        CapabilityKind::TemperatureController,
        CapabilityKind::Oscilloscope,
    ];
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CapabilityKind::Smu => "SMU",
            CapabilityKind::Lockin => "Lockin",
            CapabilityKind::Monochromator => "Monochromator",
            CapabilityKind::Spectrometer => "Spectrometer",
            CapabilityKind::ImpedanceAnalyzer => "ImpedanceAnalyzer",
            CapabilityKind::TemperatureController => "TemperatureController",
            CapabilityKind::Oscilloscope => "Oscilloscope",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for CapabilityKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        CapabilityKind::ALL
            .into_iter()
            .find(|kind| kind.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                format!(
                    "Unknown capability kind '{}'. Must be one of: {}",
                    s,
                    CapabilityKind::ALL.map(|k| k.to_string()).join(", ")
                )
            })
    }
}

/// How the host reaches the physical instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionKind {
    /// Simulated device, never exclusive
    Dummy,
    /// RS-232 or USB-serial port
    Serial,
    /// GPIB bus (VISA resource string)
    #[serde(rename = "GPIB", alias = "Gpib")]
    Gpib,
    /// Vendor USB library, addressed by serial number
    #[serde(rename = "AutoUSB", alias = "AutoUsb")]
    AutoUsb,
}

impl ConnectionKind {
    /// Dummy devices can be checked out any number of times.
    pub fn is_exclusive(&self) -> bool {
        !matches!(self, ConnectionKind::Dummy)
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionKind::Dummy => "Dummy",
            ConnectionKind::Serial => "Serial",
            ConnectionKind::Gpib => "GPIB",
            ConnectionKind::AutoUsb => "AutoUSB",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Parameters
// =============================================================================

/// A named setting value passed to a device or recorded for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Numeric setting (bias, wavelength, setpoint)
    Number(f64),
    /// Free-text setting (range name, channel)
    Text(String),
}

impl ParamValue {
    /// Numeric value, if this is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Number(value) => Some(*value),
            ParamValue::Text(_) => None,
        }
    }

    /// Parse a persisted cell back into a value: numbers stay numbers.
    pub fn parse(cell: &str) -> Self {
        match cell.trim().parse::<f64>() {
            Ok(value) => ParamValue::Number(value),
            Err(_) => ParamValue::Text(cell.to_string()),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Number(value) => f.write_str(&crate::data::format_sci(*value)),
            ParamValue::Text(text) => f.write_str(text),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Number(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

/// Settings mapping accepted by [`Device::configure`].
pub type DeviceOptions = BTreeMap<String, ParamValue>;

// =============================================================================
// Device Trait
// =============================================================================

/// Capability contract every instrument driver satisfies.
#[async_trait]
pub trait Device: Send + Sync {
    /// Instrument family of this driver.
    fn kind(&self) -> CapabilityKind;

    /// Establish the connection to the instrument.
    async fn open(&self) -> Result<()>;

    /// Release the connection.
    ///
    /// Must be idempotent and must not fail: drivers log their own close errors.
    async fn close(&self);

    /// Apply device settings (bias, wavelength, setpoint, integration time...).
    async fn configure(&self, options: &DeviceOptions) -> Result<()>;

    /// Acquire one step worth of data. May suspend for the duration of the
    /// physical measurement.
    async fn measure(&self) -> Result<StepData>;

    /// Identification string used to verify that an address hosts the expected
    /// instrument (serial number, `*IDN?` answer).
    async fn identify(&self) -> Result<String> {
        anyhow::bail!("Identification not supported by this device")
    }

    /// Whether the driver offers a device-specific settings interface.
    fn has_interface(&self) -> bool {
        false
    }

    /// Current values of the device-specific settings, when
    /// [`has_interface`](Self::has_interface) is true.
    fn interface_options(&self) -> DeviceOptions {
        DeviceOptions::new()
    }

    /// Abort an operation already started on the hardware (e.g. a triggered sweep).
    async fn abort(&self) -> Result<()> {
        Ok(())
    }
}
