//! Instruments and their catalog.
//!
//! Devices are described by capability (what they measure) and connection
//! (how they are reached). The [`registry::DeviceRegistry`] owns the catalog and
//! hands out exclusive sessions; drivers implement [`capabilities::Device`].

pub mod capabilities;
pub mod mock;
pub mod probe;
pub mod registry;

pub use capabilities::{CapabilityKind, ConnectionKind, Device, DeviceOptions, ParamValue};
pub use mock::DummyDevice;
pub use probe::{ConnectionProbe, SerialProbe};
pub use registry::{DeviceDescriptor, DeviceHandle, DeviceRegistry};
