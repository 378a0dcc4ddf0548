//! Device Registry for Runtime Hardware Management
//!
//! The registry is the single source of truth for which instruments exist, how to
//! reach them and which of them are currently checked out by a running batch.
//!
//! - **Descriptors**: static records loaded from configuration (name, kind,
//!   connection, address, verification question/answer)
//! - **Factory catalog**: capability kind → constructor, populated explicitly at
//!   startup instead of importing drivers by name
//! - **Sessions**: live bindings between a descriptor and an open [`Device`]
//!
//! # Exclusivity
//!
//! ```text
//!   open_device("SMU-1") ──lock──> check in-use ──> reserve ──unlock──> factory + open().await
//!                                      │                                     │
//!                                      └──> DeviceBusy                  failure: release
//! ```
//!
//! The in-use check and the reservation happen under one `std::sync::Mutex` guard
//! that is never held across an `.await`, so a second caller racing the handshake
//! observes `DeviceBusy`. Dummy descriptors are never reserved.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use lab_daq::hardware::registry::{DeviceDescriptor, DeviceRegistry};
//! use lab_daq::hardware::{CapabilityKind, ConnectionKind};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = DeviceRegistry::with_builtin();
//!     registry.load(vec![DeviceDescriptor::dummy("SMU-A", CapabilityKind::Smu)])?;
//!
//!     let smu = registry.open_device("SMU-A").await?;
//!     let data = smu.device().measure().await?;
//!     registry.close_device(&smu).await;
//!     Ok(())
//! }
//! ```

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{CapabilityKind, ConnectionKind, Device};
use crate::hardware::mock::DummyDevice;
use crate::hardware::probe::{ConnectionProbe, SerialProbe};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

// =============================================================================
// Descriptors
// =============================================================================

/// Static configuration record identifying one controllable instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Unique key (e.g. "SMU-A", "Lockin SR830")
    pub name: String,
    /// Instrument family
    pub kind: CapabilityKind,
    /// How the host reaches the instrument
    pub connection: ConnectionKind,
    /// Port, VISA resource or serial number, depending on `connection`
    #[serde(default)]
    pub address: String,
    /// Verification question sent to the candidate address
    #[serde(default)]
    pub question: String,
    /// Substring expected in the answer
    #[serde(default)]
    pub answer: String,
    /// Driver/model name, informational
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
}

impl DeviceDescriptor {
    /// Descriptor with empty verification question and answer.
    pub fn new(
        name: impl Into<String>,
        kind: CapabilityKind,
        connection: ConnectionKind,
        address: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            connection,
            address: address.into(),
            question: String::new(),
            answer: String::new(),
            driver: None,
        }
    }

    /// Simulated descriptor.
    pub fn dummy(name: impl Into<String>, kind: CapabilityKind) -> Self {
        Self::new(name, kind, ConnectionKind::Dummy, "")
    }

    /// Set the verification question/answer pair.
    pub fn with_verification(mut self, question: impl Into<String>, answer: impl Into<String>) -> Self {
        self.question = question.into();
        self.answer = answer.into();
        self
    }

    /// Record the driver/model name.
    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }

    /// Whether opening this device checks it out exclusively.
    pub fn is_exclusive(&self) -> bool {
        self.connection.is_exclusive()
    }
}

// =============================================================================
// Sessions
// =============================================================================

/// Identifier of one open session
pub type SessionId = u64;

/// Caller-facing handle to an open device.
///
/// Cloning the handle shares the same session; closing any clone closes it.
#[derive(Clone)]
pub struct DeviceHandle {
    session: SessionId,
    name: String,
    kind: CapabilityKind,
    device: Arc<dyn Device>,
}

impl DeviceHandle {
    /// Identifier of this session.
    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Descriptor name this handle was opened for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capability kind of the device.
    pub fn kind(&self) -> CapabilityKind {
        self.kind
    }

    /// The live device.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("session", &self.session)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Live binding between a descriptor and an open device.
struct DeviceSession {
    name: String,
    exclusive: bool,
    device: Arc<dyn Device>,
    opened_at: DateTime<Local>,
}

/// Summary of an open session, for status displays.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Session identifier
    pub session: SessionId,
    /// Descriptor name
    pub name: String,
    /// Time the session was opened
    pub opened_at: DateTime<Local>,
}

// =============================================================================
// Factory Catalog
// =============================================================================

/// Constructor for the device behind a descriptor.
pub type DeviceFactory =
    Arc<dyn Fn(&DeviceDescriptor) -> anyhow::Result<Arc<dyn Device>> + Send + Sync>;

/// Factory used by [`DeviceRegistry::with_builtin`]: dummies for the `Dummy`
/// connection, an error for anything that needs a real driver.
fn builtin_factory(kind: CapabilityKind) -> DeviceFactory {
    Arc::new(move |descriptor: &DeviceDescriptor| {
        if descriptor.connection == ConnectionKind::Dummy {
            let device: Arc<dyn Device> = Arc::new(DummyDevice::new(kind, descriptor.name.clone()));
            Ok(device)
        } else {
            Err(anyhow::anyhow!(
                "No {} driver registered for {} connections",
                kind,
                descriptor.connection
            ))
        }
    })
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Default)]
struct RegistryState {
    /// Catalog in load order
    descriptors: Vec<DeviceDescriptor>,
    /// Names of checked-out exclusive descriptors
    in_use: HashSet<String>,
    sessions: HashMap<SessionId, DeviceSession>,
}

impl RegistryState {
    fn find(&self, name: &str) -> Option<&DeviceDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut DeviceDescriptor> {
        self.descriptors.iter_mut().find(|d| d.name == name)
    }
}

fn check_unique(descriptors: &[DeviceDescriptor]) -> AppResult<()> {
    let mut names = HashSet::new();
    for descriptor in descriptors {
        if descriptor.name.trim().is_empty() {
            return Err(DaqError::Config("Device descriptor with empty name".into()));
        }
        if !names.insert(descriptor.name.as_str()) {
            return Err(DaqError::Config(format!(
                "Duplicate device name: {}",
                descriptor.name
            )));
        }
    }
    Ok(())
}

/// Default bound on a single verification attempt
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Central registry of device descriptors, factories and open sessions.
///
/// All methods take `&self`; share the registry between tasks with an `Arc`.
pub struct DeviceRegistry {
    state: Mutex<RegistryState>,
    factories: HashMap<CapabilityKind, DeviceFactory>,
    probes: HashMap<ConnectionKind, Arc<dyn ConnectionProbe>>,
    verify_timeout: Duration,
    next_session: AtomicU64,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    /// Create an empty registry with no factories and no probes.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            factories: HashMap::new(),
            probes: HashMap::new(),
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            next_session: AtomicU64::new(1),
        }
    }

    /// Registry with dummy-capable factories for every kind and the serial probe.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for kind in CapabilityKind::ALL {
            registry.register_factory(kind, builtin_factory(kind));
        }
        registry.register_probe(ConnectionKind::Serial, Arc::new(SerialProbe::default()));
        registry
    }

    /// Bound every verification attempt by `timeout`.
    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    /// Install (or replace) the constructor for a capability kind.
    pub fn register_factory(&mut self, kind: CapabilityKind, factory: DeviceFactory) {
        self.factories.insert(kind, factory);
    }

    /// Install (or replace) the verification probe for a connection kind.
    pub fn register_probe(&mut self, connection: ConnectionKind, probe: Arc<dyn ConnectionProbe>) {
        self.probes.insert(connection, probe);
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn instantiate(&self, descriptor: &DeviceDescriptor) -> anyhow::Result<Arc<dyn Device>> {
        let factory = self
            .factories
            .get(&descriptor.kind)
            .ok_or_else(|| anyhow::anyhow!("No factory registered for kind {}", descriptor.kind))?;
        factory(descriptor)
    }

    // -------------------------------------------------------------------------
    // Catalog
    // -------------------------------------------------------------------------

    /// Replace the catalog.
    ///
    /// Fails with `ConfigError` if two descriptors share a name; the previous
    /// catalog is kept in that case. Open sessions are not affected.
    pub fn load(&self, descriptors: Vec<DeviceDescriptor>) -> AppResult<()> {
        check_unique(&descriptors)?;

        let mut state = self.lock();
        if !state.sessions.is_empty() {
            tracing::warn!(
                open_sessions = state.sessions.len(),
                "Reloading device catalog while sessions are open"
            );
        }
        tracing::info!(count = descriptors.len(), "Device catalog loaded");
        state.descriptors = descriptors;
        Ok(())
    }

    /// Snapshot of the catalog in load order.
    pub fn descriptors(&self) -> Vec<DeviceDescriptor> {
        self.lock().descriptors.clone()
    }

    /// Copy of the descriptor called `name`.
    pub fn descriptor(&self, name: &str) -> Option<DeviceDescriptor> {
        self.lock().find(name).cloned()
    }

    /// Whether a descriptor called `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.lock().find(name).is_some()
    }

    /// Number of descriptors.
    pub fn len(&self) -> usize {
        self.lock().descriptors.len()
    }

    /// True when the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().descriptors.is_empty()
    }

    /// Names whose kind is in `kinds`, preserving load order.
    pub fn list_by_kind(&self, kinds: &[CapabilityKind]) -> Vec<String> {
        self.lock()
            .descriptors
            .iter()
            .filter(|d| kinds.contains(&d.kind))
            .map(|d| d.name.clone())
            .collect()
    }

    /// Append a descriptor to the catalog.
    pub fn add_descriptor(&self, descriptor: DeviceDescriptor) -> AppResult<()> {
        let mut state = self.lock();
        let mut candidate = state.descriptors.clone();
        candidate.push(descriptor);
        check_unique(&candidate)?;
        state.descriptors = candidate;
        Ok(())
    }

    /// Remove a descriptor. Refused while it is checked out.
    pub fn remove_descriptor(&self, name: &str) -> AppResult<DeviceDescriptor> {
        let mut state = self.lock();
        if state.in_use.contains(name) {
            return Err(DaqError::DeviceBusy(name.to_string()));
        }
        let index = state
            .descriptors
            .iter()
            .position(|d| d.name == name)
            .ok_or_else(|| DaqError::NotFound(name.to_string()))?;
        Ok(state.descriptors.remove(index))
    }

    /// Rename a descriptor. Refused while it is checked out.
    pub fn rename_descriptor(&self, name: &str, new_name: &str) -> AppResult<()> {
        let mut state = self.lock();
        if state.in_use.contains(name) {
            return Err(DaqError::DeviceBusy(name.to_string()));
        }
        if name != new_name && state.find(new_name).is_some() {
            return Err(DaqError::Config(format!("Duplicate device name: {new_name}")));
        }
        let descriptor = state
            .find_mut(name)
            .ok_or_else(|| DaqError::NotFound(name.to_string()))?;
        descriptor.name = new_name.to_string();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    /// Check out a device.
    ///
    /// # Errors
    ///
    /// - `NotFound` if `name` is not in the catalog
    /// - `DeviceBusy` if a non-Dummy descriptor is already checked out
    /// - `Hardware` if the factory or the device's `open` fails; the reservation
    ///   is released before returning
    pub async fn open_device(&self, name: &str) -> AppResult<DeviceHandle> {
        let descriptor = {
            let mut state = self.lock();
            let descriptor = state
                .find(name)
                .cloned()
                .ok_or_else(|| DaqError::NotFound(name.to_string()))?;
            if descriptor.is_exclusive() && !state.in_use.insert(descriptor.name.clone()) {
                tracing::debug!(device = %name, "Open refused, device busy");
                return Err(DaqError::DeviceBusy(name.to_string()));
            }
            descriptor
        };

        let opened = match self.instantiate(&descriptor) {
            Ok(device) => match device.open().await {
                Ok(()) => Ok(device),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let mut state = self.lock();
        match opened {
            Ok(device) => {
                let session = self.next_session.fetch_add(1, Ordering::SeqCst);
                state.sessions.insert(
                    session,
                    DeviceSession {
                        name: descriptor.name.clone(),
                        exclusive: descriptor.is_exclusive(),
                        device: Arc::clone(&device),
                        opened_at: Local::now(),
                    },
                );
                tracing::info!(
                    device = %descriptor.name,
                    kind = %descriptor.kind,
                    connection = %descriptor.connection,
                    session,
                    "Device opened"
                );
                Ok(DeviceHandle {
                    session,
                    name: descriptor.name,
                    kind: descriptor.kind,
                    device,
                })
            }
            Err(e) => {
                if descriptor.is_exclusive() {
                    state.in_use.remove(&descriptor.name);
                }
                tracing::error!(device = %descriptor.name, error = %e, "Failed to open device");
                Err(DaqError::hardware(&descriptor.name, e))
            }
        }
    }

    /// Release a device.
    ///
    /// Calls the device's `close` and clears its in-use flag. Closing a handle
    /// that is no longer tracked is a no-op.
    pub async fn close_device(&self, handle: &DeviceHandle) {
        let session = {
            let mut state = self.lock();
            let Some(session) = state.sessions.remove(&handle.session) else {
                tracing::debug!(device = %handle.name, session = handle.session, "Close ignored, session not tracked");
                return;
            };
            if session.exclusive {
                state.in_use.remove(&session.name);
            }
            session
        };

        session.device.close().await;
        tracing::info!(device = %session.name, session = handle.session, "Device closed");
    }

    /// Close every open session.
    pub async fn close_all(&self) {
        let sessions: Vec<DeviceSession> = {
            let mut state = self.lock();
            state.in_use.clear();
            state.sessions.drain().map(|(_, session)| session).collect()
        };
        futures::future::join_all(sessions.iter().map(|s| s.device.close())).await;
        tracing::info!(count = sessions.len(), "All devices closed");
    }

    /// Names of checked-out exclusive devices, sorted.
    pub fn busy_devices(&self) -> Vec<String> {
        let mut busy: Vec<String> = self.lock().in_use.iter().cloned().collect();
        busy.sort();
        busy
    }

    /// Whether `name` is checked out.
    pub fn is_busy(&self, name: &str) -> bool {
        self.lock().in_use.contains(name)
    }

    /// Number of open sessions, Dummy sessions included.
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Open sessions ordered by id.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .lock()
            .sessions
            .iter()
            .map(|(id, s)| SessionInfo {
                session: *id,
                name: s.name.clone(),
                opened_at: s.opened_at,
            })
            .collect();
        sessions.sort_by_key(|s| s.session);
        sessions
    }

    // -------------------------------------------------------------------------
    // Verification
    // -------------------------------------------------------------------------

    /// Check that `candidate_address` hosts the instrument `name` describes.
    ///
    /// Returns false on unknown names, checked-out devices, connection errors,
    /// wrong answers and timeouts; never raises. On success the descriptor's
    /// address is updated.
    pub async fn verify(&self, name: &str, candidate_address: &str) -> bool {
        let Some(descriptor) = self.descriptor(name) else {
            tracing::warn!(device = %name, "Cannot verify unknown device");
            return false;
        };
        if self.is_busy(name) {
            tracing::debug!(device = %name, address = %candidate_address, "Device is checked out, not verifying");
            return false;
        }

        let verified = match descriptor.connection {
            ConnectionKind::Dummy => true,
            ConnectionKind::AutoUsb => self.verify_with_driver(&descriptor, candidate_address).await,
            connection => match self.probes.get(&connection) {
                Some(probe) => {
                    let attempt = tokio::time::timeout(
                        self.verify_timeout,
                        probe.query(candidate_address, &descriptor.question, self.verify_timeout),
                    )
                    .await;
                    match attempt {
                        Ok(Ok(response)) => response.contains(&descriptor.answer),
                        Ok(Err(e)) => {
                            tracing::debug!(device = %name, address = %candidate_address, error = %e, "Probe failed");
                            false
                        }
                        Err(_) => {
                            tracing::debug!(device = %name, address = %candidate_address, "Probe timed out");
                            false
                        }
                    }
                }
                None => {
                    tracing::warn!(device = %name, %connection, "No verification probe for connection kind");
                    false
                }
            },
        };

        if verified {
            if let Some(d) = self.lock().find_mut(name) {
                d.address = candidate_address.to_string();
            }
            tracing::info!(device = %name, address = %candidate_address, "Device verified");
        }
        verified
    }

    /// Instantiate a temporary device at `address` and compare its identity.
    async fn verify_with_driver(&self, descriptor: &DeviceDescriptor, address: &str) -> bool {
        let mut temporary = descriptor.clone();
        temporary.address = address.to_string();

        let device = match self.instantiate(&temporary) {
            Ok(device) => device,
            Err(e) => {
                tracing::debug!(device = %descriptor.name, error = %e, "Cannot build device for verification");
                return false;
            }
        };

        let attempt = tokio::time::timeout(self.verify_timeout, async {
            device.open().await?;
            device.identify().await
        })
        .await;

        // Release the temporary connection whatever happened above.
        device.close().await;

        match attempt {
            Ok(Ok(identity)) => identity.contains(&descriptor.answer),
            Ok(Err(e)) => {
                tracing::debug!(device = %descriptor.name, error = %e, "Identification failed");
                false
            }
            Err(_) => {
                tracing::debug!(device = %descriptor.name, "Identification timed out");
                false
            }
        }
    }

    /// Try each candidate address in order; record and return the first that
    /// verifies.
    pub async fn scan(&self, name: &str, candidates: &[String]) -> Option<String> {
        for candidate in candidates {
            if self.verify(name, candidate).await {
                return Some(candidate.clone());
            }
        }
        tracing::warn!(device = %name, tried = candidates.len(), "Port scan found no match");
        None
    }
}
