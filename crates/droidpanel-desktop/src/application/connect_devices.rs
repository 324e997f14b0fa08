//! ConnectionOrchestrator: connect, pair, launch and disconnect use cases.
//!
//! Every user action that creates or ends a debug session goes through the
//! orchestrator.  It owns three pieces of state:
//!
//! - A per-target async lock, so two attempts on the same serial or `ip:port`
//!   run one after the other while attempts on different targets run in
//!   parallel.
//! - The per-target attempt state.
//! - The once-per-process auto-reconnect flag.
//!
//! # Attempt lifecycle (for beginners)
//!
//! ```text
//! Idle  ──►  Connecting  ──►  Connected
//!                 │
//!                 └──► (failure) ──►  Idle
//! ```
//!
//! A failed attempt leaves nothing behind: no connected record, no selection
//! change, no paired record.  The failure is returned to the caller and
//! reported as a [`ConnectionEvent::AttemptFailed`].
//!
//! Progress is published on an `mpsc` channel of [`ConnectionEvent`]s that the
//! binary forwards to the UI.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use droidpanel_core::settings::AppSettings;
use droidpanel_core::{
    ConnectedDevice, DiscoveredUsbDevice, PairedDevice, PairingInputError, PairingMethod,
    PairingQrPayload, PairingRequest, TargetKey,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::poll_sources::RefreshSource;
use super::ports::{BackendError, DeviceBackend, PairedDeviceRepository, PersistenceError};
use super::track_connections::DeviceTracker;

/// Time an emulator gets to register with the backend before the
/// connected-session source is polled again.
pub const EMULATOR_BOOT_GRACE: Duration = Duration::from_secs(3);

/// Name stored for a paired device that reported neither a display name nor a
/// model.
const FALLBACK_DEVICE_NAME: &str = "Android device";

/// Capacity of the event channel.  Events are dropped, not awaited, when the
/// receiver falls behind.
const EVENT_CHANNEL_CAPACITY: usize = 64;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors returned by connection use cases.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("invalid pairing request: {0}")]
    InvalidRequest(#[from] PairingInputError),

    #[error("connecting to {target} timed out after {after_ms} ms")]
    TimedOut { target: String, after_ms: u64 },

    #[error("device {0} is not connected")]
    NotConnected(String),

    #[error("failed to save paired device: {0}")]
    Persistence(#[from] PersistenceError),
}

// ── Attempt state and events ──────────────────────────────────────────────────

/// State of the most recent attempt against one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptState {
    Idle,
    Connecting,
    Connected,
}

/// Result of the startup auto-reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoReconnectOutcome {
    Connected(ConnectedDevice),
    Failed { address: SocketAddr, reason: String },
}

/// Progress reported to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    AttemptStarted {
        target: TargetKey,
    },
    AttemptSucceeded {
        target: TargetKey,
        device: ConnectedDevice,
        /// `true` when the device became the selected device.
        selected: bool,
    },
    AttemptFailed {
        target: TargetKey,
        reason: String,
    },
    DeviceRemoved {
        serial: String,
    },
    EmulatorLaunched {
        image: String,
    },
    AutoReconnect {
        outcome: AutoReconnectOutcome,
    },
}

/// The paired device auto-reconnect should try: the most recently connected,
/// ties broken by the smallest id.
pub fn auto_reconnect_candidate(paired: &[PairedDevice]) -> Option<&PairedDevice> {
    paired.iter().max_by(|a, b| {
        a.last_connected
            .cmp(&b.last_connected)
            .then_with(|| b.id.cmp(&a.id))
    })
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

/// Runs connection attempts against the backend and commits their results.
pub struct ConnectionOrchestrator {
    backend: Arc<dyn DeviceBackend>,
    paired: Arc<dyn PairedDeviceRepository>,
    tracker: Arc<DeviceTracker>,
    /// Re-polled once after an emulator launch.
    connected_source: Arc<dyn RefreshSource>,
    settings: watch::Receiver<AppSettings>,
    target_locks: Mutex<HashMap<TargetKey, Arc<tokio::sync::Mutex<()>>>>,
    attempts: Mutex<HashMap<TargetKey, AttemptState>>,
    auto_reconnect_attempted: AtomicBool,
    events: mpsc::Sender<ConnectionEvent>,
}

impl ConnectionOrchestrator {
    /// Creates an orchestrator and returns it together with the event receiver.
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        paired: Arc<dyn PairedDeviceRepository>,
        tracker: Arc<DeviceTracker>,
        connected_source: Arc<dyn RefreshSource>,
        settings: watch::Receiver<AppSettings>,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let orchestrator = Self {
            backend,
            paired,
            tracker,
            connected_source,
            settings,
            target_locks: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            auto_reconnect_attempted: AtomicBool::new(false),
            events: tx,
        };
        (orchestrator, rx)
    }

    /// State of the latest attempt against `target`.
    pub fn attempt_state(&self, target: &TargetKey) -> AttemptState {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
            .copied()
            .unwrap_or(AttemptState::Idle)
    }

    // ── Use cases ─────────────────────────────────────────────────────────────

    /// Open a session with a USB-discovered device.
    pub async fn connect_usb(
        &self,
        device: &DiscoveredUsbDevice,
    ) -> Result<ConnectedDevice, ConnectionError> {
        let method = &device.connection_method;
        let target = method.target_key();
        let work = async {
            self.bounded(&target, self.backend.connect_usb_device(method))
                .await
        };
        self.run_attempt(target.clone(), work).await
    }

    /// Open a session with a device over Wi-Fi.
    ///
    /// A paired record at the same address has its last-connected time
    /// refreshed.
    pub async fn connect_wireless(
        &self,
        address: SocketAddr,
    ) -> Result<ConnectedDevice, ConnectionError> {
        let target = TargetKey::Address(address);
        let work = async {
            let device = self
                .bounded(
                    &target,
                    self.backend
                        .connect_wireless_device(address.ip(), address.port()),
                )
                .await?;
            self.touch_paired(address).await;
            Ok(device)
        };
        self.run_attempt(target.clone(), work).await
    }

    /// Pair with a device using a six-digit code, remember it, and connect.
    ///
    /// The paired record is stored under the device's connection address
    /// (taken from the returned serial), which usually differs from the
    /// pairing port.  Pairing the same device again updates that record.
    pub async fn pair_wireless(
        &self,
        ip: &str,
        port: u16,
        code: &str,
        display_name: Option<String>,
    ) -> Result<ConnectedDevice, ConnectionError> {
        let request = PairingRequest::new(ip, port, code, display_name)?;
        let pairing_address = request.pairing_address();
        let target = TargetKey::Address(pairing_address);

        let work = async {
            let device = self
                .bounded(
                    &target,
                    self.backend.pair_wireless_device(
                        IpAddr::V4(request.ip),
                        request.port,
                        &request.code,
                    ),
                )
                .await?;

            let address = device
                .serial_no
                .parse::<SocketAddr>()
                .unwrap_or(pairing_address);
            let name = request
                .display_name
                .clone()
                .or_else(|| Some(device.model.trim().to_string()).filter(|m| !m.is_empty()))
                .unwrap_or_else(|| FALLBACK_DEVICE_NAME.to_string());

            let record = self
                .paired
                .upsert_by_address(address, &name, PairingMethod::PairingCode)
                .await
                .map_err(|err| {
                    error!(%address, "failed to save paired device: {err}");
                    err
                })?;
            info!(id = %record.id, %address, name = %record.name, "paired device saved");
            Ok(device)
        };
        self.run_attempt(target.clone(), work).await
    }

    /// Start an emulator image.
    ///
    /// The connected-session source is polled once more after
    /// [`EMULATOR_BOOT_GRACE`] so the booting emulator shows up.
    pub async fn launch_emulator(&self, image: &str) -> Result<(), ConnectionError> {
        let target = TargetKey::Image(image.to_string());
        let lock = self.target_lock(&target);
        let _guard = lock.lock().await;

        if let Err(err) = self.backend.launch_emulator_image(image).await {
            warn!(image, "failed to launch emulator: {err}");
            return Err(err.into());
        }
        info!(image, "emulator launched");
        self.emit(ConnectionEvent::EmulatorLaunched {
            image: image.to_string(),
        });

        let source = Arc::clone(&self.connected_source);
        tokio::spawn(async move {
            tokio::time::sleep(EMULATOR_BOOT_GRACE).await;
            debug!("re-polling connected devices after emulator launch");
            source.refresh_now().await;
        });
        Ok(())
    }

    /// End the session with a connected device and drop it from the
    /// connected set.
    pub async fn disconnect(&self, serial: &str) -> Result<(), ConnectionError> {
        let device = self
            .tracker
            .connected()
            .into_iter()
            .find(|d| d.serial_no == serial)
            .ok_or_else(|| ConnectionError::NotConnected(serial.to_string()))?;

        let target = device.target_key();
        let lock = self.target_lock(&target);
        let _guard = lock.lock().await;

        self.backend.disconnect_device(serial).await?;
        self.tracker.remove(serial);
        self.set_attempt(&target, AttemptState::Idle);
        info!(serial, "device disconnected");
        self.emit(ConnectionEvent::DeviceRemoved {
            serial: serial.to_string(),
        });
        Ok(())
    }

    /// Delete a paired device record.  `false` when `id` is unknown.
    pub async fn forget(&self, id: Uuid) -> Result<bool, ConnectionError> {
        let removed = self.paired.remove(id).await?;
        if removed {
            info!(%id, "paired device forgotten");
        }
        Ok(removed)
    }

    /// Data for the "pair with QR code" dialog.
    pub async fn pairing_qr_payload(&self) -> Result<PairingQrPayload, ConnectionError> {
        Ok(self.backend.pairing_qr_payload().await?)
    }

    /// Reconnect to the most recently used paired device.
    ///
    /// Runs at most once per process, only when `autoReconnectPaired` is on,
    /// `paired` is non-empty and nothing is selected.  Failures are logged and
    /// swallowed.
    pub async fn auto_reconnect(&self, paired: &[PairedDevice]) -> Option<ConnectedDevice> {
        if !self.settings.borrow().devices.auto_reconnect_paired {
            debug!("auto-reconnect disabled");
            return None;
        }
        if paired.is_empty() {
            return None;
        }
        if !self
            .tracker
            .claim_auto_reconnect(&self.auto_reconnect_attempted)
        {
            debug!("auto-reconnect skipped");
            return None;
        }

        let candidate = auto_reconnect_candidate(paired)?;
        let address = candidate.address();
        info!(%address, name = %candidate.name, "auto-reconnecting to paired device");

        match self.connect_wireless(address).await {
            Ok(device) => {
                self.emit(ConnectionEvent::AutoReconnect {
                    outcome: AutoReconnectOutcome::Connected(device.clone()),
                });
                Some(device)
            }
            Err(err) => {
                warn!(%address, "auto-reconnect failed: {err}");
                self.emit(ConnectionEvent::AutoReconnect {
                    outcome: AutoReconnectOutcome::Failed {
                        address,
                        reason: err.to_string(),
                    },
                });
                None
            }
        }
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    /// Run `work` under the target's lock and commit its result.
    async fn run_attempt<F>(
        &self,
        target: TargetKey,
        work: F,
    ) -> Result<ConnectedDevice, ConnectionError>
    where
        F: Future<Output = Result<ConnectedDevice, ConnectionError>>,
    {
        let lock = self.target_lock(&target);
        let _guard = lock.lock().await;

        self.set_attempt(&target, AttemptState::Connecting);
        self.emit(ConnectionEvent::AttemptStarted {
            target: target.clone(),
        });

        match work.await {
            Ok(device) => {
                let selected = self.tracker.commit_connection(&device);
                self.set_attempt(&target, AttemptState::Connected);
                info!(%target, serial = %device.serial_no, selected, "device connected");
                self.emit(ConnectionEvent::AttemptSucceeded {
                    target,
                    device: device.clone(),
                    selected,
                });
                Ok(device)
            }
            Err(err) => {
                self.set_attempt(&target, AttemptState::Idle);
                warn!(%target, "connection attempt failed: {err}");
                self.emit(ConnectionEvent::AttemptFailed {
                    target,
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Bound a backend connect or pair call by `devices.connectionTimeout`.
    async fn bounded<T>(
        &self,
        target: &TargetKey,
        call: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, ConnectionError> {
        let after_ms = u64::from(self.settings.borrow().devices.connection_timeout);
        match tokio::time::timeout(Duration::from_millis(after_ms), call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ConnectionError::TimedOut {
                target: target.to_string(),
                after_ms,
            }),
        }
    }

    async fn touch_paired(&self, address: SocketAddr) {
        let Some(record) = self.paired.find_by_address(address).await else {
            return;
        };
        if let Err(err) = self.paired.touch(record.id).await {
            error!(id = %record.id, %address, "failed to update paired device: {err}");
        }
    }

    fn target_lock(&self, target: &TargetKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .target_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(target.clone()).or_default())
    }

    fn set_attempt(&self, target: &TargetKey, state: AttemptState) {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        match state {
            AttemptState::Idle => {
                attempts.remove(target);
            }
            _ => {
                attempts.insert(target.clone(), state);
            }
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Err(err) = self.events.try_send(event) {
            debug!("connection event dropped: {err}");
        }
    }
}
