//! Traits implemented by the infrastructure layer.
//!
//! The application layer talks to Android tooling only through
//! [`DeviceBackend`] and to persisted paired devices only through
//! [`PairedDeviceRepository`].  Infrastructure implementations drive the `adb`
//! and `emulator` executables and a TOML file; test implementations are
//! generated by `mockall` or scripted in memory.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use async_trait::async_trait;
use droidpanel_core::{
    ConnectedDevice, ConnectionMethod, DiscoveredUsbDevice, DiscoveredWirelessDevice,
    PairedDevice, PairingMethod, PairingQrPayload,
};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

/// Errors reported by a [`DeviceBackend`].
///
/// Cloneable so a failed poll can be stored in a source snapshot.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// A required executable could not be found.
    #[error("{tool} not found; set the Android SDK path or add it to PATH")]
    ToolNotFound { tool: String },

    /// The tool ran but reported a failure.
    #[error("`{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The tool's output did not have the expected shape.
    #[error("could not parse {what}: {message}")]
    Parse { what: String, message: String },

    /// The operation is not available for this device or platform.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Errors raised while persisting a store to disk.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The in-memory state could not be encoded.
    #[error("failed to encode {path}: {message}")]
    Encode { path: PathBuf, message: String },
}

/// Narrow interface to the native Android tooling.
///
/// Every method is a single request; retries, timeouts and caching are the
/// caller's concern.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Devices the backend currently holds a debug session with.
    async fn connected_device_info(&self) -> Result<Vec<ConnectedDevice>, BackendError>;

    async fn list_usb_devices(&self) -> Result<Vec<DiscoveredUsbDevice>, BackendError>;

    async fn list_wireless_devices(&self) -> Result<Vec<DiscoveredWirelessDevice>, BackendError>;

    /// Names of installed emulator images.
    async fn list_emulator_images(&self) -> Result<Vec<String>, BackendError>;

    async fn connect_usb_device(
        &self,
        method: &ConnectionMethod,
    ) -> Result<ConnectedDevice, BackendError>;

    async fn connect_wireless_device(
        &self,
        ip: IpAddr,
        port: u16,
    ) -> Result<ConnectedDevice, BackendError>;

    /// Pair with the device at the *pairing* address and connect to it.
    ///
    /// The returned serial carries the device's connection address, which is
    /// usually a different port from the pairing port.
    async fn pair_wireless_device(
        &self,
        ip: IpAddr,
        port: u16,
        code: &str,
    ) -> Result<ConnectedDevice, BackendError>;

    async fn pairing_qr_payload(&self) -> Result<PairingQrPayload, BackendError>;

    /// Start an emulator image.  Returns once the process has been spawned.
    async fn launch_emulator_image(&self, name: &str) -> Result<(), BackendError>;

    /// End the debug session with a device.
    async fn disconnect_device(&self, serial: &str) -> Result<(), BackendError>;
}

/// Persisted set of trusted wireless devices.
///
/// Implementations keep at most one record per `(ip, port)` and persist every
/// mutation before it becomes visible.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PairedDeviceRepository: Send + Sync {
    async fn list(&self) -> Vec<PairedDevice>;

    async fn find_by_address(&self, address: SocketAddr) -> Option<PairedDevice>;

    /// Insert a record for `address`, or update the name, pairing method and
    /// last-connected time of the existing one.
    async fn upsert_by_address(
        &self,
        address: SocketAddr,
        name: &str,
        method: PairingMethod,
    ) -> Result<PairedDevice, PersistenceError>;

    /// Set a record's last-connected time to now.  `false` when `id` is
    /// unknown.
    async fn touch(&self, id: Uuid) -> Result<bool, PersistenceError>;

    /// Delete a record.  `false` when `id` is unknown.
    async fn remove(&self, id: Uuid) -> Result<bool, PersistenceError>;

    /// Receives the full list after every committed change.
    fn subscribe(&self) -> watch::Receiver<Vec<PairedDevice>>;
}
