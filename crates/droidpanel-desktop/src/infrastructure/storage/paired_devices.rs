//! PairedDeviceStore: trusted wireless devices remembered across restarts.
//!
//! # File format
//!
//! ```toml
//! [[devices]]
//! id = "5b0f6c2e-8d0e-4c55-9a4e-3f1c2b7d9e10"
//! name = "Pixel 8"
//! ip = "192.168.1.20"
//! port = 41234
//! lastConnected = 1718000000000
//! pairingMethod = "pairing-code"
//! ```
//!
//! At most one record exists per `(ip, port)`.  A file holding duplicates keeps
//! the first record for each address.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use droidpanel_core::{PairedDevice, PairingMethod};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{read_optional, write_atomically, StoreError, PAIRED_DEVICES_FILE};
use crate::application::ports::{PairedDeviceRepository, PersistenceError};

/// On-disk layout of `paired-devices.toml`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PairedDevicesFile {
    #[serde(default)]
    devices: Vec<PairedDevice>,
}

/// File-backed [`PairedDeviceRepository`].
pub struct PairedDeviceStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles across the persist.
    write_lock: tokio::sync::Mutex<()>,
    current: watch::Sender<Vec<PairedDevice>>,
}

impl PairedDeviceStore {
    /// Opens the store backed by `paired-devices.toml` inside `dir`.
    pub async fn open(dir: &Path) -> Self {
        Self::load(dir.join(PAIRED_DEVICES_FILE)).await
    }

    /// Loads the list at `path`; an absent or invalid file yields an empty
    /// list.
    pub async fn load(path: PathBuf) -> Self {
        let devices = match read_list(&path).await {
            Ok(devices) => devices,
            Err(err) => {
                warn!("{err}; starting with no paired devices");
                Vec::new()
            }
        };
        info!(count = devices.len(), "paired devices loaded");
        let (current, _) = watch::channel(devices);
        Self {
            path,
            write_lock: tokio::sync::Mutex::new(()),
            current,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `next` and, once written, make it the live list.
    async fn commit(&self, next: Vec<PairedDevice>) -> Result<(), PersistenceError> {
        let file = PairedDevicesFile { devices: next };
        let content = toml::to_string_pretty(&file).map_err(|e| PersistenceError::Encode {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        if let Err(err) = write_atomically(&self.path, &content).await {
            error!("failed to save paired devices: {err}");
            return Err(err);
        }
        self.current.send_replace(file.devices);
        Ok(())
    }

    fn snapshot(&self) -> Vec<PairedDevice> {
        self.current.borrow().clone()
    }
}

#[async_trait]
impl PairedDeviceRepository for PairedDeviceStore {
    async fn list(&self) -> Vec<PairedDevice> {
        self.snapshot()
    }

    async fn find_by_address(&self, address: SocketAddr) -> Option<PairedDevice> {
        self.current
            .borrow()
            .iter()
            .find(|d| d.address() == address)
            .cloned()
    }

    async fn upsert_by_address(
        &self,
        address: SocketAddr,
        name: &str,
        method: PairingMethod,
    ) -> Result<PairedDevice, PersistenceError> {
        let _guard = self.write_lock.lock().await;
        let now = now_ms();
        let mut next = self.snapshot();

        let record = match next.iter_mut().find(|d| d.address() == address) {
            Some(existing) => {
                existing.name = name.to_string();
                existing.pairing_method = method;
                existing.last_connected = now;
                existing.clone()
            }
            None => {
                let record = PairedDevice::new(name, address, method, now);
                next.push(record.clone());
                record
            }
        };

        self.commit(next).await?;
        debug!(id = %record.id, %address, "paired device upserted");
        Ok(record)
    }

    async fn touch(&self, id: Uuid) -> Result<bool, PersistenceError> {
        let _guard = self.write_lock.lock().await;
        let mut next = self.snapshot();
        let Some(record) = next.iter_mut().find(|d| d.id == id) else {
            return Ok(false);
        };
        record.last_connected = now_ms();
        self.commit(next).await?;
        Ok(true)
    }

    async fn remove(&self, id: Uuid) -> Result<bool, PersistenceError> {
        let _guard = self.write_lock.lock().await;
        let mut next = self.snapshot();
        let before = next.len();
        next.retain(|d| d.id != id);
        if next.len() == before {
            return Ok(false);
        }
        self.commit(next).await?;
        Ok(true)
    }

    fn subscribe(&self) -> watch::Receiver<Vec<PairedDevice>> {
        self.current.subscribe()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn read_list(path: &Path) -> Result<Vec<PairedDevice>, StoreError> {
    let Some(content) = read_optional(path).await? else {
        return Ok(Vec::new());
    };
    let file: PairedDevicesFile = toml::from_str(&content).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(dedupe_by_address(file.devices))
}

/// Keep the first record for each `(ip, port)`.
fn dedupe_by_address(devices: Vec<PairedDevice>) -> Vec<PairedDevice> {
    let mut seen = HashSet::new();
    devices
        .into_iter()
        .filter(|d| {
            let first = seen.insert(d.address());
            if !first {
                warn!(address = %d.address(), id = %d.id, "dropping duplicate paired device");
            }
            first
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_missing_file_yields_empty_list() {
        let dir = tempfile::tempdir().unwrap();

        let store = PairedDeviceStore::open(dir.path()).await;

        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_file_yields_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PAIRED_DEVICES_FILE), "devices = 3").unwrap();

        let store = PairedDeviceStore::open(dir.path()).await;

        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_twice_keeps_one_record_and_updates_it() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let store = PairedDeviceStore::open(dir.path()).await;
        let first = store
            .upsert_by_address(addr("192.168.1.20:41234"), "Pixel", PairingMethod::PairingCode)
            .await
            .unwrap();

        // Act
        let second = store
            .upsert_by_address(addr("192.168.1.20:41234"), "Pixel 8", PairingMethod::QrCode)
            .await
            .unwrap();

        // Assert
        let list = store.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(second.id, first.id);
        assert_eq!(list[0].name, "Pixel 8");
        assert_eq!(list[0].pairing_method, PairingMethod::QrCode);
        assert!(list[0].last_connected >= first.last_connected);
    }

    #[tokio::test]
    async fn test_same_ip_different_port_is_a_different_device() {
        let dir = tempfile::tempdir().unwrap();
        let store = PairedDeviceStore::open(dir.path()).await;

        store
            .upsert_by_address(addr("192.168.1.20:5555"), "A", PairingMethod::PairingCode)
            .await
            .unwrap();
        store
            .upsert_by_address(addr("192.168.1.20:5556"), "B", PairingMethod::PairingCode)
            .await
            .unwrap();

        assert_eq!(store.list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_records_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = PairedDeviceStore::open(dir.path()).await;
        let saved = store
            .upsert_by_address(addr("10.0.0.7:5555"), "Desk", PairingMethod::PairingCode)
            .await
            .unwrap();

        let reloaded = PairedDeviceStore::open(dir.path()).await;

        assert_eq!(reloaded.list().await, vec![saved]);
    }

    #[tokio::test]
    async fn test_duplicate_addresses_in_file_keep_first() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let a = PairedDevice::new("First", addr("10.0.0.7:5555"), PairingMethod::QrCode, 1);
        let b = PairedDevice::new("Second", addr("10.0.0.7:5555"), PairingMethod::QrCode, 2);
        let content = toml::to_string_pretty(&PairedDevicesFile {
            devices: vec![a.clone(), b],
        })
        .unwrap();
        std::fs::write(dir.path().join(PAIRED_DEVICES_FILE), content).unwrap();

        // Act
        let store = PairedDeviceStore::open(dir.path()).await;

        // Assert
        assert_eq!(store.list().await, vec![a]);
    }

    #[tokio::test]
    async fn test_touch_and_remove_report_unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = PairedDeviceStore::open(dir.path()).await;

        assert!(!store.touch(Uuid::new_v4()).await.unwrap());
        assert!(!store.remove(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn test_touch_updates_last_connected() {
        let dir = tempfile::tempdir().unwrap();
        let store = PairedDeviceStore::open(dir.path()).await;
        let record = store
            .upsert_by_address(addr("10.0.0.7:5555"), "Desk", PairingMethod::PairingCode)
            .await
            .unwrap();

        assert!(store.touch(record.id).await.unwrap());

        let found = store.find_by_address(addr("10.0.0.7:5555")).await.unwrap();
        assert!(found.last_connected >= record.last_connected);
    }

    #[tokio::test]
    async fn test_remove_notifies_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let store = PairedDeviceStore::open(dir.path()).await;
        let record = store
            .upsert_by_address(addr("10.0.0.7:5555"), "Desk", PairingMethod::PairingCode)
            .await
            .unwrap();
        let mut rx = store.subscribe();

        assert!(store.remove(record.id).await.unwrap());

        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_unchanged() {
        // Arrange: the store's directory is a regular file.
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let store = PairedDeviceStore::load(blocker.join(PAIRED_DEVICES_FILE)).await;

        // Act
        let result = store
            .upsert_by_address(addr("10.0.0.7:5555"), "Desk", PairingMethod::PairingCode)
            .await;

        // Assert
        assert!(result.is_err());
        assert!(store.list().await.is_empty());
    }
}
