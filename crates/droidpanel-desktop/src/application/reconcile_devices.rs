//! The reconciliation loop that keeps the unified device list current.
//!
//! [`DeviceReconciler::run`] waits on every input channel (the four source
//! snapshots, the paired device list, the connected set and the settings) and
//! after each change:
//!
//! 1. folds a fresh connected-session probe into the [`DeviceTracker`],
//!    dropping USB devices the probe no longer reports,
//! 2. prunes USB devices that a fresh USB enumeration no longer reports,
//! 3. recomputes [`unify`] under the current registry policy,
//! 4. re-applies the selection rules,
//! 5. publishes a [`DeviceListView`] on a `watch` channel.
//!
//! All decisions live in pure functions from `droidpanel-core`; this loop only
//! decides *when* to run them.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use droidpanel_core::settings::AppSettings;
use droidpanel_core::{
    unify, ConnectedDevice, DiscoveredUsbDevice, DiscoveredWirelessDevice, EmulatorImage,
    PairedDevice, RegistryPolicy, UnifiedDeviceEntry,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use super::poll_sources::{SnapshotStatus, SourceKind, SourcePollers, SourceSnapshot};
use super::track_connections::{DeviceTracker, TrackerSnapshot};

/// Health of one source as shown next to the device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatusView {
    pub source: SourceKind,
    /// `pending`, `fresh`, `failed` or `disabled`.
    pub status: String,
    pub error: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl SourceStatusView {
    fn from_snapshot<T>(source: SourceKind, snapshot: &SourceSnapshot<T>) -> Self {
        let error = match &snapshot.status {
            SnapshotStatus::Failed(err) => Some(err.source.to_string()),
            _ => None,
        };
        Self {
            source,
            status: snapshot.status.label().to_string(),
            error,
            last_updated: snapshot.fetched_at,
        }
    }
}

/// Everything the device list screen renders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceListView {
    pub entries: Vec<UnifiedDeviceEntry>,
    pub selected: Option<ConnectedDevice>,
    pub sources: Vec<SourceStatusView>,
}

/// Owns one receiver per input and the output channel.
pub struct DeviceReconciler {
    tracker: Arc<DeviceTracker>,
    connected: watch::Receiver<SourceSnapshot<ConnectedDevice>>,
    usb: watch::Receiver<SourceSnapshot<DiscoveredUsbDevice>>,
    wireless: watch::Receiver<SourceSnapshot<DiscoveredWirelessDevice>>,
    emulator: watch::Receiver<SourceSnapshot<EmulatorImage>>,
    paired: watch::Receiver<Vec<PairedDevice>>,
    settings: watch::Receiver<AppSettings>,
    tracked: watch::Receiver<TrackerSnapshot>,
    view: watch::Sender<DeviceListView>,
}

impl DeviceReconciler {
    /// Build a reconciler and the receiver on which it publishes.
    pub fn new(
        pollers: &SourcePollers,
        tracker: Arc<DeviceTracker>,
        paired: watch::Receiver<Vec<PairedDevice>>,
        settings: watch::Receiver<AppSettings>,
    ) -> (Self, watch::Receiver<DeviceListView>) {
        let (view, view_rx) = watch::channel(DeviceListView::default());
        let tracked = tracker.subscribe();
        let reconciler = Self {
            tracker,
            connected: pollers.connected.subscribe(),
            usb: pollers.usb.subscribe(),
            wireless: pollers.wireless.subscribe(),
            emulator: pollers.emulator.subscribe(),
            paired,
            settings,
            tracked,
            view,
        };
        (reconciler, view_rx)
    }

    /// Fold a connected-session snapshot into the tracker.
    fn ingest_connected(&self, snapshot: &SourceSnapshot<ConnectedDevice>) {
        if !snapshot.is_fresh() {
            return;
        }
        let started_at = snapshot.started_at.unwrap_or_else(Instant::now);
        for removed in self
            .tracker
            .ingest_probe_started_at(&snapshot.items, started_at)
        {
            info!(serial = %removed.serial_no, "USB device no longer attached");
        }
    }

    /// Drop connected USB devices absent from a fresh USB enumeration.
    fn prune_from_usb(&self, snapshot: &SourceSnapshot<DiscoveredUsbDevice>) {
        if !snapshot.is_fresh() {
            return;
        }
        let present: HashSet<String> = snapshot.items.iter().map(|d| d.identity()).collect();
        for removed in self.tracker.prune_usb(&present) {
            info!(serial = %removed.serial_no, "USB device unplugged");
        }
    }

    /// Recompute and publish the view from the latest value of every input.
    pub fn recompute(&self) -> DeviceListView {
        self.tracker.reconcile_selection();
        let tracked = self.tracker.snapshot();

        let settings = self.settings.borrow().clone();
        let policy = RegistryPolicy::from(&settings.devices);
        let usb = self.usb.borrow().clone();
        let wireless = self.wireless.borrow().clone();
        let emulator = self.emulator.borrow().clone();
        let connected_status = self.connected.borrow().clone();
        let paired = self.paired.borrow().clone();

        let entries = unify(
            &tracked.connected,
            usb.visible_items(),
            wireless.visible_items(),
            &paired,
            emulator.visible_items(),
            policy,
        );

        let next = DeviceListView {
            entries,
            selected: tracked.selected,
            sources: vec![
                SourceStatusView::from_snapshot(SourceKind::Connected, &connected_status),
                SourceStatusView::from_snapshot(SourceKind::Usb, &usb),
                SourceStatusView::from_snapshot(SourceKind::Wireless, &wireless),
                SourceStatusView::from_snapshot(SourceKind::Emulator, &emulator),
            ],
        };
        self.view.send_replace(next.clone());
        next
    }

    /// Run until any input channel closes.
    pub async fn run(mut self) {
        info!("device reconciler started");
        let connected = self.connected.borrow_and_update().clone();
        self.ingest_connected(&connected);
        let usb = self.usb.borrow_and_update().clone();
        self.prune_from_usb(&usb);
        self.recompute();

        loop {
            // `changed()` marks the new value as seen; `recompute` reads it.
            tokio::select! {
                changed = self.connected.changed() => {
                    if changed.is_err() { break; }
                    let snapshot = self.connected.borrow().clone();
                    self.ingest_connected(&snapshot);
                }
                changed = self.usb.changed() => {
                    if changed.is_err() { break; }
                    let snapshot = self.usb.borrow().clone();
                    self.prune_from_usb(&snapshot);
                }
                changed = self.wireless.changed() => if changed.is_err() { break },
                changed = self.emulator.changed() => if changed.is_err() { break },
                changed = self.paired.changed() => if changed.is_err() { break },
                changed = self.settings.changed() => if changed.is_err() { break },
                changed = self.tracked.changed() => if changed.is_err() { break },
            }
            let view = self.recompute();
            debug!(entries = view.entries.len(), "device list recomputed");
        }

        info!("device reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::MockDeviceBackend;
    use droidpanel_core::{DeviceCategory, Transport};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn device(serial: &str, model: &str) -> ConnectedDevice {
        ConnectedDevice {
            transport: Transport::Usb,
            serial_no: serial.to_string(),
            model: model.to_string(),
            android_version: "14".to_string(),
            api_level: "34".to_string(),
        }
    }

    fn unpaired(name: &str) -> DiscoveredWirelessDevice {
        DiscoveredWirelessDevice {
            name: name.to_string(),
            fullname: format!("adb-{name}._adb-tls-pairing._tcp"),
            addresses: vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50))],
            port: 40_111,
            is_paired: false,
            is_connected: false,
        }
    }

    struct Harness {
        pollers: SourcePollers,
        tracker: Arc<DeviceTracker>,
        settings_tx: watch::Sender<AppSettings>,
        _paired_tx: watch::Sender<Vec<PairedDevice>>,
        reconciler: DeviceReconciler,
        view: watch::Receiver<DeviceListView>,
    }

    fn harness(backend: MockDeviceBackend, settings: AppSettings) -> Harness {
        let (settings_tx, settings_rx) = watch::channel(settings);
        let (paired_tx, paired_rx) = watch::channel(Vec::new());
        let pollers = SourcePollers::new(Arc::new(backend), settings_rx.clone());
        let tracker = Arc::new(DeviceTracker::new());
        let (reconciler, view) =
            DeviceReconciler::new(&pollers, Arc::clone(&tracker), paired_rx, settings_rx);
        Harness {
            pollers,
            tracker,
            settings_tx,
            _paired_tx: paired_tx,
            reconciler,
            view,
        }
    }

    #[tokio::test]
    async fn test_recompute_lists_connected_devices_and_selects_first() {
        // Arrange
        let h = harness(MockDeviceBackend::new(), AppSettings::default());
        h.tracker.ingest_probe(&[device("B", "Zeta"), device("A", "Alpha")]);

        // Act
        let view = h.reconciler.recompute();

        // Assert
        assert_eq!(view.entries.len(), 2);
        assert_eq!(view.entries[0].display_name, "Alpha");
        assert_eq!(view.selected.clone().map(|d| d.serial_no), Some("A".to_string()));
        assert_eq!(*h.view.borrow(), view);
    }

    #[tokio::test]
    async fn test_fresh_session_list_is_folded_into_tracker() {
        let mut backend = MockDeviceBackend::new();
        backend
            .expect_connected_device_info()
            .returning(|| Ok(vec![device("R58M", "Galaxy")]));
        let h = harness(backend, AppSettings::default());
        h.pollers.refresh(SourceKind::Connected).await;

        h.reconciler
            .ingest_connected(&h.pollers.connected.current_snapshot());

        assert!(h.tracker.is_connected("R58M"));
    }

    #[tokio::test]
    async fn test_fresh_session_list_drops_missing_usb_device() {
        // Arrange: USB discovery off, so only the session poll can notice
        let mut backend = MockDeviceBackend::new();
        backend
            .expect_connected_device_info()
            .returning(|| Ok(Vec::new()));
        let mut settings = AppSettings::default();
        settings.devices.auto_discover_usb = false;
        let h = harness(backend, settings);
        h.tracker.ingest_probe(&[device("ABC", "Pixel")]);
        h.pollers.refresh(SourceKind::Connected).await;

        // Act
        h.reconciler
            .ingest_connected(&h.pollers.connected.current_snapshot());

        // Assert
        assert!(!h.tracker.is_connected("ABC"));
        assert!(h.reconciler.recompute().selected.is_none());
    }

    #[tokio::test]
    async fn test_failed_session_poll_drops_nothing() {
        let mut backend = MockDeviceBackend::new();
        backend.expect_connected_device_info().returning(|| {
            Err(crate::application::ports::BackendError::ToolNotFound {
                tool: "adb".to_string(),
            })
        });
        let h = harness(backend, AppSettings::default());
        h.tracker.ingest_probe(&[device("ABC", "Pixel")]);
        h.pollers.refresh(SourceKind::Connected).await;

        h.reconciler
            .ingest_connected(&h.pollers.connected.current_snapshot());

        assert!(h.tracker.is_connected("ABC"));
    }

    #[tokio::test]
    async fn test_fresh_usb_enumeration_prunes_unplugged_device() {
        let mut backend = MockDeviceBackend::new();
        backend
            .expect_list_usb_devices()
            .returning(|| Ok(vec![DiscoveredUsbDevice::usb("KEEP", None)]));
        let h = harness(backend, AppSettings::default());
        h.tracker.ingest_probe(&[device("KEEP", "Kept"), device("GONE", "Gone")]);
        h.pollers.refresh(SourceKind::Usb).await;

        h.reconciler.prune_from_usb(&h.pollers.usb.current_snapshot());

        assert!(h.tracker.is_connected("KEEP"));
        assert!(!h.tracker.is_connected("GONE"));
    }

    #[tokio::test]
    async fn test_failed_usb_enumeration_prunes_nothing() {
        let mut backend = MockDeviceBackend::new();
        backend.expect_list_usb_devices().returning(|| {
            Err(crate::application::ports::BackendError::ToolNotFound {
                tool: "adb".to_string(),
            })
        });
        let h = harness(backend, AppSettings::default());
        h.tracker.ingest_probe(&[device("A", "Alpha")]);
        h.pollers.refresh(SourceKind::Usb).await;

        h.reconciler.prune_from_usb(&h.pollers.usb.current_snapshot());

        assert!(h.tracker.is_connected("A"));
        let view = h.reconciler.recompute();
        let usb_status = view
            .sources
            .iter()
            .find(|s| s.source == SourceKind::Usb)
            .unwrap();
        assert_eq!(usb_status.status, "failed");
        assert!(usb_status.error.as_deref().unwrap().contains("adb"));
    }

    #[tokio::test]
    async fn test_show_unpaired_toggle_is_applied_on_recompute() {
        let mut backend = MockDeviceBackend::new();
        backend
            .expect_list_wireless_devices()
            .returning(|| Ok(vec![unpaired("Pixel")]));
        let mut settings = AppSettings::default();
        settings.devices.auto_discover_wireless = true;
        settings.devices.show_unpaired_devices = true;
        let h = harness(backend, settings.clone());
        h.pollers.refresh(SourceKind::Wireless).await;

        let shown = h.reconciler.recompute();
        settings.devices.show_unpaired_devices = false;
        h.settings_tx.send_replace(settings);
        let hidden = h.reconciler.recompute();

        assert!(shown
            .entries
            .iter()
            .any(|e| e.category == DeviceCategory::Wireless));
        assert!(hidden.entries.is_empty());
    }

    #[tokio::test]
    async fn test_run_publishes_after_tracker_change() {
        // Arrange
        let h = harness(MockDeviceBackend::new(), AppSettings::default());
        let mut view = h.view.clone();
        let tracker = Arc::clone(&h.tracker);
        let handle = tokio::spawn(h.reconciler.run());

        // Act
        tracker.commit_connection(&device("A", "Alpha"));
        let published = tokio::time::timeout(
            Duration::from_secs(5),
            view.wait_for(|v| v.selected.is_some()),
        )
        .await
        .expect("view published in time")
        .unwrap()
        .clone();

        // Assert
        assert_eq!(published.entries[0].id, "connected:A");
        handle.abort();
    }
}
