//! Source pollers: cached, coalesced, settings-driven device sources.
//!
//! Four independent sources feed the device list:
//!
//! | Source      | Visible when                   | Interval                        | Background polling |
//! |-------------|--------------------------------|---------------------------------|--------------------|
//! | `connected` | always                         | `devices.pollingInterval`       | `devices.autoRefresh` |
//! | `usb`       | `devices.autoDiscoverUSB`      | `devices.pollingInterval`       | `devices.autoRefresh` |
//! | `wireless`  | `devices.autoDiscoverWireless` | `devices.wirelessDiscoveryInterval` | always |
//! | `emulator`  | always                         | `android-sdk.avdRefreshInterval` | always |
//!
//! Each [`SourcePoller`] publishes its latest [`SourceSnapshot`] on a `watch`
//! channel.  At most one fetch per source is ever in flight: a manual
//! [`SourcePoller::refresh`] issued during a fetch waits for that fetch's
//! result (delivered over a `broadcast` channel), and a timer
//! [`SourcePoller::tick`] issued during a fetch is skipped.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use droidpanel_core::settings::AppSettings;
use droidpanel_core::{
    ConnectedDevice, ConnectionMethod, DiscoveredUsbDevice, DiscoveredWirelessDevice,
    EmulatorImage,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::ports::{BackendError, DeviceBackend};

// ── Source identity and policy ────────────────────────────────────────────────

/// The four device sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Connected,
    Usb,
    Wireless,
    Emulator,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::Connected,
        SourceKind::Usb,
        SourceKind::Wireless,
        SourceKind::Emulator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Connected => "connected",
            SourceKind::Usb => "usb",
            SourceKind::Wireless => "wireless",
            SourceKind::Emulator => "emulator",
        }
    }

    /// Only the connected-session source keeps its last good snapshot when a
    /// poll fails; discovery sources fall back to empty.
    fn keeps_snapshot_on_failure(self) -> bool {
        matches!(self, SourceKind::Connected)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a source name is not one of the four sources.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown device source: {0}")]
pub struct UnknownSource(pub String);

impl FromStr for SourceKind {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownSource(s.to_string()))
    }
}

/// Polling policy of one source, derived from the live settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePolicy {
    /// When `false` the snapshot is empty and nothing is polled.
    pub enabled: bool,
    pub interval: Duration,
    /// Timer-driven polling.  Manual refreshes work either way.
    pub background: bool,
}

impl SourcePolicy {
    pub fn for_source(kind: SourceKind, settings: &AppSettings) -> Self {
        let devices = &settings.devices;
        let secs = |s: u32| Duration::from_secs(u64::from(s));
        match kind {
            SourceKind::Connected => Self {
                enabled: true,
                interval: secs(devices.polling_interval),
                background: devices.auto_refresh,
            },
            SourceKind::Usb => Self {
                enabled: devices.auto_discover_usb,
                interval: secs(devices.polling_interval),
                background: devices.auto_refresh,
            },
            SourceKind::Wireless => Self {
                enabled: devices.auto_discover_wireless,
                interval: secs(devices.wireless_discovery_interval),
                background: true,
            },
            SourceKind::Emulator => Self {
                enabled: true,
                interval: secs(settings.android_sdk.avd_refresh_interval),
                background: true,
            },
        }
    }

    pub fn polls_in_background(&self) -> bool {
        self.enabled && self.background
    }
}

// ── Snapshots ─────────────────────────────────────────────────────────────────

/// A failed poll, recorded in the snapshot that followed it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind} source poll failed: {source}")]
pub struct DiscoveryError {
    pub kind: SourceKind,
    #[source]
    pub source: BackendError,
}

/// Outcome of the most recent poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotStatus {
    /// No poll has completed yet.
    Pending,
    Fresh,
    Failed(DiscoveryError),
    /// The source is switched off in settings.
    Disabled,
}

impl SnapshotStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SnapshotStatus::Pending => "pending",
            SnapshotStatus::Fresh => "fresh",
            SnapshotStatus::Failed(_) => "failed",
            SnapshotStatus::Disabled => "disabled",
        }
    }
}

/// The cached result of a source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSnapshot<T> {
    pub items: Vec<T>,
    pub status: SnapshotStatus,
    /// When the last poll finished.
    pub fetched_at: Option<DateTime<Utc>>,
    /// When the last poll was issued to the backend.
    pub started_at: Option<Instant>,
}

impl<T> SourceSnapshot<T> {
    pub fn pending() -> Self {
        Self {
            items: Vec::new(),
            status: SnapshotStatus::Pending,
            fetched_at: None,
            started_at: None,
        }
    }

    fn disabled() -> Self {
        Self {
            items: Vec::new(),
            status: SnapshotStatus::Disabled,
            fetched_at: None,
            started_at: None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.status == SnapshotStatus::Fresh
    }

    /// Items the registry should show; a disabled source shows nothing.
    pub fn visible_items(&self) -> &[T] {
        match self.status {
            SnapshotStatus::Disabled => &[],
            _ => &self.items,
        }
    }
}

impl<T> Default for SourceSnapshot<T> {
    fn default() -> Self {
        Self::pending()
    }
}

// ── Sources ───────────────────────────────────────────────────────────────────

/// A backend query that produces one source's items.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    type Item: Clone + Send + Sync + 'static;

    const KIND: SourceKind;

    async fn fetch(&self) -> Result<Vec<Self::Item>, BackendError>;
}

/// Devices the backend holds a debug session with.
pub struct ConnectedSessionSource {
    backend: Arc<dyn DeviceBackend>,
}

impl ConnectedSessionSource {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl SnapshotSource for ConnectedSessionSource {
    type Item = ConnectedDevice;
    const KIND: SourceKind = SourceKind::Connected;

    async fn fetch(&self) -> Result<Vec<ConnectedDevice>, BackendError> {
        self.backend.connected_device_info().await
    }
}

/// Devices enumerated over USB.
pub struct UsbSource {
    backend: Arc<dyn DeviceBackend>,
}

impl UsbSource {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl SnapshotSource for UsbSource {
    type Item = DiscoveredUsbDevice;
    const KIND: SourceKind = SourceKind::Usb;

    async fn fetch(&self) -> Result<Vec<DiscoveredUsbDevice>, BackendError> {
        let devices = self.backend.list_usb_devices().await?;
        Ok(devices
            .into_iter()
            .filter(|d| matches!(d.connection_method, ConnectionMethod::Usb { .. }))
            .collect())
    }
}

/// Devices advertising wireless debugging on the local network.
pub struct WirelessSource {
    backend: Arc<dyn DeviceBackend>,
}

impl WirelessSource {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl SnapshotSource for WirelessSource {
    type Item = DiscoveredWirelessDevice;
    const KIND: SourceKind = SourceKind::Wireless;

    async fn fetch(&self) -> Result<Vec<DiscoveredWirelessDevice>, BackendError> {
        self.backend.list_wireless_devices().await
    }
}

/// Installed emulator images.
pub struct EmulatorSource {
    backend: Arc<dyn DeviceBackend>,
}

impl EmulatorSource {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl SnapshotSource for EmulatorSource {
    type Item = EmulatorImage;
    const KIND: SourceKind = SourceKind::Emulator;

    async fn fetch(&self) -> Result<Vec<EmulatorImage>, BackendError> {
        let names = self.backend.list_emulator_images().await?;
        Ok(names.into_iter().map(EmulatorImage::new).collect())
    }
}

// ── Poller ────────────────────────────────────────────────────────────────────

type InFlightSlot<T> = Mutex<Option<broadcast::Sender<SourceSnapshot<T>>>>;

/// Something that can be asked to re-poll right now.
#[async_trait]
pub trait RefreshSource: Send + Sync {
    async fn refresh_now(&self);
}

/// Caches one source's snapshot and schedules its polls.
pub struct SourcePoller<S: SnapshotSource> {
    source: S,
    settings: watch::Receiver<AppSettings>,
    snapshot: watch::Sender<SourceSnapshot<S::Item>>,
    in_flight: InFlightSlot<S::Item>,
}

/// Outcome of trying to start a fetch.
enum Attach<'a, T> {
    /// This caller runs the fetch.
    Lead(InFlight<'a, T>),
    /// A fetch is already running; its result arrives on this receiver.
    Follow(broadcast::Receiver<SourceSnapshot<T>>),
}

/// Marks a fetch as in flight until finished or dropped.
struct InFlight<'a, T> {
    slot: &'a InFlightSlot<T>,
    tx: Option<broadcast::Sender<SourceSnapshot<T>>>,
}

impl<T: Clone> InFlight<'_, T> {
    fn finish(mut self, snapshot: SourceSnapshot<T>) {
        self.release();
        if let Some(tx) = self.tx.take() {
            // No receivers simply means nobody attached.
            let _ = tx.send(snapshot);
        }
    }

    fn release(&self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl<T> Drop for InFlight<'_, T> {
    fn drop(&mut self) {
        // A cancelled fetch frees the slot; attached callers see the channel
        // close and fall back to the cached snapshot.
        if self.tx.is_some() {
            *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
        }
    }
}

impl<S: SnapshotSource> SourcePoller<S> {
    pub fn new(source: S, settings: watch::Receiver<AppSettings>) -> Self {
        let (snapshot, _) = watch::channel(SourceSnapshot::pending());
        Self {
            source,
            settings,
            snapshot,
            in_flight: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> SourceKind {
        S::KIND
    }

    /// The policy under the current settings.
    pub fn policy(&self) -> SourcePolicy {
        SourcePolicy::for_source(S::KIND, &self.settings.borrow())
    }

    pub fn current_snapshot(&self) -> SourceSnapshot<S::Item> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SourceSnapshot<S::Item>> {
        self.snapshot.subscribe()
    }

    pub fn is_refreshing(&self) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Poll now, or wait for the poll already in flight.
    pub async fn refresh(&self) -> SourceSnapshot<S::Item> {
        match self.attach() {
            Attach::Lead(in_flight) => self.fetch_and_publish(in_flight).await,
            Attach::Follow(mut rx) => {
                debug!(source = %S::KIND, "attaching to in-flight refresh");
                match rx.recv().await {
                    Ok(snapshot) => snapshot,
                    Err(_) => self.current_snapshot(),
                }
            }
        }
    }

    /// Timer-driven poll.  Returns `None` when skipped because a poll is
    /// already in flight.
    pub async fn tick(&self) -> Option<SourceSnapshot<S::Item>> {
        match self.attach() {
            Attach::Lead(in_flight) => Some(self.fetch_and_publish(in_flight).await),
            Attach::Follow(_) => {
                debug!(source = %S::KIND, "refresh in flight, skipping tick");
                None
            }
        }
    }

    fn attach(&self) -> Attach<'_, S::Item> {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = slot.as_ref() {
            return Attach::Follow(tx.subscribe());
        }
        let (tx, _) = broadcast::channel(1);
        *slot = Some(tx.clone());
        Attach::Lead(InFlight {
            slot: &self.in_flight,
            tx: Some(tx),
        })
    }

    async fn fetch_and_publish(&self, in_flight: InFlight<'_, S::Item>) -> SourceSnapshot<S::Item> {
        let next = if self.policy().enabled {
            let started_at = Instant::now();
            let result = self.source.fetch().await;
            // The source may have been switched off while the poll ran.
            if self.policy().enabled {
                self.snapshot_from(result, started_at)
            } else {
                SourceSnapshot::disabled()
            }
        } else {
            SourceSnapshot::disabled()
        };

        self.snapshot.send_replace(next.clone());
        in_flight.finish(next.clone());
        next
    }

    fn snapshot_from(
        &self,
        result: Result<Vec<S::Item>, BackendError>,
        started_at: Instant,
    ) -> SourceSnapshot<S::Item> {
        let fetched_at = Some(Utc::now());
        let started_at = Some(started_at);
        match result {
            Ok(items) => SourceSnapshot {
                items,
                status: SnapshotStatus::Fresh,
                fetched_at,
                started_at,
            },
            Err(source) => {
                let error = DiscoveryError {
                    kind: S::KIND,
                    source,
                };
                warn!(source = %S::KIND, "{error}");
                let items = if S::KIND.keeps_snapshot_on_failure() {
                    self.snapshot.borrow().items.clone()
                } else {
                    Vec::new()
                };
                SourceSnapshot {
                    items,
                    status: SnapshotStatus::Failed(error),
                    fetched_at,
                    started_at,
                }
            }
        }
    }

    fn mark_disabled(&self) {
        self.snapshot.send_if_modified(|current| {
            if current.status == SnapshotStatus::Disabled {
                false
            } else {
                *current = SourceSnapshot::disabled();
                true
            }
        });
    }

    /// Background polling loop.  Runs until the settings channel closes.
    ///
    /// The policy is re-read every cycle: a disabled source waits for the next
    /// settings change, a newly enabled source polls at once and then every
    /// interval, and an interval change applies from the next cycle.
    pub async fn run_schedule(self: Arc<Self>) {
        let mut settings = self.settings.clone();
        info!(source = %S::KIND, "poll schedule started");

        loop {
            let policy = self.policy();
            if !policy.enabled {
                self.mark_disabled();
                if settings.changed().await.is_err() {
                    break;
                }
                continue;
            }

            let needs_initial_poll = matches!(
                self.snapshot.borrow().status,
                SnapshotStatus::Pending | SnapshotStatus::Disabled
            );
            if needs_initial_poll {
                self.tick().await;
            }

            if !policy.background {
                if settings.changed().await.is_err() {
                    break;
                }
                continue;
            }

            if !self.wait_interval(&mut settings, policy.interval).await {
                break;
            }
        }

        debug!(source = %S::KIND, "poll schedule stopped");
    }

    /// Sleep one interval and tick.  Settings changes that keep background
    /// polling on do not restart the interval.  Returns `false` once the
    /// settings channel has closed.
    async fn wait_interval(
        &self,
        settings: &mut watch::Receiver<AppSettings>,
        interval: Duration,
    ) -> bool {
        let sleep = tokio::time::sleep(interval);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => {
                    self.tick().await;
                    return true;
                }
                changed = settings.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                    if !self.policy().polls_in_background() {
                        return true;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<S: SnapshotSource> RefreshSource for SourcePoller<S> {
    async fn refresh_now(&self) {
        self.refresh().await;
    }
}

// ── All four sources ──────────────────────────────────────────────────────────

/// The four pollers sharing one backend and one settings channel.
pub struct SourcePollers {
    pub connected: Arc<SourcePoller<ConnectedSessionSource>>,
    pub usb: Arc<SourcePoller<UsbSource>>,
    pub wireless: Arc<SourcePoller<WirelessSource>>,
    pub emulator: Arc<SourcePoller<EmulatorSource>>,
}

impl SourcePollers {
    pub fn new(backend: Arc<dyn DeviceBackend>, settings: watch::Receiver<AppSettings>) -> Self {
        Self {
            connected: Arc::new(SourcePoller::new(
                ConnectedSessionSource::new(Arc::clone(&backend)),
                settings.clone(),
            )),
            usb: Arc::new(SourcePoller::new(
                UsbSource::new(Arc::clone(&backend)),
                settings.clone(),
            )),
            wireless: Arc::new(SourcePoller::new(
                WirelessSource::new(Arc::clone(&backend)),
                settings.clone(),
            )),
            emulator: Arc::new(SourcePoller::new(EmulatorSource::new(backend), settings)),
        }
    }

    /// Spawn one schedule task per source.
    pub fn spawn_schedules(&self) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(&self.connected).run_schedule()),
            tokio::spawn(Arc::clone(&self.usb).run_schedule()),
            tokio::spawn(Arc::clone(&self.wireless).run_schedule()),
            tokio::spawn(Arc::clone(&self.emulator).run_schedule()),
        ]
    }

    /// Manually refresh one source and return its resulting status.
    pub async fn refresh(&self, kind: SourceKind) -> SnapshotStatus {
        match kind {
            SourceKind::Connected => self.connected.refresh().await.status,
            SourceKind::Usb => self.usb.refresh().await.status,
            SourceKind::Wireless => self.wireless.refresh().await.status,
            SourceKind::Emulator => self.emulator.refresh().await.status,
        }
    }

    pub fn status(&self, kind: SourceKind) -> SnapshotStatus {
        match kind {
            SourceKind::Connected => self.connected.current_snapshot().status,
            SourceKind::Usb => self.usb.current_snapshot().status,
            SourceKind::Wireless => self.wireless.current_snapshot().status,
            SourceKind::Emulator => self.emulator.current_snapshot().status,
        }
    }
}
