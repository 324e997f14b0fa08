//! Command bridge: exposes application-layer operations to the UI.
//!
//! Every command is an `async fn` taking the shared [`AppState`] and
//! returning a [`CommandResult`].  The presentation layer is the only consumer
//! of this module; it must NOT be imported by the application or domain
//! layers.
//!
//! # How commands are invoked (for beginners)
//!
//! The web frontend calls Rust functions by name:
//! ```js
//! const result = await invoke("get_devices");
//! ```
//!
//! The desktop shell routes `"get_devices"` to [`get_devices`], passes it the
//! `AppState`, and serialises the returned value to JSON for the frontend.
//!
//! # Data Transfer Objects (DTOs)
//!
//! Most domain types (`ConnectedDevice`, `UnifiedDeviceEntry`,
//! `PairingQrPayload`) already serialise with camelCase field names and are
//! returned as-is.  The DTOs below cover command *inputs* and the few outputs
//! that have no domain type of their own.
//!
//! # `CommandResult<T>` wrapper
//!
//! All commands return `CommandResult<T>` rather than `Result<T, E>`, so every
//! response has the same shape:
//! `{ success: bool, data: T | null, error: string | null }`.
//! Settings validation failures additionally carry `details`, one entry per
//! offending field, so the form can mark each field.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use droidpanel_core::{
    AppSettings, ConnectedDevice, DiscoveredUsbDevice, FieldError, PairingQrPayload,
    SettingsCategory,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

use crate::application::{
    connect_devices::{ConnectionEvent, ConnectionOrchestrator},
    poll_sources::{RefreshSource, SnapshotStatus, SourceKind, SourcePollers},
    ports::{DeviceBackend, PairedDeviceRepository},
    reconcile_devices::{DeviceListView, DeviceReconciler},
    track_connections::DeviceTracker,
};
use crate::infrastructure::storage::{
    paired_devices::PairedDeviceStore,
    settings::{SettingsError, SettingsStore},
};

// ── Shared application state ──────────────────────────────────────────────────

/// Application state shared between commands.
///
/// Every component is constructed once in [`AppState::start`] and injected
/// into the components that need it; nothing here is a global.
pub struct AppState {
    pub settings: Arc<SettingsStore>,
    pub paired: Arc<PairedDeviceStore>,
    pub tracker: Arc<DeviceTracker>,
    pub pollers: SourcePollers,
    pub orchestrator: ConnectionOrchestrator,
    /// Latest unified device list, published by the reconciler.
    pub devices: watch::Receiver<DeviceListView>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AppState {
    /// Open both stores in `config_dir`, build the pollers, tracker,
    /// reconciler and orchestrator, and start the background tasks.
    ///
    /// `make_backend` receives the live settings so a backend can follow
    /// changes such as the SDK path.  Returns the state together with the
    /// orchestrator's event receiver.
    pub async fn start<F>(
        config_dir: &Path,
        make_backend: F,
    ) -> (Arc<Self>, mpsc::Receiver<ConnectionEvent>)
    where
        F: FnOnce(watch::Receiver<AppSettings>) -> Arc<dyn DeviceBackend>,
    {
        let settings = Arc::new(SettingsStore::open(config_dir).await);
        let paired = Arc::new(PairedDeviceStore::open(config_dir).await);
        let backend = make_backend(settings.subscribe());

        let tracker = Arc::new(DeviceTracker::new());
        let pollers = SourcePollers::new(Arc::clone(&backend), settings.subscribe());
        let (orchestrator, events) = ConnectionOrchestrator::new(
            backend,
            Arc::clone(&paired) as Arc<dyn PairedDeviceRepository>,
            Arc::clone(&tracker),
            Arc::clone(&pollers.connected) as Arc<dyn RefreshSource>,
            settings.subscribe(),
        );
        let (reconciler, devices) = DeviceReconciler::new(
            &pollers,
            Arc::clone(&tracker),
            paired.subscribe(),
            settings.subscribe(),
        );

        let mut tasks = pollers.spawn_schedules();
        tasks.push(tokio::spawn(reconciler.run()));
        info!(dir = %config_dir.display(), "application state started");

        let state = Arc::new(Self {
            settings,
            paired,
            tracker,
            pollers,
            orchestrator,
            devices,
            tasks: Mutex::new(tasks),
        });
        (state, events)
    }

    /// Learn about existing sessions, then run the one-shot auto-reconnect.
    ///
    /// The connected-session probe is folded into the tracker here rather
    /// than left to the reconciler task, so a device already holding a
    /// session is selected before the reconnect decision is taken.
    pub async fn startup_reconnect(&self) -> Option<ConnectedDevice> {
        self.pollers.refresh(SourceKind::Connected).await;
        let sessions = self.pollers.connected.current_snapshot();
        if sessions.is_fresh() {
            let started_at = sessions.started_at.unwrap_or_else(Instant::now);
            self.tracker.ingest_probe_started_at(&sessions.items, started_at);
        }
        let paired = self.paired.list().await;
        self.orchestrator.auto_reconnect(&paired).await
    }

    /// Stop the pollers and the reconciler.
    pub fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in &tasks {
            task.abort();
        }
        info!(count = tasks.len(), "background tasks stopped");
    }
}

// ── Data Transfer Objects (Presentation layer) ────────────────────────────────

/// Input of the "pair with code" form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRequestDto {
    pub ip: String,
    pub port: u16,
    pub code: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Outcome of a manual source refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResultDto {
    pub source: SourceKind,
    /// `pending`, `fresh`, `failed` or `disabled`.
    pub status: String,
    pub error: Option<String>,
}

impl RefreshResultDto {
    fn new(source: SourceKind, status: &SnapshotStatus) -> Self {
        let error = match status {
            SnapshotStatus::Failed(err) => Some(err.source.to_string()),
            _ => None,
        };
        Self {
            source,
            status: status.label().to_string(),
            error,
        }
    }
}

/// Unified response wrapper used by every command.
#[derive(Debug, Serialize)]
pub struct CommandResult<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
}

impl<T: Serialize> CommandResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            details: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
            details: None,
        }
    }

    /// A rejected settings change, with one entry per offending field.
    pub fn invalid(errors: Vec<FieldError>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some("validation failed".to_string()),
            details: Some(errors),
        }
    }

    fn from_settings_error(err: SettingsError) -> Self {
        match err {
            SettingsError::Validation(errors) => Self::invalid(errors),
            other => Self::err(other.to_string()),
        }
    }
}

// ── Device commands ───────────────────────────────────────────────────────────

/// Returns the unified device list with the selected device and the health
/// of every source.
///
/// # Example (frontend)
/// ```ts
/// const view = await invoke<DeviceListView>('get_devices');
/// ```
pub async fn get_devices(state: Arc<AppState>) -> CommandResult<DeviceListView> {
    CommandResult::ok(state.devices.borrow().clone())
}

pub async fn get_selected_device(state: Arc<AppState>) -> CommandResult<Option<ConnectedDevice>> {
    CommandResult::ok(state.tracker.selected())
}

/// Makes a connected device the selected device.
pub async fn select_device(state: Arc<AppState>, serial: String) -> CommandResult<ConnectedDevice> {
    match state.tracker.select(&serial) {
        Ok(device) => CommandResult::ok(device),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

/// Polls one source now, joining a poll already in flight.
pub async fn refresh_source(state: Arc<AppState>, source: String) -> CommandResult<RefreshResultDto> {
    let kind = match SourceKind::from_str(&source) {
        Ok(kind) => kind,
        Err(e) => return CommandResult::err(e.to_string()),
    };
    let status = state.pollers.refresh(kind).await;
    CommandResult::ok(RefreshResultDto::new(kind, &status))
}

/// Connects to a USB device by serial number.
///
/// The device record from the latest USB enumeration is used when present.
pub async fn connect_usb_device(
    state: Arc<AppState>,
    serial: String,
) -> CommandResult<ConnectedDevice> {
    let device = state
        .pollers
        .usb
        .current_snapshot()
        .items
        .into_iter()
        .find(|d| d.identity() == serial)
        .unwrap_or_else(|| DiscoveredUsbDevice::usb(serial, None));
    match state.orchestrator.connect_usb(&device).await {
        Ok(device) => CommandResult::ok(device),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

pub async fn connect_wireless_device(
    state: Arc<AppState>,
    ip: String,
    port: u16,
) -> CommandResult<ConnectedDevice> {
    let ip = match IpAddr::from_str(ip.trim()) {
        Ok(ip) => ip,
        Err(_) => return CommandResult::err(format!("invalid IP address: {ip}")),
    };
    if port == 0 {
        return CommandResult::err("port must be between 1 and 65535");
    }
    match state
        .orchestrator
        .connect_wireless(SocketAddr::new(ip, port))
        .await
    {
        Ok(device) => CommandResult::ok(device),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

/// Pairs with a device using the code shown on its screen, saves it as a
/// paired device and connects.
pub async fn pair_wireless_device(
    state: Arc<AppState>,
    request: PairRequestDto,
) -> CommandResult<ConnectedDevice> {
    match state
        .orchestrator
        .pair_wireless(&request.ip, request.port, &request.code, request.name)
        .await
    {
        Ok(device) => CommandResult::ok(device),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

pub async fn launch_emulator(state: Arc<AppState>, image: String) -> CommandResult<()> {
    match state.orchestrator.launch_emulator(&image).await {
        Ok(()) => CommandResult::ok(()),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

pub async fn disconnect_device(state: Arc<AppState>, serial: String) -> CommandResult<()> {
    match state.orchestrator.disconnect(&serial).await {
        Ok(()) => CommandResult::ok(()),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

/// Removes a paired device.  `data` is `false` when the id was unknown.
pub async fn forget_paired_device(state: Arc<AppState>, id: String) -> CommandResult<bool> {
    let id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(e) => return CommandResult::err(format!("invalid paired device id: {e}")),
    };
    match state.orchestrator.forget(id).await {
        Ok(removed) => CommandResult::ok(removed),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

pub async fn get_pairing_qr_data(state: Arc<AppState>) -> CommandResult<PairingQrPayload> {
    match state.orchestrator.pairing_qr_payload().await {
        Ok(payload) => CommandResult::ok(payload),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

// ── Settings commands ─────────────────────────────────────────────────────────

pub async fn get_settings_category(state: Arc<AppState>, category: String) -> CommandResult<Value> {
    match SettingsCategory::from_str(&category) {
        Ok(category) => CommandResult::ok(state.settings.get_category(category)),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

/// Merges `patch` into one category and persists it.
///
/// On success `data` is the full, updated category.  When validation fails
/// nothing changes and `details` lists every offending field.
pub async fn update_settings_category(
    state: Arc<AppState>,
    category: String,
    patch: Value,
) -> CommandResult<Value> {
    let category = match SettingsCategory::from_str(&category) {
        Ok(category) => category,
        Err(e) => return CommandResult::err(e.to_string()),
    };
    match state.settings.update_category(category, &patch).await {
        Ok(()) => CommandResult::ok(state.settings.get_category(category)),
        Err(e) => CommandResult::from_settings_error(e),
    }
}

/// Checks one form field without saving anything.
pub async fn validate_settings_field(
    state: Arc<AppState>,
    category: String,
    field: String,
    value: Value,
) -> CommandResult<()> {
    let category = match SettingsCategory::from_str(&category) {
        Ok(category) => category,
        Err(e) => return CommandResult::err(e.to_string()),
    };
    match state.settings.validate_field(category, &field, value) {
        Ok(()) => CommandResult::ok(()),
        Err(error) => CommandResult::invalid(vec![error]),
    }
}

pub async fn reset_settings(state: Arc<AppState>) -> CommandResult<()> {
    match state.settings.reset_to_defaults().await {
        Ok(()) => CommandResult::ok(()),
        Err(e) => CommandResult::from_settings_error(e),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::infrastructure::adb::scripted::ScriptedBackend;
    use serde_json::json;

    /// Creates an AppState over a scripted backend and a temporary config
    /// directory, so tests never touch the real platform config.
    async fn make_state(
        backend: Arc<ScriptedBackend>,
    ) -> (Arc<AppState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (state, _events) = AppState::start(dir.path(), |_| backend as Arc<dyn DeviceBackend>).await;
        (state, dir)
    }

    async fn wait_for_view(
        state: &AppState,
        ready: impl FnMut(&DeviceListView) -> bool,
    ) -> DeviceListView {
        let mut rx = state.devices.clone();
        let view = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(ready))
            .await
            .expect("device list never reached the expected state")
            .unwrap()
            .clone();
        view
    }

    #[tokio::test]
    async fn test_connect_usb_device_selects_it_and_lists_it() {
        // Arrange
        let backend = Arc::new(ScriptedBackend::new());
        backend.plug_usb("ABC", "Pixel 6");
        let (state, _dir) = make_state(Arc::clone(&backend)).await;

        // Act
        let result = connect_usb_device(Arc::clone(&state), "ABC".to_string()).await;

        // Assert
        assert!(result.success, "unexpected error: {:?}", result.error);
        assert_eq!(result.data.unwrap().model, "Pixel 6");
        let selected = get_selected_device(Arc::clone(&state)).await;
        assert_eq!(selected.data.unwrap().unwrap().serial_no, "ABC");
        let view = wait_for_view(&state, |v| v.entries.iter().any(|e| e.is_connected)).await;
        assert_eq!(view.selected.unwrap().serial_no, "ABC");
        state.shutdown();
    }

    #[tokio::test]
    async fn test_select_device_rejects_unknown_serial() {
        let (state, _dir) = make_state(Arc::new(ScriptedBackend::new())).await;

        let result = select_device(Arc::clone(&state), "nope".to_string()).await;

        assert!(!result.success);
        assert!(result.error.is_some());
        state.shutdown();
    }

    #[tokio::test]
    async fn test_refresh_source_reports_status() {
        // Arrange
        let backend = Arc::new(ScriptedBackend::new());
        backend.install_image("Pixel_7_API_34");
        let (state, _dir) = make_state(backend).await;

        // Act
        let ok = refresh_source(Arc::clone(&state), "emulator".to_string()).await;
        let bad = refresh_source(Arc::clone(&state), "bluetooth".to_string()).await;

        // Assert
        let dto = ok.data.unwrap();
        assert_eq!(dto.source, SourceKind::Emulator);
        assert_eq!(dto.status, "fresh");
        assert_eq!(dto.error, None);
        assert!(!bad.success);
        state.shutdown();
    }

    #[tokio::test]
    async fn test_pair_wireless_device_saves_paired_record() {
        // Arrange
        let backend = Arc::new(ScriptedBackend::new());
        backend.open_pairing_dialog("10.0.0.5:37000".parse().unwrap(), "123456", 41000, "Pixel 8");
        let (state, _dir) = make_state(backend).await;
        let request = PairRequestDto {
            ip: "10.0.0.5".to_string(),
            port: 37000,
            code: "123456".to_string(),
            name: Some("Desk phone".to_string()),
        };

        // Act
        let result = pair_wireless_device(Arc::clone(&state), request).await;

        // Assert
        assert!(result.success, "unexpected error: {:?}", result.error);
        let paired = state.paired.list().await;
        assert_eq!(paired.len(), 1);
        assert_eq!(paired[0].name, "Desk phone");
        assert_eq!(paired[0].port, 41000);
        state.shutdown();
    }

    #[tokio::test]
    async fn test_pair_wireless_device_rejects_bad_code() {
        let (state, _dir) = make_state(Arc::new(ScriptedBackend::new())).await;
        let request = PairRequestDto {
            ip: "10.0.0.5".to_string(),
            port: 37000,
            code: "12ab".to_string(),
            name: None,
        };

        let result = pair_wireless_device(Arc::clone(&state), request).await;

        assert!(!result.success);
        assert!(state.paired.list().await.is_empty());
        state.shutdown();
    }

    #[tokio::test]
    async fn test_connect_wireless_device_rejects_bad_address() {
        let (state, _dir) = make_state(Arc::new(ScriptedBackend::new())).await;

        let bad_ip = connect_wireless_device(Arc::clone(&state), "10.0.0".to_string(), 5555).await;
        let bad_port = connect_wireless_device(Arc::clone(&state), "10.0.0.5".to_string(), 0).await;

        assert!(!bad_ip.success);
        assert!(!bad_port.success);
        state.shutdown();
    }

    #[tokio::test]
    async fn test_forget_paired_device_validates_id() {
        let (state, _dir) = make_state(Arc::new(ScriptedBackend::new())).await;

        let bad = forget_paired_device(Arc::clone(&state), "not-a-uuid".to_string()).await;
        let unknown = forget_paired_device(Arc::clone(&state), Uuid::new_v4().to_string()).await;

        assert!(!bad.success);
        assert!(unknown.success);
        assert!(!unknown.data.unwrap());
        state.shutdown();
    }

    #[tokio::test]
    async fn test_update_settings_category_reports_field_details() {
        // Arrange
        let (state, _dir) = make_state(Arc::new(ScriptedBackend::new())).await;

        // Act
        let result = update_settings_category(
            Arc::clone(&state),
            "devices".to_string(),
            json!({ "pollingInterval": 999 }),
        )
        .await;

        // Assert
        assert!(!result.success);
        let details = result.details.unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].field, "pollingInterval");
        assert_eq!(state.settings.settings().devices.polling_interval, 3);
        state.shutdown();
    }

    #[tokio::test]
    async fn test_update_settings_category_returns_merged_category() {
        let (state, _dir) = make_state(Arc::new(ScriptedBackend::new())).await;

        let result = update_settings_category(
            Arc::clone(&state),
            "devices".to_string(),
            json!({ "pollingInterval": 10 }),
        )
        .await;

        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["pollingInterval"], json!(10));
        assert!(data.get("showUnpairedDevices").is_some());
        state.shutdown();
    }

    #[tokio::test]
    async fn test_validate_settings_field_and_reset() {
        // Arrange
        let (state, _dir) = make_state(Arc::new(ScriptedBackend::new())).await;
        update_settings_category(
            Arc::clone(&state),
            "devices".to_string(),
            json!({ "pollingInterval": 10 }),
        )
        .await;

        // Act
        let invalid = validate_settings_field(
            Arc::clone(&state),
            "devices".to_string(),
            "pollingInterval".to_string(),
            json!(0),
        )
        .await;
        let reset = reset_settings(Arc::clone(&state)).await;

        // Assert
        assert!(!invalid.success);
        assert_eq!(invalid.details.unwrap()[0].field, "pollingInterval");
        assert!(reset.success);
        assert_eq!(state.settings.settings(), AppSettings::default());
        state.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_settings_category_is_an_error() {
        let (state, _dir) = make_state(Arc::new(ScriptedBackend::new())).await;

        let result = get_settings_category(Arc::clone(&state), "network".to_string()).await;

        assert!(!result.success);
        state.shutdown();
    }

    #[tokio::test]
    async fn test_get_pairing_qr_data_returns_wifi_payload() {
        let (state, _dir) = make_state(Arc::new(ScriptedBackend::new())).await;

        let result = get_pairing_qr_data(Arc::clone(&state)).await;

        assert!(result.data.unwrap().qr_payload.starts_with("WIFI:T:ADB;"));
        state.shutdown();
    }

    #[test]
    fn test_command_result_ok_omits_details() {
        let r: CommandResult<i32> = CommandResult::ok(42);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json, json!({ "success": true, "data": 42, "error": null }));
    }

    #[test]
    fn test_command_result_err_sets_success_false() {
        let r: CommandResult<i32> = CommandResult::err("something went wrong");
        assert!(!r.success);
        assert!(r.data.is_none());
        assert_eq!(r.error.unwrap(), "something went wrong");
    }
}
