//! Deterministic in-memory backend for tests and the `--scripted` demo mode.
//!
//! A [`ScriptedBackend`] holds a small simulated world: devices plugged in
//! over USB, devices advertising wireless debugging, addresses that accept a
//! connection, open pairing dialogs and installed emulator images.  Trait
//! calls act on that world the way the real tools would, and tests can
//! inject one-shot failures or per-operation latency.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use droidpanel_core::{
    ConnectedDevice, ConnectionMethod, DiscoveredUsbDevice, DiscoveredWirelessDevice,
    EmulatorImage, PairingQrPayload, QrCredentials, Transport,
};

use super::DEFAULT_CONNECT_PORT;
use crate::application::ports::{BackendError, DeviceBackend};

/// First console port handed to a launched emulator, as the real emulator
/// does.
const FIRST_EMULATOR_PORT: u16 = 5554;

/// Backend operations that can be scripted to fail or to take time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    ConnectedInfo,
    ListUsb,
    ListWireless,
    ListImages,
    ConnectUsb,
    ConnectWireless,
    Pair,
    QrPayload,
    LaunchEmulator,
    Disconnect,
}

/// An open pairing dialog on a simulated device.
#[derive(Debug, Clone)]
struct PairingDialog {
    code: String,
    connect_port: u16,
    model: String,
}

#[derive(Debug, Default)]
struct World {
    sessions: Vec<ConnectedDevice>,
    usb: Vec<DiscoveredUsbDevice>,
    wireless: Vec<DiscoveredWirelessDevice>,
    images: Vec<String>,
    /// Addresses accepting `connect`, with the model reported once connected.
    reachable: HashMap<SocketAddr, String>,
    pairing: HashMap<SocketAddr, PairingDialog>,
    launched: Vec<String>,
    failures: HashMap<BackendOp, BackendError>,
    latency: HashMap<BackendOp, Duration>,
    calls: HashMap<BackendOp, usize>,
}

impl World {
    fn open_session(&mut self, device: ConnectedDevice) -> ConnectedDevice {
        self.sessions.retain(|d| d.serial_no != device.serial_no);
        self.sessions.push(device.clone());
        device
    }
}

/// Scripted [`DeviceBackend`].
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    world: Mutex<World>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A small world for the demo mode: one phone on USB, one paired phone on
    /// the network, one phone with its pairing dialog open, and two emulator
    /// images.
    pub fn demo() -> Self {
        let backend = Self::new();
        backend.plug_usb("R5CT1234ABC", "Galaxy S21");
        backend.advertise_wireless(advertisement(
            "adb-2B1C0D-Pixel",
            "_adb-tls-connect._tcp",
            socket("192.168.1.20", 41234),
            true,
        ));
        backend.accept_connections(socket("192.168.1.20", 41234), "Pixel 8");
        backend.advertise_wireless(advertisement(
            "adb-9F8E7D-Tab",
            "_adb-tls-pairing._tcp",
            socket("192.168.1.31", 37891),
            false,
        ));
        backend.open_pairing_dialog(socket("192.168.1.31", 37891), "123456", 40123, "Galaxy Tab");
        backend.install_image("Pixel_7_API_34");
        backend.install_image("Tablet_API_33");
        backend
    }

    fn world(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Scripting the world ───────────────────────────────────────────────────

    pub fn plug_usb(&self, serial: &str, model: &str) {
        let mut world = self.world();
        world.usb.retain(|d| d.identity() != serial);
        world
            .usb
            .push(DiscoveredUsbDevice::usb(serial, Some(model.to_string())));
    }

    /// Remove a USB device and end its session, as pulling the cable would.
    pub fn unplug_usb(&self, serial: &str) {
        let mut world = self.world();
        world.usb.retain(|d| d.identity() != serial);
        world
            .sessions
            .retain(|d| !(d.transport == Transport::Usb && d.serial_no == serial));
    }

    pub fn advertise_wireless(&self, device: DiscoveredWirelessDevice) {
        self.world().wireless.push(device);
    }

    pub fn accept_connections(&self, address: SocketAddr, model: &str) {
        self.world().reachable.insert(address, model.to_string());
    }

    /// Simulate the device's "pair with code" dialog at `pairing_address`.
    /// A successful pairing makes the device reachable on `connect_port`.
    pub fn open_pairing_dialog(
        &self,
        pairing_address: SocketAddr,
        code: &str,
        connect_port: u16,
        model: &str,
    ) {
        self.world().pairing.insert(
            pairing_address,
            PairingDialog {
                code: code.to_string(),
                connect_port,
                model: model.to_string(),
            },
        );
    }

    pub fn install_image(&self, name: &str) {
        self.world().images.push(name.to_string());
    }

    /// Start with an existing debug session.
    pub fn add_session(&self, device: ConnectedDevice) {
        self.world().open_session(device);
    }

    /// Make the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: BackendOp, error: BackendError) {
        self.world().failures.insert(op, error);
    }

    /// Make every call of `op` take `delay` before answering.
    pub fn set_latency(&self, op: BackendOp, delay: Duration) {
        self.world().latency.insert(op, delay);
    }

    // ── Inspection ────────────────────────────────────────────────────────────

    pub fn calls(&self, op: BackendOp) -> usize {
        self.world().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn sessions(&self) -> Vec<ConnectedDevice> {
        self.world().sessions.clone()
    }

    pub fn launched_images(&self) -> Vec<String> {
        self.world().launched.clone()
    }

    /// Count the call, apply latency and take a scripted failure.
    async fn begin(&self, op: BackendOp) -> Result<(), BackendError> {
        let delay = {
            let mut world = self.world();
            *world.calls.entry(op).or_insert(0) += 1;
            world.latency.get(&op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.world().failures.remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn connect_address(&self, address: SocketAddr) -> Result<ConnectedDevice, BackendError> {
        let mut world = self.world();
        let model = world
            .reachable
            .get(&address)
            .cloned()
            .ok_or_else(|| BackendError::CommandFailed {
                command: format!("adb connect {address}"),
                message: format!("failed to connect to {address}"),
            })?;
        Ok(world.open_session(ConnectedDevice {
            transport: Transport::Tcp,
            serial_no: address.to_string(),
            model,
            android_version: "14".to_string(),
            api_level: "34".to_string(),
        }))
    }
}

#[async_trait]
impl DeviceBackend for ScriptedBackend {
    async fn connected_device_info(&self) -> Result<Vec<ConnectedDevice>, BackendError> {
        self.begin(BackendOp::ConnectedInfo).await?;
        Ok(self.sessions())
    }

    async fn list_usb_devices(&self) -> Result<Vec<DiscoveredUsbDevice>, BackendError> {
        self.begin(BackendOp::ListUsb).await?;
        let world = self.world();
        Ok(world
            .usb
            .iter()
            .cloned()
            .map(|mut d| {
                d.is_connected = world.sessions.iter().any(|s| s.serial_no == d.identity());
                d
            })
            .collect())
    }

    async fn list_wireless_devices(&self) -> Result<Vec<DiscoveredWirelessDevice>, BackendError> {
        self.begin(BackendOp::ListWireless).await?;
        let world = self.world();
        Ok(world
            .wireless
            .iter()
            .cloned()
            .map(|mut d| {
                d.is_connected = world.sessions.iter().any(|s| s.serial_no == d.identity());
                d
            })
            .collect())
    }

    async fn list_emulator_images(&self) -> Result<Vec<String>, BackendError> {
        self.begin(BackendOp::ListImages).await?;
        Ok(self.world().images.clone())
    }

    async fn connect_usb_device(
        &self,
        method: &ConnectionMethod,
    ) -> Result<ConnectedDevice, BackendError> {
        self.begin(BackendOp::ConnectUsb).await?;
        let serial = match method {
            ConnectionMethod::Usb { serial_number } => serial_number,
            ConnectionMethod::Tcp { socket_address } => {
                return self.connect_address(*socket_address);
            }
        };

        let mut world = self.world();
        let plugged = world
            .usb
            .iter()
            .find(|d| &d.identity() == serial)
            .cloned()
            .ok_or_else(|| BackendError::CommandFailed {
                command: "adb devices -l".to_string(),
                message: format!("device {serial} is not attached"),
            })?;
        Ok(world.open_session(ConnectedDevice {
            transport: Transport::Usb,
            serial_no: serial.clone(),
            model: plugged.model.unwrap_or_default(),
            android_version: "14".to_string(),
            api_level: "34".to_string(),
        }))
    }

    async fn connect_wireless_device(
        &self,
        ip: IpAddr,
        port: u16,
    ) -> Result<ConnectedDevice, BackendError> {
        self.begin(BackendOp::ConnectWireless).await?;
        self.connect_address(SocketAddr::new(ip, port))
    }

    async fn pair_wireless_device(
        &self,
        ip: IpAddr,
        port: u16,
        code: &str,
    ) -> Result<ConnectedDevice, BackendError> {
        self.begin(BackendOp::Pair).await?;
        let pairing_address = SocketAddr::new(ip, port);
        let command = format!("adb pair {pairing_address}");
        let connect_address = {
            let mut world = self.world();
            let dialog = world
                .pairing
                .get(&pairing_address)
                .cloned()
                .ok_or_else(|| BackendError::CommandFailed {
                    command: command.clone(),
                    message: format!("unable to connect to {pairing_address}"),
                })?;
            if dialog.code != code {
                return Err(BackendError::CommandFailed {
                    command,
                    message: "Failed: Wrong password or connection was dropped.".to_string(),
                });
            }
            let connect_address = SocketAddr::new(ip, dialog.connect_port);
            world.reachable.insert(connect_address, dialog.model);
            connect_address
        };
        self.connect_address(connect_address)
    }

    async fn pairing_qr_payload(&self) -> Result<PairingQrPayload, BackendError> {
        self.begin(BackendOp::QrPayload).await?;
        let credentials = QrCredentials {
            service_name: "droidpanel-script".to_string(),
            password: "scripted00".to_string(),
        };
        Ok(PairingQrPayload {
            ip: "192.168.1.2".to_string(),
            port: DEFAULT_CONNECT_PORT,
            qr_payload: credentials.qr_string(),
        })
    }

    /// A launched image shows up as an emulator session right away; callers
    /// only see it on their next connected-session probe.
    async fn launch_emulator_image(&self, name: &str) -> Result<(), BackendError> {
        self.begin(BackendOp::LaunchEmulator).await?;
        let mut world = self.world();
        if !world.images.iter().any(|image| image == name) {
            return Err(BackendError::CommandFailed {
                command: format!("emulator -avd {name}"),
                message: format!("unknown AVD name [{name}]"),
            });
        }
        // Console ports come in pairs: 5554, 5556, ...
        let console_port = FIRST_EMULATOR_PORT + 2 * world.launched.len() as u16;
        world.launched.push(name.to_string());
        world.open_session(ConnectedDevice {
            transport: Transport::Tcp,
            serial_no: format!("emulator-{console_port}"),
            model: EmulatorImage::new(name).display_name(),
            android_version: String::new(),
            api_level: EmulatorImage::new(name)
                .api_level()
                .map(|level| level.to_string())
                .unwrap_or_default(),
        });
        Ok(())
    }

    async fn disconnect_device(&self, serial: &str) -> Result<(), BackendError> {
        self.begin(BackendOp::Disconnect).await?;
        let mut world = self.world();
        let session = world
            .sessions
            .iter()
            .find(|d| d.serial_no == serial)
            .cloned()
            .ok_or_else(|| BackendError::CommandFailed {
                command: format!("adb disconnect {serial}"),
                message: format!("error: no such device '{serial}'"),
            })?;
        if session.transport == Transport::Usb {
            return Err(BackendError::Unsupported(format!(
                "USB session {serial} ends when the cable is unplugged"
            )));
        }
        world.sessions.retain(|d| d.serial_no != serial);
        Ok(())
    }
}

/// Wireless advertisement with a single IPv4 address.
pub fn advertisement(
    instance: &str,
    service: &str,
    address: SocketAddr,
    is_paired: bool,
) -> DiscoveredWirelessDevice {
    DiscoveredWirelessDevice {
        name: instance.to_string(),
        fullname: format!("{instance}.{service}"),
        addresses: vec![address.ip()],
        port: address.port(),
        is_paired,
        is_connected: false,
    }
}

fn socket(ip: &str, port: u16) -> SocketAddr {
    SocketAddr::new(ip.parse().unwrap_or(IpAddr::from([127, 0, 0, 1])), port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_usb_connect_opens_session_and_marks_device_connected() {
        // Arrange
        let backend = ScriptedBackend::new();
        backend.plug_usb("ABC", "Pixel 6");
        let method = ConnectionMethod::Usb {
            serial_number: "ABC".to_string(),
        };

        // Act
        let device = backend.connect_usb_device(&method).await.unwrap();

        // Assert
        assert_eq!(device.serial_no, "ABC");
        assert_eq!(device.model, "Pixel 6");
        assert_eq!(device.transport, Transport::Usb);
        let usb = backend.list_usb_devices().await.unwrap();
        assert!(usb[0].is_connected);
        assert_eq!(backend.connected_device_info().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_usb_connect_to_absent_device_fails() {
        let backend = ScriptedBackend::new();
        let method = ConnectionMethod::Usb {
            serial_number: "GONE".to_string(),
        };

        let err = backend.connect_usb_device(&method).await.unwrap_err();

        assert!(matches!(err, BackendError::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn test_unplug_ends_usb_session() {
        let backend = ScriptedBackend::new();
        backend.plug_usb("ABC", "Pixel 6");
        backend
            .connect_usb_device(&ConnectionMethod::Usb {
                serial_number: "ABC".to_string(),
            })
            .await
            .unwrap();

        backend.unplug_usb("ABC");

        assert!(backend.list_usb_devices().await.unwrap().is_empty());
        assert!(backend.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_pairing_with_right_code_connects_on_connect_port() {
        // Arrange
        let backend = ScriptedBackend::new();
        backend.open_pairing_dialog(addr("10.0.0.5:37000"), "123456", 41000, "Pixel 8");

        // Act
        let device = backend
            .pair_wireless_device("10.0.0.5".parse().unwrap(), 37000, "123456")
            .await
            .unwrap();

        // Assert
        assert_eq!(device.serial_no, "10.0.0.5:41000");
        assert_eq!(device.model, "Pixel 8");
        assert_eq!(device.transport, Transport::Tcp);
    }

    #[tokio::test]
    async fn test_pairing_with_wrong_code_fails() {
        let backend = ScriptedBackend::new();
        backend.open_pairing_dialog(addr("10.0.0.5:37000"), "123456", 41000, "Pixel 8");

        let result = backend
            .pair_wireless_device("10.0.0.5".parse().unwrap(), 37000, "000000")
            .await;

        assert!(result.is_err());
        assert!(backend.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_wireless_connect_requires_reachable_address() {
        let backend = ScriptedBackend::new();
        backend.accept_connections(addr("10.0.0.5:5555"), "Desk phone");
        let ip: IpAddr = "10.0.0.5".parse().unwrap();

        assert!(backend.connect_wireless_device(ip, 5556).await.is_err());
        let device = backend.connect_wireless_device(ip, 5555).await.unwrap();

        assert_eq!(device.model, "Desk phone");
    }

    #[tokio::test]
    async fn test_fail_next_applies_once() {
        // Arrange
        let backend = ScriptedBackend::new();
        backend.fail_next(
            BackendOp::ListUsb,
            BackendError::ToolNotFound {
                tool: "adb".to_string(),
            },
        );

        // Act
        let first = backend.list_usb_devices().await;
        let second = backend.list_usb_devices().await;

        // Assert
        assert!(first.is_err());
        assert!(second.is_ok());
        assert_eq!(backend.calls(BackendOp::ListUsb), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_delays_the_answer() {
        let backend = ScriptedBackend::new();
        backend.set_latency(BackendOp::ListImages, Duration::from_secs(2));
        let started = tokio::time::Instant::now();

        backend.list_emulator_images().await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_launch_opens_emulator_session() {
        // Arrange
        let backend = ScriptedBackend::new();
        backend.install_image("Pixel_7_API_34");

        // Act
        backend.launch_emulator_image("Pixel_7_API_34").await.unwrap();

        // Assert
        let sessions = backend.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].serial_no, "emulator-5554");
        assert_eq!(sessions[0].model, "Pixel 7");
        assert_eq!(sessions[0].api_level, "34");
        assert_eq!(backend.launched_images(), vec!["Pixel_7_API_34"]);
    }

    #[tokio::test]
    async fn test_launch_of_unknown_image_fails() {
        let backend = ScriptedBackend::new();

        assert!(backend.launch_emulator_image("Nope").await.is_err());
        assert!(backend.launched_images().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_ends_wireless_session_but_not_usb() {
        // Arrange
        let backend = ScriptedBackend::demo();
        backend
            .connect_wireless_device("192.168.1.20".parse().unwrap(), 41234)
            .await
            .unwrap();
        backend
            .connect_usb_device(&ConnectionMethod::Usb {
                serial_number: "R5CT1234ABC".to_string(),
            })
            .await
            .unwrap();

        // Act
        let wireless = backend.disconnect_device("192.168.1.20:41234").await;
        let usb = backend.disconnect_device("R5CT1234ABC").await;

        // Assert
        assert!(wireless.is_ok());
        assert!(matches!(usb, Err(BackendError::Unsupported(_))));
        assert_eq!(backend.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_demo_world_lists_every_source() {
        let backend = ScriptedBackend::demo();

        assert_eq!(backend.list_usb_devices().await.unwrap().len(), 1);
        assert_eq!(backend.list_wireless_devices().await.unwrap().len(), 2);
        assert_eq!(backend.list_emulator_images().await.unwrap().len(), 2);
        assert!(backend.connected_device_info().await.unwrap().is_empty());
    }
}
