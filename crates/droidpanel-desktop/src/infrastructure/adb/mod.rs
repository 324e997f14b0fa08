//! Android tooling backends.
//!
//! [`AdbCliBackend`] drives the `adb` and `emulator` executables shipped with
//! the Android SDK through `tokio::process`.  [`scripted::ScriptedBackend`] is
//! a deterministic in-memory stand-in used by tests and the `--scripted` demo
//! mode.
//!
//! # How the CLI backend talks to devices (for beginners)
//!
//! `adb` is a client/server tool: the first `adb` invocation starts a
//! background server that owns every debug session, and later invocations
//! just ask that server questions.  The backend therefore never keeps a
//! process alive; every trait method runs one or two short commands and
//! parses their text output:
//!
//! | Operation               | Command                                   |
//! |-------------------------|-------------------------------------------|
//! | connected sessions, USB | `adb devices -l`                          |
//! | device properties       | `adb -s <serial> shell getprop`           |
//! | wireless discovery      | `adb mdns services`                       |
//! | wireless connect        | `adb connect <ip>:<port>`                 |
//! | wireless pairing        | `adb pair <ip>:<port> <code>`             |
//! | emulator images         | `emulator -list-avds`                     |
//! | emulator launch         | `emulator -avd <name>`                    |
//!
//! # Locating the tools
//!
//! The SDK root is the first existing directory among: the `android-sdk`
//! `sdkPath` setting, `ANDROID_HOME`, `ANDROID_SDK_ROOT`, and the usual
//! per-platform install locations.  A tool missing from the SDK root (or no
//! SDK at all) is looked up on `PATH`.

pub mod scripted;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use droidpanel_core::{
    AppSettings, ConnectedDevice, ConnectionMethod, DiscoveredUsbDevice,
    DiscoveredWirelessDevice, PairingQrPayload, QrCredentials, Transport,
};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::application::ports::{BackendError, DeviceBackend};

/// Port `adb tcpip` listens on by default, used when the connect port of a
/// freshly paired device cannot be discovered.
pub const DEFAULT_CONNECT_PORT: u16 = 5555;

/// mDNS service type advertised by devices that accept connections.
const CONNECT_SERVICE: &str = "_adb-tls-connect";

/// mDNS service type advertised while the pairing dialog is open.
const PAIRING_SERVICE: &str = "_adb-tls-pairing";

/// Serial prefix of emulator sessions.
const EMULATOR_SERIAL_PREFIX: &str = "emulator-";

// ── Tool resolution ───────────────────────────────────────────────────────────

/// Paths of the two executables the backend runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AndroidTools {
    pub adb: PathBuf,
    pub emulator: PathBuf,
}

impl AndroidTools {
    /// Resolve the tools for a configured SDK path (empty means "detect").
    pub fn resolve(configured_sdk: &str) -> Self {
        let root = first_existing(sdk_root_candidates(configured_sdk));
        Self::from_sdk_root(root.as_deref())
    }

    /// Tools inside `root`, falling back to bare names looked up on `PATH`.
    pub fn from_sdk_root(root: Option<&Path>) -> Self {
        Self {
            adb: tool_path(root, "platform-tools", "adb"),
            emulator: tool_path(root, "emulator", "emulator"),
        }
    }
}

fn tool_path(root: Option<&Path>, subdir: &str, name: &str) -> PathBuf {
    let file = format!("{name}{}", std::env::consts::EXE_SUFFIX);
    root.map(|r| r.join(subdir).join(&file))
        .filter(|p| p.is_file())
        .unwrap_or_else(|| PathBuf::from(file))
}

fn sdk_root_candidates(configured: &str) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if !configured.trim().is_empty() {
        roots.push(PathBuf::from(configured.trim()));
    }
    for var in ["ANDROID_HOME", "ANDROID_SDK_ROOT"] {
        if let Some(path) = std::env::var_os(var) {
            roots.push(PathBuf::from(path));
        }
    }
    if let Some(home) = std::env::var_os("HOME") {
        let home = PathBuf::from(home);
        roots.push(home.join("Library/Android/sdk"));
        roots.push(home.join("Android/Sdk"));
    }
    #[cfg(target_os = "windows")]
    if let Some(local) = std::env::var_os("LOCALAPPDATA") {
        roots.push(PathBuf::from(local).join("Android").join("Sdk"));
    }
    roots.push(PathBuf::from("/usr/local/android-sdk"));
    roots
}

fn first_existing(candidates: Vec<PathBuf>) -> Option<PathBuf> {
    candidates.into_iter().find(|p| p.is_dir())
}

// ── Output parsing ────────────────────────────────────────────────────────────

/// One line of `adb devices -l`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DeviceListing {
    serial: String,
    /// `device`, `unauthorized`, `offline`, ...
    state: String,
    model: Option<String>,
}

impl DeviceListing {
    fn is_ready(&self) -> bool {
        self.state == "device"
    }
}

fn parse_devices_list(output: &str) -> Vec<DeviceListing> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?.to_string();
            let state = fields.next()?.to_string();
            let model = fields
                .find_map(|field| field.strip_prefix("model:"))
                .map(|m| m.replace('_', " "));
            Some(DeviceListing {
                serial,
                state,
                model,
            })
        })
        .collect()
}

/// Parse `[key]: [value]` lines printed by `getprop`.
fn parse_getprop(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once("]: [")?;
            let key = key.strip_prefix('[')?;
            let value = value.strip_suffix(']')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Transport of a session, judged by its serial.
///
/// Wireless sessions are named `ip:port` or by their mDNS service; emulators
/// talk to the adb server over a local TCP port.
fn transport_for_serial(serial: &str) -> Transport {
    if serial.parse::<SocketAddr>().is_ok()
        || serial.contains(&format!(".{CONNECT_SERVICE}."))
        || serial.starts_with(EMULATOR_SERIAL_PREFIX)
    {
        Transport::Tcp
    } else {
        Transport::Usb
    }
}

/// One service line of `adb mdns services`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MdnsService {
    instance: String,
    service: String,
    address: SocketAddr,
}

fn parse_mdns_services(output: &str) -> Vec<MdnsService> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let instance = fields.next()?.to_string();
            let service = fields.next()?.trim_end_matches('.').to_string();
            let address = fields.next()?.parse().ok()?;
            Some(MdnsService {
                instance,
                service,
                address,
            })
        })
        .collect()
}

/// Fold mDNS services into one candidate per advertised instance.
///
/// An instance advertising the connect service is already paired and is
/// reported on its connect port; otherwise the pairing port is reported.
fn wireless_candidates(
    services: &[MdnsService],
    connected_serials: &HashSet<String>,
) -> Vec<DiscoveredWirelessDevice> {
    let mut by_instance: BTreeMap<&str, Vec<&MdnsService>> = BTreeMap::new();
    for service in services {
        by_instance
            .entry(service.instance.as_str())
            .or_default()
            .push(service);
    }

    by_instance
        .into_iter()
        .filter_map(|(instance, services)| {
            let connect = services
                .iter()
                .find(|s| s.service.starts_with(CONNECT_SERVICE));
            let chosen = connect.or_else(|| {
                services
                    .iter()
                    .find(|s| s.service.starts_with(PAIRING_SERVICE))
            })?;
            let mut addresses: Vec<IpAddr> = Vec::new();
            for s in &services {
                if !addresses.contains(&s.address.ip()) {
                    addresses.push(s.address.ip());
                }
            }
            let fullname = format!("{instance}.{}", chosen.service);
            let is_connected = connected_serials.contains(&chosen.address.to_string())
                || connected_serials.contains(&fullname);
            Some(DiscoveredWirelessDevice {
                name: instance.to_string(),
                fullname,
                addresses,
                port: chosen.address.port(),
                is_paired: connect.is_some(),
                is_connected,
            })
        })
        .collect()
}

/// Interpret `adb connect` output, which exits 0 even when it fails.
fn check_connect_output(output: &str) -> Result<(), String> {
    let message = output.trim();
    let lower = message.to_ascii_lowercase();
    let failed = ["failed", "cannot", "unable", "error"]
        .iter()
        .any(|word| lower.contains(word));
    if !failed && lower.contains("connected to") {
        Ok(())
    } else {
        Err(message.to_string())
    }
}

fn check_pair_output(output: &str) -> Result<(), String> {
    let message = output.trim();
    if message.starts_with("Successfully paired") {
        Ok(())
    } else {
        Err(message.to_string())
    }
}

/// `emulator -list-avds` may interleave `INFO | ...` diagnostics with names.
fn parse_avd_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains(char::is_whitespace))
        .filter(|line| !line.starts_with("INFO"))
        .map(str::to_string)
        .collect()
}

// ── Process execution ─────────────────────────────────────────────────────────

/// Run a tool to completion and return its stdout.
async fn run_tool(program: &Path, args: &[&str]) -> Result<String, BackendError> {
    let command = describe(program, args);
    debug!(%command, "running");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| spawn_error(program, &command, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("exited with {}", output.status)
        } else {
            stderr
        };
        return Err(BackendError::CommandFailed { command, message });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn describe(program: &Path, args: &[&str]) -> String {
    let name = program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string());
    std::iter::once(name.as_str())
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

fn spawn_error(program: &Path, command: &str, err: io::Error) -> BackendError {
    if err.kind() == io::ErrorKind::NotFound {
        BackendError::ToolNotFound {
            tool: program.display().to_string(),
        }
    } else {
        BackendError::CommandFailed {
            command: command.to_string(),
            message: err.to_string(),
        }
    }
}

// ── AdbCliBackend ─────────────────────────────────────────────────────────────

/// [`DeviceBackend`] backed by the Android SDK command-line tools.
///
/// Tool paths are resolved on every call, so a change to the `sdkPath`
/// setting takes effect without a restart.
pub struct AdbCliBackend {
    settings: watch::Receiver<AppSettings>,
}

impl AdbCliBackend {
    pub fn new(settings: watch::Receiver<AppSettings>) -> Self {
        Self { settings }
    }

    pub fn tools(&self) -> AndroidTools {
        AndroidTools::resolve(&self.settings.borrow().android_sdk.sdk_path)
    }

    async fn adb(&self, args: &[&str]) -> Result<String, BackendError> {
        run_tool(&self.tools().adb, args).await
    }

    async fn device_listings(&self) -> Result<Vec<DeviceListing>, BackendError> {
        Ok(parse_devices_list(&self.adb(&["devices", "-l"]).await?))
    }

    /// Build a connected record for `serial` from its system properties.
    async fn describe_device(
        &self,
        serial: &str,
        fallback_model: Option<&str>,
    ) -> Result<ConnectedDevice, BackendError> {
        let props = parse_getprop(&self.adb(&["-s", serial, "shell", "getprop"]).await?);
        let prop = |key: &str| props.get(key).cloned().unwrap_or_default();
        let mut model = prop("ro.product.model");
        if model.is_empty() {
            model = fallback_model.unwrap_or_default().to_string();
        }
        Ok(ConnectedDevice {
            transport: transport_for_serial(serial),
            serial_no: serial.to_string(),
            model,
            android_version: prop("ro.build.version.release"),
            api_level: prop("ro.build.version.sdk"),
        })
    }

    /// Port the device at `ip` accepts connections on, if it advertises one.
    async fn discover_connect_port(&self, ip: IpAddr) -> Option<u16> {
        let output = self.adb(&["mdns", "services"]).await.ok()?;
        parse_mdns_services(&output)
            .into_iter()
            .find(|s| s.service.starts_with(CONNECT_SERVICE) && s.address.ip() == ip)
            .map(|s| s.address.port())
    }
}

#[async_trait]
impl DeviceBackend for AdbCliBackend {
    async fn connected_device_info(&self) -> Result<Vec<ConnectedDevice>, BackendError> {
        let mut devices = Vec::new();
        for listing in self.device_listings().await?.into_iter().filter(DeviceListing::is_ready) {
            match self.describe_device(&listing.serial, listing.model.as_deref()).await {
                Ok(device) => devices.push(device),
                Err(err) => {
                    warn!(serial = %listing.serial, "could not read device properties: {err}");
                    devices.push(ConnectedDevice {
                        transport: transport_for_serial(&listing.serial),
                        serial_no: listing.serial,
                        model: listing.model.unwrap_or_default(),
                        android_version: String::new(),
                        api_level: String::new(),
                    });
                }
            }
        }
        Ok(devices)
    }

    async fn list_usb_devices(&self) -> Result<Vec<DiscoveredUsbDevice>, BackendError> {
        Ok(self
            .device_listings()
            .await?
            .into_iter()
            .filter(|l| transport_for_serial(&l.serial) == Transport::Usb)
            .map(|l| {
                let is_connected = l.is_ready();
                let mut device = DiscoveredUsbDevice::usb(l.serial, l.model);
                device.is_connected = is_connected;
                device
            })
            .collect())
    }

    async fn list_wireless_devices(&self) -> Result<Vec<DiscoveredWirelessDevice>, BackendError> {
        let services = parse_mdns_services(&self.adb(&["mdns", "services"]).await?);
        let connected: HashSet<String> = match self.device_listings().await {
            Ok(listings) => listings
                .into_iter()
                .filter(DeviceListing::is_ready)
                .map(|l| l.serial)
                .collect(),
            Err(err) => {
                debug!("session list unavailable during wireless discovery: {err}");
                HashSet::new()
            }
        };
        Ok(wireless_candidates(&services, &connected))
    }

    async fn list_emulator_images(&self) -> Result<Vec<String>, BackendError> {
        let output = run_tool(&self.tools().emulator, &["-list-avds"]).await?;
        Ok(parse_avd_list(&output))
    }

    async fn connect_usb_device(
        &self,
        method: &ConnectionMethod,
    ) -> Result<ConnectedDevice, BackendError> {
        let serial = match method {
            ConnectionMethod::Usb { serial_number } => serial_number,
            ConnectionMethod::Tcp { socket_address } => {
                return self
                    .connect_wireless_device(socket_address.ip(), socket_address.port())
                    .await;
            }
        };

        let listing = self
            .device_listings()
            .await?
            .into_iter()
            .find(|l| &l.serial == serial)
            .ok_or_else(|| BackendError::CommandFailed {
                command: "adb devices -l".to_string(),
                message: format!("device {serial} is not attached"),
            })?;
        if !listing.is_ready() {
            return Err(BackendError::CommandFailed {
                command: "adb devices -l".to_string(),
                message: format!(
                    "device {serial} is {}; accept the USB debugging prompt on the device",
                    listing.state
                ),
            });
        }
        self.describe_device(serial, listing.model.as_deref()).await
    }

    async fn connect_wireless_device(
        &self,
        ip: IpAddr,
        port: u16,
    ) -> Result<ConnectedDevice, BackendError> {
        let address = SocketAddr::new(ip, port).to_string();
        let output = self.adb(&["connect", &address]).await?;
        check_connect_output(&output).map_err(|message| BackendError::CommandFailed {
            command: format!("adb connect {address}"),
            message,
        })?;
        info!(%address, "adb connected");
        self.describe_device(&address, None).await
    }

    async fn pair_wireless_device(
        &self,
        ip: IpAddr,
        port: u16,
        code: &str,
    ) -> Result<ConnectedDevice, BackendError> {
        let pairing_address = SocketAddr::new(ip, port).to_string();
        let output = self.adb(&["pair", &pairing_address, code]).await?;
        check_pair_output(&output).map_err(|message| BackendError::CommandFailed {
            command: format!("adb pair {pairing_address}"),
            message,
        })?;

        let connect_port = match self.discover_connect_port(ip).await {
            Some(port) => port,
            None => {
                warn!(%ip, "connect port not advertised; trying {DEFAULT_CONNECT_PORT}");
                DEFAULT_CONNECT_PORT
            }
        };
        self.connect_wireless_device(ip, connect_port).await
    }

    async fn pairing_qr_payload(&self) -> Result<PairingQrPayload, BackendError> {
        let ip = local_ip().await.map_err(|e| BackendError::CommandFailed {
            command: "local address lookup".to_string(),
            message: e.to_string(),
        })?;
        let credentials = QrCredentials::generate(&mut rand::thread_rng());
        Ok(PairingQrPayload {
            ip: ip.to_string(),
            port: DEFAULT_CONNECT_PORT,
            qr_payload: credentials.qr_string(),
        })
    }

    async fn launch_emulator_image(&self, name: &str) -> Result<(), BackendError> {
        let program = self.tools().emulator;
        let command = describe(&program, &["-avd", name]);
        let mut child = Command::new(&program)
            .args(["-avd", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| spawn_error(&program, &command, e))?;

        info!(image = name, "emulator process started");
        let image = name.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(%image, %status, "emulator process exited"),
                Err(err) => warn!(%image, "emulator process wait failed: {err}"),
            }
        });
        Ok(())
    }

    async fn disconnect_device(&self, serial: &str) -> Result<(), BackendError> {
        let args = if serial.starts_with(EMULATOR_SERIAL_PREFIX) {
            vec!["-s", serial, "emu", "kill"]
        } else if transport_for_serial(serial) == Transport::Tcp {
            vec!["disconnect", serial]
        } else {
            return Err(BackendError::Unsupported(format!(
                "USB session {serial} ends when the cable is unplugged"
            )));
        };
        let output = self.adb(&args).await?;
        if output.trim_start().starts_with("error") {
            return Err(BackendError::CommandFailed {
                command: format!("adb {}", args.join(" ")),
                message: output.trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Address of the interface used for outbound traffic.
///
/// Connecting a UDP socket only selects a route; no packet is sent.
async fn local_ip() -> io::Result<IpAddr> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect("8.8.8.8:80").await?;
    Ok(socket.local_addr()?.ip())
}
