//! Device records produced by every device source.
//!
//! Each source identifies devices in its own namespace: an active debug
//! session reports a backend-assigned serial, USB enumeration reports a serial
//! number, wireless discovery reports `ip:port` candidates, and emulator images
//! are identified by their image name.  These identities are never compared
//! across sources directly; the registry decides how they relate.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Suffix separator used by the conventional emulator image naming
/// (`Pixel_7_API_34`).
const API_SUFFIX: &str = "_API_";

/// Physical transport of a connected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Transport {
    Usb,
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Usb => f.write_str("USB"),
            Transport::Tcp => f.write_str("TCP"),
        }
    }
}

/// A device with an active debug session.
///
/// Created when a connect operation succeeds (or when the connected-session
/// probe reports it).  A second record with the same `serial_no` replaces the
/// first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedDevice {
    pub transport: Transport,
    /// Backend-assigned serial.  For TCP devices this is `ip:port`.
    pub serial_no: String,
    pub model: String,
    pub android_version: String,
    pub api_level: String,
}

impl ConnectedDevice {
    /// Name shown to the user: the model, or the serial when the backend did
    /// not report one.
    pub fn display_name(&self) -> &str {
        if self.model.trim().is_empty() {
            &self.serial_no
        } else {
            &self.model
        }
    }

    /// Key under which connection attempts for this device are serialized.
    pub fn target_key(&self) -> TargetKey {
        match (self.transport, self.serial_no.parse::<SocketAddr>()) {
            (Transport::Tcp, Ok(address)) => TargetKey::Address(address),
            _ => TargetKey::Serial(self.serial_no.clone()),
        }
    }
}

/// How the backend reaches a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionMethod {
    #[serde(rename = "USB", rename_all = "camelCase")]
    Usb { serial_number: String },
    #[serde(rename = "TCP", rename_all = "camelCase")]
    Tcp { socket_address: SocketAddr },
}

impl ConnectionMethod {
    pub fn transport(&self) -> Transport {
        match self {
            ConnectionMethod::Usb { .. } => Transport::Usb,
            ConnectionMethod::Tcp { .. } => Transport::Tcp,
        }
    }

    /// Identity of the device inside its transport's namespace.
    pub fn identity(&self) -> String {
        match self {
            ConnectionMethod::Usb { serial_number } => serial_number.clone(),
            ConnectionMethod::Tcp { socket_address } => socket_address.to_string(),
        }
    }

    pub fn target_key(&self) -> TargetKey {
        match self {
            ConnectionMethod::Usb { serial_number } => TargetKey::Serial(serial_number.clone()),
            ConnectionMethod::Tcp { socket_address } => TargetKey::Address(*socket_address),
        }
    }
}

/// A device reported by USB enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredUsbDevice {
    pub connection_method: ConnectionMethod,
    pub model: Option<String>,
    pub android_version: Option<String>,
    pub api_level: Option<String>,
    /// `true` when the backend already holds a session for this device.
    pub is_connected: bool,
}

impl DiscoveredUsbDevice {
    /// Convenience constructor for a USB device identified by its serial number.
    pub fn usb(serial_number: impl Into<String>, model: Option<String>) -> Self {
        Self {
            connection_method: ConnectionMethod::Usb {
                serial_number: serial_number.into(),
            },
            model,
            android_version: None,
            api_level: None,
            is_connected: false,
        }
    }

    pub fn identity(&self) -> String {
        self.connection_method.identity()
    }

    pub fn display_name(&self) -> &str {
        self.model.as_deref().unwrap_or("Unknown Device")
    }
}

/// A device advertising the wireless debugging service on the local network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredWirelessDevice {
    /// Advertised instance name.
    pub name: String,
    /// Fully qualified service name (`adb-XXXX._adb-tls-pairing._tcp`).
    pub fullname: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub is_paired: bool,
    pub is_connected: bool,
}

impl DiscoveredWirelessDevice {
    /// First IPv4 candidate; IPv6 candidates are skipped.
    pub fn preferred_ipv4(&self) -> Option<Ipv4Addr> {
        self.addresses.iter().find_map(|addr| match addr {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
    }

    /// `(ip, port)` key used for wireless equivalence, when an IPv4 candidate
    /// exists.
    pub fn socket_address(&self) -> Option<SocketAddr> {
        self.preferred_ipv4()
            .map(|ip| SocketAddr::new(IpAddr::V4(ip), self.port))
    }

    /// Identity inside the wireless namespace: `ip:port`, or the service name
    /// when the device advertised no IPv4 address.
    pub fn identity(&self) -> String {
        match self.socket_address() {
            Some(addr) => addr.to_string(),
            None => self.fullname.clone(),
        }
    }
}

/// How a paired device was first paired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PairingMethod {
    QrCode,
    PairingCode,
}

/// A trusted wireless device remembered across restarts.
///
/// At most one record exists per `(ip, port)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedDevice {
    pub id: Uuid,
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
    /// Milliseconds since the Unix epoch.
    pub last_connected: i64,
    pub pairing_method: PairingMethod,
}

impl PairedDevice {
    pub fn new(
        name: impl Into<String>,
        address: SocketAddr,
        pairing_method: PairingMethod,
        now_ms: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            ip: address.ip(),
            port: address.port(),
            last_connected: now_ms,
            pairing_method,
        }
    }

    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// An installed emulator image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmulatorImage {
    pub name: String,
}

impl EmulatorImage {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Human-readable name: `Pixel_7_API_34` becomes `Pixel 7`.
    pub fn display_name(&self) -> String {
        let base = match self.split_api_suffix() {
            Some((base, _)) => base,
            None => self.name.as_str(),
        };
        base.replace('_', " ")
    }

    /// API level parsed from a trailing `_API_<n>` suffix.
    pub fn api_level(&self) -> Option<u32> {
        self.split_api_suffix().map(|(_, level)| level)
    }

    fn split_api_suffix(&self) -> Option<(&str, u32)> {
        let (base, level) = self.name.rsplit_once(API_SUFFIX)?;
        let level = level.parse().ok()?;
        if base.is_empty() {
            return None;
        }
        Some((base, level))
    }
}

/// Key used to serialize connection attempts against one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetKey {
    /// USB serial number or backend serial.
    Serial(String),
    /// Wireless `ip:port`.
    Address(SocketAddr),
    /// Emulator image name.
    Image(String),
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKey::Serial(serial) => write!(f, "serial {serial}"),
            TargetKey::Address(addr) => write!(f, "address {addr}"),
            TargetKey::Image(name) => write!(f, "image {name}"),
        }
    }
}
