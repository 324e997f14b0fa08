//! Wireless pairing input and QR pairing payloads.
//!
//! Android's "Wireless debugging" screen offers two ways to pair: typing a
//! six-digit code shown on the phone together with the pairing `ip:port`, or
//! scanning a QR code produced by the desktop.  The QR code encodes a Wi-Fi
//! style string naming a service and a password; the phone then advertises
//! that service over mDNS and the desktop completes the handshake.

use std::net::{Ipv4Addr, SocketAddr};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of digits in a pairing code.
pub const PAIRING_CODE_LEN: usize = 6;

/// Length of the random password embedded in a QR payload.
const QR_PASSWORD_LEN: usize = 10;

/// Prefix of the random service name embedded in a QR payload.
const QR_SERVICE_PREFIX: &str = "droidpanel-";

/// Errors produced while validating pairing input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PairingInputError {
    #[error("invalid IPv4 address: {0}")]
    InvalidIp(String),

    #[error("port must be between 1 and 65535")]
    InvalidPort,

    #[error("pairing code must be exactly {PAIRING_CODE_LEN} digits")]
    InvalidCode,
}

impl PairingInputError {
    /// Name of the input field the error belongs to.
    pub fn field(&self) -> &'static str {
        match self {
            PairingInputError::InvalidIp(_) => "ip",
            PairingInputError::InvalidPort => "port",
            PairingInputError::InvalidCode => "code",
        }
    }
}

/// A validated pairing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRequest {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub code: String,
    pub display_name: Option<String>,
}

impl PairingRequest {
    /// Validate raw pairing input.
    ///
    /// The address must be a dotted IPv4 address, the port non-zero, and the
    /// code exactly six ASCII digits.  A blank display name counts as absent.
    pub fn new(
        ip: &str,
        port: u16,
        code: &str,
        display_name: Option<String>,
    ) -> Result<Self, PairingInputError> {
        let ip: Ipv4Addr = ip
            .trim()
            .parse()
            .map_err(|_| PairingInputError::InvalidIp(ip.to_string()))?;

        if port == 0 {
            return Err(PairingInputError::InvalidPort);
        }

        let code = code.trim();
        if code.len() != PAIRING_CODE_LEN || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PairingInputError::InvalidCode);
        }

        let display_name = display_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());

        Ok(Self {
            ip,
            port,
            code: code.to_string(),
            display_name,
        })
    }

    pub fn pairing_address(&self) -> SocketAddr {
        SocketAddr::from((self.ip, self.port))
    }
}

/// Data needed to render a pairing QR code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingQrPayload {
    /// Address the desktop listens on, shown next to the QR code.
    pub ip: String,
    pub port: u16,
    /// The string to encode in the QR code.
    pub qr_payload: String,
}

/// Random service name and password for one QR pairing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrCredentials {
    pub service_name: String,
    pub password: String,
}

impl QrCredentials {
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let service_name = format!("{QR_SERVICE_PREFIX}{}", random_alphanumeric(rng, 6));
        let password = random_alphanumeric(rng, QR_PASSWORD_LEN);
        Self {
            service_name,
            password,
        }
    }

    /// The `WIFI:T:ADB;S:<service>;P:<password>;;` string Android expects.
    pub fn qr_string(&self) -> String {
        format!("WIFI:T:ADB;S:{};P:{};;", self.service_name, self.password)
    }
}

fn random_alphanumeric<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| char::from(rng.sample(Alphanumeric)))
        .collect()
}
