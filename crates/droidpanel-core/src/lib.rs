//! # droidpanel-core
//!
//! Shared domain library for DroidPanel: device identities, the registry
//! reducer that merges every device source into one list, the selection
//! rules, pairing input validation, and the validated settings schema.
//!
//! This crate has zero dependencies on OS APIs, processes, the file system or
//! an async runtime.  Everything here is a plain value or a pure function, so
//! it can be unit-tested without any external setup.
//!
//! # Architecture overview (for beginners)
//!
//! DroidPanel is a desktop control panel for Android devices.  Devices become
//! visible through several independent *sources* (an active debug session, USB
//! enumeration, wireless discovery, installed emulator images) and through the
//! user's list of *paired* wireless devices.  Each source uses its own identity
//! scheme, so something has to merge them into one list the user can act on.
//!
//! - **`domain::device`** – The device records produced by each source and the
//!   keys that identify them (`ConnectionMethod`, `TargetKey`).
//!
//! - **`domain::registry`** – [`unify`], the pure function that turns all source
//!   snapshots into one sorted, de-duplicated list of [`UnifiedDeviceEntry`]s.
//!
//! - **`domain::selection`** – [`SelectionController`], the rules deciding which
//!   connected device is "the selected device" after every change.
//!
//! - **`domain::pairing`** – Validation of wireless pairing input and the QR
//!   payload format understood by Android's "pair device with QR code" screen.
//!
//! - **`settings`** – [`AppSettings`], its categories, defaults, and the
//!   merge-then-validate logic behind partial settings updates.

pub mod domain;
pub mod settings;

// Re-export the most-used types at the crate root so callers can write
// `droidpanel_core::ConnectedDevice` instead of the full module path.
pub use domain::device::{
    ConnectedDevice, ConnectionMethod, DiscoveredUsbDevice, DiscoveredWirelessDevice,
    EmulatorImage, PairedDevice, PairingMethod, TargetKey, Transport,
};
pub use domain::pairing::{PairingInputError, PairingQrPayload, PairingRequest, QrCredentials};
pub use domain::registry::{
    connected_in_registry_order, unify, DeviceCategory, RegistryPolicy, SourceData,
    UnifiedDeviceEntry,
};
pub use domain::selection::{SelectionController, SelectionError};
pub use settings::{AppSettings, DevicesSettings, FieldError, SettingsCategory};
