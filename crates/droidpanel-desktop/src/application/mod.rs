//! Application layer use cases for the desktop application.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (pure rules in `droidpanel-core`) and the infrastructure (processes, files,
//! the command bridge).
//!
//! Use cases in this layer:
//!
//! - **Orchestrate** domain objects to fulfil a user goal (e.g., "pair this
//!   phone and make it the selected device").
//! - **Depend on abstractions** ([`ports::DeviceBackend`],
//!   [`ports::PairedDeviceRepository`]) rather than concrete implementations,
//!   so the `adb` backend can be swapped for a scripted one in tests.
//! - **Contain no process spawning and no file system access**.
//!
//! # Sub-modules
//!
//! - **`ports`** – The traits implemented by the infrastructure layer and the
//!   errors that cross that boundary.
//!
//! - **`poll_sources`** – The four device sources, each with a cached snapshot,
//!   coalesced manual refresh and a settings-driven background schedule.
//!
//! - **`track_connections`** – The connected-device set and the selected
//!   device, updated together under one lock.
//!
//! - **`reconcile_devices`** – The loop that folds every change into a fresh
//!   unified device list.
//!
//! - **`connect_devices`** – Connect, pair, launch, disconnect and the one-shot
//!   startup auto-reconnect.

pub mod connect_devices;
pub mod poll_sources;
pub mod ports;
pub mod reconcile_devices;
pub mod track_connections;
