//! Domain entities for DroidPanel.
//!
//! This module contains pure business logic with no infrastructure
//! dependencies.  Code in outer layers (the desktop application's pollers,
//! orchestrator and stores) depends on these types, but nothing here depends on
//! them.

/// Device records and identity keys for every source.
pub mod device;

/// Wireless pairing input validation and QR payloads.
pub mod pairing;

/// The registry reducer that merges all sources into one list.
pub mod registry;

/// Selected-device rules.
pub mod selection;
