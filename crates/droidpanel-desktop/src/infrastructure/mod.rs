//! Infrastructure layer for the desktop application.
//!
//! Contains OS-facing adapters: the `adb`/`emulator` command-line backend and
//! its scripted stand-in, TOML file stores, and the command bridge the UI
//! calls into.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `droidpanel_core`, but MUST NOT be imported by the `application` or domain
//! layers.

pub mod adb;
pub mod storage;
pub mod ui_bridge;
