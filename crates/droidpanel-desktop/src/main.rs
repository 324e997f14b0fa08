//! DroidPanel desktop application entry point.
//!
//! Opens the stores, starts the four device pollers and the reconciliation
//! loop, runs the one-shot auto-reconnect, and then logs connection events
//! until Ctrl+C.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ AppState::start()            -- stores, pollers, tracker, orchestrator
//!       ├─ SourcePoller::run_schedule  x4  -- background polling
//!       └─ DeviceReconciler::run           -- unified device list
//!  └─ startup_reconnect()           -- existing sessions, then auto-reconnect
//!  └─ event loop                    -- ConnectionEvent -> log
//! ```
//!
//! # Backends
//!
//! By default the Android SDK tools are driven through [`AdbCliBackend`].
//! `--scripted` swaps in the in-memory [`ScriptedBackend::demo`] world, which
//! needs no SDK and no devices.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use droidpanel_desktop::application::connect_devices::{AutoReconnectOutcome, ConnectionEvent};
use droidpanel_desktop::application::ports::DeviceBackend;
use droidpanel_desktop::infrastructure::{
    adb::{scripted::ScriptedBackend, AdbCliBackend},
    storage,
    ui_bridge::AppState,
};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// DroidPanel device registry and connection orchestrator.
#[derive(Debug, Parser)]
#[command(
    name = "droidpanel",
    about = "Discovers Android devices and manages their debug connections",
    version
)]
struct Cli {
    /// Directory holding `settings.toml` and `paired-devices.toml`.
    ///
    /// Defaults to the platform config directory.
    #[arg(long, env = "DROIDPANEL_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, default_value = "info", env = "DROIDPANEL_LOG")]
    log_level: String,

    /// Use the in-memory demo backend instead of the Android SDK tools.
    #[arg(long, env = "DROIDPANEL_SCRIPTED")]
    scripted: bool,
}

impl Cli {
    /// The directory both stores live in.
    ///
    /// # Errors
    ///
    /// Returns an error when no `--config-dir` was given and the platform
    /// config directory cannot be determined.
    fn resolve_config_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.config_dir {
            Some(dir) => Ok(dir.clone()),
            None => storage::config_dir().context("pass --config-dir to choose one"),
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // `RUST_LOG` wins; otherwise the --log-level flag.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config_dir = cli.resolve_config_dir()?;
    info!(
        dir = %config_dir.display(),
        scripted = cli.scripted,
        "DroidPanel starting"
    );

    let scripted = cli.scripted;
    let (state, mut events) = AppState::start(&config_dir, |settings| {
        if scripted {
            Arc::new(ScriptedBackend::demo()) as Arc<dyn DeviceBackend>
        } else {
            Arc::new(AdbCliBackend::new(settings))
        }
    })
    .await;

    // ── Startup reconnect ─────────────────────────────────────────────────────
    if let Some(device) = state.startup_reconnect().await {
        info!(serial = %device.serial_no, "reconnected to paired device");
    }

    // ── Event loop ────────────────────────────────────────────────────────────
    info!("DroidPanel ready");
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("failed to listen for Ctrl+C signal: {e}");
                }
                info!("shutdown signal received");
                break;
            }
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
        }
    }

    state.shutdown();
    info!("DroidPanel stopped");
    Ok(())
}

fn log_event(event: &ConnectionEvent) {
    match event {
        ConnectionEvent::AttemptStarted { target } => info!(%target, "connecting"),
        ConnectionEvent::AttemptSucceeded {
            target,
            device,
            selected,
        } => info!(%target, model = %device.display_name(), selected, "connected"),
        ConnectionEvent::AttemptFailed { target, reason } => {
            warn!(%target, "connection failed: {reason}")
        }
        ConnectionEvent::DeviceRemoved { serial } => info!(serial, "device removed"),
        ConnectionEvent::EmulatorLaunched { image } => info!(image, "emulator launched"),
        ConnectionEvent::AutoReconnect {
            outcome: AutoReconnectOutcome::Connected(device),
        } => info!(serial = %device.serial_no, "auto-reconnect succeeded"),
        ConnectionEvent::AutoReconnect {
            outcome: AutoReconnectOutcome::Failed { address, reason },
        } => warn!(%address, "auto-reconnect failed: {reason}"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
