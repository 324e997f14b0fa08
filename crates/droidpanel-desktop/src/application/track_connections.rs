//! The connected-device set and the selected device.
//!
//! Connect operations, the connected-session probe and USB pruning all mutate
//! the same two pieces of state: the list of devices the backend holds a
//! session with, and which one of them is selected.  [`DeviceTracker`] keeps
//! both behind one lock so a "nothing is selected" check and the mutation that
//! depends on it can never interleave with another writer.
//!
//! Every mutation re-applies the selection rules from
//! [`droidpanel_core::SelectionController`] against the connected set in
//! registry order, then publishes a [`TrackerSnapshot`] on a `watch` channel
//! when anything visible changed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use droidpanel_core::{
    connected_in_registry_order, ConnectedDevice, SelectionController, SelectionError, Transport,
};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

/// What observers of the tracker see.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerSnapshot {
    pub connected: Vec<ConnectedDevice>,
    pub selected: Option<ConnectedDevice>,
}

#[derive(Debug, Default)]
struct TrackerState {
    /// Insertion order; registry order is derived on demand.
    connected: Vec<ConnectedDevice>,
    /// When each device was last committed by a connect operation.
    committed_at: HashMap<String, Instant>,
    selection: SelectionController,
}

impl TrackerState {
    fn upsert(&mut self, device: &ConnectedDevice) {
        match self
            .connected
            .iter_mut()
            .find(|d| d.serial_no == device.serial_no)
        {
            Some(existing) => *existing = device.clone(),
            None => self.connected.push(device.clone()),
        }
    }

    /// Split off the devices `keep` rejects.
    fn drain_where<F>(&mut self, mut keep: F) -> Vec<ConnectedDevice>
    where
        F: FnMut(&ConnectedDevice, Option<&Instant>) -> bool,
    {
        let committed_at = &self.committed_at;
        let (kept, removed): (Vec<_>, Vec<_>) = self
            .connected
            .drain(..)
            .partition(|d| keep(d, committed_at.get(&d.serial_no)));
        self.connected = kept;
        for device in &removed {
            self.committed_at.remove(&device.serial_no);
        }
        removed
    }

    fn reconcile(&mut self) -> bool {
        let ordered = connected_in_registry_order(&self.connected);
        self.selection.reconcile(&ordered)
    }

    fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            connected: connected_in_registry_order(&self.connected),
            selected: self.selection.selected().cloned(),
        }
    }
}

/// Shared owner of the connected set and the selection.
#[derive(Debug)]
pub struct DeviceTracker {
    state: Mutex<TrackerState>,
    published: watch::Sender<TrackerSnapshot>,
}

impl Default for DeviceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTracker {
    pub fn new() -> Self {
        let (published, _) = watch::channel(TrackerSnapshot::default());
        Self {
            state: Mutex::new(TrackerState::default()),
            published,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the state if it differs from what observers last saw.
    fn publish(&self, state: &TrackerState) {
        let next = state.snapshot();
        self.published.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    // ── Mutations ─────────────────────────────────────────────────────────────

    /// Record a successful connect.
    ///
    /// The device becomes the selection if and only if nothing was selected at
    /// this moment.  Returns `true` when it did.
    pub fn commit_connection(&self, device: &ConnectedDevice) -> bool {
        let mut state = self.lock();
        state.upsert(device);
        state
            .committed_at
            .insert(device.serial_no.clone(), Instant::now());
        let selected = state.selection.on_device_connected(device);
        state.reconcile();
        if selected {
            info!(serial = %device.serial_no, "selected newly connected device");
        }
        self.publish(&state);
        selected
    }

    /// Merge the devices reported by a connected-session probe issued now.
    pub fn ingest_probe(&self, devices: &[ConnectedDevice]) -> Vec<ConnectedDevice> {
        self.ingest_probe_started_at(devices, Instant::now())
    }

    /// Merge the devices reported by a successful connected-session probe
    /// issued at `started_at`.
    ///
    /// Known devices are refreshed and new ones added.  USB devices the probe
    /// no longer reports are dropped, unless a connect committed them after
    /// the probe was issued; wireless sessions are only removed explicitly.
    /// Returns the dropped devices.
    pub fn ingest_probe_started_at(
        &self,
        devices: &[ConnectedDevice],
        started_at: Instant,
    ) -> Vec<ConnectedDevice> {
        let mut state = self.lock();
        let removed = state.drain_where(|d, committed_at| {
            d.transport != Transport::Usb
                || devices.iter().any(|p| p.serial_no == d.serial_no)
                || committed_at.is_some_and(|at| *at > started_at)
        });
        for device in devices {
            state.upsert(device);
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "dropped USB devices missing from session probe");
        }
        state.reconcile();
        self.publish(&state);
        removed
    }

    /// Drop USB devices whose serial is no longer enumerated.
    ///
    /// Only USB-transport devices are considered; wireless sessions are removed
    /// explicitly.  Returns the removed devices.
    pub fn prune_usb(&self, present_serials: &HashSet<String>) -> Vec<ConnectedDevice> {
        let mut state = self.lock();
        let removed = state.drain_where(|d, _| {
            d.transport != Transport::Usb || present_serials.contains(&d.serial_no)
        });
        if !removed.is_empty() {
            debug!(count = removed.len(), "pruned unplugged USB devices");
            state.reconcile();
            self.publish(&state);
        }
        removed
    }

    /// Remove one device.  Returns it when it was connected.
    pub fn remove(&self, serial: &str) -> Option<ConnectedDevice> {
        let mut state = self.lock();
        let index = state.connected.iter().position(|d| d.serial_no == serial)?;
        let removed = state.connected.remove(index);
        state.committed_at.remove(serial);
        state.reconcile();
        self.publish(&state);
        Some(removed)
    }

    /// Select a connected device on the user's behalf.
    pub fn select(&self, serial: &str) -> Result<ConnectedDevice, SelectionError> {
        let mut state = self.lock();
        let ordered = connected_in_registry_order(&state.connected);
        let selected = state.selection.select(serial, &ordered)?.clone();
        self.publish(&state);
        Ok(selected)
    }

    /// Forget the current selection, then fall back to the first device.
    pub fn clear_selection(&self) {
        let mut state = self.lock();
        state.selection.clear();
        state.reconcile();
        self.publish(&state);
    }

    /// Re-apply the selection rules without changing the connected set.
    pub fn reconcile_selection(&self) -> bool {
        let mut state = self.lock();
        let changed = state.reconcile();
        self.publish(&state);
        changed
    }

    /// Claim the once-per-session auto-reconnect.
    ///
    /// Succeeds only for the first caller and only when nothing is selected;
    /// the flag is consumed either way.
    pub fn claim_auto_reconnect(&self, attempted: &AtomicBool) -> bool {
        let state = self.lock();
        let first = !attempted.swap(true, Ordering::SeqCst);
        first && state.selection.selected().is_none()
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> TrackerSnapshot {
        self.lock().snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<TrackerSnapshot> {
        self.published.subscribe()
    }

    /// Connected devices in registry order.
    pub fn connected(&self) -> Vec<ConnectedDevice> {
        connected_in_registry_order(&self.lock().connected)
    }

    pub fn selected(&self) -> Option<ConnectedDevice> {
        self.lock().selection.selected().cloned()
    }

    pub fn is_connected(&self, serial: &str) -> bool {
        self.lock().connected.iter().any(|d| d.serial_no == serial)
    }
}
