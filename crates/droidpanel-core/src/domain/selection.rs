//! The selected-device rules.
//!
//! Exactly one connected device can be "the selected device", which is the
//! target of every device-scoped feature (files, logs, apps, shell).
//! [`SelectionController`] applies four rules:
//!
//! 1. An explicit user choice is never overridden while that device remains
//!    connected.
//! 2. When nothing is selected and at least one device is connected, the first
//!    connected device in registry order is selected.
//! 3. A newly connected device is selected if and only if nothing was selected
//!    at the moment it connected.
//! 4. When the selected device disappears, rule 2 applies again (or nothing is
//!    selected).

use thiserror::Error;

use super::device::ConnectedDevice;

/// Errors returned by [`SelectionController::select`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    /// Only connected devices can be selected.
    #[error("device {0} is not connected")]
    NotConnected(String),
}

/// Holds the single selected device.
#[derive(Debug, Clone, Default)]
pub struct SelectionController {
    selected: Option<ConnectedDevice>,
    explicit: bool,
}

impl SelectionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selected(&self) -> Option<&ConnectedDevice> {
        self.selected.as_ref()
    }

    /// `true` when the current selection came from the user rather than from
    /// an automatic rule.
    pub fn is_explicit(&self) -> bool {
        self.selected.is_some() && self.explicit
    }

    /// Select a connected device by serial on the user's behalf.
    pub fn select(
        &mut self,
        serial: &str,
        connected: &[ConnectedDevice],
    ) -> Result<&ConnectedDevice, SelectionError> {
        let device = connected
            .iter()
            .find(|d| d.serial_no == serial)
            .ok_or_else(|| SelectionError::NotConnected(serial.to_string()))?;
        self.explicit = true;
        Ok(self.selected.insert(device.clone()))
    }

    /// Drop the current selection.  The next [`reconcile`](Self::reconcile)
    /// re-applies rule 2.
    pub fn clear(&mut self) {
        self.selected = None;
        self.explicit = false;
    }

    /// Rule 3.  Returns `true` when `device` became the selection.
    pub fn on_device_connected(&mut self, device: &ConnectedDevice) -> bool {
        match &mut self.selected {
            Some(current) if current.serial_no == device.serial_no => {
                // Reconnecting the selected device refreshes its record.
                *current = device.clone();
                false
            }
            Some(_) => false,
            None => {
                self.selected = Some(device.clone());
                self.explicit = false;
                true
            }
        }
    }

    /// Rules 1, 2 and 4 against the connected set in registry order.
    ///
    /// Returns `true` when the selected serial changed.
    pub fn reconcile(&mut self, connected_in_order: &[ConnectedDevice]) -> bool {
        let before = self.selected.as_ref().map(|d| d.serial_no.clone());

        if let Some(current) = &self.selected {
            match connected_in_order
                .iter()
                .find(|d| d.serial_no == current.serial_no)
            {
                Some(latest) => {
                    // Still connected: keep it, but pick up record updates.
                    self.selected = Some(latest.clone());
                    return false;
                }
                None => self.clear(),
            }
        }

        if let Some(first) = connected_in_order.first() {
            self.selected = Some(first.clone());
            self.explicit = false;
        }

        before != self.selected.as_ref().map(|d| d.serial_no.clone())
    }
}
