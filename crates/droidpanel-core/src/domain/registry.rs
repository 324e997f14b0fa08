//! The device registry reducer.
//!
//! [`unify`] merges the snapshots of every device source plus the paired
//! device list into a single list the user can act on.  It is a pure function:
//! the same inputs always produce the same output, so the desktop application
//! can re-run it after every change without carrying hidden state.
//!
//! # Ordering
//!
//! Connected devices come first, then every other entry by display name.
//! Names are collated the way a desktop locale sorts them: letters compare
//! case-insensitively first (`Alpha`, `pixel`, `Zed`), and only names that
//! differ in case alone fall back to lower-case-first.  Entries with the same
//! display name are ordered by `id`, which makes the output independent of
//! source ordering for distinct identities.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use super::device::{
    ConnectedDevice, DiscoveredUsbDevice, DiscoveredWirelessDevice, EmulatorImage, PairedDevice,
};
use crate::settings::DevicesSettings;

/// Category tag of a unified entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceCategory {
    Connected,
    Usb,
    Wireless,
    Paired,
    Emulator,
}

impl DeviceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceCategory::Connected => "connected",
            DeviceCategory::Usb => "usb",
            DeviceCategory::Wireless => "wireless",
            DeviceCategory::Paired => "paired",
            DeviceCategory::Emulator => "emulator",
        }
    }
}

/// The source record an entry was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum SourceData {
    Connected(ConnectedDevice),
    Usb(DiscoveredUsbDevice),
    Wireless(DiscoveredWirelessDevice),
    Paired(PairedDevice),
    Emulator(EmulatorImage),
}

/// One row of the unified device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedDeviceEntry {
    /// `<category>:<source identity>`, unique within one list.
    pub id: String,
    pub category: DeviceCategory,
    pub display_name: String,
    pub subtitle: String,
    pub is_connected: bool,
    pub source_data: SourceData,
}

/// The settings that change what the registry shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryPolicy {
    pub auto_discover_usb: bool,
    pub show_unpaired_devices: bool,
}

impl Default for RegistryPolicy {
    fn default() -> Self {
        Self::from(&DevicesSettings::default())
    }
}

impl From<&DevicesSettings> for RegistryPolicy {
    fn from(devices: &DevicesSettings) -> Self {
        Self {
            auto_discover_usb: devices.auto_discover_usb,
            show_unpaired_devices: devices.show_unpaired_devices,
        }
    }
}

/// Merge all source snapshots into one sorted, de-duplicated list.
///
/// Duplicate identities inside one source collapse to their first occurrence.
/// The same physical device may still appear under two categories (for
/// example `usb` and `connected` between two polls).
pub fn unify(
    connected: &[ConnectedDevice],
    usb: &[DiscoveredUsbDevice],
    wireless: &[DiscoveredWirelessDevice],
    paired: &[PairedDevice],
    emulators: &[EmulatorImage],
    policy: RegistryPolicy,
) -> Vec<UnifiedDeviceEntry> {
    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(
        connected.len() + usb.len() + wireless.len() + paired.len() + emulators.len(),
    );
    let mut push = |entry: UnifiedDeviceEntry| {
        if seen.insert(entry.id.clone()) {
            entries.push(entry);
        }
    };

    connected.iter().map(connected_entry).for_each(&mut push);
    emulators.iter().map(emulator_entry).for_each(&mut push);

    if policy.auto_discover_usb {
        usb.iter()
            .filter(|device| !device.is_connected)
            .map(usb_entry)
            .for_each(&mut push);
    }

    paired.iter().map(paired_entry).for_each(&mut push);

    if policy.show_unpaired_devices {
        wireless
            .iter()
            .filter(|device| !device.is_paired)
            .map(wireless_entry)
            .for_each(&mut push);
    }

    entries.sort_by(compare_entries);
    entries
}

/// The connected devices in the order [`unify`] lists them.
///
/// The selection rules pick "the first connected device in registry order";
/// this lets callers apply them without building the full list.
pub fn connected_in_registry_order(connected: &[ConnectedDevice]) -> Vec<ConnectedDevice> {
    let mut seen = HashSet::new();
    let mut entries: Vec<UnifiedDeviceEntry> = connected
        .iter()
        .map(connected_entry)
        .filter(|entry| seen.insert(entry.id.clone()))
        .collect();
    entries.sort_by(compare_entries);
    entries
        .into_iter()
        .filter_map(|entry| match entry.source_data {
            SourceData::Connected(device) => Some(device),
            _ => None,
        })
        .collect()
}

fn compare_entries(a: &UnifiedDeviceEntry, b: &UnifiedDeviceEntry) -> Ordering {
    b.is_connected
        .cmp(&a.is_connected)
        .then_with(|| collate_names(&a.display_name, &b.display_name))
        .then_with(|| a.id.cmp(&b.id))
}

/// Case-insensitive comparison, then lower-case before upper-case, then bytes.
fn collate_names(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
        .then_with(|| {
            a.chars()
                .map(char::is_uppercase)
                .cmp(b.chars().map(char::is_uppercase))
        })
        .then_with(|| a.cmp(b))
}

fn entry_id(category: DeviceCategory, identity: &str) -> String {
    format!("{}:{}", category.as_str(), identity)
}

// ── Per-category entry builders ───────────────────────────────────────────────

fn connected_entry(device: &ConnectedDevice) -> UnifiedDeviceEntry {
    UnifiedDeviceEntry {
        id: entry_id(DeviceCategory::Connected, &device.serial_no),
        category: DeviceCategory::Connected,
        display_name: device.display_name().to_string(),
        subtitle: format!(
            "Android {} \u{2022} API {}",
            device.android_version, device.api_level
        ),
        is_connected: true,
        source_data: SourceData::Connected(device.clone()),
    }
}

fn emulator_entry(image: &EmulatorImage) -> UnifiedDeviceEntry {
    UnifiedDeviceEntry {
        id: entry_id(DeviceCategory::Emulator, &image.name),
        category: DeviceCategory::Emulator,
        display_name: image.display_name(),
        subtitle: "Emulator".to_string(),
        is_connected: false,
        source_data: SourceData::Emulator(image.clone()),
    }
}

fn usb_entry(device: &DiscoveredUsbDevice) -> UnifiedDeviceEntry {
    UnifiedDeviceEntry {
        id: entry_id(DeviceCategory::Usb, &device.identity()),
        category: DeviceCategory::Usb,
        display_name: device.display_name().to_string(),
        subtitle: "USB Device".to_string(),
        is_connected: false,
        source_data: SourceData::Usb(device.clone()),
    }
}

fn paired_entry(device: &PairedDevice) -> UnifiedDeviceEntry {
    let subtitle = match DateTime::from_timestamp_millis(device.last_connected) {
        Some(at) => format!("Paired \u{2022} Last: {}", at.format("%Y-%m-%d")),
        None => "Paired".to_string(),
    };
    UnifiedDeviceEntry {
        id: entry_id(DeviceCategory::Paired, &device.id.to_string()),
        category: DeviceCategory::Paired,
        display_name: device.name.clone(),
        subtitle,
        is_connected: false,
        source_data: SourceData::Paired(device.clone()),
    }
}

fn wireless_entry(device: &DiscoveredWirelessDevice) -> UnifiedDeviceEntry {
    UnifiedDeviceEntry {
        id: entry_id(DeviceCategory::Wireless, &device.identity()),
        category: DeviceCategory::Wireless,
        display_name: device.name.clone(),
        subtitle: "Discovered".to_string(),
        is_connected: false,
        source_data: SourceData::Wireless(device.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::device::{ConnectionMethod, PairingMethod, Transport};
    use std::net::{IpAddr, Ipv4Addr};
    use uuid::Uuid;

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn connected(serial: &str, model: &str) -> ConnectedDevice {
        ConnectedDevice {
            transport: Transport::Usb,
            serial_no: serial.to_string(),
            model: model.to_string(),
            android_version: "14".to_string(),
            api_level: "34".to_string(),
        }
    }

    fn wireless(name: &str, last_octet: u8, is_paired: bool) -> DiscoveredWirelessDevice {
        DiscoveredWirelessDevice {
            name: name.to_string(),
            fullname: format!("adb-{name}._adb-tls-pairing._tcp"),
            addresses: vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, last_octet))],
            port: 40_000,
            is_paired,
            is_connected: false,
        }
    }

    fn paired(name: &str, last_connected: i64) -> PairedDevice {
        PairedDevice {
            id: Uuid::new_v4(),
            name: name.to_string(),
            ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)),
            port: 5555,
            last_connected,
            pairing_method: PairingMethod::PairingCode,
        }
    }

    fn all_on() -> RegistryPolicy {
        RegistryPolicy {
            auto_discover_usb: true,
            show_unpaired_devices: true,
        }
    }

    // ── unify ─────────────────────────────────────────────────────────────────

    #[test]
    fn test_unify_places_connected_entries_first() {
        // Arrange
        let emulators = vec![EmulatorImage::new("Aardvark_API_30")];
        let devices = vec![connected("ZZZ", "Zephyr")];

        // Act
        let entries = unify(&devices, &[], &[], &[], &emulators, all_on());

        // Assert
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].category, DeviceCategory::Connected);
        assert!(entries[0].is_connected);
        assert_eq!(entries[1].category, DeviceCategory::Emulator);
        assert_eq!(entries[1].display_name, "Aardvark");
    }

    #[test]
    fn test_unify_sorts_display_names_ignoring_case() {
        let emulators = vec![
            EmulatorImage::new("pixel"),
            EmulatorImage::new("Zed"),
            EmulatorImage::new("Alpha"),
        ];

        let entries = unify(&[], &[], &[], &[], &emulators, all_on());
        let names: Vec<_> = entries.iter().map(|e| e.display_name.as_str()).collect();

        assert_eq!(names, vec!["Alpha", "pixel", "Zed"]);
    }

    #[test]
    fn test_unify_puts_lower_case_first_when_names_differ_only_in_case() {
        // Arrange
        let devices = vec![
            connected("serial-1", "Pixel"),
            connected("serial-2", "pixel"),
            connected("serial-3", "PIXEL"),
        ];

        // Act
        let entries = unify(&devices, &[], &[], &[], &[], all_on());
        let names: Vec<_> = entries.iter().map(|e| e.display_name.as_str()).collect();

        // Assert
        assert_eq!(names, vec!["pixel", "Pixel", "PIXEL"]);
    }

    #[test]
    fn test_collate_names_orders_by_letters_before_case() {
        assert_eq!(collate_names("apple", "Banana"), Ordering::Less);
        assert_eq!(collate_names("Galaxy S21", "galaxy s22"), Ordering::Less);
        assert_eq!(collate_names("moto", "Moto"), Ordering::Less);
        assert_eq!(collate_names("Moto", "Moto"), Ordering::Equal);
    }

    #[test]
    fn test_unify_breaks_display_name_ties_by_id() {
        let devices = vec![connected("serial-b", "Pixel"), connected("serial-a", "Pixel")];

        let entries = unify(&devices, &[], &[], &[], &[], all_on());

        assert_eq!(entries[0].id, "connected:serial-a");
        assert_eq!(entries[1].id, "connected:serial-b");
    }

    #[test]
    fn test_unify_hides_usb_entries_flagged_connected() {
        let mut plugged = DiscoveredUsbDevice::usb("ABC", Some("Galaxy".to_string()));
        plugged.is_connected = true;
        let fresh = DiscoveredUsbDevice::usb("DEF", None);

        let entries = unify(&[], &[plugged, fresh], &[], &[], &[], all_on());

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "usb:DEF");
        assert_eq!(entries[0].display_name, "Unknown Device");
        assert_eq!(entries[0].subtitle, "USB Device");
    }

    #[test]
    fn test_unify_omits_usb_entries_when_usb_discovery_disabled() {
        let usb = vec![DiscoveredUsbDevice::usb("ABC", None)];
        let policy = RegistryPolicy {
            auto_discover_usb: false,
            show_unpaired_devices: true,
        };

        let entries = unify(&[], &usb, &[], &[], &[], policy);

        assert!(entries.is_empty());
    }

    #[test]
    fn test_unify_show_unpaired_toggle_controls_wireless_entries() {
        let wireless_devices = vec![wireless("Pixel", 10, false), wireless("Tab", 11, true)];

        let shown = unify(&[], &[], &wireless_devices, &[], &[], all_on());
        let hidden = unify(
            &[],
            &[],
            &wireless_devices,
            &[],
            &[],
            RegistryPolicy {
                auto_discover_usb: true,
                show_unpaired_devices: false,
            },
        );

        // The already-paired advertisement never shows; the unpaired one only
        // while the toggle is on.
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].id, "wireless:192.168.1.10:40000");
        assert_eq!(shown[0].subtitle, "Discovered");
        assert!(hidden.is_empty());
    }

    #[test]
    fn test_unify_paired_subtitle_shows_last_connected_date() {
        // 2024-03-05T12:00:00Z
        let device = paired("Office phone", 1_709_640_000_000);

        let entries = unify(&[], &[], &[], &[device.clone()], &[], all_on());

        assert_eq!(entries[0].id, format!("paired:{}", device.id));
        assert_eq!(entries[0].subtitle, "Paired \u{2022} Last: 2024-03-05");
    }

    #[test]
    fn test_unify_connected_subtitle_shows_version_and_api() {
        let entries = unify(&[connected("X1", "Pixel 8")], &[], &[], &[], &[], all_on());
        assert_eq!(entries[0].subtitle, "Android 14 \u{2022} API 34");
    }

    #[test]
    fn test_unify_collapses_duplicate_identities_to_first_occurrence() {
        let first = DiscoveredUsbDevice::usb("DUP", Some("First".to_string()));
        let second = DiscoveredUsbDevice::usb("DUP", Some("Second".to_string()));

        let entries = unify(&[], &[first, second], &[], &[], &[], all_on());

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].display_name, "First");
    }

    #[test]
    fn test_unify_allows_same_device_under_two_categories() {
        let serial = "R58M";
        let usb = vec![DiscoveredUsbDevice {
            connection_method: ConnectionMethod::Usb {
                serial_number: serial.to_string(),
            },
            model: Some("Galaxy".to_string()),
            android_version: None,
            api_level: None,
            is_connected: false,
        }];

        let entries = unify(&[connected(serial, "Galaxy")], &usb, &[], &[], &[], all_on());

        let ids: Vec<_> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["connected:R58M", "usb:R58M"]);
    }

    #[test]
    fn test_connected_in_registry_order_matches_unify_prefix() {
        let devices = vec![
            connected("c", "Moto"),
            connected("a", "Galaxy"),
            connected("b", "Galaxy"),
        ];

        let ordered = connected_in_registry_order(&devices);
        let entries = unify(&devices, &[], &[], &[], &[], all_on());

        let from_unify: Vec<_> = entries
            .iter()
            .filter_map(|e| match &e.source_data {
                SourceData::Connected(d) => Some(d.serial_no.clone()),
                _ => None,
            })
            .collect();
        let serials: Vec<_> = ordered.iter().map(|d| d.serial_no.clone()).collect();
        assert_eq!(serials, from_unify);
        assert_eq!(serials, vec!["a", "b", "c"]);
    }
}
