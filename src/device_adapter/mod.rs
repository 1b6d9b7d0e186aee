//! The device adapter interface (spec.md §6): "five primitives with boolean
//! success": `bind`, `unbind`, `attach`, `port_listing`, and
//! `send_bootloader`. Also the busid parser (spec.md §6 Busid parsing,
//! GLOSSARY) and the firmware-flashing I/O primitives (mount/copy/unmount),
//! both named as out-of-scope externalities in spec.md §1 but needed as a
//! concrete trait boundary for `FlashState`/`FirmwareFlasher` to call
//! through.

pub mod linux;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DeviceAdapterError;
use crate::model::DeviceProperties;

/// USB-over-IP primitives (spec.md §6 Device adapter interface).
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    async fn bind(&self, busid: &str) -> bool;
    async fn unbind(&self, busid: &str) -> bool;
    async fn attach(&self, host_ip: &str, busid: &str, tcp_port: u16) -> bool;
    /// `port_listing() → { ip → [busid] }`.
    async fn port_listing(&self) -> HashMap<String, Vec<String>>;
    /// Vendor-specific baud-rate pulse that tells a device to enter its
    /// bootloader.
    async fn send_bootloader(&self, devnode: &str) -> bool;

    /// Currently-known device nodes, keyed by serial - used by
    /// `FlashState`/`UsbipState::start` to replay `add` events for devices
    /// that were already attached before the state was entered
    /// (spec.md §4.1, §4.2 "replays all currently-known device nodes").
    async fn known_devices(&self, serial: &str) -> Vec<DeviceProperties>;

    /// Opens `devnode` and reports whether it reads back the string
    /// `"default firmware"` within `wait` (spec.md §4.1 TestState). This is
    /// the only thing that distinguishes a device genuinely running the
    /// just-flashed default image from one that merely reappeared.
    async fn verify_default_firmware(&self, devnode: &str, wait: Duration) -> bool;
}

/// Mount/copy/unmount/verify primitives for writing firmware onto a device
/// exposing itself as a USB mass-storage bootloader partition
/// (spec.md §4.1 FlashState).
#[async_trait]
pub trait FirmwareIo: Send + Sync {
    async fn mount(&self, devnode: &str, mount_path: &str) -> Result<(), DeviceAdapterError>;
    async fn unmount(&self, mount_path: &str) -> Result<(), DeviceAdapterError>;
    /// Lists the immediate contents of a mounted directory, used to verify
    /// the bootloader marker files before copying firmware onto it.
    async fn list_dir(&self, mount_path: &str) -> Result<Vec<String>, DeviceAdapterError>;
    async fn copy_firmware(&self, firmware_path: &str, mount_path: &str) -> Result<(), DeviceAdapterError>;
}

/// The two accepted bootloader marker files a mounted partition must
/// contain exactly (spec.md §4.1 FlashState).
pub const BOOTLOADER_MARKERS: [&str; 2] = ["INDEX.HTM", "INFO_UF2.TXT"];

pub fn has_exact_bootloader_markers(entries: &[String]) -> bool {
    if entries.len() != BOOTLOADER_MARKERS.len() {
        return false;
    }
    BOOTLOADER_MARKERS
        .iter()
        .all(|marker| entries.iter().any(|e| e.eq_ignore_ascii_case(marker)))
}

/// Parses a busid from a `DEVPATH` string (spec.md §6 Busid parsing,
/// GLOSSARY). Two accepted forms:
/// - `/usb1/<…>/<BUSID>[:/$]` (user-space form, busid is not the last path
///   component)
/// - `/usb1/<BUSID>$` (busid is the last path component)
///
/// where `BUSID` matches `[0-9]-([0-9]|\.)+`.
pub fn parse_busid(devpath: &str) -> Option<String> {
    let usb_marker = devpath.find("/usb")?;
    let rest = &devpath[usb_marker..];
    // Drop the leading "/usbN" segment, keep the remainder as candidate
    // path components to scan for a busid-shaped token.
    let mut components = rest.split('/').filter(|s| !s.is_empty());
    components.next()?; // "usbN"

    let remaining: Vec<&str> = components.collect();
    for component in remaining.iter().rev() {
        let candidate = component.split(':').next().unwrap_or(component);
        if is_busid_shaped(candidate) {
            return Some(candidate.to_string());
        }
    }
    None
}

fn is_busid_shaped(candidate: &str) -> bool {
    let Some((bus, rest)) = candidate.split_once('-') else {
        return false;
    };
    if bus.is_empty() || !bus.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    if rest.is_empty() {
        return false;
    }
    rest.chars().all(|c| c.is_ascii_digit() || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_userspace_form() {
        assert_eq!(
            parse_busid("/devices/pci0000:00/usb1/1-2/1-2.3:1.0"),
            Some("1-2.3".to_string())
        );
    }

    #[test]
    fn parses_trailing_busid_form() {
        assert_eq!(parse_busid("/devices/pci0000:00/usb1/1-2"), Some("1-2".to_string()));
    }

    #[test]
    fn rejects_non_busid_paths() {
        assert_eq!(parse_busid("/devices/pci0000:00/usb1"), None);
        assert_eq!(parse_busid("not a devpath at all"), None);
    }

    #[test]
    fn markers_must_match_exactly() {
        assert!(has_exact_bootloader_markers(&[
            "INDEX.HTM".to_string(),
            "INFO_UF2.TXT".to_string()
        ]));
        assert!(!has_exact_bootloader_markers(&["FOO.TXT".to_string()]));
        assert!(!has_exact_bootloader_markers(&[
            "INDEX.HTM".to_string(),
            "INFO_UF2.TXT".to_string(),
            "EXTRA.TXT".to_string()
        ]));
    }
}
