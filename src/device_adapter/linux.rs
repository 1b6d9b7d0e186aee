//! Linux device adapter: `usbip` CLI subprocess for bind/unbind/attach/port
//! listing, `nusb` for device-node enumeration (the "host-side device-node
//! discovery mechanism" spec.md §1 treats as out of scope but which a
//! runnable worker still needs a concrete instance of), and plain
//! subprocesses for mount/copy/unmount (spec.md §1 "firmware-flashing I/O
//! primitives").

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use nusb::MaybeFuture;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::DeviceAdapterError;
use crate::model::DeviceProperties;

use super::{DeviceAdapter, FirmwareIo};

/// Bounded timeout for every external command this adapter shells out to,
/// per spec.md §5 ("every external command uses a bounded timeout (5-30s
/// depending on the command)").
const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Default)]
pub struct LinuxDeviceAdapter;

async fn run(cmd: &str, args: &[&str]) -> Result<bool, DeviceAdapterError> {
    let output = timeout(COMMAND_TIMEOUT, Command::new(cmd).args(args).output())
        .await
        .map_err(|_| DeviceAdapterError::SubprocessFailed(format!("{cmd} timed out")))??;

    if !output.status.success() {
        debug!(
            cmd,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "subprocess exited non-zero"
        );
    }
    Ok(output.status.success())
}

#[async_trait]
impl DeviceAdapter for LinuxDeviceAdapter {
    async fn bind(&self, busid: &str) -> bool {
        run("usbip", &["bind", "-b", busid]).await.unwrap_or(false)
    }

    async fn unbind(&self, busid: &str) -> bool {
        run("usbip", &["unbind", "-b", busid]).await.unwrap_or(false)
    }

    async fn attach(&self, host_ip: &str, busid: &str, tcp_port: u16) -> bool {
        let port = tcp_port.to_string();
        run(
            "usbip",
            &["attach", "-r", host_ip, "-b", busid, "-t", &port],
        )
        .await
        .unwrap_or(false)
    }

    async fn port_listing(&self) -> HashMap<String, Vec<String>> {
        let output = match timeout(COMMAND_TIMEOUT, Command::new("usbip").arg("port").output()).await {
            Ok(Ok(out)) if out.status.success() => out.stdout,
            _ => {
                warn!("failed to query usbip port listing");
                return HashMap::new();
            }
        };
        parse_port_listing(&String::from_utf8_lossy(&output))
    }

    async fn send_bootloader(&self, devnode: &str) -> bool {
        // The classic 1200-baud-touch bootloader trigger: open the tty at
        // 1200 baud and close it again.
        run("stty", &["-F", devnode, "1200"]).await.unwrap_or(false)
    }

    async fn known_devices(&self, serial: &str) -> Vec<DeviceProperties> {
        let Ok(devices) = nusb::list_devices().wait() else {
            return Vec::new();
        };

        devices
            .filter(|info| info.serial_number() == Some(serial))
            .map(|info| {
                let mut props = DeviceProperties::new();
                props.insert(
                    "DEVPATH".to_string(),
                    info.sysfs_path().to_string_lossy().into_owned(),
                );
                props.insert(
                    "DEVNAME".to_string(),
                    format!("/dev/bus/usb/{:03}/{:03}", info.busnum(), info.device_address()),
                );
                props.insert("SUBSYSTEM".to_string(), "usb".to_string());
                props.insert(
                    "ID_VENDOR_ID".to_string(),
                    format!("{:04x}", info.vendor_id()),
                );
                props.insert("ID_SERIAL_SHORT".to_string(), serial.to_string());
                props
            })
            .collect()
    }

    async fn verify_default_firmware(&self, devnode: &str, wait: Duration) -> bool {
        let Ok(mut file) = tokio::fs::File::open(devnode).await else {
            return false;
        };

        let mut buf = [0u8; 256];
        match timeout(wait, file.read(&mut buf)).await {
            Ok(Ok(n)) => String::from_utf8_lossy(&buf[..n]).contains("default firmware"),
            _ => false,
        }
    }
}

/// Parses `usbip port` output of the form:
/// ```text
/// Imported USB devices
/// ====================
/// Port 00: <Port in Use> at Full Speed(12Mbps)
///        unknown vendor : unknown product (1234:5678)
///        1-2.3 -> usbip://10.0.0.1:3240/1-2.3
/// ```
/// into `{ ip → [busid] }`.
fn parse_port_listing(output: &str) -> HashMap<String, Vec<String>> {
    let mut result: HashMap<String, Vec<String>> = HashMap::new();
    for line in output.lines() {
        let line = line.trim();
        let Some(arrow) = line.find("-> usbip://") else {
            continue;
        };
        let busid = line[..arrow].trim().to_string();
        let rest = &line[arrow + "-> usbip://".len()..];
        let Some(colon) = rest.find(':') else {
            continue;
        };
        let ip = rest[..colon].to_string();
        result.entry(ip).or_default().push(busid);
    }
    result
}

/// Enumerates every currently-attached device, grouped by serial number.
/// Used by `DeviceManager::scan` to discover devices it has not seen
/// before - a poll-based stand-in for the original's netlink monitor,
/// since the dependency stack carries no direct udev/netlink binding.
pub async fn enumerate_devices() -> Vec<(String, DeviceProperties)> {
    let Ok(devices) = nusb::list_devices().wait() else {
        return Vec::new();
    };

    devices
        .filter_map(|info| {
            let serial = info.serial_number()?.to_string();
            let mut props = DeviceProperties::new();
            props.insert("DEVPATH".to_string(), info.sysfs_path().to_string_lossy().into_owned());
            props.insert(
                "DEVNAME".to_string(),
                format!("/dev/bus/usb/{:03}/{:03}", info.busnum(), info.device_address()),
            );
            props.insert("SUBSYSTEM".to_string(), "usb".to_string());
            props.insert("ID_SERIAL_SHORT".to_string(), serial.clone());
            Some((serial, props))
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct FsFirmwareIo;

#[async_trait]
impl FirmwareIo for FsFirmwareIo {
    async fn mount(&self, devnode: &str, mount_path: &str) -> Result<(), DeviceAdapterError> {
        let ok = timeout(
            COMMAND_TIMEOUT,
            Command::new("mount").args([devnode, mount_path]).status(),
        )
        .await
        .map_err(|_| DeviceAdapterError::SubprocessFailed("mount timed out".to_string()))??
        .success();

        if ok {
            Ok(())
        } else {
            Err(DeviceAdapterError::SubprocessFailed(format!("mount {devnode}")))
        }
    }

    async fn unmount(&self, mount_path: &str) -> Result<(), DeviceAdapterError> {
        let ok = timeout(COMMAND_TIMEOUT, Command::new("umount").arg(mount_path).status())
            .await
            .map_err(|_| DeviceAdapterError::SubprocessFailed("umount timed out".to_string()))??
            .success();

        if ok {
            Ok(())
        } else {
            Err(DeviceAdapterError::SubprocessFailed(format!("umount {mount_path}")))
        }
    }

    async fn list_dir(&self, mount_path: &str) -> Result<Vec<String>, DeviceAdapterError> {
        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(mount_path).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            entries.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(entries)
    }

    async fn copy_firmware(&self, firmware_path: &str, mount_path: &str) -> Result<(), DeviceAdapterError> {
        let file_name = std::path::Path::new(firmware_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "firmware.uf2".to_string());
        let dest = std::path::Path::new(mount_path).join(file_name);
        tokio::fs::copy(firmware_path, dest).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_port_listing() {
        let sample = "Imported USB devices\n\
                       ====================\n\
                       Port 00: <Port in Use> at Full Speed(12Mbps)\n\
                       \tunknown vendor : unknown product (1234:5678)\n\
                       \t1-2.3 -> usbip://10.0.0.1:3240/1-2.3\n";
        let parsed = parse_port_listing(sample);
        assert_eq!(parsed.get("10.0.0.1").map(Vec::as_slice), Some(&["1-2.3".to_string()][..]));
    }
}
