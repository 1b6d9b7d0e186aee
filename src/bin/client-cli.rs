//! Command-line client entrypoint, grounded on
//! `original_source/client/` scripts that drive `BaseClient` interactively:
//! reserve/list/extend/end devices, or flash firmware onto held ones.

use std::time::Duration;

use serde_json::Value;

use usbipice::client::firmware_flasher::FirmwareFlasher;
use usbipice::client::Client;
use usbipice::config::{ClientCliConfig, ClientCommand};
use usbipice::device_adapter::linux::LinuxDeviceAdapter;
use usbipice::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let config = ClientCliConfig::parse();
    logging::init("client-cli", config.verbose, Some((config.control_server.clone(), config.client_name.clone())))?;

    let client = Client::new(
        config.control_server.clone(),
        config.client_name.clone(),
        std::sync::Arc::new(LinuxDeviceAdapter),
        Vec::new(),
    )
    .await;

    match config.command {
        ClientCommand::Reserve { amount, kind } => match client.reserve(amount, &kind, Value::Null).await {
            Some(serials) => {
                for serial in &serials {
                    println!("{serial}");
                }
                if serials.len() < amount as usize {
                    tracing::warn!(requested = amount, reserved = serials.len(), "fewer devices available than requested");
                }
            }
            None => {
                tracing::error!("reservation request failed");
                std::process::exit(1);
            }
        },
        ClientCommand::List => {
            for serial in client.api().serials() {
                println!("{serial}");
            }
        }
        ClientCommand::ExtendAll => match client.api().extend_all().await {
            Some(serials) => serials.iter().for_each(|s| println!("{s}")),
            None => {
                tracing::error!("extend-all failed");
                std::process::exit(1);
            }
        },
        ClientCommand::EndAll => match client.api().end_all().await {
            Some(serials) => serials.iter().for_each(|s| println!("{s}")),
            None => {
                tracing::error!("end-all failed");
                std::process::exit(1);
            }
        },
        ClientCommand::Flash { firmware } => {
            let serials = client.api().serials();
            if serials.is_empty() {
                tracing::warn!("no reserved devices to flash");
            } else {
                let flasher = std::sync::Arc::new(FirmwareFlasher::new());
                let _poll_loop = flasher.spawn_poll_loop();
                flasher.flash(&serials, &firmware).await;
                let (remaining, failed) = flasher.wait_until_finished(Some(Duration::from_secs(300))).await;
                for serial in &failed {
                    tracing::error!(serial, "flash failed");
                }
                for serial in &remaining {
                    tracing::warn!(serial, "flash did not complete before timeout");
                }
                if failed.is_empty() && remaining.is_empty() {
                    println!("flashed {} device(s)", serials.len());
                } else {
                    std::process::exit(1);
                }
            }
        }
    }

    client.stop().await;
    Ok(())
}
