//! `usbwatch list`

use anyhow::Context;
use tracing::debug;
use usbwatch_core::{DeviceFilter, Monitor};

use super::{format_device, sort_devices, CommandResult};
use crate::config::AppConfig;

/// Start a monitor just long enough to read the registry, then print it
pub fn run(config: &AppConfig, filter: DeviceFilter, json: bool) -> CommandResult {
    let monitor = Monitor::with_config(config.monitor.clone());
    monitor
        .start(|event| debug!("Change during listing: {:?}", event.kind))
        .context("Failed to start USB hotplug monitor")?;
    let mut devices = monitor.find(&filter);
    monitor.stop();

    sort_devices(&mut devices);

    if json || config.output.json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No matching USB devices found");
        return Ok(());
    }

    println!("Found {} USB device(s):", devices.len());
    for device in &devices {
        println!("  {}", format_device(device));
    }
    Ok(())
}
