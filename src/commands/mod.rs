//! Command handlers for the CLI application.
//!
//! - `list`: one-shot listing of attached devices
//! - `monitor`: live attach/detach stream
//! - `config`: show or initialise the config file

pub mod config;
pub mod list;
pub mod monitor;

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use usbwatch_core::{ChangeEvent, DeviceRecord};

/// Result type for command handlers
pub type CommandResult = anyhow::Result<()>;

/// Setup Ctrl+C handler and return the running flag
pub fn setup_interrupt_handler() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    if let Err(e) = ctrlc::set_handler(move || {
        running_clone.store(false, Ordering::SeqCst);
    }) {
        eprintln!("Warning: Could not set Ctrl+C handler: {e}");
    }

    running
}

/// Sort by location, then VID/PID, so listings are stable
pub fn sort_devices(devices: &mut [DeviceRecord]) {
    devices.sort_by_key(|d| (d.location_id, d.vendor_id, d.product_id, d.device_address));
}

/// One-line text form of a device
pub fn format_device(device: &DeviceRecord) -> String {
    let mut line = device.to_string();
    if !device.serial_number.is_empty() {
        line.push_str(&format!(" serial={}", device.serial_number));
    }
    if device.location_id != 0 {
        line.push_str(&format!(" loc={:#010x}", device.location_id));
    }
    if device.device_address != 0 {
        line.push_str(&format!(" addr={}", device.device_address));
    }
    line
}

/// One-line text form of a change event
pub fn format_event(event: &ChangeEvent) -> String {
    let mut line = format!("{:<6} {}", event.kind.as_str(), format_device(&event.record));
    if let Some(partial) = &event.reconstructed {
        line.push_str(&format!(
            " [unregistered, missing {}]",
            partial.missing_fields().join(",")
        ));
    }
    line
}

/// JSON line for a change event
#[derive(Serialize)]
pub struct EventLine<'a> {
    pub event: &'static str,
    #[serde(flatten)]
    pub device: &'a DeviceRecord,
    pub reconstructed: bool,
}

impl<'a> From<&'a ChangeEvent> for EventLine<'a> {
    fn from(event: &'a ChangeEvent) -> Self {
        Self {
            event: event.kind.as_str(),
            device: &event.record,
            reconstructed: event.is_reconstructed(),
        }
    }
}
