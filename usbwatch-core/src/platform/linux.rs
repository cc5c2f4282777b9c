//! Linux backend: udev netlink monitor
//!
//! Devices are keyed by their device node (`/dev/bus/usb/001/004`). Only
//! `usb_device` nodes are considered; interface nodes are filtered out by the
//! kernel-side monitor match.

use std::ffi::OsStr;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use tracing::{debug, trace};

use super::ids::{location_from_sysname, parse_hex_u16, parse_product_property};
use crate::error::HotplugError;
use crate::source::{Backend, HotplugSource, RawEvent};
use crate::types::{DeviceRecord, PartialRecord};

const SUBSYSTEM: &str = "usb";
const DEVTYPE: &str = "usb_device";

/// Hotplug backend on top of libudev
#[derive(Debug, Clone, Copy, Default)]
pub struct UdevBackend;

impl Backend for UdevBackend {
    type Source = UdevSource;

    fn name(&self) -> &'static str {
        "udev"
    }

    fn open(&self) -> Result<UdevSource, HotplugError> {
        let socket = udev::MonitorBuilder::new()
            .and_then(|b| b.match_subsystem_devtype(SUBSYSTEM, DEVTYPE))
            .and_then(|b| b.listen())
            .map_err(|e| HotplugError::PlatformUnavailable(format!("udev monitor: {}", e)))?;
        debug!("udev monitor listening on fd {}", socket.as_raw_fd());
        Ok(UdevSource { socket })
    }
}

/// Open netlink monitor socket
pub struct UdevSource {
    socket: udev::MonitorSocket,
}

impl HotplugSource for UdevSource {
    fn enumerate(&mut self) -> Result<Vec<(String, DeviceRecord)>, HotplugError> {
        let mut enumerator = udev::Enumerator::new()?;
        enumerator.match_subsystem(SUBSYSTEM)?;
        enumerator.match_property("DEVTYPE", DEVTYPE)?;

        let mut devices = Vec::new();
        for device in enumerator.scan_devices()? {
            let Some(key) = device_key(&device) else {
                continue;
            };
            let record = read_record(&key, &device);
            devices.push((key, record));
        }
        Ok(devices)
    }

    fn wait(&mut self, timeout: Duration) -> Result<Vec<RawEvent>, HotplugError> {
        let mut fds = libc::pollfd {
            fd: self.socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;

        // SAFETY: `fds` is a valid pollfd for the duration of the call
        let ret = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err.into());
        }
        if ret == 0 || !readable(fds.revents)? {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        for event in self.socket.iter() {
            if event.devtype() != Some(OsStr::new(DEVTYPE)) {
                continue;
            }
            let Some(key) = device_key(&event) else {
                continue;
            };
            match event.event_type() {
                udev::EventType::Add => {
                    let record = read_record(&key, &event);
                    events.push(RawEvent::Added { key, record });
                }
                udev::EventType::Remove => events.push(RawEvent::Removed {
                    fallback: removal_fallback(&event),
                    key,
                }),
                other => trace!("Ignoring {:?} for {}", other, key),
            }
        }
        Ok(events)
    }
}

/// Whether a ready descriptor has data; error conditions without data fail
/// so the caller backs off instead of polling again at once
fn readable(revents: libc::c_short) -> Result<bool, HotplugError> {
    if revents & libc::POLLIN != 0 {
        return Ok(true);
    }
    if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        return Err(std::io::Error::other(format!(
            "udev monitor socket reported poll condition {:#x}",
            revents
        ))
        .into());
    }
    Ok(false)
}

fn device_key(device: &udev::Device) -> Option<String> {
    device
        .devnode()
        .map(|node| node.to_string_lossy().into_owned())
}

fn attr(device: &udev::Device, name: &str) -> Option<String> {
    device
        .attribute_value(name)
        .map(|v| v.to_string_lossy().trim().to_string())
        .filter(|v| !v.is_empty())
}

fn prop(device: &udev::Device, name: &str) -> Option<String> {
    device
        .property_value(name)
        .map(|v| v.to_string_lossy().trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Build a record from sysfs attributes, falling back to udev properties
///
/// Unreadable IDs are left at zero; the device is still registered.
fn read_record(key: &str, device: &udev::Device) -> DeviceRecord {
    let vendor_id = hex_attr(key, device, "idVendor");
    let product_id = hex_attr(key, device, "idProduct");

    let name = attr(device, "product")
        .or_else(|| prop(device, "ID_MODEL"))
        .unwrap_or_default();
    let manufacturer = attr(device, "manufacturer")
        .or_else(|| prop(device, "ID_VENDOR"))
        .unwrap_or_default();
    let serial = attr(device, "serial")
        .or_else(|| prop(device, "ID_SERIAL_SHORT"))
        .unwrap_or_default();

    let location = location_from_sysname(&device.sysname().to_string_lossy()).unwrap_or(0);
    let address = attr(device, "devnum")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    DeviceRecord::new(vendor_id, product_id)
        .with_name(name)
        .with_manufacturer(manufacturer)
        .with_serial(serial)
        .with_location(location, address)
}

fn hex_attr(key: &str, device: &udev::Device, name: &str) -> u16 {
    match attr(device, name).and_then(|v| parse_hex_u16(&v)) {
        Some(id) => id,
        None => {
            debug!("{}", HotplugError::device_read(key, format!("{} unreadable", name)));
            0
        }
    }
}

/// What a remove event carries once sysfs is already gone
fn removal_fallback(device: &udev::Device) -> PartialRecord {
    let product = prop(device, "PRODUCT").and_then(|p| parse_product_property(&p));

    PartialRecord {
        location_id: location_from_sysname(&device.sysname().to_string_lossy()),
        vendor_id: prop(device, "ID_VENDOR_ID")
            .and_then(|v| parse_hex_u16(&v))
            .or(product.map(|(vid, _)| vid)),
        product_id: prop(device, "ID_MODEL_ID")
            .and_then(|v| parse_hex_u16(&v))
            .or(product.map(|(_, pid)| pid)),
        device_name: prop(device, "ID_MODEL"),
        manufacturer: prop(device, "ID_VENDOR"),
        serial_number: prop(device, "ID_SERIAL_SHORT"),
        device_address: prop(device, "DEVNUM").and_then(|v| v.parse().ok()),
    }
}
