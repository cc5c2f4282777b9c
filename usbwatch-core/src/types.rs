//! Common types for the hotplug engine

use serde::{Deserialize, Serialize};

/// Canonical description of one attached USB device
///
/// Produced once by a platform listener and then only cloned. Fields a
/// platform cannot supply are left empty or zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Bus topology location (`bus << 24 | port nibbles` where available)
    pub location_id: u32,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Product string or OS display name
    pub device_name: String,
    /// Manufacturer string
    pub manufacturer: String,
    /// Serial number string
    pub serial_number: String,
    /// Address of the device on its bus
    pub device_address: u32,
}

impl DeviceRecord {
    /// Create a record with only the VID/PID pair filled in
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = manufacturer.into();
        self
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = serial.into();
        self
    }

    pub fn with_location(mut self, location_id: u32, device_address: u32) -> Self {
        self.location_id = location_id;
        self.device_address = device_address;
        self
    }
}

impl std::fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)?;
        if !self.device_name.is_empty() {
            write!(f, " {}", self.device_name)?;
        }
        if !self.manufacturer.is_empty() {
            write!(f, " ({})", self.manufacturer)?;
        }
        Ok(())
    }
}

/// Best-effort record rebuilt for a removal whose key was never registered
///
/// Unlike [`DeviceRecord`], every field records whether the platform
/// actually supplied it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialRecord {
    pub location_id: Option<u32>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub device_name: Option<String>,
    pub manufacturer: Option<String>,
    pub serial_number: Option<String>,
    pub device_address: Option<u32>,
}

impl PartialRecord {
    /// Zero-fill absent fields to produce a canonical record
    pub fn to_record(&self) -> DeviceRecord {
        DeviceRecord {
            location_id: self.location_id.unwrap_or(0),
            vendor_id: self.vendor_id.unwrap_or(0),
            product_id: self.product_id.unwrap_or(0),
            device_name: self.device_name.clone().unwrap_or_default(),
            manufacturer: self.manufacturer.clone().unwrap_or_default(),
            serial_number: self.serial_number.clone().unwrap_or_default(),
            device_address: self.device_address.unwrap_or(0),
        }
    }

    /// Names of the fields the platform could not supply
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.location_id.is_none() {
            missing.push("locationId");
        }
        if self.vendor_id.is_none() {
            missing.push("vendorId");
        }
        if self.product_id.is_none() {
            missing.push("productId");
        }
        if self.device_name.is_none() {
            missing.push("deviceName");
        }
        if self.manufacturer.is_none() {
            missing.push("manufacturer");
        }
        if self.serial_number.is_none() {
            missing.push("serialNumber");
        }
        if self.device_address.is_none() {
            missing.push("deviceAddress");
        }
        missing
    }
}

impl From<DeviceRecord> for PartialRecord {
    fn from(record: DeviceRecord) -> Self {
        Self {
            location_id: Some(record.location_id),
            vendor_id: Some(record.vendor_id),
            product_id: Some(record.product_id),
            device_name: Some(record.device_name),
            manufacturer: Some(record.manufacturer),
            serial_number: Some(record.serial_number),
            device_address: Some(record.device_address),
        }
    }
}

/// VID/PID filter applied by queries
///
/// `(0, 0)` matches everything, `(vid, 0)` matches a vendor and `(vid, pid)`
/// the exact pair. `(0, pid)` is not a valid filter and matches everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceFilter {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceFilter {
    pub const ALL: DeviceFilter = DeviceFilter {
        vendor_id: 0,
        product_id: 0,
    };

    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    pub fn vendor(vendor_id: u16) -> Self {
        Self::new(vendor_id, 0)
    }

    /// Check a record against this filter
    pub fn matches(&self, record: &DeviceRecord) -> bool {
        match (self.vendor_id, self.product_id) {
            (0, _) => true,
            (vid, 0) => record.vendor_id == vid,
            (vid, pid) => record.vendor_id == vid && record.product_id == pid,
        }
    }
}

/// Direction of a hotplug transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
}

impl ChangeKind {
    /// Short topic name (`add` / `remove`)
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "add",
            ChangeKind::Removed => "remove",
        }
    }
}

/// One observed attach or detach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub record: DeviceRecord,
    /// Set when the removed device was never registered and its record had
    /// to be rebuilt from whatever the removal notification carried
    pub reconstructed: Option<PartialRecord>,
}

impl ChangeEvent {
    pub fn added(record: DeviceRecord) -> Self {
        Self {
            kind: ChangeKind::Added,
            record,
            reconstructed: None,
        }
    }

    pub fn removed(record: DeviceRecord) -> Self {
        Self {
            kind: ChangeKind::Removed,
            record,
            reconstructed: None,
        }
    }

    /// Removal of a device the registry never knew about
    pub fn removed_unregistered(partial: PartialRecord) -> Self {
        Self {
            kind: ChangeKind::Removed,
            record: partial.to_record(),
            reconstructed: Some(partial),
        }
    }

    pub fn is_added(&self) -> bool {
        self.kind == ChangeKind::Added
    }

    pub fn is_reconstructed(&self) -> bool {
        self.reconstructed.is_some()
    }
}

/// Lifecycle state of a monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitorState {
    Idle,
    Starting,
    Running,
    Stopping,
}
