//! Device registry - currently attached devices keyed by identity
//!
//! The registry is written only from the listener thread and read from
//! anywhere. Every operation takes the lock for the duration of a single map
//! access, so a query never observes a half-applied removal.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::{DeviceFilter, DeviceRecord};

/// Map of identity key to device record
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a device, returning the record previously stored under `key`
    ///
    /// A previous record only exists if the platform reported the same
    /// attachment twice (for example an add racing the initial scan).
    pub fn add(&self, key: impl Into<String>, record: DeviceRecord) -> Option<DeviceRecord> {
        self.devices.write().insert(key.into(), record)
    }

    /// Atomically remove and return the record for `key`
    pub fn pop(&self, key: &str) -> Option<DeviceRecord> {
        self.devices.write().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.devices.read().contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<DeviceRecord> {
        self.devices.read().get(key).cloned()
    }

    /// Consistent copy of every registered record
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        self.devices.read().values().cloned().collect()
    }

    /// Records matching a VID/PID pair (see [`DeviceFilter`] for the rules)
    pub fn filter(&self, vendor_id: u16, product_id: u16) -> Vec<DeviceRecord> {
        self.filter_by(&DeviceFilter::new(vendor_id, product_id))
    }

    pub fn filter_by(&self, filter: &DeviceFilter) -> Vec<DeviceRecord> {
        self.devices
            .read()
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect()
    }

    /// Identity keys currently registered
    pub fn keys(&self) -> Vec<String> {
        self.devices.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    pub(crate) fn clear(&self) {
        self.devices.write().clear();
    }
}
