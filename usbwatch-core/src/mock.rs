//! Scriptable in-memory backend
//!
//! Simulates a USB bus so the lifecycle can be exercised without hardware.
//! Devices plugged in while no source is open are visible to the next
//! enumeration but produce no notification, like a real bus.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::HotplugError;
use crate::source::{Backend, HotplugSource, RawEvent};
use crate::types::{DeviceRecord, PartialRecord};

#[derive(Default)]
struct BusState {
    attached: BTreeMap<String, DeviceRecord>,
    pending: VecDeque<RawEvent>,
    fail_open: Option<String>,
    fail_enumeration: bool,
    fail_waits: usize,
    listening: bool,
}

#[derive(Default)]
struct Bus {
    state: Mutex<BusState>,
    wake: Condvar,
    opened: AtomicUsize,
    live: AtomicUsize,
}

/// Handle to a simulated bus; clones drive the same bus
#[derive(Clone, Default)]
pub struct MockBackend {
    bus: Arc<Bus>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus with devices already attached before any monitor starts
    pub fn with_devices<I, K>(devices: I) -> Self
    where
        I: IntoIterator<Item = (K, DeviceRecord)>,
        K: Into<String>,
    {
        let backend = Self::new();
        {
            let mut state = backend.bus.state.lock();
            for (key, record) in devices {
                state.attached.insert(key.into(), record);
            }
        }
        backend
    }

    /// Attach a device and notify the open source, if any
    pub fn plug(&self, key: impl Into<String>, record: DeviceRecord) {
        let key = key.into();
        let mut state = self.bus.state.lock();
        state.attached.insert(key.clone(), record.clone());
        if state.listening {
            state.pending.push_back(RawEvent::Added { key, record });
            self.bus.wake.notify_all();
        }
    }

    /// Detach a device; returns false if nothing was attached under `key`
    ///
    /// The removal notification carries the vendor and product IDs only.
    pub fn unplug(&self, key: &str) -> bool {
        let mut state = self.bus.state.lock();
        let Some(record) = state.attached.remove(key) else {
            return false;
        };
        if state.listening {
            state.pending.push_back(RawEvent::Removed {
                key: key.to_string(),
                fallback: PartialRecord {
                    vendor_id: Some(record.vendor_id),
                    product_id: Some(record.product_id),
                    ..Default::default()
                },
            });
            self.bus.wake.notify_all();
        }
        true
    }

    /// Deliver a removal for a key the monitor never saw attached
    pub fn unplug_unregistered(&self, key: impl Into<String>, fallback: PartialRecord) {
        let mut state = self.bus.state.lock();
        if state.listening {
            state.pending.push_back(RawEvent::Removed {
                key: key.into(),
                fallback,
            });
            self.bus.wake.notify_all();
        }
    }

    /// Make every subsequent `open()` fail until cleared with `None`
    pub fn fail_open(&self, reason: Option<&str>) {
        self.bus.state.lock().fail_open = reason.map(str::to_string);
    }

    pub fn fail_enumeration(&self, fail: bool) {
        self.bus.state.lock().fail_enumeration = fail;
    }

    /// Make the next `count` waits return an error
    pub fn fail_waits(&self, count: usize) {
        self.bus.state.lock().fail_waits = count;
    }

    /// Number of successful `open()` calls so far
    pub fn opened(&self) -> usize {
        self.bus.opened.load(Ordering::Acquire)
    }

    /// Sources currently open
    pub fn live_sources(&self) -> usize {
        self.bus.live.load(Ordering::Acquire)
    }

    /// Devices physically attached to the simulated bus
    pub fn attached(&self) -> Vec<DeviceRecord> {
        self.bus.state.lock().attached.values().cloned().collect()
    }
}

impl Backend for MockBackend {
    type Source = MockSource;

    fn name(&self) -> &'static str {
        "mock"
    }

    fn open(&self) -> Result<MockSource, HotplugError> {
        let mut state = self.bus.state.lock();
        if let Some(reason) = &state.fail_open {
            return Err(HotplugError::PlatformUnavailable(reason.clone()));
        }
        state.pending.clear();
        state.listening = true;
        self.bus.opened.fetch_add(1, Ordering::AcqRel);
        self.bus.live.fetch_add(1, Ordering::AcqRel);
        Ok(MockSource {
            bus: Arc::clone(&self.bus),
        })
    }
}

/// Open connection to a [`MockBackend`] bus
pub struct MockSource {
    bus: Arc<Bus>,
}

impl HotplugSource for MockSource {
    fn enumerate(&mut self) -> Result<Vec<(String, DeviceRecord)>, HotplugError> {
        let state = self.bus.state.lock();
        if state.fail_enumeration {
            return Err(HotplugError::Io(std::io::Error::other(
                "simulated enumeration failure",
            )));
        }
        Ok(state
            .attached
            .iter()
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect())
    }

    fn wait(&mut self, timeout: Duration) -> Result<Vec<RawEvent>, HotplugError> {
        let mut state = self.bus.state.lock();
        if state.fail_waits > 0 {
            state.fail_waits -= 1;
            return Err(HotplugError::Io(std::io::Error::other(
                "simulated wait failure",
            )));
        }
        if state.pending.is_empty() {
            self.bus.wake.wait_for(&mut state, timeout);
        }
        Ok(state.pending.drain(..).collect())
    }
}

impl fmt::Debug for MockSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockSource")
            .field("live", &self.bus.live.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Drop for MockSource {
    fn drop(&mut self) {
        let mut state = self.bus.state.lock();
        state.listening = false;
        state.pending.clear();
        self.bus.live.fetch_sub(1, Ordering::AcqRel);
    }
}
