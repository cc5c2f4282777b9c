//! Platform backend abstraction
//!
//! Each OS plugs in through two traits. A [`Backend`] is a cheap, shareable
//! factory; [`Backend::open`] acquires the platform notification handle and
//! returns a [`HotplugSource`] that lives on the listener thread for the
//! whole session. Sources only have to classify raw platform notifications
//! into [`RawEvent`]s; registry bookkeeping and delivery are shared.

use std::time::Duration;

use crate::error::HotplugError;
use crate::types::{DeviceRecord, PartialRecord};

/// A classified platform notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    /// A device was attached and its metadata read
    Added { key: String, record: DeviceRecord },
    /// A device was detached
    ///
    /// `fallback` holds whatever the removal notification itself carried,
    /// used only when `key` was never registered.
    Removed { key: String, fallback: PartialRecord },
}

impl RawEvent {
    pub fn key(&self) -> &str {
        match self {
            RawEvent::Added { key, .. } | RawEvent::Removed { key, .. } => key,
        }
    }
}

/// Live connection to a platform hotplug primitive
///
/// Created and used on the listener thread only, so it need not be `Send`.
/// Dropping the source releases every platform resource it holds.
pub trait HotplugSource {
    /// List devices attached right now as `(identity key, record)` pairs
    ///
    /// Devices whose metadata cannot be read are skipped.
    fn enumerate(&mut self) -> Result<Vec<(String, DeviceRecord)>, HotplugError>;

    /// Block for at most `timeout` and return the notifications received
    ///
    /// An empty vector means the timeout elapsed.
    fn wait(&mut self, timeout: Duration) -> Result<Vec<RawEvent>, HotplugError>;
}

/// Factory for platform sources
pub trait Backend: Send + Sync + 'static {
    type Source: HotplugSource;

    /// Short backend name used in logs and thread names
    fn name(&self) -> &'static str;

    /// Acquire the platform notification handle
    ///
    /// Runs on the listener thread. Failure here is fatal to `start()`.
    fn open(&self) -> Result<Self::Source, HotplugError>;
}

/// Source type for targets without a hotplug backend
#[derive(Debug)]
pub enum NoSource {}

impl HotplugSource for NoSource {
    fn enumerate(&mut self) -> Result<Vec<(String, DeviceRecord)>, HotplugError> {
        match *self {}
    }

    fn wait(&mut self, _timeout: Duration) -> Result<Vec<RawEvent>, HotplugError> {
        match *self {}
    }
}
