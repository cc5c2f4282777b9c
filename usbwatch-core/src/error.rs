//! Hotplug engine error types

use thiserror::Error;

/// Errors that can occur while starting or running a monitor
///
/// A dropped or overflowing notification channel is deliberately absent:
/// the channel is unbounded, so a send can only fail once the consumer side
/// has been torn down by `stop()`.
#[derive(Error, Debug)]
pub enum HotplugError {
    /// The OS notification subsystem could not be initialized
    #[error("Platform notification subsystem unavailable: {0}")]
    PlatformUnavailable(String),

    /// Metadata for a single device could not be read
    #[error("Failed to read device {key}: {reason}")]
    DeviceRead { key: String, reason: String },

    /// Monitor settings rejected by validation
    #[error("Invalid monitor configuration: {0}")]
    InvalidConfig(String),

    /// `start()` was called from a delivery callback while another thread
    /// is stopping the same monitor
    #[error("Monitor is shutting down")]
    ShuttingDown,

    /// A worker thread could not be created
    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The listener thread went away before reporting readiness
    #[error("Listener thread exited before it was ready")]
    ListenerLost,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HotplugError {
    /// Build a `DeviceRead` error for the given identity key
    pub fn device_read(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        HotplugError::DeviceRead {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error means the platform could not be used at all
    pub fn is_platform_unavailable(&self) -> bool {
        matches!(self, HotplugError::PlatformUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_read_message() {
        let err = HotplugError::device_read("/dev/bus/usb/001/004", "idVendor missing");
        assert_eq!(
            err.to_string(),
            "Failed to read device /dev/bus/usb/001/004: idVendor missing"
        );
        assert!(!err.is_platform_unavailable());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "netlink");
        let err: HotplugError = io.into();
        assert!(matches!(err, HotplugError::Io(_)));
    }
}
