//! Platform backends
//!
//! [`PlatformBackend`] names the backend for the target OS. Without the
//! `hotplug` feature, or on an OS with no backend, it resolves to
//! [`UnsupportedBackend`] and `start()` fails with `PlatformUnavailable`.

#[cfg_attr(
    not(any(all(feature = "hotplug", any(target_os = "linux", windows)), test)),
    allow(dead_code)
)]
mod ids;

#[cfg(all(feature = "hotplug", target_os = "linux"))]
mod linux;
#[cfg(all(feature = "hotplug", target_os = "macos"))]
mod macos;
#[cfg(all(feature = "hotplug", windows))]
mod windows;

#[cfg(all(feature = "hotplug", target_os = "linux"))]
pub use linux::{UdevBackend, UdevSource};
#[cfg(all(feature = "hotplug", target_os = "macos"))]
pub use macos::{IoKitBackend, IoKitSource};
#[cfg(all(feature = "hotplug", windows))]
pub use windows::{DeviceNotifyBackend, DeviceNotifySource};

#[cfg(all(feature = "hotplug", target_os = "linux"))]
pub type PlatformBackend = UdevBackend;
#[cfg(all(feature = "hotplug", target_os = "macos"))]
pub type PlatformBackend = IoKitBackend;
#[cfg(all(feature = "hotplug", windows))]
pub type PlatformBackend = DeviceNotifyBackend;
#[cfg(not(all(
    feature = "hotplug",
    any(target_os = "linux", target_os = "macos", windows)
)))]
pub type PlatformBackend = UnsupportedBackend;

use crate::error::HotplugError;
use crate::source::{Backend, NoSource};

/// Backend for builds without OS hotplug support
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedBackend;

impl Backend for UnsupportedBackend {
    type Source = NoSource;

    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn open(&self) -> Result<NoSource, HotplugError> {
        Err(HotplugError::PlatformUnavailable(format!(
            "no hotplug backend for {} in this build",
            std::env::consts::OS
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Monitor, MonitorConfig, MonitorState};

    #[test]
    fn test_unsupported_backend_fails_start() {
        let monitor = Monitor::with_backend(UnsupportedBackend, MonitorConfig::default());
        let err = monitor.start(|_| {}).unwrap_err();
        assert!(err.is_platform_unavailable());
        assert_eq!(monitor.state(), MonitorState::Idle);
        assert!(monitor.query(0, 0).is_empty());
    }
}
