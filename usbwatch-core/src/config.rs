//! Monitor settings

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HotplugError;

/// Shortest accepted listener wait
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Longest accepted listener wait
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(1000);
/// Default listener wait, matching the netlink poll timeout
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Tunables for a [`Monitor`](crate::Monitor)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Upper bound on one blocking wait; also bounds how long `stop()` takes
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    /// Prefix for the listener and dispatcher thread names
    pub thread_name: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            thread_name: "usb-hotplug".to_string(),
        }
    }
}

impl MonitorConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Reject settings the listener cannot honour
    pub fn validate(&self) -> Result<(), HotplugError> {
        if self.poll_interval < MIN_POLL_INTERVAL || self.poll_interval > MAX_POLL_INTERVAL {
            return Err(HotplugError::InvalidConfig(format!(
                "poll interval {}ms outside {}..={}ms",
                self.poll_interval.as_millis(),
                MIN_POLL_INTERVAL.as_millis(),
                MAX_POLL_INTERVAL.as_millis()
            )));
        }
        if self.thread_name.is_empty() || self.thread_name.contains('\0') {
            return Err(HotplugError::InvalidConfig(
                "thread name must be non-empty and contain no NUL".into(),
            ));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = MonitorConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_poll_interval_bounds() {
        let too_short = MonitorConfig::default().with_poll_interval(Duration::from_millis(1));
        assert!(matches!(
            too_short.validate(),
            Err(HotplugError::InvalidConfig(_))
        ));

        let too_long = MonitorConfig::default().with_poll_interval(Duration::from_secs(5));
        assert!(too_long.validate().is_err());

        let edge = MonitorConfig::default().with_poll_interval(MAX_POLL_INTERVAL);
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn test_empty_thread_name_rejected() {
        let config = MonitorConfig::default().with_thread_name("");
        assert!(config.validate().is_err());
    }
}
