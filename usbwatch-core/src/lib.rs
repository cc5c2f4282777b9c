//! USB hotplug detection engine
//!
//! This crate keeps a live registry of attached USB devices and reports
//! attach/detach events to a single callback, on every supported OS:
//!
//! - Linux (udev netlink monitor)
//! - macOS (IOKit matching notifications)
//! - Windows (device interface notifications + SetupAPI)
//!
//! ```no_run
//! use usbwatch_core::{EventRouter, Monitor};
//!
//! let monitor = Monitor::new();
//! let router = EventRouter::new()
//!     .on("add", |event| println!("attached {}", event.record))
//!     .on("remove", |event| println!("detached {}", event.record));
//! monitor.start(router.into_callback())?;
//!
//! for device in monitor.query(0x04e8, 0) {
//!     println!("{device}");
//! }
//! monitor.stop();
//! # Ok::<(), usbwatch_core::HotplugError>(())
//! ```

pub mod config;
pub mod error;
pub mod mock;
pub mod platform;
pub mod registry;
pub mod source;
pub mod topics;
pub mod types;

mod channel;
mod listener;
mod monitor;

pub use config::MonitorConfig;
pub use error::HotplugError;
pub use monitor::Monitor;
pub use platform::{PlatformBackend, UnsupportedBackend};
pub use registry::DeviceRegistry;
pub use source::{Backend, HotplugSource, RawEvent};
pub use topics::{is_valid_topic, EventRouter};
pub use types::{
    ChangeEvent, ChangeKind, DeviceFilter, DeviceRecord, MonitorState, PartialRecord,
};
