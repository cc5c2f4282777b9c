//! `usbwatch monitor`

use anyhow::Context;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, info};
use usbwatch_core::{Backend, ChangeEvent, DeviceFilter, Monitor};

use super::{
    format_device, format_event, setup_interrupt_handler, sort_devices, CommandResult, EventLine,
};
use crate::config::AppConfig;

const TICK: Duration = Duration::from_millis(200);

/// Which events get printed
#[derive(Debug, Clone, Default)]
pub struct EventSelection {
    pub filter: DeviceFilter,
    /// Empty means every topic
    pub topics: Vec<String>,
}

impl EventSelection {
    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        self.filter.matches(&event.record)
            && (self.topics.is_empty() || self.topics.iter().any(|t| event.matches_topic(t)))
    }
}

/// Print the initial device set, then every selected change until Ctrl-C
pub fn run(
    config: &AppConfig,
    selection: EventSelection,
    json: bool,
    show_initial: bool,
) -> CommandResult {
    let json = json || config.output.json;
    let show_initial = show_initial && config.output.show_initial;
    let running = setup_interrupt_handler();

    let filter = selection.filter;

    // The callback only forwards; printing happens on this thread
    let (tx, rx) = mpsc::channel::<ChangeEvent>();
    let monitor = Monitor::with_config(config.monitor.clone());
    monitor
        .start(move |event| {
            if selection.accepts(&event) {
                let _ = tx.send(event);
            } else {
                debug!("Filtered out {} {}", event.kind.as_str(), event.record);
            }
        })
        .context("Failed to start USB hotplug monitor")?;

    if show_initial {
        for line in initial_lines(&monitor, &filter, json)? {
            println!("{}", line);
        }
    }
    eprintln!("Watching for USB changes, press Ctrl+C to stop");

    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(TICK) {
            Ok(event) => print_event(&event, json)?,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("Interrupted, stopping monitor");
    monitor.stop();
    // Events delivered while stopping are still printed
    while let Ok(event) = rx.try_recv() {
        print_event(&event, json)?;
    }
    Ok(())
}

/// Currently attached devices passing `filter`, one output line each
fn initial_lines<B: Backend>(
    monitor: &Monitor<B>,
    filter: &DeviceFilter,
    json: bool,
) -> anyhow::Result<Vec<String>> {
    let mut devices = monitor.find(filter);
    sort_devices(&mut devices);
    devices
        .iter()
        .map(|device| {
            if json {
                Ok(serde_json::to_string(device)?)
            } else {
                Ok(format!("present {}", format_device(device)))
            }
        })
        .collect()
}

fn print_event(event: &ChangeEvent, json: bool) -> CommandResult {
    if json {
        println!("{}", serde_json::to_string(&EventLine::from(event))?);
    } else {
        println!("{}", format_event(event));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use usbwatch_core::mock::MockBackend;
    use usbwatch_core::{DeviceRecord, MonitorConfig};

    #[test]
    fn test_selection_by_filter_and_topic() {
        let galaxy = ChangeEvent::added(DeviceRecord::new(0x04e8, 0x503b));
        let widget = ChangeEvent::removed(DeviceRecord::new(0x1234, 0x0001));

        let everything = EventSelection::default();
        assert!(everything.accepts(&galaxy));
        assert!(everything.accepts(&widget));

        let samsung = EventSelection {
            filter: DeviceFilter::vendor(0x04e8),
            topics: Vec::new(),
        };
        assert!(samsung.accepts(&galaxy));
        assert!(!samsung.accepts(&widget));

        let removals = EventSelection {
            filter: DeviceFilter::ALL,
            topics: vec!["remove".into()],
        };
        assert!(!removals.accepts(&galaxy));
        assert!(removals.accepts(&widget));

        let exact = EventSelection {
            filter: DeviceFilter::ALL,
            topics: vec!["change:1256:20539".into()],
        };
        assert!(exact.accepts(&galaxy));
        assert!(!exact.accepts(&widget));
    }

    #[test]
    fn test_initial_listing_honours_filter() {
        let backend = MockBackend::with_devices([
            ("a", DeviceRecord::new(0x04e8, 0x503b).with_name("Galaxy")),
            ("b", DeviceRecord::new(0x04e8, 0x6860).with_name("Tab")),
            ("c", DeviceRecord::new(0x1234, 0x0001).with_name("Widget")),
        ]);
        let monitor = Monitor::with_backend(backend, MonitorConfig::default());
        monitor.start(|_| {}).unwrap();

        let samsung = initial_lines(&monitor, &DeviceFilter::vendor(0x04e8), false).unwrap();
        assert_eq!(samsung.len(), 2);
        assert!(samsung.iter().all(|line| line.starts_with("present 04e8:")));

        let exact = initial_lines(&monitor, &DeviceFilter::new(0x1234, 0x0001), true).unwrap();
        assert_eq!(exact.len(), 1);
        assert!(exact[0].contains("\"deviceName\":\"Widget\""));

        assert_eq!(initial_lines(&monitor, &DeviceFilter::ALL, false).unwrap().len(), 3);
        monitor.stop();
    }
}
