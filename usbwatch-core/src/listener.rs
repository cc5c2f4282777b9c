//! Listener thread body shared by every platform backend

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::channel::EventSender;
use crate::error::HotplugError;
use crate::registry::DeviceRegistry;
use crate::source::{Backend, HotplugSource, RawEvent};
use crate::types::ChangeEvent;

/// Readiness report sent back to `start()`: registered device count or the
/// acquisition failure
pub(crate) type Ready = Result<usize, HotplugError>;

/// Everything the listener thread owns for one session
pub(crate) struct ListenerContext<B: Backend> {
    pub backend: std::sync::Arc<B>,
    pub registry: std::sync::Arc<DeviceRegistry>,
    pub events: EventSender,
    pub running: std::sync::Arc<AtomicBool>,
    pub poll_interval: Duration,
}

/// Acquire the platform handle, populate the registry, then relay events
/// until `running` is cleared
pub(crate) fn run<B: Backend>(ctx: ListenerContext<B>, ready: SyncSender<Ready>) {
    let name = ctx.backend.name();

    let mut source = match ctx.backend.open() {
        Ok(source) => source,
        Err(e) => {
            warn!("{} backend unavailable: {}", name, e);
            let _ = ready.send(Err(e));
            return;
        }
    };

    let count = populate(&mut source, &ctx.registry);
    info!("{} listener registered {} attached devices", name, count);
    if ready.send(Ok(count)).is_err() {
        return;
    }
    drop(ready);

    while ctx.running.load(Ordering::Acquire) {
        match source.wait(ctx.poll_interval) {
            Ok(batch) => {
                for raw in batch {
                    // Events observed after stop began are not delivered
                    if !ctx.running.load(Ordering::Acquire) {
                        break;
                    }
                    apply(raw, &ctx.registry, &ctx.events);
                }
            }
            Err(e) => {
                warn!("{} wait failed: {}", name, e);
                std::thread::sleep(ctx.poll_interval);
            }
        }
    }

    drop(source);
    debug!("{} listener thread exiting", name);
}

/// Initial enumeration; no change events are produced for these devices
fn populate<S: HotplugSource>(source: &mut S, registry: &DeviceRegistry) -> usize {
    match source.enumerate() {
        Ok(devices) => {
            for (key, record) in devices {
                debug!("Enumerated {} -> {}", key, record);
                if registry.add(key.clone(), record).is_some() {
                    debug!("Enumeration reported {} twice", key);
                }
            }
            registry.len()
        }
        Err(e) => {
            warn!("Initial enumeration failed, starting empty: {}", e);
            registry.len()
        }
    }
}

/// Apply one platform notification to the registry and queue its event
///
/// The registry is updated before the event is queued, so a callback always
/// observes the registry state that includes its own change.
pub(crate) fn apply(raw: RawEvent, registry: &DeviceRegistry, events: &EventSender) {
    let event = match raw {
        RawEvent::Added { key, record } => {
            if registry.add(key.clone(), record.clone()).is_some() {
                debug!("{} already registered, refreshed without notification", key);
                return;
            }
            debug!("Device added: {} -> {}", key, record);
            ChangeEvent::added(record)
        }
        RawEvent::Removed { key, fallback } => match registry.pop(&key) {
            Some(record) => {
                debug!("Device removed: {} -> {}", key, record);
                ChangeEvent::removed(record)
            }
            None => {
                debug!(
                    "Unregistered device removed: {} (missing {:?})",
                    key,
                    fallback.missing_fields()
                );
                ChangeEvent::removed_unregistered(fallback)
            }
        },
    };

    if !events.send(event) {
        if events.mark_closed() {
            warn!("Change callback is no longer running; events are dropped until stop");
        } else {
            debug!("Delivery side closed, change event dropped");
        }
    }
}
