//! Monitor lifecycle
//!
//! A [`Monitor`] owns one listener thread (platform acquisition, initial
//! enumeration, event classification) and one dispatcher thread (callback
//! delivery) per running session. `start()` returns only after the initial
//! enumeration has been registered; `stop()` returns only after both threads
//! have exited, so no callback runs once it has returned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::channel::{self, Dispatcher};
use crate::config::MonitorConfig;
use crate::error::HotplugError;
use crate::listener::{self, ListenerContext};
use crate::platform::PlatformBackend;
use crate::registry::DeviceRegistry;
use crate::source::Backend;
use crate::types::{ChangeEvent, DeviceFilter, DeviceRecord, MonitorState};

/// USB hotplug monitor
///
/// Cheap to clone; every clone controls the same session. The monitor stops
/// itself when the last clone is dropped. A callback that captures a clone
/// keeps the monitor alive until `stop()` is called explicitly.
pub struct Monitor<B: Backend = PlatformBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: Backend> Clone for Monitor<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<B: Backend> {
    backend: Arc<B>,
    config: MonitorConfig,
    registry: Arc<DeviceRegistry>,
    lifecycle: Mutex<Lifecycle>,
    changed: Condvar,
}

enum Lifecycle {
    Idle,
    Starting,
    Running(Session),
    /// `dispatcher` identifies the delivery thread of the session being torn
    /// down, so calls made from its callbacks can be told apart. Setting
    /// `discard` drops whatever that thread has not delivered yet.
    Stopping {
        dispatcher: ThreadId,
        discard: Arc<AtomicBool>,
    },
}

impl Lifecycle {
    fn state(&self) -> MonitorState {
        match self {
            Lifecycle::Idle => MonitorState::Idle,
            Lifecycle::Starting => MonitorState::Starting,
            Lifecycle::Running(_) => MonitorState::Running,
            Lifecycle::Stopping { .. } => MonitorState::Stopping,
        }
    }
}

/// Threads and flags of one running session
struct Session {
    running: Arc<AtomicBool>,
    listener: JoinHandle<()>,
    dispatcher: Dispatcher,
}

impl Session {
    fn shutdown(self) {
        self.running.store(false, Ordering::Release);
        if self.listener.join().is_err() {
            warn!("Hotplug listener thread panicked");
        }
        // The listener dropped its sender on exit, so the queue now drains
        self.dispatcher.finish();
    }
}

impl Monitor<PlatformBackend> {
    /// Monitor for the current OS with default settings
    pub fn new() -> Self {
        Self::with_config(MonitorConfig::default())
    }

    pub fn with_config(config: MonitorConfig) -> Self {
        Self::with_backend(PlatformBackend::default(), config)
    }
}

impl Default for Monitor<PlatformBackend> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Monitor<B> {
    /// Monitor driven by an explicit backend
    pub fn with_backend(backend: B, config: MonitorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend: Arc::new(backend),
                config,
                registry: Arc::new(DeviceRegistry::new()),
                lifecycle: Mutex::new(Lifecycle::Idle),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Begin monitoring and deliver every subsequent change to `on_change`
    ///
    /// Returns once the devices attached right now are registered. Those
    /// devices produce no events. Calling `start()` on a running monitor is
    /// a no-op and the new callback is dropped.
    pub fn start<F>(&self, on_change: F) -> Result<(), HotplugError>
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        self.inner.config.validate()?;

        {
            let mut lifecycle = self.inner.lifecycle.lock();
            loop {
                match &*lifecycle {
                    Lifecycle::Idle => break,
                    Lifecycle::Running(_) => {
                        debug!("Hotplug monitor already running");
                        return Ok(());
                    }
                    Lifecycle::Starting => self.inner.changed.wait(&mut lifecycle),
                    Lifecycle::Stopping { dispatcher, .. } => {
                        // Waiting here would deadlock: the stopping thread is
                        // joining the thread we are on
                        if thread::current().id() == *dispatcher {
                            return Err(HotplugError::ShuttingDown);
                        }
                        self.inner.changed.wait(&mut lifecycle);
                    }
                }
            }
            *lifecycle = Lifecycle::Starting;
        }

        info!("Starting hotplug monitor ({})", self.inner.backend.name());
        let launched = self.inner.launch(on_change);

        let mut lifecycle = self.inner.lifecycle.lock();
        let result = match launched {
            Ok(session) => {
                *lifecycle = Lifecycle::Running(session);
                info!(
                    "Hotplug monitor running with {} devices",
                    self.inner.registry.len()
                );
                Ok(())
            }
            Err(e) => {
                *lifecycle = Lifecycle::Idle;
                Err(e)
            }
        };
        self.inner.changed.notify_all();
        result
    }

    /// Stop monitoring and release platform resources
    ///
    /// Blocks until the listener has exited and every queued event has been
    /// delivered. When called from inside a callback, events still queued
    /// are discarded instead, also when another thread is already stopping.
    /// Safe to call on an idle monitor.
    pub fn stop(&self) {
        let session = {
            let mut lifecycle = self.inner.lifecycle.lock();
            loop {
                match std::mem::replace(&mut *lifecycle, Lifecycle::Idle) {
                    Lifecycle::Idle => return,
                    Lifecycle::Running(session) => {
                        *lifecycle = Lifecycle::Stopping {
                            dispatcher: session.dispatcher.thread_id(),
                            discard: session.dispatcher.discard_handle(),
                        };
                        break session;
                    }
                    Lifecycle::Starting => {
                        *lifecycle = Lifecycle::Starting;
                        self.inner.changed.wait(&mut lifecycle);
                    }
                    Lifecycle::Stopping {
                        dispatcher,
                        discard,
                    } => {
                        let reentrant = thread::current().id() == dispatcher;
                        if reentrant {
                            // The other stopper is joining this thread; nothing
                            // queued may reach a callback once we return
                            discard.store(true, Ordering::Release);
                        }
                        *lifecycle = Lifecycle::Stopping {
                            dispatcher,
                            discard,
                        };
                        if reentrant {
                            return;
                        }
                        self.inner.changed.wait(&mut lifecycle);
                    }
                }
            }
        };

        info!("Stopping hotplug monitor");
        session.shutdown();
        self.inner.registry.clear();

        *self.inner.lifecycle.lock() = Lifecycle::Idle;
        self.inner.changed.notify_all();
        info!("Hotplug monitor stopped");
    }

    /// True only while fully started
    pub fn is_running(&self) -> bool {
        matches!(*self.inner.lifecycle.lock(), Lifecycle::Running(_))
    }

    pub fn state(&self) -> MonitorState {
        self.inner.lifecycle.lock().state()
    }

    /// Registered devices matching a VID/PID pair
    ///
    /// `(0, 0)` returns everything and `(vid, 0)` a whole vendor. Empty when
    /// the monitor is not running.
    pub fn query(&self, vendor_id: u16, product_id: u16) -> Vec<DeviceRecord> {
        self.inner.registry.filter(vendor_id, product_id)
    }

    pub fn find(&self, filter: &DeviceFilter) -> Vec<DeviceRecord> {
        self.inner.registry.filter_by(filter)
    }

    /// Every registered device
    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.inner.registry.snapshot()
    }

    pub fn device_count(&self) -> usize {
        self.inner.registry.len()
    }
}

impl<B: Backend> Inner<B> {
    /// Spawn the session threads; runs with the lifecycle in `Starting`
    fn launch<F>(&self, on_change: F) -> Result<Session, HotplugError>
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        self.registry.clear();

        let (events, queue) = channel::channel();
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let ctx = ListenerContext {
            backend: Arc::clone(&self.backend),
            registry: Arc::clone(&self.registry),
            events,
            running: Arc::clone(&running),
            poll_interval: self.config.poll_interval,
        };
        let listener = thread::Builder::new()
            .name(format!("{}-{}", self.config.thread_name, self.backend.name()))
            .spawn(move || listener::run(ctx, ready_tx))
            .map_err(|source| HotplugError::Spawn {
                name: "listener",
                source,
            })?;

        let ready = ready_rx.recv().unwrap_or(Err(HotplugError::ListenerLost));
        if let Err(e) = ready {
            running.store(false, Ordering::Release);
            let _ = listener.join();
            self.registry.clear();
            return Err(e);
        }

        let dispatcher = match Dispatcher::spawn(
            queue,
            format!("{}-dispatch", self.config.thread_name),
            on_change,
        ) {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                running.store(false, Ordering::Release);
                let _ = listener.join();
                self.registry.clear();
                return Err(e);
            }
        };

        Ok(Session {
            running,
            listener,
            dispatcher,
        })
    }
}

impl<B: Backend> Drop for Inner<B> {
    fn drop(&mut self) {
        let lifecycle = std::mem::replace(self.lifecycle.get_mut(), Lifecycle::Idle);
        if let Lifecycle::Running(session) = lifecycle {
            debug!("Hotplug monitor dropped while running");
            session.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;
    use std::time::Duration;

    fn fast() -> MonitorConfig {
        MonitorConfig::default().with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn test_state_transitions() {
        let monitor = Monitor::with_backend(MockBackend::new(), fast());
        assert_eq!(monitor.state(), MonitorState::Idle);
        assert!(!monitor.is_running());

        monitor.start(|_| {}).unwrap();
        assert_eq!(monitor.state(), MonitorState::Running);
        assert!(monitor.is_running());

        monitor.stop();
        assert_eq!(monitor.state(), MonitorState::Idle);
        assert!(!monitor.is_running());
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let monitor = Monitor::with_backend(MockBackend::new(), fast());
        monitor.stop();
        monitor.stop();
        assert_eq!(monitor.state(), MonitorState::Idle);
    }

    #[test]
    fn test_invalid_config_rejected_before_start() {
        let backend = MockBackend::new();
        let config = MonitorConfig::default().with_poll_interval(Duration::ZERO);
        let monitor = Monitor::with_backend(backend.clone(), config);

        assert!(matches!(
            monitor.start(|_| {}),
            Err(HotplugError::InvalidConfig(_))
        ));
        assert_eq!(backend.opened(), 0);
        assert_eq!(monitor.state(), MonitorState::Idle);
    }

    #[test]
    fn test_drop_stops_listener() {
        let backend = MockBackend::new();
        {
            let monitor = Monitor::with_backend(backend.clone(), fast());
            monitor.start(|_| {}).unwrap();
            assert_eq!(backend.live_sources(), 1);
        }
        assert_eq!(backend.live_sources(), 0);
    }

    #[test]
    fn test_clones_share_session() {
        let monitor = Monitor::with_backend(MockBackend::new(), fast());
        let other = monitor.clone();
        monitor.start(|_| {}).unwrap();
        assert!(other.is_running());
        other.stop();
        assert!(!monitor.is_running());
    }
}
