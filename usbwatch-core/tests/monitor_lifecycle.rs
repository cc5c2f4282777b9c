//! End-to-end monitor behaviour against the simulated bus

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use usbwatch_core::mock::MockBackend;
use usbwatch_core::{
    ChangeEvent, ChangeKind, DeviceRecord, HotplugError, Monitor, MonitorConfig, MonitorState,
    PartialRecord,
};

const SETTLE: Duration = Duration::from_millis(200);
const PATIENCE: Duration = Duration::from_secs(5);

fn config() -> MonitorConfig {
    MonitorConfig::default().with_poll_interval(Duration::from_millis(10))
}

fn device_a() -> DeviceRecord {
    DeviceRecord::new(0x04e8, 0x503b)
        .with_name("Galaxy")
        .with_manufacturer("Samsung")
        .with_serial("0002F9A9828E0F06")
        .with_location(0x0110_0000, 4)
}

fn device_b() -> DeviceRecord {
    DeviceRecord::new(0x1234, 0x0001).with_name("Widget")
}

fn device_c() -> DeviceRecord {
    DeviceRecord::new(0x046d, 0xc52b).with_name("Receiver")
}

/// Monitor over a bus with A and B attached, started with a channel sink
fn started_with_a_and_b() -> (MockBackend, Monitor<MockBackend>, Receiver<ChangeEvent>) {
    let backend = MockBackend::with_devices([("a", device_a()), ("b", device_b())]);
    let monitor = Monitor::with_backend(backend.clone(), config());
    let (tx, rx) = mpsc::channel();
    monitor
        .start(move |event| {
            let _ = tx.send(event);
        })
        .unwrap();
    (backend, monitor, rx)
}

#[test]
fn test_initial_devices_are_queryable_without_events() {
    let (_backend, monitor, rx) = started_with_a_and_b();

    assert_eq!(monitor.query(0, 0).len(), 2);
    assert_eq!(monitor.query(0x04e8, 0), vec![device_a()]);
    assert_eq!(monitor.query(0x1234, 0x0001), vec![device_b()]);
    assert!(monitor.query(0x04e8, 0x0001).is_empty());
    assert!(rx.recv_timeout(SETTLE).is_err());

    monitor.stop();
}

#[test]
fn test_unplug_reports_registered_record() {
    let (backend, monitor, rx) = started_with_a_and_b();

    assert!(backend.unplug("a"));
    let event = rx.recv_timeout(PATIENCE).unwrap();
    assert_eq!(event.kind, ChangeKind::Removed);
    assert_eq!(event.record, device_a());
    assert!(!event.is_reconstructed());

    assert_eq!(monitor.query(0, 0), vec![device_b()]);
    monitor.stop();
}

#[test]
fn test_plug_notifies_exactly_once() {
    let (backend, monitor, rx) = started_with_a_and_b();

    backend.plug("c", device_c());
    let event = rx.recv_timeout(PATIENCE).unwrap();
    assert!(event.is_added());
    assert_eq!(event.record, device_c());
    assert!(rx.recv_timeout(SETTLE).is_err());

    assert_eq!(monitor.query(0x046d, 0xc52b), vec![device_c()]);
    assert_eq!(monitor.device_count(), 3);
    monitor.stop();
}

#[test]
fn test_registry_updated_before_callback_runs() {
    let backend = MockBackend::new();
    let monitor = Monitor::with_backend(backend.clone(), config());
    let (tx, rx) = mpsc::channel();
    let observer = monitor.clone();
    monitor
        .start(move |event| {
            let visible = observer.query(event.record.vendor_id, event.record.product_id);
            let _ = tx.send((event.kind, visible.len()));
        })
        .unwrap();

    backend.plug("c", device_c());
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), (ChangeKind::Added, 1));
    backend.unplug("c");
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), (ChangeKind::Removed, 0));

    monitor.stop();
}

#[test]
fn test_events_delivered_in_order() {
    let backend = MockBackend::new();
    let monitor = Monitor::with_backend(backend.clone(), config());
    let (tx, rx) = mpsc::channel();
    monitor
        .start(move |event| {
            let _ = tx.send(event.record.product_id);
        })
        .unwrap();

    for pid in 1..=50u16 {
        backend.plug(format!("dev{pid}"), DeviceRecord::new(0xabcd, pid));
    }
    let seen: Vec<u16> = (0..50).map(|_| rx.recv_timeout(PATIENCE).unwrap()).collect();
    assert_eq!(seen, (1..=50).collect::<Vec<_>>());

    monitor.stop();
}

#[test]
fn test_unregistered_removal_is_reconstructed() {
    let (backend, monitor, rx) = started_with_a_and_b();

    let fallback = PartialRecord {
        vendor_id: Some(0x0bda),
        product_id: Some(0x8153),
        ..Default::default()
    };
    backend.unplug_unregistered("ghost", fallback.clone());

    let event = rx.recv_timeout(PATIENCE).unwrap();
    assert_eq!(event.kind, ChangeKind::Removed);
    assert_eq!(event.record.vendor_id, 0x0bda);
    assert_eq!(event.record.product_id, 0x8153);
    assert!(event.record.device_name.is_empty());
    assert_eq!(event.reconstructed, Some(fallback));
    assert_eq!(monitor.device_count(), 2);

    monitor.stop();
}

#[test]
fn test_start_then_immediate_stop() {
    let backend = MockBackend::with_devices([("a", device_a())]);
    let monitor = Monitor::with_backend(backend.clone(), config());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    monitor
        .start(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    monitor.stop();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(backend.live_sources(), 0);
    assert_eq!(monitor.state(), MonitorState::Idle);
    assert!(monitor.query(0, 0).is_empty());
}

#[test]
fn test_repeated_start_keeps_one_listener() {
    let (backend, monitor, _rx) = started_with_a_and_b();

    monitor.start(|_| {}).unwrap();
    monitor.start(|_| {}).unwrap();
    assert_eq!(backend.opened(), 1);
    assert_eq!(backend.live_sources(), 1);

    monitor.stop();
}

#[test]
fn test_concurrent_starts_open_once() {
    let backend = MockBackend::new();
    let monitor = Monitor::with_backend(backend.clone(), config());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let monitor = monitor.clone();
            thread::spawn(move || monitor.start(|_| {}))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert!(monitor.is_running());
    assert_eq!(backend.opened(), 1);
    monitor.stop();
    assert_eq!(backend.live_sources(), 0);
}

#[test]
fn test_no_callback_after_stop_returns() {
    let backend = MockBackend::new();
    let monitor = Monitor::with_backend(backend.clone(), config());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    monitor
        .start(move |_| {
            thread::sleep(Duration::from_millis(20));
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    for i in 0..5 {
        backend.plug(format!("d{i}"), DeviceRecord::new(1, i));
    }
    thread::sleep(Duration::from_millis(30));
    monitor.stop();

    let at_stop = calls.load(Ordering::SeqCst);
    backend.plug("late", DeviceRecord::new(2, 2));
    thread::sleep(SETTLE);
    assert_eq!(calls.load(Ordering::SeqCst), at_stop);
    assert_eq!(backend.live_sources(), 0);
}

#[test]
fn test_stop_from_callback() {
    let backend = MockBackend::new();
    let monitor = Monitor::with_backend(backend.clone(), config());
    let (tx, rx) = mpsc::channel();
    let inner = monitor.clone();
    monitor
        .start(move |_| {
            inner.stop();
            let _ = tx.send(inner.state());
        })
        .unwrap();

    backend.plug("x", device_c());
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), MonitorState::Idle);
    assert_eq!(backend.live_sources(), 0);
    assert!(!monitor.is_running());

    // A fresh session works after a reentrant stop
    monitor.start(|_| {}).unwrap();
    assert_eq!(backend.opened(), 2);
    monitor.stop();
}

#[test]
fn test_stop_from_callback_while_another_thread_stops() {
    let backend = MockBackend::new();
    let monitor = Monitor::with_backend(backend.clone(), config());
    let (entered_tx, entered_rx) = mpsc::channel();
    let stopped_inside = Arc::new(AtomicBool::new(false));
    let late_calls = Arc::new(AtomicUsize::new(0));

    let inner = monitor.clone();
    let stopped = Arc::clone(&stopped_inside);
    let late = Arc::clone(&late_calls);
    monitor
        .start(move |_| {
            if stopped.load(Ordering::SeqCst) {
                late.fetch_add(1, Ordering::SeqCst);
                return;
            }
            let _ = entered_tx.send(());
            let deadline = Instant::now() + PATIENCE;
            while inner.state() != MonitorState::Stopping && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            inner.stop();
            stopped.store(true, Ordering::SeqCst);
        })
        .unwrap();

    for i in 0..5 {
        backend.plug(format!("d{i}"), DeviceRecord::new(3, i));
    }
    entered_rx.recv_timeout(PATIENCE).unwrap();
    // Let the remaining plugs reach the queue behind the blocked callback
    thread::sleep(Duration::from_millis(50));
    monitor.stop();

    assert!(stopped_inside.load(Ordering::SeqCst));
    assert_eq!(late_calls.load(Ordering::SeqCst), 0);
    assert_eq!(monitor.state(), MonitorState::Idle);
    assert_eq!(backend.live_sources(), 0);
}

#[test]
fn test_start_from_callback_while_stopping() {
    let backend = MockBackend::new();
    let monitor = Monitor::with_backend(backend.clone(), config());
    let (entered_tx, entered_rx) = mpsc::channel();
    let (result_tx, result_rx) = mpsc::channel();
    let inner = monitor.clone();
    monitor
        .start(move |_| {
            let _ = entered_tx.send(());
            thread::sleep(SETTLE);
            let _ = result_tx.send(inner.start(|_| {}));
        })
        .unwrap();

    backend.plug("x", device_c());
    entered_rx.recv_timeout(PATIENCE).unwrap();
    monitor.stop();

    let result = result_rx.recv_timeout(PATIENCE).unwrap();
    assert!(matches!(result, Err(HotplugError::ShuttingDown)));
    assert_eq!(monitor.state(), MonitorState::Idle);
}

#[test]
fn test_open_failure_leaves_monitor_idle() {
    let backend = MockBackend::with_devices([("a", device_a())]);
    backend.fail_open(Some("netlink socket denied"));
    let monitor = Monitor::with_backend(backend.clone(), config());

    let err = monitor.start(|_| {}).unwrap_err();
    assert!(err.is_platform_unavailable());
    assert_eq!(monitor.state(), MonitorState::Idle);
    assert!(monitor.query(0, 0).is_empty());

    backend.fail_open(None);
    monitor.start(|_| {}).unwrap();
    assert_eq!(monitor.query(0, 0), vec![device_a()]);
    monitor.stop();
}

#[test]
fn test_enumeration_failure_is_not_fatal() {
    let backend = MockBackend::with_devices([("a", device_a())]);
    backend.fail_enumeration(true);
    let monitor = Monitor::with_backend(backend.clone(), config());
    let (tx, rx) = mpsc::channel();
    monitor
        .start(move |event| {
            let _ = tx.send(event);
        })
        .unwrap();

    assert!(monitor.query(0, 0).is_empty());
    backend.plug("c", device_c());
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap().record, device_c());
    monitor.stop();
}

#[test]
fn test_wait_errors_are_survived() {
    let backend = MockBackend::new();
    backend.fail_waits(3);
    let monitor = Monitor::with_backend(backend.clone(), config());
    let (tx, rx) = mpsc::channel();
    monitor
        .start(move |event| {
            let _ = tx.send(event);
        })
        .unwrap();

    thread::sleep(Duration::from_millis(100));
    backend.plug("c", device_c());
    assert!(rx.recv_timeout(PATIENCE).unwrap().is_added());
    monitor.stop();
}

#[test]
fn test_restart_reenumerates() {
    let (backend, monitor, _rx) = started_with_a_and_b();
    monitor.stop();
    assert!(monitor.query(0, 0).is_empty());

    // Changes while stopped produce no events but show up on restart
    backend.unplug("b");
    backend.plug("c", device_c());

    let (tx, rx) = mpsc::channel();
    monitor
        .start(move |event| {
            let _ = tx.send(event);
        })
        .unwrap();
    let mut pairs: Vec<(u16, u16)> = monitor
        .query(0, 0)
        .iter()
        .map(|r| (r.vendor_id, r.product_id))
        .collect();
    pairs.sort();
    assert_eq!(pairs, vec![(0x046d, 0xc52b), (0x04e8, 0x503b)]);
    assert!(rx.recv_timeout(SETTLE).is_err());
    assert_eq!(backend.opened(), 2);
    monitor.stop();
}

#[test]
fn test_invalid_config_is_rejected() {
    let backend = MockBackend::new();
    let monitor = Monitor::with_backend(
        backend.clone(),
        MonitorConfig::default().with_poll_interval(Duration::from_secs(60)),
    );
    assert!(matches!(
        monitor.start(|_| {}),
        Err(HotplugError::InvalidConfig(_))
    ));
    assert_eq!(backend.opened(), 0);
}

#[test]
#[ignore = "needs real USB hardware and OS notification access"]
fn test_platform_backend_lists_devices() {
    let monitor = Monitor::new();
    monitor.start(|event| println!("{:?}", event)).unwrap();
    for device in monitor.devices() {
        println!("{device}");
    }
    monitor.stop();
}
