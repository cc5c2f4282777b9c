//! Notification channel between the listener thread and the caller's callback
//!
//! Events travel through an unbounded queue so the listener never waits on
//! the consumer. A dedicated delivery thread drains the queue in order and
//! runs the callback; that thread is the "caller context" every callback
//! executes on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::HotplugError;
use crate::types::ChangeEvent;

/// Create a connected sender / queue pair
pub(crate) fn channel() -> (EventSender, EventQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventSender {
            tx,
            closed: AtomicBool::new(false),
        },
        EventQueue { rx },
    )
}

/// Producer half, owned by the listener thread
pub(crate) struct EventSender {
    tx: mpsc::UnboundedSender<ChangeEvent>,
    closed: AtomicBool,
}

impl EventSender {
    /// Queue an event; returns false once the delivery side is gone
    pub(crate) fn send(&self, event: ChangeEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Record that delivery failed; true only the first time
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Consumer half, handed to the dispatcher
pub(crate) struct EventQueue {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

/// Delivery thread running the change callback
pub(crate) struct Dispatcher {
    handle: Option<JoinHandle<()>>,
    thread_id: ThreadId,
    discard: Arc<AtomicBool>,
}

impl Dispatcher {
    /// Spawn the delivery thread for `queue`
    pub(crate) fn spawn<F>(queue: EventQueue, name: String, on_change: F) -> Result<Self, HotplugError>
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        let discard = Arc::new(AtomicBool::new(false));
        let discard_flag = Arc::clone(&discard);

        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run_dispatch_loop(queue, discard_flag, on_change))
            .map_err(|source| HotplugError::Spawn {
                name: "dispatcher",
                source,
            })?;

        Ok(Self {
            thread_id: handle.thread().id(),
            handle: Some(handle),
            discard,
        })
    }

    pub(crate) fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Whether the calling code is running inside a delivered callback
    pub(crate) fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Drop events still queued instead of delivering them
    pub(crate) fn discard_pending(&self) {
        self.discard.store(true, Ordering::Release);
    }

    /// Handle on the discard flag that outlives the dispatcher itself
    pub(crate) fn discard_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.discard)
    }

    /// Let the queue drain and wait for the thread to exit
    ///
    /// The producer must already be gone, otherwise this waits for it. When
    /// called from the delivery thread itself the join cannot happen; queued
    /// events are discarded and the thread exits once the running callback
    /// returns.
    pub(crate) fn finish(mut self) {
        if self.is_current() {
            self.discard_pending();
            debug!("Stop requested from callback, dispatcher join deferred");
            return;
        }

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Change callback panicked; remaining events were dropped");
            }
        }
    }
}

/// Collect everything already queued without blocking
#[cfg(test)]
pub(crate) fn drain(queue: EventQueue) -> Vec<ChangeEvent> {
    let EventQueue { mut rx } = queue;
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn run_dispatch_loop<F>(queue: EventQueue, discard: Arc<AtomicBool>, mut on_change: F)
where
    F: FnMut(ChangeEvent),
{
    let EventQueue { mut rx } = queue;
    let mut delivered: u64 = 0;
    debug!("Dispatcher thread started");

    while let Some(event) = rx.blocking_recv() {
        if discard.load(Ordering::Acquire) {
            break;
        }
        on_change(event);
        delivered += 1;
    }

    debug!("Dispatcher thread exiting after {} events", delivered);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceRecord;
    use parking_lot::Mutex;

    #[test]
    fn test_delivery_preserves_order() {
        let (tx, queue) = channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let dispatcher = Dispatcher::spawn(queue, "test-dispatch".into(), move |event| {
            sink.lock().push(event.record.vendor_id);
        })
        .unwrap();

        for vid in 0..1000u16 {
            assert!(tx.send(ChangeEvent::added(DeviceRecord::new(vid, 0))));
        }
        drop(tx);
        dispatcher.finish();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1000);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_events_queued_before_finish_are_delivered() {
        let (tx, queue) = channel();
        let count = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&count);
        let dispatcher = Dispatcher::spawn(queue, "test-dispatch".into(), move |_| {
            std::thread::sleep(std::time::Duration::from_millis(2));
            *sink.lock() += 1;
        })
        .unwrap();

        for _ in 0..20 {
            tx.send(ChangeEvent::removed(DeviceRecord::default()));
        }
        drop(tx);
        dispatcher.finish();
        assert_eq!(*count.lock(), 20);
    }

    #[test]
    fn test_send_fails_after_consumer_exit() {
        let (tx, queue) = channel();
        drop(queue);
        assert!(!tx.send(ChangeEvent::added(DeviceRecord::default())));
        assert!(tx.mark_closed());
        assert!(!tx.mark_closed());
    }

    #[test]
    fn test_discard_drops_remaining_events() {
        let (tx, queue) = channel();
        let count = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&count);
        let dispatcher = Dispatcher::spawn(queue, "test-dispatch".into(), move |_| {
            *sink.lock() += 1;
        })
        .unwrap();

        dispatcher.discard_pending();
        for _ in 0..5 {
            tx.send(ChangeEvent::added(DeviceRecord::default()));
        }
        drop(tx);
        dispatcher.finish();
        assert_eq!(*count.lock(), 0);
    }
}
