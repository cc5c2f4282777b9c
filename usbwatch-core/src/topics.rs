//! Topic names and per-topic fan-out of change events
//!
//! Every event is published under six topics, most specific first:
//! `add:1256:20539`, `add:1256`, `add`, then the kind-agnostic
//! `change:1256:20539`, `change:1256`, `change`. IDs are decimal.

use crate::types::ChangeEvent;

/// Kind-agnostic topic prefix
pub const CHANGE: &str = "change";

impl ChangeEvent {
    /// Topic names this event is published under, most specific first
    pub fn topics(&self) -> Vec<String> {
        let vid = self.record.vendor_id;
        let pid = self.record.product_id;
        let kind = self.kind.as_str();
        vec![
            format!("{kind}:{vid}:{pid}"),
            format!("{kind}:{vid}"),
            kind.to_string(),
            format!("{CHANGE}:{vid}:{pid}"),
            format!("{CHANGE}:{vid}"),
            CHANGE.to_string(),
        ]
    }

    pub fn matches_topic(&self, topic: &str) -> bool {
        self.topics().iter().any(|t| t == topic)
    }
}

/// Check that `topic` has the shape `<add|remove|change>[:<vid>[:<pid>]]`
pub fn is_valid_topic(topic: &str) -> bool {
    let mut parts = topic.split(':');
    let kind_ok = matches!(parts.next(), Some("add" | "remove" | "change"));
    let ids: Vec<&str> = parts.collect();
    kind_ok && ids.len() <= 2 && ids.iter().all(|id| id.parse::<u16>().is_ok())
}

type Handler = Box<dyn FnMut(&ChangeEvent) + Send>;

/// Routes change events to handlers registered per topic
///
/// Usable directly as a `Monitor::start` callback via
/// [`EventRouter::into_callback`].
#[derive(Default)]
pub struct EventRouter {
    handlers: Vec<(String, Handler)>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`
    pub fn on<F>(mut self, topic: impl Into<String>, handler: F) -> Self
    where
        F: FnMut(&ChangeEvent) + Send + 'static,
    {
        self.handlers.push((topic.into(), Box::new(handler)));
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run every handler whose topic matches, in registration order
    ///
    /// Returns the number of handlers invoked.
    pub fn dispatch(&mut self, event: &ChangeEvent) -> usize {
        let topics = event.topics();
        let mut invoked = 0;
        for (topic, handler) in self.handlers.iter_mut() {
            if topics.iter().any(|t| t == topic) {
                handler(event);
                invoked += 1;
            }
        }
        invoked
    }

    pub fn into_callback(mut self) -> impl FnMut(ChangeEvent) + Send + 'static {
        move |event| {
            self.dispatch(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceRecord, PartialRecord};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_topics_for_add() {
        let event = ChangeEvent::added(DeviceRecord::new(0x04e8, 0x503b));
        assert_eq!(
            event.topics(),
            vec![
                "add:1256:20539",
                "add:1256",
                "add",
                "change:1256:20539",
                "change:1256",
                "change"
            ]
        );
    }

    #[test]
    fn test_topics_for_unregistered_removal() {
        let event = ChangeEvent::removed_unregistered(PartialRecord::default());
        assert!(event.matches_topic("remove:0:0"));
        assert!(event.matches_topic("change"));
        assert!(!event.matches_topic("add"));
    }

    #[test]
    fn test_topic_validation() {
        assert!(is_valid_topic("add"));
        assert!(is_valid_topic("remove:1256"));
        assert!(is_valid_topic("change:1256:20539"));
        assert!(!is_valid_topic("attach"));
        assert!(!is_valid_topic("add:0x04e8"));
        assert!(!is_valid_topic("add:1:2:3"));
        assert!(!is_valid_topic("add:70000"));
    }

    #[test]
    fn test_router_fans_out_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (Arc::clone(&log), Arc::clone(&log), Arc::clone(&log));

        let mut router = EventRouter::new()
            .on("change", move |_| a.lock().push("change"))
            .on("remove", move |_| b.lock().push("remove"))
            .on("add:1256", move |_| c.lock().push("add:1256"));

        let invoked = router.dispatch(&ChangeEvent::added(DeviceRecord::new(1256, 1)));
        assert_eq!(invoked, 2);
        assert_eq!(*log.lock(), vec!["change", "add:1256"]);

        log.lock().clear();
        router.dispatch(&ChangeEvent::removed(DeviceRecord::new(1, 1)));
        assert_eq!(*log.lock(), vec!["change", "remove"]);
    }

    #[test]
    fn test_router_as_callback() {
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let mut callback = EventRouter::new()
            .on("add", move |_| *sink.lock() += 1)
            .into_callback();

        callback(ChangeEvent::added(DeviceRecord::default()));
        callback(ChangeEvent::removed(DeviceRecord::default()));
        assert_eq!(*count.lock(), 1);
    }
}
