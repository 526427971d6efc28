//! Event-class handler registry
//!
//! Maps an event's class byte to the callback that consumes its fully
//! reassembled payload. Owned by the poller instance that dispatches into
//! it, so handlers are released together with the endpoint.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use termlink_proto::{EventId, Tid};

/// Callback consuming one reassembled event payload
pub type HandlerFn = Box<dyn Fn(Tid, u8, EventId, Bytes) + Send + Sync>;

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<u8, HandlerFn>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_class`, replacing any previous one.
    pub fn register<F>(&self, event_class: u8, handler: F)
    where
        F: Fn(Tid, u8, EventId, Bytes) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.insert(event_class, Box::new(handler));
    }

    /// Invoke the handler for `event_class`, if one is registered.
    ///
    /// Returns false when no handler matched (logged; the event is still
    /// acknowledged by the caller so the terminus can release it).
    pub fn dispatch(&self, tid: Tid, event_class: u8, event_id: EventId, payload: Bytes) -> bool {
        let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        match handlers.get(&event_class) {
            Some(handler) => {
                handler(tid, event_class, event_id, payload);
                true
            }
            None => {
                tracing::warn!(
                    event_class = format_args!("{event_class:#x}"),
                    event_id = format_args!("{event_id:#x}"),
                    "no handler registered for event class"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn dispatch_invokes_registered_handler_once() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry.register(0x05, move |tid, class, id, payload| {
            counter.fetch_add(1, Ordering::SeqCst);
            assert_eq!(tid, 2);
            assert_eq!(class, 0x05);
            assert_eq!(id, 0x10);
            assert_eq!(&payload[..], b"ABCD");
        });

        assert!(registry.dispatch(2, 0x05, 0x10, Bytes::from_static(b"ABCD")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatch_without_handler_is_a_noop() {
        let registry = HandlerRegistry::new();
        assert!(!registry.dispatch(1, 0xFA, 0x20, Bytes::new()));
    }

    #[test]
    fn register_replaces_previous_handler() {
        let registry = HandlerRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        registry.register(0x05, move |_, _, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = second.clone();
        registry.register(0x05, move |_, _, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.dispatch(1, 0x05, 1, Bytes::new());
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
