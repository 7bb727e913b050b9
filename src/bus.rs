//! Typed publish/subscribe event bus.
//!
//! Subsystems publish device-level transitions here; the device
//! coordinator and the supervisor subscribe. Handlers are registered per
//! event kind and run outside the registry lock so a handler may
//! re-subscribe or publish without deadlocking.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, error};

/// Closed set of event payloads. Every device-visible transition in the
/// system is one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    StartListening,
    StopListening,
    /// Post-mix speaker level 0..=255, `None` when speech ends.
    TalkLevel(Option<u8>),
    Shutdown,
    FunctionInvoking { name: String },
    FunctionInvoked { name: String },
    SystemError { message: String },
    SystemOk,
    WakeWordDetected { model: String },
    NoiseDetected,
    SilenceDetected,
    ConfigChanged,
    HangupInput,
    VolumeCtrlUp,
    VolumeCtrlDown,
    NightModeActivated,
    NightModeDeactivated,
}

impl EventPayload {
    /// Kind discriminant used as the subscription key.
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::StartListening => EventKind::StartListening,
            EventPayload::StopListening => EventKind::StopListening,
            EventPayload::TalkLevel(_) => EventKind::TalkLevel,
            EventPayload::Shutdown => EventKind::Shutdown,
            EventPayload::FunctionInvoking { .. } => EventKind::FunctionInvoking,
            EventPayload::FunctionInvoked { .. } => EventKind::FunctionInvoked,
            EventPayload::SystemError { .. } => EventKind::SystemError,
            EventPayload::SystemOk => EventKind::SystemOk,
            EventPayload::WakeWordDetected { .. } => EventKind::WakeWordDetected,
            EventPayload::NoiseDetected => EventKind::NoiseDetected,
            EventPayload::SilenceDetected => EventKind::SilenceDetected,
            EventPayload::ConfigChanged => EventKind::ConfigChanged,
            EventPayload::HangupInput => EventKind::HangupInput,
            EventPayload::VolumeCtrlUp => EventKind::VolumeCtrlUp,
            EventPayload::VolumeCtrlDown => EventKind::VolumeCtrlDown,
            EventPayload::NightModeActivated => EventKind::NightModeActivated,
            EventPayload::NightModeDeactivated => EventKind::NightModeDeactivated,
        }
    }

    /// Per-frame meter levels would flood the log.
    pub fn skip_logging(&self) -> bool {
        matches!(self, EventPayload::TalkLevel(_))
    }
}

/// Fieldless mirror of [`EventPayload`], used as the topic key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StartListening,
    StopListening,
    TalkLevel,
    Shutdown,
    FunctionInvoking,
    FunctionInvoked,
    SystemError,
    SystemOk,
    WakeWordDetected,
    NoiseDetected,
    SilenceDetected,
    ConfigChanged,
    HangupInput,
    VolumeCtrlUp,
    VolumeCtrlDown,
    NightModeActivated,
    NightModeDeactivated,
}

/// A published event: payload plus provenance.
#[derive(Debug, Clone)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub sender: &'static str,
    pub payload: EventPayload,
}

pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Typed topic registry. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct EventBus {
    topics: Arc<Mutex<HashMap<EventKind, Vec<Handler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register `handler` for `kind`. Registering the same handler
    /// (same `Arc`) twice is a no-op.
    pub fn subscribe(&self, kind: EventKind, handler: Handler) {
        let mut topics = self.topics.lock().unwrap();
        let handlers = topics.entry(kind).or_default();
        if handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            return;
        }
        handlers.push(handler);
    }

    /// Remove a previously registered handler (by identity).
    pub fn unsubscribe(&self, kind: EventKind, handler: &Handler) {
        let mut topics = self.topics.lock().unwrap();
        if let Some(handlers) = topics.get_mut(&kind) {
            handlers.retain(|h| !Arc::ptr_eq(h, handler));
        }
    }

    /// Publish a payload on behalf of `sender`.
    ///
    /// The subscriber list is snapshotted under the lock and handlers run
    /// outside it, so a handler may publish or (un)subscribe freely. A
    /// panicking handler is logged and the remaining handlers still run.
    pub fn publish(&self, sender: &'static str, payload: EventPayload) {
        let event = Event {
            timestamp: Utc::now(),
            sender,
            payload,
        };

        if !event.payload.skip_logging() {
            debug!(sender, payload = ?event.payload, "event");
        }

        let snapshot: Vec<Handler> = {
            let topics = self.topics.lock().unwrap();
            topics
                .get(&event.payload.kind())
                .map(|h| h.to_vec())
                .unwrap_or_default()
        };

        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                error!(sender, kind = ?event.payload.kind(), "event handler panicked");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delivers_to_matching_topic_only() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        bus.subscribe(
            EventKind::NoiseDetected,
            Arc::new(move |_| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish("test", EventPayload::NoiseDetected);
        bus.publish("test", EventPayload::SilenceDetected);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_registration_is_idempotent() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let handler: Handler = Arc::new(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        bus.subscribe(EventKind::SystemOk, handler.clone());
        bus.subscribe(EventKind::SystemOk, handler.clone());
        bus.publish("test", EventPayload::SystemOk);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_does_not_stop_delivery() {
        let bus = EventBus::new();
        bus.subscribe(
            EventKind::SystemOk,
            Arc::new(|_| panic!("handler failure")),
        );

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        bus.subscribe(
            EventKind::SystemOk,
            Arc::new(move |_| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish("test", EventPayload::SystemOk);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_resubscribe_during_publish() {
        let bus = EventBus::new();
        let bus2 = bus.clone();
        bus.subscribe(
            EventKind::ConfigChanged,
            Arc::new(move |_| {
                bus2.subscribe(EventKind::SystemOk, Arc::new(|_| {}));
            }),
        );
        // Must not deadlock.
        bus.publish("test", EventPayload::ConfigChanged);
    }

    #[test]
    fn talk_level_skips_logging() {
        assert!(EventPayload::TalkLevel(Some(40)).skip_logging());
        assert!(!EventPayload::SystemOk.skip_logging());
    }
}
