//! Lifecycle events and the typed publish/subscribe dispatcher.
//!
//! The host automation framework observes a session exclusively through the
//! six lifecycle event kinds below. The dispatcher fans each published event
//! out to every listener registered for its kind, synchronously and in
//! subscription order, so hosts see transitions in the exact order they
//! occur. A listener that panics is caught and logged; the remaining
//! listeners still run and nothing propagates back into the session core.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

// ── Events ─────────────────────────────────────────────────────────

/// A discrete, ordered notification of session state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A session was accepted and is starting up.
    Started,
    /// The session returned to idle.
    Ended,
    /// The session failed; the payload is a human-readable message.
    Error(String),
    /// The microphone path is live and the agent is waiting for speech.
    Listening,
    /// The agent is working on the user's utterance; all audio is muted.
    Processing,
    /// The agent is speaking through the agent output device.
    Replying,
}

impl LifecycleEvent {
    /// The kind used for listener registration.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Started => EventKind::Started,
            Self::Ended => EventKind::Ended,
            Self::Error(_) => EventKind::Error,
            Self::Listening => EventKind::Listening,
            Self::Processing => EventKind::Processing,
            Self::Replying => EventKind::Replying,
        }
    }
}

/// Discriminant of [`LifecycleEvent`], used to subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Started,
    Ended,
    Error,
    Listening,
    Processing,
    Replying,
}

impl EventKind {
    /// Stable name for logs and config keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Ended => "ended",
            Self::Error => "error",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Replying => "replying",
        }
    }

    /// All six kinds, in lifecycle order.
    pub fn all() -> &'static [EventKind] {
        &[
            Self::Started,
            Self::Ended,
            Self::Error,
            Self::Listening,
            Self::Processing,
            Self::Replying,
        ]
    }
}

// ── Dispatcher ─────────────────────────────────────────────────────

/// A registered event listener.
pub type Listener = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Typed publish/subscribe fan-out for lifecycle events.
///
/// Listeners are invoked synchronously inside [`publish`](Self::publish),
/// in the order they were subscribed. Registration is cheap; publishing
/// clones the matching listener handles out of the registry first, so a
/// listener may itself subscribe or query the dispatcher without
/// deadlocking.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: Mutex<Vec<(EventKind, Listener)>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one event kind.
    ///
    /// Multiple listeners per kind are permitted and run in subscription
    /// order.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.listeners.lock().push((kind, Arc::new(listener)));
    }

    /// Deliver an event to every listener registered for its kind.
    ///
    /// A panicking listener is isolated: the panic is caught and logged,
    /// and dispatch continues with the remaining listeners.
    pub fn publish(&self, event: &LifecycleEvent) {
        let kind = event.kind();
        let matching: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, l)| Arc::clone(l))
            .collect();

        tracing::debug!(
            event = kind.as_str(),
            listeners = matching.len(),
            "Dispatching lifecycle event"
        );

        for listener in matching {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::warn!(
                    event = kind.as_str(),
                    "Lifecycle listener panicked; continuing with remaining listeners"
                );
            }
        }
    }

    /// Number of listeners registered for a kind.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.lock().iter().filter(|(k, _)| *k == kind).count()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
