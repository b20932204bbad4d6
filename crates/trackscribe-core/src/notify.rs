//! Notification fan-out
//!
//! Two pieces distinguish this from a plain observer list: a late subscriber
//! immediately receives the current known state (so it never races
//! background work that already progressed), and listener references are
//! weak, scrubbed opportunistically on every mutating registry operation.
//! Callers keep the `Arc`; dropping it is equivalent to unregistering.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NotifyError;

/// A listener receiving events of type `E`.
///
/// Errors are logged and isolated during dispatch; a failing listener never
/// blocks delivery to the rest.
pub trait HubListener<E>: Send + Sync {
    /// Handle one event
    fn notify(&self, event: &E) -> Result<(), NotifyError>;
}

/// Blanket impl so plain closures can subscribe
impl<E, F> HubListener<E> for F
where
    F: Fn(&E) -> Result<(), NotifyError> + Send + Sync,
{
    fn notify(&self, event: &E) -> Result<(), NotifyError> {
        self(event)
    }
}

struct HubState<E> {
    listeners: Vec<Weak<dyn HubListener<E>>>,
    last: Option<E>,
}

/// Generic pub/sub registry with replay-on-subscribe.
///
/// [`NotificationHub::publish`] records the event as the current state and
/// replays it to any listener that subscribes afterwards;
/// [`NotificationHub::publish_transient`] dispatches without updating the
/// replay state (progress reports, data updates, failures).
pub struct NotificationHub<E> {
    state: Mutex<HubState<E>>,
}

impl<E: Clone> NotificationHub<E> {
    /// Create an empty hub with no replay state
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState {
                listeners: Vec::new(),
                last: None,
            }),
        }
    }

    /// Register a listener, replaying the current state to it immediately.
    ///
    /// Dead entries are scrubbed first; duplicate registration of the same
    /// live listener is rejected and returns `false`.
    pub fn subscribe(&self, listener: &Arc<dyn HubListener<E>>) -> bool {
        let replay = {
            let mut state = self.state.lock();
            state.listeners.retain(|w| w.strong_count() > 0);
            let duplicate = state
                .listeners
                .iter()
                .any(|w| w.upgrade().is_some_and(|l| Arc::ptr_eq(&l, listener)));
            if duplicate {
                return false;
            }
            state.listeners.push(Arc::downgrade(listener));
            state.last.clone()
        };
        if let Some(event) = replay {
            if let Err(e) = listener.notify(&event) {
                tracing::warn!(error = %e, "listener failed during replay");
            }
        }
        true
    }

    /// Remove a listener; returns whether it was registered
    pub fn unsubscribe(&self, listener: &Arc<dyn HubListener<E>>) -> bool {
        let mut state = self.state.lock();
        let before = state.listeners.len();
        state
            .listeners
            .retain(|w| w.upgrade().is_some_and(|l| !Arc::ptr_eq(&l, listener)));
        state.listeners.len() != before
    }

    /// Dispatch an event and record it as the current state for replay
    pub fn publish(&self, event: E) {
        self.dispatch(event, true);
    }

    /// Dispatch an event without touching the replay state
    pub fn publish_transient(&self, event: E) {
        self.dispatch(event, false);
    }

    /// The event a new subscriber would be replayed, if any
    pub fn last(&self) -> Option<E> {
        self.state.lock().last.clone()
    }

    /// Forget the replay state (e.g. between sessions)
    pub fn clear_last(&self) {
        self.state.lock().last = None;
    }

    /// Number of live listeners
    pub fn listener_count(&self) -> usize {
        self.state
            .lock()
            .listeners
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    fn dispatch(&self, event: E, record: bool) {
        // Snapshot upgraded listeners, then invoke outside the lock so a
        // listener may call back into the hub.
        let listeners: Vec<Arc<dyn HubListener<E>>> = {
            let mut state = self.state.lock();
            if record {
                state.last = Some(event.clone());
            }
            state.listeners.retain(|w| w.strong_count() > 0);
            state.listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            if let Err(e) = listener.notify(&event) {
                tracing::warn!(error = %e, "listener failed, skipping");
            }
        }
    }
}

impl<E: Clone> Default for NotificationHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Status of one tracked request/session, ordered by weight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleStatus {
    /// Nothing known for this id
    NotQueued,
    /// Accepted and waiting
    Queued,
    /// Handler is initializing
    Starting,
    /// Handler finished initializing
    Started,
    /// Actively processing
    Running,
    /// Completed
    Finished,
    /// Terminated with an error
    Failed,
}

impl LifecycleStatus {
    /// Monotonic ordering weight; a handler never regresses to a
    /// lower-weight status within the same request
    pub fn weight(self) -> u8 {
        match self {
            Self::NotQueued => 0,
            Self::Queued => 1,
            Self::Starting => 2,
            Self::Started => 3,
            Self::Running => 4,
            Self::Finished => 5,
            Self::Failed => 6,
        }
    }
}

/// A lifecycle status change for a tracked request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    /// The request this change applies to
    pub request: Uuid,
    /// The new status
    pub status: LifecycleStatus,
}

struct TrackerState {
    statuses: HashMap<Uuid, LifecycleStatus>,
    keyed: HashMap<Uuid, Vec<Weak<dyn HubListener<StatusChange>>>>,
    global: Vec<Weak<dyn HubListener<StatusChange>>>,
}

/// Keyed request-lifecycle registry.
///
/// Listeners register per request id or service-wide. A per-id subscriber is
/// immediately replayed the current status for that id — `NotQueued` when no
/// state exists — so it never needs a separate polling call to bootstrap.
/// Status updates are monotonic by [`LifecycleStatus::weight`]; regressions
/// and same-status repeats are ignored and not re-dispatched.
pub struct RequestTracker {
    state: Mutex<TrackerState>,
}

impl RequestTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                statuses: HashMap::new(),
                keyed: HashMap::new(),
                global: Vec::new(),
            }),
        }
    }

    /// The current status for `request` (`NotQueued` when unknown)
    pub fn status(&self, request: Uuid) -> LifecycleStatus {
        self.state
            .lock()
            .statuses
            .get(&request)
            .copied()
            .unwrap_or(LifecycleStatus::NotQueued)
    }

    /// Register a listener for one request id, replaying the current status.
    ///
    /// Returns `false` if this live listener is already registered for the
    /// id. Dead entries are scrubbed on the way.
    pub fn subscribe(
        &self,
        request: Uuid,
        listener: &Arc<dyn HubListener<StatusChange>>,
    ) -> bool {
        let replay = {
            let mut state = self.state.lock();
            let entries = state.keyed.entry(request).or_default();
            entries.retain(|w| w.strong_count() > 0);
            let duplicate = entries
                .iter()
                .any(|w| w.upgrade().is_some_and(|l| Arc::ptr_eq(&l, listener)));
            if duplicate {
                return false;
            }
            entries.push(Arc::downgrade(listener));
            state
                .statuses
                .get(&request)
                .copied()
                .unwrap_or(LifecycleStatus::NotQueued)
        };
        let change = StatusChange {
            request,
            status: replay,
        };
        if let Err(e) = listener.notify(&change) {
            tracing::warn!(request = %request, error = %e, "listener failed during replay");
        }
        true
    }

    /// Register a service-wide listener (no replay; it observes all ids)
    pub fn subscribe_global(&self, listener: &Arc<dyn HubListener<StatusChange>>) -> bool {
        let mut state = self.state.lock();
        state.global.retain(|w| w.strong_count() > 0);
        let duplicate = state
            .global
            .iter()
            .any(|w| w.upgrade().is_some_and(|l| Arc::ptr_eq(&l, listener)));
        if duplicate {
            return false;
        }
        state.global.push(Arc::downgrade(listener));
        true
    }

    /// Remove a listener from every registration
    pub fn unsubscribe(&self, listener: &Arc<dyn HubListener<StatusChange>>) -> bool {
        let mut state = self.state.lock();
        let mut removed = false;
        let live = |w: &Weak<dyn HubListener<StatusChange>>| {
            w.upgrade().is_some_and(|l| !Arc::ptr_eq(&l, listener))
        };
        for entries in state.keyed.values_mut() {
            let before = entries.len();
            entries.retain(&live);
            removed |= entries.len() != before;
        }
        let before = state.global.len();
        state.global.retain(&live);
        removed |= state.global.len() != before;
        removed
    }

    /// Advance `request` to `status`.
    ///
    /// Returns `true` and dispatches only when the new status carries a
    /// strictly greater weight than the current one; regressions are dropped
    /// with a warning, repeats silently.
    pub fn advance(&self, request: Uuid, status: LifecycleStatus) -> bool {
        let listeners: Vec<Arc<dyn HubListener<StatusChange>>> = {
            let mut state = self.state.lock();
            let current = state
                .statuses
                .get(&request)
                .copied()
                .unwrap_or(LifecycleStatus::NotQueued);
            if status.weight() < current.weight() {
                tracing::warn!(
                    request = %request,
                    from = ?current,
                    to = ?status,
                    "ignoring lifecycle status regression"
                );
                return false;
            }
            if status.weight() == current.weight() {
                return false;
            }
            state.statuses.insert(request, status);
            let mut listeners: Vec<Arc<dyn HubListener<StatusChange>>> = Vec::new();
            if let Some(entries) = state.keyed.get_mut(&request) {
                entries.retain(|w| w.strong_count() > 0);
                listeners.extend(entries.iter().filter_map(Weak::upgrade));
            }
            state.global.retain(|w| w.strong_count() > 0);
            listeners.extend(state.global.iter().filter_map(Weak::upgrade));
            listeners
        };
        let change = StatusChange { request, status };
        for listener in listeners {
            if let Err(e) = listener.notify(&change) {
                tracing::warn!(request = %request, error = %e, "listener failed, skipping");
            }
        }
        true
    }

    /// Forget a finished request and its per-id listeners
    pub fn clear(&self, request: Uuid) {
        let mut state = self.state.lock();
        state.statuses.remove(&request);
        state.keyed.remove(&request);
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}
