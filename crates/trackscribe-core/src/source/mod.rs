//! Sample sources
//!
//! A source produces decoded samples of one kind (position, acceleration,
//! ECU telemetry, timing) and pushes them synchronously to registered
//! listeners. The [`SampleSource`] capability is the seam between the
//! coordinator and whatever transport actually delivers the data.

pub mod demo;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::SourceError;

/// Identifies one registered listener within a source
pub type ListenerId = u64;

/// A listener callback invoked synchronously for every sample.
///
/// Errors are logged per-listener and never propagate; one failing listener
/// must not break fan-out to the others.
pub type Listener<T> = Arc<dyn Fn(&T) -> Result<(), SourceError> + Send + Sync>;

/// Capability implemented once per sensor kind
pub trait SampleSource<T: Clone>: Send + Sync {
    /// Begin sample production and listener notification
    fn start(&self) -> Result<(), SourceError>;

    /// Halt sample production; must be idempotent
    fn stop(&self) -> Result<(), SourceError>;

    /// The last sample produced, or `None` before the first arrives
    fn current_sample(&self) -> Option<T>;

    /// Rolling update-frequency estimate in Hz, `None` until two samples
    /// have been observed
    fn update_frequency(&self) -> Option<f64>;

    /// Register a listener; returns an id for later removal
    fn add_listener(&self, listener: Listener<T>) -> ListenerId;

    /// Remove a previously registered listener; returns whether it was found
    fn remove_listener(&self, id: ListenerId) -> bool;
}

struct CoreState<T> {
    current: Option<T>,
    listeners: Vec<(ListenerId, Listener<T>)>,
    next_id: ListenerId,
    last_received: Option<DateTime<Utc>>,
    frequency_hz: Option<f64>,
}

/// Shared plumbing for source implementations: the latest-sample cell, the
/// listener set, and the rolling frequency estimate.
///
/// Concrete sources embed a `SourceCore` and call [`SourceCore::publish`]
/// from their transport thread; everything else on [`SampleSource`] can be
/// delegated here.
pub struct SourceCore<T> {
    name: &'static str,
    state: Mutex<CoreState<T>>,
}

impl<T: Clone> SourceCore<T> {
    /// Create an empty core; `name` tags log lines from this source
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(CoreState {
                current: None,
                listeners: Vec::new(),
                next_id: 0,
                last_received: None,
                frequency_hz: None,
            }),
        }
    }

    /// The source name used in log lines
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Record a new sample and fan it out to every listener.
    ///
    /// The frequency estimate is recomputed as `1000 / Δt` between
    /// consecutive receipt times. Listeners are invoked outside the internal
    /// lock so they may call back into the source.
    pub fn publish(&self, sample: T, received_at: DateTime<Utc>) {
        let listeners: Vec<(ListenerId, Listener<T>)> = {
            let mut state = self.state.lock();
            if let Some(prev) = state.last_received {
                let delta_ms = (received_at - prev).num_milliseconds();
                if delta_ms > 0 {
                    let hz = 1000.0 / delta_ms as f64;
                    state.frequency_hz = Some(hz);
                    tracing::trace!(source = self.name, frequency_hz = hz, "update frequency");
                }
            }
            state.last_received = Some(received_at);
            state.current = Some(sample.clone());
            state.listeners.clone()
        };

        for (id, listener) in listeners {
            if let Err(e) = listener(&sample) {
                tracing::warn!(source = self.name, listener = id, error = %e, "listener failed");
            }
        }
    }

    /// The last published sample
    pub fn current_sample(&self) -> Option<T> {
        self.state.lock().current.clone()
    }

    /// Rolling frequency estimate in Hz
    pub fn update_frequency(&self) -> Option<f64> {
        self.state.lock().frequency_hz
    }

    /// Register a listener
    pub fn add_listener(&self, listener: Listener<T>) -> ListenerId {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.push((id, listener));
        id
    }

    /// Remove a listener by id
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(lid, _)| *lid != id);
        state.listeners.len() != before
    }

    /// Forget the latest sample and frequency estimate (kept across stop so
    /// `current_sample` stays queryable; call explicitly to reset)
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.current = None;
        state.last_received = None;
        state.frequency_hz = None;
    }
}

/// A source whose samples are pushed in by the caller.
///
/// This is the bridging adapter for transports outside the core (Bluetooth,
/// sockets, replay files): decode a sample on whatever thread the transport
/// uses and hand it to [`PushSource::push`]. Samples pushed while the source
/// is stopped are ignored.
pub struct PushSource<T> {
    core: SourceCore<T>,
    running: Mutex<bool>,
}

impl<T: Clone> PushSource<T> {
    /// Create a stopped push source
    pub fn new(name: &'static str) -> Self {
        Self {
            core: SourceCore::new(name),
            running: Mutex::new(false),
        }
    }

    /// Push one decoded sample, stamped with the current wall-clock time
    pub fn push(&self, sample: T) {
        self.push_at(sample, Utc::now());
    }

    /// Push one decoded sample with an explicit receipt time
    pub fn push_at(&self, sample: T, received_at: DateTime<Utc>) {
        if !*self.running.lock() {
            tracing::debug!(source = self.core.name(), "sample pushed while stopped, ignoring");
            return;
        }
        self.core.publish(sample, received_at);
    }
}

impl<T: Clone + Send + Sync> SampleSource<T> for PushSource<T> {
    fn start(&self) -> Result<(), SourceError> {
        *self.running.lock() = true;
        Ok(())
    }

    fn stop(&self) -> Result<(), SourceError> {
        *self.running.lock() = false;
        Ok(())
    }

    fn current_sample(&self) -> Option<T> {
        self.core.current_sample()
    }

    fn update_frequency(&self) -> Option<f64> {
        self.core.update_frequency()
    }

    fn add_listener(&self, listener: Listener<T>) -> ListenerId {
        self.core.add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.core.remove_listener(id)
    }
}
