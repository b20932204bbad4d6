//! Logging coordinator
//!
//! The central state machine: waits for every configured source to produce
//! its first sample (the readiness gate), owns the session lifecycle and the
//! persistence pipeline, fuses source updates into log rows, and fans
//! lifecycle notifications out through the notification hub. Source
//! providers deliver updates concurrently; all mutable coordinator state
//! lives behind one lock.

mod pipeline;

pub use pipeline::{
    FailureHook, PersistRecord, PersistencePipeline, PipelineStats, DEFAULT_DRAIN_BATCH,
    DEFAULT_QUEUE_CAPACITY,
};

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{CoordinatorError, SourceError, StoreError};
use crate::notify::{HubListener, NotificationHub};
use crate::sample::{
    AccelSample, EcuSample, LocationSample, LogEntry, SessionId, TimingSample,
};
use crate::source::{ListenerId, SampleSource};
use crate::store::SessionStore;

/// Coordinator configuration, passed explicitly into [`Coordinator::new`]
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Reopen this session instead of creating a new one
    pub session_id: Option<SessionId>,
    /// Persistence queue capacity
    pub queue_capacity: usize,
    /// Maximum records the writer drains per cycle
    pub drain_batch: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            session_id: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            drain_batch: DEFAULT_DRAIN_BATCH,
        }
    }
}

/// The sensor streams the coordinator fuses.
///
/// Location and acceleration are required; the ECU stream is optional and,
/// when absent, is skipped by the readiness gate and the fused rows. The
/// timing source is started late, on the readiness transition, so timing
/// events never precede the other data.
pub struct Sources {
    /// Position source
    pub location: Arc<dyn SampleSource<LocationSample>>,
    /// Acceleration source
    pub accel: Arc<dyn SampleSource<AccelSample>>,
    /// Optional ECU telemetry source
    pub ecu: Option<Arc<dyn SampleSource<EcuSample>>>,
    /// Timing source (normally a [`crate::timing::TimingEngine`])
    pub timing: Arc<dyn SampleSource<TimingSample>>,
}

/// Latest known sample per stream, carried by
/// [`CoordinatorEvent::ReadyProgress`] so observers can render partial
/// readiness
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadinessSnapshot {
    /// Latest position fix, if any
    pub location: Option<LocationSample>,
    /// Latest acceleration sample, if any
    pub accel: Option<AccelSample>,
    /// Latest ECU frame, if any
    pub ecu: Option<EcuSample>,
    /// Whether an ECU source is configured at all
    pub ecu_enabled: bool,
}

impl ReadinessSnapshot {
    /// True when every enabled source has produced at least one sample
    pub fn is_ready(&self) -> bool {
        self.location.is_some() && self.accel.is_some() && (!self.ecu_enabled || self.ecu.is_some())
    }
}

/// Lifecycle and data notifications emitted by the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    /// A session is initializing
    Starting,
    /// Session initialization finished
    Started,
    /// Session initialization failed; best-effort cleanup was attempted
    StartFailed(String),
    /// Not all sources are ready yet; carries the partial samples
    ReadyProgress(ReadinessSnapshot),
    /// Every enabled source has produced a sample; logging is live
    Ready,
    /// The first timing event after readiness: the canonical "go" signal
    TimingStartTriggerFired,
    /// A timing sample arrived after the start trigger
    TimingDataUpdate(TimingSample),
    /// Data was lost or a write failed; the session keeps running
    LoggingFailed(String),
    /// A session is shutting down
    Stopping,
    /// Shutdown finished cleanly
    Stopped,
    /// Shutdown hit errors; internal state was still reset
    StopFailed(String),
}

/// Shorthand for the coordinator's listener trait object
pub type CoordinatorListener = dyn HubListener<CoordinatorEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Running,
    Stopping,
}

enum Update {
    Location(LocationSample),
    /// Accel and Ecu updates only re-evaluate readiness
    Passive,
    Timing(TimingSample),
}

#[derive(Default)]
struct Subscriptions {
    location: Option<ListenerId>,
    accel: Option<ListenerId>,
    ecu: Option<ListenerId>,
    timing: Option<ListenerId>,
}

struct RunState {
    phase: Phase,
    session: Option<SessionId>,
    ready: bool,
    trigger_fired: bool,
    pipeline: Option<PersistencePipeline>,
    subs: Subscriptions,
}

struct CoordinatorInner {
    config: CoordinatorConfig,
    sources: Sources,
    store: Arc<dyn SessionStore>,
    hub: NotificationHub<CoordinatorEvent>,
    state: Mutex<RunState>,
}

/// The data-provider coordinator: readiness gate, session lifecycle, sample
/// fan-in, notification fan-out, and ownership of the persistence pipeline.
///
/// `start` and `stop` are idempotent and safe to call from different
/// threads; source callbacks are handled synchronously on the producer's
/// thread and never throw back through it.
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    /// Create a coordinator over the given sources and store
    pub fn new(sources: Sources, store: Arc<dyn SessionStore>, config: CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                sources,
                store,
                hub: NotificationHub::new(),
                state: Mutex::new(RunState {
                    phase: Phase::Idle,
                    session: None,
                    ready: false,
                    trigger_fired: false,
                    pipeline: None,
                    subs: Subscriptions::default(),
                }),
            }),
        }
    }

    /// Start a logging session. No-op when already running.
    ///
    /// Resolves or opens the session, clears the queue and counters, starts
    /// the writer, subscribes to every source, then starts each source
    /// except the timing engine, which starts only once readiness is
    /// reached. Emits `Starting`/`Started`, or `StartFailed` with the cause
    /// followed by best-effort cleanup.
    pub fn start(&self) -> Result<(), CoordinatorError> {
        {
            let mut st = self.inner.state.lock();
            if st.phase != Phase::Idle {
                tracing::debug!("start ignored, coordinator already active");
                return Ok(());
            }
            st.phase = Phase::Starting;
        }
        self.inner.hub.publish(CoordinatorEvent::Starting);

        match CoordinatorInner::try_start(&self.inner) {
            Ok(session) => {
                self.inner.state.lock().phase = Phase::Running;
                tracing::info!(session = %session, "logging session started");
                self.inner.hub.publish(CoordinatorEvent::Started);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "session start failed");
                self.inner
                    .hub
                    .publish(CoordinatorEvent::StartFailed(e.to_string()));
                CoordinatorInner::teardown(&self.inner);
                Err(e)
            }
        }
    }

    /// Stop the running session. No-op (and silent) when not running.
    ///
    /// Unsubscribes from and stops every source, each failure logged
    /// independently without aborting the remaining cleanup, then drains and
    /// joins the writer. Internal handles are reset even when sub-components
    /// fail to stop.
    pub fn stop(&self) -> Result<(), CoordinatorError> {
        {
            let mut st = self.inner.state.lock();
            if st.phase != Phase::Running {
                return Ok(());
            }
            st.phase = Phase::Stopping;
        }
        self.inner.hub.publish(CoordinatorEvent::Stopping);

        let (attempted, causes) = CoordinatorInner::teardown(&self.inner);
        if causes.is_empty() {
            tracing::info!("logging session stopped");
            self.inner.hub.publish(CoordinatorEvent::Stopped);
            Ok(())
        } else {
            let joined = causes.join("; ");
            self.inner
                .hub
                .publish(CoordinatorEvent::StopFailed(joined.clone()));
            Err(CoordinatorError::StopIncomplete {
                failed: causes.len(),
                total: attempted,
                causes: joined,
            })
        }
    }

    /// Whether a session is currently running
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().phase == Phase::Running
    }

    /// Whether the readiness gate is passed; always false when not running
    pub fn is_ready(&self) -> bool {
        let st = self.inner.state.lock();
        st.phase == Phase::Running && st.ready
    }

    /// Whether the start trigger has fired this session
    pub fn is_logging_start_trigger_fired(&self) -> bool {
        self.inner.state.lock().trigger_fired
    }

    /// The active session id, if running
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.state.lock().session
    }

    /// Write/drop counters of the active pipeline, if running
    pub fn pipeline_stats(&self) -> Option<PipelineStats> {
        self.inner
            .state
            .lock()
            .pipeline
            .as_ref()
            .map(PersistencePipeline::stats)
    }

    /// Register a lifecycle listener.
    ///
    /// The current lifecycle state is replayed to it immediately, so a late
    /// subscriber never races background progress. Returns `false` for a
    /// duplicate registration.
    pub fn register(&self, listener: &Arc<CoordinatorListener>) -> bool {
        self.inner.hub.subscribe(listener)
    }

    /// Remove a previously registered listener
    pub fn unregister(&self, listener: &Arc<CoordinatorListener>) -> bool {
        self.inner.hub.unsubscribe(listener)
    }

    /// Latest position fix
    pub fn current_location(&self) -> Option<LocationSample> {
        self.inner.sources.location.current_sample()
    }

    /// Latest acceleration sample
    pub fn current_accel(&self) -> Option<AccelSample> {
        self.inner.sources.accel.current_sample()
    }

    /// Latest ECU frame, `None` when no ECU source is configured
    pub fn current_ecu(&self) -> Option<EcuSample> {
        self.inner.sources.ecu.as_ref().and_then(|s| s.current_sample())
    }

    /// Latest timing sample
    pub fn current_timing(&self) -> Option<TimingSample> {
        self.inner.sources.timing.current_sample()
    }

    /// Position update frequency estimate in Hz
    pub fn location_frequency(&self) -> Option<f64> {
        self.inner.sources.location.update_frequency()
    }

    /// Acceleration update frequency estimate in Hz
    pub fn accel_frequency(&self) -> Option<f64> {
        self.inner.sources.accel.update_frequency()
    }

    /// ECU update frequency estimate in Hz
    pub fn ecu_frequency(&self) -> Option<f64> {
        self.inner.sources.ecu.as_ref().and_then(|s| s.update_frequency())
    }
}

impl CoordinatorInner {
    fn try_start(inner: &Arc<Self>) -> Result<SessionId, CoordinatorError> {
        let session = match inner.config.session_id {
            Some(id) => {
                inner.store.open_session(id)?;
                id
            }
            None => inner.store.create_session()?,
        };

        // Fresh pipeline per session: queue and counters start empty.
        let weak = Arc::downgrade(inner);
        let on_failure: pipeline::FailureHook = Arc::new(move |msg: String| {
            if let Some(inner) = weak.upgrade() {
                inner.on_writer_failure(msg);
            }
        });
        let pipe = PersistencePipeline::spawn(
            Arc::clone(&inner.store),
            session,
            inner.config.queue_capacity,
            inner.config.drain_batch,
            on_failure,
        )
        .map_err(StoreError::Io)?;

        let subs = Subscriptions {
            location: Some(inner.sources.location.add_listener({
                let weak = Arc::downgrade(inner);
                Arc::new(move |s: &LocationSample| {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_update(Update::Location(s.clone()));
                    }
                    Ok(())
                })
            })),
            accel: Some(inner.sources.accel.add_listener({
                let weak = Arc::downgrade(inner);
                Arc::new(move |_: &AccelSample| {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_update(Update::Passive);
                    }
                    Ok(())
                })
            })),
            ecu: inner.sources.ecu.as_ref().map(|ecu| {
                ecu.add_listener({
                    let weak = Arc::downgrade(inner);
                    Arc::new(move |_: &EcuSample| {
                        if let Some(inner) = weak.upgrade() {
                            inner.handle_update(Update::Passive);
                        }
                        Ok(())
                    })
                })
            }),
            timing: Some(inner.sources.timing.add_listener({
                let weak = Arc::downgrade(inner);
                Arc::new(move |s: &TimingSample| {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_update(Update::Timing(s.clone()));
                    }
                    Ok(())
                })
            })),
        };

        {
            let mut st = inner.state.lock();
            st.session = Some(session);
            st.ready = false;
            st.trigger_fired = false;
            st.pipeline = Some(pipe);
            st.subs = subs;
        }

        // The timing engine is deliberately not started here; it starts on
        // the readiness transition so timing events cannot precede data.
        inner.sources.location.start()?;
        inner.sources.accel.start()?;
        if let Some(ecu) = &inner.sources.ecu {
            ecu.start()?;
        }
        Ok(session)
    }

    /// Unsubscribe and stop everything, resetting internal state.
    ///
    /// Every sub-component stop is attempted regardless of earlier
    /// failures; returns the attempt count and the collected causes.
    fn teardown(inner: &Arc<Self>) -> (usize, Vec<String>) {
        let (pipeline, subs) = {
            let mut st = inner.state.lock();
            st.ready = false;
            st.trigger_fired = false;
            st.session = None;
            (st.pipeline.take(), std::mem::take(&mut st.subs))
        };

        if let Some(id) = subs.location {
            inner.sources.location.remove_listener(id);
        }
        if let Some(id) = subs.accel {
            inner.sources.accel.remove_listener(id);
        }
        if let (Some(id), Some(ecu)) = (subs.ecu, inner.sources.ecu.as_ref()) {
            ecu.remove_listener(id);
        }
        if let Some(id) = subs.timing {
            inner.sources.timing.remove_listener(id);
        }

        let mut attempted = 0;
        let mut causes: Vec<String> = Vec::new();
        let mut attempt = |name: &str, result: Result<(), SourceError>| {
            attempted += 1;
            if let Err(e) = result {
                tracing::warn!(source = name, error = %e, "failed to stop source");
                causes.push(e.to_string());
            }
        };
        attempt("timing", inner.sources.timing.stop());
        attempt("location", inner.sources.location.stop());
        attempt("accel", inner.sources.accel.stop());
        if let Some(ecu) = &inner.sources.ecu {
            attempt("ecu", ecu.stop());
        }
        drop(attempt);

        // Writer goes last so in-flight entries drain before the session
        // closes.
        if let Some(pipe) = pipeline {
            let stats = pipe.shutdown();
            tracing::debug!(?stats, "pipeline shut down");
        }

        inner.state.lock().phase = Phase::Idle;
        (attempted, causes)
    }

    /// Synchronous fan-in from every source's listener callback.
    ///
    /// Must never propagate an error back to the producer thread; failures
    /// surface as notifications only.
    fn handle_update(&self, update: Update) {
        let mut lifecycle: Vec<CoordinatorEvent> = Vec::new();
        let mut transient: Vec<CoordinatorEvent> = Vec::new();
        let mut start_timing = false;
        {
            let mut st = self.state.lock();
            if st.phase != Phase::Running {
                return;
            }

            // Readiness is re-evaluated before any enqueue decision.
            if !st.ready {
                let snapshot = self.readiness_snapshot();
                if snapshot.is_ready() {
                    st.ready = true;
                    start_timing = true;
                    tracing::info!("all sources ready, logging enabled");
                    lifecycle.push(CoordinatorEvent::Ready);
                } else {
                    transient.push(CoordinatorEvent::ReadyProgress(snapshot));
                }
            }

            match update {
                Update::Location(location) => {
                    if st.ready {
                        if let Some(accel) = self.sources.accel.current_sample() {
                            let ecu = self.sources.ecu.as_ref().and_then(|s| s.current_sample());
                            let entry = LogEntry::fuse(location, accel, ecu);
                            if let Some(pipe) = &st.pipeline {
                                if !pipe.offer(PersistRecord::Fused(entry)) {
                                    transient.push(CoordinatorEvent::LoggingFailed(
                                        "persistence queue full, dropped a log entry".into(),
                                    ));
                                }
                            }
                        }
                    }
                }
                Update::Passive => {}
                Update::Timing(sample) => {
                    if st.ready {
                        if !st.trigger_fired {
                            st.trigger_fired = true;
                            tracing::info!("timing start trigger fired");
                            transient.push(CoordinatorEvent::TimingStartTriggerFired);
                        } else {
                            transient.push(CoordinatorEvent::TimingDataUpdate(sample.clone()));
                            if let Some(pipe) = &st.pipeline {
                                if !pipe.offer(PersistRecord::Timing(sample)) {
                                    transient.push(CoordinatorEvent::LoggingFailed(
                                        "persistence queue full, dropped a timing entry".into(),
                                    ));
                                }
                            }
                        }
                    }
                }
            }
        }

        // Everything below runs outside the lock: the timing engine's start
        // and listener dispatch may call back into the coordinator.
        if start_timing {
            if let Err(e) = self.sources.timing.start() {
                tracing::warn!(error = %e, "failed to start timing engine");
                transient.push(CoordinatorEvent::LoggingFailed(format!(
                    "timing engine failed to start: {e}"
                )));
            }
        }
        for event in lifecycle {
            self.hub.publish(event);
        }
        for event in transient {
            self.hub.publish_transient(event);
        }
    }

    fn readiness_snapshot(&self) -> ReadinessSnapshot {
        ReadinessSnapshot {
            location: self.sources.location.current_sample(),
            accel: self.sources.accel.current_sample(),
            ecu: self.sources.ecu.as_ref().and_then(|s| s.current_sample()),
            ecu_enabled: self.sources.ecu.is_some(),
        }
    }

    fn on_writer_failure(&self, msg: String) {
        if self.state.lock().phase == Phase::Running {
            self.hub.publish_transient(CoordinatorEvent::LoggingFailed(msg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::sample::MS_PER_DAY;
    use crate::source::PushSource;
    use crate::store::MemoryStore;
    use crate::timing::{
        ProximityEvent, ProximityKind, PushProximityWatcher, Route, TimingEngine, Waypoint,
    };
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn loc(fix_time_ms: u32) -> LocationSample {
        LocationSample::new(
            fix_time_ms % MS_PER_DAY,
            52.07,
            -1.02,
            155.0,
            41.0,
            170.0,
            Utc::now(),
        )
    }

    fn accel() -> AccelSample {
        AccelSample::new(0.3, 1.0, -0.4, Utc::now())
    }

    fn route() -> Route {
        let waypoints = (0..3)
            .map(|i| Waypoint {
                name: format!("WP{i}"),
                latitude: 52.0 + i as f64 * 0.001,
                longitude: -1.0,
            })
            .collect();
        Route::new("test loop", waypoints).unwrap()
    }

    fn closest(waypoint_index: usize, fix_time_ms: u32) -> ProximityEvent {
        ProximityEvent {
            kind: ProximityKind::ClosestApproach,
            waypoint_index,
            fix_time_ms,
            received_at: Utc::now(),
        }
    }

    struct Collector(parking_lot::Mutex<Vec<CoordinatorEvent>>);

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self(parking_lot::Mutex::new(Vec::new())))
        }
        fn events(&self) -> Vec<CoordinatorEvent> {
            self.0.lock().clone()
        }
        fn count(&self, pred: impl Fn(&CoordinatorEvent) -> bool) -> usize {
            self.0.lock().iter().filter(|e| pred(e)).count()
        }
        fn listener(me: &Arc<Self>) -> Arc<CoordinatorListener> {
            Arc::clone(me) as Arc<CoordinatorListener>
        }
    }

    impl HubListener<CoordinatorEvent> for Collector {
        fn notify(&self, event: &CoordinatorEvent) -> Result<(), crate::error::NotifyError> {
            self.0.lock().push(event.clone());
            Ok(())
        }
    }

    struct Rig {
        coordinator: Coordinator,
        location: Arc<PushSource<LocationSample>>,
        accel: Arc<PushSource<AccelSample>>,
        watcher: Arc<PushProximityWatcher>,
        store: Arc<MemoryStore>,
    }

    fn rig(config: CoordinatorConfig) -> Rig {
        rig_with_store(config, Arc::new(MemoryStore::new()))
    }

    fn rig_with_store(config: CoordinatorConfig, store: Arc<MemoryStore>) -> Rig {
        let location = Arc::new(PushSource::new("test-location"));
        let accel_src = Arc::new(PushSource::new("test-accel"));
        let watcher = Arc::new(PushProximityWatcher::new());
        let timing = Arc::new(TimingEngine::new(route(), watcher.clone()));
        let coordinator = Coordinator::new(
            Sources {
                location: location.clone(),
                accel: accel_src.clone(),
                ecu: None,
                timing,
            },
            store.clone(),
            config,
        );
        Rig {
            coordinator,
            location,
            accel: accel_src,
            watcher,
            store,
        }
    }

    #[test]
    fn test_readiness_gate_is_monotonic() {
        let r = rig(CoordinatorConfig::default());
        let events = Collector::new();
        let listener = Collector::listener(&events);
        r.coordinator.register(&listener);

        assert!(!r.coordinator.is_ready());
        r.coordinator.start().unwrap();
        assert!(r.coordinator.is_running());
        assert!(!r.coordinator.is_ready());

        r.location.push(loc(1_000));
        assert!(!r.coordinator.is_ready());
        assert_eq!(
            events.count(|e| matches!(e, CoordinatorEvent::ReadyProgress(_))),
            1
        );

        r.accel.push(accel());
        assert!(r.coordinator.is_ready());

        // Further updates never regress readiness
        r.location.push(loc(1_100));
        r.accel.push(accel());
        r.location.push(loc(1_200));
        assert!(r.coordinator.is_ready());
        assert_eq!(events.count(|e| matches!(e, CoordinatorEvent::Ready)), 1);

        r.coordinator.stop().unwrap();
        assert!(!r.coordinator.is_ready());
    }

    #[test]
    fn test_no_logging_before_ready() {
        let r = rig(CoordinatorConfig::default());
        r.coordinator.start().unwrap();
        let session = r.coordinator.session_id().unwrap();

        // Location-only updates must not be logged
        for i in 0..5 {
            r.location.push(loc(1_000 + i * 100));
        }
        r.coordinator.stop().unwrap();
        assert!(r.store.log_entries(session).is_empty());
    }

    #[test]
    fn test_fused_entries_logged_once_ready() {
        let r = rig(CoordinatorConfig::default());
        r.coordinator.start().unwrap();
        let session = r.coordinator.session_id().unwrap();

        r.accel.push(accel());
        r.location.push(loc(10_000)); // completes readiness and is logged
        r.location.push(loc(10_100));
        r.coordinator.stop().unwrap();

        let entries = r.store.log_entries(session);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].fix_time_ms, 10_000);
        assert_eq!(entries[1].fix_time_ms, 10_100);
        assert!(entries.iter().all(|e| e.ecu.is_none()));
    }

    #[test]
    fn test_start_trigger_fires_exactly_once() {
        let r = rig(CoordinatorConfig::default());
        let events = Collector::new();
        let listener = Collector::listener(&events);
        r.coordinator.register(&listener);
        r.coordinator.start().unwrap();
        let session = r.coordinator.session_id().unwrap();

        r.location.push(loc(1_000));
        r.accel.push(accel());
        assert!(r.coordinator.is_ready());
        assert!(!r.coordinator.is_logging_start_trigger_fired());

        // Readiness started the timing engine; the first crossing arms it
        // and fires the trigger without being persisted.
        r.watcher.push(closest(0, 60_000));
        assert!(r.coordinator.is_logging_start_trigger_fired());

        r.watcher.push(closest(1, 75_000));
        r.watcher.push(closest(2, 90_000));
        r.coordinator.stop().unwrap();

        assert_eq!(
            events.count(|e| matches!(e, CoordinatorEvent::TimingStartTriggerFired)),
            1
        );
        assert_eq!(
            events.count(|e| matches!(e, CoordinatorEvent::TimingDataUpdate(_))),
            2
        );
        let timing = r.store.timing_entries(session);
        assert_eq!(timing.len(), 2);
        assert_eq!(timing[0].split_time_ms, Some(15_000));
    }

    #[test]
    fn test_timing_before_ready_not_possible_engine_starts_late() {
        let r = rig(CoordinatorConfig::default());
        r.coordinator.start().unwrap();
        // The engine has no watcher subscription yet, so crossings go
        // nowhere until readiness.
        r.watcher.push(closest(0, 1_000));
        assert!(!r.coordinator.is_logging_start_trigger_fired());
        r.coordinator.stop().unwrap();
    }

    #[test]
    fn test_replay_on_register_after_start() {
        let r = rig(CoordinatorConfig::default());
        r.coordinator.start().unwrap();

        let events = Collector::new();
        let listener = Collector::listener(&events);
        assert!(r.coordinator.register(&listener));
        // Exactly one immediate replay of the current lifecycle state
        assert_eq!(events.events(), vec![CoordinatorEvent::Started]);

        // Duplicate registration is rejected
        assert!(!r.coordinator.register(&listener));
        r.coordinator.stop().unwrap();
    }

    #[test]
    fn test_idempotent_start_and_silent_stop() {
        struct CountingSource<T> {
            inner: PushSource<T>,
            starts: AtomicUsize,
        }
        impl<T: Clone + Send + Sync> SampleSource<T> for CountingSource<T> {
            fn start(&self) -> Result<(), SourceError> {
                self.starts.fetch_add(1, Ordering::SeqCst);
                self.inner.start()
            }
            fn stop(&self) -> Result<(), SourceError> {
                self.inner.stop()
            }
            fn current_sample(&self) -> Option<T> {
                self.inner.current_sample()
            }
            fn update_frequency(&self) -> Option<f64> {
                self.inner.update_frequency()
            }
            fn add_listener(&self, l: crate::source::Listener<T>) -> ListenerId {
                self.inner.add_listener(l)
            }
            fn remove_listener(&self, id: ListenerId) -> bool {
                self.inner.remove_listener(id)
            }
        }

        let location = Arc::new(CountingSource {
            inner: PushSource::new("counting-location"),
            starts: AtomicUsize::new(0),
        });
        let watcher = Arc::new(PushProximityWatcher::new());
        let coordinator = Coordinator::new(
            Sources {
                location: location.clone(),
                accel: Arc::new(PushSource::<AccelSample>::new("test-accel")),
                ecu: None,
                timing: Arc::new(TimingEngine::new(route(), watcher)),
            },
            Arc::new(MemoryStore::new()),
            CoordinatorConfig::default(),
        );

        let events = Collector::new();
        let listener = Collector::listener(&events);
        coordinator.register(&listener);

        // stop() before any start is a silent no-op
        coordinator.stop().unwrap();
        assert!(events.events().is_empty());

        coordinator.start().unwrap();
        coordinator.start().unwrap();
        assert_eq!(location.starts.load(Ordering::SeqCst), 1);
        assert_eq!(
            events.count(|e| matches!(e, CoordinatorEvent::Starting)),
            1
        );

        coordinator.stop().unwrap();
        coordinator.stop().unwrap();
        assert_eq!(
            events.count(|e| matches!(e, CoordinatorEvent::Stopped)),
            1
        );
    }

    #[test]
    fn test_queue_full_emits_logging_failed_without_blocking() {
        use crossbeam_channel as chan;

        /// Store whose first append parks until released
        struct BlockingStore {
            entered: chan::Sender<()>,
            release: chan::Receiver<()>,
        }
        impl SessionStore for BlockingStore {
            fn create_session(&self) -> Result<SessionId, StoreError> {
                Ok(SessionId::new())
            }
            fn open_session(&self, _id: SessionId) -> Result<(), StoreError> {
                Ok(())
            }
            fn append_log_entry(&self, _id: SessionId, _e: &LogEntry) -> Result<(), StoreError> {
                let _ = self.entered.send(());
                let _ = self.release.recv();
                Ok(())
            }
            fn append_timing_entry(
                &self,
                _id: SessionId,
                _s: &TimingSample,
            ) -> Result<(), StoreError> {
                Ok(())
            }
        }

        let (entered_tx, entered_rx) = chan::unbounded();
        let (release_tx, release_rx) = chan::unbounded();
        let store = Arc::new(BlockingStore {
            entered: entered_tx,
            release: release_rx,
        });

        let location = Arc::new(PushSource::new("test-location"));
        let accel_src = Arc::new(PushSource::new("test-accel"));
        let watcher = Arc::new(PushProximityWatcher::new());
        let coordinator = Coordinator::new(
            Sources {
                location: location.clone(),
                accel: accel_src.clone(),
                ecu: None,
                timing: Arc::new(TimingEngine::new(route(), watcher)),
            },
            store,
            CoordinatorConfig {
                queue_capacity: 2,
                ..Default::default()
            },
        );
        let events = Collector::new();
        let listener = Collector::listener(&events);
        coordinator.register(&listener);

        coordinator.start().unwrap();
        accel_src.push(accel());
        location.push(loc(1_000));
        // Writer is now parked inside the store; fill the queue behind it
        entered_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("writer entered store");
        location.push(loc(1_100));
        location.push(loc(1_200));
        // Queue full: this update is dropped and signaled, on this thread,
        // without blocking
        location.push(loc(1_300));
        assert_eq!(
            events.count(|e| matches!(e, CoordinatorEvent::LoggingFailed(_))),
            1
        );
        assert!(coordinator.is_running());

        for _ in 0..4 {
            let _ = release_tx.send(());
        }
        coordinator.stop().unwrap();
    }

    #[test]
    fn test_stop_failure_still_resets_state() {
        struct FailingStopSource<T> {
            inner: PushSource<T>,
        }
        impl<T: Clone + Send + Sync> SampleSource<T> for FailingStopSource<T> {
            fn start(&self) -> Result<(), SourceError> {
                self.inner.start()
            }
            fn stop(&self) -> Result<(), SourceError> {
                Err(SourceError::StopFailed {
                    source_name: "flaky".into(),
                    reason: "transport hung".into(),
                })
            }
            fn current_sample(&self) -> Option<T> {
                self.inner.current_sample()
            }
            fn update_frequency(&self) -> Option<f64> {
                self.inner.update_frequency()
            }
            fn add_listener(&self, l: crate::source::Listener<T>) -> ListenerId {
                self.inner.add_listener(l)
            }
            fn remove_listener(&self, id: ListenerId) -> bool {
                self.inner.remove_listener(id)
            }
        }

        let location = Arc::new(FailingStopSource {
            inner: PushSource::new("flaky-location"),
        });
        let accel_src = Arc::new(PushSource::<AccelSample>::new("test-accel"));
        let watcher = Arc::new(PushProximityWatcher::new());
        let coordinator = Coordinator::new(
            Sources {
                location,
                accel: accel_src,
                ecu: None,
                timing: Arc::new(TimingEngine::new(route(), watcher)),
            },
            Arc::new(MemoryStore::new()),
            CoordinatorConfig::default(),
        );
        let events = Collector::new();
        let listener = Collector::listener(&events);
        coordinator.register(&listener);

        coordinator.start().unwrap();
        let err = coordinator.stop().unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::StopIncomplete { failed: 1, total: 3, .. }
        ));
        // State is reset despite the failure
        assert!(!coordinator.is_running());
        assert!(!coordinator.is_ready());
        assert_eq!(
            events.count(|e| matches!(e, CoordinatorEvent::StopFailed(_))),
            1
        );
        // A fresh start works again
        coordinator.start().unwrap();
        assert!(coordinator.is_running());
    }

    #[test]
    fn test_start_failure_reports_cause_and_cleans_up() {
        struct RefusingStore;
        impl SessionStore for RefusingStore {
            fn create_session(&self) -> Result<SessionId, StoreError> {
                Err(StoreError::Other("disk full".into()))
            }
            fn open_session(&self, id: SessionId) -> Result<(), StoreError> {
                Err(StoreError::SessionNotFound(id))
            }
            fn append_log_entry(&self, _: SessionId, _: &LogEntry) -> Result<(), StoreError> {
                Ok(())
            }
            fn append_timing_entry(&self, _: SessionId, _: &TimingSample) -> Result<(), StoreError> {
                Ok(())
            }
        }

        let location = Arc::new(PushSource::<LocationSample>::new("test-location"));
        let accel_src = Arc::new(PushSource::<AccelSample>::new("test-accel"));
        let watcher = Arc::new(PushProximityWatcher::new());
        let coordinator = Coordinator::new(
            Sources {
                location,
                accel: accel_src,
                ecu: None,
                timing: Arc::new(TimingEngine::new(route(), watcher)),
            },
            Arc::new(RefusingStore),
            CoordinatorConfig::default(),
        );
        let events = Collector::new();
        let listener = Collector::listener(&events);
        coordinator.register(&listener);

        assert!(coordinator.start().is_err());
        assert!(!coordinator.is_running());
        assert_eq!(
            events.count(|e| matches!(e, CoordinatorEvent::StartFailed(_))),
            1
        );
    }

    #[test]
    fn test_reopen_existing_session() {
        let store = Arc::new(MemoryStore::new());
        let existing = store.create_session().unwrap();
        let r = rig_with_store(
            CoordinatorConfig {
                session_id: Some(existing),
                ..Default::default()
            },
            store,
        );
        r.coordinator.start().unwrap();
        assert_eq!(r.coordinator.session_id(), Some(existing));

        r.accel.push(accel());
        r.location.push(loc(500));
        r.coordinator.stop().unwrap();
        assert_eq!(r.store.log_entries(existing).len(), 1);
    }
}
