//! Waypoint-based lap and split timing
//!
//! Consumes closest-approach events from a proximity watcher bound to a
//! closed-loop route and derives lap/split completions with best-time
//! tracking. Fix times are millisecond offsets into a UTC day, so all
//! elapsed-time arithmetic goes through the midnight-safe helper in
//! [`crate::sample`].

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{SourceError, TimingError};
use crate::sample::{elapsed_day_ms, TimingSample};
use crate::source::{Listener, ListenerId, SampleSource, SourceCore};

/// One configured geographic point on a route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    /// Display name ("S/F", "T4", ...)
    pub name: String,
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
}

/// An ordered closed-loop route; waypoint 0 is the start/finish line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    name: String,
    waypoints: Vec<Waypoint>,
}

impl Route {
    /// Build a route from an ordered waypoint list
    pub fn new(name: impl Into<String>, waypoints: Vec<Waypoint>) -> Result<Self, TimingError> {
        if waypoints.is_empty() {
            return Err(TimingError::EmptyRoute);
        }
        Ok(Self {
            name: name.into(),
            waypoints,
        })
    }

    /// Route display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of waypoints (= number of splits per lap)
    pub fn waypoint_count(&self) -> usize {
        self.waypoints.len()
    }

    /// The configured waypoints in loop order
    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    /// Parse a route from a plain-text description: one `lat,lon[,name]`
    /// waypoint per line, first line being the route name.
    ///
    /// Parse failures are explicit errors, never a silent fallback; callers
    /// that want a default route on failure should branch on the result.
    pub fn parse(text: &str) -> Result<Self, TimingError> {
        let mut lines = text.lines().enumerate();
        let name = loop {
            match lines.next() {
                Some((_, l)) if l.trim().is_empty() => continue,
                Some((_, l)) => break l.trim().to_string(),
                None => return Err(TimingError::EmptyRoute),
            }
        };

        let mut waypoints = Vec::new();
        for (idx, line) in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(3, ',');
            let lat = parts.next().unwrap_or_default().trim();
            let lon = parts.next().unwrap_or_default().trim();
            let wp_name = parts
                .next()
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|| format!("WP{}", waypoints.len()));
            let latitude = lat.parse::<f64>().map_err(|e| TimingError::ParseWaypoint {
                line: idx + 1,
                reason: format!("latitude '{lat}': {e}"),
            })?;
            let longitude = lon.parse::<f64>().map_err(|e| TimingError::ParseWaypoint {
                line: idx + 1,
                reason: format!("longitude '{lon}': {e}"),
            })?;
            waypoints.push(Waypoint {
                name: wp_name,
                latitude,
                longitude,
            });
        }
        Route::new(name, waypoints)
    }
}

/// Kinds of proximity events a watcher can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProximityKind {
    /// Closest approach to the waypoint; the only kind that drives timing
    ClosestApproach,
    /// Entered the waypoint's radius
    Entered,
    /// Left the waypoint's radius
    Exited,
}

impl FromStr for ProximityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "closest" | "closest_approach" => Ok(Self::ClosestApproach),
            "entered" => Ok(Self::Entered),
            "exited" => Ok(Self::Exited),
            other => Err(format!("unknown proximity kind '{other}'")),
        }
    }
}

/// A proximity event delivered by a route watcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximityEvent {
    /// Event kind
    pub kind: ProximityKind,
    /// Index of the waypoint, 0..N-1 around the loop
    pub waypoint_index: usize,
    /// Position-fix time as a millisecond offset into the UTC day
    pub fix_time_ms: u32,
    /// Wall-clock time the event was received
    pub received_at: DateTime<Utc>,
}

/// The geofence/route watcher seam.
///
/// An implementation watches an ordered closed-loop route and pushes
/// proximity events to its subscriber; transports and geometry are outside
/// the core.
pub trait ProximityWatcher: Send + Sync {
    /// Begin watching `route`, delivering events to `listener`
    fn subscribe(
        &self,
        route: &Route,
        listener: Listener<ProximityEvent>,
    ) -> Result<ListenerId, SourceError>;

    /// Stop delivering events for a prior subscription
    fn unsubscribe(&self, id: ListenerId) -> bool;
}

/// A proximity watcher driven by the caller, for tests and replay tooling
pub struct PushProximityWatcher {
    core: SourceCore<ProximityEvent>,
}

impl PushProximityWatcher {
    /// Create an empty watcher
    pub fn new() -> Self {
        Self {
            core: SourceCore::new("push-proximity"),
        }
    }

    /// Deliver one proximity event to all subscribers
    pub fn push(&self, event: ProximityEvent) {
        let received_at = event.received_at;
        self.core.publish(event, received_at);
    }
}

impl Default for PushProximityWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ProximityWatcher for PushProximityWatcher {
    fn subscribe(
        &self,
        _route: &Route,
        listener: Listener<ProximityEvent>,
    ) -> Result<ListenerId, SourceError> {
        Ok(self.core.add_listener(listener))
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.core.remove_listener(id)
    }
}

struct LapState {
    lap: u32,
    last_lap_start_ms: Option<u32>,
    last_split_start_ms: Option<u32>,
    best_lap_ms: Option<u32>,
    best_splits_ms: Vec<Option<u32>>,
}

impl LapState {
    fn fresh(segments: usize) -> Self {
        Self {
            lap: 0,
            last_lap_start_ms: None,
            last_split_start_ms: None,
            best_lap_ms: None,
            best_splits_ms: vec![None; segments],
        }
    }
}

struct TimingInner {
    core: SourceCore<TimingSample>,
    route: Route,
    state: Mutex<LapState>,
}

impl TimingInner {
    /// Process one proximity event; only closest-approach events compute.
    fn handle_event(&self, event: &ProximityEvent) -> Result<(), SourceError> {
        if event.kind != ProximityKind::ClosestApproach {
            return Ok(());
        }
        let count = self.route.waypoint_count();
        if event.waypoint_index >= count {
            tracing::warn!(
                waypoint = event.waypoint_index,
                route = self.route.name(),
                "proximity event for waypoint outside route, ignoring"
            );
            return Ok(());
        }

        let sample = {
            let mut state = self.state.lock();
            if state.last_lap_start_ms.is_none() {
                // Timing arms at the first start/finish crossing; events at
                // other waypoints before that have no split to close.
                if event.waypoint_index != 0 {
                    tracing::debug!(
                        waypoint = event.waypoint_index,
                        "crossing before first start/finish, ignoring"
                    );
                    return Ok(());
                }
                state.last_lap_start_ms = Some(event.fix_time_ms);
                state.last_split_start_ms = Some(event.fix_time_ms);
                TimingSample {
                    lap: state.lap,
                    split_index: count - 1,
                    lap_time_ms: None,
                    split_time_ms: None,
                    best_lap_time_ms: state.best_lap_ms,
                    best_split_times_ms: state.best_splits_ms.clone(),
                    fix_time_ms: event.fix_time_ms,
                    received_at: event.received_at,
                }
            } else if event.waypoint_index == 0 {
                // Start/finish: closes the final split and the lap.
                let lap_start = state.last_lap_start_ms.unwrap_or(event.fix_time_ms);
                let split_start = state.last_split_start_ms.unwrap_or(event.fix_time_ms);
                let delta_lap = elapsed_day_ms(lap_start, event.fix_time_ms);
                let delta_split = elapsed_day_ms(split_start, event.fix_time_ms);
                let closing = count - 1;

                if state.best_lap_ms.map_or(true, |best| delta_lap < best) {
                    state.best_lap_ms = Some(delta_lap);
                }
                if state.best_splits_ms[closing].map_or(true, |best| delta_split < best) {
                    state.best_splits_ms[closing] = Some(delta_split);
                }
                state.lap += 1;
                state.last_lap_start_ms = Some(event.fix_time_ms);
                state.last_split_start_ms = Some(event.fix_time_ms);
                TimingSample {
                    lap: state.lap,
                    split_index: closing,
                    lap_time_ms: Some(delta_lap),
                    split_time_ms: Some(delta_split),
                    best_lap_time_ms: state.best_lap_ms,
                    best_split_times_ms: state.best_splits_ms.clone(),
                    fix_time_ms: event.fix_time_ms,
                    received_at: event.received_at,
                }
            } else {
                // Intermediate waypoint k closes split k-1 without closing
                // the lap.
                let split_start = state.last_split_start_ms.unwrap_or(event.fix_time_ms);
                let delta_split = elapsed_day_ms(split_start, event.fix_time_ms);
                let closing = event.waypoint_index - 1;

                if state.best_splits_ms[closing].map_or(true, |best| delta_split < best) {
                    state.best_splits_ms[closing] = Some(delta_split);
                }
                state.last_split_start_ms = Some(event.fix_time_ms);
                TimingSample {
                    lap: state.lap,
                    split_index: closing,
                    lap_time_ms: None,
                    split_time_ms: Some(delta_split),
                    best_lap_time_ms: state.best_lap_ms,
                    best_split_times_ms: state.best_splits_ms.clone(),
                    fix_time_ms: event.fix_time_ms,
                    received_at: event.received_at,
                }
            }
        };

        self.core.publish(sample, event.received_at);
        Ok(())
    }
}

/// Converts waypoint-proximity events into [`TimingSample`]s.
///
/// The engine is itself a [`SampleSource`], so the coordinator consumes
/// timing like any other stream. `start()` resets lap state and subscribes
/// to the watcher; `stop()` unsubscribes and is idempotent.
pub struct TimingEngine {
    inner: Arc<TimingInner>,
    watcher: Arc<dyn ProximityWatcher>,
    subscription: Mutex<Option<ListenerId>>,
}

impl TimingEngine {
    /// Create an engine for `route`, fed by `watcher`
    pub fn new(route: Route, watcher: Arc<dyn ProximityWatcher>) -> Self {
        let segments = route.waypoint_count();
        Self {
            inner: Arc::new(TimingInner {
                core: SourceCore::new("timing"),
                route,
                state: Mutex::new(LapState::fresh(segments)),
            }),
            watcher,
            subscription: Mutex::new(None),
        }
    }

    /// The configured route
    pub fn route(&self) -> &Route {
        &self.inner.route
    }
}

impl SampleSource<TimingSample> for TimingEngine {
    fn start(&self) -> Result<(), SourceError> {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            return Ok(());
        }
        *self.inner.state.lock() = LapState::fresh(self.inner.route.waypoint_count());
        self.inner.core.reset();
        let weak = Arc::downgrade(&self.inner);
        let id = self.watcher.subscribe(
            &self.inner.route,
            Arc::new(move |event: &ProximityEvent| match weak.upgrade() {
                Some(inner) => inner.handle_event(event),
                None => Ok(()),
            }),
        )?;
        *subscription = Some(id);
        Ok(())
    }

    fn stop(&self) -> Result<(), SourceError> {
        if let Some(id) = self.subscription.lock().take() {
            self.watcher.unsubscribe(id);
        }
        Ok(())
    }

    fn current_sample(&self) -> Option<TimingSample> {
        self.inner.core.current_sample()
    }

    fn update_frequency(&self) -> Option<f64> {
        self.inner.core.update_frequency()
    }

    fn add_listener(&self, listener: Listener<TimingSample>) -> ListenerId {
        self.inner.core.add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.core.remove_listener(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn five_waypoint_route() -> Route {
        let waypoints = (0..5)
            .map(|i| Waypoint {
                name: format!("WP{i}"),
                latitude: 52.0 + i as f64 * 0.001,
                longitude: -1.0,
            })
            .collect();
        Route::new("test circuit", waypoints).unwrap()
    }

    fn closest(waypoint_index: usize, fix_time_ms: u32) -> ProximityEvent {
        ProximityEvent {
            kind: ProximityKind::ClosestApproach,
            waypoint_index,
            fix_time_ms,
            received_at: Utc::now(),
        }
    }

    fn collecting_engine() -> (TimingEngine, Arc<PushProximityWatcher>, Arc<Mutex<Vec<TimingSample>>>) {
        let watcher = Arc::new(PushProximityWatcher::new());
        let engine = TimingEngine::new(five_waypoint_route(), watcher.clone());
        let seen: Arc<Mutex<Vec<TimingSample>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.add_listener(Arc::new(move |s: &TimingSample| {
            sink.lock().push(s.clone());
            Ok(())
        }));
        engine.start().unwrap();
        (engine, watcher, seen)
    }

    #[test]
    fn test_full_lap_splits_and_lap_time() {
        let (_engine, watcher, seen) = collecting_engine();
        let deltas = [16_359u32, 12_822, 45_077, 11_296, 36_016];

        let mut t = 1_000_000u32;
        watcher.push(closest(0, t));
        for (i, d) in deltas.iter().enumerate() {
            t += d;
            watcher.push(closest((i + 1) % 5, t));
        }

        let samples = seen.lock().clone();
        assert_eq!(samples.len(), 6);

        // Arming sample reports nothing
        assert_eq!(samples[0].lap, 0);
        assert_eq!(samples[0].split_index, 4);
        assert_eq!(samples[0].lap_time_ms, None);
        assert_eq!(samples[0].split_time_ms, None);

        // Intermediate splits 0..=3
        for i in 0..4 {
            assert_eq!(samples[i + 1].lap, 0);
            assert_eq!(samples[i + 1].split_index, i);
            assert_eq!(samples[i + 1].split_time_ms, Some(deltas[i]));
            assert_eq!(samples[i + 1].lap_time_ms, None);
        }

        // Lap-closing sample
        let closing = &samples[5];
        assert_eq!(closing.lap, 1);
        assert_eq!(closing.split_index, 4);
        assert_eq!(closing.split_time_ms, Some(36_016));
        assert_eq!(closing.lap_time_ms, Some(121_570));
        assert_eq!(closing.best_lap_time_ms, Some(121_570));
    }

    #[test]
    fn test_best_split_updates_only_when_faster() {
        let (_engine, watcher, seen) = collecting_engine();

        let mut t = 0u32;
        watcher.push(closest(0, t));
        // Lap 1: split 0 takes 30_000, rest 10_000 each
        for (i, d) in [30_000u32, 10_000, 10_000, 10_000, 10_000].iter().enumerate() {
            t += d;
            watcher.push(closest((i + 1) % 5, t));
        }
        // Lap 2: split 0 faster, rest slower
        for (i, d) in [25_045u32, 11_000, 12_000, 13_000, 14_000].iter().enumerate() {
            t += d;
            watcher.push(closest((i + 1) % 5, t));
        }

        let samples = seen.lock().clone();
        let last = samples.last().unwrap();
        assert_eq!(last.lap, 2);
        assert_eq!(
            last.best_split_times_ms,
            vec![
                Some(25_045),
                Some(10_000),
                Some(10_000),
                Some(10_000),
                Some(10_000)
            ]
        );
        // Lap 2 (75_045 ms) was slower than lap 1 (70_000 ms)
        assert_eq!(last.best_lap_time_ms, Some(70_000));
    }

    #[test]
    fn test_lap_spanning_midnight() {
        let (_engine, watcher, seen) = collecting_engine();

        watcher.push(closest(0, 86_390_000));
        for i in 1..5 {
            watcher.push(closest(i, 86_392_000 + (i as u32 - 1) * 2_000));
        }
        // Wraps past midnight
        watcher.push(closest(0, 500));

        let samples = seen.lock().clone();
        let closing = samples.last().unwrap();
        assert_eq!(closing.lap_time_ms, Some(10_500));
        assert_eq!(closing.split_time_ms, Some(2_500));
    }

    #[test]
    fn test_non_closest_events_ignored() {
        let (_engine, watcher, seen) = collecting_engine();
        watcher.push(ProximityEvent {
            kind: ProximityKind::Entered,
            waypoint_index: 0,
            fix_time_ms: 1_000,
            received_at: Utc::now(),
        });
        watcher.push(ProximityEvent {
            kind: ProximityKind::Exited,
            waypoint_index: 0,
            fix_time_ms: 2_000,
            received_at: Utc::now(),
        });
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_crossings_before_start_finish_ignored() {
        let (_engine, watcher, seen) = collecting_engine();
        watcher.push(closest(2, 1_000));
        watcher.push(closest(3, 2_000));
        assert!(seen.lock().is_empty());
        watcher.push(closest(0, 3_000));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_stop_unsubscribes() {
        let (engine, watcher, seen) = collecting_engine();
        watcher.push(closest(0, 1_000));
        engine.stop().unwrap();
        engine.stop().unwrap(); // idempotent
        watcher.push(closest(1, 2_000));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_route_parse_explicit_errors() {
        let route = Route::parse("Club Circuit\n52.07,-1.01,S/F\n52.08,-1.02\n").unwrap();
        assert_eq!(route.name(), "Club Circuit");
        assert_eq!(route.waypoint_count(), 2);
        assert_eq!(route.waypoints()[0].name, "S/F");
        assert_eq!(route.waypoints()[1].name, "WP1");

        let err = Route::parse("Broken\nnot-a-number,-1.0\n").unwrap_err();
        assert!(matches!(err, TimingError::ParseWaypoint { line: 2, .. }));

        assert!(matches!(Route::parse(""), Err(TimingError::EmptyRoute)));

        // The fallback to a default is an explicit, testable branch
        let fallback =
            Route::parse("junk\nbad,data\n").unwrap_or_else(|_| five_waypoint_route());
        assert_eq!(fallback.waypoint_count(), 5);
    }

    #[test]
    fn test_proximity_kind_parse() {
        assert_eq!(
            "closest_approach".parse::<ProximityKind>().unwrap(),
            ProximityKind::ClosestApproach
        );
        assert!("nearby".parse::<ProximityKind>().is_err());
    }
}
