//! # TrackScribe Core Library
//!
//! Core functionality for the TrackScribe motorsport data logger.
//!
//! This library provides:
//! - Fusion of independent sensor streams (position, acceleration, ECU
//!   telemetry) into a single time-ordered session log
//! - A readiness gate that holds logging back until every configured source
//!   has produced its first sample
//! - Waypoint-based lap/split timing with best-time tracking
//! - A bounded, drop-on-full persistence pipeline with a dedicated writer
//!   thread
//! - Lifecycle notifications with replay-on-subscribe for late observers
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use trackscribe_core::prelude::*;
//!
//! let watcher = Arc::new(PushProximityWatcher::new());
//! let route = Route::parse(std::fs::read_to_string("circuit.txt")?.as_str())?;
//!
//! let coordinator = Coordinator::new(
//!     Sources {
//!         location: gps_source,
//!         accel: imu_source,
//!         ecu: Some(ecu_source),
//!         timing: Arc::new(TimingEngine::new(route, watcher)),
//!     },
//!     Arc::new(JsonlStore::new("sessions")?),
//!     CoordinatorConfig::default(),
//! );
//!
//! coordinator.register(&ui_listener);
//! coordinator.start()?;
//! ```

#![warn(missing_docs)]

pub mod coordinator;
pub mod error;
pub mod notify;
pub mod sample;
pub mod source;
pub mod store;
pub mod timing;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::coordinator::{
        Coordinator, CoordinatorConfig, CoordinatorEvent, CoordinatorListener, PipelineStats,
        ReadinessSnapshot, Sources,
    };
    pub use crate::error::{CoordinatorError, SourceError, StoreError, TimingError};
    pub use crate::notify::{HubListener, LifecycleStatus, NotificationHub, RequestTracker};
    pub use crate::sample::{
        AccelSample, EcuSample, LocationSample, LogEntry, SessionId, TimingSample,
    };
    pub use crate::source::{PushSource, SampleSource};
    pub use crate::store::{JsonlStore, MemoryStore, SessionStore};
    pub use crate::timing::{
        ProximityEvent, ProximityKind, ProximityWatcher, PushProximityWatcher, Route,
        TimingEngine, Waypoint,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
