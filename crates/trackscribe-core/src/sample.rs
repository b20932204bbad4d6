//! Sample value types
//!
//! Immutable value records for every stream the coordinator fuses: position
//! fixes, accelerometer readings, ECU telemetry, and derived lap timing.
//! Each sample is a snapshot; once constructed it is never mutated.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Milliseconds in one UTC day.
pub const MS_PER_DAY: u32 = 86_400_000;

/// Elapsed milliseconds between two time-of-day fixes, safe across midnight.
///
/// Position fix times are millisecond offsets into a UTC day and wrap at
/// midnight; when the end fix is numerically smaller than the start fix, one
/// day is added before subtracting.
pub fn elapsed_day_ms(start_ms: u32, end_ms: u32) -> u32 {
    if end_ms < start_ms {
        MS_PER_DAY - start_ms + end_ms
    } else {
        end_ms - start_ms
    }
}

/// Opaque identifier for one logging session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh session id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing id (e.g. read back from a store)
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A single position fix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    /// Time of fix as a millisecond offset into the UTC day
    pub fix_time_ms: u32,
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// Altitude in meters
    pub altitude: f64,
    /// Ground speed in m/s
    pub speed: f64,
    /// Bearing in degrees from true north
    pub bearing: f64,
    /// Wall-clock time the sample was received
    pub received_at: DateTime<Utc>,
}

impl LocationSample {
    /// Build a fully-populated location sample
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fix_time_ms: u32,
        latitude: f64,
        longitude: f64,
        altitude: f64,
        speed: f64,
        bearing: f64,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            fix_time_ms,
            latitude,
            longitude,
            altitude,
            speed,
            bearing,
            received_at,
        }
    }
}

/// A single accelerometer reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccelSample {
    /// Lateral acceleration in g
    pub lateral: f64,
    /// Vertical acceleration in g
    pub vertical: f64,
    /// Longitudinal acceleration in g
    pub longitudinal: f64,
    /// Wall-clock time the sample was received
    pub received_at: DateTime<Utc>,
}

impl AccelSample {
    /// Build a fully-populated acceleration sample
    pub fn new(lateral: f64, vertical: f64, longitudinal: f64, received_at: DateTime<Utc>) -> Self {
        Self {
            lateral,
            vertical,
            longitudinal,
            received_at,
        }
    }
}

/// A single ECU telemetry frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcuSample {
    /// Engine speed in RPM
    pub rpm: f64,
    /// Manifold absolute pressure in kPa
    pub map_kpa: f64,
    /// Throttle position in percent
    pub throttle_pct: f64,
    /// Air/fuel ratio
    pub afr: f64,
    /// Manifold air temperature in °C
    pub manifold_temp_c: f64,
    /// Coolant temperature in °C
    pub coolant_temp_c: f64,
    /// Ignition advance in degrees BTDC
    pub ignition_advance_deg: f64,
    /// Battery voltage in volts
    pub battery_volts: f64,
    /// Wall-clock time the sample was received
    pub received_at: DateTime<Utc>,
}

/// Derived lap/split timing state at one waypoint crossing
///
/// Successive samples are value snapshots; the engine never mutates an
/// emitted sample in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingSample {
    /// Zero-based lap counter
    pub lap: u32,
    /// Zero-based index of the split this sample closes (position within the
    /// lap's segment sequence)
    pub split_index: usize,
    /// Duration of the lap this sample closes, if it closes one
    pub lap_time_ms: Option<u32>,
    /// Duration of the split this sample closes, absent on the very first
    /// start/finish crossing
    pub split_time_ms: Option<u32>,
    /// Best lap time seen so far this session
    pub best_lap_time_ms: Option<u32>,
    /// Best time per segment; slots stay unset until that segment's first
    /// completion
    pub best_split_times_ms: Vec<Option<u32>>,
    /// Raw position-fix time of the triggering crossing, for synchronization
    /// with the other streams
    pub fix_time_ms: u32,
    /// Wall-clock time the sample was received
    pub received_at: DateTime<Utc>,
}

/// A fused row of the session log
///
/// Snapshots the most recently observed Accel/Ecu samples at the moment a
/// Location sample arrives. The snapshot may be stale relative to true
/// physical simultaneity by up to one update interval; this soft
/// synchronization is intentional. The Location fix time is the
/// synchronization key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Synchronization key: the location sample's time of fix
    pub fix_time_ms: u32,
    /// The triggering position fix
    pub location: LocationSample,
    /// Latest acceleration sample at the time of the fix
    pub accel: AccelSample,
    /// Latest ECU frame at the time of the fix, absent when no ECU source is
    /// configured
    pub ecu: Option<EcuSample>,
}

impl LogEntry {
    /// Fuse the latest samples from each stream into one log row
    pub fn fuse(location: LocationSample, accel: AccelSample, ecu: Option<EcuSample>) -> Self {
        Self {
            fix_time_ms: location.fix_time_ms,
            location,
            accel,
            ecu,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_same_day() {
        assert_eq!(elapsed_day_ms(1_000, 11_500), 10_500);
    }

    #[test]
    fn test_elapsed_across_midnight() {
        // 10s before midnight to 500ms after
        assert_eq!(elapsed_day_ms(86_390_000, 500), 10_500);
    }

    #[test]
    fn test_elapsed_zero() {
        assert_eq!(elapsed_day_ms(42, 42), 0);
    }

    #[test]
    fn test_fuse_uses_location_fix_time() {
        let loc = LocationSample::new(123_456, 52.07, -1.01, 160.0, 42.0, 181.0, Utc::now());
        let accel = AccelSample::new(0.8, 1.0, -0.2, Utc::now());
        let entry = LogEntry::fuse(loc, accel, None);
        assert_eq!(entry.fix_time_ms, 123_456);
        assert!(entry.ecu.is_none());
    }
}
