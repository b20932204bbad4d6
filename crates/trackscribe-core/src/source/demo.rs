//! Demo mode - simulated sensor sources for testing
//!
//! Generates plausible position, acceleration, and ECU data on background
//! threads without any real hardware. A car drives steady laps of a circular
//! circuit while the engine wobbles around a cruising RPM.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{Listener, ListenerId, SampleSource, SourceCore};
use crate::error::SourceError;
use crate::sample::{AccelSample, EcuSample, LocationSample};

/// Millisecond offset of `t` into its UTC day
fn ms_of_day(t: DateTime<Utc>) -> u32 {
    t.time().num_seconds_from_midnight() * 1000 + t.timestamp_subsec_millis()
}

type Generator<T> = Box<dyn FnMut(&mut StdRng, DateTime<Utc>) -> T + Send>;

/// A simulated source producing one sample per period on its own thread
pub struct DemoSource<T> {
    core: Arc<SourceCore<T>>,
    period: Duration,
    seed: u64,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    generator: Arc<Mutex<Generator<T>>>,
}

impl<T: Clone + Send + Sync + 'static> DemoSource<T> {
    fn new(name: &'static str, period: Duration, seed: u64, generator: Generator<T>) -> Self {
        Self {
            core: Arc::new(SourceCore::new(name)),
            period,
            seed,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            generator: Arc::new(Mutex::new(generator)),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> SampleSource<T> for DemoSource<T> {
    fn start(&self) -> Result<(), SourceError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let core = Arc::clone(&self.core);
        let running = Arc::clone(&self.running);
        let generator = Arc::clone(&self.generator);
        let period = self.period;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let handle = std::thread::Builder::new()
            .name(format!("demo-{}", core.name()))
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    let now = Utc::now();
                    let sample = {
                        let mut generate = generator.lock();
                        (*generate)(&mut rng, now)
                    };
                    core.publish(sample, now);
                    std::thread::sleep(period);
                }
            })
            .map_err(|e| SourceError::StartFailed {
                source_name: self.core.name().to_string(),
                reason: e.to_string(),
            })?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    fn stop(&self) -> Result<(), SourceError> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                return Err(SourceError::StopFailed {
                    source_name: self.core.name().to_string(),
                    reason: "demo thread panicked".into(),
                });
            }
        }
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

/// Simulated GPS: steady laps of a circular circuit at ~40 m/s
pub fn location_source(period: Duration, seed: u64) -> DemoSource<LocationSample> {
    // Center of the simulated circuit
    const CENTER_LAT: f64 = 52.0736;
    const CENTER_LON: f64 = -1.0169;
    const RADIUS_DEG: f64 = 0.008;

    let mut angle: f64 = 0.0;
    DemoSource::new(
        "demo-location",
        period,
        seed,
        Box::new(move |rng, now| {
            angle = (angle + 0.01) % std::f64::consts::TAU;
            let speed = 40.0 + rng.gen_range(-2.0..2.0);
            LocationSample::new(
                ms_of_day(now),
                CENTER_LAT + RADIUS_DEG * angle.sin(),
                CENTER_LON + RADIUS_DEG * angle.cos(),
                160.0 + rng.gen_range(-1.0..1.0),
                speed,
                (angle.to_degrees() + 90.0) % 360.0,
                now,
            )
        }),
    )
}

/// Simulated accelerometer: cornering and braking noise around 1g vertical
pub fn accel_source(period: Duration, seed: u64) -> DemoSource<AccelSample> {
    DemoSource::new(
        "demo-accel",
        period,
        seed,
        Box::new(move |rng, now| {
            AccelSample::new(
                rng.gen_range(-1.2..1.2),
                1.0 + rng.gen_range(-0.1..0.1),
                rng.gen_range(-0.9..0.4),
                now,
            )
        }),
    )
}

/// Simulated ECU: cruising around 4500 RPM with throttle wobble
pub fn ecu_source(period: Duration, seed: u64) -> DemoSource<EcuSample> {
    let mut rpm: f64 = 4500.0;
    DemoSource::new(
        "demo-ecu",
        period,
        seed,
        Box::new(move |rng, now| {
            rpm = (rpm + rng.gen_range(-150.0..150.0)).clamp(900.0, 7200.0);
            let throttle = ((rpm - 900.0) / 6300.0 * 100.0).clamp(0.0, 100.0);
            EcuSample {
                rpm,
                map_kpa: 30.0 + throttle * 0.65,
                throttle_pct: throttle,
                afr: 13.2 + rng.gen_range(-0.4..0.4),
                manifold_temp_c: 32.0 + rng.gen_range(-1.0..1.0),
                coolant_temp_c: 88.0 + rng.gen_range(-2.0..2.0),
                ignition_advance_deg: 18.0 + throttle * 0.1,
                battery_volts: 13.8 + rng.gen_range(-0.2..0.2),
                received_at: now,
            }
        }),
    )
}
