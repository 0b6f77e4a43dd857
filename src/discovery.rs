//! Single-flight discovery with per-kind TTL caches
//!
//! Discovery walks shell out to external tools and are expensive, so at most
//! one walk per driver runs at a time. Callers arriving while a walk is in
//! flight enqueue as waiters and receive the same snapshot; callers within
//! the TTL window get the cached snapshot without any subprocess activity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use devicelab_core::driver::{DeviceDriver, DeviceSeed};
use devicelab_core::prelude::*;

/// Cache TTL for listing walks (simctl list, adb devices, instruments)
pub const LIST_WALK_TTL: Duration = Duration::from_secs(1);

/// Cache TTL for AVD file-system walks
pub const AVD_WALK_TTL: Duration = Duration::from_secs(3);

/// Shared, immutable result of one discovery walk
pub type Snapshot = Arc<Vec<DeviceSeed>>;

/// Walk outcome delivered to every waiter; errors travel as messages so the
/// result clones cheaply
type WalkResult = std::result::Result<Snapshot, String>;

struct Flight {
    ttl: Duration,
    last_walk_at: Option<Instant>,
    in_flight: bool,
    waiters: Vec<oneshot::Sender<WalkResult>>,
    snapshot: Option<Snapshot>,
}

impl Flight {
    fn new(ttl: Duration) -> Self {
        Flight {
            ttl,
            last_walk_at: None,
            in_flight: false,
            waiters: Vec::new(),
            snapshot: None,
        }
    }

    fn fresh_snapshot(&self, now: Instant) -> Option<Snapshot> {
        let walked_at = self.last_walk_at?;
        if now.duration_since(walked_at) <= self.ttl {
            self.snapshot.clone()
        } else {
            None
        }
    }
}

/// What the caller must do after checking in with the coordinator
enum Admission {
    /// Fresh cache hit
    Cached(Snapshot),
    /// A walk is running; await its shared result
    Wait(oneshot::Receiver<WalkResult>),
    /// This caller executes the walk and fans the result out
    Execute,
}

/// Coordinates discovery walks across all drivers
#[derive(Default)]
pub struct DiscoveryCoordinator {
    flights: Mutex<HashMap<String, Flight>>,
}

impl DiscoveryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// TTL for a driver's walks; AVD scans hit the file system and tolerate
    /// a longer window
    fn ttl_for(driver: &dyn DeviceDriver) -> Duration {
        if driver.name() == devicelab_core::driver::ANDROID_EMULATOR {
            AVD_WALK_TTL
        } else {
            LIST_WALK_TTL
        }
    }

    /// Run (or join, or skip) the discovery walk for one driver
    pub async fn discover(&self, driver: &Arc<dyn DeviceDriver>) -> Result<Snapshot> {
        let admission = {
            let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
            let flight = flights
                .entry(driver.name().to_string())
                .or_insert_with(|| Flight::new(Self::ttl_for(driver.as_ref())));

            if flight.in_flight {
                let (tx, rx) = oneshot::channel();
                flight.waiters.push(tx);
                Admission::Wait(rx)
            } else if let Some(snapshot) = flight.fresh_snapshot(Instant::now()) {
                Admission::Cached(snapshot)
            } else {
                flight.in_flight = true;
                flight.snapshot = None;
                Admission::Execute
            }
        };

        match admission {
            Admission::Cached(snapshot) => {
                trace!(driver = driver.name(), "discovery cache hit");
                Ok(snapshot)
            }
            Admission::Wait(rx) => {
                debug!(driver = driver.name(), "joining in-flight discovery walk");
                match rx.await {
                    Ok(Ok(snapshot)) => Ok(snapshot),
                    Ok(Err(message)) => Err(Error::discovery(message)),
                    // The executor vanished (panic/cancel); treat as a failed walk
                    Err(_) => Err(Error::discovery("discovery walk was abandoned")),
                }
            }
            Admission::Execute => {
                let started = Instant::now();
                let walked = driver.discover().await;
                let elapsed = started.elapsed();

                let result: WalkResult = match walked {
                    Ok(seeds) => {
                        info!(
                            driver = driver.name(),
                            devices = seeds.len(),
                            ?elapsed,
                            "discovery walk finished"
                        );
                        Ok(Arc::new(seeds))
                    }
                    Err(e) => {
                        warn!(driver = driver.name(), "discovery walk failed: {}", e);
                        Err(e.to_string())
                    }
                };

                let waiters = {
                    let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
                    let flight = flights
                        .get_mut(driver.name())
                        .expect("flight entry created on admission");
                    flight.in_flight = false;
                    flight.last_walk_at = Some(Instant::now());
                    if let Ok(snapshot) = &result {
                        flight.snapshot = Some(Arc::clone(snapshot));
                    }
                    std::mem::take(&mut flight.waiters)
                };

                // Every waiter observes the same snapshot (or the same failure)
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }

                result.map_err(Error::discovery)
            }
        }
    }

    /// Drop the cached snapshot for a driver, forcing the next call to walk
    pub fn invalidate(&self, driver_name: &str) {
        let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(flight) = flights.get_mut(driver_name) {
            flight.last_walk_at = None;
            flight.snapshot = None;
        }
    }
}
