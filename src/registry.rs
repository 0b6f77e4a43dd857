//! Top-level device registry
//!
//! Owns the driver set and the canonical id -> device map. Discovery fans
//! out to every driver through the single-flight coordinator, merges seeds
//! by id (update in place, instantiate on first sight), de-dupes across
//! drivers, and rebuilds the name index after each successful walk.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinSet;

use devicelab_core::driver::DeviceDriver;
use devicelab_core::events::DeviceEvent;
use devicelab_core::prelude::*;
use devicelab_core::session::SessionRegistry;

use crate::device::Device;
use crate::discovery::{DiscoveryCoordinator, Snapshot};

/// Registry of drivers and the devices they discovered
pub struct DeviceRegistry {
    drivers: Vec<Arc<dyn DeviceDriver>>,
    coordinator: Arc<DiscoveryCoordinator>,
    devices: Mutex<HashMap<String, Device>>,
    /// name -> device ids, rebuilt fully on each successful walk
    name_index: Mutex<HashMap<String, Vec<String>>>,
    sessions: Arc<SessionRegistry>,
    events: broadcast::Sender<DeviceEvent>,
    storage_base: PathBuf,
}

impl DeviceRegistry {
    pub(crate) fn new(
        drivers: Vec<Arc<dyn DeviceDriver>>,
        sessions: Arc<SessionRegistry>,
        events: broadcast::Sender<DeviceEvent>,
        storage_base: PathBuf,
    ) -> Self {
        DeviceRegistry {
            drivers,
            coordinator: Arc::new(DiscoveryCoordinator::new()),
            devices: Mutex::new(HashMap::new()),
            name_index: Mutex::new(HashMap::new()),
            sessions,
            events,
            storage_base,
        }
    }

    pub fn driver_names(&self) -> Vec<String> {
        self.drivers.iter().map(|d| d.name().to_string()).collect()
    }

    /// Walk every driver and merge the results.
    ///
    /// `only_available` keeps devices with no live session and a free lock;
    /// `list_only` skips refreshing records that already exist (a cheap
    /// listing walk).
    pub async fn discover(&self, only_available: bool, list_only: bool) -> Result<Vec<Device>> {
        let mut walks: JoinSet<(usize, Result<Snapshot>)> = JoinSet::new();
        for (index, driver) in self.drivers.iter().enumerate() {
            let coordinator = Arc::clone(&self.coordinator);
            let driver = Arc::clone(driver);
            walks.spawn(async move { (index, coordinator.discover(&driver).await) });
        }

        // Re-order to the registration order so de-dup is deterministic
        let mut snapshots: Vec<Option<Snapshot>> = vec![None; self.drivers.len()];
        let mut first_error = None;
        while let Some(joined) = walks.join_next().await {
            let (index, walked) = joined.map_err(|e| Error::process(e.to_string()))?;
            match walked {
                Ok(snapshot) => snapshots[index] = Some(snapshot),
                Err(e) => {
                    warn!(
                        driver = self.drivers[index].name(),
                        "discovery failed: {}", e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut discovered: Vec<Device> = Vec::new();

        for (index, snapshot) in snapshots.iter().enumerate() {
            let Some(snapshot) = snapshot else { continue };
            let driver = &self.drivers[index];

            for seed in snapshot.iter() {
                if let Err(e) = seed.validate() {
                    warn!(driver = driver.name(), "dropping invalid seed: {}", e);
                    continue;
                }
                // First driver to report an id wins
                if !seen.insert(seed.id.clone()) {
                    continue;
                }

                let existing = {
                    let devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
                    devices.get(&seed.id).cloned()
                };

                let device = match existing {
                    Some(device) => {
                        if !list_only {
                            device.refresh_from_seed(seed);
                        }
                        device
                    }
                    None => {
                        let device = Device::from_seed(
                            seed,
                            Arc::clone(driver),
                            Arc::clone(&self.sessions),
                            self.events.clone(),
                            &self.storage_base,
                        )?;
                        self.devices
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(seed.id.clone(), device.clone());
                        device
                    }
                };
                discovered.push(device);
            }
        }

        if discovered.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        self.rebuild_name_index(&discovered);

        if only_available {
            let mut available = Vec::new();
            for device in discovered {
                if device.is_available()? {
                    available.push(device);
                }
            }
            Ok(available)
        } else {
            Ok(discovered)
        }
    }

    fn rebuild_name_index(&self, devices: &[Device]) {
        let mut index: HashMap<String, Vec<String>> = HashMap::new();
        for device in devices {
            let record = device.record();
            index.entry(record.name).or_default().push(record.id);
        }
        *self.name_index.lock().unwrap_or_else(|e| e.into_inner()) = index;
    }

    /// Devices whose display name matches exactly (as of the last walk)
    pub fn devices_with_name(&self, name: &str) -> Vec<Device> {
        let ids = self
            .name_index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .unwrap_or_default();

        let devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        ids.iter().filter_map(|id| devices.get(id).cloned()).collect()
    }

    /// Device by stable id, if it has ever been discovered
    pub fn device_with_id(&self, id: &str) -> Option<Device> {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Every device known to this registry
    pub fn all_devices(&self) -> Vec<Device> {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}
