//! iOS physical-device driver
//!
//! Discovery parses `instruments -s devices` and classifies rows as physical
//! by checking their udid against the simulator listing. Physical hardware
//! manages its own power and UI, so most lifecycle operations are rejected;
//! app management goes through libimobiledevice tools.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use devicelab_core::device::{
    DeviceKind, DeviceMetrics, DeviceRecord, DeviceState, Orientation, Platform,
};
use devicelab_core::driver::{DeviceDriver, DeviceSeed, KeyAction, ManagedProcess, IOS_PHYSICAL};
use devicelab_core::prelude::*;

use crate::runner::{ProcessRunner, DEFAULT_COMMAND_TIMEOUT};

/// Deadline for the instruments device walk; the first run can be slow
const LIST_TIMEOUT: Duration = Duration::from_secs(30);

/// One `instruments -s devices` row: "Name (17.2) [UDID]" with an optional
/// "(Simulator)" marker
static DEVICE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<name>.+?) \((?P<runtime>[0-9.]+)\) \[(?P<udid>[0-9A-Za-z-]+)\](?P<sim> \(Simulator\))?$")
        .expect("invalid device line regex")
});

/// Parse instruments output into `(name, runtime, udid, is_simulator_marked)`
fn parse_instruments_devices(output: &str) -> Vec<(String, String, String, bool)> {
    output
        .lines()
        .filter_map(|line| {
            let caps = DEVICE_LINE.captures(line.trim())?;
            Some((
                caps["name"].to_string(),
                caps["runtime"].to_string(),
                caps["udid"].to_string(),
                caps.name("sim").is_some(),
            ))
        })
        .collect()
}

/// Physical-device driver backed by instruments + libimobiledevice
pub struct IosPhysicalDriver {
    runner: Arc<dyn ProcessRunner>,
}

impl IosPhysicalDriver {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        IosPhysicalDriver { runner }
    }

    /// Udids of known simulators, used to classify instruments rows.
    /// An unavailable simctl (no Xcode) yields the empty set.
    async fn simulator_udids(&self) -> HashSet<String> {
        let argv: Vec<String> = ["xcrun", "simctl", "list", "devices", "-j"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let Ok(output) = self.runner.run(&argv, &[], LIST_TIMEOUT).await else {
            return HashSet::new();
        };

        let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&output.stdout) else {
            return HashSet::new();
        };

        let mut udids = HashSet::new();
        if let Some(devices) = parsed.get("devices").and_then(|d| d.as_object()) {
            for list in devices.values().filter_map(|v| v.as_array()) {
                for device in list {
                    if let Some(udid) = device.get("udid").and_then(|u| u.as_str()) {
                        udids.insert(udid.to_string());
                    }
                }
            }
        }
        udids
    }

    fn unsupported(&self, op: &str, device: &DeviceRecord) -> Error {
        Error::process(format!(
            "{} is not supported on physical iOS device {}",
            op, device.id
        ))
    }
}

#[async_trait]
impl DeviceDriver for IosPhysicalDriver {
    fn name(&self) -> &str {
        IOS_PHYSICAL
    }

    fn platform(&self) -> Platform {
        Platform::Ios
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Physical
    }

    async fn discover(&self) -> Result<Vec<DeviceSeed>> {
        let argv: Vec<String> = ["instruments", "-s", "devices"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = self.runner.run(&argv, &[], LIST_TIMEOUT).await?;
        if !output.stderr.is_empty() {
            warn!("instruments stderr: {}", output.stderr.trim_end());
        }

        let simulator_udids = self.simulator_udids().await;

        let seeds = parse_instruments_devices(&output.stdout)
            .into_iter()
            .filter(|(_, _, udid, marked_sim)| !marked_sim && !simulator_udids.contains(udid))
            .map(|(name, runtime, udid, _)| {
                DeviceSeed::new(udid, name, Platform::Ios, DeviceKind::Physical)
                    .with_sdk(format!("iOS {}", runtime))
                    // A cabled device that lists is up and running
                    .with_state(DeviceState::Booted)
            })
            .collect();
        Ok(seeds)
    }

    async fn boot(&self, device: &DeviceRecord) -> Result<Option<Arc<dyn ManagedProcess>>> {
        Err(self.unsupported("boot", device))
    }

    async fn shutdown(&self, device: &DeviceRecord) -> Result<()> {
        Err(self.unsupported("shutdown", device))
    }

    async fn restart(&self, device: &DeviceRecord) -> Result<()> {
        Err(self.unsupported("restart", device))
    }

    async fn is_booted(&self, device: &DeviceRecord) -> Result<bool> {
        let seeds = self.discover().await?;
        Ok(seeds.iter().any(|s| s.id == device.id))
    }

    async fn install(&self, device: &DeviceRecord, app_path: &str) -> Result<()> {
        let argv = vec![
            "ideviceinstaller".to_string(),
            "-u".to_string(),
            device.id.clone(),
            "-i".to_string(),
            app_path.to_string(),
        ];
        self.runner
            .run(&argv, &[], Duration::from_secs(120))
            .await?;
        Ok(())
    }

    async fn uninstall(&self, device: &DeviceRecord, bundle_id: &str) -> Result<()> {
        let argv = vec![
            "ideviceinstaller".to_string(),
            "-u".to_string(),
            device.id.clone(),
            "-U".to_string(),
            bundle_id.to_string(),
        ];
        self.runner.run(&argv, &[], DEFAULT_COMMAND_TIMEOUT).await?;
        Ok(())
    }

    async fn launch(&self, device: &DeviceRecord, _bundle_id: &str) -> Result<()> {
        Err(self.unsupported("launch", device))
    }

    async fn read_metrics(&self, device: &DeviceRecord) -> Result<DeviceMetrics> {
        // Screen metrics are not queryable over the cable; report zeros and
        // keep the model string fresh via ideviceinfo.
        let argv = vec![
            "ideviceinfo".to_string(),
            "-u".to_string(),
            device.id.clone(),
            "-k".to_string(),
            "ProductType".to_string(),
        ];
        let _ = self.runner.run(&argv, &[], DEFAULT_COMMAND_TIMEOUT).await;
        Ok(DeviceMetrics::default())
    }

    async fn read_orientation(&self, device: &DeviceRecord) -> Result<Orientation> {
        Ok(device.orientation)
    }

    async fn set_orientation(&self, device: &DeviceRecord, _orientation: Orientation) -> Result<()> {
        Err(self.unsupported("rotation", device))
    }

    async fn key_event(&self, device: &DeviceRecord, _action: KeyAction) -> Result<()> {
        Err(self.unsupported("key events", device))
    }

    async fn set_hardware_keyboard(&self, device: &DeviceRecord, _connected: bool) -> Result<()> {
        Err(self.unsupported("hardware keyboard toggling", device))
    }

    async fn spawn_instrument(
        &self,
        device: &DeviceRecord,
        instrument: &str,
    ) -> Result<Arc<dyn ManagedProcess>> {
        let trace_path = device
            .local_storage_path
            .join(format!("{}.trace", instrument));
        let argv = vec![
            "instruments".to_string(),
            "-w".to_string(),
            device.id.clone(),
            "-t".to_string(),
            instrument.to_string(),
            "-D".to_string(),
            trace_path.to_string_lossy().to_string(),
        ];
        self.runner.spawn(&argv, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedRunner;

    const INSTRUMENTS_LISTING: &str = "\
Known Devices:
lab-host [5A0E2C7B-8F91-4D6E-B1A2-3C4D5E6F7A8B]
Lab iPhone 13 (17.2) [00008110-000A2DE40CC2801E]
iPhone SE (17.2) [UDID-A] (Simulator)
iPhone 15 Pro (17.2) [UDID-B] (Simulator)
";

    const SIMCTL_LISTING: &str = r#"{
        "devices": {
            "com.apple.CoreSimulator.SimRuntime.iOS-17-2": [
                { "udid": "UDID-A", "name": "iPhone SE", "state": "Shutdown", "isAvailable": true },
                { "udid": "UDID-B", "name": "iPhone 15 Pro", "state": "Shutdown", "isAvailable": true }
            ]
        }
    }"#;

    #[test]
    fn test_parse_instruments_devices() {
        let rows = parse_instruments_devices(INSTRUMENTS_LISTING);

        // The host row has no runtime and is skipped
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].0, "Lab iPhone 13");
        assert_eq!(rows[0].1, "17.2");
        assert_eq!(rows[0].2, "00008110-000A2DE40CC2801E");
        assert!(!rows[0].3);
        assert!(rows[1].3, "simulator rows carry the marker");
    }

    #[test]
    fn test_parse_instruments_devices_empty() {
        assert!(parse_instruments_devices("Known Devices:\n").is_empty());
    }

    #[tokio::test]
    async fn test_discover_classifies_by_simulator_listing() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.script_stdout("instruments -s devices", INSTRUMENTS_LISTING);
        runner.script_stdout("xcrun simctl list devices -j", SIMCTL_LISTING);

        let driver = IosPhysicalDriver::new(runner);
        let seeds = driver.discover().await.unwrap();

        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].id, "00008110-000A2DE40CC2801E");
        assert_eq!(seeds[0].name, "Lab iPhone 13");
        assert_eq!(seeds[0].sdk, "iOS 17.2");
        assert_eq!(seeds[0].kind, DeviceKind::Physical);
        assert_eq!(seeds[0].state, DeviceState::Booted);
    }

    #[tokio::test]
    async fn test_discover_without_simctl_still_drops_marked_rows() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.script_stdout("instruments -s devices", INSTRUMENTS_LISTING);
        // simctl is unscripted: the driver treats the sim set as empty

        let driver = IosPhysicalDriver::new(runner);
        let seeds = driver.discover().await.unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].id, "00008110-000A2DE40CC2801E");
    }

    #[tokio::test]
    async fn test_power_operations_rejected() {
        let runner = Arc::new(ScriptedRunner::new());
        let driver = IosPhysicalDriver::new(runner);

        let dir = tempfile::tempdir().unwrap();
        let storage = devicelab_core::storage::DeviceStorage::create_in(dir.path(), "P1").unwrap();
        let record =
            DeviceRecord::new("P1", "Lab iPhone", Platform::Ios, DeviceKind::Physical, &storage);

        assert!(driver.boot(&record).await.is_err());
        assert!(driver.shutdown(&record).await.is_err());
        assert!(driver
            .set_orientation(&record, Orientation::LANDSCAPE_LEFT)
            .await
            .is_err());
    }
}
