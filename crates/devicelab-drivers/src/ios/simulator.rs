//! iOS simulator driver using xcrun simctl
//!
//! Discovery parses `xcrun simctl list devices -j`; app and lifecycle
//! operations shell out to the matching `simctl` subcommands. The simulator
//! exposes no orientation query, so rotation drives the Simulator.app menu
//! through `osascript` and the cached record value is authoritative.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use devicelab_core::device::{DeviceKind, DeviceMetrics, DeviceRecord, DeviceState, Orientation, Platform};
use devicelab_core::driver::{DeviceDriver, DeviceSeed, KeyAction, ManagedProcess, IOS_SIMULATOR};
use devicelab_core::prelude::*;

use crate::runner::{ProcessRunner, DEFAULT_COMMAND_TIMEOUT};

/// Deadline for the simctl list walk
const LIST_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for one boot/shutdown command (not the full boot wait)
const BOOT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for app install; bundles can be large
const INSTALL_TIMEOUT: Duration = Duration::from_secs(120);

/// JSON output from `xcrun simctl list devices -j`
#[derive(Debug, Deserialize)]
struct SimctlOutput {
    devices: HashMap<String, Vec<SimctlDevice>>,
}

#[derive(Debug, Deserialize)]
struct SimctlDevice {
    udid: String,
    name: String,
    state: String,
    #[serde(rename = "deviceTypeIdentifier")]
    device_type_identifier: Option<String>,
    #[serde(rename = "isAvailable")]
    is_available: Option<bool>,
}

/// Parse runtime identifier to friendly name
/// "com.apple.CoreSimulator.SimRuntime.iOS-17-2" -> "iOS 17.2"
fn parse_runtime_name(identifier: &str) -> String {
    if let Some(suffix) = identifier.strip_prefix("com.apple.CoreSimulator.SimRuntime.") {
        if let Some((os_name, version)) = suffix.split_once('-') {
            let version_formatted = version.replace('-', ".");
            format!("{} {}", os_name, version_formatted)
        } else {
            suffix.to_string()
        }
    } else {
        identifier.to_string()
    }
}

/// "com.apple.CoreSimulator.SimDeviceType.iPhone-15-Pro" -> "iPhone 15 Pro"
fn parse_device_type(identifier: &str) -> String {
    match identifier.strip_prefix("com.apple.CoreSimulator.SimDeviceType.") {
        Some(suffix) => suffix.replace('-', " "),
        None => identifier.to_string(),
    }
}

/// Parse the simctl listing into seeds, skipping unavailable devices
fn parse_simctl_list(json: &str) -> Result<Vec<DeviceSeed>> {
    let parsed: SimctlOutput = serde_json::from_str(json)?;

    let mut seeds = Vec::new();
    for (runtime_key, devices) in parsed.devices {
        // Non-iOS runtimes (watchOS, tvOS) are not lab targets
        if !runtime_key.contains(".iOS-") {
            continue;
        }
        let runtime = parse_runtime_name(&runtime_key);

        for device in devices {
            if device.is_available == Some(false) {
                continue;
            }

            let mut seed =
                DeviceSeed::new(device.udid, device.name, Platform::Ios, DeviceKind::Simulator)
                    .with_sdk(runtime.clone())
                    .with_state(DeviceState::from(device.state.as_str()));
            if let Some(type_id) = device.device_type_identifier {
                seed = seed.with_model(parse_device_type(&type_id));
            }
            seeds.push(seed);
        }
    }

    // Stable ordering: newest runtime first, then by name
    seeds.sort_by(|a, b| b.sdk.cmp(&a.sdk).then_with(|| a.name.cmp(&b.name)));
    Ok(seeds)
}

/// Simulator driver backed by simctl
pub struct IosSimulatorDriver {
    runner: Arc<dyn ProcessRunner>,
}

impl IosSimulatorDriver {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        IosSimulatorDriver { runner }
    }

    fn simctl(&self, args: &[&str]) -> Vec<String> {
        let mut argv = vec!["xcrun".to_string(), "simctl".to_string()];
        argv.extend(args.iter().map(|s| s.to_string()));
        argv
    }

    async fn run_simctl(&self, args: &[&str], deadline: Duration) -> Result<String> {
        let output = self.runner.run(&self.simctl(args), &[], deadline).await?;
        if !output.stderr.is_empty() {
            warn!("simctl {} stderr: {}", args.join(" "), output.stderr.trim_end());
        }
        Ok(output.stdout)
    }

    /// Read one simulator env var exported to the device environment
    async fn getenv(&self, udid: &str, key: &str) -> Result<String> {
        let stdout = self
            .run_simctl(&["getenv", udid, key], DEFAULT_COMMAND_TIMEOUT)
            .await?;
        Ok(stdout.trim().to_string())
    }

    /// Click a Simulator.app menu item via System Events
    async fn click_device_menu(&self, item: &str) -> Result<()> {
        let script = format!(
            "tell application \"System Events\" to tell process \"Simulator\" \
             to click menu item \"{}\" of menu \"Device\" of menu bar 1",
            item
        );
        let argv = vec!["osascript".to_string(), "-e".to_string(), script];
        self.runner.run(&argv, &[], DEFAULT_COMMAND_TIMEOUT).await?;
        Ok(())
    }

    /// Send a keystroke to Simulator.app via System Events
    async fn send_keystroke(&self, key: &str, modifiers: &str) -> Result<()> {
        let script = format!(
            "tell application \"System Events\" to tell process \"Simulator\" \
             to keystroke \"{}\" using {{{}}}",
            key, modifiers
        );
        let argv = vec!["osascript".to_string(), "-e".to_string(), script];
        self.runner.run(&argv, &[], DEFAULT_COMMAND_TIMEOUT).await?;
        Ok(())
    }
}

#[async_trait]
impl DeviceDriver for IosSimulatorDriver {
    fn name(&self) -> &str {
        IOS_SIMULATOR
    }

    fn platform(&self) -> Platform {
        Platform::Ios
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Simulator
    }

    async fn discover(&self) -> Result<Vec<DeviceSeed>> {
        let stdout = self
            .run_simctl(&["list", "devices", "-j"], LIST_TIMEOUT)
            .await?;
        parse_simctl_list(&stdout)
    }

    async fn boot(&self, device: &DeviceRecord) -> Result<Option<Arc<dyn ManagedProcess>>> {
        match self
            .run_simctl(&["boot", &device.id], BOOT_COMMAND_TIMEOUT)
            .await
        {
            Ok(_) => {}
            // "Unable to boot device in current state: Booted" is not an error
            Err(Error::NonZeroExit { stderr, .. }) if stderr.contains("Booted") => {
                debug!("simulator {} was already booted", device.id);
            }
            Err(e) => return Err(e),
        }

        // Bring up the UI; failures here don't affect the boot itself
        let open = vec!["open".to_string(), "-a".to_string(), "Simulator".to_string()];
        let _ = self.runner.run(&open, &[], DEFAULT_COMMAND_TIMEOUT).await;

        Ok(None)
    }

    async fn shutdown(&self, device: &DeviceRecord) -> Result<()> {
        match self
            .run_simctl(&["shutdown", &device.id], BOOT_COMMAND_TIMEOUT)
            .await
        {
            Ok(_) => Ok(()),
            // "Unable to shutdown device in current state: Shutdown" resolves the intent
            Err(Error::NonZeroExit { stderr, .. }) if stderr.contains("Shutdown") => {
                debug!("simulator {} was already shut down", device.id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn restart(&self, device: &DeviceRecord) -> Result<()> {
        self.shutdown(device).await?;
        self.boot(device).await?;
        Ok(())
    }

    async fn is_booted(&self, device: &DeviceRecord) -> Result<bool> {
        let seeds = self.discover().await?;
        Ok(seeds
            .iter()
            .any(|s| s.id == device.id && s.state == DeviceState::Booted))
    }

    async fn install(&self, device: &DeviceRecord, app_path: &str) -> Result<()> {
        self.run_simctl(&["install", &device.id, app_path], INSTALL_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn uninstall(&self, device: &DeviceRecord, bundle_id: &str) -> Result<()> {
        self.run_simctl(&["uninstall", &device.id, bundle_id], DEFAULT_COMMAND_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn launch(&self, device: &DeviceRecord, bundle_id: &str) -> Result<()> {
        match self
            .run_simctl(&["launch", &device.id, bundle_id], DEFAULT_COMMAND_TIMEOUT)
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::NonZeroExit { stderr, .. })
                if stderr.contains("FBSOpenApplicationServiceErrorDomain") =>
            {
                Err(Error::launch_failed(format!(
                    "{} could not be opened on {}",
                    bundle_id, device.id
                )))
            }
            Err(e) => Err(e),
        }
    }

    async fn read_metrics(&self, device: &DeviceRecord) -> Result<DeviceMetrics> {
        let width = self
            .getenv(&device.id, "SIMULATOR_MAINSCREEN_WIDTH")
            .await?
            .parse::<u32>()
            .unwrap_or(0);
        let height = self
            .getenv(&device.id, "SIMULATOR_MAINSCREEN_HEIGHT")
            .await?
            .parse::<u32>()
            .unwrap_or(0);
        let scale = self
            .getenv(&device.id, "SIMULATOR_MAINSCREEN_SCALE")
            .await?
            .parse::<f32>()
            .unwrap_or(1.0);

        Ok(DeviceMetrics {
            width,
            height,
            density: (scale * 100.0) as u32,
        })
    }

    async fn read_orientation(&self, device: &DeviceRecord) -> Result<Orientation> {
        // simctl exposes no orientation query; the record value is canonical
        Ok(device.orientation)
    }

    async fn set_orientation(&self, device: &DeviceRecord, orientation: Orientation) -> Result<()> {
        let steps = (orientation.index() + 4 - device.orientation.index()) % 4;
        match steps {
            0 => {}
            // One counter-clockwise turn beats three clockwise ones
            3 => self.click_device_menu("Rotate Left").await?,
            n => {
                for _ in 0..n {
                    self.click_device_menu("Rotate Right").await?;
                }
            }
        }
        Ok(())
    }

    async fn key_event(&self, device: &DeviceRecord, action: KeyAction) -> Result<()> {
        match action {
            KeyAction::Home => self.send_keystroke("h", "command down, shift down").await,
            KeyAction::Lock => self.send_keystroke("l", "command down").await,
            KeyAction::Shake => {
                self.send_keystroke("z", "command down, control down").await
            }
            KeyAction::Code(code) => Err(Error::argument(format!(
                "raw key code {} is not supported on iOS simulator {}",
                code, device.id
            ))),
        }
    }

    async fn set_hardware_keyboard(&self, _device: &DeviceRecord, connected: bool) -> Result<()> {
        let argv = vec![
            "defaults".to_string(),
            "write".to_string(),
            "com.apple.iphonesimulator".to_string(),
            "ConnectHardwareKeyboard".to_string(),
            "-bool".to_string(),
            connected.to_string(),
        ];
        self.runner.run(&argv, &[], DEFAULT_COMMAND_TIMEOUT).await?;
        Ok(())
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
            "xcrun".to_string(),
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
