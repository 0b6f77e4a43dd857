//! Shared adb invocation and output parsing
//!
//! Both Android drivers (emulator and physical) speak to devices through
//! this layer. adb output is line/token oriented; parsing stays close to the
//! raw format and every parser has fixture tests.

use std::sync::Arc;
use std::time::Duration;

use devicelab_core::device::Orientation;
use devicelab_core::prelude::*;

use crate::runner::{ProcessRunner, DEFAULT_COMMAND_TIMEOUT};

/// Deadline for app installs pushed over adb
const INSTALL_TIMEOUT: Duration = Duration::from_secs(120);

/// One row of `adb devices -l`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbDeviceRow {
    pub serial: String,
    pub state: String,
    /// Console port for emulator serials ("emulator-5554" -> 5554)
    pub port: Option<u16>,
    pub model: Option<String>,
    pub device: Option<String>,
}

impl AdbDeviceRow {
    pub fn is_emulator(&self) -> bool {
        self.port.is_some()
    }

    pub fn is_usable(&self) -> bool {
        self.state == "device"
    }
}

/// Parse the output of `adb devices -l`
pub fn parse_adb_devices(output: &str) -> Vec<AdbDeviceRow> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            let serial = tokens[0].to_string();
            let state = tokens[1].to_string();
            let port = serial
                .strip_prefix("emulator-")
                .and_then(|p| p.parse().ok());

            let mut model = None;
            let mut device = None;
            for token in tokens.iter().skip(2) {
                if let Some(value) = token.strip_prefix("model:") {
                    model = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("device:") {
                    device = Some(value.to_string());
                }
            }

            Some(AdbDeviceRow {
                serial,
                state,
                port,
                model,
                device,
            })
        })
        .collect()
}

/// Parse `wm size` output: "Physical size: 1080x2400", preferring an
/// "Override size" row when present
pub fn parse_wm_size(output: &str) -> Option<(u32, u32)> {
    let mut physical = None;
    let mut override_size = None;
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(value) = trimmed.strip_prefix("Physical size:") {
            physical = parse_dimensions(value);
        } else if let Some(value) = trimmed.strip_prefix("Override size:") {
            override_size = parse_dimensions(value);
        }
    }
    override_size.or(physical)
}

fn parse_dimensions(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.trim().split_once('x')?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

/// Parse `wm density` output: "Physical density: 440"
pub fn parse_wm_density(output: &str) -> Option<u32> {
    for line in output.lines() {
        let trimmed = line.trim();
        for prefix in ["Override density:", "Physical density:"] {
            if let Some(value) = trimmed.strip_prefix(prefix) {
                if let Ok(density) = value.trim().parse() {
                    return Some(density);
                }
            }
        }
    }
    None
}

/// Extract "SurfaceOrientation: N" from `dumpsys input`
pub fn parse_surface_orientation(output: &str) -> Option<Orientation> {
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(value) = trimmed.strip_prefix("SurfaceOrientation:") {
            if let Ok(index) = value.trim().parse::<u8>() {
                return Some(Orientation::from_index(index));
            }
        }
    }
    None
}

/// Parse `adb emu avd name` output: the AVD name on the first line, with an
/// "OK" terminator. A missing or error-ish reply yields None.
pub fn parse_avd_name(output: &str) -> Option<String> {
    let first = output.lines().map(str::trim).find(|line| !line.is_empty())?;
    if first == "OK" || first.starts_with("KO") || first.contains("error") {
        return None;
    }
    Some(first.to_string())
}

/// Marker monkey prints when the package has no launchable activity
const NO_ACTIVITIES_MARKER: &str = "No activities found";

/// adb client bound to one binary path
pub struct Adb {
    runner: Arc<dyn ProcessRunner>,
    program: String,
}

impl Adb {
    pub fn new(runner: Arc<dyn ProcessRunner>, program: impl Into<String>) -> Self {
        Adb {
            runner,
            program: program.into(),
        }
    }

    /// The adb binary this client invokes
    pub fn program(&self) -> &str {
        &self.program
    }

    fn argv(&self, serial: Option<&str>, args: &[&str]) -> Vec<String> {
        let mut argv = vec![self.program.clone()];
        if let Some(serial) = serial {
            argv.push("-s".to_string());
            argv.push(serial.to_string());
        }
        argv.extend(args.iter().map(|s| s.to_string()));
        argv
    }

    async fn run(&self, serial: Option<&str>, args: &[&str], deadline: Duration) -> Result<String> {
        let output = self
            .runner
            .run(&self.argv(serial, args), &[], deadline)
            .await?;
        // A healthy adb can still grumble on stderr (daemon restarts); that
        // is a warning, not a failure.
        if !output.stderr.is_empty() {
            warn!("adb {} stderr: {}", args.join(" "), output.stderr.trim_end());
        }
        Ok(output.stdout)
    }

    /// List connected devices and emulators
    pub async fn devices(&self) -> Result<Vec<AdbDeviceRow>> {
        let stdout = self
            .run(None, &["devices", "-l"], DEFAULT_COMMAND_TIMEOUT)
            .await?;
        Ok(parse_adb_devices(&stdout))
    }

    pub async fn shell(&self, serial: &str, args: &[&str]) -> Result<String> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        self.run(Some(serial), &full, DEFAULT_COMMAND_TIMEOUT).await
    }

    pub async fn getprop(&self, serial: &str, key: &str) -> Result<String> {
        let stdout = self.shell(serial, &["getprop", key]).await?;
        Ok(stdout.trim().to_string())
    }

    /// Whether `sys.boot_completed` reports 1
    pub async fn boot_completed(&self, serial: &str) -> Result<bool> {
        Ok(self.getprop(serial, "sys.boot_completed").await? == "1")
    }

    pub async fn wm_size(&self, serial: &str) -> Result<(u32, u32)> {
        let stdout = self.shell(serial, &["wm", "size"]).await?;
        parse_wm_size(&stdout)
            .ok_or_else(|| Error::process(format!("unparseable wm size output: {:?}", stdout)))
    }

    pub async fn wm_density(&self, serial: &str) -> Result<u32> {
        let stdout = self.shell(serial, &["wm", "density"]).await?;
        parse_wm_density(&stdout)
            .ok_or_else(|| Error::process(format!("unparseable wm density output: {:?}", stdout)))
    }

    pub async fn surface_orientation(&self, serial: &str) -> Result<Orientation> {
        let stdout = self.shell(serial, &["dumpsys", "input"]).await?;
        parse_surface_orientation(&stdout)
            .ok_or_else(|| Error::process("no SurfaceOrientation in dumpsys input output"))
    }

    /// AVD name behind an emulator serial, when the console answers
    pub async fn avd_name(&self, serial: &str) -> Option<String> {
        let stdout = self
            .run(Some(serial), &["emu", "avd", "name"], DEFAULT_COMMAND_TIMEOUT)
            .await
            .ok()?;
        parse_avd_name(&stdout)
    }

    pub async fn install(&self, serial: &str, apk_path: &str) -> Result<()> {
        self.run(Some(serial), &["install", "-r", apk_path], INSTALL_TIMEOUT)
            .await?;
        Ok(())
    }

    pub async fn uninstall(&self, serial: &str, package: &str) -> Result<()> {
        self.run(Some(serial), &["uninstall", package], DEFAULT_COMMAND_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Launch the package's default activity via monkey.
    ///
    /// monkey exits 0 even when it finds nothing to run; the failure marker
    /// only shows up in the output.
    pub async fn launch(&self, serial: &str, package: &str) -> Result<()> {
        let stdout = self
            .shell(
                serial,
                &[
                    "monkey",
                    "-p",
                    package,
                    "-c",
                    "android.intent.category.LAUNCHER",
                    "1",
                ],
            )
            .await?;
        if stdout.contains(NO_ACTIVITIES_MARKER) {
            return Err(Error::launch_failed(format!(
                "no activities found for {} on {}",
                package, serial
            )));
        }
        Ok(())
    }

    pub async fn keyevent(&self, serial: &str, code: u32) -> Result<()> {
        self.shell(serial, &["input", "keyevent", &code.to_string()])
            .await?;
        Ok(())
    }

    /// Pin rotation and set the requested quarter-turn
    pub async fn set_user_rotation(&self, serial: &str, orientation: Orientation) -> Result<()> {
        self.shell(
            serial,
            &["settings", "put", "system", "accelerometer_rotation", "0"],
        )
        .await?;
        self.shell(
            serial,
            &[
                "settings",
                "put",
                "system",
                "user_rotation",
                &orientation.index().to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    /// Ask the emulator console to shut the device down
    pub async fn emu_kill(&self, serial: &str) -> Result<()> {
        self.run(Some(serial), &["emu", "kill"], DEFAULT_COMMAND_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Clear the boot flag and cycle the framework (used by restart)
    pub async fn soft_restart(&self, serial: &str) -> Result<()> {
        self.shell(serial, &["setprop", "sys.boot_completed", "0"])
            .await?;
        self.shell(serial, &["stop"]).await?;
        self.shell(serial, &["start"]).await?;
        Ok(())
    }
}
