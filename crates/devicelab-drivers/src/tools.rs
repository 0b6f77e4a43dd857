//! Tool availability checking for device backends
//!
//! Probes for the external tools the drivers shell out to: `xcrun simctl`
//! and `instruments` (iOS), `adb` and `emulator` (Android SDK). Run once at
//! startup; drivers receive the resolved binary paths.

use std::sync::Arc;
use std::time::Duration;

use crate::runner::ProcessRunner;

/// Probe deadline per tool
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Cached availability of external tools
#[derive(Debug, Clone, Default)]
pub struct ToolAvailability {
    /// Whether `xcrun simctl` is available (macOS with Xcode)
    pub xcrun_simctl: bool,

    /// Whether `instruments` is available
    pub instruments: bool,

    /// Whether `adb` is available
    pub adb: bool,
    /// Path to adb if found
    pub adb_path: Option<String>,

    /// Whether the `emulator` command is available (Android SDK)
    pub android_emulator: bool,
    /// Path to emulator command if found
    pub emulator_path: Option<String>,
}

impl ToolAvailability {
    /// Check tool availability (run once at startup)
    pub async fn check(runner: &Arc<dyn ProcessRunner>) -> Self {
        let xcrun_simctl = probe(runner, &["xcrun", "simctl", "help"]).await;
        let instruments = probe(runner, &["instruments", "-s", "devices"]).await;
        let (adb, adb_path) = probe_candidates(runner, adb_candidates(), &["version"]).await;
        let (android_emulator, emulator_path) =
            probe_candidates(runner, emulator_candidates(), &["-list-avds"]).await;

        ToolAvailability {
            xcrun_simctl,
            instruments,
            adb,
            adb_path,
            android_emulator,
            emulator_path,
        }
    }

    /// Resolved adb binary, defaulting to PATH lookup
    pub fn adb_command(&self) -> String {
        self.adb_path.clone().unwrap_or_else(|| "adb".to_string())
    }

    /// Resolved emulator binary, defaulting to PATH lookup
    pub fn emulator_command(&self) -> String {
        self.emulator_path
            .clone()
            .unwrap_or_else(|| "emulator".to_string())
    }

    /// Get user-friendly message for unavailable iOS tools
    pub fn ios_unavailable_message(&self) -> Option<&'static str> {
        if self.xcrun_simctl {
            None
        } else {
            #[cfg(target_os = "macos")]
            {
                Some("Xcode not installed. Install Xcode to manage iOS simulators.")
            }

            #[cfg(not(target_os = "macos"))]
            {
                Some("iOS simulators are only available on macOS.")
            }
        }
    }

    /// Get user-friendly message for unavailable Android tools
    pub fn android_unavailable_message(&self) -> Option<&'static str> {
        if self.adb {
            None
        } else {
            Some("Android SDK not found. Set ANDROID_SDK_HOME or install Android Studio.")
        }
    }
}

async fn probe(runner: &Arc<dyn ProcessRunner>, argv: &[&str]) -> bool {
    let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
    runner.run(&argv, &[], PROBE_TIMEOUT).await.is_ok()
}

async fn probe_candidates(
    runner: &Arc<dyn ProcessRunner>,
    candidates: Vec<String>,
    args: &[&str],
) -> (bool, Option<String>) {
    for candidate in candidates {
        let mut argv = vec![candidate.clone()];
        argv.extend(args.iter().map(|s| s.to_string()));
        if runner.run(&argv, &[], PROBE_TIMEOUT).await.is_ok() {
            return (true, Some(candidate));
        }
    }
    (false, None)
}

/// Candidate paths for the adb binary: PATH, then SDK locations
fn adb_candidates() -> Vec<String> {
    let mut paths = vec!["adb".to_string()];
    for var in ["ANDROID_SDK_HOME", "ANDROID_HOME", "ANDROID_SDK_ROOT"] {
        if let Ok(root) = std::env::var(var) {
            paths.push(format!("{}/platform-tools/adb", root));
        }
    }
    paths
}

/// Candidate paths for the emulator binary: PATH, then SDK locations
fn emulator_candidates() -> Vec<String> {
    let mut paths = vec!["emulator".to_string()];
    for var in ["ANDROID_SDK_HOME", "ANDROID_HOME", "ANDROID_SDK_ROOT"] {
        if let Ok(root) = std::env::var(var) {
            paths.push(format!("{}/emulator/emulator", root));
        }
    }
    paths
}
