//! Android emulator (AVD) driver
//!
//! AVDs are discovered by scanning the AVD home directory: each `*.avd/`
//! holds a `config.ini` and has a sibling `<name>.ini` carrying the SDK
//! target. Running emulators are matched back to their AVD through the
//! console (`adb emu avd name`); a running emulator that answers with no
//! AVD name is treated as orphaned and, when this process spawned it, gets
//! SIGINT.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use devicelab_core::device::{
    DeviceKind, DeviceMetrics, DeviceRecord, DeviceState, Orientation, Platform,
};
use devicelab_core::driver::{
    DeviceDriver, DeviceSeed, KeyAction, ManagedProcess, ANDROID_EMULATOR,
};
use devicelab_core::prelude::*;

use crate::android::adb::Adb;
use crate::runner::{ProcessRunner, DEFAULT_COMMAND_TIMEOUT};

/// First console port the emulator binary hands out
const FIRST_CONSOLE_PORT: u16 = 5554;

/// Android framework key codes used by the uniform key surface
const KEYCODE_HOME: u32 = 3;
const KEYCODE_POWER: u32 = 26;

/// Resolve the AVD home directory.
///
/// `ANDROID_AVD_HOME` points directly at the AVD directory;
/// `ANDROID_SDK_HOME` at the directory containing `.android`. The platform
/// home is the last resort.
pub fn avd_home() -> PathBuf {
    if let Ok(home) = std::env::var("ANDROID_AVD_HOME") {
        return PathBuf::from(home);
    }
    if let Ok(sdk_home) = std::env::var("ANDROID_SDK_HOME") {
        return PathBuf::from(sdk_home).join(".android").join("avd");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".android")
        .join("avd")
}

/// Parse a flat `key=value` ini body; comments and sections are skipped
fn parse_ini(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('[') {
            continue;
        }
        if let Some((key, value)) = trimmed.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

/// Extract the SDK level from a `target=android-NN` value
fn parse_target_sdk(target: &str) -> Option<String> {
    target.split(':').last().map(|t| t.trim().to_string())
}

/// One AVD read from disk
#[derive(Debug, Clone)]
struct AvdConfig {
    id: String,
    display_name: String,
    sdk: String,
}

/// Scan the AVD home for `*.avd` directories and read their configuration
fn scan_avd_home(home: &Path) -> Result<Vec<AvdConfig>> {
    let mut avds = Vec::new();

    let entries = match std::fs::read_dir(home) {
        Ok(entries) => entries,
        // A missing AVD home just means no AVDs are configured
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(avds),
        Err(e) => return Err(e.into()),
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() || path.extension().and_then(|e| e.to_str()) != Some("avd") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        let config = std::fs::read_to_string(path.join("config.ini"))
            .map(|c| parse_ini(&c))
            .unwrap_or_default();

        let sibling = std::fs::read_to_string(home.join(format!("{}.ini", stem)))
            .map(|c| parse_ini(&c))
            .unwrap_or_default();

        let id = config
            .get("AvdId")
            .cloned()
            .unwrap_or_else(|| stem.to_string());
        let display_name = config
            .get("avd.ini.displayname")
            .cloned()
            .unwrap_or_else(|| stem.replace('_', " "));
        let sdk = sibling
            .get("target")
            .and_then(|t| parse_target_sdk(t))
            .unwrap_or_default();

        avds.push(AvdConfig {
            id,
            display_name,
            sdk,
        });
    }

    avds.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(avds)
}

/// Tracked emulator process spawned by this driver
struct SpawnedEmulator {
    avd_id: String,
    handle: Arc<dyn ManagedProcess>,
}

#[derive(Default)]
struct EmuState {
    /// avd id -> serial of its running emulator
    serials: HashMap<String, String>,
    /// console port -> process spawned by this driver
    spawned: HashMap<u16, SpawnedEmulator>,
    next_port: Option<u16>,
}

/// Emulator driver backed by the `emulator` binary and adb
pub struct AndroidEmulatorDriver {
    runner: Arc<dyn ProcessRunner>,
    adb: Adb,
    emulator_program: String,
    avd_home: PathBuf,
    state: Mutex<EmuState>,
}

impl AndroidEmulatorDriver {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self::with_programs(runner, "adb", "emulator", avd_home())
    }

    pub fn with_programs(
        runner: Arc<dyn ProcessRunner>,
        adb_program: impl Into<String>,
        emulator_program: impl Into<String>,
        avd_home: PathBuf,
    ) -> Self {
        AndroidEmulatorDriver {
            adb: Adb::new(Arc::clone(&runner), adb_program),
            runner,
            emulator_program: emulator_program.into(),
            avd_home,
            state: Mutex::default(),
        }
    }

    fn allocate_port(&self) -> u16 {
        let mut state = self.state.lock().unwrap();
        let port = state.next_port.unwrap_or(FIRST_CONSOLE_PORT);
        // Console ports advance in steps of two (console + adb pair)
        state.next_port = Some(port + 2);
        port
    }

    /// Serial of the running emulator for an AVD, from the cache or a fresh
    /// adb walk
    async fn serial_for(&self, avd_id: &str) -> Result<String> {
        if let Some(serial) = self.state.lock().unwrap().serials.get(avd_id).cloned() {
            return Ok(serial);
        }

        for row in self.adb.devices().await? {
            if !row.is_emulator() {
                continue;
            }
            if self.adb.avd_name(&row.serial).await.as_deref() == Some(avd_id) {
                self.state
                    .lock()
                    .unwrap()
                    .serials
                    .insert(avd_id.to_string(), row.serial.clone());
                return Ok(row.serial);
            }
        }

        Err(Error::not_booted(avd_id))
    }

    /// Signal a spawned-but-unidentifiable emulator and drop its tracking
    fn reap_orphan(&self, port: u16, serial: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(orphan) = state.spawned.remove(&port) {
            warn!(
                serial,
                avd = %orphan.avd_id,
                "running emulator reports no AVD name; interrupting orphan"
            );
            if let Err(e) = orphan.handle.interrupt() {
                warn!("failed to interrupt orphaned emulator: {}", e);
            }
            state.serials.remove(&orphan.avd_id);
        } else {
            debug!(serial, "unidentified emulator not spawned by this process; leaving it");
        }
    }
}

#[async_trait]
impl DeviceDriver for AndroidEmulatorDriver {
    fn name(&self) -> &str {
        ANDROID_EMULATOR
    }

    fn platform(&self) -> Platform {
        Platform::Android
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Simulator
    }

    async fn discover(&self) -> Result<Vec<DeviceSeed>> {
        let avds = scan_avd_home(&self.avd_home)?;

        let mut seeds: Vec<DeviceSeed> = avds
            .iter()
            .map(|avd| {
                DeviceSeed::new(&avd.id, &avd.display_name, Platform::Android, DeviceKind::Simulator)
                    .with_sdk(&avd.sdk)
                    .with_state(DeviceState::Shutdown)
            })
            .collect();

        // Match running emulators back to their AVD; a row without an AVD
        // name is orphaned. An unreachable adb only means no running rows.
        let rows = match self.adb.devices().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("adb devices unavailable during AVD walk: {}", e);
                Vec::new()
            }
        };
        for row in rows.iter().filter(|r| r.is_emulator() && r.is_usable()) {
            match self.adb.avd_name(&row.serial).await {
                Some(avd_id) => {
                    if let Some(seed) = seeds.iter_mut().find(|s| s.id == avd_id) {
                        seed.state = DeviceState::Booted;
                        if let Some(model) = &row.model {
                            seed.model = Some(model.replace('_', " "));
                        }
                        self.state
                            .lock()
                            .unwrap()
                            .serials
                            .insert(avd_id, row.serial.clone());
                    }
                }
                None => {
                    if let Some(port) = row.port {
                        self.reap_orphan(port, &row.serial);
                    }
                }
            }
        }

        Ok(seeds)
    }

    async fn boot(&self, device: &DeviceRecord) -> Result<Option<Arc<dyn ManagedProcess>>> {
        let port = self.allocate_port();
        let argv = vec![
            self.emulator_program.clone(),
            "-avd".to_string(),
            device.id.clone(),
            "-port".to_string(),
            port.to_string(),
            "-no-snapshot-load".to_string(),
        ];
        let handle = self.runner.spawn(&argv, &[]).await?;

        let mut state = self.state.lock().unwrap();
        state.spawned.insert(
            port,
            SpawnedEmulator {
                avd_id: device.id.clone(),
                handle: Arc::clone(&handle),
            },
        );
        state
            .serials
            .insert(device.id.clone(), format!("emulator-{}", port));

        Ok(Some(handle))
    }

    async fn shutdown(&self, device: &DeviceRecord) -> Result<()> {
        let serial = self.serial_for(&device.id).await?;
        self.adb.emu_kill(&serial).await?;
        self.state.lock().unwrap().serials.remove(&device.id);
        Ok(())
    }

    async fn restart(&self, device: &DeviceRecord) -> Result<()> {
        let serial = self.serial_for(&device.id).await?;
        self.adb.soft_restart(&serial).await
    }

    async fn is_booted(&self, device: &DeviceRecord) -> Result<bool> {
        let serial = match self.serial_for(&device.id).await {
            Ok(serial) => serial,
            Err(Error::DeviceNotBooted { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        // A freshly spawned emulator may not answer adb yet; that is a
        // normal poll miss, not a failure.
        Ok(self.adb.boot_completed(&serial).await.unwrap_or(false))
    }

    async fn install(&self, device: &DeviceRecord, app_path: &str) -> Result<()> {
        let serial = self.serial_for(&device.id).await?;
        self.adb.install(&serial, app_path).await
    }

    async fn uninstall(&self, device: &DeviceRecord, package: &str) -> Result<()> {
        let serial = self.serial_for(&device.id).await?;
        self.adb.uninstall(&serial, package).await
    }

    async fn launch(&self, device: &DeviceRecord, package: &str) -> Result<()> {
        let serial = self.serial_for(&device.id).await?;
        self.adb.launch(&serial, package).await
    }

    async fn read_metrics(&self, device: &DeviceRecord) -> Result<DeviceMetrics> {
        let serial = self.serial_for(&device.id).await?;
        let (width, height) = self.adb.wm_size(&serial).await?;
        let density = self.adb.wm_density(&serial).await?;
        Ok(DeviceMetrics {
            width,
            height,
            density,
        })
    }

    async fn read_orientation(&self, device: &DeviceRecord) -> Result<Orientation> {
        let serial = self.serial_for(&device.id).await?;
        self.adb.surface_orientation(&serial).await
    }

    async fn set_orientation(&self, device: &DeviceRecord, orientation: Orientation) -> Result<()> {
        let serial = self.serial_for(&device.id).await?;
        self.adb.set_user_rotation(&serial, orientation).await
    }

    async fn key_event(&self, device: &DeviceRecord, action: KeyAction) -> Result<()> {
        let serial = self.serial_for(&device.id).await?;
        match action {
            KeyAction::Code(code) => self.adb.keyevent(&serial, code).await,
            KeyAction::Home => self.adb.keyevent(&serial, KEYCODE_HOME).await,
            KeyAction::Lock => self.adb.keyevent(&serial, KEYCODE_POWER).await,
            KeyAction::Shake => {
                // Nudge the accelerometer through the console, then settle it
                let program = self.adb.program();
                let nudge =
                    build_adb_argv(program, &serial, &["emu", "sensor", "set", "acceleration", "100:100:100"]);
                let settle =
                    build_adb_argv(program, &serial, &["emu", "sensor", "set", "acceleration", "0:9.81:0"]);
                self.runner.run(&nudge, &[], DEFAULT_COMMAND_TIMEOUT).await?;
                self.runner
                    .run(&settle, &[], DEFAULT_COMMAND_TIMEOUT)
                    .await?;
                Ok(())
            }
        }
    }

    async fn set_hardware_keyboard(&self, device: &DeviceRecord, _connected: bool) -> Result<()> {
        Err(Error::process(format!(
            "hardware keyboard is fixed in the AVD configuration of {}",
            device.id
        )))
    }

    async fn spawn_instrument(
        &self,
        device: &DeviceRecord,
        instrument: &str,
    ) -> Result<Arc<dyn ManagedProcess>> {
        let serial = self.serial_for(&device.id).await?;
        let argv = build_adb_argv(
            self.adb.program(),
            &serial,
            &["shell", "am", "instrument", "-w", instrument],
        );
        self.runner.spawn(&argv, &[]).await
    }
}

fn build_adb_argv(program: &str, serial: &str, args: &[&str]) -> Vec<String> {
    let mut argv = vec![program.to_string(), "-s".to_string(), serial.to_string()];
    argv.extend(args.iter().map(|s| s.to_string()));
    argv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedRunner;
    use tempfile::tempdir;

    fn write_avd(home: &Path, name: &str, display: &str, target: &str) {
        let avd_dir = home.join(format!("{}.avd", name));
        std::fs::create_dir_all(&avd_dir).unwrap();
        std::fs::write(
            avd_dir.join("config.ini"),
            format!("AvdId={}\navd.ini.displayname={}\nhw.lcd.density=440\n", name, display),
        )
        .unwrap();
        std::fs::write(
            home.join(format!("{}.ini", name)),
            format!("avd.ini.encoding=UTF-8\npath={}\ntarget={}\n", avd_dir.display(), target),
        )
        .unwrap();
    }

    fn driver(runner: Arc<ScriptedRunner>, home: &Path) -> AndroidEmulatorDriver {
        AndroidEmulatorDriver::with_programs(runner, "adb", "emulator", home.to_path_buf())
    }

    fn test_record(id: &str) -> DeviceRecord {
        let dir = tempdir().unwrap();
        let storage = devicelab_core::storage::DeviceStorage::create_in(dir.path(), id).unwrap();
        DeviceRecord::new(id, id, Platform::Android, DeviceKind::Simulator, &storage)
    }

    #[test]
    fn test_parse_ini() {
        let map = parse_ini("# comment\nAvdId=Pixel_6_API_33\n avd.ini.displayname = Pixel 6 \n\n[section]\n");
        assert_eq!(map.get("AvdId").map(String::as_str), Some("Pixel_6_API_33"));
        assert_eq!(
            map.get("avd.ini.displayname").map(String::as_str),
            Some("Pixel 6")
        );
        assert!(!map.contains_key("[section]"));
    }

    #[test]
    fn test_parse_target_sdk() {
        assert_eq!(parse_target_sdk("android-34"), Some("android-34".to_string()));
        assert_eq!(
            parse_target_sdk("Google Inc.:Google APIs:android-33"),
            Some("android-33".to_string())
        );
    }

    #[test]
    fn test_scan_avd_home() {
        let home = tempdir().unwrap();
        write_avd(home.path(), "Pixel_6_API_33", "Pixel 6", "android-33");
        write_avd(home.path(), "Nexus_5X_API_29", "Nexus 5X", "android-29");
        // A stray file does not break the scan
        std::fs::write(home.path().join("notes.txt"), "x").unwrap();

        let avds = scan_avd_home(home.path()).unwrap();
        assert_eq!(avds.len(), 2);
        assert_eq!(avds[0].id, "Nexus_5X_API_29");
        assert_eq!(avds[1].id, "Pixel_6_API_33");
        assert_eq!(avds[1].display_name, "Pixel 6");
        assert_eq!(avds[1].sdk, "android-33");
    }

    #[test]
    fn test_scan_missing_home_is_empty() {
        let home = tempdir().unwrap();
        let missing = home.path().join("does-not-exist");
        assert!(scan_avd_home(&missing).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discover_marks_running_avd_as_booted() {
        let home = tempdir().unwrap();
        write_avd(home.path(), "Pixel_6_API_33", "Pixel 6", "android-33");
        write_avd(home.path(), "Nexus_5X_API_29", "Nexus 5X", "android-29");

        let runner = Arc::new(ScriptedRunner::new());
        runner.script_stdout(
            "adb devices -l",
            "List of devices attached\nemulator-5554 device model:sdk_gphone64\n",
        );
        runner.script_stdout("adb -s emulator-5554 emu avd name", "Pixel_6_API_33\nOK\n");

        let driver = driver(runner, home.path());
        let seeds = driver.discover().await.unwrap();

        let pixel = seeds.iter().find(|s| s.id == "Pixel_6_API_33").unwrap();
        assert_eq!(pixel.state, DeviceState::Booted);
        let nexus = seeds.iter().find(|s| s.id == "Nexus_5X_API_29").unwrap();
        assert_eq!(nexus.state, DeviceState::Shutdown);
    }

    #[tokio::test]
    async fn test_boot_allocates_sequential_ports() {
        let home = tempdir().unwrap();
        write_avd(home.path(), "Pixel_6_API_33", "Pixel 6", "android-33");

        let runner = Arc::new(ScriptedRunner::new());
        let driver = driver(Arc::clone(&runner), home.path());

        let record_a = test_record("Pixel_6_API_33");
        let record_b = test_record("Nexus_5X_API_29");
        let handle_a = driver.boot(&record_a).await.unwrap();
        let handle_b = driver.boot(&record_b).await.unwrap();
        assert!(handle_a.is_some());
        assert!(handle_b.is_some());

        let invocations = runner.invocations();
        assert!(invocations[0].join(" ").contains("-port 5554"));
        assert!(invocations[1].join(" ").contains("-port 5556"));
    }

    #[tokio::test]
    async fn test_orphaned_emulator_is_interrupted() {
        let home = tempdir().unwrap();
        write_avd(home.path(), "Pixel_6_API_33", "Pixel 6", "android-33");

        let runner = Arc::new(ScriptedRunner::new());
        let driver = driver(Arc::clone(&runner), home.path());

        // Boot so the driver tracks a process on port 5554
        let record = test_record("Pixel_6_API_33");
        driver.boot(&record).await.unwrap();
        let spawned = runner.spawned();
        assert_eq!(spawned.len(), 1);

        // The running row answers the console with no AVD name
        runner.script_stdout(
            "adb devices -l",
            "List of devices attached\nemulator-5554 device\n",
        );
        runner.script_stdout("adb -s emulator-5554 emu avd name", "OK\n");

        driver.discover().await.unwrap();
        assert!(spawned[0].was_interrupted());
    }

    #[tokio::test]
    async fn test_unknown_running_emulator_is_left_alone() {
        let home = tempdir().unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.script_stdout(
            "adb devices -l",
            "List of devices attached\nemulator-5582 device\n",
        );
        runner.script_stdout("adb -s emulator-5582 emu avd name", "OK\n");

        let driver = driver(Arc::clone(&runner), home.path());
        driver.discover().await.unwrap();
        assert!(runner.spawned().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_uses_console_kill() {
        let home = tempdir().unwrap();
        write_avd(home.path(), "Pixel_6_API_33", "Pixel 6", "android-33");

        let runner = Arc::new(ScriptedRunner::new());
        runner.script_stdout("adb -s emulator-5554 emu kill", "OK: killing emulator\n");

        let driver = driver(Arc::clone(&runner), home.path());
        let record = test_record("Pixel_6_API_33");
        driver.boot(&record).await.unwrap();

        driver.shutdown(&record).await.unwrap();
        assert_eq!(runner.count_matching("adb -s emulator-5554 emu kill"), 1);
    }

    #[tokio::test]
    async fn test_is_booted_via_boot_completed() {
        let home = tempdir().unwrap();
        write_avd(home.path(), "Pixel_6_API_33", "Pixel 6", "android-33");

        let runner = Arc::new(ScriptedRunner::new());
        runner.script_stdout(
            "adb -s emulator-5554 shell getprop sys.boot_completed",
            "1\n",
        );

        let driver = driver(runner, home.path());
        let record = test_record("Pixel_6_API_33");
        driver.boot(&record).await.unwrap();

        assert!(driver.is_booted(&record).await.unwrap());
    }

    #[tokio::test]
    async fn test_is_booted_false_when_not_running() {
        let home = tempdir().unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        runner.script_stdout("adb devices -l", "List of devices attached\n");

        let driver = driver(runner, home.path());
        let record = test_record("Pixel_6_API_33");
        assert!(!driver.is_booted(&record).await.unwrap());
    }

    #[tokio::test]
    async fn test_restart_resets_boot_flag() {
        let home = tempdir().unwrap();
        write_avd(home.path(), "Pixel_6_API_33", "Pixel 6", "android-33");

        let runner = Arc::new(ScriptedRunner::new());
        runner.script_stdout("adb -s emulator-5554 shell setprop sys.boot_completed 0", "");
        runner.script_stdout("adb -s emulator-5554 shell stop", "");
        runner.script_stdout("adb -s emulator-5554 shell start", "");

        let driver = driver(Arc::clone(&runner), home.path());
        let record = test_record("Pixel_6_API_33");
        driver.boot(&record).await.unwrap();

        driver.restart(&record).await.unwrap();
        assert_eq!(
            runner.count_matching("adb -s emulator-5554 shell setprop sys.boot_completed 0"),
            1
        );
    }
}
