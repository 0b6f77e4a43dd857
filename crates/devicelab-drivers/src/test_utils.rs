//! Test doubles for drivers and subprocess execution
//!
//! [`ScriptedRunner`] replays canned command outputs and records every
//! invocation, so tests can assert how many walks actually hit the external
//! tools. [`FakeProcess`] is a manually-completed process handle, and
//! [`MockDriver`] is a fully scriptable backend for coordinator tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use devicelab_core::device::{DeviceKind, DeviceMetrics, DeviceRecord, Orientation, Platform};
use devicelab_core::driver::{DeviceDriver, DeviceSeed, KeyAction, ManagedProcess};
use devicelab_core::prelude::*;

use crate::runner::{CommandOutput, ProcessRunner};

/// Scripted response for one command invocation
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Ok(CommandOutput),
    NonZeroExit { code: Option<i32>, stderr: String },
    SpawnFailed(String),
}

impl ScriptedOutcome {
    pub fn stdout(stdout: impl Into<String>) -> Self {
        ScriptedOutcome::Ok(CommandOutput {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }

    fn into_result(self, command: &str) -> Result<CommandOutput> {
        match self {
            ScriptedOutcome::Ok(output) => Ok(output),
            ScriptedOutcome::NonZeroExit { code, stderr } => {
                Err(Error::non_zero_exit(command, code, stderr))
            }
            ScriptedOutcome::SpawnFailed(reason) => Err(Error::spawn_failed(reason)),
        }
    }
}

#[derive(Default)]
struct ScriptState {
    /// Keyed by a prefix of the space-joined argv; longest prefix wins.
    /// A queue with multiple entries replays them in order; the last entry
    /// is sticky.
    responses: HashMap<String, VecDeque<ScriptedOutcome>>,
    invocations: Vec<Vec<String>>,
    spawned: Vec<Arc<FakeProcess>>,
}

/// A [`ProcessRunner`] that never touches the OS
#[derive(Default)]
pub struct ScriptedRunner {
    state: Mutex<ScriptState>,
    /// Artificial latency per `run`, to widen concurrency windows in tests
    delay: Mutex<Option<Duration>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a successful invocation for commands starting with `prefix`
    pub fn script_stdout(&self, prefix: &str, stdout: &str) {
        self.script(prefix, ScriptedOutcome::stdout(stdout));
    }

    pub fn script(&self, prefix: &str, outcome: ScriptedOutcome) {
        let mut state = self.state.lock().unwrap();
        state
            .responses
            .entry(prefix.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Every argv this runner has executed, in order
    pub fn invocations(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().invocations.clone()
    }

    /// Number of executed commands whose joined argv starts with `prefix`
    pub fn count_matching(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .invocations
            .iter()
            .filter(|argv| argv.join(" ").starts_with(prefix))
            .count()
    }

    /// Handles produced by `spawn`, in spawn order
    pub fn spawned(&self) -> Vec<Arc<FakeProcess>> {
        self.state.lock().unwrap().spawned.clone()
    }

    fn next_outcome(&self, command: &str) -> Result<ScriptedOutcome> {
        let mut state = self.state.lock().unwrap();

        let key = state
            .responses
            .keys()
            .filter(|prefix| command.starts_with(prefix.as_str()))
            .max_by_key(|prefix| prefix.len())
            .cloned();

        let Some(key) = key else {
            return Err(Error::process(format!("unscripted command: `{}`", command)));
        };

        let queue = state.responses.get_mut(&key).expect("key from keys()");
        let outcome = if queue.len() > 1 {
            queue.pop_front().expect("non-empty queue")
        } else {
            queue.front().cloned().expect("non-empty queue")
        };
        Ok(outcome)
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(
        &self,
        argv: &[String],
        _env: &[(String, String)],
        _deadline: Duration,
    ) -> Result<CommandOutput> {
        let command = argv.join(" ");
        {
            let mut state = self.state.lock().unwrap();
            state.invocations.push(argv.to_vec());
        }

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.next_outcome(&command)?.into_result(&command)
    }

    async fn spawn(
        &self,
        argv: &[String],
        _env: &[(String, String)],
    ) -> Result<Arc<dyn ManagedProcess>> {
        let process = Arc::new(FakeProcess::new());
        let mut state = self.state.lock().unwrap();
        state.invocations.push(argv.to_vec());
        state.spawned.push(Arc::clone(&process));
        Ok(process)
    }
}

/// A manually-completed process handle
pub struct FakeProcess {
    pid: Option<u32>,
    exited: AtomicBool,
    interrupted: AtomicBool,
    exit_code: Mutex<Option<i32>>,
    exit_notify: Notify,
}

impl Default for FakeProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProcess {
    pub fn new() -> Self {
        FakeProcess {
            pid: Some(4242),
            exited: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            exit_code: Mutex::new(None),
            exit_notify: Notify::new(),
        }
    }

    /// Mark the process exited with the given code and wake waiters
    pub fn complete(&self, code: Option<i32>) {
        *self.exit_code.lock().unwrap() = code;
        self.exited.store(true, Ordering::Release);
        self.exit_notify.notify_waiters();
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ManagedProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn interrupt(&self) -> Result<()> {
        self.interrupted.store(true, Ordering::Release);
        if !self.has_exited() {
            self.complete(None);
        }
        Ok(())
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    async fn wait_exit(&self) -> Option<i32> {
        let notified = self.exit_notify.notified();
        if self.has_exited() {
            return *self.exit_code.lock().unwrap();
        }
        notified.await;
        *self.exit_code.lock().unwrap()
    }
}

#[derive(Default)]
struct MockDriverState {
    seeds: Vec<DeviceSeed>,
    booted: HashSet<String>,
    orientations: HashMap<String, Orientation>,
    operations: Vec<String>,
    instruments: Vec<Arc<FakeProcess>>,
    boot_handles: Vec<Arc<FakeProcess>>,
}

/// A scriptable in-memory backend for coordinator tests
pub struct MockDriver {
    name: String,
    platform: Platform,
    kind: DeviceKind,
    state: Mutex<MockDriverState>,
    discover_calls: AtomicUsize,
    discover_delay: Mutex<Option<Duration>>,
    boot_delay: Mutex<Option<Duration>>,
    /// When set, `boot` succeeds but `is_booted` stays false
    boot_never_ready: AtomicBool,
    /// When set, the next `boot` call fails outright
    fail_next_boot: AtomicBool,
    /// When set, every `discover` call fails
    fail_discover: AtomicBool,
    /// When set, `boot` hands back a tracked emulator-style handle
    emit_boot_handle: AtomicBool,
    metrics: Mutex<DeviceMetrics>,
    /// When set, rotation commands fail (for optimistic-revert tests)
    fail_rotation: AtomicBool,
}

impl MockDriver {
    pub fn new(name: &str, platform: Platform, kind: DeviceKind) -> Self {
        MockDriver {
            name: name.to_string(),
            platform,
            kind,
            state: Mutex::default(),
            discover_calls: AtomicUsize::new(0),
            discover_delay: Mutex::new(None),
            boot_delay: Mutex::new(None),
            boot_never_ready: AtomicBool::new(false),
            fail_next_boot: AtomicBool::new(false),
            fail_discover: AtomicBool::new(false),
            emit_boot_handle: AtomicBool::new(false),
            metrics: Mutex::new(DeviceMetrics {
                width: 750,
                height: 1334,
                density: 326,
            }),
            fail_rotation: AtomicBool::new(false),
        }
    }

    /// Shorthand: an iOS simulator driver listing the given seeds
    pub fn ios_simulators(seeds: Vec<DeviceSeed>) -> Self {
        let driver = Self::new("ios-simulator", Platform::Ios, DeviceKind::Simulator);
        driver.set_seeds(seeds);
        driver
    }

    pub fn set_seeds(&self, seeds: Vec<DeviceSeed>) {
        self.state.lock().unwrap().seeds = seeds;
    }

    pub fn set_discover_delay(&self, delay: Duration) {
        *self.discover_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_boot_delay(&self, delay: Duration) {
        *self.boot_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_boot_never_ready(&self, value: bool) {
        self.boot_never_ready.store(value, Ordering::Release);
    }

    pub fn fail_next_boot(&self) {
        self.fail_next_boot.store(true, Ordering::Release);
    }

    pub fn set_fail_discover(&self, value: bool) {
        self.fail_discover.store(value, Ordering::Release);
    }

    pub fn set_emit_boot_handle(&self, value: bool) {
        self.emit_boot_handle.store(value, Ordering::Release);
    }

    pub fn set_fail_rotation(&self, value: bool) {
        self.fail_rotation.store(value, Ordering::Release);
    }

    pub fn discover_calls(&self) -> usize {
        self.discover_calls.load(Ordering::Acquire)
    }

    /// Backend operations in invocation order, e.g. `"install UDID-A /tmp/app.ipa"`
    pub fn operations(&self) -> Vec<String> {
        self.state.lock().unwrap().operations.clone()
    }

    pub fn instruments(&self) -> Vec<Arc<FakeProcess>> {
        self.state.lock().unwrap().instruments.clone()
    }

    pub fn boot_handles(&self) -> Vec<Arc<FakeProcess>> {
        self.state.lock().unwrap().boot_handles.clone()
    }

    pub fn is_marked_booted(&self, id: &str) -> bool {
        self.state.lock().unwrap().booted.contains(id)
    }

    fn record_op(&self, op: String) {
        self.state.lock().unwrap().operations.push(op);
    }
}

#[async_trait]
impl DeviceDriver for MockDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn platform(&self) -> Platform {
        self.platform
    }

    fn kind(&self) -> DeviceKind {
        self.kind
    }

    async fn discover(&self) -> Result<Vec<DeviceSeed>> {
        self.discover_calls.fetch_add(1, Ordering::AcqRel);
        let delay = *self.discover_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_discover.load(Ordering::Acquire) {
            return Err(Error::process("backend discovery failed"));
        }
        let mut seeds = self.state.lock().unwrap().seeds.clone();
        // Devices the coordinator booted are reported as such on re-walks
        let booted: HashSet<String> = self.state.lock().unwrap().booted.clone();
        for seed in &mut seeds {
            if booted.contains(&seed.id) {
                seed.state = devicelab_core::device::DeviceState::Booted;
            }
        }
        Ok(seeds)
    }

    async fn boot(&self, device: &DeviceRecord) -> Result<Option<Arc<dyn ManagedProcess>>> {
        self.record_op(format!("boot {}", device.id));

        if self.fail_next_boot.swap(false, Ordering::AcqRel) {
            return Err(Error::process("backend boot failed"));
        }

        let delay = *self.boot_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if !self.boot_never_ready.load(Ordering::Acquire) {
            self.state
                .lock()
                .unwrap()
                .booted
                .insert(device.id.clone());
        }

        if self.emit_boot_handle.load(Ordering::Acquire) {
            let handle = Arc::new(FakeProcess::new());
            self.state
                .lock()
                .unwrap()
                .boot_handles
                .push(Arc::clone(&handle));
            return Ok(Some(handle));
        }
        Ok(None)
    }

    async fn shutdown(&self, device: &DeviceRecord) -> Result<()> {
        self.record_op(format!("shutdown {}", device.id));
        self.state.lock().unwrap().booted.remove(&device.id);
        Ok(())
    }

    async fn restart(&self, device: &DeviceRecord) -> Result<()> {
        self.record_op(format!("restart {}", device.id));
        Ok(())
    }

    async fn is_booted(&self, device: &DeviceRecord) -> Result<bool> {
        Ok(self.state.lock().unwrap().booted.contains(&device.id))
    }

    async fn install(&self, device: &DeviceRecord, app_path: &str) -> Result<()> {
        self.record_op(format!("install {} {}", device.id, app_path));
        Ok(())
    }

    async fn uninstall(&self, device: &DeviceRecord, bundle_id: &str) -> Result<()> {
        self.record_op(format!("uninstall {} {}", device.id, bundle_id));
        Ok(())
    }

    async fn launch(&self, device: &DeviceRecord, bundle_id: &str) -> Result<()> {
        self.record_op(format!("launch {} {}", device.id, bundle_id));
        if bundle_id == "com.example.missing" {
            return Err(Error::launch_failed(format!(
                "no activities found for {}",
                bundle_id
            )));
        }
        Ok(())
    }

    async fn read_metrics(&self, _device: &DeviceRecord) -> Result<DeviceMetrics> {
        Ok(*self.metrics.lock().unwrap())
    }

    async fn read_orientation(&self, device: &DeviceRecord) -> Result<Orientation> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .orientations
            .get(&device.id)
            .copied()
            .unwrap_or_default())
    }

    async fn set_orientation(&self, device: &DeviceRecord, orientation: Orientation) -> Result<()> {
        self.record_op(format!("rotate {} {}", device.id, orientation.index()));
        if self.fail_rotation.load(Ordering::Acquire) {
            return Err(Error::process("rotation rejected"));
        }
        self.state
            .lock()
            .unwrap()
            .orientations
            .insert(device.id.clone(), orientation);
        Ok(())
    }

    async fn key_event(&self, device: &DeviceRecord, action: KeyAction) -> Result<()> {
        self.record_op(format!("key {} {:?}", device.id, action));
        Ok(())
    }

    async fn set_hardware_keyboard(&self, device: &DeviceRecord, connected: bool) -> Result<()> {
        self.record_op(format!("keyboard {} {}", device.id, connected));
        Ok(())
    }

    async fn spawn_instrument(
        &self,
        device: &DeviceRecord,
        instrument: &str,
    ) -> Result<Arc<dyn ManagedProcess>> {
        self.record_op(format!("instrument {} {}", device.id, instrument));
        let process = Arc::new(FakeProcess::new());
        self.state
            .lock()
            .unwrap()
            .instruments
            .push(Arc::clone(&process));
        Ok(process)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_runner_replays_and_records() {
        let runner = ScriptedRunner::new();
        runner.script_stdout("echo", "scripted");

        let output = runner
            .run(
                &["echo".to_string(), "anything".to_string()],
                &[],
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, "scripted");
        assert_eq!(runner.count_matching("echo"), 1);
    }

    #[tokio::test]
    async fn test_scripted_runner_longest_prefix_wins() {
        let runner = ScriptedRunner::new();
        runner.script_stdout("adb", "generic");
        runner.script_stdout("adb devices", "specific");

        let output = runner
            .run(
                &["adb".to_string(), "devices".to_string()],
                &[],
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, "specific");
    }

    #[tokio::test]
    async fn test_scripted_runner_queue_with_sticky_tail() {
        let runner = ScriptedRunner::new();
        runner.script_stdout("probe", "first");
        runner.script_stdout("probe", "rest");

        let argv = vec!["probe".to_string()];
        let first = runner.run(&argv, &[], Duration::from_secs(1)).await.unwrap();
        let second = runner.run(&argv, &[], Duration::from_secs(1)).await.unwrap();
        let third = runner.run(&argv, &[], Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.stdout, "first");
        assert_eq!(second.stdout, "rest");
        assert_eq!(third.stdout, "rest");
    }

    #[tokio::test]
    async fn test_scripted_runner_unscripted_command_errors() {
        let runner = ScriptedRunner::new();
        let err = runner
            .run(&["mystery".to_string()], &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unscripted"));
    }

    #[tokio::test]
    async fn test_fake_process_lifecycle() {
        let process = FakeProcess::new();
        assert!(!process.has_exited());

        process.complete(Some(0));
        assert!(process.has_exited());
        assert_eq!(process.wait_exit().await, Some(0));
    }

    #[tokio::test]
    async fn test_fake_process_interrupt() {
        let process = FakeProcess::new();
        process.interrupt().unwrap();
        assert!(process.was_interrupted());
        assert!(process.has_exited());
    }

    #[tokio::test]
    async fn test_mock_driver_counts_discoveries() {
        let driver = MockDriver::ios_simulators(vec![DeviceSeed::new(
            "UDID-A",
            "iPhone SE",
            Platform::Ios,
            DeviceKind::Simulator,
        )]);

        driver.discover().await.unwrap();
        driver.discover().await.unwrap();
        assert_eq!(driver.discover_calls(), 2);
    }
}
