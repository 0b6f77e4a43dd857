//! Device handles and the guarded lifecycle operations
//!
//! A [`Device`] is a cheap clone-able handle over the shared per-device
//! state: the canonical record, the driver, the advisory lock, the running
//! instruments, and the tracked emulator process. Every mutating operation
//! runs the same guarded template: session check, lock check, state-machine
//! check, backend call, commit-on-success.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;

use devicelab_core::device::{
    DeviceKind, DeviceRecord, DeviceState, Orientation, Platform, StateEvent,
};
use devicelab_core::driver::{DeviceDriver, DeviceSeed, KeyAction, ManagedProcess};
use devicelab_core::events::DeviceEvent;
use devicelab_core::lockfile::{is_pid_alive, LockFile};
use devicelab_core::prelude::*;
use devicelab_core::session::SessionRegistry;
use devicelab_core::storage::DeviceStorage;

/// Boot polling and settling parameters
#[derive(Debug, Clone, Copy)]
pub struct BootOptions {
    /// Bounded retry: number of `is_booted` polls
    pub attempts: u32,
    /// Delay between polls
    pub interval: Duration,
    /// Post-boot settle delay observed before the boot resolves
    pub settle: Duration,
}

impl BootOptions {
    /// Platform defaults: iOS simulators answer within seconds; Android
    /// emulators can take minutes to report `sys.boot_completed`.
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Ios => BootOptions {
                attempts: 10,
                interval: Duration::from_secs(1),
                settle: Duration::from_secs(3),
            },
            Platform::Android => BootOptions {
                attempts: 180,
                interval: Duration::from_secs(1),
                settle: Duration::ZERO,
            },
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    fn deadline_secs(&self) -> u64 {
        (self.attempts as u64).saturating_mul(self.interval.as_secs().max(1))
    }
}

struct DeviceShared {
    driver: Arc<dyn DeviceDriver>,
    sessions: Arc<SessionRegistry>,
    storage: DeviceStorage,
    lock: LockFile,
    record: RwLock<DeviceRecord>,
    /// Set while a boot or restart is polling; concurrent boots fail fast
    booting: AtomicBool,
    /// instrument id -> running subprocess
    instruments: Arc<Mutex<HashMap<String, Arc<dyn ManagedProcess>>>>,
    /// Emulator process spawned by our boot, interrupted after shutdown
    emulator: Mutex<Option<Arc<dyn ManagedProcess>>>,
    events: broadcast::Sender<DeviceEvent>,
    /// Serializes session-guarded operations on this device
    op_gate: tokio::sync::Mutex<()>,
}

/// Clears the boot-in-progress flag on every exit path
struct BootGuard<'a>(&'a AtomicBool);

impl Drop for BootGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Handle to one controllable device
#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let record = self.record();
        f.debug_struct("Device")
            .field("id", &record.id)
            .field("name", &record.name)
            .field("state", &record.state)
            .finish()
    }
}

impl Device {
    pub(crate) fn from_seed(
        seed: &DeviceSeed,
        driver: Arc<dyn DeviceDriver>,
        sessions: Arc<SessionRegistry>,
        events: broadcast::Sender<DeviceEvent>,
        storage_base: &std::path::Path,
    ) -> Result<Self> {
        let storage = DeviceStorage::create_in(storage_base, &seed.id)?;
        let lock = LockFile::new(&seed.id, storage.local_path());
        let mut record =
            DeviceRecord::new(&seed.id, &seed.name, seed.platform, seed.kind, &storage);
        apply_seed(&mut record, seed);

        Ok(Device {
            shared: Arc::new(DeviceShared {
                driver,
                sessions,
                storage,
                lock,
                record: RwLock::new(record),
                booting: AtomicBool::new(false),
                instruments: Arc::new(Mutex::new(HashMap::new())),
                emulator: Mutex::new(None),
                events,
                op_gate: tokio::sync::Mutex::new(()),
            }),
        })
    }

    // ─────────────────────────────────────────────────────────────
    // Snapshots
    // ─────────────────────────────────────────────────────────────

    /// Copy of the canonical record
    pub fn record(&self) -> DeviceRecord {
        self.shared
            .record
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn id(&self) -> String {
        self.record().id
    }

    pub fn name(&self) -> String {
        self.record().name
    }

    pub fn platform(&self) -> Platform {
        self.record().platform
    }

    pub fn kind(&self) -> DeviceKind {
        self.record().kind
    }

    pub fn state(&self) -> DeviceState {
        self.record().state
    }

    pub fn orientation(&self) -> Orientation {
        self.record().orientation
    }

    fn with_record<R>(&self, f: impl FnOnce(&mut DeviceRecord) -> R) -> R {
        let mut record = self.shared.record.write().unwrap_or_else(|e| e.into_inner());
        f(&mut record)
    }

    /// Available iff no live session exists and the lock is not held by a
    /// live process
    pub fn is_available(&self) -> Result<bool> {
        let id = self.id();
        if self.shared.sessions.active_token(&id).is_some() {
            return Ok(false);
        }
        let status = self.shared.lock.read()?;
        Ok(!(status.locked && is_pid_alive(status.pid)))
    }

    /// Events emitted for this and every other device of the runtime
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.shared.events.subscribe()
    }

    // ─────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────

    /// Begin a session: issue a token and take the inter-process lock
    pub async fn start_session(&self) -> Result<String> {
        let id = self.id();
        let token = self.shared.sessions.create(&id)?;

        if let Err(e) = self.shared.lock.acquire() {
            self.shared.sessions.destroy(&token);
            return Err(e);
        }

        self.with_record(|r| r.current_session = Some(token.clone()));
        info!(device = %id, "session started");
        Ok(token)
    }

    /// End a session: destroy the token and release the lock
    pub async fn end_session(&self, token: &str) -> Result<()> {
        let current = self.with_record(|r| r.current_session.clone());
        if current.as_deref() != Some(token) {
            return Err(Error::invalid_session("token does not match this device"));
        }

        self.shared.sessions.destroy(token);
        self.with_record(|r| r.current_session = None);
        self.shared.lock.release()?;
        info!(device = %self.id(), "session ended");
        Ok(())
    }

    /// The guarded template's first two steps: session and lock
    fn guard(&self, token: &str) -> Result<()> {
        self.verify_session(token)?;
        self.verify_lock_held()
    }

    /// Step 1: the provided token must match the device's live session
    fn verify_session(&self, token: &str) -> Result<()> {
        let (id, current) = {
            let record = self.shared.record.read().unwrap_or_else(|e| e.into_inner());
            (record.id.clone(), record.current_session.clone())
        };

        if !self
            .shared
            .sessions
            .compare_and_validate(current.as_deref(), token)
        {
            // Sweep a stale recorded token so the device can be re-acquired
            if self.shared.sessions.active_token(&id).is_none() {
                self.with_record(|r| r.current_session = None);
            }
            return Err(Error::invalid_session(format!(
                "token does not authorize operations on {}",
                id
            )));
        }
        Ok(())
    }

    /// Step 2: the file lock must already be held by this process.
    /// Guarded operations never take the lock themselves; that happens at
    /// `start_session` and `boot`.
    fn verify_lock_held(&self) -> Result<()> {
        if self.shared.lock.held_by_self()? {
            return Ok(());
        }
        let status = self.shared.lock.read()?;
        Err(Error::device_locked(self.id(), status.pid))
    }

    fn require_booted(&self) -> Result<DeviceRecord> {
        let record = self.record();
        if record.state != DeviceState::Booted {
            return Err(Error::not_booted(&record.id));
        }
        Ok(record)
    }

    // ─────────────────────────────────────────────────────────────
    // Boot / shutdown / restart
    // ─────────────────────────────────────────────────────────────

    /// Boot the device and wait until the backend reports it ready.
    ///
    /// No session is required, but a provided token must be valid, and a
    /// device with an active session only boots for its holder. Exactly one
    /// boot per device runs at a time; concurrent callers fail fast with
    /// `DeviceNotReady`.
    pub async fn boot(&self, session: Option<&str>, options: BootOptions) -> Result<()> {
        let record = self.record();
        let id = record.id.clone();

        match (&record.current_session, session) {
            (Some(current), provided) => {
                let provided = provided.unwrap_or_default();
                if !self
                    .shared
                    .sessions
                    .compare_and_validate(Some(current.as_str()), provided)
                {
                    return Err(Error::invalid_session(format!(
                        "device {} is session-guarded",
                        id
                    )));
                }
            }
            (None, Some(token)) => {
                if !self.shared.sessions.validate(token) {
                    return Err(Error::invalid_session("unknown or expired token"));
                }
            }
            (None, None) => {}
        }

        self.shared.lock.acquire()?;

        if self.shared.booting.swap(true, Ordering::AcqRel) {
            return Err(Error::not_ready(&id));
        }
        let _boot_guard = BootGuard(&self.shared.booting);

        // Re-read now that we own the boot guard; the entry snapshot may
        // predate a boot that just finished.
        match self.state() {
            DeviceState::Booted => return Err(Error::already_booted(&id)),
            DeviceState::Booting => return Err(Error::not_ready(&id)),
            state => {
                let next = state.apply(StateEvent::Boot)?;
                self.with_record(|r| r.state = next);
            }
        }

        info!(device = %id, "booting");
        let snapshot = self.record();
        match self.shared.driver.boot(&snapshot).await {
            Ok(handle) => {
                if let Some(handle) = handle {
                    *self.shared.emulator.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                }
            }
            Err(e) => {
                self.with_record(|r| r.state = DeviceState::Errored);
                return Err(e);
            }
        }

        self.await_booted(&id, options).await?;
        self.finish_boot(&id, options).await;
        Ok(())
    }

    /// Bounded retry against the backend's boot probe. The final attempt's
    /// result governs the outcome.
    async fn await_booted(&self, id: &str, options: BootOptions) -> Result<()> {
        let snapshot = self.record();
        for attempt in 1..=options.attempts {
            match self.shared.driver.is_booted(&snapshot).await {
                Ok(true) => {
                    debug!(device = %id, attempt, "boot probe succeeded");
                    return Ok(());
                }
                Ok(false) => {}
                // One failed probe is a poll miss, not a boot failure
                Err(e) => debug!(device = %id, attempt, "boot probe error: {}", e),
            }
            if attempt < options.attempts {
                tokio::time::sleep(options.interval).await;
            }
        }

        self.with_record(|r| r.state = DeviceState::Errored);
        Err(Error::boot_timeout(id, options.deadline_secs()))
    }

    /// Post-boot settle, metrics refresh, and the Booted commit
    async fn finish_boot(&self, id: &str, options: BootOptions) {
        if !options.settle.is_zero() {
            tokio::time::sleep(options.settle).await;
        }

        let snapshot = self.record();
        match self.shared.driver.read_metrics(&snapshot).await {
            Ok(metrics) => self.with_record(|r| r.apply_metrics(metrics)),
            Err(e) => warn!(device = %id, "could not read metrics after boot: {}", e),
        }
        match self.shared.driver.read_orientation(&snapshot).await {
            Ok(orientation) => self.with_record(|r| r.orientation = orientation),
            Err(e) => debug!(device = %id, "could not read orientation after boot: {}", e),
        }

        self.with_record(|r| r.state = DeviceState::Booted);
        info!(device = %id, "booted");
    }

    /// Shut the device down. Instruments are stopped best-effort first; a
    /// tracked emulator process gets SIGINT after the backend confirms.
    pub async fn shutdown(&self, token: &str) -> Result<()> {
        let _op = self.shared.op_gate.lock().await;
        self.verify_session(token)?;

        let record = self.record();
        let id = record.id.clone();

        // Shutting down an already-shutdown device resolves the intent
        // without touching the released lock
        if record.state == DeviceState::Shutdown {
            return Ok(());
        }
        self.verify_lock_held()?;

        let next = record.state.apply(StateEvent::Shutdown)?;
        self.with_record(|r| r.state = next);

        self.stop_instruments_inner().await;

        let snapshot = self.record();
        if let Err(e) = self.shared.driver.shutdown(&snapshot).await {
            // Failure leaves the device where it was
            self.with_record(|r| r.state = DeviceState::Booted);
            return Err(e);
        }

        let emulator = self
            .shared
            .emulator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = emulator {
            if let Err(e) = handle.interrupt() {
                warn!(device = %id, "failed to interrupt emulator process: {}", e);
            }
        }

        self.with_record(|r| r.state = DeviceState::Shutdown);
        self.shared.lock.release()?;
        info!(device = %id, "shut down");
        Ok(())
    }

    /// Restart in place and re-await boot readiness
    pub async fn restart(&self, token: &str, options: BootOptions) -> Result<()> {
        let _op = self.shared.op_gate.lock().await;
        self.guard(token)?;

        let record = self.require_booted()?;
        let id = record.id.clone();

        if self.shared.booting.swap(true, Ordering::AcqRel) {
            return Err(Error::not_ready(&id));
        }
        let _boot_guard = BootGuard(&self.shared.booting);

        let next = record.state.apply(StateEvent::Restart)?;
        self.with_record(|r| r.state = next);

        let snapshot = self.record();
        if let Err(e) = self.shared.driver.restart(&snapshot).await {
            self.with_record(|r| r.state = DeviceState::Errored);
            return Err(e);
        }

        self.await_booted(&id, options).await?;
        self.finish_boot(&id, options).await;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // App control
    // ─────────────────────────────────────────────────────────────

    pub async fn install(&self, token: &str, app_path: &str) -> Result<()> {
        let _op = self.shared.op_gate.lock().await;
        require_arg("appPath", app_path)?;
        self.guard(token)?;
        let record = self.require_booted()?;
        self.shared.driver.install(&record, app_path).await
    }

    pub async fn uninstall(&self, token: &str, bundle_id: &str) -> Result<()> {
        let _op = self.shared.op_gate.lock().await;
        require_arg("bundleId", bundle_id)?;
        self.guard(token)?;
        let record = self.require_booted()?;
        self.shared.driver.uninstall(&record, bundle_id).await
    }

    pub async fn launch(&self, token: &str, bundle_id: &str) -> Result<()> {
        let _op = self.shared.op_gate.lock().await;
        require_arg("bundleId", bundle_id)?;
        self.guard(token)?;
        let record = self.require_booted()?;
        self.shared.driver.launch(&record, bundle_id).await
    }

    // ─────────────────────────────────────────────────────────────
    // Orientation
    // ─────────────────────────────────────────────────────────────

    pub async fn rotate_left(&self, token: &str) -> Result<Orientation> {
        let target = self.orientation().rotated_left();
        self.rotate_to(token, target).await
    }

    pub async fn rotate_right(&self, token: &str) -> Result<Orientation> {
        let target = self.orientation().rotated_right();
        self.rotate_to(token, target).await
    }

    /// Optimistically commit the new orientation, reverting if the backend
    /// rejects the rotation
    pub async fn rotate_to(&self, token: &str, target: Orientation) -> Result<Orientation> {
        let _op = self.shared.op_gate.lock().await;
        self.guard(token)?;
        let before = self.require_booted()?;

        self.with_record(|r| r.orientation = target);
        if let Err(e) = self.shared.driver.set_orientation(&before, target).await {
            self.with_record(|r| r.orientation = before.orientation);
            return Err(e);
        }
        Ok(target)
    }

    // ─────────────────────────────────────────────────────────────
    // Keys
    // ─────────────────────────────────────────────────────────────

    pub async fn perform_key_event(&self, token: &str, code: u32) -> Result<()> {
        self.key_action(token, KeyAction::Code(code)).await
    }

    pub async fn press_home_key(&self, token: &str) -> Result<()> {
        self.key_action(token, KeyAction::Home).await
    }

    pub async fn lock_screen(&self, token: &str) -> Result<()> {
        self.key_action(token, KeyAction::Lock).await
    }

    pub async fn shake_screen(&self, token: &str) -> Result<()> {
        self.key_action(token, KeyAction::Shake).await
    }

    async fn key_action(&self, token: &str, action: KeyAction) -> Result<()> {
        let _op = self.shared.op_gate.lock().await;
        self.guard(token)?;
        let record = self.require_booted()?;
        self.shared.driver.key_event(&record, action).await
    }

    pub async fn set_hardware_keyboard_connected(&self, token: &str, connected: bool) -> Result<()> {
        let _op = self.shared.op_gate.lock().await;
        self.guard(token)?;
        let record = self.require_booted()?;
        self.shared
            .driver
            .set_hardware_keyboard(&record, connected)
            .await
    }

    // ─────────────────────────────────────────────────────────────
    // Instruments
    // ─────────────────────────────────────────────────────────────

    /// Attach an instrument subprocess. Its id must be unique among the
    /// device's running instruments.
    pub async fn start_instrument(&self, token: &str, instrument: &str) -> Result<()> {
        let _op = self.shared.op_gate.lock().await;
        require_arg("instrument", instrument)?;
        self.guard(token)?;
        let record = self.require_booted()?;

        {
            let instruments = self
                .shared
                .instruments
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if instruments.contains_key(instrument) {
                return Err(Error::argument(format!(
                    "instrument {} is already running on {}",
                    instrument, record.id
                )));
            }
        }

        let handle = self.shared.driver.spawn_instrument(&record, instrument).await?;
        self.shared
            .instruments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instrument.to_string(), Arc::clone(&handle));

        // Watch for unscheduled exits; a handle still in the map when the
        // process dies was not stopped by the caller.
        let instruments = Arc::clone(&self.shared.instruments);
        let events = self.shared.events.clone();
        let device_id = record.id.clone();
        let instrument_id = instrument.to_string();
        tokio::spawn(async move {
            let exit_code = handle.wait_exit().await;
            let unscheduled = {
                let mut map = instruments.lock().unwrap_or_else(|e| e.into_inner());
                match map.get(&instrument_id) {
                    Some(current) if Arc::ptr_eq(current, &handle) => {
                        map.remove(&instrument_id);
                        true
                    }
                    _ => false,
                }
            };
            if unscheduled {
                warn!(
                    device = %device_id,
                    instrument = %instrument_id,
                    ?exit_code,
                    "instrument terminated unexpectedly"
                );
                let _ = events.send(DeviceEvent::instrument_terminated(
                    device_id,
                    instrument_id,
                    exit_code,
                ));
            }
        });

        Ok(())
    }

    /// Stop one instrument with SIGINT and forget it
    pub async fn stop_instrument(&self, token: &str, instrument: &str) -> Result<()> {
        let _op = self.shared.op_gate.lock().await;
        self.guard(token)?;

        let handle = self
            .shared
            .instruments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(instrument);
        match handle {
            Some(handle) => handle.interrupt(),
            None => Err(Error::argument(format!(
                "no instrument {} running on {}",
                instrument,
                self.id()
            ))),
        }
    }

    /// Stop every running instrument
    pub async fn stop_all_instruments(&self, token: &str) -> Result<()> {
        let _op = self.shared.op_gate.lock().await;
        self.guard(token)?;
        self.stop_instruments_inner().await;
        Ok(())
    }

    async fn stop_instruments_inner(&self) {
        let drained: Vec<(String, Arc<dyn ManagedProcess>)> = {
            let mut map = self
                .shared
                .instruments
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            map.drain().collect()
        };
        for (id, handle) in drained {
            if let Err(e) = handle.interrupt() {
                warn!(instrument = %id, "failed to interrupt instrument: {}", e);
            }
        }
    }

    /// Number of instruments currently attached (observability)
    pub fn running_instruments(&self) -> usize {
        self.shared
            .instruments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    // ─────────────────────────────────────────────────────────────
    // Storage
    // ─────────────────────────────────────────────────────────────

    /// Wipe the device's storage directory. Refused while the device is
    /// booted (or booting) or its lock is held by a live process.
    pub fn purge_local_storage(&self) -> Result<()> {
        self.ensure_purgeable()?;
        self.shared.storage.purge_local()
    }

    /// Wipe the scratch area, with the same guards
    pub fn purge_temp_storage(&self) -> Result<()> {
        self.ensure_purgeable()?;
        self.shared.storage.purge_temp()
    }

    fn ensure_purgeable(&self) -> Result<()> {
        let record = self.record();
        if matches!(record.state, DeviceState::Booted | DeviceState::Booting) {
            return Err(Error::process(format!(
                "cannot purge storage of {} while it is running",
                record.id
            )));
        }
        let status = self.shared.lock.read()?;
        if status.locked && is_pid_alive(status.pid) {
            return Err(Error::device_locked(&record.id, status.pid));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Discovery merge
    // ─────────────────────────────────────────────────────────────

    /// Refresh mutable fields from a fresh discovery seed
    pub(crate) fn refresh_from_seed(&self, seed: &DeviceSeed) {
        // A walk racing our own boot must not flip the state under us
        let booting = self.shared.booting.load(Ordering::Acquire);
        self.with_record(|record| {
            record.name = seed.name.clone();
            if !seed.sdk.is_empty() {
                record.sdk = seed.sdk.clone();
            }
            if seed.model.is_some() {
                record.model = seed.model.clone();
            }
            if let Some(metrics) = seed.metrics {
                record.apply_metrics(metrics);
            }
            if let Some(orientation) = seed.orientation {
                record.orientation = orientation;
            }
            if !booting {
                let event = if record.state == DeviceState::Unknown {
                    StateEvent::Discover(seed.state)
                } else {
                    StateEvent::DiscoverRefresh(seed.state)
                };
                if let Ok(next) = record.state.apply(event) {
                    record.state = next;
                }
            }
        });
    }
}

fn apply_seed(record: &mut DeviceRecord, seed: &DeviceSeed) {
    record.sdk = seed.sdk.clone();
    record.model = seed.model.clone();
    if let Some(metrics) = seed.metrics {
        record.apply_metrics(metrics);
    }
    if let Some(orientation) = seed.orientation {
        record.orientation = orientation;
    }
    if let Ok(next) = record.state.apply(StateEvent::Discover(seed.state)) {
        record.state = next;
    }
}

fn require_arg(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::argument(format!(
            "{} must be a non-empty string",
            name
        )));
    }
    Ok(())
}
