//! Runtime construction and driver loading
//!
//! All process-wide state of the control plane lives in one [`Runtime`]
//! value built at startup: the configuration, the session registry, the
//! event channel, and the device registry with its drivers. Tests build a
//! fresh runtime with mock drivers instead of touching globals.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;

use devicelab_core::config::Config;
use devicelab_core::driver::{
    DeviceDriver, ANDROID_EMULATOR, ANDROID_PHYSICAL, IOS_PHYSICAL, IOS_SIMULATOR,
};
use devicelab_core::events::DeviceEvent;
use devicelab_core::prelude::*;
use devicelab_core::session::SessionRegistry;
use devicelab_core::storage::storage_root;

use devicelab_drivers::android::emulator::avd_home;
use devicelab_drivers::runner::{ProcessRunner, TokioRunner};
use devicelab_drivers::{
    AndroidEmulatorDriver, AndroidPhysicalDriver, IosPhysicalDriver, IosSimulatorDriver,
    ToolAvailability,
};

use crate::device::Device;
use crate::registry::DeviceRegistry;

/// Capacity of the device event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Builder for a [`Runtime`]
pub struct RuntimeBuilder {
    config: Config,
    runner: Option<Arc<dyn ProcessRunner>>,
    extra_drivers: Vec<Arc<dyn DeviceDriver>>,
    storage_base: Option<PathBuf>,
}

impl RuntimeBuilder {
    pub fn new(config: Config) -> Self {
        RuntimeBuilder {
            config,
            runner: None,
            extra_drivers: Vec::new(),
            storage_base: None,
        }
    }

    /// Swap the subprocess layer (tests use a scripted runner)
    pub fn runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Register a custom driver alongside the configured built-ins
    pub fn register_driver(mut self, driver: Arc<dyn DeviceDriver>) -> Self {
        self.extra_drivers.push(driver);
        self
    }

    /// Relocate device storage (tests point this at a temp dir)
    pub fn storage_base(mut self, base: PathBuf) -> Self {
        self.storage_base = Some(base);
        self
    }

    /// Build the runtime, loading every configured driver.
    ///
    /// An unrecognized driver identifier fails here with `DriverInvalid`.
    pub async fn build(self) -> Result<Runtime> {
        let runner: Arc<dyn ProcessRunner> =
            self.runner.unwrap_or_else(|| Arc::new(TokioRunner::new()));

        let needs_android = self
            .config
            .drivers
            .iter()
            .any(|name| name == ANDROID_EMULATOR || name == ANDROID_PHYSICAL);
        let tools = if needs_android {
            ToolAvailability::check(&runner).await
        } else {
            ToolAvailability::default()
        };

        let mut drivers: Vec<Arc<dyn DeviceDriver>> = Vec::new();
        for name in &self.config.drivers {
            drivers.push(build_driver(name, &runner, &tools)?);
        }
        drivers.extend(self.extra_drivers);

        let sessions = Arc::new(SessionRegistry::new(self.config.session_ttl()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let storage_base = self.storage_base.unwrap_or_else(storage_root);

        let registry = DeviceRegistry::new(
            drivers,
            Arc::clone(&sessions),
            events.clone(),
            storage_base,
        );

        info!(
            drivers = ?registry.driver_names(),
            session_ttl_ms = self.config.device_session_timeout,
            "runtime ready"
        );

        Ok(Runtime {
            config: self.config,
            sessions,
            events,
            registry: Arc::new(registry),
            tools,
        })
    }
}

/// Map a configured driver identifier to its implementation
fn build_driver(
    name: &str,
    runner: &Arc<dyn ProcessRunner>,
    tools: &ToolAvailability,
) -> Result<Arc<dyn DeviceDriver>> {
    match name {
        IOS_SIMULATOR => Ok(Arc::new(IosSimulatorDriver::new(Arc::clone(runner)))),
        IOS_PHYSICAL => Ok(Arc::new(IosPhysicalDriver::new(Arc::clone(runner)))),
        ANDROID_EMULATOR => Ok(Arc::new(AndroidEmulatorDriver::with_programs(
            Arc::clone(runner),
            tools.adb_command(),
            tools.emulator_command(),
            avd_home(),
        ))),
        ANDROID_PHYSICAL => Ok(Arc::new(AndroidPhysicalDriver::with_program(
            Arc::clone(runner),
            tools.adb_command(),
        ))),
        other => Err(Error::driver_invalid(format!(
            "unknown driver identifier: {}",
            other
        ))),
    }
}

/// Process-wide state of the control plane
pub struct Runtime {
    config: Config,
    sessions: Arc<SessionRegistry>,
    events: broadcast::Sender<DeviceEvent>,
    registry: Arc<DeviceRegistry>,
    tools: ToolAvailability,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn builder(config: Config) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    /// Build with defaults: configured drivers over the real subprocess layer
    pub async fn new(config: Config) -> Result<Self> {
        RuntimeBuilder::new(config).build().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tools(&self) -> &ToolAvailability {
        &self.tools
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Discover devices across every driver (see [`DeviceRegistry::discover`])
    pub async fn discover(&self, only_available: bool, list_only: bool) -> Result<Vec<Device>> {
        self.registry.discover(only_available, list_only).await
    }

    pub fn devices_with_name(&self, name: &str) -> Vec<Device> {
        self.registry.devices_with_name(name)
    }

    pub fn device_with_id(&self, id: &str) -> Option<Device> {
        self.registry.device_with_id(id)
    }

    /// Subscribe to device events (instrument terminations)
    pub fn subscribe_events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// The session registry backing every device of this runtime
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }
}
