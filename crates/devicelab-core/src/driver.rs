//! The contract concrete device backends implement
//!
//! The coordinator is generic over [`DeviceDriver`]: one driver per device
//! family (iOS simulator, iOS physical, Android emulator, Android physical).
//! Drivers translate the uniform operation surface into OS-specific tool
//! invocations; they never touch sessions, locks, or the state machine.

use async_trait::async_trait;
use std::sync::Arc;

use crate::device::{DeviceKind, DeviceMetrics, DeviceRecord, DeviceState, Orientation, Platform};
use crate::error::{Error, Result};

/// Registered identifier of the iOS simulator driver
pub const IOS_SIMULATOR: &str = "ios-simulator";
/// Registered identifier of the iOS physical-device driver
pub const IOS_PHYSICAL: &str = "ios-physical";
/// Registered identifier of the Android emulator driver
pub const ANDROID_EMULATOR: &str = "android-emulator";
/// Registered identifier of the Android physical-device driver
pub const ANDROID_PHYSICAL: &str = "android-physical";

/// All driver identifiers recognized by the default registry
pub const KNOWN_DRIVERS: [&str; 4] = [
    IOS_SIMULATOR,
    IOS_PHYSICAL,
    ANDROID_EMULATOR,
    ANDROID_PHYSICAL,
];

/// Discovery result for one device, before it is merged into the registry
#[derive(Debug, Clone)]
pub struct DeviceSeed {
    pub id: String,
    pub name: String,
    pub platform: Platform,
    pub kind: DeviceKind,
    pub sdk: String,
    pub model: Option<String>,
    pub state: DeviceState,
    pub metrics: Option<DeviceMetrics>,
    pub orientation: Option<Orientation>,
}

impl DeviceSeed {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        platform: Platform,
        kind: DeviceKind,
    ) -> Self {
        DeviceSeed {
            id: id.into(),
            name: name.into(),
            platform,
            kind,
            sdk: String::new(),
            model: None,
            state: DeviceState::Unknown,
            metrics: None,
            orientation: None,
        }
    }

    pub fn with_sdk(mut self, sdk: impl Into<String>) -> Self {
        self.sdk = sdk.into();
        self
    }

    pub fn with_state(mut self, state: DeviceState) -> Self {
        self.state = state;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Reject seeds missing the identity a device record requires
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::driver_invalid("device seed has an empty id"));
        }
        if self.name.trim().is_empty() {
            return Err(Error::driver_invalid(format!(
                "device seed {} has an empty name",
                self.id
            )));
        }
        Ok(())
    }
}

/// Hardware-key style actions routed through a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    /// Raw platform key code
    Code(u32),
    Home,
    Lock,
    Shake,
}

/// A subprocess the coordinator tracks (instrument attach, emulator boot)
#[async_trait]
pub trait ManagedProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Request termination with SIGINT; must not block on the child
    fn interrupt(&self) -> Result<()>;

    fn has_exited(&self) -> bool;

    /// Await termination, returning the exit code when known
    async fn wait_exit(&self) -> Option<i32>;
}

/// Capability surface a concrete backend implements.
///
/// All per-device operations receive the current record snapshot; drivers
/// read identity and metadata from it but never mutate registry state.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Registered identifier (one of [`KNOWN_DRIVERS`] for built-ins)
    fn name(&self) -> &str;

    fn platform(&self) -> Platform;

    fn kind(&self) -> DeviceKind;

    /// Walk the external tool and return every device of this family
    async fn discover(&self) -> Result<Vec<DeviceSeed>>;

    /// Start the device. Returns a handle when the boot spawned a process
    /// this host should track (Android emulator); `None` when the platform
    /// manages the device process itself (simctl).
    async fn boot(&self, device: &DeviceRecord) -> Result<Option<Arc<dyn ManagedProcess>>>;

    async fn shutdown(&self, device: &DeviceRecord) -> Result<()>;

    /// Platform-specific restart path; drivers without one compose
    /// shutdown + boot internally
    async fn restart(&self, device: &DeviceRecord) -> Result<()>;

    /// One boot-status poll; transient probe failures should surface as
    /// `Ok(false)` so the caller's bounded retry decides the outcome
    async fn is_booted(&self, device: &DeviceRecord) -> Result<bool>;

    async fn install(&self, device: &DeviceRecord, app_path: &str) -> Result<()>;

    async fn uninstall(&self, device: &DeviceRecord, bundle_id: &str) -> Result<()>;

    async fn launch(&self, device: &DeviceRecord, bundle_id: &str) -> Result<()>;

    async fn read_metrics(&self, device: &DeviceRecord) -> Result<DeviceMetrics>;

    async fn read_orientation(&self, device: &DeviceRecord) -> Result<Orientation>;

    async fn set_orientation(&self, device: &DeviceRecord, orientation: Orientation) -> Result<()>;

    async fn key_event(&self, device: &DeviceRecord, action: KeyAction) -> Result<()>;

    async fn set_hardware_keyboard(&self, device: &DeviceRecord, connected: bool) -> Result<()>;

    /// Attach an instrumentation subprocess to a booted device
    async fn spawn_instrument(
        &self,
        device: &DeviceRecord,
        instrument: &str,
    ) -> Result<Arc<dyn ManagedProcess>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_validation() {
        let seed = DeviceSeed::new("UDID-A", "iPhone SE", Platform::Ios, DeviceKind::Simulator);
        assert!(seed.validate().is_ok());

        let seed = DeviceSeed::new("", "iPhone SE", Platform::Ios, DeviceKind::Simulator);
        assert!(matches!(
            seed.validate().unwrap_err(),
            Error::DriverInvalid { .. }
        ));

        let seed = DeviceSeed::new("UDID-A", "  ", Platform::Ios, DeviceKind::Simulator);
        assert!(seed.validate().is_err());
    }

    #[test]
    fn test_seed_builders() {
        let seed = DeviceSeed::new("Pixel_6_API_33", "Pixel 6", Platform::Android, DeviceKind::Simulator)
            .with_sdk("android-33")
            .with_state(DeviceState::Shutdown)
            .with_model("Pixel 6");

        assert_eq!(seed.sdk, "android-33");
        assert_eq!(seed.state, DeviceState::Shutdown);
        assert_eq!(seed.model.as_deref(), Some("Pixel 6"));
    }

    #[test]
    fn test_known_driver_identifiers() {
        assert!(KNOWN_DRIVERS.contains(&IOS_SIMULATOR));
        assert!(KNOWN_DRIVERS.contains(&ANDROID_PHYSICAL));
        assert_eq!(KNOWN_DRIVERS.len(), 4);
    }
}
