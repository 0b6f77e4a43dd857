//! Android physical-device driver
//!
//! Physical handsets are the non-emulator rows of `adb devices`; the serial
//! doubles as the device id. Power is out of reach over adb, but app
//! management, input, and rotation ride the same shell surface as the
//! emulator.

use async_trait::async_trait;
use std::sync::Arc;

use devicelab_core::device::{
    DeviceKind, DeviceMetrics, DeviceRecord, DeviceState, Orientation, Platform,
};
use devicelab_core::driver::{
    DeviceDriver, DeviceSeed, KeyAction, ManagedProcess, ANDROID_PHYSICAL,
};
use devicelab_core::prelude::*;

use crate::android::adb::Adb;
use crate::runner::ProcessRunner;

const KEYCODE_HOME: u32 = 3;
const KEYCODE_POWER: u32 = 26;

/// Physical-device driver backed by adb
pub struct AndroidPhysicalDriver {
    runner: Arc<dyn ProcessRunner>,
    adb: Adb,
}

impl AndroidPhysicalDriver {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self::with_program(runner, "adb")
    }

    pub fn with_program(runner: Arc<dyn ProcessRunner>, adb_program: impl Into<String>) -> Self {
        AndroidPhysicalDriver {
            adb: Adb::new(Arc::clone(&runner), adb_program),
            runner,
        }
    }

    fn unsupported(&self, op: &str, device: &DeviceRecord) -> Error {
        Error::process(format!(
            "{} is not supported on physical Android device {}",
            op, device.id
        ))
    }
}

#[async_trait]
impl DeviceDriver for AndroidPhysicalDriver {
    fn name(&self) -> &str {
        ANDROID_PHYSICAL
    }

    fn platform(&self) -> Platform {
        Platform::Android
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Physical
    }

    async fn discover(&self) -> Result<Vec<DeviceSeed>> {
        let rows = self.adb.devices().await?;

        let mut seeds = Vec::new();
        for row in rows.into_iter().filter(|r| !r.is_emulator()) {
            if !row.is_usable() {
                debug!(serial = %row.serial, state = %row.state, "skipping unusable device");
                continue;
            }

            let model = match &row.model {
                Some(model) => model.replace('_', " "),
                None => self
                    .adb
                    .getprop(&row.serial, "ro.product.model")
                    .await
                    .unwrap_or_default(),
            };
            let sdk = self
                .adb
                .getprop(&row.serial, "ro.build.version.sdk")
                .await
                .map(|level| format!("android-{}", level))
                .unwrap_or_default();

            let name = if model.is_empty() {
                row.serial.clone()
            } else {
                model.clone()
            };

            let mut seed = DeviceSeed::new(&row.serial, name, Platform::Android, DeviceKind::Physical)
                .with_sdk(sdk)
                // A row in the "device" state is up by definition
                .with_state(DeviceState::Booted);
            if !model.is_empty() {
                seed = seed.with_model(model);
            }
            seeds.push(seed);
        }
        Ok(seeds)
    }

    async fn boot(&self, device: &DeviceRecord) -> Result<Option<Arc<dyn ManagedProcess>>> {
        Err(self.unsupported("boot", device))
    }

    async fn shutdown(&self, device: &DeviceRecord) -> Result<()> {
        Err(self.unsupported("shutdown", device))
    }

    async fn restart(&self, device: &DeviceRecord) -> Result<()> {
        self.adb.soft_restart(&device.id).await
    }

    async fn is_booted(&self, device: &DeviceRecord) -> Result<bool> {
        Ok(self.adb.boot_completed(&device.id).await.unwrap_or(false))
    }

    async fn install(&self, device: &DeviceRecord, app_path: &str) -> Result<()> {
        self.adb.install(&device.id, app_path).await
    }

    async fn uninstall(&self, device: &DeviceRecord, package: &str) -> Result<()> {
        self.adb.uninstall(&device.id, package).await
    }

    async fn launch(&self, device: &DeviceRecord, package: &str) -> Result<()> {
        self.adb.launch(&device.id, package).await
    }

    async fn read_metrics(&self, device: &DeviceRecord) -> Result<DeviceMetrics> {
        let (width, height) = self.adb.wm_size(&device.id).await?;
        let density = self.adb.wm_density(&device.id).await?;
        Ok(DeviceMetrics {
            width,
            height,
            density,
        })
    }

    async fn read_orientation(&self, device: &DeviceRecord) -> Result<Orientation> {
        self.adb.surface_orientation(&device.id).await
    }

    async fn set_orientation(&self, device: &DeviceRecord, orientation: Orientation) -> Result<()> {
        self.adb.set_user_rotation(&device.id, orientation).await
    }

    async fn key_event(&self, device: &DeviceRecord, action: KeyAction) -> Result<()> {
        match action {
            KeyAction::Code(code) => self.adb.keyevent(&device.id, code).await,
            KeyAction::Home => self.adb.keyevent(&device.id, KEYCODE_HOME).await,
            KeyAction::Lock => self.adb.keyevent(&device.id, KEYCODE_POWER).await,
            KeyAction::Shake => Err(self.unsupported("shake", device)),
        }
    }

    async fn set_hardware_keyboard(&self, device: &DeviceRecord, _connected: bool) -> Result<()> {
        Err(self.unsupported("hardware keyboard toggling", device))
    }

    async fn spawn_instrument(
        &self,
        device: &DeviceRecord,
        instrument: &str,
    ) -> Result<Arc<dyn ManagedProcess>> {
        let argv: Vec<String> = [
            self.adb.program(),
            "-s",
            &device.id,
            "shell",
            "am",
            "instrument",
            "-w",
            instrument,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        self.runner.spawn(&argv, &[]).await
    }
}
