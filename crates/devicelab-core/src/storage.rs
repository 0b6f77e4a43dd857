//! Per-device on-disk storage layout
//!
//! Every device owns `<home>/.DeviceStorage/<md5(id)>/` with a `temp/`
//! scratch area and the advisory `.lock` file. Directories are created when
//! the record is constructed, before any other component touches them.

use std::path::{Path, PathBuf};

use crate::error::Result;

/// Directory name under the user home that holds all device storage
const STORAGE_DIR_NAME: &str = ".DeviceStorage";

/// Name of the scratch subdirectory inside each device's storage
const TEMP_DIR_NAME: &str = "temp";

/// Resolve the storage root: `$USER_HOME/.DeviceStorage`
///
/// `USER_HOME` takes precedence so lab hosts can relocate storage without
/// touching the real home directory; otherwise the platform home is used.
pub fn storage_root() -> PathBuf {
    let home = std::env::var("USER_HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(STORAGE_DIR_NAME)
}

/// Storage layout for one device
#[derive(Debug, Clone)]
pub struct DeviceStorage {
    local: PathBuf,
    temp: PathBuf,
}

impl DeviceStorage {
    /// Create (or reuse) the storage layout for a device under the default root
    pub fn create(device_id: &str) -> Result<Self> {
        Self::create_in(&storage_root(), device_id)
    }

    /// Create (or reuse) the storage layout under an explicit base directory
    pub fn create_in(base: &Path, device_id: &str) -> Result<Self> {
        let local = base.join(format!("{:x}", md5::compute(device_id)));
        let temp = local.join(TEMP_DIR_NAME);
        std::fs::create_dir_all(&temp)?;
        Ok(DeviceStorage { local, temp })
    }

    pub fn local_path(&self) -> &Path {
        &self.local
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Remove everything under the device directory and recreate `temp/`.
    ///
    /// Callers must have verified the device is neither booted nor locked.
    pub fn purge_local(&self) -> Result<()> {
        if self.local.exists() {
            std::fs::remove_dir_all(&self.local)?;
        }
        std::fs::create_dir_all(&self.temp)?;
        Ok(())
    }

    /// Empty the scratch area, recreating it afterward
    pub fn purge_temp(&self) -> Result<()> {
        if self.temp.exists() {
            std::fs::remove_dir_all(&self.temp)?;
        }
        std::fs::create_dir_all(&self.temp)?;
        Ok(())
    }
}
