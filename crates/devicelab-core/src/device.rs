//! Device records, runtime state machine, and orientation handling
//!
//! A [`DeviceRecord`] is the canonical per-device value: identity, display
//! metadata, screen metrics, storage paths, and the runtime [`DeviceState`].
//! Records are created on first discovery and refreshed in place on every
//! subsequent walk; they are never destroyed for the process lifetime.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::storage::DeviceStorage;

/// Operating system family of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    Ios,
    Android,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Ios => write!(f, "iOS"),
            Platform::Android => write!(f, "Android"),
        }
    }
}

/// Whether a device is a virtual or physical target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Simulator,
    Physical,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Simulator => write!(f, "simulator"),
            DeviceKind::Physical => write!(f, "physical"),
        }
    }
}

/// Runtime state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    Unknown,
    Shutdown,
    Booting,
    Booted,
    ShuttingDown,
    Errored,
}

impl From<&str> for DeviceState {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "shutdown" => DeviceState::Shutdown,
            "booting" => DeviceState::Booting,
            "booted" => DeviceState::Booted,
            "shutting down" => DeviceState::ShuttingDown,
            _ => DeviceState::Unknown,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Unknown => "Unknown",
            DeviceState::Shutdown => "Shutdown",
            DeviceState::Booting => "Booting",
            DeviceState::Booted => "Booted",
            DeviceState::ShuttingDown => "ShuttingDown",
            DeviceState::Errored => "Errored",
        };
        write!(f, "{}", s)
    }
}

/// Events that drive the device state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// First discovery observed the device in the given state
    Discover(DeviceState),
    Boot,
    BootOk,
    BootFail,
    Shutdown,
    ShutdownOk,
    Restart,
    Recover,
    /// A later discovery walk corrected the cached state
    DiscoverRefresh(DeviceState),
}

impl fmt::Display for StateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StateEvent::Discover(_) => "discover",
            StateEvent::Boot => "boot",
            StateEvent::BootOk => "bootOk",
            StateEvent::BootFail => "bootFail",
            StateEvent::Shutdown => "shutdown",
            StateEvent::ShutdownOk => "shutdownOk",
            StateEvent::Restart => "restart",
            StateEvent::Recover => "recover",
            StateEvent::DiscoverRefresh(_) => "discoverRefresh",
        };
        write!(f, "{}", s)
    }
}

impl DeviceState {
    /// Apply a state-machine event, returning the next state.
    ///
    /// Every transition not in the table is rejected with `IllegalTransition`
    /// and leaves the caller's state untouched.
    pub fn apply(self, event: StateEvent) -> Result<DeviceState> {
        use DeviceState::*;

        let next = match (self, event) {
            (Unknown, StateEvent::Discover(observed)) if observed == Shutdown || observed == Booted => {
                Some(observed)
            }
            (Shutdown, StateEvent::Boot) => Some(Booting),
            (Booting, StateEvent::BootOk) => Some(Booted),
            (Booting, StateEvent::BootFail) => Some(Errored),
            (Booted, StateEvent::Shutdown) => Some(ShuttingDown),
            (ShuttingDown, StateEvent::ShutdownOk) => Some(Shutdown),
            // Restart implies an internal shutdownOk before re-entering the boot path
            (Booted, StateEvent::Restart) => Some(Booting),
            (Errored, StateEvent::Recover) => Some(Shutdown),
            (_, StateEvent::DiscoverRefresh(observed))
                if observed == Shutdown || observed == Booted =>
            {
                Some(observed)
            }
            _ => None,
        };

        next.ok_or_else(|| Error::illegal_transition(self.to_string(), event.to_string()))
    }
}

/// Screen orientation, a quarter-turn index 0..=3.
///
/// Index mapping: 0 portrait, 1 landscape-right, 2 portrait-upside-down,
/// 3 landscape-left. Rotation wraps at both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Orientation(u8);

impl Orientation {
    pub const PORTRAIT: Orientation = Orientation(0);
    pub const LANDSCAPE_RIGHT: Orientation = Orientation(1);
    pub const PORTRAIT_UPSIDE_DOWN: Orientation = Orientation(2);
    pub const LANDSCAPE_LEFT: Orientation = Orientation(3);

    /// Build from a raw index; values outside 0..=3 are wrapped mod 4
    pub fn from_index(index: u8) -> Self {
        Orientation(index % 4)
    }

    pub fn index(self) -> u8 {
        self.0
    }

    /// One quarter-turn counter-clockwise (0 wraps to 3)
    pub fn rotated_left(self) -> Self {
        Orientation((self.0 + 3) % 4)
    }

    /// One quarter-turn clockwise (3 wraps to 0)
    pub fn rotated_right(self) -> Self {
        Orientation((self.0 + 1) % 4)
    }

    pub fn label(self) -> &'static str {
        match self.0 {
            0 => "portrait",
            1 => "landscape-right",
            2 => "portrait-upside-down",
            _ => "landscape-left",
        }
    }
}

impl Default for Orientation {
    fn default() -> Self {
        Orientation::PORTRAIT
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Screen metrics read from a booted device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceMetrics {
    pub width: u32,
    pub height: u32,
    /// Pixel density (dpi on Android, point scale ×100 on iOS)
    pub density: u32,
}

/// Canonical per-device record
///
/// Mutated only by the discovery merge and by lifecycle operations after a
/// guarded success; readers never observe a torn record.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    /// Stable opaque identifier (UDID on iOS, AVD name or serial on Android)
    pub id: String,
    pub platform: Platform,
    pub kind: DeviceKind,

    pub name: String,
    /// OS/SDK version string (e.g. "iOS 17.2", "android-34")
    pub sdk: String,
    pub model: Option<String>,
    pub width: u32,
    pub height: u32,
    pub density: u32,

    pub orientation: Orientation,
    pub state: DeviceState,

    pub local_storage_path: PathBuf,
    pub temp_storage_path: PathBuf,

    /// Token of the single live session, if any. Lookups go through the
    /// session registry; this is a value, not a handle.
    pub current_session: Option<String>,
}

impl DeviceRecord {
    /// Construct a record from discovery data, creating its storage layout
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        platform: Platform,
        kind: DeviceKind,
        storage: &DeviceStorage,
    ) -> Self {
        DeviceRecord {
            id: id.into(),
            platform,
            kind,
            name: name.into(),
            sdk: String::new(),
            model: None,
            width: 0,
            height: 0,
            density: 0,
            orientation: Orientation::default(),
            state: DeviceState::Unknown,
            local_storage_path: storage.local_path().to_path_buf(),
            temp_storage_path: storage.temp_path().to_path_buf(),
            current_session: None,
        }
    }

    /// Apply a state-machine event and commit the result
    pub fn transition(&mut self, event: StateEvent) -> Result<()> {
        self.state = self.state.apply(event)?;
        Ok(())
    }

    /// Update screen metrics after a successful boot
    pub fn apply_metrics(&mut self, metrics: DeviceMetrics) {
        self.width = metrics.width;
        self.height = metrics.height;
        self.density = metrics.density;
    }
}
