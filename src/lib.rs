//! # devicelab - Mobile-Device Control Plane
//!
//! Discovers iOS simulators, iOS physical devices, Android emulators, and
//! Android physical devices; boots and shuts them down; installs, launches,
//! and uninstalls applications; rotates screens and sends hardware keys; and
//! attaches instrumentation subprocesses -- all behind one device
//! abstraction.
//!
//! The coordinator in this crate ties together the building blocks from
//! [`devicelab_core`] (records, state machine, sessions, locks, the driver
//! contract) and the backends from [`devicelab_drivers`]:
//!
//! - [`Runtime`] - all process-wide state, built once at startup
//! - [`DeviceRegistry`] - driver loading, id-keyed merge, name/id queries
//! - [`DiscoveryCoordinator`] - single-flight walks with per-kind TTL caches
//! - [`Device`] - session-guarded lifecycle operations on one device
//!
//! ## Example
//!
//! ```no_run
//! use devicelab::{BootOptions, Config, Runtime};
//!
//! # async fn run() -> devicelab::Result<()> {
//! let runtime = Runtime::new(Config::default()).await?;
//!
//! let devices = runtime.discover(true, false).await?;
//! let device = devices.first().expect("a device is connected");
//!
//! let token = device.start_session().await?;
//! device
//!     .boot(Some(token.as_str()), BootOptions::for_platform(device.platform()))
//!     .await?;
//! device.install(&token, "/tmp/app.ipa").await?;
//! device.launch(&token, "com.example.app").await?;
//! device.shutdown(&token).await?;
//! device.end_session(&token).await?;
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod discovery;
pub mod registry;
pub mod runtime;

pub use device::{BootOptions, Device};
pub use discovery::{DiscoveryCoordinator, AVD_WALK_TTL, LIST_WALK_TTL};
pub use registry::DeviceRegistry;
pub use runtime::{Runtime, RuntimeBuilder};

// Re-exported from devicelab-core for convenience
pub use devicelab_core::{
    Config, DeviceEvent, DeviceKind, DeviceMetrics, DeviceRecord, DeviceState, Error, Orientation,
    Platform, Result, SessionRegistry,
};
