//! # devicelab-core - Core Domain Types
//!
//! Foundation crate for the devicelab control plane. Provides device records
//! and the runtime state machine, session tokens, the on-disk lock protocol,
//! storage layout, the driver contract, error handling, and events.
//!
//! This crate has **zero internal dependencies** -- it only depends on
//! external crates (serde, chrono, thiserror, tracing, async-trait, md5,
//! rand, libc).
//!
//! ## Public API
//!
//! ### Devices (`device`)
//! - [`DeviceRecord`] - Canonical per-device data, refreshed in place on discovery
//! - [`DeviceState`] / [`StateEvent`] - The lifecycle state machine
//! - [`Orientation`] - Quarter-turn screen orientation with wrapping rotation
//! - [`Platform`], [`DeviceKind`], [`DeviceMetrics`]
//!
//! ### Sessions (`session`)
//! - [`SessionRegistry`] - Token sessions with TTL; owns every session record
//!
//! ### Locking (`lockfile`)
//! - [`LockFile`] - `"<0|1>.<pid>"` advisory lock with stale-holder reclaim
//! - [`is_pid_alive()`] - Non-blocking holder liveness snapshot
//!
//! ### Driver Contract (`driver`)
//! - [`DeviceDriver`] - The capability surface backends implement
//! - [`DeviceSeed`] - Discovery output, validated before merging
//! - [`ManagedProcess`] - Tracked subprocess handle (instruments, emulators)
//!
//! ### Storage (`storage`)
//! - [`DeviceStorage`] - `~/.DeviceStorage/<md5(id)>` layout with `temp/`
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Typed errors with `fatal` vs `recoverable` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use devicelab_core::prelude::*;
//! ```

pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod events;
pub mod lockfile;
pub mod logging;
pub mod prelude;
pub mod session;
pub mod storage;

// Re-export commonly used types at crate root for convenience
pub use config::Config;
pub use device::{
    DeviceKind, DeviceMetrics, DeviceRecord, DeviceState, Orientation, Platform, StateEvent,
};
pub use driver::{
    DeviceDriver, DeviceSeed, KeyAction, ManagedProcess, ANDROID_EMULATOR, ANDROID_PHYSICAL,
    IOS_PHYSICAL, IOS_SIMULATOR, KNOWN_DRIVERS,
};
pub use error::{Error, Result, ResultExt};
pub use events::{DeviceEvent, TESTING_SANDBOX_TERMINATED};
pub use lockfile::{is_pid_alive, LockFile, LockStatus};
pub use session::{SessionRegistry, DEFAULT_SESSION_TTL};
pub use storage::{storage_root, DeviceStorage};
