//! # devicelab-drivers - Per-OS Device Backends
//!
//! Concrete [`DeviceDriver`](devicelab_core::driver::DeviceDriver)
//! implementations and the subprocess layer they share.
//!
//! Depends on [`devicelab_core`] for the driver contract and error handling.
//!
//! ## Public API
//!
//! ### Subprocess Execution (`runner`)
//! - [`ProcessRunner`] - Injected command execution; every external call
//!   the drivers make goes through it
//! - [`TokioRunner`] - Production implementation with deadlines and tracked
//!   children
//! - [`CommandOutput`] - stdout/stderr/exit code of a finished command
//!
//! ### Backends
//! - [`IosSimulatorDriver`] - `xcrun simctl` (list/boot/shutdown/app ops)
//! - [`IosPhysicalDriver`] - `instruments -s devices` + libimobiledevice
//! - [`AndroidEmulatorDriver`] - AVD home scan + `emulator` + adb
//! - [`AndroidPhysicalDriver`] - adb-attached handsets
//!
//! ### Tooling (`tools`)
//! - [`ToolAvailability`] - Startup probe for simctl/instruments/adb/emulator
//!
//! ### Test Helpers (`test_utils`, feature `test-helpers`)
//! - `ScriptedRunner`, `FakeProcess`, `MockDriver`

pub mod android;
pub mod ios;
pub mod runner;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;
pub mod tools;

pub use android::{AndroidEmulatorDriver, AndroidPhysicalDriver};
pub use ios::{IosPhysicalDriver, IosSimulatorDriver};
pub use runner::{CommandOutput, ProcessRunner, TokioRunner, DEFAULT_COMMAND_TIMEOUT};
pub use tools::ToolAvailability;
