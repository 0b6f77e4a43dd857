//! Observable device events

use chrono::{DateTime, Utc};

/// Wire name of the event emitted when an instrumentation subprocess exits
/// without having been stopped by the caller
pub const TESTING_SANDBOX_TERMINATED: &str = "testing-sandbox-terminated";

/// Events surfaced to embedders of the control plane
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// An instrument attached to a device exited unexpectedly
    InstrumentTerminated {
        device_id: String,
        instrument_id: String,
        exit_code: Option<i32>,
        at: DateTime<Utc>,
    },
}

impl DeviceEvent {
    pub fn instrument_terminated(
        device_id: impl Into<String>,
        instrument_id: impl Into<String>,
        exit_code: Option<i32>,
    ) -> Self {
        DeviceEvent::InstrumentTerminated {
            device_id: device_id.into(),
            instrument_id: instrument_id.into(),
            exit_code,
            at: Utc::now(),
        }
    }

    /// Stable event name for subscribers keying on strings
    pub fn name(&self) -> &'static str {
        match self {
            DeviceEvent::InstrumentTerminated { .. } => TESTING_SANDBOX_TERMINATED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instrument_terminated_event() {
        let event = DeviceEvent::instrument_terminated("UDID-A", "cpu-profiler", Some(130));
        assert_eq!(event.name(), "testing-sandbox-terminated");

        match event {
            DeviceEvent::InstrumentTerminated {
                device_id,
                instrument_id,
                exit_code,
                ..
            } => {
                assert_eq!(device_id, "UDID-A");
                assert_eq!(instrument_id, "cpu-profiler");
                assert_eq!(exit_code, Some(130));
            }
        }
    }
}
