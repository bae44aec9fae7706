//! Frame types for the foundry protocol.
//!
//! Frames are the messages exchanged over a persistent connection between
//! the server, control sources and observers. Every frame carries an event
//! name and, for most events, a data payload:
//!
//! ```text
//! {"event": "machine:update", "data": { ...machine record... }}
//! ```

use crate::machine::{Machine, MachinePatch};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event identifiers, one per frame variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    RequestMachines,
    MachinesList,
    SimulatorUpdate,
    MachineUpdate,
    Error,
}

impl Event {
    /// Wire name of the event.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::RequestMachines => "request:machines",
            Event::MachinesList => "machines:list",
            Event::SimulatorUpdate => "simulator:update",
            Event::MachineUpdate => "machine:update",
            Event::Error => "error",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes carried by [`Frame::Error`].
pub mod error_codes {
    /// Inbound frame could not be decoded.
    pub const INVALID_FRAME: u16 = 1001;
    /// Inbound frame decoded but is not accepted from clients.
    pub const UNEXPECTED_FRAME: u16 = 1002;
    /// The server could not process the frame.
    pub const INTERNAL: u16 = 1500;
}

/// Payload of an error frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error code.
    pub code: u16,
    /// Human-readable error message.
    pub message: String,
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum Frame {
    /// Ask the server for the full machine list.
    #[serde(rename = "request:machines")]
    RequestMachines,

    /// Full ordered snapshot of the registry.
    #[serde(rename = "machines:list")]
    MachinesList(Vec<Machine>),

    /// Patch submitted by a control source.
    #[serde(rename = "simulator:update")]
    SimulatorUpdate(MachinePatch),

    /// Updated record fanned out to every observer.
    #[serde(rename = "machine:update")]
    MachineUpdate(Machine),

    /// Error response to an undecodable or unexpected frame.
    #[serde(rename = "error")]
    Error(ErrorBody),
}

impl Frame {
    /// Get the event of this frame.
    #[must_use]
    pub fn event(&self) -> Event {
        match self {
            Frame::RequestMachines => Event::RequestMachines,
            Frame::MachinesList(_) => Event::MachinesList,
            Frame::SimulatorUpdate(_) => Event::SimulatorUpdate,
            Frame::MachineUpdate(_) => Event::MachineUpdate,
            Frame::Error(_) => Event::Error,
        }
    }

    /// Create a bootstrap request frame.
    #[must_use]
    pub fn request_machines() -> Self {
        Frame::RequestMachines
    }

    /// Create a snapshot frame.
    #[must_use]
    pub fn machines_list(machines: impl Into<Vec<Machine>>) -> Self {
        Frame::MachinesList(machines.into())
    }

    /// Create a patch submission frame.
    #[must_use]
    pub fn simulator_update(patch: MachinePatch) -> Self {
        Frame::SimulatorUpdate(patch)
    }

    /// Create a fan-out frame for an updated record.
    #[must_use]
    pub fn machine_update(machine: Machine) -> Self {
        Frame::MachineUpdate(machine)
    }

    /// Create an error frame.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Frame::Error(ErrorBody {
            code,
            message: message.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineStatus;

    #[test]
    fn test_frame_event() {
        assert_eq!(Frame::request_machines().event(), Event::RequestMachines);
        assert_eq!(
            Frame::simulator_update(MachinePatch::new("M1")).event(),
            Event::SimulatorUpdate
        );
        assert_eq!(Event::MachinesList.to_string(), "machines:list");
    }

    #[test]
    fn test_request_without_data() {
        let frame: Frame = serde_json::from_str(r#"{"event":"request:machines"}"#).unwrap();
        assert_eq!(frame, Frame::RequestMachines);
    }

    #[test]
    fn test_simulator_update_shape() {
        let raw = r#"{"event":"simulator:update","data":{"machineId":"machine-2","status":"online","sensors":{"pressure":41.5}}}"#;
        let frame: Frame = serde_json::from_str(raw).unwrap();
        match frame {
            Frame::SimulatorUpdate(patch) => {
                assert_eq!(patch.machine_id, "machine-2");
                assert_eq!(patch.status, Some(MachineStatus::Online));
                assert!(patch.actuators.is_none());
            }
            other => panic!("Expected SimulatorUpdate, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_rejected() {
        assert!(serde_json::from_str::<Frame>(r#"{"event":"machines:delete"}"#).is_err());
    }
}
